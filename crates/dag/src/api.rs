//! Query facade for the HTTP collaborator.
//!
//! Answers are transport-agnostic: a status code, a content type and a body.
//! The caller maps them onto whatever server it runs.

use crate::error::DagError;
use crate::kv::KvEngine;
use crate::store::DagStore;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};
use trustdag_core::Hash;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_JOSE: &str = "application/jose";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl QueryResponse {
    pub fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_string(),
            body: body.into(),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::ok(CONTENT_TYPE_JSON, body),
            Err(e) => {
                error!(error = %e, "Failed to serialize query response");
                Self::text(500, &e.to_string())
            }
        }
    }

    pub fn text(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_TEXT.to_string(),
            body: message.as_bytes().to_vec(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Read-only queries over a shared store.
pub struct QueryService<E: KvEngine> {
    store: Arc<DagStore<E>>,
}

impl<E: KvEngine> Clone for QueryService<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<E: KvEngine> QueryService<E> {
    pub fn new(store: Arc<DagStore<E>>) -> Self {
        Self { store }
    }

    /// All documents in clock order.
    pub fn list_transactions(&self) -> QueryResponse {
        let documents: Result<Vec<String>, DagError> = self
            .store
            .walker(0)
            .map(|t| t.map(|t| t.as_str().to_string()))
            .collect();
        match documents {
            Ok(documents) => QueryResponse::json(&documents),
            Err(e) => internal_error("list transactions", &e),
        }
    }

    pub fn get_transaction(&self, reference: &str) -> QueryResponse {
        let reference = match parse_reference(reference) {
            Ok(reference) => reference,
            Err(response) => return response,
        };
        match self.store.get_transaction(&reference) {
            Ok(transaction) => QueryResponse::ok(CONTENT_TYPE_JOSE, transaction.data()),
            Err(e) => error_response("get transaction", &e),
        }
    }

    /// Payload bytes, served with the transaction's payload type.
    pub fn get_transaction_payload(&self, reference: &str) -> QueryResponse {
        let reference = match parse_reference(reference) {
            Ok(reference) => reference,
            Err(response) => return response,
        };
        let result = self.store.read(|snapshot| {
            let transaction =
                snapshot
                    .transaction(&reference)?
                    .ok_or(DagError::TransactionNotFound { reference })?;
            let payload_hash = transaction.payload_hash();
            let payload = snapshot
                .payload(&payload_hash)?
                .ok_or(DagError::PayloadNotReceived {
                    reference,
                    payload_hash,
                })?;
            Ok((transaction.payload_type().to_string(), payload))
        });
        match result {
            Ok((payload_type, payload)) => QueryResponse::ok(&payload_type, payload),
            Err(e) => error_response("get transaction payload", &e),
        }
    }

    pub fn diagnostics(&self) -> QueryResponse {
        let statistics = match self.store.statistics() {
            Ok(statistics) => statistics,
            Err(e) => return internal_error("diagnostics", &e),
        };
        QueryResponse::json(&json!({
            "engine": self.store.engine().name(),
            "transaction_count": statistics.transaction_count,
            "payload_count": statistics.payload_count,
            "heads": statistics.heads,
            "max_lamport_clock": statistics.max_lamport_clock,
            "health": self.store.health(),
            "metrics": self.store.metrics(),
        }))
    }
}

fn parse_reference(reference: &str) -> Result<Hash, QueryResponse> {
    Hash::parse_hex(reference).map_err(|e| {
        debug!(reference = %reference, error = %e, "Bad transaction reference");
        QueryResponse::text(400, &format!("invalid transaction reference: {}", e))
    })
}

fn error_response(operation: &str, err: &DagError) -> QueryResponse {
    match err {
        DagError::TransactionNotFound { .. } => QueryResponse::text(404, "transaction not found"),
        DagError::PayloadNotReceived { .. } => {
            QueryResponse::text(404, "transaction payload not yet received")
        }
        _ => internal_error(operation, err),
    }
}

fn internal_error(operation: &str, err: &DagError) -> QueryResponse {
    error!(operation, error = %err, "Query failed");
    QueryResponse::text(500, &err.to_string())
}
