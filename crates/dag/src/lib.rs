//! TrustDAG transaction store.
//!
//! A content-addressed DAG of signed transactions. Each transaction is a JWS
//! compact document that names its parents, carries a Lamport clock and
//! commits to a payload by hash. The crate provides:
//!
//! - [`transaction`]: the document model, parsing and building
//! - [`signer`]: turning unsigned transactions into signed documents
//! - [`verifier`]: the ordered pipeline every transaction passes before commit
//! - [`store`]: the DAG store on top of a pluggable [`kv::KvEngine`]
//! - [`dispatcher`]: per-subscriber delivery of committed transactions
//! - [`api`]: transport-agnostic query responses
//! - [`service`]: node-level wiring of all of the above

pub mod api;
pub mod dispatcher;
pub mod error;
pub mod kv;
pub mod service;
pub mod signer;
pub mod store;
pub mod transaction;
pub mod verifier;
pub mod walk;

pub use api::{QueryResponse, QueryService};
pub use dispatcher::{
    DispatchMetrics, DispatchSettings, EventDispatcher, PayloadTypeFilter, Subscriber,
    SubscriberError, SubscriptionId, TransactionEvent,
};
pub use error::{DagError, Result, StorageError, VerificationError};
pub use kv::{ConfiguredEngine, KvEngine, MemoryEngine, SqliteEngine};
pub use service::DagService;
pub use signer::TransactionSigner;
pub use store::{AddOutcome, DagStore, Snapshot, StoreHealth, StoreMetricsSnapshot, StoreStatistics};
pub use transaction::{
    MalformedDocument, ParentRef, SigningKeyRef, Transaction, TransactionError,
    UnsignedTransaction,
};
pub use verifier::{
    AncestryVerifier, LamportClockVerifier, SignatureVerifier, TransactionReader, Verifier,
    VerifierPipeline,
};
pub use walk::Walker;
