//! Node-level wiring of the DAG store.
//!
//! [`DagService`] opens the configured engine, builds the verifier pipeline
//! and event dispatcher, and runs blocking store work on Tokio's blocking
//! pool so async callers never stall the runtime.

use crate::api::QueryService;
use crate::dispatcher::{
    DispatchMetrics, DispatchSettings, EventDispatcher, PayloadTypeFilter, Subscriber,
    SubscriptionId,
};
use crate::error::{DagError, Result, StorageError};
use crate::kv::{ConfiguredEngine, KvEngine};
use crate::signer::TransactionSigner;
use crate::store::{AddOutcome, DagStore, StoreHealth};
use crate::transaction::{Transaction, UnsignedTransaction};
use crate::verifier::{Verifier, VerifierPipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trustdag_core::{time, Config, Hash, StorageEngineKind};
use trustdag_crypto::{KeyResolver, KeySigner, TimeoutKeyResolver};

/// A running DAG store with its dispatcher.
pub struct DagService {
    store: Arc<DagStore<ConfiguredEngine>>,
    dispatcher: EventDispatcher,
    signer: TransactionSigner,
    shutdown: CancellationToken,
}

impl DagService {
    /// Starts the service with the default verifier pipeline.
    pub async fn start(config: &Config, resolver: Arc<dyn KeyResolver>) -> Result<Self> {
        Self::start_with_verifiers(config, resolver, Vec::new()).await
    }

    /// Starts the service, appending `verifiers` to the default pipeline.
    pub async fn start_with_verifiers(
        config: &Config,
        resolver: Arc<dyn KeyResolver>,
        verifiers: Vec<Arc<dyn Verifier>>,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            node_id = %config.node.node_id,
            engine = ?config.storage.engine,
            "Starting DAG service"
        );

        let timeout = Duration::from_millis(config.signing.key_resolution_timeout_ms);
        let resolver: Arc<dyn KeyResolver> = Arc::new(TimeoutKeyResolver::with_workers(
            resolver,
            timeout,
            config.signing.key_resolution_workers,
        ));
        let pipeline = verifiers
            .into_iter()
            .fold(VerifierPipeline::new(resolver), VerifierPipeline::with_verifier);

        let (sender, receiver) = mpsc::unbounded_channel();
        let store_config = config.clone();
        let store = tokio::task::spawn_blocking(move || -> Result<DagStore<ConfiguredEngine>> {
            if store_config.storage.engine == StorageEngineKind::Sqlite {
                store_config.ensure_datadir()?;
            }
            let engine = ConfiguredEngine::open(&store_config)?;
            let store = DagStore::new(engine, pipeline)
                .with_walk_page_size(store_config.storage.walk_page_size)
                .with_event_sink(sender);

            if store_config.storage.verify_on_open {
                if let StoreHealth::Corrupted { reason } = store.integrity_check()? {
                    return Err(StorageError::Corruption(reason).into());
                }
            }
            Ok(store)
        })
        .await
        .map_err(|e| DagError::Task(e.to_string()))??;
        let store = Arc::new(store);

        let dispatcher = EventDispatcher::new(DispatchSettings::from(&config.events));
        dispatcher.start(receiver)?;

        info!(
            engine = store.engine().name(),
            verifiers = ?store.pipeline().names(),
            "DAG service started"
        );

        Ok(Self {
            store,
            dispatcher,
            signer: TransactionSigner::new(config.signing.embed_public_key),
            shutdown: CancellationToken::new(),
        })
    }

    /// Parses, verifies and commits a serialized transaction.
    pub async fn add(
        &self,
        data: Vec<u8>,
        payload: Option<Vec<u8>>,
    ) -> Result<(Transaction, AddOutcome)> {
        let store = Arc::clone(&self.store);
        let cancel = self.shutdown.child_token();
        run_blocking(move || store.add_serialized(&cancel, &data, payload.as_deref())).await
    }

    /// Stores a payload for transactions that arrived without it.
    pub async fn write_payload(&self, payload: Vec<u8>) -> Result<AddOutcome> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.write_payload(&Hash::sum(&payload), &payload)).await
    }

    /// Signs and commits a new local transaction on top of the current heads.
    ///
    /// Concurrent issues may pick the same heads; the results are siblings.
    pub async fn issue(
        &self,
        payload: Vec<u8>,
        payload_type: &str,
        key: Arc<dyn KeySigner>,
    ) -> Result<Transaction> {
        let store = Arc::clone(&self.store);
        let signer = self.signer;
        let cancel = self.shutdown.child_token();
        let payload_type = payload_type.to_string();

        run_blocking(move || {
            let parents = store.head_parents()?;
            let unsigned =
                UnsignedTransaction::from_parents(Hash::sum(&payload), payload_type, &parents)?;
            let transaction = signer.sign(&unsigned, time::unix_millis(), key.as_ref())?;
            store.add(&cancel, &transaction, Some(&payload))?;
            info!(
                reference = %transaction.reference(),
                payload_type = %transaction.payload_type(),
                lamport_clock = transaction.lamport_clock(),
                "Issued transaction"
            );
            Ok(transaction)
        })
        .await
    }

    pub fn subscribe(
        &self,
        filter: PayloadTypeFilter,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<SubscriptionId> {
        self.dispatcher.subscribe(filter, subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.dispatcher.unsubscribe(id)
    }

    /// Queues all stored events matching `filter` for subscription `id`.
    pub async fn replay(&self, id: SubscriptionId, filter: PayloadTypeFilter) -> Result<usize> {
        self.dispatcher
            .replay(id, Arc::clone(&self.store), filter)
            .await
    }

    pub fn store(&self) -> &Arc<DagStore<ConfiguredEngine>> {
        &self.store
    }

    pub fn query(&self) -> QueryService<ConfiguredEngine> {
        QueryService::new(Arc::clone(&self.store))
    }

    pub fn dispatch_metrics(&self) -> DispatchMetrics {
        self.dispatcher.metrics()
    }

    /// Cancels in-flight adds and stops event delivery.
    pub async fn shutdown(self) {
        info!("Shutting down DAG service");
        self.shutdown.cancel();
        self.dispatcher.shutdown().await;
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!(error = %e, "Blocking store task failed");
        DagError::Task(e.to_string())
    })?
}
