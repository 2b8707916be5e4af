//! Event dispatcher.
//!
//! Hands committed transactions (together with their payload) to
//! subscribers registered per payload type.
//!
//! # Architecture
//!
//! ```text
//! DagStore ──unbounded channel──▶ fan-out task ──▶ subscription queue ──▶ worker ──▶ Subscriber
//!                                                 └─▶ subscription queue ──▶ worker ──▶ Subscriber
//! ```
//!
//! The store never waits for a subscriber. Every subscription owns a queue
//! and a worker task, so a slow or failing subscriber only delays itself.
//! Delivery is at-least-once and ordered per subscription; each attempt runs
//! in its own task so a panicking subscriber counts as a failed attempt.

use crate::error::{DagError, Result};
use crate::kv::KvEngine;
use crate::store::DagStore;
use crate::transaction::Transaction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trustdag_core::EventsConfig;

/// A committed transaction whose payload is available.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub transaction: Transaction,
    pub payload: Arc<[u8]>,
}

/// Which payload types a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PayloadTypeFilter {
    Any,
    Exact(String),
}

impl PayloadTypeFilter {
    pub const WILDCARD: &'static str = "*";

    pub fn parse(value: &str) -> Self {
        if value == Self::WILDCARD {
            PayloadTypeFilter::Any
        } else {
            PayloadTypeFilter::Exact(value.to_string())
        }
    }

    pub fn matches(&self, payload_type: &str) -> bool {
        match self {
            PayloadTypeFilter::Any => true,
            PayloadTypeFilter::Exact(expected) => expected == payload_type,
        }
    }
}

impl From<&str> for PayloadTypeFilter {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl fmt::Display for PayloadTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadTypeFilter::Any => f.write_str(Self::WILDCARD),
            PayloadTypeFilter::Exact(payload_type) => f.write_str(payload_type),
        }
    }
}

/// Errors a subscriber reports for a single delivery.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// Worth another attempt
    #[error("delivery failed: {0}")]
    Failed(String),

    /// Retrying will not help
    #[error("delivery rejected: {0}")]
    Permanent(String),
}

/// Consumer of transaction events.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn handle(&self, event: &TransactionEvent) -> std::result::Result<(), SubscriberError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Retry policy for deliveries.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_delivery_attempts: u32,
    /// Delay before retry `n` is `n * retry_backoff`
    pub retry_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&EventsConfig::default())
    }
}

impl From<&EventsConfig> for DispatchSettings {
    fn from(config: &EventsConfig) -> Self {
        Self {
            max_delivery_attempts: config.max_delivery_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Observability counters for the dispatcher
#[derive(Debug, Default)]
struct DispatchCounters {
    events_received_total: AtomicU64,
    deliveries_total: AtomicU64,
    retries_total: AtomicU64,
    delivery_failures_total: AtomicU64,
    replayed_total: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMetrics {
    pub events_received_total: u64,
    pub deliveries_total: u64,
    pub retries_total: u64,
    /// Deliveries given up after the last attempt
    pub delivery_failures_total: u64,
    pub replayed_total: u64,
    pub subscriptions: usize,
}

type EventQueue = mpsc::UnboundedSender<Arc<TransactionEvent>>;

struct Subscription {
    filter: PayloadTypeFilter,
    name: String,
    queue: EventQueue,
    worker: JoinHandle<()>,
}

struct Inner {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
    settings: DispatchSettings,
    counters: DispatchCounters,
    shutdown: CancellationToken,
    fan_out: Mutex<Option<JoinHandle<()>>>,
}

/// Routes store events to subscribers.
///
/// Cloning yields another handle to the same dispatcher. All methods that
/// start tasks must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl EventDispatcher {
    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                settings,
                counters: DispatchCounters::default(),
                shutdown: CancellationToken::new(),
                fan_out: Mutex::new(None),
            }),
        }
    }

    /// Registers `subscriber` for events matching `filter`.
    pub fn subscribe(
        &self,
        filter: PayloadTypeFilter,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let name = subscriber.name().to_string();
        let (queue, receiver) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(
            Arc::clone(&self.inner),
            id,
            subscriber,
            receiver,
        ));

        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .map_err(|_| crate::kv::poisoned("dispatcher subscriptions"))?;
        subscriptions.insert(
            id,
            Subscription {
                filter: filter.clone(),
                name: name.clone(),
                queue,
                worker,
            },
        );

        info!(subscription = %id, subscriber = %name, filter = %filter, "Subscriber registered");
        Ok(id)
    }

    /// Removes a subscription. Events already queued for it are still
    /// delivered. Returns `false` for an unknown ID.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        let removed = self
            .inner
            .subscriptions
            .write()
            .map_err(|_| crate::kv::poisoned("dispatcher subscriptions"))?
            .remove(&id);

        match removed {
            Some(subscription) => {
                info!(subscription = %id, subscriber = %subscription.name, "Subscriber removed");
                // Dropping the queue lets the worker finish its backlog and exit
                drop(subscription.queue);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Starts the fan-out task fed by the store's event channel.
    pub fn start(&self, mut receiver: mpsc::UnboundedReceiver<TransactionEvent>) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => route(&inner, event),
                        None => break,
                    },
                }
            }
            debug!("Event fan-out stopped");
        });

        let mut fan_out = self
            .inner
            .fan_out
            .lock()
            .map_err(|_| crate::kv::poisoned("dispatcher fan-out"))?;
        if let Some(previous) = fan_out.replace(handle) {
            warn!("Event dispatcher restarted; stopping previous fan-out");
            previous.abort();
        }
        Ok(())
    }

    /// Enqueues historical events from `store` for one subscription.
    ///
    /// Walks the whole DAG on the blocking pool and queues every transaction
    /// that matches `filter` and whose payload is present. Returns the number
    /// of queued events.
    pub async fn replay<E>(
        &self,
        id: SubscriptionId,
        store: Arc<DagStore<E>>,
        filter: PayloadTypeFilter,
    ) -> Result<usize>
    where
        E: KvEngine + 'static,
    {
        let queue = {
            let subscriptions = self
                .inner
                .subscriptions
                .read()
                .map_err(|_| crate::kv::poisoned("dispatcher subscriptions"))?;
            subscriptions
                .get(&id)
                .map(|s| s.queue.clone())
                .ok_or(DagError::UnknownSubscription(id))?
        };
        let cancel = self.inner.shutdown.child_token();

        let enqueued = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut enqueued = 0;
            for transaction in store.walker(0) {
                if cancel.is_cancelled() {
                    return Err(DagError::Cancelled);
                }
                let transaction = transaction?;
                if !filter.matches(transaction.payload_type()) {
                    continue;
                }
                let payload_hash = transaction.payload_hash();
                let Some(payload) = store.read(|snapshot| snapshot.payload(&payload_hash))? else {
                    continue;
                };
                let event = TransactionEvent {
                    transaction,
                    payload: Arc::from(payload),
                };
                if queue.send(Arc::new(event)).is_err() {
                    // Subscription went away mid-replay
                    break;
                }
                enqueued += 1;
            }
            Ok(enqueued)
        })
        .await
        .map_err(|e| DagError::Task(e.to_string()))??;

        self.inner
            .counters
            .replayed_total
            .fetch_add(enqueued as u64, Ordering::Relaxed);
        info!(subscription = %id, events = enqueued, "Replay queued");
        Ok(enqueued)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> DispatchMetrics {
        let counters = &self.inner.counters;
        DispatchMetrics {
            events_received_total: counters.events_received_total.load(Ordering::Relaxed),
            deliveries_total: counters.deliveries_total.load(Ordering::Relaxed),
            retries_total: counters.retries_total.load(Ordering::Relaxed),
            delivery_failures_total: counters.delivery_failures_total.load(Ordering::Relaxed),
            replayed_total: counters.replayed_total.load(Ordering::Relaxed),
            subscriptions: self.subscription_count(),
        }
    }

    /// Stops the fan-out task and every worker, then waits for them.
    ///
    /// Events still queued are not delivered; a later replay recovers them.
    pub async fn shutdown(&self) {
        info!("Shutting down event dispatcher");
        self.inner.shutdown.cancel();

        let fan_out = self.inner.fan_out.lock().ok().and_then(|mut f| f.take());
        if let Some(handle) = fan_out {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event fan-out task ended abnormally");
            }
        }

        let subscriptions: Vec<(SubscriptionId, Subscription)> =
            match self.inner.subscriptions.write() {
                Ok(mut subscriptions) => subscriptions.drain().collect(),
                Err(_) => Vec::new(),
            };
        for (id, subscription) in subscriptions {
            drop(subscription.queue);
            if let Err(e) = subscription.worker.await {
                warn!(subscription = %id, error = %e, "Subscriber worker ended abnormally");
            }
        }
    }
}

fn route(inner: &Inner, event: TransactionEvent) {
    inner
        .counters
        .events_received_total
        .fetch_add(1, Ordering::Relaxed);

    let Ok(subscriptions) = inner.subscriptions.read() else {
        error!("Subscription table poisoned; dropping event");
        return;
    };

    let payload_type = event.transaction.payload_type().to_string();
    let event = Arc::new(event);
    for (id, subscription) in subscriptions.iter() {
        if !subscription.filter.matches(&payload_type) {
            continue;
        }
        if subscription.queue.send(Arc::clone(&event)).is_err() {
            debug!(subscription = %id, "Subscriber worker gone; event not queued");
        }
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    id: SubscriptionId,
    subscriber: Arc<dyn Subscriber>,
    mut receiver: mpsc::UnboundedReceiver<Arc<TransactionEvent>>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        deliver(&inner, id, &subscriber, event).await;
    }
    debug!(subscription = %id, "Subscriber worker stopped");
}

async fn deliver(
    inner: &Inner,
    id: SubscriptionId,
    subscriber: &Arc<dyn Subscriber>,
    event: Arc<TransactionEvent>,
) {
    let reference = event.transaction.reference();
    if let Err(attempts) = attempt_delivery(inner, id, subscriber, event).await {
        inner
            .counters
            .delivery_failures_total
            .fetch_add(1, Ordering::Relaxed);
        error!(
            subscription = %id,
            subscriber = subscriber.name(),
            reference = %reference,
            attempts,
            "Giving up event delivery"
        );
    }
}

/// Runs delivery attempts for one event.
///
/// Returns the number of attempts made: `Ok` once delivered, `Err` when the
/// subscriber rejected the event or every attempt failed. Shutdown during a
/// backoff ends delivery quietly with `Ok`.
async fn attempt_delivery(
    inner: &Inner,
    id: SubscriptionId,
    subscriber: &Arc<dyn Subscriber>,
    event: Arc<TransactionEvent>,
) -> std::result::Result<u32, u32> {
    let reference = event.transaction.reference();
    let max_attempts = inner.settings.max_delivery_attempts;

    for attempt in 1..=max_attempts {
        let attempt_subscriber = Arc::clone(subscriber);
        let attempt_event = Arc::clone(&event);
        let outcome = tokio::spawn(async move { attempt_subscriber.handle(&attempt_event).await })
            .await
            .unwrap_or_else(|e| {
                Err(SubscriberError::Failed(format!("subscriber task failed: {}", e)))
            });

        match outcome {
            Ok(()) => {
                inner.counters.deliveries_total.fetch_add(1, Ordering::Relaxed);
                return Ok(attempt);
            }
            Err(SubscriberError::Permanent(reason)) => {
                warn!(
                    subscription = %id,
                    subscriber = subscriber.name(),
                    reference = %reference,
                    reason = %reason,
                    "Subscriber rejected event"
                );
                return Err(attempt);
            }
            Err(e) if attempt < max_attempts => {
                inner.counters.retries_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription = %id,
                    subscriber = subscriber.name(),
                    reference = %reference,
                    attempt,
                    error = %e,
                    "Delivery failed, retrying"
                );
                let backoff = inner.settings.retry_backoff * attempt;
                tokio::select! {
                    _ = inner.shutdown.cancelled() => return Ok(attempt),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => {
                warn!(
                    subscription = %id,
                    subscriber = subscriber.name(),
                    reference = %reference,
                    error = %e,
                    "Delivery failed"
                );
            }
        }
    }

    Err(max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryEngine;
    use crate::signer::TransactionSigner;
    use crate::transaction::UnsignedTransaction;
    use crate::verifier::VerifierPipeline;
    use std::sync::atomic::AtomicU32;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;
    use trustdag_core::Hash;
    use trustdag_crypto::{Ed25519KeyPair, KeySigner, StaticKeyResolver};

    /// Forwards every event into a channel.
    struct Collector {
        sender: mpsc::UnboundedSender<TransactionEvent>,
    }

    #[async_trait]
    impl Subscriber for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        async fn handle(
            &self,
            event: &TransactionEvent,
        ) -> std::result::Result<(), SubscriberError> {
            let _ = self.sender.send(event.clone());
            Ok(())
        }
    }

    fn collector() -> (Arc<Collector>, mpsc::UnboundedReceiver<TransactionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Collector { sender }), receiver)
    }

    /// Fails a number of times before succeeding.
    struct Flaky {
        failures_left: AtomicU32,
        delivered: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl Subscriber for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(
            &self,
            _event: &TransactionEvent,
        ) -> std::result::Result<(), SubscriberError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SubscriberError::Failed("not yet".to_string()));
            }
            let _ = self.delivered.send(());
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Subscriber for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn handle(
            &self,
            _event: &TransactionEvent,
        ) -> std::result::Result<(), SubscriberError> {
            panic!("subscriber bug");
        }
    }

    /// Rejects every event outright.
    #[derive(Default)]
    struct Rejecting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Subscriber for Rejecting {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn handle(
            &self,
            _event: &TransactionEvent,
        ) -> std::result::Result<(), SubscriberError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SubscriberError::Permanent("malformed credential".to_string()))
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            max_delivery_attempts: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn event(payload_type: &str, payload: &[u8]) -> TransactionEvent {
        let key = Ed25519KeyPair::from_key(&[41u8; 32]).unwrap();
        let unsigned =
            UnsignedTransaction::new(Hash::sum(payload), payload_type, &[], &[], 0).unwrap();
        let transaction = TransactionSigner::new(false).sign(&unsigned, 0, &key).unwrap();
        TransactionEvent {
            transaction,
            payload: Arc::from(payload),
        }
    }

    async fn recv(receiver: &mut mpsc::UnboundedReceiver<TransactionEvent>) -> TransactionEvent {
        timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[test]
    fn test_filter_parsing() {
        assert_eq!(PayloadTypeFilter::parse("*"), PayloadTypeFilter::Any);
        assert_eq!(
            PayloadTypeFilter::from("application/vc+jwt"),
            PayloadTypeFilter::Exact("application/vc+jwt".to_string())
        );
        assert!(PayloadTypeFilter::Any.matches("anything"));
        assert!(!PayloadTypeFilter::parse("a").matches("b"));
        assert_eq!(PayloadTypeFilter::Any.to_string(), "*");
    }

    #[tokio::test]
    async fn test_routes_by_payload_type() {
        let dispatcher = EventDispatcher::new(settings());
        let (credentials, mut credential_events) = collector();
        let (everything, mut all_events) = collector();
        dispatcher
            .subscribe(PayloadTypeFilter::parse("application/vc+jwt"), credentials)
            .unwrap();
        dispatcher.subscribe(PayloadTypeFilter::Any, everything).unwrap();

        let (sender, receiver) = mpsc::unbounded_channel();
        dispatcher.start(receiver).unwrap();

        sender.send(event("application/did+json", b"did")).unwrap();
        sender.send(event("application/vc+jwt", b"vc")).unwrap();

        assert_eq!(&*recv(&mut credential_events).await.payload, b"vc");
        assert_eq!(&*recv(&mut all_events).await.payload, b"did");
        assert_eq!(&*recv(&mut all_events).await.payload, b"vc");

        dispatcher.shutdown().await;
        assert_eq!(dispatcher.metrics().events_received_total, 2);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let dispatcher = EventDispatcher::new(settings());
        let (delivered, mut delivered_rx) = mpsc::unbounded_channel();
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            delivered,
        });
        dispatcher.subscribe(PayloadTypeFilter::Any, flaky).unwrap();

        let (sender, receiver) = mpsc::unbounded_channel();
        dispatcher.start(receiver).unwrap();
        sender.send(event("t", b"x")).unwrap();

        timeout(Duration::from_secs(5), delivered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let metrics = dispatcher.metrics();
        assert_eq!(metrics.retries_total, 2);
        assert_eq!(metrics.deliveries_total, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let dispatcher = EventDispatcher::new(settings());
        dispatcher
            .subscribe(PayloadTypeFilter::Any, Arc::new(Panicking))
            .unwrap();
        let (healthy, mut events) = collector();
        dispatcher.subscribe(PayloadTypeFilter::Any, healthy).unwrap();

        let (sender, receiver) = mpsc::unbounded_channel();
        dispatcher.start(receiver).unwrap();
        sender.send(event("t", b"1")).unwrap();
        sender.send(event("t", b"2")).unwrap();

        assert_eq!(&*recv(&mut events).await.payload, b"1");
        assert_eq!(&*recv(&mut events).await.payload, b"2");

        // Both events exhaust their attempts on the panicking subscriber
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while dispatcher.metrics().delivery_failures_total < 2 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_rejection_stops_after_one_attempt() {
        let dispatcher = EventDispatcher::new(settings());
        let rejecting = Arc::new(Rejecting::default());
        let subscriber: Arc<dyn Subscriber> = rejecting.clone();

        let attempts = attempt_delivery(
            &dispatcher.inner,
            SubscriptionId(7),
            &subscriber,
            Arc::new(event("t", b"x")),
        )
        .await;
        assert_eq!(attempts, Err(1));
        assert_eq!(rejecting.calls.load(Ordering::SeqCst), 1);

        let (flaky_tx, _flaky_rx) = mpsc::unbounded_channel();
        let always_failing: Arc<dyn Subscriber> = Arc::new(Flaky {
            failures_left: AtomicU32::new(u32::MAX),
            delivered: flaky_tx,
        });
        let attempts = attempt_delivery(
            &dispatcher.inner,
            SubscriptionId(8),
            &always_failing,
            Arc::new(event("t", b"y")),
        )
        .await;
        assert_eq!(attempts, Err(3));

        let metrics = dispatcher.metrics();
        assert_eq!(metrics.retries_total, 2);
        assert_eq!(metrics.deliveries_total, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let dispatcher = EventDispatcher::new(settings());
        let (subscriber, _events) = collector();
        let id = dispatcher.subscribe(PayloadTypeFilter::Any, subscriber).unwrap();

        assert_eq!(dispatcher.subscription_count(), 1);
        assert!(dispatcher.unsubscribe(id).unwrap());
        assert!(!dispatcher.unsubscribe(id).unwrap());
        assert_eq!(dispatcher.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_replay_delivers_history_with_payloads() {
        let key = Ed25519KeyPair::from_key(&[42u8; 32]).unwrap();
        let resolver = StaticKeyResolver::new().with_key(key.key_id(), key.public_key());
        let store = Arc::new(DagStore::new(
            MemoryEngine::new(),
            VerifierPipeline::new(Arc::new(resolver)),
        ));
        let cancel = CancellationToken::new();
        let signer = TransactionSigner::new(false);

        let root = signer
            .sign(
                &UnsignedTransaction::new(Hash::sum(b"root"), "a", &[], &[], 0).unwrap(),
                0,
                &key,
            )
            .unwrap();
        store.add(&cancel, &root, Some(b"root")).unwrap();
        let other_type = signer
            .sign(
                &UnsignedTransaction::new(Hash::sum(b"b"), "b", &[root.reference()], &[], 1)
                    .unwrap(),
                0,
                &key,
            )
            .unwrap();
        store.add(&cancel, &other_type, Some(b"b")).unwrap();
        let no_payload = signer
            .sign(
                &UnsignedTransaction::new(Hash::sum(b"c"), "a", &[other_type.reference()], &[], 2)
                    .unwrap(),
                0,
                &key,
            )
            .unwrap();
        store.add(&cancel, &no_payload, None).unwrap();

        let dispatcher = EventDispatcher::new(settings());
        let (subscriber, mut events) = collector();
        let id = dispatcher.subscribe(PayloadTypeFilter::Any, subscriber).unwrap();

        let queued = dispatcher
            .replay(id, Arc::clone(&store), PayloadTypeFilter::parse("a"))
            .await
            .unwrap();
        assert_eq!(queued, 1);
        assert_eq!(recv(&mut events).await.transaction, root);
        assert_eq!(dispatcher.metrics().replayed_total, 1);

        let unknown = dispatcher
            .replay(SubscriptionId(999), store, PayloadTypeFilter::Any)
            .await;
        assert!(matches!(unknown, Err(DagError::UnknownSubscription(_))));
        dispatcher.shutdown().await;
    }
}
