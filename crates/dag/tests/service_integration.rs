//! Integration tests for the DAG service: event delivery, replay and the
//! query facade on top of a SQLite store.

mod common;

use async_trait::async_trait;
use common::{Issuer, TempDb, PAYLOAD_TYPE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use trustdag_core::{Config, Hash};
use trustdag_dag::{
    AddOutcome, DagService, PayloadTypeFilter, Subscriber, SubscriberError, TransactionEvent,
};

struct Collector {
    name: &'static str,
    sender: mpsc::UnboundedSender<TransactionEvent>,
}

#[async_trait]
impl Subscriber for Collector {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, event: &TransactionEvent) -> Result<(), SubscriberError> {
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

fn collector(name: &'static str) -> (Arc<Collector>, mpsc::UnboundedReceiver<TransactionEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Arc::new(Collector { name, sender }), receiver)
}

/// Never succeeds and takes its time doing so.
struct Broken {
    attempts: AtomicUsize,
}

#[async_trait]
impl Subscriber for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn handle(&self, _event: &TransactionEvent) -> Result<(), SubscriberError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(SubscriberError::Failed("downstream unavailable".to_string()))
    }
}

fn config(db: &TempDb) -> Config {
    let mut config = Config::default();
    config.node.datadir = std::env::temp_dir();
    config.storage.path = Some(db.path.clone());
    config.events.max_delivery_attempts = 2;
    config.events.retry_backoff_ms = 10;
    config
}

async fn next_event(receiver: &mut mpsc::UnboundedReceiver<TransactionEvent>) -> TransactionEvent {
    timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscriber channel closed")
}

#[tokio::test]
async fn test_events_reach_matching_subscribers_in_commit_order() {
    let db = TempDb::new();
    let issuer = Issuer::new(20);
    let service = DagService::start(&config(&db), issuer.resolver.clone())
        .await
        .unwrap();

    let (matching, mut matching_events) = collector("matching");
    let (other, mut other_events) = collector("other");
    service
        .subscribe(PayloadTypeFilter::parse(PAYLOAD_TYPE), matching)
        .unwrap();
    service
        .subscribe(PayloadTypeFilter::parse("application/did+json"), other)
        .unwrap();

    let mut issued = Vec::new();
    for i in 0..5 {
        let payload = format!("credential-{}", i).into_bytes();
        issued.push(
            service
                .issue(payload, PAYLOAD_TYPE, issuer.key.clone())
                .await
                .unwrap(),
        );
    }

    for expected in &issued {
        let event = next_event(&mut matching_events).await;
        assert_eq!(&event.transaction, expected);
        assert_eq!(Hash::sum(&event.payload), expected.payload_hash());
    }
    assert!(other_events.try_recv().is_err());

    service.shutdown().await;
}

#[tokio::test]
async fn test_failing_subscriber_is_isolated() {
    let db = TempDb::new();
    let issuer = Issuer::new(21);
    let service = DagService::start(&config(&db), issuer.resolver.clone())
        .await
        .unwrap();

    let broken = Arc::new(Broken {
        attempts: AtomicUsize::new(0),
    });
    service
        .subscribe(PayloadTypeFilter::Any, broken.clone())
        .unwrap();
    let (healthy, mut events) = collector("healthy");
    service.subscribe(PayloadTypeFilter::Any, healthy).unwrap();

    for i in 0..3 {
        service
            .issue(vec![i], PAYLOAD_TYPE, issuer.key.clone())
            .await
            .unwrap();
    }
    for _ in 0..3 {
        next_event(&mut events).await;
    }

    // Two attempts per event, then given up
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.dispatch_metrics().delivery_failures_total < 3 {
        assert!(tokio::time::Instant::now() < deadline, "deliveries never given up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broken.attempts.load(Ordering::SeqCst), 6);

    service.shutdown().await;
}

#[tokio::test]
async fn test_replay_after_restart() {
    let db = TempDb::new();
    let issuer = Issuer::new(22);

    let service = DagService::start(&config(&db), issuer.resolver.clone())
        .await
        .unwrap();
    let first = service
        .issue(b"first".to_vec(), PAYLOAD_TYPE, issuer.key.clone())
        .await
        .unwrap();
    let second = service
        .issue(b"second".to_vec(), "text/plain", issuer.key.clone())
        .await
        .unwrap();
    service.shutdown().await;

    let service = DagService::start(&config(&db), issuer.resolver.clone())
        .await
        .unwrap();
    let (subscriber, mut events) = collector("late");
    let id = service
        .subscribe(PayloadTypeFilter::Any, subscriber)
        .unwrap();

    let queued = service.replay(id, PayloadTypeFilter::Any).await.unwrap();
    assert_eq!(queued, 2);
    assert_eq!(next_event(&mut events).await.transaction, first);
    assert_eq!(next_event(&mut events).await.transaction, second);

    let queued = service
        .replay(id, PayloadTypeFilter::parse("text/plain"))
        .await
        .unwrap();
    assert_eq!(queued, 1);
    assert_eq!(next_event(&mut events).await.transaction, second);

    service.shutdown().await;
}

#[tokio::test]
async fn test_query_status_codes() {
    let db = TempDb::new();
    let issuer = Issuer::new(23);
    let service = DagService::start(&config(&db), issuer.resolver.clone())
        .await
        .unwrap();

    let issued = service
        .issue(b"{\"id\":1}".to_vec(), PAYLOAD_TYPE, issuer.key.clone())
        .await
        .unwrap();
    let pending = issuer.sign(&[&issued], 1, b"later");
    let (_, outcome) = service.add(pending.data().to_vec(), None).await.unwrap();
    assert_eq!(outcome, AddOutcome::Added);

    let query = service.query();

    let list = query.list_transactions();
    assert_eq!(list.status, 200);
    assert_eq!(list.content_type, "application/json");
    let documents: Vec<String> = serde_json::from_slice(&list.body).unwrap();
    assert_eq!(documents.len(), 2);

    let found = query.get_transaction(&issued.reference().to_hex());
    assert_eq!(found.status, 200);
    assert_eq!(found.content_type, "application/jose");
    assert_eq!(found.body, issued.data());

    assert_eq!(query.get_transaction("xyz").status, 400);
    let missing = query.get_transaction(&Hash::sum(b"nope").to_hex());
    assert_eq!((missing.status, missing.body.as_slice()), (404, &b"transaction not found"[..]));

    let payload = query.get_transaction_payload(&issued.reference().to_hex());
    assert_eq!(payload.status, 200);
    assert_eq!(payload.content_type, PAYLOAD_TYPE);
    assert_eq!(payload.body, b"{\"id\":1}");

    let not_yet = query.get_transaction_payload(&pending.reference().to_hex());
    assert_eq!(not_yet.status, 404);
    assert_eq!(not_yet.body, b"transaction payload not yet received");

    let diagnostics: serde_json::Value =
        serde_json::from_slice(&query.diagnostics().body).unwrap();
    assert_eq!(diagnostics["transaction_count"], 2);
    assert_eq!(diagnostics["engine"], "sqlite");

    service.shutdown().await;
}
