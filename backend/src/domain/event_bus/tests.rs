//! Unit tests for event bus publishing, consumption, and connection recovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rstest::{fixture, rstest};
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;

use super::*;
use crate::domain::events::{BOOK_DELETED, BOOKWORM_EXCHANGE, EventEnvelope};
use crate::domain::ports::{BrokerError, HandlerError, MockMessageBroker};
use crate::test_support::in_memory_broker::{InMemoryBroker, NackRecord};
use crate::test_support::runtime::{ImmediateSleeper, RecordingSleeper};
use crate::test_support::state_log::{StateLog, StateLoggingBroker, StateLoggingSleeper};

/// Sleeper that never wakes, freezing the reconnect loop before its first
/// attempt.
struct StalledSleeper;

#[async_trait]
impl ReconnectSleeper for StalledSleeper {
    async fn sleep(&self, _duration: Duration) {
        std::future::pending::<()>().await;
    }
}

#[fixture]
fn broker() -> InMemoryBroker {
    InMemoryBroker::new()
}

fn bus_with(broker: &InMemoryBroker, sleeper: Arc<dyn ReconnectSleeper>) -> EventBus {
    EventBus::with_runtime(
        Arc::new(broker.clone()),
        EventBusConfig::default(),
        EventBusRuntime { sleeper },
    )
}

fn bus_over(broker: &InMemoryBroker) -> EventBus {
    bus_with(broker, Arc::new(ImmediateSleeper))
}

fn key(raw: &str) -> RoutingKey {
    RoutingKey::new(raw).expect("valid routing key")
}

fn pattern(raw: &str) -> RoutingPattern {
    RoutingPattern::new(raw).expect("valid routing pattern")
}

fn forwarding_handler() -> (
    impl EventHandler + 'static,
    mpsc::UnboundedReceiver<EventEnvelope>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |event: EventEnvelope| {
        let tx = tx.clone();
        async move {
            tx.send(event)
                .map_err(|error| HandlerError::failed(error.to_string()))
        }
    };
    (handler, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<EventEnvelope>) -> EventEnvelope {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event delivered in time")
        .expect("handler channel open")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[rstest]
#[tokio::test]
async fn publish_connects_lazily_and_marks_messages_persistent(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    assert_eq!(bus.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connect_attempts(), 0);

    bus.publish(&key("book.created"), &json!({ "title": "Dune" }))
        .await
        .expect("publish succeeds");

    assert_eq!(bus.state(), ConnectionState::Connected);
    let published = broker.published();
    assert_eq!(published.len(), 1);
    let message = published.first().expect("one message");
    assert_eq!(message.exchange, BOOKWORM_EXCHANGE);
    assert_eq!(message.routing_key, "book.created");
    assert!(message.persistent);
    assert_eq!(message.json(), json!({ "title": "Dune" }));
}

#[rstest]
#[tokio::test]
async fn transient_publish_clears_persistent_flag(broker: InMemoryBroker) {
    let bus = bus_over(&broker);

    bus.publish_with(&key("user.created"), &json!({}), Persistence::Transient)
        .await
        .expect("publish succeeds");

    let published = broker.published();
    assert!(!published.first().expect("one message").persistent);
}

#[rstest]
#[tokio::test]
async fn concurrent_callers_share_one_connection(broker: InMemoryBroker) {
    let bus = bus_over(&broker);

    let publishes = (0..8).map(|n| {
        let bus = bus.clone();
        async move { bus.publish(&key("book.created"), &json!({ "n": n })).await }
    });
    for outcome in futures_util::future::join_all(publishes).await {
        outcome.expect("publish succeeds");
    }

    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.exchange_declarations(), 1);
    assert_eq!(broker.published().len(), 8);
}

#[rstest]
#[tokio::test]
async fn exchange_declaration_is_idempotent_across_connections(broker: InMemoryBroker) {
    let first = bus_over(&broker);
    let second = bus_over(&broker);

    first.start().await.expect("first bus connects");
    second.start().await.expect("second bus connects");

    assert_eq!(broker.exchange_declarations(), 2);
    assert_eq!(broker.exchanges(), vec![ExchangeSpec::default()]);
}

#[rstest]
#[tokio::test]
async fn conflicting_exchange_declaration_is_reported(broker: InMemoryBroker) {
    let conflicting = EventBus::new(
        Arc::new(broker.clone()),
        EventBusConfig {
            exchange: ExchangeSpec {
                durable: false,
                ..ExchangeSpec::default()
            },
            ..EventBusConfig::default()
        },
    );
    conflicting.start().await.expect("first declaration wins");

    let bus = bus_with(&broker, Arc::new(StalledSleeper));
    let error = bus.start().await.expect_err("declaration conflicts");

    assert!(matches!(error, EventBusError::Declaration(_)), "{error:?}");
    assert_eq!(bus.state(), ConnectionState::Reconnecting);
}

#[rstest]
#[tokio::test]
async fn subscriber_receives_matching_events_and_acks(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let (handler, mut rx) = forwarding_handler();
    let handle = bus
        .subscribe(pattern(BOOK_DELETED), handler)
        .await
        .expect("subscribe succeeds");

    bus.publish(&key("book.created"), &json!({ "bookId": "b0" }))
        .await
        .expect("publish unrelated event");
    bus.publish(
        &key(BOOK_DELETED),
        &json!({ "bookId": "b1", "imageId": "img1" }),
    )
    .await
    .expect("publish book.deleted");

    let event = next_event(&mut rx).await;
    assert_eq!(event.routing_key, BOOK_DELETED);
    assert_eq!(event.payload, json!({ "bookId": "b1", "imageId": "img1" }));
    assert!(!event.redelivered);

    eventually(|| broker.acks() == vec![BOOK_DELETED.to_owned()]).await;
    assert!(broker.nacks().is_empty());
    assert_eq!(broker.prefetch_of(handle.queue_name()), Some(DEFAULT_PREFETCH));
    assert!(handle.queue_name().starts_with("amq.gen-"));
}

#[rstest]
#[tokio::test]
async fn wildcard_subscription_matches_by_word(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let (handler, mut rx) = forwarding_handler();
    let _handle = bus
        .subscribe(pattern("book.*"), handler)
        .await
        .expect("subscribe succeeds");

    for routing_key in ["book.cover.updated", "user.created", "book.created"] {
        bus.publish(&key(routing_key), &json!({}))
            .await
            .expect("publish succeeds");
    }

    assert_eq!(next_event(&mut rx).await.routing_key, "book.created");
    assert_eq!(broker.published().len(), 3);
}

#[rstest]
#[tokio::test]
async fn handler_invocations_never_overlap(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let handler = {
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        move |_event: EventEnvelope| {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        }
    };
    let _handle = bus
        .subscribe(pattern("book.#"), handler)
        .await
        .expect("subscribe succeeds");

    for n in 0..5 {
        bus.publish(&key("book.created"), &json!({ "n": n }))
            .await
            .expect("publish succeeds");
    }

    eventually(|| broker.acks().len() == 5).await;
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

#[rstest]
#[tokio::test]
async fn failed_handler_requeues_until_it_succeeds(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = {
        let calls = Arc::clone(&calls);
        move |event: EventEnvelope| {
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            let tx = tx.clone();
            async move {
                tx.send(event.redelivered)
                    .map_err(|error| HandlerError::failed(error.to_string()))
                    .and_then(|()| {
                        if first {
                            Err(HandlerError::failed("storage offline"))
                        } else {
                            Ok(())
                        }
                    })
            }
        }
    };
    let _handle = bus
        .subscribe(pattern(BOOK_DELETED), handler)
        .await
        .expect("subscribe succeeds");

    bus.publish(&key(BOOK_DELETED), &json!({ "bookId": "b1", "imageId": "img1" }))
        .await
        .expect("publish succeeds");

    let first = timeout(Duration::from_secs(5), rx.recv()).await.expect("first attempt");
    let second = timeout(Duration::from_secs(5), rx.recv()).await.expect("second attempt");
    assert_eq!((first, second), (Some(false), Some(true)));

    eventually(|| broker.acks().len() == 1).await;
    assert_eq!(
        broker.nacks(),
        vec![NackRecord {
            routing_key: BOOK_DELETED.to_owned(),
            requeue: true,
        }]
    );
}

#[rstest]
#[tokio::test]
async fn panicking_handler_is_treated_as_failure(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        move |_event: EventEnvelope| {
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                assert!(!first, "handler blew up");
                Ok::<(), HandlerError>(())
            }
        }
    };
    let handle = bus
        .subscribe(pattern(BOOK_DELETED), handler)
        .await
        .expect("subscribe succeeds");

    bus.publish(&key(BOOK_DELETED), &json!({}))
        .await
        .expect("publish succeeds");

    eventually(|| broker.acks().len() == 1).await;
    assert_eq!(broker.nacks().len(), 1);
    assert!(!handle.is_finished());
}

#[rstest]
#[tokio::test]
async fn malformed_payload_is_requeued_without_reaching_handler(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let (handler, mut rx) = forwarding_handler();
    let handle = bus
        .subscribe(pattern(BOOK_DELETED), handler)
        .await
        .expect("subscribe succeeds");

    broker.inject(BOOKWORM_EXCHANGE, BOOK_DELETED, b"not json");

    eventually(|| !broker.nacks().is_empty()).await;
    handle.cancel().await;
    assert!(rx.try_recv().is_err());
    assert!(broker.acks().is_empty());
}

#[rstest]
#[tokio::test]
async fn cancelled_subscription_stops_receiving(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let (handler, mut rx) = forwarding_handler();
    let handle = bus
        .subscribe(pattern(BOOK_DELETED), handler)
        .await
        .expect("subscribe succeeds");

    handle.cancel().await;
    bus.publish(&key(BOOK_DELETED), &json!({}))
        .await
        .expect("publish succeeds");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(rx.try_recv().is_err());
    assert!(broker.acks().is_empty());
}

#[rstest]
#[tokio::test]
async fn lost_connection_is_replaced_and_subscriptions_redeclared(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let (handler, mut rx) = forwarding_handler();
    let handle = bus
        .subscribe(pattern(BOOK_DELETED), handler)
        .await
        .expect("subscribe succeeds");
    let original_queue = handle.queue_name().to_owned();

    broker.drop_connections();

    eventually(|| {
        bus.state() == ConnectionState::Connected
            && broker.connect_attempts() == 2
            && broker.queue_names().len() == 1
            && !broker.queue_names().contains(&original_queue)
    })
    .await;
    assert_eq!(broker.exchange_declarations(), 2);

    bus.publish(&key(BOOK_DELETED), &json!({ "bookId": "b2", "imageId": "img2" }))
        .await
        .expect("publish after reconnect");
    let event = next_event(&mut rx).await;
    assert_eq!(event.payload, json!({ "bookId": "b2", "imageId": "img2" }));

    let sessions: Vec<u64> = broker.published().iter().map(|m| m.session).collect();
    assert_eq!(sessions, vec![2]);
}

#[rstest]
#[tokio::test]
async fn reconnect_attempts_back_off_exponentially(broker: InMemoryBroker) {
    let sleeper = Arc::new(RecordingSleeper::default());
    let bus = bus_with(&broker, sleeper.clone());
    bus.start().await.expect("initial connect");

    broker.fail_next_connects(3);
    broker.drop_connections();

    eventually(|| bus.state() == ConnectionState::Connected && broker.connect_attempts() == 5)
        .await;
    assert_eq!(
        sleeper.delays(),
        vec![
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(40),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn reconnect_passes_through_every_state_in_order(broker: InMemoryBroker) {
    let log = Arc::new(StateLog::default());
    let bus = EventBus::with_runtime(
        Arc::new(StateLoggingBroker::new(broker.clone(), Arc::clone(&log))),
        EventBusConfig::default(),
        EventBusRuntime {
            sleeper: Arc::new(StateLoggingSleeper::new(Arc::clone(&log))),
        },
    );
    log.attach(&bus);

    bus.start().await.expect("initial connect");
    assert_eq!(log.states(), vec![ConnectionState::Connecting]);
    assert_eq!(bus.state(), ConnectionState::Connected);

    broker.fail_next_connects(1);
    broker.drop_connections();

    eventually(|| bus.state() == ConnectionState::Connected && broker.connect_attempts() == 3)
        .await;
    assert_eq!(
        log.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
        ]
    );
}

#[rstest]
#[tokio::test]
async fn callers_are_rejected_while_reconnecting(broker: InMemoryBroker) {
    broker.fail_next_connects(1);
    let bus = bus_with(&broker, Arc::new(StalledSleeper));

    let error = bus.start().await.expect_err("initial connect fails");
    assert!(matches!(error, EventBusError::Connection(_)), "{error:?}");
    assert_eq!(bus.state(), ConnectionState::Reconnecting);

    let error = bus
        .publish(&key(BOOK_DELETED), &json!({}))
        .await
        .expect_err("publish rejected");
    assert_eq!(
        error,
        EventBusError::Unavailable {
            state: ConnectionState::Reconnecting
        }
    );
    assert_eq!(broker.connect_attempts(), 1);
}

#[rstest]
#[tokio::test]
async fn shutdown_closes_connection_and_is_idempotent(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let (handler, _rx) = forwarding_handler();
    let handle = bus
        .subscribe(pattern(BOOK_DELETED), handler)
        .await
        .expect("subscribe succeeds");

    bus.shutdown().await.expect("first shutdown");
    bus.shutdown().await.expect("second shutdown");

    assert_eq!(bus.state(), ConnectionState::ShuttingDown);
    assert_eq!(broker.graceful_closes(), 1);
    assert_eq!(broker.open_sessions(), 0);
    eventually(|| handle.is_finished()).await;

    let error = bus
        .publish(&key(BOOK_DELETED), &json!({}))
        .await
        .expect_err("publish after shutdown");
    assert_eq!(error, EventBusError::ShuttingDown);
    let (handler, _rx) = forwarding_handler();
    let error = bus
        .subscribe(pattern(BOOK_DELETED), handler)
        .await
        .err()
        .expect("subscribe after shutdown");
    assert_eq!(error, EventBusError::ShuttingDown);
    assert_eq!(broker.connect_attempts(), 1);
}

#[rstest]
#[tokio::test]
async fn shutdown_waits_for_in_flight_acknowledgement(broker: InMemoryBroker) {
    let bus = bus_over(&broker);
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let handler = {
        let release = Arc::clone(&release);
        move |_event: EventEnvelope| {
            let entered = entered_tx.clone();
            let release = Arc::clone(&release);
            async move {
                let sent = entered
                    .send(())
                    .map_err(|error| HandlerError::failed(error.to_string()));
                if sent.is_ok() {
                    release.notified().await;
                }
                sent
            }
        }
    };
    let _handle = bus
        .subscribe(pattern(BOOK_DELETED), handler)
        .await
        .expect("subscribe succeeds");
    bus.publish(&key(BOOK_DELETED), &json!({ "bookId": "b1", "imageId": "img1" }))
        .await
        .expect("publish succeeds");
    timeout(Duration::from_secs(5), entered_rx.recv())
        .await
        .expect("handler entered in time")
        .expect("handler channel open");

    let closing = tokio::spawn({
        let bus = bus.clone();
        async move { bus.shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!closing.is_finished());
    assert_eq!(bus.state(), ConnectionState::ShuttingDown);
    assert_eq!(broker.graceful_closes(), 0);

    release.notify_one();
    timeout(Duration::from_secs(5), closing)
        .await
        .expect("shutdown finishes in time")
        .expect("shutdown task joins")
        .expect("shutdown succeeds");

    assert_eq!(broker.acks(), vec![BOOK_DELETED.to_owned()]);
    assert!(broker.nacks().is_empty());
    assert_eq!(broker.graceful_closes(), 1);
}

#[rstest]
#[tokio::test]
async fn shutdown_halts_pending_reconnects(broker: InMemoryBroker) {
    broker.fail_next_connects(1);
    let bus = bus_with(&broker, Arc::new(StalledSleeper));
    bus.start().await.expect_err("initial connect fails");

    bus.shutdown().await.expect("shutdown succeeds");
    tokio::task::yield_now().await;

    assert_eq!(bus.state(), ConnectionState::ShuttingDown);
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.graceful_closes(), 0);
}

#[tokio::test]
async fn connection_errors_from_the_port_are_surfaced() {
    let mut broker = MockMessageBroker::new();
    broker
        .expect_connect()
        .times(1)
        .returning(|| Err(BrokerError::connection("connection refused")));
    let bus = EventBus::with_runtime(
        Arc::new(broker),
        EventBusConfig::default(),
        EventBusRuntime {
            sleeper: Arc::new(StalledSleeper),
        },
    );

    let error = bus.start().await.expect_err("connect fails");

    assert_eq!(
        error,
        EventBusError::Connection(BrokerError::connection("connection refused"))
    );
}

#[tokio::test]
async fn state_changes_are_observable() {
    let broker = InMemoryBroker::new();
    let bus = bus_over(&broker);
    let mut changes = bus.state_changes();

    bus.start().await.expect("connects");

    assert!(changes.has_changed().expect("sender alive"));
    assert_eq!(*changes.borrow_and_update(), ConnectionState::Connected);
}
