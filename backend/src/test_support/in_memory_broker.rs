//! In-process broker double with topic-exchange semantics.
//!
//! Mirrors the broker behaviour the event bus relies on: idempotent exchange
//! declaration, server-named exclusive queues that vanish with their
//! connection, prefetch windows, ack/nack with requeue (marking the message
//! redelivered), and abrupt connection loss. Every interaction is recorded so
//! tests can assert on what reached the transport.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};

use crate::domain::ports::{
    BrokerError, BrokerSession, Delivery, DeliveryAcker, DeliveryStream, MessageBroker,
    SubscriptionRequest,
};
use crate::domain::{ExchangeSpec, OutboundMessage, RoutingKey, RoutingPattern};

/// A message as it reached the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Session that published the message.
    pub session: u64,
    /// Target exchange.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Persistent delivery flag.
    pub persistent: bool,
}

impl PublishedMessage {
    /// Decode the payload as JSON.
    pub fn json(&self) -> serde_json::Value {
        match serde_json::from_slice(&self.payload) {
            Ok(value) => value,
            Err(error) => panic!("published payload is not JSON: {error}"),
        }
    }
}

/// A negative acknowledgement observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackRecord {
    /// Routing key of the rejected message.
    pub routing_key: String,
    /// Whether requeue was requested.
    pub requeue: bool,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

struct QueueState {
    exchange: String,
    pattern: RoutingPattern,
    session: u64,
    prefetch: u16,
    consuming: bool,
    ready: VecDeque<QueuedMessage>,
    unacked: BTreeMap<u64, QueuedMessage>,
    notify: Arc<Notify>,
}

struct SessionEntry {
    closed: watch::Sender<Option<BrokerError>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: BTreeMap<String, ExchangeSpec>,
    exchange_declarations: usize,
    queues: BTreeMap<String, QueueState>,
    sessions: BTreeMap<u64, SessionEntry>,
    published: Vec<PublishedMessage>,
    acks: Vec<String>,
    nacks: Vec<NackRecord>,
    pending_connect_failures: usize,
    connect_attempts: usize,
    graceful_closes: usize,
    next_session: u64,
    next_queue: u64,
    next_tag: u64,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &RoutingKey, payload: &[u8]) {
        for queue in self.queues.values_mut() {
            if queue.exchange == exchange && queue.pattern.matches(routing_key) {
                queue.ready.push_back(QueuedMessage {
                    routing_key: routing_key.as_str().to_owned(),
                    payload: payload.to_vec(),
                    redelivered: false,
                });
                queue.notify.notify_one();
            }
        }
    }

    fn end_session(&mut self, session: u64, cause: BrokerError) {
        if let Some(entry) = self.sessions.remove(&session) {
            entry.closed.send_replace(Some(cause));
        }
        self.queues.retain(|_, queue| {
            let keep = queue.session != session;
            if !keep {
                queue.notify.notify_one();
            }
            keep
        });
    }
}

type SharedState = Arc<Mutex<BrokerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, BrokerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(_) => panic!("in-memory broker mutex poisoned"),
    }
}

/// Broker double shared between the bus under test and assertions.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: SharedState,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        lock(&self.state).pending_connect_failures = count;
    }

    /// Drop every open connection as if the network failed.
    pub fn drop_connections(&self) {
        let mut state = lock(&self.state);
        let sessions: Vec<u64> = state.sessions.keys().copied().collect();
        for session in sessions {
            state.end_session(session, BrokerError::connection("connection reset by peer"));
        }
    }

    /// Publish raw bytes directly to an exchange, bypassing any session.
    pub fn inject(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        let key = match RoutingKey::new(routing_key) {
            Ok(key) => key,
            Err(error) => panic!("invalid routing key for injection: {error}"),
        };
        lock(&self.state).route(exchange, &key, payload);
    }

    /// Messages handed to the transport, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    /// Number of exchange declarations received.
    pub fn exchange_declarations(&self) -> usize {
        lock(&self.state).exchange_declarations
    }

    /// Exchanges currently declared.
    pub fn exchanges(&self) -> Vec<ExchangeSpec> {
        lock(&self.state).exchanges.values().cloned().collect()
    }

    /// Names of queues currently declared.
    pub fn queue_names(&self) -> Vec<String> {
        lock(&self.state).queues.keys().cloned().collect()
    }

    /// Prefetch window configured for `queue`.
    pub fn prefetch_of(&self, queue: &str) -> Option<u16> {
        lock(&self.state).queues.get(queue).map(|queue| queue.prefetch)
    }

    /// Routing keys of acknowledged messages, in order.
    pub fn acks(&self) -> Vec<String> {
        lock(&self.state).acks.clone()
    }

    /// Negative acknowledgements, in order.
    pub fn nacks(&self) -> Vec<NackRecord> {
        lock(&self.state).nacks.clone()
    }

    /// Total connection attempts, failed or not.
    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    /// Number of sessions currently open.
    pub fn open_sessions(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Number of sessions closed by the client.
    pub fn graceful_closes(&self) -> usize {
        lock(&self.state).graceful_closes
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if state.pending_connect_failures > 0 {
            state.pending_connect_failures -= 1;
            return Err(BrokerError::connection("connection refused"));
        }

        state.next_session += 1;
        let id = state.next_session;
        let (closed, _) = watch::channel(None);
        let closed_rx = closed.subscribe();
        state.sessions.insert(id, SessionEntry { closed });

        Ok(Arc::new(InMemorySession {
            id,
            state: Arc::clone(&self.state),
            closed: closed_rx,
        }))
    }
}

struct InMemorySession {
    id: u64,
    state: SharedState,
    closed: watch::Receiver<Option<BrokerError>>,
}

impl InMemorySession {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = lock(&self.state);
        if state.sessions.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(BrokerError::closed(format!("session {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        state.exchange_declarations += 1;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(BrokerError::declaration(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::publish(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        state.published.push(PublishedMessage {
            session: self.id,
            exchange: exchange.to_owned(),
            routing_key: message.routing_key.as_str().to_owned(),
            payload: message.payload.clone(),
            persistent: message.persistent,
        });
        state.route(exchange, &message.routing_key, &message.payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(&request.exchange) {
            return Err(BrokerError::declaration(format!(
                "NOT_FOUND - no exchange '{}'",
                request.exchange
            )));
        }

        state.next_queue += 1;
        let name = format!("amq.gen-{}", state.next_queue);
        let notify = Arc::new(Notify::new());
        state.queues.insert(
            name.clone(),
            QueueState {
                exchange: request.exchange.clone(),
                pattern: request.pattern.clone(),
                session: self.id,
                prefetch: request.prefetch,
                consuming: true,
                ready: VecDeque::new(),
                unacked: BTreeMap::new(),
                notify: Arc::clone(&notify),
            },
        );

        Ok(Box::new(InMemoryDeliveryStream {
            queue: name,
            state: Arc::clone(&self.state),
            notify,
        }))
    }

    async fn closed(&self) -> BrokerError {
        let mut closed = self.closed.clone();
        match closed.wait_for(Option::is_some).await {
            Ok(cause) => cause
                .clone()
                .unwrap_or_else(|| BrokerError::closed("session closed")),
            Err(_) => BrokerError::closed("broker dropped"),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if state.sessions.contains_key(&self.id) {
            state.graceful_closes += 1;
            state.end_session(self.id, BrokerError::closed("closed by client"));
        }
        Ok(())
    }
}

struct InMemoryDeliveryStream {
    queue: String,
    state: SharedState,
    notify: Arc<Notify>,
}

impl InMemoryDeliveryStream {
    fn try_take(&self) -> Option<Option<Delivery>> {
        let mut state = lock(&self.state);
        state.next_tag += 1;
        let tag = state.next_tag;
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Some(None);
        };
        if !queue.consuming {
            return Some(None);
        }
        if queue.unacked.len() >= usize::from(queue.prefetch.max(1)) {
            return None;
        }
        let message = queue.ready.pop_front()?;
        queue.unacked.insert(tag, message.clone());

        Some(Some(Delivery::new(
            message.routing_key,
            message.payload,
            message.redelivered,
            Box::new(InMemoryAcker {
                queue: self.queue.clone(),
                tag,
                state: Arc::clone(&self.state),
            }),
        )))
    }
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveryStream {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        // Requeued messages are immediately ready again; yield so a consumer
        // stuck on one cannot starve the rest of the runtime.
        tokio::task::yield_now().await;
        loop {
            if let Some(next) = self.try_take() {
                return next.map(Ok);
            }
            self.notify.notified().await;
        }
    }

    async fn cancel(&mut self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.consuming = false;
            queue.notify.notify_one();
        }
        Ok(())
    }
}

struct InMemoryAcker {
    queue: String,
    tag: u64,
    state: SharedState,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(BrokerError::acknowledge(format!(
                "queue {} no longer exists",
                self.queue
            )));
        };
        let Some(mut message) = queue.unacked.remove(&self.tag) else {
            return Err(BrokerError::acknowledge(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.tag
            )));
        };
        let routing_key = message.routing_key.clone();
        if requeue == Some(true) {
            message.redelivered = true;
            queue.ready.push_front(message);
        }
        queue.notify.notify_one();

        match requeue {
            None => state.acks.push(routing_key),
            Some(requeue) => state.nacks.push(NackRecord {
                routing_key,
                requeue,
            }),
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Some(requeue))
    }
}
