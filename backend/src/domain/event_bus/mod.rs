//! Event bus client: one shared broker connection with automatic recovery.
//!
//! The bus owns the connection lifecycle (see [`ConnectionState`]), publishes
//! JSON messages to the shared topic exchange, and runs one consumer task per
//! subscription. Lost connections are replaced, never repaired: a supervisor
//! task waits for the current session to close and then reconnects with
//! [`ReconnectPolicy`] backoff until it succeeds or shutdown begins. Every
//! new session re-declares the exchange, and live subscriptions re-open their
//! queues on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::domain::events::{ExchangeSpec, OutboundMessage};
use crate::domain::ports::{BrokerSession, EventHandler, MessageBroker, SubscriptionRequest};
use crate::domain::routing::{RoutingKey, RoutingPattern};

mod backoff;
mod error;
mod state;
mod subscription;

pub use backoff::{DEFAULT_RECONNECT_BASE_DELAY, DEFAULT_RECONNECT_MAX_DELAY, ReconnectPolicy};
pub use error::EventBusError;
pub use state::ConnectionState;
pub use subscription::SubscriptionHandle;

use subscription::Consumer;

/// Default number of unacknowledged deliveries per subscription.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Static configuration for the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Exchange declared on every connection and used for all traffic.
    pub exchange: ExchangeSpec,
    /// Backoff applied between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// Per-subscription prefetch window.
    pub prefetch: u16,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeSpec::default(),
            reconnect: ReconnectPolicy::default(),
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

/// Whether a published message should survive a broker restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Persistence {
    /// Mark the message persistent.
    #[default]
    Persistent,
    /// Leave the message in memory only.
    Transient,
}

impl Persistence {
    const fn is_persistent(self) -> bool {
        matches!(self, Self::Persistent)
    }
}

/// Async sleeping abstraction used between reconnect attempts.
#[async_trait]
pub trait ReconnectSleeper: Send + Sync {
    /// Suspend execution for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Tokio-based sleeper implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl ReconnectSleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Runtime helpers injected into the bus.
pub struct EventBusRuntime {
    /// Sleep implementation used for backoff delays.
    pub sleeper: Arc<dyn ReconnectSleeper>,
}

impl Default for EventBusRuntime {
    fn default() -> Self {
        Self {
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

/// One established session, numbered so consumers can tell sessions apart.
#[derive(Clone)]
pub(crate) struct Epoch {
    pub(crate) id: u64,
    pub(crate) session: Arc<dyn BrokerSession>,
}

struct Shared {
    broker: Arc<dyn MessageBroker>,
    config: EventBusConfig,
    sleeper: Arc<dyn ReconnectSleeper>,
    connect_lock: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    session: watch::Sender<Option<Epoch>>,
    shutdown: watch::Sender<bool>,
    in_flight: watch::Sender<usize>,
    epochs: AtomicU64,
}

/// A delivery being handled; dropping it releases a waiting shutdown.
pub(crate) struct InFlight {
    bus: EventBus,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.bus
            .shared
            .in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Shared handle to the process-wide broker connection.
///
/// Cloning is cheap; all clones drive the same connection. The connection is
/// opened lazily by the first publish or subscribe call, or eagerly through
/// [`EventBus::start`].
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    /// Build a bus using the default runtime.
    /// ```rust,ignore
    /// let bus = EventBus::new(Arc::new(LapinBroker::new(url)), EventBusConfig::default());
    /// ```
    pub fn new(broker: Arc<dyn MessageBroker>, config: EventBusConfig) -> Self {
        Self::with_runtime(broker, config, EventBusRuntime::default())
    }

    /// Build a bus with injected runtime abstractions.
    pub fn with_runtime(
        broker: Arc<dyn MessageBroker>,
        config: EventBusConfig,
        runtime: EventBusRuntime,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (session, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        let (in_flight, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                broker,
                config,
                sleeper: runtime.sleeper,
                connect_lock: Mutex::new(()),
                state,
                session,
                shutdown,
                in_flight,
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to lifecycle state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Configuration the bus was built with.
    #[must_use]
    pub fn config(&self) -> &EventBusConfig {
        &self.shared.config
    }

    /// Connect eagerly instead of waiting for the first publish or subscribe.
    pub async fn start(&self) -> Result<(), EventBusError> {
        self.ensure_session().await.map(|_| ())
    }

    /// Publish `payload` under `routing_key` as a persistent message.
    pub async fn publish<T>(&self, routing_key: &RoutingKey, payload: &T) -> Result<(), EventBusError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publish_with(routing_key, payload, Persistence::Persistent)
            .await
    }

    /// Publish `payload` under `routing_key`.
    ///
    /// The message is handed to the transport without waiting for a broker
    /// confirm. Failures are logged and returned; the message is not retried.
    pub async fn publish_with<T>(
        &self,
        routing_key: &RoutingKey,
        payload: &T,
        persistence: Persistence,
    ) -> Result<(), EventBusError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let message =
            OutboundMessage::json(routing_key.clone(), payload, persistence.is_persistent())?;

        let epoch = self.ensure_session().await.inspect_err(|error| {
            error!(routing_key = %routing_key, error = %error, "event dropped: broker unavailable");
        })?;

        epoch
            .session
            .publish(&self.shared.config.exchange.name, &message)
            .await
            .map_err(|error| {
                error!(routing_key = %routing_key, error = %error, "event dropped: publish failed");
                EventBusError::Publish(error)
            })?;

        info!(routing_key = %routing_key, "published event");
        Ok(())
    }

    /// Bind an exclusive queue to `pattern` and feed its deliveries to
    /// `handler`, one at a time.
    ///
    /// Declaration failures are returned. After a reconnect the queue is
    /// re-declared on the new connection automatically.
    pub async fn subscribe<H>(
        &self,
        pattern: RoutingPattern,
        handler: H,
    ) -> Result<SubscriptionHandle, EventBusError>
    where
        H: EventHandler + 'static,
    {
        let request = SubscriptionRequest {
            exchange: self.shared.config.exchange.name.clone(),
            pattern,
            prefetch: self.shared.config.prefetch,
        };

        let epoch = self.ensure_session().await?;
        let stream = epoch
            .session
            .subscribe(&request)
            .await
            .map_err(EventBusError::Declaration)?;

        info!(
            pattern = %request.pattern,
            queue = stream.queue_name(),
            "waiting for messages"
        );

        Ok(Consumer::spawn(
            self.clone(),
            request,
            Arc::new(handler),
            epoch.id,
            stream,
        ))
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Idempotent. Deliveries already handed to a handler are acked or nacked
    /// before the connection closes; consumers then stop. Calling this from
    /// inside a handler never returns, since that handler's delivery cannot
    /// settle first.
    pub async fn shutdown(&self) -> Result<(), EventBusError> {
        self.transition(ConnectionState::ShuttingDown);
        self.shared.shutdown.send_replace(true);

        let mut in_flight = self.shared.in_flight.subscribe();
        let settled = in_flight.wait_for(|count| *count == 0).await.is_ok();
        debug!(settled, "in-flight deliveries settled");

        let Some(epoch) = self.shared.session.send_replace(None) else {
            return Ok(());
        };
        info!(epoch = epoch.id, "closing message broker connection");
        epoch
            .session
            .close()
            .await
            .map_err(EventBusError::Connection)
    }

    pub(crate) fn sessions(&self) -> watch::Receiver<Option<Epoch>> {
        self.shared.session.subscribe()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    /// Count a delivery as in flight unless shutdown has begun.
    ///
    /// The shutdown flag is read under the counter's lock, so `shutdown`
    /// either sees this delivery in the count or the caller sees the flag.
    pub(crate) fn begin_dispatch(&self) -> Option<InFlight> {
        let admitted = self.shared.in_flight.send_if_modified(|count| {
            if *self.shared.shutdown.borrow() {
                return false;
            }
            *count += 1;
            true
        });
        admitted.then(|| InFlight { bus: self.clone() })
    }

    fn is_shutting_down(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    fn current_epoch(&self) -> Option<Epoch> {
        self.shared.session.borrow().clone()
    }

    async fn ensure_session(&self) -> Result<Epoch, EventBusError> {
        if let Some(epoch) = self.current_epoch() {
            return Ok(epoch);
        }

        let _guard = self.shared.connect_lock.lock().await;
        if let Some(epoch) = self.current_epoch() {
            return Ok(epoch);
        }
        match self.state() {
            ConnectionState::ShuttingDown => return Err(EventBusError::ShuttingDown),
            ConnectionState::Disconnected => {}
            state => return Err(EventBusError::Unavailable { state }),
        }

        self.transition(ConnectionState::Connecting);
        match self.establish().await {
            Ok(epoch) => Ok(epoch),
            Err(error) => {
                if self.transition(ConnectionState::Reconnecting) {
                    error!(error = %error, "connecting to message broker failed");
                    tokio::spawn(self.clone().reconnect());
                }
                Err(error)
            }
        }
    }

    /// Open a session and declare the exchange. Callers hold `connect_lock`.
    async fn establish(&self) -> Result<Epoch, EventBusError> {
        let session = self
            .shared
            .broker
            .connect()
            .await
            .map_err(EventBusError::Connection)?;

        if let Err(error) = session.declare_exchange(&self.shared.config.exchange).await {
            discard(&session).await;
            return Err(EventBusError::Declaration(error));
        }

        let epoch = Epoch {
            id: self.shared.epochs.fetch_add(1, Ordering::SeqCst) + 1,
            session,
        };
        // Shutdown flips its flag before taking the slot, so checking it under
        // the slot's write lock leaves no window for a session to leak.
        let installed = self.shared.session.send_if_modified(|slot| {
            if self.is_shutting_down() {
                false
            } else {
                *slot = Some(epoch.clone());
                true
            }
        });
        if !installed {
            discard(&epoch.session).await;
            return Err(EventBusError::ShuttingDown);
        }
        self.transition(ConnectionState::Connected);
        info!(
            epoch = epoch.id,
            exchange = %self.shared.config.exchange.name,
            "connected to message broker"
        );

        tokio::spawn(self.clone().supervise(epoch.clone()));
        Ok(epoch)
    }

    /// Wait for `epoch` to close, then hand over to the reconnect loop.
    fn supervise(self, epoch: Epoch) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let cause = epoch.session.closed().await;
            if self.is_shutting_down() {
                return;
            }

            let replaced = self.shared.session.send_if_modified(|current| {
                if current.as_ref().is_some_and(|live| live.id == epoch.id) {
                    *current = None;
                    true
                } else {
                    false
                }
            });
            if !replaced {
                return;
            }

            warn!(epoch = epoch.id, cause = %cause, "message broker connection closed, reconnecting");
            if self.transition(ConnectionState::Reconnecting) {
                self.reconnect().await;
            }
        })
    }

    fn reconnect(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut shutdown = self.shutdown_signal();
            let mut attempt: u32 = 0;
            loop {
                let delay = self.shared.config.reconnect.delay_for(attempt);
                debug!(attempt, delay = ?delay, "waiting before reconnect");
                tokio::select! {
                    () = self.shared.sleeper.sleep(delay) => {}
                    _ = shutdown.wait_for(|stopping| *stopping) => return,
                }

                let _guard = self.shared.connect_lock.lock().await;
                if !self.transition(ConnectionState::Connecting) {
                    return;
                }
                match self.establish().await {
                    Ok(epoch) => {
                        info!(
                            epoch = epoch.id,
                            attempts = attempt.saturating_add(1),
                            "reconnected to message broker"
                        );
                        return;
                    }
                    Err(EventBusError::ShuttingDown) => return,
                    Err(error) => {
                        attempt = attempt.saturating_add(1);
                        if !self.transition(ConnectionState::Reconnecting) {
                            return;
                        }
                        error!(
                            error = %error,
                            attempt,
                            retry_in = ?self.shared.config.reconnect.delay_for(attempt),
                            "reconnection failed"
                        );
                    }
                }
            }
        })
    }

    fn transition(&self, next: ConnectionState) -> bool {
        self.shared.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = %current, to = %next, "event bus state change");
                *current = next;
                true
            } else {
                false
            }
        })
    }
}

async fn discard(session: &Arc<dyn BrokerSession>) {
    if let Err(error) = session.close().await {
        debug!(error = %error, "closing abandoned broker session failed");
    }
}

#[cfg(test)]
mod tests;
