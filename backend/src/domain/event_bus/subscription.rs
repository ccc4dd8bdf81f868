//! Per-subscription consumer task and the handle returned to callers.
//!
//! Each subscription owns exactly one task, so handler invocations never
//! overlap: the next delivery is read only after the previous one has been
//! acked or nacked.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::events::EventEnvelope;
use crate::domain::ports::{
    Delivery, DeliveryStream, EventHandler, HandlerError, SubscriptionRequest,
};
use crate::domain::routing::RoutingPattern;

use super::{Epoch, EventBus};

/// Handle to a running subscription.
///
/// Dropping the handle cancels the subscription, as does [`Self::cancel`].
#[must_use = "dropping the handle cancels the subscription"]
pub struct SubscriptionHandle {
    pattern: RoutingPattern,
    queue: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Binding pattern of this subscription.
    #[must_use]
    pub fn pattern(&self) -> &RoutingPattern {
        &self.pattern
    }

    /// Name of the queue declared when the subscription was opened.
    ///
    /// Queues are server-named and exclusive, so a reconnect produces a new
    /// name that is not reflected here.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// True once the consumer task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop consuming and wait for the in-flight message, if any, to settle.
    pub async fn cancel(self) {
        self.cancel.send_replace(true);
        if let Err(error) = self.task.await {
            error!(pattern = %self.pattern, error = %error, "subscription task failed");
        }
    }
}

pub(super) struct Consumer {
    bus: EventBus,
    request: SubscriptionRequest,
    handler: Arc<dyn EventHandler>,
    cancel: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

enum Stop {
    Cancelled,
    ShuttingDown,
}

impl Consumer {
    pub(super) fn spawn(
        bus: EventBus,
        request: SubscriptionRequest,
        handler: Arc<dyn EventHandler>,
        epoch: u64,
        stream: Box<dyn DeliveryStream>,
    ) -> SubscriptionHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let pattern = request.pattern.clone();
        let queue = stream.queue_name().to_owned();
        let consumer = Self {
            shutdown: bus.shutdown_signal(),
            bus,
            request,
            handler,
            cancel: cancel_rx,
        };
        let task = tokio::spawn(consumer.run(epoch, stream));
        SubscriptionHandle {
            pattern,
            queue,
            cancel: cancel_tx,
            task,
        }
    }

    async fn run(mut self, mut epoch: u64, mut stream: Box<dyn DeliveryStream>) {
        loop {
            let next = tokio::select! {
                biased;
                stop = self.stopped() => {
                    self.finish(stop, stream.as_mut()).await;
                    return;
                }
                next = stream.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let Some(_in_flight) = self.bus.begin_dispatch() else {
                        debug!(pattern = %self.request.pattern, epoch, "shutting down, returning delivery");
                        if let Err(error) = delivery.nack(true).await {
                            debug!(pattern = %self.request.pattern, error = %error, "returning delivery failed");
                        }
                        continue;
                    };
                    self.dispatch(delivery).await;
                    continue;
                }
                Some(Err(error)) => {
                    warn!(pattern = %self.request.pattern, epoch, error = %error, "subscription stream failed");
                }
                None => {
                    debug!(pattern = %self.request.pattern, epoch, "subscription stream ended");
                }
            }

            match self.resubscribe().await {
                Ok((next_epoch, next_stream)) => {
                    epoch = next_epoch;
                    stream = next_stream;
                }
                Err(stop) => {
                    self.finish(stop, stream.as_mut()).await;
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key.clone();
        let redelivered = delivery.redelivered;

        let outcome = match serde_json::from_slice(&delivery.payload) {
            Ok(payload) => {
                let envelope = EventEnvelope {
                    routing_key: routing_key.clone(),
                    payload,
                    redelivered,
                };
                AssertUnwindSafe(self.handler.handle(envelope))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(HandlerError::failed("handler panicked")))
            }
            Err(error) => Err(HandlerError::from(error)),
        };

        match outcome {
            Ok(()) => match delivery.ack().await {
                Ok(()) => debug!(routing_key = %routing_key, redelivered, "message acknowledged"),
                Err(error) => {
                    error!(routing_key = %routing_key, error = %error, "acknowledging message failed");
                }
            },
            Err(handler_error) => {
                error!(
                    routing_key = %routing_key,
                    redelivered,
                    error = %handler_error,
                    "error processing message, requeueing"
                );
                if let Err(error) = delivery.nack(true).await {
                    error!(routing_key = %routing_key, error = %error, "requeueing message failed");
                }
            }
        }
    }

    /// Wait for a live session and re-open the queue on it.
    async fn resubscribe(&mut self) -> Result<(u64, Box<dyn DeliveryStream>), Stop> {
        let mut sessions = self.bus.sessions();
        let mut failed_epoch = None;
        loop {
            let candidate = tokio::select! {
                biased;
                stop = self.stopped() => return Err(stop),
                epoch = next_epoch(&mut sessions, failed_epoch) => epoch,
            };
            let Some(Epoch { id, session }) = candidate else {
                return Err(Stop::ShuttingDown);
            };

            match session.subscribe(&self.request).await {
                Ok(stream) => {
                    info!(
                        pattern = %self.request.pattern,
                        queue = stream.queue_name(),
                        epoch = id,
                        "subscription re-declared"
                    );
                    return Ok((id, stream));
                }
                Err(error) => {
                    warn!(pattern = %self.request.pattern, epoch = id, error = %error, "re-declaring subscription failed");
                    failed_epoch = Some(id);
                }
            }
        }
    }

    async fn stopped(&mut self) -> Stop {
        tokio::select! {
            // A dropped handle closes the channel, which also ends the wait.
            _ = self.cancel.wait_for(|cancelled| *cancelled) => Stop::Cancelled,
            _ = self.shutdown.wait_for(|stopping| *stopping) => Stop::ShuttingDown,
        }
    }

    async fn finish(&self, stop: Stop, stream: &mut dyn DeliveryStream) {
        match stop {
            Stop::Cancelled => {
                if let Err(error) = stream.cancel().await {
                    debug!(pattern = %self.request.pattern, error = %error, "cancelling consumer failed");
                }
                info!(pattern = %self.request.pattern, "subscription cancelled");
            }
            Stop::ShuttingDown => {
                debug!(pattern = %self.request.pattern, "subscription stopped for shutdown");
            }
        }
    }
}

/// Next published session other than `skip`, or `None` once the bus stops
/// publishing sessions.
async fn next_epoch(
    sessions: &mut watch::Receiver<Option<Epoch>>,
    skip: Option<u64>,
) -> Option<Epoch> {
    loop {
        let current = sessions.borrow_and_update().clone();
        if let Some(epoch) = current.filter(|epoch| Some(epoch.id) != skip) {
            return Some(epoch);
        }
        sessions.changed().await.ok()?;
    }
}
