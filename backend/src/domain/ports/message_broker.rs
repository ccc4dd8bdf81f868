//! Driven ports describing the message broker transport.
//!
//! The event bus never talks to the wire protocol directly. A
//! [`MessageBroker`] opens [`BrokerSession`]s (one connection plus one
//! channel); each session declares the exchange, publishes, and opens
//! exclusive subscription queues that yield [`Delivery`] values carrying their
//! own acknowledgement handle. A session is discarded once it reports
//! [`BrokerSession::closed`]; a replacement always comes from a fresh
//! [`MessageBroker::connect`] call.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::define_port_error;
use crate::domain::events::{ExchangeSpec, OutboundMessage};
use crate::domain::routing::RoutingPattern;

define_port_error! {
    /// Errors surfaced by broker adapters.
    pub enum BrokerError {
        /// The transport handshake failed or the connection dropped.
        Connection { #[doc = "Failure detail."] message: String } => "broker connection failed: {message}",
        /// A channel could not be opened or was closed by the broker.
        Channel { #[doc = "Failure detail."] message: String } => "broker channel failed: {message}",
        /// Exchange, queue, binding, or QoS declaration was refused.
        Declaration { #[doc = "Failure detail."] message: String } => "broker declaration failed: {message}",
        /// The message could not be handed to the transport.
        Publish { #[doc = "Failure detail."] message: String } => "broker publish failed: {message}",
        /// An ack or nack could not be delivered.
        Acknowledge { #[doc = "Failure detail."] message: String } => "broker acknowledgement failed: {message}",
        /// The session was closed and can no longer be used.
        Closed { #[doc = "Failure detail."] message: String } => "broker connection closed: {message}",
    }
}

/// Parameters for opening a subscription queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Exchange the queue is bound to.
    pub exchange: String,
    /// Binding pattern, topic wildcards allowed.
    pub pattern: RoutingPattern,
    /// Maximum unacknowledged deliveries held by the consumer.
    pub prefetch: u16,
}

/// Port for establishing broker sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Open a new connection and channel.
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// One live connection and its channel.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare the exchange; repeated identical declarations are no-ops.
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Hand one message to the transport without waiting for a confirm.
    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> Result<(), BrokerError>;

    /// Declare an exclusive server-named queue, bind it, set the prefetch
    /// window, and start consuming.
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// Resolve once the session has been lost, yielding the cause.
    async fn closed(&self) -> BrokerError;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Ordered stream of deliveries for one subscription queue.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Server-assigned queue name.
    fn queue_name(&self) -> &str;

    /// Wait for the next delivery; `None` means the queue was torn down.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Stop the broker from pushing further deliveries to this consumer.
    async fn cancel(&mut self) -> Result<(), BrokerError>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Positively acknowledge the delivery.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negatively acknowledge the delivery.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message received from a subscription queue.
pub struct Delivery {
    /// Routing key the message was published under.
    pub routing_key: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// True when the broker has delivered the message before.
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    /// Assemble a delivery from transport data and its settlement handle.
    pub fn new(
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            redelivered,
            acker,
        }
    }

    /// Acknowledge and consume the delivery.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject and consume the delivery.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
