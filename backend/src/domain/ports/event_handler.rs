//! Driving port implemented by subscription consumers.

use std::future::Future;

use async_trait::async_trait;

use super::define_port_error;
use crate::domain::events::EventEnvelope;

define_port_error! {
    /// Failures reported by an event handler.
    ///
    /// Any error causes the delivery to be negatively acknowledged and
    /// requeued.
    pub enum HandlerError {
        /// The payload did not match the expected event shape.
        Decode { #[doc = "Failure detail."] message: String } => "event payload could not be decoded: {message}",
        /// Processing failed.
        Failed { #[doc = "Failure detail."] message: String } => "event handling failed: {message}",
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::decode(error.to_string())
    }
}

/// Consumer callback invoked once per delivery.
///
/// Closures returning a future implement this trait, so ad-hoc handlers can
/// be passed straight to `EventBus::subscribe`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event. `Ok` acknowledges; `Err` requeues.
    async fn handle(&self, event: EventEnvelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: EventEnvelope) -> Result<(), HandlerError> {
        (self)(event).await
    }
}
