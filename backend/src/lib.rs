//! Bookworm event bus client.
//!
//! Publishes JSON events to the shared `bookworm_events` topic exchange and
//! consumes them with at-least-once delivery, recovering from lost broker
//! connections with exponential backoff.

pub mod domain;
pub mod outbound;
pub mod settings;
pub mod telemetry;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use domain::{EventBus, EventBusConfig, EventBusError};
pub use settings::EventBusSettings;
