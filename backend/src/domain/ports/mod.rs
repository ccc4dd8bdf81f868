//! Domain ports and supporting types for the hexagonal boundary.

mod macros;
pub(crate) use macros::define_port_error;

mod event_handler;
mod image_store;
mod message_broker;

pub use event_handler::{EventHandler, HandlerError};
#[cfg(test)]
pub use image_store::MockImageStore;
pub use image_store::{ImageStore, ImageStoreError};
#[cfg(test)]
pub use message_broker::MockMessageBroker;
pub use message_broker::{
    BrokerError, BrokerSession, Delivery, DeliveryAcker, DeliveryStream, MessageBroker,
    SubscriptionRequest,
};
