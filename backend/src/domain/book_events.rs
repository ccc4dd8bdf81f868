//! Typed publisher and consumer for book lifecycle events.
//!
//! The catalogue publishes [`BookDeleted`] after removing a book; the
//! cleanup consumer deletes the cover image it referenced. Neither side lets
//! a broker or storage outage fail the operation that triggered it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::event_bus::EventBus;
use super::events::{BOOK_DELETED, BookDeleted, EventEnvelope};
use super::ports::{EventHandler, HandlerError, ImageStore, ImageStoreError};
use super::routing::RoutingKey;

/// Publishes book events on the shared bus.
#[derive(Clone)]
pub struct BookEventPublisher {
    bus: EventBus,
}

impl BookEventPublisher {
    /// Wrap a bus handle.
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Announce that a book and its cover image were removed.
    ///
    /// Best effort: failures are logged and not returned, so the deletion
    /// that triggered the event stands even when the broker is down.
    pub async fn book_deleted(&self, book_id: &str, image_id: &str) {
        let event = BookDeleted {
            book_id: book_id.to_owned(),
            image_id: image_id.to_owned(),
        };
        let routing_key = match RoutingKey::new(BOOK_DELETED) {
            Ok(key) => key,
            Err(error) => {
                error!(error = %error, "book.deleted routing key rejected");
                return;
            }
        };
        if let Err(error) = self.bus.publish(&routing_key, &event).await {
            warn!(book_id, image_id, error = %error, "book deletion event not published");
        }
    }
}

/// Deletes the cover image of each deleted book.
#[derive(Clone)]
pub struct ImageCleanupHandler {
    store: Arc<dyn ImageStore>,
}

impl ImageCleanupHandler {
    /// Build a handler backed by `store`.
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for ImageCleanupHandler {
    async fn handle(&self, event: EventEnvelope) -> Result<(), HandlerError> {
        let deleted: BookDeleted = event.decode()?;

        // Storage failures are acknowledged, never requeued.
        match self.store.delete_image(&deleted.image_id).await {
            Ok(()) => {
                info!(book_id = %deleted.book_id, image_id = %deleted.image_id, "cover image deleted");
            }
            Err(ImageStoreError::NotFound { image_id }) => {
                warn!(book_id = %deleted.book_id, image_id = %image_id, "cover image already absent");
            }
            Err(error) => {
                error!(
                    book_id = %deleted.book_id,
                    image_id = %deleted.image_id,
                    error = %error,
                    "error handling book deleted event"
                );
            }
        }
        Ok(())
    }
}
