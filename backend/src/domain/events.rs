//! Exchange, message, and event payload types shared by publishers and
//! consumers.
//!
//! Messages travel as UTF-8 JSON. Publishers hand the bus a serialisable
//! value; consumers receive an [`EventEnvelope`] carrying the decoded JSON
//! alongside delivery metadata.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::routing::RoutingKey;

/// Name of the exchange every Bookworm service publishes to.
pub const BOOKWORM_EXCHANGE: &str = "bookworm_events";

/// Routing key announcing that a book was deleted.
pub const BOOK_DELETED: &str = "book.deleted";

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route by routing-key pattern.
    Topic,
}

/// Declaration parameters for the shared exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name.
    pub name: String,
    /// Routing type.
    pub kind: ExchangeKind,
    /// Whether the exchange survives a broker restart.
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange with the given name.
    pub fn durable_topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

impl Default for ExchangeSpec {
    fn default() -> Self {
        Self::durable_topic(BOOKWORM_EXCHANGE)
    }
}

/// A serialised message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Routing key the message is published under.
    pub routing_key: RoutingKey,
    /// JSON-encoded payload bytes.
    pub payload: Vec<u8>,
    /// Mark the message persistent on the broker.
    pub persistent: bool,
}

impl OutboundMessage {
    /// Serialise `payload` as JSON.
    pub fn json<T>(
        routing_key: RoutingKey,
        payload: &T,
        persistent: bool,
    ) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self {
            routing_key,
            payload: serde_json::to_vec(payload)?,
            persistent,
        })
    }
}

/// A decoded delivery handed to subscription handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Routing key the message was published under.
    pub routing_key: String,
    /// Parsed JSON payload.
    pub payload: serde_json::Value,
    /// True when the broker has delivered this message before.
    pub redelivered: bool,
}

impl EventEnvelope {
    /// Decode the payload into a typed event.
    ///
    /// # Examples
    ///
    /// ```
    /// use bookworm_events::domain::{BookDeleted, EventEnvelope};
    ///
    /// let envelope = EventEnvelope {
    ///     routing_key: "book.deleted".to_owned(),
    ///     payload: serde_json::json!({ "bookId": "b1", "imageId": "img1" }),
    ///     redelivered: false,
    /// };
    /// let event: BookDeleted = envelope.decode()?;
    /// assert_eq!(event.image_id, "img1");
    /// # Ok::<(), serde_json::Error>(())
    /// ```
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Payload published when a book is removed from the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDeleted {
    /// Identifier of the deleted book.
    pub book_id: String,
    /// Identifier of the cover image stored for the book.
    pub image_id: String,
}
