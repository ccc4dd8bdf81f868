//! Domain primitives, ports, and the event bus client.
//!
//! Purpose: Define the strongly typed vocabulary shared by Bookworm services
//! when they talk over the `bookworm_events` topic exchange, and the bus that
//! carries it. Transport details stay behind the ports in [`ports`]; adapters
//! live in `crate::outbound`.
//!
//! Public surface:
//! - EventBus (alias to `event_bus::EventBus`): shared broker connection
//!   with publish, subscribe, and shutdown.
//! - RoutingKey / RoutingPattern: validated topic keys and binding patterns.
//! - EventEnvelope: decoded delivery handed to handlers.
//! - BookEventPublisher / ImageCleanupHandler: the `book.deleted` flow.

pub mod book_events;
pub mod event_bus;
pub mod events;
pub mod ports;
pub mod routing;

pub use self::book_events::{BookEventPublisher, ImageCleanupHandler};
pub use self::event_bus::{
    ConnectionState, DEFAULT_PREFETCH, DEFAULT_RECONNECT_BASE_DELAY, DEFAULT_RECONNECT_MAX_DELAY,
    EventBus, EventBusConfig, EventBusError, EventBusRuntime, Persistence, ReconnectPolicy,
    ReconnectSleeper, SubscriptionHandle, TokioSleeper,
};
pub use self::events::{
    BOOK_DELETED, BOOKWORM_EXCHANGE, BookDeleted, EventEnvelope, ExchangeKind, ExchangeSpec,
    OutboundMessage,
};
pub use self::routing::{ROUTING_KEY_MAX_LEN, RoutingKey, RoutingKeyError, RoutingPattern};
