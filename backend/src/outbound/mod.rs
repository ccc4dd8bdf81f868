//! Outbound adapters implementing domain ports for external infrastructure.
//!
//! - **broker**: AMQP 0-9-1 transport for the event bus, built on `lapin`
//! - **images**: image storage stand-in used by the cleanup worker
//!
//! Adapters are thin translators that convert between domain types and
//! infrastructure-specific representations. They contain no business logic.

pub mod broker;
pub mod images;
