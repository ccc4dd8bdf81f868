//! Connection lifecycle states and the transitions allowed between them.

use std::fmt;

/// Lifecycle state of the broker connection owned by the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection has been attempted yet.
    Disconnected,
    /// A handshake is in progress.
    Connecting,
    /// A connection and channel are live and the exchange is declared.
    Connected,
    /// The connection was lost or failed; a retry is scheduled.
    Reconnecting,
    /// Shutdown was requested. Terminal.
    ShuttingDown,
}

impl ConnectionState {
    /// Return true when moving from `self` to `next` is a legal transition.
    ///
    /// # Examples
    ///
    /// ```
    /// use bookworm_events::domain::ConnectionState;
    ///
    /// assert!(ConnectionState::Connected.can_transition_to(ConnectionState::Reconnecting));
    /// assert!(!ConnectionState::ShuttingDown.can_transition_to(ConnectionState::Connecting));
    /// ```
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Connected | Self::Connecting, Self::Reconnecting)
                | (Self::Reconnecting, Self::Connecting)
                | (
                    Self::Disconnected | Self::Connecting | Self::Connected | Self::Reconnecting,
                    Self::ShuttingDown
                )
        )
    }

    /// Stable lowercase label used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
