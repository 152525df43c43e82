//! Events published to the consumer of the link.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

/// Connection lifecycle of the link.
///
/// ```text
/// Disconnected ──► Connecting ──► Connected ──► Disconnecting ──► Disconnected
///                      │              │
///                      └──► Error ◄───┘
/// ```
///
/// `Unsupported` is terminal and only entered when the platform has no serial
/// transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
    Unsupported,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// One entry of the status stream.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub message: Option<String>,
    pub timestamp: DateTime<Local>,
}

impl LinkStatus {
    pub fn new(state: ConnectionState, message: Option<String>) -> Self {
        Self {
            state,
            message,
            timestamp: Local::now(),
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.state, message),
            None => write!(f, "{}", self.state),
        }
    }
}

/// A physical roll trigger that passed the gate.
#[derive(Debug, Clone, Serialize)]
pub struct RollRequest {
    /// Counts accepted rolls over the controller's lifetime, starting at 1.
    pub sequence: u64,
    pub received_at: DateTime<Local>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display() {
        let status = LinkStatus::new(ConnectionState::Error, Some("port busy".to_string()));
        assert_eq!(status.to_string(), "error: port busy");

        let status = LinkStatus::new(ConnectionState::Connected, None);
        assert_eq!(status.to_string(), "connected");
    }

    #[test]
    fn default_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
