//! Connection state for the realtime client

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the single transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Idle; initial state and the only state reached by explicit teardown
    #[default]
    Disconnected,
    /// Transport open in flight
    Connecting,
    /// Transport open, heartbeat running
    Connected,
    /// Waiting out the backoff delay before the next attempt
    ReconnectScheduled,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a connection task is alive for this state
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ReconnectScheduled => "reconnect_scheduled",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
