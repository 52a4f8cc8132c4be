//! Server side of the protocol: method dispatch, channel broker, and
//! per-connection WebSocket actors.

pub mod broker;
pub mod connection;
pub mod dispatch;
pub mod handler;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one client connection, assigned at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Generates a fresh connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
