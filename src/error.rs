//! Protocol error types.
//!
//! [`RpcError`] is the central error type for both sides of the
//! protocol. Variants follow the error taxonomy: transport failures are
//! recovered by reconnecting, protocol failures drop the offending
//! message, application failures travel back over the wire as an
//! `"error"` response, and correlation/timeout failures are surfaced to
//! the one caller they concern.

/// Central error enum for the publish/subscribe RPC protocol.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Socket-level failure. Never surfaced to application code by the
    /// client; always converted into a scheduled reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed JSON or a message missing required fields. The
    /// offending message is dropped and the connection stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An inbound method name did not resolve to a registered callable.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The invoked method failed. Wrapped into an `"error"` response
    /// field; the connection stays open.
    #[error("{0}")]
    Application(String),

    /// A response referenced a correlation id with no pending entry.
    #[error("no pending request for id {0}")]
    Correlation(String),

    /// A one-shot call saw no response within its timeout. Treated like
    /// an application error by the caller, logged distinctly.
    #[error("call to {method} timed out")]
    Timeout {
        /// Method the timed-out call targeted.
        method: String,
    },

    /// The connection was explicitly closed; the instance is terminal.
    #[error("connection closed")]
    Closed,

    /// A value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RpcError {
    /// Collapses this error into the wire-format `"error"` string.
    ///
    /// The remote peer only ever sees a message, never the variant.
    #[must_use]
    pub fn wire_message(&self) -> String {
        self.to_string()
    }

    /// Returns `true` for errors the client recovers from by closing
    /// the socket and scheduling a reconnect.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
