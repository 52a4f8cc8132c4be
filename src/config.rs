//! Configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment
//! variables (or a `.env` file via `dotenvy`). The protocol timing
//! knobs are plain constructor parameters on [`ClientConfig`];
//! [`RpcConfig::from_env`] is only the env-loading front end.

use std::net::SocketAddr;
use std::time::Duration;

/// Timing parameters for the client side of the protocol.
///
/// Nothing in the client hard-codes these; every instance receives its
/// own copy at construction time.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Minimum delay before a reconnect attempt. Backoff starts here
    /// and doubles on every failed attempt.
    pub reconnect_floor: Duration,
    /// Upper bound on the reconnect backoff delay.
    pub reconnect_ceiling: Duration,
    /// Interval between heartbeat calls on an open connection.
    pub heartbeat_interval: Duration,
    /// Timeout for a single heartbeat call. Must be shorter than the
    /// interval; a miss marks the connection dead.
    pub heartbeat_timeout: Duration,
    /// Default timeout for one-shot calls, overridable per call.
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_floor: Duration::from_millis(1_000),
            reconnect_ceiling: Duration::from_millis(60_000),
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(10_000),
            call_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Top-level configuration, loaded once at startup via
/// [`RpcConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Socket address to bind the WebSocket server to.
    pub listen_addr: SocketAddr,
    /// Client timing knobs.
    pub client: ClientConfig,
}

impl RpcConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set. Calls
    /// `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `WSRPC_LISTEN_ADDR` is set but cannot be
    /// parsed as a [`SocketAddr`].
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let listen_addr: SocketAddr = std::env::var("WSRPC_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse()?;

        let client = ClientConfig {
            reconnect_floor: parse_env_ms("WSRPC_RECONNECT_FLOOR_MS", 1_000),
            reconnect_ceiling: parse_env_ms("WSRPC_RECONNECT_CEILING_MS", 60_000),
            heartbeat_interval: parse_env_ms("WSRPC_HEARTBEAT_INTERVAL_MS", 30_000),
            heartbeat_timeout: parse_env_ms("WSRPC_HEARTBEAT_TIMEOUT_MS", 10_000),
            call_timeout: parse_env_ms("WSRPC_CALL_TIMEOUT_MS", 10_000),
        };

        Ok(Self {
            listen_addr,
            client,
        })
    }
}

/// Parses an environment variable as a millisecond duration, returning
/// `default` on missing or invalid values.
fn parse_env_ms(key: &str, default: u64) -> Duration {
    Duration::from_millis(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
