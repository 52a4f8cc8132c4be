//! # wsrpc
//!
//! Bidirectional publish/subscribe RPC over a single persistent
//! WebSocket connection.
//!
//! The server exposes named methods grouped into namespaces. Clients
//! issue one-shot calls or persistent subscriptions against those
//! methods over one socket; when a mutating method is invoked, every
//! subscription watching an affected channel is re-evaluated and the
//! fresh result is pushed to its subscriber — but only when the result
//! actually changed.
//!
//! The client side maintains the connection for the life of the
//! process: heartbeats detect dead peers, reconnects back off
//! exponentially, and subscriptions are resubmitted after every
//! successful reconnect so subscribers simply see fresh data again.
//!
//! ## Architecture
//!
//! ```text
//! RpcClient (client/)
//!     │  one socket, supervisor task, heartbeat
//!     ├── CorrelationRegistry (client/)
//!     │
//!     ▼  JSON text frames
//! WS Handler (server/handler)
//!     │
//!     ├── per-connection actor (server/connection)
//!     ├── DispatchTable (server/dispatch)
//!     └── ChannelBroker (server/broker)
//! ```

pub mod app_state;
pub mod client;
pub mod config;
pub mod error;
pub mod proto;
pub mod server;
