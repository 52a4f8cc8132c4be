//! Client side of the protocol: request correlation and the connection
//! lifecycle manager.

pub mod connection;
pub mod registry;

pub use connection::{ConnectionState, RpcClient};
pub use registry::CorrelationRegistry;
