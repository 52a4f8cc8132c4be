//! Wire-format codec: JSON message envelopes, parameter forms, and the
//! canonical serialization used for diff suppression.
//!
//! Every message is one JSON object carried in a WebSocket text frame.
//! This module is a leaf — both the client and the server build on it.

pub mod envelope;
pub mod fingerprint;
pub mod params;

pub use envelope::{Envelope, Inbound, ResponseEnvelope};
pub use fingerprint::fingerprint;
pub use params::Params;
