//! conduit-gateway — the HTTPS bridge onto the messaging plane.
//!
//! Accepts HTTPS requests, turns each into a messaging block addressed to
//! the configured target peer, correlates the reply block, and serializes
//! it back as the HTTP response.

pub mod bridge;
pub mod options;
pub mod server;

pub use bridge::{GatewayBridge, RequestEnvelope, ResponseEnvelope, ResponseSink};
pub use options::GatewayOptions;
