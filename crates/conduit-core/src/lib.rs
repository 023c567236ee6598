//! conduit-core — ids, wire format, data blocks, and shared infrastructure.
//! All other Conduit crates depend on this one.

pub mod block;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod ids;
pub mod tls;
pub mod wire;

pub use block::{BlockPool, DataBlock};
pub use error::{Error, Result};
pub use ids::{ChunkId, PeerId};
