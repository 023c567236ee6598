//! Peer and chunk identities.
//!
//! Both are 128-bit values carried verbatim in the command frame. Peer ids
//! address participants in the messaging plane; chunk ids address blobs in
//! the chunk store. They are distinct newtypes so a dispatch target can
//! never be confused with a storage key in an API signature, even though
//! Put frames reuse the chunk id field for the target peer (see wire.rs).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a participant (broker, gateway, client) in the messaging
/// plane. Assigned at process start; persistable if the caller supplies one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

/// Identity of a data blob in the chunk store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(Uuid);

/// Sentinel chunk id for command frames whose block type implies the chunk
/// id is irrelevant. The value travels on the wire and must never change.
pub const CHUNK_ID_DEFAULT: ChunkId =
    ChunkId(Uuid::from_u128(0x6eb31c0f_efd2_4091_b364_2cb7ad8baf17));

impl PeerId {
    /// Fresh random identity for this process.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn parse(text: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(text).map(Self)
    }
}

impl ChunkId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn parse(text: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(text).map(Self)
    }

    /// Lowercase hyphenated form, used for multi-file chunk store paths.
    pub fn to_file_name(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// A peer id reinterpreted as a chunk id, for Put frames where the chunk id
/// field carries the dispatch target.
impl From<PeerId> for ChunkId {
    fn from(peer: PeerId) -> Self {
        ChunkId(peer.0)
    }
}

impl From<ChunkId> for PeerId {
    fn from(chunk: ChunkId) -> Self {
        PeerId(chunk.0)
    }
}
