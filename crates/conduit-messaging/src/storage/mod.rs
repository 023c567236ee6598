//! The chunk storage plane — a durable keyed blob interface behind the
//! Put/Get/Remove command codes.
//!
//! Two interchangeable implementations: one file per chunk
//! (`MultiFileChunkStorage`) and a single append-only log
//! (`SingleFileChunkStorage`). Both serialize structural mutation behind a
//! single mutex; the multi-file variant additionally allows concurrent
//! reads of distinct chunks because every read opens its own handle.

mod multi_file;
mod single_file;

pub use multi_file::MultiFileChunkStorage;
pub use single_file::SingleFileChunkStorage;

use conduit_core::{ChunkId, DataBlock, PeerId, Result};
use uuid::Uuid;

pub trait ChunkStorage: Send + Sync {
    /// Persist the block under `chunk_id`. Saving over an existing chunk
    /// atomically supersedes the prior content.
    fn save(&self, session_id: Uuid, chunk_id: ChunkId, block: &DataBlock) -> Result<()>;

    /// Read the chunk into `block`: validates the stored size fits the
    /// block's capacity, then sets `size` and resets the parse cursor.
    fn load(&self, session_id: Uuid, chunk_id: ChunkId, block: &mut DataBlock) -> Result<()>;

    /// Delete the chunk. Removing an absent chunk is ChunkNotFound.
    fn remove(&self, session_id: Uuid, chunk_id: ChunkId) -> Result<()>;

    /// Hook for session-aware storages; a no-op by default.
    fn flush_peer_sessions(&self, peer_id: PeerId) -> Result<()> {
        let _ = peer_id;
        Ok(())
    }

    /// Release held resources. Idempotent; any use after dispose fails.
    fn dispose(&self);
}
