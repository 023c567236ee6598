//! The core backend processing interface.
//!
//! A backend accepts block operations and turns them into tasks. The broker
//! dispatching backend (dispatch.rs), the forwarding backend (forwarding.rs)
//! and any in-path processing backend (e.g. an authorizing stage) all
//! implement this one trait, composed as trait objects rather than through
//! an interface-query registry.

use std::future::Future;
use std::pin::Pin;

use conduit_core::{ChunkId, DataBlock, PeerId, Result};
use uuid::Uuid;

/// A scheduled backend operation. Resolves once the operation completed,
/// including any remote acknowledgment it implies. The resolved block is
/// the operation's output when it has one: a processing stage hands back
/// the (possibly transformed) block for further dispatch, a Get resolves
/// with the loaded block, and a plain dispatch resolves with `None` once
/// the block is consumed.
pub type Task = Pin<Box<dyn Future<Output = Result<Option<DataBlock>>> + Send + 'static>>;

/// Invoked exactly once with the outcome of a queued block send.
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandId {
    None = 0,
    FlushPeerSessions,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OperationId {
    None = 0,

    Alloc,
    SecureAlloc,
    SecureDiscard,
    AuthenticateClient,
    GetServerState,

    Get,
    Put,
    Command,
}

/// Everything a backend needs to know about one block operation.
pub struct BackendRequest {
    pub operation_id: OperationId,
    pub command_id: CommandId,
    pub session_id: Uuid,
    pub chunk_id: ChunkId,
    pub source_peer_id: PeerId,
    pub target_peer_id: PeerId,
    pub block: Option<DataBlock>,
}

impl BackendRequest {
    /// A Put carrying `block` from `source` to `target`.
    pub fn put(
        session_id: Uuid,
        source_peer_id: PeerId,
        target_peer_id: PeerId,
        block: DataBlock,
    ) -> Self {
        Self {
            operation_id: OperationId::Put,
            command_id: CommandId::None,
            session_id,
            chunk_id: conduit_core::ids::CHUNK_ID_DEFAULT,
            source_peer_id,
            target_peer_id,
            block: Some(block),
        }
    }
}

/// The core messaging backend processing interface.
pub trait BackendProcessing: Send + Sync {
    /// Turn a request into a task, or `None` when the operation is not
    /// handled here and the caller should fall back to the async executor
    /// wrapper.
    fn create_backend_processing_task(&self, request: BackendRequest) -> Option<Task>;

    /// When true, the dispatcher auto-forwards the block after the optional
    /// processing step; when false this backend owns dispatch itself.
    fn auto_block_dispatching(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    /// Release held resources. Idempotent.
    fn dispose(&self);
}

/// Optional hooks a processing backend may expose to observe peer
/// connectivity. Returning false means "not supported" and the caller
/// proceeds synchronously.
pub trait AcceptorNotify: Send + Sync {
    fn peer_connected_notify(&self, peer_id: PeerId) -> bool {
        let _ = peer_id;
        false
    }

    fn peer_disconnected_notify(&self, peer_id: PeerId) -> bool {
        let _ = peer_id;
        false
    }
}
