//! The async block executor — pooled operation states for block-oriented
//! backend operations.
//!
//! Operations that are not dispatch (allocation, secure wipe, client
//! authentication, server state queries, storage-adjacent commands) run
//! through a single dispatch table keyed by operation id. States are pooled
//! and reused; `release_state` is the one place a held block goes back to
//! the block pool.

use std::sync::{Arc, Mutex};

use conduit_core::{BlockPool, ChunkId, DataBlock, Error, PeerId, Result};
use uuid::Uuid;

use crate::backend::{CommandId, OperationId, Task};

/// Callback invoked with authentication material for AuthenticateClient.
pub type AuthenticateCallback = dyn Fn(&mut DataBlock) -> Result<()> + Send + Sync;

/// Callback that fills a block with the server state document.
pub type ServerStateCallback = dyn Fn(&mut DataBlock) -> Result<()> + Send + Sync;

/// The state for one async block operation.
pub struct BlockOperationState {
    pub operation_id: OperationId,
    pub command_id: CommandId,
    pub session_id: Uuid,
    pub chunk_id: ChunkId,
    pub source_peer_id: PeerId,
    pub target_peer_id: PeerId,
    block: Option<DataBlock>,
}

impl BlockOperationState {
    fn fresh() -> Self {
        Self {
            operation_id: OperationId::None,
            command_id: CommandId::None,
            session_id: Uuid::nil(),
            chunk_id: ChunkId::nil(),
            source_peer_id: PeerId::nil(),
            target_peer_id: PeerId::nil(),
            block: None,
        }
    }

    pub fn block(&self) -> Option<&DataBlock> {
        self.block.as_ref()
    }

    pub fn block_mut(&mut self) -> Option<&mut DataBlock> {
        self.block.as_mut()
    }

    pub fn set_block(&mut self, block: DataBlock) {
        self.block = Some(block);
    }

    pub fn take_block(&mut self) -> Option<DataBlock> {
        self.block.take()
    }
}

pub struct AsyncBlockExecutor {
    pool: Arc<BlockPool>,
    states: Mutex<Vec<BlockOperationState>>,
    authenticate: Option<Box<AuthenticateCallback>>,
    server_state: Option<Box<ServerStateCallback>>,
}

impl AsyncBlockExecutor {
    pub fn new(pool: Arc<BlockPool>) -> Self {
        Self {
            pool,
            states: Mutex::new(Vec::new()),
            authenticate: None,
            server_state: None,
        }
    }

    pub fn with_authenticate_callback(
        mut self,
        callback: Box<AuthenticateCallback>,
    ) -> Self {
        self.authenticate = Some(callback);
        self
    }

    pub fn with_server_state_callback(mut self, callback: Box<ServerStateCallback>) -> Self {
        self.server_state = Some(callback);
        self
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    /// A pooled state, reset to nil identifiers.
    pub fn acquire_state(&self) -> BlockOperationState {
        self.states
            .lock()
            .expect("state pool lock")
            .pop()
            .unwrap_or_else(BlockOperationState::fresh)
    }

    /// Return the held block to the pool, nil out identifiers, and recycle
    /// the state itself.
    pub fn release_state(&self, mut state: BlockOperationState) {
        if let Some(block) = state.block.take() {
            self.pool.release(block);
        }

        state.operation_id = OperationId::None;
        state.command_id = CommandId::None;
        state.session_id = Uuid::nil();
        state.chunk_id = ChunkId::nil();
        state.source_peer_id = PeerId::nil();
        state.target_peer_id = PeerId::nil();

        self.states.lock().expect("state pool lock").push(state);
    }

    /// The operation dispatch table.
    ///
    /// Get and Put never reach the executor (they belong to the dispatch
    /// and storage planes); routing one here is a programmer error, as is
    /// an unrecognized command id.
    pub fn execute(&self, state: &mut BlockOperationState) -> Result<()> {
        match state.operation_id {
            OperationId::Alloc => {
                state.block = Some(self.pool.acquire());
                Ok(())
            }

            OperationId::SecureAlloc => {
                let mut block = self.pool.acquire();
                block.secure_wipe();
                state.block = Some(block);
                Ok(())
            }

            OperationId::SecureDiscard => match state.block.as_mut() {
                Some(block) => {
                    block.secure_wipe();
                    Ok(())
                }
                None => Err(Error::server_msg(
                    "invalid argument: secure discard without a block",
                )),
            },

            OperationId::AuthenticateClient => {
                let callback = self.authenticate.as_ref().ok_or_else(|| {
                    Error::server_msg("function not supported: no authentication callback")
                })?;
                let block = state.block.as_mut().ok_or_else(|| {
                    Error::server_msg("invalid argument: authenticate without a block")
                })?;
                callback(block)
            }

            OperationId::GetServerState => {
                let callback = self.server_state.as_ref().ok_or_else(|| {
                    Error::server_msg("function not supported: no server state callback")
                })?;
                let block = state
                    .block
                    .get_or_insert_with(|| self.pool.acquire());
                callback(block)
            }

            OperationId::Command => match state.command_id {
                // The storage plane already handled these; nothing to do.
                CommandId::FlushPeerSessions | CommandId::Remove => Ok(()),
                CommandId::None => panic!("command operation without a command id"),
            },

            other => panic!("operation {other:?} is not handled by the block executor"),
        }
    }

    /// The async form: run the table, resolve with the output block (if
    /// any), and recycle the state either way.
    pub fn create_operation_task(self: &Arc<Self>, mut state: BlockOperationState) -> Task {
        let executor = self.clone();
        Box::pin(async move {
            match executor.execute(&mut state) {
                Ok(()) => {
                    let block = state.take_block();
                    executor.release_state(state);
                    Ok(block)
                }
                Err(err) => {
                    executor.release_state(state);
                    Err(err)
                }
            }
        })
    }
}
