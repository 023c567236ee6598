//! Per-peer outbound queues and their registry.
//!
//! Each connected peer has exactly one message block completion queue: an
//! ordered FIFO of (target, block, completion) entries consumed by the
//! peer's outbound connection task. The consumer sends one entry at a time
//! and fires its completion before starting the next, which is what gives
//! the per-target ordering guarantee.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use conduit_core::{BlockPool, DataBlock, Error, PeerId};
use tokio::sync::mpsc;

use crate::backend::CompletionCallback;

/// One queued block send.
pub struct QueuedBlock {
    pub target_peer_id: PeerId,
    pub block: DataBlock,
    pub on_ready: CompletionCallback,
}

/// The sending half of a peer's outbound FIFO. The receiving half is owned
/// by the peer's connection task (see `open`).
pub struct MessageBlockCompletionQueue {
    remote_peer_id: PeerId,
    tx: mpsc::UnboundedSender<QueuedBlock>,
    scheduled: AtomicU64,
}

impl MessageBlockCompletionQueue {
    /// Create the queue for a freshly connected peer. The returned receiver
    /// goes to the connection task feeding that peer.
    pub fn open(
        remote_peer_id: PeerId,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<QueuedBlock>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                remote_peer_id,
                tx,
                scheduled: AtomicU64::new(0),
            }),
            rx,
        )
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    /// Enqueue a block. `on_ready` is invoked exactly once — immediately
    /// with a connectivity error if the consumer is already gone.
    pub fn schedule_block(
        &self,
        target_peer_id: PeerId,
        block: DataBlock,
        on_ready: CompletionCallback,
    ) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);

        let entry = QueuedBlock {
            target_peer_id,
            block,
            on_ready,
        };

        if let Err(mpsc::error::SendError(entry)) = self.tx.send(entry) {
            (entry.on_ready)(Err(Error::Connectivity(format!(
                "peer {} disconnected",
                self.remote_peer_id
            ))));
        }
    }

    pub fn blocks_scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }
}

/// Fail every still-queued entry with a disconnect error, returning its
/// block to the pool. Called by the connection task on teardown, after the
/// registry entry is removed.
pub fn drain_with_disconnect_error(
    peer_id: PeerId,
    rx: &mut mpsc::UnboundedReceiver<QueuedBlock>,
    pool: &BlockPool,
) -> usize {
    rx.close();

    let mut drained = 0;
    while let Ok(entry) = rx.try_recv() {
        pool.release(entry.block);
        (entry.on_ready)(Err(Error::Connectivity(format!(
            "peer {peer_id} disconnected"
        ))));
        drained += 1;
    }
    drained
}

/// Registry mapping connected peers to their outbound queues.
///
/// A queue exists iff there is a live connection to that peer: insertion on
/// connect, removal on disconnect, lookup on dispatch.
#[derive(Default)]
pub struct PeerQueueRegistry {
    queues: RwLock<HashMap<PeerId, Arc<MessageBlockCompletionQueue>>>,
}

impl PeerQueueRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a peer's queue. A second live connection for the same peer
    /// id supersedes the first (the old queue's consumer will drain on its
    /// own teardown).
    pub fn register(&self, queue: Arc<MessageBlockCompletionQueue>) {
        let peer_id = queue.remote_peer_id();
        let previous = self
            .queues
            .write()
            .expect("queue registry lock")
            .insert(peer_id, queue);

        if previous.is_some() {
            tracing::warn!(peer = %peer_id, "superseding existing peer queue");
        }
    }

    /// Remove on disconnect. Only removes when the registered queue is the
    /// one being torn down, so a superseded connection cannot unregister
    /// its replacement.
    pub fn remove(&self, queue: &Arc<MessageBlockCompletionQueue>) -> bool {
        let mut queues = self.queues.write().expect("queue registry lock");
        match queues.get(&queue.remote_peer_id()) {
            Some(current) if Arc::ptr_eq(current, queue) => {
                queues.remove(&queue.remote_peer_id());
                true
            }
            _ => false,
        }
    }

    /// `None` means "peer not connected".
    pub fn try_get(&self, peer_id: PeerId) -> Option<Arc<MessageBlockCompletionQueue>> {
        self.queues
            .read()
            .expect("queue registry lock")
            .get(&peer_id)
            .cloned()
    }

    pub fn all_active_ids(&self) -> HashSet<PeerId> {
        self.queues
            .read()
            .expect("queue registry lock")
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queues.read().expect("queue registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
