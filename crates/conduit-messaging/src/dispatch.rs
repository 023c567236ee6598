//! The broker dispatching backend.
//!
//! Routes each incoming block to the target peer's outbound queue, running
//! it through an optional in-path processing backend first. Whether the
//! processing stage or this dispatcher owns the final send is decided by
//! the stage's `auto_block_dispatching` flag.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conduit_core::{DataBlock, Error, PeerId};
use tokio::sync::oneshot;

use crate::backend::{AcceptorNotify, BackendProcessing, BackendRequest, OperationId, Task};
use crate::queue::{MessageBlockCompletionQueue, PeerQueueRegistry};

pub struct BrokerDispatchingBackend {
    registry: Arc<PeerQueueRegistry>,
    processing: Option<Arc<dyn BackendProcessing>>,
    notify: Option<Arc<dyn AcceptorNotify>>,
    disposed: AtomicBool,
}

impl BrokerDispatchingBackend {
    pub fn new(
        registry: Arc<PeerQueueRegistry>,
        processing: Option<Arc<dyn BackendProcessing>>,
        notify: Option<Arc<dyn AcceptorNotify>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            processing,
            notify,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<PeerQueueRegistry> {
        &self.registry
    }

    /// Inspection surface: all peers with a live queue.
    pub fn all_active_queue_ids(&self) -> HashSet<PeerId> {
        self.registry.all_active_ids()
    }

    pub fn try_get_message_block_completion_queue(
        &self,
        target_peer_id: PeerId,
    ) -> Option<Arc<MessageBlockCompletionQueue>> {
        self.registry.try_get(target_peer_id)
    }

    /// A task that completes once the block is enqueued on the target's
    /// queue and the receiver acknowledged it.
    pub fn create_dispatch_task(&self, target_peer_id: PeerId, block: DataBlock) -> Task {
        let registry = self.registry.clone();

        Box::pin(async move {
            let queue = registry
                .try_get(target_peer_id)
                .ok_or(Error::TargetPeerNotFound(target_peer_id))?;

            let (tx, rx) = oneshot::channel();
            queue.schedule_block(
                target_peer_id,
                block,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );

            match rx.await {
                Ok(result) => result
                    .map(|()| None)
                    .map_err(|e| e.into_server_error("broker backend operation")),
                Err(_) => Err(Error::Connectivity(
                    "dispatch completion channel dropped".into(),
                )),
            }
        })
    }

    /// Hooks into the processing backend; false means "not supported" and
    /// the caller proceeds synchronously.
    pub fn peer_connected_notify(&self, peer_id: PeerId) -> bool {
        self.notify
            .as_ref()
            .map(|n| n.peer_connected_notify(peer_id))
            .unwrap_or(false)
    }

    pub fn peer_disconnected_notify(&self, peer_id: PeerId) -> bool {
        self.notify
            .as_ref()
            .map(|n| n.peer_disconnected_notify(peer_id))
            .unwrap_or(false)
    }
}

impl BackendProcessing for BrokerDispatchingBackend {
    fn create_backend_processing_task(&self, request: BackendRequest) -> Option<Task> {
        if request.operation_id != OperationId::Put {
            // Not our operation; the processing backend may still claim it,
            // otherwise it goes to the async executor wrapper.
            return self
                .processing
                .as_ref()
                .and_then(|p| p.create_backend_processing_task(request));
        }

        let target_peer_id = request.target_peer_id;

        let processing = match &self.processing {
            None => {
                // No inner backend: dispatch directly.
                let block = request.block?;
                return Some(self.create_dispatch_task(target_peer_id, block));
            }
            Some(processing) => processing,
        };

        let processing_task = processing.create_backend_processing_task(request)?;

        if !processing.auto_block_dispatching() {
            // The inner backend owns dispatch; hand its task through.
            return Some(processing_task);
        }

        // Chain: processing first, then dispatch of whatever block the
        // stage handed back.
        let registry = self.registry.clone();
        Some(Box::pin(async move {
            let block = processing_task
                .await
                .map_err(|e| e.into_server_error("broker backend operation"))?;

            let block = match block {
                Some(block) => block,
                None => return Ok(None), // stage consumed (gated) the block
            };

            let queue = registry
                .try_get(target_peer_id)
                .ok_or(Error::TargetPeerNotFound(target_peer_id))?;

            let (tx, rx) = oneshot::channel();
            queue.schedule_block(
                target_peer_id,
                block,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );

            match rx.await {
                Ok(result) => result
                    .map(|()| None)
                    .map_err(|e| e.into_server_error("broker backend operation")),
                Err(_) => Err(Error::Connectivity(
                    "dispatch completion channel dropped".into(),
                )),
            }
        }))
    }

    fn auto_block_dispatching(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        !self.registry.is_empty()
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(processing) = &self.processing {
            processing.dispose();
        }
    }
}
