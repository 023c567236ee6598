//! Broker-side connection service loops.
//!
//! A broker listens on two ports: the inbound port, where peers send
//! commands (Put dispatches, storage operations, block-size queries), and
//! the outbound port (inbound + 1), where each accepted connection becomes
//! the push channel for the peer that completed the version exchange on it.
//! The peer queue registry is keyed off outbound connections: a queue
//! exists exactly while its push channel is alive.

use std::sync::Arc;

use conduit_core::wire::{
    BlockType, CommandFrame, ControlCode, FrameData, BLOCK_FLAG_IGNORE_IF_NOT_FOUND,
};
use conduit_core::{BlockPool, DataBlock, Error, PeerId, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::backend::{BackendProcessing, BackendRequest, OperationId};
use crate::control::ControlToken;
use crate::dispatch::BrokerDispatchingBackend;
use crate::executor::AsyncBlockExecutor;
use crate::forwarding::BoxedDuplex;
use crate::queue::{drain_with_disconnect_error, MessageBlockCompletionQueue};
use crate::storage::ChunkStorage;
use crate::transfer::{code_for_error, BlockTransferConnection};

/// Everything a broker session needs to serve commands.
pub struct BrokerSessionContext {
    pub local_peer_id: PeerId,
    pub backend: Arc<BrokerDispatchingBackend>,
    pub storage: Option<Arc<dyn ChunkStorage>>,
    pub executor: Arc<AsyncBlockExecutor>,
    pub pool: Arc<BlockPool>,
}

impl BrokerSessionContext {
    fn storage(&self) -> Result<&Arc<dyn ChunkStorage>> {
        self.storage
            .as_ref()
            .ok_or_else(|| Error::server_msg("no chunk storage is configured"))
    }
}

// ── Inbound: command connections ─────────────────────────────────────────────

/// Serve one inbound (command) connection until the peer disconnects, the
/// token fires, or a protocol fault tears it down.
pub async fn serve_inbound_connection<S>(
    stream: S,
    ctx: Arc<BrokerSessionContext>,
    token: ControlToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn =
        BlockTransferConnection::accept(stream, ctx.pool.clone(), ctx.local_peer_id, token.clone())
            .await?;
    let source_peer_id = conn.remote_peer_id().expect("handshake completed");
    let session_id = Uuid::new_v4();
    let mut frames = conn.into_frames();
    let mut cancel = token.clone();

    tracing::debug!(peer = %source_peer_id, session = %session_id, "inbound session open");

    loop {
        let read = tokio::select! {
            read = frames.read_frame() => read,
            () = cancel.canceled() => break,
        };

        let (frame, payload) = match read {
            Ok(Some(pair)) => pair,
            Ok(None) => break,
            Err(err) => {
                // Frame-level fault: log and tear the connection down.
                tracing::debug!(peer = %source_peer_id, error = %err, "protocol failure");
                return Err(err);
            }
        };

        if frame.is_ack() {
            tracing::debug!(peer = %source_peer_id, "unexpected ack on the command channel");
            return Err(Error::Protocol(
                "acknowledgment frame on the command channel".into(),
            ));
        }

        // Block-size queries are answered from the frame loop itself.
        if frame.cntrl_code == ControlCode::GetDataBlockSize {
            let mut ack = frame.ack();
            ack.peer_id = ctx.local_peer_id;
            ack.data = FrameData::Value(ctx.pool.block_capacity() as u32);
            frames.write_frame(&ack, None).await?;
            continue;
        }

        match handle_command(&ctx, session_id, source_peer_id, &frame, payload).await {
            Ok(reply_payload) => {
                let mut ack = frame.ack();
                ack.peer_id = ctx.local_peer_id;

                match reply_payload {
                    Some(block) => {
                        ack.chunk_size = block.size() as u32;
                        frames.write_frame(&ack, Some(block.as_slice())).await?;
                        ctx.pool.release(block);
                    }
                    None => frames.write_frame(&ack, None).await?,
                }
            }
            Err(err @ Error::Protocol(_)) => {
                tracing::debug!(peer = %source_peer_id, error = %err, "protocol failure");
                return Err(err);
            }
            Err(err) => {
                if err.is_expected() {
                    tracing::trace!(peer = %source_peer_id, error = %err, "command refused");
                } else {
                    tracing::debug!(peer = %source_peer_id, error = %err, "command failed");
                }
                let mut nack = frame.error_ack(code_for_error(&err));
                nack.peer_id = ctx.local_peer_id;
                frames.write_frame(&nack, None).await?;
            }
        }
    }

    tracing::debug!(peer = %source_peer_id, session = %session_id, "inbound session closed");
    Ok(())
}

/// Execute one command frame. The returned block, if any, is the reply
/// payload.
async fn handle_command(
    ctx: &Arc<BrokerSessionContext>,
    session_id: Uuid,
    source_peer_id: PeerId,
    frame: &CommandFrame,
    payload: Option<DataBlock>,
) -> Result<Option<DataBlock>> {
    let block_type = frame.data.block_type();

    let result = match (frame.cntrl_code, block_type) {
        (ControlCode::Put, Some(BlockType::Normal | BlockType::Authentication)) => {
            let block = payload.unwrap_or_else(|| ctx.pool.acquire_for(0));
            let target_peer_id: PeerId = frame.chunk_id.into();

            let request = BackendRequest {
                operation_id: OperationId::Put,
                command_id: crate::backend::CommandId::None,
                session_id,
                chunk_id: frame.chunk_id,
                source_peer_id,
                target_peer_id,
                block: Some(block),
            };

            match ctx.backend.create_backend_processing_task(request) {
                Some(task) => task.await.map(|_| None),
                None => Err(Error::server_msg("put operation was not handled")),
            }
        }

        (ControlCode::Put, Some(BlockType::TransferOnly)) => {
            let block = payload.unwrap_or_else(|| ctx.pool.acquire_for(0));
            let result = ctx
                .storage()
                .and_then(|storage| storage.save(session_id, frame.chunk_id, &block));
            ctx.pool.release(block);
            result.map(|()| None)
        }

        (ControlCode::Get, Some(BlockType::TransferOnly)) => {
            if let Some(block) = payload {
                ctx.pool.release(block);
            }
            let mut block = ctx.pool.acquire();
            match ctx
                .storage()
                .and_then(|storage| storage.load(session_id, frame.chunk_id, &mut block))
            {
                Ok(()) => Ok(Some(block)),
                Err(err) => {
                    ctx.pool.release(block);
                    Err(err)
                }
            }
        }

        (ControlCode::Get, Some(BlockType::ServerState)) => {
            if let Some(block) = payload {
                ctx.pool.release(block);
            }
            let mut state = ctx.executor.acquire_state();
            state.operation_id = OperationId::GetServerState;
            state.session_id = session_id;
            state.source_peer_id = source_peer_id;

            match ctx.executor.execute(&mut state) {
                Ok(()) => {
                    let block = state.take_block();
                    ctx.executor.release_state(state);
                    Ok(block)
                }
                Err(err) => {
                    ctx.executor.release_state(state);
                    Err(err)
                }
            }
        }

        (ControlCode::Remove, Some(BlockType::TransferOnly)) => {
            let ignore_missing = matches!(
                frame.data,
                FrameData::BlockInfo { block_flags, .. }
                    if block_flags & BLOCK_FLAG_IGNORE_IF_NOT_FOUND != 0
            );

            match ctx
                .storage()
                .and_then(|storage| storage.remove(session_id, frame.chunk_id))
            {
                Ok(()) => Ok(None),
                Err(Error::ChunkNotFound(_)) if ignore_missing => Ok(None),
                Err(err) => Err(err),
            }
        }

        // Flushing is a storage hook; a pure dispatch broker acks it as a
        // no-op.
        (ControlCode::FlushPeerSessions, _) => match &ctx.storage {
            Some(storage) => storage.flush_peer_sessions(frame.peer_id).map(|()| None),
            None => Ok(None),
        },

        (code, block_type) => Err(Error::Protocol(format!(
            "unsupported command {code:?} with block type {block_type:?}"
        ))),
    };

    result
}

// ── Outbound: push connections ───────────────────────────────────────────────

/// Serve one outbound (push) connection: register the peer's queue, feed
/// every scheduled block over the wire in order, and drain the backlog with
/// a disconnect error on teardown.
pub async fn serve_outbound_connection<S>(
    stream: S,
    ctx: Arc<BrokerSessionContext>,
    token: ControlToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn =
        BlockTransferConnection::accept(stream, ctx.pool.clone(), ctx.local_peer_id, token.clone())
            .await?;
    let peer_id = conn.remote_peer_id().expect("handshake completed");

    let (queue, mut rx) = MessageBlockCompletionQueue::open(peer_id);
    ctx.backend.registry().register(queue.clone());
    ctx.backend.peer_connected_notify(peer_id);
    tracing::info!(peer = %peer_id, "peer connected");

    let mut cancel = token.clone();
    let result = loop {
        let entry = tokio::select! {
            entry = rx.recv() => entry,
            () = cancel.canceled() => break Ok(()),
        };

        let entry = match entry {
            Some(entry) => entry,
            None => break Ok(()),
        };

        let send = conn
            .send_block(entry.target_peer_id, &entry.block, BlockType::Normal)
            .await;
        ctx.pool.release(entry.block);

        let fatal = matches!(
            send,
            Err(Error::Connectivity(_) | Error::Protocol(_) | Error::Canceled)
        );
        (entry.on_ready)(send);

        if fatal {
            break Ok(());
        }
    };

    ctx.backend.registry().remove(&queue);
    let drained = drain_with_disconnect_error(peer_id, &mut rx, &ctx.pool);
    ctx.backend.peer_disconnected_notify(peer_id);
    let _ = conn.shutdown().await;

    tracing::info!(peer = %peer_id, drained, "peer disconnected");
    result
}

// ── Acceptor ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum ListenerRole {
    Inbound,
    Outbound,
}

/// Accept connections on both broker ports until the token fires. TLS is
/// optional so tests can drive the loops over plain TCP.
pub async fn run_acceptor(
    inbound: TcpListener,
    outbound: TcpListener,
    tls: Option<tokio_rustls::TlsAcceptor>,
    ctx: Arc<BrokerSessionContext>,
    token: ControlToken,
) {
    tokio::join!(
        accept_on(inbound, tls.clone(), ctx.clone(), token.clone(), ListenerRole::Inbound),
        accept_on(outbound, tls, ctx, token, ListenerRole::Outbound),
    );
}

async fn accept_on(
    listener: TcpListener,
    tls: Option<tokio_rustls::TlsAcceptor>,
    ctx: Arc<BrokerSessionContext>,
    token: ControlToken,
    role: ListenerRole,
) {
    let mut cancel = token.clone();

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = cancel.canceled() => return,
        };

        let (tcp, remote) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };

        let tls = tls.clone();
        let ctx = ctx.clone();
        let token = token.clone();

        tokio::spawn(async move {
            let _ = tcp.set_nodelay(true);

            let stream: BoxedDuplex = match tls {
                Some(acceptor) => match acceptor.accept(tcp).await {
                    Ok(stream) => Box::new(stream),
                    Err(err) => {
                        // Browser probes and scanners fail here routinely.
                        tracing::trace!(%remote, error = %err, "TLS accept failed");
                        return;
                    }
                },
                None => Box::new(tcp),
            };

            let served = match role {
                ListenerRole::Inbound => serve_inbound_connection(stream, ctx, token).await,
                ListenerRole::Outbound => serve_outbound_connection(stream, ctx, token).await,
            };

            if let Err(err) = served {
                if err.is_expected() {
                    tracing::trace!(%remote, error = %err, "session ended");
                } else {
                    tracing::debug!(%remote, error = %err, "session failed");
                }
            }
        });
    }
}

pub mod testing {
    //! Small helpers shared by the crate tests and the integration suite.

    use super::*;

    /// Bind two consecutive local ports (inbound, inbound + 1).
    pub async fn bind_port_pair() -> (TcpListener, TcpListener, u16) {
        loop {
            let inbound = TcpListener::bind(("127.0.0.1", 0))
                .await
                .expect("bind inbound");
            let port = inbound.local_addr().expect("local addr").port();

            match TcpListener::bind(("127.0.0.1", port + 1)).await {
                Ok(outbound) => return (inbound, outbound, port),
                Err(_) => continue,
            }
        }
    }
}
