//! Block transfer connections — one framed, full-duplex exchange per TLS
//! stream.
//!
//! The connection is generic over the byte stream so the framing state
//! machine runs identically over a `tokio_rustls` stream in production and
//! a plain duplex pipe in tests. Only one command frame is in flight per
//! direction at a time; the frame layout itself lives in
//! `conduit_core::wire`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use conduit_core::wire::{
    BlockType, CommandFrame, ControlCode, FrameData, WireError, FRAME_SIZE,
    PROTOCOL_VERSION_SERVER, PROTOCOL_VERSION_V1,
};
use conduit_core::{BlockPool, DataBlock, Error, PeerId, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::control::ControlToken;

/// POSIX-style error values carried in the frame's `error_code` field.
pub mod error_codes {
    /// ENOENT — chunk does not exist.
    pub const CHUNK_NOT_FOUND: u32 = 2;
    /// ESRCH — target peer is not available.
    pub const TARGET_PEER_NOT_FOUND: u32 = 3;
    /// EIO — unexpected server-side failure.
    pub const SERVER_ERROR: u32 = 5;
    /// EACCES — authorization refused.
    pub const AUTHORIZATION_FAILED: u32 = 13;
}

/// Map an error ack's code back to the error kind it encodes.
pub fn error_from_code(code: u32, frame: &CommandFrame) -> Error {
    match code {
        error_codes::CHUNK_NOT_FOUND => Error::ChunkNotFound(frame.chunk_id),
        error_codes::TARGET_PEER_NOT_FOUND => Error::TargetPeerNotFound(frame.chunk_id.into()),
        error_codes::AUTHORIZATION_FAILED => {
            Error::Authorization("remote peer refused authorization".into())
        }
        other => Error::server_msg(format!("remote peer reported error code {other}")),
    }
}

/// Pick the wire code for an error being reported to the remote side.
pub fn code_for_error(err: &Error) -> u32 {
    match err {
        Error::ChunkNotFound(_) => error_codes::CHUNK_NOT_FOUND,
        Error::TargetPeerNotFound(_) => error_codes::TARGET_PEER_NOT_FOUND,
        Error::Authorization(_) => error_codes::AUTHORIZATION_FAILED,
        _ => error_codes::SERVER_ERROR,
    }
}

// ── Frame stream ─────────────────────────────────────────────────────────────

/// Low-level framing over a duplex byte stream: exact 48-byte headers plus
/// pooled payload blocks.
pub struct FrameStream<S> {
    stream: S,
    pool: Arc<BlockPool>,
    blocks_transferred: Arc<AtomicU64>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameStream<S> {
    pub fn new(stream: S, pool: Arc<BlockPool>) -> Self {
        Self {
            stream,
            pool,
            blocks_transferred: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    /// Monotonic count of payload-carrying frames in either direction.
    /// The handle is shareable across threads.
    pub fn transfer_counter(&self) -> Arc<AtomicU64> {
        self.blocks_transferred.clone()
    }

    /// Read one frame and its payload.
    ///
    /// `Ok(None)` is a clean close: EOF (or a TLS truncation) before the
    /// first header byte. Those are expected on probe connections and
    /// orderly shutdown, and are not errors. EOF anywhere else is a
    /// protocol failure.
    pub async fn read_frame(&mut self) -> Result<Option<(CommandFrame, Option<DataBlock>)>> {
        let mut header = [0u8; FRAME_SIZE];
        let mut filled = 0usize;

        while filled < FRAME_SIZE {
            let n = match self.stream.read(&mut header[filled..]).await {
                Ok(n) => n,
                // rustls surfaces a peer that vanished without close_notify
                // as UnexpectedEof ("short read"); silence it like EOF when
                // no frame was in progress.
                Err(e) if filled == 0 && e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::Protocol(
                    "socket unexpectedly closed or partial data transfer has occurred".into(),
                ));
            }

            filled += n;
        }

        let frame = CommandFrame::decode(&header)?;

        let payload = if frame.chunk_size > 0 {
            let size = frame.chunk_size as usize;
            let mut block = self.pool.acquire_for(size);

            self.stream
                .read_exact(&mut block.buf_mut()[..size])
                .await
                .map_err(|_| {
                    Error::Protocol(
                        "socket unexpectedly closed or partial data transfer has occurred".into(),
                    )
                })?;

            block.set_size(size);

            if let FrameData::BlockInfo {
                protocol_data_offset,
                ..
            } = frame.data
            {
                let offset = protocol_data_offset as usize;
                if offset > size {
                    self.pool.release(block);
                    return Err(Error::Protocol(format!(
                        "protocol data offset {offset} exceeds payload size {size}"
                    )));
                }
                block.set_offset1(offset);
            }

            self.blocks_transferred.fetch_add(1, Ordering::Relaxed);
            Some(block)
        } else {
            None
        };

        Ok(Some((frame, payload)))
    }

    /// Write one frame and its payload as two segments. `frame.chunk_size`
    /// must match the payload length.
    pub async fn write_frame(
        &mut self,
        frame: &CommandFrame,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        let payload_len = payload.map(<[u8]>::len).unwrap_or(0);
        assert_eq!(
            frame.chunk_size as usize, payload_len,
            "frame chunk_size does not match payload length"
        );

        let header = frame.encode()?;
        self.stream.write_all(&header).await?;

        if let Some(payload) = payload {
            self.stream.write_all(payload).await?;
            self.blocks_transferred.fetch_add(1, Ordering::Relaxed);
        }

        self.stream.flush().await?;
        Ok(())
    }

    /// Graceful stream shutdown (sends TLS close_notify on rustls streams).
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Ready,
    Sending,
    Receiving,
    ShuttingDown,
    Closed,
    Canceled,
}

/// A block transfer connection that has completed the version exchange.
///
/// The exchange doubles as identity exchange: the `peer_id` header field of
/// the version frames is how each side learns who it is talking to.
pub struct BlockTransferConnection<S> {
    frames: FrameStream<S>,
    local_peer_id: PeerId,
    remote_peer_id: Option<PeerId>,
    negotiated_version: u32,
    state: ConnectionState,
    token: ControlToken,
    shutdown_invoked: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BlockTransferConnection<S> {
    /// Accepting side: wait for GetProtocolVersion, advertise the server
    /// version, then validate the peer's SetProtocolVersion.
    pub async fn accept(
        stream: S,
        pool: Arc<BlockPool>,
        local_peer_id: PeerId,
        token: ControlToken,
    ) -> Result<Self> {
        let mut conn = Self::new(stream, pool, local_peer_id, token);

        let get = match conn.expect_frame().await? {
            Some(frame) => frame,
            None => return Err(Error::Connectivity("peer closed during handshake".into())),
        };
        if get.cntrl_code != ControlCode::GetProtocolVersion {
            return Err(Error::Protocol(format!(
                "expected GetProtocolVersion, got {:?}",
                get.cntrl_code
            )));
        }
        conn.remote_peer_id = Some(get.peer_id);

        let mut ack = get.ack();
        ack.peer_id = conn.local_peer_id;
        ack.data = FrameData::Value(PROTOCOL_VERSION_SERVER);
        conn.frames.write_frame(&ack, None).await?;

        let set = match conn.expect_frame().await? {
            Some(frame) => frame,
            None => return Err(Error::Connectivity("peer closed during handshake".into())),
        };
        if set.cntrl_code != ControlCode::SetProtocolVersion {
            return Err(Error::Protocol(format!(
                "expected SetProtocolVersion, got {:?}",
                set.cntrl_code
            )));
        }

        let version = match set.data {
            FrameData::Value(v) if (PROTOCOL_VERSION_V1..=PROTOCOL_VERSION_SERVER).contains(&v) => v,
            FrameData::Value(v) => return Err(WireError::UnsupportedVersion(v).into()),
            _ => return Err(Error::Protocol("version frame without version data".into())),
        };

        let mut ack = set.ack();
        ack.peer_id = conn.local_peer_id;
        conn.frames.write_frame(&ack, None).await?;

        conn.negotiated_version = version;
        conn.state = ConnectionState::Ready;
        Ok(conn)
    }

    /// Connecting side: request the server version, then negotiate the
    /// highest version both sides speak.
    pub async fn connect(
        stream: S,
        pool: Arc<BlockPool>,
        local_peer_id: PeerId,
        token: ControlToken,
    ) -> Result<Self> {
        let mut conn = Self::new(stream, pool, local_peer_id, token);

        let get = CommandFrame::value(
            ControlCode::GetProtocolVersion,
            conn.local_peer_id,
            PROTOCOL_VERSION_V1,
        );
        conn.frames.write_frame(&get, None).await?;

        let ack = match conn.expect_frame().await? {
            Some(frame) => frame,
            None => return Err(Error::Connectivity("peer closed during handshake".into())),
        };
        if ack.cntrl_code != ControlCode::GetProtocolVersion || !ack.is_ack() {
            return Err(Error::Protocol("expected GetProtocolVersion ack".into()));
        }
        conn.remote_peer_id = Some(ack.peer_id);

        let server_version = match ack.data {
            FrameData::Value(v) => v,
            _ => return Err(Error::Protocol("version ack without version data".into())),
        };
        let version = server_version.min(PROTOCOL_VERSION_SERVER);
        if version < PROTOCOL_VERSION_V1 {
            return Err(WireError::UnsupportedVersion(server_version).into());
        }

        let set = CommandFrame::value(ControlCode::SetProtocolVersion, conn.local_peer_id, version);
        conn.frames.write_frame(&set, None).await?;

        let ack = match conn.expect_frame().await? {
            Some(frame) => frame,
            None => return Err(Error::Connectivity("peer closed during handshake".into())),
        };
        if ack.cntrl_code != ControlCode::SetProtocolVersion || !ack.is_ack() {
            return Err(Error::Protocol("expected SetProtocolVersion ack".into()));
        }
        if ack.is_err() {
            return Err(error_from_code(ack.error_code, &ack));
        }

        conn.negotiated_version = version;
        conn.state = ConnectionState::Ready;
        Ok(conn)
    }

    fn new(stream: S, pool: Arc<BlockPool>, local_peer_id: PeerId, token: ControlToken) -> Self {
        Self {
            frames: FrameStream::new(stream, pool),
            local_peer_id,
            remote_peer_id: None,
            negotiated_version: 0,
            state: ConnectionState::Handshaking,
            token,
            shutdown_invoked: false,
        }
    }

    /// Identity of the remote side; available once the handshake completed.
    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.remote_peer_id
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn negotiated_version(&self) -> u32 {
        self.negotiated_version
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn blocks_transferred(&self) -> u64 {
        self.frames
            .transfer_counter()
            .load(Ordering::Relaxed)
    }

    pub fn transfer_counter(&self) -> Arc<AtomicU64> {
        self.frames.transfer_counter()
    }

    /// Send one block to `target` and wait for the acknowledgment.
    pub async fn send_block(
        &mut self,
        target_peer_id: PeerId,
        block: &DataBlock,
        block_type: BlockType,
    ) -> Result<()> {
        self.state = ConnectionState::Sending;

        let offset = block.offset1();
        if offset > u16::MAX as usize {
            self.state = ConnectionState::Ready;
            return Err(Error::Protocol(format!(
                "protocol data offset {offset} does not fit the frame"
            )));
        }

        let mut frame = CommandFrame::command(
            ControlCode::Put,
            self.local_peer_id,
            target_peer_id.into(),
            block_type,
        );
        frame.chunk_size = block.size() as u32;
        if let FrameData::BlockInfo {
            protocol_data_offset,
            ..
        } = &mut frame.data
        {
            *protocol_data_offset = offset as u16;
        }

        let result = self.send_and_await_ack(&frame, Some(block.as_slice())).await;
        if result.is_ok() {
            self.state = ConnectionState::Ready;
        }
        result
    }

    async fn send_and_await_ack(
        &mut self,
        frame: &CommandFrame,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        let mut token = self.token.clone();

        let io = async {
            self.frames.write_frame(frame, payload).await?;

            let ack = match self.frames.read_frame().await? {
                Some((ack, payload)) => {
                    if let Some(block) = payload {
                        self.frames.pool.release(block);
                    }
                    ack
                }
                None => {
                    return Err(Error::Connectivity(
                        "peer closed before acknowledgment".into(),
                    ))
                }
            };

            if !ack.is_ack() || ack.cntrl_code != frame.cntrl_code {
                return Err(Error::Protocol(format!(
                    "unexpected reply to {:?}: {:?}",
                    frame.cntrl_code, ack.cntrl_code
                )));
            }
            if ack.is_err() {
                return Err(error_from_code(ack.error_code, &ack));
            }
            Ok(())
        };

        let outcome = tokio::select! {
            result = io => Some(result),
            () = token.canceled() => None,
        };

        match outcome {
            Some(result) => result,
            None => {
                self.state = ConnectionState::Canceled;
                Err(Error::Canceled)
            }
        }
    }

    /// Receive one pushed block, acknowledging it. `Ok(None)` on clean
    /// close or cancellation.
    pub async fn receive_block(&mut self) -> Result<Option<(CommandFrame, DataBlock)>> {
        self.state = ConnectionState::Receiving;
        let mut token = self.token.clone();

        let outcome = tokio::select! {
            result = self.frames.read_frame() => Some(result),
            () = token.canceled() => None,
        };

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                self.state = ConnectionState::Canceled;
                return Ok(None);
            }
        };

        let (frame, payload) = match outcome? {
            Some(pair) => pair,
            None => {
                self.state = ConnectionState::Closed;
                return Ok(None);
            }
        };

        if frame.cntrl_code != ControlCode::Put || frame.is_ack() {
            return Err(Error::Protocol(format!(
                "unexpected frame on receive channel: {:?}",
                frame.cntrl_code
            )));
        }

        let block = payload.unwrap_or_else(|| self.frames.pool().acquire_for(0));

        let mut ack = frame.ack();
        ack.peer_id = self.local_peer_id;
        self.frames.write_frame(&ack, None).await?;

        self.state = ConnectionState::Ready;
        Ok(Some((frame, block)))
    }

    /// Protocol shutdown. Invoked at most once per connection; later calls
    /// are no-ops.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.shutdown_invoked {
            return Ok(());
        }
        self.shutdown_invoked = true;
        self.state = ConnectionState::ShuttingDown;

        let result = self.frames.shutdown().await;
        self.state = ConnectionState::Closed;
        result
    }

    async fn expect_frame(&mut self) -> Result<Option<CommandFrame>> {
        let mut token = self.token.clone();

        let outcome = tokio::select! {
            result = self.frames.read_frame() => Some(result),
            () = token.canceled() => None,
        };

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                self.state = ConnectionState::Canceled;
                return Err(Error::Canceled);
            }
        };

        match outcome? {
            Some((frame, payload)) => {
                if let Some(block) = payload {
                    self.frames.pool.release(block);
                    return Err(Error::Protocol(
                        "unexpected payload on a version frame".into(),
                    ));
                }
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Hand back the underlying frame stream (used by the broker session
    /// loop, which drives frames directly once the handshake is done).
    pub fn into_frames(self) -> FrameStream<S> {
        self.frames
    }
}
