//! Conduit wire format — the block transfer command frame.
//!
//! These types ARE the protocol. Every field, every size, every reserved
//! byte is part of the wire format; changing anything here is a breaking
//! change for every deployed peer.
//!
//! A connection exchanges fixed 48-byte command frames, each optionally
//! followed by `chunk_size` payload bytes. All integer fields are big-endian
//! on the wire. The raw layout is #[repr(C, packed)] over byte arrays and
//! uses zerocopy derives for safe, allocation-free serialization; there is
//! no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::ids::{ChunkId, PeerId};

/// Exact encoded size of a command frame.
pub const FRAME_SIZE: usize = 48;

/// Hard cap on the payload length that may follow a frame, enforced on both
/// encode and decode.
pub const MAX_CHUNK_SIZE: u32 = 128 * 1024 * 1024;

/// Legacy protocol version every peer starts at.
pub const PROTOCOL_VERSION_V1: u32 = 1;

/// Current protocol version; peers advertise it via SetProtocolVersion.
pub const PROTOCOL_VERSION_V2: u32 = 2;

/// The version this server implementation speaks.
pub const PROTOCOL_VERSION_SERVER: u32 = PROTOCOL_VERSION_V2;

// ── Frame flags ──────────────────────────────────────────────────────────────

/// Acknowledgment frame (sent by the responder to sync command execution).
pub const FLAG_ACK: u16 = 0x0001;

/// A server error occurred; `error_code` carries a POSIX-style value and no
/// payload follows even if one was requested.
pub const FLAG_ERR: u16 = 0x0002;

const FLAGS_KNOWN: u16 = FLAG_ACK | FLAG_ERR;

// ── Block flags (per-command, inside the block-info word) ────────────────────

/// Remove: do not report ChunkNotFound when the chunk is already absent.
pub const BLOCK_FLAG_IGNORE_IF_NOT_FOUND: u8 = 0x01;

const BLOCK_FLAGS_KNOWN: u8 = BLOCK_FLAG_IGNORE_IF_NOT_FOUND;

// ── Control codes ────────────────────────────────────────────────────────────

/// Command selector for a frame. `None` is never valid on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlCode {
    GetProtocolVersion = 1,
    SetProtocolVersion = 2,
    GetDataBlockSize = 3,
    Get = 4,
    Put = 5,
    Remove = 6,
    FlushPeerSessions = 7,
}

impl ControlCode {
    /// Codes 1-3 carry a plain u32 in the data word (a protocol version or
    /// a block size); the data codes carry block info.
    pub fn carries_value(&self) -> bool {
        matches!(
            self,
            ControlCode::GetProtocolVersion
                | ControlCode::SetProtocolVersion
                | ControlCode::GetDataBlockSize
        )
    }
}

impl TryFrom<u16> for ControlCode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        match value {
            1 => Ok(ControlCode::GetProtocolVersion),
            2 => Ok(ControlCode::SetProtocolVersion),
            3 => Ok(ControlCode::GetDataBlockSize),
            4 => Ok(ControlCode::Get),
            5 => Ok(ControlCode::Put),
            6 => Ok(ControlCode::Remove),
            7 => Ok(ControlCode::FlushPeerSessions),
            other => Err(WireError::UnknownControlCode(other)),
        }
    }
}

// ── Block types ──────────────────────────────────────────────────────────────

/// Dispatch lane a block belongs to. Signals which callback (if any) must
/// run before dispatch or as part of the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    /// Ordinary message block routed to the target peer's queue.
    Normal = 0,
    /// Authentication material; runs the authentication callback.
    Authentication = 1,
    /// Server state query; runs the server-state callback.
    ServerState = 2,
    /// Storage-plane block; the chunk id field is a real chunk id.
    TransferOnly = 3,
}

impl TryFrom<u8> for BlockType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(BlockType::Normal),
            1 => Ok(BlockType::Authentication),
            2 => Ok(BlockType::ServerState),
            3 => Ok(BlockType::TransferOnly),
            other => Err(WireError::UnknownBlockType(other)),
        }
    }
}

// ── Raw layout ───────────────────────────────────────────────────────────────

/// On-wire frame layout. Byte arrays only, so there is no padding and no
/// unaligned access; the typed view is `CommandFrame`.
#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct RawFrame {
    cntrl_code: [u8; 2],
    flags: [u8; 2],
    error_code: [u8; 4],
    peer_id: [u8; 16],
    chunk_id: [u8; 16],
    chunk_size: [u8; 4],
    data: [u8; 4],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(RawFrame, [u8; FRAME_SIZE]);

// ── Typed view ───────────────────────────────────────────────────────────────

/// The data word, tagged by the frame's control code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameData {
    /// GetProtocolVersion / SetProtocolVersion (a protocol version) and
    /// GetDataBlockSize (a block size in bytes).
    Value(u32),
    /// All data codes.
    BlockInfo {
        block_type: BlockType,
        block_flags: u8,
        /// Byte offset of the protocol-data section within the payload.
        protocol_data_offset: u16,
    },
}

impl FrameData {
    pub fn block_type(&self) -> Option<BlockType> {
        match self {
            FrameData::BlockInfo { block_type, .. } => Some(*block_type),
            FrameData::Value(_) => None,
        }
    }
}

/// A decoded command frame. Constructed via the builders below or decoded
/// off the wire; `encode` produces exactly [`FRAME_SIZE`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub cntrl_code: ControlCode,
    pub flags: u16,
    pub error_code: u32,
    pub peer_id: PeerId,
    pub chunk_id: ChunkId,
    pub chunk_size: u32,
    pub data: FrameData,
}

impl CommandFrame {
    /// A plain-value frame (version exchange or block-size query).
    pub fn value(code: ControlCode, peer_id: PeerId, value: u32) -> Self {
        debug_assert!(code.carries_value());
        Self {
            cntrl_code: code,
            flags: 0,
            error_code: 0,
            peer_id,
            chunk_id: crate::ids::CHUNK_ID_DEFAULT,
            chunk_size: 0,
            data: FrameData::Value(value),
        }
    }

    /// A data-plane frame with no payload; set `chunk_size` afterwards for
    /// codes that carry one.
    pub fn command(
        code: ControlCode,
        peer_id: PeerId,
        chunk_id: ChunkId,
        block_type: BlockType,
    ) -> Self {
        debug_assert!(!code.carries_value());
        Self {
            cntrl_code: code,
            flags: 0,
            error_code: 0,
            peer_id,
            chunk_id,
            chunk_size: 0,
            data: FrameData::BlockInfo {
                block_type,
                block_flags: 0,
                protocol_data_offset: 0,
            },
        }
    }

    /// The acknowledgment for this frame, echoing code and ids.
    pub fn ack(&self) -> Self {
        let mut ack = *self;
        ack.flags |= FLAG_ACK;
        ack.chunk_size = 0;
        ack
    }

    /// An error acknowledgment carrying a POSIX-style error value.
    pub fn error_ack(&self, error_code: u32) -> Self {
        let mut ack = self.ack();
        ack.flags |= FLAG_ERR;
        ack.error_code = error_code;
        ack
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_err(&self) -> bool {
        self.flags & FLAG_ERR != 0
    }

    /// Serialize to the exact wire form. Fails if the frame violates the
    /// chunk-size cap (the bound is enforced in both directions).
    pub fn encode(&self) -> Result<[u8; FRAME_SIZE], WireError> {
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(WireError::ChunkTooLarge(self.chunk_size));
        }

        let data = match self.data {
            FrameData::Value(value) => value.to_be_bytes(),
            FrameData::BlockInfo {
                block_type,
                block_flags,
                protocol_data_offset,
            } => {
                let offset = protocol_data_offset.to_be_bytes();
                [block_type as u8, block_flags, offset[0], offset[1]]
            }
        };

        let raw = RawFrame {
            cntrl_code: (self.cntrl_code as u16).to_be_bytes(),
            flags: self.flags.to_be_bytes(),
            error_code: self.error_code.to_be_bytes(),
            peer_id: *self.peer_id.as_bytes(),
            chunk_id: *self.chunk_id.as_bytes(),
            chunk_size: self.chunk_size.to_be_bytes(),
            data,
        };

        let mut out = [0u8; FRAME_SIZE];
        out.copy_from_slice(raw.as_bytes());
        Ok(out)
    }

    /// Parse and validate a frame off the wire. Rejects unknown control
    /// codes, unknown flag bits, a data word inconsistent with the control
    /// code, non-zero reserved bits, and over-limit chunk sizes — all
    /// before any payload byte is read.
    pub fn decode(bytes: &[u8; FRAME_SIZE]) -> Result<Self, WireError> {
        let raw = RawFrame::read_from(&bytes[..]).expect("size asserted above");

        let cntrl_code = ControlCode::try_from(u16::from_be_bytes(raw.cntrl_code))?;
        let flags = u16::from_be_bytes(raw.flags);
        let error_code = u32::from_be_bytes(raw.error_code);
        let chunk_size = u32::from_be_bytes(raw.chunk_size);

        if flags & !FLAGS_KNOWN != 0 {
            return Err(WireError::ReservedBitsSet);
        }

        if flags & FLAG_ERR == 0 && error_code != 0 {
            // error_code is the unused field of a non-error frame
            return Err(WireError::ReservedBitsSet);
        }

        if chunk_size > MAX_CHUNK_SIZE {
            return Err(WireError::ChunkTooLarge(chunk_size));
        }

        let data = if cntrl_code.carries_value() {
            FrameData::Value(u32::from_be_bytes(raw.data))
        } else {
            let block_type = BlockType::try_from(raw.data[0])?;
            let block_flags = raw.data[1];

            if block_flags & !BLOCK_FLAGS_KNOWN != 0 {
                return Err(WireError::ReservedBitsSet);
            }

            FrameData::BlockInfo {
                block_type,
                block_flags,
                protocol_data_offset: u16::from_be_bytes([raw.data[2], raw.data[3]]),
            }
        };

        Ok(Self {
            cntrl_code,
            flags,
            error_code,
            peer_id: PeerId::from_bytes(raw.peer_id),
            chunk_id: ChunkId::from_bytes(raw.chunk_id),
            chunk_size,
            data,
        })
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown control code: {0}")]
    UnknownControlCode(u16),

    #[error("unknown block type: 0x{0:02x}")]
    UnknownBlockType(u8),

    #[error("chunk size {0} exceeds maximum {MAX_CHUNK_SIZE}")]
    ChunkTooLarge(u32),

    #[error("reserved bits are non-zero")]
    ReservedBitsSet,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),
}

// ── Tests ────────────────────────────────────────────────────────────────────
