//! Single-file chunk store: `<root>/chunks/data.bin`, an append-only log of
//! (header, payload) records.
//!
//! A save marks any prior live record for the chunk id as DELETED by
//! rewriting its header in place, then appends a fresh record at
//! end-of-file. On open the file is scanned once to rebuild the in-memory
//! map of live records; the scanner validates that each header's recorded
//! position matches the cursor and that every record fits the file. A
//! format violation means the store cannot be trusted at all and aborts the
//! process with a diagnostic.
//!
//! There is no fsync discipline: crash durability is explicitly not
//! promised, the open-scan is the recovery mechanism.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use conduit_core::{ChunkId, DataBlock, Error, Result};
use static_assertions::assert_eq_size;
use uuid::Uuid;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::ChunkStorage;

const RECORD_FLAG_DELETED: u32 = 0x1;

/// On-disk record header. Little-endian integers, 40 bytes.
#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct RecordHeader {
    chunk_id: [u8; 16],
    /// Byte offset of this header within the file.
    pos: [u8; 8],
    /// Payload bytes following the header.
    size: [u8; 8],
    flags: [u8; 4],
    reserved: [u8; 4],
}

assert_eq_size!(RecordHeader, [u8; 40]);

const HEADER_SIZE: u64 = 40;

impl RecordHeader {
    fn new(chunk_id: ChunkId, pos: u64, size: u64, flags: u32) -> Self {
        Self {
            chunk_id: *chunk_id.as_bytes(),
            pos: pos.to_le_bytes(),
            size: size.to_le_bytes(),
            flags: flags.to_le_bytes(),
            reserved: [0u8; 4],
        }
    }

    fn pos(&self) -> u64 {
        u64::from_le_bytes(self.pos)
    }

    fn size(&self) -> u64 {
        u64::from_le_bytes(self.size)
    }

    fn flags(&self) -> u32 {
        u32::from_le_bytes(self.flags)
    }
}

/// A live record as tracked in memory.
#[derive(Debug, Clone, Copy)]
struct LiveRecord {
    header_pos: u64,
    size: u64,
}

struct SingleFileState {
    file: Option<fs::File>,
    active: HashMap<ChunkId, LiveRecord>,
    disposed: bool,
}

pub struct SingleFileChunkStorage {
    file_path: PathBuf,
    state: Mutex<SingleFileState>,
}

impl SingleFileChunkStorage {
    pub fn open(root: &Path) -> Result<Self> {
        let root_chunks = root.join("chunks");
        fs::create_dir_all(&root_chunks).map_err(|e| {
            Error::server(
                format!("failed to create chunk store root {}", root_chunks.display()),
                e,
            )
        })?;

        let file_path = root_chunks.join("data.bin");
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file_path)
            .map_err(|e| {
                Error::server(format!("failed to open {}", file_path.display()), e)
            })?;

        let active = Self::scan(&file_path, &mut file)?;

        Ok(Self {
            file_path,
            state: Mutex::new(SingleFileState {
                file: Some(file),
                active,
                disposed: false,
            }),
        })
    }

    /// Rebuild the live-record map from the log. I/O failures surface as
    /// errors; structural violations abort the process.
    fn scan(path: &Path, file: &mut fs::File) -> Result<HashMap<ChunkId, LiveRecord>> {
        let len = file
            .metadata()
            .map_err(|e| Error::server(format!("failed to stat {}", path.display()), e))?
            .len();

        let mut active = HashMap::new();
        if len == 0 {
            return Ok(active);
        }

        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::server("failed to seek chunk store file", e))?;

        let mut pos = 0u64;
        while pos < len {
            format_invariant(path, pos + HEADER_SIZE <= len);

            let mut bytes = [0u8; HEADER_SIZE as usize];
            file.read_exact(&mut bytes)
                .map_err(|e| Error::server("failed to read chunk store header", e))?;
            let header = RecordHeader::read_from(&bytes[..]).expect("size asserted above");

            format_invariant(path, header.pos() == pos);

            pos += HEADER_SIZE;

            let size = header.size();
            if size > 0 {
                format_invariant(path, pos + size <= len);
                pos += size;
                file.seek(SeekFrom::Start(pos))
                    .map_err(|e| Error::server("failed to seek chunk store file", e))?;
            }

            if header.flags() & RECORD_FLAG_DELETED == 0 {
                active.insert(
                    ChunkId::from_bytes(header.chunk_id),
                    LiveRecord {
                        header_pos: header.pos(),
                        size,
                    },
                );
            }
        }

        Ok(active)
    }

    /// Mark the live record for `chunk_id` DELETED in place and drop it
    /// from the map.
    fn remove_locked(
        state: &mut SingleFileState,
        chunk_id: ChunkId,
        error_if_missing: bool,
    ) -> Result<()> {
        let record = match state.active.get(&chunk_id).copied() {
            Some(record) => record,
            None => {
                if error_if_missing {
                    return Err(Error::ChunkNotFound(chunk_id));
                }
                return Ok(());
            }
        };

        let file = state.file.as_mut().expect("checked not disposed");
        let header = RecordHeader::new(
            chunk_id,
            record.header_pos,
            record.size,
            RECORD_FLAG_DELETED,
        );

        file.seek(SeekFrom::Start(record.header_pos))
            .map_err(|e| Error::server("failed to seek chunk store file", e))?;
        file.write_all(header.as_bytes())
            .map_err(|e| Error::server("failed to rewrite chunk store header", e))?;

        state.active.remove(&chunk_id);
        Ok(())
    }

    fn lock_live(&self) -> Result<std::sync::MutexGuard<'_, SingleFileState>> {
        let state = self.state.lock().expect("chunk store lock");
        if state.disposed {
            return Err(Error::server_msg(
                "using chunk storage object after it has been disposed",
            ));
        }
        Ok(state)
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.state.lock().expect("chunk store lock").active.len()
    }
}

fn format_invariant(path: &Path, cond: bool) {
    if !cond {
        tracing::error!(file = %path.display(), "the chunk store file format is invalid");
        eprintln!(
            "fatal: the chunk store file format of {} is invalid",
            path.display()
        );
        std::process::abort();
    }
}

impl ChunkStorage for SingleFileChunkStorage {
    fn save(&self, _session_id: Uuid, chunk_id: ChunkId, block: &DataBlock) -> Result<()> {
        let mut state = self.lock_live()?;

        Self::remove_locked(&mut state, chunk_id, false)?;

        let file = state.file.as_mut().expect("checked not disposed");
        let end = file
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::server("failed to seek chunk store file", e))?;

        let header = RecordHeader::new(chunk_id, end, block.size() as u64, 0);
        file.write_all(header.as_bytes())
            .map_err(|e| Error::server("failed to append chunk store header", e))?;
        if block.size() > 0 {
            file.write_all(block.as_slice())
                .map_err(|e| Error::server("failed to append chunk payload", e))?;
        }

        let inserted = state
            .active
            .insert(
                chunk_id,
                LiveRecord {
                    header_pos: end,
                    size: block.size() as u64,
                },
            )
            .is_none();
        debug_assert!(inserted, "prior record must have been marked deleted");

        tracing::trace!(chunk = %chunk_id, size = block.size(), file_pos = end, "chunk appended");
        Ok(())
    }

    fn load(&self, _session_id: Uuid, chunk_id: ChunkId, block: &mut DataBlock) -> Result<()> {
        let mut state = self.lock_live()?;

        let record = state
            .active
            .get(&chunk_id)
            .copied()
            .ok_or(Error::ChunkNotFound(chunk_id))?;

        let size = record.size as usize;
        if size > block.capacity() {
            return Err(Error::server_msg(format!(
                "data block capacity is too small: {}; required capacity is {size}",
                block.capacity()
            )));
        }

        let file = state.file.as_mut().expect("checked not disposed");
        file.seek(SeekFrom::Start(record.header_pos + HEADER_SIZE))
            .map_err(|e| Error::server("failed to seek chunk store file", e))?;
        file.read_exact(&mut block.buf_mut()[..size])
            .map_err(|e| Error::server(format!("failed to read chunk {chunk_id}"), e))?;

        block.set_size(size);
        block.set_offset1(0);
        Ok(())
    }

    fn remove(&self, _session_id: Uuid, chunk_id: ChunkId) -> Result<()> {
        let mut state = self.lock_live()?;
        Self::remove_locked(&mut state, chunk_id, true)
    }

    fn dispose(&self) {
        let mut state = self.state.lock().expect("chunk store lock");
        if state.disposed {
            return;
        }
        state.file = None;
        state.disposed = true;
        tracing::trace!(file = %self.file_path.display(), "chunk store disposed");
    }
}
