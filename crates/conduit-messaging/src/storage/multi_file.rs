//! One file per chunk: `<root>/chunks/<lowercase-uuid>`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use conduit_core::{ChunkId, DataBlock, Error, Result};
use uuid::Uuid;

use super::ChunkStorage;

pub struct MultiFileChunkStorage {
    root_chunks: PathBuf,
    // Structural mutations only; reads open independent handles.
    mutate: Mutex<()>,
    disposed: AtomicBool,
}

impl MultiFileChunkStorage {
    pub fn open(root: &Path) -> Result<Self> {
        let root_chunks = root.join("chunks");
        fs::create_dir_all(&root_chunks).map_err(|e| {
            Error::server(
                format!("failed to create chunk store root {}", root_chunks.display()),
                e,
            )
        })?;

        Ok(Self {
            root_chunks,
            mutate: Mutex::new(()),
            disposed: AtomicBool::new(false),
        })
    }

    fn chunk_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.root_chunks.join(chunk_id.to_file_name())
    }

    fn check_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::server_msg(
                "using chunk storage object after it has been disposed",
            ));
        }
        Ok(())
    }
}

impl ChunkStorage for MultiFileChunkStorage {
    fn save(&self, _session_id: Uuid, chunk_id: ChunkId, block: &DataBlock) -> Result<()> {
        self.check_not_disposed()?;
        let _guard = self.mutate.lock().expect("chunk store lock");

        // Truncate-or-create: a save over an existing chunk supersedes it.
        fs::write(self.chunk_path(chunk_id), block.as_slice())
            .map_err(|e| Error::server(format!("failed to save chunk {chunk_id}"), e))?;

        tracing::trace!(chunk = %chunk_id, size = block.size(), "chunk saved");
        Ok(())
    }

    fn load(&self, _session_id: Uuid, chunk_id: ChunkId, block: &mut DataBlock) -> Result<()> {
        self.check_not_disposed()?;

        let path = self.chunk_path(chunk_id);

        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ChunkNotFound(chunk_id));
            }
            Err(e) => {
                return Err(Error::server(format!("failed to open chunk {chunk_id}"), e));
            }
        };

        let size = file
            .metadata()
            .map_err(|e| Error::server(format!("failed to stat chunk {chunk_id}"), e))?
            .len() as usize;

        if size > block.capacity() {
            return Err(Error::server_msg(format!(
                "data block capacity is too small: {}; required capacity is {size}",
                block.capacity()
            )));
        }

        file.read_exact(&mut block.buf_mut()[..size])
            .map_err(|e| Error::server(format!("failed to read chunk {chunk_id}"), e))?;

        block.set_size(size);
        block.set_offset1(0);
        Ok(())
    }

    fn remove(&self, _session_id: Uuid, chunk_id: ChunkId) -> Result<()> {
        self.check_not_disposed()?;
        let _guard = self.mutate.lock().expect("chunk store lock");

        let path = self.chunk_path(chunk_id);
        if !path.exists() {
            return Err(Error::ChunkNotFound(chunk_id));
        }

        fs::remove_file(&path)
            .map_err(|e| Error::server(format!("failed to remove chunk {chunk_id}"), e))
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
