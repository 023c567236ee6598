//! Pooled data blocks — the owned byte buffers that travel the wire.
//!
//! A block's capacity is fixed at allocation; `size` and `offset1` (the
//! parse cursor) move within it. Blocks are recycled through a [`BlockPool`]
//! so steady-state traffic allocates nothing; when the pool runs dry a fresh
//! block is handed out instead of blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Fill byte for secure pools, written across the full capacity on both
/// acquire and release.
pub const SECURE_FILL_BYTE: u8 = b'x';

/// Capacity used by pools unless the caller picks another one.
pub const DEFAULT_BLOCK_CAPACITY: usize = 64 * 1024;

/// An owned byte buffer with framing metadata.
///
/// Invariants: `offset1 <= size <= capacity`. Violations are programmer
/// errors and panic.
#[derive(Debug)]
pub struct DataBlock {
    buf: Vec<u8>,
    size: usize,
    offset1: usize,
}

impl DataBlock {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            size: 0,
            offset1: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        assert!(size <= self.capacity(), "block size exceeds capacity");
        self.size = size;
        if self.offset1 > self.size {
            self.offset1 = self.size;
        }
    }

    /// Parse cursor into the payload.
    pub fn offset1(&self) -> usize {
        self.offset1
    }

    pub fn set_offset1(&mut self, offset: usize) {
        assert!(offset <= self.size, "offset1 exceeds block size");
        self.offset1 = offset;
    }

    /// Zero `size` and `offset1`; contents are left as-is.
    pub fn reset(&mut self) {
        self.size = 0;
        self.offset1 = 0;
    }

    /// The valid payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    /// The full capacity, for reads that fill the block before `set_size`.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Replace contents with `data`; resets the parse cursor.
    pub fn copy_from_slice(&mut self, data: &[u8]) {
        assert!(data.len() <= self.capacity(), "data exceeds block capacity");
        self.buf[..data.len()].copy_from_slice(data);
        self.size = data.len();
        self.offset1 = 0;
    }

    /// Overwrite the full capacity with the secure fill byte.
    pub fn secure_wipe(&mut self) {
        self.buf.fill(SECURE_FILL_BYTE);
    }
}

/// A free-list of equally sized blocks with conservation counters.
///
/// `acquire` never blocks: an empty free list mints a new block. Released
/// blocks whose capacity does not match the pool (oversized one-offs from
/// [`BlockPool::acquire_for`]) are dropped rather than pooled.
pub struct BlockPool {
    block_capacity: usize,
    secure: bool,
    free: Mutex<Vec<DataBlock>>,
    allocated: AtomicU64,
    released: AtomicU64,
}

impl BlockPool {
    pub fn new(block_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            block_capacity,
            secure: false,
            free: Mutex::new(Vec::new()),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    /// A pool whose blocks are filled with [`SECURE_FILL_BYTE`] across their
    /// full capacity on every acquire and release.
    pub fn secure(block_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            block_capacity,
            secure: true,
            free: Mutex::new(Vec::new()),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    pub fn acquire(&self) -> DataBlock {
        let recycled = self.free.lock().expect("pool lock").pop();

        let mut block = recycled.unwrap_or_else(|| DataBlock::with_capacity(self.block_capacity));

        if self.secure {
            block.secure_wipe();
        }

        self.allocated.fetch_add(1, Ordering::Relaxed);
        block
    }

    /// Acquire a block that can hold `size` bytes. Sizes beyond the pool's
    /// block capacity mint a one-off block that will not be recycled.
    pub fn acquire_for(&self, size: usize) -> DataBlock {
        if size <= self.block_capacity {
            return self.acquire();
        }

        self.allocated.fetch_add(1, Ordering::Relaxed);
        let mut block = DataBlock::with_capacity(size);
        if self.secure {
            block.secure_wipe();
        }
        block
    }

    pub fn release(&self, mut block: DataBlock) {
        if self.secure {
            block.secure_wipe();
        }
        block.reset();

        self.released.fetch_add(1, Ordering::Relaxed);

        if block.capacity() == self.block_capacity {
            self.free.lock().expect("pool lock").push(block);
        }
    }

    pub fn blocks_allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn blocks_released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Blocks currently held by callers. Conservation invariant:
    /// `allocated == released + held`.
    pub fn blocks_held(&self) -> u64 {
        self.blocks_allocated() - self.blocks_released()
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().expect("pool lock").len()
    }
}
