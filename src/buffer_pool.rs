//! A fixed-cardinality pool of page-sized byte buffers mediating all node
//! I/O. The pool is an arena of reusable page frames, not a cache: there is
//! no identity mapping between buffer index and node reference, and no
//! dirty/clean tracking. The B-tree is responsible for explicit flushes.

use std::collections::VecDeque;

use crate::error::{BtreeError, Result};
use crate::store::NodeStore;

pub struct BufferPool {
    buffers: Vec<Vec<u8>>,
    free_list: VecDeque<usize>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(sections: usize, buffer_size: usize) -> Self {
        BufferPool {
            buffers: (0..sections).map(|_| vec![0u8; buffer_size]).collect(),
            free_list: (0..sections).collect(),
            buffer_size,
        }
    }

    pub fn sections(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Hands out a free buffer index. No ordering guarantee is promised by
    /// the contract, though this pool happens to return the oldest released
    /// buffer first (matching the original's FIFO free-list queue).
    pub fn acquire(&mut self) -> Result<usize> {
        self.free_list.pop_front().ok_or(BtreeError::PoolExhausted {
            sections: self.buffers.len(),
        })
    }

    /// Returns a buffer to the free list. Double-release is caller error and
    /// is not checked for.
    pub fn release(&mut self, index: usize) {
        self.free_list.push_back(index);
    }

    /// Marks all buffers free. Called at the end of every top-level B-tree
    /// operation so no buffer is ever pinned across operations.
    pub fn reset(&mut self) {
        self.free_list.clear();
        self.free_list.extend(0..self.buffers.len());
    }

    pub fn buffer(&self, index: usize) -> &[u8] {
        &self.buffers[index]
    }

    pub fn buffer_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.buffers[index]
    }

    pub fn load<S: NodeStore>(&mut self, store: &mut S, index: usize, offset: u64, len: usize) -> Result<()> {
        if len > self.buffer_size {
            return Err(BtreeError::OverSize {
                len,
                buffer_size: self.buffer_size,
            });
        }
        store
            .read_at(offset, &mut self.buffers[index][..len])
            .map_err(BtreeError::BackingStoreError)
    }

    pub fn flush<S: NodeStore>(&mut self, store: &mut S, index: usize, offset: u64, len: usize) -> Result<()> {
        store
            .write_at(offset, &self.buffers[index][..len])
            .map_err(BtreeError::BackingStoreError)
    }
}

/// Pairs `BufferPool::acquire` with guaranteed `release` on every exit path,
/// including an early `?` return from the recursive insert/delete algorithms.
pub struct BufferGuard {
    pub index: usize,
    released: bool,
}

impl BufferGuard {
    pub fn acquire(pool: &mut BufferPool) -> Result<Self> {
        let index = pool.acquire()?;
        Ok(BufferGuard {
            index,
            released: false,
        })
    }

    /// Releases the buffer early (before the guard drops), useful when a
    /// sibling buffer must be freed mid-function before further recursion.
    pub fn release(mut self, pool: &mut BufferPool) {
        pool.release(self.index);
        self.released = true;
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        if !self.released {
            log::trace!("buffer {} dropped without explicit release", self.index);
        }
    }
}
