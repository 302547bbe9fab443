//! The Backing Store and dialect hook contract. `NodeStore` is the capability
//! set an embedder passes to the engine: raw page I/O plus the two hooks
//! whose encoding can vary per on-disk dialect (`make_internal_entry`,
//! `child_ref_of`). This crate ships two implementations: an in-memory store
//! for tests, and `FileNodeStore`, a worked file-backed dialect in the same
//! spirit as `BTreeDriver.py`'s `OwnBTree`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::geometry::NodeGeometry;
use crate::node::{decode_child_ref, encode_internal_entry};

/// The capability set the B-tree engine consumes to specialise itself to a
/// concrete on-disk node dialect. Matches the hook contract one for one:
/// `read_at`/`write_at` are the Backing Store's raw seek/read/write,
/// `allocate_node`/`free_node` are `allocateNode`/`delNodeAllocation`, and
/// `make_internal_entry`/`child_ref_of` are `makeInternalEntry`/`childRefOf`
/// (`readNodeIntoBuffer`/`writeNodeFromBuffer` are provided generically by
/// `BufferPool::load`/`flush` on top of `read_at`/`write_at`).
pub trait NodeStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Reserves a fresh `NodeSize`-byte region and returns its offset. May
    /// extend the store.
    fn allocate_node(&mut self) -> Result<u64>;

    /// Marks the region at `node_ref` free/invalid.
    fn free_node(&mut self, node_ref: u64) -> Result<()>;

    fn make_internal_entry(&self, key: u64, child_ref: u64, geom: &NodeGeometry) -> Vec<u8> {
        encode_internal_entry(key, child_ref, geom)
    }

    fn child_ref_of(&self, entry: &[u8], geom: &NodeGeometry) -> u64 {
        decode_child_ref(entry, geom)
    }
}

/// An in-memory backing store, used by every engine test. Grows on demand;
/// `free_node` is a no-op record-keeping marker since nothing in this crate's
/// test suite needs to detect reuse of a freed region.
pub struct InMemoryStore {
    bytes: Vec<u8>,
    node_size: usize,
    next_alloc: u64,
    pub freed: Vec<u64>,
}

impl InMemoryStore {
    pub fn new(node_size: usize) -> Self {
        InMemoryStore {
            bytes: Vec::new(),
            node_size,
            next_alloc: 0,
            freed: Vec::new(),
        }
    }
}

impl NodeStore for InMemoryStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            bail!("read past end of in-memory store: {end} > {}", self.bytes.len());
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn allocate_node(&mut self) -> Result<u64> {
        let node_ref = self.next_alloc;
        self.next_alloc += self.node_size as u64;
        self.bytes.resize(self.next_alloc as usize, 0);
        Ok(node_ref)
    }

    fn free_node(&mut self, node_ref: u64) -> Result<()> {
        self.freed.push(node_ref);
        Ok(())
    }
}

/// A file-backed dialect matching `BTreeDriver.py`'s `OwnBTree`: a fixed
/// header reserves the first `HEADER_SIZE` bytes for a monotonic bump
/// allocator cursor and the tree's root reference, and `free_node`
/// tombstones the freed region's first 4 bytes rather than reclaiming it
/// (the original never reuses freed node space either).
pub struct FileNodeStore {
    file: File,
    node_size: usize,
}

const HEADER_SIZE: u64 = 16;
const NO_ROOT: u64 = 0;

impl FileNodeStore {
    pub fn open<P: AsRef<Path>>(path: P, node_size: usize) -> Result<Self> {
        let is_new = !path.as_ref().exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .context("opening backing file")?;
        if is_new {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&HEADER_SIZE.to_be_bytes())?;
            file.write_all(&NO_ROOT.to_be_bytes())?;
        }
        Ok(FileNodeStore { file, node_size })
    }

    pub fn read_root_ref(&mut self) -> Result<Option<u64>> {
        let mut buf = [0u8; 8];
        self.file.seek(SeekFrom::Start(8))?;
        self.file.read_exact(&mut buf)?;
        let root_ref = u64::from_be_bytes(buf);
        Ok(if root_ref == NO_ROOT {
            None
        } else {
            Some(root_ref)
        })
    }

    pub fn write_root_ref(&mut self, root_ref: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_all(&root_ref.to_be_bytes())?;
        Ok(())
    }

    fn next_alloc(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn set_next_alloc(&mut self, value: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&value.to_be_bytes())?;
        Ok(())
    }
}

impl NodeStore for FileNodeStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .read_exact(buf)
            .with_context(|| format!("reading {} bytes at offset {offset}", buf.len()))
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .write_all(buf)
            .with_context(|| format!("writing {} bytes at offset {offset}", buf.len()))
    }

    fn allocate_node(&mut self) -> Result<u64> {
        let node_ref = self.next_alloc()?;
        self.set_next_alloc(node_ref + self.node_size as u64)?;
        Ok(node_ref)
    }

    fn free_node(&mut self, node_ref: u64) -> Result<()> {
        log::debug!("tombstoning freed node at offset {node_ref}");
        self.file.seek(SeekFrom::Start(node_ref))?;
        self.file.write_all(&0xFFFF_FFFFu32.to_be_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_allocates_contiguous_nodes() {
        let mut store = InMemoryStore::new(64);
        let a = store.allocate_node().unwrap();
        let b = store.allocate_node().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 64);
    }

    #[test]
    fn in_memory_store_round_trips_bytes() {
        let mut store = InMemoryStore::new(64);
        let node_ref = store.allocate_node().unwrap();
        store.write_at(node_ref, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        store.read_at(node_ref, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn in_memory_store_rejects_out_of_range_read() {
        let mut store = InMemoryStore::new(64);
        let mut buf = [0u8; 4];
        assert!(store.read_at(1000, &mut buf).is_err());
    }

    #[test]
    fn file_store_persists_root_ref_and_allocates_past_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.pst");
        let mut store = FileNodeStore::open(&path, 64).unwrap();
        assert_eq!(store.read_root_ref().unwrap(), None);
        let node_ref = store.allocate_node().unwrap();
        assert_eq!(node_ref, HEADER_SIZE);
        store.write_root_ref(node_ref).unwrap();
        drop(store);

        let mut reopened = FileNodeStore::open(&path, 64).unwrap();
        assert_eq!(reopened.read_root_ref().unwrap(), Some(HEADER_SIZE));
        let next = reopened.allocate_node().unwrap();
        assert_eq!(next, HEADER_SIZE + 64);
    }

    #[test]
    fn file_store_tombstones_freed_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.pst");
        let mut store = FileNodeStore::open(&path, 64).unwrap();
        let node_ref = store.allocate_node().unwrap();
        store.write_at(node_ref, &[0xAA; 64]).unwrap();
        store.free_node(node_ref).unwrap();
        let mut buf = [0u8; 4];
        store.read_at(node_ref, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF, 0xFF, 0xFF]);
    }
}
