//! Node-page layout: header fields, the entry bucket, and the binary search
//! and shift primitives that the insert/delete algorithms in `btree.rs` are
//! built from. A node page is a fixed-size byte region; `NodeView` borrows it
//! and interprets it according to a `NodeGeometry`.

use crate::codec::{key_at, to_little_endian};
use crate::geometry::NodeGeometry;

/// Result of a binary search within one node (`findInNode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    pub found: bool,
    /// The slot whose key equals the target if `found`; otherwise the slot
    /// the key would be inserted at.
    pub position: usize,
}

/// A borrowed view over one node page's raw bytes.
pub struct NodeView<'a> {
    pub bytes: &'a mut [u8],
    pub geom: NodeGeometry,
}

impl<'a> NodeView<'a> {
    pub fn new(bytes: &'a mut [u8], geom: NodeGeometry) -> Self {
        NodeView { bytes, geom }
    }

    pub fn level(&self) -> u8 {
        self.bytes[self.geom.c_level_index()]
    }

    pub fn set_level(&mut self, level: u8) {
        self.bytes[self.geom.c_level_index()] = level;
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn c_ent(&self) -> usize {
        self.bytes[self.geom.c_ent_index()] as usize
    }

    pub fn set_c_ent(&mut self, n: usize) {
        self.bytes[self.geom.c_ent_index()] = n as u8;
    }

    pub fn entry_size(&self) -> usize {
        self.geom.entry_size_for_level(self.level())
    }

    pub fn rec_max(&self) -> usize {
        self.geom.rec_max_for_level(self.level())
    }

    /// Converts a logical entry position to its byte offset in the entry
    /// bucket, using this node's own entry size (`nbind`/`lnbind`).
    pub fn bind(&self, position: usize) -> usize {
        position * self.entry_size()
    }

    /// Initialises an empty node at the given level: zeroes the page and
    /// sets the metadata header (`createNode`).
    pub fn init_empty(&mut self, level: u8) {
        self.bytes.fill(0);
        self.set_c_ent(0);
        let (c_ent_max, cb_ent_max) = if level == 0 {
            (self.geom.leaf_max_entries(), self.geom.leaf_entry_size)
        } else {
            (self.geom.max_entries(), self.geom.internal_entry_size)
        };
        self.bytes[self.geom.c_ent_max_index()] = c_ent_max as u8;
        self.bytes[self.geom.cb_ent_max_index()] = cb_ent_max as u8;
        self.set_level(level);
    }

    pub fn key_at_entry(&self, position: usize) -> u64 {
        key_at(self.bytes, self.bind(position), self.geom.key_size)
    }

    pub fn first_key(&self) -> u64 {
        self.key_at_entry(0)
    }

    pub fn entry_at(&self, position: usize) -> &[u8] {
        let idx = self.bind(position);
        &self.bytes[idx..idx + self.entry_size()]
    }

    /// Binary search over the `c_ent` keys (`findInNode`). Ties are
    /// impossible within one node since entries are sorted strictly
    /// ascending.
    pub fn find(&self, key: u64) -> SearchResult {
        if self.c_ent() == 0 {
            return SearchResult {
                found: false,
                position: 0,
            };
        }
        let mut low: isize = 0;
        let mut high: isize = self.c_ent() as isize - 1;
        let mut mid: isize = 0;
        while low <= high {
            mid = (low + high) / 2;
            let buffered_key = self.key_at_entry(mid as usize);
            if key > buffered_key {
                low = mid + 1;
            } else if key < buffered_key {
                high = mid - 1;
            } else {
                return SearchResult {
                    found: true,
                    position: mid as usize,
                };
            }
        }
        debug_assert!(low > high);
        SearchResult {
            found: false,
            position: low as usize,
        }
    }

    /// Shifts entries right by `shift_by` bytes starting at `index`, up to
    /// and including `to_index`, making room for an insertion. Bytes in
    /// `[index, index + shift_by)` are left untouched by the caller.
    fn shift_right(&mut self, index: usize, shift_by: usize, to_index: usize) {
        let mut to = to_index as isize;
        let mut from = to - shift_by as isize;
        while from >= index as isize {
            self.bytes[to as usize] = self.bytes[from as usize];
            to -= 1;
            from -= 1;
        }
    }

    /// Shifts entries left by `shift_by` bytes starting at `index`,
    /// consuming the deleted entry, and zero-fills the vacated tail so the
    /// entry bucket stays left-justified.
    fn shift_left(&mut self, index: usize, shift_by: usize) {
        let bucket = self.geom.node_bucket_size();
        let mut from = index + shift_by;
        let mut to = index;
        while from < bucket {
            self.bytes[to] = self.bytes[from];
            to += 1;
            from += 1;
        }
        while to < bucket {
            self.bytes[to] = 0;
            to += 1;
        }
    }

    /// Inserts `entry` at byte offset `index`, shifting later entries right
    /// and incrementing `c_ent`. Assumes there is room (caller's
    /// responsibility, enforced by the split/overflow checks in `btree.rs`).
    pub fn push_entry_in(&mut self, entry: &[u8], index: usize) {
        let bucket = self.geom.node_bucket_size();
        self.shift_right(index, entry.len(), bucket - 1);
        self.bytes[index..index + entry.len()].copy_from_slice(entry);
        let c_ent = self.c_ent();
        self.set_c_ent(c_ent + 1);
    }

    /// Removes the `entry_size`-byte entry at byte offset `index`.
    pub fn remove_entry_at(&mut self, index: usize, entry_size: usize) {
        self.shift_left(index, entry_size);
        let c_ent = self.c_ent();
        self.set_c_ent(c_ent - 1);
    }

    /// Overwrites the key prefix of the entry at `position`, leaving the
    /// trailing value/child-ref bytes untouched. Used to keep a parent's
    /// separator in sync when a child's leftmost key changes underneath it.
    pub fn set_entry_key(&mut self, position: usize, key: u64) {
        let key_size = self.geom.key_size;
        let idx = self.bind(position);
        let encoded = to_little_endian(key, key_size);
        self.bytes[idx..idx + key_size].copy_from_slice(&encoded);
    }
}

/// Produces an internal entry: a `key_size`-byte little-endian key followed
/// by a big-endian child reference padded/truncated to the remaining bytes.
/// This is the demo dialect's `makeInternalEntry`/`genIntermediateEntry`
/// (see `store.rs` for the trait that lets embedders vary this encoding).
pub fn encode_internal_entry(key: u64, child_ref: u64, geom: &NodeGeometry) -> Vec<u8> {
    let mut entry = to_little_endian(key, geom.key_size);
    let ref_size = geom.internal_entry_size - geom.key_size;
    let ref_bytes = child_ref.to_be_bytes();
    entry.extend_from_slice(&ref_bytes[ref_bytes.len() - ref_size..]);
    entry
}

pub fn decode_child_ref(entry: &[u8], geom: &NodeGeometry) -> u64 {
    let ref_bytes = &entry[geom.key_size..];
    let mut buf = [0u8; 8];
    buf[8 - ref_bytes.len()..].copy_from_slice(ref_bytes);
    u64::from_be_bytes(buf)
}
