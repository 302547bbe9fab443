//! The B-tree engine: point lookup, insert, and delete over node pages
//! mediated by a `BufferPool`, generic over a `NodeStore` dialect.
//!
//! Insert and delete are written the way the algorithm they're built from is
//! written: a recursive descent that reports back up what changed underneath
//! it rather than holding parent and child pages open at once. Two signals
//! travel upward out of every recursive call:
//!
//! - a **split** (insert) or **underflow** (delete) on the child just visited,
//!   which the parent must repair (insert a new separator entry, or borrow/
//!   merge with a sibling);
//! - a **first-key change**, since every node's own leftmost key doubles as
//!   the separator its parent holds for it — whenever that key moves, the
//!   parent's copy has to move with it, and so on up the chain.

use crate::buffer_pool::{BufferGuard, BufferPool};
use crate::codec::{key_at, to_little_endian};
use crate::error::{BtreeError, Result};
use crate::geometry::NodeGeometry;
use crate::node::NodeView;
use crate::store::NodeStore;

const BUFFER_POOL_SECTIONS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotPresent,
}

/// What a successful recursive insert reports to its caller.
struct PushUp {
    /// The child split; parent must splice in `(separator_key, new_node_ref)`
    /// as a new entry right after the child it descended into, then check
    /// its own capacity.
    split: Option<(u64, u64)>,
    /// This node's own first key is now this value; the parent must rewrite
    /// its separator for this child accordingly.
    first_key_changed: Option<u64>,
}

enum PushResult {
    Duplicate,
    Done(PushUp),
}

struct RemoveStep {
    first_key_changed: Option<u64>,
    /// This node now holds fewer than `min_entries` for its level. Ignored by
    /// the caller when the node in question is the root.
    underflow: bool,
}

enum RemoveResult {
    NotPresent,
    Done(RemoveStep),
}

enum SearchStep {
    Found(Vec<u8>),
    NotFound,
    Descend(u64),
}

/// A disk-backed B-tree over fixed-size node pages, parameterised by a
/// `NodeGeometry` and an embedder-supplied `NodeStore`.
pub struct Btree<S: NodeStore> {
    store: S,
    pool: BufferPool,
    geom: NodeGeometry,
    root_ref: Option<u64>,
}

impl<S: NodeStore> Btree<S> {
    pub fn new(store: S, geom: NodeGeometry, root_ref: Option<u64>) -> Self {
        Btree {
            store,
            pool: BufferPool::new(BUFFER_POOL_SECTIONS, geom.node_size),
            geom,
            root_ref,
        }
    }

    pub fn root_ref(&self) -> Option<u64> {
        self.root_ref
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Allocates and initialises an empty root leaf (`BTreeCreate`). Only
    /// valid on a tree with no root yet.
    pub fn create_empty(&mut self) -> Result<()> {
        let root_ref = self.store.allocate_node().map_err(BtreeError::AllocFailed)?;
        let guard = BufferGuard::acquire(&mut self.pool)?;
        let idx = guard.index;
        {
            let bytes = self.pool.buffer_mut(idx);
            let mut node = NodeView::new(bytes, self.geom);
            node.init_empty(0);
        }
        self.pool.flush(&mut self.store, idx, root_ref, self.geom.node_size)?;
        guard.release(&mut self.pool);
        self.root_ref = Some(root_ref);
        Ok(())
    }

    pub fn search(&mut self, key: u64) -> Result<Option<Vec<u8>>> {
        let root_ref = self.root_ref.ok_or(BtreeError::TreeNotInitialised)?;
        self.pool.reset();
        let geom = self.geom;
        let mut node_ref = root_ref;
        let result = loop {
            let guard = BufferGuard::acquire(&mut self.pool)?;
            let idx = guard.index;
            self.pool.load(&mut self.store, idx, node_ref, geom.node_size)?;
            let step = {
                let bytes = self.pool.buffer_mut(idx);
                let node = NodeView::new(bytes, geom);
                if node.is_leaf() {
                    let sr = node.find(key);
                    if sr.found {
                        SearchStep::Found(node.entry_at(sr.position)[geom.key_size..].to_vec())
                    } else {
                        SearchStep::NotFound
                    }
                } else {
                    let sr = node.find(key);
                    let child_position = descend_position(sr.found, sr.position);
                    let child_ref = self.store.child_ref_of(node.entry_at(child_position), &geom);
                    SearchStep::Descend(child_ref)
                }
            };
            guard.release(&mut self.pool);
            match step {
                SearchStep::Found(value) => break Some(value),
                SearchStep::NotFound => break None,
                SearchStep::Descend(child_ref) => node_ref = child_ref,
            }
        };
        self.pool.reset();
        Ok(result)
    }

    pub fn insert(&mut self, key: u64, value: &[u8]) -> Result<InsertOutcome> {
        let root_ref = self.root_ref.ok_or(BtreeError::TreeNotInitialised)?;
        self.pool.reset();
        let result = self.push_down(root_ref, key, value)?;
        let outcome = match result {
            PushResult::Duplicate => InsertOutcome::Duplicate,
            PushResult::Done(up) => {
                if let Some((promoted_key, new_ref)) = up.split {
                    self.grow_root(root_ref, promoted_key, new_ref)?;
                }
                InsertOutcome::Inserted
            }
        };
        self.pool.reset();
        Ok(outcome)
    }

    pub fn remove(&mut self, key: u64) -> Result<RemoveOutcome> {
        let root_ref = self.root_ref.ok_or(BtreeError::TreeNotInitialised)?;
        self.pool.reset();
        let result = self.rec_remove(root_ref, key)?;
        let outcome = match result {
            RemoveResult::NotPresent => RemoveOutcome::NotPresent,
            RemoveResult::Done(_) => {
                self.collapse_root_if_needed(root_ref)?;
                RemoveOutcome::Removed
            }
        };
        self.pool.reset();
        Ok(outcome)
    }

    // ---- insert -----------------------------------------------------

    fn push_down(&mut self, node_ref: u64, key: u64, value: &[u8]) -> Result<PushResult> {
        let guard = BufferGuard::acquire(&mut self.pool)?;
        let idx = guard.index;
        self.pool.load(&mut self.store, idx, node_ref, self.geom.node_size)?;
        let level = self.pool.buffer(idx)[self.geom.c_level_index()];

        let result = if level == 0 {
            self.push_into_leaf(idx, key, value)?
        } else {
            self.push_into_internal(idx, level, key, value)?
        };

        self.pool.flush(&mut self.store, idx, node_ref, self.geom.node_size)?;
        guard.release(&mut self.pool);
        Ok(result)
    }

    fn push_into_leaf(&mut self, idx: usize, key: u64, value: &[u8]) -> Result<PushResult> {
        let geom = self.geom;
        let expected = geom.leaf_entry_size - geom.key_size;
        if value.len() != expected {
            return Err(BtreeError::BadEntrySize {
                got: value.len(),
                expected,
            });
        }
        let mut entry = to_little_endian(key, geom.key_size);
        entry.extend_from_slice(value);

        let (found, position, has_room, old_first_key) = {
            let bytes = self.pool.buffer_mut(idx);
            let node = NodeView::new(bytes, geom);
            let sr = node.find(key);
            (sr.found, sr.position, node.c_ent() < node.rec_max(), node.first_key())
        };
        if found {
            return Ok(PushResult::Duplicate);
        }

        if has_room {
            let new_first_key = {
                let bytes = self.pool.buffer_mut(idx);
                let mut node = NodeView::new(bytes, geom);
                let off = node.bind(position);
                node.push_entry_in(&entry, off);
                node.first_key()
            };
            let first_key_changed = (new_first_key != old_first_key).then_some(new_first_key);
            return Ok(PushResult::Done(PushUp {
                split: None,
                first_key_changed,
            }));
        }

        let mut all_entries = gather_entries(self.pool.buffer(idx), geom.leaf_entry_size, geom.c_ent_index());
        all_entries.insert(position, entry);
        let (left_first_key, right_first_key, new_ref) = self.split_full_node(idx, 0, all_entries)?;
        let first_key_changed = (left_first_key != old_first_key).then_some(left_first_key);
        Ok(PushResult::Done(PushUp {
            split: Some((right_first_key, new_ref)),
            first_key_changed,
        }))
    }

    fn push_into_internal(&mut self, idx: usize, level: u8, key: u64, value: &[u8]) -> Result<PushResult> {
        let geom = self.geom;
        let (child_position, child_ref, old_first_key) = {
            let bytes = self.pool.buffer_mut(idx);
            let node = NodeView::new(bytes, geom);
            let sr = node.find(key);
            let child_position = descend_position(sr.found, sr.position);
            let child_ref = self.store.child_ref_of(node.entry_at(child_position), &geom);
            (child_position, child_ref, node.first_key())
        };

        let child_result = self.push_down(child_ref, key, value)?;
        let child_up = match child_result {
            PushResult::Duplicate => return Ok(PushResult::Duplicate),
            PushResult::Done(up) => up,
        };

        if let Some(new_key) = child_up.first_key_changed {
            let bytes = self.pool.buffer_mut(idx);
            let mut node = NodeView::new(bytes, geom);
            node.set_entry_key(child_position, new_key);
        }

        if let Some((promoted_key, new_child_ref)) = child_up.split {
            let new_entry = self.store.make_internal_entry(promoted_key, new_child_ref, &geom);
            let insert_position = child_position + 1;
            let has_room = {
                let bytes = self.pool.buffer(idx);
                (bytes[geom.c_ent_index()] as usize) < geom.rec_max_for_level(level)
            };
            if has_room {
                let new_first_key = {
                    let bytes = self.pool.buffer_mut(idx);
                    let mut node = NodeView::new(bytes, geom);
                    let off = node.bind(insert_position);
                    node.push_entry_in(&new_entry, off);
                    node.first_key()
                };
                let first_key_changed = (new_first_key != old_first_key).then_some(new_first_key);
                return Ok(PushResult::Done(PushUp {
                    split: None,
                    first_key_changed,
                }));
            }

            let mut all_entries = gather_entries(self.pool.buffer(idx), geom.internal_entry_size, geom.c_ent_index());
            all_entries.insert(insert_position, new_entry);
            let (left_first_key, right_first_key, new_ref) = self.split_full_node(idx, level, all_entries)?;
            let first_key_changed = (left_first_key != old_first_key).then_some(left_first_key);
            return Ok(PushResult::Done(PushUp {
                split: Some((right_first_key, new_ref)),
                first_key_changed,
            }));
        }

        let new_first_key = key_at(self.pool.buffer(idx), 0, geom.key_size);
        let first_key_changed = (new_first_key != old_first_key).then_some(new_first_key);
        Ok(PushResult::Done(PushUp {
            split: None,
            first_key_changed,
        }))
    }

    /// Splits a full node (`all_entries` already holds the overflowing
    /// entry, `rec_max + 1` entries total): the low half stays at `idx`, the
    /// high half moves to a freshly allocated node. Returns the first key of
    /// each half plus the new node's reference, so the caller can decide
    /// whether its own separator needs rewriting and what to promote.
    fn split_full_node(&mut self, idx: usize, level: u8, mut all_entries: Vec<Vec<u8>>) -> Result<(u64, u64, u64)> {
        let geom = self.geom;
        let rec_max = all_entries.len() - 1;
        let mid = rec_max / 2;
        let right = all_entries.split_off(mid + 1);
        let left = all_entries;

        let new_ref = self.store.allocate_node().map_err(BtreeError::AllocFailed)?;
        let new_guard = BufferGuard::acquire(&mut self.pool)?;
        let new_idx = new_guard.index;
        {
            let bytes = self.pool.buffer_mut(new_idx);
            let mut new_node = NodeView::new(bytes, geom);
            new_node.init_empty(level);
            for (i, e) in right.iter().enumerate() {
                let off = new_node.bind(i);
                new_node.push_entry_in(e, off);
            }
        }
        self.pool.flush(&mut self.store, new_idx, new_ref, geom.node_size)?;
        new_guard.release(&mut self.pool);
        let right_first_key = key_at(&right[0], 0, geom.key_size);

        {
            let bytes = self.pool.buffer_mut(idx);
            let mut node = NodeView::new(bytes, geom);
            node.init_empty(level);
            for (i, e) in left.iter().enumerate() {
                let off = node.bind(i);
                node.push_entry_in(e, off);
            }
        }
        let left_first_key = key_at(self.pool.buffer(idx), 0, geom.key_size);

        Ok((left_first_key, right_first_key, new_ref))
    }

    fn grow_root(&mut self, old_root_ref: u64, promoted_key: u64, new_ref: u64) -> Result<()> {
        let geom = self.geom;
        let (old_first_key, old_level) = {
            let guard = BufferGuard::acquire(&mut self.pool)?;
            let idx = guard.index;
            self.pool.load(&mut self.store, idx, old_root_ref, geom.node_size)?;
            let bytes = self.pool.buffer(idx);
            let level = bytes[geom.c_level_index()];
            let first_key = key_at(bytes, 0, geom.key_size);
            guard.release(&mut self.pool);
            (first_key, level)
        };

        let new_root_ref = self.store.allocate_node().map_err(BtreeError::AllocFailed)?;
        let guard = BufferGuard::acquire(&mut self.pool)?;
        let idx = guard.index;
        {
            let bytes = self.pool.buffer_mut(idx);
            let mut node = NodeView::new(bytes, geom);
            node.init_empty(old_level + 1);
            let left_entry = self.store.make_internal_entry(old_first_key, old_root_ref, &geom);
            let off0 = node.bind(0);
            node.push_entry_in(&left_entry, off0);
            let right_entry = self.store.make_internal_entry(promoted_key, new_ref, &geom);
            let off1 = node.bind(1);
            node.push_entry_in(&right_entry, off1);
        }
        self.pool.flush(&mut self.store, idx, new_root_ref, geom.node_size)?;
        guard.release(&mut self.pool);
        self.root_ref = Some(new_root_ref);
        Ok(())
    }

    // ---- delete -----------------------------------------------------

    fn rec_remove(&mut self, node_ref: u64, key: u64) -> Result<RemoveResult> {
        let guard = BufferGuard::acquire(&mut self.pool)?;
        let idx = guard.index;
        self.pool.load(&mut self.store, idx, node_ref, self.geom.node_size)?;
        let level = self.pool.buffer(idx)[self.geom.c_level_index()];

        let result = if level == 0 {
            self.remove_from_leaf(idx, key)?
        } else {
            self.remove_from_internal(idx, level, key)?
        };

        self.pool.flush(&mut self.store, idx, node_ref, self.geom.node_size)?;
        guard.release(&mut self.pool);
        Ok(result)
    }

    fn remove_from_leaf(&mut self, idx: usize, key: u64) -> Result<RemoveResult> {
        let geom = self.geom;
        let bytes = self.pool.buffer_mut(idx);
        let mut node = NodeView::new(bytes, geom);
        let old_first_key = node.first_key();
        let sr = node.find(key);
        if !sr.found {
            return Ok(RemoveResult::NotPresent);
        }
        let off = node.bind(sr.position);
        node.remove_entry_at(off, geom.leaf_entry_size);
        let c_ent = node.c_ent();
        let first_key_changed = if sr.position == 0 && c_ent > 0 {
            let new_first_key = node.first_key();
            (new_first_key != old_first_key).then_some(new_first_key)
        } else {
            None
        };
        let underflow = c_ent < geom.min_entries(0);
        Ok(RemoveResult::Done(RemoveStep {
            first_key_changed,
            underflow,
        }))
    }

    fn remove_from_internal(&mut self, idx: usize, level: u8, key: u64) -> Result<RemoveResult> {
        let geom = self.geom;
        let (child_position, child_ref, old_first_key) = {
            let bytes = self.pool.buffer_mut(idx);
            let node = NodeView::new(bytes, geom);
            let sr = node.find(key);
            let child_position = descend_position(sr.found, sr.position);
            let child_ref = self.store.child_ref_of(node.entry_at(child_position), &geom);
            (child_position, child_ref, node.first_key())
        };

        let child_step = match self.rec_remove(child_ref, key)? {
            RemoveResult::NotPresent => return Ok(RemoveResult::NotPresent),
            RemoveResult::Done(step) => step,
        };

        if let Some(new_key) = child_step.first_key_changed {
            let bytes = self.pool.buffer_mut(idx);
            let mut node = NodeView::new(bytes, geom);
            node.set_entry_key(child_position, new_key);
        }

        if child_step.underflow {
            self.restore_node(idx, level, child_position)?;
        }

        let (c_ent, new_first_key) = {
            let bytes = self.pool.buffer(idx);
            let c_ent = bytes[geom.c_ent_index()] as usize;
            (c_ent, key_at(bytes, 0, geom.key_size))
        };
        let first_key_changed = (new_first_key != old_first_key).then_some(new_first_key);
        let underflow = c_ent < geom.min_entries(level);
        Ok(RemoveResult::Done(RemoveStep {
            first_key_changed,
            underflow,
        }))
    }

    /// Repairs the underflowing child at `child_position` under parent
    /// `idx`: borrows a single entry from whichever neighbour has a surplus
    /// (left preferred over right), or failing that merges with a neighbour
    /// (left preferred over right), removing the now-empty one and its
    /// parent entry.
    fn restore_node(&mut self, idx: usize, level: u8, child_position: usize) -> Result<()> {
        let geom = self.geom;
        let child_level = level - 1;
        let min_child = geom.min_entries(child_level);

        let (child_ref, left_ref, right_ref) = {
            let bytes = self.pool.buffer_mut(idx);
            let node = NodeView::new(bytes, geom);
            let c_ent = node.c_ent();
            let child_ref = self.store.child_ref_of(node.entry_at(child_position), &geom);
            let left_ref = (child_position > 0)
                .then(|| self.store.child_ref_of(node.entry_at(child_position - 1), &geom));
            let right_ref = (child_position + 1 < c_ent)
                .then(|| self.store.child_ref_of(node.entry_at(child_position + 1), &geom));
            (child_ref, left_ref, right_ref)
        };

        if let Some(left_ref) = left_ref {
            if self.peek_c_ent(left_ref)? > min_child {
                return self.borrow_from_left(idx, level, child_position, child_ref, left_ref);
            }
        }
        if let Some(right_ref) = right_ref {
            if self.peek_c_ent(right_ref)? > min_child {
                return self.borrow_from_right(idx, level, child_position, child_ref, right_ref);
            }
        }
        if let Some(left_ref) = left_ref {
            return self.merge_with_left(idx, level, child_position, child_ref, left_ref);
        }
        if let Some(right_ref) = right_ref {
            return self.merge_with_right(idx, level, child_position, child_ref, right_ref);
        }
        // No sibling at all: child_position is the parent's only entry.
        // Leaves the lone child underfilled; the caller re-reports this
        // node's own underflow, and collapse_root_if_needed handles the case
        // where `idx` itself is the root.
        Ok(())
    }

    fn peek_c_ent(&mut self, node_ref: u64) -> Result<usize> {
        let guard = BufferGuard::acquire(&mut self.pool)?;
        let idx = guard.index;
        self.pool.load(&mut self.store, idx, node_ref, self.geom.node_size)?;
        let c_ent = self.pool.buffer(idx)[self.geom.c_ent_index()] as usize;
        guard.release(&mut self.pool);
        Ok(c_ent)
    }

    fn borrow_from_right(
        &mut self,
        idx: usize,
        level: u8,
        child_position: usize,
        child_ref: u64,
        right_ref: u64,
    ) -> Result<()> {
        let geom = self.geom;
        let entry_size = geom.entry_size_for_level(level - 1);

        let child_guard = BufferGuard::acquire(&mut self.pool)?;
        let child_idx = child_guard.index;
        self.pool.load(&mut self.store, child_idx, child_ref, geom.node_size)?;
        let right_guard = BufferGuard::acquire(&mut self.pool)?;
        let right_idx = right_guard.index;
        self.pool.load(&mut self.store, right_idx, right_ref, geom.node_size)?;

        let borrowed = self.pool.buffer(right_idx)[..entry_size].to_vec();
        {
            let bytes = self.pool.buffer_mut(child_idx);
            let mut child_node = NodeView::new(bytes, geom);
            let off = child_node.bind(child_node.c_ent());
            child_node.push_entry_in(&borrowed, off);
        }
        {
            let bytes = self.pool.buffer_mut(right_idx);
            let mut right_node = NodeView::new(bytes, geom);
            right_node.remove_entry_at(0, entry_size);
        }
        let new_right_first_key = key_at(self.pool.buffer(right_idx), 0, geom.key_size);

        self.pool.flush(&mut self.store, child_idx, child_ref, geom.node_size)?;
        self.pool.flush(&mut self.store, right_idx, right_ref, geom.node_size)?;
        child_guard.release(&mut self.pool);
        right_guard.release(&mut self.pool);

        let bytes = self.pool.buffer_mut(idx);
        let mut node = NodeView::new(bytes, geom);
        node.set_entry_key(child_position + 1, new_right_first_key);
        Ok(())
    }

    fn borrow_from_left(
        &mut self,
        idx: usize,
        level: u8,
        child_position: usize,
        child_ref: u64,
        left_ref: u64,
    ) -> Result<()> {
        let geom = self.geom;
        let entry_size = geom.entry_size_for_level(level - 1);

        let left_guard = BufferGuard::acquire(&mut self.pool)?;
        let left_idx = left_guard.index;
        self.pool.load(&mut self.store, left_idx, left_ref, geom.node_size)?;
        let left_c_ent = self.pool.buffer(left_idx)[geom.c_ent_index()] as usize;
        let borrowed = {
            let off = (left_c_ent - 1) * entry_size;
            self.pool.buffer(left_idx)[off..off + entry_size].to_vec()
        };
        {
            let bytes = self.pool.buffer_mut(left_idx);
            let mut left_node = NodeView::new(bytes, geom);
            let off = left_node.bind(left_c_ent - 1);
            left_node.remove_entry_at(off, entry_size);
        }
        self.pool.flush(&mut self.store, left_idx, left_ref, geom.node_size)?;
        left_guard.release(&mut self.pool);

        let child_guard = BufferGuard::acquire(&mut self.pool)?;
        let child_idx = child_guard.index;
        self.pool.load(&mut self.store, child_idx, child_ref, geom.node_size)?;
        {
            let bytes = self.pool.buffer_mut(child_idx);
            let mut child_node = NodeView::new(bytes, geom);
            child_node.push_entry_in(&borrowed, 0);
        }
        let new_child_first_key = key_at(self.pool.buffer(child_idx), 0, geom.key_size);
        self.pool.flush(&mut self.store, child_idx, child_ref, geom.node_size)?;
        child_guard.release(&mut self.pool);

        let bytes = self.pool.buffer_mut(idx);
        let mut node = NodeView::new(bytes, geom);
        node.set_entry_key(child_position, new_child_first_key);
        Ok(())
    }

    fn merge_with_right(
        &mut self,
        idx: usize,
        level: u8,
        child_position: usize,
        child_ref: u64,
        right_ref: u64,
    ) -> Result<()> {
        let geom = self.geom;
        let entry_size = geom.entry_size_for_level(level - 1);

        let right_guard = BufferGuard::acquire(&mut self.pool)?;
        let right_idx = right_guard.index;
        self.pool.load(&mut self.store, right_idx, right_ref, geom.node_size)?;
        let right_entries = gather_entries(self.pool.buffer(right_idx), entry_size, geom.c_ent_index());
        right_guard.release(&mut self.pool);
        self.store.free_node(right_ref)?;

        let child_guard = BufferGuard::acquire(&mut self.pool)?;
        let child_idx = child_guard.index;
        self.pool.load(&mut self.store, child_idx, child_ref, geom.node_size)?;
        {
            let bytes = self.pool.buffer_mut(child_idx);
            let mut child_node = NodeView::new(bytes, geom);
            let mut pos = child_node.c_ent();
            for e in &right_entries {
                let off = child_node.bind(pos);
                child_node.push_entry_in(e, off);
                pos += 1;
            }
        }
        self.pool.flush(&mut self.store, child_idx, child_ref, geom.node_size)?;
        child_guard.release(&mut self.pool);

        let bytes = self.pool.buffer_mut(idx);
        let mut node = NodeView::new(bytes, geom);
        let off = node.bind(child_position + 1);
        node.remove_entry_at(off, geom.entry_size_for_level(level));
        Ok(())
    }

    fn merge_with_left(
        &mut self,
        idx: usize,
        level: u8,
        child_position: usize,
        child_ref: u64,
        left_ref: u64,
    ) -> Result<()> {
        let geom = self.geom;
        let entry_size = geom.entry_size_for_level(level - 1);

        let child_guard = BufferGuard::acquire(&mut self.pool)?;
        let child_idx = child_guard.index;
        self.pool.load(&mut self.store, child_idx, child_ref, geom.node_size)?;
        let child_entries = gather_entries(self.pool.buffer(child_idx), entry_size, geom.c_ent_index());
        child_guard.release(&mut self.pool);
        self.store.free_node(child_ref)?;

        let left_guard = BufferGuard::acquire(&mut self.pool)?;
        let left_idx = left_guard.index;
        self.pool.load(&mut self.store, left_idx, left_ref, geom.node_size)?;
        {
            let bytes = self.pool.buffer_mut(left_idx);
            let mut left_node = NodeView::new(bytes, geom);
            let mut pos = left_node.c_ent();
            for e in &child_entries {
                let off = left_node.bind(pos);
                left_node.push_entry_in(e, off);
                pos += 1;
            }
        }
        self.pool.flush(&mut self.store, left_idx, left_ref, geom.node_size)?;
        left_guard.release(&mut self.pool);

        let bytes = self.pool.buffer_mut(idx);
        let mut node = NodeView::new(bytes, geom);
        let off = node.bind(child_position);
        node.remove_entry_at(off, geom.entry_size_for_level(level));
        Ok(())
    }

    fn collapse_root_if_needed(&mut self, root_ref: u64) -> Result<()> {
        let geom = self.geom;
        let (level, c_ent) = {
            let guard = BufferGuard::acquire(&mut self.pool)?;
            let idx = guard.index;
            self.pool.load(&mut self.store, idx, root_ref, geom.node_size)?;
            let bytes = self.pool.buffer(idx);
            let level = bytes[geom.c_level_index()];
            let c_ent = bytes[geom.c_ent_index()] as usize;
            guard.release(&mut self.pool);
            (level, c_ent)
        };
        if level == 0 || c_ent != 1 {
            return Ok(());
        }

        let guard = BufferGuard::acquire(&mut self.pool)?;
        let idx = guard.index;
        self.pool.load(&mut self.store, idx, root_ref, geom.node_size)?;
        let child_ref = {
            let bytes = self.pool.buffer_mut(idx);
            let node = NodeView::new(bytes, geom);
            self.store.child_ref_of(node.entry_at(0), &geom)
        };
        guard.release(&mut self.pool);

        self.store.free_node(root_ref)?;
        self.root_ref = Some(child_ref);
        log::debug!("collapsed root {root_ref} into sole child {child_ref}");
        Ok(())
    }
}

/// Given a `findInNode` result, picks the child slot a descent should follow:
/// the matching entry itself if found, otherwise the nearest entry whose key
/// is less than the search key (clamped to 0, which also covers a root whose
/// first entry is a zero-key sentinel).
fn descend_position(found: bool, position: usize) -> usize {
    if found || position == 0 {
        position
    } else {
        position - 1
    }
}

fn gather_entries(bytes: &[u8], entry_size: usize, c_ent_index: usize) -> Vec<Vec<u8>> {
    let c_ent = bytes[c_ent_index] as usize;
    (0..c_ent)
        .map(|i| bytes[i * entry_size..(i + 1) * entry_size].to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::driver_geometry;
    use crate::store::InMemoryStore;

    fn new_tree() -> Btree<InMemoryStore> {
        let geom = driver_geometry();
        let store = InMemoryStore::new(geom.node_size);
        let mut tree = Btree::new(store, geom, None);
        tree.create_empty().unwrap();
        tree
    }

    fn value(v: u8) -> Vec<u8> {
        vec![v; 8]
    }

    /// What a subtree walk confirms about the entries underneath it, used to
    /// assemble the parent's own checks one level up.
    struct WalkResult {
        depth: usize,
        min_key: u64,
        leaf_keys: Vec<u64>,
        /// Leaves in left-to-right order, each as its own key list — lets a
        /// test pin down exactly how a split or merge partitioned entries,
        /// not just that the merged key set came out right.
        leaf_groups: Vec<Vec<u64>>,
    }

    fn load_node<S: NodeStore>(tree: &mut Btree<S>, node_ref: u64) -> Vec<u8> {
        let geom = tree.geom;
        let guard = BufferGuard::acquire(&mut tree.pool).unwrap();
        let idx = guard.index;
        tree.pool.load(&mut tree.store, idx, node_ref, geom.node_size).unwrap();
        let bytes = tree.pool.buffer(idx).to_vec();
        guard.release(&mut tree.pool);
        bytes
    }

    /// Recursively verifies P1 (sorted entries), P2 (separator == child's
    /// min key), P3 (uniform leaf depth), P4 (non-root min fill), and P5
    /// (zero-filled entry-bucket tail), panicking on the first violation.
    fn walk<S: NodeStore>(tree: &mut Btree<S>, node_ref: u64, is_root: bool) -> WalkResult {
        let geom = tree.geom;
        let bytes = load_node(tree, node_ref);
        let level = bytes[geom.c_level_index()];
        let c_ent = bytes[geom.c_ent_index()] as usize;
        let entry_size = geom.entry_size_for_level(level);
        let entries: Vec<(u64, Vec<u8>)> = (0..c_ent)
            .map(|i| {
                let off = i * entry_size;
                (key_at(&bytes, off, geom.key_size), bytes[off..off + entry_size].to_vec())
            })
            .collect();

        for w in entries.windows(2) {
            assert!(w[0].0 < w[1].0, "P1 violated: entries not strictly ascending");
        }
        if !is_root {
            assert!(
                c_ent >= geom.min_entries(level),
                "P4 violated: node at level {level} holds {c_ent} entries, below minimum {}",
                geom.min_entries(level)
            );
        }
        let bucket = geom.node_bucket_size();
        let used = c_ent * entry_size;
        assert!(
            bytes[used..bucket].iter().all(|&b| b == 0),
            "P5 violated: entry bucket tail not zero-filled"
        );

        if level == 0 {
            let leaf_keys: Vec<u64> = entries.iter().map(|(k, _)| *k).collect();
            let min_key = *leaf_keys.first().unwrap_or(&0);
            return WalkResult {
                depth: 0,
                min_key,
                leaf_groups: vec![leaf_keys.clone()],
                leaf_keys,
            };
        }

        let mut leaf_keys = Vec::new();
        let mut leaf_groups = Vec::new();
        let mut child_depth = None;
        for (sep_key, entry) in &entries {
            let child_ref = tree.store.child_ref_of(entry, &geom);
            let child = walk(tree, child_ref, false);
            assert_eq!(
                *sep_key, child.min_key,
                "P2 violated: separator does not match child's min key"
            );
            match child_depth {
                Some(d) => assert_eq!(d, child.depth, "P3 violated: leaf depth not uniform"),
                None => child_depth = Some(child.depth),
            }
            leaf_keys.extend(child.leaf_keys);
            leaf_groups.extend(child.leaf_groups);
        }
        WalkResult {
            depth: child_depth.unwrap() + 1,
            min_key: entries[0].0,
            leaf_keys,
            leaf_groups,
        }
    }

    /// Walks the whole tree from the root, asserting P1-P5 throughout, and
    /// returns the leaves' key lists left-to-right for scenario-specific
    /// shape assertions.
    fn check_invariants<S: NodeStore>(tree: &mut Btree<S>) -> WalkResult {
        let root_ref = tree.root_ref().expect("tree has no root");
        walk(tree, root_ref, true)
    }

    fn root_level<S: NodeStore>(tree: &mut Btree<S>) -> u8 {
        let root_ref = tree.root_ref().expect("tree has no root");
        let geom = tree.geom;
        load_node(tree, root_ref)[geom.c_level_index()]
    }

    #[test]
    fn insert_then_search_round_trips() {
        let mut tree = new_tree();
        assert_eq!(tree.insert(10, &value(1)).unwrap(), InsertOutcome::Inserted);
        assert_eq!(tree.insert(20, &value(2)).unwrap(), InsertOutcome::Inserted);
        assert_eq!(tree.search(10).unwrap(), Some(value(1)));
        assert_eq!(tree.search(20).unwrap(), Some(value(2)));
        assert_eq!(tree.search(30).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut tree = new_tree();
        tree.insert(10, &value(1)).unwrap();
        assert_eq!(tree.insert(10, &value(9)).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(tree.search(10).unwrap(), Some(value(1)));
    }

    #[test]
    fn insert_past_leaf_capacity_splits_the_root() {
        // driver geometry: rec_leaf_max_entries == 4
        let mut tree = new_tree();
        for k in 1..=5u64 {
            assert_eq!(tree.insert(k * 10, &value(k as u8)).unwrap(), InsertOutcome::Inserted);
        }
        // root must now be an internal node with two leaf children
        for k in 1..=5u64 {
            assert_eq!(tree.search(k * 10).unwrap(), Some(value(k as u8)));
        }
        assert_eq!(tree.search(25).unwrap(), None);
        check_invariants(&mut tree);
    }

    #[test]
    fn split_partitions_entries_per_the_case_b_formula() {
        // SPEC_FULL.md §8 S3's worked example claims {0x10,0x20} / {0x30,0x40,0x50},
        // but that contradicts its own §4.7 Case B formula for this exact
        // input (recMax=4, the 5th key lands at pos=4, mid=2, pos>mid): the
        // formula actually yields {0x10,0x20,0x30} / {0x40,0x50}. This pins
        // down what the implemented formula produces rather than the
        // worked example's arithmetic.
        let mut tree = new_tree();
        for k in [0x10u64, 0x20, 0x30, 0x40, 0x50] {
            tree.insert(k, &value(k as u8)).unwrap();
        }
        let result = check_invariants(&mut tree);
        assert_eq!(result.leaf_groups, vec![vec![0x10, 0x20, 0x30], vec![0x40, 0x50]]);
    }

    #[test]
    fn restore_prefers_borrowing_from_the_left_sibling() {
        // Builds a 3-leaf-wide root (A, B, C) where the middle child B
        // underflows while both A and C have surplus entries, then checks
        // the repair borrows from A (the left sibling) rather than C, per
        // the left-before-right preference in restoreNode.
        let mut tree = new_tree();
        for k in [0x10u64, 0x20, 0x30, 0x40, 0x50] {
            tree.insert(k, &value(k as u8)).unwrap();
        }
        // A={0x10,0x20,0x30}, B={0x40,0x50}
        for k in [0x60u64, 0x70, 0x80] {
            tree.insert(k, &value(k as u8)).unwrap();
        }
        // B filled to capacity (4) by 0x60,0x70 then split by 0x80:
        // B={0x40,0x50,0x60}, C={0x70,0x80}
        tree.insert(0x90, &value(0x90)).unwrap();
        // C={0x70,0x80,0x90}; A and C both hold 3 entries (surplus over the
        // leaf minimum of 2), B holds 3 (not yet underflowing).
        let before = check_invariants(&mut tree);
        assert_eq!(
            before.leaf_groups,
            vec![vec![0x10, 0x20, 0x30], vec![0x40, 0x50, 0x60], vec![0x70, 0x80, 0x90]]
        );

        assert_eq!(tree.remove(0x50).unwrap(), RemoveOutcome::Removed); // B -> {0x40,0x60}, still at minimum
        assert_eq!(tree.remove(0x60).unwrap(), RemoveOutcome::Removed); // B -> {0x40}, underflows

        let after = check_invariants(&mut tree);
        assert_eq!(
            after.leaf_groups,
            vec![vec![0x10, 0x20], vec![0x30, 0x40], vec![0x70, 0x80, 0x90]],
            "expected B to borrow 0x30 from the left sibling A, leaving C untouched"
        );
    }

    #[test]
    fn insert_at_front_updates_separators_up_the_chain() {
        let mut tree = new_tree();
        for k in (10..=50).step_by(10) {
            tree.insert(k, &value(k as u8)).unwrap();
        }
        // a key smaller than everything already present becomes the new
        // overall minimum and must propagate as far up as the root needs.
        tree.insert(1, &value(99)).unwrap();
        assert_eq!(tree.search(1).unwrap(), Some(value(99)));
        for k in (10..=50).step_by(10) {
            assert_eq!(tree.search(k).unwrap(), Some(value(k as u8)));
        }
    }

    #[test]
    fn remove_missing_key_reports_not_present() {
        let mut tree = new_tree();
        tree.insert(10, &value(1)).unwrap();
        assert_eq!(tree.remove(99).unwrap(), RemoveOutcome::NotPresent);
    }

    #[test]
    fn remove_shrinks_tree_and_preserves_remaining_keys() {
        let mut tree = new_tree();
        let keys: Vec<u64> = (1..=20).map(|k| k * 10).collect();
        for &k in &keys {
            tree.insert(k, &value((k % 256) as u8)).unwrap();
        }
        for &k in keys.iter().step_by(2) {
            assert_eq!(tree.remove(k).unwrap(), RemoveOutcome::Removed);
        }
        for (i, &k) in keys.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(tree.search(k).unwrap(), None);
            } else {
                assert_eq!(tree.search(k).unwrap(), Some(value((k % 256) as u8)));
            }
        }
        check_invariants(&mut tree);
    }

    #[test]
    fn removing_everything_leaves_an_empty_root() {
        let mut tree = new_tree();
        let keys: Vec<u64> = (1..=12).map(|k| k * 10).collect();
        for &k in &keys {
            tree.insert(k, &value(1)).unwrap();
        }
        for &k in &keys {
            assert_eq!(tree.remove(k).unwrap(), RemoveOutcome::Removed);
        }
        assert!(tree.root_ref().is_some());
        for &k in &keys {
            assert_eq!(tree.search(k).unwrap(), None);
        }
        assert_eq!(root_level(&mut tree), 0, "root must collapse back to a leaf, not stay internal");
        let result = check_invariants(&mut tree);
        assert_eq!(result.leaf_groups, vec![Vec::<u64>::new()], "root leaf must be empty, not merely present");
    }

    #[test]
    fn operations_before_create_empty_report_tree_not_initialised() {
        let geom = driver_geometry();
        let store = InMemoryStore::new(geom.node_size);
        let mut tree = Btree::new(store, geom, None);
        assert!(matches!(
            tree.search(1).unwrap_err(),
            BtreeError::TreeNotInitialised
        ));
    }
}
