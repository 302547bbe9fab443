/// The six page-geometry constants the B-tree engine is parameterised over.
///
/// These fix the byte layout of every node page for a given tree instance; see
/// the node-page layout in the data model. All derived quantities (`recMaxEntries`,
/// `recLeafMaxEntries`, `node_bucket_size`) are computed once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeGeometry {
    pub node_size: usize,
    pub node_entries_size: usize,
    pub node_meta_data: usize,
    pub internal_entry_size: usize,
    pub leaf_entry_size: usize,
    pub key_size: usize,
}

impl NodeGeometry {
    pub fn new(
        node_size: usize,
        node_entries_size: usize,
        node_meta_data: usize,
        internal_entry_size: usize,
        leaf_entry_size: usize,
        key_size: usize,
    ) -> Self {
        assert!(
            (1..=8).contains(&key_size),
            "key_size must fit in a u64 (1..=8 bytes)"
        );
        assert!(
            internal_entry_size > key_size && leaf_entry_size > key_size,
            "entries must hold at least one byte beyond the key"
        );
        assert!(
            node_meta_data + 4 <= node_size,
            "metadata header must fit before the end of the node"
        );
        NodeGeometry {
            node_size,
            node_entries_size,
            node_meta_data,
            internal_entry_size,
            leaf_entry_size,
            key_size,
        }
    }

    /// The recommended fill cap used for split/merge decisions; 90% of the
    /// entry bucket, leaving headroom for a temporary overflow entry.
    pub fn node_bucket_size(&self) -> usize {
        (self.node_entries_size * 9) / 10
    }

    pub fn rec_max_entries(&self) -> usize {
        self.node_bucket_size() / self.internal_entry_size
    }

    pub fn rec_leaf_max_entries(&self) -> usize {
        self.node_bucket_size() / self.leaf_entry_size
    }

    pub fn max_entries(&self) -> usize {
        self.node_entries_size / self.internal_entry_size
    }

    pub fn leaf_max_entries(&self) -> usize {
        self.node_entries_size / self.leaf_entry_size
    }

    /// Minimum entry count a non-root node at the given level must hold.
    pub fn min_entries(&self, level: u8) -> usize {
        let rec_max = if level == 0 {
            self.rec_leaf_max_entries()
        } else {
            self.rec_max_entries()
        };
        (rec_max + 1) / 2
    }

    pub fn c_ent_index(&self) -> usize {
        self.node_meta_data
    }

    pub fn c_ent_max_index(&self) -> usize {
        self.node_meta_data + 1
    }

    pub fn cb_ent_max_index(&self) -> usize {
        self.node_meta_data + 2
    }

    pub fn c_level_index(&self) -> usize {
        self.node_meta_data + 3
    }

    pub fn entry_size_for_level(&self, level: u8) -> usize {
        if level == 0 {
            self.leaf_entry_size
        } else {
            self.internal_entry_size
        }
    }

    pub fn rec_max_for_level(&self, level: u8) -> usize {
        if level == 0 {
            self.rec_leaf_max_entries()
        } else {
            self.rec_max_entries()
        }
    }
}

/// The geometry used by `BTreeDriver.py`'s worked example: a tiny 64-byte node
/// with a 4-byte key, used throughout the concrete test scenarios.
pub fn driver_geometry() -> NodeGeometry {
    NodeGeometry::new(64, 60, 60, 8, 12, 4)
}
