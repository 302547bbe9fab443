//! A disk-backed B-tree engine over fixed-size node pages, parameterised by
//! a small set of geometry constants so it can speak whatever on-disk
//! dialect an embedder's page format requires. The engine owns point
//! lookup, insert, and delete; everything about how pages actually reach
//! disk — allocation policy, free-space tracking, the container file's own
//! header — belongs to the `NodeStore` the embedder supplies.

pub mod btree;
pub mod buffer_pool;
pub mod codec;
pub mod error;
pub mod geometry;
pub mod node;
pub mod store;

pub use btree::{Btree, InsertOutcome, RemoveOutcome};
pub use buffer_pool::{BufferGuard, BufferPool};
pub use error::{BtreeError, Result};
pub use geometry::NodeGeometry;
pub use store::{FileNodeStore, InMemoryStore, NodeStore};
