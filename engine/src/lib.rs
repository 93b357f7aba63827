//! An embedded, single-file, persistent B+ tree key-value store.
//!
//! The file is a flat sequence of fixed-size node pages interleaved with an
//! append-only value heap, all drawn from one append cursor. Only the root
//! node lives in memory; everything else is loaded from disk as the tree is
//! descended. There is no locking, no write-ahead log, and no background
//! compaction — callers that need any of those own them at a higher layer.
//!
//! ```
//! use engine::DbManager;
//!
//! let mut db = DbManager::open_in_memory(0, 125).unwrap();
//! db.put(1, b"hello").unwrap();
//! assert_eq!(db.get(1).unwrap(), b"hello");
//! ```

#![cfg_attr(test, allow(clippy::disallowed_methods))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod db_manager;
mod file;
mod file_manager;
mod node;

#[cfg(test)]
mod testing;

pub use db_manager::{DbManager, Error};
pub use file_manager::{BP_NODE_SIZE, DEFAULT_KEYS_PER_NODE};
pub use node::{FileKey, NodeId, INVALID_NODE_ID};
