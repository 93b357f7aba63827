//! Test-only helpers for building throwaway stores.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::db_manager::{DbManager, Error};

static NEXT_TEST_DB_ID: AtomicU64 = AtomicU64::new(0);

/// Opens an in-memory store with the given configuration.
pub fn new_in_memory_store(value_size: u16, keys_per_node: u16) -> Result<DbManager, Error> {
    DbManager::open_in_memory(value_size, keys_per_node)
}

/// A fresh path under the system temp directory, guaranteed not to already exist.
pub fn temp_db_path() -> PathBuf {
    let id = NEXT_TEST_DB_ID.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!("engine-test-{}-{id}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}
