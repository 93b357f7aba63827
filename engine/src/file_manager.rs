//! On-disk layout: the database header, node pages, and the value heap.
//!
//! [`FileManager`] is the only thing that knows the byte layout described in
//! the module doc of this crate. Everything above it deals in [`Node`](crate::node::Node)
//! values and raw value blobs.

use std::error::Error as StdError;
use std::fmt;
use std::path::Path;

use crate::file::RandomAccessFile;
use crate::node::{FileKey, FileOffset, Node, NodeHeader, NodeId, INVALID_NODE_ID, NODE_HEADER_SIZE};

/// Fixed size of every node page, including padding.
pub const BP_NODE_SIZE: u64 = 2048;

/// Fixed size of the [`DatabaseHeader`] at the start of the file.
pub const DB_HEADER_SIZE: u64 = 14;

/// Default fanout used when a caller doesn't pick one.
pub const DEFAULT_KEYS_PER_NODE: u16 = 125;

const CURRENT_VERSION: u16 = 1;

/// The 14-byte header at offset 0 of every database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub version: u16,
    /// `0` means variable-length, length-prefixed values.
    pub value_size: u16,
    pub keys_per_node: u16,
    pub root_offset: FileOffset,
}

/// Errors surfaced while translating between [`Node`]s/headers/values and bytes.
#[derive(Debug)]
pub enum FileManagerError {
    Io(std::io::Error),
    /// The fanout requested at open time wouldn't fit in a single node page.
    FanoutTooLarge { keys_per_node: u16, page_size: u64, required: u64 },
    /// An existing database's header disagrees with the caller's configuration.
    ConfigMismatch {
        expected_value_size: u16,
        actual_value_size: u16,
        expected_keys_per_node: u16,
        actual_keys_per_node: u16,
    },
    /// A fixed-width value didn't match the database's configured `value_size`.
    ValueSizeMismatch { expected: u16, actual: usize },
}

impl fmt::Display for FileManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "i/o error: {err}"),
            Self::FanoutTooLarge { keys_per_node, page_size, required } => write!(
                f,
                "keys_per_node={keys_per_node} needs a {required}-byte page but pages are {page_size} bytes"
            ),
            Self::ConfigMismatch {
                expected_value_size,
                actual_value_size,
                expected_keys_per_node,
                actual_keys_per_node,
            } => write!(
                f,
                "database was created with value_size={actual_value_size}, keys_per_node={actual_keys_per_node}, \
                 but was opened with value_size={expected_value_size}, keys_per_node={expected_keys_per_node}"
            ),
            Self::ValueSizeMismatch { expected, actual } => {
                write!(f, "expected a {expected}-byte value, got {actual} bytes")
            }
        }
    }
}

impl StdError for FileManagerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FileManagerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Translates between [`Node`]s, value blobs, and the bytes of the database file.
pub struct FileManager {
    file: RandomAccessFile,
    header: DatabaseHeader,
}

impl FileManager {
    /// Creates a fresh in-memory database. Always returns a database with no root yet;
    /// the caller (`DbManager`) is responsible for bootstrapping one.
    pub fn create_in_memory(value_size: u16, keys_per_node: u16) -> Result<Self, FileManagerError> {
        Self::validate_fanout(keys_per_node)?;
        let mut file = RandomAccessFile::create_memory();
        let header = Self::init_db(&mut file, value_size, keys_per_node)?;
        Ok(Self { file, header })
    }

    /// Opens (creating if absent) a disk-backed database.
    ///
    /// Returns `(manager, is_fresh)`; `is_fresh` tells the caller whether it must
    /// bootstrap an empty root.
    pub fn open_file(path: &Path, value_size: u16, keys_per_node: u16) -> Result<(Self, bool), FileManagerError> {
        Self::validate_fanout(keys_per_node)?;
        if path.exists() {
            let mut file = RandomAccessFile::open_disk(path)?;
            let header = Self::load_db(&mut file, value_size, keys_per_node)?;
            Ok((Self { file, header }, false))
        } else {
            let mut file = RandomAccessFile::create_disk(path)?;
            let header = Self::init_db(&mut file, value_size, keys_per_node)?;
            Ok((Self { file, header }, true))
        }
    }

    fn validate_fanout(keys_per_node: u16) -> Result<(), FileManagerError> {
        let required = u64::from(NODE_HEADER_SIZE as u16)
            + u64::from(keys_per_node) * 8
            + (u64::from(keys_per_node) + 1) * 8;
        if required > BP_NODE_SIZE {
            return Err(FileManagerError::FanoutTooLarge {
                keys_per_node,
                page_size: BP_NODE_SIZE,
                required,
            });
        }
        Ok(())
    }

    fn init_db(
        file: &mut RandomAccessFile,
        value_size: u16,
        keys_per_node: u16,
    ) -> Result<DatabaseHeader, FileManagerError> {
        let header = DatabaseHeader {
            version: CURRENT_VERSION,
            value_size,
            keys_per_node,
            root_offset: INVALID_NODE_ID,
        };
        let offset = file.reserve(DB_HEADER_SIZE);
        debug_assert_eq!(offset, 0, "database header must be the first thing in the file");
        Self::write_header(file, &header)?;
        file.flush()?;
        Ok(header)
    }

    fn load_db(
        file: &mut RandomAccessFile,
        value_size: u16,
        keys_per_node: u16,
    ) -> Result<DatabaseHeader, FileManagerError> {
        let header = Self::read_header(file)?;
        if header.value_size != value_size || header.keys_per_node != keys_per_node {
            return Err(FileManagerError::ConfigMismatch {
                expected_value_size: value_size,
                actual_value_size: header.value_size,
                expected_keys_per_node: keys_per_node,
                actual_keys_per_node: header.keys_per_node,
            });
        }
        Ok(header)
    }

    fn write_header(file: &mut RandomAccessFile, header: &DatabaseHeader) -> Result<(), FileManagerError> {
        file.write_u16(0, header.version)?;
        file.write_u16(2, header.value_size)?;
        file.write_u16(4, header.keys_per_node)?;
        file.write_u64(6, header.root_offset)?;
        Ok(())
    }

    fn read_header(file: &mut RandomAccessFile) -> Result<DatabaseHeader, FileManagerError> {
        Ok(DatabaseHeader {
            version: file.read_u16(0)?,
            value_size: file.read_u16(2)?,
            keys_per_node: file.read_u16(4)?,
            root_offset: file.read_u64(6)?,
        })
    }

    #[must_use]
    pub fn value_size(&self) -> u16 {
        self.header.value_size
    }

    #[must_use]
    pub fn keys_per_node(&self) -> u16 {
        self.header.keys_per_node
    }

    #[must_use]
    pub fn root_offset(&self) -> FileOffset {
        self.header.root_offset
    }

    /// Patches the header's root offset, both in memory and on disk.
    pub fn update_root_offset(&mut self, offset: FileOffset) -> Result<(), FileManagerError> {
        self.header.root_offset = offset;
        self.file.write_u64(6, offset)?;
        self.file.flush()?;
        Ok(())
    }

    /// Reserves space for one node page and returns its offset.
    pub fn get_next_node_position(&mut self) -> NodeId {
        self.file.reserve(BP_NODE_SIZE)
    }

    /// Reserves space for a value of `len` bytes and returns its offset.
    fn get_next_value_position(&mut self, len: u64) -> FileOffset {
        self.file.reserve(len)
    }

    /// Writes `value` to a freshly reserved offset and returns that offset.
    ///
    /// For a variable-length database (`value_size == 0`) the stored blob is
    /// prefixed with a `u32` length, mirroring how [`get_value`](Self::get_value)
    /// strips it back off; this crate has no separate typed facade above the
    /// engine, so `FileManager` takes on that framing duty itself.
    pub fn insert_value(&mut self, value: &[u8]) -> Result<FileOffset, FileManagerError> {
        if self.header.value_size != 0 && value.len() != self.header.value_size as usize {
            return Err(FileManagerError::ValueSizeMismatch {
                expected: self.header.value_size,
                actual: value.len(),
            });
        }

        let blob: Vec<u8> = if self.header.value_size == 0 {
            let mut blob = Vec::with_capacity(4 + value.len());
            blob.extend_from_slice(&(value.len() as u32).to_le_bytes());
            blob.extend_from_slice(value);
            blob
        } else {
            value.to_vec()
        };

        let offset = self.get_next_value_position(blob.len() as u64);
        self.file.write_bytes(offset, &blob)?;
        self.file.flush()?;
        Ok(offset)
    }

    /// Reads the value stored at `offset`. `INVALID_NODE_ID` yields an empty value.
    pub fn get_value(&mut self, offset: FileOffset) -> Result<Vec<u8>, FileManagerError> {
        if offset == INVALID_NODE_ID {
            return Ok(Vec::new());
        }
        if self.header.value_size == 0 {
            let len = self.file.read_u32(offset)?;
            Ok(self.file.read_bytes(offset + 4, len as usize)?)
        } else {
            Ok(self.file.read_bytes(offset, self.header.value_size as usize)?)
        }
    }

    /// Writes just the 35-byte header at `node.node_id`, leaving the rest of the page untouched.
    pub fn write_node_header(&mut self, header: &NodeHeader) -> Result<(), FileManagerError> {
        self.write_header_fields(header.node_id, header)?;
        self.file.flush()?;
        Ok(())
    }

    /// Writes a node's header plus its full key/child arrays, zero-padded to `BP_NODE_SIZE`.
    pub fn write_node(&mut self, node: &Node) -> Result<(), FileManagerError> {
        let offset = node.header.node_id;
        self.write_header_fields(offset, &node.header)?;

        let keys_per_node = self.header.keys_per_node as usize;
        let max_children = keys_per_node + 1;

        let mut keys_offset = offset + NODE_HEADER_SIZE as u64;
        for i in 0..keys_per_node {
            let key = node.keys.get(i).copied().unwrap_or(0);
            self.file.write_u64(keys_offset, key)?;
            keys_offset += 8;
        }

        let mut children_offset = keys_offset;
        for i in 0..max_children {
            let child = node.children.get(i).copied().unwrap_or(INVALID_NODE_ID);
            self.file.write_u64(children_offset, child)?;
            children_offset += 8;
        }

        let used = children_offset - offset;
        debug_assert!(used <= BP_NODE_SIZE, "node page overflowed BP_NODE_SIZE");
        let padding = (BP_NODE_SIZE - used) as usize;
        if padding > 0 {
            self.file.write_bytes(children_offset, &vec![0_u8; padding])?;
        }

        self.file.flush()?;
        Ok(())
    }

    fn write_header_fields(&mut self, offset: NodeId, header: &NodeHeader) -> Result<(), FileManagerError> {
        let mut cursor = offset;
        self.file.write_u64(cursor, header.node_id)?;
        cursor += 8;
        self.file.write_bool(cursor, header.is_leaf)?;
        cursor += 1;
        self.file.write_u64(cursor, header.parent_id)?;
        cursor += 8;
        self.file.write_u64(cursor, header.next_leaf)?;
        cursor += 8;
        self.file.write_u64(cursor, header.previous_leaf)?;
        cursor += 8;
        self.file.write_u16(cursor, header.num_keys)?;
        Ok(())
    }

    /// Reads just the 35-byte header at `offset`.
    pub fn load_node_header(&mut self, offset: FileOffset) -> Result<NodeHeader, FileManagerError> {
        let mut cursor = offset;
        let node_id = self.file.read_u64(cursor)?;
        cursor += 8;
        let is_leaf = self.file.read_bool(cursor)?;
        cursor += 1;
        let parent_id = self.file.read_u64(cursor)?;
        cursor += 8;
        let next_leaf = self.file.read_u64(cursor)?;
        cursor += 8;
        let previous_leaf = self.file.read_u64(cursor)?;
        cursor += 8;
        let num_keys = self.file.read_u16(cursor)?;
        Ok(NodeHeader { node_id, is_leaf, parent_id, next_leaf, previous_leaf, num_keys })
    }

    /// Reads a full node (header, live keys, live children) from `offset`.
    pub fn load_node(&mut self, offset: FileOffset) -> Result<Node, FileManagerError> {
        let header = self.load_node_header(offset)?;
        let keys_per_node = self.header.keys_per_node as usize;
        let num_keys = header.num_keys as usize;

        let keys_start = offset + NODE_HEADER_SIZE as u64;
        let mut keys = Vec::with_capacity(num_keys);
        for i in 0..num_keys {
            keys.push(self.file.read_u64(keys_start + (i as u64) * 8)?);
        }

        let children_start = keys_start + (keys_per_node as u64) * 8;
        let num_children = if header.is_leaf { num_keys } else { num_keys + 1 };
        let mut children = Vec::with_capacity(num_children);
        for i in 0..num_children {
            children.push(self.file.read_u64(children_start + (i as u64) * 8)?);
        }

        Ok(Node { header, keys, children })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn fresh_in_memory_database_starts_without_a_root() {
        let manager = FileManager::create_in_memory(4, 5).unwrap();
        assert_eq!(manager.root_offset(), INVALID_NODE_ID);
        assert_eq!(manager.value_size(), 4);
        assert_eq!(manager.keys_per_node(), 5);
    }

    #[test]
    fn fanout_that_overflows_a_page_is_rejected() {
        let err = FileManager::create_in_memory(4, 300).unwrap_err();
        assert!(matches!(err, FileManagerError::FanoutTooLarge { .. }));
    }

    #[test]
    fn node_round_trips_through_write_and_load() {
        let mut manager = FileManager::create_in_memory(0, 5).unwrap();
        let offset = manager.get_next_node_position();
        let node = Node {
            header: NodeHeader::new_leaf(offset, INVALID_NODE_ID),
            keys: vec![1, 2, 3],
            children: vec![100, 200, 300],
        };
        manager.write_node(&node).unwrap();
        let loaded = manager.load_node(offset).unwrap();
        assert_eq!(loaded, node);
    }

    #[test]
    fn internal_node_keeps_one_extra_child() {
        let mut manager = FileManager::create_in_memory(0, 5).unwrap();
        let offset = manager.get_next_node_position();
        let node = Node {
            header: NodeHeader { node_id: offset, is_leaf: false, parent_id: 0, next_leaf: 0, previous_leaf: 0, num_keys: 2 },
            keys: vec![10, 20],
            children: vec![1, 2, 3],
        };
        manager.write_node(&node).unwrap();
        let loaded = manager.load_node(offset).unwrap();
        assert_eq!(loaded.children, vec![1, 2, 3]);
    }

    #[test]
    fn fixed_width_value_round_trips() {
        let mut manager = FileManager::create_in_memory(4, 5).unwrap();
        let offset = manager.insert_value(b"abcd").unwrap();
        assert_eq!(manager.get_value(offset).unwrap(), b"abcd");
    }

    #[test]
    fn variable_width_value_round_trips() {
        let mut manager = FileManager::create_in_memory(0, 5).unwrap();
        let offset = manager.insert_value(b"hello").unwrap();
        assert_eq!(manager.get_value(offset).unwrap(), b"hello");
    }

    #[test]
    fn fixed_width_value_of_wrong_length_is_rejected() {
        let mut manager = FileManager::create_in_memory(4, 5).unwrap();
        let err = manager.insert_value(b"too long").unwrap_err();
        assert!(matches!(err, FileManagerError::ValueSizeMismatch { expected: 4, actual: 8 }));
    }

    #[test]
    fn invalid_offset_reads_as_empty_value() {
        let mut manager = FileManager::create_in_memory(4, 5).unwrap();
        assert_eq!(manager.get_value(INVALID_NODE_ID).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn reopening_with_different_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mismatch.db");
        let (manager, is_fresh) = FileManager::open_file(&path, 4, 5).unwrap();
        assert!(is_fresh);
        drop(manager);
        let err = FileManager::open_file(&path, 8, 5).unwrap_err();
        assert!(matches!(err, FileManagerError::ConfigMismatch { .. }));
    }

    #[test]
    fn reopening_an_existing_file_is_not_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        let (manager, is_fresh) = FileManager::open_file(&path, 4, 5).unwrap();
        assert!(is_fresh);
        drop(manager);
        let (_manager, is_fresh) = FileManager::open_file(&path, 4, 5).unwrap();
        assert!(!is_fresh);
    }
}
