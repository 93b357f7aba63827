//! The embedded key-value store: ties [`FileManager`] (bytes) to [`Node`]
//! (structure) and implements descent, lookup, and split-propagating insert.

use std::error::Error as StdError;
use std::fmt;
use std::path::Path;

use crate::file_manager::{FileManager, FileManagerError};
use crate::node::{FileKey, Node, NodeHeader, INVALID_NODE_ID};

/// Errors returned by [`DbManager`] operations.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    FanoutTooLarge { keys_per_node: u16, page_size: u64, required: u64 },
    ConfigMismatch {
        expected_value_size: u16,
        actual_value_size: u16,
        expected_keys_per_node: u16,
        actual_keys_per_node: u16,
    },
    ValueSizeMismatch { expected: u16, actual: usize },
    /// `put` was called with a key that already exists. The tree is left unchanged.
    DuplicateKey(FileKey),
    /// `remove` is not implemented; deletion was out of scope for this engine.
    Unimplemented,
}

impl fmt::Display for Error {
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
            Self::DuplicateKey(key) => write!(f, "key {key} already exists"),
            Self::Unimplemented => write!(f, "remove is not implemented"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FileManagerError> for Error {
    fn from(err: FileManagerError) -> Self {
        match err {
            FileManagerError::Io(err) => Self::Io(err),
            FileManagerError::FanoutTooLarge { keys_per_node, page_size, required } => {
                Self::FanoutTooLarge { keys_per_node, page_size, required }
            }
            FileManagerError::ConfigMismatch {
                expected_value_size,
                actual_value_size,
                expected_keys_per_node,
                actual_keys_per_node,
            } => Self::ConfigMismatch {
                expected_value_size,
                actual_value_size,
                expected_keys_per_node,
                actual_keys_per_node,
            },
            FileManagerError::ValueSizeMismatch { expected, actual } => {
                Self::ValueSizeMismatch { expected, actual }
            }
        }
    }
}

/// An embedded, single-file, persistent B+ tree key-value store.
///
/// Only the root node is kept in memory; every other node is loaded from disk
/// on demand. There is no concurrency and no crash recovery: every mutating
/// call flushes its writes before returning, and the store is meant to be used
/// by a single owner at a time.
pub struct DbManager {
    file_manager: FileManager,
    root: Node,
}

impl DbManager {
    /// Opens a new in-memory store, bootstrapping an empty leaf root.
    pub fn open_in_memory(value_size: u16, keys_per_node: u16) -> Result<Self, Error> {
        let mut file_manager = FileManager::create_in_memory(value_size, keys_per_node)?;
        let root = Self::bootstrap_root(&mut file_manager)?;
        tracing::debug!(value_size, keys_per_node, "opened in-memory store");
        Ok(Self { file_manager, root })
    }

    /// Opens a file-backed store at `path`, creating it (with an empty leaf root)
    /// if it doesn't already exist.
    pub fn open_file(path: &Path, value_size: u16, keys_per_node: u16) -> Result<Self, Error> {
        let (mut file_manager, is_fresh) = FileManager::open_file(path, value_size, keys_per_node)?;
        let root = if is_fresh {
            Self::bootstrap_root(&mut file_manager)?
        } else {
            file_manager.load_node(file_manager.root_offset())?
        };
        tracing::debug!(path = %path.display(), value_size, keys_per_node, is_fresh, "opened store");
        Ok(Self { file_manager, root })
    }

    fn bootstrap_root(file_manager: &mut FileManager) -> Result<Node, Error> {
        let node_id = file_manager.get_next_node_position();
        let root = Node { header: NodeHeader::new_leaf(node_id, INVALID_NODE_ID), keys: Vec::new(), children: Vec::new() };
        file_manager.write_node(&root)?;
        file_manager.update_root_offset(node_id)?;
        tracing::trace!(node_id, "bootstrapped empty leaf root");
        Ok(root)
    }

    /// Writes `node` and, if it is the current root, refreshes the in-memory root copy.
    fn commit_node(&mut self, node: &Node) -> Result<(), Error> {
        self.file_manager.write_node(node)?;
        if node.header.node_id == self.root.header.node_id {
            self.root = node.clone();
        }
        Ok(())
    }

    /// Looks up `key`, returning its value or an empty `Vec` if absent.
    pub fn get(&mut self, key: FileKey) -> Result<Vec<u8>, Error> {
        let mut node = self.root.clone();
        loop {
            if node.header.is_leaf {
                let value_offset = node.find_value(key);
                return Ok(self.file_manager.get_value(value_offset)?);
            }
            let child_id = node.find_child(key);
            node = self.file_manager.load_node(child_id)?;
        }
    }

    /// Inserts `key` with `value`. Fails with [`Error::DuplicateKey`] if `key` is
    /// already present, leaving the tree unchanged.
    pub fn put(&mut self, key: FileKey, value: &[u8]) -> Result<(), Error> {
        let keys_per_node = self.file_manager.keys_per_node();

        // Phase 1: descend, remembering the non-root internal ancestors on the
        // path. The root is handled separately in `propagate_split` (it is
        // always reachable as `self.root`), so it never goes on this trail.
        // Pushing it would leave a stale root copy on the stack for
        // `ancestors.pop()` to return after a root split, instead of `None`
        // falling through to `create_new_root`.
        let mut ancestors: Vec<Node> = Vec::new();
        let mut current = self.root.clone();
        while !current.header.is_leaf {
            let child_id = current.find_child(key);
            if current.header.parent_id != INVALID_NODE_ID {
                ancestors.push(current);
            }
            current = self.file_manager.load_node(child_id)?;
        }
        let mut leaf = current;

        let insert_pos = leaf.find_value_insert_position(key);
        if insert_pos < leaf.keys.len() && leaf.keys[insert_pos] == key {
            return Err(Error::DuplicateKey(key));
        }

        let mut sibling: Option<Node> = None;
        let mut target;

        if leaf.header.num_keys == keys_per_node {
            let mut right = leaf.split_leaf(key);
            let right_id = self.file_manager.get_next_node_position();
            right.header.node_id = right_id;
            right.header.next_leaf = leaf.header.next_leaf;
            leaf.header.next_leaf = right_id;

            if right.header.next_leaf != INVALID_NODE_ID {
                let mut successor_header = self.file_manager.load_node_header(right.header.next_leaf)?;
                successor_header.previous_leaf = right_id;
                self.file_manager.write_node_header(&successor_header)?;
            }

            tracing::debug!(left = leaf.header.node_id, right = right_id, "split leaf");

            let goes_right = key >= right.keys[0];
            if goes_right {
                self.commit_node(&leaf)?;
                target = right.clone();
            } else {
                self.file_manager.write_node(&right)?;
                target = leaf.clone();
            }
            sibling = Some(right);
        } else {
            target = leaf;
        }

        let value_offset = self.file_manager.insert_value(value)?;
        target.insert(key, value_offset);
        self.commit_node(&target)?;

        let Some(first_sibling) = sibling else {
            return Ok(());
        };

        self.propagate_split(first_sibling.keys[0], first_sibling, &mut ancestors)
    }

    /// Bottom-up split propagation: insert `(split_key, new_child)` into the
    /// appropriate ancestor, splitting that ancestor (and walking further up)
    /// as many times as necessary, finally creating a new root if the climb
    /// runs off the top of the tree.
    fn propagate_split(
        &mut self,
        mut split_key: FileKey,
        mut new_child: Node,
        ancestors: &mut Vec<Node>,
    ) -> Result<(), Error> {
        let keys_per_node = self.file_manager.keys_per_node();

        loop {
            let mut parent = if new_child.header.parent_id == self.root.header.node_id {
                self.root.clone()
            } else if let Some(parent) = ancestors.pop() {
                parent
            } else {
                self.create_new_root(split_key, new_child)?;
                return Ok(());
            };

            if parent.header.num_keys < keys_per_node {
                parent.insert(split_key, new_child.header.node_id);
                self.commit_node(&parent)?;
                return Ok(());
            }

            let (mut right, median) = parent.split_parent(split_key, new_child.header.node_id);
            let right_id = self.file_manager.get_next_node_position();
            right.header.node_id = right_id;
            self.file_manager.write_node(&right)?;
            self.commit_node(&parent)?;

            tracing::debug!(left = parent.header.node_id, right = right_id, median, "split internal node");

            split_key = median;
            new_child = right;
        }
    }

    /// Creates a new internal root above the current root, making `new_child`
    /// the right sibling promoted by the most recent split.
    fn create_new_root(&mut self, split_key: FileKey, mut new_child: Node) -> Result<(), Error> {
        let node_id = self.file_manager.get_next_node_position();
        let old_root_id = self.root.header.node_id;

        self.root.header.parent_id = node_id;
        self.file_manager.write_node_header(&self.root.header)?;

        new_child.header.parent_id = node_id;
        self.file_manager.write_node_header(&new_child.header)?;

        let new_root = Node {
            header: NodeHeader {
                node_id,
                is_leaf: false,
                parent_id: INVALID_NODE_ID,
                next_leaf: INVALID_NODE_ID,
                previous_leaf: INVALID_NODE_ID,
                num_keys: 1,
            },
            keys: vec![split_key],
            children: vec![old_root_id, new_child.header.node_id],
        };

        self.file_manager.update_root_offset(node_id)?;
        self.file_manager.write_node(&new_root)?;

        tracing::debug!(node_id, old_root_id, new_child = new_child.header.node_id, split_key, "grew a new root");

        self.root = new_root;
        Ok(())
    }

    /// Not implemented: deletion was out of scope for this engine.
    pub fn remove(&mut self, _key: FileKey) -> Result<(), Error> {
        Err(Error::Unimplemented)
    }
}
