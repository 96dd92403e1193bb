use std::fmt;
use std::path::{Path, PathBuf};
use bytes::Bytes;
use serde::{Serialize, Deserialize};
use crate::core::error::Result;

/// Name of one ordered key-value tree: container prefix plus index identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeName {
    pub base_dn: String,
    pub index_id: String,
}

impl TreeName {
    pub fn new(base_dn: &str, index_id: &str) -> Self {
        TreeName {
            base_dn: base_dn.to_string(),
            index_id: index_id.to_string(),
        }
    }

    /// Same index under another container prefix
    pub fn with_base(&self, base_dn: &str) -> TreeName {
        TreeName::new(base_dn, &self.index_id)
    }
}

impl fmt::Display for TreeName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.base_dn, self.index_id)
    }
}

/// Read access to committed (or transaction-local) tree content
pub trait ReadableTransaction {
    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>>;

    /// First record whose key is >= `key` (or > `key` when not inclusive)
    fn ceiling(&self, tree: &TreeName, key: &[u8], inclusive: bool) -> Result<Option<(Bytes, Bytes)>>;

    fn last(&self, tree: &TreeName) -> Result<Option<(Bytes, Bytes)>>;

    fn record_count(&self, tree: &TreeName) -> Result<u64>;
}

/// Atomic multi-tree write transaction; dropping it without commit discards every change
pub trait WriteableTransaction: ReadableTransaction {
    fn as_readable(&self) -> &dyn ReadableTransaction;

    fn open_tree(&mut self, tree: &TreeName, create_on_demand: bool) -> Result<()>;

    fn delete_tree(&mut self, tree: &TreeName) -> Result<()>;

    fn rename_tree(&mut self, from: &TreeName, to: &TreeName) -> Result<()>;

    fn put(&mut self, tree: &TreeName, key: &[u8], value: &[u8]) -> Result<()>;

    /// Compare-and-update: `f` sees the current value and returns the new one, `None` deletes.
    /// Returns true if the record changed.
    fn update(
        &mut self,
        tree: &TreeName,
        key: &[u8],
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<Option<Vec<u8>>>,
    ) -> Result<bool>;

    fn delete(&mut self, tree: &TreeName, key: &[u8]) -> Result<bool>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Non-transactional bulk loader used by phase two of an import
pub trait Importer: Send + Sync {
    fn clear_tree(&self, tree: &TreeName) -> Result<()>;

    fn put(&self, tree: &TreeName, key: &[u8], value: &[u8]) -> Result<()>;

    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// Ordered key-value storage engine
pub trait Storage: Send + Sync {
    fn open(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn begin_read(&self) -> Result<Box<dyn ReadableTransaction + '_>>;

    fn begin_write(&self) -> Result<Box<dyn WriteableTransaction + '_>>;

    fn start_import(&self) -> Result<Box<dyn Importer + '_>>;

    fn list_trees(&self) -> Result<Vec<TreeName>>;

    /// Persist committed state
    fn checkpoint(&self) -> Result<()>;

    fn backup(&self, backup_dir: &Path) -> Result<PathBuf>;

    fn restore(&self, backup_file: &Path) -> Result<()>;

    fn remove_storage_files(&self) -> Result<()>;
}

impl dyn Storage {
    /// Run `f` in a read transaction
    pub fn read<T>(&self, f: impl FnOnce(&dyn ReadableTransaction) -> Result<T>) -> Result<T> {
        let txn = self.begin_read()?;
        f(txn.as_ref())
    }

    /// Run `f` in a write transaction, committing only if it succeeds
    pub fn write<T>(&self, f: impl FnOnce(&mut dyn WriteableTransaction) -> Result<T>) -> Result<T> {
        let mut txn = self.begin_write()?;
        let value = f(txn.as_mut())?;
        txn.commit()?;
        Ok(value)
    }
}

/// Positional cursor over one tree
pub struct Cursor<'a> {
    txn: &'a dyn ReadableTransaction,
    tree: TreeName,
    current: Option<(Bytes, Bytes)>,
}

impl<'a> Cursor<'a> {
    pub fn new(txn: &'a dyn ReadableTransaction, tree: &TreeName) -> Self {
        Cursor { txn, tree: tree.clone(), current: None }
    }

    /// Position exactly on `key`
    pub fn position_to_key(&mut self, key: &[u8]) -> Result<bool> {
        self.current = self
            .txn
            .ceiling(&self.tree, key, true)?
            .filter(|(k, _)| k.as_ref() == key);
        Ok(self.current.is_some())
    }

    pub fn position_to_key_or_next(&mut self, key: &[u8]) -> Result<bool> {
        self.current = self.txn.ceiling(&self.tree, key, true)?;
        Ok(self.current.is_some())
    }

    pub fn position_to_last(&mut self) -> Result<bool> {
        self.current = self.txn.last(&self.tree)?;
        Ok(self.current.is_some())
    }

    /// Advance; an unpositioned cursor moves to the first record
    pub fn next(&mut self) -> Result<bool> {
        self.current = match self.current.take() {
            Some((key, _)) => self.txn.ceiling(&self.tree, &key, false)?,
            None => self.txn.ceiling(&self.tree, &[], true)?,
        };
        Ok(self.current.is_some())
    }

    pub fn is_defined(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.current.as_ref().map(|(k, _)| k)
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.current.as_ref().map(|(_, v)| v)
    }
}
