use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use bytes::Bytes;
use chrono::Utc;
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard, RwLock};
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::file_lock::FileLock;
use crate::storage::layout::StorageLayout;
use crate::storage::snapshot::{Snapshot, TreeImage};
use crate::storage::tree::{Importer, ReadableTransaction, Storage, TreeName, WriteableTransaction};

type Records = BTreeMap<Bytes, Bytes>;

/// Reference storage engine: ordered in-memory trees persisted as checksummed snapshots
pub struct BTreeStorage {
    layout: Option<StorageLayout>,
    trees: RwLock<HashMap<TreeName, Records>>,
    writer: Mutex<()>,                  // Serializes write transactions
    lock: Mutex<Option<FileLock>>,
}

impl BTreeStorage {
    /// Storage persisted under `layout`
    pub fn new(layout: StorageLayout) -> Self {
        BTreeStorage {
            layout: Some(layout),
            trees: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
            lock: Mutex::new(None),
        }
    }

    /// Volatile storage, used for scratch caches and tests
    pub fn in_memory() -> Self {
        BTreeStorage {
            layout: None,
            trees: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
            lock: Mutex::new(None),
        }
    }

    pub fn layout(&self) -> Option<&StorageLayout> {
        self.layout.as_ref()
    }

    fn committed_read(&self, tree: &TreeName, key: &[u8]) -> Option<Bytes> {
        self.trees.read().get(tree).and_then(|records| records.get(key).cloned())
    }

    fn committed_ceiling(&self, tree: &TreeName, key: &[u8], inclusive: bool) -> Option<(Bytes, Bytes)> {
        let trees = self.trees.read();
        let records = trees.get(tree)?;
        let lower = if inclusive { Bound::Included(key) } else { Bound::Excluded(key) };
        records
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn committed_floor(&self, tree: &TreeName, upper: Bound<&[u8]>) -> Option<(Bytes, Bytes)> {
        let trees = self.trees.read();
        let records = trees.get(tree)?;
        records
            .range::<[u8], _>((Bound::Unbounded, upper))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn tree_exists(&self, tree: &TreeName) -> bool {
        self.trees.read().contains_key(tree)
    }

    fn load_snapshot(&self, path: &Path) -> Result<()> {
        let mut trees = HashMap::new();
        if let Some(snapshot) = Snapshot::load(path)? {
            info!("[Storage] Loading snapshot from {} ({} records)", snapshot.timestamp, snapshot.record_count());
            for image in snapshot.trees {
                let records: Records = image
                    .records
                    .into_iter()
                    .map(|(k, v)| (Bytes::from(k), Bytes::from(v)))
                    .collect();
                trees.insert(image.name, records);
            }
        }
        *self.trees.write() = trees;
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        let trees = self.trees.read();
        let mut images: Vec<TreeImage> = trees
            .iter()
            .map(|(name, records)| TreeImage {
                name: name.clone(),
                records: records.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect(),
            })
            .collect();
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Snapshot { timestamp: Utc::now(), trees: images }
    }
}

impl Storage for BTreeStorage {
    fn open(&self) -> Result<()> {
        let Some(layout) = &self.layout else {
            return Ok(());
        };
        let mut lock = self.lock.lock();
        if lock.is_none() {
            *lock = Some(FileLock::acquire(&layout.lock_path(), true)?);
        }
        self.load_snapshot(&layout.snapshot_path())
    }

    fn close(&self) -> Result<()> {
        self.checkpoint()?;
        self.lock.lock().take();
        Ok(())
    }

    fn begin_read(&self) -> Result<Box<dyn ReadableTransaction + '_>> {
        Ok(Box::new(BTreeReadTxn { storage: self }))
    }

    fn begin_write(&self) -> Result<Box<dyn WriteableTransaction + '_>> {
        let guard = self.writer.lock();
        Ok(Box::new(BTreeWriteTxn {
            storage: self,
            _guard: guard,
            changes: BTreeMap::new(),
        }))
    }

    fn start_import(&self) -> Result<Box<dyn Importer + '_>> {
        Ok(Box::new(BTreeImporter { storage: self }))
    }

    fn list_trees(&self) -> Result<Vec<TreeName>> {
        let mut names: Vec<TreeName> = self.trees.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn checkpoint(&self) -> Result<()> {
        let Some(layout) = &self.layout else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        snapshot.save(&layout.snapshot_path(), &layout.snapshot_tmp_path())?;
        debug!("[Storage] Checkpoint written ({} trees)", snapshot.trees.len());
        Ok(())
    }

    fn backup(&self, backup_dir: &Path) -> Result<PathBuf> {
        let label = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        let target = backup_dir.join(format!("backup-{}.snapshot", label));
        fs::create_dir_all(backup_dir)?;
        let tmp = backup_dir.join(format!("backup-{}.tmp", label));
        self.snapshot().save(&target, &tmp)?;
        info!("[Storage] Backup written to {}", target.display());
        Ok(target)
    }

    fn restore(&self, backup_file: &Path) -> Result<()> {
        // Validate before replacing anything
        if Snapshot::load(backup_file)?.is_none() {
            return Err(Error::new(
                ErrorKind::NoSuchObject,
                format!("backup {} does not exist", backup_file.display()),
            ));
        }
        let _writer = self.writer.lock();
        if let Some(layout) = &self.layout {
            fs::copy(backup_file, layout.snapshot_path())?;
        }
        self.load_snapshot(backup_file)?;
        info!("[Storage] Restored from {}", backup_file.display());
        Ok(())
    }

    fn remove_storage_files(&self) -> Result<()> {
        self.lock.lock().take();
        self.trees.write().clear();
        if let Some(layout) = &self.layout {
            if layout.base_dir.exists() {
                fs::remove_dir_all(&layout.base_dir)?;
            }
        }
        Ok(())
    }
}

struct BTreeReadTxn<'a> {
    storage: &'a BTreeStorage,
}

impl ReadableTransaction for BTreeReadTxn<'_> {
    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.storage.committed_read(tree, key))
    }

    fn ceiling(&self, tree: &TreeName, key: &[u8], inclusive: bool) -> Result<Option<(Bytes, Bytes)>> {
        Ok(self.storage.committed_ceiling(tree, key, inclusive))
    }

    fn last(&self, tree: &TreeName) -> Result<Option<(Bytes, Bytes)>> {
        Ok(self.storage.committed_floor(tree, Bound::Unbounded))
    }

    fn record_count(&self, tree: &TreeName) -> Result<u64> {
        Ok(self.storage.trees.read().get(tree).map(|r| r.len() as u64).unwrap_or(0))
    }
}

/// Pending changes to one tree inside a write transaction
#[derive(Default)]
struct TreeChanges {
    replaced: bool,     // Committed content is hidden (tree cleared or recreated)
    dropped: bool,      // Tree is deleted on commit
    records: BTreeMap<Bytes, Option<Bytes>>,
}

struct BTreeWriteTxn<'a> {
    storage: &'a BTreeStorage,
    _guard: MutexGuard<'a, ()>,
    changes: BTreeMap<TreeName, TreeChanges>,
}

impl BTreeWriteTxn<'_> {
    fn exists(&self, tree: &TreeName) -> bool {
        match self.changes.get(tree) {
            Some(changes) if changes.dropped => false,
            Some(changes) if changes.replaced => true,
            _ => self.storage.tree_exists(tree),
        }
    }

    fn changes_mut(&mut self, tree: &TreeName) -> &mut TreeChanges {
        self.changes.entry(tree.clone()).or_default()
    }

    fn merged_ceiling(&self, tree: &TreeName, key: &[u8], inclusive: bool) -> Option<(Bytes, Bytes)> {
        let changes = self.changes.get(tree);
        if changes.map(|c| c.dropped).unwrap_or(false) {
            return None;
        }
        let replaced = changes.map(|c| c.replaced).unwrap_or(false);

        let mut bound = key.to_vec();
        let mut inclusive = inclusive;
        loop {
            let committed = if replaced {
                None
            } else {
                self.storage.committed_ceiling(tree, &bound, inclusive)
            };
            let pending = changes.and_then(|c| {
                let lower = if inclusive { Bound::Included(bound.as_slice()) } else { Bound::Excluded(bound.as_slice()) };
                c.records.range::<[u8], _>((lower, Bound::Unbounded)).next()
            });

            match (committed, pending) {
                (None, None) => return None,
                (Some(record), None) => return Some(record),
                (committed, Some((pending_key, pending_value))) => {
                    if let Some((committed_key, committed_value)) = committed {
                        if committed_key < *pending_key {
                            return Some((committed_key, committed_value));
                        }
                    }
                    match pending_value {
                        Some(value) => return Some((pending_key.clone(), value.clone())),
                        None => {
                            // Deleted in this transaction, continue after it
                            bound = pending_key.to_vec();
                            inclusive = false;
                        }
                    }
                }
            }
        }
    }

    fn merged_last(&self, tree: &TreeName) -> Option<(Bytes, Bytes)> {
        let changes = self.changes.get(tree);
        if changes.map(|c| c.dropped).unwrap_or(false) {
            return None;
        }
        let replaced = changes.map(|c| c.replaced).unwrap_or(false);

        let mut upper: Option<Vec<u8>> = None;
        loop {
            let bound = match &upper {
                Some(key) => Bound::Excluded(key.as_slice()),
                None => Bound::Unbounded,
            };
            let committed = if replaced { None } else { self.storage.committed_floor(tree, bound) };
            let pending = changes.and_then(|c| c.records.range::<[u8], _>((Bound::Unbounded, bound)).next_back());

            match (committed, pending) {
                (None, None) => return None,
                (Some(record), None) => return Some(record),
                (committed, Some((pending_key, pending_value))) => {
                    if let Some((committed_key, committed_value)) = committed {
                        if committed_key > *pending_key {
                            return Some((committed_key, committed_value));
                        }
                    }
                    match pending_value {
                        Some(value) => return Some((pending_key.clone(), value.clone())),
                        None => upper = Some(pending_key.to_vec()),
                    }
                }
            }
        }
    }
}

impl ReadableTransaction for BTreeWriteTxn<'_> {
    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>> {
        match self.changes.get(tree) {
            Some(changes) if changes.dropped => Ok(None),
            Some(changes) => match changes.records.get(key) {
                Some(value) => Ok(value.clone()),
                None if changes.replaced => Ok(None),
                None => Ok(self.storage.committed_read(tree, key)),
            },
            None => Ok(self.storage.committed_read(tree, key)),
        }
    }

    fn ceiling(&self, tree: &TreeName, key: &[u8], inclusive: bool) -> Result<Option<(Bytes, Bytes)>> {
        Ok(self.merged_ceiling(tree, key, inclusive))
    }

    fn last(&self, tree: &TreeName) -> Result<Option<(Bytes, Bytes)>> {
        Ok(self.merged_last(tree))
    }

    fn record_count(&self, tree: &TreeName) -> Result<u64> {
        let committed = self.storage.trees.read().get(tree).map(|r| r.len() as u64).unwrap_or(0);
        let Some(changes) = self.changes.get(tree) else {
            return Ok(committed);
        };
        if changes.dropped {
            return Ok(0);
        }

        let mut count: i64 = if changes.replaced { 0 } else { committed as i64 };
        for (key, value) in &changes.records {
            let existed = !changes.replaced && self.storage.committed_read(tree, key).is_some();
            match (existed, value.is_some()) {
                (false, true) => count += 1,
                (true, false) => count -= 1,
                _ => {}
            }
        }
        Ok(count.max(0) as u64)
    }
}

impl WriteableTransaction for BTreeWriteTxn<'_> {
    fn as_readable(&self) -> &dyn ReadableTransaction {
        self
    }

    fn open_tree(&mut self, tree: &TreeName, create_on_demand: bool) -> Result<()> {
        if self.exists(tree) {
            return Ok(());
        }
        if !create_on_demand {
            return Err(Error::storage(format!("tree {} does not exist", tree)));
        }
        let changes = self.changes_mut(tree);
        changes.dropped = false;
        changes.replaced = true;
        changes.records.clear();
        Ok(())
    }

    fn delete_tree(&mut self, tree: &TreeName) -> Result<()> {
        let changes = self.changes_mut(tree);
        changes.dropped = true;
        changes.replaced = true;
        changes.records.clear();
        Ok(())
    }

    fn rename_tree(&mut self, from: &TreeName, to: &TreeName) -> Result<()> {
        if !self.exists(from) {
            return Err(Error::storage(format!("tree {} does not exist", from)));
        }
        let mut records = Vec::new();
        let mut next = self.merged_ceiling(from, &[], true);
        while let Some((key, value)) = next {
            next = self.merged_ceiling(from, &key, false);
            records.push((key, value));
        }

        self.delete_tree(from)?;
        let target = self.changes_mut(to);
        target.dropped = false;
        target.replaced = true;
        target.records = records.into_iter().map(|(k, v)| (k, Some(v))).collect();
        Ok(())
    }

    fn put(&mut self, tree: &TreeName, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.exists(tree) {
            return Err(Error::storage(format!("tree {} is not open", tree)));
        }
        self.changes_mut(tree)
            .records
            .insert(Bytes::copy_from_slice(key), Some(Bytes::copy_from_slice(value)));
        Ok(())
    }

    fn update(
        &mut self,
        tree: &TreeName,
        key: &[u8],
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<Option<Vec<u8>>>,
    ) -> Result<bool> {
        let current = self.read(tree, key)?;
        let updated = f(current.as_deref())?;
        if updated.as_deref() == current.as_deref() {
            return Ok(false);
        }
        match updated {
            Some(value) => self.put(tree, key, &value)?,
            None => {
                self.delete(tree, key)?;
            }
        }
        Ok(true)
    }

    fn delete(&mut self, tree: &TreeName, key: &[u8]) -> Result<bool> {
        let existed = self.read(tree, key)?.is_some();
        if existed {
            self.changes_mut(tree).records.insert(Bytes::copy_from_slice(key), None);
        }
        Ok(existed)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut trees = this.storage.trees.write();
        for (name, changes) in this.changes {
            if changes.dropped {
                trees.remove(&name);
                continue;
            }
            if changes.replaced {
                trees.insert(name.clone(), Records::new());
            }
            let records = trees.entry(name).or_default();
            for (key, value) in changes.records {
                match value {
                    Some(value) => {
                        records.insert(key, value);
                    }
                    None => {
                        records.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Writes straight into committed trees; callers deliver keys in ascending order per tree
struct BTreeImporter<'a> {
    storage: &'a BTreeStorage,
}

impl Importer for BTreeImporter<'_> {
    fn clear_tree(&self, tree: &TreeName) -> Result<()> {
        self.storage.trees.write().insert(tree.clone(), Records::new());
        Ok(())
    }

    fn put(&self, tree: &TreeName, key: &[u8], value: &[u8]) -> Result<()> {
        self.storage
            .trees
            .write()
            .entry(tree.clone())
            .or_default()
            .insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.storage.committed_read(tree, key))
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.storage.checkpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::Cursor;

    fn tree() -> TreeName {
        TreeName::new("dc=example,dc=com", "test")
    }

    fn storage() -> Box<dyn Storage> {
        Box::new(BTreeStorage::in_memory())
    }

    #[test]
    fn aborted_transaction_leaves_no_trace() {
        let storage = storage();
        storage
            .write(|txn| {
                txn.open_tree(&tree(), true)?;
                txn.put(&tree(), b"a", b"1")
            })
            .unwrap();

        let result: Result<()> = storage.write(|txn| {
            txn.put(&tree(), b"b", b"2")?;
            txn.delete(&tree(), b"a")?;
            Err(Error::new(ErrorKind::Internal, "boom".to_string()))
        });
        assert!(result.is_err());

        storage
            .read(|txn| {
                assert_eq!(txn.read(&tree(), b"a")?.unwrap().as_ref(), b"1");
                assert!(txn.read(&tree(), b"b")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn cursor_sees_pending_changes() {
        let storage = storage();
        storage
            .write(|txn| {
                txn.open_tree(&tree(), true)?;
                for key in [b"a", b"c", b"e"] {
                    txn.put(&tree(), key, b"x")?;
                }
                Ok(())
            })
            .unwrap();

        storage
            .write(|txn| {
                txn.delete(&tree(), b"c")?;
                txn.put(&tree(), b"d", b"y")?;

                let mut keys = Vec::new();
                let mut cursor = Cursor::new(txn.as_readable(), &tree());
                while cursor.next()? {
                    keys.push(cursor.key().unwrap().to_vec());
                }
                assert_eq!(keys, vec![b"a".to_vec(), b"d".to_vec(), b"e".to_vec()]);
                assert_eq!(txn.record_count(&tree())?, 3);

                let mut cursor = Cursor::new(txn.as_readable(), &tree());
                assert!(cursor.position_to_key_or_next(b"b")?);
                assert_eq!(cursor.key().unwrap().as_ref(), b"d");
                assert!(!cursor.position_to_key(b"c")?);
                assert!(cursor.position_to_last()?);
                assert_eq!(cursor.key().unwrap().as_ref(), b"e");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn update_and_rename_tree() {
        let storage = storage();
        let renamed = TreeName::new("o=tmp", "test");
        storage
            .write(|txn| {
                txn.open_tree(&tree(), true)?;
                txn.put(&tree(), b"n", &1u64.to_be_bytes())?;
                let changed = txn.update(&tree(), b"n", &mut |current: Option<&[u8]>| {
                    let value = u64::from_be_bytes(current.unwrap().try_into().unwrap());
                    Ok(Some((value + 1).to_be_bytes().to_vec()))
                })?;
                assert!(changed);
                txn.rename_tree(&tree(), &renamed)
            })
            .unwrap();

        let trees = storage.list_trees().unwrap();
        assert_eq!(trees, vec![renamed.clone()]);
        storage
            .read(|txn| {
                assert_eq!(txn.read(&renamed, b"n")?.unwrap().as_ref(), &2u64.to_be_bytes());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().join("backend")).unwrap();
        {
            let storage: Box<dyn Storage> = Box::new(BTreeStorage::new(layout.clone()));
            storage.open().unwrap();
            storage
                .write(|txn| {
                    txn.open_tree(&tree(), true)?;
                    txn.put(&tree(), b"k", b"v")
                })
                .unwrap();
            storage.close().unwrap();
        }

        let storage: Box<dyn Storage> = Box::new(BTreeStorage::new(layout));
        storage.open().unwrap();
        storage
            .read(|txn| {
                assert_eq!(txn.read(&tree(), b"k")?.unwrap().as_ref(), b"v");
                Ok(())
            })
            .unwrap();
    }
}
