use std::collections::{BTreeMap, BTreeSet};
use crate::core::error::Result;
use crate::core::types::EntryID;
use crate::index::entry_id_set::EntryIDSet;
use crate::storage::tree::{TreeName, WriteableTransaction};

#[derive(Debug, Default)]
struct KeyUpdate {
    added: BTreeSet<EntryID>,
    deleted: BTreeSet<EntryID>,
}

#[derive(Debug, Default)]
struct SetUpdates {
    entry_limit: u64,
    keys: BTreeMap<Vec<u8>, KeyUpdate>,
}

/// Index changes of one operation, collected outside the write transaction and
/// flushed inside it in ascending tree and key order.
#[derive(Debug, Default)]
pub struct IndexBuffer {
    sets: BTreeMap<TreeName, SetUpdates>,
    records: BTreeMap<TreeName, BTreeMap<Vec<u8>, Option<EntryID>>>,
}

impl IndexBuffer {
    pub fn new() -> Self {
        IndexBuffer::default()
    }

    /// Add `id` to the entry ID set under `key`
    pub fn put_id(&mut self, tree: &TreeName, entry_limit: u64, key: Vec<u8>, id: EntryID) {
        let update = self.key_update(tree, entry_limit, key);
        update.deleted.remove(&id);
        update.added.insert(id);
    }

    pub fn remove_id(&mut self, tree: &TreeName, entry_limit: u64, key: Vec<u8>, id: EntryID) {
        let update = self.key_update(tree, entry_limit, key);
        update.added.remove(&id);
        update.deleted.insert(id);
    }

    /// Unique record keyed by a sort key, used by VLV indexes
    pub fn put_record(&mut self, tree: &TreeName, key: Vec<u8>, id: EntryID) {
        self.records.entry(tree.clone()).or_default().insert(key, Some(id));
    }

    pub fn remove_record(&mut self, tree: &TreeName, key: Vec<u8>) {
        self.records.entry(tree.clone()).or_default().insert(key, None);
    }

    fn key_update(&mut self, tree: &TreeName, entry_limit: u64, key: Vec<u8>) -> &mut KeyUpdate {
        let updates = self.sets.entry(tree.clone()).or_default();
        updates.entry_limit = entry_limit;
        updates.keys.entry(key).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.records.is_empty()
    }

    /// Trees this buffer writes to
    pub fn touched_trees(&self) -> Vec<TreeName> {
        let mut trees: BTreeSet<TreeName> = self.sets.keys().cloned().collect();
        trees.extend(self.records.keys().cloned());
        trees.into_iter().collect()
    }

    pub fn flush(&self, txn: &mut dyn WriteableTransaction) -> Result<()> {
        for (tree, updates) in &self.sets {
            for (key, update) in &updates.keys {
                txn.update(tree, key, &mut |current: Option<&[u8]>| {
                    let mut ids = match current {
                        Some(bytes) => EntryIDSet::from_bytes(bytes)?,
                        None => EntryIDSet::new(),
                    };
                    for id in &update.deleted {
                        ids.remove(*id);
                    }
                    for id in &update.added {
                        ids.add(*id);
                    }
                    ids.apply_limit(updates.entry_limit);
                    Ok(if ids.is_empty() { None } else { Some(ids.to_bytes()) })
                })?;
            }
        }

        for (tree, records) in &self.records {
            for (key, id) in records {
                match id {
                    Some(id) => txn.put(tree, key, &id.to_key())?,
                    None => {
                        txn.delete(tree, key)?;
                    }
                }
            }
        }
        Ok(())
    }
}
