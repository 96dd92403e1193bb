use bytes::Bytes;
use crate::codec::dn_key::{after_last_child, before_first_child, dn_to_key};
use crate::core::dn::Dn;
use crate::core::error::Result;
use crate::core::types::EntryID;
use crate::storage::tree::{Cursor, ReadableTransaction, TreeName, WriteableTransaction};

pub const DN2ID_INDEX_ID: &str = "dn2id";

/// DN key to entry ID, ordered so every subtree is a contiguous key range
#[derive(Debug, Clone)]
pub struct DN2ID {
    tree: TreeName,
    base_dn: Dn,
}

impl DN2ID {
    pub fn new(prefix: &str, base_dn: &Dn) -> Self {
        DN2ID { tree: TreeName::new(prefix, DN2ID_INDEX_ID), base_dn: base_dn.clone() }
    }

    pub fn tree(&self) -> &TreeName {
        &self.tree
    }

    pub fn key(&self, dn: &Dn) -> Bytes {
        dn_to_key(dn, self.base_dn.size())
    }

    pub fn get(&self, txn: &dyn ReadableTransaction, dn: &Dn) -> Result<Option<EntryID>> {
        self.get_by_key(txn, &self.key(dn))
    }

    pub fn get_by_key(&self, txn: &dyn ReadableTransaction, key: &[u8]) -> Result<Option<EntryID>> {
        txn.read(&self.tree, key)?.map(|v| EntryID::from_key(&v)).transpose()
    }

    pub fn put(&self, txn: &mut dyn WriteableTransaction, dn: &Dn, id: EntryID) -> Result<()> {
        txn.put(&self.tree, &self.key(dn), &id.to_key())
    }

    pub fn remove(&self, txn: &mut dyn WriteableTransaction, dn: &Dn) -> Result<bool> {
        txn.delete(&self.tree, &self.key(dn))
    }

    /// True if the entry at `key` has at least one child
    pub fn has_children(&self, txn: &dyn ReadableTransaction, key: &[u8]) -> Result<bool> {
        let low = before_first_child(key);
        let high = after_last_child(key);
        Ok(txn
            .ceiling(&self.tree, &low, true)?
            .map(|(k, _)| k.as_ref() < high.as_slice())
            .unwrap_or(false))
    }

    /// Every record strictly below `key`, in key order
    pub fn descendants(&self, txn: &dyn ReadableTransaction, key: &[u8]) -> Result<Vec<(Bytes, EntryID)>> {
        let high = after_last_child(key);
        let mut records = Vec::new();
        let mut cursor = Cursor::new(txn, &self.tree);
        let mut found = cursor.position_to_key_or_next(&before_first_child(key))?;
        while found {
            let (Some(k), Some(v)) = (cursor.key(), cursor.value()) else {
                break;
            };
            if k.as_ref() >= high.as_slice() {
                break;
            }
            records.push((k.clone(), EntryID::from_key(v)?));
            found = cursor.next()?;
        }
        Ok(records)
    }

    /// Immediate children of `key`, in key order
    pub fn children(&self, txn: &dyn ReadableTransaction, key: &[u8]) -> Result<Vec<(Bytes, EntryID)>> {
        let child_len = |k: &Bytes| crate::codec::dn_key::find_parent_len(k) == Some(key.len());
        Ok(self.descendants(txn, key)?.into_iter().filter(|(k, _)| child_len(k)).collect())
    }
}
