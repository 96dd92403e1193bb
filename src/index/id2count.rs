use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntryID;
use crate::storage::tree::{ReadableTransaction, TreeName, WriteableTransaction};

pub const ID2COUNT_INDEX_ID: &str = "id2childrencount";

/// Reserved key holding the number of entries in the container
pub const TOTAL_COUNT_ID: EntryID = EntryID(u64::MAX);

/// Entry ID to number of immediate children, plus the container total
#[derive(Debug, Clone)]
pub struct ID2Count {
    tree: TreeName,
}

impl ID2Count {
    pub fn new(prefix: &str) -> Self {
        ID2Count { tree: TreeName::new(prefix, ID2COUNT_INDEX_ID) }
    }

    pub fn tree(&self) -> &TreeName {
        &self.tree
    }

    pub fn get_count(&self, txn: &dyn ReadableTransaction, id: EntryID) -> Result<i64> {
        match txn.read(&self.tree, &id.to_key())? {
            Some(bytes) => decode_count(&bytes),
            None => Ok(0),
        }
    }

    pub fn get_total(&self, txn: &dyn ReadableTransaction) -> Result<i64> {
        self.get_count(txn, TOTAL_COUNT_ID)
    }

    /// Add `delta` to the counter of `id`; a counter reaching zero is removed
    pub fn update_count(&self, txn: &mut dyn WriteableTransaction, id: EntryID, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        txn.update(&self.tree, &id.to_key(), &mut |current: Option<&[u8]>| {
            let count = match current {
                Some(bytes) => decode_count(bytes)?,
                None => 0,
            } + delta;
            Ok(if count == 0 { None } else { Some(encode_count(count).to_vec()) })
        })?;
        Ok(())
    }

    pub fn update_total(&self, txn: &mut dyn WriteableTransaction, delta: i64) -> Result<()> {
        self.update_count(txn, TOTAL_COUNT_ID, delta)
    }

    /// Drop the counter of a removed entry
    pub fn delete_count(&self, txn: &mut dyn WriteableTransaction, id: EntryID) -> Result<()> {
        txn.delete(&self.tree, &id.to_key())?;
        Ok(())
    }
}

pub fn encode_count(count: i64) -> [u8; 8] {
    count.to_be_bytes()
}

pub fn decode_count(bytes: &[u8]) -> Result<i64> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| {
        Error::new(ErrorKind::Parse, format!("invalid children count length {}", bytes.len()))
    })?;
    Ok(i64::from_be_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::BTreeStorage;
    use crate::storage::tree::Storage;

    #[test]
    fn counters_add_up_and_vanish_at_zero() {
        let storage: Box<dyn Storage> = Box::new(BTreeStorage::in_memory());
        let counts = ID2Count::new("o=test");
        storage
            .write(|txn| {
                txn.open_tree(counts.tree(), true)?;
                counts.update_count(txn, EntryID(1), 2)?;
                counts.update_total(txn, 3)?;
                counts.update_count(txn, EntryID(1), -2)
            })
            .unwrap();

        storage
            .read(|txn| {
                assert_eq!(counts.get_count(txn, EntryID(1))?, 0);
                assert!(txn.read(counts.tree(), &EntryID(1).to_key())?.is_none());
                assert_eq!(counts.get_total(txn)?, 3);
                Ok(())
            })
            .unwrap();
    }
}
