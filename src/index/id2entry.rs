use crate::codec::entry_codec::EntryCodec;
use crate::core::entry::Entry;
use crate::core::error::Result;
use crate::core::types::EntryID;
use crate::storage::tree::{Importer, ReadableTransaction, TreeName, WriteableTransaction};

pub const ID2ENTRY_INDEX_ID: &str = "id2entry";

/// Entry ID to encoded entry
#[derive(Clone)]
pub struct ID2Entry {
    tree: TreeName,
    codec: EntryCodec,
}

impl ID2Entry {
    pub fn new(prefix: &str, codec: EntryCodec) -> Self {
        ID2Entry { tree: TreeName::new(prefix, ID2ENTRY_INDEX_ID), codec }
    }

    pub fn tree(&self) -> &TreeName {
        &self.tree
    }

    pub fn codec(&self) -> &EntryCodec {
        &self.codec
    }

    pub fn get(&self, txn: &dyn ReadableTransaction, id: EntryID) -> Result<Option<Entry>> {
        match txn.read(&self.tree, &id.to_key())? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, txn: &mut dyn WriteableTransaction, id: EntryID, entry: &Entry) -> Result<()> {
        txn.put(&self.tree, &id.to_key(), &self.codec.encode(entry)?)
    }

    pub fn put_import(&self, importer: &dyn Importer, id: EntryID, entry: &Entry) -> Result<()> {
        importer.put(&self.tree, &id.to_key(), &self.codec.encode(entry)?)
    }

    pub fn remove(&self, txn: &mut dyn WriteableTransaction, id: EntryID) -> Result<bool> {
        txn.delete(&self.tree, &id.to_key())
    }

    /// Highest entry ID stored, used to seed ID allocation
    pub fn highest_id(&self, txn: &dyn ReadableTransaction) -> Result<Option<EntryID>> {
        txn.last(&self.tree)?.map(|(k, _)| EntryID::from_key(&k)).transpose()
    }

    pub fn count(&self, txn: &dyn ReadableTransaction) -> Result<u64> {
        txn.record_count(&self.tree)
    }
}
