use crate::core::error::Result;
use crate::storage::tree::{Importer, ReadableTransaction, TreeName, WriteableTransaction};

pub const STATE_INDEX_ID: &str = "state";

const TRUSTED: u8 = 1;
const UNTRUSTED: u8 = 0;

/// Persisted trust flag of every index tree of a container
#[derive(Debug, Clone)]
pub struct State {
    tree: TreeName,
}

impl State {
    pub fn new(prefix: &str) -> Self {
        State { tree: TreeName::new(prefix, STATE_INDEX_ID) }
    }

    pub fn tree(&self) -> &TreeName {
        &self.tree
    }

    /// Indexes without a recorded flag are trusted
    pub fn is_trusted(&self, txn: &dyn ReadableTransaction, index: &TreeName) -> Result<bool> {
        let value = txn.read(&self.tree, index.index_id.as_bytes())?;
        Ok(value.map(|v| v.first() != Some(&UNTRUSTED)).unwrap_or(true))
    }

    pub fn set_trusted(&self, txn: &mut dyn WriteableTransaction, index: &TreeName, trusted: bool) -> Result<()> {
        txn.open_tree(&self.tree, true)?;
        txn.put(&self.tree, index.index_id.as_bytes(), &[flag(trusted)])
    }

    pub fn set_trusted_import(&self, importer: &dyn Importer, index: &TreeName, trusted: bool) -> Result<()> {
        importer.put(&self.tree, index.index_id.as_bytes(), &[flag(trusted)])
    }

    pub fn remove(&self, txn: &mut dyn WriteableTransaction, index: &TreeName) -> Result<()> {
        txn.delete(&self.tree, index.index_id.as_bytes())?;
        Ok(())
    }
}

fn flag(trusted: bool) -> u8 {
    if trusted { TRUSTED } else { UNTRUSTED }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::BTreeStorage;
    use crate::storage::tree::Storage;

    #[test]
    fn trust_flag_round_trip() {
        let storage: Box<dyn Storage> = Box::new(BTreeStorage::in_memory());
        let state = State::new("o=test");
        let index = TreeName::new("o=test", "cn.equality");

        storage
            .write(|txn| {
                assert!(state.is_trusted(txn.as_readable(), &index)?);
                state.set_trusted(txn, &index, false)
            })
            .unwrap();
        let trusted = storage.read(|txn| state.is_trusted(txn, &index)).unwrap();
        assert!(!trusted);
    }
}
