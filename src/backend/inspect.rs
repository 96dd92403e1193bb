use serde::{Serialize, Deserialize};
use crate::backend::entry_container::EntryContainer;
use crate::codec::crypto::encode_hex;
use crate::codec::dn_key::key_to_dn_string;
use crate::core::error::Result;
use crate::core::types::EntryID;
use crate::index::dn2id::DN2ID_INDEX_ID;
use crate::index::dn2uri::{ReferralRecord, DN2URI_INDEX_ID};
use crate::index::entry_id_set::EntryIDSet;
use crate::index::id2count::{decode_count, ID2COUNT_INDEX_ID, TOTAL_COUNT_ID};
use crate::index::id2entry::ID2ENTRY_INDEX_ID;
use crate::index::state::STATE_INDEX_ID;
use crate::storage::tree::{Cursor, TreeName};

/// Share of the entry limit at which a key is reported as close to it
const NEAR_LIMIT_RATIO: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeStats {
    pub tree: TreeName,
    pub record_count: u64,
    pub trusted: bool,
}

/// Entry-limit statistics of one attribute index tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryLimitStats {
    pub tree: Option<TreeName>,
    pub entry_limit: u64,
    pub key_count: u64,
    pub undefined_keys: u64,       // Keys whose set exceeded the limit
    pub near_limit_keys: u64,      // Defined keys within 90% of the limit
    pub largest_set: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpRecord {
    pub key: String,
    pub value: String,
}

/// Read-only diagnostics over the trees of one container
pub struct Inspector<'a> {
    container: &'a EntryContainer,
}

impl<'a> Inspector<'a> {
    pub fn new(container: &'a EntryContainer) -> Self {
        Inspector { container }
    }

    pub fn list_trees(&self) -> Vec<TreeName> {
        self.container.all_trees()
    }

    pub fn tree_stats(&self) -> Result<Vec<TreeStats>> {
        let trees = self.container.all_trees();
        self.container.storage().read(|txn| {
            trees
                .into_iter()
                .map(|tree| {
                    Ok(TreeStats {
                        record_count: txn.record_count(&tree)?,
                        trusted: self.container.state().is_trusted(txn, &tree)?,
                        tree,
                    })
                })
                .collect()
        })
    }

    pub fn entry_limit_stats(&self) -> Result<Vec<EntryLimitStats>> {
        let indexes = self.container.indexes();
        let mut stats = Vec::new();
        self.container.storage().read(|txn| {
            for index in indexes.ordered().flat_map(|a| a.indexes()) {
                let mut tree_stats = EntryLimitStats {
                    tree: Some(index.tree().clone()),
                    entry_limit: index.entry_limit(),
                    ..EntryLimitStats::default()
                };
                let near = (index.entry_limit() as f64 * NEAR_LIMIT_RATIO).ceil() as u64;
                let mut cursor = Cursor::new(txn, index.tree());
                while cursor.next()? {
                    let Some(value) = cursor.value() else {
                        break;
                    };
                    tree_stats.key_count += 1;
                    let set = EntryIDSet::from_bytes(value)?;
                    match set.size() {
                        _ if !set.is_defined() => tree_stats.undefined_keys += 1,
                        Some(size) => {
                            if index.entry_limit() > 0 && size >= near {
                                tree_stats.near_limit_keys += 1;
                            }
                            tree_stats.largest_set = tree_stats.largest_set.max(size);
                        }
                        None => {}
                    }
                }
                stats.push(tree_stats);
            }
            Ok(())
        })?;
        Ok(stats)
    }

    /// Records of `tree`, raw as hex or decoded into readable text
    pub fn dump(&self, tree: &TreeName, decode: bool, limit: Option<usize>) -> Result<Vec<DumpRecord>> {
        let indexes = self.container.indexes();
        self.container.storage().read(|txn| {
            let mut records = Vec::new();
            let mut cursor = Cursor::new(txn, tree);
            while cursor.next()? {
                if limit.map(|l| records.len() >= l).unwrap_or(false) {
                    break;
                }
                let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                    break;
                };
                let record = if decode {
                    self.decode(tree, key, value, |bytes| indexes.id2entry().codec().decode(bytes).map(|e| e.to_string()))?
                } else {
                    DumpRecord { key: encode_hex(key), value: encode_hex(value) }
                };
                records.push(record);
            }
            Ok(records)
        })
    }

    fn decode(
        &self,
        tree: &TreeName,
        key: &[u8],
        value: &[u8],
        entry: impl Fn(&[u8]) -> Result<String>,
    ) -> Result<DumpRecord> {
        let base = self.container.base_dn();
        let (key, value) = match tree.index_id.as_str() {
            DN2ID_INDEX_ID => (key_to_dn_string(key, base)?, EntryID::from_key(value)?.to_string()),
            ID2ENTRY_INDEX_ID => (EntryID::from_key(key)?.to_string(), entry(value)?),
            ID2COUNT_INDEX_ID => {
                let id = EntryID::from_key(key)?;
                let label = if id == TOTAL_COUNT_ID { "total".to_string() } else { id.to_string() };
                (label, decode_count(value)?.to_string())
            }
            DN2URI_INDEX_ID => {
                let record: ReferralRecord = bincode::deserialize(value)?;
                (record.dn, record.urls.join(" "))
            }
            STATE_INDEX_ID => {
                let trusted = value.first() != Some(&0);
                (printable(key), if trusted { "trusted" } else { "untrusted" }.to_string())
            }
            id if id.starts_with("vlv.") => (encode_hex(key), EntryID::from_key(value)?.to_string()),
            _ => {
                let set = EntryIDSet::from_bytes(value)?;
                let ids: Vec<String> = set.ids().iter().map(|id| id.to_string()).collect();
                (printable(key), format!("{} {}", set, ids.join(",")).trim_end().to_string())
            }
        };
        Ok(DumpRecord { key, value })
    }
}

// UTF-8 keys as text, anything else as hex
fn printable(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => encode_hex(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::backend::entry_container::ContainerSettings;
    use crate::backend::root_container::EntryIdAllocator;
    use crate::core::config::{IndexConfig, IndexType};
    use crate::core::dn::Dn;
    use crate::core::entry::Entry;
    use crate::core::matching::MatchingRuleRegistry;
    use crate::core::operation::OperationContext;
    use crate::storage::btree::BTreeStorage;

    fn container() -> EntryContainer {
        let base = Dn::parse("o=test").unwrap();
        let settings = ContainerSettings {
            index_entry_limit: 10,
            indexes: vec![IndexConfig::new("l", &[IndexType::Equality])],
            ..ContainerSettings::default()
        };
        let container = EntryContainer::new(
            base.clone(),
            base.normalized(),
            Arc::new(BTreeStorage::in_memory()),
            Arc::new(EntryIdAllocator::new(1)),
            Arc::new(MatchingRuleRegistry::new()),
            None,
            settings,
        )
        .unwrap();
        container.open().unwrap();
        let ctx = OperationContext::new();
        container.add_entry(&Entry::new(base).with("o", &["test"]), &ctx).unwrap();
        for i in 0..12 {
            let city = if i < 9 { "paris" } else { "rome" };
            let entry = Entry::new(Dn::parse(&format!("cn=p{},o=test", i)).unwrap()).with("l", &[city]);
            container.add_entry(&entry, &ctx).unwrap();
        }
        container
    }

    #[test]
    fn limit_statistics() {
        let container = container();
        let stats = Inspector::new(&container).entry_limit_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].key_count, 2);
        assert_eq!(stats[0].near_limit_keys, 1);
        assert_eq!(stats[0].largest_set, 9);
        assert_eq!(stats[0].undefined_keys, 0);
    }

    #[test]
    fn decoded_dumps() {
        let container = container();
        let inspector = Inspector::new(&container);
        let counts = inspector.dump(&TreeName::new("o=test", "id2childrencount"), true, None).unwrap();
        assert!(counts.contains(&DumpRecord { key: "1".to_string(), value: "12".to_string() }));
        assert!(counts.contains(&DumpRecord { key: "total".to_string(), value: "13".to_string() }));

        let dns = inspector.dump(&TreeName::new("o=test", "dn2id"), true, Some(2)).unwrap();
        assert_eq!(dns[0], DumpRecord { key: "o=test".to_string(), value: "1".to_string() });
        assert_eq!(dns.len(), 2);

        let stats = inspector.tree_stats().unwrap();
        assert!(stats.iter().all(|s| s.trusted));
        assert_eq!(stats.iter().find(|s| s.tree.index_id == "id2entry").unwrap().record_count, 13);
    }
}
