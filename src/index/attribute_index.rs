use std::collections::BTreeSet;
use std::ops::Bound;
use crate::core::config::{IndexConfig, IndexType};
use crate::core::entry::{Entry, Modification};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::matching::MatchingRuleRegistry;
use crate::core::types::EntryID;
use crate::index::entry_id_set::EntryIDSet;
use crate::index::index_buffer::IndexBuffer;
use crate::index::indexer::Indexer;
use crate::storage::tree::{Cursor, ReadableTransaction, TreeName};

/// One index tree of an attribute: index key to entry ID set
#[derive(Debug, Clone)]
pub struct MatchingRuleIndex {
    tree: TreeName,
    attribute: String,
    indexer: Indexer,
    entry_limit: u64,
}

impl MatchingRuleIndex {
    pub fn new(prefix: &str, attribute: &str, indexer: Indexer, entry_limit: u64) -> Self {
        let tree = TreeName::new(prefix, &format!("{}.{}", attribute, indexer.index_id()));
        MatchingRuleIndex { tree, attribute: attribute.to_string(), indexer, entry_limit }
    }

    pub fn tree(&self) -> &TreeName {
        &self.tree
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn entry_limit(&self) -> u64 {
        self.entry_limit
    }

    /// Keys the entry contributes to this index
    pub fn entry_keys(&self, entry: &Entry) -> BTreeSet<Vec<u8>> {
        self.indexer.keys(entry.values(&self.attribute))
    }

    /// IDs stored under `key`, empty when absent
    pub fn read(&self, txn: &dyn ReadableTransaction, key: &[u8]) -> Result<EntryIDSet> {
        match txn.read(&self.tree, key)? {
            Some(bytes) => EntryIDSet::from_bytes(&bytes),
            None => Ok(EntryIDSet::new()),
        }
    }

    /// Union of the sets whose keys fall in the range, undefined once it passes the entry limit
    pub fn read_range(
        &self,
        txn: &dyn ReadableTransaction,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<EntryIDSet> {
        let mut cursor = Cursor::new(txn, &self.tree);
        let mut found = match lower {
            Bound::Included(key) => cursor.position_to_key_or_next(key)?,
            Bound::Excluded(key) => {
                cursor.position_to_key_or_next(key)?
                    && (cursor.key().map(|k| k.as_ref() != key).unwrap_or(false) || cursor.next()?)
            }
            Bound::Unbounded => cursor.next()?,
        };

        let mut result = EntryIDSet::new();
        while found {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            let within = match upper {
                Bound::Included(end) => key.as_ref() <= end,
                Bound::Excluded(end) => key.as_ref() < end,
                Bound::Unbounded => true,
            };
            if !within {
                break;
            }
            result.add_all(&EntryIDSet::from_bytes(value)?);
            result.apply_limit(self.entry_limit);
            if !result.is_defined() {
                return Ok(EntryIDSet::undefined());
            }
            found = cursor.next()?;
        }
        Ok(result)
    }

    /// Union of the sets whose keys start with `prefix`
    pub fn read_prefix(&self, txn: &dyn ReadableTransaction, prefix: &[u8]) -> Result<EntryIDSet> {
        match prefix_upper_bound(prefix) {
            Some(upper) => self.read_range(txn, Bound::Included(prefix), Bound::Excluded(upper.as_slice())),
            None => self.read_range(txn, Bound::Included(prefix), Bound::Unbounded),
        }
    }

    fn add_keys(&self, buffer: &mut IndexBuffer, keys: impl IntoIterator<Item = Vec<u8>>, id: EntryID) {
        for key in keys {
            buffer.put_id(&self.tree, self.entry_limit, key, id);
        }
    }

    fn remove_keys(&self, buffer: &mut IndexBuffer, keys: impl IntoIterator<Item = Vec<u8>>, id: EntryID) {
        for key in keys {
            buffer.remove_id(&self.tree, self.entry_limit, key, id);
        }
    }
}

/// Smallest byte string greater than every string starting with `prefix`
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// All configured index trees of one attribute
#[derive(Debug, Clone)]
pub struct AttributeIndex {
    attribute: String,
    indexes: Vec<MatchingRuleIndex>,
}

impl AttributeIndex {
    pub fn new(
        prefix: &str,
        config: &IndexConfig,
        default_limit: u32,
        default_substring_length: usize,
        rules: &MatchingRuleRegistry,
    ) -> Result<Self> {
        let attribute = config.attribute.to_ascii_lowercase();
        let entry_limit = config.index_entry_limit.unwrap_or(default_limit) as u64;
        let mut types = config.index_types.clone();
        types.sort();
        types.dedup();

        let mut indexes = Vec::new();
        for index_type in types {
            match index_type {
                IndexType::Presence => indexes.push(Indexer::Presence),
                IndexType::Equality => indexes.push(Indexer::Equality),
                IndexType::Ordering => indexes.push(Indexer::Ordering),
                IndexType::Substring => indexes.push(Indexer::Substring {
                    length: config.substring_length.unwrap_or(default_substring_length),
                }),
                IndexType::Approximate => indexes.push(Indexer::Approximate),
                IndexType::Extensible => {
                    for name in &config.extensible_rules {
                        let rule = rules.get(name).ok_or_else(|| Error::new(
                            ErrorKind::InvalidArgument,
                            format!("unknown matching rule {} for index {}", name, attribute),
                        ))?;
                        indexes.push(Indexer::Extensible(rule));
                    }
                }
            }
        }

        let indexes = indexes
            .into_iter()
            .map(|indexer| MatchingRuleIndex::new(prefix, &attribute, indexer, entry_limit))
            .collect();
        Ok(AttributeIndex { attribute, indexes })
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn indexes(&self) -> &[MatchingRuleIndex] {
        &self.indexes
    }

    pub fn index(&self, index_type: IndexType) -> Option<&MatchingRuleIndex> {
        self.indexes.iter().find(|i| i.indexer.index_type() == index_type)
    }

    pub fn extensible(&self, rule_name: &str) -> Option<&MatchingRuleIndex> {
        let wanted = format!("ext.{}", rule_name.to_ascii_lowercase());
        self.indexes.iter().find(|i| i.indexer.index_id() == wanted)
    }

    pub fn add_entry(&self, buffer: &mut IndexBuffer, id: EntryID, entry: &Entry) {
        for index in &self.indexes {
            index.add_keys(buffer, index.entry_keys(entry), id);
        }
    }

    pub fn remove_entry(&self, buffer: &mut IndexBuffer, id: EntryID, entry: &Entry) {
        for index in &self.indexes {
            index.remove_keys(buffer, index.entry_keys(entry), id);
        }
    }

    /// Buffer only the key differences between two versions of an entry
    pub fn modify_entry(&self, buffer: &mut IndexBuffer, id: EntryID, old: &Entry, new: &Entry) {
        for index in &self.indexes {
            let old_keys = index.entry_keys(old);
            let new_keys = index.entry_keys(new);
            index.remove_keys(buffer, old_keys.difference(&new_keys).cloned(), id);
            index.add_keys(buffer, new_keys.difference(&old_keys).cloned(), id);
        }
    }

    pub fn is_modified_by(&self, modifications: &[Modification]) -> bool {
        modifications.iter().any(|m| m.attribute_key() == self.attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dn::Dn;
    use crate::storage::btree::BTreeStorage;
    use crate::storage::tree::Storage;

    fn person(cn: &str, age: &str) -> Entry {
        Entry::new(Dn::parse(&format!("cn={},o=test", cn)).unwrap())
            .with("cn", &[cn])
            .with("age", &[age])
    }

    #[test]
    fn range_and_prefix_reads() {
        let rules = MatchingRuleRegistry::new();
        let config = IndexConfig::new("age", &[IndexType::Ordering, IndexType::Equality]);
        let index = AttributeIndex::new("o=test", &config, 4000, 6, &rules).unwrap();
        let storage: Box<dyn Storage> = Box::new(BTreeStorage::in_memory());

        let mut buffer = IndexBuffer::new();
        for (id, age) in [(1, "20"), (2, "35"), (3, "50")] {
            index.add_entry(&mut buffer, EntryID(id), &person(&format!("p{}", id), age));
        }
        storage
            .write(|txn| {
                for tree in buffer.touched_trees() {
                    txn.open_tree(&tree, true)?;
                }
                buffer.flush(txn)
            })
            .unwrap();

        let ordering = index.index(IndexType::Ordering).unwrap();
        storage
            .read(|txn| {
                let key = ordering.indexer().assertion_key("35");
                let at_least = ordering.read_range(txn, Bound::Included(key.as_slice()), Bound::Unbounded)?;
                assert_eq!(at_least.ids(), vec![EntryID(2), EntryID(3)]);
                let above = ordering.read_range(txn, Bound::Excluded(key.as_slice()), Bound::Unbounded)?;
                assert_eq!(above.ids(), vec![EntryID(3)]);
                let equality = index.index(IndexType::Equality).unwrap();
                assert_eq!(equality.read_prefix(txn, b"")?.ids().len(), 3);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn modify_buffers_only_differences() {
        let rules = MatchingRuleRegistry::new();
        let config = IndexConfig::new("cn", &[IndexType::Equality]);
        let index = AttributeIndex::new("o=test", &config, 4000, 6, &rules).unwrap();
        let old = person("a", "1");
        let new = person("a", "2").with("cn", &["b"]);

        let mut buffer = IndexBuffer::new();
        index.modify_entry(&mut buffer, EntryID(1), &old, &new);
        assert!(!buffer.is_empty());

        let mut unchanged = IndexBuffer::new();
        index.modify_entry(&mut unchanged, EntryID(1), &old, &person("a", "3"));
        assert!(unchanged.is_empty());
        assert!(prefix_upper_bound(&[0xff]).is_none());
        assert_eq!(prefix_upper_bound(b"ab").unwrap(), b"ac".to_vec());
    }
}
