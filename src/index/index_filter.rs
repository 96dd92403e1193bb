use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::ops::Bound;
use unicode_segmentation::UnicodeSegmentation;
use crate::core::config::IndexType;
use crate::core::dn::normalize_value;
use crate::core::error::Result;
use crate::core::filter::Filter;
use crate::index::attribute_index::{AttributeIndex, MatchingRuleIndex};
use crate::index::entry_id_set::EntryIDSet;
use crate::index::indexer::{Indexer, PRESENCE_KEY};
use crate::storage::tree::ReadableTransaction;

/// Evaluates a search filter against attribute indexes to a candidate set.
/// Components that cannot be answered from an index evaluate to an undefined set.
pub struct IndexFilter<'a> {
    txn: &'a dyn ReadableTransaction,
    indexes: &'a HashMap<String, AttributeIndex>,
    untrusted: &'a HashSet<String>,       // Index IDs that must not be used
    trace: Option<String>,
}

impl<'a> IndexFilter<'a> {
    pub fn new(
        txn: &'a dyn ReadableTransaction,
        indexes: &'a HashMap<String, AttributeIndex>,
        untrusted: &'a HashSet<String>,
        debug: bool,
    ) -> Self {
        IndexFilter { txn, indexes, untrusted, trace: if debug { Some(String::new()) } else { None } }
    }

    /// Evaluation trace, present when debugging was requested
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    fn log(&mut self, text: impl AsRef<str>) {
        if let Some(trace) = &mut self.trace {
            trace.push_str(text.as_ref());
        }
    }

    pub fn evaluate(&mut self, filter: &Filter) -> Result<EntryIDSet> {
        match filter {
            Filter::And(filters) => {
                self.log("(&");
                let mut result = EntryIDSet::undefined();
                for component in filters {
                    let candidates = self.evaluate(component)?;
                    result.retain_all(&candidates);
                    if result.is_empty() {
                        break;
                    }
                }
                self.log(")");
                self.log_result(&result);
                Ok(result)
            }
            Filter::Or(filters) => {
                self.log("(|");
                let mut result = EntryIDSet::new();
                for component in filters {
                    let candidates = self.evaluate(component)?;
                    result.add_all(&candidates);
                    if !result.is_defined() {
                        break;
                    }
                }
                self.log(")");
                self.log_result(&result);
                Ok(result)
            }
            Filter::Not(inner) => {
                self.log(format!("(!{})[NOT-INDEXED]", inner));
                Ok(EntryIDSet::undefined())
            }
            Filter::Equality { attribute, value } => {
                self.read_key(filter, attribute, IndexType::Equality, |indexer| indexer.assertion_key(value))
            }
            Filter::Present(attribute) => {
                self.read_key(filter, attribute, IndexType::Presence, |_| PRESENCE_KEY.to_vec())
            }
            Filter::Approximate { attribute, value } => {
                self.read_key(filter, attribute, IndexType::Approximate, |indexer| indexer.assertion_key(value))
            }
            Filter::GreaterOrEqual { attribute, value } => {
                let Some(index) = self.find(attribute, IndexType::Ordering) else {
                    return Ok(self.not_indexed(filter));
                };
                let key = index.indexer().assertion_key(value);
                let result = index.read_range(self.txn, Bound::Included(key.as_slice()), Bound::Unbounded)?;
                self.log_index(filter, index, &result);
                Ok(result)
            }
            Filter::LessOrEqual { attribute, value } => {
                let Some(index) = self.find(attribute, IndexType::Ordering) else {
                    return Ok(self.not_indexed(filter));
                };
                let key = index.indexer().assertion_key(value);
                let result = index.read_range(self.txn, Bound::Unbounded, Bound::Included(key.as_slice()))?;
                self.log_index(filter, index, &result);
                Ok(result)
            }
            Filter::Substring { attribute, initial, any, final_part } => {
                let Some(index) = self.find(attribute, IndexType::Substring) else {
                    return Ok(self.not_indexed(filter));
                };
                let mut components: Vec<&str> = Vec::new();
                components.extend(initial.as_deref());
                components.extend(any.iter().map(String::as_str));
                components.extend(final_part.as_deref());

                let mut result = EntryIDSet::undefined();
                for component in components {
                    result.retain_all(&self.substring_candidates(index, component)?);
                    if result.is_empty() {
                        break;
                    }
                }
                self.log_index(filter, index, &result);
                Ok(result)
            }
            Filter::Extensible { attribute, rule, value, .. } => {
                let index = match (attribute, rule) {
                    (Some(attribute), Some(rule)) => {
                        self.indexes
                            .get(attribute.as_str())
                            .and_then(|i| i.extensible(rule))
                            .filter(|i| self.is_trusted(i))
                    }
                    (Some(attribute), None) => self.find(attribute, IndexType::Equality),
                    _ => None,
                };
                let Some(index) = index else {
                    return Ok(self.not_indexed(filter));
                };
                let result = index.read(self.txn, &index.indexer().assertion_key(value))?;
                self.log_index(filter, index, &result);
                Ok(result)
            }
        }
    }

    fn find(&self, attribute: &str, index_type: IndexType) -> Option<&'a MatchingRuleIndex> {
        self.indexes
            .get(attribute)
            .and_then(|i| i.index(index_type))
            .filter(|i| self.is_trusted(i))
    }

    fn is_trusted(&self, index: &MatchingRuleIndex) -> bool {
        !self.untrusted.contains(&index.tree().index_id)
    }

    fn read_key(
        &mut self,
        filter: &Filter,
        attribute: &str,
        index_type: IndexType,
        key: impl FnOnce(&Indexer) -> Vec<u8>,
    ) -> Result<EntryIDSet> {
        let Some(index) = self.find(attribute, index_type) else {
            return Ok(self.not_indexed(filter));
        };
        let result = index.read(self.txn, &key(index.indexer()))?;
        self.log_index(filter, index, &result);
        Ok(result)
    }

    fn substring_candidates(&self, index: &MatchingRuleIndex, component: &str) -> Result<EntryIDSet> {
        let Indexer::Substring { length } = index.indexer() else {
            return Ok(EntryIDSet::undefined());
        };
        let normalized = normalize_value(component);
        let graphemes: Vec<&str> = normalized.graphemes(true).collect();
        if graphemes.len() <= *length {
            return index.read_prefix(self.txn, normalized.as_bytes());
        }

        let mut result = EntryIDSet::undefined();
        for start in 0..=(graphemes.len() - length) {
            let key = graphemes[start..start + length].concat();
            result.retain_all(&index.read(self.txn, key.as_bytes())?);
            if result.is_empty() {
                break;
            }
        }
        Ok(result)
    }

    fn not_indexed(&mut self, filter: &Filter) -> EntryIDSet {
        self.log(format!("{}[NOT-INDEXED]", filter));
        EntryIDSet::undefined()
    }

    fn log_index(&mut self, filter: &Filter, index: &MatchingRuleIndex, result: &EntryIDSet) {
        if self.trace.is_some() {
            let mut text = String::new();
            let _ = write!(text, "{}[INDEX:{}]{}", filter, index.tree().index_id, result);
            self.log(text);
        }
    }

    fn log_result(&mut self, result: &EntryIDSet) {
        self.log(result.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::IndexConfig;
    use crate::core::dn::Dn;
    use crate::core::entry::Entry;
    use crate::core::matching::MatchingRuleRegistry;
    use crate::core::types::EntryID;
    use crate::index::index_buffer::IndexBuffer;
    use crate::storage::btree::BTreeStorage;
    use crate::storage::tree::Storage;

    fn setup() -> (Box<dyn Storage>, HashMap<String, AttributeIndex>) {
        let rules = MatchingRuleRegistry::new();
        let mut indexes = HashMap::new();
        for config in [
            IndexConfig::new("cn", &[IndexType::Equality, IndexType::Substring]),
            IndexConfig::new("sn", &[IndexType::Equality]),
        ] {
            let index = AttributeIndex::new("o=test", &config, 4000, 3, &rules).unwrap();
            indexes.insert(index.attribute().to_string(), index);
        }

        let storage: Box<dyn Storage> = Box::new(BTreeStorage::in_memory());
        let mut buffer = IndexBuffer::new();
        for (id, cn, sn) in [(1, "Alice Smith", "smith"), (2, "Bob Smith", "smith"), (3, "Carol Jones", "jones")] {
            let entry = Entry::new(Dn::parse(&format!("cn={},o=test", cn)).unwrap())
                .with("cn", &[cn])
                .with("sn", &[sn]);
            for index in indexes.values() {
                index.add_entry(&mut buffer, EntryID(id), &entry);
            }
        }
        storage
            .write(|txn| {
                for tree in buffer.touched_trees() {
                    txn.open_tree(&tree, true)?;
                }
                buffer.flush(txn)
            })
            .unwrap();
        (storage, indexes)
    }

    fn candidates(storage: &dyn Storage, indexes: &HashMap<String, AttributeIndex>, filter: &str) -> EntryIDSet {
        let filter = Filter::parse(filter).unwrap();
        let txn = storage.begin_read().unwrap();
        let untrusted = HashSet::new();
        IndexFilter::new(txn.as_ref(), indexes, &untrusted, false).evaluate(&filter).unwrap()
    }

    #[test]
    fn boolean_combinations() {
        let (storage, indexes) = setup();
        let ids = |f| candidates(storage.as_ref(), &indexes, f).ids();
        assert_eq!(ids("(sn=smith)"), vec![EntryID(1), EntryID(2)]);
        assert_eq!(ids("(&(sn=smith)(cn=bob smith))"), vec![EntryID(2)]);
        assert_eq!(ids("(|(sn=jones)(cn=Alice Smith))"), vec![EntryID(1), EntryID(3)]);
        assert!(!candidates(storage.as_ref(), &indexes, "(|(sn=jones)(mail=x))").is_defined());
        assert_eq!(ids("(&(sn=smith)(mail=x))"), vec![EntryID(1), EntryID(2)]);
    }

    #[test]
    fn substring_components() {
        let (storage, indexes) = setup();
        let ids = |f| candidates(storage.as_ref(), &indexes, f).ids();
        assert_eq!(ids("(cn=*smi*)"), vec![EntryID(1), EntryID(2)]);
        assert_eq!(ids("(cn=car*nes)"), vec![EntryID(3)]);
        assert_eq!(ids("(cn=*ice smith)"), vec![EntryID(1)]);
    }

    #[test]
    fn debug_trace_names_indexes() {
        let (storage, indexes) = setup();
        let filter = Filter::parse("(&(sn=smith)(mail=x))").unwrap();
        let txn = storage.begin_read().unwrap();
        let untrusted = HashSet::new();
        let mut evaluator = IndexFilter::new(txn.as_ref(), &indexes, &untrusted, true);
        evaluator.evaluate(&filter).unwrap();
        let trace = evaluator.trace().unwrap();
        assert!(trace.contains("[INDEX:sn.equality][COUNT:2]"));
        assert!(trace.contains("[NOT-INDEXED]"));
    }

    #[test]
    fn untrusted_indexes_are_ignored() {
        let (storage, indexes) = setup();
        let filter = Filter::parse("(sn=smith)").unwrap();
        let txn = storage.begin_read().unwrap();
        let untrusted = HashSet::from(["sn.equality".to_string()]);
        let result = IndexFilter::new(txn.as_ref(), &indexes, &untrusted, false).evaluate(&filter).unwrap();
        assert!(!result.is_defined());
    }
}
