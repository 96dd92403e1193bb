use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use crate::core::config::IndexType;
use crate::core::dn::normalize_value;
use crate::core::matching::{approximate_key, ordering_key, substring_keys, MatchingRule};

/// Key the presence index stores every entry under
pub const PRESENCE_KEY: &[u8] = b"+";

/// Turns attribute values into index keys for one index flavour
#[derive(Clone)]
pub enum Indexer {
    Presence,
    Equality,
    Ordering,
    Substring { length: usize },
    Approximate,
    Extensible(Arc<dyn MatchingRule>),
}

impl Indexer {
    pub fn index_type(&self) -> IndexType {
        match self {
            Indexer::Presence => IndexType::Presence,
            Indexer::Equality => IndexType::Equality,
            Indexer::Ordering => IndexType::Ordering,
            Indexer::Substring { .. } => IndexType::Substring,
            Indexer::Approximate => IndexType::Approximate,
            Indexer::Extensible(_) => IndexType::Extensible,
        }
    }

    /// Suffix of the tree name, e.g. "equality" or "ext.caseexactmatch"
    pub fn index_id(&self) -> String {
        match self {
            Indexer::Extensible(rule) => format!("ext.{}", rule.name().to_ascii_lowercase()),
            other => other.index_type().name().to_string(),
        }
    }

    /// Keys contributed by one value
    pub fn value_keys(&self, value: &str, keys: &mut BTreeSet<Vec<u8>>) {
        match self {
            Indexer::Presence => {
                keys.insert(PRESENCE_KEY.to_vec());
            }
            Indexer::Equality => {
                keys.insert(self.assertion_key(value));
            }
            Indexer::Ordering => {
                keys.insert(ordering_key(value));
            }
            Indexer::Substring { length } => {
                for key in substring_keys(value, *length) {
                    keys.insert(key.into_bytes());
                }
            }
            Indexer::Approximate => {
                keys.insert(approximate_key(value).into_bytes());
            }
            Indexer::Extensible(rule) => {
                keys.insert(rule.normalize(value));
            }
        }
    }

    /// Keys contributed by all values of an attribute
    pub fn keys(&self, values: &[String]) -> BTreeSet<Vec<u8>> {
        let mut keys = BTreeSet::new();
        if values.is_empty() {
            return keys;
        }
        for value in values {
            self.value_keys(value, &mut keys);
        }
        keys
    }

    /// Key to look up for an assertion value
    pub fn assertion_key(&self, value: &str) -> Vec<u8> {
        match self {
            Indexer::Presence => PRESENCE_KEY.to_vec(),
            Indexer::Equality => normalize_value(value).into_bytes(),
            Indexer::Ordering => ordering_key(value),
            Indexer::Substring { .. } => normalize_value(value).into_bytes(),
            Indexer::Approximate => approximate_key(value).into_bytes(),
            Indexer::Extensible(rule) => rule.normalize(value),
        }
    }
}

impl fmt::Debug for Indexer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Indexer({})", self.index_id())
    }
}
