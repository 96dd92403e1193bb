use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;
use rust_stemmers::{Algorithm, Stemmer};
use unicode_segmentation::UnicodeSegmentation;
use crate::core::dn::normalize_value;

/// Matching rule consumed by extensible indexes and filters
pub trait MatchingRule: Send + Sync {
    fn name(&self) -> &str;

    /// Normalized form used both as index key and for comparisons
    fn normalize(&self, value: &str) -> Vec<u8>;

    fn matches(&self, attribute_value: &str, assertion: &str) -> bool {
        self.normalize(attribute_value) == self.normalize(assertion)
    }
}

pub struct CaseIgnoreMatch;

impl MatchingRule for CaseIgnoreMatch {
    fn name(&self) -> &str {
        "caseIgnoreMatch"
    }

    fn normalize(&self, value: &str) -> Vec<u8> {
        normalize_value(value).into_bytes()
    }
}

pub struct CaseExactMatch;

impl MatchingRule for CaseExactMatch {
    fn name(&self) -> &str {
        "caseExactMatch"
    }

    fn normalize(&self, value: &str) -> Vec<u8> {
        value.split_whitespace().collect::<Vec<_>>().join(" ").into_bytes()
    }
}

pub struct IntegerMatch;

impl MatchingRule for IntegerMatch {
    fn name(&self) -> &str {
        "integerMatch"
    }

    fn normalize(&self, value: &str) -> Vec<u8> {
        ordering_key(value)
    }
}

pub struct OctetStringMatch;

impl MatchingRule for OctetStringMatch {
    fn name(&self) -> &str {
        "octetStringMatch"
    }

    fn normalize(&self, value: &str) -> Vec<u8> {
        value.as_bytes().to_vec()
    }
}

/// Named matching rules, open to custom registrations
pub struct MatchingRuleRegistry {
    rules: RwLock<HashMap<String, Arc<dyn MatchingRule>>>,
}

impl MatchingRuleRegistry {
    pub fn new() -> Self {
        let registry = MatchingRuleRegistry { rules: RwLock::new(HashMap::new()) };
        registry.register(Arc::new(CaseIgnoreMatch));
        registry.register(Arc::new(CaseExactMatch));
        registry.register(Arc::new(IntegerMatch));
        registry.register(Arc::new(OctetStringMatch));
        registry
    }

    pub fn register(&self, rule: Arc<dyn MatchingRule>) {
        self.rules.write().insert(rule.name().to_ascii_lowercase(), rule);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MatchingRule>> {
        self.rules.read().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.read().values().map(|r| r.name().to_string()).collect();
        names.sort();
        names
    }
}

impl Default for MatchingRuleRegistry {
    fn default() -> Self {
        MatchingRuleRegistry::new()
    }
}

/// Order-preserving key: integers sort numerically and before strings
pub fn ordering_key(value: &str) -> Vec<u8> {
    let trimmed = value.trim();
    match trimmed.parse::<i64>() {
        Ok(number) => {
            let mut key = Vec::with_capacity(9);
            key.push(0x00);
            key.extend_from_slice(&((number as u64) ^ (1 << 63)).to_be_bytes());
            key
        }
        Err(_) => {
            let normalized = normalize_value(trimmed);
            let mut key = Vec::with_capacity(normalized.len() + 1);
            key.push(0x01);
            key.extend_from_slice(normalized.as_bytes());
            key
        }
    }
}

/// Stemmed words of a value, used for approximate matching
pub fn approximate_key(value: &str) -> String {
    let stemmer = Stemmer::create(Algorithm::English);
    normalize_value(value)
        .unicode_words()
        .map(|word| stemmer.stem(word).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Grapheme windows of `length` starting at every position of the normalized value.
/// Tail windows are shorter so prefix scans can find short assertions.
pub fn substring_keys(value: &str, length: usize) -> Vec<String> {
    let normalized = normalize_value(value);
    let graphemes: Vec<&str> = normalized.graphemes(true).collect();
    let length = length.max(1);

    let mut keys = Vec::with_capacity(graphemes.len());
    for start in 0..graphemes.len() {
        let end = (start + length).min(graphemes.len());
        keys.push(graphemes[start..end].concat());
    }
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_keys_sort_numbers_before_strings() {
        assert!(ordering_key("-5") < ordering_key("3"));
        assert!(ordering_key("3") < ordering_key("20"));
        assert!(ordering_key("20") < ordering_key("abc"));
        assert!(ordering_key("Abc") == ordering_key("abc"));
    }

    #[test]
    fn substring_windows() {
        let keys = substring_keys("Smith", 3);
        assert_eq!(keys, vec!["h", "ith", "mit", "smi", "th"]);
    }

    #[test]
    fn approximate_uses_stems() {
        assert_eq!(approximate_key("Running"), approximate_key("runs"));
    }

    #[test]
    fn registry_lookup_ignores_case() {
        let registry = MatchingRuleRegistry::new();
        let rule = registry.get("CASEEXACTMATCH").unwrap();
        assert!(!rule.matches("Smith", "smith"));
        assert!(registry.get("caseIgnoreMatch").unwrap().matches("Smith", "smith"));
        assert!(registry.get("unknown").is_none());
    }
}
