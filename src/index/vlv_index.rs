use crate::core::config::VlvIndexConfig;
use crate::core::dn::Dn;
use crate::core::entry::Entry;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::filter::Filter;
use crate::core::matching::{ordering_key, MatchingRuleRegistry};
use crate::core::operation::{SearchRequest, SortKey, VlvControl, VlvTarget};
use crate::core::types::{EntryID, SearchScope};
use crate::index::index_buffer::IndexBuffer;
use crate::storage::tree::{Cursor, ReadableTransaction, TreeName};

const VALUE_PRESENT: u8 = 0x00;
const VALUE_ABSENT: u8 = 0x01;

/// Encode the sort values of an entry; a trailing entry ID keeps keys unique.
/// Entries without a sort attribute sort after every entry that has one.
pub fn encode_sort_key(entry: &Entry, keys: &[SortKey], id: Option<EntryID>) -> Vec<u8> {
    let mut out = Vec::new();
    for key in keys {
        let mut values: Vec<Vec<u8>> = entry.values(&key.attribute).iter().map(|v| ordering_key(v)).collect();
        values.sort();
        let chosen = if key.reverse { values.pop() } else { values.into_iter().next() };
        match chosen {
            Some(value) => append_value(&mut out, &value, key.reverse),
            None => out.push(VALUE_ABSENT),
        }
    }
    if let Some(id) = id {
        out.extend_from_slice(&id.to_key());
    }
    out
}

/// Key positioned before every entry whose first sort value is >= `assertion`
pub fn encode_assertion(assertion: &str, keys: &[SortKey]) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(first) = keys.first() {
        append_value(&mut out, &ordering_key(assertion), first.reverse);
    }
    out
}

// Escaped, terminated and (for reverse keys) bit-inverted so byte order follows sort order
fn append_value(out: &mut Vec<u8>, value: &[u8], reverse: bool) {
    out.push(VALUE_PRESENT);
    let start = out.len();
    for &byte in value {
        if byte == 0x00 {
            out.extend_from_slice(&[0x00, 0x01]);
        } else {
            out.push(byte);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
    if reverse {
        for byte in &mut out[start..] {
            *byte = !*byte;
        }
    }
}

/// Entries selected by a VLV request
#[derive(Debug, Clone, PartialEq)]
pub struct VlvWindow {
    pub ids: Vec<EntryID>,
    pub target_position: u64,
    pub content_count: u64,
}

/// Resolve a VLV request against a sorted list of (sort key, ID) records
pub fn select_window(sorted: &[(Vec<u8>, EntryID)], control: &VlvControl, keys: &[SortKey]) -> Result<VlvWindow> {
    match &control.target {
        VlvTarget::Offset(offset) => select_by_offset(sorted, control.before_count, control.after_count, *offset),
        VlvTarget::GreaterThanOrEqual(assertion) => {
            let key = encode_assertion(assertion, keys);
            Ok(select_by_assertion(sorted, control.before_count, control.after_count, &key))
        }
    }
}

pub fn select_by_offset(
    sorted: &[(Vec<u8>, EntryID)],
    before_count: usize,
    after_count: usize,
    offset: i64,
) -> Result<VlvWindow> {
    if offset < 0 {
        return Err(Error::new(
            ErrorKind::VirtualListViewError,
            format!("negative VLV offset {}", offset),
        ));
    }
    let size = sorted.len() as i64;
    let mut target_offset = offset.max(1);
    let mut list_offset = target_offset - 1;
    let mut before = before_count as i64;
    let mut after = after_count as i64;
    let mut start = list_offset - before;

    if start < 0 {
        start = 0;
        before = list_offset;
    } else if start >= size {
        // Past the end: behave as if the target were one after the last entry
        target_offset = size + 1;
        list_offset = size;
        start = (list_offset - before).max(0);
        after = 0;
    }

    let count = (1 + before + after) as usize;
    let ids = sorted.iter().skip(start as usize).take(count).map(|(_, id)| *id).collect();
    Ok(VlvWindow { ids, target_position: target_offset as u64, content_count: size as u64 })
}

pub fn select_by_assertion(
    sorted: &[(Vec<u8>, EntryID)],
    before_count: usize,
    after_count: usize,
    assertion: &[u8],
) -> VlvWindow {
    let size = sorted.len();
    let index = sorted.partition_point(|(key, _)| key.as_slice() < assertion);
    if index >= size {
        return VlvWindow { ids: Vec::new(), target_position: size as u64 + 1, content_count: size as u64 };
    }
    let start = index.saturating_sub(before_count);
    let end = (index + after_count + 1).min(size);
    VlvWindow {
        ids: sorted[start..end].iter().map(|(_, id)| *id).collect(),
        target_position: index as u64 + 1,
        content_count: size as u64,
    }
}

/// Sorted view over the entries matching a base, scope and filter
#[derive(Debug, Clone)]
pub struct VLVIndex {
    tree: TreeName,
    name: String,
    base_dn: Dn,
    scope: SearchScope,
    filter: Filter,
    sort_keys: Vec<SortKey>,
}

impl VLVIndex {
    pub fn new(prefix: &str, config: &VlvIndexConfig) -> Result<Self> {
        let sort_keys = SortKey::parse_order(&config.sort_order);
        if sort_keys.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("VLV index {} has no sort keys", config.name),
            ));
        }
        Ok(VLVIndex {
            tree: TreeName::new(prefix, &format!("vlv.{}", config.name.to_ascii_lowercase())),
            name: config.name.clone(),
            base_dn: Dn::parse(&config.base_dn)?,
            scope: config.scope,
            filter: Filter::parse(&config.filter)?,
            sort_keys,
        })
    }

    pub fn tree(&self) -> &TreeName {
        &self.tree
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort_keys
    }

    pub fn is_included(&self, entry: &Entry, rules: &MatchingRuleRegistry) -> bool {
        entry.dn.matches_base_and_scope(&self.base_dn, self.scope) && self.filter.matches(entry, rules)
    }

    /// Record the entry contributes, if any
    pub fn record_key(&self, id: EntryID, entry: &Entry, rules: &MatchingRuleRegistry) -> Option<Vec<u8>> {
        if self.is_included(entry, rules) {
            Some(encode_sort_key(entry, &self.sort_keys, Some(id)))
        } else {
            None
        }
    }

    pub fn add_entry(&self, buffer: &mut IndexBuffer, id: EntryID, entry: &Entry, rules: &MatchingRuleRegistry) {
        if let Some(key) = self.record_key(id, entry, rules) {
            buffer.put_record(&self.tree, key, id);
        }
    }

    pub fn remove_entry(&self, buffer: &mut IndexBuffer, id: EntryID, entry: &Entry, rules: &MatchingRuleRegistry) {
        if let Some(key) = self.record_key(id, entry, rules) {
            buffer.remove_record(&self.tree, key);
        }
    }

    pub fn modify_entry(
        &self,
        buffer: &mut IndexBuffer,
        id: EntryID,
        old: &Entry,
        new: &Entry,
        rules: &MatchingRuleRegistry,
    ) {
        let old_key = self.record_key(id, old, rules);
        let new_key = self.record_key(id, new, rules);
        if old_key == new_key {
            return;
        }
        if let Some(key) = old_key {
            buffer.remove_record(&self.tree, key);
        }
        if let Some(key) = new_key {
            buffer.put_record(&self.tree, key, id);
        }
    }

    /// True if this index can answer the sorted search as requested
    pub fn serves(&self, request: &SearchRequest, sort_keys: &[SortKey]) -> bool {
        request.base == self.base_dn
            && request.scope == self.scope
            && request.filter.to_string().eq_ignore_ascii_case(&self.filter.to_string())
            && sort_keys == self.sort_keys.as_slice()
    }

    /// Every record in sort order
    pub fn sorted_records(&self, txn: &dyn ReadableTransaction) -> Result<Vec<(Vec<u8>, EntryID)>> {
        let mut records = Vec::new();
        let mut cursor = Cursor::new(txn, &self.tree);
        while cursor.next()? {
            if let (Some(key), Some(value)) = (cursor.key(), cursor.value()) {
                records.push((key.to_vec(), EntryID::from_key(value)?));
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(count: u64) -> Vec<(Vec<u8>, EntryID)> {
        (1..=count).map(|i| (vec![i as u8], EntryID(i))).collect()
    }

    #[test]
    fn offset_window_in_the_middle() {
        let window = select_by_offset(&records(10), 2, 2, 5).unwrap();
        assert_eq!(window.ids, (3..=7).map(EntryID).collect::<Vec<_>>());
        assert_eq!(window.target_position, 5);
        assert_eq!(window.content_count, 10);
    }

    #[test]
    fn offset_window_at_the_edges() {
        let window = select_by_offset(&records(10), 3, 1, 0).unwrap();
        assert_eq!(window.ids, vec![EntryID(1), EntryID(2)]);
        assert_eq!(window.target_position, 1);

        let window = select_by_offset(&records(10), 2, 5, 20).unwrap();
        assert_eq!(window.ids, vec![EntryID(9), EntryID(10)]);
        assert_eq!(window.target_position, 11);

        assert_eq!(
            select_by_offset(&records(10), 0, 0, -1).unwrap_err().kind,
            ErrorKind::VirtualListViewError
        );
    }

    #[test]
    fn assertion_window() {
        let keys = vec![SortKey::new("sn", false)];
        let mut sorted: Vec<(Vec<u8>, EntryID)> = ["delta", "alpha", "charlie", "bravo"]
            .iter()
            .enumerate()
            .map(|(i, sn)| {
                let entry = Entry::new(Dn::parse(&format!("cn={},o=x", sn)).unwrap()).with("sn", &[sn]);
                let id = EntryID(i as u64 + 1);
                (encode_sort_key(&entry, &keys, Some(id)), id)
            })
            .collect();
        sorted.sort();

        let window = select_by_assertion(&sorted, 1, 1, &encode_assertion("c", &keys));
        assert_eq!(window.ids, vec![EntryID(4), EntryID(3), EntryID(1)]);
        assert_eq!(window.target_position, 3);

        let missing = select_by_assertion(&sorted, 1, 1, &encode_assertion("zulu", &keys));
        assert!(missing.ids.is_empty());
        assert_eq!(missing.target_position, 5);
    }

    #[test]
    fn reverse_and_missing_values() {
        let keys = vec![SortKey::new("sn", true)];
        let a = Entry::new(Dn::parse("cn=a,o=x").unwrap()).with("sn", &["a"]);
        let b = Entry::new(Dn::parse("cn=b,o=x").unwrap()).with("sn", &["b"]);
        let none = Entry::new(Dn::parse("cn=c,o=x").unwrap());
        let ka = encode_sort_key(&a, &keys, None);
        let kb = encode_sort_key(&b, &keys, None);
        let kn = encode_sort_key(&none, &keys, None);
        assert!(kb < ka);
        assert!(ka < kn);
    }
}
