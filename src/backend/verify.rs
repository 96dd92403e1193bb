use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use bytes::Bytes;
use log::{debug, info, warn};
use serde::{Serialize, Deserialize};
use crate::backend::entry_container::{ContainerIndexes, EntryContainer};
use crate::core::config::VerifyConfig;
use crate::core::dn::Dn;
use crate::core::entry::Entry;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntryID;
use crate::import::strategy::TreeSelection;
use crate::index::dn2uri::ReferralRecord;
use crate::index::entry_id_set::EntryIDSet;
use crate::index::id2count::{decode_count, TOTAL_COUNT_ID};
use crate::storage::tree::{Cursor, ReadableTransaction, TreeName};

/// Error counts of one verify run, keyed by index ID
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyResult {
    pub base_dn: String,
    pub clean: bool,
    pub checked: u64,                        // Entries (complete) or records (clean) examined
    pub errors: BTreeMap<String, u64>,
    pub elapsed_ms: u64,
}

impl VerifyResult {
    pub fn error_count(&self) -> u64 {
        self.errors.values().sum()
    }

    pub fn errors_in(&self, index_id: &str) -> u64 {
        self.errors.get(index_id).copied().unwrap_or(0)
    }

    fn record(&mut self, tree: &TreeName, message: impl FnOnce() -> String) {
        *self.errors.entry(tree.index_id.clone()).or_insert(0) += 1;
        debug!("[Verify] {}: {}", tree, message());
    }
}

/// Check the trees of `container` named by `config` against id2entry
pub fn verify(container: &EntryContainer, config: &VerifyConfig) -> Result<VerifyResult> {
    let start = Instant::now();
    let indexes = container.indexes();
    let selection = if config.indexes.is_empty() {
        if config.clean {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "clean mode verifies exactly one index".to_string(),
            ));
        }
        TreeSelection::all(&indexes)
    } else {
        if config.clean && config.indexes.len() > 1 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("clean mode verifies exactly one index, got {}", config.indexes.len()),
            ));
        }
        TreeSelection::from_names(&indexes, &config.indexes)?
    };

    let mut result = VerifyResult {
        base_dn: container.base_dn().to_string(),
        clean: config.clean,
        ..VerifyResult::default()
    };
    let verifier = Verifier { container, indexes: &indexes, selection: &selection };
    info!(
        "[Verify] {} verification of {} started",
        if config.clean { "Clean" } else { "Complete" },
        container.base_dn()
    );
    container.storage().read(|txn| {
        if config.clean {
            verifier.clean(txn, &mut result)
        } else {
            verifier.complete(txn, &mut result)
        }
    })?;
    result.elapsed_ms = start.elapsed().as_millis() as u64;

    if result.error_count() > 0 {
        warn!(
            "[Verify] {} errors in {} after checking {} records: {:?}",
            result.error_count(), result.base_dn, result.checked, result.errors
        );
    } else {
        info!("[Verify] {} records of {} verified without errors", result.checked, result.base_dn);
    }
    Ok(result)
}

struct Verifier<'a> {
    container: &'a EntryContainer,
    indexes: &'a ContainerIndexes,
    selection: &'a TreeSelection,
}

impl Verifier<'_> {
    fn selected(&self, tree: &TreeName) -> bool {
        self.selection.indexes.contains(&tree.index_id)
    }

    fn entry(&self, txn: &dyn ReadableTransaction, id: EntryID) -> Result<Option<Entry>> {
        self.indexes.id2entry().get(txn, id)
    }

    fn complete(&self, txn: &dyn ReadableTransaction, result: &mut VerifyResult) -> Result<()> {
        let dn2id = self.container.dn2id();
        let base = self.container.base_dn();
        let rules = self.container.rules();
        let id2entry = self.indexes.id2entry();
        let mut children: HashMap<EntryID, i64> = HashMap::new();
        let mut vlv_records: HashMap<String, u64> = HashMap::new();

        let mut cursor = Cursor::new(txn, id2entry.tree());
        while cursor.next()? {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            let id = EntryID::from_key(key)?;
            let entry = match id2entry.codec().decode(value) {
                Ok(entry) => entry,
                Err(e) => {
                    result.record(id2entry.tree(), || format!("entry {} cannot be decoded: {}", id, e));
                    continue;
                }
            };
            result.checked += 1;

            if self.selection.dn2id || self.selection.id2count {
                let mapped = dn2id.get(txn, &entry.dn)?;
                if self.selection.dn2id && mapped != Some(id) {
                    result.record(dn2id.tree(), || format!("{} maps to {:?} instead of {}", entry.dn, mapped, id));
                }
                if entry.dn != *base {
                    match entry.dn.parent().map(|parent| dn2id.get(txn, &parent)).transpose()?.flatten() {
                        Some(parent_id) => *children.entry(parent_id).or_insert(0) += 1,
                        None if self.selection.dn2id => {
                            result.record(dn2id.tree(), || format!("parent of {} is missing", entry.dn))
                        }
                        None => {}
                    }
                }
            }

            if self.selection.dn2uri && entry.is_referral() && self.container.dn2uri().get(txn, &entry.dn)?.is_none() {
                result.record(self.container.dn2uri().tree(), || format!("referral {} is not recorded", entry.dn));
            }

            for index in self.indexes.ordered().flat_map(|a| a.indexes()) {
                if !self.selected(index.tree()) {
                    continue;
                }
                for index_key in index.entry_keys(&entry) {
                    let set = index.read(txn, &index_key)?;
                    if set.is_defined() && !set.contains(id) {
                        result.record(index.tree(), || format!("key {:?} misses entry {}", index_key, id));
                    }
                }
            }

            for vlv in self.indexes.vlv_indexes() {
                if !self.selected(vlv.tree()) {
                    continue;
                }
                if let Some(record_key) = vlv.record_key(id, &entry, rules) {
                    *vlv_records.entry(vlv.tree().index_id.clone()).or_insert(0) += 1;
                    if txn.read(vlv.tree(), &record_key)?.is_none() {
                        result.record(vlv.tree(), || format!("entry {} has no sort record", id));
                    }
                }
            }
        }

        if self.selection.dn2id {
            let (records, entries) = (txn.record_count(dn2id.tree())?, result.checked);
            if records != entries {
                result.record(dn2id.tree(), || format!("{} records for {} entries", records, entries));
            }
        }
        if self.selection.id2count {
            self.complete_counts(txn, children, result)?;
        }
        for vlv in self.indexes.vlv_indexes() {
            if !self.selected(vlv.tree()) {
                continue;
            }
            let expected = vlv_records.get(&vlv.tree().index_id).copied().unwrap_or(0);
            let records = txn.record_count(vlv.tree())?;
            if records != expected {
                result.record(vlv.tree(), || format!("{} records for {} included entries", records, expected));
            }
        }
        Ok(())
    }

    // Stored counters against the children tallied from dn2id
    fn complete_counts(
        &self,
        txn: &dyn ReadableTransaction,
        mut children: HashMap<EntryID, i64>,
        result: &mut VerifyResult,
    ) -> Result<()> {
        let tree = self.container.id2count().tree();
        let mut total = None;
        let mut cursor = Cursor::new(txn, tree);
        while cursor.next()? {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            let id = EntryID::from_key(key)?;
            let count = decode_count(value)?;
            if id == TOTAL_COUNT_ID {
                total = Some(count);
                continue;
            }
            let expected = children.remove(&id).unwrap_or(0);
            if count != expected {
                result.record(tree, || format!("entry {} counts {} children, found {}", id, count, expected));
            }
        }
        for (id, expected) in children {
            result.record(tree, || format!("entry {} has {} children but no counter", id, expected));
        }
        let entries = result.checked as i64;
        if total.unwrap_or(0) != entries {
            result.record(tree, || format!("total is {:?} for {} entries", total, entries));
        }
        Ok(())
    }

    fn clean(&self, txn: &dyn ReadableTransaction, result: &mut VerifyResult) -> Result<()> {
        if self.selection.dn2id {
            self.clean_dn2id(txn, result)?;
        }
        if self.selection.id2count {
            self.clean_counts(txn, result)?;
        }
        if self.selection.dn2uri {
            self.clean_dn2uri(txn, result)?;
        }
        for index in self.indexes.ordered().flat_map(|a| a.indexes()) {
            if !self.selected(index.tree()) {
                continue;
            }
            for_each_record(txn, index.tree(), |key, value| {
                result.checked += 1;
                let set = EntryIDSet::from_bytes(&value)?;
                if !set.is_defined() {
                    return Ok(());
                }
                for id in set.ids() {
                    match self.entry(txn, id)? {
                        None => result.record(index.tree(), || format!("entry {} does not exist", id)),
                        Some(entry) if !index.entry_keys(&entry).contains(&key[..]) => {
                            result.record(index.tree(), || format!("entry {} does not produce key {:?}", id, key))
                        }
                        Some(_) => {}
                    }
                }
                Ok(())
            })?;
        }
        for vlv in self.indexes.vlv_indexes() {
            if !self.selected(vlv.tree()) {
                continue;
            }
            for_each_record(txn, vlv.tree(), |key, value| {
                result.checked += 1;
                let id = EntryID::from_key(&value)?;
                let expected = self.entry(txn, id)?.and_then(|e| vlv.record_key(id, &e, self.container.rules()));
                if expected.as_deref() != Some(&key[..]) {
                    result.record(vlv.tree(), || format!("record of entry {} is stale", id));
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn clean_dn2id(&self, txn: &dyn ReadableTransaction, result: &mut VerifyResult) -> Result<()> {
        let dn2id = self.container.dn2id();
        for_each_record(txn, dn2id.tree(), |key, value| {
            result.checked += 1;
            let id = EntryID::from_key(&value)?;
            match self.entry(txn, id)? {
                None => result.record(dn2id.tree(), || format!("entry {} does not exist", id)),
                Some(entry) if dn2id.key(&entry.dn) != key => {
                    result.record(dn2id.tree(), || format!("entry {} is named {}", id, entry.dn))
                }
                Some(_) => {}
            }
            Ok(())
        })
    }

    fn clean_counts(&self, txn: &dyn ReadableTransaction, result: &mut VerifyResult) -> Result<()> {
        let dn2id = self.container.dn2id();
        let tree = self.container.id2count().tree();
        for_each_record(txn, tree, |key, value| {
            result.checked += 1;
            let id = EntryID::from_key(&key)?;
            let count = decode_count(&value)?;
            let actual = if id == TOTAL_COUNT_ID {
                self.indexes.id2entry().count(txn)? as i64
            } else {
                match self.entry(txn, id)? {
                    Some(entry) => dn2id.children(txn, &dn2id.key(&entry.dn))?.len() as i64,
                    None => {
                        result.record(tree, || format!("entry {} does not exist", id));
                        return Ok(());
                    }
                }
            };
            if count != actual {
                result.record(tree, || format!("counter of {} is {}, found {}", id, count, actual));
            }
            Ok(())
        })
    }

    fn clean_dn2uri(&self, txn: &dyn ReadableTransaction, result: &mut VerifyResult) -> Result<()> {
        let dn2uri = self.container.dn2uri();
        for_each_record(txn, dn2uri.tree(), |_, value| {
            result.checked += 1;
            let record: ReferralRecord = bincode::deserialize(&value)?;
            let dn = Dn::parse(&record.dn)?;
            let entry = match self.container.dn2id().get(txn, &dn)? {
                Some(id) => self.entry(txn, id)?,
                None => None,
            };
            if !entry.map(|e| e.is_referral()).unwrap_or(false) {
                result.record(dn2uri.tree(), || format!("{} is not a referral entry", record.dn));
            }
            Ok(())
        })
    }
}

fn for_each_record(
    txn: &dyn ReadableTransaction,
    tree: &TreeName,
    mut f: impl FnMut(Bytes, Bytes) -> Result<()>,
) -> Result<()> {
    let mut cursor = Cursor::new(txn, tree);
    while cursor.next()? {
        let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
            break;
        };
        f(key.clone(), value.clone())?;
    }
    Ok(())
}
