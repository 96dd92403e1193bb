use std::sync::Arc;
use log::{info, warn};
use crate::backend::entry_container::EntryContainer;
use crate::backend::root_container::RootContainer;
use crate::core::config::ImportConfig;
use crate::core::dn::Dn;
use crate::core::entry::Entry;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntryID;
use crate::storage::tree::Cursor;

/// Destination of an import under one base DN
pub struct Suffix {
    base_dn: Dn,
    original: Arc<EntryContainer>,
    target: Arc<EntryContainer>,
    temporary: bool,
    include: Vec<Dn>,
    exclude: Vec<Dn>,
}

impl Suffix {
    /// Decide how the container of `original` takes part in an import. Returns `None` when
    /// no include branch touches it. A full import clears it in place; a partial one builds a
    /// temporary container that receives the kept entries plus the imported ones.
    pub fn prepare(root: &RootContainer, original: Arc<EntryContainer>, config: &ImportConfig) -> Result<Option<Suffix>> {
        let base_dn = original.base_dn().clone();
        let include = branches_under(&config.include_branches, &base_dn, true)?;
        if include.is_empty() {
            return Ok(None);
        }
        let exclude = branches_under(&config.exclude_branches, &base_dn, false)?;
        let whole_base = include.iter().any(|b| *b == base_dn) && exclude.is_empty();

        if config.append {
            return Ok(Some(Suffix { base_dn, target: original.clone(), original, temporary: false, include, exclude }));
        }
        let has_entries = original.entry_count()? > 0 || original.highest_entry_id()?.is_some();
        if whole_base || !has_entries {
            original.clear()?;
            return Ok(Some(Suffix { base_dn, target: original.clone(), original, temporary: false, include, exclude }));
        }

        let prefix = format!("importTmp_{}", uuid::Uuid::new_v4().simple());
        let target = root.create_container(&base_dn, &prefix, original.settings())?;
        target.clear()?;
        target.open()?;
        info!("[Import] Importing {} into temporary container {}", base_dn, prefix);
        Ok(Some(Suffix { base_dn, original, target: Arc::new(target), temporary: true, include, exclude }))
    }

    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    /// Container the import writes to
    pub fn target(&self) -> &Arc<EntryContainer> {
        &self.target
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Whether an imported entry belongs to this import
    pub fn is_included(&self, dn: &Dn) -> bool {
        self.include.iter().any(|b| dn.is_subordinate_or_equal_to(b))
            && !self.exclude.iter().any(|b| dn.is_subordinate_or_equal_to(b))
    }

    /// Existing entries outside the imported branches, parents first. Only a temporary
    /// target needs them.
    pub fn for_each_kept_entry(&self, f: &mut dyn FnMut(EntryID, Entry) -> Result<()>) -> Result<()> {
        if !self.temporary {
            return Ok(());
        }
        let dn2id = self.original.dn2id();
        let indexes = self.original.indexes();
        let id2entry = indexes.id2entry();
        let storage = self.original.storage();
        let txn = storage.begin_read()?;
        let mut cursor = Cursor::new(txn.as_ref(), dn2id.tree());
        let mut found = cursor.position_to_key_or_next(&[])?;
        while found {
            let Some(value) = cursor.value() else {
                break;
            };
            let id = EntryID::from_key(value)?;
            let entry = id2entry.get(txn.as_ref(), id)?.ok_or_else(|| {
                Error::new(ErrorKind::InvalidState, format!("entry ID {} missing from id2entry", id))
            })?;
            if !self.is_included(&entry.dn) {
                f(id, entry)?;
            }
            found = cursor.next()?;
        }
        Ok(())
    }

    /// Make the imported data visible under the base DN
    pub fn commit(self, root: &RootContainer) -> Result<Arc<EntryContainer>> {
        if !self.temporary {
            self.target.refresh_trust()?;
            return Ok(self.target);
        }
        root.swap_container(&self.base_dn, &self.target)
    }

    /// Drop the temporary container of a failed import
    pub fn abort(self) {
        if !self.temporary {
            return;
        }
        if let Err(err) = self.target.delete() {
            warn!("[Import] Could not delete temporary container {}: {}", self.target.prefix(), err);
        }
    }
}

// Branches inside `base`; a branch above `base` stands for `base` itself
fn branches_under(branches: &[String], base: &Dn, default_to_base: bool) -> Result<Vec<Dn>> {
    if branches.is_empty() {
        return Ok(if default_to_base { vec![base.clone()] } else { Vec::new() });
    }
    let mut matching = Vec::new();
    for branch in branches {
        let dn = Dn::parse(branch)?;
        if dn.is_subordinate_or_equal_to(base) {
            matching.push(dn);
        } else if base.is_subordinate_or_equal_to(&dn) {
            matching.push(base.clone());
        }
    }
    Ok(matching)
}
