use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::backend::root_container::EntryIdAllocator;
use crate::codec::crypto::CryptoSuite;
use crate::codec::entry_codec::EntryCodec;
use crate::core::cache::EntryCache;
use crate::core::config::{BackendConfig, IndexConfig, VlvIndexConfig};
use crate::core::dn::Dn;
use crate::core::entry::{Entry, Modification};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::matching::MatchingRuleRegistry;
use crate::core::operation::OperationContext;
use crate::core::types::EntryID;
use crate::index::attribute_index::AttributeIndex;
use crate::index::dn2id::DN2ID;
use crate::index::dn2uri::DN2URI;
use crate::index::id2count::ID2Count;
use crate::index::id2entry::ID2Entry;
use crate::index::index_buffer::IndexBuffer;
use crate::index::state::State;
use crate::index::vlv_index::VLVIndex;
use crate::storage::tree::{ReadableTransaction, Storage, TreeName};

/// Per-container settings derived from the backend configuration
#[derive(Clone)]
pub struct ContainerSettings {
    pub index_entry_limit: u32,
    pub substring_length: usize,
    pub indexes: Vec<IndexConfig>,
    pub vlv_indexes: Vec<VlvIndexConfig>,     // Only those whose base lies in this container
    pub codec: EntryCodec,
    pub lookthrough_limit: u64,
    pub size_limit: usize,
}

impl ContainerSettings {
    pub fn from_config(config: &BackendConfig, base_dn: &Dn) -> Result<Self> {
        let crypto = match (&config.cipher_key, config.confidentiality_enabled) {
            (Some(key), true) => Some(Arc::new(CryptoSuite::from_hex(key)?)),
            _ => None,
        };

        let mut vlv_indexes = Vec::new();
        for vlv in &config.vlv_indexes {
            if Dn::parse(&vlv.base_dn)?.is_subordinate_or_equal_to(base_dn) {
                vlv_indexes.push(vlv.clone());
            }
        }

        Ok(ContainerSettings {
            index_entry_limit: config.index_entry_limit,
            substring_length: config.substring_length,
            indexes: config.indexes.clone(),
            vlv_indexes,
            codec: EntryCodec::new(config.entries_compressed, crypto),
            lookthrough_limit: config.lookthrough_limit,
            size_limit: config.size_limit,
        })
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        ContainerSettings {
            index_entry_limit: 4000,
            substring_length: 6,
            indexes: Vec::new(),
            vlv_indexes: Vec::new(),
            codec: EntryCodec::default(),
            lookthrough_limit: 0,
            size_limit: 0,
        }
    }
}

/// Configuration-dependent trees of a container. Guarded by the container lock:
/// operations hold it shared, structural changes exclusively.
pub struct ContainerIndexes {
    settings: ContainerSettings,
    id2entry: ID2Entry,
    attribute: HashMap<String, AttributeIndex>,
    order: Vec<String>,                        // Attribute names in configuration order
    vlv: Vec<VLVIndex>,
}

impl ContainerIndexes {
    fn build(prefix: &str, settings: ContainerSettings, rules: &MatchingRuleRegistry) -> Result<Self> {
        let mut attribute = HashMap::new();
        let mut order = Vec::new();
        for config in &settings.indexes {
            let index = AttributeIndex::new(
                prefix,
                config,
                settings.index_entry_limit,
                settings.substring_length,
                rules,
            )?;
            let name = index.attribute().to_string();
            if attribute.insert(name.clone(), index).is_none() {
                order.push(name);
            }
        }
        let vlv = settings
            .vlv_indexes
            .iter()
            .map(|config| VLVIndex::new(prefix, config))
            .collect::<Result<Vec<_>>>()?;

        Ok(ContainerIndexes {
            id2entry: ID2Entry::new(prefix, settings.codec.clone()),
            settings,
            attribute,
            order,
            vlv,
        })
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn id2entry(&self) -> &ID2Entry {
        &self.id2entry
    }

    pub fn attribute_indexes(&self) -> &HashMap<String, AttributeIndex> {
        &self.attribute
    }

    /// Attribute indexes in configuration order
    pub fn ordered(&self) -> impl Iterator<Item = &AttributeIndex> {
        self.order.iter().filter_map(|name| self.attribute.get(name))
    }

    pub fn vlv_indexes(&self) -> &[VLVIndex] {
        &self.vlv
    }

    /// Attribute and VLV index trees
    pub fn index_trees(&self) -> Vec<TreeName> {
        let mut trees: Vec<TreeName> = self
            .ordered()
            .flat_map(|index| index.indexes().iter().map(|i| i.tree().clone()))
            .collect();
        trees.extend(self.vlv.iter().map(|v| v.tree().clone()));
        trees
    }

    pub fn add_entry(&self, buffer: &mut IndexBuffer, id: EntryID, entry: &Entry, rules: &MatchingRuleRegistry) {
        for index in self.ordered() {
            index.add_entry(buffer, id, entry);
        }
        for vlv in &self.vlv {
            vlv.add_entry(buffer, id, entry, rules);
        }
    }

    pub fn remove_entry(&self, buffer: &mut IndexBuffer, id: EntryID, entry: &Entry, rules: &MatchingRuleRegistry) {
        for index in self.ordered() {
            index.remove_entry(buffer, id, entry);
        }
        for vlv in &self.vlv {
            vlv.remove_entry(buffer, id, entry, rules);
        }
    }

    /// Re-index a modified entry. With `modifications`, only the touched attributes are considered.
    pub fn modify_entry(
        &self,
        buffer: &mut IndexBuffer,
        id: EntryID,
        old: &Entry,
        new: &Entry,
        modifications: Option<&[Modification]>,
        rules: &MatchingRuleRegistry,
    ) {
        for index in self.ordered() {
            if modifications.map(|mods| index.is_modified_by(mods)).unwrap_or(true) {
                index.modify_entry(buffer, id, old, new);
            }
        }
        for vlv in &self.vlv {
            vlv.modify_entry(buffer, id, old, new, rules);
        }
    }
}

/// Index trees added and removed by a configuration change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexChanges {
    pub created: Vec<TreeName>,
    pub deleted: Vec<TreeName>,
}

/// Trees of one naming context and the transactional operations on them
pub struct EntryContainer {
    pub(super) base_dn: Dn,
    pub(super) prefix: String,
    pub(super) storage: Arc<dyn Storage>,
    pub(super) ids: Arc<EntryIdAllocator>,
    pub(super) rules: Arc<MatchingRuleRegistry>,
    pub(super) cache: Option<Arc<dyn EntryCache>>,
    pub(super) dn2id: DN2ID,
    pub(super) id2count: ID2Count,
    pub(super) dn2uri: DN2URI,
    pub(super) state: State,
    pub(super) indexes: RwLock<ContainerIndexes>,
    pub(super) untrusted: Mutex<HashSet<String>>,   // Index IDs flagged untrusted
}

/// Entry moved by a rename
struct MovedEntry {
    old_id: EntryID,
    new_id: EntryID,
    old: Entry,
    new: Entry,
}

impl EntryContainer {
    pub fn new(
        base_dn: Dn,
        prefix: String,
        storage: Arc<dyn Storage>,
        ids: Arc<EntryIdAllocator>,
        rules: Arc<MatchingRuleRegistry>,
        cache: Option<Arc<dyn EntryCache>>,
        settings: ContainerSettings,
    ) -> Result<Self> {
        let indexes = ContainerIndexes::build(&prefix, settings, &rules)?;
        Ok(EntryContainer {
            dn2id: DN2ID::new(&prefix, &base_dn),
            id2count: ID2Count::new(&prefix),
            dn2uri: DN2URI::new(&prefix, &base_dn),
            state: State::new(&prefix),
            indexes: RwLock::new(indexes),
            untrusted: Mutex::new(HashSet::new()),
            base_dn,
            prefix,
            storage,
            ids,
            rules,
            cache,
        })
    }

    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn ids(&self) -> &Arc<EntryIdAllocator> {
        &self.ids
    }

    pub fn rules(&self) -> &Arc<MatchingRuleRegistry> {
        &self.rules
    }

    pub fn dn2id(&self) -> &DN2ID {
        &self.dn2id
    }

    pub fn id2count(&self) -> &ID2Count {
        &self.id2count
    }

    pub fn dn2uri(&self) -> &DN2URI {
        &self.dn2uri
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn settings(&self) -> ContainerSettings {
        self.indexes.read().settings.clone()
    }

    /// Shared view of the configured indexes
    pub fn indexes(&self) -> RwLockReadGuard<'_, ContainerIndexes> {
        self.indexes.read()
    }

    /// Block every entry operation until the guard is dropped
    pub fn lock_exclusive(&self) -> RwLockWriteGuard<'_, ContainerIndexes> {
        self.indexes.write()
    }

    fn base_trees(&self, indexes: &ContainerIndexes) -> Vec<TreeName> {
        vec![
            self.dn2id.tree().clone(),
            indexes.id2entry.tree().clone(),
            self.id2count.tree().clone(),
            self.dn2uri.tree().clone(),
            self.state.tree().clone(),
        ]
    }

    fn trees_of(&self, indexes: &ContainerIndexes) -> Vec<TreeName> {
        let mut trees = self.base_trees(indexes);
        trees.extend(indexes.index_trees());
        trees
    }

    /// Every tree owned by this container
    pub fn all_trees(&self) -> Vec<TreeName> {
        self.trees_of(&self.indexes.read())
    }

    /// Create missing trees and load trust flags. Trees created while the container
    /// already holds entries start out untrusted.
    pub fn open(&self) -> Result<()> {
        let indexes = self.indexes.write();
        let trees = self.trees_of(&indexes);
        let existing: HashSet<TreeName> = self.storage.list_trees()?.into_iter().collect();
        let has_entries = self.storage.read(|txn| indexes.id2entry.count(txn))? > 0;
        let created: Vec<TreeName> = trees.iter().filter(|t| !existing.contains(*t)).cloned().collect();

        self.storage.write(|txn| {
            for tree in &trees {
                txn.open_tree(tree, true)?;
            }
            if has_entries {
                for tree in created.iter().filter(|t| self.is_index_tree(&indexes, t)) {
                    self.state.set_trusted(txn, tree, false)?;
                }
            }
            Ok(())
        })?;
        self.load_trust(&trees)?;

        if !created.is_empty() {
            debug!("[EntryContainer] Created {} trees for {}", created.len(), self.base_dn);
        }
        Ok(())
    }

    // Trees whose content can be rebuilt and therefore carry a trust flag
    fn is_index_tree(&self, indexes: &ContainerIndexes, tree: &TreeName) -> bool {
        tree != indexes.id2entry.tree() && tree != self.state.tree()
    }

    fn load_trust(&self, trees: &[TreeName]) -> Result<()> {
        let mut untrusted = HashSet::new();
        self.storage.read(|txn| {
            for tree in trees {
                if !self.state.is_trusted(txn, tree)? {
                    untrusted.insert(tree.index_id.clone());
                }
            }
            Ok(())
        })?;
        if !untrusted.is_empty() {
            warn!("[EntryContainer] Untrusted indexes in {}: {:?}", self.base_dn, untrusted);
        }
        *self.untrusted.lock() = untrusted;
        Ok(())
    }

    /// Re-read every trust flag, e.g. after an importer wrote the state tree directly
    pub fn refresh_trust(&self) -> Result<()> {
        let trees = self.all_trees();
        self.load_trust(&trees)
    }

    pub fn is_index_trusted(&self, index_id: &str) -> bool {
        !self.untrusted.lock().contains(index_id)
    }

    pub fn untrusted_indexes(&self) -> HashSet<String> {
        self.untrusted.lock().clone()
    }

    /// Persist the trust flag of `trees`
    pub fn set_index_trusted(&self, trees: &[TreeName], trusted: bool) -> Result<()> {
        if trees.is_empty() {
            return Ok(());
        }
        self.storage.write(|txn| {
            for tree in trees {
                self.state.set_trusted(txn, tree, trusted)?;
            }
            Ok(())
        })?;
        let mut untrusted = self.untrusted.lock();
        for tree in trees {
            if trusted {
                untrusted.remove(&tree.index_id);
            } else {
                untrusted.insert(tree.index_id.clone());
            }
        }
        Ok(())
    }

    // Storage failures and cancellations leave the touched indexes flagged for rebuild
    fn write_failed(&self, operation: &str, dn: &Dn, trees: Vec<TreeName>, err: Error) -> Error {
        if err.is_validation() {
            return err;
        }
        if err.is_canceled() {
            info!("[EntryContainer] {} of {} canceled", operation, dn);
        } else {
            error!("[EntryContainer] {} of {} failed: {}", operation, dn, err);
        }
        if let Err(mark_err) = self.set_index_trusted(&trees, false) {
            warn!(
                "[EntryContainer] Could not mark {} indexes untrusted after failed {}: {}",
                trees.len(),
                operation,
                mark_err
            );
        }
        err
    }

    pub(super) fn check_in_container(&self, dn: &Dn) -> Result<()> {
        if dn.is_subordinate_or_equal_to(&self.base_dn) {
            return Ok(());
        }
        Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("{} is not below base DN {}", dn, self.base_dn),
        ))
    }

    pub(super) fn check_referral_above(&self, txn: &dyn ReadableTransaction, dn: &Dn, ctx: &OperationContext) -> Result<()> {
        if ctx.manage_dsa_it {
            return Ok(());
        }
        match self.dn2uri.referral_above(txn, dn)? {
            Some(record) => Err(Error::referral(&record.urls)),
            None => Ok(()),
        }
    }

    // A referral entry is only changed directly under ManageDsaIT
    fn check_target_referral(&self, txn: &dyn ReadableTransaction, dn: &Dn) -> Result<()> {
        match self.dn2uri.get(txn, dn)? {
            Some(record) => Err(Error::referral(&record.urls)),
            None => Ok(()),
        }
    }

    fn existing_id(&self, txn: &dyn ReadableTransaction, dn: &Dn) -> Result<EntryID> {
        self.dn2id.get(txn, dn)?.ok_or_else(|| Error::no_such_object(dn))
    }

    fn stored_entry(&self, indexes: &ContainerIndexes, txn: &dyn ReadableTransaction, id: EntryID) -> Result<Entry> {
        indexes.id2entry.get(txn, id)?.ok_or_else(|| {
            Error::new(ErrorKind::InvalidState, format!("entry ID {} missing from id2entry", id))
        })
    }

    fn parent_id(&self, txn: &dyn ReadableTransaction, dn: &Dn) -> Result<Option<EntryID>> {
        if *dn == self.base_dn {
            return Ok(None);
        }
        let parent = dn.parent().ok_or_else(|| Error::no_such_object(dn))?;
        match self.dn2id.get(txn, &parent)? {
            Some(id) => Ok(Some(id)),
            None => Err(Error::new(
                ErrorKind::NoSuchObject,
                format!("parent entry {} of {} does not exist", parent, dn),
            )),
        }
    }

    /// Add a new entry, returning its allocated ID
    pub fn add_entry(&self, entry: &Entry, ctx: &OperationContext) -> Result<EntryID> {
        ctx.check_canceled()?;
        self.check_in_container(&entry.dn)?;
        let indexes = self.indexes.read();
        let id = self.ids.next_id();

        let mut buffer = IndexBuffer::new();
        indexes.add_entry(&mut buffer, id, entry, &self.rules);

        let result = self.storage.write(|txn| {
            let key = self.dn2id.key(&entry.dn);
            if self.dn2id.get_by_key(txn.as_readable(), &key)?.is_some() {
                return Err(Error::already_exists(&entry.dn));
            }
            self.check_referral_above(txn.as_readable(), &entry.dn, ctx)?;
            let parent_id = self.parent_id(txn.as_readable(), &entry.dn)?;

            txn.put(self.dn2id.tree(), &key, &id.to_key())?;
            if let Some(parent_id) = parent_id {
                self.id2count.update_count(txn, parent_id, 1)?;
            }
            indexes.id2entry.put(txn, id, entry)?;
            self.dn2uri.add_entry(txn, entry)?;
            self.id2count.update_total(txn, 1)?;
            buffer.flush(txn)?;
            ctx.check_canceled()
        });
        if let Err(err) = result {
            return Err(self.write_failed("Add", &entry.dn, buffer.touched_trees(), err));
        }

        if let Some(cache) = &self.cache {
            cache.put(id, entry);
        }
        debug!("[EntryContainer] Added {} as {}", entry.dn, id);
        Ok(id)
    }

    /// Delete an entry, or a whole subtree when the context requests it.
    /// Returns the number of entries removed.
    pub fn delete_entry(&self, dn: &Dn, ctx: &OperationContext) -> Result<usize> {
        ctx.check_canceled()?;
        self.check_in_container(dn)?;
        let indexes = self.indexes.read();
        let mut buffer = IndexBuffer::new();
        let mut removed: Vec<EntryID> = Vec::new();

        let result = self.storage.write(|txn| {
            let key = self.dn2id.key(dn);
            let target_id = self
                .dn2id
                .get_by_key(txn.as_readable(), &key)?
                .ok_or_else(|| Error::no_such_object(dn))?;
            self.check_referral_above(txn.as_readable(), dn, ctx)?;
            if !ctx.manage_dsa_it && !ctx.subtree_delete {
                self.check_target_referral(txn.as_readable(), dn)?;
            }
            let parent_id = self.parent_id(txn.as_readable(), dn)?;

            let descendants = self.dn2id.descendants(txn.as_readable(), &key)?;
            if !descendants.is_empty() && !ctx.subtree_delete {
                return Err(Error::new(
                    ErrorKind::NotAllowedOnNonLeaf,
                    format!("entry {} has {} subordinates", dn, descendants.len()),
                ));
            }

            txn.delete(self.dn2id.tree(), &key)?;
            for (child_key, _) in &descendants {
                ctx.check_canceled()?;
                txn.delete(self.dn2id.tree(), child_key)?;
            }

            let mut ids: Vec<EntryID> = descendants.iter().map(|(_, id)| *id).collect();
            ids.push(target_id);
            ids.sort();
            for id in ids {
                ctx.check_canceled()?;
                let entry = self.stored_entry(&indexes, txn.as_readable(), id)?;
                if id != target_id {
                    if let Some(hooks) = &ctx.hooks {
                        hooks.subordinate_delete(&entry)?;
                    }
                }
                indexes.id2entry.remove(txn, id)?;
                if entry.is_referral() {
                    self.dn2uri.delete_entry(txn, &entry.dn)?;
                }
                self.id2count.delete_count(txn, id)?;
                indexes.remove_entry(&mut buffer, id, &entry, &self.rules);
                removed.push(id);
            }

            if let Some(parent_id) = parent_id {
                self.id2count.update_count(txn, parent_id, -1)?;
            }
            self.id2count.update_total(txn, -(removed.len() as i64))?;
            buffer.flush(txn)?;
            ctx.check_canceled()
        });
        if let Err(err) = result {
            return Err(self.write_failed("Delete", dn, buffer.touched_trees(), err));
        }

        if let Some(cache) = &self.cache {
            for id in &removed {
                cache.remove(*id);
            }
        }
        debug!("[EntryContainer] Deleted {} ({} entries)", dn, removed.len());
        Ok(removed.len())
    }

    /// Replace the content of an entry without changing its DN
    pub fn replace_entry(&self, old: &Entry, new: &Entry, ctx: &OperationContext) -> Result<()> {
        ctx.check_canceled()?;
        if old.dn != new.dn {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("replace cannot change the DN {} to {}", old.dn, new.dn),
            ));
        }
        let indexes = self.indexes.read();
        let mut buffer = IndexBuffer::new();
        let mut entry_id = None;

        let result = self.storage.write(|txn| {
            let id = self.existing_id(txn.as_readable(), &new.dn)?;
            self.check_referral_above(txn.as_readable(), &new.dn, ctx)?;
            if !ctx.manage_dsa_it {
                if let Some(urls) = old.referral_urls() {
                    return Err(Error::referral(&urls));
                }
            }

            indexes.modify_entry(&mut buffer, id, old, new, ctx.modifications.as_deref(), &self.rules);
            indexes.id2entry.put(txn, id, new)?;
            self.dn2uri.replace_entry(txn, old, new)?;
            buffer.flush(txn)?;
            ctx.check_canceled()?;
            entry_id = Some(id);
            Ok(())
        });
        if let Err(err) = result {
            return Err(self.write_failed("Replace", &new.dn, buffer.touched_trees(), err));
        }

        if let (Some(cache), Some(id)) = (&self.cache, entry_id) {
            cache.put(id, new);
        }
        Ok(())
    }

    /// Move or rename an entry with its subtree. Subordinates are renumbered when the
    /// new superior has a higher ID than the old one.
    pub fn rename_entry(&self, old_dn: &Dn, new_entry: &Entry, ctx: &OperationContext) -> Result<()> {
        ctx.check_canceled()?;
        let new_dn = &new_entry.dn;
        self.check_in_container(old_dn)?;
        self.check_in_container(new_dn)?;
        if *old_dn == self.base_dn {
            return Err(Error::new(
                ErrorKind::UnwillingToPerform,
                format!("the base entry {} cannot be renamed", old_dn),
            ));
        }
        if new_dn.is_descendant_of(old_dn) {
            return Err(Error::new(
                ErrorKind::UnwillingToPerform,
                format!("cannot move {} below itself to {}", old_dn, new_dn),
            ));
        }

        let indexes = self.indexes.read();
        let mut buffer = IndexBuffer::new();
        let mut moved: Vec<(EntryID, EntryID)> = Vec::new();

        let result = self.storage.write(|txn| {
            let old_key = self.dn2id.key(old_dn);
            let target_id = self
                .dn2id
                .get_by_key(txn.as_readable(), &old_key)?
                .ok_or_else(|| Error::no_such_object(old_dn))?;
            self.check_referral_above(txn.as_readable(), old_dn, ctx)?;
            if !ctx.manage_dsa_it {
                self.check_target_referral(txn.as_readable(), old_dn)?;
            }

            let old_superior = old_dn.parent().ok_or_else(|| Error::no_such_object(old_dn))?;
            let new_superior = new_dn.parent().ok_or_else(|| Error::no_such_object(new_dn))?;
            let superior_changed = old_superior != new_superior;
            let old_superior_id = self.existing_id(txn.as_readable(), &old_superior)?;
            let new_superior_id = self.existing_id(txn.as_readable(), &new_superior)?;
            if superior_changed {
                self.check_referral_above(txn.as_readable(), new_dn, ctx)?;
            }

            let new_key = self.dn2id.key(new_dn);
            if new_key != old_key && self.dn2id.get_by_key(txn.as_readable(), &new_key)?.is_some() {
                return Err(Error::already_exists(new_dn));
            }
            let renumber = superior_changed && new_superior_id > old_superior_id;

            // Target first, subordinates in key order so new IDs follow the hierarchy
            let mut records = vec![(old_key.clone(), target_id)];
            records.extend(self.dn2id.descendants(txn.as_readable(), &old_key)?);
            for (key, _) in &records {
                txn.delete(self.dn2id.tree(), key)?;
            }

            let mut entries = Vec::with_capacity(records.len());
            for (_, old_id) in &records {
                ctx.check_canceled()?;
                let old = self.stored_entry(&indexes, txn.as_readable(), *old_id)?;
                let new = if *old_id == target_id {
                    new_entry.clone()
                } else {
                    let mut renamed = old.clone();
                    renamed.dn = old.dn.rename(old_dn, new_dn)?;
                    if let Some(hooks) = &ctx.hooks {
                        let modifications = hooks.subordinate_modify_dn(&old, &renamed)?;
                        renamed.apply_modifications(&modifications)?;
                    }
                    renamed
                };
                let new_id = if renumber { self.ids.next_id() } else { *old_id };
                self.dn2id.put(txn, &new.dn, new_id)?;
                entries.push(MovedEntry { old_id: *old_id, new_id, old, new });
            }

            // Target first, then ascending old IDs
            entries[1..].sort_by_key(|m| m.old_id);
            for entry in &entries {
                ctx.check_canceled()?;
                if entry.new_id != entry.old_id {
                    indexes.id2entry.remove(txn, entry.old_id)?;
                    indexes.id2entry.put(txn, entry.new_id, &entry.new)?;
                    let children = self.id2count.get_count(txn.as_readable(), entry.old_id)?;
                    if children != 0 {
                        self.id2count.delete_count(txn, entry.old_id)?;
                        self.id2count.update_count(txn, entry.new_id, children)?;
                    }
                    indexes.remove_entry(&mut buffer, entry.old_id, &entry.old, &self.rules);
                    indexes.add_entry(&mut buffer, entry.new_id, &entry.new, &self.rules);
                } else {
                    indexes.id2entry.put(txn, entry.new_id, &entry.new)?;
                    let modifications = if entry.old_id == target_id { ctx.modifications.as_deref() } else { None };
                    indexes.modify_entry(&mut buffer, entry.new_id, &entry.old, &entry.new, modifications, &self.rules);
                }
                if entry.old.is_referral() {
                    self.dn2uri.delete_entry(txn, &entry.old.dn)?;
                }
                self.dn2uri.add_entry(txn, &entry.new)?;
                moved.push((entry.old_id, entry.new_id));
            }

            if superior_changed {
                self.id2count.update_count(txn, old_superior_id, -1)?;
                self.id2count.update_count(txn, new_superior_id, 1)?;
            }
            buffer.flush(txn)?;
            ctx.check_canceled()
        });
        if let Err(err) = result {
            return Err(self.write_failed("Rename", old_dn, buffer.touched_trees(), err));
        }

        if let Some(cache) = &self.cache {
            for (old_id, _) in &moved {
                cache.remove(*old_id);
            }
            if let Some((_, new_id)) = moved.first() {
                cache.put(*new_id, new_entry);
            }
        }
        debug!("[EntryContainer] Renamed {} to {} ({} entries)", old_dn, new_dn, moved.len());
        Ok(())
    }

    pub fn entry_exists(&self, dn: &Dn) -> Result<bool> {
        if let Some(cache) = &self.cache {
            if cache.get_id(dn).is_some() {
                return Ok(true);
            }
        }
        Ok(self.storage.read(|txn| self.dn2id.get(txn, dn))?.is_some())
    }

    pub fn get_entry_id(&self, dn: &Dn) -> Result<Option<EntryID>> {
        self.storage.read(|txn| self.dn2id.get(txn, dn))
    }

    /// Fetch an entry, serving it from the entry cache when possible
    pub fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>> {
        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.get_id(dn).and_then(|id| cache.get(id)) {
                return Ok(Some(entry));
            }
        }
        let indexes = self.indexes.read();
        let found = self.storage.read(|txn| {
            let Some(id) = self.dn2id.get(txn, dn)? else {
                return Ok(None);
            };
            Ok(indexes.id2entry.get(txn, id)?.map(|entry| (id, entry)))
        })?;
        if let (Some(cache), Some((id, entry))) = (&self.cache, &found) {
            cache.put(*id, entry);
        }
        Ok(found.map(|(_, entry)| entry))
    }

    pub fn get_entry_by_id(&self, id: EntryID) -> Result<Option<Entry>> {
        if let Some(entry) = self.cache.as_ref().and_then(|cache| cache.get(id)) {
            return Ok(Some(entry));
        }
        let indexes = self.indexes.read();
        self.storage.read(|txn| indexes.id2entry.get(txn, id))
    }

    /// Number of immediate children, or of all descendants when `subtree` is set
    pub fn num_subordinates(&self, dn: &Dn, subtree: bool) -> Result<u64> {
        self.storage.read(|txn| {
            let key = self.dn2id.key(dn);
            let id = self.dn2id.get_by_key(txn, &key)?.ok_or_else(|| Error::no_such_object(dn))?;
            if subtree {
                Ok(self.dn2id.descendants(txn, &key)?.len() as u64)
            } else {
                Ok(self.id2count.get_count(txn, id)?.max(0) as u64)
            }
        })
    }

    /// Number of entries in the container
    pub fn entry_count(&self) -> Result<u64> {
        Ok(self.storage.read(|txn| self.id2count.get_total(txn))?.max(0) as u64)
    }

    pub fn highest_entry_id(&self) -> Result<Option<EntryID>> {
        let indexes = self.indexes.read();
        self.storage.read(|txn| indexes.id2entry.highest_id(txn))
    }

    /// Empty every tree, keeping them open
    pub fn clear(&self) -> Result<()> {
        let indexes = self.indexes.write();
        let trees = self.trees_of(&indexes);
        self.storage.write(|txn| {
            for tree in &trees {
                txn.delete_tree(tree)?;
                txn.open_tree(tree, true)?;
            }
            Ok(())
        })?;
        self.untrusted.lock().clear();
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        info!("[EntryContainer] Cleared {}", self.base_dn);
        Ok(())
    }

    /// Delete every tree of the container
    pub fn delete(&self) -> Result<()> {
        let indexes = self.indexes.write();
        let trees = self.trees_of(&indexes);
        self.storage.write(|txn| {
            for tree in &trees {
                txn.delete_tree(tree)?;
            }
            Ok(())
        })?;
        self.untrusted.lock().clear();
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        info!("[EntryContainer] Deleted {} ({} trees)", self.base_dn, trees.len());
        Ok(())
    }

    /// Switch to new settings: removed index trees are deleted, new ones created
    /// (untrusted when the container already holds entries).
    pub fn reconfigure(&self, settings: ContainerSettings) -> Result<IndexChanges> {
        let mut indexes = self.indexes.write();
        let replacement = ContainerIndexes::build(&self.prefix, settings, &self.rules)?;
        let before: BTreeSet<TreeName> = indexes.index_trees().into_iter().collect();
        let after: BTreeSet<TreeName> = replacement.index_trees().into_iter().collect();
        let changes = IndexChanges {
            created: after.difference(&before).cloned().collect(),
            deleted: before.difference(&after).cloned().collect(),
        };
        let has_entries = self.storage.read(|txn| indexes.id2entry.count(txn))? > 0;

        self.storage.write(|txn| {
            for tree in &changes.deleted {
                txn.delete_tree(tree)?;
                self.state.remove(txn, tree)?;
            }
            for tree in &changes.created {
                txn.open_tree(tree, true)?;
                if has_entries {
                    self.state.set_trusted(txn, tree, false)?;
                }
            }
            Ok(())
        })?;
        *indexes = replacement;

        let mut untrusted = self.untrusted.lock();
        for tree in &changes.deleted {
            untrusted.remove(&tree.index_id);
        }
        if has_entries {
            untrusted.extend(changes.created.iter().map(|t| t.index_id.clone()));
        }
        if changes != IndexChanges::default() {
            info!(
                "[EntryContainer] Reconfigured {}: {} trees created, {} deleted",
                self.base_dn,
                changes.created.len(),
                changes.deleted.len()
            );
        }
        Ok(changes)
    }
}

impl std::fmt::Debug for EntryContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EntryContainer")
            .field("base_dn", &self.base_dn)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::IndexType;
    use crate::core::filter::Filter;
    use crate::index::entry_id_set::EntryIDSet;
    use crate::storage::btree::BTreeStorage;

    fn container() -> EntryContainer {
        container_with(&[IndexType::Equality])
    }

    fn container_with(cn_types: &[IndexType]) -> EntryContainer {
        let base = Dn::parse("o=test").unwrap();
        let settings = ContainerSettings {
            indexes: vec![IndexConfig::new("cn", cn_types)],
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
        container
    }

    fn entry(dn: &str, cn: &str) -> Entry {
        Entry::new(Dn::parse(dn).unwrap()).with("objectClass", &["top"]).with("cn", &[cn])
    }

    fn cn_ids(container: &EntryContainer, value: &str) -> EntryIDSet {
        let indexes = container.indexes();
        let index = indexes.attribute_indexes()["cn"].index(IndexType::Equality).unwrap();
        let key = index.indexer().assertion_key(value);
        container.storage.read(|txn| index.read(txn, &key)).unwrap()
    }

    #[test]
    fn add_requires_parent_and_unique_dn() {
        let container = container();
        let ctx = OperationContext::new();
        let err = container.add_entry(&entry("cn=a,o=test", "a"), &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoSuchObject);

        assert_eq!(container.add_entry(&entry("o=test", "test"), &ctx).unwrap(), EntryID(1));
        container.add_entry(&entry("cn=a,o=test", "a"), &ctx).unwrap();
        let err = container.add_entry(&entry("cn=A,o=test", "a"), &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EntryAlreadyExists);

        assert_eq!(container.entry_count().unwrap(), 2);
        assert_eq!(container.num_subordinates(&Dn::parse("o=test").unwrap(), false).unwrap(), 1);
        assert_eq!(cn_ids(&container, "A").ids(), vec![EntryID(2)]);
        assert!(container.untrusted_indexes().is_empty());
    }

    #[test]
    fn canceled_add_marks_indexes_untrusted() {
        let container = container();
        container.add_entry(&entry("o=test", "test"), &OperationContext::new()).unwrap();

        let ctx = OperationContext::new();
        ctx.cancel.cancel();
        assert!(container.add_entry(&entry("cn=a,o=test", "a"), &ctx).unwrap_err().is_canceled());
        assert!(!container.entry_exists(&Dn::parse("cn=a,o=test").unwrap()).unwrap());

        // Cancellation after the entry was written but before commit
        struct CancelOnDelete(OperationContext);
        impl crate::core::operation::SubordinateHooks for CancelOnDelete {
            fn subordinate_delete(&self, _entry: &Entry) -> Result<()> {
                self.0.cancel.cancel();
                Ok(())
            }
        }
        container.add_entry(&entry("cn=b,o=test", "b"), &OperationContext::new()).unwrap();
        container.add_entry(&entry("cn=c,cn=b,o=test", "c"), &OperationContext::new()).unwrap();
        let ctx = OperationContext::new().with_subtree_delete();
        let ctx = ctx.clone().with_hooks(Arc::new(CancelOnDelete(ctx)));
        let err = container.delete_entry(&Dn::parse("cn=b,o=test").unwrap(), &ctx).unwrap_err();
        assert!(err.is_canceled());
        assert!(!container.is_index_trusted("cn.equality"));
        assert!(container.entry_exists(&Dn::parse("cn=c,cn=b,o=test").unwrap()).unwrap());
    }

    #[test]
    fn replace_reindexes_changed_values() {
        let container = container();
        let ctx = OperationContext::new();
        container.add_entry(&entry("o=test", "test"), &ctx).unwrap();
        let old = entry("cn=a,o=test", "a");
        let id = container.add_entry(&old, &ctx).unwrap();

        let new = old.clone().with("cn", &["alias"]);
        container.replace_entry(&old, &new, &ctx).unwrap();
        assert_eq!(cn_ids(&container, "alias").ids(), vec![id]);
        assert_eq!(container.get_entry(&old.dn).unwrap().unwrap(), new);

        let filter = Filter::parse("(cn=alias)").unwrap();
        assert!(filter.matches(&container.get_entry_by_id(id).unwrap().unwrap(), &container.rules));
    }

    #[test]
    fn rename_renumbers_only_towards_higher_superiors() {
        let container = container();
        let ctx = OperationContext::new();
        container.add_entry(&entry("o=test", "test"), &ctx).unwrap();
        let low = container.add_entry(&entry("ou=low,o=test", "low"), &ctx).unwrap();
        let moving = container.add_entry(&entry("cn=m,ou=low,o=test", "m"), &ctx).unwrap();
        let high = container.add_entry(&entry("ou=high,o=test", "high"), &ctx).unwrap();
        assert!(low < moving && moving < high);

        // Moving below a superior with a higher ID allocates a new ID
        let target = entry("cn=m,ou=high,o=test", "m");
        container.rename_entry(&Dn::parse("cn=m,ou=low,o=test").unwrap(), &target, &ctx).unwrap();
        let renumbered = container.get_entry_id(&target.dn).unwrap().unwrap();
        assert!(renumbered > high);
        assert_eq!(cn_ids(&container, "m").ids(), vec![renumbered]);

        // Moving back below the lower superior keeps the ID
        let back = entry("cn=m,ou=low,o=test", "m");
        container.rename_entry(&target.dn, &back, &ctx).unwrap();
        assert_eq!(container.get_entry_id(&back.dn).unwrap(), Some(renumbered));
        assert_eq!(container.num_subordinates(&Dn::parse("ou=high,o=test").unwrap(), false).unwrap(), 0);
        assert_eq!(container.num_subordinates(&Dn::parse("ou=low,o=test").unwrap(), false).unwrap(), 1);
    }

    // For every cn index key derived from `values`: whether its set holds `id`
    fn cn_membership(container: &EntryContainer, values: &[&str], id: EntryID) -> Vec<(String, Vec<u8>, bool)> {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let indexes = container.indexes();
        let mut membership = Vec::new();
        container
            .storage
            .read(|txn| {
                for index in indexes.attribute_indexes()["cn"].indexes() {
                    for key in index.indexer().keys(&values) {
                        let contains = index.read(txn, &key)?.contains(id);
                        membership.push((index.tree().index_id.clone(), key, contains));
                    }
                }
                Ok(())
            })
            .unwrap();
        membership
    }

    #[test]
    fn rename_in_place_and_back_keeps_id_and_indexes() {
        let container = container_with(&[IndexType::Equality, IndexType::Substring]);
        let ctx = OperationContext::new();
        container.add_entry(&entry("o=test", "test"), &ctx).unwrap();
        let original = entry("cn=alpha,o=test", "alpha");
        let id = container.add_entry(&original, &ctx).unwrap();
        let before = cn_membership(&container, &["alpha"], id);
        assert!(before.iter().all(|(_, _, contains)| *contains));
        assert!(before.iter().any(|(tree, _, _)| tree == "cn.substring"));

        let renamed = entry("cn=bravo,o=test", "bravo");
        container.rename_entry(&original.dn, &renamed, &ctx).unwrap();
        assert_eq!(container.get_entry_id(&renamed.dn).unwrap(), Some(id));
        assert!(cn_membership(&container, &["bravo"], id).iter().all(|(_, _, contains)| *contains));
        assert!(cn_ids(&container, "alpha").is_empty());

        container.rename_entry(&renamed.dn, &original, &ctx).unwrap();
        assert_eq!(container.get_entry_id(&original.dn).unwrap(), Some(id));
        assert!(!container.entry_exists(&renamed.dn).unwrap());
        assert_eq!(cn_membership(&container, &["alpha"], id), before);
        assert!(cn_membership(&container, &["bravo"], id).iter().all(|(_, _, contains)| !*contains));
        assert_eq!(container.num_subordinates(&Dn::parse("o=test").unwrap(), false).unwrap(), 1);
    }

    #[test]
    fn referral_targets_need_manage_dsa_it() {
        let container = container();
        let ctx = OperationContext::new();
        container.add_entry(&entry("o=test", "test"), &ctx).unwrap();
        let referral = Entry::new(Dn::parse("ou=remote,o=test").unwrap())
            .with("objectClass", &["referral", "extensibleObject"])
            .with("ref", &["ldap://other.example.com/ou=remote,o=test"]);
        container.add_entry(&referral, &ctx).unwrap();

        let err = container.delete_entry(&referral.dn, &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Referral);
        assert_eq!(err.referral_urls(), vec!["ldap://other.example.com/ou=remote,o=test".to_string()]);

        let moved = referral.clone().with("ou", &["moved"]);
        let moved = Entry { dn: Dn::parse("ou=moved,o=test").unwrap(), ..moved };
        let err = container.rename_entry(&referral.dn, &moved, &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Referral);
        assert!(container.entry_exists(&referral.dn).unwrap());
        assert!(container.untrusted_indexes().is_empty());

        let manage = OperationContext::new().with_manage_dsa_it();
        container.rename_entry(&referral.dn, &moved, &manage).unwrap();
        assert_eq!(container.delete_entry(&moved.dn, &manage).unwrap(), 1);
        assert!(!container.entry_exists(&moved.dn).unwrap());
    }

    #[test]
    fn reconfigure_creates_untrusted_trees() {
        let container = container();
        container.add_entry(&entry("o=test", "test"), &OperationContext::new()).unwrap();
        let mut settings = container.settings();
        settings.indexes = vec![IndexConfig::new("sn", &[IndexType::Presence])];
        let changes = container.reconfigure(settings).unwrap();
        assert_eq!(changes.created, vec![TreeName::new("o=test", "sn.presence")]);
        assert_eq!(changes.deleted, vec![TreeName::new("o=test", "cn.equality")]);
        assert!(!container.is_index_trusted("sn.presence"));
    }
}
