use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Serialize, Deserialize};
use crate::backend::entry_container::{ContainerSettings, EntryContainer, IndexChanges};
use crate::backend::root_container::RootContainer;
use crate::backend::verify::{self, VerifyResult};
use crate::core::cache::{CacheStats, EntryCache, LruEntryCache};
use crate::core::config::{BackendConfig, ImportConfig, RebuildConfig, VerifyConfig};
use crate::core::dn::Dn;
use crate::core::entry::{Entry, Modification};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::matching::MatchingRuleRegistry;
use crate::core::operation::{OperationContext, SearchRequest, SearchResult};
use crate::core::types::EntryID;
use crate::import::importer::{self, ImportDefaults, ImportResult, RebuildResult};
use crate::import::source::EntryReader;
use crate::storage::btree::BTreeStorage;
use crate::storage::layout::StorageLayout;
use crate::storage::tree::Storage;

/// Outcome of a live configuration change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigChangeResult {
    pub added_base_dns: Vec<String>,
    pub removed_base_dns: Vec<String>,
    pub index_changes: BTreeMap<String, IndexChanges>,   // Per base DN
    pub restart_required: Vec<String>,                   // Settings that apply on next open
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStats {
    pub base_dn: String,
    pub entry_count: u64,
    pub untrusted_indexes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackendStats {
    pub backend_id: String,
    pub containers: Vec<ContainerStats>,
    pub cache: Option<CacheStats>,
}

/// One directory backend: a storage engine and an entry container per base DN
pub struct Backend {
    config: RwLock<BackendConfig>,
    layout: Option<StorageLayout>,
    tmp_dir: PathBuf,
    root: RootContainer,
    cache: Option<Arc<LruEntryCache>>,
}

impl Backend {
    /// Open (creating on demand) the backend stored under `config.storage_path`
    pub fn open(config: BackendConfig) -> Result<Self> {
        config.validate()?;
        let layout = StorageLayout::new(config.storage_path.clone())?;
        let tmp_dir = if config.import_tmp_dir.is_absolute() {
            config.import_tmp_dir.clone()
        } else {
            layout.tmp_dir.join(&config.import_tmp_dir)
        };
        let storage: Arc<dyn Storage> = Arc::new(BTreeStorage::new(layout.clone()));
        Self::with_storage(config, storage, Some(layout), tmp_dir)
    }

    /// Volatile backend; import scratch files go to `tmp_dir`
    pub fn open_in_memory(config: BackendConfig, tmp_dir: PathBuf) -> Result<Self> {
        config.validate()?;
        Self::with_storage(config, Arc::new(BTreeStorage::in_memory()), None, tmp_dir)
    }

    fn with_storage(
        config: BackendConfig,
        storage: Arc<dyn Storage>,
        layout: Option<StorageLayout>,
        tmp_dir: PathBuf,
    ) -> Result<Self> {
        storage.open()?;
        let cache = LruEntryCache::new(config.entry_cache_size).map(Arc::new);
        let shared_cache = cache.clone().map(|c| c as Arc<dyn EntryCache>);
        let root = RootContainer::new(storage, Arc::new(MatchingRuleRegistry::default()), shared_cache);
        let backend = Backend { config: RwLock::new(config), layout, tmp_dir, root, cache };
        backend.open_containers()?;
        info!(
            "[Backend] Opened {} with base DNs {:?}",
            backend.config.read().backend_id,
            backend.root.base_dns().iter().map(|d| d.to_string()).collect::<Vec<_>>()
        );
        Ok(backend)
    }

    fn open_containers(&self) -> Result<()> {
        let config = self.config.read();
        for base in &config.base_dns {
            let base_dn = Dn::parse(base)?;
            self.root.open_container(&base_dn, ContainerSettings::from_config(&config, &base_dn)?)?;
        }
        Ok(())
    }

    pub fn config(&self) -> BackendConfig {
        self.config.read().clone()
    }

    pub fn root(&self) -> &RootContainer {
        &self.root
    }

    pub fn base_dns(&self) -> Vec<Dn> {
        self.root.base_dns()
    }

    pub fn container(&self, base_dn: &Dn) -> Option<Arc<EntryContainer>> {
        self.root.container(base_dn)
    }

    fn container_for(&self, dn: &Dn) -> Result<Arc<EntryContainer>> {
        self.root.container_for(dn).ok_or_else(|| {
            Error::new(ErrorKind::NoSuchObject, format!("{} is not held by this backend", dn))
        })
    }

    pub fn add_entry(&self, entry: &Entry, ctx: &OperationContext) -> Result<EntryID> {
        self.container_for(&entry.dn)?.add_entry(entry, ctx)
    }

    /// Delete an entry (and its subtree with the subtree-delete control), returning how many were removed
    pub fn delete_entry(&self, dn: &Dn, ctx: &OperationContext) -> Result<usize> {
        self.container_for(dn)?.delete_entry(dn, ctx)
    }

    /// Apply `modifications` to the entry at `dn`
    pub fn modify_entry(&self, dn: &Dn, modifications: &[Modification], ctx: &OperationContext) -> Result<Entry> {
        let container = self.container_for(dn)?;
        let old = container.get_entry(dn)?.ok_or_else(|| Error::no_such_object(dn))?;
        let mut new = old.clone();
        new.apply_modifications(modifications)?;
        let ctx = ctx.clone().with_modifications(modifications.to_vec());
        container.replace_entry(&old, &new, &ctx)?;
        Ok(new)
    }

    pub fn replace_entry(&self, old: &Entry, new: &Entry, ctx: &OperationContext) -> Result<()> {
        self.container_for(&old.dn)?.replace_entry(old, new, ctx)
    }

    /// Move `old_dn` (and its subtree) to the DN of `new_entry` within the same base DN
    pub fn rename_entry(&self, old_dn: &Dn, new_entry: &Entry, ctx: &OperationContext) -> Result<()> {
        let container = self.container_for(old_dn)?;
        if !new_entry.dn.is_subordinate_or_equal_to(container.base_dn()) {
            return Err(Error::new(
                ErrorKind::UnwillingToPerform,
                format!("cannot move {} out of {}", old_dn, container.base_dn()),
            ));
        }
        container.rename_entry(old_dn, new_entry, ctx)
    }

    pub fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>> {
        match self.root.container_for(dn) {
            Some(container) => container.get_entry(dn),
            None => Ok(None),
        }
    }

    pub fn entry_exists(&self, dn: &Dn) -> Result<bool> {
        match self.root.container_for(dn) {
            Some(container) => container.entry_exists(dn),
            None => Ok(false),
        }
    }

    pub fn num_subordinates(&self, dn: &Dn, subtree: bool) -> Result<u64> {
        self.container_for(dn)?.num_subordinates(dn, subtree)
    }

    pub fn entry_count(&self, base_dn: &Dn) -> Result<u64> {
        self.root
            .container(base_dn)
            .ok_or_else(|| Error::no_such_object(base_dn))?
            .entry_count()
    }

    pub fn search(&self, request: &SearchRequest, ctx: &OperationContext) -> Result<SearchResult> {
        self.container_for(&request.base)?.search(request, ctx)
    }

    fn import_defaults(&self) -> ImportDefaults {
        ImportDefaults { thread_count: self.config.read().import_thread_count, tmp_dir: self.tmp_dir.clone() }
    }

    /// Bulk-load entries; see `import::importer::import`
    pub fn import(&self, config: &ImportConfig, reader: &mut dyn EntryReader) -> Result<ImportResult> {
        importer::import(&self.root, config, &self.import_defaults(), reader)
    }

    pub fn rebuild(&self, config: &RebuildConfig) -> Result<RebuildResult> {
        importer::rebuild(&self.root, config, &self.import_defaults())
    }

    pub fn verify(&self, config: &VerifyConfig) -> Result<VerifyResult> {
        let base_dn = Dn::parse(&config.base_dn)?;
        let container = self.root.container(&base_dn).ok_or_else(|| Error::no_such_object(&base_dn))?;
        verify::verify(&container, config)
    }

    /// Checkpoint and copy the storage into the backup directory
    pub fn backup(&self) -> Result<PathBuf> {
        let layout = self.persistent_layout()?;
        self.root.storage().checkpoint()?;
        let path = self.root.storage().backup(&layout.backup_dir)?;
        info!("[Backend] Backup written to {}", path.display());
        Ok(path)
    }

    /// Replace the stored trees with a backup and reopen every container
    pub fn restore(&self, backup_file: &Path) -> Result<()> {
        self.persistent_layout()?;
        self.root.storage().restore(backup_file)?;
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.open_containers()?;
        info!("[Backend] Restored from {}", backup_file.display());
        Ok(())
    }

    fn persistent_layout(&self) -> Result<&StorageLayout> {
        self.layout.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::UnwillingToPerform, "in-memory backends cannot be backed up".to_string())
        })
    }

    /// Apply a new configuration: base DNs are opened or removed, index trees created
    /// (untrusted when entries exist) or deleted. Cache sizing waits for the next open.
    pub fn apply_config_change(&self, new_config: BackendConfig) -> Result<ConfigChangeResult> {
        new_config.validate()?;
        let mut current = self.config.write();
        let mut result = ConfigChangeResult::default();

        let mut wanted = Vec::new();
        for base in &new_config.base_dns {
            wanted.push(Dn::parse(base)?);
        }
        for base_dn in self.root.base_dns() {
            if !wanted.contains(&base_dn) {
                self.root.remove_container(&base_dn)?;
                warn!("[Backend] Removed base DN {} and its data", base_dn);
                result.removed_base_dns.push(base_dn.to_string());
            }
        }
        for base_dn in &wanted {
            let settings = ContainerSettings::from_config(&new_config, base_dn)?;
            match self.root.container(base_dn) {
                Some(container) => {
                    let changes = container.reconfigure(settings)?;
                    if changes != IndexChanges::default() {
                        result.index_changes.insert(base_dn.to_string(), changes);
                    }
                }
                None => {
                    self.root.open_container(base_dn, settings)?;
                    result.added_base_dns.push(base_dn.to_string());
                }
            }
        }

        if new_config.entry_cache_size != current.entry_cache_size {
            result.restart_required.push("entry_cache_size".to_string());
        }
        if new_config.storage_path != current.storage_path {
            result.restart_required.push("storage_path".to_string());
        }
        *current = new_config;
        Ok(result)
    }

    pub fn stats(&self) -> Result<BackendStats> {
        let mut containers = Vec::new();
        for container in self.root.containers() {
            let mut untrusted: Vec<String> = container.untrusted_indexes().into_iter().collect();
            untrusted.sort();
            containers.push(ContainerStats {
                base_dn: container.base_dn().to_string(),
                entry_count: container.entry_count()?,
                untrusted_indexes: untrusted,
            });
        }
        Ok(BackendStats {
            backend_id: self.config.read().backend_id.clone(),
            containers,
            cache: self.cache.as_ref().map(|c| c.stats()),
        })
    }

    /// Persist committed state and release the storage lock
    pub fn close(&self) -> Result<()> {
        self.root.close()?;
        info!("[Backend] Closed {}", self.config.read().backend_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{IndexConfig, IndexType};
    use crate::core::entry::ModificationType;

    fn config(dir: &Path) -> BackendConfig {
        BackendConfig {
            storage_path: dir.to_path_buf(),
            base_dns: vec!["o=test".to_string()],
            indexes: vec![IndexConfig::new("cn", &[IndexType::Equality])],
            ..BackendConfig::default()
        }
    }

    #[test]
    fn modify_and_reconfigure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(config(dir.path())).unwrap();
        let ctx = OperationContext::new();
        backend.add_entry(&Entry::new(Dn::parse("o=test").unwrap()).with("o", &["test"]), &ctx).unwrap();
        let dn = Dn::parse("cn=a,o=test").unwrap();
        backend.add_entry(&Entry::new(dn.clone()).with("cn", &["a"]), &ctx).unwrap();

        let modified = backend
            .modify_entry(&dn, &[Modification::new(ModificationType::Add, "sn", vec!["smith".to_string()])], &ctx)
            .unwrap();
        assert_eq!(modified.values("sn"), ["smith".to_string()]);

        let mut changed = config(dir.path());
        changed.indexes.push(IndexConfig::new("sn", &[IndexType::Equality]));
        let result = backend.apply_config_change(changed).unwrap();
        assert_eq!(result.index_changes["o=test"].created.len(), 1);
        let stats = backend.stats().unwrap();
        assert_eq!(stats.containers[0].untrusted_indexes, vec!["sn.equality".to_string()]);
        backend.close().unwrap();
    }

    #[test]
    fn entries_survive_reopen_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = OperationContext::new();
        let backend = Backend::open(config(dir.path())).unwrap();
        backend.add_entry(&Entry::new(Dn::parse("o=test").unwrap()), &ctx).unwrap();
        let backup = backend.backup().unwrap();
        backend.add_entry(&Entry::new(Dn::parse("cn=late,o=test").unwrap()), &ctx).unwrap();
        backend.close().unwrap();

        let backend = Backend::open(config(dir.path())).unwrap();
        assert_eq!(backend.entry_count(&Dn::parse("o=test").unwrap()).unwrap(), 2);
        backend.restore(&backup).unwrap();
        assert!(!backend.entry_exists(&Dn::parse("cn=late,o=test").unwrap()).unwrap());
        assert_eq!(backend.entry_count(&Dn::parse("o=test").unwrap()).unwrap(), 1);
        backend.close().unwrap();
    }
}
