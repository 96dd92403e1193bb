use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use log::{debug, info};
use parking_lot::RwLock;
use crate::backend::entry_container::{ContainerSettings, EntryContainer};
use crate::core::cache::EntryCache;
use crate::core::dn::Dn;
use crate::core::error::{Error, Result};
use crate::core::matching::MatchingRuleRegistry;
use crate::core::types::EntryID;
use crate::storage::tree::{Storage, TreeName};

/// Hands out entry IDs in increasing order for every container of a backend
#[derive(Debug)]
pub struct EntryIdAllocator {
    next: AtomicU64,
}

impl EntryIdAllocator {
    pub fn new(first: u64) -> Self {
        EntryIdAllocator { next: AtomicU64::new(first.max(1)) }
    }

    pub fn next_id(&self) -> EntryID {
        EntryID(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Make sure IDs after `id` are handed out next
    pub fn bump_past(&self, id: EntryID) {
        self.next.fetch_max(id.0.saturating_add(1), Ordering::SeqCst);
    }

    pub fn peek(&self) -> EntryID {
        EntryID(self.next.load(Ordering::SeqCst))
    }
}

/// Owns the storage handle and one entry container per base DN
pub struct RootContainer {
    storage: Arc<dyn Storage>,
    ids: Arc<EntryIdAllocator>,
    rules: Arc<MatchingRuleRegistry>,
    cache: Option<Arc<dyn EntryCache>>,
    containers: RwLock<BTreeMap<Dn, Arc<EntryContainer>>>,
}

impl RootContainer {
    pub fn new(
        storage: Arc<dyn Storage>,
        rules: Arc<MatchingRuleRegistry>,
        cache: Option<Arc<dyn EntryCache>>,
    ) -> Self {
        RootContainer {
            storage,
            ids: Arc::new(EntryIdAllocator::new(1)),
            rules,
            cache,
            containers: RwLock::new(BTreeMap::new()),
        }
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

    pub fn cache(&self) -> Option<&Arc<dyn EntryCache>> {
        self.cache.as_ref()
    }

    /// Build an entry container over `prefix` without registering it
    pub fn create_container(&self, base_dn: &Dn, prefix: &str, settings: ContainerSettings) -> Result<EntryContainer> {
        EntryContainer::new(
            base_dn.clone(),
            prefix.to_string(),
            self.storage.clone(),
            self.ids.clone(),
            self.rules.clone(),
            self.cache.clone(),
            settings,
        )
    }

    /// Open (creating on demand) and register the container of `base_dn`
    pub fn open_container(&self, base_dn: &Dn, settings: ContainerSettings) -> Result<Arc<EntryContainer>> {
        let container = self.create_container(base_dn, &base_dn.normalized(), settings)?;
        container.open()?;
        if let Some(highest) = container.highest_entry_id()? {
            self.ids.bump_past(highest);
        }
        let container = Arc::new(container);
        self.containers.write().insert(base_dn.clone(), container.clone());
        info!("[RootContainer] Opened container {} (next entry ID {})", base_dn, self.ids.peek());
        Ok(container)
    }

    pub fn container(&self, base_dn: &Dn) -> Option<Arc<EntryContainer>> {
        self.containers.read().get(base_dn).cloned()
    }

    /// Container whose base DN is the closest superior of (or equal to) `dn`
    pub fn container_for(&self, dn: &Dn) -> Option<Arc<EntryContainer>> {
        self.containers
            .read()
            .iter()
            .filter(|(base, _)| dn.is_subordinate_or_equal_to(base))
            .max_by_key(|(base, _)| base.size())
            .map(|(_, container)| container.clone())
    }

    pub fn containers(&self) -> Vec<Arc<EntryContainer>> {
        self.containers.read().values().cloned().collect()
    }

    pub fn base_dns(&self) -> Vec<Dn> {
        self.containers.read().keys().cloned().collect()
    }

    /// Unregister a container and delete its trees
    pub fn remove_container(&self, base_dn: &Dn) -> Result<()> {
        let removed = self.containers.write().remove(base_dn);
        match removed {
            Some(container) => container.delete(),
            None => Err(Error::no_such_object(base_dn)),
        }
    }

    /// Atomically replace the registered container of `base_dn` with the trees of `temporary`.
    /// The old container's trees are deleted and the temporary trees renamed over them.
    pub fn swap_container(&self, base_dn: &Dn, temporary: &EntryContainer) -> Result<Arc<EntryContainer>> {
        let mut containers = self.containers.write();
        let current = containers
            .get(base_dn)
            .cloned()
            .ok_or_else(|| Error::no_such_object(base_dn))?;
        let settings = current.settings();
        let prefix = base_dn.normalized();

        let temporary_trees = temporary.all_trees();
        let current_trees = current.all_trees();
        {
            let _exclusive = current.lock_exclusive();
            self.storage.write(|txn| {
                for tree in &current_trees {
                    txn.delete_tree(tree)?;
                }
                for tree in &temporary_trees {
                    txn.rename_tree(tree, &tree.with_base(&prefix))?;
                }
                Ok(())
            })?;
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }

        let replacement = Arc::new(self.create_container(base_dn, &prefix, settings)?);
        replacement.open()?;
        if let Some(highest) = replacement.highest_entry_id()? {
            self.ids.bump_past(highest);
        }
        containers.insert(base_dn.clone(), replacement.clone());
        debug!("[RootContainer] Swapped container {} from {}", base_dn, temporary.prefix());
        Ok(replacement)
    }

    /// Trees of every registered container
    pub fn all_trees(&self) -> Vec<TreeName> {
        self.containers.read().values().flat_map(|c| c.all_trees()).collect()
    }

    pub fn close(&self) -> Result<()> {
        self.containers.write().clear();
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.storage.close()
    }
}

impl std::fmt::Debug for RootContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RootContainer")
            .field("base_dns", &self.base_dns())
            .field("next_id", &self.ids.peek())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_and_skip_past_existing() {
        let ids = EntryIdAllocator::new(0);
        assert_eq!(ids.next_id(), EntryID(1));
        ids.bump_past(EntryID(10));
        assert_eq!(ids.next_id(), EntryID(11));
        ids.bump_past(EntryID(3));
        assert_eq!(ids.next_id(), EntryID(12));
    }
}
