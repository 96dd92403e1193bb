use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use crate::backend::entry_container::{ContainerIndexes, EntryContainer};
use crate::core::config::IndexType;
use crate::core::entry::Entry;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::matching::MatchingRuleRegistry;
use crate::core::types::EntryID;
use crate::import::chunk::{Chunk, InMemorySortedChunk};
use crate::import::collector::{EntryIdsCollector, SumCollector, TreeCollector, UniqueValueCollector};
use crate::index::attribute_index::MatchingRuleIndex;
use crate::index::dn2id::DN2ID;
use crate::index::dn2id::DN2ID_INDEX_ID;
use crate::index::dn2uri::{DN2URI, DN2URI_INDEX_ID};
use crate::index::id2count::ID2COUNT_INDEX_ID;
use crate::index::id2entry::ID2Entry;
use crate::index::vlv_index::VLVIndex;
use crate::storage::tree::{Importer, TreeName};

/// How records of a tree are reduced during phase two
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Dn2Id,
    Id2ChildrenCount,
    Dn2Uri,
    Attribute { entry_limit: u64 },
    Vlv,
}

impl TreeKind {
    pub fn collector(&self) -> TreeCollector {
        match self {
            TreeKind::Attribute { entry_limit } => {
                TreeCollector::EntryIds(EntryIdsCollector { entry_limit: *entry_limit })
            }
            TreeKind::Id2ChildrenCount => TreeCollector::Sum(SumCollector),
            TreeKind::Dn2Id | TreeKind::Dn2Uri | TreeKind::Vlv => TreeCollector::Unique(UniqueValueCollector),
        }
    }
}

/// Trees an import or rebuild writes in one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSelection {
    pub dn2id: bool,
    pub id2count: bool,
    pub dn2uri: bool,
    pub indexes: BTreeSet<String>,            // Attribute and VLV index IDs
}

impl TreeSelection {
    /// Every tree derived from id2entry
    pub fn all(indexes: &ContainerIndexes) -> Self {
        TreeSelection {
            dn2id: true,
            id2count: true,
            dn2uri: true,
            indexes: indexes.index_trees().into_iter().map(|t| t.index_id).collect(),
        }
    }

    /// Trees currently flagged untrusted
    pub fn degraded(indexes: &ContainerIndexes, untrusted: &HashSet<String>) -> Self {
        let mut selection = TreeSelection {
            dn2id: untrusted.contains(DN2ID_INDEX_ID),
            id2count: untrusted.contains(ID2COUNT_INDEX_ID),
            dn2uri: untrusted.contains(DN2URI_INDEX_ID),
            indexes: indexes
                .index_trees()
                .into_iter()
                .map(|t| t.index_id)
                .filter(|id| untrusted.contains(id))
                .collect(),
        };
        selection.id2count |= selection.dn2id;
        selection
    }

    /// Resolve user-supplied names: `dn2id`, `dn2uri`, `id2childrencount`, an attribute
    /// (all its indexes), `attr.type` or `vlv.name`. Rebuilding dn2id implies id2childrencount.
    pub fn from_names(indexes: &ContainerIndexes, names: &[String]) -> Result<Self> {
        let mut selection = TreeSelection::default();
        for name in names {
            let lower = name.trim().to_ascii_lowercase();
            match lower.as_str() {
                DN2ID_INDEX_ID => {
                    selection.dn2id = true;
                    selection.id2count = true;
                }
                ID2COUNT_INDEX_ID => selection.id2count = true,
                DN2URI_INDEX_ID => selection.dn2uri = true,
                _ => selection.add_index(indexes, &lower, name)?,
            }
        }
        Ok(selection)
    }

    fn add_index(&mut self, indexes: &ContainerIndexes, lower: &str, name: &str) -> Result<()> {
        let unknown = || Error::new(ErrorKind::InvalidArgument, format!("no index named {}", name));
        if let Some(vlv_name) = lower.strip_prefix("vlv.") {
            let vlv = indexes
                .vlv_indexes()
                .iter()
                .find(|v| v.name().eq_ignore_ascii_case(vlv_name))
                .ok_or_else(unknown)?;
            self.indexes.insert(vlv.tree().index_id.clone());
            return Ok(());
        }

        let (attribute, suffix) = match lower.split_once('.') {
            Some((attribute, suffix)) => (attribute, Some(suffix)),
            None => (lower, None),
        };
        let index = indexes
            .attribute_indexes()
            .values()
            .find(|i| i.attribute().eq_ignore_ascii_case(attribute))
            .ok_or_else(unknown)?;
        let trees: Vec<&MatchingRuleIndex> = match suffix {
            None => index.indexes().iter().collect(),
            Some(suffix) => match suffix.strip_prefix("ext.") {
                Some(rule) => index.extensible(rule).into_iter().collect(),
                None => match IndexType::parse(suffix) {
                    Some(IndexType::Extensible) => index
                        .indexes()
                        .iter()
                        .filter(|i| i.tree().index_id.contains(".ext."))
                        .collect(),
                    Some(index_type) => index.index(index_type).into_iter().collect(),
                    None => Vec::new(),
                },
            },
        };
        if trees.is_empty() {
            return Err(unknown());
        }
        self.indexes.extend(trees.iter().map(|i| i.tree().index_id.clone()));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        !self.dn2id && !self.id2count && !self.dn2uri && self.indexes.is_empty()
    }

    /// Trees phase one fills through sort chunks; dn2id also feeds id2childrencount
    pub fn chunk_count(&self) -> usize {
        usize::from(self.dn2id || self.id2count) + usize::from(self.dn2uri) + self.indexes.len()
    }

    /// Selected trees of `container`
    pub fn trees(&self, container: &EntryContainer) -> Vec<TreeName> {
        let mut trees = Vec::new();
        if self.dn2id {
            trees.push(container.dn2id().tree().clone());
        }
        if self.id2count {
            trees.push(container.id2count().tree().clone());
        }
        if self.dn2uri {
            trees.push(container.dn2uri().tree().clone());
        }
        trees.extend(
            container
                .indexes()
                .index_trees()
                .into_iter()
                .filter(|t| self.indexes.contains(&t.index_id)),
        );
        trees
    }
}

/// A tree merged in phase two and the chunk holding its phase-one records
pub struct TreePlan {
    pub tree: TreeName,
    pub kind: TreeKind,
    pub chunk: Arc<dyn Chunk>,
    pub write: bool,                          // False when only read to derive other trees
}

/// Routing of one container's entries into per-tree chunks
pub struct ContainerPlan {
    pub container: Arc<EntryContainer>,
    id2entry: Option<ID2Entry>,
    dn2id: DN2ID,
    dn2uri: DN2URI,
    rules: Arc<MatchingRuleRegistry>,
    pub dn_tree: Option<TreePlan>,
    pub count_tree: Option<TreePlan>,
    dn2uri_chunk: Option<Arc<dyn Chunk>>,
    attributes: Vec<(MatchingRuleIndex, Arc<dyn Chunk>)>,
    vlv: Vec<(VLVIndex, Arc<dyn Chunk>)>,
    others: Vec<TreePlan>,
}

impl ContainerPlan {
    /// Plan the trees of `container` named by `selection`. `chunk_for` supplies the
    /// phase-one destination of each tree; id2childrencount is derived in memory.
    pub fn new(
        container: Arc<EntryContainer>,
        selection: &TreeSelection,
        write_id2entry: bool,
        chunk_for: &dyn Fn(&TreeName) -> Arc<dyn Chunk>,
    ) -> Self {
        let indexes = container.indexes();
        let id2entry = write_id2entry.then(|| indexes.id2entry().clone());

        let dn_tree = (selection.dn2id || selection.id2count).then(|| TreePlan {
            tree: container.dn2id().tree().clone(),
            kind: TreeKind::Dn2Id,
            chunk: chunk_for(container.dn2id().tree()),
            write: selection.dn2id,
        });
        let count_tree = selection.id2count.then(|| TreePlan {
            tree: container.id2count().tree().clone(),
            kind: TreeKind::Id2ChildrenCount,
            chunk: Arc::new(InMemorySortedChunk::new()) as Arc<dyn Chunk>,
            write: true,
        });

        let mut others = Vec::new();
        let dn2uri_chunk = selection.dn2uri.then(|| {
            let chunk = chunk_for(container.dn2uri().tree());
            others.push(TreePlan {
                tree: container.dn2uri().tree().clone(),
                kind: TreeKind::Dn2Uri,
                chunk: chunk.clone(),
                write: true,
            });
            chunk
        });

        let mut attributes = Vec::new();
        for index in indexes.ordered().flat_map(|a| a.indexes().iter()) {
            if !selection.indexes.contains(&index.tree().index_id) {
                continue;
            }
            let chunk = chunk_for(index.tree());
            others.push(TreePlan {
                tree: index.tree().clone(),
                kind: TreeKind::Attribute { entry_limit: index.entry_limit() },
                chunk: chunk.clone(),
                write: true,
            });
            attributes.push((index.clone(), chunk));
        }

        let mut vlv = Vec::new();
        for index in indexes.vlv_indexes() {
            if !selection.indexes.contains(&index.tree().index_id) {
                continue;
            }
            let chunk = chunk_for(index.tree());
            others.push(TreePlan { tree: index.tree().clone(), kind: TreeKind::Vlv, chunk: chunk.clone(), write: true });
            vlv.push((index.clone(), chunk));
        }
        drop(indexes);

        ContainerPlan {
            id2entry,
            dn2id: container.dn2id().clone(),
            dn2uri: container.dn2uri().clone(),
            rules: container.rules().clone(),
            container,
            dn_tree,
            count_tree,
            dn2uri_chunk,
            attributes,
            vlv,
            others,
        }
    }

    /// Trees that phase one fills through chunks
    pub fn chunk_count(&self) -> usize {
        self.others.len() + usize::from(self.dn_tree.is_some())
    }

    /// Trees merged independently of dn2id, largest first
    pub fn take_independent_trees(&mut self) -> Vec<TreePlan> {
        let mut trees = std::mem::take(&mut self.others);
        trees.sort_by_key(|t| std::cmp::Reverse(t.chunk.size()));
        trees
    }

    /// Phase one for one entry: store it and emit a record per derived tree
    pub fn encode(&self, importer: &dyn Importer, id: EntryID, entry: &Entry) -> Result<()> {
        if let Some(id2entry) = &self.id2entry {
            id2entry.put_import(importer, id, entry)?;
        }
        let id_value = id.to_key().to_vec();
        if let Some(plan) = &self.dn_tree {
            plan.chunk.put(self.dn2id.key(&entry.dn).to_vec(), id_value.clone())?;
        }
        if let Some(chunk) = &self.dn2uri_chunk {
            if let Some((key, value)) = self.dn2uri.record(entry)? {
                chunk.put(key, value)?;
            }
        }
        for (index, chunk) in &self.attributes {
            for key in index.entry_keys(entry) {
                chunk.put(key, id_value.clone())?;
            }
        }
        for (index, chunk) in &self.vlv {
            if let Some(key) = index.record_key(id, entry, &self.rules) {
                chunk.put(key, id_value.clone())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::entry_container::ContainerSettings;
    use crate::backend::root_container::RootContainer;
    use crate::core::config::IndexConfig;
    use crate::core::dn::Dn;
    use crate::storage::btree::BTreeStorage;

    fn container() -> Arc<EntryContainer> {
        let root = RootContainer::new(Arc::new(BTreeStorage::in_memory()), Arc::new(MatchingRuleRegistry::default()), None);
        let settings = ContainerSettings {
            indexes: vec![
                IndexConfig::new("cn", &[IndexType::Equality, IndexType::Substring]),
                IndexConfig::new("mail", &[IndexType::Presence]),
            ],
            ..ContainerSettings::default()
        };
        root.open_container(&Dn::parse("o=test").unwrap(), settings).unwrap()
    }

    #[test]
    fn user_defined_names() {
        let container = container();
        let indexes = container.indexes();
        let selection = TreeSelection::from_names(&indexes, &["cn".to_string(), "mail.presence".to_string()]).unwrap();
        assert_eq!(
            selection.indexes.iter().cloned().collect::<Vec<_>>(),
            vec!["cn.equality", "cn.substring", "mail.presence"]
        );
        assert!(!selection.dn2id);

        let selection = TreeSelection::from_names(&indexes, &["dn2id".to_string()]).unwrap();
        assert!(selection.dn2id && selection.id2count);

        let err = TreeSelection::from_names(&indexes, &["mail.equality".to_string()]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn degraded_selects_untrusted_trees() {
        let container = container();
        let indexes = container.indexes();
        let untrusted: HashSet<String> = ["dn2id".to_string(), "cn.substring".to_string()].into_iter().collect();
        let selection = TreeSelection::degraded(&indexes, &untrusted);
        assert!(selection.dn2id && selection.id2count && !selection.dn2uri);
        assert_eq!(selection.indexes.len(), 1);
    }

    #[test]
    fn plan_routes_entry_keys() {
        let container = container();
        let selection = TreeSelection::all(&container.indexes());
        let chunks = parking_lot::Mutex::new(Vec::new());
        let chunk_for = |tree: &TreeName| -> Arc<dyn Chunk> {
            let chunk = Arc::new(InMemorySortedChunk::new());
            chunks.lock().push((tree.index_id.clone(), chunk.clone()));
            chunk
        };
        let mut plan = ContainerPlan::new(container.clone(), &selection, false, &chunk_for);
        assert_eq!(plan.chunk_count(), 5);

        let storage = BTreeStorage::in_memory();
        let importer = crate::storage::tree::Storage::start_import(&storage).unwrap();
        let entry = Entry::new(Dn::parse("cn=alice,o=test").unwrap()).with("cn", &["alice"]);
        plan.encode(importer.as_ref(), EntryID(3), &entry).unwrap();

        let sizes: Vec<(String, bool)> = chunks.lock().iter().map(|(id, c)| (id.clone(), c.size() > 0)).collect();
        assert!(sizes.contains(&("dn2id".to_string(), true)));
        assert!(sizes.contains(&("cn.equality".to_string(), true)));
        assert!(sizes.contains(&("mail.presence".to_string(), false)));
        assert_eq!(plan.take_independent_trees().len(), 4);
    }
}
