use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use log::warn;
use lru::LruCache;
use parking_lot::Mutex;
use crate::backend::entry_container::EntryContainer;
use crate::codec::dn_key::{find_parent_len, is_descendant_key};
use crate::core::dn::Dn;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntryID;
use crate::import::chunk::Chunk;
use crate::index::id2count::encode_count;
use crate::storage::btree::BTreeStorage;
use crate::storage::layout::StorageLayout;
use crate::storage::tree::{Storage, TreeName};

/// Presence set of the DNs an import has accepted so far
pub trait DnCache: Send + Sync {
    /// Record `dn`, false if it was already present
    fn insert(&self, dn: &Dn) -> Result<bool>;

    fn contains(&self, dn: &Dn) -> Result<bool>;
}

const BUCKETS: &str = "buckets";

/// DNs hashed into buckets of a scratch storage under the import temp directory,
/// fronted by an LRU of recently seen DNs
pub struct TempDnCache {
    storage: Box<dyn Storage>,
    tree: TreeName,
    recent: Mutex<LruCache<String, ()>>,
}

impl TempDnCache {
    pub fn new(tmp_dir: &Path, recent_capacity: usize) -> Result<Self> {
        let layout = StorageLayout::new(tmp_dir.join(format!("dncache-{}", uuid::Uuid::new_v4())))?;
        let storage: Box<dyn Storage> = Box::new(BTreeStorage::new(layout));
        storage.open()?;
        let tree = TreeName::new("dncache", BUCKETS);
        storage.write(|txn| txn.open_tree(&tree, true))?;
        let capacity = NonZeroUsize::new(recent_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(TempDnCache { storage, tree, recent: Mutex::new(LruCache::new(capacity)) })
    }

    fn bucket(normalized: &str) -> [u8; 4] {
        crc32fast::hash(normalized.as_bytes()).to_be_bytes()
    }
}

impl DnCache for TempDnCache {
    fn insert(&self, dn: &Dn) -> Result<bool> {
        let normalized = dn.normalized();
        if self.recent.lock().contains(&normalized) {
            return Ok(false);
        }
        let mut inserted = false;
        self.storage.write(|txn| {
            txn.update(&self.tree, &Self::bucket(&normalized), &mut |current: Option<&[u8]>| {
                let mut dns: Vec<String> = match current {
                    Some(bytes) => bincode::deserialize(bytes)?,
                    None => Vec::new(),
                };
                if dns.contains(&normalized) {
                    return Ok(current.map(|c| c.to_vec()));
                }
                dns.push(normalized.clone());
                inserted = true;
                Ok(Some(bincode::serialize(&dns)?))
            })
        })?;
        self.recent.lock().put(normalized, ());
        Ok(inserted)
    }

    fn contains(&self, dn: &Dn) -> Result<bool> {
        let normalized = dn.normalized();
        if self.recent.lock().get(&normalized).is_some() {
            return Ok(true);
        }
        let bucket = self.storage.read(|txn| txn.read(&self.tree, &Self::bucket(&normalized)))?;
        match bucket {
            Some(bytes) => {
                let dns: Vec<String> = bincode::deserialize(&bytes)?;
                Ok(dns.contains(&normalized))
            }
            None => Ok(false),
        }
    }
}

impl Drop for TempDnCache {
    fn drop(&mut self) {
        if let Err(err) = self.storage.remove_storage_files() {
            warn!("[Import] Could not remove DN cache files: {}", err);
        }
    }
}

/// Entries already stored in the destination dn2id, plus the ones imported now
pub struct Dn2IdDnCache {
    container: Arc<EntryContainer>,
    imported: TempDnCache,
}

impl Dn2IdDnCache {
    pub fn new(container: Arc<EntryContainer>, imported: TempDnCache) -> Self {
        Dn2IdDnCache { container, imported }
    }

    fn stored(&self, dn: &Dn) -> Result<bool> {
        let dn2id = self.container.dn2id();
        Ok(self.container.storage().read(|txn| dn2id.get(txn, dn))?.is_some())
    }
}

impl DnCache for Dn2IdDnCache {
    fn insert(&self, dn: &Dn) -> Result<bool> {
        if self.stored(dn)? {
            return Ok(false);
        }
        self.imported.insert(dn)
    }

    fn contains(&self, dn: &Dn) -> Result<bool> {
        Ok(self.imported.contains(dn)? || self.stored(dn)?)
    }
}

/// Reason an entry is rejected by DN validation, `None` when it is accepted
pub fn validate_dn(cache: &dyn DnCache, dn: &Dn, base_dn: &Dn) -> Result<Option<String>> {
    if dn != base_dn {
        let parent_known = match dn.parent() {
            Some(parent) => cache.contains(&parent)?,
            None => false,
        };
        if !parent_known {
            return Ok(Some(format!("parent entry of {} does not exist", dn)));
        }
    }
    check_duplicate(cache, dn)
}

/// Record `dn`, rejecting it when the cache already holds it
pub fn check_duplicate(cache: &dyn DnCache, dn: &Dn) -> Result<Option<String>> {
    if !cache.insert(dn)? {
        return Ok(Some(format!("entry {} already exists", dn)));
    }
    Ok(None)
}

/// Callbacks of a walk over a sorted dn2id stream
pub trait TreeVisitor {
    fn begin_parent(&mut self, parent: EntryID);

    fn on_child(&mut self, parent: EntryID, child: EntryID);

    fn end_parent(&mut self, parent: EntryID) -> Result<()>;
}

/// Counts children per parent into an id2childrencount chunk
pub struct ChildrenCounter<'a> {
    chunk: &'a dyn Chunk,
    open: Vec<(EntryID, i64)>,
}

impl<'a> ChildrenCounter<'a> {
    pub fn new(chunk: &'a dyn Chunk) -> Self {
        ChildrenCounter { chunk, open: Vec::new() }
    }
}

impl TreeVisitor for ChildrenCounter<'_> {
    fn begin_parent(&mut self, parent: EntryID) {
        self.open.push((parent, 0));
    }

    fn on_child(&mut self, parent: EntryID, _child: EntryID) {
        if let Some((id, count)) = self.open.last_mut() {
            if *id == parent {
                *count += 1;
            }
        }
    }

    fn end_parent(&mut self, parent: EntryID) -> Result<()> {
        match self.open.pop() {
            Some((id, count)) if id == parent => {
                if count > 0 {
                    self.chunk.put(id.to_key().to_vec(), encode_count(count).to_vec())?;
                }
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::Internal, format!("unbalanced visit of entry {}", parent))),
        }
    }
}

/// Looks up a DN key outside the merged stream, for imports appending to existing data
pub type ParentLookup<'a> = &'a dyn Fn(&[u8]) -> Result<Option<EntryID>>;

/// Checks a key-ordered dn2id stream: every key needs its parent earlier in the
/// stream (or already stored) and no key may repeat.
pub struct OrderedDnValidator<'a, V: TreeVisitor> {
    visitor: V,
    ancestors: Vec<(Vec<u8>, EntryID)>,
    previous: Option<Vec<u8>>,
    lookup: Option<ParentLookup<'a>>,
}

impl<'a, V: TreeVisitor> OrderedDnValidator<'a, V> {
    pub fn new(visitor: V, lookup: Option<ParentLookup<'a>>) -> Self {
        OrderedDnValidator { visitor, ancestors: Vec::new(), previous: None, lookup }
    }

    pub fn accept(&mut self, key: &[u8], id: EntryID) -> Result<()> {
        if self.previous.as_deref() == Some(key) {
            return Err(Error::new(
                ErrorKind::EntryAlreadyExists,
                format!("duplicate DN key {:02x?} for entry {}", key, id),
            ));
        }
        while let Some((top, top_id)) = self.ancestors.last() {
            if is_descendant_key(key, top) {
                break;
            }
            let top_id = *top_id;
            self.ancestors.pop();
            self.visitor.end_parent(top_id)?;
        }

        if let Some(parent_len) = find_parent_len(key) {
            let parent_id = match self.ancestors.last() {
                Some((top, top_id)) if top.len() == parent_len => *top_id,
                _ => self.resume_parent(&key[..parent_len], id)?,
            };
            self.visitor.on_child(parent_id, id);
        } else if !key.is_empty() {
            return Err(Error::new(ErrorKind::Parse, format!("invalid DN key {:02x?}", key)));
        }

        self.visitor.begin_parent(id);
        self.ancestors.push((key.to_vec(), id));
        self.previous = Some(key.to_vec());
        Ok(())
    }

    // Parent stored before this import started
    fn resume_parent(&mut self, parent_key: &[u8], child: EntryID) -> Result<EntryID> {
        let found = match self.lookup {
            Some(lookup) => lookup(parent_key)?,
            None => None,
        };
        let Some(parent_id) = found else {
            return Err(Error::new(
                ErrorKind::NoSuchObject,
                format!("parent of entry {} is missing", child),
            ));
        };
        self.visitor.begin_parent(parent_id);
        self.ancestors.push((parent_key.to_vec(), parent_id));
        Ok(parent_id)
    }

    /// Close every open parent and hand back the visitor
    pub fn finish(mut self) -> Result<V> {
        while let Some((_, id)) = self.ancestors.pop() {
            self.visitor.end_parent(id)?;
        }
        Ok(self.visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::dn_key::dn_to_key;
    use crate::import::chunk::InMemorySortedChunk;
    use crate::import::cursor::collect_records;
    use crate::index::id2count::decode_count;

    fn key(dn: &str) -> Vec<u8> {
        dn_to_key(&Dn::parse(dn).unwrap(), 2).to_vec()
    }

    fn counts(chunk: &InMemorySortedChunk) -> Vec<(u64, i64)> {
        let mut cursor = chunk.flip().unwrap();
        collect_records(cursor.as_mut())
            .unwrap()
            .into_iter()
            .map(|(k, v)| (EntryID::from_key(&k).unwrap().0, decode_count(&v).unwrap()))
            .collect()
    }

    #[test]
    fn children_are_counted_per_parent() {
        let chunk = InMemorySortedChunk::new();
        let mut stream = vec![
            (key("dc=example,dc=com"), 1),
            (key("ou=people,dc=example,dc=com"), 2),
            (key("cn=a,ou=people,dc=example,dc=com"), 3),
            (key("cn=b,ou=people,dc=example,dc=com"), 4),
            (key("ou=groups,dc=example,dc=com"), 5),
        ];
        stream.sort();
        let mut validator = OrderedDnValidator::new(ChildrenCounter::new(&chunk), None);
        for (k, id) in &stream {
            validator.accept(k, EntryID(*id)).unwrap();
        }
        validator.finish().unwrap();
        assert_eq!(counts(&chunk), vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn orphans_and_duplicates_fail() {
        let chunk = InMemorySortedChunk::new();
        let mut validator = OrderedDnValidator::new(ChildrenCounter::new(&chunk), None);
        validator.accept(&key("dc=example,dc=com"), EntryID(1)).unwrap();
        let err = validator.accept(&key("cn=a,ou=missing,dc=example,dc=com"), EntryID(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoSuchObject);

        let mut validator = OrderedDnValidator::new(ChildrenCounter::new(&chunk), None);
        validator.accept(&key("dc=example,dc=com"), EntryID(1)).unwrap();
        let err = validator.accept(&key("dc=example,dc=com"), EntryID(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EntryAlreadyExists);
    }

    #[test]
    fn stored_parents_are_resumed() {
        let chunk = InMemorySortedChunk::new();
        let people = key("ou=people,dc=example,dc=com");
        let lookup = |k: &[u8]| -> Result<Option<EntryID>> {
            Ok(if k == people.as_slice() { Some(EntryID(7)) } else { None })
        };
        let mut validator = OrderedDnValidator::new(ChildrenCounter::new(&chunk), Some(&lookup));
        validator.accept(&key("cn=x,ou=people,dc=example,dc=com"), EntryID(20)).unwrap();
        validator.accept(&key("cn=y,ou=people,dc=example,dc=com"), EntryID(21)).unwrap();
        validator.finish().unwrap();
        assert_eq!(counts(&chunk), vec![(7, 2)]);
    }

    #[test]
    fn temporary_cache_tracks_presence() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TempDnCache::new(dir.path(), 1).unwrap();
        let base = Dn::parse("dc=example,dc=com").unwrap();
        let child = Dn::parse("ou=people,dc=example,dc=com").unwrap();
        let orphan = Dn::parse("cn=a,ou=missing,dc=example,dc=com").unwrap();

        assert_eq!(validate_dn(&cache, &base, &base).unwrap(), None);
        assert_eq!(validate_dn(&cache, &child, &base).unwrap(), None);
        assert!(validate_dn(&cache, &child, &base).unwrap().unwrap().contains("already exists"));
        assert!(validate_dn(&cache, &orphan, &base).unwrap().unwrap().contains("does not exist"));
        // Evicted from the LRU but still found in its bucket
        assert!(cache.contains(&base).unwrap());
    }
}
