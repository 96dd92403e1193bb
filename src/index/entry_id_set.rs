use std::fmt;
use roaring::RoaringTreemap;
use crate::codec::varint::{DeltaEncoder, VByteEncoder};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntryID;

const TAG_DEFINED: u8 = 0;
const TAG_UNDEFINED: u8 = 1;

/// Set of entry IDs matching an index key.
///
/// A set that grows past its index entry limit becomes `Undefined`: it no longer
/// lists IDs and only remembers how many it would hold. Undefined sets stay
/// undefined until the index is rebuilt.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryIDSet {
    Defined(RoaringTreemap),
    Undefined { size: Option<u64> },
}

impl Default for EntryIDSet {
    fn default() -> Self {
        EntryIDSet::Defined(RoaringTreemap::new())
    }
}

impl EntryIDSet {
    pub fn new() -> Self {
        EntryIDSet::default()
    }

    pub fn from_ids(ids: impl IntoIterator<Item = EntryID>) -> Self {
        EntryIDSet::Defined(ids.into_iter().map(|id| id.0).collect())
    }

    /// Undefined set of unknown size, e.g. an unindexed filter component
    pub fn undefined() -> Self {
        EntryIDSet::Undefined { size: None }
    }

    pub fn undefined_with_size(size: u64) -> Self {
        EntryIDSet::Undefined { size: Some(size) }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, EntryIDSet::Defined(_))
    }

    /// Number of IDs, known for defined sets and for undefined sets that kept a count
    pub fn size(&self) -> Option<u64> {
        match self {
            EntryIDSet::Defined(ids) => Some(ids.len()),
            EntryIDSet::Undefined { size } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, EntryIDSet::Defined(ids) if ids.is_empty())
    }

    /// Undefined sets contain everything
    pub fn contains(&self, id: EntryID) -> bool {
        match self {
            EntryIDSet::Defined(ids) => ids.contains(id.0),
            EntryIDSet::Undefined { .. } => true,
        }
    }

    /// Returns true if the set changed
    pub fn add(&mut self, id: EntryID) -> bool {
        match self {
            EntryIDSet::Defined(ids) => ids.insert(id.0),
            EntryIDSet::Undefined { size } => {
                if let Some(size) = size {
                    *size += 1;
                }
                true
            }
        }
    }

    pub fn remove(&mut self, id: EntryID) -> bool {
        match self {
            EntryIDSet::Defined(ids) => ids.remove(id.0),
            EntryIDSet::Undefined { size } => {
                if let Some(size) = size {
                    *size = size.saturating_sub(1);
                }
                true
            }
        }
    }

    /// Union in place; any undefined side makes the result undefined
    pub fn add_all(&mut self, other: &EntryIDSet) {
        match (&mut *self, other) {
            (EntryIDSet::Defined(ids), EntryIDSet::Defined(more)) => *ids |= more,
            (_, _) => {
                let size = match (self.size(), other.size()) {
                    (Some(a), Some(b)) => Some(a + b),
                    _ => None,
                };
                *self = EntryIDSet::Undefined { size };
            }
        }
    }

    /// Intersection in place; an undefined side does not restrict the other
    pub fn retain_all(&mut self, other: &EntryIDSet) {
        match (&mut *self, other) {
            (EntryIDSet::Defined(ids), EntryIDSet::Defined(keep)) => *ids &= keep,
            (EntryIDSet::Defined(_), EntryIDSet::Undefined { .. }) => {}
            (EntryIDSet::Undefined { .. }, EntryIDSet::Defined(keep)) => {
                *self = EntryIDSet::Defined(keep.clone());
            }
            (EntryIDSet::Undefined { .. }, EntryIDSet::Undefined { .. }) => {}
        }
    }

    /// Difference in place; removing from an undefined set keeps it undefined
    pub fn remove_all(&mut self, other: &EntryIDSet) {
        match (&mut *self, other) {
            (EntryIDSet::Defined(ids), EntryIDSet::Defined(drop)) => *ids -= drop,
            (EntryIDSet::Defined(_), EntryIDSet::Undefined { .. }) => {
                *self = EntryIDSet::undefined();
            }
            (EntryIDSet::Undefined { size }, EntryIDSet::Defined(drop)) => {
                if let Some(size) = size {
                    *size = size.saturating_sub(drop.len());
                }
            }
            (EntryIDSet::Undefined { .. }, EntryIDSet::Undefined { .. }) => {}
        }
    }

    /// Degrade to undefined when above `limit` (0 means unlimited)
    pub fn apply_limit(&mut self, limit: u64) {
        if limit == 0 {
            return;
        }
        if let EntryIDSet::Defined(ids) = self {
            if ids.len() > limit {
                *self = EntryIDSet::undefined_with_size(ids.len());
            }
        }
    }

    /// IDs in ascending order, empty for undefined sets
    pub fn ids(&self) -> Vec<EntryID> {
        match self {
            EntryIDSet::Defined(ids) => ids.iter().map(EntryID).collect(),
            EntryIDSet::Undefined { .. } => Vec::new(),
        }
    }

    /// IDs >= `start` in ascending order
    pub fn ids_from(&self, start: EntryID) -> Vec<EntryID> {
        match self {
            EntryIDSet::Defined(ids) => ids.iter().skip_while(|&id| id < start.0).map(EntryID).collect(),
            EntryIDSet::Undefined { .. } => Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            EntryIDSet::Defined(ids) => {
                out.push(TAG_DEFINED);
                DeltaEncoder::encode_sorted(&mut out, ids.iter());
            }
            EntryIDSet::Undefined { size } => {
                out.push(TAG_UNDEFINED);
                if let Some(size) = size {
                    VByteEncoder::encode_u64(&mut out, *size);
                }
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            Some(&TAG_DEFINED) => Ok(EntryIDSet::Defined(
                DeltaEncoder::decode_sorted(&bytes[1..])?.into_iter().collect(),
            )),
            Some(&TAG_UNDEFINED) if bytes.len() == 1 => Ok(EntryIDSet::undefined()),
            Some(&TAG_UNDEFINED) => {
                let (size, _) = VByteEncoder::decode_u64(&bytes[1..])?;
                Ok(EntryIDSet::undefined_with_size(size))
            }
            _ => Err(Error::new(ErrorKind::Parse, "invalid entry ID set encoding".to_string())),
        }
    }
}

impl fmt::Display for EntryIDSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntryIDSet::Defined(ids) => write!(f, "[COUNT:{}]", ids.len()),
            EntryIDSet::Undefined { size: Some(size) } => write!(f, "[LIMIT-EXCEEDED:{}]", size),
            EntryIDSet::Undefined { size: None } => write!(f, "[NOT-INDEXED]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[u64]) -> EntryIDSet {
        EntryIDSet::from_ids(ids.iter().map(|&id| EntryID(id)))
    }

    #[test]
    fn adding_twice_does_not_duplicate() {
        let mut ids = set(&[3, 7]);
        assert!(ids.add(EntryID(5)));
        assert!(!ids.add(EntryID(5)));
        assert!(!ids.remove(EntryID(9)));
        assert_eq!(ids.ids(), vec![EntryID(3), EntryID(5), EntryID(7)]);
    }

    #[test]
    fn limit_boundary() {
        let mut ids = set(&[1, 2, 3, 4]);
        ids.apply_limit(4);
        assert!(ids.is_defined());

        ids.add(EntryID(5));
        ids.apply_limit(4);
        assert_eq!(ids, EntryIDSet::undefined_with_size(5));

        ids.remove(EntryID(1));
        ids.remove(EntryID(2));
        ids.apply_limit(4);
        assert!(!ids.is_defined());
        assert_eq!(ids.size(), Some(3));
    }

    #[test]
    fn set_algebra_with_undefined() {
        let mut left = set(&[1, 2, 3]);
        left.retain_all(&EntryIDSet::undefined());
        assert_eq!(left.ids().len(), 3);

        let mut undefined = EntryIDSet::undefined();
        undefined.retain_all(&set(&[2]));
        assert_eq!(undefined.ids(), vec![EntryID(2)]);

        let mut union = set(&[1]);
        union.add_all(&EntryIDSet::undefined_with_size(10));
        assert_eq!(union.size(), Some(11));
        assert!(!union.is_defined());
    }

    #[test]
    fn encoding() {
        let ids = set(&[1, 200, 70000]);
        assert_eq!(EntryIDSet::from_bytes(&ids.to_bytes()).unwrap(), ids);
        let undefined = EntryIDSet::undefined_with_size(12);
        assert_eq!(EntryIDSet::from_bytes(&undefined.to_bytes()).unwrap(), undefined);
        assert!(EntryIDSet::from_bytes(&[9]).is_err());
        assert_eq!(set(&[4, 8, 9]).ids_from(EntryID(8)), vec![EntryID(8), EntryID(9)]);
    }
}
