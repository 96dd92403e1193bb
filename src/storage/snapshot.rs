use std::fs;
use std::path::Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::tree::TreeName;

const MAGIC: &[u8; 4] = b"DSNP";

/// Durable image of every tree, checksummed with crc32
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub trees: Vec<TreeImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeImage {
    pub name: TreeName,
    pub records: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Snapshot {
    /// Load a snapshot file, `None` when it does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(path)?;
        if data.len() < 8 || &data[..4] != MAGIC {
            return Err(Error::new(
                ErrorKind::Storage,
                format!("{} is not a snapshot file", path.display()),
            ));
        }

        let expected = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let payload = &data[8..];
        if crc32fast::hash(payload) != expected {
            return Err(Error::new(
                ErrorKind::Storage,
                format!("checksum mismatch in {}", path.display()),
            ));
        }

        let snapshot = bincode::deserialize(payload)?;
        Ok(Some(snapshot))
    }

    /// Write to `tmp_path` then rename over `path`
    pub fn save(&self, path: &Path, tmp_path: &Path) -> Result<()> {
        let payload = bincode::serialize(self)?;
        let mut data = Vec::with_capacity(payload.len() + 8);
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        data.extend_from_slice(&payload);

        fs::write(tmp_path, data)?;
        fs::rename(tmp_path, path)?;
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.trees.iter().map(|t| t.records.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupted_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let tmp = dir.path().join("s.tmp");
        let snapshot = Snapshot {
            timestamp: Utc::now(),
            trees: vec![TreeImage {
                name: TreeName::new("o", "t"),
                records: vec![(b"k".to_vec(), b"v".to_vec())],
            }],
        };
        snapshot.save(&path, &tmp).unwrap();
        assert_eq!(Snapshot::load(&path).unwrap().unwrap().record_count(), 1);

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        fs::write(&path, bytes).unwrap();
        assert!(Snapshot::load(&path).is_err());
        assert!(Snapshot::load(&dir.path().join("missing")).unwrap().is_none());
    }
}
