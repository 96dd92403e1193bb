use std::path::PathBuf;
use std::fs;
use crate::core::error::Result;

/// Directory structure for backend files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,      // Root directory
    pub db_dir: PathBuf,        // Tree snapshots
    pub tmp_dir: PathBuf,       // Import scratch files
    pub backup_dir: PathBuf,    // Default backup location
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let db_dir = base_dir.join("db");
        let tmp_dir = base_dir.join("tmp");
        let backup_dir = base_dir.join("backup");

        // Create directories
        fs::create_dir_all(&db_dir)?;
        fs::create_dir_all(&tmp_dir)?;
        fs::create_dir_all(&backup_dir)?;

        Ok(StorageLayout {
            base_dir,
            db_dir,
            tmp_dir,
            backup_dir,
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.db_dir.join("trees.snapshot")
    }

    pub fn snapshot_tmp_path(&self) -> PathBuf {
        self.db_dir.join("trees.snapshot.tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(".lock")
    }

    pub fn backup_path(&self, label: &str) -> PathBuf {
        self.backup_dir.join(format!("backup-{}.snapshot", label))
    }
}
