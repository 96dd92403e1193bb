use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::{Serialize, Deserialize};
use crate::codec::compress::CompressionType;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{CancellationToken, SearchScope};

/// Index flavours an attribute index may maintain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexType {
    Presence,
    Equality,
    Ordering,
    Substring,
    Approximate,
    Extensible,
}

impl IndexType {
    pub fn name(&self) -> &'static str {
        match self {
            IndexType::Presence => "presence",
            IndexType::Equality => "equality",
            IndexType::Ordering => "ordering",
            IndexType::Substring => "substring",
            IndexType::Approximate => "approximate",
            IndexType::Extensible => "extensible",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "presence" => Some(IndexType::Presence),
            "equality" => Some(IndexType::Equality),
            "ordering" => Some(IndexType::Ordering),
            "substring" => Some(IndexType::Substring),
            "approximate" => Some(IndexType::Approximate),
            "extensible" => Some(IndexType::Extensible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub attribute: String,
    pub index_types: Vec<IndexType>,
    #[serde(default)]
    pub extensible_rules: Vec<String>,        // Matching rules for extensible indexes
    #[serde(default)]
    pub index_entry_limit: Option<u32>,       // Falls back to the backend limit
    #[serde(default)]
    pub substring_length: Option<usize>,      // Falls back to the backend length
}

impl IndexConfig {
    pub fn new(attribute: &str, index_types: &[IndexType]) -> Self {
        IndexConfig {
            attribute: attribute.to_ascii_lowercase(),
            index_types: index_types.to_vec(),
            extensible_rules: Vec::new(),
            index_entry_limit: None,
            substring_length: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlvIndexConfig {
    pub name: String,
    pub base_dn: String,
    pub scope: SearchScope,
    pub filter: String,
    pub sort_order: String,                   // e.g. "sn -givenName"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub backend_id: String,
    pub storage_path: PathBuf,
    pub base_dns: Vec<String>,

    pub index_entry_limit: u32,               // 0 means unlimited
    pub substring_length: usize,
    pub indexes: Vec<IndexConfig>,
    pub vlv_indexes: Vec<VlvIndexConfig>,

    pub entries_compressed: CompressionType,
    pub confidentiality_enabled: bool,
    pub cipher_key: Option<String>,           // 64 hex characters

    pub entry_cache_size: usize,              // Entries, 0 disables the cache
    pub lookthrough_limit: u64,               // Default per-operation limit, 0 unlimited
    pub size_limit: usize,                    // Default per-operation limit, 0 unlimited

    pub import_thread_count: usize,           // 0 means one per CPU
    pub import_tmp_dir: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            backend_id: "userRoot".to_string(),
            storage_path: PathBuf::from("./db"),
            base_dns: vec!["dc=example,dc=com".to_string()],

            index_entry_limit: 4000,
            substring_length: 6,
            indexes: vec![IndexConfig::new("objectClass", &[IndexType::Equality])],
            vlv_indexes: Vec::new(),

            entries_compressed: CompressionType::None,
            confidentiality_enabled: false,
            cipher_key: None,

            entry_cache_size: 10_000,
            lookthrough_limit: 0,
            size_limit: 0,

            import_thread_count: 0,
            import_tmp_dir: PathBuf::from("import-tmp"),
        }
    }
}

impl BackendConfig {
    /// Load a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: BackendConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_dns.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArgument, "no base DN configured".to_string()));
        }
        if self.confidentiality_enabled && self.cipher_key.is_none() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "confidentiality requires a cipher key".to_string(),
            ));
        }
        for index in &self.indexes {
            if index.index_types.contains(&IndexType::Extensible) && index.extensible_rules.is_empty() {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("extensible index on {} names no matching rule", index.attribute),
                ));
            }
        }
        Ok(())
    }

    pub fn index_config(&self, attribute: &str) -> Option<&IndexConfig> {
        self.indexes.iter().find(|i| i.attribute.eq_ignore_ascii_case(attribute))
    }
}

/// Phases reported to an import or rebuild hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    PhaseOne,
    PhaseTwo,
    Finished,
}

/// Callback invoked when an import or rebuild enters a phase
#[derive(Clone)]
pub struct PhaseHook(pub Arc<dyn Fn(ImportPhase) + Send + Sync>);

impl PhaseHook {
    pub fn new(f: impl Fn(ImportPhase) + Send + Sync + 'static) -> Self {
        PhaseHook(Arc::new(f))
    }

    pub fn notify(&self, phase: ImportPhase) {
        (self.0)(phase)
    }
}

impl fmt::Debug for PhaseHook {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhaseHook")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub include_branches: Vec<String>,
    pub exclude_branches: Vec<String>,
    pub append: bool,                         // Keep existing entries instead of clearing
    pub skip_dn_validation: bool,
    pub thread_count: usize,                  // 0 uses the backend setting
    pub tmp_dir: Option<PathBuf>,
    pub buffer_size: Option<usize>,           // Overrides the computed phase-one buffer size
    pub available_memory: Option<u64>,        // Overrides the detected memory budget

    #[serde(skip)]
    pub cancel: CancellationToken,
    #[serde(skip)]
    pub phase_hook: Option<PhaseHook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RebuildMode {
    #[default]
    All,
    Degraded,
    UserDefined,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    pub base_dn: String,
    pub mode: RebuildMode,
    pub indexes: Vec<String>,                 // Names for UserDefined mode
    pub clear_degraded_state: bool,           // Mark trusted without rebuilding
    pub thread_count: usize,
    pub tmp_dir: Option<PathBuf>,
    pub buffer_size: Option<usize>,
    pub available_memory: Option<u64>,

    #[serde(skip)]
    pub cancel: CancellationToken,
    #[serde(skip)]
    pub phase_hook: Option<PhaseHook>,
}

/// Consistency check of one container. Complete mode walks id2entry and checks every
/// selected tree holds what the entries imply; clean mode walks a single index and
/// checks each record against the entry it points to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub base_dn: String,
    pub indexes: Vec<String>,                 // Empty means every tree (complete mode only)
    pub clean: bool,
}
