use serde::{Serialize, Deserialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use crate::core::error::{Error, ErrorKind, Result};

/// Identifier of an entry inside a container, allocated in increasing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryID(pub u64);

impl EntryID {
    pub fn new(id: u64) -> Self {
        EntryID(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// 8-byte big-endian form used as a tree key or value
    pub fn to_key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_key(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 8] = bytes.try_into().map_err(|_| {
            Error::new(ErrorKind::Parse, format!("invalid entry ID length {}", bytes.len()))
        })?;
        Ok(EntryID(u64::from_be_bytes(array)))
    }
}

impl From<u64> for EntryID {
    fn from(id: u64) -> Self {
        EntryID(id)
    }
}

impl fmt::Display for EntryID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Search scope relative to the base DN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
    Subordinates,
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SearchScope::BaseObject => "base",
            SearchScope::SingleLevel => "one",
            SearchScope::WholeSubtree => "sub",
            SearchScope::Subordinates => "subordinates",
        };
        write!(f, "{}", name)
    }
}

/// Shared cancellation flag checked at safe points
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::canceled());
        }
        Ok(())
    }
}
