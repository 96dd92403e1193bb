use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntryID;
use crate::index::entry_id_set::EntryIDSet;
use crate::index::id2count::{decode_count, encode_count};

/// Reduces the values merged under one key to the record written to the tree
pub trait Collector: Send + Sync {
    type Accumulator;

    fn accumulator(&self) -> Self::Accumulator;

    fn accept(&self, accumulator: &mut Self::Accumulator, key: &[u8], value: &[u8]) -> Result<()>;

    fn finish(&self, accumulator: Self::Accumulator) -> Result<Vec<u8>>;
}

/// Keys that may carry only one value, e.g. dn2uri and VLV records
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueValueCollector;

impl Collector for UniqueValueCollector {
    type Accumulator = Option<Vec<u8>>;

    fn accumulator(&self) -> Self::Accumulator {
        None
    }

    fn accept(&self, accumulator: &mut Self::Accumulator, key: &[u8], value: &[u8]) -> Result<()> {
        if accumulator.is_some() {
            return Err(Error::new(
                ErrorKind::ConstraintViolation,
                format!("duplicate key {:02x?}", key),
            ));
        }
        *accumulator = Some(value.to_vec());
        Ok(())
    }

    fn finish(&self, accumulator: Self::Accumulator) -> Result<Vec<u8>> {
        accumulator.ok_or_else(|| Error::new(ErrorKind::Internal, "no value collected".to_string()))
    }
}

/// Unions 8-byte entry IDs into an entry ID set, undefined past the entry limit
#[derive(Debug, Clone, Copy)]
pub struct EntryIdsCollector {
    pub entry_limit: u64,
}

impl Collector for EntryIdsCollector {
    type Accumulator = EntryIDSet;

    fn accumulator(&self) -> Self::Accumulator {
        EntryIDSet::new()
    }

    fn accept(&self, accumulator: &mut Self::Accumulator, _key: &[u8], value: &[u8]) -> Result<()> {
        accumulator.add(EntryID::from_key(value)?);
        accumulator.apply_limit(self.entry_limit);
        Ok(())
    }

    fn finish(&self, accumulator: Self::Accumulator) -> Result<Vec<u8>> {
        Ok(accumulator.to_bytes())
    }
}

/// Adds up 8-byte counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SumCollector;

impl Collector for SumCollector {
    type Accumulator = i64;

    fn accumulator(&self) -> Self::Accumulator {
        0
    }

    fn accept(&self, accumulator: &mut Self::Accumulator, _key: &[u8], value: &[u8]) -> Result<()> {
        *accumulator += decode_count(value)?;
        Ok(())
    }

    fn finish(&self, accumulator: Self::Accumulator) -> Result<Vec<u8>> {
        Ok(encode_count(accumulator).to_vec())
    }
}

/// Collector chosen per destination tree
#[derive(Debug, Clone, Copy)]
pub enum TreeCollector {
    Unique(UniqueValueCollector),
    EntryIds(EntryIdsCollector),
    Sum(SumCollector),
}

impl TreeCollector {
    /// Reduce every value of one key
    pub fn collect<'v>(&self, key: &[u8], values: impl IntoIterator<Item = &'v [u8]>) -> Result<Vec<u8>> {
        match self {
            TreeCollector::Unique(c) => run(c, key, values),
            TreeCollector::EntryIds(c) => run(c, key, values),
            TreeCollector::Sum(c) => run(c, key, values),
        }
    }
}

fn run<'v, C: Collector>(collector: &C, key: &[u8], values: impl IntoIterator<Item = &'v [u8]>) -> Result<Vec<u8>> {
    let mut accumulator = collector.accumulator();
    for value in values {
        collector.accept(&mut accumulator, key, value)?;
    }
    collector.finish(accumulator)
}
