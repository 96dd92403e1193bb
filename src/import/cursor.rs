use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ops::Range;
use std::sync::Arc;
use memmap2::Mmap;
use crate::codec::varint::VByteEncoder;
use crate::core::error::{Error, ErrorKind, Result};
use crate::import::collector::TreeCollector;

/// Forward-only cursor over key-ordered records
pub trait SequentialCursor: Send {
    /// Move to the next record, false once exhausted
    fn next(&mut self) -> Result<bool>;

    /// Key of the current record, empty before the first `next`
    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];
}

/// Append one length-prefixed record to a run
pub fn write_record(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    VByteEncoder::encode_u64(out, key.len() as u64);
    out.extend_from_slice(key);
    VByteEncoder::encode_u64(out, value.len() as u64);
    out.extend_from_slice(value);
}

/// Records already sorted in memory
pub struct VecCursor {
    records: Vec<(Vec<u8>, Vec<u8>)>,
    position: Option<usize>,
}

impl VecCursor {
    pub fn new(records: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        VecCursor { records, position: None }
    }
}

impl SequentialCursor for VecCursor {
    fn next(&mut self) -> Result<bool> {
        let next = self.position.map(|p| p + 1).unwrap_or(0);
        self.position = Some(next.min(self.records.len()));
        Ok(next < self.records.len())
    }

    fn key(&self) -> &[u8] {
        self.position.and_then(|p| self.records.get(p)).map(|r| r.0.as_slice()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.position.and_then(|p| self.records.get(p)).map(|r| r.1.as_slice()).unwrap_or(&[])
    }
}

/// One sorted run inside a memory-mapped scratch file
pub struct RegionCursor {
    data: Arc<Mmap>,
    offset: usize,
    end: usize,
    key: Range<usize>,
    value: Range<usize>,
}

impl RegionCursor {
    pub fn new(data: Arc<Mmap>, region: Range<usize>) -> Self {
        RegionCursor { data, offset: region.start, end: region.end, key: 0..0, value: 0..0 }
    }

    fn read_slice(&mut self) -> Result<Range<usize>> {
        let (len, consumed) = VByteEncoder::decode_u64(&self.data[self.offset..self.end])?;
        let start = self.offset + consumed;
        let end = start + len as usize;
        if end > self.end {
            return Err(Error::new(ErrorKind::Parse, format!("truncated run record at {}", self.offset)));
        }
        self.offset = end;
        Ok(start..end)
    }
}

impl SequentialCursor for RegionCursor {
    fn next(&mut self) -> Result<bool> {
        if self.offset >= self.end {
            self.key = 0..0;
            self.value = 0..0;
            return Ok(false);
        }
        self.key = self.read_slice()?;
        self.value = self.read_slice()?;
        Ok(true)
    }

    fn key(&self) -> &[u8] {
        &self.data[self.key.clone()]
    }

    fn value(&self) -> &[u8] {
        &self.data[self.value.clone()]
    }
}

/// K-way merge of sorted cursors. Equal keys come out in cursor order.
pub struct CompositeCursor {
    cursors: Vec<Box<dyn SequentialCursor>>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
    current: Option<usize>,
    started: bool,
}

impl CompositeCursor {
    pub fn new(cursors: Vec<Box<dyn SequentialCursor>>) -> Self {
        CompositeCursor { cursors, heap: BinaryHeap::new(), current: None, started: false }
    }

    fn advance(&mut self, index: usize) -> Result<()> {
        let cursor = &mut self.cursors[index];
        if cursor.next()? {
            self.heap.push(Reverse((cursor.key().to_vec(), index)));
        }
        Ok(())
    }
}

impl SequentialCursor for CompositeCursor {
    fn next(&mut self) -> Result<bool> {
        if !self.started {
            self.started = true;
            for index in 0..self.cursors.len() {
                self.advance(index)?;
            }
        } else if let Some(index) = self.current {
            self.advance(index)?;
        }
        self.current = self.heap.pop().map(|Reverse((_, index))| index);
        Ok(self.current.is_some())
    }

    fn key(&self) -> &[u8] {
        self.current.map(|i| self.cursors[i].key()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.current.map(|i| self.cursors[i].value()).unwrap_or(&[])
    }
}

/// Groups equal keys of a sorted cursor and reduces their values
pub struct CollectorCursor {
    inner: Box<dyn SequentialCursor>,
    collector: TreeCollector,
    positioned: Option<bool>,          // Whether `inner` sits on an unconsumed record
    key: Vec<u8>,
    value: Vec<u8>,
}

impl CollectorCursor {
    pub fn new(inner: Box<dyn SequentialCursor>, collector: TreeCollector) -> Self {
        CollectorCursor { inner, collector, positioned: None, key: Vec::new(), value: Vec::new() }
    }
}

impl SequentialCursor for CollectorCursor {
    fn next(&mut self) -> Result<bool> {
        let has_record = match self.positioned {
            Some(has_record) => has_record,
            None => self.inner.next()?,
        };
        if !has_record {
            self.positioned = Some(false);
            self.key.clear();
            self.value.clear();
            return Ok(false);
        }

        let key = self.inner.key().to_vec();
        let mut values = vec![self.inner.value().to_vec()];
        let mut more = self.inner.next()?;
        while more && self.inner.key() == key.as_slice() {
            values.push(self.inner.value().to_vec());
            more = self.inner.next()?;
        }
        self.positioned = Some(more);
        self.value = self.collector.collect(&key, values.iter().map(Vec::as_slice))?;
        self.key = key;
        Ok(true)
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn value(&self) -> &[u8] {
        &self.value
    }
}

/// Drain a cursor into owned records
pub fn collect_records(cursor: &mut dyn SequentialCursor) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut records = Vec::new();
    while cursor.next()? {
        records.push((cursor.key().to_vec(), cursor.value().to_vec()));
    }
    Ok(records)
}
