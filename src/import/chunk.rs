use std::fs::File;
use std::io::Write;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use log::debug;
use memmap2::Mmap;
use parking_lot::Mutex;
use rayon::prelude::*;
use crate::core::error::Result;
use crate::core::types::CancellationToken;
use crate::import::buffer_pool::{BufferPool, SortBuffer};
use crate::import::cursor::{write_record, CompositeCursor, RegionCursor, SequentialCursor, VecCursor};
use crate::storage::tree::TreeName;

type Records = Vec<(Vec<u8>, Vec<u8>)>;

/// Phase-one destination of one tree's records
pub trait Chunk: Send + Sync {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;

    /// Every record put so far, in key order. Drains the chunk.
    fn flip(&self) -> Result<Box<dyn SequentialCursor>>;

    /// Bytes put so far
    fn size(&self) -> u64;

    /// Sorted runs the merge will have to read
    fn region_count(&self) -> usize;
}

struct ScratchFile {
    file: File,
    regions: Vec<Range<usize>>,
    len: usize,
}

/// Sorts full buffers and spills them as runs to an anonymous scratch file
pub struct ExternalSortChunk {
    tree: TreeName,
    tmp_dir: PathBuf,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
    current: Mutex<Option<SortBuffer>>,
    scratch: Mutex<Option<ScratchFile>>,
    size: AtomicU64,
}

impl ExternalSortChunk {
    pub fn new(tree: TreeName, tmp_dir: PathBuf, pool: Arc<BufferPool>, cancel: CancellationToken) -> Self {
        ExternalSortChunk {
            tree,
            tmp_dir,
            pool,
            cancel,
            current: Mutex::new(None),
            scratch: Mutex::new(None),
            size: AtomicU64::new(0),
        }
    }

    fn spill(&self, mut buffer: SortBuffer) -> Result<()> {
        let mut records = buffer.take_records();
        records.par_sort_unstable();
        let mut data = Vec::new();
        for (key, value) in &records {
            write_record(&mut data, key, value);
        }
        drop(records);

        let mut scratch = self.scratch.lock();
        if scratch.is_none() {
            *scratch = Some(ScratchFile { file: tempfile::tempfile_in(&self.tmp_dir)?, regions: Vec::new(), len: 0 });
        }
        if let Some(scratch) = scratch.as_mut() {
            scratch.file.write_all(&data)?;
            scratch.regions.push(scratch.len..scratch.len + data.len());
            scratch.len += data.len();
        }
        drop(scratch);
        self.pool.release(buffer);
        Ok(())
    }
}

impl Chunk for ExternalSortChunk {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.size.fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
        let full = {
            let mut current = self.current.lock();
            if current.is_none() {
                *current = Some(self.pool.acquire(&self.cancel)?);
            }
            let is_full = match current.as_mut() {
                Some(buffer) => {
                    buffer.push(key, value);
                    buffer.is_full()
                }
                None => false,
            };
            if is_full { current.take() } else { None }
        };
        match full {
            Some(buffer) => self.spill(buffer),
            None => Ok(()),
        }
    }

    fn flip(&self) -> Result<Box<dyn SequentialCursor>> {
        let mut cursors: Vec<Box<dyn SequentialCursor>> = Vec::new();
        if let Some(scratch) = self.scratch.lock().take() {
            scratch.file.sync_data()?;
            let data = Arc::new(unsafe { Mmap::map(&scratch.file)? });
            debug!("[Import] {} merges {} runs ({} bytes)", self.tree, scratch.regions.len(), scratch.len);
            for region in scratch.regions {
                cursors.push(Box::new(RegionCursor::new(data.clone(), region)));
            }
        }
        if let Some(mut buffer) = self.current.lock().take() {
            let mut records = buffer.take_records();
            records.par_sort_unstable();
            self.pool.release(buffer);
            cursors.push(Box::new(VecCursor::new(records)));
        }
        Ok(Box::new(CompositeCursor::new(cursors)))
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn region_count(&self) -> usize {
        let spilled = self.scratch.lock().as_ref().map(|s| s.regions.len()).unwrap_or(0);
        spilled + self.current.lock().as_ref().map(|b| usize::from(!b.is_empty())).unwrap_or(0)
    }
}

/// Keeps every record in memory, for small derived trees
#[derive(Default)]
pub struct InMemorySortedChunk {
    records: Mutex<Records>,
    size: AtomicU64,
}

impl InMemorySortedChunk {
    pub fn new() -> Self {
        InMemorySortedChunk::default()
    }
}

impl Chunk for InMemorySortedChunk {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.size.fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
        self.records.lock().push((key, value));
        Ok(())
    }

    fn flip(&self) -> Result<Box<dyn SequentialCursor>> {
        let mut records = std::mem::take(&mut *self.records.lock());
        records.sort_unstable();
        Ok(Box::new(VecCursor::new(records)))
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn region_count(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::cursor::collect_records;

    #[test]
    fn spilled_runs_merge_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(2, 64));
        let chunk = ExternalSortChunk::new(
            TreeName::new("o=test", "cn.equality"),
            dir.path().to_path_buf(),
            pool.clone(),
            CancellationToken::new(),
        );
        for i in (0..40u32).rev() {
            chunk.put(format!("key{:03}", i).into_bytes(), i.to_be_bytes().to_vec()).unwrap();
        }
        assert!(chunk.region_count() > 1);

        let mut cursor = chunk.flip().unwrap();
        let records = collect_records(cursor.as_mut()).unwrap();
        assert_eq!(records.len(), 40);
        assert_eq!(records[0].0, b"key000".to_vec());
        assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(pool.available(), 2);
    }
}
