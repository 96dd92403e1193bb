use std::time::Duration;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Unsorted region of key/value records filled by phase-one workers
#[derive(Debug)]
pub struct SortBuffer {
    records: Vec<(Vec<u8>, Vec<u8>)>,
    bytes: u64,
    capacity: u64,
}

impl SortBuffer {
    pub fn new(capacity: u64) -> Self {
        SortBuffer { records: Vec::new(), bytes: 0, capacity }
    }

    pub fn push(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.bytes += (key.len() + value.len() + 16) as u64;
        self.records.push((key, value));
    }

    pub fn is_full(&self) -> bool {
        self.bytes >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Hand out the records and reset the buffer for reuse
    pub fn take_records(&mut self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.bytes = 0;
        std::mem::take(&mut self.records)
    }
}

/// Fixed set of phase-one buffers. Workers block in `acquire` when every buffer
/// is in use, which keeps them from outrunning the memory budget.
pub struct BufferPool {
    sender: Sender<SortBuffer>,
    receiver: Receiver<SortBuffer>,
    buffer_size: u64,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: u64) -> Self {
        let count = count.max(1);
        let (sender, receiver) = bounded(count);
        for _ in 0..count {
            // Cannot fail, the channel has room for every buffer
            let _ = sender.send(SortBuffer::new(buffer_size));
        }
        BufferPool { sender, receiver, buffer_size }
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn available(&self) -> usize {
        self.receiver.len()
    }

    /// Wait for a free buffer, giving up when `cancel` is raised
    pub fn acquire(&self, cancel: &CancellationToken) -> Result<SortBuffer> {
        loop {
            cancel.check()?;
            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(buffer) => return Ok(buffer),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::new(ErrorKind::InvalidState, "buffer pool closed".to_string()));
                }
            }
        }
    }

    pub fn release(&self, mut buffer: SortBuffer) {
        buffer.take_records();
        let _ = self.sender.try_send(buffer);
    }
}

/// Counting semaphore budgeting phase-two read-ahead buffers
pub struct Semaphore {
    permits: Mutex<usize>,
    capacity: usize,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Semaphore { permits: Mutex::new(permits), capacity: permits, available: Condvar::new() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until `count` permits (at most the capacity) are free
    pub fn acquire(&self, count: usize, cancel: &CancellationToken) -> Result<Permit<'_>> {
        let count = count.clamp(1, self.capacity);
        let mut permits = self.permits.lock();
        while *permits < count {
            cancel.check()?;
            self.available.wait_for(&mut permits, POLL_INTERVAL);
        }
        *permits -= count;
        Ok(Permit { semaphore: self, count })
    }

    fn release(&self, count: usize) {
        *self.permits.lock() += count;
        self.available.notify_all();
    }
}

/// Permits returned to the semaphore on drop
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
    count: usize,
}

impl Permit<'_> {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release(self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pool_blocks_until_release() {
        let pool = Arc::new(BufferPool::new(1, 64));
        let cancel = CancellationToken::new();
        let mut buffer = pool.acquire(&cancel).unwrap();
        buffer.push(b"k".to_vec(), b"v".to_vec());
        assert_eq!(pool.available(), 0);

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            thread::spawn(move || pool.acquire(&cancel).map(|b| b.is_empty()))
        };
        pool.release(buffer);
        assert!(waiter.join().unwrap().unwrap());
    }

    #[test]
    fn cancel_wakes_waiting_workers() {
        let pool = BufferPool::new(1, 64);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).unwrap();
        cancel.cancel();
        assert!(pool.acquire(&cancel).unwrap_err().is_canceled());
    }

    #[test]
    fn permits_are_returned_on_drop() {
        let semaphore = Semaphore::new(3);
        let cancel = CancellationToken::new();
        {
            let permit = semaphore.acquire(10, &cancel).unwrap();
            assert_eq!(permit.count(), 3);
        }
        let first = semaphore.acquire(2, &cancel).unwrap();
        let second = semaphore.acquire(1, &cancel).unwrap();
        drop(first);
        drop(second);
        assert_eq!(*semaphore.permits.lock(), 3);
    }
}
