use crate::core::error::{Error, ErrorKind, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Memory left to the storage engine's tree cache during an import
pub const DB_CACHE_SIZE: u64 = 32 * MIB;
/// Held back for the rest of the process
pub const RESERVED_MEMORY: u64 = 50 * MIB;
pub const MAX_BUFFER_SIZE: u64 = 2 * MIB;
pub const MIN_BUFFER_SIZE: u64 = 4 * KIB;
/// Budget of the DN validation presence cache
pub const DN_CACHE_SIZE: u64 = 8 * MIB;

const SMALL_HEAP: u64 = 256 * MIB;

/// How phase-one memory is split between worker buffers and caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    pub threads: usize,
    pub buffer_count: usize,
    pub buffer_size: u64,
    pub db_cache_size: u64,
    pub dn_cache_size: u64,
}

impl MemoryBudget {
    /// Memory the buffers hold at most
    pub fn buffer_memory(&self) -> u64 {
        self.buffer_count as u64 * self.buffer_size
    }
}

/// Split `available` bytes between the tree cache, the DN cache and
/// `threads × trees × 2` phase-one buffers. Threads are dropped while a
/// buffer would be smaller than `MIN_BUFFER_SIZE`.
pub fn compute_budget(available: u64, threads: usize, trees: usize, dn_cache_size: u64) -> Result<MemoryBudget> {
    let trees = trees.max(1);
    let usable = available
        .saturating_sub(DB_CACHE_SIZE)
        .saturating_sub(RESERVED_MEMORY)
        .saturating_sub(dn_cache_size);

    let mut threads = threads.max(1);
    loop {
        let buffer_count = threads * trees * 2;
        let buffer_size = (usable / buffer_count as u64).min(MAX_BUFFER_SIZE);
        if buffer_size >= MIN_BUFFER_SIZE {
            return Ok(MemoryBudget {
                threads,
                buffer_count,
                buffer_size,
                db_cache_size: DB_CACHE_SIZE,
                dn_cache_size,
            });
        }
        if threads == 1 {
            return Err(Error::new(
                ErrorKind::OutOfMemory,
                format!(
                    "not enough memory to import: {} bytes available, {} needed for {} index buffers",
                    available,
                    DB_CACHE_SIZE + RESERVED_MEMORY + dn_cache_size + buffer_count as u64 * MIN_BUFFER_SIZE,
                    buffer_count
                ),
            ));
        }
        threads -= 1;
    }
}

/// Share of physical memory an import may use
pub fn available_memory() -> u64 {
    usable_share(physical_memory())
}

fn usable_share(physical: u64) -> u64 {
    if physical <= SMALL_HEAP {
        physical / 100 * 65
    } else {
        physical / 100 * 90
    }
}

#[cfg(unix)]
fn physical_memory() -> u64 {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return 1024 * MIB;
    }
    pages as u64 * page_size as u64
}

#[cfg(not(unix))]
fn physical_memory() -> u64 {
    1024 * MIB
}

/// Worker threads to use when the configuration leaves it open
pub fn default_thread_count(configured: usize) -> usize {
    if configured > 0 { configured } else { num_cpus::get().max(1) }
}
