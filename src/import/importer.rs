use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;
use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Serialize, Deserialize};
use crate::backend::entry_container::EntryContainer;
use crate::backend::root_container::RootContainer;
use crate::core::config::{ImportConfig, ImportPhase, PhaseHook, RebuildConfig, RebuildMode};
use crate::core::dn::Dn;
use crate::core::entry::Entry;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{CancellationToken, EntryID};
use crate::import::buffer_pool::{BufferPool, Semaphore};
use crate::import::chunk::{Chunk, ExternalSortChunk, InMemorySortedChunk};
use crate::import::cursor::{CollectorCursor, SequentialCursor};
use crate::import::dn_validation::{check_duplicate, validate_dn, ChildrenCounter, Dn2IdDnCache, DnCache, OrderedDnValidator, TempDnCache};
use crate::import::progress::{CounterSnapshot, ImportCounters, ProgressReporter, REPORT_INTERVAL};
use crate::import::sizing::{available_memory, compute_budget, default_thread_count, MemoryBudget, DN_CACHE_SIZE, MIN_BUFFER_SIZE};
use crate::import::source::{EntryReader, Id2EntrySource};
use crate::import::strategy::{ContainerPlan, TreeKind, TreePlan, TreeSelection};
use crate::import::suffix::Suffix;
use crate::index::entry_id_set::EntryIDSet;
use crate::index::id2count::{decode_count, encode_count, TOTAL_COUNT_ID};
use crate::storage::tree::{Importer, Storage, TreeName};

/// Entries read from id2entry per rebuild batch
pub const REBUILD_BATCH_SIZE: usize = 256;

const QUEUE_DEPTH_PER_THREAD: usize = 64;

// Entries held by the recent-DN LRU in front of the DN cache
const DN_CACHE_ENTRY_SIZE: u64 = 256;

/// Entry refused during an import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub dn: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportResult {
    pub counts: CounterSnapshot,
    pub rejects: Vec<Rejection>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildResult {
    pub base_dn: String,
    pub trees: Vec<String>,
    pub processed: u64,
    pub cleared_degraded_state: bool,
    pub elapsed_ms: u64,
}

/// Backend-level fallbacks for settings an import or rebuild leaves open
#[derive(Debug, Clone)]
pub struct ImportDefaults {
    pub thread_count: usize,
    pub tmp_dir: PathBuf,
}

struct PipelineOptions {
    tag: &'static str,
    threads: usize,
    tmp_dir: PathBuf,
    buffer_size: Option<usize>,
    available_memory: Option<u64>,
    append: bool,
    cancel: CancellationToken,
}

// One entry handed from the reader to the phase-one workers
struct Job {
    plan: usize,
    id: EntryID,
    entry: Entry,
    migrated: bool,
}

/// Shared state of one two-phase run: the storage importer, the sort buffers and
/// the first fatal error. A fatal error raises the cancellation token so every
/// worker stops.
struct Pipeline<'s> {
    tag: &'static str,
    importer: Box<dyn Importer + 's>,
    budget: MemoryBudget,
    pool: Arc<BufferPool>,
    tmp_dir: PathBuf,
    append: bool,
    cancel: CancellationToken,
    counters: Arc<ImportCounters>,
    failure: Mutex<Option<Error>>,
}

impl<'s> Pipeline<'s> {
    fn new(storage: &'s dyn Storage, options: PipelineOptions, trees: usize) -> Result<Self> {
        fs::create_dir_all(&options.tmp_dir)?;
        let available = options.available_memory.unwrap_or_else(available_memory);
        let budget = compute_budget(available, options.threads, trees, DN_CACHE_SIZE)?;
        let buffer_size = options
            .buffer_size
            .map(|size| (size as u64).max(MIN_BUFFER_SIZE))
            .unwrap_or(budget.buffer_size);
        info!(
            "[{}] {} threads, {} buffers of {} bytes for {} trees",
            options.tag, budget.threads, budget.buffer_count, buffer_size, trees
        );
        Ok(Pipeline {
            tag: options.tag,
            importer: storage.start_import()?,
            pool: Arc::new(BufferPool::new(budget.buffer_count, buffer_size)),
            budget,
            tmp_dir: options.tmp_dir,
            append: options.append,
            cancel: options.cancel,
            counters: Arc::new(ImportCounters::default()),
            failure: Mutex::new(None),
        })
    }

    fn chunk(&self, tree: &TreeName) -> Arc<dyn Chunk> {
        Arc::new(ExternalSortChunk::new(tree.clone(), self.tmp_dir.clone(), self.pool.clone(), self.cancel.clone()))
    }

    fn fail(&self, err: Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            if !err.is_canceled() {
                warn!("[{}] Stopping after error: {}", self.tag, err);
            }
            *failure = Some(err);
        }
        self.cancel.cancel();
    }

    // First fatal error, then cancellation, then whatever the caller saw
    fn outcome<T>(&self, result: Result<T>) -> Result<T> {
        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        self.cancel.check()?;
        result
    }

    /// Run `produce` on the calling thread while workers spread its entries over the chunks
    fn run_phase_one(&self, plans: &[ContainerPlan], produce: impl FnOnce(&Sender<Job>) -> Result<()>) -> Result<()> {
        let (sender, receiver) = bounded::<Job>(self.budget.threads * QUEUE_DEPTH_PER_THREAD);
        let produced = thread::scope(|scope| {
            for _ in 0..self.budget.threads {
                let receiver = receiver.clone();
                scope.spawn(move || self.phase_one_worker(plans, receiver));
            }
            drop(receiver);
            let produced = produce(&sender);
            drop(sender);
            produced
        });
        self.outcome(produced)
    }

    fn phase_one_worker(&self, plans: &[ContainerPlan], receiver: Receiver<Job>) {
        for job in receiver.iter() {
            if self.cancel.is_canceled() {
                break;
            }
            match plans[job.plan].encode(self.importer.as_ref(), job.id, &job.entry) {
                Ok(()) if job.migrated => {
                    self.counters.migrated.fetch_add(1, Ordering::Relaxed);
                }
                Ok(()) => {
                    self.counters.imported.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }
    }

    fn send(&self, sender: &Sender<Job>, job: Job) -> Result<()> {
        self.cancel.check()?;
        sender
            .send(job)
            .map_err(|_| Error::new(ErrorKind::Internal, "phase one workers stopped".to_string()))
    }

    /// Merge every chunk into its tree. dn2id goes first since it yields id2childrencount.
    fn run_phase_two(&self, plans: &mut [ContainerPlan]) -> Result<()> {
        for plan in plans.iter_mut() {
            self.cancel.check()?;
            let started = Instant::now();
            self.merge_dn_tree(plan)?;
            let trees = plan.take_independent_trees();
            self.merge_parallel(&plan.container, &trees)?;
            if let Some(count_tree) = &plan.count_tree {
                self.merge_tree(&plan.container, count_tree)?;
            }
            debug!(
                "[{}] Phase two of {} took {:?}",
                self.tag,
                plan.container.base_dn(),
                started.elapsed()
            );
        }
        Ok(())
    }

    fn merge_dn_tree(&self, plan: &ContainerPlan) -> Result<()> {
        let Some(dn_tree) = &plan.dn_tree else {
            return Ok(());
        };
        let container = &plan.container;
        let scratch = InMemorySortedChunk::new();
        let counts: &dyn Chunk = match &plan.count_tree {
            Some(count_tree) => count_tree.chunk.as_ref(),
            None => &scratch,
        };
        let importer = self.importer.as_ref();
        let lookup = |key: &[u8]| -> Result<Option<EntryID>> {
            match importer.read(&dn_tree.tree, key)? {
                Some(value) => Ok(Some(EntryID::from_key(&value)?)),
                None => Ok(None),
            }
        };

        let mut cursor = dn_tree.chunk.flip()?;
        let mut validator = OrderedDnValidator::new(ChildrenCounter::new(counts), Some(&lookup));
        let mut written = 0i64;
        while cursor.next()? {
            self.cancel.check()?;
            validator.accept(cursor.key(), EntryID::from_key(cursor.value())?)?;
            if dn_tree.write {
                importer.put(&dn_tree.tree, cursor.key(), cursor.value())?;
            }
            written += 1;
        }
        validator.finish()?;
        counts.put(TOTAL_COUNT_ID.to_key().to_vec(), encode_count(written).to_vec())?;

        if dn_tree.write {
            container.state().set_trusted_import(importer, &dn_tree.tree, true)?;
        }
        debug!("[{}] Merged {} records into {}", self.tag, written, dn_tree.tree);
        Ok(())
    }

    fn merge_parallel(&self, container: &EntryContainer, trees: &[TreePlan]) -> Result<()> {
        if trees.is_empty() {
            return Ok(());
        }
        let permits = Semaphore::new(self.budget.buffer_count);
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(self.budget.threads)
            .build()
            .map_err(|err| Error::new(ErrorKind::Internal, format!("could not start merge workers: {}", err)))?;
        let merged = workers.install(|| {
            trees.par_iter().try_for_each(|plan| {
                let _permit = permits.acquire(plan.chunk.region_count(), &self.cancel)?;
                self.merge_tree(container, plan).map(|_| ())
            })
        });
        if let Err(err) = &merged {
            self.fail(err.clone());
        }
        self.outcome(merged)
    }

    fn merge_tree(&self, container: &EntryContainer, plan: &TreePlan) -> Result<u64> {
        let mut cursor = CollectorCursor::new(plan.chunk.flip()?, plan.kind.collector());
        let mut written = 0u64;
        while cursor.next()? {
            self.cancel.check()?;
            let value = self.with_existing(plan, cursor.key(), cursor.value())?;
            self.importer.put(&plan.tree, cursor.key(), &value)?;
            written += 1;
        }
        container.state().set_trusted_import(self.importer.as_ref(), &plan.tree, true)?;
        debug!("[{}] Merged {} keys into {}", self.tag, written, plan.tree);
        Ok(written)
    }

    // Appending imports fold the merged value into the stored one
    fn with_existing(&self, plan: &TreePlan, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        if !self.append {
            return Ok(value.to_vec());
        }
        let Some(existing) = self.importer.read(&plan.tree, key)? else {
            return Ok(value.to_vec());
        };
        match plan.kind {
            TreeKind::Attribute { entry_limit } => {
                let mut set = EntryIDSet::from_bytes(&existing)?;
                set.add_all(&EntryIDSet::from_bytes(value)?);
                set.apply_limit(entry_limit);
                Ok(set.to_bytes())
            }
            TreeKind::Id2ChildrenCount => {
                Ok(encode_count(decode_count(&existing)? + decode_count(value)?).to_vec())
            }
            TreeKind::Dn2Id | TreeKind::Dn2Uri | TreeKind::Vlv => Ok(value.to_vec()),
        }
    }

    fn close(self) -> Result<()> {
        self.importer.close()
    }
}

fn notify(hook: &Option<PhaseHook>, phase: ImportPhase) {
    if let Some(hook) = hook {
        hook.notify(phase);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Bulk-load `reader` into the containers of `root`. Without `append`, every
/// container touched by the include branches is replaced: in place when the whole
/// base DN is imported, through a temporary container otherwise.
pub fn import(
    root: &RootContainer,
    config: &ImportConfig,
    defaults: &ImportDefaults,
    reader: &mut dyn EntryReader,
) -> Result<ImportResult> {
    let started = Instant::now();
    let suffixes = prepare_suffixes(root.containers(), |container| Suffix::prepare(root, container, config))?;
    if suffixes.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            "no base DN of the backend matches the include branches".to_string(),
        ));
    }
    info!(
        "[Import] Starting {} import into {}",
        if config.append { "appending" } else { "replacing" },
        suffixes.iter().map(|s| s.base_dn().to_string()).collect::<Vec<_>>().join(", ")
    );

    match run_import(root, config, defaults, &suffixes, reader) {
        Ok((counts, rejects)) => {
            for suffix in suffixes {
                suffix.commit(root)?;
            }
            if let Some(cache) = root.cache() {
                cache.clear();
            }
            notify(&config.phase_hook, ImportPhase::Finished);
            let result = ImportResult { counts, rejects, elapsed_ms: elapsed_ms(started) };
            info!(
                "[Import] Done: {} imported, {} rejected, {} ignored, {} migrated in {} ms",
                counts.imported, counts.rejected, counts.ignored, counts.migrated, result.elapsed_ms
            );
            Ok(result)
        }
        Err(err) => {
            for suffix in suffixes {
                if !suffix.is_temporary() {
                    if let Err(refresh_err) = suffix.target().refresh_trust() {
                        warn!("[Import] Could not reload trust flags of {}: {}", suffix.base_dn(), refresh_err);
                    }
                }
                suffix.abort();
            }
            if err.is_canceled() {
                info!("[Import] Canceled");
            }
            Err(err)
        }
    }
}

// Temporary containers of suffixes prepared before a failure are dropped again
fn prepare_suffixes(
    containers: Vec<Arc<EntryContainer>>,
    mut prepare: impl FnMut(Arc<EntryContainer>) -> Result<Option<Suffix>>,
) -> Result<Vec<Suffix>> {
    let mut suffixes = Vec::new();
    for container in containers {
        match prepare(container) {
            Ok(Some(suffix)) => suffixes.push(suffix),
            Ok(None) => {}
            Err(err) => {
                for suffix in suffixes {
                    suffix.abort();
                }
                return Err(err);
            }
        }
    }
    Ok(suffixes)
}

fn run_import(
    root: &RootContainer,
    config: &ImportConfig,
    defaults: &ImportDefaults,
    suffixes: &[Suffix],
    reader: &mut dyn EntryReader,
) -> Result<(CounterSnapshot, Vec<Rejection>)> {
    let selections: Vec<TreeSelection> = suffixes
        .iter()
        .map(|s| TreeSelection::all(&s.target().indexes()))
        .collect();
    for (suffix, selection) in suffixes.iter().zip(&selections) {
        suffix.target().set_index_trusted(&selection.trees(suffix.target()), false)?;
    }

    let options = PipelineOptions {
        tag: "Import",
        threads: default_thread_count(if config.thread_count > 0 { config.thread_count } else { defaults.thread_count }),
        tmp_dir: config.tmp_dir.clone().unwrap_or_else(|| defaults.tmp_dir.clone()),
        buffer_size: config.buffer_size,
        available_memory: config.available_memory,
        append: config.append,
        cancel: config.cancel.clone(),
    };
    let trees = selections.iter().map(TreeSelection::chunk_count).sum();
    let pipeline = Pipeline::new(root.storage().as_ref(), options, trees)?;
    let outcome = import_phases(&pipeline, config, suffixes, &selections, reader);
    let closed = pipeline.close();
    let outcome = outcome?;
    closed?;
    Ok(outcome)
}

fn import_phases(
    pipeline: &Pipeline,
    config: &ImportConfig,
    suffixes: &[Suffix],
    selections: &[TreeSelection],
    reader: &mut dyn EntryReader,
) -> Result<(CounterSnapshot, Vec<Rejection>)> {
    let chunk_for = |tree: &TreeName| pipeline.chunk(tree);
    let mut plans: Vec<ContainerPlan> = suffixes
        .iter()
        .zip(selections)
        .map(|(suffix, selection)| ContainerPlan::new(suffix.target().clone(), selection, true, &chunk_for))
        .collect();

    let recent = (pipeline.budget.dn_cache_size / DN_CACHE_ENTRY_SIZE) as usize;
    let mut caches: Vec<Box<dyn DnCache>> = Vec::new();
    for suffix in suffixes {
        let imported = TempDnCache::new(&pipeline.tmp_dir, recent)?;
        caches.push(if config.append {
            Box::new(Dn2IdDnCache::new(suffix.target().clone(), imported))
        } else {
            Box::new(imported)
        });
    }

    notify(&config.phase_hook, ImportPhase::PhaseOne);
    let reporter = ProgressReporter::start("Import", pipeline.counters.clone(), REPORT_INTERVAL);
    let counters = &pipeline.counters;
    let mut rejects = Vec::new();

    pipeline.run_phase_one(&plans, |sender| {
        for (index, suffix) in suffixes.iter().enumerate() {
            suffix.for_each_kept_entry(&mut |id, entry| {
                caches[index].insert(&entry.dn)?;
                pipeline.send(sender, Job { plan: index, id, entry, migrated: true })
            })?;
        }

        while let Some(entry) = reader.next_entry()? {
            pipeline.cancel.check()?;
            counters.read.fetch_add(1, Ordering::Relaxed);
            let Some(index) = route(suffixes, &entry.dn) else {
                counters.ignored.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            // Appending never overwrites a stored DN, even without parent validation
            let rejection = if !config.skip_dn_validation {
                validate_dn(caches[index].as_ref(), &entry.dn, suffixes[index].base_dn())?
            } else if config.append {
                check_duplicate(caches[index].as_ref(), &entry.dn)?
            } else {
                None
            };
            if let Some(reason) = rejection {
                debug!("[Import] Rejected {}: {}", entry.dn, reason);
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                rejects.push(Rejection { dn: entry.dn.to_string(), reason });
                continue;
            }
            let id = suffixes[index].target().ids().next_id();
            pipeline.send(sender, Job { plan: index, id, entry, migrated: false })?;
        }
        Ok(())
    })?;
    info!("[Import] Phase one done: {:?}", counters.snapshot());

    notify(&config.phase_hook, ImportPhase::PhaseTwo);
    pipeline.cancel.check()?;
    pipeline.run_phase_two(&mut plans)?;
    reporter.stop();
    Ok((counters.snapshot(), rejects))
}

// Most specific suffix that takes `dn`
fn route(suffixes: &[Suffix], dn: &Dn) -> Option<usize> {
    let (index, suffix) = suffixes
        .iter()
        .enumerate()
        .filter(|(_, s)| dn.is_subordinate_or_equal_to(s.base_dn()))
        .max_by_key(|(_, s)| s.base_dn().size())?;
    suffix.is_included(dn).then_some(index)
}

/// Rebuild indexes of one container from its id2entry tree. Rebuilt trees are
/// untrusted while the rebuild runs and trusted again once written.
pub fn rebuild(root: &RootContainer, config: &RebuildConfig, defaults: &ImportDefaults) -> Result<RebuildResult> {
    let started = Instant::now();
    let base_dn = Dn::parse(&config.base_dn)?;
    let container = root.container(&base_dn).ok_or_else(|| Error::no_such_object(&base_dn))?;
    let selection = {
        let indexes = container.indexes();
        match config.mode {
            RebuildMode::All => TreeSelection::all(&indexes),
            RebuildMode::Degraded => TreeSelection::degraded(&indexes, &container.untrusted_indexes()),
            RebuildMode::UserDefined => TreeSelection::from_names(&indexes, &config.indexes)?,
        }
    };
    let trees = selection.trees(&container);
    let mut result = RebuildResult {
        base_dn: base_dn.to_string(),
        trees: trees.iter().map(|t| t.index_id.clone()).collect(),
        ..RebuildResult::default()
    };
    if selection.is_empty() {
        info!("[Rebuild] Nothing to rebuild in {}", base_dn);
        return Ok(result);
    }
    if config.clear_degraded_state {
        container.set_index_trusted(&trees, true)?;
        info!("[Rebuild] Marked {} indexes of {} trusted without rebuilding", trees.len(), base_dn);
        result.cleared_degraded_state = true;
        return Ok(result);
    }

    info!("[Rebuild] Rebuilding {:?} in {}", result.trees, base_dn);
    container.set_index_trusted(&trees, false)?;
    let options = PipelineOptions {
        tag: "Rebuild",
        threads: default_thread_count(if config.thread_count > 0 { config.thread_count } else { defaults.thread_count }),
        tmp_dir: config.tmp_dir.clone().unwrap_or_else(|| defaults.tmp_dir.clone()),
        buffer_size: config.buffer_size,
        available_memory: config.available_memory,
        append: false,
        cancel: config.cancel.clone(),
    };
    let pipeline = Pipeline::new(root.storage().as_ref(), options, selection.chunk_count())?;
    let outcome = rebuild_phases(&pipeline, root, config, &container, &selection, &trees);
    let closed = pipeline.close();
    container.refresh_trust()?;
    if let Some(cache) = root.cache() {
        cache.clear();
    }
    result.processed = outcome?;
    closed?;

    notify(&config.phase_hook, ImportPhase::Finished);
    result.elapsed_ms = elapsed_ms(started);
    info!("[Rebuild] Rebuilt {} trees from {} entries in {} ms", trees.len(), result.processed, result.elapsed_ms);
    Ok(result)
}

fn rebuild_phases(
    pipeline: &Pipeline,
    root: &RootContainer,
    config: &RebuildConfig,
    container: &Arc<EntryContainer>,
    selection: &TreeSelection,
    trees: &[TreeName],
) -> Result<u64> {
    for tree in trees {
        pipeline.importer.clear_tree(tree)?;
    }
    let chunk_for = |tree: &TreeName| pipeline.chunk(tree);
    let mut plans = vec![ContainerPlan::new(container.clone(), selection, false, &chunk_for)];
    let id2entry = container.indexes().id2entry().clone();

    notify(&config.phase_hook, ImportPhase::PhaseOne);
    let reporter = ProgressReporter::start("Rebuild", pipeline.counters.clone(), REPORT_INTERVAL);
    pipeline.run_phase_one(&plans, |sender| {
        let mut source = Id2EntrySource::new(&id2entry, REBUILD_BATCH_SIZE);
        loop {
            let batch = root.storage().read(|txn| source.next_batch(txn))?;
            if batch.is_empty() {
                return Ok(());
            }
            for (id, entry) in batch {
                pipeline.counters.read.fetch_add(1, Ordering::Relaxed);
                pipeline.send(sender, Job { plan: 0, id, entry, migrated: false })?;
            }
        }
    })?;

    notify(&config.phase_hook, ImportPhase::PhaseTwo);
    pipeline.cancel.check()?;
    pipeline.run_phase_two(&mut plans)?;
    reporter.stop();
    Ok(pipeline.counters.imported.load(Ordering::Relaxed))
}
