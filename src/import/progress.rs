use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use log::info;
use serde::{Serialize, Deserialize};

pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Running totals shared by the workers of one import or rebuild
#[derive(Debug, Default)]
pub struct ImportCounters {
    pub read: AtomicU64,
    pub imported: AtomicU64,
    pub rejected: AtomicU64,
    pub ignored: AtomicU64,
    pub migrated: AtomicU64,
}

impl ImportCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            read: self.read.load(Ordering::Relaxed),
            imported: self.imported.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            migrated: self.migrated.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub read: u64,
    pub imported: u64,
    pub rejected: u64,
    pub ignored: u64,
    pub migrated: u64,
}

/// Background thread logging progress until stopped
pub struct ProgressReporter {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn start(tag: &'static str, counters: Arc<ImportCounters>, interval: Duration) -> Self {
        let (stop, stopped) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let mut last = counters.snapshot();
            let mut last_time = started;
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let now = counters.snapshot();
                let elapsed = last_time.elapsed().as_secs_f64().max(0.001);
                let rate = (now.read - last.read) as f64 / elapsed;
                info!(
                    "[{}] Processed {} entries: {} imported, {} rejected, {} ignored ({:.1}/sec)",
                    tag, now.read, now.imported, now.rejected, now.ignored, rate
                );
                last = now;
                last_time = Instant::now();
            }
            let total = counters.snapshot();
            let elapsed = started.elapsed().as_secs_f64().max(0.001);
            info!(
                "[{}] Finished after {:.1}s: {} read, {} imported ({:.1}/sec)",
                tag,
                elapsed,
                total.read,
                total.imported,
                total.imported as f64 / elapsed
            );
        });
        ProgressReporter { stop: Some(stop), handle: Some(handle) }
    }

    /// Stop the reporter and wait for its final report
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_stops_promptly() {
        let counters = Arc::new(ImportCounters::default());
        counters.read.fetch_add(3, Ordering::Relaxed);
        let started = Instant::now();
        let reporter = ProgressReporter::start("Import", counters.clone(), Duration::from_secs(60));
        reporter.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(counters.snapshot().read, 3);
    }

    #[test]
    fn dropped_reporter_joins_its_thread() {
        let counters = Arc::new(ImportCounters::default());
        let failing_phase = || -> Result<(), ()> {
            let _reporter = ProgressReporter::start("Import", counters.clone(), Duration::from_secs(60));
            Err::<(), ()>(())?;
            Ok(())
        };
        assert!(failing_phase().is_err());
        assert_eq!(Arc::strong_count(&counters), 1);
    }
}
