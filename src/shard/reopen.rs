//! Periodic reopen of a shard's searcher.
//!
//! The scheduler refreshes the reference manager at least every
//! `max_refresh_sec`. While a caller is blocked in
//! [`wait_for_generation`](ReopenScheduler::wait_for_generation) it refreshes
//! as soon as `min_refresh_sec` has passed since the previous reopen instead.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::LiveSettings;
use crate::error::{Result, ShardError};
use crate::index::manager::ReferenceManager;
use crate::index::writer::IndexWriter;
use crate::util::shutdown::ShutdownSignal;

#[derive(Debug, Default)]
struct ReopenState {
    finish: bool,
    /// Callers currently blocked in `wait_for_generation`.
    waiting: usize,
    /// Every sequence number up to this one is visible to searchers.
    searching_gen: u64,
}

#[derive(Debug)]
struct Shared {
    writer: Arc<dyn IndexWriter>,
    manager: Arc<dyn ReferenceManager>,
    max_stale: Duration,
    min_stale: Duration,
    state: Mutex<ReopenState>,
    /// Wakes the reopen loop.
    wake: Condvar,
    /// Wakes callers waiting for a generation.
    reopened: Condvar,
}

impl Shared {
    fn run(&self, name: &str, signal: &ShutdownSignal) {
        let mut last_reopen = Instant::now();
        loop {
            {
                let mut state = self.state.lock();
                loop {
                    if state.finish || signal.is_triggered() {
                        return;
                    }
                    let stale = if state.waiting > 0 {
                        self.min_stale
                    } else {
                        self.max_stale
                    };
                    let next_reopen = last_reopen + stale;
                    if Instant::now() >= next_reopen {
                        break;
                    }
                    self.wake.wait_until(&mut state, next_reopen);
                }
            }

            last_reopen = Instant::now();
            let target = self.writer.max_completed_sequence_number();
            match self.manager.maybe_refresh_blocking() {
                Ok(()) => {
                    let mut state = self.state.lock();
                    state.searching_gen = state.searching_gen.max(target);
                    self.reopened.notify_all();
                }
                Err(e) => log::warn!("Failed to reopen searcher of {name}: {e}"),
            }
        }
    }
}

/// Owns the reopen thread of one shard.
#[derive(Debug)]
pub struct ReopenScheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReopenScheduler {
    /// Spawn the reopen thread with the refresh bounds of `live`.
    ///
    /// The thread exits when `signal` fires or on [`close`](Self::close).
    pub fn start(
        shard_name: &str,
        writer: Arc<dyn IndexWriter>,
        manager: Arc<dyn ReferenceManager>,
        live: &LiveSettings,
        signal: &ShutdownSignal,
    ) -> Result<Self> {
        live.validate()?;
        let shared = Arc::new(Shared {
            writer,
            manager,
            max_stale: Duration::from_secs_f64(live.max_refresh_sec),
            min_stale: Duration::from_secs_f64(live.min_refresh_sec),
            state: Mutex::new(ReopenState::default()),
            wake: Condvar::new(),
            reopened: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let signal = signal.clone();
        let name = shard_name.to_string();
        let handle = thread::Builder::new()
            .name(format!("iris-shard-reopen-{shard_name}"))
            .spawn(move || {
                log::debug!("Reopen thread for {name} started");
                thread_shared.run(&name, &signal);
                log::debug!("Reopen thread for {name} stopped");
            })?;
        log::debug!(
            "Reopen scheduler for {shard_name} uses min {:?}, max {:?}",
            shared.min_stale,
            shared.max_stale
        );

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn max_stale(&self) -> Duration {
        self.shared.max_stale
    }

    pub fn min_stale(&self) -> Duration {
        self.shared.min_stale
    }

    /// Highest sequence number known to be visible to searchers.
    pub fn searching_generation(&self) -> u64 {
        self.shared.state.lock().searching_gen
    }

    /// Block until mutation `target` is visible to searchers or `timeout`
    /// elapses. Returns whether it became visible.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::InvalidArgument`] if the writer has not yet
    /// issued `target`, and [`ShardError::AlreadyClosed`] if the scheduler
    /// is closed before `target` becomes visible.
    pub fn wait_for_generation(&self, target: u64, timeout: Duration) -> Result<bool> {
        let issued = self.shared.writer.max_completed_sequence_number();
        if target > issued {
            return Err(ShardError::invalid_argument(format!(
                "sequence number {target} has not been issued (max is {issued})"
            )));
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        if state.searching_gen >= target {
            return Ok(true);
        }
        state.waiting += 1;
        self.shared.wake.notify_all();
        while state.searching_gen < target && !state.finish {
            if self
                .shared
                .reopened
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.waiting -= 1;
        if state.searching_gen >= target {
            Ok(true)
        } else if state.finish {
            Err(ShardError::already_closed(format!(
                "reopen thread closed while waiting for sequence number {target}"
            )))
        } else {
            Ok(false)
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it to exit. Waiters fail with
    /// [`ShardError::AlreadyClosed`] at once.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.finish = true;
            self.shared.wake.notify_all();
            self.shared.reopened.notify_all();
        }
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| ShardError::internal("reopen thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for ReopenScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Document;
    use crate::index::OpenMode;
    use crate::index::commit::SEGMENTS_PREFIX;
    use crate::index::deletion_policy::PersistentSnapshotDeletionPolicy;
    use crate::index::manager::SearcherTaxonomyManager;
    use crate::index::writer::SegmentIndexWriter;
    use crate::storage::Directory;
    use crate::storage::memory::MemoryDirectory;

    fn engine() -> (Arc<dyn IndexWriter>, Arc<dyn ReferenceManager>) {
        let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        let policy =
            Arc::new(PersistentSnapshotDeletionPolicy::open(dir.clone(), SEGMENTS_PREFIX).unwrap());
        let writer: Arc<dyn IndexWriter> =
            Arc::new(SegmentIndexWriter::open(dir, OpenMode::Create, policy).unwrap());
        let manager: Arc<dyn ReferenceManager> =
            Arc::new(SearcherTaxonomyManager::new(writer.clone(), None).unwrap());
        (writer, manager)
    }

    fn live(min: f64, max: f64) -> LiveSettings {
        LiveSettings {
            min_refresh_sec: min,
            max_refresh_sec: max,
            ..Default::default()
        }
    }

    fn visible_docs(manager: &Arc<dyn ReferenceManager>) -> usize {
        let handle = manager.acquire().unwrap();
        let count = handle.searcher().num_docs().unwrap();
        manager.release(handle).unwrap();
        count
    }

    #[test]
    fn test_waiter_is_served_within_min_stale() {
        let (writer, manager) = engine();
        let signal = ShutdownSignal::new();
        let scheduler =
            ReopenScheduler::start("t:0", writer.clone(), manager.clone(), &live(0.01, 60.0), &signal)
                .unwrap();

        let seq = writer.add_documents(vec![Document::new()]).unwrap();
        let start = Instant::now();
        assert!(scheduler.wait_for_generation(seq, Duration::from_secs(10)).unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(visible_docs(&manager), 1);
        assert!(scheduler.searching_generation() >= seq);

        scheduler.close().unwrap();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_refreshes_without_waiters_after_max_stale() {
        let (writer, manager) = engine();
        let signal = ShutdownSignal::new();
        let _scheduler =
            ReopenScheduler::start("t:1", writer.clone(), manager.clone(), &live(0.01, 0.1), &signal)
                .unwrap();

        writer.add_documents(vec![Document::new()]).unwrap();
        thread::sleep(Duration::from_millis(400));
        assert_eq!(visible_docs(&manager), 1);
    }

    #[test]
    fn test_unissued_generation_is_rejected() {
        let (writer, manager) = engine();
        let signal = ShutdownSignal::new();
        let scheduler =
            ReopenScheduler::start("t:2", writer, manager, &live(0.05, 1.0), &signal).unwrap();
        assert!(matches!(
            scheduler.wait_for_generation(5, Duration::from_millis(10)),
            Err(ShardError::InvalidArgument(_))
        ));
        assert!(scheduler.wait_for_generation(0, Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_close_fails_pending_waiters() {
        let (writer, manager) = engine();
        let signal = ShutdownSignal::new();
        let scheduler =
            ReopenScheduler::start("t:4", writer.clone(), manager, &live(30.0, 60.0), &signal)
                .unwrap();
        let seq = writer.add_documents(vec![Document::new()]).unwrap();

        let start = Instant::now();
        let waited = thread::scope(|scope| {
            let waiter = scope.spawn(|| scheduler.wait_for_generation(seq, Duration::from_secs(10)));
            thread::sleep(Duration::from_millis(100));
            scheduler.close().unwrap();
            waiter.join().unwrap()
        });
        assert!(matches!(waited, Err(ShardError::AlreadyClosed(_))));
        assert!(start.elapsed() < Duration::from_secs(5));

        // Later calls fail the same way instead of reporting a timeout.
        assert!(matches!(
            scheduler.wait_for_generation(seq, Duration::from_millis(10)),
            Err(ShardError::AlreadyClosed(_))
        ));
    }

    #[test]
    fn test_signal_stops_thread() {
        let (writer, manager) = engine();
        let signal = ShutdownSignal::new();
        let scheduler =
            ReopenScheduler::start("t:3", writer, manager, &live(0.01, 0.05), &signal).unwrap();
        signal.trigger();

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!scheduler.is_running());
    }
}
