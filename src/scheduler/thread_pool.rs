//! Persistent thread pool executing 4D tiled parallel-for jobs.
//!
//! Workers are spawned once and wait for jobs. A job hands out tile indices
//! from an atomic counter; the submitting thread works on its own job too and
//! blocks until the last tile has finished. One job runs at a time; concurrent
//! submitters queue on a lock.

use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::tiling::{TileGrid, TileTask, TiledExecutor};

/// Configuration for the thread pool.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Threads executing tiles, the submitting thread included (0 = auto-detect).
    pub num_threads: usize,
    /// Thread stack size in bytes (0 = default).
    pub stack_size: usize,
    /// Thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 0, // Auto-detect
            stack_size: 0,
            thread_name_prefix: "deconv-worker".to_string(),
        }
    }
}

impl ThreadPoolConfig {
    /// Create config with specific thread count.
    pub fn with_threads(count: usize) -> Self {
        Self {
            num_threads: count.max(1),
            ..Default::default()
        }
    }
}

/// Statistics for thread pool activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThreadPoolStats {
    pub jobs_executed: u64,
    pub tiles_executed: u64,
}

type ErasedTask = dyn Fn(usize) + Sync;

/// One parallel-for call.
struct Job {
    /// Borrowed from the submitting thread with its lifetime erased.
    task: *const ErasedTask,
    count: usize,
    next: AtomicUsize,
    remaining: AtomicUsize,
    /// Payload of the first tile that panicked.
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

// SAFETY: `task` points at a `Sync` closure that the submitter keeps alive
// until `remaining` reaches zero; no tile is started after that.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

impl Job {
    /// Execute tiles until none are left to claim.
    fn work(&self, shared: &Shared) {
        loop {
            let index = self.next.fetch_add(1, Ordering::Relaxed);
            if index >= self.count {
                return;
            }
            // SAFETY: index was claimed below `count`, so `remaining` is still
            // positive and the submitter is still waiting on this job.
            let task = unsafe { &*self.task };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task(index))) {
                self.panic.lock().get_or_insert(payload);
            }
            shared.tiles_executed.fetch_add(1, Ordering::Relaxed);
            if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _guard = shared.state.lock();
                shared.job_done.notify_all();
            }
        }
    }
}

struct PoolState {
    job: Option<Arc<Job>>,
    generation: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
    job_done: Condvar,
    jobs_executed: AtomicU64,
    tiles_executed: AtomicU64,
}

/// Caller-owned pool of worker threads.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    submit: Mutex<()>,
    num_threads: usize,
}

impl ThreadPool {
    /// Create a new thread pool with the given configuration.
    pub fn new(config: ThreadPoolConfig) -> Result<Self, ThreadPoolError> {
        let num_threads = if config.num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            config.num_threads
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                job: None,
                generation: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            job_done: Condvar::new(),
            jobs_executed: AtomicU64::new(0),
            tiles_executed: AtomicU64::new(0),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(num_threads.saturating_sub(1)),
            submit: Mutex::new(()),
            num_threads,
        };

        // The submitting thread is the remaining one.
        for id in 1..num_threads {
            let shared = pool.shared.clone();
            let mut builder = thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, id));
            if config.stack_size > 0 {
                builder = builder.stack_size(config.stack_size);
            }
            // On failure `pool` drops here and joins the workers spawned so far.
            let handle = builder
                .spawn(move || Self::worker_loop(&shared))
                .map_err(|e| ThreadPoolError::ThreadSpawnFailed(e.to_string()))?;
            pool.workers.push(handle);
        }

        debug!(threads = num_threads, "thread pool started");
        Ok(pool)
    }

    /// Worker thread main loop.
    fn worker_loop(shared: &Shared) {
        let mut seen = 0u64;
        loop {
            let job = {
                let mut state = shared.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    if state.generation != seen {
                        seen = state.generation;
                        if let Some(job) = state.job.clone() {
                            break job;
                        }
                    }
                    shared.work_ready.wait(&mut state);
                }
            };
            job.work(shared);
        }
    }

    /// Run `task(i)` for every `i < count`, blocking until all calls return.
    ///
    /// The first panic of any call is resumed here, with its original
    /// payload, after the other calls complete.
    pub fn parallelize(&self, count: usize, task: &(dyn Fn(usize) + Sync)) {
        if count == 0 {
            return;
        }
        let _submit = self.submit.lock();
        self.shared.jobs_executed.fetch_add(1, Ordering::Relaxed);

        if self.workers.is_empty() || count == 1 {
            for index in 0..count {
                task(index);
            }
            self.shared.tiles_executed.fetch_add(count as u64, Ordering::Relaxed);
            return;
        }

        let task: *const (dyn Fn(usize) + Sync + '_) = task;
        // SAFETY: only the lifetime changes. The job is retired below, after
        // `remaining` reaches zero, before `task` goes out of scope.
        let erased = unsafe {
            std::mem::transmute::<*const (dyn Fn(usize) + Sync + '_), *const ErasedTask>(task)
        };
        let job = Arc::new(Job {
            task: erased,
            count,
            next: AtomicUsize::new(0),
            remaining: AtomicUsize::new(count),
            panic: Mutex::new(None),
        });

        {
            let mut state = self.shared.state.lock();
            state.job = Some(job.clone());
            state.generation = state.generation.wrapping_add(1);
            self.shared.work_ready.notify_all();
        }
        trace!(tiles = count, "job published");

        job.work(&self.shared);

        {
            let mut state = self.shared.state.lock();
            while job.remaining.load(Ordering::Acquire) > 0 {
                self.shared.job_done.wait(&mut state);
            }
            state.job = None;
        }

        let payload = job.panic.lock().take();
        if let Some(payload) = payload {
            resume_unwind(payload);
        }
    }

    /// Get current statistics.
    pub fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            jobs_executed: self.shared.jobs_executed.load(Ordering::Relaxed),
            tiles_executed: self.shared.tiles_executed.load(Ordering::Relaxed),
        }
    }

    /// Threads executing tiles, the submitting thread included.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl TiledExecutor for ThreadPool {
    fn compute_4d_tiled(&self, range: [usize; 4], tile: [usize; 4], task: &TileTask<'_>) {
        let grid = TileGrid::new(range, tile);
        self.parallelize(grid.len(), &|index| task(grid.tile(index)));
    }

    fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work_ready.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Errors for thread pool operations.
#[derive(Debug, thiserror::Error)]
pub enum ThreadPoolError {
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawnFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_thread_pool_basic() {
        let pool = ThreadPool::new(ThreadPoolConfig::default()).unwrap();
        assert!(pool.num_threads() > 0);

        let counter = AtomicUsize::new(0);
        pool.parallelize(100, &|_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_borrowed_state_is_visible_after_return() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(4)).unwrap();
        let slots: Vec<AtomicUsize> = (0..64).map(|_| AtomicUsize::new(0)).collect();
        pool.parallelize(slots.len(), &|i| {
            slots[i].fetch_add(i + 1, Ordering::Relaxed);
        });
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(slot.load(Ordering::Relaxed), i + 1);
        }
    }

    #[test]
    fn test_single_thread_runs_inline() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1)).unwrap();
        let caller = thread::current().id();
        pool.parallelize(8, &|_| assert_eq!(thread::current().id(), caller));
        assert_eq!(pool.stats().tiles_executed, 8);
    }

    #[test]
    fn test_stats_tracking() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(3)).unwrap();
        for _ in 0..5 {
            pool.parallelize(10, &|_| {});
        }
        let stats = pool.stats();
        assert_eq!(stats.jobs_executed, 5);
        assert_eq!(stats.tiles_executed, 50);
    }

    #[test]
    fn test_panic_is_propagated_after_all_tiles() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(3)).unwrap();
        let done = AtomicUsize::new(0);
        let result = catch_unwind(AssertUnwindSafe(|| {
            pool.parallelize(32, &|i| {
                if i == 7 {
                    panic!("tile 7");
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
        }));
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"tile 7"));
        assert_eq!(done.load(Ordering::SeqCst), 31);

        // The pool stays usable.
        let counter = AtomicUsize::new(0);
        pool.parallelize(4, &|_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_formatted_panic_message_survives() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(4)).unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| {
            pool.parallelize(16, &|i| {
                if i == 11 {
                    panic!("kernel failed on tile {i}");
                }
            });
        }));
        let payload = result.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<String>().map(String::as_str),
            Some("kernel failed on tile 11")
        );
    }
}
