//! Task scheduler backing `scope`/`spawn`.
//!
//! Each spawned body runs on its own forked engine, so tasks share no mutable
//! engine state; they communicate through channels only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use futures::future::join_all;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::val::Val;

/// Unit of work handed to the scheduler.
pub type Job = Box<dyn FnOnce() -> Result<Val> + Send + 'static>;

#[derive(Debug)]
pub struct Scheduler {
    tokio_runtime: Option<tokio::runtime::Runtime>,
    spawned: AtomicU64,
}

/// Scheduler statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub spawned: u64,
    pub is_multi_threaded: bool,
}

impl Scheduler {
    /// Run jobs on tokio's blocking pool.
    pub fn new_multi_thread() -> Result<Self> {
        let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("lattice-task")
            .enable_all()
            .build()
            .map_err(|e| anyhow!("Failed to create tokio runtime: {}", e))?;
        Ok(Self {
            tokio_runtime: Some(tokio_runtime),
            spawned: AtomicU64::new(0),
        })
    }

    /// Run jobs one after another on the calling thread.
    pub fn new_current_thread() -> Self {
        Self {
            tokio_runtime: None,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn is_multi_threaded(&self) -> bool {
        self.tokio_runtime.is_some()
    }

    /// Start every job. On a multi-threaded scheduler they run in the
    /// background until [`TaskGroup::join`]; otherwise they run right here.
    pub fn spawn(&self, jobs: Vec<Job>) -> TaskGroup {
        let count = jobs.len() as u64;
        let first_id = self.spawned.fetch_add(count, Ordering::Relaxed) + 1;
        debug!(target: "lattice::rt::task", count, first_id, threaded = self.is_multi_threaded(), "task.spawn");

        let pending = match self.tokio_runtime.as_ref() {
            Some(runtime) => Pending::Running(jobs.into_iter().map(|job| runtime.spawn_blocking(job)).collect()),
            None => Pending::Finished(jobs.into_iter().map(|job| job()).collect()),
        };
        TaskGroup { count, pending }
    }

    /// Run every job and wait for all of them.
    pub fn run_all(&self, jobs: Vec<Job>) -> Result<Vec<Val>> {
        self.spawn(jobs).join()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            is_multi_threaded: self.is_multi_threaded(),
        }
    }
}

enum Pending {
    Running(Vec<tokio::task::JoinHandle<Result<Val>>>),
    Finished(Vec<Result<Val>>),
}

/// Jobs started by one [`Scheduler::spawn`] call.
pub struct TaskGroup {
    count: u64,
    pending: Pending,
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup").field("count", &self.count).finish()
    }
}

impl TaskGroup {
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Wait for every job. The first error in spawn order wins; results of
    /// the other jobs are discarded in that case.
    pub fn join(self) -> Result<Vec<Val>> {
        let outcomes = match self.pending {
            Pending::Finished(outcomes) => outcomes,
            Pending::Running(handles) => {
                // Joined with a plain executor so nested scopes inside a task
                // do not re-enter the tokio runtime.
                futures::executor::block_on(join_all(handles))
                    .into_iter()
                    .map(|joined| joined.map_err(|e| anyhow!("task failed: {}", e)).and_then(|r| r))
                    .collect()
            }
        };
        debug!(target: "lattice::rt::task", count = self.count, "task.join");
        outcomes.into_iter().collect()
    }
}

/// Global scheduler instance
static GLOBAL_SCHEDULER: Lazy<Mutex<Option<Arc<Scheduler>>>> = Lazy::new(|| Mutex::new(None));

fn create_scheduler() -> Scheduler {
    if std::env::var_os("LATTICE_SINGLE_THREAD").is_some() {
        return Scheduler::new_current_thread();
    }
    match Scheduler::new_multi_thread() {
        Ok(scheduler) => scheduler,
        Err(err) => {
            debug!(target: "lattice::rt::task", error = %err, "task.fallback_single_thread");
            Scheduler::new_current_thread()
        }
    }
}

/// Shared scheduler, created on first use.
pub fn scheduler() -> Arc<Scheduler> {
    let mut guard = match GLOBAL_SCHEDULER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.get_or_insert_with(|| Arc::new(create_scheduler())).clone()
}

/// Replace the shared scheduler (e.g. to force single-threaded execution).
pub fn install_scheduler(scheduler: Scheduler) {
    let previous = {
        let mut guard = match GLOBAL_SCHEDULER.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.replace(Arc::new(scheduler))
    };
    if let Some(previous) = previous {
        drop_scheduler(previous);
    }
}

// Dropping a tokio runtime from inside async context panics.
fn drop_scheduler(scheduler: Arc<Scheduler>) {
    if tokio::runtime::Handle::try_current().is_ok() {
        std::thread::spawn(move || drop(scheduler));
    } else {
        drop(scheduler);
    }
}
