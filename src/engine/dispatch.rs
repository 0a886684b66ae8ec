use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::engine::TaskId;
use crate::engine::scheduler::Scheduler;

/// A dispatched task on its way to a worker.
///
/// Whoever receives a job must eventually call [`Job::run`] exactly once;
/// the scheduler counts the task as live until then.
pub struct Job {
    scheduler: Scheduler,
    id: TaskId,
}

impl Job {
    pub(crate) fn new(scheduler: Scheduler, id: TaskId) -> Self {
        Self { scheduler, id }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Executes the task body on the current thread and reports the outcome
    /// back to the scheduler.
    pub fn run(self) {
        self.scheduler.run_job(self.id);
    }
}

/// Binding between a priority tier and the worker pool running its tasks.
pub trait Dispatcher: Send + Sync {
    /// Hands `job` to a worker. Returns `false` if the job was refused.
    fn dispatch(&self, job: Job) -> bool;
}

/// Runs jobs on a rayon thread pool.
#[derive(Clone, Default)]
pub struct RayonDispatcher {
    pool: Option<Arc<ThreadPool>>,
}

impl RayonDispatcher {
    /// Uses the global rayon pool.
    pub fn global() -> Self {
        Self { pool: None }
    }

    /// A dedicated pool of `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()?;

        Ok(Self::from_pool(Arc::new(pool)))
    }

    pub fn from_pool(pool: Arc<ThreadPool>) -> Self {
        Self { pool: Some(pool) }
    }
}

impl Dispatcher for RayonDispatcher {
    fn dispatch(&self, job: Job) -> bool {
        match &self.pool {
            Some(pool) => pool.spawn(move || job.run()),
            None => rayon::spawn(move || job.run()),
        }
        true
    }
}
