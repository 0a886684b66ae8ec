//! The dataflow scheduler: pins, tasks, prototypes and the orchestrator that
//! grows and runs the task graph.

pub mod diagnostics;
mod dispatch;
mod growth;
mod journal;
mod node;
pub mod pin;
mod prototype;
mod scheduler;
mod task;

use std::fmt;

pub use crate::engine::diagnostics::{RunReport, Snapshot, TaskExecution, TaskSummary};
pub use crate::engine::dispatch::{Dispatcher, Job, RayonDispatcher};
pub use crate::engine::journal::{Journal, Severity};
pub use crate::engine::pin::{Pin, PinKind, PinSpec};
pub use crate::engine::prototype::{Blueprint, Prototype, PrototypeId, Registry};
pub use crate::engine::scheduler::Scheduler;
pub use crate::engine::task::{FnTask, Readiness, Task, TaskContext, TaskState, from_fn};

/// Stable handle of a task instance in the scheduler's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct TaskId(usize);

impl TaskId {
    pub(crate) const fn new(index: usize) -> Self {
        TaskId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}
