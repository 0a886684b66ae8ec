use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;

use crate::core::Flags;
use crate::engine::journal::{Journal, Severity};
use crate::engine::pin::{Pin, PinSpec};
use crate::engine::TaskId;
use crate::error::PinError;

/// A unit of work in the graph.
///
/// The pins a task reads and writes are owned by the scheduler; the body only
/// sees them through the [`TaskContext`] passed to [`Task::execute`].
pub trait Task: Send {
    fn name(&self) -> Cow<'static, str>;

    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()>;

    /// Hold the task back until it is the only live task of the run.
    fn awaits_quiescence(&self) -> bool {
        false
    }
}

/// Lifecycle of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TaskState {
    Created = 0,
    Dispatched = 1,
    Executing = 2,
    Completed = 3,
    Canceled = 4,
    Errored = 5,
}

impl TaskState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Dispatched,
            2 => TaskState::Executing,
            3 => TaskState::Completed,
            4 => TaskState::Canceled,
            _ => TaskState::Errored,
        }
    }

    /// Completed, canceled or errored.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Canceled | TaskState::Errored
        )
    }
}

/// Whether a task's inputs allow it to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Some producer has not reported yet.
    Pending,
    /// A producer was disposed, the task can never run.
    Starved,
}

/// View of the scheduler handed to a running task body.
pub struct TaskContext<'a> {
    id: TaskId,
    name: &'a str,
    inputs: &'a [Arc<Pin>],
    outputs: &'a mut Vec<Arc<Pin>>,
    journal: &'a Journal,
    canceled: bool,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        id: TaskId,
        name: &'a str,
        inputs: &'a [Arc<Pin>],
        outputs: &'a mut Vec<Arc<Pin>>,
        journal: &'a Journal,
    ) -> Self {
        Self {
            id,
            name,
            inputs,
            outputs,
            journal,
            canceled: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn inputs(&self) -> &[Arc<Pin>] {
        self.inputs
    }

    /// Payload of input pin `index`, downcast to `T`.
    pub fn input<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>, PinError> {
        let pin = self
            .inputs
            .get(index)
            .ok_or(PinError::MissingInput(index))?;
        let data = pin.data().ok_or(PinError::NoData(index))?;

        data.downcast::<T>().map_err(|_| PinError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found: pin.data_type().name(),
        })
    }

    /// Every input payload of type `T`, in pin order. Meant for variadic
    /// tasks whose input count is only known at run time.
    pub fn inputs_of<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        self.inputs
            .iter()
            .filter_map(|pin| pin.get::<T>())
            .collect()
    }

    pub fn outputs(&self) -> &[Arc<Pin>] {
        self.outputs
    }

    /// Writes declared output pin `index`.
    pub fn set_output<T: Any + Send + Sync>(
        &mut self,
        index: usize,
        value: T,
    ) -> Result<(), PinError> {
        self.outputs
            .get(index)
            .ok_or(PinError::MissingOutput(index))?
            .set_value(value)
    }

    /// Adds a new output pin described by `spec` and writes `value` into it.
    pub fn emit<T: Any + Send + Sync>(&mut self, spec: PinSpec, value: T) -> Result<(), PinError> {
        let pin = Pin::new(self.id, spec);
        pin.set_value(value)?;
        self.outputs.push(Arc::new(pin));
        Ok(())
    }

    pub fn emit_flagged<T: Any + Send + Sync>(
        &mut self,
        value: T,
        flags: Flags,
    ) -> Result<(), PinError> {
        self.emit(PinSpec::flagged::<T>(flags), value)
    }

    /// Gives up on producing output. Output pins get disposed and the task
    /// becomes a dead end for growth; this is not an error.
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn info(&self, message: impl Into<String>) {
        self.journal.push(Severity::Info, self.name, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.journal.push(Severity::Warn, self.name, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.journal.push(Severity::Error, self.name, message.into());
    }

    /// Like [`TaskContext::warn`], but only the first message for `key` in
    /// the whole run is kept.
    pub fn warn_once(&self, key: &str, message: impl Into<String>) {
        if self.journal.first_time(key) {
            self.warn(message);
        }
    }

    pub fn error_once(&self, key: &str, message: impl Into<String>) {
        if self.journal.first_time(key) {
            self.error(message);
        }
    }
}

/// A task backed by a closure.
pub struct FnTask<F> {
    name: Cow<'static, str>,
    callback: F,
}

impl<F> Task for FnTask<F>
where
    F: FnMut(&mut TaskContext<'_>) -> anyhow::Result<()> + Send,
{
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
        (self.callback)(ctx)
    }
}

/// Wraps a closure into a [`Task`].
pub fn from_fn<F>(name: impl Into<Cow<'static, str>>, callback: F) -> FnTask<F>
where
    F: FnMut(&mut TaskContext<'_>) -> anyhow::Result<()> + Send,
{
    FnTask {
        name: name.into(),
        callback,
    }
}
