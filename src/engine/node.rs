use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::core::Tier;
use crate::engine::TaskId;
use crate::engine::diagnostics::TaskExecution;
use crate::engine::pin::{Pin, PinSpec};
use crate::engine::prototype::PrototypeId;
use crate::engine::task::{Readiness, Task, TaskState};

/// Arena cell holding one task instance and its pins.
pub(crate) struct TaskNode {
    pub id: TaskId,
    pub tier: Tier,
    pub prototype: Option<PrototypeId>,
    /// Inputs are shadow pins added during growth rather than a fixed
    /// signature.
    pub variadic: bool,
    pub quiescent: bool,
    name: RwLock<Cow<'static, str>>,
    body: Mutex<Box<dyn Task>>,
    inputs: RwLock<Vec<Arc<Pin>>>,
    outputs: RwLock<Vec<Arc<Pin>>>,
    children: Mutex<Vec<TaskId>>,
    dispatched: AtomicBool,
    /// A fence stops accepting new inputs once it decided to run.
    closed: AtomicBool,
    state: AtomicU8,
    timing: Mutex<Option<TaskExecution>>,
}

impl TaskNode {
    pub fn new(
        id: TaskId,
        tier: Tier,
        prototype: Option<PrototypeId>,
        body: Box<dyn Task>,
        inputs: &[PinSpec],
        outputs: &[PinSpec],
        variadic: bool,
    ) -> Self {
        let name = body.name();
        let quiescent = body.awaits_quiescence();

        Self {
            id,
            tier,
            prototype,
            variadic,
            quiescent,
            name: RwLock::new(name),
            body: Mutex::new(body),
            inputs: RwLock::new(inputs.iter().map(|spec| Arc::new(Pin::new(id, *spec))).collect()),
            outputs: RwLock::new(outputs.iter().map(|spec| Arc::new(Pin::new(id, *spec))).collect()),
            children: Mutex::new(Vec::new()),
            dispatched: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: AtomicU8::new(TaskState::Created as u8),
            timing: Mutex::new(None),
        }
    }

    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_string()
    }

    pub fn set_name(&self, name: Cow<'static, str>) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name;
    }

    pub fn body(&self) -> MutexGuard<'_, Box<dyn Task>> {
        self.body.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inputs(&self) -> Vec<Arc<Pin>> {
        self.inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn push_input(&self, pin: Arc<Pin>) {
        self.inputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pin);
    }

    pub fn outputs(&self) -> Vec<Arc<Pin>> {
        self.outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Output pins that may still carry data.
    pub fn live_outputs(&self) -> Vec<Arc<Pin>> {
        self.outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|pin| !pin.is_disposed())
            .cloned()
            .collect()
    }

    /// Moves the output pins out for the duration of an execution.
    pub fn take_outputs(&self) -> Vec<Arc<Pin>> {
        std::mem::take(&mut *self.outputs.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn restore_outputs(&self, outputs: Vec<Arc<Pin>>) {
        *self.outputs.write().unwrap_or_else(PoisonError::into_inner) = outputs;
    }

    pub fn children(&self) -> Vec<TaskId> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_children(&self) -> bool {
        !self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn add_child(&self, child: TaskId) {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        if !children.contains(&child) {
            children.push(child);
        }
    }

    /// The single false to true transition of the dispatched flag.
    pub fn try_dispatch(&self) -> bool {
        self.dispatched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether growth may still attach inputs to this fence.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.state().is_finished()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn timing(&self) -> Option<TaskExecution> {
        self.timing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_timing(&self, timing: TaskExecution) {
        *self.timing.lock().unwrap_or_else(PoisonError::into_inner) = Some(timing);
    }

    /// Recomputes readiness from the input pins. `live` is the number of
    /// tasks currently counted as running, this one included.
    pub fn readiness(&self, live: usize) -> Readiness {
        let readiness = if self.variadic {
            self.fence_readiness()
        } else {
            self.fixed_readiness()
        };

        if readiness == Readiness::Ready && self.quiescent && live > 1 {
            return Readiness::Pending;
        }

        readiness
    }

    fn fixed_readiness(&self) -> Readiness {
        let inputs = self.inputs.read().unwrap_or_else(PoisonError::into_inner);
        let mut readiness = Readiness::Ready;

        for pin in inputs.iter() {
            // unbound slots are optional
            let Some(parent) = pin.parent() else {
                continue;
            };
            if parent.is_disposed() {
                return Readiness::Starved;
            }
            if !parent.has_data() {
                readiness = Readiness::Pending;
            }
        }

        readiness
    }

    fn fence_readiness(&self) -> Readiness {
        let mut inputs = self.inputs.write().unwrap_or_else(PoisonError::into_inner);

        inputs.retain(|pin| {
            pin.parent()
                .is_some_and(|parent| !parent.is_disposed())
        });

        if inputs.is_empty() {
            return Readiness::Starved;
        }

        let waiting = inputs
            .iter()
            .any(|pin| pin.parent().is_some_and(|parent| !parent.has_data()));

        if waiting {
            Readiness::Pending
        } else {
            Readiness::Ready
        }
    }

    /// Copies upstream payloads into the input pins and returns them.
    pub fn load_inputs(&self) -> Vec<Arc<Pin>> {
        let inputs = self.inputs();
        for pin in &inputs {
            pin.load();
        }
        inputs
    }

    /// Turns the task into a dead end: pins are disposed and children
    /// forgotten.
    pub fn cancel(&self) {
        for pin in self.inputs().iter().chain(self.outputs().iter()) {
            pin.dispose();
        }
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.set_state(TaskState::Canceled);
    }

    /// Disposes declared outputs that were never written, so that consumers
    /// starve instead of waiting on them.
    pub fn dispose_unwritten(&self) {
        for pin in self.outputs().iter().filter(|pin| !pin.has_data()) {
            pin.dispose();
        }
    }

    pub fn dispose_outputs(&self) {
        for pin in self.outputs() {
            pin.dispose();
        }
    }
}

/// Append-only storage of every task created during a run.
#[derive(Default)]
pub(crate) struct Arena {
    nodes: RwLock<Vec<Arc<TaskNode>>>,
}

impl Arena {
    pub fn insert(&self, make: impl FnOnce(TaskId) -> TaskNode) -> Arc<TaskNode> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let node = Arc::new(make(TaskId::new(nodes.len())));
        nodes.push(node.clone());
        node
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<TaskNode>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.index())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn all(&self) -> Vec<Arc<TaskNode>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::from_fn;

    fn node(id: usize, inputs: &[PinSpec], outputs: &[PinSpec], variadic: bool) -> TaskNode {
        TaskNode::new(
            TaskId::new(id),
            Tier::Primary,
            None,
            Box::new(from_fn("test", |_| Ok(()))),
            inputs,
            outputs,
            variadic,
        )
    }

    fn producer(id: usize) -> Arc<Pin> {
        Arc::new(Pin::new(TaskId::new(id), PinSpec::plain::<u32>()))
    }

    #[test]
    fn test_unbound_inputs_are_optional() {
        let node = node(0, &[PinSpec::plain::<u32>()], &[], false);
        assert_eq!(node.readiness(1), Readiness::Ready);
    }

    #[test]
    fn test_fixed_readiness() {
        let node = node(0, &[PinSpec::plain::<u32>(), PinSpec::plain::<u32>()], &[], false);
        let (a, b) = (producer(1), producer(2));
        let inputs = node.inputs();
        inputs[0].bind(a.clone());
        inputs[1].bind(b.clone());

        assert_eq!(node.readiness(1), Readiness::Pending);
        a.set_value(1u32).unwrap();
        assert_eq!(node.readiness(1), Readiness::Pending);
        b.set_value(2u32).unwrap();
        assert_eq!(node.readiness(1), Readiness::Ready);
    }

    #[test]
    fn test_disposed_parent_starves() {
        let node = node(0, &[PinSpec::plain::<u32>()], &[], false);
        let a = producer(1);
        node.inputs()[0].bind(a.clone());

        a.dispose();
        assert_eq!(node.readiness(1), Readiness::Starved);
    }

    #[test]
    fn test_fence_prunes_disposed() {
        let fence = node(0, &[], &[], true);
        let (a, b) = (producer(1), producer(2));
        for parent in [&a, &b] {
            let shadow = Arc::new(Pin::new(fence.id, PinSpec::plain::<u32>()));
            shadow.bind(parent.clone());
            fence.push_input(shadow);
        }

        assert_eq!(fence.readiness(1), Readiness::Pending);
        a.dispose();
        assert_eq!(fence.readiness(1), Readiness::Pending);
        assert_eq!(fence.inputs().len(), 1);
        b.set_value(5u32).unwrap();
        assert_eq!(fence.readiness(1), Readiness::Ready);

        b.dispose();
        assert_eq!(fence.readiness(1), Readiness::Starved);
    }

    #[test]
    fn test_quiescent_waits_for_others() {
        let node = TaskNode::new(
            TaskId::new(0),
            Tier::Primary,
            None,
            Box::new(QuiescentTask),
            &[],
            &[],
            false,
        );

        assert_eq!(node.readiness(3), Readiness::Pending);
        assert_eq!(node.readiness(1), Readiness::Ready);
    }

    struct QuiescentTask;

    impl Task for QuiescentTask {
        fn name(&self) -> Cow<'static, str> {
            "quiescent".into()
        }

        fn execute(&mut self, _: &mut crate::engine::TaskContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        fn awaits_quiescence(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_dispatch_once() {
        let node = node(0, &[], &[], false);
        assert!(node.try_dispatch());
        assert!(!node.try_dispatch());
    }

    #[test]
    fn test_cancel_clears() {
        let node = node(0, &[], &[PinSpec::plain::<u32>()], false);
        node.add_child(TaskId::new(4));
        node.add_child(TaskId::new(4));
        assert_eq!(node.children(), vec![TaskId::new(4)]);

        node.cancel();
        assert!(!node.has_children());
        assert!(node.outputs()[0].is_disposed());
        assert!(node.live_outputs().is_empty());
        assert_eq!(node.state(), TaskState::Canceled);
        assert!(!node.is_open());
    }
}
