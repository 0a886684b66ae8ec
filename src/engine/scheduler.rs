use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{Level, Span, debug, error, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::SchedulerConfig;
use crate::core::Tier;
use crate::engine::TaskId;
use crate::engine::diagnostics::{RunReport, Snapshot, TaskExecution, TaskSummary};
use crate::engine::dispatch::{Dispatcher, Job, RayonDispatcher};
use crate::engine::growth::{Growth, OpenFences};
use crate::engine::journal::Journal;
use crate::engine::node::{Arena, TaskNode};
use crate::engine::pin::PinSpec;
use crate::engine::prototype::{Prototype, PrototypeId, Registry};
use crate::engine::task::{Readiness, Task, TaskContext, TaskState};
use crate::utils::{STYLE_RUN, STYLE_TASK, as_overhead, format_active};

struct Shared {
    config: SchedulerConfig,
    registry: RwLock<Registry>,
    arena: Arena,
    /// Held for the whole of a growth pass. Also guards fences deciding to
    /// run, so they never gain inputs after that point.
    growth: Mutex<OpenFences>,
    dispatchers: RwLock<[Arc<dyn Dispatcher>; 3]>,
    live: AtomicUsize,
    errors: AtomicUsize,
    executed: AtomicUsize,
    canceled: AtomicUsize,
    /// Workers currently handing a task to the pending queue.
    parking: AtomicUsize,
    pending_tx: Sender<TaskId>,
    pending_rx: Receiver<TaskId>,
    journal: Journal,
    progress: RwLock<Option<Span>>,
    active: Mutex<BTreeSet<String>>,
}

/// Owner of one task graph: the prototype registry, the task arena, the
/// counters and the per-tier dispatchers.
///
/// Cloning is cheap and yields a handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (pending_tx, pending_rx) = bounded(config.pending_capacity.max(1));
        let default: Arc<dyn Dispatcher> = Arc::new(RayonDispatcher::global());

        Self {
            shared: Arc::new(Shared {
                config,
                registry: RwLock::new(Registry::new()),
                arena: Arena::default(),
                growth: Mutex::new(OpenFences::new()),
                dispatchers: RwLock::new([default.clone(), default.clone(), default]),
                live: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
                executed: AtomicUsize::new(0),
                canceled: AtomicUsize::new(0),
                parking: AtomicUsize::new(0),
                pending_tx,
                pending_rx,
                journal: Journal::new(),
                progress: RwLock::new(None),
                active: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn journal(&self) -> &Journal {
        &self.shared.journal
    }

    /// Routes tasks of `tier` to `dispatcher`.
    pub fn bind(&self, tier: Tier, dispatcher: Arc<dyn Dispatcher>) {
        self.shared
            .dispatchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)[tier.index()] = dispatcher;
    }

    /// Routes every tier to `dispatcher`.
    pub fn bind_all(&self, dispatcher: Arc<dyn Dispatcher>) {
        for tier in Tier::ALL {
            self.bind(tier, dispatcher.clone());
        }
    }

    pub fn register(&self, prototype: impl Prototype + 'static) -> Option<PrototypeId> {
        self.shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(prototype)
    }

    pub fn unregister(&self, id: PrototypeId) {
        self.shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Adds a root task without pins.
    pub fn spawn(&self, task: impl Task + 'static) -> TaskId {
        self.spawn_with(task, &[], &[])
    }

    /// Adds a root task with declared pins. Its inputs stay unbound, its
    /// outputs take part in growth like those of any other task.
    pub fn spawn_with(
        &self,
        task: impl Task + 'static,
        inputs: &[PinSpec],
        outputs: &[PinSpec],
    ) -> TaskId {
        let node = self.shared.arena.insert(|id| {
            TaskNode::new(id, Tier::Primary, None, Box::new(task), inputs, outputs, false)
        });
        debug!(task = %node.id, name = %node.name(), "spawned root task");
        node.id
    }

    fn node(&self, id: TaskId) -> Option<Arc<TaskNode>> {
        self.shared.arena.get(id)
    }

    pub fn task_count(&self) -> usize {
        self.shared.arena.len()
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.node(id).map(|node| node.state())
    }

    pub fn task_name(&self, id: TaskId) -> Option<String> {
        self.node(id).map(|node| node.name())
    }

    /// Prototype the task was instantiated from, `None` for roots.
    pub fn task_prototype(&self, id: TaskId) -> Option<PrototypeId> {
        self.node(id)?.prototype
    }

    pub fn children(&self, id: TaskId) -> Vec<TaskId> {
        self.node(id).map(|node| node.children()).unwrap_or_default()
    }

    /// Tasks whose current name is `name`, in creation order.
    pub fn find(&self, name: &str) -> Vec<TaskId> {
        self.shared
            .arena
            .all()
            .iter()
            .filter(|node| node.name() == name)
            .map(|node| node.id)
            .collect()
    }

    /// Payload of output pin `index` of task `id`.
    pub fn output<T: Any + Send + Sync>(&self, id: TaskId, index: usize) -> Option<Arc<T>> {
        self.node(id)?.outputs().get(index)?.get::<T>()
    }

    pub fn live_tasks(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.shared.errors.load(Ordering::SeqCst)
    }

    /// Hands the task to its tier's dispatcher. Only the first call for a
    /// task does anything; later calls return `false`.
    pub fn dispatch(&self, id: TaskId) -> bool {
        let Some(node) = self.node(id) else {
            return false;
        };

        if !node.try_dispatch() {
            return false;
        }

        self.shared.live.fetch_add(1, Ordering::SeqCst);
        node.set_state(TaskState::Dispatched);
        self.hand_off(&node);

        true
    }

    fn hand_off(&self, node: &TaskNode) {
        let dispatcher = self
            .shared
            .dispatchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)[node.tier.index()]
        .clone();

        if !dispatcher.dispatch(Job::new(self.clone(), node.id)) {
            error!(task = %node.id, name = %node.name(), "dispatcher refused the task");
            node.dispose_outputs();
            node.set_state(TaskState::Errored);
            self.shared.errors.fetch_add(1, Ordering::SeqCst);
            self.prune(node.children());
            self.release();
        }
    }

    /// Worker side of a dispatched task.
    pub(crate) fn run_job(&self, id: TaskId) {
        let Some(node) = self.node(id) else {
            return;
        };

        let readiness = if node.variadic {
            let _growth = self
                .shared
                .growth
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let readiness = node.readiness(self.live_tasks());
            if readiness == Readiness::Ready {
                node.close();
            }
            readiness
        } else {
            node.readiness(self.live_tasks())
        };

        match readiness {
            Readiness::Ready => self.execute(&node),
            Readiness::Pending => {
                // blocks while the queue is full; fails only once the
                // scheduler is gone
                self.shared.parking.fetch_add(1, Ordering::SeqCst);
                let _ = self.shared.pending_tx.send(id);
                self.shared.parking.fetch_sub(1, Ordering::SeqCst);
            }
            Readiness::Starved => {
                debug!(task = %node.id, name = %node.name(), "task lost its inputs");
                self.cancel(&node);
            }
        }
    }

    fn execute(&self, node: &Arc<TaskNode>) {
        node.set_state(TaskState::Executing);

        let name = node.name();
        let span = tracing::span!(Level::INFO, "task", name = %name);
        if self.shared.config.progress {
            span.pb_set_style(&STYLE_TASK);
            span.pb_set_message(&format!("Running {name}"));
        }
        let _enter = span.enter();
        self.set_active(&name, true);

        let inputs = node.load_inputs();
        let mut outputs = node.take_outputs();
        let start = Instant::now();

        let (result, canceled) = {
            let mut body = node.body();
            let mut ctx = TaskContext::new(
                node.id,
                &name,
                &inputs,
                &mut outputs,
                &self.shared.journal,
            );

            // A panicking body only ever touched its own pins and context.
            let result = panic::catch_unwind(AssertUnwindSafe(|| body.execute(&mut ctx)));
            let canceled = ctx.is_canceled();
            node.set_name(body.name());
            (result, canceled)
        };

        let duration = start.elapsed();
        node.restore_outputs(outputs);
        node.set_timing(TaskExecution { start, duration });
        self.shared.executed.fetch_add(1, Ordering::SeqCst);
        self.set_active(&name, false);

        match result {
            Ok(Ok(())) if canceled => {
                debug!(task = %node.id, name = %node.name(), "task canceled itself");
                self.cancel(node);
            }
            Ok(Ok(())) => self.complete(node),
            Ok(Err(err)) => self.fail(node, err),
            Err(panic) => self.fail(node, anyhow::anyhow!(panic_message(panic))),
        }
    }

    fn complete(&self, node: &Arc<TaskNode>) {
        node.dispose_unwritten();

        if !node.has_children() && !node.live_outputs().is_empty() {
            let s = Instant::now();
            let created = self.grow(&[node.id]);
            debug!(task = %node.id, "grew {} task(s) {}", created.len(), as_overhead(s));
        }

        node.set_state(TaskState::Completed);

        for child in node.children() {
            self.dispatch(child);
        }

        self.release();
    }

    fn fail(&self, node: &TaskNode, err: anyhow::Error) {
        if tracing::enabled!(Level::DEBUG) {
            error!(task = %node.id, "{} failed: {err:?}", node.name());
        } else {
            error!(task = %node.id, "{} failed: {err:#}", node.name());
        }

        node.dispose_outputs();
        node.set_state(TaskState::Errored);
        self.shared.errors.fetch_add(1, Ordering::SeqCst);
        self.prune(node.children());
        self.release();
    }

    fn cancel(&self, node: &TaskNode) {
        let children = node.children();
        node.cancel();
        self.shared.canceled.fetch_add(1, Ordering::SeqCst);
        self.prune(children);
        self.release();
    }

    /// Cancels the never dispatched descendants of a dead task that lost
    /// their inputs with it. Fences further down then drop those producers
    /// and run on what is left.
    fn prune(&self, children: Vec<TaskId>) {
        let mut stack = children;

        while let Some(id) = stack.pop() {
            let Some(child) = self.node(id) else {
                continue;
            };

            // claiming the dispatch keeps the task away from workers
            let claimed = if child.variadic {
                let _growth = self
                    .shared
                    .growth
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let claimed = child.readiness(0) == Readiness::Starved && child.try_dispatch();
                if claimed {
                    child.close();
                }
                claimed
            } else {
                child.readiness(0) == Readiness::Starved && child.try_dispatch()
            };

            if !claimed {
                continue;
            }

            debug!(task = %child.id, name = %child.name(), "dropped task with lost inputs");
            stack.extend(child.children());
            child.cancel();
            self.shared.canceled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn release(&self) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);

        if let Some(span) = &*self.shared.progress.read().unwrap_or_else(PoisonError::into_inner) {
            span.pb_inc(1);
        }
    }

    fn set_active(&self, name: &str, running: bool) {
        if !self.shared.config.progress {
            return;
        }

        let mut active = self.shared.active.lock().unwrap_or_else(PoisonError::into_inner);
        if running {
            active.insert(name.to_string());
        } else {
            active.remove(name);
        }

        if let Some(span) = &*self.shared.progress.read().unwrap_or_else(PoisonError::into_inner) {
            span.pb_set_message(&format_active(&active));
        }
    }

    fn grow(&self, frontier: &[TaskId]) -> Vec<TaskId> {
        let mut fences = self
            .shared
            .growth
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let registry = self
            .shared
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        Growth::new(&registry, &self.shared.arena, &self.shared.config, &mut fences).grow(frontier)
    }

    /// Runs `roots` and everything the graph grows out of them, blocking
    /// until no task is live.
    pub fn await_completion(&self, roots: &[TaskId]) -> RunReport {
        let started = Instant::now();
        let config = &self.shared.config;

        let span = tracing::span!(Level::INFO, "run");
        if config.progress {
            span.pb_set_style(&STYLE_RUN);
            span.pb_set_length(self.task_count() as u64);
            span.pb_set_message("Running tasks...");
        }
        *self
            .shared
            .progress
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(span.clone());
        let _enter = span.enter();

        // roots declaring outputs up front may meet in multi-input matches
        let seeded: Vec<TaskId> = roots
            .iter()
            .copied()
            .filter(|&id| {
                self.node(id)
                    .is_some_and(|node| !node.has_children() && !node.outputs().is_empty())
            })
            .collect();
        if !seeded.is_empty() {
            self.grow(&seeded);
        }

        for &root in roots {
            self.dispatch(root);
        }

        // Pending tasks held by the loop never exceed two queues' worth. The
        // overflow goes back into the channel and is picked up next tick.
        let capacity = config.pending_capacity.max(1);
        let mut deferred: VecDeque<TaskId> = VecDeque::with_capacity(capacity);
        let mut stalled = 0;

        while self.live_tasks() > 0 {
            let logged = self.shared.journal.flush();
            let room = (2 * capacity).saturating_sub(deferred.len());

            let mut batch: Vec<TaskId> = deferred.drain(..).collect();
            if logged == 0 {
                if room > 0 {
                    batch.extend(self.shared.pending_rx.recv_timeout(config.tick).ok());
                } else {
                    thread::sleep(config.tick);
                }
            }
            let room = (2 * capacity).saturating_sub(batch.len());
            batch.extend(self.shared.pending_rx.try_iter().take(room));

            if config.progress {
                span.pb_set_length(self.task_count() as u64);
            }

            if batch.is_empty() {
                continue;
            }

            let mut progressed = false;
            for id in batch {
                let Some(node) = self.node(id) else {
                    continue;
                };

                match node.readiness(self.live_tasks()) {
                    Readiness::Pending => {
                        if deferred.len() < capacity {
                            deferred.push_back(id);
                        } else if let Err(err) = self.shared.pending_tx.try_send(id) {
                            deferred.push_back(err.into_inner());
                        }
                    }
                    Readiness::Ready | Readiness::Starved => {
                        progressed = true;
                        self.hand_off(&node);
                    }
                }
            }

            // every live task is parked and nothing can wake it up
            let parked = deferred.len()
                + self.shared.pending_rx.len()
                + self.shared.parking.load(Ordering::SeqCst);
            if !progressed && parked == self.live_tasks() {
                stalled += 1;
            } else {
                stalled = 0;
            }

            if stalled > 1 {
                self.break_stall(&mut deferred);
                stalled = 0;
            }
        }

        self.shared.journal.flush();
        *self
            .shared
            .progress
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let report = RunReport {
            success: self.errors() == 0,
            errors: self.errors(),
            executed: self.shared.executed.load(Ordering::SeqCst),
            canceled: self.shared.canceled.load(Ordering::SeqCst),
            created: self.task_count(),
            elapsed: started.elapsed(),
        };

        if report.success {
            info!("{report}");
        } else {
            warn!("{report}");
        }

        report
    }

    /// Cancels every parked task, unless one of them turns out to be ready
    /// after all. Tasks still on their way into the queue are left for the
    /// next stall.
    fn break_stall(&self, deferred: &mut VecDeque<TaskId>) {
        let parked: Vec<Arc<TaskNode>> = deferred
            .drain(..)
            .chain(self.shared.pending_rx.try_iter())
            .filter_map(|id| self.node(id))
            .collect();

        let live = self.live_tasks();
        let (stuck, movable): (Vec<_>, Vec<_>) = parked
            .into_iter()
            .partition(|node| node.readiness(live) == Readiness::Pending);

        if !movable.is_empty() {
            for node in &movable {
                self.hand_off(node);
            }
            for node in stuck {
                if let Err(err) = self.shared.pending_tx.try_send(node.id) {
                    deferred.push_back(err.into_inner());
                }
            }
            return;
        }

        for node in stuck {
            error!(task = %node.id, "{} never became ready", node.name());
            let children = node.children();
            node.cancel();
            self.shared.canceled.fetch_add(1, Ordering::SeqCst);
            self.shared.errors.fetch_add(1, Ordering::SeqCst);
            self.prune(children);
            self.release();
        }
    }

    /// Copies the current task graph for inspection.
    pub fn snapshot(&self) -> Snapshot {
        let nodes = self.shared.arena.all();
        let mut snapshot = Snapshot::new();

        let indices: Vec<_> = nodes
            .iter()
            .map(|node| {
                snapshot.add_task(TaskSummary {
                    id: node.id,
                    name: node.name(),
                    tier: node.tier,
                    state: node.state(),
                    execution: node.timing(),
                })
            })
            .collect();

        for node in &nodes {
            for child in node.children() {
                // tasks grown after the node list was taken are left out
                let (Some(&to), Some(target)) = (indices.get(child.index()), self.node(child))
                else {
                    continue;
                };

                let label = target
                    .inputs()
                    .iter()
                    .find(|pin| pin.parent().is_some_and(|parent| parent.owner() == node.id))
                    .map(|pin| pin.data_type().short_name())
                    .unwrap_or_default();

                snapshot.add_edge(indices[node.id.index()], to, label);
            }
        }

        snapshot
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        String::from("task panicked with unknown payload")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;
    use crate::core::Flags;
    use crate::engine::prototype::Blueprint;
    use crate::engine::task::from_fn;

    const A: Flags = Flags::bit(0);

    #[derive(Debug)]
    struct Part(u32);

    #[derive(Debug)]
    struct Done(u32);

    fn scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerConfig::default()
                .with_tick(Duration::from_millis(5))
                .with_progress(false),
        )
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TaskId>>);

    impl Dispatcher for Recorder {
        fn dispatch(&self, job: Job) -> bool {
            self.0.lock().unwrap().push(job.id());
            true
        }
    }

    struct Refuse;

    impl Dispatcher for Refuse {
        fn dispatch(&self, _: Job) -> bool {
            false
        }
    }

    #[test]
    fn test_dispatch_is_idempotent() {
        let scheduler = scheduler();
        let recorder = Arc::new(Recorder::default());
        scheduler.bind(Tier::Primary, recorder.clone());

        let id = scheduler.spawn(from_fn("once", |_| Ok(())));

        let wins: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| scheduler.dispatch(id)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(wins, 1);
        assert_eq!(scheduler.live_tasks(), 1);
        assert_eq!(*recorder.0.lock().unwrap(), vec![id]);
        assert_eq!(scheduler.task_state(id), Some(TaskState::Dispatched));
    }

    #[test]
    fn test_pair_runs_after_both_leaves() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        let sum = Arc::new(AtomicU32::new(0));

        let (r, s) = (runs.clone(), sum.clone());
        let pair_id = scheduler.register(
            Blueprint::new("pair")
                .input(PinSpec::exclusive::<Part>(A))
                .input(PinSpec::exclusive::<Part>(A))
                .exclusive()
                .run(move |ctx| {
                    r.fetch_add(1, Ordering::SeqCst);
                    let total: u32 = ctx.inputs_of::<Part>().iter().map(|p| p.0).sum();
                    s.store(total, Ordering::SeqCst);
                    Ok(())
                }),
        );

        let out = [PinSpec::flagged::<Part>(A)];
        let l1 = scheduler.spawn_with(
            from_fn("l1", |ctx| Ok(ctx.set_output(0, Part(1))?)),
            &[],
            &out,
        );
        let l2 = scheduler.spawn_with(
            from_fn("l2", |ctx| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(ctx.set_output(0, Part(2))?)
            }),
            &[],
            &out,
        );

        let report = scheduler.await_completion(&[l1, l2]);

        assert!(report.success);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(sum.load(Ordering::SeqCst), 3);

        let pair = scheduler.find("pair");
        assert_eq!(pair.len(), 1);
        assert_eq!(scheduler.children(l1), pair);
        assert_eq!(scheduler.children(l2), pair);
        assert_eq!(scheduler.task_state(pair[0]), Some(TaskState::Completed));
        assert_eq!(scheduler.task_prototype(pair[0]), pair_id);
        assert_eq!(scheduler.task_prototype(l1), None);
        assert_eq!(report.executed, 3);
    }

    #[test]
    fn test_failing_task_stops_its_branch() {
        let scheduler = scheduler();
        scheduler.register(
            Blueprint::new("child")
                .input(PinSpec::plain::<u32>())
                .run(|_| Ok(())),
        );

        let root = scheduler.spawn_with(
            from_fn("root", |_| anyhow::bail!("boom")),
            &[],
            &[PinSpec::plain::<u32>()],
        );

        let report = scheduler.await_completion(&[root]);

        assert!(!report.success);
        assert_eq!(report.errors, 1);
        assert_eq!(report.canceled, 1);
        assert_eq!(report.executed, 1);
        assert_eq!(scheduler.task_state(root), Some(TaskState::Errored));

        let children = scheduler.children(root);
        assert_eq!(children.len(), 1);
        assert_eq!(scheduler.task_state(children[0]), Some(TaskState::Canceled));
    }

    #[test]
    fn test_result_reflects_error_count() {
        for failures in 0..3 {
            let scheduler = scheduler();
            let roots: Vec<TaskId> = (0..10)
                .map(|i| {
                    scheduler.spawn(from_fn(format!("t{i}"), move |_| {
                        if i < failures {
                            anyhow::bail!("task {i} failed");
                        }
                        Ok(())
                    }))
                })
                .collect();

            let report = scheduler.await_completion(&roots);

            assert_eq!(report.errors, failures);
            assert_eq!(report.success, failures == 0);
            assert_eq!(report.executed, 10);
            assert_eq!(scheduler.live_tasks(), 0);
        }
    }

    #[test]
    fn test_fence_waits_for_every_producer() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        let sum = Arc::new(AtomicU32::new(0));

        scheduler.register(
            Blueprint::new("work")
                .input(PinSpec::plain::<u32>())
                .output(PinSpec::plain::<Done>())
                .run(|ctx| {
                    let n = *ctx.input::<u32>(0)?;
                    if n == 2 {
                        ctx.cancel();
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(u64::from(n) * 10));
                    Ok(ctx.set_output(0, Done(n))?)
                }),
        );

        let (r, s) = (runs.clone(), sum.clone());
        scheduler.register(
            Blueprint::new("gather")
                .variadic(|pin| pin.data_type().is::<Done>())
                .run(move |ctx| {
                    r.fetch_add(1, Ordering::SeqCst);
                    let total: u32 = ctx.inputs_of::<Done>().iter().map(|d| d.0).sum();
                    s.store(total, Ordering::SeqCst);
                    Ok(())
                }),
        );

        let root = scheduler.spawn(from_fn("root", |ctx| {
            for n in 1..=3u32 {
                ctx.emit(PinSpec::plain::<u32>(), n)?;
            }
            Ok(())
        }));

        let report = scheduler.await_completion(&[root]);

        assert!(report.success);
        assert_eq!(report.canceled, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(sum.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.find("work").len(), 3);
        assert_eq!(scheduler.find("gather").len(), 1);
    }

    #[test]
    fn test_fence_over_lost_producers_never_runs() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicU32::new(0));

        scheduler.register(
            Blueprint::new("gather")
                .variadic(|pin| pin.data_type().is::<Done>())
                .run({
                    let runs = runs.clone();
                    move |_| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
        );

        let out = [PinSpec::plain::<Done>()];
        let slow = scheduler.spawn_with(
            from_fn("slow", |ctx| {
                std::thread::sleep(Duration::from_millis(20));
                ctx.cancel();
                Ok(())
            }),
            &[],
            &out,
        );
        let fast = scheduler.spawn_with(from_fn("fast", |_| anyhow::bail!("lost")), &[], &out);

        let report = scheduler.await_completion(&[slow, fast]);

        assert_eq!(report.errors, 1);
        assert_eq!(report.canceled, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        let gather = scheduler.find("gather");
        assert_eq!(gather.len(), 1);
        assert_eq!(scheduler.task_state(gather[0]), Some(TaskState::Canceled));
    }

    /// Roots `lost` and `kept` each feed a `relay`, and one fence gathers
    /// what both relays produce.
    fn split_branches(lost: impl Task + 'static) -> (Scheduler, Arc<AtomicU32>, RunReport) {
        let scheduler = scheduler();
        let gathered = Arc::new(AtomicU32::new(0));

        scheduler.register(
            Blueprint::new("relay")
                .input(PinSpec::plain::<Part>())
                .output(PinSpec::plain::<Done>())
                .run(|ctx| {
                    let part = ctx.input::<Part>(0)?;
                    Ok(ctx.set_output(0, Done(part.0))?)
                }),
        );

        let g = gathered.clone();
        scheduler.register(
            Blueprint::new("gather")
                .variadic(|pin| pin.data_type().is::<Done>())
                .run(move |ctx| {
                    let total: u32 = ctx.inputs_of::<Done>().iter().map(|d| d.0).sum();
                    g.fetch_add(total, Ordering::SeqCst);
                    Ok(())
                }),
        );

        let out = [PinSpec::plain::<Part>()];
        let lost = scheduler.spawn_with(lost, &[], &out);
        let kept = scheduler.spawn_with(
            from_fn("kept", |ctx| Ok(ctx.set_output(0, Part(7))?)),
            &[],
            &out,
        );

        let report = scheduler.await_completion(&[lost, kept]);
        (scheduler, gathered, report)
    }

    #[test]
    fn test_canceled_branch_leaves_fence_running() {
        let (scheduler, gathered, report) = split_branches(from_fn("lost", |ctx| {
            ctx.cancel();
            Ok(())
        }));

        assert!(report.success);
        assert_eq!(report.errors, 0);
        assert_eq!(report.canceled, 2);
        assert_eq!(gathered.load(Ordering::SeqCst), 7);

        let gather = scheduler.find("gather");
        assert_eq!(gather.len(), 1);
        assert_eq!(scheduler.task_state(gather[0]), Some(TaskState::Completed));
        let relays = scheduler.find("relay");
        assert_eq!(relays.len(), 2);
        assert!(
            relays
                .iter()
                .any(|&id| scheduler.task_state(id) == Some(TaskState::Canceled))
        );
    }

    #[test]
    fn test_failed_branch_is_one_error() {
        let (scheduler, gathered, report) =
            split_branches(from_fn("lost", |_| anyhow::bail!("broken")));

        assert!(!report.success);
        assert_eq!(report.errors, 1);
        assert_eq!(report.canceled, 1);
        assert_eq!(gathered.load(Ordering::SeqCst), 7);
        let gather = scheduler.find("gather");
        assert_eq!(scheduler.task_state(gather[0]), Some(TaskState::Completed));
    }

    #[test]
    fn test_panicking_task_is_an_error() {
        let scheduler = scheduler();
        let id = scheduler.spawn(from_fn("panics", |_| panic!("kaboom")));

        let report = scheduler.await_completion(&[id]);

        assert!(!report.success);
        assert_eq!(report.errors, 1);
        assert_eq!(scheduler.task_state(id), Some(TaskState::Errored));
    }

    struct Last {
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Task for Last {
        fn name(&self) -> std::borrow::Cow<'static, str> {
            "last".into()
        }

        fn execute(&mut self, _: &mut TaskContext<'_>) -> anyhow::Result<()> {
            self.order.lock().unwrap().push("last");
            Ok(())
        }

        fn awaits_quiescence(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_quiescent_task_runs_last() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut roots: Vec<TaskId> = (0..3)
            .map(|_| {
                let order = order.clone();
                scheduler.spawn(from_fn("busy", move |_| {
                    std::thread::sleep(Duration::from_millis(15));
                    order.lock().unwrap().push("busy");
                    Ok(())
                }))
            })
            .collect();
        roots.push(scheduler.spawn(Last {
            order: order.clone(),
        }));

        let report = scheduler.await_completion(&roots);

        assert!(report.success);
        assert_eq!(*order.lock().unwrap(), vec!["busy", "busy", "busy", "last"]);
    }

    #[test]
    fn test_stall_is_broken() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        let a = scheduler.spawn(Last {
            order: order.clone(),
        });
        let b = scheduler.spawn(Last {
            order: order.clone(),
        });

        let report = scheduler.await_completion(&[a, b]);

        assert!(!report.success);
        assert_eq!(report.errors, 2);
        assert!(order.lock().unwrap().is_empty());
        assert_eq!(scheduler.task_state(a), Some(TaskState::Canceled));
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[test]
    fn test_pending_overflow_is_rechecked() {
        let scheduler = Scheduler::new(
            SchedulerConfig::default()
                .with_tick(Duration::from_millis(5))
                .with_pending_capacity(1)
                .with_progress(false),
        );
        scheduler.bind_all(Arc::new(RayonDispatcher::with_threads(8).unwrap()));
        let runs = Arc::new(AtomicU32::new(0));

        let r = runs.clone();
        scheduler.register(
            Blueprint::new("pair")
                .input(PinSpec::exclusive::<Part>(A))
                .input(PinSpec::exclusive::<Part>(A))
                .exclusive()
                .run(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        );

        // the fast leaf of each pair dispatches it long before the slow one
        // reports, so all pairs park at once
        let out = [PinSpec::flagged::<Part>(A)];
        let leaves: Vec<TaskId> = (0..6u32)
            .map(|i| {
                scheduler.spawn_with(
                    from_fn(format!("leaf{i}"), move |ctx| {
                        if i % 2 == 1 {
                            std::thread::sleep(Duration::from_millis(40));
                        }
                        Ok(ctx.set_output(0, Part(i))?)
                    }),
                    &[],
                    &out,
                )
            })
            .collect();

        let report = scheduler.await_completion(&leaves);

        assert!(report.success);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.find("pair").len(), 3);
    }

    #[test]
    fn test_stall_beyond_pending_capacity_is_broken() {
        let scheduler = Scheduler::new(
            SchedulerConfig::default()
                .with_tick(Duration::from_millis(5))
                .with_pending_capacity(1)
                .with_progress(false),
        );
        scheduler.bind_all(Arc::new(RayonDispatcher::with_threads(4).unwrap()));
        let order = Arc::new(Mutex::new(Vec::new()));

        let roots: Vec<TaskId> = (0..4)
            .map(|_| {
                scheduler.spawn(Last {
                    order: order.clone(),
                })
            })
            .collect();

        let report = scheduler.await_completion(&roots);

        // once the others are gone, the last one left may run after all
        let ran = order.lock().unwrap().len();
        assert!(!report.success);
        assert!(report.errors >= 3);
        assert_eq!(report.errors + ran, 4);
        assert_eq!(report.canceled, report.errors);
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[test]
    fn test_refused_dispatch_is_an_error() {
        let scheduler = scheduler();
        scheduler.bind_all(Arc::new(Refuse));

        let id = scheduler.spawn(from_fn("refused", |_| Ok(())));
        let report = scheduler.await_completion(&[id]);

        assert_eq!(report.errors, 1);
        assert_eq!(report.executed, 0);
        assert_eq!(scheduler.task_state(id), Some(TaskState::Errored));
    }

    #[test]
    fn test_dedicated_pool_per_tier() {
        let scheduler = scheduler();
        let pool = RayonDispatcher::with_threads(2).unwrap();
        scheduler.bind_all(Arc::new(pool));

        scheduler.register(
            Blueprint::new("double")
                .input(PinSpec::plain::<u32>())
                .output(PinSpec::plain::<u64>())
                .run(|ctx| {
                    let n = ctx.input::<u32>(0)?;
                    Ok(ctx.set_output(0, u64::from(*n) * 2)?)
                }),
        );

        let root = scheduler.spawn_with(
            from_fn("seed", |ctx| Ok(ctx.set_output(0, 21u32)?)),
            &[],
            &[PinSpec::plain::<u32>()],
        );

        let report = scheduler.await_completion(&[root]);
        let double = scheduler.find("double");

        assert!(report.success);
        assert_eq!(scheduler.output::<u64>(double[0], 0).as_deref(), Some(&42));
    }

    #[test]
    fn test_snapshot_matches_graph() {
        let scheduler = scheduler();
        scheduler.register(
            Blueprint::new("next")
                .input(PinSpec::plain::<u32>())
                .run(|_| Ok(())),
        );

        let root = scheduler.spawn_with(
            from_fn("seed", |ctx| Ok(ctx.set_output(0, 1u32)?)),
            &[],
            &[PinSpec::plain::<u32>()],
        );
        scheduler.await_completion(&[root]);

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.task_count(), 2);
        assert_eq!(snapshot.edge_count(), 1);
        assert!(!snapshot.is_cyclic());
        assert!(snapshot.render_mermaid().contains("0 -- \"u32\" --> 1"));
    }
}
