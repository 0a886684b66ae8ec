//! Runtime growth of the task graph.
//!
//! Each generation takes the tasks that just finished (or were just
//! created) and matches their output pins against the registry in three
//! passes: multi-input subsets, variadic fences, single pins. Everything a
//! pass creates becomes the next generation, until one comes back empty.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tracing::{debug, trace, warn};

use crate::config::SchedulerConfig;
use crate::core::Tier;
use crate::engine::TaskId;
use crate::engine::node::{Arena, TaskNode};
use crate::engine::pin::{Pin, PinSpec};
use crate::engine::prototype::{PrototypeId, Registry, assign};

/// Growth state that survives between passes: the fence instance each
/// variadic prototype is currently filling.
pub(crate) type OpenFences = HashMap<PrototypeId, TaskId>;

pub(crate) struct Growth<'a> {
    registry: &'a Registry,
    arena: &'a Arena,
    config: &'a SchedulerConfig,
    fences: &'a mut OpenFences,
}

/// A Primary match found for one producer subset: the prototype and, per
/// input slot, the index of the producer pin bound to it.
type Match = (PrototypeId, Vec<usize>);

impl<'a> Growth<'a> {
    pub fn new(
        registry: &'a Registry,
        arena: &'a Arena,
        config: &'a SchedulerConfig,
        fences: &'a mut OpenFences,
    ) -> Self {
        Self {
            registry,
            arena,
            config,
            fences,
        }
    }

    /// Grows the graph from `frontier` until a generation creates nothing.
    /// Returns every task created on the way.
    pub fn grow(&mut self, frontier: &[TaskId]) -> Vec<TaskId> {
        let mut created = Vec::new();
        let mut generation = frontier.to_vec();
        let mut depth = 0;

        while !generation.is_empty() {
            if depth == self.config.max_generations {
                warn!(
                    depth,
                    frontier = generation.len(),
                    "graph growth stopped at the generation limit"
                );
                break;
            }

            let tasks: Vec<_> = generation
                .iter()
                .filter_map(|&id| self.arena.get(id))
                .collect();

            generation = self.generation(&tasks);
            trace!(depth, created = generation.len(), "grew generation");

            created.extend_from_slice(&generation);
            depth += 1;
        }

        if !created.is_empty() {
            debug!(created = created.len(), generations = depth, "graph grew");
        }

        created
    }

    fn generation(&mut self, tasks: &[Arc<TaskNode>]) -> Vec<TaskId> {
        let mut created = Vec::new();

        self.match_subsets(tasks, &mut created);
        self.match_variadic(tasks, &mut created);
        self.match_single(tasks, &mut created);

        created
    }

    fn match_subsets(&mut self, tasks: &[Arc<TaskNode>], created: &mut Vec<TaskId>) {
        let outputs: Vec<Vec<Arc<Pin>>> = tasks.iter().map(|task| task.live_outputs()).collect();

        let largest = if tasks.len() <= self.config.subset_frontier_limit {
            self.config.max_subset_size.min(tasks.len())
        } else {
            1
        };

        let subsets: Vec<Vec<usize>> = (1..=largest)
            .flat_map(|size| combinations(tasks.len(), size))
            .collect();

        // Matching is pure and runs in parallel, materializing is sequential
        // and in subset order so that locks resolve deterministically.
        let registry = self.registry;
        let found: Vec<(Vec<usize>, Vec<Match>)> = subsets
            .into_par_iter()
            .filter_map(|subset| {
                let specs: Vec<PinSpec> = subset
                    .iter()
                    .flat_map(|&i| outputs[i].iter().map(|pin| *pin.spec()))
                    .collect();

                if specs.len() < 2 {
                    return None;
                }

                let matches: Vec<Match> = registry
                    .get(specs.len(), Tier::Primary)
                    .iter()
                    .filter_map(|&id| {
                        assign(registry.prototype(id).inputs(), &specs).map(|slots| (id, slots))
                    })
                    .collect();

                (!matches.is_empty()).then_some((subset, matches))
            })
            .collect();

        for (subset, matches) in found {
            let pins: Vec<Arc<Pin>> = subset
                .iter()
                .flat_map(|&i| outputs[i].iter().cloned())
                .collect();
            let parents: Vec<TaskId> = subset.iter().map(|&i| tasks[i].id).collect();

            for (id, slots) in matches {
                if pins.iter().any(|pin| pin.is_locked()) {
                    break;
                }

                let producers = slots.iter().map(|&i| pins[i].clone()).collect();
                created.extend(self.materialize(id, &parents, producers));
            }
        }
    }

    fn match_variadic(&mut self, tasks: &[Arc<TaskNode>], created: &mut Vec<TaskId>) {
        let registry = self.registry;

        if registry.variadic().is_empty() {
            return;
        }

        for task in tasks {
            for pin in task.live_outputs() {
                for &id in registry.variadic() {
                    if pin.is_locked() {
                        break;
                    }

                    let prototype = registry.prototype(id);
                    if !prototype.accepts_variadic(&pin) {
                        continue;
                    }

                    let fence = self.open_fence(id, created);
                    let shadow = Arc::new(Pin::new(fence.id, *pin.spec()));
                    shadow.bind(pin.clone());
                    fence.push_input(shadow);

                    if prototype.exclusive_use() {
                        pin.lock();
                    }

                    task.add_child(fence.id);
                    trace!(fence = %fence.id, producer = %task.id, "fence gathered pin");
                }
            }
        }
    }

    fn match_single(&mut self, tasks: &[Arc<TaskNode>], created: &mut Vec<TaskId>) {
        let registry = self.registry;

        for task in tasks {
            for pin in task.live_outputs() {
                for &id in registry.get(1, Tier::Primary) {
                    if pin.is_locked() {
                        break;
                    }

                    if registry.prototype(id).inputs()[0].accepts(pin.spec()) {
                        created.extend(self.materialize(id, &[task.id], vec![pin.clone()]));
                    }
                }
            }
        }
    }

    /// The fence currently gathering pins for variadic prototype `id`,
    /// created if the previous one already started running.
    fn open_fence(&mut self, id: PrototypeId, created: &mut Vec<TaskId>) -> Arc<TaskNode> {
        if let Some(&task) = self.fences.get(&id)
            && let Some(node) = self.arena.get(task)
            && node.is_open()
        {
            return node;
        }

        let node = self.spawn(id);
        self.fences.insert(id, node.id);
        created.push(node.id);
        node
    }

    /// Creates an instance of Primary prototype `id` fed by `producers`
    /// (ordered by input slot), with any Before/After adapters spliced
    /// around it.
    fn materialize(
        &mut self,
        id: PrototypeId,
        parents: &[TaskId],
        producers: Vec<Arc<Pin>>,
    ) -> Vec<TaskId> {
        let prototype = self.registry.prototype(id).clone();
        let mut created = Vec::new();
        let mut feeders = parents.to_vec();
        let mut sources = producers;

        if let Some((before_id, before_slots, primary_slots)) = self.find_before(id, &sources) {
            let before = self.spawn(before_id);
            let consumed: Vec<_> = before_slots.iter().map(|&i| sources[i].clone()).collect();
            bind(&before, &consumed, true);
            self.adopt(&feeders, before.id);

            let outputs = before.outputs();
            sources = primary_slots.iter().map(|&i| outputs[i].clone()).collect();
            for pin in &sources {
                pin.lock();
            }

            feeders = vec![before.id];
            created.push(before.id);
        }

        let primary = self.spawn(id);
        bind(&primary, &sources, prototype.exclusive_use());
        self.adopt(&feeders, primary.id);
        created.push(primary.id);

        if let Some((after_id, after_slots)) = self.find_after(id) {
            let after = self.spawn(after_id);
            let outputs = primary.outputs();
            let consumed: Vec<_> = after_slots.iter().map(|&i| outputs[i].clone()).collect();
            bind(&after, &consumed, true);
            primary.add_child(after.id);
            created.push(after.id);
        }

        created
    }

    /// First Before adapter that takes the producer pins and produces what
    /// the primary `id` expects.
    fn find_before(
        &self,
        id: PrototypeId,
        sources: &[Arc<Pin>],
    ) -> Option<(PrototypeId, Vec<usize>, Vec<usize>)> {
        let specs: Vec<PinSpec> = sources.iter().map(|pin| *pin.spec()).collect();
        let primary = self.registry.prototype(id);

        self.registry
            .get(specs.len(), Tier::Before)
            .iter()
            .find_map(|&before| {
                let adapter = self.registry.prototype(before);
                let inputs = assign(adapter.inputs(), &specs)?;
                let outputs = assign(primary.inputs(), adapter.outputs())?;
                Some((before, inputs, outputs))
            })
    }

    /// First After adapter that takes every declared output of `id`.
    fn find_after(&self, id: PrototypeId) -> Option<(PrototypeId, Vec<usize>)> {
        let outputs = self.registry.prototype(id).outputs();

        if outputs.is_empty() {
            return None;
        }

        self.registry
            .get(outputs.len(), Tier::After)
            .iter()
            .find_map(|&after| {
                assign(self.registry.prototype(after).inputs(), outputs).map(|slots| (after, slots))
            })
    }

    fn spawn(&self, id: PrototypeId) -> Arc<TaskNode> {
        let prototype = self.registry.prototype(id);

        let node = self.arena.insert(|task| {
            TaskNode::new(
                task,
                prototype.tier(),
                Some(id),
                prototype.instantiate(),
                prototype.inputs(),
                prototype.outputs(),
                prototype.is_variadic(),
            )
        });

        trace!(task = %node.id, name = %node.name(), tier = %node.tier, "created task");
        node
    }

    fn adopt(&self, parents: &[TaskId], child: TaskId) {
        for parent in parents.iter().filter_map(|&id| self.arena.get(id)) {
            parent.add_child(child);
        }
    }
}

/// Binds the fixed inputs of `node` to `sources`, slot by slot.
///
/// # Panics
/// A node whose input count differs from its match is a broken prototype.
fn bind(node: &TaskNode, sources: &[Arc<Pin>], lock: bool) {
    let inputs = node.inputs();

    assert_eq!(
        inputs.len(),
        sources.len(),
        "task {} ({}) declares {} inputs but was matched with {} pins",
        node.id,
        node.name(),
        inputs.len(),
        sources.len()
    );

    for (input, source) in inputs.iter().zip(sources) {
        input.bind(source.clone());
        if lock {
            source.lock();
        }
    }
}

/// All `k`-element subsets of `0..n`, in lexicographic order.
pub(crate) fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut acc = Vec::new();

    if k == 0 || k > n {
        return acc;
    }

    let mut combo: Vec<usize> = (0..k).collect();

    loop {
        acc.push(combo.clone());

        let mut i = k;
        while i > 0 && combo[i - 1] == i - 1 + n - k {
            i -= 1;
        }

        if i == 0 {
            return acc;
        }

        combo[i - 1] += 1;
        for j in i..k {
            combo[j] = combo[j - 1] + 1;
        }
    }
}
