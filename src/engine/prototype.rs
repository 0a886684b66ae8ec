use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::Tier;
use crate::engine::pin::{Pin, PinSpec};
use crate::engine::task::{Task, TaskContext};

/// Blueprint of a task kind, instantiated by graph growth whenever a set of
/// output pins matches its input signature.
pub trait Prototype: Send + Sync {
    fn name(&self) -> Cow<'static, str>;

    /// Disabled prototypes are skipped at registration.
    fn enabled(&self) -> bool {
        true
    }

    fn tier(&self) -> Tier {
        Tier::Primary
    }

    /// Lock every producer pin an instance binds, so no other match can
    /// consume it.
    fn exclusive_use(&self) -> bool {
        false
    }

    fn inputs(&self) -> &[PinSpec];

    fn outputs(&self) -> &[PinSpec];

    fn is_variadic(&self) -> bool {
        false
    }

    /// For variadic prototypes, whether `candidate` should join the fence.
    fn accepts_variadic(&self, _candidate: &Pin) -> bool {
        false
    }

    fn instantiate(&self) -> Box<dyn Task>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrototypeId(usize);

/// Prototypes indexed by input arity and tier.
///
/// Variadic prototypes have no fixed arity and are kept in a separate list.
#[derive(Default)]
pub struct Registry {
    prototypes: Vec<Arc<dyn Prototype>>,
    table: HashMap<(usize, Tier), Vec<PrototypeId>>,
    variadic: Vec<PrototypeId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, prototype: impl Prototype + 'static) -> Option<PrototypeId> {
        self.add_shared(Arc::new(prototype))
    }

    pub fn add_shared(&mut self, prototype: Arc<dyn Prototype>) -> Option<PrototypeId> {
        if !prototype.enabled() {
            debug!(name = %prototype.name(), "skipping disabled prototype");
            return None;
        }

        let id = PrototypeId(self.prototypes.len());

        if prototype.is_variadic() {
            self.variadic.push(id);
        } else {
            self.table
                .entry((prototype.inputs().len(), prototype.tier()))
                .or_default()
                .push(id);
        }

        debug!(
            name = %prototype.name(),
            arity = prototype.inputs().len(),
            tier = %prototype.tier(),
            variadic = prototype.is_variadic(),
            "registered prototype"
        );

        self.prototypes.push(prototype);
        Some(id)
    }

    /// Stops matching a prototype. Instances already created are unaffected.
    pub fn remove(&mut self, id: PrototypeId) {
        for ids in self.table.values_mut() {
            ids.retain(|other| *other != id);
        }
        self.variadic.retain(|other| *other != id);
    }

    /// Prototypes with `arity` inputs in `tier`, in registration order.
    pub fn get(&self, arity: usize, tier: Tier) -> &[PrototypeId] {
        self.table
            .get(&(arity, tier))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn variadic(&self) -> &[PrototypeId] {
        &self.variadic
    }

    /// The prototype behind `id`, `None` for ids of another registry.
    pub fn lookup(&self, id: PrototypeId) -> Option<&Arc<dyn Prototype>> {
        self.prototypes.get(id.0)
    }

    /// Growth only ever holds ids handed out by this registry.
    pub(crate) fn prototype(&self, id: PrototypeId) -> &Arc<dyn Prototype> {
        &self.prototypes[id.0]
    }

    pub fn len(&self) -> usize {
        self.table.values().map(Vec::len).sum::<usize>() + self.variadic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One-to-one assignment of `candidates` to the slots of `signature`.
///
/// Returns, per slot, the index of the candidate bound to it. Both sides must
/// have the same length and every slot must accept its candidate; the order
/// of candidates is irrelevant.
pub(crate) fn assign(signature: &[PinSpec], candidates: &[PinSpec]) -> Option<Vec<usize>> {
    if signature.len() != candidates.len() {
        return None;
    }

    fn search(
        slot: usize,
        signature: &[PinSpec],
        candidates: &[PinSpec],
        used: &mut [bool],
        picked: &mut Vec<usize>,
    ) -> bool {
        if slot == signature.len() {
            return true;
        }

        for (index, candidate) in candidates.iter().enumerate() {
            if used[index] || !signature[slot].accepts(candidate) {
                continue;
            }

            used[index] = true;
            picked.push(index);

            if search(slot + 1, signature, candidates, used, picked) {
                return true;
            }

            picked.pop();
            used[index] = false;
        }

        false
    }

    let mut used = vec![false; candidates.len()];
    let mut picked = Vec::with_capacity(signature.len());

    search(0, signature, candidates, &mut used, &mut picked).then_some(picked)
}

type Callback = dyn Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync;
type Acceptor = dyn Fn(&Pin) -> bool + Send + Sync;

/// Closure-backed prototype builder.
///
/// ```rust
/// use kiln::{Blueprint, PinSpec};
///
/// let double = Blueprint::new("double")
///     .input(PinSpec::plain::<u32>())
///     .output(PinSpec::plain::<u64>())
///     .run(|ctx| {
///         let n = ctx.input::<u32>(0)?;
///         ctx.set_output(0, u64::from(*n) * 2)?;
///         Ok(())
///     });
/// ```
#[derive(Clone)]
pub struct Blueprint {
    name: Cow<'static, str>,
    tier: Tier,
    enabled: bool,
    exclusive: bool,
    quiescent: bool,
    inputs: Vec<PinSpec>,
    outputs: Vec<PinSpec>,
    acceptor: Option<Arc<Acceptor>>,
    callback: Option<Arc<Callback>>,
}

impl Blueprint {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            tier: Tier::Primary,
            enabled: true,
            exclusive: false,
            quiescent: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            acceptor: None,
            callback: None,
        }
    }

    pub fn input(mut self, spec: PinSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    pub fn output(mut self, spec: PinSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Instances wait until they are the only live task.
    pub fn quiescent(mut self) -> Self {
        self.quiescent = true;
        self
    }

    /// Turns the blueprint into a fence gathering every pin `accepts` likes.
    /// Declared inputs are ignored.
    pub fn variadic<F>(mut self, accepts: F) -> Self
    where
        F: Fn(&Pin) -> bool + Send + Sync + 'static,
    {
        self.acceptor = Some(Arc::new(accepts));
        self.inputs.clear();
        self
    }

    pub fn run<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl Prototype for Blueprint {
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn exclusive_use(&self) -> bool {
        self.exclusive
    }

    fn inputs(&self) -> &[PinSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[PinSpec] {
        &self.outputs
    }

    fn is_variadic(&self) -> bool {
        self.acceptor.is_some()
    }

    fn accepts_variadic(&self, candidate: &Pin) -> bool {
        self.acceptor
            .as_ref()
            .is_some_and(|accepts| accepts(candidate))
    }

    fn instantiate(&self) -> Box<dyn Task> {
        Box::new(BlueprintTask {
            name: self.name.clone(),
            quiescent: self.quiescent,
            callback: self.callback.clone(),
        })
    }
}

struct BlueprintTask {
    name: Cow<'static, str>,
    quiescent: bool,
    callback: Option<Arc<Callback>>,
}

impl Task for BlueprintTask {
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
        match &self.callback {
            Some(callback) => callback(ctx),
            None => Ok(()),
        }
    }

    fn awaits_quiescence(&self) -> bool {
        self.quiescent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Flags;

    const A: Flags = Flags::bit(0);
    const B: Flags = Flags::bit(1);

    struct X;
    struct Y;

    #[test]
    fn test_registry_partitions() {
        let mut registry = Registry::new();

        let one = registry.add(Blueprint::new("one").input(PinSpec::plain::<X>()));
        let two = registry.add(
            Blueprint::new("two")
                .input(PinSpec::plain::<X>())
                .input(PinSpec::plain::<Y>()),
        );
        let before = registry.add(
            Blueprint::new("before")
                .input(PinSpec::plain::<X>())
                .tier(Tier::Before),
        );
        let fence = registry.add(Blueprint::new("fence").variadic(|_| true));
        let disabled = registry.add(Blueprint::new("off").enabled(false));

        assert_eq!(registry.get(1, Tier::Primary), &[one.unwrap()]);
        assert_eq!(registry.get(2, Tier::Primary), &[two.unwrap()]);
        assert_eq!(registry.get(1, Tier::Before), &[before.unwrap()]);
        assert_eq!(registry.variadic(), &[fence.unwrap()]);
        assert!(registry.get(3, Tier::Primary).is_empty());
        assert!(disabled.is_none());
        assert_eq!(registry.len(), 4);

        registry.remove(one.unwrap());
        assert!(registry.get(1, Tier::Primary).is_empty());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_lookup_foreign_id() {
        let mut small = Registry::new();
        let mut large = Registry::new();
        small.add(Blueprint::new("a").input(PinSpec::plain::<X>()));
        large.add(Blueprint::new("a").input(PinSpec::plain::<X>()));
        let foreign = large.add(Blueprint::new("b").input(PinSpec::plain::<Y>())).unwrap();

        assert!(small.lookup(foreign).is_none());
        assert_eq!(large.lookup(foreign).unwrap().name(), "b");
    }

    #[test]
    fn test_assign_ignores_order() {
        let signature = [PinSpec::plain::<X>(), PinSpec::plain::<Y>()];
        let candidates = [PinSpec::plain::<Y>(), PinSpec::plain::<X>()];

        assert_eq!(assign(&signature, &candidates), Some(vec![1, 0]));
    }

    #[test]
    fn test_assign_backtracks() {
        // the wildcard slot must not grab the only candidate the typed slot accepts
        let signature = [PinSpec::any(), PinSpec::exclusive::<X>(A | B)];
        let candidates = [PinSpec::flagged::<X>(A | B), PinSpec::plain::<Y>()];

        assert_eq!(assign(&signature, &candidates), Some(vec![1, 0]));
    }

    #[test]
    fn test_assign_rejects() {
        let signature = [PinSpec::exclusive::<X>(A), PinSpec::exclusive::<X>(A)];

        assert!(assign(&signature, &[PinSpec::flagged::<X>(A), PinSpec::flagged::<X>(B)]).is_none());
        assert!(assign(&signature, &[PinSpec::flagged::<X>(A)]).is_none());
        assert!(assign(&signature, &[PinSpec::flagged::<X>(A), PinSpec::flagged::<X>(A)]).is_some());
    }
}
