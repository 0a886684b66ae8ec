//! Typed, single-assignment data slots connecting producers to consumers.
//!
//! A [`PinSpec`] is the static description of a slot (type plus optional
//! tag set), used in prototype signatures. A [`Pin`] is a live slot owned by
//! one task instance in the arena.

use std::any::Any;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::{DataType, Dynamic, Flags};
use crate::engine::TaskId;
use crate::error::PinError;

/// How a pin participates in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    /// Matches on type alone.
    Plain,
    /// Carries a tag; matching still only looks at the type.
    Flagged(Flags),
    /// Accepts only flagged candidates whose tags are a superset of these.
    Exclusive(Flags),
}

/// Static description of a pin: declared type plus matching behaviour.
///
/// Equality and hashing look at `(data_type, flags)` only, so two specs
/// that differ just in being flagged or exclusive over the same tags are
/// interchangeable as signature keys.
#[derive(Debug, Clone, Copy)]
pub struct PinSpec {
    pub data_type: DataType,
    pub kind: PinKind,
}

impl PinSpec {
    pub fn plain<T: Any>() -> Self {
        Self {
            data_type: DataType::of::<T>(),
            kind: PinKind::Plain,
        }
    }

    pub fn flagged<T: Any>(flags: Flags) -> Self {
        Self {
            data_type: DataType::of::<T>(),
            kind: PinKind::Flagged(flags),
        }
    }

    pub fn exclusive<T: Any>(flags: Flags) -> Self {
        Self {
            data_type: DataType::of::<T>(),
            kind: PinKind::Exclusive(flags),
        }
    }

    /// Untyped slot that takes whatever it is offered.
    pub fn any() -> Self {
        Self {
            data_type: DataType::any(),
            kind: PinKind::Plain,
        }
    }

    /// Tags carried by the pin, `None` for plain pins.
    pub fn flags(&self) -> Option<Flags> {
        match self.kind {
            PinKind::Plain => None,
            PinKind::Flagged(flags) | PinKind::Exclusive(flags) => Some(flags),
        }
    }

    /// Whether `candidate`, an output pin, may feed a slot described by
    /// `self`.
    pub fn accepts(&self, candidate: &PinSpec) -> bool {
        let typed = self.data_type.is_assignable_from(&candidate.data_type);
        match self.kind {
            PinKind::Plain | PinKind::Flagged(_) => typed,
            PinKind::Exclusive(required) => {
                typed && candidate.flags().is_some_and(|tags| tags.contains(required))
            }
        }
    }
}

impl PartialEq for PinSpec {
    fn eq(&self, other: &Self) -> bool {
        self.data_type == other.data_type && self.flags() == other.flags()
    }
}

impl Eq for PinSpec {}

impl Hash for PinSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data_type.hash(state);
        self.flags().hash(state);
    }
}

/// A live data slot owned by exactly one task.
///
/// The payload is written at most once; `has_data` is derived from that
/// write and only reset by [`Pin::dispose`].
pub struct Pin {
    owner: TaskId,
    spec: PinSpec,
    data: RwLock<Option<Dynamic>>,
    parent: RwLock<Option<Arc<Pin>>>,
    has_data: AtomicBool,
    disposed: AtomicBool,
    locked: AtomicBool,
}

impl Pin {
    pub(crate) fn new(owner: TaskId, spec: PinSpec) -> Self {
        Self {
            owner,
            spec,
            data: RwLock::new(None),
            parent: RwLock::new(None),
            has_data: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            locked: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> TaskId {
        self.owner
    }

    pub fn spec(&self) -> &PinSpec {
        &self.spec
    }

    pub fn data_type(&self) -> DataType {
        self.spec.data_type
    }

    pub fn flags(&self) -> Option<Flags> {
        self.spec.flags()
    }

    pub fn has_data(&self) -> bool {
        self.has_data.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Set once a prototype demanding exclusive use has bound this pin.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn accepts(&self, candidate: &Pin) -> bool {
        self.spec.accepts(&candidate.spec)
    }

    /// Current payload, type-erased.
    pub fn data(&self) -> Option<Dynamic> {
        if !self.has_data() {
            return None;
        }
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current payload, downcast to `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data().and_then(|data| data.downcast::<T>().ok())
    }

    /// Writes the payload. Only the first write succeeds.
    pub(crate) fn set(&self, value: Dynamic) -> Result<(), PinError> {
        let mut slot = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if self.has_data() || self.is_disposed() {
            return Err(PinError::AlreadySet);
        }
        *slot = Some(value);
        self.has_data.store(true, Ordering::Release);
        Ok(())
    }

    /// Typed write, checked against the declared type.
    pub(crate) fn set_value<T: Any + Send + Sync>(&self, value: T) -> Result<(), PinError> {
        let found = DataType::of::<T>();
        if !self.spec.data_type.is_assignable_from(&found) {
            return Err(PinError::TypeMismatch {
                expected: self.spec.data_type.name(),
                found: found.name(),
            });
        }
        self.set(Arc::new(value))
    }

    /// The upstream pin this one reads from.
    pub fn parent(&self) -> Option<Arc<Pin>> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connects this input pin to an upstream output pin.
    ///
    /// # Panics
    /// Rebinding a pin that its owner already consumed corrupts the graph and
    /// aborts.
    pub(crate) fn bind(&self, parent: Arc<Pin>) {
        assert!(
            !self.has_data(),
            "pin of {} rebound after its payload was loaded",
            self.owner
        );
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = Some(parent);
    }

    /// Marks the pin as exclusively consumed. Returns `false` if it already
    /// was.
    pub(crate) fn lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Copies the parent's payload into this pin. Unbound pins and parents
    /// without data are left alone.
    pub(crate) fn load(&self) -> bool {
        let Some(parent) = self.parent() else {
            return false;
        };
        match parent.data() {
            Some(data) => self.set(data).is_ok(),
            None => false,
        }
    }

    /// Drops payload and parent. A disposed pin never carries data again.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.has_data.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pin")
            .field("owner", &self.owner)
            .field("type", &self.spec.data_type.short_name())
            .field("flags", &self.spec.flags())
            .field("has_data", &self.has_data())
            .field("disposed", &self.is_disposed())
            .field("locked", &self.is_locked())
            .finish()
    }
}
