use std::sync::Arc;

use tracing::{trace, warn};

use crate::{
    emitter::{Emitter, EmitterId, FaultPolicy, ListenerGuard},
    error::Error,
    extend::Extended,
    listener::{IntoListener, Listener, SubscriptionId},
};

type IsEqual<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync + 'static>;
type Transform<T> = Arc<dyn Fn(T, &T) -> T + Send + Sync + 'static>;

/// The read/write/subscribe surface over an [`Emitter`].
///
/// Writes go through an equality gate: `set(new)` only stores and notifies when
/// `is_equal(&new, &current)` is false, and what gets stored is
/// `transform(new, &current)`. Both are fixed when the accessor is built.
///
/// ```rust
/// use signal_context::Accessor;
///
/// let count = Accessor::new(0);
/// assert!(!count.set(0)); // equal, nothing happens
/// assert!(count.set(5));
/// assert_eq!(count.get(), 5);
/// ```
pub struct Accessor<T> {
    emitter: Emitter<T>,
    is_equal: IsEqual<T>,
    // None is the identity transform
    transform: Option<Transform<T>>,
}

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self { Self { emitter: self.emitter.clone(), is_equal: self.is_equal.clone(), transform: self.transform.clone() } }
}

impl<T> std::fmt::Debug for Accessor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accessor").field("emitter", &self.emitter).field("transform", &self.transform.is_some()).finish()
    }
}

impl<T> Accessor<T>
where T: PartialEq + Send + Sync + 'static
{
    /// Accessor with `PartialEq` gating and no transform
    pub fn new(default: T) -> Self { Self::builder(default).build() }

    pub fn builder(default: T) -> AccessorBuilder<T> { AccessorBuilder::new(default, Arc::new(|new: &T, old: &T| new == old)) }
}

impl<T> Accessor<T> {
    /// Builder for value types without `PartialEq`, or that want a different notion of equality
    pub fn builder_with<F>(default: T, is_equal: F) -> AccessorBuilder<T>
    where F: Fn(&T, &T) -> bool + Send + Sync + 'static {
        AccessorBuilder::new(default, Arc::new(is_equal))
    }

    /// Writes `new_value` unless it is equal to the current value.
    /// Returns true when a value was stored and listeners were notified.
    ///
    /// A write that cannot be carried out without blocking forever (a different
    /// value written from one of this accessor's own listeners, or a write that
    /// would deadlock with another thread's broadcast) is rejected, logged, and
    /// reported as false.
    pub fn set(&self, new_value: T) -> bool {
        match self.try_set(new_value) {
            Ok(changed) => changed,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    /// `is_equal` is checked once before waiting for the write gate, so a write
    /// of the current value is a plain no-op even from inside a broadcast, and
    /// again under the gate in case another thread got there first.
    pub fn try_set(&self, new_value: T) -> Result<bool, Error> {
        if self.emitter.with(|old| (self.is_equal)(&new_value, old)) {
            trace!(emitter = %self.emitter.id(), "equal value, skipped");
            return Ok(false);
        }
        let changed = self.emitter.try_update(|old| {
            if (self.is_equal)(&new_value, old) {
                return None;
            }
            Some(match &self.transform {
                Some(transform) => transform(new_value, old),
                None => new_value,
            })
        })?;
        if !changed {
            trace!(emitter = %self.emitter.id(), "equal value, skipped");
        }
        Ok(changed)
    }

    /// Calls a closure with a borrow of the current value
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R { self.emitter.with(f) }

    pub fn snapshot(&self) -> Arc<T> { self.emitter.snapshot() }

    pub fn on<L>(&self, listener: L) -> SubscriptionId
    where L: IntoListener<T> {
        self.emitter.on(listener)
    }

    pub fn off(&self, id: SubscriptionId) { self.emitter.off(id) }

    pub fn off_listener(&self, listener: &Listener<T>) { self.emitter.off_listener(listener) }

    pub fn subscribe<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoListener<T> {
        self.emitter.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize { self.emitter.listener_count() }

    pub fn id(&self) -> EmitterId { self.emitter.id() }

    /// The underlying emitter. Writing to it directly bypasses the equality gate and transform.
    pub fn emitter(&self) -> &Emitter<T> { &self.emitter }
}

impl<T: Clone> Accessor<T> {
    pub fn get(&self) -> T { self.emitter.get() }
}

/// Resolves the accessor options once; anything not set keeps its default.
pub struct AccessorBuilder<T> {
    default: T,
    is_equal: IsEqual<T>,
    transform: Option<Transform<T>>,
    policy: FaultPolicy,
}

impl<T> AccessorBuilder<T> {
    fn new(default: T, is_equal: IsEqual<T>) -> Self { Self { default, is_equal, transform: None, policy: FaultPolicy::default() } }

    /// Decides whether `(new, old)` count as the same value. Equal writes are skipped.
    pub fn is_equal<F>(mut self, is_equal: F) -> Self
    where F: Fn(&T, &T) -> bool + Send + Sync + 'static {
        self.is_equal = Arc::new(is_equal);
        self
    }

    /// Maps `(new, old)` to the value actually stored, after the equality gate passed.
    pub fn transform<F>(mut self, transform: F) -> Self
    where F: Fn(T, &T) -> T + Send + Sync + 'static {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Accessor<T> {
        Accessor { emitter: Emitter::with_policy(self.default, self.policy), is_equal: self.is_equal, transform: self.transform }
    }

    /// Builds the accessor and composes an extension from it. `extend` runs once, here.
    pub fn build_extended<X, F>(self, extend: F) -> Extended<T, X>
    where F: FnOnce(&Accessor<T>) -> X {
        Extended::new(self.build(), extend)
    }
}
