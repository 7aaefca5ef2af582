//! Headless provider/consumer pair.
//!
//! These keep the state a UI component tree would keep around an [`Accessor`],
//! without depending on any toolkit: the host calls `receive` when the provider's
//! upstream value changes, and `mount` / `render` / `unmount` on the consumer
//! from its own lifecycle.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::{accessor::Accessor, emitter::ListenerGuard};

/// Pushes upstream values into an accessor.
#[derive(Debug)]
pub struct Provider<T> {
    accessor: Accessor<T>,
}

impl<T> Clone for Provider<T> {
    fn clone(&self) -> Self { Self { accessor: self.accessor.clone() } }
}

impl<T> Provider<T> {
    pub fn new(accessor: &Accessor<T>) -> Self { Self { accessor: accessor.clone() } }

    /// Called with each new upstream value. Returns false when the accessor
    /// considered it equal to the current one, so downstream work can be skipped.
    pub fn receive(&self, value: T) -> bool { self.accessor.set(value) }

    pub fn accessor(&self) -> &Accessor<T> { &self.accessor }
}

struct ConsumerState<T> {
    value: Arc<T>,
    changed: bool,
}

/// Tracks the latest value of an accessor between renders.
///
/// Starts out `changed` so the first render is always treated as new.
pub struct Consumer<T> {
    accessor: Accessor<T>,
    state: Arc<Mutex<ConsumerState<T>>>,
    on_change: Option<Arc<dyn Fn() + Send + Sync + 'static>>,
    guard: Option<ListenerGuard<T>>,
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").field("accessor", &self.accessor).field("mounted", &self.is_mounted()).finish()
    }
}

impl<T> Consumer<T> {
    pub fn is_mounted(&self) -> bool { self.guard.is_some() }
}

impl<T> Consumer<T>
where T: Send + Sync + 'static
{
    pub fn new(accessor: &Accessor<T>) -> Self {
        let state = ConsumerState { value: accessor.snapshot(), changed: true };
        Self { accessor: accessor.clone(), state: Arc::new(Mutex::new(state)), on_change: None, guard: None }
    }

    /// Called after every accepted update while mounted, typically to request a re-render.
    pub fn on_change<F>(mut self, on_change: F) -> Self
    where F: Fn() + Send + Sync + 'static {
        self.on_change = Some(Arc::new(on_change));
        self
    }

    /// Starts listening. Mounting an already mounted consumer does nothing.
    pub fn mount(&mut self) {
        if self.guard.is_some() {
            return;
        }
        let state = self.state.clone();
        let source = self.accessor.clone();
        let on_change = self.on_change.clone();
        let guard = self.accessor.subscribe(move |_: &T| {
            {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                // writes are serialized for the whole broadcast, so this is the value being delivered
                state.value = source.snapshot();
                state.changed = true;
            }
            if let Some(on_change) = &on_change {
                on_change();
            }
        });
        debug!(emitter = %self.accessor.id(), subscription = %guard.id(), "consumer mounted");
        self.guard = Some(guard);
    }

    /// Stops listening; the last received value is kept.
    pub fn unmount(&mut self) {
        if let Some(guard) = self.guard.take() {
            debug!(emitter = %self.accessor.id(), subscription = %guard.id(), "consumer unmounted");
        }
    }

    /// Calls `f` with the latest value and whether it changed since the previous render.
    pub fn render<R>(&self, f: impl FnOnce(&T, bool) -> R) -> R {
        let (value, changed) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = std::mem::replace(&mut state.changed, false);
            (state.value.clone(), changed)
        };
        f(&*value, changed)
    }
}
