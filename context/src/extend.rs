use std::ops::Deref;
use std::sync::Arc;

use crate::{
    accessor::Accessor,
    emitter::{EmitterId, ListenerGuard},
    error::Error,
    listener::{IntoListener, Listener, SubscriptionId},
};

/// An accessor together with extra operations composed on top of it.
///
/// The extension is built once by [`AccessorBuilder::build_extended`](crate::AccessorBuilder::build_extended)
/// from a handle to the accessor, and is reached through `Deref`. The core
/// surface (`get`, `set`, `on`, ...) is inherent on `Extended`, so it always wins
/// method resolution; an extension method with a colliding name stays reachable
/// through [`Extended::extension`].
///
/// ```rust
/// use signal_context::{Accessor, Extended};
///
/// struct Doubling(Accessor<i32>);
/// impl Doubling {
///     fn double(&self) -> i32 { self.0.get() * 2 }
/// }
///
/// let value: Extended<i32, Doubling> = Accessor::builder(3).build_extended(|a| Doubling(a.clone()));
/// assert_eq!(value.double(), 6);
/// value.set(10);
/// assert_eq!(value.double(), 20);
/// ```
pub struct Extended<T, X> {
    accessor: Accessor<T>,
    extension: X,
}

impl<T, X: Clone> Clone for Extended<T, X> {
    fn clone(&self) -> Self { Self { accessor: self.accessor.clone(), extension: self.extension.clone() } }
}

impl<T, X: std::fmt::Debug> std::fmt::Debug for Extended<T, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extended").field("accessor", &self.accessor).field("extension", &self.extension).finish()
    }
}

impl<T, X> Extended<T, X> {
    pub(crate) fn new(accessor: Accessor<T>, extend: impl FnOnce(&Accessor<T>) -> X) -> Self {
        let extension = extend(&accessor);
        Self { accessor, extension }
    }

    pub fn accessor(&self) -> &Accessor<T> { &self.accessor }

    pub fn extension(&self) -> &X { &self.extension }

    pub fn into_parts(self) -> (Accessor<T>, X) { (self.accessor, self.extension) }

    pub fn set(&self, new_value: T) -> bool { self.accessor.set(new_value) }

    pub fn try_set(&self, new_value: T) -> Result<bool, Error> { self.accessor.try_set(new_value) }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R { self.accessor.with(f) }

    pub fn snapshot(&self) -> Arc<T> { self.accessor.snapshot() }

    pub fn on<L>(&self, listener: L) -> SubscriptionId
    where L: IntoListener<T> {
        self.accessor.on(listener)
    }

    pub fn off(&self, id: SubscriptionId) { self.accessor.off(id) }

    pub fn off_listener(&self, listener: &Listener<T>) { self.accessor.off_listener(listener) }

    pub fn subscribe<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoListener<T> {
        self.accessor.subscribe(listener)
    }

    pub fn id(&self) -> EmitterId { self.accessor.id() }
}

impl<T: Clone, X> Extended<T, X> {
    pub fn get(&self) -> T { self.accessor.get() }
}

impl<T, X> Deref for Extended<T, X> {
    type Target = X;
    fn deref(&self) -> &X { &self.extension }
}
