use std::sync::Arc;

/// Identifies one registration on an emitter. Returned by `on` and accepted by `off`.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

/// A shareable callback that receives a borrow of each accepted value.
///
/// Cloning a listener yields the same callback, so registering a clone twice
/// produces two registrations that `Emitter::off_listener` removes together.
pub struct Listener<T>(Arc<dyn Fn(&T) + Send + Sync + 'static>);

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> std::fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Listener").field(&Arc::as_ptr(&self.0).cast::<()>()).finish()
    }
}

impl<T> Listener<T> {
    pub fn new<F>(f: F) -> Self
    where F: Fn(&T) + Send + Sync + 'static {
        Self(Arc::new(f))
    }

    /// True when both listeners wrap the same callback allocation
    pub fn ptr_eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }

    pub(crate) fn call(&self, value: &T) { (self.0)(value) }
}

/// Trait for types that can be registered on an emitter.
pub trait IntoListener<T> {
    fn into_listener(self) -> Listener<T>;
}

impl<F, T> IntoListener<T> for F
where F: Fn(&T) + Send + Sync + 'static
{
    fn into_listener(self) -> Listener<T> { Listener::new(self) }
}

impl<T> IntoListener<T> for Listener<T> {
    fn into_listener(self) -> Listener<T> { self }
}

impl<T> IntoListener<T> for Arc<dyn Fn(&T) + Send + Sync + 'static> {
    fn into_listener(self) -> Listener<T> { Listener(self) }
}

impl<T> IntoListener<T> for std::sync::mpsc::Sender<T>
where T: Clone + Send + 'static
{
    fn into_listener(self) -> Listener<T> {
        // std Sender is Sync since 1.72
        Listener::new(move |value: &T| {
            let _ = self.send(value.clone()); // receiver gone is not our problem
        })
    }
}

#[cfg(feature = "tokio")]
impl<T> IntoListener<T> for tokio::sync::mpsc::UnboundedSender<T>
where T: Clone + Send + 'static
{
    fn into_listener(self) -> Listener<T> {
        Listener::new(move |value: &T| {
            let _ = self.send(value.clone());
        })
    }
}
