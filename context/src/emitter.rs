use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::ThreadId;

use tracing::{debug, error, warn};

use crate::{
    error::Error,
    listener::{IntoListener, Listener, SubscriptionId},
};

/// Identity of an emitter, stable for as long as any handle to it is alive.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct EmitterId(usize);

impl std::fmt::Display for EmitterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{:#x}", self.0) }
}

/// What happens when a listener panics during a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Catch the panic, log it and keep notifying the remaining listeners
    #[default]
    Isolate,
    /// Let the panic unwind into the caller of `set`; remaining listeners are skipped
    Propagate,
}

struct GateTable {
    // emitter -> thread running its read-modify-broadcast
    owners: BTreeMap<EmitterId, ThreadId>,
    // thread -> emitter it is blocked on
    waiting: Vec<(ThreadId, EmitterId)>,
}

static GATES: Mutex<GateTable> = Mutex::new(GateTable { owners: BTreeMap::new(), waiting: Vec::new() });
static GATE_RELEASED: Condvar = Condvar::new();

impl GateTable {
    fn waits_for(&self, thread: ThreadId) -> Option<EmitterId> { self.waiting.iter().find(|(t, _)| *t == thread).map(|(_, e)| *e) }

    /// True when `thread` blocking on `emitter` would complete a cycle of
    /// threads each waiting for a gate held by the next.
    fn closes_cycle(&self, thread: ThreadId, emitter: EmitterId) -> bool {
        let mut next = emitter;
        // a thread waits on at most one gate, so no chain is longer than the waiting list
        for _ in 0..=self.waiting.len() {
            let Some(owner) = self.owners.get(&next).copied() else { return false };
            if owner == thread {
                return true;
            }
            match self.waits_for(owner) {
                Some(emitter) => next = emitter,
                None => return false,
            }
        }
        false
    }
}

/// Exclusive right to run one emitter's read-modify-broadcast.
/// Released on drop, including while unwinding out of a listener.
struct Gate(EmitterId);

impl Gate {
    fn acquire(emitter: EmitterId) -> Result<Self, Error> {
        let me = std::thread::current().id();
        let mut table = lock(&GATES);
        loop {
            match table.owners.get(&emitter).copied() {
                None => break,
                Some(owner) if owner == me => return Err(Error::Reentrant { emitter }),
                Some(_) => {
                    if table.closes_cycle(me, emitter) {
                        return Err(Error::Deadlock { emitter });
                    }
                    table.waiting.push((me, emitter));
                    table = GATE_RELEASED.wait(table).unwrap_or_else(PoisonError::into_inner);
                    table.waiting.retain(|(t, _)| *t != me);
                }
            }
        }
        table.owners.insert(emitter, me);
        Ok(Self(emitter))
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        lock(&GATES).owners.remove(&self.0);
        GATE_RELEASED.notify_all();
    }
}

struct Inner<T> {
    value: RwLock<Arc<T>>,
    listeners: RwLock<Vec<(SubscriptionId, Listener<T>)>>,
    next_id: AtomicU64,
    faults: AtomicUsize,
    policy: FaultPolicy,
}

// No lock is held while user code runs; the gate table is only locked briefly.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }
fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> { l.read().unwrap_or_else(PoisonError::into_inner) }
fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> { l.write().unwrap_or_else(PoisonError::into_inner) }

/// Holds one value and an ordered list of listeners, and synchronously
/// notifies every listener, in registration order, each time a value is stored.
///
/// Cloning an `Emitter` yields another handle to the same value and listeners.
pub struct Emitter<T>(Arc<Inner<T>>);

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("id", &self.id())
            .field("listeners", &self.listener_count())
            .field("policy", &self.0.policy)
            .finish()
    }
}

impl<T: Default> Default for Emitter<T> {
    fn default() -> Self { Self::new(T::default()) }
}

impl<T> Emitter<T> {
    pub fn new(value: T) -> Self { Self::with_policy(value, FaultPolicy::default()) }

    pub fn with_policy(value: T, policy: FaultPolicy) -> Self {
        Self(Arc::new(Inner {
            value: RwLock::new(Arc::new(value)),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            faults: AtomicUsize::new(0),
            policy,
        }))
    }

    pub fn id(&self) -> EmitterId { EmitterId(Arc::as_ptr(&self.0) as usize) }

    pub fn policy(&self) -> FaultPolicy { self.0.policy }

    /// The current value, shared with whoever else holds it
    pub fn snapshot(&self) -> Arc<T> { read(&self.0.value).clone() }

    /// Calls a closure with a borrow of the current value.
    /// The closure may freely call back into the emitter.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = self.snapshot();
        f(&*value)
    }

    /// Appends a listener. Registering the same listener twice notifies it twice.
    pub fn on<L>(&self, listener: L) -> SubscriptionId
    where L: IntoListener<T> {
        let id = SubscriptionId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
        write(&self.0.listeners).push((id, listener.into_listener()));
        debug!(emitter = %self.id(), subscription = %id, "listener added");
        id
    }

    /// Like `on`, but the registration is removed when the returned guard is dropped.
    pub fn subscribe<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoListener<T> {
        let id = self.on(listener);
        ListenerGuard { inner: Arc::downgrade(&self.0), id }
    }

    /// Removes one registration. Unknown ids are ignored.
    pub fn off(&self, id: SubscriptionId) { remove(&self.0, id); }

    /// Removes every registration of this exact listener (pointer identity).
    pub fn off_listener(&self, listener: &Listener<T>) {
        let mut listeners = write(&self.0.listeners);
        let before = listeners.len();
        listeners.retain(|(_, l)| !l.ptr_eq(listener));
        let removed = before - listeners.len();
        if removed > 0 {
            debug!(emitter = %self.id(), removed, "listener removed");
        }
    }

    pub fn listener_count(&self) -> usize { read(&self.0.listeners).len() }

    /// Number of listener panics caught under `FaultPolicy::Isolate`
    pub fn fault_count(&self) -> usize { self.0.faults.load(Ordering::Relaxed) }

    /// Stores `value` and notifies every listener.
    ///
    /// Writes to one emitter are serialized for the whole broadcast. A write
    /// that would block forever is dropped and logged instead: one made from
    /// inside this emitter's own broadcast, or one that would complete a cycle
    /// of threads waiting on each other's broadcasts. Use [`Emitter::try_set`]
    /// to observe those cases.
    pub fn set(&self, value: T) {
        if let Err(e) = self.try_set(value) {
            warn!("{e}");
        }
    }

    pub fn try_set(&self, value: T) -> Result<(), Error> { self.try_update(|_| Some(value)).map(|_| ()) }

    /// Read-modify-broadcast. `f` sees the current value and returns the value to
    /// store, or `None` to leave it untouched without notifying anyone.
    /// Returns whether a value was stored.
    pub fn update(&self, f: impl FnOnce(&T) -> Option<T>) -> bool {
        match self.try_update(f) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    pub fn try_update(&self, f: impl FnOnce(&T) -> Option<T>) -> Result<bool, Error> {
        let _gate = Gate::acquire(self.id())?;

        let next = {
            let current = self.snapshot();
            match f(&*current) {
                Some(next) => Arc::new(next),
                None => return Ok(false),
            }
        };
        *write(&self.0.value) = next.clone();
        self.broadcast(&next);
        Ok(true)
    }

    /// Notifies the listeners registered at the time of the call.
    /// Listeners added or removed by a listener take effect on the next broadcast.
    fn broadcast(&self, value: &T) {
        let listeners = read(&self.0.listeners).clone();
        debug!(emitter = %self.id(), listeners = listeners.len(), "broadcast");

        for (id, listener) in listeners {
            match self.0.policy {
                FaultPolicy::Propagate => listener.call(value),
                FaultPolicy::Isolate => {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.call(value))) {
                        self.0.faults.fetch_add(1, Ordering::Relaxed);
                        let fault = Error::ListenerPanicked { emitter: self.id(), subscription: id, message: panic_message(&*payload) };
                        error!("{fault}");
                    }
                }
            }
        }
    }
}

impl<T: Clone> Emitter<T> {
    /// Returns a clone of the current value
    pub fn get(&self) -> T { (*self.snapshot()).clone() }
}

fn remove<T>(inner: &Inner<T>, id: SubscriptionId) {
    let mut listeners = write(&inner.listeners);
    if let Some(pos) = listeners.iter().position(|(i, _)| *i == id) {
        listeners.remove(pos);
        debug!(subscription = %id, "listener removed");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Removes its registration when dropped. Does not keep the emitter alive.
pub struct ListenerGuard<T> {
    inner: Weak<Inner<T>>,
    id: SubscriptionId,
}

impl<T> ListenerGuard<T> {
    pub fn id(&self) -> SubscriptionId { self.id }

    /// The emitter this guard is registered on. The address stays reserved
    /// while the guard holds its weak reference, so the id cannot be reused.
    pub fn emitter_id(&self) -> EmitterId { EmitterId(self.inner.as_ptr() as usize) }
}

impl<T> std::fmt::Debug for ListenerGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard").field("emitter", &self.emitter_id()).field("id", &self.id).finish()
    }
}

impl<T> Drop for ListenerGuard<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            remove(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |v: &T| seen.lock().unwrap().push(v.clone())
        };
        (seen, sink)
    }

    #[test]
    fn test_set_then_get() {
        let emitter = Emitter::new(1);
        emitter.set(2);
        assert_eq!(emitter.get(), 2);
        emitter.set(2);
        assert_eq!(emitter.get(), 2);
    }

    #[test]
    fn test_set_notifies_even_when_unchanged() {
        let emitter = Emitter::new(7);
        let (seen, sink) = recorder::<i32>();
        emitter.on(sink);

        emitter.set(7);
        emitter.set(7);
        assert_eq!(*seen.lock().unwrap(), vec![7, 7]);
    }

    #[test]
    fn test_registration_order() {
        let emitter = Emitter::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            emitter.on(move |v: &i32| order.lock().unwrap().push(format!("{tag}{v}")));
        }

        emitter.set(1);
        assert_eq!(*order.lock().unwrap(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_off_removes_one_registration() {
        let emitter = Emitter::new(0);
        let (seen, sink) = recorder::<i32>();
        let listener = Listener::new(sink);
        let first = emitter.on(listener.clone());
        let _second = emitter.on(listener.clone());

        emitter.set(1);
        assert_eq!(*seen.lock().unwrap(), vec![1, 1]);

        emitter.off(first);
        emitter.set(2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 1, 2]);

        // already gone
        emitter.off(first);
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_off_listener_removes_all_duplicates() {
        let emitter = Emitter::new(0);
        let (seen, sink) = recorder::<i32>();
        let listener = Listener::new(sink);
        emitter.on(listener.clone());
        emitter.on(listener.clone());
        let other = emitter.on(|_: &i32| {});

        emitter.off_listener(&listener);
        assert_eq!(emitter.listener_count(), 1);
        emitter.set(3);
        assert!(seen.lock().unwrap().is_empty());

        // not registered anymore, still fine
        emitter.off_listener(&listener);
        emitter.off(other);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_guard_drop_unsubscribes() {
        let emitter = Emitter::new(0);
        let (seen, sink) = recorder::<i32>();
        let guard = emitter.subscribe(sink);
        assert_eq!(guard.emitter_id(), emitter.id());

        emitter.set(1);
        drop(guard);
        emitter.set(2);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_guard_outlives_emitter() {
        let emitter = Emitter::new(0);
        let guard = emitter.subscribe(|_: &i32| {});
        drop(emitter);
        drop(guard);
    }

    #[test]
    fn test_reentrant_subscription_during_broadcast() {
        let emitter = Emitter::new(0);
        let calls = Arc::new(AtomicUsize::new(0));

        let _guard = {
            let emitter2 = emitter.clone();
            let calls = calls.clone();
            emitter.subscribe(move |_: &i32| {
                calls.fetch_add(1, Ordering::SeqCst);
                // registering and dropping inside a callback must not deadlock
                let _temp = emitter2.subscribe(|_: &i32| {});
                assert_eq!(emitter2.listener_count(), 2);
            })
        };

        emitter.set(1);
        emitter.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_listener_can_read_during_broadcast() {
        let emitter = Emitter::new(String::from("a"));
        let (seen, sink) = recorder::<String>();
        let _guard = {
            let emitter2 = emitter.clone();
            emitter.subscribe(move |v: &String| {
                assert_eq!(&emitter2.get(), v);
                sink(v)
            })
        };
        emitter.set("b".into());
        assert_eq!(*seen.lock().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_reentrant_set_is_rejected() {
        let emitter = Emitter::new(0);
        let results = Arc::new(Mutex::new(Vec::new()));
        {
            let emitter2 = emitter.clone();
            let results = results.clone();
            emitter.on(move |v: &i32| results.lock().unwrap().push(emitter2.try_set(v + 100)));
        }

        emitter.set(1);
        assert_eq!(*results.lock().unwrap(), vec![Err(Error::Reentrant { emitter: emitter.id() })]);
        assert_eq!(emitter.get(), 1);

        // the scope was released, so a later top-level write works
        emitter.set(2);
        assert_eq!(emitter.get(), 2);
    }

    #[test]
    fn test_nested_emitters_may_write_each_other() {
        let upstream = Emitter::new(0);
        let downstream = Emitter::new(0);
        {
            let downstream = downstream.clone();
            upstream.on(move |v: &i32| downstream.set(v * 10));
        }
        upstream.set(4);
        assert_eq!(downstream.get(), 40);
    }

    #[test]
    fn test_cross_thread_write_cycle_is_broken() {
        let a = Emitter::new(0);
        let b = Emitter::new(0);
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        for (source, target, trigger) in [(a.clone(), b.clone(), 1), (b.clone(), a.clone(), 2)] {
            let barrier = barrier.clone();
            let outcomes = outcomes.clone();
            source.on(move |v: &i32| {
                if *v == trigger {
                    // both broadcasts are in flight before either writes across
                    barrier.wait();
                    outcomes.lock().unwrap().push(target.try_set(v * 100));
                }
            });
        }

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        for (emitter, value) in [(a.clone(), 1), (b.clone(), 2)] {
            let done_tx = done_tx.clone();
            std::thread::spawn(move || {
                emitter.set(value);
                let _ = done_tx.send(());
            });
        }
        for _ in 0..2 {
            assert!(done_rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok(), "writers did not finish");
        }

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes.iter().filter(|o| matches!(o, Err(Error::Deadlock { .. }))).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        // the surviving cross write landed
        assert!(a.get() == 200 || b.get() == 100);
    }

    #[test]
    fn test_contended_writes_wait_for_the_gate() {
        let emitter = Emitter::new(0usize);
        let in_flight = Arc::new(AtomicUsize::new(0));
        {
            let in_flight = in_flight.clone();
            emitter.on(move |_: &usize| {
                // no two broadcasts overlap
                assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                std::thread::sleep(std::time::Duration::from_millis(2));
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }

        let writers: Vec<_> = (1..=4)
            .map(|n| {
                let emitter = emitter.clone();
                std::thread::spawn(move || emitter.try_set(n))
            })
            .collect();
        for writer in writers {
            assert_eq!(writer.join().unwrap(), Ok(()));
        }
        assert_eq!(emitter.fault_count(), 0);
    }

    #[test]
    fn test_isolated_panic_continues_delivery() {
        let emitter = Emitter::new(0);
        let (seen, sink) = recorder::<i32>();
        emitter.on(|v: &i32| {
            if *v == 1 {
                panic!("boom");
            }
        });
        emitter.on(sink);

        emitter.set(1);
        emitter.set(2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(emitter.get(), 2);
        assert_eq!(emitter.fault_count(), 1);
    }

    #[test]
    fn test_propagated_panic_stops_delivery() {
        let emitter = Emitter::with_policy(0, FaultPolicy::Propagate);
        let (seen, sink) = recorder::<i32>();
        emitter.on(|_: &i32| panic!("boom"));
        emitter.on(sink);

        let result = catch_unwind(AssertUnwindSafe(|| emitter.set(1)));
        assert!(result.is_err());
        assert!(seen.lock().unwrap().is_empty());
        // value was stored before delivery started
        assert_eq!(emitter.get(), 1);
        assert_eq!(emitter.fault_count(), 0);

        // the gate was released while unwinding, the emitter keeps working
        let result = catch_unwind(AssertUnwindSafe(|| emitter.set(2)));
        assert!(result.is_err());
        assert_eq!(emitter.get(), 2);
    }

    #[test]
    fn test_update_none_skips_broadcast() {
        let emitter = Emitter::new(5);
        let (seen, sink) = recorder::<i32>();
        emitter.on(sink);

        assert!(!emitter.update(|_| None));
        assert!(emitter.update(|v| Some(v + 1)));
        assert_eq!(*seen.lock().unwrap(), vec![6]);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }
}
