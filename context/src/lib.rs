/*!
An observable value with an equality-gated accessor.

# Pieces
- [`Emitter`] - one value plus an ordered list of listeners, notified synchronously on every write
- [`Accessor`] - get/set/on/off over an emitter. `set` only stores and notifies when the
  new value is not equal to the current one, and can transform what gets stored
- [`Extended`] - an accessor with extra operations composed on at construction
- [`Provider`] / [`Consumer`] - the state a UI provider/consumer pair keeps, without the UI

# Nomenclature
- fn on - registers a listener and returns its [`SubscriptionId`]; pass it to `off` to remove it
- fn subscribe - same, but returns a [`ListenerGuard`] that removes the listener when dropped

# Basic usage

```rust
use signal_context::*;
use std::sync::{Arc, Mutex};

let count = Accessor::new(0);
let seen = Arc::new(Mutex::new(Vec::new()));
let id = {
    let seen = seen.clone();
    count.on(move |value: &i32| seen.lock().unwrap().push(*value))
};

assert!(!count.set(0)); // equal to the current value, nobody is notified
assert!(count.set(5));
count.off(id);
count.set(6);

assert_eq!(*seen.lock().unwrap(), vec![5]);
assert_eq!(count.get(), 6);
```

# Gating and transforming

```rust
use signal_context::*;

// every accepted write bumps the counter by one, whatever was written
let ticks = Accessor::builder(0).transform(|_new, old: &i32| old + 1).build();
ticks.set(100);
ticks.set(7);
assert_eq!(ticks.get(), 2);
assert!(!ticks.set(2)); // equal, so no tick
```

# Listener faults

By default a panicking listener is caught and logged and the remaining listeners still
run ([`FaultPolicy::Isolate`]). Use [`FaultPolicy::Propagate`] to let the panic reach the
caller of `set` instead.
*/

mod accessor;
mod component;
mod emitter;
mod error;
mod extend;
mod listener;

pub use accessor::*;
pub use component::*;
pub use emitter::*;
pub use error::*;
pub use extend::*;
pub use listener::*;
