use thiserror::Error;

use crate::{emitter::EmitterId, listener::SubscriptionId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A listener tried to write to the emitter that is currently broadcasting to it
    #[error("emitter {emitter} was written to from inside its own broadcast")]
    Reentrant { emitter: EmitterId },

    /// Waiting for the emitter would close a cycle of threads blocked on each other's broadcasts
    #[error("write to emitter {emitter} would deadlock with a broadcast on another thread")]
    Deadlock { emitter: EmitterId },

    /// A listener panicked while being notified. Only produced under `FaultPolicy::Isolate`.
    #[error("listener {subscription} of emitter {emitter} panicked: {message}")]
    ListenerPanicked { emitter: EmitterId, subscription: SubscriptionId, message: String },
}
