//! Typed event enums and listener fan-out.
//!
//! One tagged enum per event source, delivered to registered subscriber
//! callbacks. Notification is synchronous on the thread that caused the
//! event; the engine guarantees it never holds an element or knob state
//! lock while notifying, so subscribers may call back into the source.

use parking_lot::Mutex;
use std::sync::Arc;

/// Events published by a [`crate::element::KnobElement`].
#[derive(Debug, Clone, PartialEq)]
pub enum ElementEvent {
    /// The attached PV changed (including detach, and limit-policy swaps
    /// that re-resolve bounds).
    ChannelChanged {
        /// New PV name, `None` after detach.
        pv: Option<String>,
    },
    /// Connection state of the attached PV changed.
    ConnectionChanged(bool),
    /// Readiness of the element may have changed.
    ReadyChanged(bool),
    /// The knob coefficient changed.
    CoefficientChanged(f64),
    /// The latest value (setting or monitored) changed.
    ValueChanged(f64),
    /// A previously issued write completed at the remote end.
    SettingPublished,
}

/// Events published by a [`crate::knob::Knob`].
#[derive(Debug, Clone, PartialEq)]
pub enum KnobEvent {
    /// The knob was renamed.
    NameChanged(String),
    /// Aggregate readiness may have changed.
    ReadyChanged(bool),
    /// The knob's scalar setting changed (fired once per `set_value` call,
    /// even when the move was rejected).
    CurrentSettingChanged(f64),
    /// The cached travel range changed by more than the damping tolerance.
    LimitsChanged {
        /// New lower bound.
        lower: f64,
        /// New upper bound.
        upper: f64,
    },
    /// An element was added to the knob.
    ElementAdded,
    /// An element was removed from the knob.
    ElementRemoved,
    /// An element's channel, coefficient or connection changed.
    ElementModified,
    /// An element's write completed at the remote end.
    SettingPublished,
}

/// Identifier of a registered listener.
pub type ListenerId = u64;

/// Subscriber registry for one event type.
///
/// Listeners are `Arc<dyn Fn>` callbacks invoked in registration order.
/// The registry clones the current subscriber list before invoking, so a
/// listener may subscribe or unsubscribe from inside its own callback.
pub struct Listeners<E> {
    entries: Mutex<Vec<(ListenerId, Arc<dyn Fn(&E) + Send + Sync>)>>,
    next_id: Mutex<ListenerId>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Listeners<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Register a listener and return its id.
    pub fn subscribe(&self, listener: Arc<dyn Fn(&E) + Send + Sync>) -> ListenerId {
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        drop(next);

        self.entries.lock().push((id, listener));
        id
    }

    /// Remove a listener by id. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.entries.lock().retain(|(entry_id, _)| *entry_id != id);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Deliver an event to every registered listener.
    pub fn notify(&self, event: &E) {
        let snapshot: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}
