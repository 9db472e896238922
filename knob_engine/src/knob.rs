//! Knob: an ordered collection of elements sharing one scalar setting.
//!
//! Moving the knob by one unit moves every element by its own coefficient.
//! The knob aggregates element readiness, computes the travel-safe value
//! range lazily from the element limits, and performs coordinated writes.
//!
//! The element list and scalar state live under one mutex; the limit dirty
//! flag is an atomic so element callbacks can invalidate the cache without
//! contending for the state lock. Element writes and the settle wait happen
//! outside the state lock, so a knob's aggregate state can transiently
//! reflect a partially-applied move; completions may arrive in any order
//! and no knob-level atomicity is implied.

use crate::element::KnobElement;
use crate::error::EngineError;
use crate::event::{ElementEvent, KnobEvent, ListenerId, Listeners};
use knob_common::config::EngineConfig;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};

/// Stable identifier of a knob, assigned by the registry.
pub type KnobId = u64;

struct ElementEntry {
    element: Arc<KnobElement>,
    forward: ListenerId,
}

struct KnobState {
    name: String,
    entries: Vec<ElementEntry>,
    current_setting: f64,
    lower_limit: f64,
    upper_limit: f64,
}

/// A user-defined linear combination of PVs, moved by a single scalar.
pub struct Knob {
    id: KnobId,
    config: EngineConfig,
    state: Mutex<KnobState>,
    limits_dirty: AtomicBool,
    listeners: Listeners<KnobEvent>,
}

impl Knob {
    /// Create an empty knob. Ids come from the registry; the setting starts
    /// at zero with the limit cache marked stale.
    pub fn new(id: KnobId, name: impl Into<String>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            state: Mutex::new(KnobState {
                name: name.into(),
                entries: Vec::new(),
                current_setting: 0.0,
                lower_limit: 0.0,
                upper_limit: 0.0,
            }),
            limits_dirty: AtomicBool::new(true),
            listeners: Listeners::new(),
        })
    }

    /// This knob's stable identifier.
    pub fn id(&self) -> KnobId {
        self.id
    }

    /// The user-visible name.
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Rename the knob.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.state.lock().name = name.clone();
        self.listeners.notify(&KnobEvent::NameChanged(name));
    }

    /// Case-insensitive name comparison, for display sorting.
    pub fn compare_by_name(&self, other: &Knob) -> Ordering {
        self.name().to_lowercase().cmp(&other.name().to_lowercase())
    }

    /// Register a listener for this knob's events.
    pub fn subscribe(&self, listener: Arc<dyn Fn(&KnobEvent) + Send + Sync>) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    /// Remove a previously registered listener.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.unsubscribe(id);
    }

    // ─── Elements ───────────────────────────────────────────────────

    /// Add an element; its events forward into this knob's events and
    /// invalidate the limit cache.
    pub fn add_element(self: &Arc<Self>, element: Arc<KnobElement>) {
        let forward = {
            let knob = Arc::downgrade(self);
            let source = Arc::downgrade(&element);
            element.subscribe(Arc::new(move |event: &ElementEvent| {
                if let Some(knob) = knob.upgrade() {
                    knob.on_element_event(&source, event);
                }
            }))
        };
        self.state.lock().entries.push(ElementEntry { element, forward });
        self.mark_limits_dirty();
        self.listeners.notify(&KnobEvent::ElementAdded);
    }

    /// Remove an element, unhooking its event forwarding.
    pub fn remove_element(&self, element: &Arc<KnobElement>) {
        let removed = {
            let mut state = self.state.lock();
            match state
                .entries
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.element, element))
            {
                Some(index) => Some(state.entries.remove(index)),
                None => None,
            }
        };
        let Some(entry) = removed else { return };
        entry.element.unsubscribe(entry.forward);
        self.mark_limits_dirty();
        self.listeners.notify(&KnobEvent::ElementRemoved);
        self.listeners
            .notify(&KnobEvent::ReadyChanged(self.is_ready()));
    }

    /// Snapshot of the element list in insertion order.
    pub fn elements(&self) -> Vec<Arc<KnobElement>> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.element))
            .collect()
    }

    /// Number of elements.
    pub fn element_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether this knob has any elements.
    pub fn has_elements(&self) -> bool {
        self.element_count() > 0
    }

    // ─── Readiness & tracking ───────────────────────────────────────

    /// True iff the element list is non-empty and every element is ready.
    pub fn is_ready(&self) -> bool {
        let elements = self.elements();
        !elements.is_empty() && elements.iter().all(|element| element.is_ready())
    }

    /// Joined excuses of the elements that are not ready, `None` when the
    /// knob is ready.
    pub fn inactive_excuse(&self) -> Option<String> {
        if self.is_ready() {
            return None;
        }
        let excuses: Vec<String> = self
            .elements()
            .iter()
            .filter_map(|element| element.inactive_excuse())
            .collect();
        Some(excuses.join("\n"))
    }

    /// True iff every element is tracking (vacuously true when empty).
    pub fn is_tracking(&self) -> bool {
        self.elements().iter().all(|element| element.is_tracking())
    }

    /// True iff any element has a write in flight.
    pub fn is_set_operation_pending(&self) -> bool {
        self.elements()
            .iter()
            .any(|element| element.is_put_pending())
    }

    // ─── Setting ────────────────────────────────────────────────────

    /// The knob's own scalar state, independent of any element's value.
    pub fn current_setting(&self) -> f64 {
        self.state.lock().current_setting
    }

    /// Set the scalar setting without moving any element; recomputes the
    /// limits eagerly and notifies listeners.
    pub fn set_current_setting(&self, value: f64) {
        self.state.lock().current_setting = value;
        self.mark_limits_dirty();
        self.calculate_limits();
        self.listeners
            .notify(&KnobEvent::CurrentSettingChanged(value));
    }

    /// Reset the scalar setting to zero without moving any element.
    pub fn zero(&self) {
        self.set_current_setting(0.0);
    }

    /// Offset the scalar setting without moving any element.
    pub fn add_offset(&self, offset: f64) {
        let value = {
            let mut state = self.state.lock();
            state.current_setting += offset;
            state.current_setting
        };
        self.mark_limits_dirty();
        self.listeners
            .notify(&KnobEvent::CurrentSettingChanged(value));
    }

    /// Set each element's coefficient equal to its own latest value, then
    /// set the knob to 1.0, turning a snapshot of absolute values into a
    /// one-unit-moves-everything-to-here knob.
    pub fn make_proportional_coefficients(&self) {
        for element in self.elements() {
            let value = element.latest_value();
            element.set_coefficient(value);
        }
        self.set_current_setting(1.0);
    }

    /// Move the knob to `target` with a coordinated write to every element.
    ///
    /// Targets outside the cached limits (strict inequality on both ends)
    /// are rejected silently. A prior pending move is given a bounded
    /// settle wait before proceeding regardless. If any element has
    /// diverged from its setpoint the elements are resynchronized instead
    /// of compounding the divergence. Exactly one `CurrentSettingChanged`
    /// fires per call, even on the reject path.
    ///
    /// # Errors
    ///
    /// The first element write error aborts the remaining writes and leaves
    /// the scalar setting unchanged; the change event still fires.
    pub fn set_value(&self, target: f64) -> Result<(), EngineError> {
        let result = self.apply_value(target);
        self.listeners
            .notify(&KnobEvent::CurrentSettingChanged(self.current_setting()));
        result
    }

    fn apply_value(&self, target: f64) -> Result<(), EngineError> {
        let (current, elements) = {
            let state = self.state.lock();
            if !(target > state.lower_limit && target < state.upper_limit) {
                debug!(
                    knob = self.id,
                    target,
                    lower = state.lower_limit,
                    upper = state.upper_limit,
                    "target outside cached limits, move rejected"
                );
                return Ok(());
            }
            let elements: Vec<_> = state
                .entries
                .iter()
                .map(|entry| Arc::clone(&entry.element))
                .collect();
            (state.current_setting, elements)
        };

        if elements.iter().any(|element| element.is_put_pending()) {
            // Bounded settle wait for the previous move; proceed regardless
            // once the deadline passes.
            let deadline = Instant::now() + self.config.settle_wait();
            for element in &elements {
                if !element.wait_until_settled(deadline) {
                    warn!(knob = self.id, "previous move did not settle in time");
                    break;
                }
            }
        }

        if elements.iter().all(|element| element.is_tracking()) {
            let delta = target - current;
            for element in &elements {
                element.change_value_and_scale(delta)?;
            }
            self.state.lock().current_setting = target;
            Ok(())
        } else {
            debug!(knob = self.id, "elements diverged, resyncing instead of moving");
            self.resync()
        }
    }

    /// Pull every element's setting back in line with its monitored value
    /// and invalidate the limit cache.
    ///
    /// # Errors
    ///
    /// Every element is resynchronized even if some fail; the first error
    /// is returned.
    pub fn resync(&self) -> Result<(), EngineError> {
        let mut first_error = None;
        for element in self.elements() {
            if let Err(err) = element.resync() {
                warn!(knob = self.id, %err, "element resync failed");
                first_error.get_or_insert(err);
            }
        }
        self.mark_limits_dirty();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ─── Limits ─────────────────────────────────────────────────────

    /// The aggregate lower travel bound, recomputed first if stale.
    pub fn lower_limit(&self) -> f64 {
        self.calculate_limits_if_needed();
        self.state.lock().lower_limit
    }

    /// The aggregate upper travel bound, recomputed first if stale.
    pub fn upper_limit(&self) -> f64 {
        self.calculate_limits_if_needed();
        self.state.lock().upper_limit
    }

    /// Whether the cached limits are stale.
    pub fn limits_need_update(&self) -> bool {
        self.limits_dirty.load(AtomicOrdering::SeqCst)
    }

    /// Invalidate the cached limits.
    pub fn mark_limits_dirty(&self) {
        self.limits_dirty.store(true, AtomicOrdering::SeqCst);
    }

    fn calculate_limits_if_needed(&self) {
        if self.limits_dirty.load(AtomicOrdering::SeqCst) {
            self.calculate_limits();
        }
    }

    /// Recompute the safe travel range: the intersection across elements of
    /// each element's individually safe knob travel, scaled back by its
    /// coefficient. Any infinite bound is replaced by a generous symmetric
    /// fallback so callers always get a usable range. `LimitsChanged` fires
    /// only when the change exceeds a relative tolerance, damping listener
    /// churn from floating-point noise.
    pub fn calculate_limits(&self) {
        let (current, old_lower, old_upper, elements) = {
            let state = self.state.lock();
            let elements: Vec<_> = state
                .entries
                .iter()
                .map(|entry| Arc::clone(&entry.element))
                .collect();
            (
                state.current_setting,
                state.lower_limit,
                state.upper_limit,
                elements,
            )
        };

        let ready = !elements.is_empty() && elements.iter().all(|element| element.is_ready());
        let mut proposed_lower = current;
        let mut proposed_upper = current;
        if ready {
            let mut min_delta = f64::NEG_INFINITY;
            let mut max_delta = f64::INFINITY;
            for element in &elements {
                let coefficient = element.coefficient();
                if coefficient == 0.0 {
                    continue;
                }
                let setting = element.setting_value();
                let delta_one = (element.effective_lower_limit() - setting) / coefficient;
                let delta_two = (element.effective_upper_limit() - setting) / coefficient;
                min_delta = min_delta.max(delta_one.min(delta_two));
                max_delta = max_delta.min(delta_one.max(delta_two));
            }
            proposed_lower += min_delta;
            proposed_upper += max_delta;
        }

        // Not ready, or unconstrained by any element: substitute a generous
        // symmetric range so the caller always gets usable bounds.
        if !ready || proposed_lower.is_infinite() {
            proposed_lower = current - self.config.fallback_span_factor * current.abs();
        }
        if !ready || proposed_upper.is_infinite() {
            proposed_upper = current + self.config.fallback_span_factor * current.abs();
        }

        let scale = (old_upper - old_lower).abs() + (proposed_upper - proposed_lower).abs();
        let change = (old_upper - proposed_upper).abs() + (old_lower - proposed_lower).abs();
        self.limits_dirty.store(false, AtomicOrdering::SeqCst);

        if change > self.config.limit_change_tolerance * scale {
            {
                let mut state = self.state.lock();
                state.lower_limit = proposed_lower;
                state.upper_limit = proposed_upper;
            }
            debug!(
                knob = self.id,
                lower = proposed_lower,
                upper = proposed_upper,
                "limits recomputed"
            );
            self.listeners.notify(&KnobEvent::LimitsChanged {
                lower: proposed_lower,
                upper: proposed_upper,
            });
        }
    }

    // ─── Element event forwarding ───────────────────────────────────

    fn on_element_event(&self, source: &Weak<KnobElement>, event: &ElementEvent) {
        match event {
            ElementEvent::ChannelChanged { .. } | ElementEvent::CoefficientChanged(_) => {
                self.mark_limits_dirty();
                self.listeners.notify(&KnobEvent::ElementModified);
            }
            ElementEvent::ConnectionChanged(_) => {
                self.mark_limits_dirty();
            }
            ElementEvent::ReadyChanged(_) => {
                self.mark_limits_dirty();
                self.listeners
                    .notify(&KnobEvent::ReadyChanged(self.is_ready()));
            }
            ElementEvent::ValueChanged(_) => {
                // A tracking element moving with its setpoint does not
                // change the travel range; a diverged one does.
                if let Some(element) = source.upgrade() {
                    if !element.is_tracking() {
                        self.mark_limits_dirty();
                    }
                }
            }
            ElementEvent::SettingPublished => {
                self.listeners.notify(&KnobEvent::SettingPublished);
            }
        }
    }
}

impl std::fmt::Debug for Knob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Knob")
            .field("id", &self.id)
            .field("name", &state.name)
            .field("elements", &state.entries.len())
            .field("current_setting", &state.current_setting)
            .finish()
    }
}
