//! Knob element: one PV binding inside a knob.
//!
//! An element owns a reference to one process variable, the coefficient
//! relating knob travel to PV travel, the limits currently in effect and
//! the latest monitored/setting values. Connection callbacks, monitor
//! callbacks, write completions and caller threads all touch the same
//! element concurrently; one mutex guards the value state, and a separate
//! mutex/condvar pair tracks the pending-write flag so a coordinated move
//! can wait for settling with a bounded timeout instead of spinning.
//!
//! Writes are two-phase: the setting value is updated optimistically when
//! the write is issued (`ValueChanged` reflects intent), and
//! `SettingPublished` fires only when the client confirms completion.
//!
//! Client calls and listener notification always happen outside the state
//! lock; a write completion arriving between issue and the optimistic
//! update is therefore possible and harmless (last-call-wins, per the
//! engine's ordering model).

use crate::error::EngineError;
use crate::event::{ElementEvent, ListenerId, Listeners};
use crate::limits::{LimitPolicy, RemoteBound, UnreadyReason, wrap_into_range};
use crate::pv::{MonitorId, PutOutcome, PvClient, PvUpdate};
use knob_common::config::EngineConfig;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};

/// Which remote limit bound a companion-PV event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundSide {
    Lower,
    Upper,
}

struct ElementState {
    /// Attached PV name, `None` while detached.
    pv: Option<String>,
    /// Monitor subscription on the attached PV.
    monitor: Option<MonitorId>,
    /// Knob coefficient for this element.
    coefficient: f64,
    /// Latest value from the monitor (NaN until first update).
    monitored_value: f64,
    /// Latest value written or synchronized (NaN until resolved).
    setting_value: f64,
    /// Latest value from either the monitor or a setting.
    latest_value: f64,
    /// When the setting was last changed.
    last_setting: Instant,
    /// Lower bound currently in effect (NaN until resolved).
    lower_limit: f64,
    /// Upper bound currently in effect (NaN until resolved).
    upper_limit: f64,
    /// Whether out-of-range targets wrap around the limits.
    wraps: bool,
    /// Remote limit-source state for the attached PV.
    remote_lower: RemoteBound,
    remote_upper: RemoteBound,
    /// Locally stored custom bounds (retained even while remote is active).
    custom_lower: f64,
    custom_upper: f64,
    /// Which limit source is active.
    using_custom: bool,
}

impl ElementState {
    fn new(config: &EngineConfig) -> Self {
        let (custom_lower, custom_upper) = match config.default_limit {
            Some(limit) => (-limit, limit),
            None => (-1.0, 1.0),
        };
        Self {
            pv: None,
            monitor: None,
            coefficient: 1.0,
            monitored_value: f64::NAN,
            setting_value: f64::NAN,
            latest_value: f64::NAN,
            last_setting: Instant::now(),
            lower_limit: f64::NAN,
            upper_limit: f64::NAN,
            wraps: false,
            remote_lower: RemoteBound::new(String::new()),
            remote_upper: RemoteBound::new(String::new()),
            custom_lower,
            custom_upper,
            using_custom: false,
        }
    }

    /// Reset cached values for a channel change.
    fn reset_for_attach(&mut self, config: &EngineConfig) {
        self.monitored_value = f64::NAN;
        self.setting_value = f64::NAN;
        self.latest_value = f64::NAN;
        match config.default_limit {
            Some(limit) => {
                self.lower_limit = -limit;
                self.upper_limit = limit;
            }
            None => {
                self.lower_limit = f64::NAN;
                self.upper_limit = f64::NAN;
            }
        }
        self.monitor = None;
        self.remote_lower = RemoteBound::new(String::new());
        self.remote_upper = RemoteBound::new(String::new());
    }

    /// Copy the active source's bounds into the limits in effect.
    fn refresh_limits(&mut self) {
        if self.using_custom {
            self.lower_limit = self.custom_lower;
            self.upper_limit = self.custom_upper;
        } else {
            self.lower_limit = self.remote_lower.value;
            self.upper_limit = self.remote_upper.value;
        }
    }

    /// The active limit source as a policy view.
    fn policy(&self) -> LimitPolicy {
        if self.using_custom {
            LimitPolicy::Custom {
                lower: self.custom_lower,
                upper: self.custom_upper,
            }
        } else {
            LimitPolicy::Remote {
                lower: self.remote_lower.clone(),
                upper: self.remote_upper.clone(),
            }
        }
    }

    fn setting_within_limits(&self) -> bool {
        self.setting_value.is_finite()
            && self.lower_limit.is_finite()
            && self.upper_limit.is_finite()
            && self.setting_value >= self.lower_limit
            && self.setting_value <= self.upper_limit
    }
}

/// One PV binding inside a knob.
pub struct KnobElement {
    client: Arc<dyn PvClient>,
    config: EngineConfig,
    state: Mutex<ElementState>,
    pending: Mutex<bool>,
    settled: Condvar,
    listeners: Listeners<ElementEvent>,
}

impl KnobElement {
    /// Create a detached element bound to a client and configuration.
    pub fn new(client: Arc<dyn PvClient>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ElementState::new(&config)),
            client,
            config,
            pending: Mutex::new(false),
            settled: Condvar::new(),
            listeners: Listeners::new(),
        })
    }

    /// Register a listener for this element's events.
    pub fn subscribe(&self, listener: Arc<dyn Fn(&ElementEvent) + Send + Sync>) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    /// Remove a previously registered listener.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.unsubscribe(id);
    }

    // ─── Channel attachment ─────────────────────────────────────────

    /// Attach a PV, replacing any previous one.
    ///
    /// Cached values reset to NaN (or the configured default limits), the
    /// element subscribes to connection/value events for the PV and its
    /// companion limit PVs, and a connection request is issued. Fires
    /// `ChannelChanged` then `ReadyChanged`, even though the fresh binding
    /// is almost certainly not yet ready.
    pub fn attach(self: &Arc<Self>, pv: &str) {
        let lower_pv = self.config.lower_limit_pv(pv);
        let upper_pv = self.config.upper_limit_pv(pv);

        let old = {
            let mut state = self.state.lock();
            if state.pv.as_deref() == Some(pv) {
                return; // no need to change anything
            }
            let old = Self::take_monitors(&mut state);
            state.reset_for_attach(&self.config);
            state.pv = Some(pv.to_string());
            state.remote_lower = RemoteBound::new(lower_pv.clone());
            state.remote_upper = RemoteBound::new(upper_pv.clone());
            // Custom bounds survive a channel change; remote bounds keep
            // the reset seeding (NaN or the default limit) until the new
            // companion PVs deliver values.
            if state.using_custom {
                state.refresh_limits();
            }
            old
        };
        self.drop_monitors(old);

        debug!(pv, "attaching element to PV");
        self.client.request_connection(pv);
        self.client.request_connection(&lower_pv);
        self.client.request_connection(&upper_pv);

        let weak = Arc::downgrade(self);
        let base_monitor = self.client.monitor(
            pv,
            Arc::new({
                let weak = Weak::clone(&weak);
                move |update_pv: &str, update: PvUpdate| {
                    if let Some(element) = weak.upgrade() {
                        element.on_pv_update(update_pv, update);
                    }
                }
            }),
        );
        let lower_monitor = self.monitor_bound(&lower_pv, BoundSide::Lower);
        let upper_monitor = self.monitor_bound(&upper_pv, BoundSide::Upper);

        let stale = {
            let mut state = self.state.lock();
            // Attach may race with a concurrent attach; if this PV is no
            // longer the current one, this call lost the race and its
            // monitors must go, or the abandoned PV would keep feeding
            // the element.
            if state.pv.as_deref() == Some(pv) {
                state.monitor = Some(base_monitor);
                state.remote_lower.monitor = Some(lower_monitor);
                state.remote_upper.monitor = Some(upper_monitor);
                Vec::new()
            } else {
                vec![
                    (pv.to_string(), base_monitor),
                    (lower_pv, lower_monitor),
                    (upper_pv, upper_monitor),
                ]
            }
        };
        self.drop_monitors(stale);

        self.listeners
            .notify(&ElementEvent::ChannelChanged { pv: self.pv() });
        self.listeners
            .notify(&ElementEvent::ReadyChanged(self.is_ready()));
    }

    /// Detach the current PV, resetting all cached values.
    pub fn detach(&self) {
        let old = {
            let mut state = self.state.lock();
            if state.pv.is_none() {
                return;
            }
            let old = Self::take_monitors(&mut state);
            state.reset_for_attach(&self.config);
            state.pv = None;
            old
        };
        self.drop_monitors(old);

        self.listeners
            .notify(&ElementEvent::ChannelChanged { pv: None });
        self.listeners.notify(&ElementEvent::ReadyChanged(false));
    }

    fn take_monitors(state: &mut ElementState) -> Vec<(String, MonitorId)> {
        let mut old = Vec::new();
        if let (Some(pv), Some(id)) = (state.pv.clone(), state.monitor.take()) {
            old.push((pv, id));
        }
        if let Some(id) = state.remote_lower.monitor.take() {
            old.push((state.remote_lower.pv.clone(), id));
        }
        if let Some(id) = state.remote_upper.monitor.take() {
            old.push((state.remote_upper.pv.clone(), id));
        }
        old
    }

    fn drop_monitors(&self, monitors: Vec<(String, MonitorId)>) {
        for (pv, id) in monitors {
            self.client.drop_monitor(&pv, id);
        }
    }

    fn monitor_bound(self: &Arc<Self>, pv: &str, side: BoundSide) -> MonitorId {
        let weak = Arc::downgrade(self);
        self.client.monitor(
            pv,
            Arc::new(move |pv: &str, update: PvUpdate| {
                if let Some(element) = weak.upgrade() {
                    element.on_limit_update(side, pv, update);
                }
            }),
        )
    }

    /// Attached PV name, if any.
    pub fn pv(&self) -> Option<String> {
        self.state.lock().pv.clone()
    }

    fn is_current_pv(&self, pv: &str) -> bool {
        self.state.lock().pv.as_deref() == Some(pv)
    }

    /// Whether the attached PV reports connected.
    pub fn is_connected(&self) -> bool {
        let pv = self.state.lock().pv.clone();
        match pv {
            Some(pv) => self.client.is_connected(&pv),
            None => false,
        }
    }

    // ─── Readiness ──────────────────────────────────────────────────

    /// True iff the PV is connected and the setting value is finite and
    /// within the limits in effect. Governs whether the element may be
    /// trusted for writes and limit arithmetic.
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        self.is_ready_locked(&state)
    }

    fn is_ready_locked(&self, state: &ElementState) -> bool {
        match &state.pv {
            Some(pv) => self.client.is_connected(pv) && state.setting_within_limits(),
            None => false,
        }
    }

    /// Flags describing why the element is not ready; empty when ready or
    /// detached.
    pub fn unready_reasons(&self) -> UnreadyReason {
        let state = self.state.lock();
        let Some(pv) = &state.pv else {
            return UnreadyReason::empty();
        };
        if self.is_ready_locked(&state) {
            return UnreadyReason::empty();
        }

        let mut reasons = UnreadyReason::empty();
        if !self.client.is_connected(pv) {
            reasons |= UnreadyReason::DISCONNECTED;
        } else {
            if state.setting_value.is_nan() {
                reasons |= UnreadyReason::NO_SETTING;
            }
            let policy = state.policy();
            if !policy.is_ready() {
                reasons |= policy.unready_reasons();
            } else if !state.setting_within_limits() {
                reasons |= UnreadyReason::OUT_OF_RANGE;
            }
        }
        reasons
    }

    /// Human-readable explanation for not being ready, `None` when ready
    /// or detached. Several causes can hold at once; all are reported.
    pub fn inactive_excuse(&self) -> Option<String> {
        let state = self.state.lock();
        let pv = state.pv.as_ref()?;
        if self.is_ready_locked(&state) {
            return None;
        }

        let mut parts = Vec::new();
        if !self.client.is_connected(pv) {
            parts.push(format!("{pv} is not connected"));
        } else {
            if state.setting_value.is_nan() {
                parts.push(format!("{pv} set point has not been found"));
            }
            let policy = state.policy();
            if !policy.is_ready() {
                if let Some(excuse) = policy.inactive_excuse() {
                    parts.push(excuse);
                }
            } else if !state.setting_within_limits() {
                parts.push(format!(
                    "{pv} set point ( {} ) outside limits [ {}, {} ]",
                    state.setting_value, state.lower_limit, state.upper_limit
                ));
            }
        }
        Some(parts.join("; "))
    }

    // ─── Coefficient ────────────────────────────────────────────────

    /// The knob coefficient for this element.
    pub fn coefficient(&self) -> f64 {
        self.state.lock().coefficient
    }

    /// Set the knob coefficient and notify listeners.
    pub fn set_coefficient(&self, coefficient: f64) {
        self.set_coefficient_notify(coefficient, true);
    }

    /// Set the knob coefficient, optionally skipping notification.
    pub fn set_coefficient_notify(&self, coefficient: f64, notify: bool) {
        self.state.lock().coefficient = coefficient;
        if notify {
            self.listeners
                .notify(&ElementEvent::CoefficientChanged(coefficient));
        }
    }

    // ─── Limits ─────────────────────────────────────────────────────

    /// Lower bound currently in effect (NaN until resolved).
    pub fn lower_limit(&self) -> f64 {
        self.state.lock().lower_limit
    }

    /// Upper bound currently in effect (NaN until resolved).
    pub fn upper_limit(&self) -> f64 {
        self.state.lock().upper_limit
    }

    /// Lower bound scaled by the effective-limit factor when wrapping.
    pub fn effective_lower_limit(&self) -> f64 {
        let state = self.state.lock();
        if state.wraps {
            self.config.effective_limit_factor * state.lower_limit
        } else {
            state.lower_limit
        }
    }

    /// Upper bound scaled by the effective-limit factor when wrapping.
    pub fn effective_upper_limit(&self) -> f64 {
        let state = self.state.lock();
        if state.wraps {
            self.config.effective_limit_factor * state.upper_limit
        } else {
            state.upper_limit
        }
    }

    /// Whether custom limits are the active source.
    pub fn is_using_custom_limits(&self) -> bool {
        self.state.lock().using_custom
    }

    /// The stored custom bounds (valid regardless of the active source).
    pub fn custom_limits(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.custom_lower, state.custom_upper)
    }

    /// Set the custom lower bound; refreshes limits if custom is active.
    pub fn set_custom_lower_limit(&self, lower: f64) {
        self.set_custom_limit(|state| state.custom_lower = lower);
    }

    /// Set the custom upper bound; refreshes limits if custom is active.
    pub fn set_custom_upper_limit(&self, upper: f64) {
        self.set_custom_limit(|state| state.custom_upper = upper);
    }

    fn set_custom_limit(&self, apply: impl FnOnce(&mut ElementState)) {
        let active = {
            let mut state = self.state.lock();
            apply(&mut state);
            if state.using_custom {
                state.refresh_limits();
            }
            state.using_custom && state.pv.is_some()
        };
        if active {
            self.notify_limits_changed();
        }
    }

    /// Switch between custom and remote limit sources.
    ///
    /// The bounds in effect are re-resolved synchronously from the new
    /// source before any listener is notified, so the element is never
    /// momentarily ready against stale bounds. Switching to the remote
    /// source also re-issues reads of the companion PVs.
    pub fn use_custom_limits(self: &Arc<Self>, use_custom: bool) {
        let mut refresh = Vec::new();
        {
            let mut state = self.state.lock();
            state.using_custom = use_custom;
            state.refresh_limits();
            if !use_custom {
                if state.remote_lower.connected {
                    refresh.push((state.remote_lower.pv.clone(), BoundSide::Lower));
                }
                if state.remote_upper.connected {
                    refresh.push((state.remote_upper.pv.clone(), BoundSide::Upper));
                }
            }
        }
        for (pv, side) in refresh {
            self.read_bound(&pv, side);
        }
        self.notify_limits_changed();
    }

    /// Whether out-of-range targets wrap around the limits.
    pub fn wraps_value_around_limits(&self) -> bool {
        self.state.lock().wraps
    }

    /// Enable or disable wrap-around; refreshes limits only on change.
    pub fn set_wraps_value_around_limits(&self, wraps: bool) {
        {
            let mut state = self.state.lock();
            if state.wraps == wraps {
                return;
            }
            state.wraps = wraps;
        }
        self.notify_limits_changed();
    }

    fn notify_limits_changed(&self) {
        self.listeners
            .notify(&ElementEvent::ChannelChanged { pv: self.pv() });
        self.listeners
            .notify(&ElementEvent::ReadyChanged(self.is_ready()));
    }

    // ─── Values ─────────────────────────────────────────────────────

    /// Latest value from the monitor (NaN until first update).
    pub fn monitored_value(&self) -> f64 {
        self.state.lock().monitored_value
    }

    /// Latest value written or synchronized (NaN until resolved).
    pub fn setting_value(&self) -> f64 {
        self.state.lock().setting_value
    }

    /// Most recent of the monitored and setting values.
    pub fn latest_value(&self) -> f64 {
        self.state.lock().latest_value
    }

    /// Whether a write has been issued and not yet acknowledged.
    pub fn is_put_pending(&self) -> bool {
        *self.pending.lock()
    }

    /// Block until no write is pending or the deadline passes.
    ///
    /// Returns true if the element settled in time.
    pub fn wait_until_settled(&self, deadline: Instant) -> bool {
        let mut pending = self.pending.lock();
        while *pending {
            if self.settled.wait_until(&mut pending, deadline).timed_out() {
                return !*pending;
            }
        }
        true
    }

    /// True when the written setpoint and the measured value are
    /// consistent enough to issue another relative move: either less than
    /// the tracking window has elapsed since the last write (the actuator
    /// is still converging), or the two values agree within the tracking
    /// tolerance of the limit span. Divergence is judged on the cached
    /// values themselves, so no monitor arrival timestamp is kept.
    pub fn is_tracking(&self) -> bool {
        let state = self.state.lock();
        if state.last_setting.elapsed() < self.config.tracking_window() {
            return true;
        }
        let scale = self.config.tracking_tolerance * (state.upper_limit - state.lower_limit);
        (state.setting_value - state.monitored_value).abs() < scale
    }

    /// Write a value to the PV, wrapping into the limits if configured.
    ///
    /// The setting value updates optimistically (listeners see intent,
    /// not confirmation) and `SettingPublished` fires when the write is
    /// acknowledged. The pending flag clears even on a failed
    /// acknowledgment so a knob never waits forever.
    ///
    /// # Errors
    ///
    /// `EngineError::NoChannel` if no PV is attached; `EngineError::Pv`
    /// if the client rejects the write synchronously. In both cases no
    /// optimistic update happens.
    pub fn set_value(self: &Arc<Self>, value: f64) -> Result<(), EngineError> {
        let (pv, raw) = {
            let state = self.state.lock();
            let pv = state.pv.clone().ok_or(EngineError::NoChannel)?;
            let raw = if state.wraps {
                wrap_into_range(value, state.lower_limit, state.upper_limit)
            } else {
                value
            };
            (pv, raw)
        };

        self.set_pending(true);
        let completion = {
            let weak = Arc::downgrade(self);
            let pv = pv.clone();
            Box::new(move |outcome: PutOutcome| {
                if let Some(element) = weak.upgrade() {
                    element.on_put_complete(&pv, outcome);
                }
            })
        };
        if let Err(err) = self.client.write(&pv, raw, completion) {
            self.set_pending(false);
            return Err(err.into());
        }

        {
            let mut state = self.state.lock();
            state.setting_value = raw;
            state.latest_value = raw;
            state.last_setting = Instant::now();
        }
        self.listeners.notify(&ElementEvent::ValueChanged(raw));
        Ok(())
    }

    /// Change the element's value by `coefficient * delta`.
    pub fn change_value_and_scale(self: &Arc<Self>, delta: f64) -> Result<(), EngineError> {
        let target = {
            let state = self.state.lock();
            state.setting_value + state.coefficient * delta
        };
        self.set_value(target)
    }

    /// Resynchronize the setting value to the latest monitored value,
    /// clearing any pending write.
    pub fn resync(self: &Arc<Self>) -> Result<(), EngineError> {
        self.set_pending(false);
        let monitored = self.monitored_value();
        self.set_value(monitored)
    }

    fn set_pending(&self, pending: bool) {
        let mut flag = self.pending.lock();
        *flag = pending;
        if !pending {
            self.settled.notify_all();
        }
    }

    fn on_put_complete(&self, pv: &str, outcome: PutOutcome) {
        self.set_pending(false);
        match outcome {
            PutOutcome::Completed => {
                self.listeners.notify(&ElementEvent::SettingPublished);
            }
            PutOutcome::Failed(reason) => {
                warn!(pv, reason, "PV write failed");
            }
        }
    }

    // ─── Client callbacks ───────────────────────────────────────────

    /// Updates for a PV that is no longer the attached one are ignored:
    /// a losing concurrent attach can deliver a stale initial update
    /// before its monitors are dropped.
    fn on_pv_update(self: &Arc<Self>, pv: &str, update: PvUpdate) {
        match update {
            PvUpdate::Connected => {
                if !self.is_current_pv(pv) {
                    return;
                }
                self.listeners.notify(&ElementEvent::ConnectionChanged(true));
                self.listeners
                    .notify(&ElementEvent::ReadyChanged(self.is_ready()));
            }
            PvUpdate::Disconnected => {
                if !self.is_current_pv(pv) {
                    return;
                }
                self.listeners
                    .notify(&ElementEvent::ConnectionChanged(false));
                self.listeners.notify(&ElementEvent::ReadyChanged(false));
            }
            PvUpdate::Value { value, .. } => {
                let ready_changed = {
                    let mut state = self.state.lock();
                    if state.pv.as_deref() != Some(pv) {
                        return;
                    }
                    state.monitored_value = value;
                    state.latest_value = value;

                    // While this element isn't ready, keep the setting
                    // value synchronized with the monitor so an un-ready
                    // element never reports a stale setting.
                    if !self.is_ready_locked(&state) {
                        state.setting_value = value;
                        true
                    } else {
                        false
                    }
                };
                self.listeners.notify(&ElementEvent::ValueChanged(value));
                if ready_changed {
                    self.listeners
                        .notify(&ElementEvent::ReadyChanged(self.is_ready()));
                }
            }
        }
    }

    /// Same staleness rule as [`Self::on_pv_update`], keyed on the
    /// companion PV name recorded for the side.
    fn on_limit_update(self: &Arc<Self>, side: BoundSide, pv: &str, update: PvUpdate) {
        match update {
            PvUpdate::Connected => {
                {
                    let mut state = self.state.lock();
                    let bound = Self::bound_mut(&mut state, side);
                    if bound.pv != pv {
                        return;
                    }
                    bound.connected = true;
                }
                self.read_bound(pv, side);
            }
            PvUpdate::Disconnected => {
                {
                    let mut state = self.state.lock();
                    let bound = Self::bound_mut(&mut state, side);
                    if bound.pv != pv {
                        return;
                    }
                    bound.connected = false;
                }
                self.listeners
                    .notify(&ElementEvent::ReadyChanged(self.is_ready()));
            }
            PvUpdate::Value { value, .. } => {
                self.store_bound_value(side, pv, value);
            }
        }
    }

    fn bound_mut(state: &mut ElementState, side: BoundSide) -> &mut RemoteBound {
        match side {
            BoundSide::Lower => &mut state.remote_lower,
            BoundSide::Upper => &mut state.remote_upper,
        }
    }

    /// Issue a one-shot read of a companion limit PV.
    fn read_bound(self: &Arc<Self>, pv: &str, side: BoundSide) {
        let weak = Arc::downgrade(self);
        let read_pv = pv.to_string();
        let result = self.client.read(
            pv,
            Box::new(move |result| {
                if let (Some(element), Ok(value)) = (weak.upgrade(), result) {
                    element.store_bound_value(side, &read_pv, value);
                }
            }),
        );
        if let Err(err) = result {
            debug!(pv, %err, "limit PV read failed");
        }
    }

    fn store_bound_value(self: &Arc<Self>, side: BoundSide, pv: &str, value: f64) {
        {
            let mut state = self.state.lock();
            let bound = Self::bound_mut(&mut state, side);
            if bound.pv != pv {
                return;
            }
            bound.value = value;
            // Each side lands independently so one resolved bound never
            // clobbers the other side's seeded value.
            if !state.using_custom {
                match side {
                    BoundSide::Lower => state.lower_limit = value,
                    BoundSide::Upper => state.upper_limit = value,
                }
            }
        }
        self.listeners
            .notify(&ElementEvent::ReadyChanged(self.is_ready()));
    }
}

impl Drop for KnobElement {
    fn drop(&mut self) {
        let old = Self::take_monitors(&mut self.state.lock());
        for (pv, id) in old {
            self.client.drop_monitor(&pv, id);
        }
    }
}

impl std::fmt::Debug for KnobElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("KnobElement")
            .field("pv", &state.pv)
            .field("coefficient", &state.coefficient)
            .field("setting_value", &state.setting_value)
            .field("monitored_value", &state.monitored_value)
            .field("limits", &(state.lower_limit, state.upper_limit))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedPvClient;

    fn element_with_client() -> (Arc<SimulatedPvClient>, Arc<KnobElement>) {
        let client = Arc::new(SimulatedPvClient::new());
        let element = KnobElement::new(
            Arc::clone(&client) as Arc<dyn PvClient>,
            EngineConfig::default(),
        );
        (client, element)
    }

    /// Install a PV with value and working remote limit PVs.
    fn install_full_pv(client: &SimulatedPvClient, pv: &str, value: f64, lower: f64, upper: f64) {
        client.install_pv(pv, value);
        client.install_pv(&format!("{pv}.LOPR"), lower);
        client.install_pv(&format!("{pv}.HOPR"), upper);
    }

    #[test]
    fn detached_element_is_not_ready() {
        let (_client, element) = element_with_client();
        assert!(!element.is_ready());
        assert!(!element.is_connected());
        assert!(element.inactive_excuse().is_none());
        assert!(element.pv().is_none());
    }

    #[test]
    fn ready_after_connect_value_and_limits() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "RING:QH01", 0.5, -2.0, 2.0);
        element.attach("RING:QH01");

        assert!(element.is_connected());
        assert!(element.is_ready(), "excuse: {:?}", element.inactive_excuse());
        assert_eq!(element.setting_value(), 0.5);
        assert_eq!(element.lower_limit(), -2.0);
        assert_eq!(element.upper_limit(), 2.0);
    }

    #[test]
    fn never_ready_while_limit_pvs_disconnected() {
        let (client, element) = element_with_client();
        // Base PV fine; companion limit PVs never installed.
        client.install_pv("RING:QH02", 1.0);
        element.attach("RING:QH02");

        assert!(element.is_connected());
        assert!(!element.is_ready());
        let reasons = element.unready_reasons();
        assert!(reasons.contains(UnreadyReason::LIMIT_PV_DISCONNECTED));
        let excuse = element.inactive_excuse().unwrap();
        assert!(excuse.contains("RING:QH02.LOPR"));
    }

    #[test]
    fn disconnect_removes_readiness() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 0.0, -1.0, 1.0);
        element.attach("A:B");
        assert!(element.is_ready());

        client.set_offline("A:B");
        assert!(!element.is_ready());
        assert!(
            element
                .unready_reasons()
                .contains(UnreadyReason::DISCONNECTED)
        );
        assert!(element.inactive_excuse().unwrap().contains("not connected"));
    }

    #[test]
    fn out_of_range_setting_reported_with_bounds() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 5.0, -1.0, 1.0);
        element.attach("A:B");

        assert!(!element.is_ready());
        assert!(element.unready_reasons().contains(UnreadyReason::OUT_OF_RANGE));
        let excuse = element.inactive_excuse().unwrap();
        assert!(excuse.contains("outside limits"));
        assert!(excuse.contains("-1"));
        assert!(excuse.contains("1"));
    }

    #[test]
    fn monitor_syncs_setting_while_unready() {
        let (client, element) = element_with_client();
        client.install_pv("A:B", 0.25);
        element.attach("A:B");

        // Limits unresolved, so not ready; setting follows the monitor.
        assert!(!element.is_ready());
        assert_eq!(element.setting_value(), 0.25);

        client.push_value("A:B", 0.75);
        assert_eq!(element.monitored_value(), 0.75);
        assert_eq!(element.setting_value(), 0.75);
    }

    #[test]
    fn monitor_does_not_clobber_setting_when_ready() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 0.0, -10.0, 10.0);
        element.attach("A:B");
        assert!(element.is_ready());

        element.set_value(2.0).unwrap();
        client.push_value("A:B", 1.9); // actuator converging
        assert_eq!(element.setting_value(), 2.0);
        assert_eq!(element.monitored_value(), 1.9);
        assert_eq!(element.latest_value(), 1.9);
    }

    #[test]
    fn set_value_without_pv_is_an_error() {
        let (_client, element) = element_with_client();
        assert!(matches!(element.set_value(1.0), Err(EngineError::NoChannel)));
    }

    #[test]
    fn set_value_writes_and_clears_pending() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 0.0, -5.0, 5.0);
        element.attach("A:B");

        element.set_value(3.0).unwrap();
        assert!(!element.is_put_pending());
        assert_eq!(client.value_of("A:B"), Some(3.0));
        assert_eq!(element.setting_value(), 3.0);
    }

    #[test]
    fn pending_stays_set_until_completion() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 0.0, -5.0, 5.0);
        element.attach("A:B");
        client.set_auto_complete(false);

        element.set_value(2.0).unwrap();
        assert!(element.is_put_pending());
        // Optimistic update happened even though the write is in flight.
        assert_eq!(element.setting_value(), 2.0);
        assert_eq!(client.value_of("A:B"), Some(0.0));

        let deadline = Instant::now() + std::time::Duration::from_millis(20);
        assert!(!element.wait_until_settled(deadline));

        client.complete_pending_puts();
        assert!(!element.is_put_pending());
        assert!(element.wait_until_settled(Instant::now()));
        assert_eq!(client.value_of("A:B"), Some(2.0));
    }

    #[test]
    fn failed_completion_clears_pending() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 0.0, -5.0, 5.0);
        element.attach("A:B");
        client.set_auto_complete(false);

        element.set_value(2.0).unwrap();
        assert!(element.is_put_pending());
        client.fail_pending_puts("sim fault");
        assert!(!element.is_put_pending());
    }

    #[test]
    fn wrapping_folds_target_into_limits() {
        let (client, element) = element_with_client();
        client.install_pv("DIP:PHASE", 0.0);
        element.attach("DIP:PHASE");
        element.set_custom_lower_limit(-180.0);
        element.set_custom_upper_limit(180.0);
        element.use_custom_limits(true);
        element.set_wraps_value_around_limits(true);

        element.set_value(190.0).unwrap();
        assert_eq!(element.setting_value(), -170.0);
        assert_eq!(client.value_of("DIP:PHASE"), Some(-170.0));
    }

    #[test]
    fn effective_limits_scale_only_when_wrapping() {
        let (client, element) = element_with_client();
        client.install_pv("DIP:PHASE", 0.0);
        element.attach("DIP:PHASE");
        element.set_custom_lower_limit(-180.0);
        element.set_custom_upper_limit(180.0);
        element.use_custom_limits(true);

        assert_eq!(element.effective_lower_limit(), -180.0);
        element.set_wraps_value_around_limits(true);
        assert_eq!(element.effective_lower_limit(), -18000.0);
        assert_eq!(element.effective_upper_limit(), 18000.0);
    }

    #[test]
    fn change_value_and_scale_applies_coefficient() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 0.0, -10.0, 10.0);
        element.attach("A:B");
        element.set_coefficient(2.0);

        element.change_value_and_scale(3.0).unwrap();
        assert_eq!(element.setting_value(), 6.0);
        assert_eq!(client.value_of("A:B"), Some(6.0));
    }

    #[test]
    fn policy_switch_is_synchronous() {
        let (client, element) = element_with_client();
        client.install_pv("A:B", 0.0); // remote limit PVs missing
        element.attach("A:B");
        element.set_custom_lower_limit(-4.0);
        element.set_custom_upper_limit(4.0);
        assert!(!element.is_ready());

        // Switching to custom resolves bounds before any listener runs.
        element.use_custom_limits(true);
        assert!(element.is_ready());
        assert_eq!(element.lower_limit(), -4.0);

        // Switching back to the unresolved remote source drops readiness
        // immediately; no stale custom bounds linger.
        element.use_custom_limits(false);
        assert!(!element.is_ready());
        assert!(element.lower_limit().is_nan());
    }

    #[test]
    fn remote_limits_resolve_via_companion_pvs() {
        let (client, element) = element_with_client();
        client.install_pv("A:B", 0.5);
        element.attach("A:B");
        assert!(!element.is_ready());

        // Companion PVs come up after the base PV.
        client.install_pv("A:B.LOPR", -2.0);
        client.install_pv("A:B.HOPR", 2.0);
        assert_eq!(element.lower_limit(), -2.0);
        assert_eq!(element.upper_limit(), 2.0);
        assert!(element.is_ready());
    }

    #[test]
    fn tracking_heuristic_uses_window_then_tolerance() {
        let client = Arc::new(SimulatedPvClient::new());
        let mut config = EngineConfig::default();
        // Zero-ish window forces the tolerance comparison path.
        config.tracking_window_secs = 1.0e-9;
        let element = KnobElement::new(Arc::clone(&client) as Arc<dyn PvClient>, config);

        install_full_pv(&client, "A:B", 0.0, -10.0, 10.0);
        element.attach("A:B");
        element.set_value(5.0).unwrap();
        // Monitor lags far behind the setting: not tracking.
        client.push_value("A:B", 0.0);
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(!element.is_tracking());

        // Monitor catches up within 0.1% of the 20-unit span.
        client.push_value("A:B", 5.001);
        assert!(element.is_tracking());
    }

    #[test]
    fn fresh_write_is_always_tracking() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 0.0, -10.0, 10.0);
        element.attach("A:B");

        element.set_value(5.0).unwrap();
        client.push_value("A:B", 0.0);
        // Default 2 s window has not elapsed.
        assert!(element.is_tracking());
    }

    #[test]
    fn resync_pulls_setting_back_to_monitor() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 0.0, -10.0, 10.0);
        element.attach("A:B");
        element.set_value(5.0).unwrap();
        client.push_value("A:B", 1.0);

        element.resync().unwrap();
        assert_eq!(element.setting_value(), 1.0);
        assert_eq!(client.value_of("A:B"), Some(1.0));
        assert!(!element.is_put_pending());
    }

    #[test]
    fn attach_fires_channel_then_ready() {
        let (client, element) = element_with_client();
        client.install_pv("A:B", 0.0);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        element.subscribe(Arc::new(move |event: &ElementEvent| {
            sink.lock().push(event.clone());
        }));

        element.attach("A:B");
        let seen = events.lock().clone();
        let channel_pos = seen
            .iter()
            .position(|e| matches!(e, ElementEvent::ChannelChanged { pv: Some(_) }))
            .expect("ChannelChanged fired");
        let ready_pos = seen
            .iter()
            .rposition(|e| matches!(e, ElementEvent::ReadyChanged(_)))
            .expect("ReadyChanged fired");
        assert!(channel_pos < ready_pos);
    }

    #[test]
    fn reattach_same_pv_is_a_no_op() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 1.0, -2.0, 2.0);
        element.attach("A:B");
        element.set_value(1.5).unwrap();

        element.attach("A:B");
        // No reset happened.
        assert_eq!(element.setting_value(), 1.5);
    }

    #[test]
    fn detach_resets_everything() {
        let (client, element) = element_with_client();
        install_full_pv(&client, "A:B", 1.0, -2.0, 2.0);
        element.attach("A:B");
        assert!(element.is_ready());

        element.detach();
        assert!(element.pv().is_none());
        assert!(!element.is_ready());
        assert!(element.setting_value().is_nan());
        assert!(element.lower_limit().is_nan());

        // A detached element no longer reacts to old-PV traffic.
        client.push_value("A:B", 9.0);
        assert!(element.monitored_value().is_nan());
    }

    /// Client that starts a competing attach from inside the first
    /// `monitor` registration for `contested_pv`, the deterministic
    /// interleaving of two racing attach calls.
    struct RivalAttachClient {
        inner: Arc<SimulatedPvClient>,
        element: Mutex<Option<Arc<KnobElement>>>,
        contested_pv: &'static str,
        rival_pv: &'static str,
        fired: std::sync::atomic::AtomicBool,
    }

    impl PvClient for RivalAttachClient {
        fn request_connection(&self, pv: &str) {
            self.inner.request_connection(pv);
        }

        fn is_connected(&self, pv: &str) -> bool {
            self.inner.is_connected(pv)
        }

        fn monitor(&self, pv: &str, callback: crate::pv::PvMonitorFn) -> MonitorId {
            if pv == self.contested_pv
                && !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                let element = self.element.lock().clone().unwrap();
                element.attach(self.rival_pv);
            }
            self.inner.monitor(pv, callback)
        }

        fn drop_monitor(&self, pv: &str, id: MonitorId) {
            self.inner.drop_monitor(pv, id);
        }

        fn write(
            &self,
            pv: &str,
            value: f64,
            completion: crate::pv::PutCallback,
        ) -> Result<(), crate::pv::PvError> {
            self.inner.write(pv, value, completion)
        }

        fn read(
            &self,
            pv: &str,
            callback: crate::pv::ReadCallback,
        ) -> Result<(), crate::pv::PvError> {
            self.inner.read(pv, callback)
        }
    }

    #[test]
    fn losing_concurrent_attach_leaves_no_monitors_behind() {
        let inner = Arc::new(SimulatedPvClient::new());
        install_full_pv(&inner, "A:X", 1.0, -10.0, 10.0);
        install_full_pv(&inner, "A:Y", 2.0, -10.0, 10.0);
        let client = Arc::new(RivalAttachClient {
            inner: Arc::clone(&inner),
            element: Mutex::new(None),
            contested_pv: "A:X",
            rival_pv: "A:Y",
            fired: std::sync::atomic::AtomicBool::new(false),
        });
        let element = KnobElement::new(
            Arc::clone(&client) as Arc<dyn PvClient>,
            EngineConfig::default(),
        );
        *client.element.lock() = Some(Arc::clone(&element));

        // The attach to A:X loses the race; the element ends up on A:Y
        // and A:X's initial updates never land.
        element.attach("A:X");
        assert_eq!(element.pv(), Some("A:Y".to_string()));
        assert_eq!(element.monitored_value(), 2.0);
        assert_eq!(element.setting_value(), 2.0);
        assert!(element.is_ready());

        // The losing attach's monitors were dropped, so later traffic on
        // the abandoned PV and its companions changes nothing.
        inner.push_value("A:X", 42.0);
        inner.push_value("A:X.HOPR", 99.0);
        inner.set_offline("A:X");
        assert_eq!(element.monitored_value(), 2.0);
        assert_eq!(element.upper_limit(), 10.0);
        assert!(element.is_ready());
    }

    #[test]
    fn default_limit_seeds_bounds_and_custom_limits() {
        let client = Arc::new(SimulatedPvClient::new());
        let mut config = EngineConfig::default();
        config.default_limit = Some(90.0);
        let element = KnobElement::new(Arc::clone(&client) as Arc<dyn PvClient>, config);

        client.install_pv("A:B", 0.0);
        element.attach("A:B");
        assert_eq!(element.custom_limits(), (-90.0, 90.0));
        // Reset bounds start at the default instead of NaN...
        // ...until the remote source resolves and overrides them.
        client.install_pv("A:B.LOPR", -5.0);
        client.install_pv("A:B.HOPR", 5.0);
        assert_eq!(element.lower_limit(), -5.0);
    }
}
