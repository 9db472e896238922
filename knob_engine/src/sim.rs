//! Simulated PV client.
//!
//! `SimulatedPvClient` implements the [`PvClient`] trait to provide a
//! software-emulated control system for development and testing without
//! live hardware: PVs are installed with values, taken online/offline, and
//! monitor updates are pushed from test threads. Writes either complete
//! immediately (auto mode) or queue until the test completes or fails them,
//! which is how pending-write behavior is exercised.
//!
//! Callbacks are always invoked after the internal lock is dropped, since
//! engine callbacks take their own locks.

use crate::pv::{
    MonitorId, PutCallback, PutOutcome, PvClient, PvError, PvMonitorFn, PvUpdate, ReadCallback,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::debug;

struct SimPv {
    connected: bool,
    value: f64,
    monitors: Vec<(MonitorId, PvMonitorFn)>,
}

impl SimPv {
    fn placeholder() -> Self {
        Self {
            connected: false,
            value: f64::NAN,
            monitors: Vec::new(),
        }
    }
}

struct PendingPut {
    pv: String,
    value: f64,
    completion: PutCallback,
}

#[derive(Default)]
struct SimState {
    pvs: HashMap<String, SimPv>,
    pending_puts: Vec<PendingPut>,
    next_monitor: MonitorId,
}

/// In-memory PV client for tests and diagnostics.
pub struct SimulatedPvClient {
    state: Mutex<SimState>,
    auto_complete: AtomicBool,
}

impl Default for SimulatedPvClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPvClient {
    /// Create a client with no PVs; writes auto-complete.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            auto_complete: AtomicBool::new(true),
        }
    }

    /// Choose whether writes complete immediately (true, default) or queue
    /// until [`complete_pending_puts`](Self::complete_pending_puts) /
    /// [`fail_pending_puts`](Self::fail_pending_puts).
    pub fn set_auto_complete(&self, auto: bool) {
        self.auto_complete.store(auto, Ordering::SeqCst);
    }

    /// Install (or replace) a connected PV with an initial value.
    pub fn install_pv(&self, pv: &str, value: f64) {
        let monitors = {
            let mut state = self.state.lock();
            let record = state
                .pvs
                .entry(pv.to_string())
                .or_insert_with(SimPv::placeholder);
            record.connected = true;
            record.value = value;
            record.monitors.clone()
        };
        debug!(pv, value, "sim: PV installed");
        Self::deliver(&monitors, pv, PvUpdate::Connected);
        if value.is_finite() {
            Self::deliver(&monitors, pv, Self::value_update(value));
        }
    }

    /// Take a PV offline; monitors receive `Disconnected`.
    pub fn set_offline(&self, pv: &str) {
        let monitors = {
            let mut state = self.state.lock();
            match state.pvs.get_mut(pv) {
                Some(record) => {
                    record.connected = false;
                    record.monitors.clone()
                }
                None => return,
            }
        };
        debug!(pv, "sim: PV offline");
        Self::deliver(&monitors, pv, PvUpdate::Disconnected);
    }

    /// Bring a previously installed PV back online.
    pub fn set_online(&self, pv: &str) {
        let (monitors, value) = {
            let mut state = self.state.lock();
            match state.pvs.get_mut(pv) {
                Some(record) => {
                    record.connected = true;
                    (record.monitors.clone(), record.value)
                }
                None => return,
            }
        };
        debug!(pv, "sim: PV online");
        Self::deliver(&monitors, pv, PvUpdate::Connected);
        if value.is_finite() {
            Self::deliver(&monitors, pv, Self::value_update(value));
        }
    }

    /// Push a new monitored value for a PV.
    pub fn push_value(&self, pv: &str, value: f64) {
        let monitors = {
            let mut state = self.state.lock();
            match state.pvs.get_mut(pv) {
                Some(record) => {
                    record.value = value;
                    record.monitors.clone()
                }
                None => return,
            }
        };
        Self::deliver(&monitors, pv, Self::value_update(value));
    }

    /// Last value written or pushed for a PV, if any.
    pub fn value_of(&self, pv: &str) -> Option<f64> {
        self.state.lock().pvs.get(pv).map(|record| record.value)
    }

    /// Number of writes waiting for manual completion.
    pub fn pending_put_count(&self) -> usize {
        self.state.lock().pending_puts.len()
    }

    /// Apply and complete all queued writes.
    pub fn complete_pending_puts(&self) {
        let (puts, notifications) = {
            let mut state = self.state.lock();
            let puts: Vec<_> = state.pending_puts.drain(..).collect();
            let mut notifications = Vec::new();
            for put in &puts {
                if let Some(record) = state.pvs.get_mut(&put.pv) {
                    record.value = put.value;
                    notifications.push((put.pv.clone(), put.value, record.monitors.clone()));
                }
            }
            (puts, notifications)
        };
        for put in puts {
            (put.completion)(PutOutcome::Completed);
        }
        for (pv, value, monitors) in notifications {
            Self::deliver(&monitors, &pv, Self::value_update(value));
        }
    }

    /// Fail all queued writes without changing any value.
    pub fn fail_pending_puts(&self, reason: &str) {
        let puts: Vec<_> = {
            let mut state = self.state.lock();
            state.pending_puts.drain(..).collect()
        };
        for put in puts {
            (put.completion)(PutOutcome::Failed(reason.to_string()));
        }
    }

    fn value_update(value: f64) -> PvUpdate {
        PvUpdate::Value {
            value,
            timestamp: SystemTime::now(),
        }
    }

    fn deliver(monitors: &[(MonitorId, PvMonitorFn)], pv: &str, update: PvUpdate) {
        for (_, callback) in monitors {
            callback(pv, update);
        }
    }
}

impl PvClient for SimulatedPvClient {
    fn request_connection(&self, pv: &str) {
        // Unknown PVs get a disconnected placeholder, matching a client
        // that creates channels lazily and connects them later.
        let mut state = self.state.lock();
        state
            .pvs
            .entry(pv.to_string())
            .or_insert_with(SimPv::placeholder);
    }

    fn is_connected(&self, pv: &str) -> bool {
        self.state
            .lock()
            .pvs
            .get(pv)
            .map(|record| record.connected)
            .unwrap_or(false)
    }

    fn monitor(&self, pv: &str, callback: PvMonitorFn) -> MonitorId {
        let (id, current) = {
            let mut state = self.state.lock();
            let id = state.next_monitor;
            state.next_monitor += 1;
            let record = state
                .pvs
                .entry(pv.to_string())
                .or_insert_with(SimPv::placeholder);
            record.monitors.push((id, callback.clone()));
            let current = record.connected.then_some(record.value);
            (id, current)
        };
        if let Some(value) = current {
            callback(pv, PvUpdate::Connected);
            if value.is_finite() {
                callback(pv, Self::value_update(value));
            }
        }
        id
    }

    fn drop_monitor(&self, pv: &str, id: MonitorId) {
        let mut state = self.state.lock();
        if let Some(record) = state.pvs.get_mut(pv) {
            record.monitors.retain(|(monitor_id, _)| *monitor_id != id);
        }
    }

    fn write(&self, pv: &str, value: f64, completion: PutCallback) -> Result<(), PvError> {
        let auto = self.auto_complete.load(Ordering::SeqCst);
        let monitors = {
            let mut state = self.state.lock();
            let record = state
                .pvs
                .get_mut(pv)
                .ok_or_else(|| PvError::NoSuchPv(pv.to_string()))?;
            if !record.connected {
                return Err(PvError::NotConnected(pv.to_string()));
            }
            if auto {
                record.value = value;
                record.monitors.clone()
            } else {
                let pv = pv.to_string();
                state.pending_puts.push(PendingPut {
                    pv,
                    value,
                    completion,
                });
                return Ok(());
            }
        };
        completion(PutOutcome::Completed);
        Self::deliver(&monitors, pv, Self::value_update(value));
        Ok(())
    }

    fn read(&self, pv: &str, callback: ReadCallback) -> Result<(), PvError> {
        let value = {
            let state = self.state.lock();
            let record = state
                .pvs
                .get(pv)
                .ok_or_else(|| PvError::NoSuchPv(pv.to_string()))?;
            if !record.connected {
                return Err(PvError::NotConnected(pv.to_string()));
            }
            record.value
        };
        callback(Ok(value));
        Ok(())
    }
}
