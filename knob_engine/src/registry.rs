//! Knob registry and groups.
//!
//! The registry owns the canonical knob list, assigns stable ids and holds
//! the shared PV client and configuration that every knob and element is
//! constructed with. Groups are pure membership views over the registry's
//! knobs; a knob can belong to several groups at once, and deleting a group
//! never destroys its knobs. Deleting a knob removes it from every group.

use crate::element::KnobElement;
use crate::knob::{Knob, KnobId};
use crate::pv::PvClient;
use knob_common::config::EngineConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// A named, ordered set of knob references.
pub struct KnobGroup {
    label: Mutex<String>,
    knobs: Mutex<Vec<Arc<Knob>>>,
}

impl KnobGroup {
    /// Create an empty group.
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: Mutex::new(label.into()),
            knobs: Mutex::new(Vec::new()),
        })
    }

    /// The group's display label.
    pub fn label(&self) -> String {
        self.label.lock().clone()
    }

    /// Rename the group.
    pub fn set_label(&self, label: impl Into<String>) {
        *self.label.lock() = label.into();
    }

    /// Add a knob reference; duplicates are ignored.
    pub fn add_knob(&self, knob: Arc<Knob>) {
        let mut knobs = self.knobs.lock();
        if !knobs.iter().any(|member| Arc::ptr_eq(member, &knob)) {
            knobs.push(knob);
        }
    }

    /// Remove a knob reference; the knob itself is untouched.
    pub fn remove_knob(&self, knob: &Arc<Knob>) {
        self.knobs
            .lock()
            .retain(|member| !Arc::ptr_eq(member, knob));
    }

    /// Whether the group references this knob.
    pub fn contains(&self, knob: &Arc<Knob>) -> bool {
        self.knobs
            .lock()
            .iter()
            .any(|member| Arc::ptr_eq(member, knob))
    }

    /// Snapshot of the members in insertion order.
    pub fn knobs(&self) -> Vec<Arc<Knob>> {
        self.knobs.lock().clone()
    }

    /// Snapshot of the members sorted case-insensitively by name.
    pub fn knobs_by_name(&self) -> Vec<Arc<Knob>> {
        let mut knobs = self.knobs();
        knobs.sort_by(|a, b| a.compare_by_name(b));
        knobs
    }

    /// Number of member knobs.
    pub fn len(&self) -> usize {
        self.knobs.lock().len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.knobs.lock().is_empty()
    }
}

struct RegistryState {
    knobs: Vec<Arc<Knob>>,
    groups: Vec<Arc<KnobGroup>>,
    next_id: KnobId,
}

/// Owner of the canonical knob list.
pub struct KnobRegistry {
    client: Arc<dyn PvClient>,
    config: EngineConfig,
    state: Mutex<RegistryState>,
}

impl KnobRegistry {
    /// Create a registry sharing one client and configuration with every
    /// knob and element it constructs.
    pub fn new(client: Arc<dyn PvClient>, config: EngineConfig) -> Self {
        Self {
            client,
            config,
            state: Mutex::new(RegistryState {
                knobs: Vec::new(),
                groups: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// The engine configuration knobs are constructed with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a knob with a fresh id and register it.
    pub fn create_knob(&self, name: impl Into<String>) -> Arc<Knob> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let knob = Knob::new(id, name, self.config.clone());
        state.knobs.push(Arc::clone(&knob));
        info!(id, name = %knob.name(), "knob created");
        knob
    }

    /// Register a knob under an explicit id, e.g. when restoring a saved
    /// document. Returns `None` if the id is already taken; otherwise the
    /// id counter advances past it.
    pub fn create_knob_with_id(&self, id: KnobId, name: impl Into<String>) -> Option<Arc<Knob>> {
        let mut state = self.state.lock();
        if state.knobs.iter().any(|knob| knob.id() == id) {
            return None;
        }
        state.next_id = state.next_id.max(id + 1);
        let knob = Knob::new(id, name, self.config.clone());
        state.knobs.push(Arc::clone(&knob));
        Some(knob)
    }

    /// Create a detached element bound to the shared client and config.
    pub fn create_element(&self) -> Arc<KnobElement> {
        KnobElement::new(Arc::clone(&self.client), self.config.clone())
    }

    /// Look up a knob by id.
    pub fn knob(&self, id: KnobId) -> Option<Arc<Knob>> {
        self.state
            .lock()
            .knobs
            .iter()
            .find(|knob| knob.id() == id)
            .cloned()
    }

    /// Snapshot of all knobs in creation order.
    pub fn knobs(&self) -> Vec<Arc<Knob>> {
        self.state.lock().knobs.clone()
    }

    /// Snapshot of all knobs sorted case-insensitively by name.
    pub fn knobs_by_name(&self) -> Vec<Arc<Knob>> {
        let mut knobs = self.knobs();
        knobs.sort_by(|a, b| a.compare_by_name(b));
        knobs
    }

    /// Number of registered knobs.
    pub fn knob_count(&self) -> usize {
        self.state.lock().knobs.len()
    }

    /// Delete a knob: removed from the canonical list and from every group.
    pub fn remove_knob(&self, knob: &Arc<Knob>) {
        let groups = {
            let mut state = self.state.lock();
            state.knobs.retain(|member| !Arc::ptr_eq(member, knob));
            state.groups.clone()
        };
        for group in groups {
            group.remove_knob(knob);
        }
        info!(id = knob.id(), "knob removed");
    }

    /// Create an empty group and register it.
    pub fn create_group(&self, label: impl Into<String>) -> Arc<KnobGroup> {
        let group = KnobGroup::new(label);
        self.state.lock().groups.push(Arc::clone(&group));
        group
    }

    /// Remove a group; its member knobs remain registered.
    pub fn remove_group(&self, group: &Arc<KnobGroup>) {
        self.state
            .lock()
            .groups
            .retain(|member| !Arc::ptr_eq(member, group));
    }

    /// Look up a group by label.
    pub fn group(&self, label: &str) -> Option<Arc<KnobGroup>> {
        self.state
            .lock()
            .groups
            .iter()
            .find(|group| group.label() == label)
            .cloned()
    }

    /// Snapshot of all groups in creation order.
    pub fn groups(&self) -> Vec<Arc<KnobGroup>> {
        self.state.lock().groups.clone()
    }
}
