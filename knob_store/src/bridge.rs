//! Conversion between documents and a live registry.
//!
//! `snapshot` captures the durable part of a registry (names, ids,
//! coefficients, limit settings, membership); monitored values, settings
//! and connection state are runtime-only and never persisted. `restore`
//! rebuilds knobs, elements and groups into a registry, skipping records
//! that collide with or dangle from what the document itself defines.

use crate::schema::{Document, ElementRecord, GroupRecord, KnobRecord};
use knob_engine::{Knob, KnobElement, KnobRegistry};
use std::sync::Arc;
use tracing::warn;

/// Capture a registry as a document.
pub fn snapshot(registry: &KnobRegistry) -> Document {
    Document {
        knobs: registry.knobs().iter().map(|knob| knob_record(knob)).collect(),
        groups: registry
            .groups()
            .iter()
            .map(|group| GroupRecord {
                label: group.label(),
                knob_ids: group.knobs().iter().map(|knob| knob.id()).collect(),
            })
            .collect(),
    }
}

fn knob_record(knob: &Arc<Knob>) -> KnobRecord {
    KnobRecord {
        id: knob.id(),
        name: knob.name(),
        elements: knob
            .elements()
            .iter()
            .map(|element| element_record(element))
            .collect(),
    }
}

fn element_record(element: &Arc<KnobElement>) -> ElementRecord {
    let using_custom_limits = element.is_using_custom_limits();
    let (custom_lower, custom_upper) = element.custom_limits();
    ElementRecord {
        pv: element.pv(),
        coefficient: element.coefficient(),
        using_custom_limits,
        custom_lower_limit: using_custom_limits.then_some(custom_lower),
        custom_upper_limit: using_custom_limits.then_some(custom_upper),
        wraps_value_around_limits: element.wraps_value_around_limits(),
    }
}

/// Rebuild a document's knobs, elements and groups into a registry.
///
/// Knob records whose id is already registered are skipped with a warning,
/// as are group references to knob ids the registry does not know.
pub fn restore(document: &Document, registry: &KnobRegistry) {
    for record in &document.knobs {
        let Some(knob) = registry.create_knob_with_id(record.id, record.name.clone()) else {
            warn!(id = record.id, name = %record.name, "knob id already taken, record skipped");
            continue;
        };
        for element_record in &record.elements {
            knob.add_element(restore_element(element_record, registry));
        }
    }

    for record in &document.groups {
        let group = registry.create_group(record.label.clone());
        for id in &record.knob_ids {
            match registry.knob(*id) {
                Some(knob) => group.add_knob(knob),
                None => {
                    warn!(group = %record.label, id, "group references unknown knob id, skipped")
                }
            }
        }
    }
}

fn restore_element(record: &ElementRecord, registry: &KnobRegistry) -> Arc<KnobElement> {
    let element = registry.create_element();
    element.set_coefficient_notify(record.coefficient, false);
    if let Some(lower) = record.custom_lower_limit {
        element.set_custom_lower_limit(lower);
    }
    if let Some(upper) = record.custom_upper_limit {
        element.set_custom_upper_limit(upper);
    }
    element.use_custom_limits(record.using_custom_limits);
    element.set_wraps_value_around_limits(record.wraps_value_around_limits);
    if let Some(pv) = &record.pv {
        element.attach(pv);
    }
    element
}
