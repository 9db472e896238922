//! On-disk knob document schema and file I/O.
//!
//! The schema is flat and human-diffable: one record per element with its
//! coefficient, limit settings and wrap flag; knobs carry an id, a name
//! and an ordered element list; groups reference knobs by id. Custom limit
//! values are written only when custom limits are in use.
//!
//! # TOML Example
//!
//! ```toml
//! [[knobs]]
//! id = 1
//! name = "orbit bump"
//!
//! [[knobs.elements]]
//! pv = "COR:H01"
//! coefficient = 2.0
//! using_custom_limits = true
//! custom_lower_limit = -10.0
//! custom_upper_limit = 10.0
//! wraps_value_around_limits = false
//!
//! [[groups]]
//! label = "ring"
//! knob_ids = [1]
//! ```

use crate::error::StoreError;
use knob_common::config::ConfigLoader;
use knob_engine::KnobId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One persisted PV binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    /// PV name; absent for an element that was never attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pv: Option<String>,

    /// Scale factor relating knob travel to this PV's travel.
    pub coefficient: f64,

    /// Whether custom limits are the active limit source.
    #[serde(default)]
    pub using_custom_limits: bool,

    /// Custom lower bound; written only when custom limits are in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_lower_limit: Option<f64>,

    /// Custom upper bound; written only when custom limits are in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_upper_limit: Option<f64>,

    /// Whether out-of-range targets wrap around the limits.
    #[serde(default)]
    pub wraps_value_around_limits: bool,
}

/// One persisted knob definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobRecord {
    /// Stable knob id, referenced by groups.
    pub id: KnobId,
    /// User-visible name.
    pub name: String,
    /// Element records in display order.
    #[serde(default)]
    pub elements: Vec<ElementRecord>,
}

/// One persisted group: a label plus knob ids into the shared registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Group display label.
    pub label: String,
    /// Member knob ids in display order.
    #[serde(default)]
    pub knob_ids: Vec<KnobId>,
}

/// A complete knob document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    /// All knob definitions in creation order.
    pub knobs: Vec<KnobRecord>,
    /// All groups in creation order.
    pub groups: Vec<GroupRecord>,
}

impl Document {
    /// Load a document from a TOML file.
    ///
    /// # Errors
    ///
    /// `StoreError::Parse` when the file is missing or not valid TOML.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        Ok(<Self as ConfigLoader>::load(path)?)
    }

    /// Save the document as TOML.
    ///
    /// # Errors
    ///
    /// `StoreError::Serialize` on serialization failure, `StoreError::Io`
    /// on write failure.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let text =
            toml::to_string_pretty(self).map_err(|e| StoreError::Serialize(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Check the document for internal inconsistencies.
    ///
    /// Returns one message per problem; an empty list means the document is
    /// consistent. Checked: duplicate knob ids, group references to unknown
    /// knob ids, non-finite coefficients, and custom limit values that are
    /// missing or inverted.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let mut seen = HashSet::new();
        for knob in &self.knobs {
            if !seen.insert(knob.id) {
                problems.push(format!("duplicate knob id {}", knob.id));
            }
            for (index, element) in knob.elements.iter().enumerate() {
                let place = format!("knob '{}' element {}", knob.name, index);
                if !element.coefficient.is_finite() {
                    problems.push(format!("{place}: coefficient is not finite"));
                }
                if element.using_custom_limits {
                    match (element.custom_lower_limit, element.custom_upper_limit) {
                        (Some(lower), Some(upper)) => {
                            if !(lower < upper) {
                                problems.push(format!(
                                    "{place}: custom limits [{lower}, {upper}] are not ordered"
                                ));
                            }
                        }
                        _ => problems.push(format!(
                            "{place}: custom limits in use but bounds are missing"
                        )),
                    }
                }
            }
        }

        let known: HashSet<KnobId> = self.knobs.iter().map(|knob| knob.id).collect();
        for group in &self.groups {
            for id in &group.knob_ids {
                if !known.contains(id) {
                    problems.push(format!(
                        "group '{}' references unknown knob id {id}",
                        group.label
                    ));
                }
            }
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_document() -> Document {
        Document {
            knobs: vec![KnobRecord {
                id: 1,
                name: "orbit bump".to_string(),
                elements: vec![
                    ElementRecord {
                        pv: Some("COR:H01".to_string()),
                        coefficient: 2.0,
                        using_custom_limits: true,
                        custom_lower_limit: Some(-10.0),
                        custom_upper_limit: Some(10.0),
                        wraps_value_around_limits: false,
                    },
                    ElementRecord {
                        pv: Some("COR:H02".to_string()),
                        coefficient: -0.5,
                        using_custom_limits: false,
                        custom_lower_limit: None,
                        custom_upper_limit: None,
                        wraps_value_around_limits: true,
                    },
                ],
            }],
            groups: vec![GroupRecord {
                label: "ring".to_string(),
                knob_ids: vec![1],
            }],
        }
    }

    #[test]
    fn file_roundtrip_is_exact() {
        let document = sample_document();
        let file = NamedTempFile::new().unwrap();
        document.save(file.path()).unwrap();

        let back = Document::load(file.path()).unwrap();
        assert_eq!(back, document);
    }

    #[test]
    fn remote_limit_elements_omit_custom_bounds() {
        let document = sample_document();
        let text = toml::to_string_pretty(&document).unwrap();
        // The second element uses remote limits; its record carries no
        // custom bound keys at all.
        let second = text.split("COR:H02").nth(1).unwrap();
        assert!(!second.contains("custom_lower_limit"));
        assert!(text.contains("custom_upper_limit = 10.0"));
    }

    #[test]
    fn missing_file_is_a_parse_error() {
        let result = Document::load(Path::new("/nonexistent/knobs.toml"));
        assert!(matches!(result, Err(StoreError::Parse(_))));
    }

    #[test]
    fn empty_document_loads_from_empty_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "").unwrap();
        let document = Document::load(file.path()).unwrap();
        assert!(document.knobs.is_empty());
        assert!(document.groups.is_empty());
    }

    #[test]
    fn validate_accepts_consistent_documents() {
        assert!(sample_document().validate().is_empty());
    }

    #[test]
    fn validate_flags_duplicate_ids_and_dangling_groups() {
        let mut document = sample_document();
        document.knobs.push(KnobRecord {
            id: 1,
            name: "clone".to_string(),
            elements: Vec::new(),
        });
        document.groups[0].knob_ids.push(99);

        let problems = document.validate();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("duplicate knob id 1"));
        assert!(problems[1].contains("unknown knob id 99"));
    }

    #[test]
    fn validate_flags_bad_custom_limits() {
        let mut document = sample_document();
        document.knobs[0].elements[0].custom_upper_limit = Some(-20.0);
        let problems = document.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("not ordered"));

        document.knobs[0].elements[0].custom_upper_limit = None;
        let problems = document.validate();
        assert!(problems[0].contains("bounds are missing"));
    }
}
