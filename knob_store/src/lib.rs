//! Knob definition persistence.
//!
//! Flat, human-diffable TOML documents holding knob definitions (elements
//! with coefficients, limit settings and wrap flags) and group membership
//! by knob id. [`schema`] defines the on-disk records and file I/O;
//! [`bridge`] converts between documents and a live
//! [`knob_engine::KnobRegistry`].

pub mod bridge;
pub mod error;
pub mod schema;

pub use bridge::{restore, snapshot};
pub use error::StoreError;
pub use schema::{Document, ElementRecord, GroupRecord, KnobRecord};
