//! Knob Engine
//!
//! Groups multiple independent control-system process variables (PVs) into
//! a single linear "knob": moving the knob by one unit changes every member
//! PV by its own coefficient times the knob delta.
//!
//! # Module Structure
//!
//! - [`pv`] - Pluggable PV client trait (the external collaborator seam)
//! - [`sim`] - In-memory simulated PV client for tests and diagnostics
//! - [`event`] - Typed event enums and listener fan-out
//! - [`limits`] - Limit policies, wrap-around arithmetic, unready reasons
//! - [`element`] - One PV binding inside a knob
//! - [`knob`] - Coordinated multi-element knob
//! - [`registry`] - Knob registry and membership groups
//!
//! # Concurrency model
//!
//! The PV client delivers connection and value events from its own worker
//! threads, concurrently with caller threads issuing moves and limit
//! queries. Every element and knob guards its mutable state with one
//! per-instance mutex; pending-write settling uses a condition variable
//! with a bounded wait. Client calls and listener notification always
//! happen outside state locks.

pub mod element;
pub mod error;
pub mod event;
pub mod knob;
pub mod limits;
pub mod pv;
pub mod registry;
pub mod sim;

pub use element::KnobElement;
pub use knob_common::config::EngineConfig;
pub use error::EngineError;
pub use event::{ElementEvent, KnobEvent, ListenerId, Listeners};
pub use knob::{Knob, KnobId};
pub use limits::{LimitPolicy, UnreadyReason, wrap_into_range};
pub use pv::{MonitorId, PutOutcome, PvClient, PvError, PvUpdate};
pub use registry::{KnobGroup, KnobRegistry};
pub use sim::SimulatedPvClient;
