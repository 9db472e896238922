//! PV client trait and error types.
//!
//! This module defines:
//! - `PvClient` trait - Interface for pluggable process-variable clients
//! - `PvError` enum - Error types for PV operations
//! - `PvUpdate` enum - Connection and value events pushed by the client
//! - `PutOutcome` enum - Asynchronous write completion result
//!
//! The engine never models the wire protocol; a real channel-access
//! client or the in-memory [`crate::sim::SimulatedPvClient`] plugs in
//! behind this trait.

use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// Error types for PV operations.
#[derive(Debug, Clone, Error)]
pub enum PvError {
    /// The client has no PV with the given name.
    #[error("No such PV: {0}")]
    NoSuchPv(String),

    /// The PV exists but is not connected.
    #[error("PV not connected: {0}")]
    NotConnected(String),

    /// The client refused the write.
    #[error("Write rejected for {pv}: {reason}")]
    WriteRejected {
        /// PV name.
        pv: String,
        /// Client-supplied reason.
        reason: String,
    },
}

/// Identifier of a value/connection monitor subscription.
pub type MonitorId = u64;

/// Event pushed by the client to a monitor subscriber.
///
/// Delivered from the client's own worker threads; subscribers must be
/// prepared for arbitrary interleaving with their own calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PvUpdate {
    /// The PV connected (or was already connected at subscription time).
    Connected,
    /// The PV disconnected.
    Disconnected,
    /// A new monitored value arrived.
    Value {
        /// The monitored value.
        value: f64,
        /// Client-side timestamp of the update.
        timestamp: SystemTime,
    },
}

/// Result of an asynchronous write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The write was accepted by the remote end.
    Completed,
    /// The write failed; the reason is informational only.
    Failed(String),
}

/// Monitor callback: receives the PV name and the update.
pub type PvMonitorFn = Arc<dyn Fn(&str, PvUpdate) + Send + Sync>;

/// Write completion callback.
pub type PutCallback = Box<dyn FnOnce(PutOutcome) + Send>;

/// One-shot read callback.
pub type ReadCallback = Box<dyn FnOnce(Result<f64, PvError>) + Send>;

/// Interface to the process-variable client.
///
/// All I/O is fire-and-forget with asynchronous callbacks; callers never
/// block on PV I/O through this trait. Implementations must be safe to
/// call from multiple threads and must not invoke callbacks while holding
/// internal locks that the callbacks could re-enter.
pub trait PvClient: Send + Sync {
    /// Ask the client to establish a connection to the PV.
    fn request_connection(&self, pv: &str);

    /// Whether the PV currently reports connected.
    fn is_connected(&self, pv: &str) -> bool;

    /// Subscribe to connection and value-change events for a PV.
    ///
    /// If the PV is already connected, the client delivers `Connected`
    /// (and the current value, if known) to the new subscriber promptly.
    fn monitor(&self, pv: &str, callback: PvMonitorFn) -> MonitorId;

    /// Cancel a monitor subscription.
    fn drop_monitor(&self, pv: &str, id: MonitorId);

    /// Issue an asynchronous write with a completion callback.
    ///
    /// # Errors
    ///
    /// Fails synchronously if the PV is unknown or disconnected; in that
    /// case the completion callback is never invoked.
    fn write(&self, pv: &str, value: f64, completion: PutCallback) -> Result<(), PvError>;

    /// Issue a one-shot asynchronous read (used for remote limit PVs).
    ///
    /// # Errors
    ///
    /// Fails synchronously if the PV is unknown or disconnected.
    fn read(&self, pv: &str, callback: ReadCallback) -> Result<(), PvError>;
}
