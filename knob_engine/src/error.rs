//! Engine error types.
//!
//! The engine absorbs internal inconsistency (disconnected PVs, unresolved
//! limits, stale settings) into the readiness and tracking predicates.
//! Only programmer errors and synchronous client rejections surface as
//! `EngineError`.

use crate::pv::PvError;
use thiserror::Error;

/// Error types for engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A write was attempted on an element with no attached PV.
    #[error("No PV attached to element")]
    NoChannel,

    /// The PV client rejected an operation synchronously.
    #[error(transparent)]
    Pv(#[from] PvError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pv_error_converts() {
        let err: EngineError = PvError::NotConnected("A:B".to_string()).into();
        assert!(err.to_string().contains("A:B"));
    }
}
