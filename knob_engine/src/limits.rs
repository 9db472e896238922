//! Limit policies, wrap-around arithmetic and unready reasons.
//!
//! An element's travel bounds come from one of two sources, selected at
//! runtime: two companion read-only PVs (remote), or locally stored
//! constants (custom). Switching sources re-resolves the bounds
//! synchronously so an element is never momentarily "ready" against stale
//! bounds from the previous source.

use bitflags::bitflags;
use crate::pv::MonitorId;

/// Fold a value into `[lower, upper)` by modular arithmetic.
///
/// `((value − lower) mod span) + lower`, with `span` added back when the
/// remainder is negative (Rust's `%` keeps the dividend's sign). A value of
/// 190 wrapped around `[-180, 180)` becomes -170. Idempotent for any input.
pub fn wrap_into_range(value: f64, lower: f64, upper: f64) -> f64 {
    let span = upper - lower;
    let wrapped = (value - lower) % span;
    let constrained = if wrapped < 0.0 { wrapped + span } else { wrapped };
    constrained + lower
}

bitflags! {
    /// Reasons an element is not ready, aggregated because several causes
    /// can hold simultaneously.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UnreadyReason: u8 {
        /// The attached PV is not connected.
        const DISCONNECTED          = 0x01;
        /// No setting value has been resolved yet.
        const NO_SETTING            = 0x02;
        /// Limits are still NaN.
        const LIMITS_UNRESOLVED     = 0x04;
        /// The setting value lies outside the resolved limits.
        const OUT_OF_RANGE          = 0x08;
        /// A remote limit PV is not connected.
        const LIMIT_PV_DISCONNECTED = 0x10;
    }
}

impl Default for UnreadyReason {
    fn default() -> Self {
        Self::empty()
    }
}

/// State of one remote limit-source PV.
#[derive(Debug, Clone, Default)]
pub struct RemoteBound {
    /// Companion PV name.
    pub pv: String,
    /// Whether the companion PV reports connected.
    pub connected: bool,
    /// Last value read from the companion PV (NaN until resolved).
    pub value: f64,
    /// Active monitor subscription, if any.
    pub monitor: Option<MonitorId>,
}

impl RemoteBound {
    pub(crate) fn new(pv: String) -> Self {
        Self {
            pv,
            connected: false,
            value: f64::NAN,
            monitor: None,
        }
    }
}

/// Source of an element's travel bounds.
///
/// A tagged variant rather than a swappable strategy object; the element
/// chooses explicitly which variant is active.
#[derive(Debug, Clone)]
pub enum LimitPolicy {
    /// Bounds are sourced from two companion read-only PVs.
    Remote {
        /// Lower-bound companion PV.
        lower: RemoteBound,
        /// Upper-bound companion PV.
        upper: RemoteBound,
    },
    /// Bounds are locally stored constants; always ready.
    Custom {
        /// Lower bound.
        lower: f64,
        /// Upper bound.
        upper: f64,
    },
}

impl LimitPolicy {
    /// Whether this policy can currently supply trustworthy bounds.
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Custom { .. } => true,
            Self::Remote { lower, upper } => {
                lower.connected
                    && upper.connected
                    && lower.value.is_finite()
                    && upper.value.is_finite()
            }
        }
    }

    /// The bounds this policy currently supplies (either may be NaN).
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            Self::Custom { lower, upper } => (*lower, *upper),
            Self::Remote { lower, upper } => (lower.value, upper.value),
        }
    }

    /// Unready flags contributed by this policy.
    pub fn unready_reasons(&self) -> UnreadyReason {
        let mut reasons = UnreadyReason::empty();
        match self {
            Self::Custom { .. } => {}
            Self::Remote { lower, upper } => {
                if !lower.connected || !upper.connected {
                    reasons |= UnreadyReason::LIMIT_PV_DISCONNECTED;
                }
                if !lower.value.is_finite() || !upper.value.is_finite() {
                    reasons |= UnreadyReason::LIMITS_UNRESOLVED;
                }
            }
        }
        reasons
    }

    /// Human-readable explanation when not ready, `None` otherwise.
    pub fn inactive_excuse(&self) -> Option<String> {
        match self {
            Self::Custom { .. } => None,
            Self::Remote { lower, upper } => {
                if self.is_ready() {
                    return None;
                }
                let mut parts = Vec::new();
                for (label, bound) in [("Lower", lower), ("Upper", upper)] {
                    if !bound.connected {
                        parts.push(format!(
                            "{label} limit field: {} is not connected",
                            bound.pv
                        ));
                    } else if !bound.value.is_finite() {
                        parts.push(format!("{label} limit has not been found"));
                    }
                }
                Some(parts.join("; "))
            }
        }
    }
}
