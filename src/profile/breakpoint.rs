//! A single knot of a piecewise-constant power series.

use serde::{Deserialize, Serialize};

/// One `(offset, value)` pair of a [`Timeline`](super::Timeline).
///
/// The offset is in milliseconds relative to the owning timeline's epoch,
/// the value in watts. Values are sanitized on construction so that NaN and
/// infinities never enter a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Power in watts, held until the next breakpoint.
    pub(crate) value: f64,
    /// Milliseconds since the timeline epoch.
    pub(crate) offset: i64,
}

impl Breakpoint {
    /// Creates a breakpoint, coercing NaN to `0.0` and infinities to the
    /// largest finite value of the same sign.
    pub fn new(offset: i64, value: f64) -> Self {
        Self {
            value: sanitize(value),
            offset,
        }
    }

    /// Offset from the timeline epoch in milliseconds.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Power in watts.
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Replaces non-finite values with safe finite ones.
pub fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else if value == f64::INFINITY {
        f64::MAX
    } else if value == f64::NEG_INFINITY {
        f64::MIN
    } else {
        value
    }
}
