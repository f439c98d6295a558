//! Pass/fail classification of measured voltages.
//!
//! Two policies coexist and are selected by the schedule that invoked the
//! sweep: the thermal schedule uses a percentage band around the expected
//! channel voltage, the timed schedule a fixed absolute window.

use crate::matrix::Reading;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relative slack applied to band edges so values computed as `e * 0.95`
/// land inside the band despite floating-point rounding.
const EDGE_EPSILON: f64 = 1e-9;

/// Per-cell verdict: `G` (good) or `N` (no good).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Judgment {
    /// Within tolerance.
    #[serde(rename = "G")]
    Good,
    /// Out of tolerance or unreadable.
    #[serde(rename = "N")]
    NoGood,
}

impl Judgment {
    /// `Good` when `pass`.
    pub fn from_pass(pass: bool) -> Self {
        if pass {
            Judgment::Good
        } else {
            Judgment::NoGood
        }
    }

    /// Whether this is `G`.
    pub fn is_good(self) -> bool {
        self == Judgment::Good
    }

    /// `G` or `N`.
    pub fn as_str(self) -> &'static str {
        match self {
            Judgment::Good => "G",
            Judgment::NoGood => "N",
        }
    }
}

impl fmt::Display for Judgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a reading is compared with its expected value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TolerancePolicy {
    /// `G` iff `e*(1-tol) <= v <= e*(1+tol)`.
    Percentage { tolerance: f64 },
    /// `G` iff `min <= v <= max`, regardless of the expected value.
    FixedRange { min: f64, max: f64 },
}

impl Default for TolerancePolicy {
    fn default() -> Self {
        TolerancePolicy::Percentage {
            tolerance: Self::DEFAULT_TOLERANCE,
        }
    }
}

impl TolerancePolicy {
    /// ±5%.
    pub const DEFAULT_TOLERANCE: f64 = 0.05;

    /// Inclusive acceptance window for an expected value.
    pub fn bounds(&self, expected: f64) -> (f64, f64) {
        match *self {
            TolerancePolicy::Percentage { tolerance } => {
                let a = expected * (1.0 - tolerance);
                let b = expected * (1.0 + tolerance);
                (a.min(b), a.max(b))
            }
            TolerancePolicy::FixedRange { min, max } => (min, max),
        }
    }

    /// Judge a numeric value.
    pub fn judge_value(&self, value: f64, expected: f64) -> Judgment {
        if !value.is_finite() {
            return Judgment::NoGood;
        }
        let (low, high) = self.bounds(expected);
        let slack = EDGE_EPSILON * low.abs().max(high.abs()).max(1.0);
        Judgment::from_pass(value >= low - slack && value <= high + slack)
    }

    /// Judge a matrix reading; anything non-numeric is `N`.
    pub fn judge(&self, reading: &Reading, expected: f64) -> Judgment {
        match reading {
            Reading::Volts(value) => self.judge_value(*value, expected),
            Reading::Unset | Reading::Error => Judgment::NoGood,
        }
    }

    /// Short description for report headers.
    pub fn describe(&self) -> String {
        match *self {
            TolerancePolicy::Percentage { tolerance } => format!("±{:.1}%", tolerance * 100.0),
            TolerancePolicy::FixedRange { min, max } => format!("{:.1}-{:.1} V", min, max),
        }
    }
}
