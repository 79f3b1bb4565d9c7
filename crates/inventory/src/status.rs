//! Display classification of a blood-group level.
//!
//! The thresholds are policy, not structure: they ship with the clinical
//! defaults and can be moved per deployment through the environment.

use serde::{Deserialize, Serialize};

/// Availability classification shown on inventory dashboards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockStatus {
    Critical,
    Low,
    Good,
}

/// Classification thresholds: `< critical_below` is Critical,
/// `< low_below` is Low, anything else Good.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StockThresholds {
    pub critical_below: i64,
    pub low_below: i64,
}

impl Default for StockThresholds {
    fn default() -> Self {
        Self {
            critical_below: 5,
            low_below: 10,
        }
    }
}

impl StockThresholds {
    /// Read thresholds from `LIFELINK_CRITICAL_BELOW` / `LIFELINK_LOW_BELOW`,
    /// falling back to the defaults on absence or parse failure.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |key: &str, fallback: i64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(fallback)
        };
        Self {
            critical_below: read("LIFELINK_CRITICAL_BELOW", defaults.critical_below),
            low_below: read("LIFELINK_LOW_BELOW", defaults.low_below),
        }
    }

    pub fn classify(&self, units: i64) -> StockStatus {
        if units < self.critical_below {
            StockStatus::Critical
        } else if units < self.low_below {
            StockStatus::Low
        } else {
            StockStatus::Good
        }
    }
}
