use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdleSample {
    pub timestamp: DateTime<Utc>,
    /// Seconds since the last genuine user input; never negative.
    pub idle_seconds: f64,
    /// Set when telemetry is unavailable and `idle_seconds` is the fallback.
    pub degraded: bool,
}

impl IdleSample {
    pub fn new(idle_seconds: f64, degraded: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            idle_seconds: idle_seconds.max(0.0),
            degraded,
        }
    }
}
