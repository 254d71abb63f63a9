use serde::{Deserialize, Serialize};

/// CPU and resident memory of this process at one instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}
