use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::ActionCategory;

/// Sleep floor for one cycle, unless the configured minimum is lower.
const MIN_SLEEP_SECS: f64 = 3.0;
/// Locked mode halves the base interval but never below this.
const LOCKED_MIN_BASE_SECS: f64 = 5.0;
/// Burst cap while Locked.
pub const LOCKED_MAX_BURST: u32 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum IntensityProfile {
    /// Base and jitter come from `min_interval_secs` / `max_interval_secs`.
    Custom,
    Low,
    Medium,
    High,
    /// Picks Low/Medium/High-like timing from the gap to the target percentage.
    Auto,
}

impl Default for IntensityProfile {
    fn default() -> Self {
        IntensityProfile::Medium
    }
}

impl IntensityProfile {
    /// Burst size a fixed profile suggests when it is picked. The configured
    /// `burst_size` is what the scheduler uses; this only seeds it.
    pub fn preset_burst_size(&self) -> Option<u32> {
        match self {
            IntensityProfile::Low => Some(2),
            IntensityProfile::Medium => Some(3),
            IntensityProfile::High => Some(5),
            IntensityProfile::Custom | IntensityProfile::Auto => None,
        }
    }
}

/// Resolved timing for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleTiming {
    pub base_secs: f64,
    pub jitter_secs: f64,
    pub burst_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CategorySettings {
    pub enabled: bool,
    /// Relative weight in normal (unlocked) selection.
    pub weight: u32,
    /// Relative weight while Locked; zero excludes the category.
    pub locked_weight: u32,
    /// Only eligible on every Nth burst slot of the session.
    pub every_nth: Option<u32>,
}

impl Default for CategorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 1,
            locked_weight: 0,
            every_nth: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ActionSettings {
    pub text_entry: CategorySettings,
    pub cursor_sweep: CategorySettings,
    pub micro_cursor: CategorySettings,
    pub key_tap: CategorySettings,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            text_entry: CategorySettings {
                enabled: true,
                weight: 4,
                locked_weight: 0,
                every_nth: None,
            },
            cursor_sweep: CategorySettings {
                enabled: true,
                weight: 3,
                locked_weight: 1,
                every_nth: None,
            },
            micro_cursor: CategorySettings {
                enabled: false,
                weight: 2,
                locked_weight: 4,
                every_nth: None,
            },
            key_tap: CategorySettings {
                enabled: true,
                weight: 1,
                locked_weight: 3,
                every_nth: None,
            },
        }
    }
}

impl ActionSettings {
    pub fn get(&self, category: ActionCategory) -> &CategorySettings {
        match category {
            ActionCategory::TextEntry => &self.text_entry,
            ActionCategory::CursorSweep => &self.cursor_sweep,
            ActionCategory::MicroCursor => &self.micro_cursor,
            ActionCategory::KeyTap => &self.key_tap,
        }
    }

    pub fn get_mut(&mut self, category: ActionCategory) -> &mut CategorySettings {
        match category {
            ActionCategory::TextEntry => &mut self.text_entry,
            ActionCategory::CursorSweep => &mut self.cursor_sweep,
            ActionCategory::MicroCursor => &mut self.micro_cursor,
            ActionCategory::KeyTap => &mut self.key_tap,
        }
    }

    pub fn disable_all(&mut self) {
        for category in ActionCategory::ALL {
            self.get_mut(category).enabled = false;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ModeSettings {
    pub auto_switch: bool,
    /// Idle below this hands control to the user.
    pub activation_threshold_secs: u64,
    /// Idle at or above this hands control back to automation.
    pub inactivity_threshold_secs: u64,
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self {
            auto_switch: true,
            activation_threshold_secs: 30,
            inactivity_threshold_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PauseSettings {
    pub auto_pause: bool,
    pub pause_threshold_secs: u64,
    pub resume_threshold_secs: u64,
}

impl Default for PauseSettings {
    fn default() -> Self {
        Self {
            auto_pause: true,
            pause_threshold_secs: 10,
            resume_threshold_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CompanionSettings {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub max_recovery_attempts: u32,
    /// Time given to the editor to open the file before it is considered up.
    pub settle_delay_ms: u64,
    /// Where artifacts are written; the system temp dir when unset.
    pub directory: Option<PathBuf>,
}

impl Default for CompanionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 15,
            max_recovery_attempts: 3,
            settle_delay_ms: 3_000,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct IdleSettings {
    /// OS-reported input this close to one of our own actions is ours.
    pub synthetic_window_ms: u64,
    /// Upper bound on a single idle or lock query.
    pub query_timeout_ms: u64,
    /// Idle seconds reported once telemetry has degraded.
    pub fallback_idle_secs: f64,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            synthetic_window_ms: 2_000,
            query_timeout_ms: 1_000,
            fallback_idle_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulatorConfig {
    pub target_percentage: u8,
    pub intensity: IntensityProfile,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// +/- spread around the profile base for Low/Medium/High/Auto.
    pub interval_jitter_secs: u64,
    pub burst_enabled: bool,
    pub burst_size: u32,
    pub start_delay_secs: u64,
    pub work_when_locked: bool,
    /// Window title fragments that suppress bursts while frontmost.
    pub avoid_apps: Vec<String>,
    pub mode: ModeSettings,
    pub pause: PauseSettings,
    pub actions: ActionSettings,
    pub companion: CompanionSettings,
    pub idle: IdleSettings,
    pub snapshot_interval_secs: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            target_percentage: 50,
            intensity: IntensityProfile::Medium,
            min_interval_secs: 10,
            max_interval_secs: 20,
            interval_jitter_secs: 5,
            burst_enabled: true,
            burst_size: 3,
            start_delay_secs: 0,
            work_when_locked: true,
            avoid_apps: Vec::new(),
            mode: ModeSettings::default(),
            pause: PauseSettings::default(),
            actions: ActionSettings::default(),
            companion: CompanionSettings::default(),
            idle: IdleSettings::default(),
            snapshot_interval_secs: 10,
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("min_interval_secs", self.min_interval_secs)?;
        positive("max_interval_secs", self.max_interval_secs)?;
        if self.min_interval_secs > self.max_interval_secs {
            return Err(ConfigError::IntervalOrder {
                min: self.min_interval_secs,
                max: self.max_interval_secs,
            });
        }
        positive("burst_size", self.burst_size as u64)?;
        if !(1..=100).contains(&self.target_percentage) {
            return Err(ConfigError::TargetOutOfRange(self.target_percentage));
        }

        positive("activation_threshold_secs", self.mode.activation_threshold_secs)?;
        positive("inactivity_threshold_secs", self.mode.inactivity_threshold_secs)?;
        ordered(
            "activation_threshold_secs",
            self.mode.activation_threshold_secs,
            "inactivity_threshold_secs",
            self.mode.inactivity_threshold_secs,
        )?;

        positive("pause_threshold_secs", self.pause.pause_threshold_secs)?;
        positive("resume_threshold_secs", self.pause.resume_threshold_secs)?;
        ordered(
            "pause_threshold_secs",
            self.pause.pause_threshold_secs,
            "resume_threshold_secs",
            self.pause.resume_threshold_secs,
        )?;

        for category in ActionCategory::ALL {
            if self.actions.get(category).every_nth == Some(0) {
                return Err(ConfigError::ZeroFrequency {
                    category: category.as_str(),
                });
            }
        }

        positive("check_interval_secs", self.companion.check_interval_secs)?;
        positive("query_timeout_ms", self.idle.query_timeout_ms)?;
        positive("snapshot_interval_secs", self.snapshot_interval_secs)?;
        Ok(())
    }

    /// Base interval, jitter and burst size for the next cycle.
    ///
    /// The burst always starts from the configured `burst_size`; Auto scales
    /// it by the gap to the target, using `current_percentage`.
    pub fn cycle_timing(&self, current_percentage: f64) -> CycleTiming {
        let jitter = self.interval_jitter_secs as f64;
        let burst = self.burst_size.max(1);
        let (base_secs, jitter_secs, burst_size) = match self.intensity {
            IntensityProfile::Custom => {
                let min = self.min_interval_secs as f64;
                let max = self.max_interval_secs as f64;
                ((min + max) / 2.0, (max - min) / 2.0, burst)
            }
            IntensityProfile::Low => (30.0, jitter, burst),
            IntensityProfile::Medium => (15.0, jitter, burst),
            IntensityProfile::High => (8.0, jitter, burst),
            IntensityProfile::Auto => {
                let target = self.target_percentage as f64;
                if current_percentage < target * 0.5 {
                    (5.0, jitter, burst * 2)
                } else if current_percentage < target * 0.8 {
                    (10.0, jitter, burst + 1)
                } else if current_percentage >= target {
                    (25.0, jitter, burst.div_ceil(2))
                } else {
                    (15.0, jitter, burst)
                }
            }
        };
        CycleTiming {
            base_secs,
            jitter_secs,
            burst_size: if self.burst_enabled { burst_size.max(1) } else { 1 },
        }
    }

    /// Inclusive sleep range for one cycle.
    pub fn sleep_bounds(&self, timing: &CycleTiming, locked: bool) -> (f64, f64) {
        let mut base = timing.base_secs;
        if locked {
            base = (base / 2.0).max(LOCKED_MIN_BASE_SECS.min(base));
        }
        let floor = MIN_SLEEP_SECS.min(self.min_interval_secs as f64);
        let low = (base - timing.jitter_secs).max(floor);
        let high = (base + timing.jitter_secs).max(low);
        (low, high)
    }

    pub fn burst_size(&self, timing: &CycleTiming, locked: bool) -> u32 {
        if locked {
            timing.burst_size.min(LOCKED_MAX_BURST)
        } else {
            timing.burst_size
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.companion.check_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

fn positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::NonPositive { key })
    } else {
        Ok(())
    }
}

fn ordered(
    lower_key: &'static str,
    lower: u64,
    upper_key: &'static str,
    upper: u64,
) -> Result<(), ConfigError> {
    if upper <= lower {
        Err(ConfigError::ThresholdOrder {
            lower_key,
            lower,
            upper_key,
            upper,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(SimulatorConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_inverted_interval() {
        let config = SimulatorConfig {
            min_interval_secs: 30,
            max_interval_secs: 10,
            ..SimulatorConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::IntervalOrder { min: 30, max: 10 })
        );
    }

    #[test]
    fn rejects_non_positive_threshold() {
        let mut config = SimulatorConfig::default();
        config.pause.pause_threshold_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NonPositive {
                key: "pause_threshold_secs"
            })
        );
    }

    #[test]
    fn inactivity_must_exceed_activation() {
        let mut config = SimulatorConfig::default();
        config.mode.inactivity_threshold_secs = 30;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn custom_profile_spans_configured_range() {
        let config = SimulatorConfig {
            intensity: IntensityProfile::Custom,
            min_interval_secs: 5,
            max_interval_secs: 10,
            burst_size: 3,
            ..SimulatorConfig::default()
        };
        let timing = config.cycle_timing(0.0);
        assert_eq!(config.sleep_bounds(&timing, false), (5.0, 10.0));
        assert_eq!(config.burst_size(&timing, false), 3);
        assert_eq!(config.burst_size(&timing, true), LOCKED_MAX_BURST);
    }

    #[test]
    fn locked_halves_base_with_floor() {
        let config = SimulatorConfig {
            intensity: IntensityProfile::Medium,
            ..SimulatorConfig::default()
        };
        let timing = config.cycle_timing(0.0);
        assert_eq!(config.sleep_bounds(&timing, false), (10.0, 20.0));
        // 15 / 2 = 7.5, minus jitter 5 hits the 3s floor
        assert_eq!(config.sleep_bounds(&timing, true), (3.0, 12.5));

        let low = SimulatorConfig {
            intensity: IntensityProfile::Custom,
            min_interval_secs: 6,
            max_interval_secs: 6,
            ..SimulatorConfig::default()
        };
        let timing = low.cycle_timing(0.0);
        assert_eq!(low.sleep_bounds(&timing, true), (5.0, 5.0));
    }

    #[test]
    fn auto_profile_tracks_target_gap() {
        let config = SimulatorConfig {
            intensity: IntensityProfile::Auto,
            target_percentage: 50,
            ..SimulatorConfig::default()
        };
        assert_eq!(config.cycle_timing(10.0).burst_size, 6);
        assert_eq!(config.cycle_timing(30.0).burst_size, 4);
        assert_eq!(config.cycle_timing(45.0).burst_size, 3);
        assert_eq!(config.cycle_timing(60.0).burst_size, 2);
    }

    #[test]
    fn configured_burst_size_applies_under_every_profile() {
        for intensity in [
            IntensityProfile::Custom,
            IntensityProfile::Low,
            IntensityProfile::Medium,
            IntensityProfile::High,
        ] {
            let config = SimulatorConfig {
                intensity,
                burst_size: 5,
                burst_enabled: true,
                ..SimulatorConfig::default()
            };
            let timing = config.cycle_timing(0.0);
            assert_eq!(config.burst_size(&timing, false), 5, "{intensity:?}");
            assert_eq!(config.burst_size(&timing, true), LOCKED_MAX_BURST);
        }
    }

    #[test]
    fn auto_profile_scales_configured_burst() {
        let config = SimulatorConfig {
            intensity: IntensityProfile::Auto,
            target_percentage: 50,
            burst_size: 4,
            ..SimulatorConfig::default()
        };
        assert_eq!(config.cycle_timing(10.0).burst_size, 8);
        assert_eq!(config.cycle_timing(30.0).burst_size, 5);
        assert_eq!(config.cycle_timing(45.0).burst_size, 4);
        assert_eq!(config.cycle_timing(60.0).burst_size, 2);
    }

    #[test]
    fn burst_disabled_means_single_action() {
        let config = SimulatorConfig {
            burst_enabled: false,
            ..SimulatorConfig::default()
        };
        assert_eq!(config.cycle_timing(0.0).burst_size, 1);
    }
}
