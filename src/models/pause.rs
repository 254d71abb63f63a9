use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PauseStatus {
    Active,
    Paused,
}

impl Default for PauseStatus {
    fn default() -> Self {
        PauseStatus::Active
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PauseOrigin {
    Manual,
    Auto,
    /// Pause closed because the session left Automation mode.
    ModeChange,
}

/// Active/Paused sub-state of Automation mode.
///
/// `pause_started_at` is only ever set while `status == Paused`; callers go
/// through [`PauseState::pause`] and [`PauseState::resume`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PauseState {
    status: PauseStatus,
    #[serde(skip)]
    pause_started_at: Option<Instant>,
    paused_since: Option<DateTime<Utc>>,
    cumulative_paused: Duration,
    pause_count: u32,
    reason: Option<String>,
}

impl PauseState {
    pub fn status(&self) -> PauseStatus {
        self.status
    }

    pub fn is_paused(&self) -> bool {
        self.status == PauseStatus::Paused
    }

    pub fn pause_started_at(&self) -> Option<Instant> {
        self.pause_started_at
    }

    pub fn paused_since(&self) -> Option<DateTime<Utc>> {
        self.paused_since
    }

    pub fn cumulative_paused(&self) -> Duration {
        self.cumulative_paused
    }

    pub fn pause_count(&self) -> u32 {
        self.pause_count
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Enters Paused. Returns `false` and leaves the start time untouched when
    /// already paused.
    pub fn pause(&mut self, now: Instant, reason: impl Into<String>) -> bool {
        if self.is_paused() {
            return false;
        }
        self.status = PauseStatus::Paused;
        self.pause_started_at = Some(now);
        self.paused_since = Some(Utc::now());
        self.pause_count += 1;
        self.reason = Some(reason.into());
        true
    }

    /// Leaves Paused and folds the pause into the cumulative total. Returns the
    /// length of the closed pause, or `None` when already active.
    pub fn resume(&mut self, now: Instant, reason: impl Into<String>) -> Option<Duration> {
        if !self.is_paused() {
            return None;
        }
        let paused_for = self
            .pause_started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        self.cumulative_paused += paused_for;
        self.status = PauseStatus::Active;
        self.pause_started_at = None;
        self.paused_since = None;
        self.reason = Some(reason.into());
        Some(paused_for)
    }

    /// Length of the pause currently open, zero when active.
    pub fn open_pause(&self, now: Instant) -> Duration {
        self.pause_started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }

    /// Paused time including the pause still open at `now`.
    pub fn total_paused(&self, now: Instant) -> Duration {
        self.cumulative_paused + self.open_pause(now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum PauseTransition {
    Paused {
        origin: PauseOrigin,
        reason: String,
        at: DateTime<Utc>,
    },
    Resumed {
        origin: PauseOrigin,
        reason: String,
        paused_ms: u64,
        at: DateTime<Utc>,
    },
}

impl PauseTransition {
    pub fn paused(origin: PauseOrigin, reason: impl Into<String>) -> Self {
        PauseTransition::Paused {
            origin,
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    pub fn resumed(origin: PauseOrigin, reason: impl Into<String>, paused_for: Duration) -> Self {
        PauseTransition::Resumed {
            origin,
            reason: reason.into(),
            paused_ms: paused_for.as_millis() as u64,
            at: Utc::now(),
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            PauseTransition::Paused { at, .. } | PauseTransition::Resumed { at, .. } => *at,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PauseTransition::Paused { reason, .. } | PauseTransition::Resumed { reason, .. } => {
                reason
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_pause_keeps_original_start() {
        let t0 = Instant::now();
        let mut state = PauseState::default();
        assert!(state.pause(t0, "manual"));
        assert!(!state.pause(t0 + Duration::from_secs(5), "manual"));
        assert_eq!(state.pause_started_at(), Some(t0));
        assert_eq!(state.pause_count(), 1);
    }

    #[test]
    fn resume_accumulates_paused_time() {
        let t0 = Instant::now();
        let mut state = PauseState::default();
        state.pause(t0, "manual");
        let paused_for = state.resume(t0 + Duration::from_secs(10), "manual");
        assert_eq!(paused_for, Some(Duration::from_secs(10)));
        assert_eq!(state.cumulative_paused(), Duration::from_secs(10));
        assert!(state.pause_started_at().is_none());
        assert_eq!(state.resume(t0 + Duration::from_secs(12), "manual"), None);
    }
}
