use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::ActionCategory;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Running,
    Stopped,
    Failed,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "Idle",
            SessionStatus::Running => "Running",
            SessionStatus::Stopped => "Stopped",
            SessionStatus::Failed => "Failed",
            SessionStatus::Interrupted => "Interrupted",
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Idle
    }
}

/// Per-session counters.
///
/// `activities_performed` only moves forward and only on successful actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    activities_performed: u64,
    failed_actions: u64,
    bursts: u64,
    /// Burst slots handed out so far; drives the every-Nth gates and keeps
    /// counting across pauses.
    selection_counter: u64,
    category_counts: BTreeMap<ActionCategory, u64>,
    pub session_start: DateTime<Utc>,
    #[serde(skip)]
    started_instant: Option<Instant>,
    total_paused: Duration,
}

impl SessionStats {
    pub fn new(now: Instant) -> Self {
        Self {
            activities_performed: 0,
            failed_actions: 0,
            bursts: 0,
            selection_counter: 0,
            category_counts: BTreeMap::new(),
            session_start: Utc::now(),
            started_instant: Some(now),
            total_paused: Duration::ZERO,
        }
    }

    pub fn activities_performed(&self) -> u64 {
        self.activities_performed
    }

    pub fn failed_actions(&self) -> u64 {
        self.failed_actions
    }

    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    pub fn selection_counter(&self) -> u64 {
        self.selection_counter
    }

    pub fn category_counts(&self) -> &BTreeMap<ActionCategory, u64> {
        &self.category_counts
    }

    pub fn total_paused(&self) -> Duration {
        self.total_paused
    }

    pub fn record_success(&mut self, category: ActionCategory) {
        self.activities_performed += 1;
        *self.category_counts.entry(category).or_insert(0) += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed_actions += 1;
    }

    pub fn record_burst(&mut self) {
        self.bursts += 1;
    }

    /// Advances the slot counter and returns the new 1-based slot number.
    pub fn next_selection(&mut self) -> u64 {
        self.selection_counter += 1;
        self.selection_counter
    }

    pub fn add_paused(&mut self, paused_for: Duration) {
        self.total_paused += paused_for;
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started_instant
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }

    /// Session time minus closed pauses and the currently open one.
    pub fn active_duration(&self, now: Instant, open_pause: Duration) -> Duration {
        self.elapsed(now)
            .saturating_sub(self.total_paused)
            .saturating_sub(open_pause)
    }

    /// Activities per active minute scaled by ten, capped at 95.
    pub fn activity_percentage(&self, now: Instant, open_pause: Duration) -> f64 {
        let active_hours = (self.active_duration(now, open_pause).as_secs_f64() / 3600.0).max(0.001);
        let per_minute = self.activities_performed as f64 / (active_hours * 60.0);
        (per_minute * 10.0).min(95.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_duration_excludes_pauses() {
        let t0 = Instant::now();
        let mut stats = SessionStats::new(t0);
        stats.add_paused(Duration::from_secs(10));
        let now = t0 + Duration::from_secs(60);
        assert_eq!(stats.active_duration(now, Duration::ZERO), Duration::from_secs(50));
        assert_eq!(
            stats.active_duration(now, Duration::from_secs(5)),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn percentage_is_capped() {
        let t0 = Instant::now();
        let mut stats = SessionStats::new(t0);
        for _ in 0..100 {
            stats.record_success(ActionCategory::KeyTap);
        }
        let pct = stats.activity_percentage(t0 + Duration::from_secs(60), Duration::ZERO);
        assert_eq!(pct, 95.0);
        assert_eq!(stats.category_counts()[&ActionCategory::KeyTap], 100);
    }
}
