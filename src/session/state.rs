use chrono::Utc;
use std::time::{Duration, Instant};

use crate::config::SimulatorConfig;
use crate::engine::{ModeController, PauseController};
use crate::models::{
    ActionCategory, IdleSample, Mode, ModeState, ModeTransition, PauseState, PauseTransition,
    SessionSnapshot, SessionStats, SessionStatus,
};

/// A change produced by one presence tick or control command, in the order
/// it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Mode(ModeTransition),
    Pause(PauseTransition),
}

/// Everything mutable about one session, behind a single lock.
///
/// Pause state is only reachable through this type, which keeps it closed
/// whenever the session is outside Automation, and keeps the session
/// counters in step with every pause that ends.
pub struct SessionState {
    session_id: String,
    status: SessionStatus,
    mode: ModeController,
    pause: PauseController,
    stats: SessionStats,
    last_idle: IdleSample,
    locked: bool,
    failure: Option<String>,
    finished_at: Option<Instant>,
}

impl SessionState {
    pub fn new(session_id: String, config: &SimulatorConfig, now: Instant) -> Self {
        Self {
            session_id,
            status: SessionStatus::Running,
            mode: ModeController::new(config.mode.clone(), now),
            pause: PauseController::new(config.pause.clone()),
            stats: SessionStats::new(now),
            last_idle: IdleSample::new(0.0, false),
            locked: false,
            failure: None,
            finished_at: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn mode(&self) -> &ModeState {
        self.mode.state()
    }

    pub fn mode_epoch(&self) -> u64 {
        self.mode.state().epoch
    }

    /// Pause sub-state; `None` outside Automation.
    pub fn pause(&self) -> Option<&PauseState> {
        (self.mode.mode() == Mode::Automation).then(|| self.pause.state())
    }

    pub fn is_paused(&self) -> bool {
        self.pause().is_some_and(PauseState::is_paused)
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn last_idle(&self) -> &IdleSample {
        &self.last_idle
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// One presence tick: lock, then mode, then pause. A tick that changes
    /// mode leaves the pause evaluation for the next one.
    pub fn observe(&mut self, sample: IdleSample, locked: bool, now: Instant) -> Vec<StateChange> {
        self.last_idle = sample;
        self.locked = locked;
        let mut changes = Vec::new();
        if !self.is_running() {
            return changes;
        }

        if let Some(transition) = self.mode.evaluate(&sample, locked, true, now) {
            self.after_mode_change(&transition, now, &mut changes);
            return changes;
        }

        if self.mode.mode() == Mode::Automation {
            if let Some(transition) = self.with_pause(|pause| pause.evaluate(&sample, now)) {
                changes.push(StateChange::Pause(transition));
            }
        }
        changes
    }

    /// Manual pause. Outside Automation there is nothing to pause.
    pub fn manual_pause(&mut self, now: Instant) -> Option<PauseTransition> {
        if !self.is_running() || self.mode.mode() != Mode::Automation {
            log::info!(
                "Pause ignored: session is {} in {} mode",
                self.status.as_str(),
                self.mode.mode().as_str()
            );
            return None;
        }
        self.with_pause(|pause| pause.manual_pause(now))
    }

    pub fn manual_resume(&mut self, now: Instant) -> Option<PauseTransition> {
        if !self.is_running() {
            return None;
        }
        self.with_pause(|pause| pause.manual_resume(now))
    }

    pub fn toggle_mode(&mut self, now: Instant) -> Vec<StateChange> {
        let mut changes = Vec::new();
        if !self.is_running() {
            return changes;
        }
        if let Some(transition) = self.mode.toggle(now) {
            self.after_mode_change(&transition, now, &mut changes);
        }
        changes
    }

    /// Hands out the next session-wide selection slot.
    pub fn next_selection(&mut self) -> u64 {
        self.stats.next_selection()
    }

    pub fn record_success(&mut self, category: ActionCategory) {
        self.stats.record_success(category);
    }

    pub fn record_failure(&mut self) {
        self.stats.record_failure();
    }

    pub fn record_burst(&mut self) {
        self.stats.record_burst();
    }

    /// Ends the session. Time stops counting at `now`.
    pub fn finish(&mut self, status: SessionStatus, now: Instant, failure: Option<String>) {
        if self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        self.status = status;
        if failure.is_some() {
            self.failure = failure;
        }
    }

    fn clock(&self, now: Instant) -> Instant {
        self.finished_at.unwrap_or(now)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.stats.elapsed(self.clock(now))
    }

    /// Closed pauses plus the one still open.
    pub fn total_paused(&self, now: Instant) -> Duration {
        self.stats.total_paused() + self.pause.state().open_pause(self.clock(now))
    }

    pub fn active_duration(&self, now: Instant) -> Duration {
        let now = self.clock(now);
        self.stats
            .active_duration(now, self.pause.state().open_pause(now))
    }

    pub fn activity_percentage(&self, now: Instant) -> f64 {
        let now = self.clock(now);
        self.stats
            .activity_percentage(now, self.pause.state().open_pause(now))
    }

    /// Point-in-time view; companion and process figures are filled in by the
    /// caller.
    pub fn snapshot(&self, now: Instant, target_percentage: u8) -> SessionSnapshot {
        let mode = self.mode.state();
        SessionSnapshot {
            session_id: Some(self.session_id.clone()),
            timestamp: Utc::now(),
            status: self.status,
            mode: mode.mode,
            mode_reason: mode.reason.clone(),
            pause: self.pause().map(PauseState::status),
            pause_count: self.pause.state().pause_count(),
            idle_seconds: self.last_idle.idle_seconds,
            telemetry_degraded: self.last_idle.degraded,
            activities_performed: self.stats.activities_performed(),
            failed_actions: self.stats.failed_actions(),
            bursts: self.stats.bursts(),
            category_counts: self.stats.category_counts().clone(),
            elapsed_ms: self.elapsed(now).as_millis() as u64,
            active_ms: self.active_duration(now).as_millis() as u64,
            paused_ms: self.total_paused(now).as_millis() as u64,
            activity_percentage: self.activity_percentage(now),
            target_percentage,
            companion: None,
            cpu_percent: None,
            memory_mb: None,
        }
    }

    fn after_mode_change(
        &mut self,
        transition: &ModeTransition,
        now: Instant,
        changes: &mut Vec<StateChange>,
    ) {
        changes.push(StateChange::Mode(transition.clone()));
        if transition.to == Mode::Automation {
            self.pause.enter_automation();
        } else if transition.from == Mode::Automation {
            if let Some(closed) =
                self.with_pause(|pause| pause.leave_automation(now, &transition.reason))
            {
                changes.push(StateChange::Pause(closed));
            }
        }
    }

    /// Runs a pause operation and books any pause it closed.
    fn with_pause<F>(&mut self, operation: F) -> Option<PauseTransition>
    where
        F: FnOnce(&mut PauseController) -> Option<PauseTransition>,
    {
        let before = self.pause.state().cumulative_paused();
        let transition = operation(&mut self.pause);
        let closed = self.pause.state().cumulative_paused().saturating_sub(before);
        if !closed.is_zero() {
            self.stats.add_paused(closed);
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PauseStatus;

    fn state(now: Instant) -> SessionState {
        SessionState::new("s".into(), &SimulatorConfig::default(), now)
    }

    #[test]
    fn pause_hidden_outside_automation() {
        let t0 = Instant::now();
        let mut state = state(t0);
        assert_eq!(state.pause().map(PauseState::status), Some(PauseStatus::Active));

        let changes = state.observe(IdleSample::new(0.0, false), true, t0);
        assert!(matches!(changes.as_slice(), [StateChange::Mode(t)] if t.to == Mode::Locked));
        assert!(state.pause().is_none());
        assert!(state.manual_pause(t0).is_none());
    }

    #[test]
    fn lock_closes_open_pause_and_books_time() {
        let t0 = Instant::now();
        let mut state = state(t0);
        assert!(state.manual_pause(t0).is_some());

        let changes = state.observe(
            IdleSample::new(400.0, false),
            true,
            t0 + Duration::from_secs(6),
        );
        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[1], StateChange::Pause(PauseTransition::Resumed { .. })));
        assert_eq!(state.stats().total_paused(), Duration::from_secs(6));
        assert!(!state.is_paused());
    }

    #[test]
    fn manual_pause_accounting_excludes_paused_time() {
        let t0 = Instant::now();
        let mut state = state(t0);
        state.manual_pause(t0 + Duration::from_secs(5));
        assert!(state.manual_pause(t0 + Duration::from_secs(7)).is_none());
        state.manual_resume(t0 + Duration::from_secs(15));

        let now = t0 + Duration::from_secs(30);
        assert_eq!(state.total_paused(now), Duration::from_secs(10));
        assert_eq!(state.active_duration(now), Duration::from_secs(20));
    }

    #[test]
    fn mode_change_tick_skips_pause_evaluation() {
        let t0 = Instant::now();
        let mut config = SimulatorConfig::default();
        config.pause.pause_threshold_secs = 1;
        let mut state = SessionState::new("s".into(), &config, t0);

        let changes = state.observe(IdleSample::new(0.0, false), false, t0);
        assert!(matches!(changes.as_slice(), [StateChange::Mode(t)] if t.to == Mode::UserControlled));
        assert!(state.pause().is_none());
    }

    #[test]
    fn finished_session_freezes_clock() {
        let t0 = Instant::now();
        let mut state = state(t0);
        state.finish(SessionStatus::Stopped, t0 + Duration::from_secs(10), None);
        assert_eq!(state.elapsed(t0 + Duration::from_secs(100)), Duration::from_secs(10));
        assert!(state
            .observe(IdleSample::new(0.0, false), false, t0 + Duration::from_secs(11))
            .is_empty());
    }
}
