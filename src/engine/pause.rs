use log::info;
use std::time::{Duration, Instant};

use crate::config::PauseSettings;
use crate::models::{IdleSample, PauseOrigin, PauseState, PauseTransition};

/// Active/Paused controller evaluated only while the session is in
/// Automation mode. The owning session decides when to call it.
pub struct PauseController {
    settings: PauseSettings,
    state: PauseState,
    /// Start of the current run of samples below the pause threshold.
    busy_since: Option<Instant>,
}

impl PauseController {
    pub fn new(settings: PauseSettings) -> Self {
        Self {
            settings,
            state: PauseState::default(),
            busy_since: None,
        }
    }

    pub fn state(&self) -> &PauseState {
        &self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    /// Automatic pause/resume from one idle sample. Suspended while telemetry
    /// is degraded.
    pub fn evaluate(&mut self, sample: &IdleSample, now: Instant) -> Option<PauseTransition> {
        if !self.settings.auto_pause || sample.degraded {
            self.busy_since = None;
            return None;
        }

        if self.state.is_paused() {
            let resume_at = self.settings.resume_threshold_secs as f64;
            if sample.idle_seconds >= resume_at {
                return self.resume(
                    now,
                    PauseOrigin::Auto,
                    format!("user idle for {:.0}s", sample.idle_seconds),
                );
            }
            return None;
        }

        let threshold = self.settings.pause_threshold_secs;
        if sample.idle_seconds >= threshold as f64 {
            self.busy_since = None;
            return None;
        }

        let since = *self.busy_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= Duration::from_secs(threshold) {
            return self.pause(now, PauseOrigin::Auto, "sustained user activity");
        }
        None
    }

    pub fn manual_pause(&mut self, now: Instant) -> Option<PauseTransition> {
        if self.state.is_paused() {
            info!("Pause requested while already paused; nothing to do");
            return None;
        }
        self.pause(now, PauseOrigin::Manual, "manual pause")
    }

    pub fn manual_resume(&mut self, now: Instant) -> Option<PauseTransition> {
        if !self.state.is_paused() {
            info!("Resume requested while already active; nothing to do");
            return None;
        }
        self.resume(now, PauseOrigin::Manual, "manual resume")
    }

    /// Closes any open pause because the session left Automation.
    pub fn leave_automation(&mut self, now: Instant, reason: &str) -> Option<PauseTransition> {
        self.busy_since = None;
        if !self.state.is_paused() {
            return None;
        }
        self.resume(now, PauseOrigin::ModeChange, format!("left automation: {reason}"))
    }

    pub fn enter_automation(&mut self) {
        self.busy_since = None;
    }

    fn pause(&mut self, now: Instant, origin: PauseOrigin, reason: &str) -> Option<PauseTransition> {
        self.busy_since = None;
        if !self.state.pause(now, reason) {
            return None;
        }
        info!("Paused ({origin:?}): {reason}");
        Some(PauseTransition::paused(origin, reason))
    }

    fn resume(
        &mut self,
        now: Instant,
        origin: PauseOrigin,
        reason: impl Into<String>,
    ) -> Option<PauseTransition> {
        let reason = reason.into();
        let paused_for = self.state.resume(now, reason.clone())?;
        self.busy_since = None;
        info!(
            "Resumed ({origin:?}) after {:.1}s: {reason}",
            paused_for.as_secs_f64()
        );
        Some(PauseTransition::resumed(origin, reason, paused_for))
    }
}
