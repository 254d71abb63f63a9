use log::info;
use std::time::{Duration, Instant};

use crate::config::ModeSettings;
use crate::models::{IdleSample, Mode, ModeState, ModeTransition};

/// Automation / UserControlled / Locked state machine.
///
/// Automation hands over to the user as soon as idle time drops below the
/// activation threshold, and only takes control back after the inactivity
/// threshold has passed since the last genuine input. The gap between the
/// two thresholds keeps the controller from flapping.
pub struct ModeController {
    settings: ModeSettings,
    state: ModeState,
    last_user_activity: Instant,
    /// Input at or before this instant cannot trigger an automatic hand-over;
    /// set by a manual toggle so the keystrokes that issued it don't count.
    manual_hold_until: Option<Instant>,
}

impl ModeController {
    pub fn new(settings: ModeSettings, now: Instant) -> Self {
        Self {
            settings,
            state: ModeState::default(),
            last_user_activity: now,
            manual_hold_until: None,
        }
    }

    pub fn state(&self) -> &ModeState {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn last_user_activity(&self) -> Instant {
        self.last_user_activity
    }

    /// One evaluation tick. Lock is checked first; a transition to or from
    /// Locked ends the tick.
    pub fn evaluate(
        &mut self,
        sample: &IdleSample,
        locked: bool,
        running: bool,
        now: Instant,
    ) -> Option<ModeTransition> {
        let input_at = (!sample.degraded)
            .then(|| now.checked_sub(Duration::from_secs_f64(sample.idle_seconds)))
            .flatten();
        if let Some(input_at) = input_at {
            if input_at > self.last_user_activity {
                self.last_user_activity = input_at;
            }
        }

        if locked {
            if self.state.mode == Mode::Locked {
                return None;
            }
            return Some(self.transition(Mode::Locked, "session locked"));
        }

        if self.state.mode == Mode::Locked {
            self.last_user_activity = now;
            return Some(self.transition(Mode::Automation, "session unlocked"));
        }

        if sample.degraded {
            if self.state.mode == Mode::Automation {
                return None;
            }
            return Some(self.transition(Mode::Automation, "idle telemetry unavailable"));
        }

        if !self.settings.auto_switch {
            return None;
        }

        match self.state.mode {
            Mode::Automation => {
                let activation = self.settings.activation_threshold_secs as f64;
                let held = match (self.manual_hold_until, input_at) {
                    (Some(hold), Some(input_at)) => input_at <= hold,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if running && !held && sample.idle_seconds < activation {
                    return Some(self.transition(
                        Mode::UserControlled,
                        format!(
                            "user activity detected (idle {:.0}s < {}s)",
                            sample.idle_seconds, self.settings.activation_threshold_secs
                        ),
                    ));
                }
                None
            }
            Mode::UserControlled => {
                let inactive_for = now.saturating_duration_since(self.last_user_activity);
                if inactive_for >= Duration::from_secs(self.settings.inactivity_threshold_secs) {
                    return Some(self.transition(
                        Mode::Automation,
                        format!("user inactive for {:.0}s", inactive_for.as_secs_f64()),
                    ));
                }
                None
            }
            Mode::Locked => None,
        }
    }

    /// Manual switch between Automation and UserControlled. Ignored while
    /// Locked.
    pub fn toggle(&mut self, now: Instant) -> Option<ModeTransition> {
        let target = match self.state.mode {
            Mode::Automation => Mode::UserControlled,
            Mode::UserControlled => Mode::Automation,
            Mode::Locked => {
                info!("Mode toggle ignored while the session is locked");
                return None;
            }
        };
        self.last_user_activity = now;
        self.manual_hold_until = Some(now);
        Some(self.transition(target, "manual switch"))
    }

    fn transition(&mut self, to: Mode, reason: impl Into<String>) -> ModeTransition {
        let transition = ModeTransition::new(self.state.mode, to, reason);
        info!(
            "Mode {} -> {}: {}",
            transition.from.as_str(),
            transition.to.as_str(),
            transition.reason
        );
        self.state.apply(&transition);
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ModeSettings {
        ModeSettings {
            auto_switch: true,
            activation_threshold_secs: 30,
            inactivity_threshold_secs: 180,
        }
    }

    fn idle(secs: f64) -> IdleSample {
        IdleSample::new(secs, false)
    }

    #[test]
    fn hands_over_on_user_activity() {
        let t0 = Instant::now();
        let mut controller = ModeController::new(settings(), t0);
        assert!(controller.evaluate(&idle(45.0), false, true, t0).is_none());

        let transition = controller
            .evaluate(&idle(10.0), false, true, t0 + Duration::from_secs(1))
            .expect("should switch");
        assert_eq!(transition.to, Mode::UserControlled);
        assert_eq!(controller.state().epoch, 1);
    }

    #[test]
    fn not_while_stopped() {
        let t0 = Instant::now();
        let mut controller = ModeController::new(settings(), t0);
        assert!(controller.evaluate(&idle(1.0), false, false, t0).is_none());
        assert_eq!(controller.mode(), Mode::Automation);
    }

    #[test]
    fn oscillating_idle_does_not_flap_back() {
        let t0 = Instant::now();
        let mut controller = ModeController::new(settings(), t0);
        controller.evaluate(&idle(10.0), false, true, t0);
        assert_eq!(controller.mode(), Mode::UserControlled);

        // idle bounces 10s / 40s every 5s for ten minutes
        for step in 1..=120u64 {
            let now = t0 + Duration::from_secs(step * 5);
            let reading = if step % 2 == 0 { 10.0 } else { 40.0 };
            assert!(controller.evaluate(&idle(reading), false, true, now).is_none());
            assert_eq!(controller.mode(), Mode::UserControlled);
        }

        // user walks away at t_last; idle grows from there
        let t_last = t0 + Duration::from_secs(600);
        for secs in [30u64, 90, 150, 179] {
            let now = t_last + Duration::from_secs(secs);
            assert!(controller
                .evaluate(&idle(secs as f64), false, true, now)
                .is_none());
        }
        let now = t_last + Duration::from_secs(180);
        let transition = controller
            .evaluate(&idle(180.0), false, true, now)
            .expect("should return to automation");
        assert_eq!(transition.to, Mode::Automation);
    }

    #[test]
    fn lock_preempts_and_unlock_returns_to_automation() {
        let t0 = Instant::now();
        let mut controller = ModeController::new(settings(), t0);
        controller.evaluate(&idle(5.0), false, true, t0);
        assert_eq!(controller.mode(), Mode::UserControlled);

        let locked = controller
            .evaluate(&idle(5.0), true, true, t0 + Duration::from_secs(1))
            .expect("lock");
        assert_eq!((locked.from, locked.to), (Mode::UserControlled, Mode::Locked));
        assert!(controller
            .evaluate(&idle(500.0), true, true, t0 + Duration::from_secs(2))
            .is_none());

        let unlocked = controller
            .evaluate(&idle(1.0), false, true, t0 + Duration::from_secs(3))
            .expect("unlock");
        assert_eq!(unlocked.to, Mode::Automation);
        assert_eq!(controller.state().epoch, 3);
    }

    #[test]
    fn manual_toggle_ignores_thresholds_and_holds() {
        let t0 = Instant::now();
        let mut controller = ModeController::new(settings(), t0);
        controller.evaluate(&idle(2.0), false, true, t0);
        assert_eq!(controller.mode(), Mode::UserControlled);

        let now = t0 + Duration::from_secs(5);
        let toggled = controller.toggle(now).expect("toggle");
        assert_eq!(toggled.to, Mode::Automation);
        assert_eq!(controller.last_user_activity(), now);

        // the keystrokes that issued the toggle are older than the toggle
        assert!(controller
            .evaluate(&idle(1.5), false, true, now + Duration::from_secs(1))
            .is_none());

        // fresh input afterwards hands control back
        let later = now + Duration::from_secs(20);
        let transition = controller
            .evaluate(&idle(2.0), false, true, later)
            .expect("fresh input");
        assert_eq!(transition.to, Mode::UserControlled);
    }

    #[test]
    fn toggle_is_noop_while_locked() {
        let t0 = Instant::now();
        let mut controller = ModeController::new(settings(), t0);
        controller.evaluate(&idle(100.0), true, true, t0);
        assert!(controller.toggle(t0).is_none());
        assert_eq!(controller.mode(), Mode::Locked);
    }

    #[test]
    fn degraded_telemetry_holds_automation() {
        let t0 = Instant::now();
        let mut controller = ModeController::new(settings(), t0);
        controller.evaluate(&idle(1.0), false, true, t0);
        assert_eq!(controller.mode(), Mode::UserControlled);

        let degraded = IdleSample::new(0.0, true);
        let transition = controller
            .evaluate(&degraded, false, true, t0 + Duration::from_secs(1))
            .expect("back to automation");
        assert_eq!(transition.to, Mode::Automation);
        for step in 2..10 {
            assert!(controller
                .evaluate(&degraded, false, true, t0 + Duration::from_secs(step))
                .is_none());
        }
    }

    #[test]
    fn auto_switch_disabled_keeps_mode() {
        let t0 = Instant::now();
        let mut controller = ModeController::new(
            ModeSettings {
                auto_switch: false,
                ..settings()
            },
            t0,
        );
        assert!(controller.evaluate(&idle(0.0), false, true, t0).is_none());
        assert_eq!(controller.mode(), Mode::Automation);
    }
}
