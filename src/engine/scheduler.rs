use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use super::selection::{plan_burst, SelectionContext};
use super::EngineContext;
use crate::models::{ActionCategory, BurstPlan, Mode, SessionEvent};
use crate::platform::{run_blocking, ActionRequest};
use crate::session::SessionState;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const INTER_ACTION_DELAY_MS: (u64, u64) = (200, 800);

/// Sleep, select, execute, repeat.
pub struct ActionScheduler {
    ctx: EngineContext,
    rng: StdRng,
}

impl ActionScheduler {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            rng: StdRng::from_entropy(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let start_delay = Duration::from_secs(self.ctx.config.start_delay_secs);
        if !start_delay.is_zero() {
            log_info!("Waiting {}s before the first burst", start_delay.as_secs());
            if !self.ctx.sleep(start_delay).await {
                return Ok(());
            }
        }

        while !self.ctx.cancel.is_cancelled() {
            let (low, high) = {
                let state = self.ctx.state.lock().await;
                if !state.is_running() {
                    break;
                }
                let locked = state.mode().mode == Mode::Locked;
                let timing = self
                    .ctx
                    .config
                    .cycle_timing(state.activity_percentage(Instant::now()));
                self.ctx.config.sleep_bounds(&timing, locked)
            };
            let secs = if high > low {
                self.rng.gen_range(low..=high)
            } else {
                low
            };
            let sleep_interval = Duration::from_secs_f64(secs);

            if !self.ctx.sleep(sleep_interval).await {
                break;
            }
            self.run_cycle(sleep_interval).await?;
        }

        log_info!("Action scheduler stopped");
        Ok(())
    }

    /// Gates, plans and executes one burst after the cycle's sleep.
    pub async fn run_cycle(&mut self, sleep_interval: Duration) -> Result<()> {
        let frontmost = if self.ctx.config.avoid_apps.is_empty() {
            None
        } else {
            let windows = self.ctx.platform.windows.clone();
            run_blocking(move || windows.active_window_title())
                .await?
                .ok()
                .flatten()
        };
        let typing_target = if self.ctx.companion.enabled() {
            self.ctx.companion.typing_target()
        } else {
            None
        };

        let plan = {
            let mut state = self.ctx.state.lock().await;
            if let Some(reason) = self.skip_reason(&state, frontmost.as_deref()) {
                drop(state);
                log_info!("Burst skipped: {reason}");
                self.ctx.events.emit(SessionEvent::BurstSkipped {
                    session_id: self.ctx.session_id.clone(),
                    reason,
                    at: Utc::now(),
                });
                return Ok(());
            }

            let locked = state.mode().mode == Mode::Locked;
            let config = &self.ctx.config;
            let timing = config.cycle_timing(state.activity_percentage(Instant::now()));
            let burst_size = config.burst_size(&timing, locked);
            let context = SelectionContext {
                locked,
                companion_active: typing_target.is_some(),
            };
            let epoch = state.mode_epoch();
            plan_burst(
                &config.actions,
                context,
                sleep_interval,
                burst_size,
                epoch,
                || state.next_selection(),
                &mut self.rng,
            )
        };

        self.execute(plan, typing_target).await
    }

    fn skip_reason(&self, state: &SessionState, frontmost: Option<&str>) -> Option<String> {
        if !state.is_running() {
            return Some("session not running".into());
        }
        match state.mode().mode {
            Mode::UserControlled => return Some("user in control".into()),
            Mode::Locked if !self.ctx.config.work_when_locked => {
                return Some("locked and working while locked is disabled".into())
            }
            Mode::Locked => return None,
            Mode::Automation => {}
        }
        if state.is_paused() {
            return Some("paused".into());
        }
        let title = frontmost?;
        let lowered = title.to_lowercase();
        self.ctx
            .config
            .avoid_apps
            .iter()
            .find(|fragment| !fragment.is_empty() && lowered.contains(&fragment.to_lowercase()))
            .map(|fragment| format!("avoided application '{fragment}' is frontmost ({title})"))
    }

    async fn execute(&mut self, plan: BurstPlan, typing_target: Option<String>) -> Result<()> {
        let total = plan.actions.len();
        let mut performed = Vec::with_capacity(total);
        let mut succeeded = 0u32;
        let mut failed = 0u32;

        for (index, action) in plan.actions.iter().enumerate() {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            {
                let state = self.ctx.state.lock().await;
                if !state.is_running() || state.mode_epoch() != plan.mode_epoch || state.is_paused()
                {
                    log_info!(
                        "Burst aborted after {index} of {total} actions: mode or pause changed"
                    );
                    break;
                }
            }

            let category = action.category;
            let target_window = (category == ActionCategory::TextEntry)
                .then(|| typing_target.clone())
                .flatten();
            if let Some(title) = target_window.clone() {
                let windows = self.ctx.platform.windows.clone();
                if !run_blocking(move || windows.activate_by_title(&title).unwrap_or(false)).await? {
                    log_warn!("Companion window could not be brought to front before typing");
                }
            }

            let request = ActionRequest {
                category,
                locked: plan.locked,
                target_window,
            };
            let input = self.ctx.platform.input.clone();
            self.ctx.idle.mark_synthetic(Instant::now());
            let outcome = run_blocking(move || input.perform(&request)).await?;
            self.ctx.idle.mark_synthetic(Instant::now());

            {
                let mut state = self.ctx.state.lock().await;
                match outcome {
                    Ok(description) => {
                        state.record_success(category);
                        succeeded += 1;
                        performed.push(if action.fallback {
                            format!("{description} (fallback)")
                        } else {
                            description
                        });
                    }
                    Err(err) => {
                        state.record_failure();
                        failed += 1;
                        log_warn!("{category} failed: {err:#}");
                        self.ctx.events.emit(SessionEvent::ActionFailed {
                            session_id: self.ctx.session_id.clone(),
                            category,
                            reason: format!("{err:#}"),
                            at: Utc::now(),
                        });
                    }
                }
            }

            if index + 1 < total {
                let (low, high) = INTER_ACTION_DELAY_MS;
                let pause = Duration::from_millis(self.rng.gen_range(low..=high));
                if !self.ctx.sleep(pause).await {
                    break;
                }
            }
        }

        if succeeded + failed == 0 {
            self.ctx.events.emit(SessionEvent::BurstSkipped {
                session_id: self.ctx.session_id.clone(),
                reason: "aborted before the first action".into(),
                at: Utc::now(),
            });
            return Ok(());
        }

        let total_activities = {
            let mut state = self.ctx.state.lock().await;
            state.record_burst();
            state.stats().activities_performed()
        };
        log_info!(
            "{}Performed: {} (total: {total_activities})",
            if plan.locked { "[locked] " } else { "" },
            performed.join(", ")
        );
        self.ctx.events.emit(SessionEvent::BurstCompleted {
            session_id: self.ctx.session_id.clone(),
            performed,
            succeeded,
            failed,
            total_activities,
            locked: plan.locked,
            at: Utc::now(),
        });
        Ok(())
    }
}
