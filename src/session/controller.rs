use chrono::Utc;
use log::{error, info, warn};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::SessionState;
use crate::config::SimulatorConfig;
use crate::engine::loops::{
    companion_loop, emit_changes, presence_loop, scheduler_loop, snapshot_loop, spawn_guarded,
};
use crate::engine::{CompanionMonitor, EngineContext, LoopFault};
use crate::error::SessionError;
use crate::metrics::ProcessMetrics;
use crate::models::{Mode, PauseTransition, SessionEvent, SessionSnapshot, SessionStatus};
use crate::platform::{IdleMonitor, Platform};
use crate::recorder::EventBus;

const DEFAULT_TICK: Duration = Duration::from_secs(1);
/// Upper bound on waiting for one loop to notice cancellation.
const LOOP_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveSession {
    ctx: EngineContext,
    loops: Vec<JoinHandle<()>>,
}

struct ControllerInner {
    platform: Platform,
    events: EventBus,
    metrics: ProcessMetrics,
    tick: Duration,
    active: Mutex<Option<ActiveSession>>,
    /// Most recently finished session, kept for status queries.
    last: Mutex<Option<EngineContext>>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().as_ref() {
            warn!(
                "Controller dropped with session {} still running; cancelling",
                session.ctx.session_id
            );
            session.ctx.cancel.cancel();
        }
    }
}

/// The control surface: start, stop, pause, resume, toggle, force recovery.
///
/// Each command only touches shared state and returns; the work happens on
/// the session's background loops.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(platform: Platform, events: EventBus) -> Self {
        Self::with_tick(platform, events, DEFAULT_TICK)
    }

    /// Same as [`SessionController::new`] with a custom loop granularity.
    pub fn with_tick(platform: Platform, events: EventBus, tick: Duration) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                platform,
                events,
                metrics: ProcessMetrics::new(),
                tick,
                active: Mutex::new(None),
                last: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Validates `config` and starts a session. Nothing is spawned and no
    /// state changes when validation fails.
    pub async fn start(&self, config: SimulatorConfig) -> Result<String, SessionError> {
        config.validate()?;

        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            return Err(SessionError::AlreadyRunning);
        }

        let config_json =
            serde_json::to_value(&config).map_err(|err| SessionError::Internal(err.into()))?;
        let session_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let config = Arc::new(config);
        let platform = self.inner.platform.clone();

        let ctx = EngineContext {
            session_id: session_id.clone(),
            state: Arc::new(Mutex::new(SessionState::new(
                session_id.clone(),
                &config,
                Instant::now(),
            ))),
            idle: Arc::new(IdleMonitor::new(platform.telemetry.clone(), &config.idle)),
            companion: Arc::new(CompanionMonitor::new(
                session_id.clone(),
                &config,
                platform.clone(),
                self.inner.events.clone(),
                cancel.clone(),
            )),
            config: Arc::clone(&config),
            platform,
            metrics: self.inner.metrics.clone(),
            events: self.inner.events.clone(),
            cancel: cancel.clone(),
            tick: self.inner.tick,
        };

        self.inner.events.emit(SessionEvent::SessionStarted {
            session_id: session_id.clone(),
            at: Utc::now(),
            config: config_json,
        });

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let mut loops = vec![
            spawn_guarded("presence", presence_loop(ctx.clone()), fault_tx.clone()),
            spawn_guarded("scheduler", scheduler_loop(ctx.clone()), fault_tx.clone()),
            spawn_guarded("snapshot", snapshot_loop(ctx.clone()), fault_tx.clone()),
        ];
        if config.companion.enabled {
            loops.push(spawn_guarded(
                "companion",
                companion_loop(ctx.clone()),
                fault_tx.clone(),
            ));
        }
        drop(fault_tx);

        tokio::spawn(reap(
            Arc::downgrade(&self.inner),
            session_id.clone(),
            cancel,
            fault_rx,
        ));

        *active = Some(ActiveSession { ctx, loops });
        info!(
            "Session {session_id} started (target {}%, intensity {:?})",
            config.target_percentage, config.intensity
        );
        Ok(session_id)
    }

    /// Stops the running session and returns its summary.
    pub async fn stop(&self) -> Result<SessionSnapshot, SessionError> {
        let session_id = self.active_ctx().await?.session_id;
        self.inner
            .teardown(&session_id, SessionStatus::Stopped, None)
            .await
            .ok_or(SessionError::NotRunning)
    }

    /// Returns `false` when there was nothing to pause.
    pub async fn manual_pause(&self) -> Result<bool, SessionError> {
        let ctx = self.active_ctx().await?;
        let transition = ctx.state.lock().await.manual_pause(Instant::now());
        Ok(publish_pause(&ctx, transition))
    }

    /// Returns `false` when the session was not paused.
    pub async fn manual_resume(&self) -> Result<bool, SessionError> {
        let ctx = self.active_ctx().await?;
        let transition = ctx.state.lock().await.manual_resume(Instant::now());
        Ok(publish_pause(&ctx, transition))
    }

    /// Flips between Automation and UserControlled; returns the mode after
    /// the command.
    pub async fn toggle_mode(&self) -> Result<Mode, SessionError> {
        let ctx = self.active_ctx().await?;
        let (changes, mode) = {
            let mut state = ctx.state.lock().await;
            let changes = state.toggle_mode(Instant::now());
            (changes, state.mode().mode)
        };
        emit_changes(&ctx, changes);
        Ok(mode)
    }

    /// Resets the companion's recovery budget and recovers on the next check.
    pub async fn force_recovery(&self) -> Result<(), SessionError> {
        let ctx = self.active_ctx().await?;
        if !ctx.companion.enabled() {
            info!("Force recovery ignored: companion artifact is disabled");
            return Ok(());
        }
        ctx.companion.request_force_recovery();
        Ok(())
    }

    /// Live snapshot of the running session, or the final one of the last.
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let ctx = match self.active_ctx().await {
            Ok(ctx) => ctx,
            Err(_) => self.inner.last.lock().await.clone()?,
        };
        Some(ctx.snapshot().await)
    }

    pub async fn status(&self) -> SessionStatus {
        if self.inner.active.lock().await.is_some() {
            return SessionStatus::Running;
        }
        let last = self.inner.last.lock().await.clone();
        match last {
            Some(ctx) => ctx.state.lock().await.status(),
            None => SessionStatus::Idle,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.status().await == SessionStatus::Running
    }

    async fn active_ctx(&self) -> Result<EngineContext, SessionError> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|session| session.ctx.clone())
            .ok_or(SessionError::NotRunning)
    }
}

impl ControllerInner {
    /// Ends session `session_id` if it is still the active one. Returns the
    /// final snapshot, or `None` when someone else already tore it down.
    async fn teardown(
        &self,
        session_id: &str,
        status: SessionStatus,
        failure: Option<String>,
    ) -> Option<SessionSnapshot> {
        let session = {
            let mut active = self.active.lock().await;
            let current = active
                .as_ref()
                .is_some_and(|session| session.ctx.session_id == session_id);
            if current {
                active.take()
            } else {
                None
            }
        }?;
        let ctx = session.ctx;

        ctx.cancel.cancel();
        ctx.state
            .lock()
            .await
            .finish(status, Instant::now(), failure.clone());

        for handle in session.loops {
            let abort = handle.abort_handle();
            if tokio::time::timeout(LOOP_EXIT_TIMEOUT, handle).await.is_err() {
                warn!("A loop of session {session_id} did not exit in time; aborting it");
                abort.abort();
            }
        }

        if ctx.companion.enabled() {
            ctx.companion.release().await;
        }

        let summary = ctx.snapshot().await;
        log_summary(&summary);
        let event = match failure {
            Some(reason) => SessionEvent::SessionFailed {
                session_id: session_id.to_string(),
                reason,
                at: Utc::now(),
            },
            None => SessionEvent::SessionStopped {
                session_id: session_id.to_string(),
                summary: summary.clone(),
                at: Utc::now(),
            },
        };
        *self.last.lock().await = Some(ctx);
        self.events.emit(event);
        Some(summary)
    }
}

/// Waits for the first loop fault of a session and fails the session with
/// it. Exits quietly once the session is cancelled.
async fn reap(
    inner: Weak<ControllerInner>,
    session_id: String,
    cancel: CancellationToken,
    mut faults: mpsc::UnboundedReceiver<LoopFault>,
) {
    let fault = tokio::select! {
        biased;
        fault = faults.recv() => fault,
        _ = cancel.cancelled() => None,
    };
    let Some(fault) = fault else {
        return;
    };
    let Some(inner) = inner.upgrade() else {
        return;
    };
    error!(
        "Session {session_id} failed in its {} loop; stopping",
        fault.loop_name
    );
    inner
        .teardown(&session_id, SessionStatus::Failed, Some(fault.reason))
        .await;
}

fn publish_pause(ctx: &EngineContext, transition: Option<PauseTransition>) -> bool {
    match transition {
        Some(transition) => {
            ctx.events.emit(SessionEvent::PauseChanged {
                session_id: ctx.session_id.clone(),
                transition,
            });
            true
        }
        None => false,
    }
}

fn log_summary(summary: &SessionSnapshot) {
    info!("=== Session summary ===");
    info!(
        "Total time: {:.1} min, active: {:.1} min, paused: {:.1} min ({} pauses)",
        summary.elapsed_ms as f64 / 60_000.0,
        summary.active_ms as f64 / 60_000.0,
        summary.paused_ms as f64 / 60_000.0,
        summary.pause_count
    );
    info!(
        "Activities: {} ({} failed, {} bursts), activity {:.1}% of target {}%",
        summary.activities_performed,
        summary.failed_actions,
        summary.bursts,
        summary.activity_percentage,
        summary.target_percentage
    );
    for (category, count) in &summary.category_counts {
        info!("  {category}: {count}");
    }
    if let Some(companion) = &summary.companion {
        info!(
            "Companion: {} after {} recoveries",
            companion.status.as_str(),
            companion.recovery_attempts
        );
    }
    info!("Final mode: {}", summary.mode.as_str());
}
