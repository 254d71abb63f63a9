//! Periodic workers of a running session and the guard that turns a failed
//! worker into a session fault.

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info};
use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::{ActionScheduler, EngineContext};
use crate::models::SessionEvent;
use crate::session::StateChange;

/// A loop that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct LoopFault {
    pub loop_name: &'static str,
    pub reason: String,
}

/// Spawns `work` and reports its failure on `faults`. A clean return is
/// not a fault.
pub fn spawn_guarded<F>(
    loop_name: &'static str,
    work: F,
    faults: mpsc::UnboundedSender<LoopFault>,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let reason = match tokio::spawn(work).await {
            Ok(Ok(())) => {
                debug!("{loop_name} loop exited");
                return;
            }
            Ok(Err(err)) => format!("{loop_name} loop failed: {err:#}"),
            Err(join_err) if join_err.is_panic() => format!("{loop_name} loop panicked"),
            Err(join_err) => format!("{loop_name} loop aborted: {join_err}"),
        };
        error!("{reason}");
        if faults.send(LoopFault { loop_name, reason }).is_err() {
            error!("No session left to receive the {loop_name} fault");
        }
    })
}

/// Lock, mode and pause evaluation once per tick.
pub async fn presence_loop(ctx: EngineContext) -> Result<()> {
    let mut ticker = interval(ctx.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let locked = ctx.idle.is_locked().await;
        let sample = ctx.idle.sample().await;
        for reason in ctx.idle.take_degradation_notices() {
            ctx.events.emit(SessionEvent::TelemetryDegraded {
                session_id: ctx.session_id.clone(),
                reason,
                at: Utc::now(),
            });
        }

        let changes = {
            let mut state = ctx.state.lock().await;
            if ctx.cancel.is_cancelled() || !state.is_running() {
                break;
            }
            state.observe(sample, locked, Instant::now())
        };
        emit_changes(&ctx, changes);
    }

    info!("Presence loop stopped");
    Ok(())
}

pub async fn scheduler_loop(ctx: EngineContext) -> Result<()> {
    ActionScheduler::new(ctx).run().await
}

/// Companion health checks every `check_interval`, or right away when a
/// forced recovery is requested.
pub async fn companion_loop(ctx: EngineContext) -> Result<()> {
    let mut ticker = interval(ctx.config.check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = ctx.companion.woken() => {}
        }

        let mode = ctx.state.lock().await.mode().mode;
        ctx.companion.check(mode).await?;
    }

    info!("Companion monitor stopped");
    Ok(())
}

pub async fn snapshot_loop(ctx: EngineContext) -> Result<()> {
    let mut ticker = interval(ctx.config.snapshot_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; nothing worth reporting yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let snapshot = ctx.snapshot().await;
        ctx.events.emit(SessionEvent::Snapshot { snapshot });
    }
    Ok(())
}

/// Publishes state changes in the order they happened.
pub fn emit_changes(ctx: &EngineContext, changes: Vec<StateChange>) {
    for change in changes {
        let event = match change {
            StateChange::Mode(transition) => SessionEvent::ModeChanged {
                session_id: ctx.session_id.clone(),
                transition,
            },
            StateChange::Pause(transition) => SessionEvent::PauseChanged {
                session_id: ctx.session_id.clone(),
                transition,
            },
        };
        ctx.events.emit(event);
    }
}
