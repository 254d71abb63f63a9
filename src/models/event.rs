use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    ActionCategory, ArtifactStatus, CompanionView, Mode, ModeTransition, PauseStatus,
    PauseTransition, SessionStatus,
};

/// Periodic view of a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: SessionStatus,
    pub mode: Mode,
    pub mode_reason: String,
    pub pause: Option<PauseStatus>,
    pub pause_count: u32,
    pub idle_seconds: f64,
    pub telemetry_degraded: bool,
    pub activities_performed: u64,
    pub failed_actions: u64,
    pub bursts: u64,
    pub category_counts: BTreeMap<ActionCategory, u64>,
    pub elapsed_ms: u64,
    pub active_ms: u64,
    pub paused_ms: u64,
    pub activity_percentage: f64,
    pub target_percentage: u8,
    pub companion: Option<CompanionView>,
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<f64>,
}

/// Everything the engine reports. Pure output: nothing reads these back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    SessionStarted {
        session_id: String,
        at: DateTime<Utc>,
        config: serde_json::Value,
    },
    ModeChanged {
        session_id: String,
        transition: ModeTransition,
    },
    PauseChanged {
        session_id: String,
        transition: PauseTransition,
    },
    TelemetryDegraded {
        session_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    ActionFailed {
        session_id: String,
        category: ActionCategory,
        reason: String,
        at: DateTime<Utc>,
    },
    BurstCompleted {
        session_id: String,
        performed: Vec<String>,
        succeeded: u32,
        failed: u32,
        total_activities: u64,
        locked: bool,
        at: DateTime<Utc>,
    },
    BurstSkipped {
        session_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    CompanionChanged {
        session_id: String,
        status: ArtifactStatus,
        recovery_attempts: u32,
        reason: String,
        at: DateTime<Utc>,
    },
    Snapshot {
        snapshot: SessionSnapshot,
    },
    SessionStopped {
        session_id: String,
        summary: SessionSnapshot,
        at: DateTime<Utc>,
    },
    SessionFailed {
        session_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionEvent::SessionStarted { session_id, .. }
            | SessionEvent::ModeChanged { session_id, .. }
            | SessionEvent::PauseChanged { session_id, .. }
            | SessionEvent::TelemetryDegraded { session_id, .. }
            | SessionEvent::ActionFailed { session_id, .. }
            | SessionEvent::BurstCompleted { session_id, .. }
            | SessionEvent::BurstSkipped { session_id, .. }
            | SessionEvent::CompanionChanged { session_id, .. }
            | SessionEvent::SessionStopped { session_id, .. }
            | SessionEvent::SessionFailed { session_id, .. } => Some(session_id),
            SessionEvent::Snapshot { snapshot } => snapshot.session_id.as_deref(),
        }
    }

    /// When the event happened.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            SessionEvent::SessionStarted { at, .. }
            | SessionEvent::TelemetryDegraded { at, .. }
            | SessionEvent::ActionFailed { at, .. }
            | SessionEvent::BurstCompleted { at, .. }
            | SessionEvent::BurstSkipped { at, .. }
            | SessionEvent::CompanionChanged { at, .. }
            | SessionEvent::SessionStopped { at, .. }
            | SessionEvent::SessionFailed { at, .. } => *at,
            SessionEvent::ModeChanged { transition, .. } => transition.at,
            SessionEvent::PauseChanged { transition, .. } => transition.at(),
            SessionEvent::Snapshot { snapshot } => snapshot.timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "session_started",
            SessionEvent::ModeChanged { .. } => "mode_changed",
            SessionEvent::PauseChanged { .. } => "pause_changed",
            SessionEvent::TelemetryDegraded { .. } => "telemetry_degraded",
            SessionEvent::ActionFailed { .. } => "action_failed",
            SessionEvent::BurstCompleted { .. } => "burst_completed",
            SessionEvent::BurstSkipped { .. } => "burst_skipped",
            SessionEvent::CompanionChanged { .. } => "companion_changed",
            SessionEvent::Snapshot { .. } => "snapshot",
            SessionEvent::SessionStopped { .. } => "session_stopped",
            SessionEvent::SessionFailed { .. } => "session_failed",
        }
    }

    /// Human-readable line used by the log recorder and the CLI.
    pub fn describe(&self) -> String {
        match self {
            SessionEvent::SessionStarted { session_id, .. } => {
                format!("session {session_id} started")
            }
            SessionEvent::ModeChanged { transition, .. } => format!(
                "mode {} -> {}: {}",
                transition.from.as_str(),
                transition.to.as_str(),
                transition.reason
            ),
            SessionEvent::PauseChanged { transition, .. } => match transition {
                PauseTransition::Paused { origin, reason, .. } => {
                    format!("paused ({origin:?}): {reason}")
                }
                PauseTransition::Resumed {
                    origin,
                    reason,
                    paused_ms,
                    ..
                } => format!(
                    "resumed ({origin:?}) after {:.0}s: {reason}",
                    *paused_ms as f64 / 1000.0
                ),
            },
            SessionEvent::TelemetryDegraded { reason, .. } => {
                format!("idle/lock telemetry unavailable, using defaults: {reason}")
            }
            SessionEvent::ActionFailed {
                category, reason, ..
            } => format!("{category} failed: {reason}"),
            SessionEvent::BurstCompleted {
                performed,
                total_activities,
                locked,
                ..
            } => format!(
                "{}performed: {} (total: {total_activities})",
                if *locked { "[locked] " } else { "" },
                if performed.is_empty() {
                    "nothing".to_string()
                } else {
                    performed.join(", ")
                }
            ),
            SessionEvent::BurstSkipped { reason, .. } => format!("burst skipped: {reason}"),
            SessionEvent::CompanionChanged {
                status,
                recovery_attempts,
                reason,
                ..
            } => format!(
                "companion {} (recoveries {recovery_attempts}): {reason}",
                status.as_str()
            ),
            SessionEvent::Snapshot { snapshot } => format!(
                "snapshot: mode={} idle={:.0}s activities={} active={:.1}%",
                snapshot.mode.as_str(),
                snapshot.idle_seconds,
                snapshot.activities_performed,
                snapshot.activity_percentage
            ),
            SessionEvent::SessionStopped { summary, .. } => format!(
                "session stopped: {:.1} min total, {:.1} min active, {:.1} min paused ({} pauses), {} activities, {} recoveries, final mode {}",
                summary.elapsed_ms as f64 / 60_000.0,
                summary.active_ms as f64 / 60_000.0,
                summary.paused_ms as f64 / 60_000.0,
                summary.pause_count,
                summary.activities_performed,
                summary
                    .companion
                    .as_ref()
                    .map(|companion| companion.recovery_attempts)
                    .unwrap_or(0),
                summary.mode.as_str()
            ),
            SessionEvent::SessionFailed { reason, .. } => format!("session failed: {reason}"),
        }
    }
}
