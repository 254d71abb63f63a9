use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, Transaction};
use tokio::sync::oneshot;

use super::SessionRecorder;
use crate::models::{PauseStatus, SessionEvent, SessionSnapshot, SessionStatus};

const CURRENT_SCHEMA_VERSION: i32 = 2;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct RecorderInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RecorderInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to recorder thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join recorder thread: {join_err:?}");
            }
        }
    }
}

/// A session row as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub activities: u64,
    pub active_ms: u64,
    pub paused_ms: u64,
    pub final_mode: Option<String>,
    pub failure_reason: Option<String>,
    pub event_count: u64,
}

/// SQLite-backed recorder. All statements run on one worker thread; events
/// are submitted without waiting for the write.
#[derive(Clone)]
pub struct SqliteRecorder {
    inner: Arc<RecorderInner>,
    db_path: Arc<PathBuf>,
}

impl SqliteRecorder {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("stayactive-recorder".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Recorder initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Recorder thread shutting down");
            })
            .context("failed to spawn recorder worker thread")?;

        ready_rx
            .recv()
            .context("recorder worker exited before signaling readiness")??;

        info!("Session database ready at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(RecorderInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Runs `task` on the worker and waits for its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Recorder caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to recorder thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("recorder thread terminated unexpectedly"))?
    }

    /// Queues `task` without waiting; failures are logged on the worker.
    fn submit<F>(&self, label: &'static str, task: F) -> Result<()>
    where
        F: FnOnce(&mut Connection) -> Result<()> + Send + 'static,
    {
        let command = DbCommand::Execute(Box::new(move |conn| {
            if let Err(err) = task(conn) {
                error!("Recorder failed to {label}: {err:#}");
            }
        }));
        self.inner
            .sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to recorder thread: {err}"))
    }

    /// Sessions still marked Running belong to a process that died without
    /// stopping them.
    pub async fn mark_interrupted_sessions(&self) -> Result<usize> {
        self.execute(|conn| {
            let now = Utc::now().to_rfc3339();
            let updated = conn
                .execute(
                    "UPDATE sessions
                     SET status = ?1,
                         stopped_at = COALESCE(stopped_at, ?2),
                         updated_at = ?2
                     WHERE status = ?3",
                    params![
                        SessionStatus::Interrupted.as_str(),
                        now,
                        SessionStatus::Running.as_str()
                    ],
                )
                .context("failed to mark interrupted sessions")?;
            Ok(updated)
        })
        .await
    }

    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<RecordedSession>> {
        let limit = to_i64(limit as u64)?;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.started_at, s.stopped_at, s.status, s.activities, s.active_ms,
                        s.paused_ms, s.final_mode, s.failure_reason,
                        (SELECT COUNT(*) FROM session_events e WHERE e.session_id = s.id)
                 FROM sessions s
                 ORDER BY s.started_at DESC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(RecordedSession {
                    id: row.get(0)?,
                    started_at: parse_datetime(&row.get::<_, String>(1)?)?,
                    stopped_at: row
                        .get::<_, Option<String>>(2)?
                        .map(|value| parse_datetime(&value))
                        .transpose()?,
                    status: status_from_str(&row.get::<_, String>(3)?)?,
                    activities: to_u64(row.get(4)?)?,
                    active_ms: to_u64(row.get(5)?)?,
                    paused_ms: to_u64(row.get(6)?)?,
                    final_mode: row.get(7)?,
                    failure_reason: row.get(8)?,
                    event_count: to_u64(row.get(9)?)?,
                });
            }
            Ok(sessions)
        })
        .await
    }
}

impl SessionRecorder for SqliteRecorder {
    fn record(&self, event: &SessionEvent) -> Result<()> {
        let event = event.clone();
        self.submit("record session event", move |conn| write_event(conn, &event))
    }
}

fn write_event(conn: &mut Connection, event: &SessionEvent) -> Result<()> {
    let Some(session_id) = event.session_id().map(str::to_string) else {
        return Ok(());
    };
    let at = event.at().to_rfc3339();
    let tx = conn.transaction().context("failed to open event transaction")?;

    match event {
        SessionEvent::SessionStarted { config, .. } => {
            tx.execute(
                "INSERT INTO sessions (id, started_at, status, config_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?2)",
                params![
                    session_id,
                    at,
                    SessionStatus::Running.as_str(),
                    config.to_string()
                ],
            )
            .context("failed to insert session")?;
        }
        SessionEvent::Snapshot { snapshot } => insert_snapshot(&tx, &session_id, snapshot)?,
        SessionEvent::SessionStopped { summary, .. } => {
            tx.execute(
                "UPDATE sessions
                 SET status = ?1, stopped_at = ?2, activities = ?3, failed_actions = ?4,
                     active_ms = ?5, paused_ms = ?6, final_mode = ?7, updated_at = ?2
                 WHERE id = ?8",
                params![
                    SessionStatus::Stopped.as_str(),
                    at,
                    to_i64(summary.activities_performed)?,
                    to_i64(summary.failed_actions)?,
                    to_i64(summary.active_ms)?,
                    to_i64(summary.paused_ms)?,
                    summary.mode.as_str(),
                    session_id,
                ],
            )
            .context("failed to finalize session")?;
        }
        SessionEvent::SessionFailed { reason, .. } => {
            tx.execute(
                "UPDATE sessions
                 SET status = ?1, stopped_at = ?2, failure_reason = ?3, updated_at = ?2
                 WHERE id = ?4",
                params![SessionStatus::Failed.as_str(), at, reason, session_id],
            )
            .context("failed to mark session failed")?;
        }
        _ => {}
    }

    // Snapshots have their own table.
    if !matches!(event, SessionEvent::Snapshot { .. }) {
        tx.execute(
            "INSERT INTO session_events (session_id, kind, occurred_at, description, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                event.kind(),
                at,
                event.describe(),
                serde_json::to_string(event)?,
            ],
        )
        .context("failed to insert session event")?;
    }

    tx.commit().context("failed to commit session event")?;
    Ok(())
}

fn insert_snapshot(tx: &Transaction<'_>, session_id: &str, snapshot: &SessionSnapshot) -> Result<()> {
    tx.execute(
        "INSERT INTO snapshots (session_id, taken_at, mode, paused, idle_seconds, activities,
                                activity_percentage, companion_status, cpu_percent, memory_mb)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            session_id,
            snapshot.timestamp.to_rfc3339(),
            snapshot.mode.as_str(),
            snapshot.pause == Some(PauseStatus::Paused),
            snapshot.idle_seconds,
            to_i64(snapshot.activities_performed)?,
            snapshot.activity_percentage,
            snapshot.companion.as_ref().map(|view| view.status.as_str()),
            snapshot.cpu_percent.map(f64::from),
            snapshot.memory_mb,
        ],
    )
    .context("failed to insert snapshot")?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database version ({version}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})"
        );
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        let schema = match next_version {
            1 => include_str!("schemas/schema_v1.sql"),
            2 => include_str!("schemas/schema_v2.sql"),
            _ => bail!("unknown migration target version: {next_version}"),
        };
        tx.execute_batch(schema)
            .with_context(|| format!("migration to version {next_version} failed"))?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    Ok(())
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("value {value} is negative"))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn status_from_str(value: &str) -> Result<SessionStatus> {
    match value {
        "Idle" => Ok(SessionStatus::Idle),
        "Running" => Ok(SessionStatus::Running),
        "Stopped" => Ok(SessionStatus::Stopped),
        "Failed" => Ok(SessionStatus::Failed),
        "Interrupted" => Ok(SessionStatus::Interrupted),
        _ => Err(anyhow!("unknown session status '{value}'")),
    }
}
