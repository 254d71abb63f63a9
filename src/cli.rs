use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::config::{IntensityProfile, SimulatorConfig};
use crate::models::{PauseStatus, SessionEvent, SessionSnapshot};
use crate::platform::Platform;
use crate::recorder::{spawn_pump, EventBus, LogRecorder, SqliteRecorder};
use crate::session::{ControlCommand, SessionController};
use crate::settings::SettingsStore;

const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum IntensityArg {
    Custom,
    Low,
    Medium,
    High,
    Auto,
}

impl From<IntensityArg> for IntensityProfile {
    fn from(value: IntensityArg) -> Self {
        match value {
            IntensityArg::Custom => IntensityProfile::Custom,
            IntensityArg::Low => IntensityProfile::Low,
            IntensityArg::Medium => IntensityProfile::Medium,
            IntensityArg::High => IntensityProfile::High,
            IntensityArg::Auto => IntensityProfile::Auto,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "stayactive")]
#[command(about = "Keeps a workstation session looking active", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Directory for settings.json and the session database
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Timing profile
    #[arg(short, long, value_enum)]
    pub intensity: Option<IntensityArg>,

    /// Target activity percentage (1-100)
    #[arg(short, long)]
    pub target: Option<u8>,

    /// Minimum seconds between bursts (custom intensity)
    #[arg(long)]
    pub min_interval: Option<u64>,

    /// Maximum seconds between bursts (custom intensity)
    #[arg(long)]
    pub max_interval: Option<u64>,

    /// Actions per burst
    #[arg(short, long)]
    pub burst_size: Option<u32>,

    /// One action per cycle
    #[arg(long)]
    pub no_burst: bool,

    /// Seconds to wait before the first burst
    #[arg(long)]
    pub start_delay: Option<u64>,

    /// Skip bursts while a window whose title contains this is frontmost
    #[arg(long = "avoid", value_name = "TITLE")]
    pub avoid_apps: Vec<String>,

    /// Do not open a companion text file
    #[arg(long)]
    pub no_companion: bool,

    /// Never pause on user activity
    #[arg(long)]
    pub no_auto_pause: bool,

    /// Never switch modes on user activity
    #[arg(long)]
    pub no_auto_switch: bool,

    /// Do nothing while the screen is locked
    #[arg(long)]
    pub idle_when_locked: bool,

    /// Use the overrides for this run only
    #[arg(long)]
    pub no_save: bool,

    /// Print the most recent sessions and exit
    #[arg(long, value_name = "N")]
    pub history: Option<usize>,
}

impl Cli {
    /// Applies every flag that was given on top of `config`.
    pub fn apply(&self, config: &mut SimulatorConfig) {
        if let Some(intensity) = self.intensity {
            config.intensity = intensity.into();
        }
        if let Some(target) = self.target {
            config.target_percentage = target;
        }
        if let Some(min) = self.min_interval {
            config.min_interval_secs = min;
        }
        if let Some(max) = self.max_interval {
            config.max_interval_secs = max;
        }
        if (self.min_interval.is_some() || self.max_interval.is_some()) && self.intensity.is_none()
        {
            config.intensity = IntensityProfile::Custom;
        }
        match (self.burst_size, self.intensity) {
            (Some(size), _) => {
                config.burst_size = size;
                config.burst_enabled = true;
            }
            // picking a fixed profile also picks its burst, unless given explicitly
            (None, Some(intensity)) => {
                if let Some(size) = IntensityProfile::from(intensity).preset_burst_size() {
                    config.burst_size = size;
                }
            }
            (None, None) => {}
        }
        if self.no_burst {
            config.burst_enabled = false;
        }
        if let Some(delay) = self.start_delay {
            config.start_delay_secs = delay;
        }
        if !self.avoid_apps.is_empty() {
            config.avoid_apps = self.avoid_apps.clone();
        }
        if self.no_companion {
            config.companion.enabled = false;
        }
        if self.no_auto_pause {
            config.pause.auto_pause = false;
        }
        if self.no_auto_switch {
            config.mode.auto_switch = false;
        }
        if self.idle_when_locked {
            config.work_when_locked = false;
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stayactive")
}

pub async fn execute(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let recorder = SqliteRecorder::open(data_dir.join("sessions.sqlite3"))?;
    let interrupted = recorder.mark_interrupted_sessions().await?;
    if interrupted > 0 {
        warn!("Marked {interrupted} session(s) from a previous run as interrupted");
    }

    if let Some(limit) = cli.history {
        return print_history(&recorder, limit).await;
    }

    let settings = SettingsStore::new(data_dir.join("settings.json"))?;
    let mut config = settings.simulator();
    cli.apply(&mut config);
    config.validate()?;
    if !cli.no_save {
        settings.update_simulator(config.clone())?;
        info!("Settings saved to {}", settings.path().display());
    }

    let bus = EventBus::default();
    let pumps = vec![
        spawn_pump(&bus, Arc::new(LogRecorder)),
        spawn_pump(&bus, Arc::new(recorder.clone())),
    ];
    let mut events = bus.subscribe();
    let controller = SessionController::new(Platform::desktop(), bus);

    let session_id = controller.start(config).await?;
    println!("Session {session_id} running. {}", ControlCommand::HELP);

    let result = command_loop(&controller, &mut events).await;

    if controller.is_running().await {
        match controller.stop().await {
            Ok(summary) => print_summary(&summary),
            Err(err) => warn!("Stop failed: {err}"),
        }
    }

    drop(events);
    drop(controller);
    for pump in pumps {
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
            warn!("Event recorder did not drain in time");
        }
    }
    result
}

/// Reads commands until `stop`, Ctrl-C, or a session failure.
async fn command_loop(
    controller: &SessionController,
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, stopping");
                return Ok(());
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    // detached from a terminal; only Ctrl-C or a failure ends the run
                    stdin_open = false;
                    continue;
                };
                match line.parse::<ControlCommand>() {
                    Ok(ControlCommand::Stop) => return Ok(()),
                    Ok(command) => run_command(controller, command).await,
                    Err(err) => println!("{err}"),
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::SessionFailed { reason, .. }) => {
                    anyhow::bail!("session failed: {reason}");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

async fn run_command(controller: &SessionController, command: ControlCommand) {
    let outcome = match command {
        ControlCommand::Pause => controller.manual_pause().await.map(|changed| {
            let message = if changed { "paused" } else { "nothing to pause" };
            message.to_string()
        }),
        ControlCommand::Resume => controller.manual_resume().await.map(|changed| {
            let message = if changed { "resumed" } else { "not paused" };
            message.to_string()
        }),
        ControlCommand::Toggle => controller
            .toggle_mode()
            .await
            .map(|mode| format!("mode is now {}", mode.as_str())),
        ControlCommand::Recover => controller
            .force_recovery()
            .await
            .map(|()| "companion recovery requested".to_string()),
        ControlCommand::Status => {
            match controller.snapshot().await {
                Some(snapshot) => print_status(&snapshot),
                None => println!("no session"),
            }
            return;
        }
        ControlCommand::Help => Ok(ControlCommand::HELP.to_string()),
        ControlCommand::Stop => return,
    };
    match outcome {
        Ok(message) => println!("{message}"),
        Err(err) => println!("{err}"),
    }
}

fn print_status(snapshot: &SessionSnapshot) {
    println!(
        "{} | mode {} ({}) | {} | idle {:.0}s{}",
        snapshot.status.as_str(),
        snapshot.mode.as_str(),
        snapshot.mode_reason,
        if snapshot.pause == Some(PauseStatus::Paused) {
            "paused"
        } else {
            "active"
        },
        snapshot.idle_seconds,
        if snapshot.telemetry_degraded { " (telemetry degraded)" } else { "" }
    );
    println!(
        "{} activities in {} bursts ({} failed), {:.1}% of target {}%",
        snapshot.activities_performed,
        snapshot.bursts,
        snapshot.failed_actions,
        snapshot.activity_percentage,
        snapshot.target_percentage
    );
    if let Some(companion) = &snapshot.companion {
        println!(
            "companion {} ({} recoveries)",
            companion.status.as_str(),
            companion.recovery_attempts
        );
    }
}

fn print_summary(summary: &SessionSnapshot) {
    println!(
        "Stopped after {:.1} min ({:.1} min active, {:.1} min paused, {} pauses), {} activities, final mode {}",
        summary.elapsed_ms as f64 / 60_000.0,
        summary.active_ms as f64 / 60_000.0,
        summary.paused_ms as f64 / 60_000.0,
        summary.pause_count,
        summary.activities_performed,
        summary.mode.as_str()
    );
}

async fn print_history(recorder: &SqliteRecorder, limit: usize) -> Result<()> {
    let sessions = recorder.recent_sessions(limit).await?;
    if sessions.is_empty() {
        println!("No sessions recorded in {}", recorder.path().display());
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {}  {:<11}  {:>5} activities  {:>6.1} min active  {} events{}",
            session.started_at.format("%Y-%m-%d %H:%M"),
            session.id,
            session.status.as_str(),
            session.activities,
            session.active_ms as f64 / 60_000.0,
            session.event_count,
            session
                .failure_reason
                .map(|reason| format!("  ({reason})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
