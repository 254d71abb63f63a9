use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{CompanionSettings, SimulatorConfig};
use crate::models::{ArtifactStatus, CompanionArtifact, CompanionView, Mode, SessionEvent};
use crate::platform::{run_blocking, title_matches, Platform};
use crate::recorder::EventBus;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Keeps the companion text artifact open in an editor and recovers it with
/// a bounded number of attempts.
///
/// The artifact record sits behind one async mutex that is held for a whole
/// check, recovery included, so overlapping checks and a forced recovery
/// never interleave.
pub struct CompanionMonitor {
    settings: CompanionSettings,
    session_id: String,
    session_started: DateTime<Utc>,
    target_percentage: u8,
    artifact: Mutex<CompanionArtifact>,
    platform: Platform,
    events: EventBus,
    cancel: CancellationToken,
    force_requested: AtomicBool,
    wake: Notify,
}

impl CompanionMonitor {
    pub fn new(
        session_id: String,
        config: &SimulatorConfig,
        platform: Platform,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings: config.companion.clone(),
            session_id,
            session_started: Utc::now(),
            target_percentage: config.target_percentage,
            artifact: Mutex::new(CompanionArtifact::new(config.companion.max_recovery_attempts)),
            platform,
            events,
            cancel,
            force_requested: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub async fn view(&self) -> CompanionView {
        self.artifact.lock().await.view()
    }

    /// Window title to type into, if the artifact is usable right now. Never
    /// waits on a check in progress.
    pub fn typing_target(&self) -> Option<String> {
        let artifact = self.artifact.try_lock().ok()?;
        (artifact.status == ArtifactStatus::Active)
            .then(|| artifact.window_title.clone())
            .flatten()
    }

    /// Queues a forced recovery for the next check and wakes the monitor.
    pub fn request_force_recovery(&self) {
        self.force_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Resolves when a forced recovery has been requested.
    pub async fn woken(&self) {
        self.wake.notified().await
    }

    /// One health check. Does nothing while the session is locked; a pending
    /// forced recovery stays queued until it is unlocked.
    pub async fn check(&self, mode: Mode) -> Result<()> {
        if mode == Mode::Locked {
            return Ok(());
        }

        let mut artifact = self.artifact.lock().await;

        if self.force_requested.swap(false, Ordering::SeqCst) {
            log_info!(
                "Forced recovery: resetting recovery attempts ({} used)",
                artifact.recovery_attempts
            );
            artifact.recovery_attempts = 0;
            if artifact.status != ArtifactStatus::Active {
                self.recover(&mut artifact, mode, "forced recovery").await?;
                return Ok(());
            }
        }

        match artifact.status {
            ArtifactStatus::NotCreated => {
                match self.create_artifact(&mut artifact, mode).await? {
                    Ok(()) => self.transition(&mut artifact, ArtifactStatus::Active, "artifact created"),
                    Err(err) => {
                        let reason = format!("initial creation failed: {err:#}");
                        self.transition(&mut artifact, ArtifactStatus::Inactive, reason);
                    }
                }
            }
            ArtifactStatus::Active => {
                if let Some(problem) = self.detect_problem(&artifact, mode).await? {
                    self.transition(&mut artifact, ArtifactStatus::Inactive, problem.clone());
                    self.recover(&mut artifact, mode, &problem).await?;
                }
            }
            ArtifactStatus::Inactive | ArtifactStatus::Recovering => {
                self.recover(&mut artifact, mode, "artifact still inactive").await?;
            }
            ArtifactStatus::Failed => {}
        }
        Ok(())
    }

    /// Stops the editor and keeps the file on disk as a backup.
    pub async fn release(&self) {
        let mut artifact = self.artifact.lock().await;
        if let Err(err) = close_editor(&mut artifact).await {
            log_warn!("Failed to close companion editor: {err:#}");
        }
        if let Some(path) = &artifact.path {
            log_info!("Companion artifact kept as backup: {}", path.display());
        }
    }

    async fn detect_problem(
        &self,
        artifact: &CompanionArtifact,
        mode: Mode,
    ) -> Result<Option<String>> {
        let Some(path) = artifact.path.clone() else {
            return Ok(Some("artifact has no backing file".into()));
        };
        if !path.exists() {
            return Ok(Some(format!("artifact file missing: {}", path.display())));
        }
        let title = artifact.window_title.clone().unwrap_or_default();

        if let Some(process) = artifact.process.clone() {
            let windows = self.platform.windows.clone();
            let lookup_title = title.clone();
            let (alive, open_windows) = run_blocking(move || {
                let alive = windows.is_process_alive(&process);
                let open = if alive {
                    Ok(Vec::new())
                } else {
                    windows.find_windows(&lookup_title)
                };
                (alive, open)
            })
            .await?;
            // launchers like xdg-open exit right away; only a missing window counts
            if !alive && open_windows.map(|found| found.is_empty()).unwrap_or(true) {
                return Ok(Some("editor closed".into()));
            }
        }

        // The user owns focus outside Automation.
        if mode == Mode::Automation {
            let windows = self.platform.windows.clone();
            let lookup_title = title.clone();
            let frontmost_ok = run_blocking(move || {
                let frontmost = windows.active_window_title().ok().flatten().unwrap_or_default();
                if title_matches(&frontmost, &lookup_title) {
                    return true;
                }
                windows.activate_by_title(&lookup_title).unwrap_or(false)
            })
            .await?;
            if !frontmost_ok {
                return Ok(Some("companion window not frontmost".into()));
            }
        }
        Ok(None)
    }

    async fn recover(
        &self,
        artifact: &mut CompanionArtifact,
        mode: Mode,
        cause: &str,
    ) -> Result<()> {
        if !artifact.try_consume_attempt() {
            let reason = format!(
                "recovery attempts exhausted ({}/{}); waiting for a forced recovery",
                artifact.recovery_attempts, artifact.max_recovery_attempts
            );
            self.transition(artifact, ArtifactStatus::Failed, reason);
            return Ok(());
        }

        let attempt = artifact.recovery_attempts;
        let max = artifact.max_recovery_attempts;
        self.transition(
            artifact,
            ArtifactStatus::Recovering,
            format!("recovery attempt {attempt}/{max}: {cause}"),
        );

        if self.reactivate(artifact).await? {
            self.transition(artifact, ArtifactStatus::Active, "window reactivated");
            return Ok(());
        }

        if let Some(path) = self.reopen_backup(artifact).await? {
            let reason = format!("reopened backup {}", path.display());
            self.transition(artifact, ArtifactStatus::Active, reason);
            return Ok(());
        }

        match self.create_artifact(artifact, mode).await? {
            Ok(()) => self.transition(artifact, ArtifactStatus::Active, "created new artifact"),
            Err(err) => {
                log_error!("Companion recovery attempt {attempt}/{max} failed: {err:#}");
                let reason = format!("recovery attempt {attempt}/{max} failed: {err:#}");
                self.transition(artifact, ArtifactStatus::Inactive, reason);
            }
        }
        Ok(())
    }

    async fn reactivate(&self, artifact: &CompanionArtifact) -> Result<bool> {
        let (Some(path), Some(title)) = (artifact.path.clone(), artifact.window_title.clone())
        else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        let windows = self.platform.windows.clone();
        run_blocking(move || windows.activate_by_title(&title).unwrap_or(false)).await
    }

    async fn reopen_backup(&self, artifact: &mut CompanionArtifact) -> Result<Option<PathBuf>> {
        let candidates: Vec<PathBuf> = artifact
            .backups
            .iter()
            .rev()
            .filter(|path| path.exists())
            .cloned()
            .collect();

        if !candidates.is_empty() {
            close_editor(artifact).await?;
        }
        for path in candidates {
            let editor = self.platform.editor.clone();
            let open_path = path.clone();
            match run_blocking(move || editor.open(&open_path)).await? {
                Ok(process) => {
                    self.settle().await;
                    artifact.window_title = file_title(&path);
                    artifact.path = Some(path.clone());
                    artifact.process = Some(process);
                    return Ok(Some(path));
                }
                Err(err) => log_warn!("Could not reopen backup {}: {err:#}", path.display()),
            }
        }
        Ok(None)
    }

    /// Writes a fresh artifact and opens it. The outer `Result` is a loop
    /// fault; the inner one is an ordinary creation failure.
    async fn create_artifact(
        &self,
        artifact: &mut CompanionArtifact,
        mode: Mode,
    ) -> Result<Result<()>> {
        let path = match self.write_artifact(mode, artifact.recovery_attempts) {
            Ok(path) => path,
            Err(err) => return Ok(Err(err)),
        };
        close_editor(artifact).await?;

        let editor = self.platform.editor.clone();
        let open_path = path.clone();
        match run_blocking(move || editor.open(&open_path)).await? {
            Ok(process) => {
                self.settle().await;
                log_info!("Companion artifact opened: {}", path.display());
                artifact.window_title = file_title(&path);
                artifact.path = Some(path.clone());
                artifact.process = Some(process);
                artifact.remember_backup(path);
                Ok(Ok(()))
            }
            Err(err) => {
                if let Err(remove_err) = std::fs::remove_file(&path) {
                    log_warn!("Failed to remove unopened artifact {}: {remove_err}", path.display());
                }
                Ok(Err(err))
            }
        }
    }

    fn write_artifact(&self, mode: Mode, recovery_count: u32) -> Result<PathBuf> {
        let directory = self
            .settings
            .directory
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("failed to create {}", directory.display()))?;

        let prefix = format!("stayactive_{}_", Utc::now().format("%Y%m%d_%H%M%S"));
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".txt")
            .tempfile_in(&directory)
            .with_context(|| format!("failed to create artifact in {}", directory.display()))?;

        let header = format!(
            "Activity session notes\n\
             Session: {}\n\
             Created: {}\n\
             Session started: {}\n\
             Target activity: {}%\n\
             Mode: {}\n\
             Recovery count: {}\n\
             {}\n\n",
            self.session_id,
            Utc::now().to_rfc3339(),
            self.session_started.to_rfc3339(),
            self.target_percentage,
            mode.as_str(),
            recovery_count,
            "-".repeat(40)
        );
        file.write_all(header.as_bytes())
            .context("failed to write artifact header")?;

        let (_, path) = file
            .keep()
            .map_err(|err| anyhow!("failed to keep artifact file: {err}"))?;
        Ok(path)
    }

    async fn settle(&self) {
        let delay = Duration::from_millis(self.settings.settle_delay_ms);
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn transition(
        &self,
        artifact: &mut CompanionArtifact,
        status: ArtifactStatus,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        log_info!("Companion {} -> {}: {reason}", artifact.status.as_str(), status.as_str());
        artifact.set_status(status, reason.clone());
        self.events.emit(SessionEvent::CompanionChanged {
            session_id: self.session_id.clone(),
            status,
            recovery_attempts: artifact.recovery_attempts,
            reason,
            at: Utc::now(),
        });
    }
}

/// Terminates the editor of the previous artifact, if any, so a replacement
/// never leaves it running unreachable.
async fn close_editor(artifact: &mut CompanionArtifact) -> Result<()> {
    let Some(process) = artifact.process.take() else {
        return Ok(());
    };
    let pid = process.pid;
    match run_blocking(move || process.terminate()).await? {
        Ok(()) => log_info!("Closed companion editor (pid {pid})"),
        Err(err) => log_warn!("Failed to close companion editor (pid {pid}): {err}"),
    }
    Ok(())
}

fn file_title(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDesktop;

    fn monitor(desktop: &FakeDesktop, dir: &Path, max_attempts: u32) -> CompanionMonitor {
        let mut config = SimulatorConfig::default();
        config.companion.max_recovery_attempts = max_attempts;
        config.companion.settle_delay_ms = 0;
        config.companion.directory = Some(dir.to_path_buf());
        CompanionMonitor::new(
            "test-session".into(),
            &config,
            desktop.platform(),
            EventBus::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn first_check_creates_artifact_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = FakeDesktop::new(0.0);
        let monitor = monitor(&desktop, dir.path(), 3);

        monitor.check(Mode::Automation).await.unwrap();
        let view = monitor.view().await;
        assert_eq!(view.status, ArtifactStatus::Active);
        let path = view.path.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Session: test-session"));
        assert!(contents.contains("Target activity: 50%"));
        assert_eq!(monitor.typing_target(), view.window_title);
    }

    #[tokio::test]
    async fn missing_file_exhausts_bounded_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = FakeDesktop::new(0.0);
        let monitor = monitor(&desktop, dir.path(), 3);
        monitor.check(Mode::Automation).await.unwrap();

        let path = monitor.view().await.path.unwrap();
        std::fs::remove_file(&path).unwrap();
        desktop.editor.set_works(false);

        for _ in 0..6 {
            monitor.check(Mode::Automation).await.unwrap();
        }
        let view = monitor.view().await;
        assert_eq!(view.recovery_attempts, 3);
        assert_eq!(view.status, ArtifactStatus::Failed);
        assert!(monitor.typing_target().is_none());

        // further checks leave it alone
        monitor.check(Mode::Automation).await.unwrap();
        assert_eq!(monitor.view().await.recovery_attempts, 3);
    }

    #[tokio::test]
    async fn forced_recovery_resets_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = FakeDesktop::new(0.0);
        let monitor = monitor(&desktop, dir.path(), 1);
        monitor.check(Mode::Automation).await.unwrap();

        std::fs::remove_file(monitor.view().await.path.unwrap()).unwrap();
        desktop.editor.set_works(false);
        monitor.check(Mode::Automation).await.unwrap();
        monitor.check(Mode::Automation).await.unwrap();
        assert_eq!(monitor.view().await.status, ArtifactStatus::Failed);

        desktop.editor.set_works(true);
        monitor.request_force_recovery();
        monitor.check(Mode::Automation).await.unwrap();
        let view = monitor.view().await;
        assert_eq!(view.status, ArtifactStatus::Active);
        assert_eq!(view.recovery_attempts, 1);
        assert!(view.path.unwrap().exists());
    }

    #[tokio::test]
    async fn closed_editor_reopens_existing_file_as_backup() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = FakeDesktop::new(0.0);
        let monitor = monitor(&desktop, dir.path(), 3);
        monitor.check(Mode::Automation).await.unwrap();
        let original = monitor.view().await.path.unwrap();

        desktop.windows.close_all();
        desktop.windows.set_editor_alive(false);
        monitor.check(Mode::Automation).await.unwrap();

        let view = monitor.view().await;
        assert_eq!(view.status, ArtifactStatus::Active);
        assert_eq!(view.path.as_deref(), Some(original.as_path()));
        assert_eq!(view.recovery_attempts, 1);
        assert_eq!(desktop.editor.opened().len(), 2);
    }

    #[tokio::test]
    async fn lost_focus_is_fixed_without_a_recovery_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = FakeDesktop::new(0.0);
        let monitor = monitor(&desktop, dir.path(), 3);
        monitor.check(Mode::Automation).await.unwrap();

        desktop.windows.set_frontmost(Some("Inbox - Mail"));
        monitor.check(Mode::Automation).await.unwrap();
        let view = monitor.view().await;
        assert_eq!(view.status, ArtifactStatus::Active);
        assert_eq!(view.recovery_attempts, 0);
        assert!(desktop.windows.activations() >= 1);
    }

    #[tokio::test]
    async fn suspended_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = FakeDesktop::new(0.0);
        let monitor = monitor(&desktop, dir.path(), 3);
        monitor.check(Mode::Locked).await.unwrap();
        assert_eq!(monitor.view().await.status, ArtifactStatus::NotCreated);
        assert!(desktop.editor.opened().is_empty());
    }

    /// Opens files in real child processes so termination can be observed.
    #[cfg(unix)]
    struct SpawningEditor {
        windows: std::sync::Arc<crate::testing::FakeWindows>,
        spawned: std::sync::Mutex<Vec<crate::models::ProcessHandle>>,
    }

    #[cfg(unix)]
    impl crate::platform::EditorLauncher for SpawningEditor {
        fn open(&self, path: &Path) -> Result<crate::models::ProcessHandle> {
            let child = std::process::Command::new("sleep").arg("60").spawn()?;
            let handle = crate::models::ProcessHandle::from_child(child);
            let name = file_title(path).unwrap_or_default();
            self.windows.open_window(format!("{name} - sleep"));
            self.spawned.lock().unwrap().push(handle.clone());
            Ok(handle)
        }
    }

    #[cfg(unix)]
    fn exited(handle: &crate::models::ProcessHandle) -> bool {
        let child = handle.child.as_ref().unwrap();
        child.lock().unwrap().try_wait().unwrap().is_some()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn replacing_the_artifact_closes_the_previous_editor() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = FakeDesktop::new(0.0);
        let editor = std::sync::Arc::new(SpawningEditor {
            windows: desktop.windows.clone(),
            spawned: std::sync::Mutex::new(Vec::new()),
        });
        let mut config = SimulatorConfig::default();
        config.companion.settle_delay_ms = 0;
        config.companion.directory = Some(dir.path().to_path_buf());
        let monitor = CompanionMonitor::new(
            "test-session".into(),
            &config,
            Platform {
                editor: editor.clone(),
                ..desktop.platform()
            },
            EventBus::default(),
            CancellationToken::new(),
        );

        monitor.check(Mode::Automation).await.unwrap();
        std::fs::remove_file(monitor.view().await.path.unwrap()).unwrap();
        monitor.check(Mode::Automation).await.unwrap();
        assert_eq!(monitor.view().await.status, ArtifactStatus::Active);

        let spawned = editor.spawned.lock().unwrap().clone();
        assert_eq!(spawned.len(), 2);
        assert!(exited(&spawned[0]), "first editor closed on replacement");
        assert!(!exited(&spawned[1]));

        monitor.release().await;
        assert!(exited(&spawned[1]));
    }

    #[tokio::test]
    async fn release_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = FakeDesktop::new(0.0);
        let monitor = monitor(&desktop, dir.path(), 3);
        monitor.check(Mode::Automation).await.unwrap();
        monitor.release().await;
        assert!(monitor.view().await.path.unwrap().exists());
    }
}
