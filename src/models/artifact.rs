use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Child;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactStatus {
    NotCreated,
    Active,
    Inactive,
    Recovering,
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::NotCreated => "NotCreated",
            ArtifactStatus::Active => "Active",
            ArtifactStatus::Inactive => "Inactive",
            ArtifactStatus::Recovering => "Recovering",
            ArtifactStatus::Failed => "Failed",
        }
    }
}

impl Default for ArtifactStatus {
    fn default() -> Self {
        ArtifactStatus::NotCreated
    }
}

/// Handle on the editor process showing the companion artifact.
///
/// `child` is present when this process spawned the editor directly; handles
/// found by pid alone are checked through the process table.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub child: Option<Arc<Mutex<Child>>>,
}

impl ProcessHandle {
    pub fn from_child(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(Arc::new(Mutex::new(child))),
        }
    }

    pub fn from_pid(pid: u32) -> Self {
        Self { pid, child: None }
    }

    /// Terminates the spawned editor if it is still running. Handles without
    /// an owned child are left alone.
    pub fn terminate(&self) -> std::io::Result<()> {
        let Some(child) = &self.child else {
            return Ok(());
        };
        let mut guard = match child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.try_wait()?.is_none() {
            guard.kill()?;
            let _ = guard.wait();
        }
        Ok(())
    }
}

/// The recoverable text file plus editor window used as a typing target.
///
/// `status` is the single authoritative state; `last_known_active` only
/// mirrors whether the last health check saw it usable.
#[derive(Debug)]
pub struct CompanionArtifact {
    pub path: Option<PathBuf>,
    pub window_title: Option<String>,
    pub process: Option<ProcessHandle>,
    pub status: ArtifactStatus,
    pub last_known_active: bool,
    pub recovery_attempts: u32,
    pub max_recovery_attempts: u32,
    pub backups: Vec<PathBuf>,
    pub last_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CompanionArtifact {
    pub fn new(max_recovery_attempts: u32) -> Self {
        Self {
            path: None,
            window_title: None,
            process: None,
            status: ArtifactStatus::NotCreated,
            last_known_active: false,
            recovery_attempts: 0,
            max_recovery_attempts,
            backups: Vec::new(),
            last_reason: None,
            updated_at: Utc::now(),
        }
    }

    /// Consumes one recovery attempt. Returns `false` once the budget is
    /// exhausted, leaving the counter at the cap.
    pub fn try_consume_attempt(&mut self) -> bool {
        if self.recovery_attempts >= self.max_recovery_attempts {
            return false;
        }
        self.recovery_attempts += 1;
        true
    }

    pub fn set_status(&mut self, status: ArtifactStatus, reason: impl Into<String>) {
        self.status = status;
        self.last_known_active = status == ArtifactStatus::Active;
        self.last_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    pub fn remember_backup(&mut self, path: PathBuf) {
        if !self.backups.contains(&path) {
            self.backups.push(path);
        }
    }

    pub fn view(&self) -> CompanionView {
        CompanionView {
            path: self.path.clone(),
            window_title: self.window_title.clone(),
            status: self.status,
            recovery_attempts: self.recovery_attempts,
            max_recovery_attempts: self.max_recovery_attempts,
            last_reason: self.last_reason.clone(),
        }
    }
}

/// Read-only copy of the artifact record for snapshots and the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompanionView {
    pub path: Option<PathBuf>,
    pub window_title: Option<String>,
    pub status: ArtifactStatus,
    pub recovery_attempts: u32,
    pub max_recovery_attempts: u32,
    pub last_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_never_exceed_cap() {
        let mut artifact = CompanionArtifact::new(2);
        assert!(artifact.try_consume_attempt());
        assert!(artifact.try_consume_attempt());
        assert!(!artifact.try_consume_attempt());
        assert_eq!(artifact.recovery_attempts, 2);
    }

    #[test]
    fn status_drives_last_known_active() {
        let mut artifact = CompanionArtifact::new(3);
        artifact.set_status(ArtifactStatus::Active, "created");
        assert!(artifact.last_known_active);
        artifact.set_status(ArtifactStatus::Inactive, "file missing");
        assert!(!artifact.last_known_active);
        assert_eq!(artifact.view().last_reason.as_deref(), Some("file missing"));
    }
}
