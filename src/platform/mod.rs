//! Seams to the operating system.
//!
//! The engine never touches the desktop directly: idle/lock telemetry, input
//! synthesis, window lookups and the editor launch all go through these traits
//! so sessions can run against [`desktop`] on a real machine or against the
//! scripted fakes in [`crate::testing`].

pub mod desktop;
pub mod idle;

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::Arc;

use crate::models::{ActionCategory, ProcessHandle};

pub use desktop::title_matches;
pub use idle::IdleMonitor;

/// Idle and lock state reported by the OS.
pub trait InputTelemetry: Send + Sync {
    /// Seconds since the last input of any origin.
    fn idle_seconds(&self) -> Result<f64>;
    fn is_locked(&self) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub category: ActionCategory,
    pub locked: bool,
    /// Title of the companion window; required for text entry.
    pub target_window: Option<String>,
}

/// Performs one simulated action and returns a short description of it.
pub trait InputSynthesizer: Send + Sync {
    fn perform(&self, request: &ActionRequest) -> Result<String>;
}

pub trait WindowManager: Send + Sync {
    fn activate_by_title(&self, title: &str) -> Result<bool>;
    fn find_windows(&self, fragment: &str) -> Result<Vec<String>>;
    fn active_window_title(&self) -> Result<Option<String>>;
    fn is_process_alive(&self, handle: &ProcessHandle) -> bool;
}

/// Opens a file in the user's default editor.
pub trait EditorLauncher: Send + Sync {
    fn open(&self, path: &Path) -> Result<ProcessHandle>;
}

/// Bundle of collaborator handles shared by every loop of a session.
#[derive(Clone)]
pub struct Platform {
    pub telemetry: Arc<dyn InputTelemetry>,
    pub input: Arc<dyn InputSynthesizer>,
    pub windows: Arc<dyn WindowManager>,
    pub editor: Arc<dyn EditorLauncher>,
}

impl Platform {
    /// Command-backed implementation for the current desktop.
    pub fn desktop() -> Self {
        let bridge = Arc::new(desktop::DesktopBridge::detect());
        Self {
            telemetry: bridge.clone(),
            input: bridge.clone(),
            windows: bridge.clone(),
            editor: bridge,
        }
    }
}

/// Runs a synchronous platform call off the async workers. A panic inside the
/// call comes back as an error.
pub(crate) async fn run_blocking<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|err| anyhow!("platform call failed: {err}"))
}
