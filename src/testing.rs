//! Scripted stand-ins for the platform traits.
//!
//! Used by unit tests and by the integration tests under `tests/`; nothing in
//! here touches the real desktop.

use anyhow::{anyhow, bail, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::models::{ActionCategory, ProcessHandle};
use crate::platform::{
    ActionRequest, EditorLauncher, InputSynthesizer, InputTelemetry, Platform, WindowManager,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Idle/lock telemetry with values set by the test.
pub struct ScriptedTelemetry {
    idle_seconds: Mutex<f64>,
    locked: AtomicBool,
    available: AtomicBool,
    delay: Option<Duration>,
    queries: AtomicUsize,
}

impl ScriptedTelemetry {
    pub fn new(idle_seconds: f64) -> Self {
        Self {
            idle_seconds: Mutex::new(idle_seconds),
            locked: AtomicBool::new(false),
            available: AtomicBool::new(true),
            delay: None,
            queries: AtomicUsize::new(0),
        }
    }

    /// Every query fails, as on a platform without idle telemetry.
    pub fn unavailable() -> Self {
        let telemetry = Self::new(0.0);
        telemetry.available.store(false, Ordering::SeqCst);
        telemetry
    }

    /// Every query blocks for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_idle(&self, idle_seconds: f64) {
        *guard(&self.idle_seconds) = idle_seconds;
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn answer<T>(&self, value: impl FnOnce() -> T) -> Result<T> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if !self.available.load(Ordering::SeqCst) {
            bail!("telemetry unavailable");
        }
        Ok(value())
    }
}

impl InputTelemetry for ScriptedTelemetry {
    fn idle_seconds(&self) -> Result<f64> {
        self.answer(|| *guard(&self.idle_seconds))
    }

    fn is_locked(&self) -> Result<bool> {
        self.answer(|| self.locked.load(Ordering::SeqCst))
    }
}

/// Records every action request; chosen categories can be made to fail.
#[derive(Default)]
pub struct RecordingSynthesizer {
    performed: Mutex<Vec<ActionRequest>>,
    failing: Mutex<HashSet<ActionCategory>>,
    fail_all: AtomicBool,
    panic_on_perform: AtomicBool,
}

impl RecordingSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_category(&self, category: ActionCategory) {
        guard(&self.failing).insert(category);
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Makes the next action panic, simulating an unexpected loop fault.
    pub fn panic_on_perform(&self) {
        self.panic_on_perform.store(true, Ordering::SeqCst);
    }

    pub fn performed(&self) -> Vec<ActionRequest> {
        guard(&self.performed).clone()
    }

    pub fn count(&self) -> usize {
        guard(&self.performed).len()
    }
}

impl InputSynthesizer for RecordingSynthesizer {
    fn perform(&self, request: &ActionRequest) -> Result<String> {
        if self.panic_on_perform.load(Ordering::SeqCst) {
            panic!("synthesizer exploded");
        }
        guard(&self.performed).push(request.clone());
        if self.fail_all.load(Ordering::SeqCst) || guard(&self.failing).contains(&request.category) {
            return Err(anyhow!("{} rejected by test", request.category));
        }
        Ok(format!("fake {}", request.category))
    }
}

/// Window table driven by the test.
pub struct FakeWindows {
    windows: Mutex<Vec<String>>,
    frontmost: Mutex<Option<String>>,
    activation_works: AtomicBool,
    editor_alive: AtomicBool,
    activations: AtomicUsize,
}

impl Default for FakeWindows {
    fn default() -> Self {
        Self {
            windows: Mutex::new(Vec::new()),
            frontmost: Mutex::new(None),
            activation_works: AtomicBool::new(true),
            editor_alive: AtomicBool::new(true),
            activations: AtomicUsize::new(0),
        }
    }
}

impl FakeWindows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_window(&self, title: impl Into<String>) {
        let title = title.into();
        *guard(&self.frontmost) = Some(title.clone());
        guard(&self.windows).push(title);
    }

    pub fn close_all(&self) {
        guard(&self.windows).clear();
        *guard(&self.frontmost) = None;
    }

    pub fn set_frontmost(&self, title: Option<&str>) {
        *guard(&self.frontmost) = title.map(str::to_string);
    }

    pub fn set_activation_works(&self, works: bool) {
        self.activation_works.store(works, Ordering::SeqCst);
    }

    pub fn set_editor_alive(&self, alive: bool) {
        self.editor_alive.store(alive, Ordering::SeqCst);
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }
}

impl WindowManager for FakeWindows {
    fn activate_by_title(&self, title: &str) -> Result<bool> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        if !self.activation_works.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let found = guard(&self.windows)
            .iter()
            .find(|window| window.contains(title))
            .cloned();
        match found {
            Some(window) => {
                *guard(&self.frontmost) = Some(window);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_windows(&self, fragment: &str) -> Result<Vec<String>> {
        Ok(guard(&self.windows)
            .iter()
            .filter(|window| window.contains(fragment))
            .cloned()
            .collect())
    }

    fn active_window_title(&self) -> Result<Option<String>> {
        Ok(guard(&self.frontmost).clone())
    }

    fn is_process_alive(&self, _handle: &ProcessHandle) -> bool {
        self.editor_alive.load(Ordering::SeqCst)
    }
}

/// Editor launcher that "opens" files by registering a window on
/// [`FakeWindows`], or fails on demand.
pub struct FakeEditor {
    windows: Arc<FakeWindows>,
    works: AtomicBool,
    next_pid: AtomicU32,
    opened: Mutex<Vec<PathBuf>>,
}

impl FakeEditor {
    pub fn new(windows: Arc<FakeWindows>) -> Self {
        Self {
            windows,
            works: AtomicBool::new(true),
            next_pid: AtomicU32::new(40_000),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn set_works(&self, works: bool) {
        self.works.store(works, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        guard(&self.opened).clone()
    }
}

impl EditorLauncher for FakeEditor {
    fn open(&self, path: &Path) -> Result<ProcessHandle> {
        guard(&self.opened).push(path.to_path_buf());
        if !self.works.load(Ordering::SeqCst) {
            bail!("no editor available for {}", path.display());
        }
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        self.windows.open_window(format!("{name} - Fake Editor"));
        self.windows.set_editor_alive(true);
        Ok(ProcessHandle::from_pid(self.next_pid.fetch_add(1, Ordering::SeqCst)))
    }
}

/// Every fake wired together, with handles kept for assertions.
pub struct FakeDesktop {
    pub telemetry: Arc<ScriptedTelemetry>,
    pub input: Arc<RecordingSynthesizer>,
    pub windows: Arc<FakeWindows>,
    pub editor: Arc<FakeEditor>,
}

impl FakeDesktop {
    pub fn new(idle_seconds: f64) -> Self {
        Self::with_telemetry(ScriptedTelemetry::new(idle_seconds))
    }

    pub fn with_telemetry(telemetry: ScriptedTelemetry) -> Self {
        let windows = Arc::new(FakeWindows::new());
        Self {
            telemetry: Arc::new(telemetry),
            input: Arc::new(RecordingSynthesizer::new()),
            editor: Arc::new(FakeEditor::new(Arc::clone(&windows))),
            windows,
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            telemetry: self.telemetry.clone(),
            input: self.input.clone(),
            windows: self.windows.clone(),
            editor: self.editor.clone(),
        }
    }
}
