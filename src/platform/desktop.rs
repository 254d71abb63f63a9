//! Command-line bridge to the desktop session.
//!
//! Linux/X11 goes through `xprintidle`, `loginctl` and `xdotool`; macOS reads
//! `HIDIdleTime` from `ioreg`. Every command runs with a hard timeout, and a
//! missing tool surfaces as an error so the idle monitor can degrade.

use anyhow::{anyhow, bail, Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use wait_timeout::ChildExt;

use crate::models::{ActionCategory, ProcessHandle};

use super::{ActionRequest, EditorLauncher, InputSynthesizer, InputTelemetry, WindowManager};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
/// Typing a phrase takes a while at human speed.
const TYPING_TIMEOUT: Duration = Duration::from_secs(20);
const SCREEN_MARGIN: i64 = 50;

const SAFE_KEYS: &[&str] = &[
    "shift", "ctrl", "alt", "F13", "F14", "F15", "Num_Lock", "Scroll_Lock",
];
const LOCKED_SAFE_KEYS: &[&str] = &["shift", "ctrl", "alt", "Num_Lock", "Scroll_Lock"];

const WORDS: &[&str] = &[
    "analysis", "report", "meeting", "project", "update", "review", "status", "progress",
    "implementation", "development", "testing", "deployment", "monitoring", "evaluation",
    "assessment", "documentation", "requirements", "planning", "coordination", "collaboration",
    "optimization", "verification", "validation", "configuration", "maintenance", "integration",
];
const STARTERS: &[&str] = &["The", "This", "Our", "Current", "Recent", "Updated", "New"];
const CONNECTORS: &[&str] = &["and", "with", "for", "during", "through", "including", "regarding"];

/// Which external tools were found on `PATH` at startup.
#[derive(Debug, Clone, Default)]
pub struct DesktopBridge {
    xdotool: Option<PathBuf>,
    xprintidle: Option<PathBuf>,
    loginctl: Option<PathBuf>,
    ioreg: Option<PathBuf>,
}

impl DesktopBridge {
    pub fn detect() -> Self {
        let bridge = Self {
            xdotool: which::which("xdotool").ok(),
            xprintidle: which::which("xprintidle").ok(),
            loginctl: which::which("loginctl").ok(),
            ioreg: which::which("ioreg").ok(),
        };
        log_info!(
            "Desktop bridge: xdotool={} xprintidle={} loginctl={} ioreg={}",
            bridge.xdotool.is_some(),
            bridge.xprintidle.is_some(),
            bridge.loginctl.is_some(),
            bridge.ioreg.is_some()
        );
        bridge
    }

    fn xdotool(&self) -> Result<&Path> {
        self.xdotool
            .as_deref()
            .ok_or_else(|| anyhow!("xdotool not found on PATH"))
    }

    fn xdo(&self, args: &[&str]) -> Result<String> {
        run_command(self.xdotool()?, args, COMMAND_TIMEOUT)
    }

    fn screen_size(&self) -> Result<(i64, i64)> {
        let output = self.xdo(&["getdisplaygeometry"])?;
        let mut parts = output.split_whitespace().map(str::parse::<i64>);
        match (parts.next(), parts.next()) {
            (Some(Ok(width)), Some(Ok(height))) => Ok((width, height)),
            _ => bail!("unexpected display geometry '{}'", output.trim()),
        }
    }

    fn key_tap(&self, locked: bool) -> Result<String> {
        let keys = if locked { LOCKED_SAFE_KEYS } else { SAFE_KEYS };
        let key = keys
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("shift");
        self.xdo(&["key", key])?;
        Ok(format!("key({key})"))
    }

    fn cursor_sweep(&self, locked: bool) -> Result<String> {
        if locked {
            let (dx, dy) = {
                let mut rng = rand::thread_rng();
                (rng.gen_range(-5..=5), rng.gen_range(-5..=5))
            };
            self.move_relative(dx, dy)?;
            return Ok(format!("cursor_sweep(locked {dx},{dy})"));
        }

        let (width, height) = self.screen_size()?;
        let (x, y) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(SCREEN_MARGIN..(width - SCREEN_MARGIN).max(SCREEN_MARGIN + 1)),
                rng.gen_range(SCREEN_MARGIN..(height - SCREEN_MARGIN).max(SCREEN_MARGIN + 1)),
            )
        };
        self.xdo(&["mousemove", "--sync", &x.to_string(), &y.to_string()])?;
        Ok(format!("cursor_sweep({x},{y})"))
    }

    fn micro_cursor(&self, locked: bool) -> Result<String> {
        let span = if locked { 2 } else { 3 };
        let (dx, dy) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-span..=span), rng.gen_range(-span..=span))
        };
        self.move_relative(dx, dy)?;
        Ok(format!("micro_cursor({dx},{dy})"))
    }

    fn move_relative(&self, dx: i64, dy: i64) -> Result<()> {
        self.xdo(&["mousemove_relative", "--", &dx.to_string(), &dy.to_string()])?;
        Ok(())
    }

    fn text_entry(&self, target_window: Option<&str>) -> Result<String> {
        let target = target_window.ok_or_else(|| anyhow!("no companion window to type into"))?;
        let frontmost = self.active_window_title()?.unwrap_or_default();
        if !title_matches(&frontmost, target) {
            bail!("companion window '{target}' is not frontmost (found '{frontmost}')");
        }

        let phrase = compose_phrase(&mut rand::thread_rng());
        let delay_ms = rand::thread_rng().gen_range(80..=180).to_string();
        run_command(
            self.xdotool()?,
            &["type", "--delay", &delay_ms, "--", &phrase],
            TYPING_TIMEOUT,
        )?;
        std::thread::sleep(Duration::from_millis(rand::thread_rng().gen_range(1_000..3_000)));
        self.xdo(&["key", "ctrl+a"])?;
        self.xdo(&["key", "Delete"])?;
        Ok(format!("text_entry({} chars)", phrase.len()))
    }
}

impl InputTelemetry for DesktopBridge {
    fn idle_seconds(&self) -> Result<f64> {
        if let Some(xprintidle) = &self.xprintidle {
            let output = run_command(xprintidle, &[], COMMAND_TIMEOUT)?;
            let millis: f64 = output
                .trim()
                .parse()
                .with_context(|| format!("unexpected xprintidle output '{}'", output.trim()))?;
            return Ok(millis / 1000.0);
        }

        if let Some(ioreg) = &self.ioreg {
            let output = run_command(ioreg, &["-c", "IOHIDSystem", "-d", "4"], COMMAND_TIMEOUT)?;
            return parse_hid_idle(&output);
        }

        bail!("no idle-time source available (install xprintidle)")
    }

    fn is_locked(&self) -> Result<bool> {
        let loginctl = self
            .loginctl
            .as_deref()
            .ok_or_else(|| anyhow!("loginctl not found on PATH"))?;
        let session = std::env::var("XDG_SESSION_ID").context("XDG_SESSION_ID is not set")?;
        let output = run_command(
            loginctl,
            &["show-session", &session, "-p", "LockedHint"],
            COMMAND_TIMEOUT,
        )?;
        Ok(output.trim().eq_ignore_ascii_case("LockedHint=yes"))
    }
}

impl InputSynthesizer for DesktopBridge {
    fn perform(&self, request: &ActionRequest) -> Result<String> {
        match request.category {
            ActionCategory::KeyTap => self.key_tap(request.locked),
            ActionCategory::CursorSweep => self.cursor_sweep(request.locked),
            ActionCategory::MicroCursor => self.micro_cursor(request.locked),
            ActionCategory::TextEntry => {
                if request.locked {
                    bail!("text entry is not performed while locked");
                }
                self.text_entry(request.target_window.as_deref())
            }
        }
    }
}

impl WindowManager for DesktopBridge {
    fn activate_by_title(&self, title: &str) -> Result<bool> {
        let ids = self.xdo(&["search", "--name", &regex::escape(title)]);
        let ids = match ids {
            Ok(output) => output,
            // xdotool exits non-zero when nothing matches
            Err(_) => return Ok(false),
        };
        let Some(id) = ids.lines().map(str::trim).find(|line| !line.is_empty()) else {
            return Ok(false);
        };
        self.xdo(&["windowactivate", "--sync", id])?;
        Ok(true)
    }

    fn find_windows(&self, fragment: &str) -> Result<Vec<String>> {
        let ids = match self.xdo(&["search", "--name", &regex::escape(fragment)]) {
            Ok(output) => output,
            Err(_) => return Ok(Vec::new()),
        };
        let mut titles = Vec::new();
        for id in ids.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match self.xdo(&["getwindowname", id]) {
                Ok(name) => titles.push(name.trim().to_string()),
                Err(err) => log_warn!("failed to read window name for {id}: {err:#}"),
            }
        }
        Ok(titles)
    }

    fn active_window_title(&self) -> Result<Option<String>> {
        let output = self.xdo(&["getactivewindow", "getwindowname"])?;
        let title = output.trim();
        Ok((!title.is_empty()).then(|| title.to_string()))
    }

    fn is_process_alive(&self, handle: &ProcessHandle) -> bool {
        if let Some(child) = &handle.child {
            let mut guard = match child.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            return matches!(guard.try_wait(), Ok(None));
        }

        let pid = Pid::from_u32(handle.pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system
            .process(pid)
            .map(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }
}

impl EditorLauncher for DesktopBridge {
    fn open(&self, path: &Path) -> Result<ProcessHandle> {
        let mut command = if cfg!(target_os = "windows") {
            let mut command = Command::new("notepad.exe");
            command.arg(path);
            command
        } else if cfg!(target_os = "macos") {
            let mut command = Command::new("open");
            command.arg("-W").arg(path);
            command
        } else {
            let mut command = Command::new("xdg-open");
            command.arg(path);
            command
        };

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to open {} in an editor", path.display()))?;
        log_info!("Opened {} in editor (pid {})", path.display(), child.id());
        Ok(ProcessHandle::from_child(child))
    }
}

/// Runs `program` and returns stdout; kills it once `timeout` passes.
fn run_command(program: &Path, args: &[&str], timeout: Duration) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {}", program.display()))?;

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            bail!("{} timed out after {timeout:?}", program.display());
        }
    };

    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout)
            .with_context(|| format!("failed to read output of {}", program.display()))?;
    }

    if !status.success() {
        bail!("{} {:?} exited with {status}", program.display(), args);
    }
    Ok(stdout)
}

fn parse_hid_idle(output: &str) -> Result<f64> {
    let line = output
        .lines()
        .find(|line| line.contains("HIDIdleTime"))
        .ok_or_else(|| anyhow!("HIDIdleTime missing from ioreg output"))?;
    let nanos: f64 = line
        .rsplit('=')
        .next()
        .map(str::trim)
        .ok_or_else(|| anyhow!("malformed HIDIdleTime line"))?
        .parse()
        .with_context(|| format!("malformed HIDIdleTime line '{line}'"))?;
    Ok(nanos / 1_000_000_000.0)
}

/// Title match used for the companion window: the full file name, or the
/// name without its extension, appearing anywhere in the title.
pub fn title_matches(window_title: &str, artifact_title: &str) -> bool {
    if artifact_title.is_empty() {
        return false;
    }
    if window_title.contains(artifact_title) {
        return true;
    }
    Path::new(artifact_title)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| !stem.is_empty() && window_title.contains(stem))
}

pub fn compose_phrase<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(8);
    parts.push(STARTERS.choose(rng).copied().unwrap_or("The"));
    parts.push(WORDS.choose(rng).copied().unwrap_or("report"));
    parts.push(CONNECTORS.choose(rng).copied().unwrap_or("and"));
    let extra = rng.gen_range(2..=5);
    for _ in 0..extra {
        parts.push(WORDS.choose(rng).copied().unwrap_or("status"));
    }
    format!("{}.", parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ioreg_idle_time() {
        let output = r#"
    | |   "HIDIdleTime" = 2500000000
    | |   "HIDParameters" = {}
"#;
        assert_eq!(parse_hid_idle(output).unwrap(), 2.5);
    }

    #[test]
    fn companion_title_matching() {
        assert!(title_matches(
            "stayactive_20250101_ab12.txt - Notepad",
            "stayactive_20250101_ab12.txt"
        ));
        assert!(title_matches("stayactive_20250101_ab12 (~/tmp) - gedit", "stayactive_20250101_ab12.txt"));
        assert!(!title_matches("Inbox - Mail", "stayactive_20250101_ab12.txt"));
        assert!(!title_matches("anything", ""));
    }

    #[test]
    fn phrases_end_with_period() {
        let phrase = compose_phrase(&mut rand::thread_rng());
        assert!(phrase.ends_with('.'));
        assert!(phrase.split_whitespace().count() >= 5);
    }

    #[test]
    fn window_search_pattern_matches_only_the_literal_title() {
        let title = r"notes (1) [draft] a.b+c*d?e|f{2}^g$h\i - gedit";
        let pattern = regex::Regex::new(&regex::escape(title)).unwrap();
        assert!(pattern.is_match(title));
        let loose = regex::Regex::new("a.b (1)").unwrap();
        assert!(loose.is_match("aXb 1"));
        let strict = regex::Regex::new(&regex::escape("a.b (1)")).unwrap();
        assert!(!strict.is_match("aXb 1"));
        assert_eq!(regex::escape("a.txt"), "a\\.txt");
    }
}
