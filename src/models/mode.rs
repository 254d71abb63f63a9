use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    Automation,
    UserControlled,
    Locked,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Automation => "Automation",
            Mode::UserControlled => "UserControlled",
            Mode::Locked => "Locked",
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Automation
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeState {
    pub mode: Mode,
    pub last_transition_at: DateTime<Utc>,
    pub reason: String,
    /// Bumped on every transition so in-flight bursts can detect a switch.
    pub epoch: u64,
}

impl Default for ModeState {
    fn default() -> Self {
        Self {
            mode: Mode::Automation,
            last_transition_at: Utc::now(),
            reason: "session start".into(),
            epoch: 0,
        }
    }
}

impl ModeState {
    pub fn apply(&mut self, transition: &ModeTransition) {
        self.mode = transition.to;
        self.last_transition_at = transition.at;
        self.reason = transition.reason.clone();
        self.epoch = self.epoch.wrapping_add(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModeTransition {
    pub from: Mode,
    pub to: Mode,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl ModeTransition {
    pub fn new(from: Mode, to: Mode, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}
