use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum ActionCategory {
    TextEntry,
    CursorSweep,
    MicroCursor,
    KeyTap,
}

impl ActionCategory {
    pub const ALL: [ActionCategory; 4] = [
        ActionCategory::TextEntry,
        ActionCategory::CursorSweep,
        ActionCategory::MicroCursor,
        ActionCategory::KeyTap,
    ];

    /// Category performed when nothing else is eligible. Modifier and
    /// lock-key taps never land anywhere visible.
    pub const FALLBACK: ActionCategory = ActionCategory::KeyTap;

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionCategory::TextEntry => "text_entry",
            ActionCategory::CursorSweep => "cursor_sweep",
            ActionCategory::MicroCursor => "micro_cursor",
            ActionCategory::KeyTap => "key_tap",
        }
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAction {
    pub category: ActionCategory,
    /// True when the selection table was empty and the safe fallback was used.
    pub fallback: bool,
}

/// One scheduling cycle, computed up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurstPlan {
    pub sleep_interval: Duration,
    pub burst_size: u32,
    pub actions: Vec<PlannedAction>,
    pub locked: bool,
    /// Mode epoch the plan was computed under; the burst aborts if it moves.
    pub mode_epoch: u64,
}

impl BurstPlan {
    pub fn categories(&self) -> impl Iterator<Item = ActionCategory> + '_ {
        self.actions.iter().map(|action| action.category)
    }
}
