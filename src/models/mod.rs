pub mod action;
pub mod artifact;
pub mod event;
pub mod idle;
pub mod mode;
pub mod pause;
pub mod session;

pub use action::{ActionCategory, BurstPlan, PlannedAction};
pub use artifact::{ArtifactStatus, CompanionArtifact, CompanionView, ProcessHandle};
pub use event::{SessionEvent, SessionSnapshot};
pub use idle::IdleSample;
pub use mode::{Mode, ModeState, ModeTransition};
pub use pause::{PauseOrigin, PauseState, PauseStatus, PauseTransition};
pub use session::{SessionStats, SessionStatus};
