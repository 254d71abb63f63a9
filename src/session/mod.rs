pub mod commands;
pub mod controller;
pub mod state;

pub use commands::ControlCommand;
pub use controller::SessionController;
pub use state::{SessionState, StateChange};
