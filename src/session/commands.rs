use std::fmt;
use std::str::FromStr;

/// A control command typed on the terminal while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Toggle,
    Recover,
    Status,
    Stop,
    Help,
}

impl ControlCommand {
    pub const HELP: &'static str = "commands: pause (p), resume (r), toggle (t), recover, status (s), stop (q), help (h)";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command '{}'; {}", self.0, ControlCommand::HELP)
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for ControlCommand {
    type Err = UnknownCommand;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let command = input.trim().to_lowercase();
        match command.as_str() {
            "pause" | "p" => Ok(ControlCommand::Pause),
            "resume" | "r" => Ok(ControlCommand::Resume),
            "toggle" | "t" | "mode" => Ok(ControlCommand::Toggle),
            "recover" | "force-recovery" => Ok(ControlCommand::Recover),
            "status" | "s" | "" => Ok(ControlCommand::Status),
            "stop" | "quit" | "exit" | "q" => Ok(ControlCommand::Stop),
            "help" | "h" | "?" => Ok(ControlCommand::Help),
            _ => Err(UnknownCommand(input.trim().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("pause".parse(), Ok(ControlCommand::Pause));
        assert_eq!(" R \n".parse(), Ok(ControlCommand::Resume));
        assert_eq!("mode".parse(), Ok(ControlCommand::Toggle));
        assert_eq!("force-recovery".parse(), Ok(ControlCommand::Recover));
        assert_eq!("q".parse(), Ok(ControlCommand::Stop));
    }

    #[test]
    fn empty_line_shows_status() {
        assert_eq!("".parse(), Ok(ControlCommand::Status));
    }

    #[test]
    fn unknown_command_lists_help() {
        let err = "jump".parse::<ControlCommand>().unwrap_err();
        assert_eq!(err, UnknownCommand("jump".into()));
        assert!(err.to_string().contains("pause (p)"));
    }
}
