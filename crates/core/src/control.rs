//! Control-plane messages.
//!
//! Workers subscribe to a pub/sub channel carrying either plain string
//! signals (`pause` / `resume` / `stop`) or JSON commands
//! (`{"command": "set_workers", "count": n}`). Unknown messages are dropped
//! by the caller.

use serde::Deserialize;

use crate::config::clamp_workers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
    /// Requested worker count, already clamped to the supported range.
    SetWorkers(usize),
}

#[derive(Deserialize)]
struct JsonCommand {
    command: String,
    #[serde(default)]
    count: Option<usize>,
}

/// Parse a raw control-channel payload. Returns `None` for unknown messages.
pub fn parse_control_message(data: &str) -> Option<ControlCommand> {
    if let Ok(cmd) = serde_json::from_str::<JsonCommand>(data) {
        if cmd.command == "set_workers" {
            return Some(ControlCommand::SetWorkers(clamp_workers(cmd.count?)));
        }
        return None;
    }

    match data.trim() {
        "pause" => Some(ControlCommand::Pause),
        "resume" => Some(ControlCommand::Resume),
        "stop" => Some(ControlCommand::Stop),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_signals() {
        assert_eq!(parse_control_message("pause"), Some(ControlCommand::Pause));
        assert_eq!(parse_control_message("resume"), Some(ControlCommand::Resume));
        assert_eq!(parse_control_message("stop"), Some(ControlCommand::Stop));
        assert_eq!(parse_control_message("reboot"), None);
    }

    #[test]
    fn test_parse_set_workers_clamps() {
        assert_eq!(
            parse_control_message(r#"{"command":"set_workers","count":5}"#),
            Some(ControlCommand::SetWorkers(5))
        );
        assert_eq!(
            parse_control_message(r#"{"command":"set_workers","count":99}"#),
            Some(ControlCommand::SetWorkers(8))
        );
        assert_eq!(
            parse_control_message(r#"{"command":"set_workers","count":0}"#),
            Some(ControlCommand::SetWorkers(1))
        );
    }

    #[test]
    fn test_parse_unknown_json_dropped() {
        assert_eq!(parse_control_message(r#"{"command":"flush"}"#), None);
        assert_eq!(
            parse_control_message(r#"{"command":"set_workers"}"#),
            None
        );
    }
}
