//! Inbound command surface. Messages starting with `/` are commands;
//! anything else (and any unknown command) is ignored.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Pause,
    Resume,
    Logs,
}

pub fn parse(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    // "/status@MyBot arg" → "status"
    let word = trimmed[1..]
        .split_whitespace()
        .next()
        .unwrap_or("")
        .split('@')
        .next()
        .unwrap_or("");
    match word.to_lowercase().as_str() {
        "status" => Some(Command::Status),
        "pause" => Some(Command::Pause),
        "resume" => Some(Command::Resume),
        "logs" => Some(Command::Logs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_parse() {
        assert_eq!(parse("/status"), Some(Command::Status));
        assert_eq!(parse("/pause"), Some(Command::Pause));
        assert_eq!(parse("/resume"), Some(Command::Resume));
        assert_eq!(parse("/logs"), Some(Command::Logs));
    }

    #[test]
    fn bot_suffix_and_case_are_tolerated() {
        assert_eq!(parse("/Status@telewatch_bot"), Some(Command::Status));
        assert_eq!(parse("  /LOGS  "), Some(Command::Logs));
    }

    #[test]
    fn unknown_and_plain_messages_are_ignored() {
        assert_eq!(parse("/selfdestruct"), None);
        assert_eq!(parse("hello bot"), None);
        assert_eq!(parse(""), None);
    }
}
