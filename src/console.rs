//! Operator console commands for driving the link by hand.

use std::str::FromStr;
use thiserror::Error;

pub const HELP: &str = "\
commands:
  connect          open the serial link
  disconnect       close the serial link
  win [prize]      report a win, optionally naming the prize
  lose             report a loss
  status           show connection state and active cooldown
  help             show this text
  quit             disconnect and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Disconnect,
    Win(Option<String>),
    Lose,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),

    #[error("'{0}' takes no arguments")]
    UnexpectedArgument(&'static str),
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "" => return Err(ConsoleError::Empty),
            "win" => {
                let prize = (!rest.is_empty()).then(|| rest.to_string());
                return Ok(ConsoleCommand::Win(prize));
            }
            "connect" => ConsoleCommand::Connect,
            "disconnect" => ConsoleCommand::Disconnect,
            "lose" => ConsoleCommand::Lose,
            "status" => ConsoleCommand::Status,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            _ => return Err(ConsoleError::Unknown(word.to_string())),
        };

        if !rest.is_empty() {
            return Err(ConsoleError::UnexpectedArgument(command.name()));
        }
        Ok(command)
    }
}

impl ConsoleCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ConsoleCommand::Connect => "connect",
            ConsoleCommand::Disconnect => "disconnect",
            ConsoleCommand::Win(_) => "win",
            ConsoleCommand::Lose => "lose",
            ConsoleCommand::Status => "status",
            ConsoleCommand::Help => "help",
            ConsoleCommand::Quit => "quit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!("connect".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Connect));
        assert_eq!("  Disconnect ".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Disconnect));
        assert_eq!("LOSE".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Lose));
        assert_eq!("?".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Help));
        assert_eq!("exit".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn win_keeps_the_whole_prize() {
        assert_eq!("win".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Win(None)));
        assert_eq!(
            "win  Teddy Bear ".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Win(Some("Teddy Bear".to_string())))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!("".parse::<ConsoleCommand>(), Err(ConsoleError::Empty));
        assert_eq!(
            "spin".parse::<ConsoleCommand>(),
            Err(ConsoleError::Unknown("spin".to_string()))
        );
        assert_eq!(
            "status now".parse::<ConsoleCommand>(),
            Err(ConsoleError::UnexpectedArgument("status"))
        );
    }
}
