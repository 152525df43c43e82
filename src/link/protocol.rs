//! Line protocol spoken with the cabinet controller.
//!
//! One command per `\n`-terminated line, optionally carrying a single
//! parameter after the first colon: `TAG[:param]`. Tags are case-insensitive
//! on the way in and upper-case on the way out.

use std::fmt;

/// Command received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Physical roll trigger (`ROLL`, `SPIN` or `START`).
    Roll,
    Ping,
    StatusQuery,
    /// Device finished booting.
    Connected,
    Win(Option<String>),
    Lose,
    Pong,
    /// `DISCONNECT` or `DISCONNECTED`.
    Disconnect,
    Unknown(String),
}

impl Command {
    /// Parses one trimmed, non-empty line.
    ///
    /// ```rust
    /// use slotlink::link::Command;
    ///
    /// assert_eq!(Command::parse("spin"), Command::Roll);
    /// assert_eq!(Command::parse("WIN:Toy"), Command::Win(Some("Toy".to_string())));
    /// assert_eq!(Command::parse("WIN"), Command::Win(None));
    /// ```
    pub fn parse(line: &str) -> Self {
        let (tag, param) = match line.split_once(':') {
            Some((tag, param)) => (tag, Some(param.trim())),
            None => (line, None),
        };

        match tag.trim().to_ascii_uppercase().as_str() {
            "ROLL" | "SPIN" | "START" => Command::Roll,
            "PING" => Command::Ping,
            "STATUS" => Command::StatusQuery,
            "CONNECTED" => Command::Connected,
            "WIN" => Command::Win(param.filter(|p| !p.is_empty()).map(str::to_string)),
            "LOSE" => Command::Lose,
            "PONG" => Command::Pong,
            "DISCONNECT" | "DISCONNECTED" => Command::Disconnect,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

/// Message sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Pong,
    StatusReply { ready: bool },
    ConnectedAck,
    DisconnectNotice,
    Ping,
    WinNotice(Option<String>),
    LoseNotice,
}

impl OutboundMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            OutboundMessage::Pong => "PONG",
            OutboundMessage::StatusReply { .. } => "STATUS",
            OutboundMessage::ConnectedAck => "CONNECTED",
            OutboundMessage::DisconnectNotice => "DISCONNECT",
            OutboundMessage::Ping => "PING",
            OutboundMessage::WinNotice(_) => "WIN",
            OutboundMessage::LoseNotice => "LOSE",
        }
    }

    /// Builds a win notice; CR/LF in the prize would break framing.
    pub fn win(prize: Option<&str>) -> Self {
        let prize = prize
            .map(|p| p.replace(['\r', '\n'], " ").trim().to_string())
            .filter(|p| !p.is_empty());
        OutboundMessage::WinNotice(prize)
    }
}

/// Formats the line without its terminating newline.
impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutboundMessage::StatusReply { ready: true } => write!(f, "STATUS:READY"),
            OutboundMessage::StatusReply { ready: false } => write!(f, "STATUS:NOT_READY"),
            OutboundMessage::WinNotice(Some(prize)) => write!(f, "WIN:{}", prize),
            other => f.write_str(other.tag()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_aliases() {
        for line in ["ROLL", "roll", "Spin", "START", " start "] {
            assert_eq!(Command::parse(line), Command::Roll, "line {:?}", line);
        }
    }

    #[test]
    fn simple_tags() {
        assert_eq!(Command::parse("PING"), Command::Ping);
        assert_eq!(Command::parse("status"), Command::StatusQuery);
        assert_eq!(Command::parse("CONNECTED"), Command::Connected);
        assert_eq!(Command::parse("lose"), Command::Lose);
        assert_eq!(Command::parse("PONG"), Command::Pong);
        assert_eq!(Command::parse("DISCONNECT"), Command::Disconnect);
        assert_eq!(Command::parse("disconnected"), Command::Disconnect);
    }

    #[test]
    fn win_parameter_splits_on_first_colon() {
        assert_eq!(
            Command::parse("win:Gift: Card"),
            Command::Win(Some("Gift: Card".to_string()))
        );
        assert_eq!(Command::parse("WIN:"), Command::Win(None));
    }

    #[test]
    fn unknown_keeps_raw_line() {
        assert_eq!(
            Command::parse("HELLO:there"),
            Command::Unknown("HELLO:there".to_string())
        );
    }

    #[test]
    fn outbound_lines() {
        assert_eq!(OutboundMessage::Pong.to_string(), "PONG");
        assert_eq!(
            OutboundMessage::StatusReply { ready: true }.to_string(),
            "STATUS:READY"
        );
        assert_eq!(
            OutboundMessage::StatusReply { ready: false }.to_string(),
            "STATUS:NOT_READY"
        );
        assert_eq!(OutboundMessage::ConnectedAck.to_string(), "CONNECTED");
        assert_eq!(OutboundMessage::DisconnectNotice.to_string(), "DISCONNECT");
        assert_eq!(OutboundMessage::Ping.to_string(), "PING");
        assert_eq!(OutboundMessage::LoseNotice.to_string(), "LOSE");
        assert_eq!(OutboundMessage::win(Some("Toy")).to_string(), "WIN:Toy");
        assert_eq!(OutboundMessage::win(None).to_string(), "WIN");
    }

    #[test]
    fn prize_cannot_break_framing() {
        assert_eq!(
            OutboundMessage::win(Some("Big\nBear\r")).to_string(),
            "WIN:Big Bear"
        );
        assert_eq!(OutboundMessage::win(Some("\n")), OutboundMessage::WinNotice(None));
    }
}
