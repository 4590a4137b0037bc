//! Owned IRC message type: tags, prefix, command.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::tags::{escape_tag_value, parse_tags, Tag};

/// Message prefix/source (`:server` or `:nick!user@host`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Prefix {
    /// A server origin (no `!` or `@` in the prefix).
    Server(String),
    /// A user origin with optional user and host parts.
    User {
        nick: String,
        user: Option<String>,
        host: Option<String>,
    },
}

impl Prefix {
    fn parse(raw: &str) -> Prefix {
        if let Some((nick, rest)) = raw.split_once('!') {
            let (user, host) = match rest.split_once('@') {
                Some((u, h)) => (Some(u.to_string()), Some(h.to_string())),
                None => (Some(rest.to_string()), None),
            };
            Prefix::User {
                nick: nick.to_string(),
                user,
                host,
            }
        } else if let Some((nick, host)) = raw.split_once('@') {
            Prefix::User {
                nick: nick.to_string(),
                user: None,
                host: Some(host.to_string()),
            }
        } else if raw.contains('.') {
            Prefix::Server(raw.to_string())
        } else {
            Prefix::User {
                nick: raw.to_string(),
                user: None,
                host: None,
            }
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Server(name) => write!(f, "{}", name),
            Prefix::User { nick, user, host } => {
                write!(f, "{}", nick)?;
                if let Some(user) = user {
                    write!(f, "!{}", user)?;
                }
                if let Some(host) = host {
                    write!(f, "@{}", host)?;
                }
                Ok(())
            }
        }
    }
}

/// The IRC commands a chat client sends or cares about receiving.
///
/// Anything outside this set is preserved verbatim as [`Command::Raw`] so
/// callers can inspect or ignore it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Privmsg(String, String),
    Notice(String, String),
    Join(String),
    Part(String),
    Ping(String),
    Pong(String),
    Pass(String),
    Nick(String),
    Quit(Option<String>),
    Cap(Vec<String>),
    /// A numeric reply with its parameters.
    Response(u16, Vec<String>),
    /// Any other command, verbatim.
    Raw(String, Vec<String>),
}

impl Command {
    fn from_parts(cmd: &str, params: Vec<String>) -> Command {
        let mut params = params;
        if let Ok(code) = cmd.parse::<u16>() {
            return Command::Response(code, params);
        }
        match cmd.to_ascii_uppercase().as_str() {
            "PRIVMSG" if params.len() >= 2 => {
                let text = params.pop().unwrap_or_default();
                Command::Privmsg(params.remove(0), text)
            }
            "NOTICE" if params.len() >= 2 => {
                let text = params.pop().unwrap_or_default();
                Command::Notice(params.remove(0), text)
            }
            "JOIN" if !params.is_empty() => Command::Join(params.remove(0)),
            "PART" if !params.is_empty() => Command::Part(params.remove(0)),
            "PING" => Command::Ping(params.into_iter().next().unwrap_or_default()),
            "PONG" => Command::Pong(params.into_iter().next().unwrap_or_default()),
            "PASS" if !params.is_empty() => Command::Pass(params.remove(0)),
            "NICK" if !params.is_empty() => Command::Nick(params.remove(0)),
            "QUIT" => Command::Quit(params.into_iter().next()),
            "CAP" => Command::Cap(params),
            other => Command::Raw(other.to_string(), params),
        }
    }

    fn write_wire(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Privmsg(target, text) => write!(f, "PRIVMSG {} :{}", target, text),
            Command::Notice(target, text) => write!(f, "NOTICE {} :{}", target, text),
            Command::Join(chan) => write!(f, "JOIN {}", chan),
            Command::Part(chan) => write!(f, "PART {}", chan),
            Command::Ping(token) => write!(f, "PING :{}", token),
            Command::Pong(token) => write!(f, "PONG :{}", token),
            Command::Pass(pass) => write!(f, "PASS {}", pass),
            Command::Nick(nick) => write!(f, "NICK {}", nick),
            Command::Quit(None) => write!(f, "QUIT"),
            Command::Quit(Some(reason)) => write!(f, "QUIT :{}", reason),
            Command::Cap(params) => {
                write!(f, "CAP")?;
                write_params(f, params)
            }
            Command::Response(code, params) => {
                write!(f, "{:03}", code)?;
                write_params(f, params)
            }
            Command::Raw(cmd, params) => {
                write!(f, "{}", cmd)?;
                write_params(f, params)
            }
        }
    }
}

/// Write a parameter list, colon-prefixing the final parameter when needed.
fn write_params(f: &mut fmt::Formatter<'_>, params: &[String]) -> fmt::Result {
    let last = params.len().saturating_sub(1);
    for (i, p) in params.iter().enumerate() {
        if i == last && (p.is_empty() || p.contains(' ') || p.starts_with(':')) {
            write!(f, " :{}", p)?;
        } else {
            write!(f, " {}", p)?;
        }
    }
    Ok(())
}

/// An owned IRC message: optional IRCv3 tags, optional prefix, and command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub tags: Option<Vec<Tag>>,
    pub prefix: Option<Prefix>,
    pub command: Command,
}

impl Message {
    /// Construct a bare command message with no tags or prefix.
    pub fn from_command(command: Command) -> Message {
        Message {
            tags: None,
            prefix: None,
            command,
        }
    }

    pub fn privmsg(target: &str, text: &str) -> Message {
        Message::from_command(Command::Privmsg(target.to_string(), text.to_string()))
    }

    pub fn join(channel: &str) -> Message {
        Message::from_command(Command::Join(channel.to_string()))
    }

    pub fn part(channel: &str) -> Message {
        Message::from_command(Command::Part(channel.to_string()))
    }

    pub fn pong(token: &str) -> Message {
        Message::from_command(Command::Pong(token.to_string()))
    }

    pub fn quit(reason: &str) -> Message {
        Message::from_command(Command::Quit(Some(reason.to_string())))
    }

    /// `CAP REQ :<caps...>` for capability negotiation right after connect.
    pub fn cap_req(caps: &str) -> Message {
        Message::from_command(Command::Cap(vec!["REQ".to_string(), caps.to_string()]))
    }

    /// Get the value of an IRCv3 tag by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .as_ref()?
            .iter()
            .find(|Tag(k, _)| k == key)
            .and_then(|Tag(_, v)| v.as_deref())
    }

    /// Get the nickname from the message prefix, if present.
    pub fn source_nickname(&self) -> Option<&str> {
        match self.prefix.as_ref()? {
            Prefix::User { nick, .. } => Some(nick),
            Prefix::Server(_) => None,
        }
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, ProtocolError> {
        let mut rest = s.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(ProtocolError::InvalidMessage("empty line".to_string()));
        }

        let tags = if let Some(stripped) = rest.strip_prefix('@') {
            let (raw_tags, tail) = stripped
                .split_once(' ')
                .ok_or_else(|| ProtocolError::InvalidMessage(s.to_string()))?;
            rest = tail.trim_start_matches(' ');
            Some(parse_tags(raw_tags))
        } else {
            None
        };

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (raw_prefix, tail) = stripped
                .split_once(' ')
                .ok_or_else(|| ProtocolError::InvalidMessage(s.to_string()))?;
            rest = tail.trim_start_matches(' ');
            Some(Prefix::parse(raw_prefix))
        } else {
            None
        };

        // Split off the trailing parameter first; the remainder is
        // space-separated.
        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };

        let mut words = head.split(' ').filter(|w| !w.is_empty());
        let cmd = words
            .next()
            .ok_or_else(|| ProtocolError::InvalidMessage(s.to_string()))?;
        let mut params: Vec<String> = words.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }

        Ok(Message {
            tags,
            prefix,
            command: Command::from_parts(cmd, params),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = &self.tags {
            if !tags.is_empty() {
                f.write_str("@")?;
                for (i, Tag(key, value)) in tags.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    f.write_str(key)?;
                    if let Some(value) = value {
                        write!(f, "={}", escape_tag_value(value))?;
                    }
                }
                f.write_str(" ")?;
            }
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        self.command.write_wire(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_privmsg_with_tags() {
        let raw = "@badges=moderator/1;mod=1 :alice!alice@alice.tmi.twitch.tv PRIVMSG #somestreamer :hello world";
        let msg: Message = raw.parse().unwrap();
        assert_eq!(msg.tag_value("mod"), Some("1"));
        assert_eq!(msg.tag_value("badges"), Some("moderator/1"));
        assert_eq!(msg.source_nickname(), Some("alice"));
        assert_eq!(
            msg.command,
            Command::Privmsg("#somestreamer".into(), "hello world".into())
        );
    }

    #[test]
    fn test_parse_ping() {
        let msg: Message = "PING :tmi.twitch.tv".parse().unwrap();
        assert_eq!(msg.command, Command::Ping("tmi.twitch.tv".into()));
    }

    #[test]
    fn test_parse_numeric_welcome() {
        let msg: Message = ":tmi.twitch.tv 001 elowardbot :Welcome, GLHF!".parse().unwrap();
        match msg.command {
            Command::Response(1, ref params) => {
                assert_eq!(params[0], "elowardbot");
                assert_eq!(params[1], "Welcome, GLHF!");
            }
            ref other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_server_prefix() {
        let msg: Message = ":tmi.twitch.tv NOTICE * :Login authentication failed"
            .parse()
            .unwrap();
        assert_eq!(msg.prefix, Some(Prefix::Server("tmi.twitch.tv".into())));
        assert!(msg.source_nickname().is_none());
    }

    #[test]
    fn test_parse_empty_line_rejected() {
        assert!("\r\n".parse::<Message>().is_err());
    }

    #[test]
    fn test_serialize_cap_req() {
        let msg = Message::cap_req("twitch.tv/membership twitch.tv/tags twitch.tv/commands");
        assert_eq!(
            msg.to_string(),
            "CAP REQ :twitch.tv/membership twitch.tv/tags twitch.tv/commands"
        );
    }

    #[test]
    fn test_serialize_privmsg() {
        let msg = Message::privmsg("#chan", "one two");
        assert_eq!(msg.to_string(), "PRIVMSG #chan :one two");
    }

    #[test]
    fn test_serialize_registration() {
        assert_eq!(
            Message::from_command(Command::Pass("oauth:abc".into())).to_string(),
            "PASS oauth:abc"
        );
        assert_eq!(
            Message::from_command(Command::Nick("elowardbot".into())).to_string(),
            "NICK elowardbot"
        );
    }

    #[test]
    fn test_parse_round_trip() {
        for raw in [
            "PRIVMSG #chan :hello there",
            "JOIN #chan",
            "PART #chan",
            "PONG :token",
            "QUIT :bye now",
        ] {
            let msg: Message = raw.parse().unwrap();
            assert_eq!(msg.to_string(), raw);
        }
    }

    #[test]
    fn test_unknown_command_preserved() {
        let msg: Message = ":tmi.twitch.tv RECONNECT".parse().unwrap();
        assert_eq!(msg.command, Command::Raw("RECONNECT".into(), vec![]));
    }
}
