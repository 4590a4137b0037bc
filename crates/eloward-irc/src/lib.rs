//! Minimal IRC client protocol support.
//!
//! Provides an owned [`Message`] type covering the command surface a chat
//! client needs (PRIVMSG, JOIN/PART, PING/PONG, CAP, registration), IRCv3
//! message-tag escaping, and a tokio codec for newline-framed IRC streams.

mod codec;
mod error;
mod message;
mod tags;

pub use codec::{IrcCodec, LineCodec};
pub use error::{ProtocolError, Result};
pub use message::{Command, Message, Prefix};
pub use tags::{escape_tag_value, parse_tags, unescape_tag_value, Tag};
