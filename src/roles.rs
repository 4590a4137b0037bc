//! Role resolution from message metadata.
//!
//! Roles derive from server-provided tags and badges plus the channel name.
//! Badge strings are best-effort; the moderation executor keeps its own
//! secondary mod-list check for the stale-badge case.

use std::collections::HashSet;

use eloward_irc::Message;

/// Roles a chat author holds in the channel a message was seen in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuthorRoles {
    pub broadcaster: bool,
    pub moderator: bool,
    pub subscriber: bool,
    pub vip: bool,
}

impl AuthorRoles {
    /// Classify `author` from the tags of `msg` as seen in `channel_login`
    /// (lowercase, no `#`).
    pub fn resolve(msg: &Message, channel_login: &str, author_login: &str) -> AuthorRoles {
        let mut roles = AuthorRoles::default();

        if author_login.eq_ignore_ascii_case(channel_login) {
            roles.broadcaster = true;
        }

        if let Some(badges) = msg.tag_value("badges") {
            for badge in badges.split(',') {
                let prefix = badge.split('/').next().unwrap_or("");
                match prefix {
                    "broadcaster" => roles.broadcaster = true,
                    "moderator" => roles.moderator = true,
                    "vip" => roles.vip = true,
                    // Founders are subscribers with an anniversary badge.
                    "subscriber" | "founder" => roles.subscriber = true,
                    _ => {}
                }
            }
        }

        // Fallback flags for servers that omit badges.
        if msg.tag_value("mod") == Some("1") {
            roles.moderator = true;
        }
        if msg.tag_value("subscriber") == Some("1") {
            roles.subscriber = true;
        }
        if msg.tag_value("vip") == Some("1") {
            roles.vip = true;
        }
        if msg.tag_value("user-type") == Some("mod") {
            roles.moderator = true;
        }

        roles
    }

    /// Exempt from enforcement. This set is part of the safety contract and
    /// intentionally not configurable per channel.
    pub fn is_exempt(&self) -> bool {
        self.broadcaster || self.moderator || self.subscriber
    }

    /// Allowed to run mutating commands.
    pub fn is_privileged(&self) -> bool {
        self.broadcaster || self.moderator
    }
}

/// Statically configured logins that are always exempt and always
/// command-privileged, across every channel.
#[derive(Clone, Debug, Default)]
pub struct SuperAdmins {
    logins: HashSet<String>,
}

impl SuperAdmins {
    pub fn new<I, S>(logins: I) -> SuperAdmins
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        SuperAdmins {
            logins: logins
                .into_iter()
                .map(|l| l.as_ref().trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, login: &str) -> bool {
        self.logins.contains(&login.to_ascii_lowercase())
    }
}
