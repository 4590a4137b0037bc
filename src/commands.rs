//! In-chat command interpreter.
//!
//! Handles the `!eloward` surface plus the bare `!commands` alias. Every
//! mutating command issues a signed config-update and then invalidates the
//! local policy entry, so the next message in the channel sees the new
//! policy even if the pub/sub round-trip is slow.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::cache::ConfigCache;
use crate::error::{CommandError, CommandResult};
use crate::rank::{Tier, normalize_division};
use crate::policy::clamp_timeout;
use crate::roles::{AuthorRoles, SuperAdmins};
use crate::rpc::ControlPlane;

const HELP_URL: &str = "https://www.eloward.com/help";
const COMMANDS_URL: &str = "https://www.eloward.com/commands";
const SIGNUP_URL: &str = "https://www.eloward.com";

const USAGE_TIMEOUT: &str = "Usage: !eloward set timeout <seconds>";
const USAGE_MIN_RANK: &str =
    "Usage: !eloward set min_rank TIER [DIVISION] (division required below MASTER, e.g. gold 2)";
const USAGE_MODE: &str = "Usage: !eloward mode has_rank|min_rank";
const USAGE_REASON: &str = "Usage: !eloward set reason <template>";

pub struct CommandInterpreter {
    cp: Arc<dyn ControlPlane>,
    config: Arc<ConfigCache>,
    admins: SuperAdmins,
}

impl CommandInterpreter {
    pub fn new(
        cp: Arc<dyn ControlPlane>,
        config: Arc<ConfigCache>,
        admins: SuperAdmins,
    ) -> CommandInterpreter {
        CommandInterpreter { cp, config, admins }
    }

    /// Whether a chat line is addressed to the interpreter.
    pub fn is_command(text: &str) -> bool {
        let first = text.split_whitespace().next().unwrap_or("");
        first.eq_ignore_ascii_case("!eloward") || first.eq_ignore_ascii_case("!commands")
    }

    /// Interpret a command line. Returns the reply to send in-channel, if
    /// any. Command errors become their chat replies here; a non-command
    /// line returns nothing.
    pub async fn handle(
        &self,
        channel_login: &str,
        author_login: &str,
        roles: &AuthorRoles,
        text: &str,
    ) -> Option<String> {
        match self.dispatch(channel_login, author_login, roles, text).await {
            Ok(reply) => reply,
            Err(e) => {
                info!(
                    channel = %channel_login,
                    author = %author_login,
                    code = e.error_code(),
                    "command rejected"
                );
                Some(e.to_chat_reply())
            }
        }
    }

    async fn dispatch(
        &self,
        channel: &str,
        author: &str,
        roles: &AuthorRoles,
        text: &str,
    ) -> CommandResult {
        let mut parts = text.split_whitespace();
        let head = parts.next().unwrap_or("").to_ascii_lowercase();

        if head == "!commands" {
            return Ok(Some(format!("EloWard commands: {}", COMMANDS_URL)));
        }
        if head != "!eloward" {
            return Ok(None);
        }

        let privileged = roles.is_privileged() || self.admins.contains(author);
        let sub = match parts.next() {
            Some(sub) => sub.to_ascii_lowercase(),
            None => return self.summary(channel).await,
        };

        match sub.as_str() {
            "help" => Ok(Some(format!("EloWard help: {}", HELP_URL))),
            "on" | "off" => {
                self.require(privileged)?;
                let enabled = sub == "on";
                self.update(channel, json!({ "enabled": enabled })).await?;
                Ok(Some(if enabled {
                    "EloWard enforcement enabled.".to_string()
                } else {
                    "EloWard enforcement disabled.".to_string()
                }))
            }
            "mode" => {
                self.require(privileged)?;
                let mode = parts.next().map(str::to_ascii_lowercase);
                match mode.as_deref() {
                    Some(mode @ ("has_rank" | "min_rank")) => {
                        self.update(channel, json!({ "mode": mode })).await?;
                        Ok(Some(format!("Mode set to {}.", mode)))
                    }
                    _ => Err(CommandError::InvalidArgument(USAGE_MODE.to_string())),
                }
            }
            "set" => {
                self.require(privileged)?;
                let what = parts
                    .next()
                    .map(str::to_ascii_lowercase)
                    .unwrap_or_default();
                match what.as_str() {
                    "timeout" => self.set_timeout(channel, parts.next()).await,
                    "min_rank" => {
                        self.set_min_rank(channel, parts.next(), parts.next()).await
                    }
                    "reason" => {
                        let template = text
                            .split_whitespace()
                            .skip(3)
                            .collect::<Vec<_>>()
                            .join(" ");
                        self.set_reason(channel, &template).await
                    }
                    other => Err(CommandError::UnknownCommand(format!("set {other}"))),
                }
            }
            "status" => {
                self.require(privileged)?;
                self.status(channel).await
            }
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }

    fn require(&self, privileged: bool) -> Result<(), CommandError> {
        if privileged {
            Ok(())
        } else {
            Err(CommandError::NotPrivileged)
        }
    }

    /// Persist a partial update, then drop the local entry so the next
    /// message reads fresh policy without waiting for the invalidation
    /// round-trip.
    async fn update(&self, channel: &str, fields: serde_json::Value) -> Result<(), CommandError> {
        debug!(channel = %channel, fields = %fields, "config update");
        self.cp.config_update(channel, fields).await?;
        self.config.invalidate(channel);
        Ok(())
    }

    async fn set_timeout(&self, channel: &str, arg: Option<&str>) -> CommandResult {
        let seconds: i64 = arg
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| CommandError::InvalidArgument(USAGE_TIMEOUT.to_string()))?;
        let clamped = clamp_timeout(seconds);
        self.update(channel, json!({ "timeout_seconds": clamped }))
            .await?;
        Ok(Some(format!("Timeout set to {} seconds.", clamped)))
    }

    async fn set_min_rank(
        &self,
        channel: &str,
        tier_arg: Option<&str>,
        division_arg: Option<&str>,
    ) -> CommandResult {
        let tier: Tier = tier_arg
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| CommandError::InvalidArgument(USAGE_MIN_RANK.to_string()))?;

        if tier.is_apex() {
            // Division is meaningless at MASTER and above; persist I and
            // ignore whatever was supplied.
            self.update(
                channel,
                json!({ "min_rank_tier": tier.to_string(), "min_rank_division": "I" }),
            )
            .await?;
            return Ok(Some(format!("Minimum rank set to {}", tier)));
        }

        let division = division_arg
            .and_then(normalize_division)
            .ok_or_else(|| CommandError::InvalidArgument(USAGE_MIN_RANK.to_string()))?;
        self.update(
            channel,
            json!({ "min_rank_tier": tier.to_string(), "min_rank_division": division }),
        )
        .await?;
        Ok(Some(format!("Minimum rank set to {} {}", tier, division)))
    }

    async fn set_reason(&self, channel: &str, template: &str) -> CommandResult {
        if template.is_empty() {
            return Err(CommandError::InvalidArgument(USAGE_REASON.to_string()));
        }
        // The template applies to the currently active mode only.
        let policy = self.config.get(channel).await.ok_or_else(|| {
            CommandError::InvalidArgument(format!(
                "EloWard is not set up for this channel yet. Visit {}",
                SIGNUP_URL
            ))
        })?;
        let field = match policy.mode {
            crate::policy::EnforcementMode::HasRank => "reason_has_rank",
            crate::policy::EnforcementMode::MinRank => "reason_min_rank",
        };
        self.update(channel, json!({ field: template })).await?;
        Ok(Some(format!(
            "Timeout reason updated for {} mode.",
            policy.mode.as_str()
        )))
    }

    /// Short status, available to anyone.
    async fn summary(&self, channel: &str) -> CommandResult {
        let reply = match self.config.get(channel).await {
            Some(policy) if policy.enabled => format!(
                "EloWard is enabled ({} mode). Link your rank at {}",
                policy.mode.as_str(),
                SIGNUP_URL
            ),
            Some(_) => format!("EloWard is installed but disabled. More at {}", SIGNUP_URL),
            None => format!(
                "EloWard is not set up for this channel. Visit {} to get started.",
                SIGNUP_URL
            ),
        };
        Ok(Some(reply))
    }

    /// Detailed status for broadcasters and moderators.
    async fn status(&self, channel: &str) -> CommandResult {
        let Some(policy) = self.config.get(channel).await else {
            return Ok(Some(format!(
                "No configuration on record. Visit {} to get started.",
                SIGNUP_URL
            )));
        };
        let min_rank = policy
            .min_rank()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "none".to_string());
        Ok(Some(format!(
            "EloWard status: {} | mode {} | min rank {} | timeout {}s | policy v{}",
            if policy.enabled { "enabled" } else { "disabled" },
            policy.mode.as_str(),
            min_rank,
            policy.timeout(),
            policy.version,
        )))
    }
}
