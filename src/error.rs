//! Unified error handling for the bot.
//!
//! Command errors can render a single-line chat reply; enforcement errors
//! carry a static code for log labeling and always degrade to "allow the
//! message" at the dispatcher boundary.

use thiserror::Error;

use crate::rpc::RpcError;

/// Errors raised while interpreting an in-chat command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("not privileged")]
    NotPrivileged,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("control plane call failed: {0}")]
    Rpc(#[from] RpcError),
}

impl CommandError {
    /// Static code for log labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotPrivileged => "not_privileged",
            Self::UnknownCommand(_) => "unknown_command",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Rpc(_) => "rpc_failed",
        }
    }

    /// Render the chat reply for this error.
    ///
    /// Every command error is user-visible; the caller sends the reply in
    /// the channel the command came from.
    pub fn to_chat_reply(&self) -> String {
        match self {
            Self::NotPrivileged => {
                "Only the broadcaster or moderators can use this command.".to_string()
            }
            Self::UnknownCommand(_) => {
                "Unknown command. Try !eloward help for a list of commands.".to_string()
            }
            Self::InvalidArgument(detail) => detail.clone(),
            Self::Rpc(_) => {
                "Settings service is unavailable right now, try again shortly.".to_string()
            }
        }
    }
}

/// Result type for command handlers: `Ok(Some(reply))` sends a line back.
pub type CommandResult = Result<Option<String>, CommandError>;

/// Failure kinds inside the enforcement pipeline.
///
/// None of these propagate past the dispatcher; the message is allowed and
/// the kind is logged.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("policy fetch failed")]
    ConfigUnavailable,

    #[error("rank fetch failed")]
    RankUnavailable,

    #[error("payload missing required field: {0}")]
    SchemaInvalid(String),

    #[error("moderation call failed: {0}")]
    Moderation(String),
}

impl PipelineError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigUnavailable => "config_unavailable",
            Self::RankUnavailable => "rank_unavailable",
            Self::SchemaInvalid(_) => "schema_invalid",
            Self::Moderation(_) => "moderation_failed",
        }
    }
}
