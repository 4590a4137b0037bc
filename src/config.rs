//! Process configuration, loaded from the environment.
//!
//! The bot carries no config file: everything it needs is a handful of
//! environment variables, most with workable defaults. The only hard
//! requirement is the MAC secret; refusing to start without it keeps a
//! misdeployed replica from sending unsigned control-plane writes.

use std::fmt;

/// Log output format, selected by `ELOWARD_LOG_FORMAT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Runtime configuration for one bot process.
#[derive(Clone)]
pub struct BotConfig {
    /// Base URL of the control plane.
    pub control_plane_url: String,
    /// Shared secret for request MACs. Required.
    pub hmac_secret: String,
    /// Pub/sub endpoint (`redis://` or `rediss://`, credential embedded).
    /// Absence disables instant propagation.
    pub pubsub_url: Option<String>,
    /// Platform application client id, sent with every moderation call.
    pub client_id: String,
    /// Region tag, informational only.
    pub region: String,
    /// Logins that are always exempt and always command-privileged.
    pub super_admins: Vec<String>,
    /// Chat server address.
    pub irc_addr: String,
    /// Moderation API base URL.
    pub helix_url: String,
    pub log_format: LogFormat,
}

impl BotConfig {
    /// Load configuration from the process environment.
    pub fn load() -> BotConfig {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> BotConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let control_plane_url = get("ELOWARD_API_BASE")
            .unwrap_or_else(|| "https://api.eloward.com".to_string())
            .trim_end_matches('/')
            .to_string();
        let helix_url = get("ELOWARD_HELIX_URL")
            .unwrap_or_else(|| "https://api.twitch.tv/helix".to_string())
            .trim_end_matches('/')
            .to_string();

        BotConfig {
            control_plane_url,
            hmac_secret: get("ELOWARD_HMAC_SECRET").unwrap_or_default(),
            pubsub_url: get("ELOWARD_REDIS_URL").filter(|v| !v.is_empty()),
            client_id: get("ELOWARD_CLIENT_ID").unwrap_or_default(),
            region: get("ELOWARD_REGION").unwrap_or_else(|| "na1".to_string()),
            super_admins: get("ELOWARD_SUPER_ADMINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_ascii_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            irc_addr: get("ELOWARD_IRC_ADDR")
                .unwrap_or_else(|| "irc.chat.twitch.tv:6667".to_string()),
            helix_url,
            log_format: match get("ELOWARD_LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.hmac_secret.is_empty() {
            errors.push("ELOWARD_HMAC_SECRET is required".to_string());
        }
        if self.control_plane_url.is_empty() {
            errors.push("ELOWARD_API_BASE must not be empty".to_string());
        }
        if !self.irc_addr.contains(':') {
            errors.push(format!(
                "ELOWARD_IRC_ADDR must be host:port, got {:?}",
                self.irc_addr
            ));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets stay out of logs.
        f.debug_struct("BotConfig")
            .field("control_plane_url", &self.control_plane_url)
            .field("hmac_secret", &"<redacted>")
            .field("pubsub_url", &self.pubsub_url.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("region", &self.region)
            .field("super_admins", &self.super_admins)
            .field("irc_addr", &self.irc_addr)
            .field("helix_url", &self.helix_url)
            .finish()
    }
}
