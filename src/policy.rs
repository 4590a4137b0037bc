//! Channel policy records as served by the control plane.
//!
//! Policy records are remote and authoritative; this module only models
//! them, clamps the timeout bounds, and renders the timeout reason
//! templates. Cache lifetime rules live in `cache`.

use serde::{Deserialize, Serialize};

use crate::rank::{Division, Rank, Tier};

/// Hard bounds on the platform timeout duration, in seconds.
pub const TIMEOUT_MIN: u32 = 1;
pub const TIMEOUT_MAX: u32 = 1_209_600;

/// Public site referenced from reason templates.
pub const SITE: &str = "eloward.com";

fn default_timeout() -> u32 {
    30
}

/// Which check a channel runs against chat authors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// The author must have any rank on record.
    HasRank,
    /// The author's rank must meet the configured minimum.
    MinRank,
}

impl EnforcementMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EnforcementMode::HasRank => "has_rank",
            EnforcementMode::MinRank => "min_rank",
        }
    }
}

/// Per-channel policy record, replaced wholesale on invalidation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub enabled: bool,
    pub mode: EnforcementMode,
    #[serde(default, alias = "min_tier")]
    pub min_rank_tier: Option<Tier>,
    #[serde(default, alias = "min_division")]
    pub min_rank_division: Option<Division>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
    #[serde(default, alias = "reason_has_rank")]
    pub reason_template_has_rank: Option<String>,
    #[serde(default, alias = "reason_min_rank")]
    pub reason_template_min_rank: Option<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at: i64,
}

impl ChannelPolicy {
    /// Timeout duration with the platform bounds applied.
    pub fn timeout(&self) -> u32 {
        self.timeout_seconds.clamp(TIMEOUT_MIN, TIMEOUT_MAX)
    }

    /// The configured minimum rank, if the policy has one.
    ///
    /// MASTER and above are forced to division I regardless of what the
    /// record carries.
    pub fn min_rank(&self) -> Option<Rank> {
        let tier = self.min_rank_tier?;
        let division = if tier.is_apex() {
            Some(Division::I)
        } else {
            self.min_rank_division
        };
        Some(Rank::new(tier, division))
    }

    /// The reason template for the currently active mode.
    pub fn active_template(&self) -> Option<&str> {
        match self.mode {
            EnforcementMode::HasRank => self.reason_template_has_rank.as_deref(),
            EnforcementMode::MinRank => self.reason_template_min_rank.as_deref(),
        }
    }

    /// Render the timeout reason for `user`.
    ///
    /// Returns `None` when no template is configured for the active mode;
    /// callers must treat that as a configuration error and abort, never
    /// substitute a hardcoded default.
    pub fn render_reason(&self, user: &str) -> Option<String> {
        let template = self.active_template()?;
        let (tier, division) = match self.min_rank() {
            Some(min) => {
                let division = min
                    .division
                    .filter(|_| !min.tier.is_apex())
                    .map(|d| d.to_string())
                    .unwrap_or_default();
                (min.tier.to_string(), division)
            }
            None => (String::new(), String::new()),
        };
        let seconds = self.timeout().to_string();

        let mut out = template.to_string();
        for (pattern, value) in [
            ("{seconds}", seconds.as_str()),
            ("{site}", SITE),
            ("{user}", user),
            ("{tier}", tier.as_str()),
            ("{division}", division.as_str()),
            ("[tier]", tier.as_str()),
            ("[division]", division.as_str()),
        ] {
            out = out.replace(pattern, value);
        }
        Some(out)
    }
}

/// Clamp a user-supplied timeout to the platform bounds.
pub fn clamp_timeout(seconds: i64) -> u32 {
    seconds.clamp(TIMEOUT_MIN as i64, TIMEOUT_MAX as i64) as u32
}
