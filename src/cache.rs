//! Policy and rank caches on the message hot path.
//!
//! The config cache has no TTL: entries are dropped only by pub/sub
//! invalidation (or an explicit local invalidation after a command writes
//! config). The rank cache is TTL-bounded. Both fill lazily and both
//! degrade fail-open when the control plane is unreachable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::policy::ChannelPolicy;
use crate::rank::Rank;
use crate::rpc::ControlPlane;

/// Rank entries: positive records live 60 s, negative 30 s.
const RANK_TTL_POSITIVE: Duration = Duration::from_secs(60);
const RANK_TTL_NEGATIVE: Duration = Duration::from_secs(30);

/// Per-channel policy cache.
///
/// A cached `None` means the control plane answered 404: no record exists
/// and the bot is disabled for that channel. Correctness of non-`None`
/// entries depends on the invalidation stream.
pub struct ConfigCache {
    cp: Arc<dyn ControlPlane>,
    entries: DashMap<String, Option<Arc<ChannelPolicy>>>,
}

impl ConfigCache {
    pub fn new(cp: Arc<dyn ControlPlane>) -> ConfigCache {
        ConfigCache {
            cp,
            entries: DashMap::new(),
        }
    }

    /// Get the policy for a channel, filling from the control plane on a
    /// miss. Transport failures return `None` without caching so the next
    /// message retries.
    pub async fn get(&self, channel_login: &str) -> Option<Arc<ChannelPolicy>> {
        if let Some(entry) = self.entries.get(channel_login) {
            return entry.clone();
        }

        match self.cp.config_get(channel_login).await {
            Ok(Some(policy)) => {
                let policy = Arc::new(policy);
                self.entries
                    .insert(channel_login.to_string(), Some(Arc::clone(&policy)));
                debug!(channel = %channel_login, version = policy.version, "policy cached");
                Some(policy)
            }
            Ok(None) => {
                self.entries.insert(channel_login.to_string(), None);
                debug!(channel = %channel_login, "no policy record, caching disabled state");
                None
            }
            Err(e) => {
                warn!(channel = %channel_login, error = %e, code = e.error_code(), "policy fetch failed, treating channel as disabled");
                None
            }
        }
    }

    /// Drop the entry for a channel. The next message hot-fills it.
    pub fn invalidate(&self, channel_login: &str) {
        if self.entries.remove(channel_login).is_some() {
            debug!(channel = %channel_login, "policy invalidated");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Result of a rank lookup, possibly synthesized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RankStanding {
    pub present: bool,
    pub rank: Option<Rank>,
}

impl RankStanding {
    /// The fail-open standing used when the control plane is unreachable:
    /// present with an unknown tier, which every check allows.
    pub fn fail_open() -> RankStanding {
        RankStanding {
            present: true,
            rank: None,
        }
    }

    pub fn absent() -> RankStanding {
        RankStanding {
            present: false,
            rank: None,
        }
    }
}

struct RankEntry {
    standing: RankStanding,
    fetched_at: Instant,
    ttl: Duration,
}

impl RankEntry {
    fn expired_at(&self, now: Instant) -> bool {
        now.duration_since(self.fetched_at) >= self.ttl
    }
}

/// Per-user rank cache with bounded TTLs.
pub struct RankCache {
    cp: Arc<dyn ControlPlane>,
    entries: DashMap<String, RankEntry>,
}

impl RankCache {
    pub fn new(cp: Arc<dyn ControlPlane>) -> RankCache {
        RankCache {
            cp,
            entries: DashMap::new(),
        }
    }

    /// Look up a user's standing, fetching on miss or expiry.
    ///
    /// A transport failure yields the fail-open standing and caches
    /// nothing, so the very next message retries the lookup.
    pub async fn get(&self, user_login: &str) -> RankStanding {
        if let Some(entry) = self.entries.get(user_login) {
            if !entry.expired_at(Instant::now()) {
                return entry.standing;
            }
        }

        match self.cp.rank_get(user_login).await {
            Ok(Some(rank)) => {
                let standing = RankStanding {
                    present: true,
                    rank: Some(rank),
                };
                self.insert(user_login, standing, RANK_TTL_POSITIVE);
                standing
            }
            Ok(None) => {
                let standing = RankStanding::absent();
                self.insert(user_login, standing, RANK_TTL_NEGATIVE);
                standing
            }
            Err(e) => {
                warn!(user = %user_login, error = %e, code = e.error_code(), "rank fetch failed, failing open");
                RankStanding::fail_open()
            }
        }
    }

    fn insert(&self, user_login: &str, standing: RankStanding, ttl: Duration) {
        self.entries.insert(
            user_login.to_string(),
            RankEntry {
                standing,
                fetched_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Evict expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.expired_at(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Force an entry to look expired (test hook for TTL behavior).
    #[cfg(test)]
    fn force_expire(&self, user_login: &str) {
        if let Some(mut entry) = self.entries.get_mut(user_login) {
            entry.ttl = Duration::ZERO;
        }
    }
}
