//! Join scheduler: expected channel set, shard membership, paced JOINs.
//!
//! The expected set's source of truth is the control plane's `/channels`
//! endpoint; membership records which shard currently carries each channel.
//! JOINs are paced per shard with a token bucket well under the upstream
//! advertised limit, so the cap survives bursts from initial load and
//! pub/sub driven joins alike.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::rpc::ControlPlane;
use crate::shard::ShardHandle;

/// Channels per connection. Keeps startup time and the blast radius of one
/// lost socket bounded.
pub const SHARD_CAPACITY: usize = 80;

/// One JOIN per ~667 ms per shard: at most 15 JOINs per 10 s, strictly
/// under the upstream's advertised limit.
const JOIN_INTERVAL: Duration = Duration::from_millis(667);

fn join_limiter(interval: Duration) -> DefaultDirectRateLimiter {
    let quota = Quota::with_period(interval)
        .expect("join interval is non-zero")
        .allow_burst(nonzero!(1u32));
    RateLimiter::direct(quota)
}

pub struct JoinScheduler {
    cp: Arc<dyn ControlPlane>,
    shards: Vec<ShardHandle>,
    limiters: Vec<DefaultDirectRateLimiter>,
    capacity: usize,
    expected: Mutex<HashSet<String>>,
    membership: DashMap<String, usize>,
}

impl JoinScheduler {
    pub fn new(cp: Arc<dyn ControlPlane>, shards: Vec<ShardHandle>) -> JoinScheduler {
        Self::with_pacing(cp, shards, JOIN_INTERVAL, SHARD_CAPACITY)
    }

    fn with_pacing(
        cp: Arc<dyn ControlPlane>,
        shards: Vec<ShardHandle>,
        interval: Duration,
        capacity: usize,
    ) -> JoinScheduler {
        let limiters = shards.iter().map(|_| join_limiter(interval)).collect();
        JoinScheduler {
            cp,
            shards,
            limiters,
            capacity,
            expected: Mutex::new(HashSet::new()),
            membership: DashMap::new(),
        }
    }

    /// The shard responsible for commands and replies in a channel.
    pub fn owner(&self, channel_login: &str) -> Option<usize> {
        self.membership.get(channel_login).map(|entry| *entry)
    }

    pub fn is_member(&self, channel_login: &str) -> bool {
        self.membership.contains_key(channel_login)
    }

    pub fn member_count(&self) -> usize {
        self.membership.len()
    }

    pub fn expected_len(&self) -> usize {
        self.expected.lock().len()
    }

    fn shard_load(&self, idx: usize) -> usize {
        self.membership.iter().filter(|entry| *entry.value() == idx).count()
    }

    /// First shard with spare capacity. Used for the boot walk so the first
    /// connection fills before the second sees any channels.
    fn place_fill_first(&self) -> Option<usize> {
        (0..self.shards.len()).find(|&idx| self.shard_load(idx) < self.capacity)
    }

    /// Less-loaded eligible shard. Used for later additions.
    fn place_least_loaded(&self) -> Option<usize> {
        (0..self.shards.len())
            .map(|idx| (self.shard_load(idx), idx))
            .filter(|&(load, _)| load < self.capacity)
            .min()
            .map(|(_, idx)| idx)
    }

    /// Load the expected set and walk it in order. Channels seen here are
    /// existing, not new: no follow calls.
    pub async fn bootstrap(&self) {
        let channels = match self.cp.channels().await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "expected-set load failed, starting empty");
                return;
            }
        };
        info!(count = channels.len(), "expected channel set loaded");
        {
            let mut expected = self.expected.lock();
            expected.extend(channels.iter().cloned());
        }
        for channel in &channels {
            self.assign_and_join(channel, true).await;
        }
    }

    /// Reload the expected set and converge membership toward it. Pub/sub is
    /// the primary propagation plane; this is the safety net.
    pub async fn reconcile(&self) {
        let fresh: HashSet<String> = match self.cp.channels().await {
            Ok(channels) => channels.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "expected-set reload failed, keeping current set");
                return;
            }
        };

        let (added, removed) = {
            let expected = self.expected.lock();
            let added: Vec<String> = fresh.difference(&expected).cloned().collect();
            let removed: Vec<String> = expected.difference(&fresh).cloned().collect();
            (added, removed)
        };

        if !added.is_empty() || !removed.is_empty() {
            info!(added = added.len(), removed = removed.len(), "reconciling expected set");
        }
        for channel in added {
            self.add_channel(&channel).await;
        }
        for channel in removed {
            self.remove_channel(&channel).await;
        }
    }

    /// Add a newly enabled channel: expected set, assignment, JOIN, follow.
    pub async fn add_channel(&self, channel_login: &str) {
        let newly_expected = self.expected.lock().insert(channel_login.to_string());
        if self.is_member(channel_login) {
            return;
        }
        self.assign_and_join(channel_login, false).await;

        if newly_expected {
            if let Err(e) = self.cp.follow_channel(channel_login).await {
                debug!(channel = %channel_login, error = %e, "follow call failed");
            }
        }
    }

    /// PART a channel and drop it from the expected set.
    pub async fn remove_channel(&self, channel_login: &str) {
        self.expected.lock().remove(channel_login);
        if let Some((_, idx)) = self.membership.remove(channel_login) {
            info!(channel = %channel_login, shard = idx, "leaving channel");
            self.shards[idx].part(channel_login).await;
        }
    }

    /// Re-issue JOINs for every channel a shard carries, after it
    /// re-registers. Paced like any other join burst.
    pub async fn rejoin_shard(&self, shard_idx: usize) {
        let owned: Vec<String> = self
            .membership
            .iter()
            .filter(|entry| *entry.value() == shard_idx)
            .map(|entry| entry.key().clone())
            .collect();
        if owned.is_empty() {
            return;
        }
        info!(shard = shard_idx, count = owned.len(), "rejoining channels");
        for channel in owned {
            self.limiters[shard_idx].until_ready().await;
            self.shards[shard_idx].join(&channel).await;
        }
    }

    async fn assign_and_join(&self, channel_login: &str, fill_first: bool) {
        let idx = if fill_first {
            self.place_fill_first()
        } else {
            self.place_least_loaded()
        };
        let Some(idx) = idx else {
            warn!(channel = %channel_login, "all shards at capacity, channel not joined");
            return;
        };

        self.membership.insert(channel_login.to_string(), idx);
        self.limiters[idx].until_ready().await;
        debug!(channel = %channel_login, shard = idx, "joining channel");
        self.shards[idx].join(channel_login).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::policy::ChannelPolicy;
    use crate::rank::Rank;
    use crate::rpc::RpcError;
    use crate::shard::ShardCommand;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct ChannelsPlane {
        channels: parking_lot::Mutex<Vec<String>>,
        follows: parking_lot::Mutex<Vec<String>>,
    }

    impl ChannelsPlane {
        fn new(channels: &[&str]) -> Arc<ChannelsPlane> {
            Arc::new(ChannelsPlane {
                channels: parking_lot::Mutex::new(
                    channels.iter().map(|s| s.to_string()).collect(),
                ),
                follows: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ControlPlane for ChannelsPlane {
        async fn fetch_token(&self) -> Result<Credential, RpcError> {
            Err(RpcError::Timeout)
        }
        async fn config_get(&self, _: &str) -> Result<Option<ChannelPolicy>, RpcError> {
            Ok(None)
        }
        async fn config_update(&self, _: &str, _: Value) -> Result<(), RpcError> {
            Ok(())
        }
        async fn follow_channel(&self, channel: &str) -> Result<(), RpcError> {
            self.follows.lock().push(channel.to_string());
            Ok(())
        }
        async fn rank_get(&self, _: &str) -> Result<Option<Rank>, RpcError> {
            Ok(None)
        }
        async fn channels(&self) -> Result<Vec<String>, RpcError> {
            Ok(self.channels.lock().clone())
        }
    }

    fn test_shards(n: usize) -> (Vec<ShardHandle>, Vec<mpsc::Receiver<ShardCommand>>) {
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for id in 0..n {
            let (tx, rx) = mpsc::channel(64);
            handles.push(ShardHandle::new(id, tx));
            receivers.push(rx);
        }
        (handles, receivers)
    }

    fn scheduler(
        cp: Arc<ChannelsPlane>,
        shards: Vec<ShardHandle>,
        capacity: usize,
    ) -> JoinScheduler {
        JoinScheduler::with_pacing(cp, shards, Duration::from_millis(1), capacity)
    }

    fn expect_join(cmd: Option<ShardCommand>, channel: &str) {
        match cmd {
            Some(ShardCommand::Join(c)) if c == channel => {}
            other => panic!("expected JOIN {channel}, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_fills_first_shard() {
        let cp = ChannelsPlane::new(&["a", "b", "c"]);
        let (shards, mut rxs) = test_shards(2);
        let sched = scheduler(cp.clone(), shards, 80);

        sched.bootstrap().await;
        expect_join(rxs[0].recv().await, "a");
        expect_join(rxs[0].recv().await, "b");
        expect_join(rxs[0].recv().await, "c");
        assert!(rxs[1].try_recv().is_err());

        // Existing channels do not get follow calls.
        assert!(cp.follows.lock().is_empty());
        assert_eq!(sched.owner("a"), Some(0));
        assert_eq!(sched.expected_len(), 3);
    }

    #[tokio::test]
    async fn test_bootstrap_spills_to_second_shard_at_capacity() {
        let cp = ChannelsPlane::new(&["a", "b", "c"]);
        let (shards, mut rxs) = test_shards(2);
        let sched = scheduler(cp, shards, 2);

        sched.bootstrap().await;
        expect_join(rxs[0].recv().await, "a");
        expect_join(rxs[0].recv().await, "b");
        expect_join(rxs[1].recv().await, "c");
        assert_eq!(sched.owner("c"), Some(1));
    }

    #[tokio::test]
    async fn test_late_addition_picks_less_loaded_shard() {
        let cp = ChannelsPlane::new(&["a", "b"]);
        let (shards, mut rxs) = test_shards(2);
        let sched = scheduler(cp.clone(), shards, 80);

        sched.bootstrap().await;
        rxs[0].recv().await;
        rxs[0].recv().await;

        sched.add_channel("newbie").await;
        expect_join(rxs[1].recv().await, "newbie");
        assert_eq!(sched.owner("newbie"), Some(1));

        // New channels get followed.
        assert_eq!(*cp.follows.lock(), vec!["newbie".to_string()]);
    }

    #[tokio::test]
    async fn test_add_is_idempotent_for_members() {
        let cp = ChannelsPlane::new(&[]);
        let (shards, mut rxs) = test_shards(2);
        let sched = scheduler(cp.clone(), shards, 80);

        sched.add_channel("chan").await;
        expect_join(rxs[0].recv().await, "chan");
        sched.add_channel("chan").await;
        assert!(rxs[0].try_recv().is_err());
        assert_eq!(cp.follows.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_parts_from_owner() {
        let cp = ChannelsPlane::new(&["a"]);
        let (shards, mut rxs) = test_shards(2);
        let sched = scheduler(cp, shards, 80);

        sched.bootstrap().await;
        rxs[0].recv().await;

        sched.remove_channel("a").await;
        match rxs[0].recv().await {
            Some(ShardCommand::Part(c)) => assert_eq!(c, "a"),
            other => panic!("expected PART, got {:?}", other),
        }
        assert!(sched.owner("a").is_none());
        assert_eq!(sched.expected_len(), 0);
    }

    #[tokio::test]
    async fn test_rejoin_only_owned_channels() {
        let cp = ChannelsPlane::new(&["a", "b", "c"]);
        let (shards, mut rxs) = test_shards(2);
        let sched = scheduler(cp, shards, 2);

        sched.bootstrap().await;
        for _ in 0..2 {
            rxs[0].recv().await;
        }
        rxs[1].recv().await;

        sched.rejoin_shard(1).await;
        expect_join(rxs[1].recv().await, "c");
        assert!(rxs[1].try_recv().is_err());
        assert!(rxs[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconcile_converges_membership() {
        let cp = ChannelsPlane::new(&["a", "b"]);
        let (shards, mut rxs) = test_shards(2);
        let sched = scheduler(cp.clone(), shards, 80);

        sched.bootstrap().await;
        rxs[0].recv().await;
        rxs[0].recv().await;

        *cp.channels.lock() = vec!["b".to_string(), "c".to_string()];
        sched.reconcile().await;

        // One join for c, one part for a, in some order across shards.
        let mut joined = None;
        let mut parted = None;
        for rx in rxs.iter_mut() {
            while let Ok(cmd) = rx.try_recv() {
                match cmd {
                    ShardCommand::Join(c) => joined = Some(c),
                    ShardCommand::Part(c) => parted = Some(c),
                    other => panic!("unexpected command {:?}", other),
                }
            }
        }
        assert_eq!(joined.as_deref(), Some("c"));
        assert_eq!(parted.as_deref(), Some("a"));
        assert!(sched.is_member("b"));
        assert!(!sched.is_member("a"));
    }
}
