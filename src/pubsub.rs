//! Pub/sub subscriber: the instant configuration-propagation plane.
//!
//! One topic, one JSON object per message. Handling is intentionally dumb:
//! invalidate the policy entry unconditionally and let the next message
//! hot-fill the cache. Drop-and-refetch is insensitive to event reordering
//! as long as the control plane publishes after its write commits.

use std::sync::Arc;

use fred::prelude::*;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::ConfigCache;
use crate::scheduler::JoinScheduler;

/// Topic carrying config invalidation events.
const TOPIC: &str = "eloward:config:updates";

/// A parsed invalidation event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub channel_login: String,
    /// Carried for future ordering use; invalidation semantics do not need
    /// it today.
    pub version: Option<u64>,
}

/// Parse one pub/sub payload. Foreign event types and malformed JSON
/// return `None`.
pub fn parse_event(payload: &str) -> Option<ConfigUpdate> {
    let value: Value = serde_json::from_str(payload).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("config_update") {
        return None;
    }
    let channel_login = value
        .get("channel_login")
        .and_then(Value::as_str)?
        .to_ascii_lowercase();
    Some(ConfigUpdate {
        channel_login,
        version: value.get("version").and_then(Value::as_u64),
    })
}

pub struct PubSubSubscriber {
    config: Arc<ConfigCache>,
    scheduler: Arc<JoinScheduler>,
}

impl PubSubSubscriber {
    pub fn new(config: Arc<ConfigCache>, scheduler: Arc<JoinScheduler>) -> PubSubSubscriber {
        PubSubSubscriber { config, scheduler }
    }

    /// Apply one invalidation event.
    ///
    /// A channel we are not yet carrying is a newly enabled one: put it in
    /// the expected set, join it on the less-loaded shard, and follow it.
    pub async fn apply(&self, update: ConfigUpdate) {
        self.config.invalidate(&update.channel_login);
        if !self.scheduler.is_member(&update.channel_login) {
            info!(channel = %update.channel_login, "invalidation for unjoined channel, joining");
            self.scheduler.add_channel(&update.channel_login).await;
        }
    }

    /// Connect and consume events until shutdown. After a successful
    /// connect, reconnection and resubscription are the client's job.
    pub async fn run(
        self: Arc<Self>,
        url: &str,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), RedisError> {
        let config = RedisConfig::from_url(url)?;
        let policy = ReconnectPolicy::new_exponential(0, 500, 30_000, 2);
        let subscriber = Builder::from_config(config)
            .set_policy(policy)
            .build_subscriber_client()?;
        let _conn = subscriber.init().await?;
        let _resub = subscriber.manage_subscriptions();
        subscriber.subscribe(TOPIC).await?;
        info!(topic = TOPIC, "pub/sub subscriber connected");

        let mut rx = subscriber.message_rx();
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(msg) => {
                        let Some(payload) = msg.value.as_str() else {
                            debug!("non-text pub/sub payload ignored");
                            continue;
                        };
                        match parse_event(&payload) {
                            Some(update) => self.apply(update).await,
                            None => debug!("foreign pub/sub event ignored"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Safe to continue: the reconcile pass picks up
                        // anything we missed.
                        warn!(missed = missed, "pub/sub receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("pub/sub message stream closed");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => {
                    debug!("pub/sub subscriber stopping");
                    break;
                }
            }
        }

        subscriber.quit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::policy::ChannelPolicy;
    use crate::rank::Rank;
    use crate::rpc::{ControlPlane, RpcError};
    use crate::shard::{ShardCommand, ShardHandle};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_config_update() {
        let update = parse_event(
            r#"{"type":"config_update","channel_login":"Carol","fields":{"enabled":true},"version":9,"updated_at":1721900000}"#,
        )
        .unwrap();
        assert_eq!(update.channel_login, "carol");
        assert_eq!(update.version, Some(9));
    }

    #[test]
    fn test_parse_ignores_foreign_types() {
        assert!(parse_event(r#"{"type":"heartbeat"}"#).is_none());
        assert!(parse_event(r#"{"channel_login":"x"}"#).is_none());
        assert!(parse_event("not json").is_none());
    }

    struct QuietPlane {
        follows: Mutex<Vec<String>>,
        policy_fetches: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ControlPlane for QuietPlane {
        async fn fetch_token(&self) -> Result<Credential, RpcError> {
            Err(RpcError::Timeout)
        }
        async fn config_get(&self, channel: &str) -> Result<Option<ChannelPolicy>, RpcError> {
            self.policy_fetches.lock().push(channel.to_string());
            Ok(None)
        }
        async fn config_update(
            &self,
            _: &str,
            _: serde_json::Value,
        ) -> Result<(), RpcError> {
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
            Ok(vec![])
        }
    }

    fn setup() -> (
        Arc<QuietPlane>,
        Arc<ConfigCache>,
        PubSubSubscriber,
        Vec<mpsc::Receiver<ShardCommand>>,
    ) {
        let plane = Arc::new(QuietPlane {
            follows: Mutex::new(Vec::new()),
            policy_fetches: Mutex::new(Vec::new()),
        });
        let cp: Arc<dyn ControlPlane> = plane.clone();

        let mut handles = Vec::new();
        let mut rxs = Vec::new();
        for id in 0..2 {
            let (tx, rx) = mpsc::channel(16);
            handles.push(ShardHandle::new(id, tx));
            rxs.push(rx);
        }

        let config = Arc::new(ConfigCache::new(cp.clone()));
        let scheduler = Arc::new(JoinScheduler::new(cp, handles));
        let subscriber = PubSubSubscriber::new(config.clone(), scheduler);
        (plane, config, subscriber, rxs)
    }

    #[tokio::test]
    async fn test_apply_invalidates_and_lazy_joins() {
        let (plane, config, subscriber, mut rxs) = setup();

        // Warm a (404-cached) entry so the invalidation is observable.
        config.get("carol").await;
        assert_eq!(config.len(), 1);

        subscriber
            .apply(ConfigUpdate {
                channel_login: "carol".into(),
                version: Some(4),
            })
            .await;

        assert_eq!(config.len(), 0);
        match rxs[0].try_recv() {
            Ok(ShardCommand::Join(channel)) => assert_eq!(channel, "carol"),
            other => panic!("expected JOIN, got {:?}", other),
        }
        assert_eq!(*plane.follows.lock(), vec!["carol".to_string()]);

        // The next message hot-fills the cache under fresh policy.
        config.get("carol").await;
        assert_eq!(plane.policy_fetches.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_for_member_channel_only_invalidates() {
        let (plane, _config, subscriber, mut rxs) = setup();

        subscriber
            .apply(ConfigUpdate {
                channel_login: "carol".into(),
                version: None,
            })
            .await;
        let _ = rxs[0].try_recv();
        plane.follows.lock().clear();

        // Second event for the same channel: no new membership changes.
        subscriber
            .apply(ConfigUpdate {
                channel_login: "carol".into(),
                version: None,
            })
            .await;
        assert!(rxs[0].try_recv().is_err());
        assert!(rxs[1].try_recv().is_err());
        assert!(plane.follows.lock().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_event_costs_one_extra_refetch_only() {
        let (plane, config, subscriber, mut rxs) = setup();

        subscriber
            .apply(ConfigUpdate {
                channel_login: "carol".into(),
                version: Some(1),
            })
            .await;
        let _ = rxs[0].try_recv();

        config.get("carol").await;
        subscriber
            .apply(ConfigUpdate {
                channel_login: "carol".into(),
                version: Some(1),
            })
            .await;
        config.get("carol").await;

        assert_eq!(plane.policy_fetches.lock().len(), 2);
    }
}
