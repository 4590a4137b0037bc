//! Supervisor: boot sequence, background tasks, graceful shutdown.
//!
//! The supervisor owns every component for the process lifetime. Boot
//! order matters: credential first (fatal if unavailable), then the shards
//! (second staggered to avoid a simultaneous login burst), then the token
//! monitor, pub/sub subscriber, sweeper, and reconcile loop.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::auth::TokenProvider;
use crate::cache::{ConfigCache, RankCache};
use crate::commands::CommandInterpreter;
use crate::config::BotConfig;
use crate::dispatch::Dispatcher;
use crate::moderation::{Helix, ModerationExecutor};
use crate::pubsub::PubSubSubscriber;
use crate::roles::SuperAdmins;
use crate::rpc::{ControlPlane, SignedRpc};
use crate::scheduler::JoinScheduler;
use crate::shard::{Shard, ShardEvent, ShardHandle};

const SHARD_COUNT: usize = 2;

/// Stagger between the two shard connects.
const SHARD_STAGGER: Duration = Duration::from_secs(2);

/// Expected-set reconcile cadence (safety net behind pub/sub).
const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

/// Sweeper runs at 90 s plus up to 30 s of jitter.
const SWEEP_BASE: Duration = Duration::from_secs(90);
const SWEEP_JITTER_SECS: u64 = 30;

/// How long to wait for shard QUITs to flush on shutdown.
const QUIT_GRACE: Duration = Duration::from_millis(500);

const FAREWELL: &str = "EloWard signing off";

pub struct Bot {
    shutdown_tx: broadcast::Sender<()>,
    events_rx: mpsc::Receiver<ShardEvent>,
    scheduler: Arc<JoinScheduler>,
    dispatcher: Arc<Dispatcher>,
    shards: Vec<ShardHandle>,
}

impl Bot {
    /// Bring the process up. Errors here are fatal; the caller exits
    /// non-zero and the orchestrator restarts us.
    pub async fn boot(config: BotConfig) -> anyhow::Result<Bot> {
        let cp: Arc<dyn ControlPlane> = Arc::new(SignedRpc::new(
            &config.control_plane_url,
            &config.hmac_secret,
        ));

        let provider = TokenProvider::boot(Arc::clone(&cp))
            .await
            .map_err(|e| anyhow::anyhow!("initial credential fetch failed: {e}"))?;

        let admins = SuperAdmins::new(config.super_admins.iter());
        let (shutdown_tx, _) = broadcast::channel(8);
        let (events_tx, events_rx) = mpsc::channel(1024);

        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for id in 0..SHARD_COUNT {
            if id > 0 {
                tokio::time::sleep(SHARD_STAGGER).await;
            }
            shards.push(Shard::spawn(
                id,
                config.irc_addr.clone(),
                Arc::clone(&provider),
                events_tx.clone(),
            ));
        }
        info!(count = shards.len(), addr = %config.irc_addr, "shards connecting");

        let config_cache = Arc::new(ConfigCache::new(Arc::clone(&cp)));
        let rank_cache = Arc::new(RankCache::new(Arc::clone(&cp)));
        let scheduler = Arc::new(JoinScheduler::new(Arc::clone(&cp), shards.clone()));

        let helix = Arc::new(Helix::new(
            &config.helix_url,
            &config.client_id,
            Arc::clone(&provider),
        ));
        let executor = Arc::new(ModerationExecutor::new(
            helix,
            Arc::clone(&provider),
            admins.clone(),
        ));
        let interpreter = Arc::new(CommandInterpreter::new(
            Arc::clone(&cp),
            Arc::clone(&config_cache),
            admins.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config_cache),
            Arc::clone(&rank_cache),
            Arc::clone(&scheduler),
            executor,
            interpreter,
            admins,
            shards.clone(),
        ));

        provider.spawn_monitor(shutdown_tx.subscribe());
        spawn_rotation_listener(&provider, shards.clone(), shutdown_tx.subscribe());
        spawn_sweeper(Arc::clone(&rank_cache), shutdown_tx.subscribe());
        spawn_reconciler(Arc::clone(&scheduler), shutdown_tx.subscribe());

        match &config.pubsub_url {
            Some(url) => {
                let subscriber = Arc::new(PubSubSubscriber::new(
                    Arc::clone(&config_cache),
                    Arc::clone(&scheduler),
                ));
                let url = url.clone();
                let shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = subscriber.run(&url, shutdown_rx).await {
                        error!(error = %e, "pub/sub subscriber failed; instant propagation disabled");
                    }
                });
            }
            None => {
                warn!("no pub/sub endpoint configured; relying on periodic reconcile only");
            }
        }

        Ok(Bot {
            shutdown_tx,
            events_rx,
            scheduler,
            dispatcher,
            shards,
        })
    }

    /// Sender used by the signal handler to stop the bot.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Drive shard events until shutdown.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut bootstrapped = false;

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(ShardEvent::Registered(idx)) => {
                        info!(shard = idx, "shard registered");
                        let scheduler = Arc::clone(&self.scheduler);
                        if !bootstrapped {
                            // First registration: load the expected set and
                            // walk it. Channels seen at boot are existing,
                            // not new.
                            bootstrapped = true;
                            tokio::spawn(async move { scheduler.bootstrap().await });
                        } else {
                            // Reconnect (or the second shard coming up):
                            // re-issue JOINs for whatever it already owns.
                            tokio::spawn(async move { scheduler.rejoin_shard(idx).await });
                        }
                    }
                    Some(ShardEvent::Closed(idx)) => {
                        warn!(shard = idx, "shard connection closed");
                    }
                    Some(ShardEvent::Line(idx, msg)) => {
                        self.dispatcher.handle_line(idx, msg);
                    }
                    None => {
                        error!("all shard event senders dropped");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(self) {
        // Stop timers and the pub/sub subscriber, then say goodbye.
        let _ = self.shutdown_tx.send(());
        for shard in &self.shards {
            shard.quit(FAREWELL).await;
        }
        tokio::time::sleep(QUIT_GRACE).await;
        info!(channels = self.scheduler.member_count(), "bot stopped");
    }
}

/// A rotated credential invalidates every live IRC session: tell each
/// shard to close and reconnect with the new token.
fn spawn_rotation_listener(
    provider: &Arc<TokenProvider>,
    shards: Vec<ShardHandle>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut rotations = provider.subscribe_rotations();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rotations.recv() => match event {
                    Ok(()) => {
                        info!("rotating shard connections for new credential");
                        for shard in &shards {
                            shard.rotate().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Coalesced rotations still mean "reconnect once".
                        for shard in &shards {
                            shard.rotate().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

/// Evict expired rank entries on a jittered interval. Config entries are
/// permanent until invalidated and are never swept.
fn spawn_sweeper(rank_cache: Arc<RankCache>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        loop {
            let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..=SWEEP_JITTER_SECS));
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_BASE + jitter) => {
                    let removed = rank_cache.sweep_expired();
                    if removed > 0 {
                        debug!(removed = removed, remaining = rank_cache.len(), "rank cache swept");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

/// Periodic expected-set reload. Pub/sub is the primary propagation plane;
/// this closes the gap when events are missed.
fn spawn_reconciler(scheduler: Arc<JoinScheduler>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {
                    scheduler.reconcile().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}
