//! elowardbot - rank-gated chat moderation bot for Twitch.
//!
//! Outbound-only worker: two IRC shards, a signed control-plane client,
//! and a pub/sub invalidation feed. No inbound sockets; structured logs
//! are the only observable surface.

mod auth;
mod cache;
mod commands;
mod config;
mod dispatch;
mod error;
mod moderation;
mod policy;
mod pubsub;
mod rank;
mod roles;
mod rpc;
mod scheduler;
mod shard;
mod supervisor;

use tracing::{error, info};

use crate::config::{BotConfig, LogFormat};
use crate::supervisor::Bot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BotConfig::load();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    if let Err(errors) = config.validate() {
        for err in &errors {
            error!(error = %err, "configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "configuration validation failed with {} error(s)",
            errors.len()
        ));
    }
    if config.client_id.is_empty() {
        tracing::warn!("ELOWARD_CLIENT_ID is empty; moderation API calls will be rejected");
    }

    info!(
        control_plane = %config.control_plane_url,
        irc = %config.irc_addr,
        region = %config.region,
        "starting elowardbot"
    );

    let bot = Bot::boot(config).await?;

    // Graceful shutdown on SIGINT/SIGTERM.
    {
        let shutdown_tx = bot.shutdown_handle();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
            let _ = shutdown_tx.send(());
        });
    }

    bot.run().await
}
