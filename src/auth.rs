//! Bearer-credential lifecycle.
//!
//! The bot never runs OAuth flows itself; the control plane hands out
//! ready-to-use tokens. One credential feeds both IRC logins and
//! moderation-API calls, so a rotation has to bounce every shard.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use crate::rpc::{ControlPlane, RpcError};

/// How often the background monitor checks remaining token life.
const CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Refresh once remaining life drops below this.
const REFRESH_BELOW_MINUTES: i64 = 120;

/// Bearer credential issued by the control plane.
#[derive(Clone, Debug)]
pub struct Credential {
    pub token: String,
    /// The bot's own chat login.
    pub login: String,
    /// The bot's numeric platform id.
    pub user_id: String,
    pub expires_at_ms: i64,
}

impl Credential {
    pub fn remaining_minutes(&self) -> i64 {
        (self.expires_at_ms - Utc::now().timestamp_millis()) / 60_000
    }

    /// The PASS value for IRC login.
    pub fn irc_pass(&self) -> String {
        format!("oauth:{}", self.token)
    }

    /// The bearer value for the moderation API (no `oauth:` prefix).
    pub fn bearer(&self) -> &str {
        &self.token
    }
}

/// Holds the current credential and drives refresh.
pub struct TokenProvider {
    cp: Arc<dyn ControlPlane>,
    current: RwLock<Credential>,
    rotations: broadcast::Sender<()>,
    refresh_requested: Notify,
}

impl TokenProvider {
    /// Fetch the initial credential. A failure here is fatal to boot.
    pub async fn boot(cp: Arc<dyn ControlPlane>) -> Result<Arc<TokenProvider>, RpcError> {
        let cred = cp.fetch_token().await?;
        info!(
            login = %cred.login,
            remaining_minutes = cred.remaining_minutes(),
            "credential acquired"
        );
        let (rotations, _) = broadcast::channel(4);
        Ok(Arc::new(TokenProvider {
            cp,
            current: RwLock::new(cred),
            rotations,
            refresh_requested: Notify::new(),
        }))
    }

    /// Snapshot of the current credential.
    pub fn current(&self) -> Credential {
        self.current.read().clone()
    }

    /// Rotation events: fired whenever a refresh produced a different token.
    pub fn subscribe_rotations(&self) -> broadcast::Receiver<()> {
        self.rotations.subscribe()
    }

    /// Ask the monitor to refresh out of band (e.g. after a 401 from the
    /// moderation API).
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Fetch a fresh credential. Returns `true` when the token changed, in
    /// which case a rotation event has been broadcast.
    pub async fn refresh(&self) -> Result<bool, RpcError> {
        let fresh = self.cp.fetch_token().await?;
        let rotated = {
            let mut current = self.current.write();
            let rotated = current.token != fresh.token;
            *current = fresh;
            rotated
        };
        if rotated {
            info!("credential rotated");
            let _ = self.rotations.send(());
        }
        Ok(rotated)
    }

    /// Periodic credential check. A failed refresh keeps the current token
    /// (still valid until expiry) and retries on the next tick.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let remaining = provider.current().remaining_minutes();
                        if remaining >= REFRESH_BELOW_MINUTES {
                            debug!(remaining_minutes = remaining, "credential still fresh");
                            continue;
                        }
                        if let Err(e) = provider.refresh().await {
                            warn!(error = %e, remaining_minutes = remaining, "credential refresh failed, retrying next tick");
                        }
                    }
                    _ = provider.refresh_requested.notified() => {
                        info!("out-of-band credential refresh requested");
                        if let Err(e) = provider.refresh().await {
                            warn!(error = %e, "requested credential refresh failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("token monitor stopping");
                        break;
                    }
                }
            }
        })
    }
}
