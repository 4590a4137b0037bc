//! Moderation executor: resolve ids, double-check mod status, issue the
//! timeout through the platform's moderation API.
//!
//! The executor re-checks exemption even though the dispatcher already
//! filtered; a timeout issued to a moderator is the one failure mode this
//! system must never have.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::policy::ChannelPolicy;
use crate::roles::{AuthorRoles, SuperAdmins};

/// Deadline for moderation API calls.
const HELIX_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the moderation API client.
#[derive(Debug, Error)]
pub enum HelixError {
    #[error("transport: {0}")]
    Transport(reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("authorization rejected ({0})")]
    Auth(u16),

    #[error("rate limited")]
    RateLimited,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("malformed payload: {0}")]
    Schema(String),
}

impl From<reqwest::Error> for HelixError {
    fn from(err: reqwest::Error) -> HelixError {
        if err.is_timeout() {
            HelixError::Timeout
        } else {
            HelixError::Transport(err)
        }
    }
}

impl HelixError {
    fn from_status(status: u16) -> HelixError {
        match status {
            401 | 403 => HelixError::Auth(status),
            429 => HelixError::RateLimited,
            other => HelixError::Status(other),
        }
    }
}

/// The moderation API surface the executor needs.
#[async_trait]
pub trait HelixApi: Send + Sync {
    /// Resolve numeric ids for up to a handful of logins in one lookup.
    /// Logins unknown to the platform are absent from the result.
    async fn user_ids(&self, logins: &[&str]) -> Result<HashMap<String, String>, HelixError>;

    /// Whether `user_id` is on the moderator list of `broadcaster_id`.
    async fn is_moderator(&self, broadcaster_id: &str, user_id: &str)
    -> Result<bool, HelixError>;

    /// Issue a timeout of `duration` seconds.
    async fn ban_user(
        &self,
        broadcaster_id: &str,
        moderator_id: &str,
        user_id: &str,
        duration: u32,
        reason: &str,
    ) -> Result<(), HelixError>;
}

/// Production client for the platform's helix-style endpoints.
pub struct Helix {
    http: reqwest::Client,
    base: String,
    client_id: String,
    provider: Arc<TokenProvider>,
}

impl Helix {
    pub fn new(base: &str, client_id: &str, provider: Arc<TokenProvider>) -> Helix {
        let http = reqwest::Client::builder()
            .timeout(HELIX_TIMEOUT)
            .user_agent(concat!("eloward-bot/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Helix {
            http,
            base: base.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            provider,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let cred = self.provider.current();
        self.http
            .request(method, url)
            .bearer_auth(cred.bearer())
            .header("Client-Id", &self.client_id)
    }
}

#[async_trait]
impl HelixApi for Helix {
    async fn user_ids(&self, logins: &[&str]) -> Result<HashMap<String, String>, HelixError> {
        let query: Vec<(&str, &str)> = logins.iter().map(|l| ("login", *l)).collect();
        let resp = self
            .request(reqwest::Method::GET, &format!("{}/users", self.base))
            .query(&query)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(HelixError::from_status(status));
        }
        let payload = resp
            .json::<Value>()
            .await
            .map_err(|e| HelixError::Schema(e.to_string()))?;
        let data = payload
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| HelixError::Schema("data".into()))?;

        let mut ids = HashMap::new();
        for user in data {
            let login = user.get("login").and_then(Value::as_str);
            let id = user.get("id").and_then(Value::as_str);
            if let (Some(login), Some(id)) = (login, id) {
                ids.insert(login.to_ascii_lowercase(), id.to_string());
            }
        }
        Ok(ids)
    }

    async fn is_moderator(
        &self,
        broadcaster_id: &str,
        user_id: &str,
    ) -> Result<bool, HelixError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("{}/moderation/moderators", self.base),
            )
            .query(&[("broadcaster_id", broadcaster_id), ("user_id", user_id)])
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(HelixError::from_status(status));
        }
        let payload = resp
            .json::<Value>()
            .await
            .map_err(|e| HelixError::Schema(e.to_string()))?;
        let listed = payload
            .get("data")
            .and_then(Value::as_array)
            .map(|data| !data.is_empty())
            .unwrap_or(false);
        Ok(listed)
    }

    async fn ban_user(
        &self,
        broadcaster_id: &str,
        moderator_id: &str,
        user_id: &str,
        duration: u32,
        reason: &str,
    ) -> Result<(), HelixError> {
        let body = json!({
            "data": {
                "user_id": user_id,
                "duration": duration,
                "reason": reason,
            }
        });
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("{}/moderation/bans", self.base),
            )
            .query(&[("broadcaster_id", broadcaster_id), ("moderator_id", moderator_id)])
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status == 200 {
            Ok(())
        } else {
            Err(HelixError::from_status(status))
        }
    }
}

/// What happened when enforcement asked for a timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModerationOutcome {
    TimedOut { duration: u32 },
    /// The author turned out to be exempt on recheck.
    SkippedExempt,
    /// The moderator-list double check found the author.
    SkippedModListed,
}

/// Errors from the executor; all are logged and never retried. The next
/// offending message triggers again.
#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("no reason template configured for the active mode")]
    TemplateMissing,

    #[error("could not resolve id for {0}")]
    UserUnresolved(String),

    #[error(transparent)]
    Api(#[from] HelixError),
}

/// Issues timeouts against the moderation API.
pub struct ModerationExecutor {
    helix: Arc<dyn HelixApi>,
    provider: Arc<TokenProvider>,
    admins: SuperAdmins,
}

impl ModerationExecutor {
    pub fn new(
        helix: Arc<dyn HelixApi>,
        provider: Arc<TokenProvider>,
        admins: SuperAdmins,
    ) -> ModerationExecutor {
        ModerationExecutor {
            helix,
            provider,
            admins,
        }
    }

    /// Time out `user_login` in `channel_login` under `policy`.
    pub async fn execute(
        &self,
        channel_login: &str,
        user_login: &str,
        roles: &AuthorRoles,
        policy: &ChannelPolicy,
    ) -> Result<ModerationOutcome, ModerationError> {
        if self.admins.contains(user_login) || roles.is_exempt() {
            debug!(channel = %channel_login, user = %user_login, "exempt on recheck, skipping timeout");
            return Ok(ModerationOutcome::SkippedExempt);
        }

        // A missing template is a configuration error, never papered over
        // with a default string.
        let reason = policy
            .render_reason(user_login)
            .ok_or(ModerationError::TemplateMissing)?;

        let bot_login = self.provider.current().login;
        let result = self
            .run(channel_login, user_login, &bot_login, policy, &reason)
            .await;

        if let Err(ModerationError::Api(HelixError::Auth(status))) = &result {
            warn!(status = status, "moderation API rejected credential, requesting refresh");
            self.provider.request_refresh();
        }
        result
    }

    async fn run(
        &self,
        channel_login: &str,
        user_login: &str,
        bot_login: &str,
        policy: &ChannelPolicy,
        reason: &str,
    ) -> Result<ModerationOutcome, ModerationError> {
        let ids = self
            .helix
            .user_ids(&[user_login, channel_login, bot_login])
            .await?;
        let user_id = ids
            .get(user_login)
            .ok_or_else(|| ModerationError::UserUnresolved(user_login.to_string()))?;
        let broadcaster_id = ids
            .get(channel_login)
            .ok_or_else(|| ModerationError::UserUnresolved(channel_login.to_string()))?;
        let bot_id = ids
            .get(bot_login)
            .ok_or_else(|| ModerationError::UserUnresolved(bot_login.to_string()))?;

        // Badges can be stale; the moderator list is authoritative. A
        // failed check does not block the timeout.
        match self.helix.is_moderator(broadcaster_id, user_id).await {
            Ok(true) => {
                info!(channel = %channel_login, user = %user_login, "author is mod-listed, aborting timeout");
                return Ok(ModerationOutcome::SkippedModListed);
            }
            Ok(false) => {}
            Err(e) => {
                debug!(channel = %channel_login, error = %e, "moderator-list check failed, continuing");
            }
        }

        let duration = policy.timeout();
        self.helix
            .ban_user(broadcaster_id, bot_id, user_id, duration, reason)
            .await?;
        info!(
            channel = %channel_login,
            user = %user_login,
            duration = duration,
            "timeout issued"
        );
        Ok(ModerationOutcome::TimedOut { duration })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::policy::ChannelPolicy;
    use crate::rank::Rank;
    use crate::rpc::{ControlPlane, RpcError};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticPlane;

    #[async_trait]
    impl ControlPlane for StaticPlane {
        async fn fetch_token(&self) -> Result<Credential, RpcError> {
            Ok(Credential {
                token: "tok".into(),
                login: "elowardbot".into(),
                user_id: "999".into(),
                expires_at_ms: chrono::Utc::now().timestamp_millis() + 3_600_000,
            })
        }
        async fn config_get(&self, _: &str) -> Result<Option<ChannelPolicy>, RpcError> {
            Ok(None)
        }
        async fn config_update(&self, _: &str, _: Value) -> Result<(), RpcError> {
            Ok(())
        }
        async fn follow_channel(&self, _: &str) -> Result<(), RpcError> {
            Ok(())
        }
        async fn rank_get(&self, _: &str) -> Result<Option<Rank>, RpcError> {
            Ok(None)
        }
        async fn channels(&self) -> Result<Vec<String>, RpcError> {
            Ok(vec![])
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct BanCall {
        broadcaster_id: String,
        moderator_id: String,
        user_id: String,
        duration: u32,
        reason: String,
    }

    struct FakeHelix {
        mod_listed: AtomicBool,
        mod_check_fails: AtomicBool,
        bans: Mutex<Vec<BanCall>>,
        lookups: Mutex<Vec<Vec<String>>>,
    }

    impl FakeHelix {
        fn new() -> Arc<FakeHelix> {
            Arc::new(FakeHelix {
                mod_listed: AtomicBool::new(false),
                mod_check_fails: AtomicBool::new(false),
                bans: Mutex::new(Vec::new()),
                lookups: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HelixApi for FakeHelix {
        async fn user_ids(&self, logins: &[&str]) -> Result<HashMap<String, String>, HelixError> {
            self.lookups
                .lock()
                .push(logins.iter().map(|s| s.to_string()).collect());
            Ok(logins
                .iter()
                .enumerate()
                .map(|(i, login)| (login.to_string(), format!("id-{i}-{login}")))
                .collect())
        }

        async fn is_moderator(&self, _: &str, _: &str) -> Result<bool, HelixError> {
            if self.mod_check_fails.load(Ordering::SeqCst) {
                return Err(HelixError::Status(500));
            }
            Ok(self.mod_listed.load(Ordering::SeqCst))
        }

        async fn ban_user(
            &self,
            broadcaster_id: &str,
            moderator_id: &str,
            user_id: &str,
            duration: u32,
            reason: &str,
        ) -> Result<(), HelixError> {
            self.bans.lock().push(BanCall {
                broadcaster_id: broadcaster_id.to_string(),
                moderator_id: moderator_id.to_string(),
                user_id: user_id.to_string(),
                duration,
                reason: reason.to_string(),
            });
            Ok(())
        }
    }

    async fn executor(helix: Arc<FakeHelix>, admins: SuperAdmins) -> ModerationExecutor {
        let provider = TokenProvider::boot(Arc::new(StaticPlane)).await.unwrap();
        ModerationExecutor::new(helix, provider, admins)
    }

    fn has_rank_policy() -> ChannelPolicy {
        serde_json::from_str(
            r#"{
                "enabled": true,
                "mode": "has_rank",
                "timeout_seconds": 30,
                "reason_template_has_rank": "{user}: {seconds}s timeout, link your rank at {site}"
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_timeout_issued_with_rendered_reason() {
        let helix = FakeHelix::new();
        let exec = executor(helix.clone(), SuperAdmins::default()).await;

        let outcome = exec
            .execute("streamer", "alice", &AuthorRoles::default(), &has_rank_policy())
            .await
            .unwrap();
        assert_eq!(outcome, ModerationOutcome::TimedOut { duration: 30 });

        let bans = helix.bans.lock();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].user_id, "id-0-alice");
        assert_eq!(bans[0].broadcaster_id, "id-1-streamer");
        assert_eq!(bans[0].moderator_id, "id-2-elowardbot");
        assert_eq!(bans[0].duration, 30);
        assert_eq!(
            bans[0].reason,
            "alice: 30s timeout, link your rank at eloward.com"
        );

        // Single users-lookup covering all three logins.
        let lookups = helix.lookups.lock();
        assert_eq!(lookups.len(), 1);
        assert_eq!(lookups[0], vec!["alice", "streamer", "elowardbot"]);
    }

    #[tokio::test]
    async fn test_exempt_recheck_skips_without_api_calls() {
        let helix = FakeHelix::new();
        let exec = executor(helix.clone(), SuperAdmins::default()).await;

        let roles = AuthorRoles {
            moderator: true,
            ..AuthorRoles::default()
        };
        let outcome = exec
            .execute("streamer", "modlady", &roles, &has_rank_policy())
            .await
            .unwrap();
        assert_eq!(outcome, ModerationOutcome::SkippedExempt);
        assert!(helix.lookups.lock().is_empty());
        assert!(helix.bans.lock().is_empty());
    }

    #[tokio::test]
    async fn test_super_admin_always_skipped() {
        let helix = FakeHelix::new();
        let exec = executor(helix.clone(), SuperAdmins::new(["rootuser"])).await;

        let outcome = exec
            .execute("streamer", "rootuser", &AuthorRoles::default(), &has_rank_policy())
            .await
            .unwrap();
        assert_eq!(outcome, ModerationOutcome::SkippedExempt);
        assert!(helix.bans.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_template_aborts() {
        let helix = FakeHelix::new();
        let exec = executor(helix.clone(), SuperAdmins::default()).await;

        let mut policy = has_rank_policy();
        policy.reason_template_has_rank = None;
        let err = exec
            .execute("streamer", "alice", &AuthorRoles::default(), &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, ModerationError::TemplateMissing));
        assert!(helix.bans.lock().is_empty());
    }

    #[tokio::test]
    async fn test_mod_listed_aborts_ban() {
        let helix = FakeHelix::new();
        helix.mod_listed.store(true, Ordering::SeqCst);
        let exec = executor(helix.clone(), SuperAdmins::default()).await;

        let outcome = exec
            .execute("streamer", "sneaky", &AuthorRoles::default(), &has_rank_policy())
            .await
            .unwrap();
        assert_eq!(outcome, ModerationOutcome::SkippedModListed);
        assert!(helix.bans.lock().is_empty());
    }

    #[tokio::test]
    async fn test_mod_check_failure_does_not_block_timeout() {
        let helix = FakeHelix::new();
        helix.mod_check_fails.store(true, Ordering::SeqCst);
        let exec = executor(helix.clone(), SuperAdmins::default()).await;

        let outcome = exec
            .execute("streamer", "alice", &AuthorRoles::default(), &has_rank_policy())
            .await
            .unwrap();
        assert_eq!(outcome, ModerationOutcome::TimedOut { duration: 30 });
    }

    #[tokio::test]
    async fn test_duration_clamped_from_policy() {
        let helix = FakeHelix::new();
        let exec = executor(helix.clone(), SuperAdmins::default()).await;

        let mut policy = has_rank_policy();
        policy.timeout_seconds = 5_000_000;
        exec.execute("streamer", "alice", &AuthorRoles::default(), &policy)
            .await
            .unwrap();
        assert_eq!(helix.bans.lock()[0].duration, crate::policy::TIMEOUT_MAX);
    }
}
