//! Signed control-plane RPC client.
//!
//! Every call except the token endpoint carries an `X-Timestamp` header and
//! an `X-HMAC-Signature` header: hex HMAC-SHA256 over the raw concatenation
//! `timestamp || METHOD || path || body` (no delimiters), keyed by the
//! shared secret. The control plane rejects timestamps more than 60 s from
//! its own clock, so signing happens immediately before send.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::Credential;
use crate::policy::ChannelPolicy;
use crate::rank::{Division, Rank, Tier};

type HmacSha256 = Hmac<Sha256>;

/// Deadline for control-plane calls.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from control-plane calls.
///
/// Lives here rather than in `error` because of the `reqwest` conversion.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("malformed payload: {0}")]
    Schema(String),
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> RpcError {
        if err.is_timeout() {
            RpcError::Timeout
        } else {
            RpcError::Transport(err)
        }
    }
}

impl RpcError {
    /// Static code for log labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::Status(_) => "status",
            Self::Schema(_) => "schema",
        }
    }
}

/// The control plane as seen by the bot.
///
/// A trait seam so caches, the interpreter, and the dispatcher can be
/// exercised against an in-memory fake.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch a ready-to-use bearer credential. Unauthenticated.
    async fn fetch_token(&self) -> Result<Credential, RpcError>;

    /// Fetch the policy for a channel. `Ok(None)` means no record exists.
    async fn config_get(&self, channel_login: &str) -> Result<Option<ChannelPolicy>, RpcError>;

    /// Persist a partial policy update. The control plane publishes the
    /// invalidation after the write commits.
    async fn config_update(&self, channel_login: &str, fields: Value) -> Result<(), RpcError>;

    /// Make the bot follow a channel so it appears in the follower list.
    async fn follow_channel(&self, channel_login: &str) -> Result<(), RpcError>;

    /// Look up a user's rank. `Ok(None)` means no rank on record.
    async fn rank_get(&self, user_login: &str) -> Result<Option<Rank>, RpcError>;

    /// The expected channel set.
    async fn channels(&self) -> Result<Vec<String>, RpcError>;
}

/// Production client speaking HTTPS to the control plane.
pub struct SignedRpc {
    http: reqwest::Client,
    base: String,
    secret: Vec<u8>,
}

impl SignedRpc {
    pub fn new(base: &str, secret: &str) -> SignedRpc {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .user_agent(concat!("eloward-bot/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        SignedRpc {
            http,
            base: base.trim_end_matches('/').to_string(),
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Hex MAC over `ts || METHOD || path || body`, byte-for-byte.
    fn sign(&self, timestamp: i64, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: String,
    ) -> Result<reqwest::Response, RpcError> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self.sign(timestamp, method.as_str(), path, &body);
        let url = format!("{}{}", self.base, path);
        debug!(path = %path, "control plane call");

        let mut req = self
            .http
            .request(method, &url)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-HMAC-Signature", signature);
        if !body.is_empty() {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        Ok(req.send().await?)
    }

    async fn post_signed(&self, path: &str, body: &Value) -> Result<reqwest::Response, RpcError> {
        let body = serde_json::to_string(body)
            .map_err(|e| RpcError::Schema(format!("serialize body: {e}")))?;
        self.send_signed(reqwest::Method::POST, path, body).await
    }
}

fn parse_token(payload: Value) -> Result<Credential, RpcError> {
    let token = payload
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::Schema("token".into()))?
        .to_string();
    let user = payload
        .get("user")
        .ok_or_else(|| RpcError::Schema("user".into()))?;
    let login = user
        .get("login")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::Schema("user.login".into()))?
        .to_ascii_lowercase();
    let user_id = user
        .get("id")
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())))
        .ok_or_else(|| RpcError::Schema("user.id".into()))?;
    let expires_at_ms = payload
        .get("expires_at")
        .and_then(Value::as_i64)
        .ok_or_else(|| RpcError::Schema("expires_at".into()))?;

    Ok(Credential {
        token,
        login,
        user_id,
        expires_at_ms,
    })
}

fn parse_rank(payload: Value) -> Result<Option<Rank>, RpcError> {
    let data = payload
        .get("rank_data")
        .ok_or_else(|| RpcError::Schema("rank_data".into()))?;
    let tier = match data.get("rank_tier").and_then(Value::as_str) {
        Some(raw) => raw
            .parse::<Tier>()
            .map_err(|_| RpcError::Schema(format!("rank_tier {raw:?}")))?,
        None => return Ok(None),
    };
    let division = data
        .get("rank_division")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<Division>().ok());
    Ok(Some(Rank::new(tier, division)))
}

#[async_trait]
impl ControlPlane for SignedRpc {
    async fn fetch_token(&self) -> Result<Credential, RpcError> {
        let url = format!("{}/token", self.base);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(RpcError::Status(status));
        }
        parse_token(resp.json::<Value>().await?)
    }

    async fn config_get(&self, channel_login: &str) -> Result<Option<ChannelPolicy>, RpcError> {
        let body = json!({ "channel_login": channel_login });
        let resp = self.post_signed("/bot/config-get", &body).await?;
        match resp.status().as_u16() {
            200 => {
                let policy = resp
                    .json::<ChannelPolicy>()
                    .await
                    .map_err(|e| RpcError::Schema(e.to_string()))?;
                Ok(Some(policy))
            }
            404 => Ok(None),
            status => Err(RpcError::Status(status)),
        }
    }

    async fn config_update(&self, channel_login: &str, fields: Value) -> Result<(), RpcError> {
        let body = json!({ "channel_login": channel_login, "fields": fields });
        let resp = self.post_signed("/bot/config-update", &body).await?;
        match resp.status().as_u16() {
            200 => Ok(()),
            status => Err(RpcError::Status(status)),
        }
    }

    async fn follow_channel(&self, channel_login: &str) -> Result<(), RpcError> {
        let body = json!({ "channel_login": channel_login });
        let resp = self.post_signed("/bot/follow-channel", &body).await?;
        match resp.status().as_u16() {
            200 => Ok(()),
            status => {
                // Following is cosmetic; the caller logs and moves on.
                warn!(channel = %channel_login, status = status, "follow-channel failed");
                Err(RpcError::Status(status))
            }
        }
    }

    async fn rank_get(&self, user_login: &str) -> Result<Option<Rank>, RpcError> {
        let body = json!({ "user_login": user_login });
        let resp = self.post_signed("/rank:get", &body).await?;
        match resp.status().as_u16() {
            200 => parse_rank(
                resp.json::<Value>()
                    .await
                    .map_err(|e| RpcError::Schema(e.to_string()))?,
            ),
            404 => Ok(None),
            status => Err(RpcError::Status(status)),
        }
    }

    async fn channels(&self) -> Result<Vec<String>, RpcError> {
        let resp = self
            .send_signed(reqwest::Method::GET, "/channels", String::new())
            .await?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(RpcError::Status(status));
        }
        let payload = resp
            .json::<Value>()
            .await
            .map_err(|e| RpcError::Schema(e.to_string()))?;
        let channels = payload
            .get("channels")
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::Schema("channels".into()))?;
        Ok(channels
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_ascii_lowercase)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_covers_all_parts_in_order() {
        let rpc = SignedRpc::new("https://cp.example.com", "topsecret");
        let body = r#"{"channel_login":"carol"}"#;
        let sig = rpc.sign(1721900000, "POST", "/bot/config-get", body);

        // Reference MAC over the concatenated canonical string.
        let mut mac = HmacSha256::new_from_slice(b"topsecret").unwrap();
        mac.update(format!("1721900000POST/bot/config-get{body}").as_bytes());
        assert_eq!(sig, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn test_signature_sensitive_to_each_input() {
        let rpc = SignedRpc::new("https://cp.example.com", "topsecret");
        let base = rpc.sign(1, "POST", "/a", "b");
        assert_ne!(base, rpc.sign(2, "POST", "/a", "b"));
        assert_ne!(base, rpc.sign(1, "GET", "/a", "b"));
        assert_ne!(base, rpc.sign(1, "POST", "/x", "b"));
        assert_ne!(base, rpc.sign(1, "POST", "/a", "c"));
    }

    #[test]
    fn test_parse_token_payload() {
        let cred = parse_token(json!({
            "token": "abc123",
            "user": { "login": "EloWardBot", "id": "4242" },
            "expires_at": 1_800_000_000_000i64,
            "expires_in_minutes": 300,
            "needs_refresh_soon": false
        }))
        .unwrap();
        assert_eq!(cred.token, "abc123");
        assert_eq!(cred.login, "elowardbot");
        assert_eq!(cred.user_id, "4242");
        assert_eq!(cred.expires_at_ms, 1_800_000_000_000);
    }

    #[test]
    fn test_parse_token_numeric_id() {
        let cred = parse_token(json!({
            "token": "t",
            "user": { "login": "bot", "id": 99 },
            "expires_at": 1i64
        }))
        .unwrap();
        assert_eq!(cred.user_id, "99");
    }

    #[test]
    fn test_parse_token_missing_field() {
        let err = parse_token(json!({ "user": { "login": "bot", "id": "1" } })).unwrap_err();
        assert_eq!(err.error_code(), "schema");
    }

    #[test]
    fn test_parse_rank_payload() {
        let rank = parse_rank(json!({
            "rank_data": { "rank_tier": "PLATINUM", "rank_division": "II" }
        }))
        .unwrap()
        .unwrap();
        assert_eq!(rank.tier, Tier::Platinum);
        assert_eq!(rank.division, Some(Division::II));
    }

    #[test]
    fn test_parse_rank_null_tier_is_absent() {
        let rank = parse_rank(json!({ "rank_data": { "rank_tier": null } })).unwrap();
        assert!(rank.is_none());
    }

    #[test]
    fn test_parse_rank_garbage_tier_is_schema_error() {
        let err = parse_rank(json!({ "rank_data": { "rank_tier": "WOOD" } })).unwrap_err();
        assert_eq!(err.error_code(), "schema");
    }
}
