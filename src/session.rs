//! Session tokens gated by a human-verification challenge.
//!
//! `POST /session` exchanges a challenge response for a short-lived token:
//!
//! ```text
//! {expires_at}.{nonce}.{hex(hmac_sha256(secret, "{expires_at}.{nonce}"))}
//! ```
//!
//! Tokens are stateless; verification only recomputes the MAC and checks the
//! expiry. Challenges from single-use verifiers are recorded in the cache so a
//! replayed response is refused even if the verifier would accept it again.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{keys, KeyValueCache};
use crate::config::SessionConfig;
use crate::error::SessionError;

type HmacSha256 = Hmac<Sha256>;

const TURNSTILE_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    async fn verify(&self, challenge: &str, remote_ip: Option<&str>) -> Result<bool>;

    /// Whether an accepted challenge must be refused the second time.
    fn single_use(&self) -> bool {
        true
    }
}

/// Accepts one fixed challenge string. For local development and tests.
pub struct StaticVerifier {
    expected: Option<String>,
}

impl StaticVerifier {
    pub fn new(expected: Option<String>) -> Self {
        Self { expected }
    }
}

#[async_trait]
impl ChallengeVerifier for StaticVerifier {
    async fn verify(&self, challenge: &str, _remote_ip: Option<&str>) -> Result<bool> {
        Ok(self.expected.as_deref() == Some(challenge))
    }

    fn single_use(&self) -> bool {
        false
    }
}

/// Cloudflare Turnstile `siteverify`.
pub struct TurnstileVerifier {
    client: reqwest::Client,
    secret: String,
    url: String,
}

impl TurnstileVerifier {
    pub fn new(secret: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            secret,
            url: TURNSTILE_VERIFY_URL.to_string(),
        })
    }
}

#[async_trait]
impl ChallengeVerifier for TurnstileVerifier {
    async fn verify(&self, challenge: &str, remote_ip: Option<&str>) -> Result<bool> {
        let mut body = serde_json::json!({
            "secret": self.secret,
            "response": challenge,
        });
        if let Some(ip) = remote_ip {
            body["remoteip"] = serde_json::Value::String(ip.to_string());
        }

        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            bail!("siteverify returned {}", response.status());
        }
        let json: serde_json::Value = response.json().await?;
        let ok = json.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        if !ok {
            tracing::info!(
                errors = %json.get("error-codes").cloned().unwrap_or_default(),
                "turnstile rejected challenge"
            );
        }
        Ok(ok)
    }
}

pub fn create_verifier(config: &SessionConfig) -> Result<Box<dyn ChallengeVerifier>> {
    match config.verifier.as_str() {
        "static" => Ok(Box::new(StaticVerifier::new(config.static_challenge.clone()))),
        "turnstile" => {
            let secret = std::env::var(&config.turnstile_secret_env).map_err(|_| {
                anyhow::anyhow!(
                    "{} environment variable not set",
                    config.turnstile_secret_env
                )
            })?;
            Ok(Box::new(TurnstileVerifier::new(secret)?))
        }
        other => bail!("Unknown session verifier: {}", other),
    }
}

/// An issued token and its expiry (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub token: String,
    pub expires_at: i64,
}

pub struct SessionIssuer {
    secret: Vec<u8>,
    ttl_secs: u64,
    cache: Arc<dyn KeyValueCache>,
    verifier: Box<dyn ChallengeVerifier>,
}

impl SessionIssuer {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        ttl_secs: u64,
        cache: Arc<dyn KeyValueCache>,
        verifier: Box<dyn ChallengeVerifier>,
    ) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
            cache,
            verifier,
        }
    }

    /// Reads the signing secret from `session.secret_env`. Without one, a
    /// random per-process secret is used and tokens do not survive a restart.
    pub fn from_config(config: &SessionConfig, cache: Arc<dyn KeyValueCache>) -> Result<Self> {
        let secret = match std::env::var(&config.secret_env) {
            Ok(s) if !s.is_empty() => s,
            _ => {
                if config.required {
                    tracing::warn!(
                        var = %config.secret_env,
                        "session secret not set; using an ephemeral one"
                    );
                }
                format!("{}{}", uuid::Uuid::new_v4(), uuid::Uuid::new_v4())
            }
        };
        Ok(Self::new(
            secret,
            config.ttl_secs,
            cache,
            create_verifier(config)?,
        ))
    }

    /// Verifies `challenge` and, if accepted, issues a token.
    pub async fn exchange(
        &self,
        challenge: &str,
        remote_ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionToken, SessionError> {
        let challenge = challenge.trim();
        if challenge.is_empty() {
            return Err(SessionError::Rejected);
        }
        if !self.verifier.verify(challenge, remote_ip).await? {
            return Err(SessionError::Rejected);
        }
        if self.verifier.single_use() {
            let fresh = self
                .cache
                .put_if_absent(&keys::spent_challenge(challenge), "1", self.ttl_secs)
                .await?;
            if !fresh {
                return Err(SessionError::Replayed);
            }
        }
        Ok(self.sign(now))
    }

    pub fn sign(&self, now: DateTime<Utc>) -> SessionToken {
        let expires_at = now.timestamp() + self.ttl_secs as i64;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let payload = format!("{}.{}", expires_at, nonce);
        let sig = hex::encode(self.mac(&payload).finalize().into_bytes());
        SessionToken {
            token: format!("{}.{}", payload, sig),
            expires_at,
        }
    }

    /// True for an unexpired token signed with this issuer's secret.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> bool {
        let Some((payload, sig)) = token.rsplit_once('.') else {
            return false;
        };
        let Some((expiry, nonce)) = payload.split_once('.') else {
            return false;
        };
        if nonce.is_empty() {
            return false;
        }
        let Ok(expires_at) = expiry.parse::<i64>() else {
            return false;
        };
        if expires_at <= now.timestamp() {
            return false;
        }
        let Ok(sig_bytes) = hex::decode(sig) else {
            return false;
        };
        self.mac(payload).verify_slice(&sig_bytes).is_ok()
    }

    fn mac(&self, payload: &str) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac key of any length is valid"));
        mac.update(payload.as_bytes());
        mac
    }
}
