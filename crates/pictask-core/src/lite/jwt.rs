//! HS256 commit capability tokens.
//!
//! The worker signs one short-lived token per commit; the gateway verifies it. Verification
//! accepts the current key and, during a rotation, the announced next key. Keys are selected by
//! the `kid` header.

use crate::{CommitCapabilityClaims, Error, Result, Signer, TaskId};
use anyhow::Context;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::{fmt, time::Duration};

#[derive(Clone)]
pub struct Hs256CommitCapabilityConfig {
    pub issuer: String,
    pub audience: String,
    pub current_kid: String,
    pub current_secret: String,
    pub next_kid: Option<String>,
    pub next_secret: Option<String>,
    pub ttl: Duration,
}

impl fmt::Debug for Hs256CommitCapabilityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hs256CommitCapabilityConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("current_kid", &self.current_kid)
            .field("current_secret", &"<redacted>")
            .field("next_kid", &self.next_kid)
            .field("next_secret", &self.next_secret.as_ref().map(|_| "<redacted>"))
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Clone)]
struct VerifyingKey {
    kid: String,
    key: DecodingKey,
}

#[derive(Clone)]
pub struct CommitCapability {
    issuer: String,
    audience: String,
    ttl: chrono::Duration,
    signing_kid: String,
    signing_key: EncodingKey,
    /// Current key first, then the next key when a rotation is configured.
    verifying_keys: Vec<VerifyingKey>,
    validation: Validation,
}

impl fmt::Debug for CommitCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kids: Vec<&str> = self.verifying_keys.iter().map(|k| k.kid.as_str()).collect();
        f.debug_struct("CommitCapability")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("ttl", &self.ttl)
            .field("signing_kid", &self.signing_kid)
            .field("verifying_kids", &kids)
            .finish_non_exhaustive()
    }
}

impl CommitCapability {
    pub fn from_hs256_config(cfg: Hs256CommitCapabilityConfig) -> Result<Self> {
        if cfg.current_secret.is_empty() {
            return Err(Error::msg("commit capability secret must not be empty"));
        }

        let mut verifying_keys = vec![VerifyingKey {
            kid: cfg.current_kid.clone(),
            key: DecodingKey::from_secret(cfg.current_secret.as_bytes()),
        }];
        match (cfg.next_kid, cfg.next_secret) {
            (Some(kid), Some(secret)) => verifying_keys.push(VerifyingKey {
                kid,
                key: DecodingKey::from_secret(secret.as_bytes()),
            }),
            (None, None) => {}
            _ => return Err(Error::msg("next_kid and next_secret must be set together")),
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[cfg.issuer.as_str()]);
        validation.set_audience(&[cfg.audience.as_str()]);

        let ttl = chrono::Duration::from_std(cfg.ttl).context("commit capability ttl")?;

        Ok(Self {
            signing_key: EncodingKey::from_secret(cfg.current_secret.as_bytes()),
            signing_kid: cfg.current_kid,
            issuer: cfg.issuer,
            audience: cfg.audience,
            ttl,
            verifying_keys,
            validation,
        })
    }

    pub fn issue(&self, task_id: &TaskId) -> Result<String> {
        let issued_at = Utc::now();
        let claims = CommitCapabilityClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: format!("commit:{task_id}"),
            iat: epoch_seconds(issued_at),
            exp: epoch_seconds(issued_at + self.ttl),
            task_id: task_id.clone(),
        };

        let header = Header {
            kid: Some(self.signing_kid.clone()),
            ..Header::new(Algorithm::HS256)
        };
        let token = jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .context("encode commit capability token")?;
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> Result<CommitCapabilityClaims> {
        let header = jsonwebtoken::decode_header(token).context("decode jwt header")?;
        let kid = header.kid.ok_or_else(|| Error::msg("missing jwt kid"))?;
        let key = self
            .verifying_keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or_else(|| Error::msg(format!("unknown jwt kid {kid}")))?;

        let data = jsonwebtoken::decode::<CommitCapabilityClaims>(token, &key.key, &self.validation)
            .context("verify commit capability")?;
        Ok(data.claims)
    }
}

fn epoch_seconds(at: chrono::DateTime<Utc>) -> usize {
    usize::try_from(at.timestamp()).unwrap_or(0)
}

impl Signer for CommitCapability {
    fn issue_commit_capability(&self, task_id: &TaskId) -> Result<String> {
        self.issue(task_id)
    }

    fn verify_commit_capability(&self, token: &str) -> Result<CommitCapabilityClaims> {
        self.verify(token)
    }
}
