//! Users and sessions.
//!
//! Passwords are hashed with bcrypt on the blocking thread pool; the store locks are never held
//! while hashing. Plaintext passwords are never stored or logged.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    time::Duration,
};
use uuid::Uuid;

pub use bcrypt::DEFAULT_COST;

/// bcrypt only reads the first 72 bytes of its input; longer passwords are refused outright.
pub const MAX_PASSWORD_BYTES: usize = 72;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("username already exists")]
    AlreadyExists,

    #[error("password longer than {MAX_PASSWORD_BYTES} bytes")]
    PasswordTooLong,

    /// Returned for unknown usernames and wrong passwords alike.
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("password hashing failed: {0}")]
    Hashing(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub bcrypt_cost: u32,
    /// `None` keeps sessions alive for the lifetime of the process.
    pub session_ttl: Option<Duration>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            bcrypt_cost: DEFAULT_COST,
            session_ttl: None,
        }
    }
}

struct User {
    id: UserId,
    password_hash: String,
}

struct Session {
    user_id: UserId,
    created_at: DateTime<Utc>,
}

pub struct IdentityStore {
    users: RwLock<HashMap<String, User>>,
    sessions: RwLock<HashMap<String, Session>>,
    cfg: IdentityConfig,
    // Verified against when the username is unknown so both failure paths cost one bcrypt verify.
    dummy_hash: String,
}

impl fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityStore")
            .field("users", &self.users.read().len())
            .field("sessions", &self.sessions.read().len())
            .field("cfg", &self.cfg)
            .finish()
    }
}

impl IdentityStore {
    pub fn new(cfg: IdentityConfig) -> Result<Self, IdentityError> {
        let dummy_hash = bcrypt::hash(Uuid::new_v4().to_string(), cfg.bcrypt_cost)
            .map_err(|e| IdentityError::Hashing(e.to_string()))?;
        Ok(Self {
            users: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            cfg,
            dummy_hash,
        })
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserId, IdentityError> {
        if password.len() > MAX_PASSWORD_BYTES {
            return Err(IdentityError::PasswordTooLong);
        }
        if self.users.read().contains_key(username) {
            return Err(IdentityError::AlreadyExists);
        }

        let password_hash = hash_password(password.to_string(), self.cfg.bcrypt_cost).await?;

        // Re-check under the write lock: a concurrent registration may have won the race.
        let mut users = self.users.write();
        match users.entry(username.to_string()) {
            Entry::Occupied(_) => Err(IdentityError::AlreadyExists),
            Entry::Vacant(slot) => {
                let id = UserId::generate();
                slot.insert(User {
                    id: id.clone(),
                    password_hash,
                });
                Ok(id)
            }
        }
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserId, IdentityError> {
        let found = self
            .users
            .read()
            .get(username)
            .map(|u| (u.id.clone(), u.password_hash.clone()));

        // No stored hash can match an over-long password; still pay for one verify.
        let (user_id, hash) = match found {
            Some((id, hash)) if password.len() <= MAX_PASSWORD_BYTES => (Some(id), hash),
            _ => (None, self.dummy_hash.clone()),
        };

        let matches = verify_password(password.to_string(), hash).await?;
        match user_id {
            Some(id) if matches => Ok(id),
            _ => Err(IdentityError::InvalidCredentials),
        }
    }

    pub fn create_session(&self, user_id: &UserId) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.write().insert(
            session_id.clone(),
            Session {
                user_id: user_id.clone(),
                created_at: Utc::now(),
            },
        );
        session_id
    }

    pub fn resolve_session(&self, session_id: &str) -> Result<UserId, IdentityError> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(session_id)
            .ok_or(IdentityError::Unauthenticated)?;
        if self.is_expired(session, Utc::now()) {
            return Err(IdentityError::Unauthenticated);
        }
        Ok(session.user_id.clone())
    }

    /// Drop expired sessions; returns how many were removed.
    pub fn evict_expired_sessions(&self) -> usize {
        if self.cfg.session_ttl.is_none() {
            return 0;
        }
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !self.is_expired(s, now));
        before - sessions.len()
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.cfg.session_ttl else {
            return false;
        };
        let ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        session.created_at + ttl <= now
    }
}

async fn hash_password(password: String, cost: u32) -> Result<String, IdentityError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| IdentityError::Hashing(format!("task join error: {e}")))?
        .map_err(|e| IdentityError::Hashing(e.to_string()))
}

async fn verify_password(password: String, hash: String) -> Result<bool, IdentityError> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| IdentityError::Hashing(format!("task join error: {e}")))?
        .map_err(|e| IdentityError::Hashing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(session_ttl: Option<Duration>) -> IdentityStore {
        IdentityStore::new(IdentityConfig {
            bcrypt_cost: 4,
            session_ttl,
        })
        .expect("identity store")
    }

    #[tokio::test]
    async fn register_then_authenticate() -> anyhow::Result<()> {
        let identity = store(None);
        let id = identity.register("alice", "secret").await?;
        let authed = identity.authenticate("alice", "secret").await?;
        anyhow::ensure!(id == authed);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_username_rejected() -> anyhow::Result<()> {
        let identity = store(None);
        identity.register("alice", "secret").await?;
        let err = identity.register("alice", "other").await.err();
        anyhow::ensure!(matches!(err, Some(IdentityError::AlreadyExists)), "got {err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_are_indistinguishable() -> anyhow::Result<()> {
        let identity = store(None);
        identity.register("alice", "secret").await?;

        let wrong = identity.authenticate("alice", "wrong").await.err();
        let unknown = identity.authenticate("mallory", "secret").await.err();
        anyhow::ensure!(matches!(wrong, Some(IdentityError::InvalidCredentials)));
        anyhow::ensure!(matches!(unknown, Some(IdentityError::InvalidCredentials)));
        anyhow::ensure!(wrong.map(|e| e.to_string()) == unknown.map(|e| e.to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn passwords_past_bcrypt_limit_are_refused() -> anyhow::Result<()> {
        let identity = store(None);
        let prefix = "p".repeat(MAX_PASSWORD_BYTES);

        let err = identity
            .register("alice", &format!("{prefix}-correct-suffix"))
            .await
            .err();
        anyhow::ensure!(matches!(err, Some(IdentityError::PasswordTooLong)), "got {err:?}");

        identity.register("bob", &prefix).await?;
        identity.authenticate("bob", &prefix).await?;
        let err = identity
            .authenticate("bob", &format!("{prefix}-totally-wrong"))
            .await
            .err();
        anyhow::ensure!(
            matches!(err, Some(IdentityError::InvalidCredentials)),
            "got {err:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_registrations_of_one_name_admit_one() -> anyhow::Result<()> {
        let identity = std::sync::Arc::new(store(None));
        let mut handles = Vec::new();
        for i in 0..8 {
            let identity = identity.clone();
            handles.push(tokio::spawn(async move {
                identity.register("bob", &format!("pw{i}")).await.is_ok()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await? {
                admitted += 1;
            }
        }
        anyhow::ensure!(admitted == 1, "expected exactly one registration, got {admitted}");
        Ok(())
    }

    #[tokio::test]
    async fn sessions_resolve_to_their_user() -> anyhow::Result<()> {
        let identity = store(None);
        let id = identity.register("alice", "secret").await?;
        let token = identity.create_session(&id);
        anyhow::ensure!(identity.resolve_session(&token)? == id);
        anyhow::ensure!(matches!(
            identity.resolve_session("not-a-session"),
            Err(IdentityError::Unauthenticated)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn expired_sessions_are_rejected_and_evicted() -> anyhow::Result<()> {
        let identity = store(Some(Duration::from_millis(20)));
        let id = identity.register("alice", "secret").await?;
        let token = identity.create_session(&id);
        anyhow::ensure!(identity.resolve_session(&token).is_ok());

        tokio::time::sleep(Duration::from_millis(40)).await;
        anyhow::ensure!(matches!(
            identity.resolve_session(&token),
            Err(IdentityError::Unauthenticated)
        ));
        anyhow::ensure!(identity.evict_expired_sessions() == 1);
        Ok(())
    }
}
