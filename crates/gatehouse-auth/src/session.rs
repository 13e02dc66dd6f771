//! Session records, the session store contract, and session materialization.
//!
//! # Overview
//!
//! A [`Session`] is written exactly once per successful callback, with a
//! single [`SessionStore::set`] call, after every validation step has
//! passed. Either the full record (claims and tokens) becomes visible or
//! nothing does.
//!
//! # Security Considerations
//!
//! - Session ids are random v4 UUIDs minted at materialization; ids presented
//!   by the browser before login are never reused
//! - `Debug` output never contains tokens

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::FlowError;
use crate::token::TokenSet;
use crate::userinfo::UserInfo;

/// Writes between opportunistic purges of expired sessions.
const PURGE_INTERVAL: u64 = 256;

/// Session store failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionStoreError {
    /// The backing store could not be reached or refused the operation.
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// Opaque session identifier carried in the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Mints a new random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parses an id presented by a client. Returns `None` for anything that
    /// could not have been minted here.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(|id| Self(id.to_string()))
    }

    /// The id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An established login session.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    /// Always `true` for stored sessions.
    pub logged_in: bool,
    /// User claims: ID token claims overlaid with userinfo claims.
    pub claims: Map<String, Value>,
    /// Access token.
    pub access_token: String,
    /// Raw ID token, used as the logout `id_token_hint`.
    pub id_token: String,
    /// Refresh token, if issued.
    pub refresh_token: Option<String>,
    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Session {
    /// Subject identifier.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }

    /// Best human-readable name for the user.
    #[must_use]
    pub fn display_name(&self) -> &str {
        ["name", "preferred_username", "email", "sub"]
            .iter()
            .find_map(|claim| self.claims.get(*claim).and_then(Value::as_str))
            .unwrap_or("unknown user")
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("logged_in", &self.logged_in)
            .field("sub", &self.subject())
            .field("claims", &self.claims.len())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// External session store contract.
///
/// `set` and `destroy` must be atomic per session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the session, or `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, SessionStoreError>;

    /// Stores a session under `id`, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn set(&self, id: &SessionId, session: Session) -> Result<(), SessionStoreError>;

    /// Removes the session. Removing an absent session succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn destroy(&self, id: &SessionId) -> Result<(), SessionStoreError>;
}

struct StoredSession {
    session: Session,
    expires_at: Instant,
}

/// In-process session store with a fixed session lifetime.
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, StoredSession>,
    ttl: Duration,
    writes: AtomicU64,
}

impl InMemorySessionStore {
    /// Creates a store whose sessions expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            writes: AtomicU64::new(0),
        }
    }

    /// Removes expired sessions, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, stored| stored.expires_at > now);
        before.saturating_sub(self.sessions.len())
    }

    /// Number of stored sessions, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, SessionStoreError> {
        let now = Instant::now();
        let removed = self
            .sessions
            .remove_if(id, |_, stored| stored.expires_at <= now);
        if removed.is_some() {
            return Ok(None);
        }
        Ok(self.sessions.get(id).map(|stored| stored.session.clone()))
    }

    async fn set(&self, id: &SessionId, session: Session) -> Result<(), SessionStoreError> {
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_INTERVAL == PURGE_INTERVAL - 1 {
            let removed = self.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "Purged expired sessions");
            }
        }
        self.sessions.insert(
            id.clone(),
            StoredSession {
                session,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn destroy(&self, id: &SessionId) -> Result<(), SessionStoreError> {
        self.sessions.remove(id);
        Ok(())
    }
}

/// Turns validated tokens into a stored session.
#[derive(Clone)]
pub struct SessionMaterializer {
    store: Arc<dyn SessionStore>,
}

impl SessionMaterializer {
    /// Creates a materializer over a store.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Builds the session record without storing it.
    #[must_use]
    pub fn build(tokens: &TokenSet, userinfo: Option<UserInfo>) -> Session {
        let mut claims = tokens.claims.user_claims();
        if let Some(info) = userinfo {
            for (name, value) in info.into_claims() {
                claims.insert(name, value);
            }
        }
        Session {
            logged_in: true,
            claims,
            access_token: tokens.access_token.clone(),
            id_token: tokens.id_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Stores a new session under a freshly minted id and destroys the
    /// browser's previous session, if any.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::SessionStore` if the new session cannot be
    /// stored. Failing to destroy the previous session is logged only.
    pub async fn materialize(
        &self,
        tokens: &TokenSet,
        userinfo: Option<UserInfo>,
        previous: Option<&SessionId>,
    ) -> Result<(SessionId, Session), FlowError> {
        let session = Self::build(tokens, userinfo);
        let id = SessionId::generate();

        self.store.set(&id, session.clone()).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to store session");
            FlowError::SessionStore(e)
        })?;

        if let Some(previous) = previous
            && let Err(e) = self.store.destroy(previous).await
        {
            tracing::warn!(error = %e, "Failed to destroy previous session during rotation");
        }

        tracing::info!(sub = ?session.subject(), "Session established");
        Ok((id, session))
    }
}
