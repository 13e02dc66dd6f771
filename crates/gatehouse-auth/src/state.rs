//! Per-attempt correlation secrets.
//!
//! Every login attempt gets a fresh `state` (CSRF defense), `nonce` (replay
//! defense, bound into the ID token) and, when enabled, a PKCE verifier. The
//! attempt is stored under its `state` value and consumed exactly once by the
//! callback.
//!
//! # Security Considerations
//!
//! - `state` and `nonce` carry 256 bits of entropy each, base64url encoded
//! - [`AttemptStorage::take`] must be an atomic lookup-and-remove so that two
//!   concurrent callbacks with the same `state` cannot both succeed
//! - Expired attempts are unusable even if still present in the store
//! - Never log `state`, `nonce` or verifier values

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use time::OffsetDateTime;

use crate::error::FlowError;
use crate::pkce::PkceVerifier;
use crate::session::SessionStoreError;

/// Issues between opportunistic purges of expired attempts.
const PURGE_INTERVAL: u64 = 256;

/// Generates an opaque, URL-safe random token with 256 bits of entropy.
#[must_use]
pub fn generate_token() -> String {
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().r#gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A pending login attempt.
#[derive(Clone)]
pub struct AuthRequestState {
    /// Opaque `state` value; also the storage key.
    pub state: String,
    /// Opaque `nonce` value expected in the ID token.
    pub nonce: String,
    /// PKCE verifier, when PKCE is enabled.
    pub pkce_verifier: Option<PkceVerifier>,
    /// Value of the browser-binding cookie set alongside the redirect.
    pub browser_binding: Option<String>,
    /// When the attempt was issued.
    pub created_at: OffsetDateTime,
    /// When the attempt stops being usable.
    pub expires_at: OffsetDateTime,
}

impl AuthRequestState {
    /// Returns `true` if the attempt is expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Returns `true` if the attempt is expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Returns `true` if `presented` matches the recorded browser binding.
    ///
    /// Attempts issued without a binding accept any caller.
    #[must_use]
    pub fn is_bound_to(&self, presented: Option<&str>) -> bool {
        match self.browser_binding.as_deref() {
            None => true,
            Some(expected) => presented.is_some_and(|p| constant_time_eq(expected, p)),
        }
    }
}

impl std::fmt::Debug for AuthRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequestState")
            .field("state", &"..")
            .field("nonce", &"..")
            .field("pkce", &self.pkce_verifier.is_some())
            .field("bound", &self.browser_binding.is_some())
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Storage for pending login attempts.
#[async_trait]
pub trait AttemptStorage: Send + Sync {
    /// Stores an attempt under its `state` value.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn insert(&self, attempt: AuthRequestState) -> Result<(), SessionStoreError>;

    /// Atomically removes and returns the attempt stored under `state`.
    ///
    /// Of any number of concurrent calls with the same `state`, at most one
    /// returns `Some`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn take(&self, state: &str) -> Result<Option<AuthRequestState>, SessionStoreError>;

    /// Removes attempts expired at `now`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn purge_expired(&self, now: OffsetDateTime) -> Result<usize, SessionStoreError>;
}

/// In-process attempt storage backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryAttemptStorage {
    attempts: DashMap<String, AuthRequestState>,
}

impl InMemoryAttemptStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored attempts, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[async_trait]
impl AttemptStorage for InMemoryAttemptStorage {
    async fn insert(&self, attempt: AuthRequestState) -> Result<(), SessionStoreError> {
        self.attempts.insert(attempt.state.clone(), attempt);
        Ok(())
    }

    async fn take(&self, state: &str) -> Result<Option<AuthRequestState>, SessionStoreError> {
        Ok(self.attempts.remove(state).map(|(_, attempt)| attempt))
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<usize, SessionStoreError> {
        let before = self.attempts.len();
        self.attempts.retain(|_, attempt| !attempt.is_expired_at(now));
        Ok(before.saturating_sub(self.attempts.len()))
    }
}

/// Issues and consumes login attempts.
pub struct StateManager {
    storage: Arc<dyn AttemptStorage>,
    ttl: Duration,
    pkce_enabled: bool,
    issued: AtomicU64,
}

impl StateManager {
    /// Creates a manager over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn AttemptStorage>, ttl: Duration, pkce_enabled: bool) -> Self {
        Self {
            storage,
            ttl,
            pkce_enabled,
            issued: AtomicU64::new(0),
        }
    }

    /// Creates a manager with in-memory storage.
    #[must_use]
    pub fn in_memory(ttl: Duration, pkce_enabled: bool) -> Self {
        Self::new(Arc::new(InMemoryAttemptStorage::new()), ttl, pkce_enabled)
    }

    /// Attempt lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a new attempt and stores it.
    ///
    /// `browser_binding` is the value of the cookie the caller sets on the
    /// browser together with the authorization redirect.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::SessionStore` if the attempt cannot be stored.
    pub async fn issue(&self, browser_binding: Option<String>) -> Result<AuthRequestState, FlowError> {
        if self.issued.fetch_add(1, Ordering::Relaxed) % PURGE_INTERVAL == PURGE_INTERVAL - 1 {
            self.purge_expired().await?;
        }

        let now = OffsetDateTime::now_utc();
        let attempt = AuthRequestState {
            state: generate_token(),
            nonce: generate_token(),
            pkce_verifier: self.pkce_enabled.then(PkceVerifier::generate),
            browser_binding,
            created_at: now,
            expires_at: now + self.ttl,
        };

        self.storage.insert(attempt.clone()).await?;
        tracing::debug!(
            pkce = attempt.pkce_verifier.is_some(),
            ttl_secs = self.ttl.as_secs(),
            "Issued login attempt"
        );
        Ok(attempt)
    }

    /// Consumes the attempt stored under `state`.
    ///
    /// The attempt is removed whether or not it turns out to be expired.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidState` if the state is empty, unknown,
    /// already consumed or expired, and `FlowError::SessionStore` if the
    /// store fails.
    pub async fn consume(&self, state: &str) -> Result<AuthRequestState, FlowError> {
        if state.is_empty() {
            return Err(FlowError::InvalidState);
        }

        let Some(attempt) = self.storage.take(state).await? else {
            tracing::warn!("Callback state is unknown or already consumed");
            return Err(FlowError::InvalidState);
        };

        if attempt.is_expired() {
            tracing::warn!(
                created_at = %attempt.created_at,
                "Callback state has expired"
            );
            return Err(FlowError::InvalidState);
        }

        Ok(attempt)
    }

    /// Removes expired attempts.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::SessionStore` if the store fails.
    pub async fn purge_expired(&self) -> Result<usize, FlowError> {
        let removed = self.storage.purge_expired(OffsetDateTime::now_utc()).await?;
        if removed > 0 {
            tracing::debug!(removed, "Purged expired login attempts");
        }
        Ok(removed)
    }
}
