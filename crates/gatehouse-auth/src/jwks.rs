//! Provider signing key cache.
//!
//! Holds the identity provider's JSON Web Key Set and hands out verification
//! keys by `kid`.
//!
//! # Overview
//!
//! - Keys are fresh for the configured TTL, or the provider's
//!   `Cache-Control: max-age` (clamped) when present
//! - At most one fetch is in flight per cache; concurrent callers that miss
//!   wait for it and reuse its result instead of fetching again
//! - An unknown `kid` on a fresh cache triggers a refetch at most once per
//!   cooldown window (key rotation)
//! - When a refresh fails, expired keys are still served within the stale
//!   grace period
//!
//! # Security Considerations
//!
//! - Only HTTPS JWKS endpoints are fetched unless `allow_http` is set
//! - Encryption keys (`use: "enc"`) are never returned for verification
//! - Response size is capped and TTLs from headers are bounded

use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::{Mutex, RwLock};
use url::Url;

use crate::config::RelyingPartyConfig;

/// Maximum accepted JWKS size in bytes.
const MAX_JWKS_SIZE: usize = 1024 * 1024;

/// Configuration for the signing key cache.
#[derive(Debug, Clone)]
pub struct JwksCacheConfig {
    /// Freshness when the provider sends no `Cache-Control` (default: 1 hour).
    pub ttl: Duration,

    /// Lower bound for `max-age` (default: 1 minute).
    pub min_ttl: Duration,

    /// Upper bound for `max-age` (default: 24 hours).
    pub max_ttl: Duration,

    /// How long expired keys may be served after a failed refresh
    /// (default: 5 minutes).
    pub stale_grace: Duration,

    /// Minimum spacing of refetches caused by an unknown `kid`
    /// (default: 30 seconds).
    pub refresh_cooldown: Duration,

    /// Allow `http://` JWKS endpoints.
    pub allow_http: bool,
}

impl Default for JwksCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),           // 1 hour
            min_ttl: Duration::from_secs(60),         // 1 minute
            max_ttl: Duration::from_secs(86400),      // 24 hours
            stale_grace: Duration::from_secs(300),    // 5 minutes
            refresh_cooldown: Duration::from_secs(30),
            allow_http: false,
        }
    }
}

impl JwksCacheConfig {
    /// Derives the cache configuration from relying-party settings.
    #[must_use]
    pub fn from_relying_party(config: &RelyingPartyConfig) -> Self {
        Self {
            ttl: config.jwks_cache_ttl,
            stale_grace: config.jwks_stale_grace,
            refresh_cooldown: config.jwks_refresh_cooldown,
            allow_http: config.allow_http,
            ..Self::default()
        }
    }

    /// Sets the default TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the stale grace period.
    #[must_use]
    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    /// Sets the unknown-`kid` refetch cooldown.
    #[must_use]
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    /// Allows `http://` JWKS endpoints. Tests only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur while obtaining signing keys.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// A network error occurred while fetching the JWKS.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The provider answered with a non-success status.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The JWKS could not be parsed.
    #[error("Failed to parse JWKS: {0}")]
    ParseError(String),

    /// No key with the requested `kid` exists.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The JWKS contains no usable signing keys.
    #[error("No signing keys found in JWKS")]
    NoSigningKeys,

    /// The JWKS URI scheme is not allowed.
    #[error("Invalid URL scheme: only HTTPS is allowed")]
    InvalidScheme,

    /// The response exceeded the size cap.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The cap.
        max_size: usize,
    },
}

/// A verification key taken from the JWKS.
#[derive(Clone)]
pub struct SigningKey {
    /// Key identifier, if the JWK has one.
    pub kid: Option<String>,
    /// Key material.
    pub key: DecodingKey,
    /// Algorithm pinned by the JWK's `alg`, if any.
    pub algorithm: Option<Algorithm>,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

struct CachedJwks {
    jwks: JwkSet,
    fetched_at: Instant,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entry: Option<CachedJwks>,
    /// Incremented on every fetch attempt, successful or not.
    fetch_attempts: u64,
}

/// Signing key cache for a single provider JWKS endpoint.
pub struct JwksCache {
    http_client: reqwest::Client,
    jwks_uri: Url,
    config: JwksCacheConfig,
    state: RwLock<CacheState>,
    refresh_lock: Mutex<()>,
}

impl JwksCache {
    /// Creates an empty cache for `jwks_uri`.
    #[must_use]
    pub fn new(http_client: reqwest::Client, jwks_uri: Url, config: JwksCacheConfig) -> Self {
        Self {
            http_client,
            jwks_uri,
            config,
            state: RwLock::new(CacheState::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// The endpoint this cache fetches from.
    #[must_use]
    pub fn jwks_uri(&self) -> &Url {
        &self.jwks_uri
    }

    /// Returns the candidate verification keys for a token.
    ///
    /// With a `kid`, returns the matching key. Without one, returns every
    /// signing key so the caller can try each.
    ///
    /// # Errors
    ///
    /// Returns `JwksError::KeyNotFound` if the `kid` is unknown even after a
    /// permitted refresh, `JwksError::NoSigningKeys` if the set has no
    /// usable keys, or the fetch error when no fresh or stale keys exist.
    pub async fn keys_for(&self, kid: Option<&str>) -> Result<Vec<SigningKey>, JwksError> {
        let observed_attempts = {
            let state = self.state.read().await;
            if let Some(entry) = &state.entry
                && Instant::now() < entry.expires_at
            {
                let keys = select_keys(&entry.jwks, kid);
                if !keys.is_empty() {
                    tracing::trace!(kid = ?kid, "JWKS cache hit");
                    return Ok(keys);
                }
                if entry.fetched_at.elapsed() < self.config.refresh_cooldown {
                    tracing::debug!(kid = ?kid, "Unknown kid within refresh cooldown");
                    return Err(not_found(kid));
                }
            }
            state.fetch_attempts
        };

        self.refresh_once(observed_attempts).await?;

        let state = self.state.read().await;
        let entry = state.entry.as_ref().ok_or(JwksError::NoSigningKeys)?;
        let keys = select_keys(&entry.jwks, kid);
        if keys.is_empty() {
            Err(not_found(kid))
        } else {
            Ok(keys)
        }
    }

    /// Fetches unless another caller already did so since `observed_attempts`.
    ///
    /// On failure, succeeds anyway if the cached keys are within the stale
    /// grace period.
    async fn refresh_once(&self, observed_attempts: u64) -> Result<(), JwksError> {
        let _guard = self.refresh_lock.lock().await;

        {
            let state = self.state.read().await;
            if state.fetch_attempts != observed_attempts {
                return match &state.entry {
                    Some(entry) if self.is_usable(entry) => Ok(()),
                    _ => Err(JwksError::NetworkError(
                        "concurrent JWKS refresh failed".to_string(),
                    )),
                };
            }
        }

        let result = self.fetch().await;

        let mut state = self.state.write().await;
        state.fetch_attempts += 1;
        match result {
            Ok(cached) => {
                tracing::debug!(
                    uri = %self.jwks_uri,
                    keys = cached.jwks.keys.len(),
                    "Refreshed JWKS"
                );
                state.entry = Some(cached);
                Ok(())
            }
            Err(e) => match &state.entry {
                Some(entry) if self.is_usable(entry) => {
                    tracing::warn!(
                        uri = %self.jwks_uri,
                        error = %e,
                        "JWKS refresh failed, serving stale keys"
                    );
                    Ok(())
                }
                _ => {
                    tracing::warn!(uri = %self.jwks_uri, error = %e, "JWKS refresh failed");
                    Err(e)
                }
            },
        }
    }

    /// Fresh, or expired but within the stale grace period.
    fn is_usable(&self, entry: &CachedJwks) -> bool {
        Instant::now() < entry.expires_at + self.config.stale_grace
    }

    async fn fetch(&self) -> Result<CachedJwks, JwksError> {
        self.validate_scheme()?;

        let response = self
            .http_client
            .get(self.jwks_uri.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| JwksError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > MAX_JWKS_SIZE
        {
            return Err(JwksError::ResponseTooLarge {
                max_size: MAX_JWKS_SIZE,
            });
        }

        let ttl = self.parse_cache_control(response.headers());

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| JwksError::ParseError(e.to_string()))?;

        let now = Instant::now();
        Ok(CachedJwks {
            jwks,
            fetched_at: now,
            expires_at: now + ttl,
        })
    }

    fn validate_scheme(&self) -> Result<(), JwksError> {
        match self.jwks_uri.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            _ => Err(JwksError::InvalidScheme),
        }
    }

    /// Returns `max-age` clamped to `[min_ttl, max_ttl]`, or the default TTL.
    fn parse_cache_control(&self, headers: &reqwest::header::HeaderMap) -> Duration {
        headers
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split(',').find_map(|directive| {
                    directive
                        .trim()
                        .strip_prefix("max-age=")
                        .and_then(|age| age.parse::<u64>().ok())
                })
            })
            .map(|age| {
                Duration::from_secs(age)
                    .min(self.config.max_ttl)
                    .max(self.config.min_ttl)
            })
            .unwrap_or(self.config.ttl)
    }

    /// Drops the cached keys.
    pub async fn invalidate(&self) {
        self.state.write().await.entry = None;
        tracing::debug!(uri = %self.jwks_uri, "Invalidated JWKS cache");
    }

    /// Returns `true` if keys are cached, fresh or not.
    pub async fn is_populated(&self) -> bool {
        self.state.read().await.entry.is_some()
    }
}

fn not_found(kid: Option<&str>) -> JwksError {
    match kid {
        Some(kid) => JwksError::KeyNotFound(kid.to_string()),
        None => JwksError::NoSigningKeys,
    }
}

/// Signing keys matching `kid`, or all signing keys when `kid` is `None`.
fn select_keys(jwks: &JwkSet, kid: Option<&str>) -> Vec<SigningKey> {
    jwks.keys
        .iter()
        .filter(|jwk| !matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)))
        .filter(|jwk| kid.is_none_or(|kid| jwk.common.key_id.as_deref() == Some(kid)))
        .filter_map(|jwk| {
            DecodingKey::from_jwk(jwk).ok().map(|key| SigningKey {
                kid: jwk.common.key_id.clone(),
                key,
                algorithm: jwk_algorithm(jwk),
            })
        })
        .collect()
}

/// Extracts the signing algorithm from a JWK.
fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{IDP_KEY, ROGUE_KEY, jwks_json};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cache_for(server: &MockServer, config: JwksCacheConfig) -> JwksCache {
        let uri = Url::parse(&format!("{}/certs", server.uri())).unwrap();
        JwksCache::new(reqwest::Client::new(), uri, config.with_allow_http(true))
    }

    #[test]
    fn test_parse_cache_control() {
        let cache = JwksCache::new(
            reqwest::Client::new(),
            Url::parse("https://example.com/certs").unwrap(),
            JwksCacheConfig::default(),
        );

        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(3600));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            "public, max-age=1800".parse().unwrap(),
        );
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(1800));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::CACHE_CONTROL, "max-age=5".parse().unwrap());
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(60));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            "max-age=1000000".parse().unwrap(),
        );
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(86400));
    }

    #[tokio::test]
    async fn test_select_by_kid_and_skip_encryption_keys() {
        let mut body = jwks_json(&[(&IDP_KEY, "idp-1"), (&ROGUE_KEY, "other")]);
        body["keys"][1]["use"] = serde_json::json!("enc");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let cache = cache_for(&server, JwksCacheConfig::default());
        let keys = cache.keys_for(Some("idp-1")).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid.as_deref(), Some("idp-1"));
        assert_eq!(keys[0].algorithm, Some(Algorithm::RS256));

        let all = cache.keys_for(None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(jwks_json(&[(&IDP_KEY, "idp-1")]))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(cache_for(&server, JwksCacheConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.keys_for(Some("idp-1")).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_kid_respects_cooldown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[(&IDP_KEY, "idp-1")])))
            .expect(1)
            .mount(&server)
            .await;

        let cache = cache_for(&server, JwksCacheConfig::default());
        assert!(cache.keys_for(Some("idp-1")).await.is_ok());

        for _ in 0..3 {
            let err = cache.keys_for(Some("rotated")).await.unwrap_err();
            assert!(matches!(err, JwksError::KeyNotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_unknown_kid_refetches_after_cooldown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[(&IDP_KEY, "idp-1")])))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[
                (&IDP_KEY, "idp-1"),
                (&ROGUE_KEY, "idp-2"),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let cache = cache_for(
            &server,
            JwksCacheConfig::default().with_refresh_cooldown(Duration::ZERO),
        );
        assert!(cache.keys_for(Some("idp-1")).await.is_ok());
        let keys = cache.keys_for(Some("idp-2")).await.unwrap();
        assert_eq!(keys[0].kid.as_deref(), Some("idp-2"));
    }

    #[tokio::test]
    async fn test_stale_keys_served_within_grace() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[(&IDP_KEY, "idp-1")])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cache = cache_for(&server, JwksCacheConfig::default().with_ttl(Duration::ZERO));
        assert!(cache.keys_for(Some("idp-1")).await.is_ok());
        // Expired immediately; the refresh fails but the grace period covers it.
        assert!(cache.keys_for(Some("idp-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_failure_without_grace() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[(&IDP_KEY, "idp-1")])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cache = cache_for(
            &server,
            JwksCacheConfig::default()
                .with_ttl(Duration::ZERO)
                .with_stale_grace(Duration::ZERO),
        );
        assert!(cache.keys_for(Some("idp-1")).await.is_ok());
        let err = cache.keys_for(Some("idp-1")).await.unwrap_err();
        assert!(matches!(err, JwksError::HttpError(503)));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(&[(&IDP_KEY, "idp-1")])))
            .expect(2)
            .mount(&server)
            .await;

        let cache = cache_for(&server, JwksCacheConfig::default());
        cache.keys_for(Some("idp-1")).await.unwrap();
        assert!(cache.is_populated().await);
        cache.invalidate().await;
        assert!(!cache.is_populated().await);
        cache.keys_for(Some("idp-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_rejected_when_not_allowed() {
        let cache = JwksCache::new(
            reqwest::Client::new(),
            Url::parse("http://example.com/certs").unwrap(),
            JwksCacheConfig::default(),
        );
        let err = cache.keys_for(Some("idp-1")).await.unwrap_err();
        assert!(matches!(err, JwksError::InvalidScheme));
    }
}
