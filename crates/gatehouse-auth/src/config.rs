//! Relying-party configuration.
//!
//! [`RelyingPartyConfig`] holds the base settings from which the provider
//! configuration is resolved, plus the knobs that govern the flow itself
//! (state lifetime, clock skew, userinfo policy, outbound timeouts).
//!
//! # Example (TOML)
//!
//! ```toml
//! [oidc]
//! server_url = "https://sso.example.com"
//! realm = "acme"
//! client_id = "web-portal"
//! client_secret = "change-me"
//! redirect_uri = "https://portal.example.com/auth/callback"
//! scopes = ["openid", "profile", "email"]
//! userinfo_policy = "lenient"
//! http_timeout = "5s"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Base settings for the OIDC relying party.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelyingPartyConfig {
    /// Base URL of the identity provider (e.g. `https://sso.example.com`).
    pub server_url: String,

    /// Realm path segment. When set, the issuer is
    /// `{server_url}/realms/{realm}` and endpoints follow the
    /// `/protocol/openid-connect/*` conventions.
    pub realm: Option<String>,

    /// Explicit issuer, overriding the one derived from `server_url`/`realm`.
    pub issuer: Option<String>,

    /// OAuth client identifier.
    pub client_id: String,

    /// OAuth client secret. `None` for public clients, which must use PKCE.
    pub client_secret: Option<String>,

    /// Redirect URI registered with the provider. Sent byte-identical on
    /// the authorization request and the token exchange.
    pub redirect_uri: String,

    /// Requested scopes. Normalized on resolution (`openid` is always present).
    pub scopes: Vec<String>,

    /// Discovery document URL. When set, endpoints are fetched from it.
    pub discovery_url: Option<String>,

    /// Fetch `{issuer}/.well-known/openid-configuration` when no
    /// `discovery_url` is given.
    pub discover: bool,

    /// Explicit endpoint overrides. Take precedence over discovery and
    /// path conventions.
    pub endpoints: EndpointOverrides,

    /// Send a PKCE S256 challenge with the authorization request.
    pub pkce_enabled: bool,

    /// Lifetime of a pending login attempt in seconds.
    pub state_ttl_seconds: u64,

    /// Clock skew tolerated when checking `exp`/`nbf`/`iat`, in seconds.
    pub clock_skew_tolerance_seconds: u64,

    /// What to do when the userinfo call fails or its `sub` differs.
    pub userinfo_policy: UserInfoPolicy,

    /// Timeout for every outbound call (discovery, token, JWKS, userinfo).
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,

    /// How long fetched signing keys are considered fresh.
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,

    /// How long expired keys may still be served when a refresh fails.
    #[serde(with = "humantime_serde")]
    pub jwks_stale_grace: Duration,

    /// Minimum interval between refreshes triggered by an unknown `kid`.
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_cooldown: Duration,

    /// Lifetime of an established session.
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,

    /// Where the browser lands after a successful login.
    pub post_login_redirect: String,

    /// Where the browser lands after a failed login.
    pub error_redirect: String,

    /// Sent to the provider's logout endpoint. Defaults to the origin of
    /// `redirect_uri`.
    pub post_logout_redirect_uri: Option<String>,

    /// Allow `http://` provider URLs. Development and tests only.
    pub allow_http: bool,

    /// Mark cookies `Secure`.
    pub cookie_secure: bool,
}

impl Default for RelyingPartyConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            realm: None,
            issuer: None,
            client_id: String::new(),
            client_secret: None,
            redirect_uri: String::new(),
            scopes: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
            ],
            discovery_url: None,
            discover: false,
            endpoints: EndpointOverrides::default(),
            pkce_enabled: true,
            state_ttl_seconds: 600,           // 10 minutes
            clock_skew_tolerance_seconds: 60, // 1 minute
            userinfo_policy: UserInfoPolicy::Strict,
            http_timeout: Duration::from_secs(5),
            jwks_cache_ttl: Duration::from_secs(3600),     // 1 hour
            jwks_stale_grace: Duration::from_secs(300),    // 5 minutes
            jwks_refresh_cooldown: Duration::from_secs(30),
            session_ttl: Duration::from_secs(8 * 3600), // 8 hours
            post_login_redirect: "/dashboard".to_string(),
            error_redirect: "/".to_string(),
            post_logout_redirect_uri: None,
            allow_http: false,
            cookie_secure: true,
        }
    }
}

impl std::fmt::Debug for RelyingPartyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelyingPartyConfig")
            .field("server_url", &self.server_url)
            .field("realm", &self.realm)
            .field("issuer", &self.issuer)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| ".."))
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("discovery_url", &self.discovery_url)
            .field("discover", &self.discover)
            .field("endpoints", &self.endpoints)
            .field("pkce_enabled", &self.pkce_enabled)
            .field("userinfo_policy", &self.userinfo_policy)
            .field("allow_http", &self.allow_http)
            .finish_non_exhaustive()
    }
}

/// Explicit endpoint URLs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointOverrides {
    /// Authorization endpoint.
    pub authorization: Option<String>,
    /// Token endpoint.
    pub token: Option<String>,
    /// UserInfo endpoint.
    pub userinfo: Option<String>,
    /// End-session (logout) endpoint.
    pub logout: Option<String>,
    /// JWKS endpoint.
    pub jwks: Option<String>,
}

/// Userinfo failure policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserInfoPolicy {
    /// A failed or mismatched userinfo response fails the attempt.
    #[default]
    Strict,
    /// Proceed with ID token claims only and log a warning.
    Lenient,
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The discovery document could not be fetched or used.
    #[error("Provider discovery failed: {0}")]
    Discovery(String),
}

impl ConfigError {
    /// Creates an `InvalidValue` error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidValue(message.into())
    }

    /// Creates a `Missing` error.
    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing(field.into())
    }
}

impl RelyingPartyConfig {
    /// Creates a configuration with the three required settings.
    #[must_use]
    pub fn new(
        server_url: impl Into<String>,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            ..Self::default()
        }
    }

    /// Sets the realm.
    #[must_use]
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// Sets an explicit issuer.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Sets the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Replaces the requested scopes.
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the discovery document URL.
    #[must_use]
    pub fn with_discovery_url(mut self, url: impl Into<String>) -> Self {
        self.discovery_url = Some(url.into());
        self
    }

    /// Enables discovery at the issuer's well-known location.
    #[must_use]
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discover = enabled;
        self
    }

    /// Sets explicit endpoint overrides.
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: EndpointOverrides) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Enables or disables PKCE.
    #[must_use]
    pub fn with_pkce(mut self, enabled: bool) -> Self {
        self.pkce_enabled = enabled;
        self
    }

    /// Sets the userinfo policy.
    #[must_use]
    pub fn with_userinfo_policy(mut self, policy: UserInfoPolicy) -> Self {
        self.userinfo_policy = policy;
        self
    }

    /// Sets the clock skew tolerance in seconds.
    #[must_use]
    pub fn with_clock_skew(mut self, seconds: u64) -> Self {
        self.clock_skew_tolerance_seconds = seconds;
        self
    }

    /// Sets the pending-attempt lifetime in seconds.
    #[must_use]
    pub fn with_state_ttl(mut self, seconds: u64) -> Self {
        self.state_ttl_seconds = seconds;
        self
    }

    /// Sets the post-logout redirect URI.
    #[must_use]
    pub fn with_post_logout_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.post_logout_redirect_uri = Some(uri.into());
        self
    }

    /// Allows `http://` URLs. Development and tests only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Pending-attempt lifetime.
    #[must_use]
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_seconds)
    }

    /// Clock skew tolerance.
    #[must_use]
    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_tolerance_seconds)
    }

    /// Returns the issuer derived from the settings, if one can be derived
    /// without discovery.
    #[must_use]
    pub fn derived_issuer(&self) -> Option<String> {
        if let Some(issuer) = self.issuer.as_deref().filter(|s| !s.is_empty()) {
            return Some(issuer.trim_end_matches('/').to_string());
        }
        let base = self.server_url.trim_end_matches('/');
        if base.is_empty() {
            return None;
        }
        match self.realm.as_deref().filter(|r| !r.is_empty()) {
            Some(realm) => Some(format!("{base}/realms/{realm}")),
            None => Some(base.to_string()),
        }
    }

    /// Returns the post-logout redirect URI, falling back to the origin of
    /// the redirect URI.
    #[must_use]
    pub fn effective_post_logout_redirect_uri(&self) -> String {
        if let Some(uri) = self.post_logout_redirect_uri.as_deref().filter(|s| !s.is_empty()) {
            return uri.to_string();
        }
        match Url::parse(&self.redirect_uri) {
            Ok(url) => format!("{}/", url.origin().ascii_serialization()),
            Err(_) => "/".to_string(),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` for absent required settings and
    /// `ConfigError::InvalidValue` for malformed or inconsistent ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::missing("client_id"));
        }

        if self.redirect_uri.trim().is_empty() {
            return Err(ConfigError::missing("redirect_uri"));
        }
        let redirect = Url::parse(&self.redirect_uri).map_err(|e| {
            ConfigError::invalid(format!("redirect_uri '{}': {e}", self.redirect_uri))
        })?;
        if redirect.fragment().is_some() {
            return Err(ConfigError::invalid("redirect_uri must not contain a fragment"));
        }

        if self.derived_issuer().is_none() && self.discovery_url.is_none() {
            return Err(ConfigError::missing(
                "server_url, issuer or discovery_url",
            ));
        }

        if self.client_secret.as_deref().is_none_or(str::is_empty) && !self.pkce_enabled {
            return Err(ConfigError::invalid(
                "public clients (no client_secret) require pkce_enabled = true",
            ));
        }

        if self.state_ttl_seconds == 0 {
            return Err(ConfigError::invalid("state_ttl_seconds must be > 0"));
        }

        if self.http_timeout.is_zero() {
            return Err(ConfigError::invalid("http_timeout must be > 0"));
        }

        if self.post_login_redirect.is_empty() || self.error_redirect.is_empty() {
            return Err(ConfigError::invalid(
                "post_login_redirect and error_redirect cannot be empty",
            ));
        }

        let provider_urls = [
            ("server_url", Some(self.server_url.as_str()).filter(|s| !s.is_empty())),
            ("issuer", self.issuer.as_deref()),
            ("discovery_url", self.discovery_url.as_deref()),
            ("endpoints.authorization", self.endpoints.authorization.as_deref()),
            ("endpoints.token", self.endpoints.token.as_deref()),
            ("endpoints.userinfo", self.endpoints.userinfo.as_deref()),
            ("endpoints.logout", self.endpoints.logout.as_deref()),
            ("endpoints.jwks", self.endpoints.jwks.as_deref()),
        ];
        for (name, value) in provider_urls {
            if let Some(value) = value {
                validate_provider_url(name, value, self.allow_http)?;
            }
        }

        Ok(())
    }
}

/// Parses a provider URL and enforces HTTPS unless `allow_http` is set.
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` if the URL is malformed or uses a
/// disallowed scheme.
pub fn validate_provider_url(name: &str, value: &str, allow_http: bool) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::invalid(format!("{name} '{value}': {e}")))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if allow_http => Ok(url),
        "http" => Err(ConfigError::invalid(format!(
            "{name} must use HTTPS (set allow_http for development)"
        ))),
        other => Err(ConfigError::invalid(format!(
            "{name} has unsupported scheme '{other}'"
        ))),
    }
}
