//! Resolved identity provider configuration.
//!
//! [`ProviderConfig`] is produced once from a [`RelyingPartyConfig`] and then
//! shared read-only (behind an `Arc`) by every other component. Endpoints come
//! from, in order of precedence:
//!
//! 1. explicit `endpoints.*` overrides
//! 2. the discovery document, when `discovery_url` is set or `discover` is
//!    enabled (`{issuer}/.well-known/openid-configuration`)
//! 3. path conventions under the issuer:
//!    `{issuer}/protocol/openid-connect/{auth,token,userinfo,logout,certs}`
//!
//! # Example
//!
//! ```ignore
//! use gatehouse_auth::provider::ProviderResolver;
//!
//! let resolver = ProviderResolver::new(config)?;
//! let provider = resolver.resolve().await?;
//! println!("token endpoint: {}", provider.endpoints.token);
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use url::Url;

use crate::config::{ConfigError, RelyingPartyConfig, validate_provider_url};
use crate::discovery::{DiscoveryClient, DiscoveryDocument, build_discovery_url};

/// Endpoint URLs of the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    /// Authorization endpoint (browser redirect target).
    pub authorization: Url,
    /// Token endpoint.
    pub token: Url,
    /// UserInfo endpoint. Enrichment is skipped when absent.
    pub userinfo: Option<Url>,
    /// Logout endpoint. Logout redirects straight to the post-logout URI
    /// when absent.
    pub logout: Option<Url>,
    /// JWKS endpoint.
    pub jwks: Url,
}

/// Ordered, deduplicated scope list that always contains `openid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSet(Vec<String>);

impl ScopeSet {
    /// Returns the scopes in request order.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Returns `true` if the scope is present.
    #[must_use]
    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s == scope)
    }

    /// Space-separated form used in the `scope` parameter.
    #[must_use]
    pub fn joined(&self) -> String {
        self.0.join(" ")
    }
}

impl<S: AsRef<str>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut scopes: Vec<String> = Vec::new();
        for scope in iter {
            let scope = scope.as_ref().trim();
            if scope.is_empty() || scopes.iter().any(|s| s == scope) {
                continue;
            }
            scopes.push(scope.to_string());
        }
        if !scopes.iter().any(|s| s == "openid") {
            scopes.insert(0, "openid".to_string());
        }
        Self(scopes)
    }
}

/// Fully resolved, immutable provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Expected `iss` of ID tokens.
    pub issuer: String,
    /// OAuth client identifier.
    pub client_id: String,
    /// Client secret; `None` for public clients.
    pub client_secret: Option<String>,
    /// Redirect URI, sent byte-identical on authorize and token requests.
    pub redirect_uri: String,
    /// Requested scopes.
    pub scopes: ScopeSet,
    /// Resolved endpoints.
    pub endpoints: ProviderEndpoints,
    /// Whether PKCE is used.
    pub pkce_enabled: bool,
    /// Signing algorithms advertised by the provider, if discovered.
    pub signing_algorithms: Vec<String>,
}

/// Builds the shared outbound HTTP client with the configured timeout.
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` if the client cannot be constructed.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| ConfigError::invalid(format!("HTTP client: {e}")))
}

/// Resolves a [`ProviderConfig`] from base settings.
///
/// Discovery, when configured, is attempted once plus one bounded retry.
///
/// # Errors
///
/// Returns `ConfigError` if settings are missing or invalid, discovery is
/// unreachable, or a resolved endpoint is not an acceptable URL.
pub async fn resolve_provider(
    config: &RelyingPartyConfig,
    http_client: &reqwest::Client,
) -> Result<ProviderConfig, ConfigError> {
    config.validate()?;

    let expected_issuer = config.derived_issuer();

    let discovery_url = match (config.discovery_url.as_deref(), expected_issuer.as_deref()) {
        (Some(discovery_url), _) => Some(validate_provider_url(
            "discovery_url",
            discovery_url,
            config.allow_http,
        )?),
        (None, Some(issuer)) if config.discover => Some(build_discovery_url(
            &validate_provider_url("issuer", issuer, config.allow_http)?,
        )),
        (None, _) => None,
    };

    let (issuer, discovered) = match discovery_url {
        Some(url) => {
            let client = DiscoveryClient::new(http_client.clone(), config.allow_http);
            let document = client
                .discover(&url, expected_issuer.as_deref())
                .await
                .map_err(|e| ConfigError::Discovery(e.to_string()))?;
            let issuer = expected_issuer.unwrap_or_else(|| document.issuer.clone());
            (issuer, Some(document))
        }
        None => {
            let issuer = expected_issuer
                .ok_or_else(|| ConfigError::missing("server_url or issuer"))?;
            (issuer, None)
        }
    };

    let endpoints = resolve_endpoints(config, &issuer, discovered.as_ref())?;
    let discovered_any = discovered.is_some();

    if let Some(document) = &discovered
        && config.pkce_enabled
        && !document.supports_pkce_s256()
    {
        tracing::warn!(
            issuer = %issuer,
            "Provider does not advertise S256 PKCE; sending a challenge anyway"
        );
    }

    let provider = ProviderConfig {
        issuer,
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone().filter(|s| !s.is_empty()),
        redirect_uri: config.redirect_uri.clone(),
        scopes: config.scopes.iter().collect(),
        endpoints,
        pkce_enabled: config.pkce_enabled,
        signing_algorithms: discovered
            .map(|d| d.id_token_signing_alg_values_supported)
            .unwrap_or_default(),
    };

    tracing::info!(
        issuer = %provider.issuer,
        client_id = %provider.client_id,
        discovered = discovered_any,
        pkce = provider.pkce_enabled,
        userinfo = provider.endpoints.userinfo.is_some(),
        "Resolved OIDC provider configuration"
    );

    Ok(provider)
}

fn resolve_endpoints(
    config: &RelyingPartyConfig,
    issuer: &str,
    discovered: Option<&DiscoveryDocument>,
) -> Result<ProviderEndpoints, ConfigError> {
    let overrides = &config.endpoints;
    let conventional = |suffix: &str| format!("{issuer}/protocol/openid-connect/{suffix}");

    let pick = |override_value: &Option<String>,
                discovered_value: Option<&str>,
                suffix: &str|
     -> String {
        override_value
            .clone()
            .or_else(|| discovered_value.map(str::to_string))
            .unwrap_or_else(|| conventional(suffix))
    };

    let authorization = pick(
        &overrides.authorization,
        discovered.map(|d| d.authorization_endpoint.as_str()),
        "auth",
    );
    let token = pick(
        &overrides.token,
        discovered.map(|d| d.token_endpoint.as_str()),
        "token",
    );
    let jwks = pick(
        &overrides.jwks,
        discovered.map(|d| d.jwks_uri.as_str()),
        "certs",
    );

    // With a discovery document, optional endpoints exist only if advertised.
    let optional = |override_value: &Option<String>,
                    discovered_value: Option<&Option<String>>,
                    suffix: &str|
     -> Option<String> {
        match (override_value, discovered_value) {
            (Some(value), _) => Some(value.clone()),
            (None, Some(value)) => value.clone(),
            (None, None) => Some(conventional(suffix)),
        }
    };

    let userinfo = optional(
        &overrides.userinfo,
        discovered.map(|d| &d.userinfo_endpoint),
        "userinfo",
    );
    let logout = optional(
        &overrides.logout,
        discovered.map(|d| &d.end_session_endpoint),
        "logout",
    );

    let allow_http = config.allow_http;
    Ok(ProviderEndpoints {
        authorization: validate_provider_url("authorization endpoint", &authorization, allow_http)?,
        token: validate_provider_url("token endpoint", &token, allow_http)?,
        userinfo: userinfo
            .map(|u| validate_provider_url("userinfo endpoint", &u, allow_http))
            .transpose()?,
        logout: logout
            .map(|u| validate_provider_url("logout endpoint", &u, allow_http))
            .transpose()?,
        jwks: validate_provider_url("jwks endpoint", &jwks, allow_http)?,
    })
}

/// Resolves the provider configuration once and hands out the shared result.
pub struct ProviderResolver {
    config: RelyingPartyConfig,
    http_client: reqwest::Client,
    resolved: OnceCell<Arc<ProviderConfig>>,
}

impl ProviderResolver {
    /// Creates a resolver with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the HTTP client cannot be built.
    pub fn new(config: RelyingPartyConfig) -> Result<Self, ConfigError> {
        let http_client = build_http_client(config.http_timeout)?;
        Ok(Self::with_http_client(config, http_client))
    }

    /// Creates a resolver over an existing HTTP client.
    #[must_use]
    pub fn with_http_client(config: RelyingPartyConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
            resolved: OnceCell::new(),
        }
    }

    /// Returns the resolved configuration, resolving it on first use.
    ///
    /// A failed resolution is not cached; the next call tries again.
    ///
    /// # Errors
    ///
    /// See [`resolve_provider`].
    pub async fn resolve(&self) -> Result<Arc<ProviderConfig>, ConfigError> {
        self.resolved
            .get_or_try_init(|| async {
                resolve_provider(&self.config, &self.http_client)
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned()
    }

    /// The base settings.
    #[must_use]
    pub fn config(&self) -> &RelyingPartyConfig {
        &self.config
    }

    /// The shared HTTP client.
    #[must_use]
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointOverrides;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn keycloak_config() -> RelyingPartyConfig {
        RelyingPartyConfig::new(
            "https://sso.example.com",
            "web-portal",
            "https://portal.example.com/auth/callback",
        )
        .with_realm("acme")
        .with_client_secret("secret")
    }

    #[test]
    fn test_scope_set_normalization() {
        let scopes: ScopeSet = ["profile", " email ", "profile", "", "openid"]
            .into_iter()
            .collect();
        assert_eq!(scopes.as_slice(), ["openid", "profile", "email"]);

        let scopes: ScopeSet = ["email", "openid", "profile"].into_iter().collect();
        assert_eq!(scopes.joined(), "email openid profile");
        assert!(scopes.contains("openid"));
    }

    #[tokio::test]
    async fn test_resolve_by_convention() {
        let provider = resolve_provider(&keycloak_config(), &reqwest::Client::new())
            .await
            .unwrap();

        assert_eq!(provider.issuer, "https://sso.example.com/realms/acme");
        assert_eq!(
            provider.endpoints.authorization.as_str(),
            "https://sso.example.com/realms/acme/protocol/openid-connect/auth"
        );
        assert_eq!(
            provider.endpoints.token.as_str(),
            "https://sso.example.com/realms/acme/protocol/openid-connect/token"
        );
        assert_eq!(
            provider.endpoints.jwks.as_str(),
            "https://sso.example.com/realms/acme/protocol/openid-connect/certs"
        );
        assert!(provider.endpoints.userinfo.is_some());
        assert!(provider.endpoints.logout.is_some());
        assert_eq!(provider.scopes.joined(), "openid profile email");
    }

    #[tokio::test]
    async fn test_overrides_take_precedence() {
        let config = keycloak_config().with_endpoints(EndpointOverrides {
            token: Some("https://tokens.example.com/token".to_string()),
            ..EndpointOverrides::default()
        });
        let provider = resolve_provider(&config, &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(
            provider.endpoints.token.as_str(),
            "https://tokens.example.com/token"
        );
    }

    #[tokio::test]
    async fn test_missing_client_id_is_config_error() {
        let mut config = keycloak_config();
        config.client_id = String::new();
        let err = resolve_provider(&config, &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[tokio::test]
    async fn test_resolve_via_discovery() {
        let server = MockServer::start().await;
        let issuer = server.uri();
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{issuer}/authorize"),
                "token_endpoint": format!("{issuer}/token"),
                "jwks_uri": format!("{issuer}/jwks"),
                "id_token_signing_alg_values_supported": ["RS256"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = RelyingPartyConfig::new(&issuer, "web", "http://localhost:3000/auth/callback")
            .with_discovery_url(format!("{issuer}/.well-known/openid-configuration"))
            .with_allow_http(true);
        let resolver = ProviderResolver::with_http_client(config, reqwest::Client::new());

        let first = resolver.resolve().await.unwrap();
        let second = resolver.resolve().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!(first.endpoints.token.as_str(), format!("{issuer}/token"));
        // Not advertised, so absent rather than guessed.
        assert!(first.endpoints.userinfo.is_none());
        assert!(first.endpoints.logout.is_none());
        assert_eq!(first.signing_algorithms, vec!["RS256"]);
    }

    #[tokio::test]
    async fn test_discovery_at_issuer_well_known() {
        let server = MockServer::start().await;
        let issuer = format!("{}/realms/acme", server.uri());
        Mock::given(method("GET"))
            .and(path("/realms/acme/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{issuer}/authorize"),
                "token_endpoint": format!("{issuer}/token"),
                "jwks_uri": format!("{issuer}/jwks"),
                "userinfo_endpoint": format!("{issuer}/userinfo")
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = RelyingPartyConfig::new(server.uri(), "web", "http://localhost:3000/cb")
            .with_realm("acme")
            .with_client_secret("secret")
            .with_discovery(true)
            .with_allow_http(true);
        let provider = resolve_provider(&config, &reqwest::Client::new())
            .await
            .unwrap();

        assert_eq!(provider.issuer, issuer);
        assert_eq!(provider.endpoints.token.as_str(), format!("{issuer}/token"));
        assert_eq!(
            provider.endpoints.userinfo.as_ref().map(Url::as_str),
            Some(format!("{issuer}/userinfo").as_str())
        );
    }

    #[tokio::test]
    async fn test_unreachable_discovery_is_config_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let config = RelyingPartyConfig::new(server.uri(), "web", "http://localhost:3000/cb")
            .with_discovery_url(format!("{}/.well-known/openid-configuration", server.uri()))
            .with_allow_http(true);
        let err = resolve_provider(&config, &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Discovery(_)));
    }
}
