//! OpenID Connect Discovery.
//!
//! Fetches provider metadata from a `.well-known/openid-configuration`
//! document. Discovery runs once while the provider configuration is
//! resolved; the result is folded into the immutable
//! [`ProviderConfig`](crate::provider::ProviderConfig) and never refetched.
//!
//! # Security Considerations
//!
//! - Only HTTPS URLs are fetched unless `allow_http` is set
//! - The document's `issuer` must match the expected issuer when one is known
//! - Response size is capped
//! - One bounded retry on transient failures, then the error is final

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Maximum accepted discovery document size in bytes.
const MAX_DOCUMENT_SIZE: usize = 1024 * 1024;

/// Pause before the single retry.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Provider metadata used by the relying party.
///
/// Only the fields the authorization code flow needs are modelled; anything
/// else in the document is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer identifier asserted by the provider.
    pub issuer: String,

    /// Authorization endpoint.
    pub authorization_endpoint: String,

    /// Token endpoint.
    pub token_endpoint: String,

    /// JWKS endpoint.
    pub jwks_uri: String,

    /// UserInfo endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    /// RP-initiated logout endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,

    /// Supported ID token signing algorithms.
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,

    /// Supported PKCE methods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,
}

impl DiscoveryDocument {
    /// Returns `true` if the provider advertises S256 PKCE, or advertises
    /// nothing at all.
    #[must_use]
    pub fn supports_pkce_s256(&self) -> bool {
        self.code_challenge_methods_supported
            .as_ref()
            .is_none_or(|methods| methods.iter().any(|m| m == "S256"))
    }
}

/// Errors that can occur during discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A network error occurred while fetching the document.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The provider answered with a non-success status.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The document could not be parsed.
    #[error("Failed to parse discovery document: {0}")]
    ParseError(String),

    /// The document's issuer does not match the expected issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Expected issuer.
        expected: String,
        /// Issuer found in the document.
        actual: String,
    },

    /// The URL scheme is not allowed.
    #[error("Invalid URL scheme: {0} (only HTTPS is allowed)")]
    InvalidScheme(String),

    /// The response exceeded the size cap.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The cap.
        max_size: usize,
    },
}

impl DiscoveryError {
    /// Returns `true` for failures worth one more attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) => true,
            Self::HttpError(status) => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Builds `{issuer}/.well-known/openid-configuration`.
#[must_use]
pub fn build_discovery_url(issuer: &Url) -> Url {
    let mut discovery_url = issuer.clone();
    let path = issuer.path().trim_end_matches('/');
    discovery_url.set_path(&format!("{path}/.well-known/openid-configuration"));
    discovery_url
}

/// Compares issuers ignoring a trailing slash.
#[must_use]
pub fn issuers_match(expected: &str, actual: &str) -> bool {
    expected.trim_end_matches('/') == actual.trim_end_matches('/')
}

/// Client for fetching discovery documents.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http_client: reqwest::Client,
    allow_http: bool,
}

impl DiscoveryClient {
    /// Creates a discovery client over a shared HTTP client.
    #[must_use]
    pub fn new(http_client: reqwest::Client, allow_http: bool) -> Self {
        Self {
            http_client,
            allow_http,
        }
    }

    /// Fetches and checks a discovery document, retrying once on a
    /// transient failure.
    ///
    /// # Errors
    ///
    /// Returns the last `DiscoveryError` if both attempts fail, or the first
    /// one if it is not transient.
    pub async fn discover(
        &self,
        discovery_url: &Url,
        expected_issuer: Option<&str>,
    ) -> Result<DiscoveryDocument, DiscoveryError> {
        match self.fetch(discovery_url, expected_issuer).await {
            Ok(document) => Ok(document),
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    url = %discovery_url,
                    error = %e,
                    "OIDC discovery failed, retrying once"
                );
                tokio::time::sleep(RETRY_DELAY).await;
                self.fetch(discovery_url, expected_issuer).await
            }
            Err(e) => Err(e),
        }
    }

    /// Performs a single fetch.
    async fn fetch(
        &self,
        discovery_url: &Url,
        expected_issuer: Option<&str>,
    ) -> Result<DiscoveryDocument, DiscoveryError> {
        self.validate_scheme(discovery_url)?;

        let response = self
            .http_client
            .get(discovery_url.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| DiscoveryError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DiscoveryError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > MAX_DOCUMENT_SIZE
        {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: MAX_DOCUMENT_SIZE,
            });
        }

        let document: DiscoveryDocument = response
            .json()
            .await
            .map_err(|e| DiscoveryError::ParseError(e.to_string()))?;

        if let Some(expected) = expected_issuer
            && !issuers_match(expected, &document.issuer)
        {
            return Err(DiscoveryError::IssuerMismatch {
                expected: expected.trim_end_matches('/').to_string(),
                actual: document.issuer.trim_end_matches('/').to_string(),
            });
        }

        tracing::debug!(issuer = %document.issuer, "Discovered OIDC configuration");
        Ok(document)
    }

    fn validate_scheme(&self, url: &Url) -> Result<(), DiscoveryError> {
        match url.scheme() {
            "https" => Ok(()),
            "http" if self.allow_http => Ok(()),
            other => Err(DiscoveryError::InvalidScheme(other.to_string())),
        }
    }
}
