//! Authorization code exchange.
//!
//! The exchange is a single POST to the token endpoint. Authorization codes
//! are single-use, so a failed exchange is never retried here: the attempt is
//! over and the user has to start a fresh login.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::FlowError;
use crate::pkce::PkceVerifier;
use crate::provider::ProviderConfig;
use crate::token::TokenResponse;

/// Longest slice of an unparseable error body kept for the log.
const MAX_ERROR_BODY: usize = 200;

/// OAuth error body from the token endpoint.
#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Exchanges authorization codes at the provider's token endpoint.
#[derive(Clone)]
pub struct TokenExchanger {
    http_client: reqwest::Client,
    provider: Arc<ProviderConfig>,
}

impl TokenExchanger {
    /// Creates an exchanger.
    #[must_use]
    pub fn new(http_client: reqwest::Client, provider: Arc<ProviderConfig>) -> Self {
        Self {
            http_client,
            provider,
        }
    }

    /// Exchanges `code` for tokens.
    ///
    /// Sends `redirect_uri` exactly as configured, the client secret for
    /// confidential clients, and the PKCE verifier when one was issued.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::TokenExchange` on transport failure, a non-success
    /// status (with OAuth error details when the body carries them), an
    /// unparseable body, or a response without an ID token.
    pub async fn exchange(
        &self,
        code: &str,
        pkce_verifier: Option<&PkceVerifier>,
    ) -> Result<TokenResponse, FlowError> {
        let provider = &self.provider;

        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", provider.redirect_uri.as_str()),
            ("client_id", provider.client_id.as_str()),
        ];
        if let Some(secret) = provider.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }
        if let Some(verifier) = pkce_verifier {
            params.push(("code_verifier", verifier.as_str()));
        }

        tracing::debug!(
            endpoint = %provider.endpoints.token,
            pkce = pkce_verifier.is_some(),
            confidential = provider.client_secret.is_some(),
            "Exchanging authorization code"
        );

        let response = self
            .http_client
            .post(provider.endpoints.token.as_str())
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "timeout" } else { "transport" };
                FlowError::token_exchange(format!("{kind} error: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(oauth_error) = serde_json::from_str::<OAuthErrorResponse>(&body) {
                return Err(FlowError::token_exchange(format!(
                    "HTTP {} - {}{}",
                    status.as_u16(),
                    oauth_error.error,
                    oauth_error
                        .error_description
                        .map(|d| format!(" ({d})"))
                        .unwrap_or_default()
                )));
            }
            let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(FlowError::token_exchange(format!(
                "HTTP {} - {snippet}",
                status.as_u16()
            )));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| FlowError::token_exchange(format!("invalid token response: {e}")))?;

        if tokens.id_token.as_deref().is_none_or(str::is_empty) {
            return Err(FlowError::token_exchange(
                "token response carries no id_token",
            ));
        }

        if let Some(token_type) = tokens.token_type.as_deref()
            && !token_type.eq_ignore_ascii_case("bearer")
        {
            return Err(FlowError::token_exchange(format!(
                "unsupported token_type '{token_type}'"
            )));
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderEndpoints, ScopeSet};
    use url::Url;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, secret: Option<&str>) -> Arc<ProviderConfig> {
        let base = server.uri();
        Arc::new(ProviderConfig {
            issuer: base.clone(),
            client_id: "web-portal".to_string(),
            client_secret: secret.map(str::to_string),
            redirect_uri: "http://localhost:3000/auth/callback".to_string(),
            scopes: ["openid"].into_iter().collect::<ScopeSet>(),
            endpoints: ProviderEndpoints {
                authorization: Url::parse(&format!("{base}/auth")).unwrap(),
                token: Url::parse(&format!("{base}/token")).unwrap(),
                userinfo: None,
                logout: None,
                jwks: Url::parse(&format!("{base}/certs")).unwrap(),
            },
            pkce_enabled: true,
            signing_algorithms: Vec::new(),
        })
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "access_token": "at",
            "token_type": "Bearer",
            "expires_in": 300,
            "id_token": "header.payload.signature"
        })
    }

    #[tokio::test]
    async fn test_exchange_sends_expected_form() {
        let server = MockServer::start().await;
        let verifier = PkceVerifier::generate();
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains(
                "redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fauth%2Fcallback",
            ))
            .and(body_string_contains("client_id=web-portal"))
            .and(body_string_contains("client_secret=s3cret"))
            .and(body_string_contains(format!("code_verifier={}", verifier.as_str())))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;

        let exchanger = TokenExchanger::new(reqwest::Client::new(), provider(&server, Some("s3cret")));
        let tokens = exchanger.exchange("the-code", Some(&verifier)).await.unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.expires_in, Some(300));
    }

    #[tokio::test]
    async fn test_oauth_error_is_parsed_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Code not valid"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let exchanger = TokenExchanger::new(reqwest::Client::new(), provider(&server, None));
        let err = exchanger.exchange("used-code", None).await.unwrap_err();
        match err {
            FlowError::TokenExchange(detail) => {
                assert!(detail.contains("invalid_grant"));
                assert!(detail.contains("Code not valid"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(1)
            .mount(&server)
            .await;

        let exchanger = TokenExchanger::new(reqwest::Client::new(), provider(&server, None));
        let err = exchanger.exchange("code", None).await.unwrap_err();
        assert!(matches!(err, FlowError::TokenExchange(ref d) if d.contains("502")));
    }

    #[tokio::test]
    async fn test_missing_id_token_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let exchanger = TokenExchanger::new(reqwest::Client::new(), provider(&server, None));
        let err = exchanger.exchange("code", None).await.unwrap_err();
        assert!(matches!(err, FlowError::TokenExchange(ref d) if d.contains("id_token")));
    }

    #[tokio::test]
    async fn test_timeout_is_token_exchange_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(ok_body())
                    .set_delay(std::time::Duration::from_millis(500)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(50))
            .build()
            .unwrap();
        let exchanger = TokenExchanger::new(client, provider(&server, None));
        let err = exchanger.exchange("code", None).await.unwrap_err();
        assert!(matches!(err, FlowError::TokenExchange(ref d) if d.starts_with("timeout")));
    }
}
