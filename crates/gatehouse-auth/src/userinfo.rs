//! UserInfo enrichment.
//!
//! After the ID token is validated, the userinfo endpoint may be queried with
//! the access token for additional claims. The response's `sub` must equal
//! the ID token's `sub`. What happens when it does not (or when the call
//! fails) is governed by [`UserInfoPolicy`]:
//!
//! - `Strict`: the attempt fails
//! - `Lenient`: a warning is logged and the flow continues with ID token
//!   claims only

use serde_json::{Map, Value};
use url::Url;

use crate::config::UserInfoPolicy;
use crate::error::FlowError;
use crate::token::TokenSet;

/// Claims returned by the userinfo endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    claims: Map<String, Value>,
}

impl UserInfo {
    /// Wraps a claim set.
    #[must_use]
    pub fn new(claims: Map<String, Value>) -> Self {
        Self { claims }
    }

    /// The `sub` claim, if it is a string.
    #[must_use]
    pub fn sub(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }

    /// All claims.
    #[must_use]
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// Consumes the wrapper.
    #[must_use]
    pub fn into_claims(self) -> Map<String, Value> {
        self.claims
    }
}

/// Queries the userinfo endpoint.
#[derive(Clone)]
pub struct UserInfoFetcher {
    http_client: reqwest::Client,
    endpoint: Option<Url>,
    policy: UserInfoPolicy,
}

impl UserInfoFetcher {
    /// Creates a fetcher. With no endpoint, enrichment is skipped.
    #[must_use]
    pub fn new(http_client: reqwest::Client, endpoint: Option<Url>, policy: UserInfoPolicy) -> Self {
        Self {
            http_client,
            endpoint,
            policy,
        }
    }

    /// Fetches userinfo and applies the policy.
    ///
    /// Returns `Ok(None)` when there is no endpoint, or when the lenient
    /// policy swallowed a failure.
    ///
    /// # Errors
    ///
    /// Under the strict policy, returns `FlowError::UserInfoMismatch` or
    /// `FlowError::UserInfoUnavailable`.
    pub async fn fetch(&self, tokens: &TokenSet) -> Result<Option<UserInfo>, FlowError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(None);
        };

        match self.fetch_checked(endpoint, tokens).await {
            Ok(info) => Ok(Some(info)),
            Err(e) => match self.policy {
                UserInfoPolicy::Strict => Err(e),
                UserInfoPolicy::Lenient => {
                    tracing::warn!(
                        error = %e,
                        sub = %tokens.claims.sub,
                        "UserInfo enrichment failed, continuing with ID token claims"
                    );
                    Ok(None)
                }
            },
        }
    }

    async fn fetch_checked(&self, endpoint: &Url, tokens: &TokenSet) -> Result<UserInfo, FlowError> {
        let response = self
            .http_client
            .get(endpoint.as_str())
            .bearer_auth(&tokens.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| FlowError::UserInfoUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FlowError::UserInfoUnavailable(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FlowError::UserInfoUnavailable(format!("invalid response: {e}")))?;
        let Value::Object(claims) = body else {
            return Err(FlowError::UserInfoUnavailable(
                "response is not a JSON object".to_string(),
            ));
        };

        let info = UserInfo::new(claims);
        match info.sub() {
            Some(sub) if sub == tokens.claims.sub => Ok(info),
            other => Err(FlowError::UserInfoMismatch {
                id_token_sub: tokens.claims.sub.clone(),
                userinfo_sub: other.unwrap_or_default().to_string(),
            }),
        }
    }
}
