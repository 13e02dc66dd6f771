//! Token endpoint response and ID token claim types.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Claims carried in the `extra` map that describe the protocol exchange
/// rather than the user.
const PROTOCOL_CLAIMS: &[&str] = &[
    "at_hash",
    "c_hash",
    "jti",
    "sid",
    "typ",
    "session_state",
    "s_hash",
];

/// Raw token endpoint response.
#[derive(Deserialize)]
pub struct TokenResponse {
    /// The access token.
    pub access_token: String,

    /// Usually `Bearer`.
    #[serde(default)]
    pub token_type: Option<String>,

    /// Access token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,

    /// Optional refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// The ID token (JWT). Absent when `openid` was not granted.
    #[serde(default)]
    pub id_token: Option<String>,

    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// ID token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer identifier.
    pub iss: String,

    /// Subject identifier.
    pub sub: String,

    /// Audience, a string or an array on the wire.
    #[serde(deserialize_with = "deserialize_audience")]
    pub aud: Vec<String>,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    /// Issued at (Unix timestamp).
    pub iat: i64,

    /// Not before (Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// Nonce echoed from the authorization request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Authorized party.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,

    /// Time of authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,

    /// Every other claim (profile claims and provider extensions).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl IdTokenClaims {
    /// Claims describing the user: `sub` plus every non-protocol claim.
    #[must_use]
    pub fn user_claims(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut claims: serde_json::Map<String, serde_json::Value> = self
            .extra
            .iter()
            .filter(|(name, _)| !PROTOCOL_CLAIMS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        claims.insert("sub".to_string(), serde_json::Value::String(self.sub.clone()));
        if let Some(auth_time) = self.auth_time {
            claims.insert("auth_time".to_string(), auth_time.into());
        }
        claims
    }

    /// String claim from the extra claims.
    #[must_use]
    pub fn string_claim(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(serde_json::Value::as_str)
    }
}

/// Deserializes `aud`, which may be a single string or an array.
fn deserialize_audience<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => Ok(vec![s]),
        OneOrMany::Many(v) => Ok(v),
    }
}

/// Tokens from a successful exchange whose ID token has been validated.
#[derive(Clone)]
pub struct TokenSet {
    /// Access token for the userinfo endpoint.
    pub access_token: String,
    /// Token type, usually `Bearer`.
    pub token_type: String,
    /// Raw ID token, kept as the logout `id_token_hint`.
    pub id_token: String,
    /// Validated ID token claims.
    pub claims: IdTokenClaims,
    /// Optional refresh token.
    pub refresh_token: Option<String>,
    /// Access token expiry, when the provider reported one.
    pub expires_at: Option<OffsetDateTime>,
    /// Granted scopes.
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("token_type", &self.token_type)
            .field("sub", &self.claims.sub)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
