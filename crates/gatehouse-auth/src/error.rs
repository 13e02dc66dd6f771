//! Error types for the relying-party authentication flow.
//!
//! Every failure that can terminate a login attempt is a [`FlowError`]. The
//! HTTP layer never shows the `Display` text of these errors to the browser;
//! it redirects with [`FlowError::user_code`] and logs the full error.

use std::fmt;

use crate::config::ConfigError;
use crate::session::SessionStoreError;

/// Errors that terminate an authentication attempt.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Provider settings could not be resolved.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The callback `state` is unknown, already consumed, expired, or bound
    /// to a different browser.
    #[error("Invalid or expired authorization state")]
    InvalidState,

    /// The identity provider returned an error instead of a code.
    #[error("Authorization denied by identity provider: {error}")]
    Authorization {
        /// OAuth error code (e.g. `access_denied`).
        error: String,
        /// Optional provider-supplied description.
        description: Option<String>,
    },

    /// The code could not be exchanged at the token endpoint.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// The returned ID token failed verification.
    #[error("ID token validation failed: {0}")]
    TokenValidation(#[from] ValidationFailure),

    /// The userinfo `sub` differs from the ID token `sub`.
    #[error("UserInfo subject mismatch: ID token sub {id_token_sub}, userinfo sub {userinfo_sub}")]
    UserInfoMismatch {
        /// Subject asserted by the ID token.
        id_token_sub: String,
        /// Subject returned by the userinfo endpoint.
        userinfo_sub: String,
    },

    /// The userinfo endpoint could not be queried or returned garbage.
    #[error("UserInfo request failed: {0}")]
    UserInfoUnavailable(String),

    /// The session store failed to create, read or destroy a session.
    #[error("Session store error: {0}")]
    SessionStore(#[from] SessionStoreError),
}

/// Specific reason an ID token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    /// Signature did not verify against the provider's keys.
    #[error("bad signature")]
    BadSignature,

    /// `exp` is in the past beyond the clock-skew tolerance.
    #[error("token expired")]
    Expired,

    /// `nbf`/`iat` lies in the future beyond the clock-skew tolerance.
    #[error("token not yet valid")]
    NotYetValid,

    /// `nonce` is missing or differs from the attempt's nonce.
    #[error("nonce mismatch")]
    NonceMismatch,

    /// `aud` does not contain our client id, or `azp` names another party.
    #[error("audience mismatch")]
    AudienceMismatch,

    /// `iss` differs from the configured issuer.
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer.
        expected: String,
        /// Issuer asserted by the token.
        actual: String,
    },

    /// The JWS algorithm is not on the asymmetric allow-list.
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// No usable verification key could be obtained.
    #[error("signing key unavailable: {0}")]
    KeyUnavailable(String),

    /// The token could not be parsed.
    #[error("malformed token: {0}")]
    Malformed(String),
}

impl ValidationFailure {
    /// Short tag used as a structured logging field.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::BadSignature => "bad_signature",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::NonceMismatch => "nonce_mismatch",
            Self::AudienceMismatch => "audience_mismatch",
            Self::IssuerMismatch { .. } => "issuer_mismatch",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::KeyUnavailable(_) => "key_unavailable",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// OAuth error codes a provider may legitimately send back on the callback.
const KNOWN_AUTHORIZATION_ERRORS: &[&str] = &[
    "access_denied",
    "invalid_request",
    "unauthorized_client",
    "unsupported_response_type",
    "invalid_scope",
    "server_error",
    "temporarily_unavailable",
    "interaction_required",
    "login_required",
    "consent_required",
];

impl FlowError {
    /// Creates an `Authorization` error from callback parameters.
    #[must_use]
    pub fn authorization(error: impl Into<String>, description: Option<String>) -> Self {
        Self::Authorization {
            error: error.into(),
            description,
        }
    }

    /// Creates a `TokenExchange` error.
    #[must_use]
    pub fn token_exchange(message: impl Into<String>) -> Self {
        Self::TokenExchange(message.into())
    }

    /// Returns the error category for logging.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::InvalidState => ErrorCategory::State,
            Self::Authorization { .. } => ErrorCategory::IdentityProvider,
            Self::TokenExchange(_) => ErrorCategory::IdentityProvider,
            Self::TokenValidation(_) => ErrorCategory::Token,
            Self::UserInfoMismatch { .. } | Self::UserInfoUnavailable(_) => ErrorCategory::UserInfo,
            Self::SessionStore(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Returns `true` for errors that may indicate an attack and deserve
    /// elevated log severity.
    #[must_use]
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::InvalidState | Self::TokenValidation(_) | Self::UserInfoMismatch { .. }
        )
    }

    /// Stable, generic code placed on the error redirect.
    ///
    /// Never carries internal detail; provider error codes are passed through
    /// only when they are standard OAuth codes.
    #[must_use]
    pub fn user_code(&self) -> &'static str {
        match self {
            Self::InvalidState => "invalid_state",
            Self::Authorization { error, .. } => KNOWN_AUTHORIZATION_ERRORS
                .iter()
                .find(|known| **known == error.as_str())
                .copied()
                .unwrap_or("authorization_failed"),
            Self::Config(_) | Self::SessionStore(_) => "server_error",
            Self::TokenExchange(_)
            | Self::TokenValidation(_)
            | Self::UserInfoMismatch { .. }
            | Self::UserInfoUnavailable(_) => "authentication_failed",
        }
    }
}

/// Categories of flow errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Provider settings problems.
    Configuration,
    /// CSRF / replay protection.
    State,
    /// Errors reported by, or talking to, the identity provider.
    IdentityProvider,
    /// ID token verification.
    Token,
    /// Userinfo enrichment.
    UserInfo,
    /// Session store and other infrastructure.
    Infrastructure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::State => write!(f, "state"),
            Self::IdentityProvider => write!(f, "identity_provider"),
            Self::Token => write!(f, "token"),
            Self::UserInfo => write!(f, "userinfo"),
            Self::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlowError::authorization("access_denied", Some("User cancelled".to_string()));
        assert_eq!(
            err.to_string(),
            "Authorization denied by identity provider: access_denied"
        );

        let err = FlowError::TokenValidation(ValidationFailure::NonceMismatch);
        assert_eq!(err.to_string(), "ID token validation failed: nonce mismatch");

        let err = FlowError::TokenValidation(ValidationFailure::IssuerMismatch {
            expected: "https://a.example.com".to_string(),
            actual: "https://b.example.com".to_string(),
        });
        assert!(err.to_string().contains("https://a.example.com"));
        assert!(err.to_string().contains("https://b.example.com"));
    }

    #[test]
    fn test_user_codes_are_generic() {
        assert_eq!(FlowError::InvalidState.user_code(), "invalid_state");
        assert_eq!(
            FlowError::token_exchange("HTTP 400 - invalid_grant").user_code(),
            "authentication_failed"
        );
        assert_eq!(
            FlowError::TokenValidation(ValidationFailure::BadSignature).user_code(),
            "authentication_failed"
        );
        assert_eq!(
            FlowError::SessionStore(SessionStoreError::Unavailable("down".to_string()))
                .user_code(),
            "server_error"
        );
    }

    #[test]
    fn test_authorization_user_code_passthrough() {
        assert_eq!(
            FlowError::authorization("access_denied", None).user_code(),
            "access_denied"
        );
        assert_eq!(
            FlowError::authorization("login_required", None).user_code(),
            "login_required"
        );
        // Arbitrary provider text never reaches the redirect.
        assert_eq!(
            FlowError::authorization("<script>", None).user_code(),
            "authorization_failed"
        );
    }

    #[test]
    fn test_security_relevance() {
        assert!(FlowError::InvalidState.is_security_relevant());
        assert!(FlowError::TokenValidation(ValidationFailure::Expired).is_security_relevant());
        assert!(!FlowError::authorization("access_denied", None).is_security_relevant());
        assert!(!FlowError::token_exchange("timeout").is_security_relevant());
    }

    #[test]
    fn test_categories() {
        assert_eq!(FlowError::InvalidState.category(), ErrorCategory::State);
        assert_eq!(
            FlowError::UserInfoUnavailable("x".to_string()).category(),
            ErrorCategory::UserInfo
        );
        assert_eq!(ErrorCategory::IdentityProvider.to_string(), "identity_provider");
    }

    #[test]
    fn test_validation_tags() {
        assert_eq!(ValidationFailure::BadSignature.tag(), "bad_signature");
        assert_eq!(ValidationFailure::Expired.tag(), "expired");
        assert_eq!(ValidationFailure::NonceMismatch.tag(), "nonce_mismatch");
        assert_eq!(ValidationFailure::AudienceMismatch.tag(), "audience_mismatch");
    }
}
