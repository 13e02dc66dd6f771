//! ID token validation.
//!
//! # Overview
//!
//! An ID token is accepted only if every check passes:
//!
//! 1. the JWS algorithm is asymmetric (and advertised by the provider, when
//!    discovery told us which ones it uses)
//! 2. the signature verifies against a key from the provider's JWKS
//! 3. `aud` contains our client id, and `azp`, when present, is our client id
//! 4. `exp` is in the future and `nbf`/`iat` are not in the future, each
//!    within the clock-skew tolerance
//! 5. `iss` equals the configured issuer
//! 6. `nonce` equals the nonce issued for this attempt
//!
//! The nonce check runs on every token that gets that far, so a correctly
//! signed token from another attempt is still rejected.
//!
//! # Security Considerations
//!
//! - Symmetric (`HS*`) and `none` algorithms are never accepted
//! - Tokens without a `kid` are tried against every signing key
//! - Failures are tagged with a [`ValidationFailure`] for logging; the tag is
//!   never shown to the browser

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use time::OffsetDateTime;

use crate::error::ValidationFailure;
use crate::jwks::JwksCache;
use crate::provider::ProviderConfig;
use crate::token::IdTokenClaims;

/// Returns `true` for the asymmetric JWS algorithms accepted on ID tokens.
#[must_use]
pub fn is_allowed_algorithm(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
            | Algorithm::ES256
            | Algorithm::ES384
            | Algorithm::EdDSA
    )
}

/// Verifies ID tokens issued by the configured provider.
pub struct IdTokenValidator {
    jwks: Arc<JwksCache>,
    provider: Arc<ProviderConfig>,
    clock_skew: Duration,
}

impl IdTokenValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(jwks: Arc<JwksCache>, provider: Arc<ProviderConfig>, clock_skew: Duration) -> Self {
        Self {
            jwks,
            provider,
            clock_skew,
        }
    }

    /// Validates `id_token` for the attempt that issued `expected_nonce`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationFailure`] encountered.
    pub async fn validate(
        &self,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<IdTokenClaims, ValidationFailure> {
        let header =
            decode_header(id_token).map_err(|e| ValidationFailure::Malformed(e.to_string()))?;

        if !is_allowed_algorithm(header.alg) {
            return Err(ValidationFailure::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let alg_name = format!("{:?}", header.alg);
        if !self.provider.signing_algorithms.is_empty()
            && !self.provider.signing_algorithms.contains(&alg_name)
        {
            return Err(ValidationFailure::UnsupportedAlgorithm(alg_name));
        }

        let keys = self
            .jwks
            .keys_for(header.kid.as_deref())
            .await
            .map_err(|e| ValidationFailure::KeyUnavailable(e.to_string()))?;

        let validation = self.validation_for(header.alg);
        let mut last_failure =
            ValidationFailure::KeyUnavailable(format!("no key usable with {alg_name}"));
        let mut verified = None;

        for key in keys
            .iter()
            .filter(|k| k.algorithm.is_none_or(|pinned| pinned == header.alg))
        {
            match decode::<IdTokenClaims>(id_token, &key.key, &validation) {
                Ok(data) => {
                    verified = Some(data.claims);
                    break;
                }
                Err(e) => {
                    let failure = map_jwt_error(e.kind());
                    // A different key may still verify a kid-less token.
                    if failure != ValidationFailure::BadSignature {
                        return Err(failure);
                    }
                    last_failure = failure;
                }
            }
        }

        let claims = verified.ok_or(last_failure)?;
        self.check_claims(&claims, expected_nonce)?;

        tracing::debug!(sub = %claims.sub, "Validated ID token");
        Ok(claims)
    }

    fn validation_for(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_audience(&[self.provider.client_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = self.clock_skew.as_secs();
        validation
    }

    /// Checks the claims `jsonwebtoken` does not cover.
    fn check_claims(
        &self,
        claims: &IdTokenClaims,
        expected_nonce: &str,
    ) -> Result<(), ValidationFailure> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let skew = i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX);
        if claims.iat > now.saturating_add(skew) {
            return Err(ValidationFailure::NotYetValid);
        }

        let expected_issuer = self.provider.issuer.trim_end_matches('/');
        if claims.iss.trim_end_matches('/') != expected_issuer {
            return Err(ValidationFailure::IssuerMismatch {
                expected: expected_issuer.to_string(),
                actual: claims.iss.clone(),
            });
        }

        if let Some(azp) = claims.azp.as_deref()
            && azp != self.provider.client_id
        {
            return Err(ValidationFailure::AudienceMismatch);
        }

        match claims.nonce.as_deref() {
            Some(nonce) if constant_time_eq(nonce.as_bytes(), expected_nonce.as_bytes()) => Ok(()),
            _ => Err(ValidationFailure::NonceMismatch),
        }
    }
}

fn map_jwt_error(kind: &ErrorKind) -> ValidationFailure {
    match kind {
        ErrorKind::InvalidSignature => ValidationFailure::BadSignature,
        ErrorKind::ExpiredSignature => ValidationFailure::Expired,
        ErrorKind::ImmatureSignature => ValidationFailure::NotYetValid,
        ErrorKind::InvalidAudience => ValidationFailure::AudienceMismatch,
        ErrorKind::InvalidAlgorithm | ErrorKind::MissingAlgorithm => {
            ValidationFailure::UnsupportedAlgorithm("algorithm does not match key".to_string())
        }
        ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidKeyFormat => {
            ValidationFailure::KeyUnavailable("unusable verification key".to_string())
        }
        ErrorKind::MissingRequiredClaim(claim) => {
            ValidationFailure::Malformed(format!("missing claim '{claim}'"))
        }
        other => ValidationFailure::Malformed(format!("{other:?}")),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
