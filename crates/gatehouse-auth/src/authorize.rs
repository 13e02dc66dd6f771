//! Authorization request construction.

use url::Url;

use crate::pkce::CHALLENGE_METHOD;
use crate::provider::ProviderConfig;
use crate::state::AuthRequestState;

/// Builds the authorization endpoint URL for an attempt.
///
/// Parameters already present on the configured endpoint are preserved. The
/// PKCE challenge is sent only when the attempt carries a verifier.
#[must_use]
pub fn build_authorization_url(provider: &ProviderConfig, attempt: &AuthRequestState) -> Url {
    let mut url = provider.endpoints.authorization.clone();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &provider.client_id)
            .append_pair("redirect_uri", &provider.redirect_uri)
            .append_pair("scope", &provider.scopes.joined())
            .append_pair("state", &attempt.state)
            .append_pair("nonce", &attempt.nonce);

        if let Some(verifier) = &attempt.pkce_verifier {
            query
                .append_pair("code_challenge", verifier.challenge().as_str())
                .append_pair("code_challenge_method", CHALLENGE_METHOD);
        }
    }
    url
}
