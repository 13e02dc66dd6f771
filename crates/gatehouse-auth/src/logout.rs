//! RP-initiated logout.
//!
//! The local session is destroyed first. The provider logout URL is built
//! only afterwards, so local invalidation never depends on the browser
//! following the redirect or on the provider being reachable.

use std::sync::Arc;

use url::Url;

use crate::error::FlowError;
use crate::provider::ProviderConfig;
use crate::session::{SessionId, SessionStore};

/// Builds the provider logout URL.
///
/// Sends `id_token_hint` when available and `client_id` otherwise, so the
/// provider can still validate `post_logout_redirect_uri`. Returns `None`
/// when the provider has no logout endpoint.
#[must_use]
pub fn build_logout_url(
    provider: &ProviderConfig,
    id_token_hint: Option<&str>,
    post_logout_redirect_uri: &str,
) -> Option<Url> {
    let mut url = provider.endpoints.logout.clone()?;
    {
        let mut query = url.query_pairs_mut();
        match id_token_hint {
            Some(hint) => query.append_pair("id_token_hint", hint),
            None => query.append_pair("client_id", &provider.client_id),
        };
        query.append_pair("post_logout_redirect_uri", post_logout_redirect_uri);
    }
    Some(url)
}

/// Destroys sessions and produces the post-logout redirect.
#[derive(Clone)]
pub struct LogoutCoordinator {
    store: Arc<dyn SessionStore>,
    provider: Arc<ProviderConfig>,
    post_logout_redirect_uri: String,
}

impl LogoutCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<ProviderConfig>,
        post_logout_redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            post_logout_redirect_uri: post_logout_redirect_uri.into(),
        }
    }

    /// Destroys the session (if any) and returns where to send the browser.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::SessionStore` if the session could not be
    /// destroyed. No logout URL is produced in that case.
    pub async fn logout(&self, session_id: Option<&SessionId>) -> Result<String, FlowError> {
        let mut id_token_hint = None;

        if let Some(id) = session_id {
            match self.store.get(id).await {
                Ok(session) => id_token_hint = session.map(|s| s.id_token),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not read session before logout");
                }
            }

            self.store.destroy(id).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to destroy session on logout");
                FlowError::SessionStore(e)
            })?;
            tracing::info!(had_session = id_token_hint.is_some(), "Local session destroyed");
        }

        let location = build_logout_url(
            &self.provider,
            id_token_hint.as_deref(),
            &self.post_logout_redirect_uri,
        )
        .map_or_else(|| self.post_logout_redirect_uri.clone(), |url| url.to_string());

        Ok(location)
    }
}
