//! Callback handling: state consumption, code exchange, ID token validation.
//!
//! # Overview
//!
//! 1. An `error` parameter ends the attempt with `FlowError::Authorization`
//!    before any network call
//! 2. The `state` is consumed (atomically, once) and checked against the
//!    browser-binding cookie
//! 3. The code is exchanged exactly once
//! 4. The ID token is validated against the consumed attempt's nonce
//!
//! Every failure is terminal. The caller must restart from login, never
//! retry a step.

use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::discovery::issuers_match;
use crate::error::{FlowError, ValidationFailure};
use crate::exchange::TokenExchanger;
use crate::flow::{AttemptPhase, AttemptTracker};
use crate::state::StateManager;
use crate::token::TokenSet;
use crate::validation::IdTokenValidator;

/// Query parameters of the redirect back from the provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code.
    pub code: Option<String>,
    /// Echoed `state`.
    pub state: Option<String>,
    /// OAuth error code.
    pub error: Option<String>,
    /// Human-readable error description.
    pub error_description: Option<String>,
    /// Issuer identifier (RFC 9207), when the provider sends it.
    pub iss: Option<String>,
}

/// Runs the callback steps for one attempt.
pub struct CallbackHandler {
    states: Arc<StateManager>,
    exchanger: TokenExchanger,
    validator: IdTokenValidator,
    issuer: String,
}

impl CallbackHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new(
        states: Arc<StateManager>,
        exchanger: TokenExchanger,
        validator: IdTokenValidator,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            states,
            exchanger,
            validator,
            issuer: issuer.into(),
        }
    }

    /// Handles a callback, advancing `tracker` through `Exchanging` and
    /// `Validated`. On error the tracker ends in `Failed`.
    ///
    /// # Errors
    ///
    /// Returns the `FlowError` that ended the attempt.
    pub async fn handle(
        &self,
        params: &CallbackParams,
        browser_binding: Option<&str>,
        tracker: &mut AttemptTracker,
    ) -> Result<TokenSet, FlowError> {
        let result = self.run(params, browser_binding, tracker).await;
        if result.is_err() {
            tracker.fail();
        }
        result
    }

    async fn run(
        &self,
        params: &CallbackParams,
        browser_binding: Option<&str>,
        tracker: &mut AttemptTracker,
    ) -> Result<TokenSet, FlowError> {
        if let Some(error) = params.error.as_deref() {
            // Clear the pending attempt; nothing else happens.
            if let Some(state) = params.state.as_deref() {
                let _ = self.states.consume(state).await;
            }
            return Err(FlowError::authorization(
                error,
                params.error_description.clone(),
            ));
        }

        let state = params.state.as_deref().unwrap_or_default();
        let attempt = self.states.consume(state).await?;
        if !attempt.is_bound_to(browser_binding) {
            tracing::warn!("Callback state was issued to a different browser");
            return Err(FlowError::InvalidState);
        }
        tracker.advance(AttemptPhase::Exchanging)?;

        if let Some(iss) = params.iss.as_deref()
            && !issuers_match(&self.issuer, iss)
        {
            return Err(FlowError::TokenValidation(ValidationFailure::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: iss.to_string(),
            }));
        }

        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                FlowError::authorization("invalid_request", Some("missing code".to_string()))
            })?;

        let response = self
            .exchanger
            .exchange(code, attempt.pkce_verifier.as_ref())
            .await?;

        let id_token = response.id_token.unwrap_or_default();
        let claims = self.validator.validate(&id_token, &attempt.nonce).await?;
        tracker.advance(AttemptPhase::Validated)?;

        let expires_at = response
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| OffsetDateTime::now_utc().checked_add(time::Duration::seconds(secs)));

        Ok(TokenSet {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            id_token,
            claims,
            refresh_token: response.refresh_token,
            expires_at,
            scope: response.scope,
        })
    }
}
