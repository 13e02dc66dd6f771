//! # gatehouse-auth
//!
//! OpenID Connect relying-party authentication for Gatehouse.
//!
//! This crate provides:
//! - Provider resolution from settings, discovery, or path conventions
//! - Single-use state, nonce and PKCE handling for login attempts
//! - Authorization code exchange and JWKS-verified ID token validation
//! - Optional userinfo enrichment under a strict or lenient policy
//! - Session materialization and RP-initiated logout
//! - Axum handlers for `/auth/login`, `/auth/callback` and `/auth/logout`
//!
//! ## Overview
//!
//! [`AuthFlow`] owns the login attempt state machine and returns a typed
//! [`FlowOutcome`] for each entry point. The [`http`] module interprets the
//! outcome as cookies and redirects; nothing below it knows about HTTP
//! responses.
//!
//! ## Modules
//!
//! - [`config`] - Relying-party settings
//! - [`provider`] / [`discovery`] - Endpoint resolution
//! - [`state`] / [`pkce`] - Login attempt secrets
//! - [`authorize`] - Authorization request URL
//! - [`callback`] / [`exchange`] / [`validation`] / [`jwks`] / [`token`] - Callback processing
//! - [`userinfo`] - Claim enrichment
//! - [`session`] - Session store contract and materialization
//! - [`logout`] - Logout coordination
//! - [`flow`] - Attempt phases and orchestration
//! - [`http`] - Axum entry points and the session guard

pub mod authorize;
pub mod callback;
pub mod config;
pub mod discovery;
pub mod error;
pub mod exchange;
pub mod flow;
pub mod http;
pub mod jwks;
pub mod logout;
pub mod pkce;
pub mod provider;
pub mod session;
pub mod state;
pub mod token;
pub mod userinfo;
pub mod validation;

#[cfg(test)]
mod testing;

pub use callback::CallbackParams;
pub use config::{ConfigError, RelyingPartyConfig, UserInfoPolicy};
pub use error::{ErrorCategory, FlowError, ValidationFailure};
pub use flow::{AttemptPhase, AuthFlow, FlowOutcome};
pub use provider::{ProviderConfig, ProviderResolver};
pub use session::{InMemorySessionStore, Session, SessionId, SessionStore, SessionStoreError};

/// Type alias for flow results.
pub type FlowResult<T> = Result<T, FlowError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use gatehouse_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::FlowResult;
    pub use crate::callback::CallbackParams;
    pub use crate::config::{ConfigError, EndpointOverrides, RelyingPartyConfig, UserInfoPolicy};
    pub use crate::error::{ErrorCategory, FlowError, ValidationFailure};
    pub use crate::flow::{AttemptPhase, AuthFlow, FlowOutcome};
    pub use crate::http::{AuthState, CurrentSession, auth_routes, require_session};
    pub use crate::provider::{ProviderConfig, ProviderResolver};
    pub use crate::session::{
        InMemorySessionStore, Session, SessionId, SessionStore, SessionStoreError,
    };
    pub use crate::state::{AttemptStorage, InMemoryAttemptStorage, StateManager};
}
