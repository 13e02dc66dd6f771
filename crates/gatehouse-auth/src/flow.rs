//! Login attempt state machine and flow orchestration.
//!
//! [`AuthFlow`] ties the components together and returns a [`FlowOutcome`]
//! for every entry point. The outcome is plain data; the `http` module turns
//! it into redirects and cookies.
//!
//! # Attempt phases
//!
//! ```text
//! Idle ─► Pending ─► Exchanging ─► Validated ─► SessionEstablished
//!   │        │           │             │
//!   └────────┴───────────┴─────────────┴──────► Failed
//! ```
//!
//! `Pending` is entered when the state is issued at login. The callback
//! resumes the attempt in `Pending`; `Exchanging` is reached only after the
//! matching pending entry was consumed.

use std::fmt;
use std::sync::Arc;

use crate::authorize::build_authorization_url;
use crate::callback::{CallbackHandler, CallbackParams};
use crate::config::{ConfigError, RelyingPartyConfig};
use crate::error::{ErrorCategory, FlowError};
use crate::exchange::TokenExchanger;
use crate::jwks::{JwksCache, JwksCacheConfig};
use crate::logout::LogoutCoordinator;
use crate::provider::{ProviderConfig, ProviderResolver};
use crate::session::{Session, SessionId, SessionMaterializer, SessionStore};
use crate::state::{StateManager, generate_token};
use crate::userinfo::UserInfoFetcher;
use crate::validation::IdTokenValidator;

/// Phase of a single login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    /// Nothing issued yet.
    Idle,
    /// State and nonce issued; waiting for the callback.
    Pending,
    /// State consumed; the code is being exchanged.
    Exchanging,
    /// ID token verified.
    Validated,
    /// Session stored. Terminal.
    SessionEstablished,
    /// Attempt ended with an error. Terminal.
    Failed,
}

impl AttemptPhase {
    /// Returns `true` for `SessionEstablished` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::SessionEstablished | Self::Failed)
    }

    /// Returns `true` if `next` may directly follow `self`.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Idle, Self::Pending)
            | (Self::Pending, Self::Exchanging)
            | (Self::Exchanging, Self::Validated)
            | (Self::Validated, Self::SessionEstablished) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Lowercase name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Exchanging => "exchanging",
            Self::Validated => "validated",
            Self::SessionEstablished => "session_established",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the phase of one attempt and rejects out-of-order transitions.
#[derive(Debug)]
pub struct AttemptTracker {
    phase: AttemptPhase,
}

impl Default for AttemptTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptTracker {
    /// A fresh attempt in `Idle`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: AttemptPhase::Idle,
        }
    }

    /// An attempt resumed at the callback, whose state was issued earlier.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            phase: AttemptPhase::Pending,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// An out-of-order transition moves the attempt to `Failed` and returns
    /// `FlowError::InvalidState`.
    pub fn advance(&mut self, next: AttemptPhase) -> Result<(), FlowError> {
        if !self.phase.can_advance_to(next) {
            tracing::warn!(from = %self.phase, to = %next, "Rejected attempt transition");
            self.fail();
            return Err(FlowError::InvalidState);
        }
        tracing::debug!(from = %self.phase, to = %next, "Attempt transition");
        self.phase = next;
        Ok(())
    }

    /// Moves to `Failed` unless a session was already established.
    pub fn fail(&mut self) {
        if self.phase != AttemptPhase::SessionEstablished {
            self.phase = AttemptPhase::Failed;
        }
    }
}

/// What the transport layer should do next.
#[derive(Debug)]
pub enum FlowOutcome {
    /// Send the browser to `location`. When `attempt_binding` is set, it
    /// must be stored in the attempt cookie.
    Redirect {
        /// Redirect target.
        location: String,
        /// Browser-binding value for a freshly issued attempt.
        attempt_binding: Option<String>,
    },
    /// A session was stored; set the session cookie and redirect.
    SessionEstablished {
        /// New session id.
        session_id: SessionId,
        /// The stored session.
        session: Session,
        /// Post-login destination.
        location: String,
    },
    /// The attempt failed. `location` carries only a generic error code.
    Failed {
        /// The error, for logging and tests.
        error: FlowError,
        /// Error destination.
        location: String,
    },
}

impl FlowOutcome {
    /// Redirect target of any outcome.
    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            Self::Redirect { location, .. }
            | Self::SessionEstablished { location, .. }
            | Self::Failed { location, .. } => location,
        }
    }

    /// Final phase the outcome corresponds to.
    #[must_use]
    pub fn phase(&self) -> AttemptPhase {
        match self {
            Self::Redirect {
                attempt_binding: Some(_),
                ..
            } => AttemptPhase::Pending,
            Self::Redirect { .. } => AttemptPhase::Idle,
            Self::SessionEstablished { .. } => AttemptPhase::SessionEstablished,
            Self::Failed { .. } => AttemptPhase::Failed,
        }
    }
}

/// Returns `true` for same-origin relative paths safe to redirect to.
#[must_use]
pub fn is_local_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.starts_with("//")
        && !path.starts_with("/\\")
        && !path.chars().any(char::is_control)
}

/// The relying-party flow: login, callback, logout.
pub struct AuthFlow {
    config: RelyingPartyConfig,
    provider: Arc<ProviderConfig>,
    states: Arc<StateManager>,
    sessions: Arc<dyn SessionStore>,
    jwks: Arc<JwksCache>,
    callback: CallbackHandler,
    userinfo: UserInfoFetcher,
    materializer: SessionMaterializer,
    logout: LogoutCoordinator,
}

impl AuthFlow {
    /// Resolves the provider and builds the flow with in-memory attempt
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the settings are invalid or the provider
    /// cannot be resolved.
    pub async fn from_config(
        config: RelyingPartyConfig,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self, ConfigError> {
        let resolver = ProviderResolver::new(config)?;
        let provider = resolver.resolve().await?;
        let config = resolver.config().clone();
        let states = Arc::new(StateManager::in_memory(
            config.state_ttl(),
            config.pkce_enabled,
        ));
        Ok(Self::new(
            config,
            provider,
            resolver.http_client().clone(),
            sessions,
            states,
        ))
    }

    /// Builds the flow from an already resolved provider.
    #[must_use]
    pub fn new(
        config: RelyingPartyConfig,
        provider: Arc<ProviderConfig>,
        http_client: reqwest::Client,
        sessions: Arc<dyn SessionStore>,
        states: Arc<StateManager>,
    ) -> Self {
        let jwks = Arc::new(JwksCache::new(
            http_client.clone(),
            provider.endpoints.jwks.clone(),
            JwksCacheConfig::from_relying_party(&config),
        ));
        let validator = IdTokenValidator::new(jwks.clone(), provider.clone(), config.clock_skew());
        let exchanger = TokenExchanger::new(http_client.clone(), provider.clone());
        let callback = CallbackHandler::new(
            states.clone(),
            exchanger,
            validator,
            provider.issuer.clone(),
        );
        let userinfo = UserInfoFetcher::new(
            http_client,
            provider.endpoints.userinfo.clone(),
            config.userinfo_policy,
        );
        let materializer = SessionMaterializer::new(sessions.clone());
        let logout = LogoutCoordinator::new(
            sessions.clone(),
            provider.clone(),
            config.effective_post_logout_redirect_uri(),
        );

        Self {
            config,
            provider,
            states,
            sessions,
            jwks,
            callback,
            userinfo,
            materializer,
            logout,
        }
    }

    /// Relying-party settings.
    #[must_use]
    pub fn config(&self) -> &RelyingPartyConfig {
        &self.config
    }

    /// Resolved provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<ProviderConfig> {
        &self.provider
    }

    /// Pending-attempt manager.
    #[must_use]
    pub fn states(&self) -> &Arc<StateManager> {
        &self.states
    }

    /// Signing key cache.
    #[must_use]
    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    /// Looks up an established session.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::SessionStore` if the store fails.
    pub async fn current_session(&self, id: Option<&SessionId>) -> Result<Option<Session>, FlowError> {
        let Some(id) = id else {
            return Ok(None);
        };
        let session = self.sessions.get(id).await?;
        Ok(session.filter(|s| s.logged_in))
    }

    /// Starts a login attempt.
    ///
    /// With an established session the browser goes straight to the
    /// post-login destination and no attempt is issued.
    pub async fn login(&self, existing: Option<&SessionId>, return_to: Option<&str>) -> FlowOutcome {
        match self.current_session(existing).await {
            Ok(Some(_)) => {
                tracing::debug!("Already logged in, skipping authorization request");
                return FlowOutcome::Redirect {
                    location: self.post_login_location(return_to),
                    attempt_binding: None,
                };
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Could not check existing session, starting a new login");
            }
        }

        let mut tracker = AttemptTracker::new();
        let binding = generate_token();
        let attempt = match self.states.issue(Some(binding.clone())).await {
            Ok(attempt) => attempt,
            Err(e) => return self.failed(e),
        };
        if let Err(e) = tracker.advance(AttemptPhase::Pending) {
            return self.failed(e);
        }

        let url = build_authorization_url(&self.provider, &attempt);
        tracing::info!(
            pkce = attempt.pkce_verifier.is_some(),
            "Redirecting to identity provider"
        );
        FlowOutcome::Redirect {
            location: url.to_string(),
            attempt_binding: Some(binding),
        }
    }

    /// Completes a login attempt from the provider's callback.
    ///
    /// `previous` is the session the browser presented, if any. It is
    /// destroyed once the new session is stored.
    pub async fn callback(
        &self,
        params: &CallbackParams,
        browser_binding: Option<&str>,
        previous: Option<&SessionId>,
        return_to: Option<&str>,
    ) -> FlowOutcome {
        let mut tracker = AttemptTracker::pending();
        match self
            .complete(params, browser_binding, previous, &mut tracker)
            .await
        {
            Ok((session_id, session)) => FlowOutcome::SessionEstablished {
                session_id,
                session,
                location: self.post_login_location(return_to),
            },
            Err(e) => {
                tracker.fail();
                self.failed(e)
            }
        }
    }

    async fn complete(
        &self,
        params: &CallbackParams,
        browser_binding: Option<&str>,
        previous: Option<&SessionId>,
        tracker: &mut AttemptTracker,
    ) -> Result<(SessionId, Session), FlowError> {
        let tokens = self.callback.handle(params, browser_binding, tracker).await?;
        let userinfo = self.userinfo.fetch(&tokens).await?;
        if tracker.phase() != AttemptPhase::Validated {
            return Err(FlowError::InvalidState);
        }
        let established = self
            .materializer
            .materialize(&tokens, userinfo, previous)
            .await?;
        tracker.advance(AttemptPhase::SessionEstablished)?;
        Ok(established)
    }

    /// Destroys the session and returns the logout redirect.
    pub async fn logout(&self, session_id: Option<&SessionId>) -> FlowOutcome {
        match self.logout.logout(session_id).await {
            Ok(location) => FlowOutcome::Redirect {
                location,
                attempt_binding: None,
            },
            Err(e) => self.failed(e),
        }
    }

    fn post_login_location(&self, return_to: Option<&str>) -> String {
        return_to
            .filter(|path| is_local_path(path))
            .unwrap_or(&self.config.post_login_redirect)
            .to_string()
    }

    fn failed(&self, error: FlowError) -> FlowOutcome {
        let code = error.user_code();
        let category = error.category();
        if error.is_security_relevant() {
            tracing::warn!(%category, code, error = %error, "Login attempt rejected");
        } else if matches!(
            category,
            ErrorCategory::Infrastructure | ErrorCategory::Configuration
        ) {
            tracing::error!(%category, code, error = %error, "Login attempt failed");
        } else {
            tracing::info!(%category, code, error = %error, "Login attempt failed");
        }

        FlowOutcome::Failed {
            location: error_location(&self.config.error_redirect, code),
            error,
        }
    }
}

fn error_location(base: &str, code: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}error={code}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderEndpoints, ScopeSet};
    use crate::session::InMemorySessionStore;
    use std::time::Duration;
    use url::Url;

    fn flow(sessions: Arc<dyn SessionStore>) -> AuthFlow {
        let config = RelyingPartyConfig::new(
            "https://sso.example.com",
            "web-portal",
            "https://portal.example.com/auth/callback",
        )
        .with_realm("acme");
        let provider = Arc::new(ProviderConfig {
            issuer: "https://sso.example.com/realms/acme".to_string(),
            client_id: "web-portal".to_string(),
            client_secret: None,
            redirect_uri: config.redirect_uri.clone(),
            scopes: ["openid", "profile"].into_iter().collect::<ScopeSet>(),
            endpoints: ProviderEndpoints {
                authorization: Url::parse("https://sso.example.com/auth").unwrap(),
                token: Url::parse("https://sso.example.com/token").unwrap(),
                userinfo: None,
                logout: None,
                jwks: Url::parse("https://sso.example.com/certs").unwrap(),
            },
            pkce_enabled: true,
            signing_algorithms: Vec::new(),
        });
        let states = Arc::new(StateManager::in_memory(Duration::from_secs(600), true));
        AuthFlow::new(config, provider, reqwest::Client::new(), sessions, states)
    }

    #[test]
    fn test_phase_transitions() {
        use AttemptPhase::*;

        assert!(Idle.can_advance_to(Pending));
        assert!(Pending.can_advance_to(Exchanging));
        assert!(Exchanging.can_advance_to(Validated));
        assert!(Validated.can_advance_to(SessionEstablished));
        for phase in [Idle, Pending, Exchanging, Validated] {
            assert!(phase.can_advance_to(Failed));
        }

        assert!(!Idle.can_advance_to(Exchanging));
        assert!(!Pending.can_advance_to(Validated));
        assert!(!Exchanging.can_advance_to(SessionEstablished));
        assert!(!Failed.can_advance_to(Pending));
        assert!(!SessionEstablished.can_advance_to(Failed));
    }

    #[test]
    fn test_tracker_rejects_out_of_order() {
        let mut tracker = AttemptTracker::new();
        let err = tracker.advance(AttemptPhase::Exchanging).unwrap_err();
        assert!(matches!(err, FlowError::InvalidState));
        assert_eq!(tracker.phase(), AttemptPhase::Failed);
    }

    #[test]
    fn test_local_paths() {
        assert!(is_local_path("/dashboard"));
        assert!(is_local_path("/reports?year=2024"));
        assert!(!is_local_path("//evil.example.com"));
        assert!(!is_local_path("/\\evil.example.com"));
        assert!(!is_local_path("https://evil.example.com"));
        assert!(!is_local_path("dashboard"));
    }

    #[test]
    fn test_error_location() {
        assert_eq!(error_location("/", "invalid_state"), "/?error=invalid_state");
        assert_eq!(
            error_location("/login?lang=en", "server_error"),
            "/login?lang=en&error=server_error"
        );
    }

    #[tokio::test]
    async fn test_login_issues_pending_attempt() {
        let flow = flow(Arc::new(InMemorySessionStore::new(Duration::from_secs(60))));
        let outcome = flow.login(None, None).await;

        assert_eq!(outcome.phase(), AttemptPhase::Pending);
        let FlowOutcome::Redirect {
            location,
            attempt_binding,
        } = outcome
        else {
            panic!("expected redirect");
        };
        assert!(location.starts_with("https://sso.example.com/auth?"));
        assert!(attempt_binding.is_some());
    }

    #[tokio::test]
    async fn test_login_short_circuits_with_session() {
        let sessions = Arc::new(InMemorySessionStore::new(Duration::from_secs(60)));
        let id = SessionId::generate();
        sessions
            .set(
                &id,
                Session {
                    logged_in: true,
                    claims: serde_json::Map::new(),
                    access_token: "at".to_string(),
                    id_token: "it".to_string(),
                    refresh_token: None,
                    created_at: time::OffsetDateTime::now_utc(),
                },
            )
            .await
            .unwrap();

        let flow = flow(sessions);
        let outcome = flow.login(Some(&id), Some("/reports")).await;
        assert_eq!(outcome.location(), "/reports");
        assert!(matches!(
            outcome,
            FlowOutcome::Redirect {
                attempt_binding: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_callback_with_unknown_state_fails() {
        let flow = flow(Arc::new(InMemorySessionStore::new(Duration::from_secs(60))));
        let params = CallbackParams {
            code: Some("code".to_string()),
            state: Some("forged".to_string()),
            ..Default::default()
        };
        let outcome = flow.callback(&params, None, None, None).await;
        assert_eq!(outcome.location(), "/?error=invalid_state");
        assert!(matches!(
            outcome,
            FlowOutcome::Failed {
                error: FlowError::InvalidState,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_denied_callback_clears_attempt() {
        let flow = flow(Arc::new(InMemorySessionStore::new(Duration::from_secs(60))));
        let attempt = flow.states().issue(None).await.unwrap();

        let params = CallbackParams {
            state: Some(attempt.state.clone()),
            error: Some("access_denied".to_string()),
            ..Default::default()
        };
        let outcome = flow.callback(&params, None, None, None).await;
        assert_eq!(outcome.location(), "/?error=access_denied");
        assert!(matches!(
            flow.states().consume(&attempt.state).await,
            Err(FlowError::InvalidState)
        ));
    }
}
