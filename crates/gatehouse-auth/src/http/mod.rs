//! Axum HTTP entry points for the relying-party flow.
//!
//! # Routes
//!
//! - `GET /auth/login` - [`login_handler`]
//! - `GET /auth/callback` - [`callback_handler`]
//! - `GET /auth/logout` - [`logout_handler`]
//!
//! Protected pages are wrapped with [`require_session`].
//!
//! # Usage
//!
//! ```ignore
//! use axum::{Router, middleware, routing::get};
//! use gatehouse_auth::http::{AuthState, auth_routes, require_session};
//!
//! let app = Router::new()
//!     .route("/dashboard", get(dashboard))
//!     .route_layer(middleware::from_fn_with_state(state.clone(), require_session))
//!     .merge(auth_routes())
//!     .with_state(state);
//! ```
//!
//! # Cookies
//!
//! All cookies are HttpOnly, `SameSite=Lax`, path `/`, and `Secure` unless
//! disabled in configuration.
//!
//! - `gatehouse_session`: session id
//! - `gatehouse_attempt`: browser binding of the pending login attempt
//! - `gatehouse_return_to`: protected path to land on after login

mod callback;
mod guard;
mod login;
mod logout;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::FromRef;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum_extra::extract::CookieJar;
use cookie::{Cookie, SameSite};

use crate::flow::{AuthFlow, FlowOutcome};
use crate::session::SessionId;

pub use callback::callback_handler;
pub use guard::{CurrentSession, require_session};
pub use login::login_handler;
pub use logout::logout_handler;

/// Session cookie name.
pub const SESSION_COOKIE: &str = "gatehouse_session";

/// Login attempt cookie name.
pub const ATTEMPT_COOKIE: &str = "gatehouse_attempt";

/// Post-login destination cookie name.
pub const RETURN_TO_COOKIE: &str = "gatehouse_return_to";

/// State shared by the auth handlers.
#[derive(Clone)]
pub struct AuthState {
    /// The flow.
    pub flow: Arc<AuthFlow>,
    /// Whether to mark cookies `Secure`.
    pub secure_cookies: bool,
}

impl AuthState {
    /// Creates handler state, taking the cookie policy from the flow config.
    #[must_use]
    pub fn new(flow: Arc<AuthFlow>) -> Self {
        let secure_cookies = flow.config().cookie_secure;
        Self {
            flow,
            secure_cookies,
        }
    }

    fn cookie(&self, name: &'static str, value: String, max_age: Duration) -> Cookie<'static> {
        let max_age = time::Duration::seconds(i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX));
        Cookie::build((name, value))
            .http_only(true)
            .secure(self.secure_cookies)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(max_age)
            .build()
    }

    fn session_cookie(&self, id: &SessionId) -> Cookie<'static> {
        self.cookie(
            SESSION_COOKIE,
            id.to_string(),
            self.flow.config().session_ttl,
        )
    }

    fn attempt_cookie(&self, binding: String) -> Cookie<'static> {
        self.cookie(ATTEMPT_COOKIE, binding, self.flow.states().ttl())
    }

    fn return_to_cookie(&self, path: String) -> Cookie<'static> {
        self.cookie(RETURN_TO_COOKIE, path, self.flow.states().ttl())
    }
}

/// Mounts the three auth routes.
pub fn auth_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    AuthState: FromRef<S>,
{
    Router::new()
        .route("/auth/login", get(login_handler))
        .route("/auth/callback", get(callback_handler))
        .route("/auth/logout", get(logout_handler))
}

/// Session id from the session cookie, if well-formed.
pub(crate) fn session_id(jar: &CookieJar) -> Option<SessionId> {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| SessionId::parse(cookie.value()))
}

fn removal(name: &'static str) -> Cookie<'static> {
    Cookie::build(name).path("/").build()
}

/// Translates a flow outcome into cookies and a redirect.
pub(crate) fn respond(state: &AuthState, jar: CookieJar, outcome: FlowOutcome) -> Response {
    match outcome {
        FlowOutcome::Redirect {
            location,
            attempt_binding,
        } => {
            let jar = match attempt_binding {
                Some(binding) => jar.add(state.attempt_cookie(binding)),
                // No attempt was issued, so a remembered destination is spent.
                None => jar.remove(removal(RETURN_TO_COOKIE)),
            };
            (jar, Redirect::to(&location)).into_response()
        }
        FlowOutcome::SessionEstablished {
            session_id,
            location,
            ..
        } => {
            let jar = jar
                .add(state.session_cookie(&session_id))
                .remove(removal(ATTEMPT_COOKIE))
                .remove(removal(RETURN_TO_COOKIE));
            (jar, Redirect::to(&location)).into_response()
        }
        FlowOutcome::Failed { location, .. } => {
            let jar = jar.remove(removal(ATTEMPT_COOKIE));
            (jar, Redirect::to(&location)).into_response()
        }
    }
}
