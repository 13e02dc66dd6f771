//! `GET /auth/login`.

use axum::extract::State;
use axum::response::Response;
use axum_extra::extract::CookieJar;

use super::{AuthState, RETURN_TO_COOKIE, respond, session_id};

/// Starts a login attempt and redirects to the identity provider.
///
/// A browser that already holds a valid session is sent to the post-login
/// destination instead.
pub async fn login_handler(State(state): State<AuthState>, jar: CookieJar) -> Response {
    let session = session_id(&jar);
    let return_to = jar.get(RETURN_TO_COOKIE).map(|c| c.value().to_string());

    let outcome = state
        .flow
        .login(session.as_ref(), return_to.as_deref())
        .await;
    respond(&state, jar, outcome)
}
