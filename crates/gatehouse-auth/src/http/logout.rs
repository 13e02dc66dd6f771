//! `GET /auth/logout`.

use axum::extract::State;
use axum::response::Response;
use axum_extra::extract::CookieJar;

use super::{AuthState, SESSION_COOKIE, removal, respond, session_id};

/// Destroys the session, clears the session cookie, and redirects to the
/// provider's logout endpoint.
pub async fn logout_handler(State(state): State<AuthState>, jar: CookieJar) -> Response {
    let session = session_id(&jar);
    let outcome = state.flow.logout(session.as_ref()).await;
    respond(&state, jar.remove(removal(SESSION_COOKIE)), outcome)
}
