//! `GET /auth/callback`.

use axum::extract::{Query, State};
use axum::response::Response;
use axum_extra::extract::CookieJar;

use super::{ATTEMPT_COOKIE, AuthState, RETURN_TO_COOKIE, respond, session_id};
use crate::callback::CallbackParams;

/// Completes the attempt and redirects to the post-login or error
/// destination.
pub async fn callback_handler(
    State(state): State<AuthState>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Response {
    let binding = jar.get(ATTEMPT_COOKIE).map(|c| c.value().to_string());
    let previous = session_id(&jar);
    let return_to = jar.get(RETURN_TO_COOKIE).map(|c| c.value().to_string());

    let outcome = state
        .flow
        .callback(
            &params,
            binding.as_deref(),
            previous.as_ref(),
            return_to.as_deref(),
        )
        .await;
    respond(&state, jar, outcome)
}
