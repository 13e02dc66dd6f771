//! Session guard for protected routes.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;

use super::{AuthState, session_id};
use crate::flow::is_local_path;
use crate::session::{Session, SessionId};

/// Login entry point unauthenticated requests are sent to.
const LOGIN_PATH: &str = "/auth/login";

/// The session of the current request, inserted by [`require_session`].
#[derive(Debug, Clone)]
pub struct CurrentSession {
    /// Session id.
    pub id: SessionId,
    /// Session record.
    pub session: Session,
}

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentSession>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Middleware requiring an established session.
///
/// Without one, the requested path is remembered in the return-to cookie
/// and the browser is redirected to the login entry point.
pub async fn require_session(
    State(state): State<AuthState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(id) = session_id(&jar) {
        match state.flow.current_session(Some(&id)).await {
            Ok(Some(session)) => {
                request
                    .extensions_mut()
                    .insert(CurrentSession { id, session });
                return next.run(request).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "Session lookup failed");
            }
        }
    }

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .filter(|path| is_local_path(path));

    tracing::debug!(path = ?path, "No session, redirecting to login");
    let jar = match path {
        Some(path) => jar.add(state.return_to_cookie(path)),
        None => jar,
    };
    (jar, Redirect::to(LOGIN_PATH)).into_response()
}
