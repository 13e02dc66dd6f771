use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{FromRef, Query},
    middleware,
    response::Html,
    routing::get,
};
use gatehouse_auth::http::{AuthState, CurrentSession, auth_routes, require_session};
use gatehouse_auth::{AuthFlow, ConfigError, InMemorySessionStore};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::{config::AppConfig, views};

/// Router state.
#[derive(Clone)]
pub struct AppState {
    pub auth: AuthState,
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct WelcomeParams {
    #[serde(default)]
    pub error: Option<String>,
}

async fn welcome(Query(params): Query<WelcomeParams>) -> Html<String> {
    Html(views::render_welcome(params.error.as_deref()))
}

async fn dashboard(current: CurrentSession) -> Html<String> {
    Html(views::render_dashboard(&current.session))
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/dashboard", get(dashboard))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_session,
        ));

    Router::new()
        .route("/", get(welcome))
        .merge(protected)
        .merge(auth_routes())
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    // Path only: callback query strings carry codes and state.
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.path = %req.uri().path(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
}

/// Resolves the provider and assembles the application.
pub async fn build_app(cfg: &AppConfig) -> Result<Router, ConfigError> {
    let oidc = cfg.relying_party();
    let sessions = Arc::new(InMemorySessionStore::new(oidc.session_ttl));
    let flow = AuthFlow::from_config(oidc, sessions).await?;
    let state = AppState {
        auth: AuthState::new(Arc::new(flow)),
    };
    Ok(build_router(state))
}

pub struct GatehouseServer {
    addr: SocketAddr,
    app: Router,
}

impl GatehouseServer {
    /// Builds the server. Fails when the provider cannot be resolved.
    pub async fn new(cfg: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            addr: cfg.addr(),
            app: build_app(cfg).await?,
        })
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "Gatehouse listening");
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
