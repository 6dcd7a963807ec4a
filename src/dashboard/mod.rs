//! The built-in operator dashboard.
//!
//! An axum router served on its own listener: HTML pages for routes,
//! requests, alerts and system stats, an SSE live stream, and a data export
//! endpoint. When basic-auth credentials are configured every route is
//! gated; otherwise the dashboard is open.

mod export;
mod format;
mod pages;
mod sse;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::net::TcpListener;

use crate::collector::Collector;
use crate::config::Config;

#[derive(Clone)]
pub(crate) struct DashboardState {
    pub(crate) collector: Arc<Collector>,
    pub(crate) config: Arc<Config>,
}

/// Builds the dashboard router. Exposed so hosts can mount the dashboard
/// inside an existing server instead of the standalone listener.
pub fn router(collector: Arc<Collector>, config: Arc<Config>) -> Router {
    let state = DashboardState {
        collector,
        config: config.clone(),
    };

    let mut router = Router::new()
        .route("/", get(pages::routes_index))
        .route("/route/{method}/{*pattern}", get(pages::route_detail))
        .route("/request/{id}", get(pages::request_detail))
        .route("/live", get(pages::live_tail))
        .route("/alerts", get(pages::alerts))
        .route("/system", get(pages::system))
        .route("/events", get(sse::events))
        .route("/xrayhq/export", get(export::export))
        .with_state(state.clone());

    if config.auth_enabled() {
        router = router.layer(middleware::from_fn_with_state(state, basic_auth));
    }

    router.layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Binds and serves the dashboard until the process exits. Bind or serve
/// failures are logged and swallowed; the host application is unaffected.
pub(crate) async fn serve(collector: Arc<Collector>, config: Arc<Config>) {
    let addr = config.listen_addr.clone();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(address = %addr, error = %err, "dashboard listener failed to bind");
            return;
        }
    };
    tracing::info!(address = %addr, "dashboard available");

    let app = router(collector, config);
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "dashboard server error");
    }
}

async fn basic_auth(
    State(state): State<DashboardState>,
    request: Request,
    next: Next,
) -> Response {
    let expected_user = state.config.basic_auth_user.as_str();
    let expected_pass = state.config.basic_auth_pass.as_str();

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| BASE64.decode(encoded).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
        .map(|pair| match pair.split_once(':') {
            Some((user, pass)) => user == expected_user && pass == expected_pass,
            None => false,
        })
        .unwrap_or(false);

    if authorized {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, "Basic realm=\"xrayhq\"")],
        Body::from("Unauthorized"),
    )
        .into_response()
}
