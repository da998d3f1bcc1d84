//! HTTP server
//!
//! Assembles the axum router, applies the body-size cap, CORS and the
//! mandatory security headers, and runs the listener.

use std::net::SocketAddr;

use axum::extract::{DefaultBodyLimit, Request};
use axum::http::header::{HeaderName, HeaderValue};
use axum::middleware::{self as axum_middleware, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::gateway::{self, AppState};
use crate::logger;

/// Request bodies above this size are rejected with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("content-security-policy", "default-src 'self'"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    (
        "cache-control",
        "no-store, no-cache, must-revalidate, private",
    ),
    (
        "strict-transport-security",
        "max-age=31536000; includeSubDomains",
    ),
];

/// Attach the mandatory security headers to every response.
async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}

pub fn app(state: AppState) -> Router {
    Router::new()
        // Health & availability
        .route("/api/health", get(gateway::health))
        .route("/api/status", get(gateway::status))
        // Legacy v0 query surface
        .route("/api/query", post(gateway::query_v0))
        .route("/api/parallel", post(gateway::query_parallel))
        // Deprecated alias some clients still call
        .route("/api/query-parallel", post(gateway::query_parallel))
        // Versioned gateway surface with cost fields
        .route("/v1/gateway/query", post(gateway::query_gateway))
        .route("/v1/gateway/cost-estimate", post(gateway::cost_estimate))
        .layer(axum_middleware::from_fn(security_headers))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState) {
    let port = state.settings.port;
    let app = app(state);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            logger::error("server", &format!("Failed to bind {}: {}", addr, err));
            return;
        }
    };
    logger::info("server", &format!("Listening on {}", addr));
    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        logger::error("server", &format!("Server terminated: {}", err));
    }
}
