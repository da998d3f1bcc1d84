//! Gateway module
//!
//! The request-processing pipeline from the HTTP boundary inward:
//!
//! ```text
//! Request -> decode -> validate -> rate limit -> cache/single-flight
//!         -> route -> provider dispatch (retry engine) -> one fallback
//!         -> normalized response
//! ```
//!
//! ## Components
//!
//! - `types`: wire structures
//! - `context`: per-request identity, budget and cancellation
//! - `error`: taxonomy and HTTP mapping
//! - `middleware`: validation
//! - `retry`: backoff engine
//! - `cache`: fingerprint store + single-flight
//! - `limits`: per-client token buckets
//! - `routing`: availability tracking and model selection
//! - `dispatch`: provider execution and parallel fan-out

pub mod cache;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod limits;
pub mod middleware;
pub mod retry;
pub mod routing;
pub mod types;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::config::{KeyStore, Settings};
use crate::logger;
use crate::pricing::PriceCatalog;
use crate::providers::{self, ModelType};

use cache::{Flight, ResponseCache};
use context::{estimate_tokens, RequestContext};
use error::{error_response, GatewayError, GatewayResult};
use limits::RateLimiter;
use routing::ModelRouter;
use types::{CostEstimateRequest, QueryRequest, QueryResponse, QueryResult};

// ============================================
// Application state
// ============================================

/// Everything the handlers need, shared across requests.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub keys: Arc<KeyStore>,
    pub router: Arc<ModelRouter>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub pricing: Arc<PriceCatalog>,
}

impl AppState {
    /// Production wiring from the process environment.
    pub fn from_env() -> Self {
        let settings = crate::config::settings();
        let keys = Arc::new(KeyStore::from_env(&settings));
        let router = Arc::new(ModelRouter::new(Arc::clone(&settings), Arc::clone(&keys)));
        Self::assemble(settings, keys, router)
    }

    /// Wire the remaining singletons around a prepared router and key
    /// store. Tests use this with pinned availability and fixed keys.
    pub fn assemble(
        settings: Arc<Settings>,
        keys: Arc<KeyStore>,
        router: Arc<ModelRouter>,
    ) -> Self {
        let cache = Arc::new(ResponseCache::from_settings(&settings));
        let limiter = Arc::new(RateLimiter::from_settings(&settings));
        let pricing = PriceCatalog::load(&settings);
        Self {
            settings,
            keys,
            router,
            cache,
            limiter,
            pricing,
        }
    }
}

/// Periodically drop expired cache entries.
pub fn spawn_cache_sweeper(state: &AppState) {
    let cache = Arc::clone(&state.cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cache.cleanup_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            cache.sweep_expired();
        }
    });
}

// ============================================
// Endpoint profiles
// ============================================

#[derive(Clone, Copy)]
struct EndpointProfile {
    max_chars: usize,
    /// Whether `model_version` is honored; the legacy surface always
    /// resolves to the provider default.
    version_aware: bool,
}

const V0_PROFILE: EndpointProfile = EndpointProfile {
    max_chars: middleware::MAX_QUERY_CHARS_V0,
    version_aware: false,
};

const GATEWAY_PROFILE: EndpointProfile = EndpointProfile {
    max_chars: middleware::MAX_QUERY_CHARS_GATEWAY,
    version_aware: true,
};

// ============================================
// Handlers
// ============================================

/// Liveness probe. Route: GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Availability snapshot. Route: GET /api/status
pub async fn status(State(state): State<AppState>) -> Json<HashMap<ModelType, bool>> {
    Json(state.router.availability().await)
}

/// Legacy single-model query. Route: POST /api/query
pub async fn query_v0(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    handle_single(state, addr, headers, payload, V0_PROFILE).await
}

/// Versioned, cost-aware single query. Route: POST /v1/gateway/query
pub async fn query_gateway(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    handle_single(state, addr, headers, payload, GATEWAY_PROFILE).await
}

/// Fan-out query. Route: POST /api/parallel (alias: /api/query-parallel)
pub async fn query_parallel(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let req = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    if let Err(err) = middleware::validate_query(&req, V0_PROFILE.max_chars)
        .and_then(|_| middleware::validate_parallel(&req))
    {
        return error_response(&err, req.request_id.as_deref());
    }

    let ctx = RequestContext::new(
        req.request_id.clone(),
        req.tenant.clone(),
        req.max_cost_usd,
    )
    .with_deadline(Duration::from_secs(state.settings.parallel_timeout_secs));

    let client = limits::client_ip(&headers, addr);
    if !state.limiter.allow(&client) {
        return error_response(&GatewayError::ClientRateLimited, Some(&ctx.request_id));
    }

    let models = req.models.clone().unwrap_or_default();
    logger::event(
        "llm_request",
        json!({
            "request_id": ctx.request_id,
            "tenant": ctx.tenant,
            "parallel": true,
            "models": models.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            "query_chars": req.query.chars().count(),
            "client": client,
        }),
    );

    let response = dispatch::dispatch_parallel(&state, &ctx, &req, &models).await;

    logger::event(
        "llm_response",
        json!({
            "request_id": ctx.request_id,
            "parallel": true,
            "elapsed_time_ms": response.elapsed_time_ms,
            "failed": response
                .responses
                .iter()
                .filter(|(_, r)| r.error.is_some())
                .map(|(m, _)| m.as_str())
                .collect::<Vec<_>>(),
        }),
    );

    Json(response).into_response()
}

/// Pre-call estimate. Route: POST /v1/gateway/cost-estimate
pub async fn cost_estimate(
    State(state): State<AppState>,
    payload: Result<Json<CostEstimateRequest>, JsonRejection>,
) -> Response {
    let req = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };

    let Some(model) = req.model else {
        return error_response(
            &GatewayError::InvalidRequest("model is required".to_string()),
            None,
        );
    };
    let client = providers::client_for(model, &state.settings, &state.keys);
    let version = client.resolve_version(req.model_version.as_deref());

    let input_tokens = match (req.input_tokens, req.query.as_deref()) {
        (Some(n), _) if n >= 0 => n,
        (None, Some(query)) if !query.is_empty() => estimate_tokens(query),
        _ => {
            return error_response(
                &GatewayError::InvalidRequest(
                    "either input_tokens or query is required".to_string(),
                ),
                None,
            )
        }
    };

    match state.pricing.estimate(
        model.as_str(),
        &version,
        input_tokens,
        req.expected_output_tokens,
    ) {
        Ok(estimate) => Json(json!({
            "model": model.as_str(),
            "model_version": version,
            "input_tokens": estimate.input_tokens,
            "expected_output_tokens": estimate.expected_output_tokens,
            "input_per_1k": estimate.input_per_1k,
            "output_per_1k": estimate.output_per_1k,
            "cost_usd": estimate.cost_usd,
        }))
        .into_response(),
        Err(err) => error_response(&err, None),
    }
}

// ============================================
// Single-query pipeline
// ============================================

fn decode<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match payload {
        Ok(Json(req)) => Ok(req),
        Err(rejection) => {
            let err = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                GatewayError::PayloadTooLarge
            } else {
                GatewayError::InvalidJson(rejection.body_text())
            };
            Err(error_response(&err, None))
        }
    }
}

async fn handle_single(
    state: AppState,
    addr: SocketAddr,
    headers: HeaderMap,
    payload: Result<Json<QueryRequest>, JsonRejection>,
    profile: EndpointProfile,
) -> Response {
    let req = match decode(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    if let Err(err) = middleware::validate_query(&req, profile.max_chars) {
        return error_response(&err, req.request_id.as_deref());
    }

    let ctx = RequestContext::new(
        req.request_id.clone(),
        req.tenant.clone(),
        req.max_cost_usd,
    )
    .with_deadline(Duration::from_secs(state.settings.request_timeout_secs));

    let client = limits::client_ip(&headers, addr);
    if !state.limiter.allow(&client) {
        return error_response(&GatewayError::ClientRateLimited, Some(&ctx.request_id));
    }

    logger::event(
        "llm_request",
        json!({
            "request_id": ctx.request_id,
            "tenant": ctx.tenant,
            "model": req.model.map(|m| m.as_str()),
            "task_type": req.task_type.map(|t| t.as_str()),
            "dry_run": req.dry_run,
            "query_chars": req.query.chars().count(),
            "client": client,
        }),
    );

    if req.dry_run {
        return match dry_run_response(&state, &ctx, &req, profile).await {
            Ok(response) => respond_success(&ctx, response),
            Err(err) => respond_error(&ctx, err),
        };
    }

    let key = cache::fingerprint(&req);
    let outcome = match state.cache.begin_flight(&key) {
        Flight::Waiter(rx) => ResponseCache::await_flight(rx).await.map(|mut shared| {
            // A joined flight shares the leader's upstream call
            shared.cached = true;
            shared.request_id = ctx.request_id.clone();
            shared
        }),
        Flight::Leader(guard) => {
            if let Some(mut hit) = state.cache.get(&key) {
                hit.request_id = ctx.request_id.clone();
                guard.complete(Ok(hit.clone()));
                Ok(hit)
            } else {
                let built = execute_query(&state, &ctx, &req, profile).await;
                if let Ok(response) = &built {
                    state.cache.set(key.clone(), response.clone());
                }
                guard.complete(built.clone());
                built
            }
        }
    };

    match outcome {
        Ok(response) => respond_success(&ctx, response),
        Err(err) => respond_error(&ctx, err),
    }
}

/// Route, enforce the budget, dispatch through the retry engine, and fall
/// back at most once on a retryable failure. If the fallback also fails,
/// the original provider error is surfaced.
async fn execute_query(
    state: &AppState,
    ctx: &RequestContext,
    req: &QueryRequest,
    profile: EndpointProfile,
) -> GatewayResult<QueryResponse> {
    let model = state.router.route_request(ctx, req).await?;
    let requested_version = if profile.version_aware {
        req.model_version.as_deref()
    } else {
        None
    };
    enforce_budget(state, ctx, req, model, requested_version)?;

    let first = dispatch::run_provider(state, ctx, model, &req.query, requested_version).await;
    match first.outcome {
        Ok(result) => Ok(build_response(state, ctx, model, first.version, result, None)),
        Err(err) if err.retryable() && !ctx.is_cancelled() => {
            match state.router.fallback_on_error(ctx, model, req, &err).await {
                Ok(fallback_model) => {
                    let fallback_version = if profile.version_aware
                        && req.model == Some(fallback_model)
                    {
                        req.model_version.as_deref()
                    } else {
                        None
                    };
                    let second = dispatch::run_provider(
                        state,
                        ctx,
                        fallback_model,
                        &req.query,
                        fallback_version,
                    )
                    .await;
                    match second.outcome {
                        Ok(mut result) => {
                            // Surface the retry spend that triggered the fallback
                            result.num_retries = first.retries;
                            Ok(build_response(
                                state,
                                ctx,
                                fallback_model,
                                second.version,
                                result,
                                Some(model),
                            ))
                        }
                        Err(_) => Err(err),
                    }
                }
                Err(_) => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

/// Reject before dispatch when the estimated cost exceeds the caller's
/// cap. A cap the catalog cannot price is treated as exceeded.
fn enforce_budget(
    state: &AppState,
    ctx: &RequestContext,
    req: &QueryRequest,
    model: ModelType,
    requested_version: Option<&str>,
) -> GatewayResult<()> {
    let Some(budget) = ctx.max_cost_usd else {
        return Ok(());
    };
    let client = providers::client_for(model, &state.settings, &state.keys);
    let version = client.resolve_version(requested_version);
    let input_tokens = estimate_tokens(&req.query);
    let estimate = state
        .pricing
        .estimate(model.as_str(), &version, input_tokens, None)?;
    if estimate.cost_usd > budget {
        return Err(GatewayError::BudgetExceeded {
            estimated: estimate.cost_usd,
            budget,
        });
    }
    Ok(())
}

/// Route and price a request without calling any provider.
async fn dry_run_response(
    state: &AppState,
    ctx: &RequestContext,
    req: &QueryRequest,
    profile: EndpointProfile,
) -> GatewayResult<QueryResponse> {
    let model = state.router.route_request(ctx, req).await?;
    let requested_version = if profile.version_aware {
        req.model_version.as_deref()
    } else {
        None
    };
    enforce_budget(state, ctx, req, model, requested_version)?;

    let client = providers::client_for(model, &state.settings, &state.keys);
    let version = client.resolve_version(requested_version);
    let input_tokens = estimate_tokens(&req.query);
    let cost_usd = state
        .pricing
        .estimate(model.as_str(), &version, input_tokens, None)
        .ok()
        .map(|estimate| estimate.cost_usd);

    Ok(QueryResponse {
        response: String::new(),
        model,
        model_version: Some(version),
        response_time_ms: ctx.elapsed_ms(),
        timestamp: Utc::now(),
        cached: false,
        error: None,
        error_type: None,
        input_tokens,
        output_tokens: 0,
        total_tokens: input_tokens,
        num_retries: 0,
        request_id: ctx.request_id.clone(),
        original_model: None,
        cost_usd,
    })
}

fn build_response(
    state: &AppState,
    ctx: &RequestContext,
    model: ModelType,
    version: String,
    result: QueryResult,
    original_model: Option<ModelType>,
) -> QueryResponse {
    let cost_usd = state.pricing.actual_cost(
        model.as_str(),
        &version,
        result.input_tokens,
        result.output_tokens,
    );

    QueryResponse {
        response: result.response,
        model,
        model_version: Some(version),
        response_time_ms: result.response_time_ms,
        timestamp: Utc::now(),
        cached: false,
        error: None,
        error_type: None,
        input_tokens: result.input_tokens,
        output_tokens: result.output_tokens,
        total_tokens: result.total_tokens,
        num_retries: result.num_retries,
        request_id: ctx.request_id.clone(),
        original_model,
        cost_usd,
    }
}

fn respond_success(ctx: &RequestContext, response: QueryResponse) -> Response {
    logger::event(
        "llm_response",
        json!({
            "request_id": ctx.request_id,
            "model": response.model.as_str(),
            "model_version": response.model_version.clone(),
            "cached": response.cached,
            "response_time_ms": response.response_time_ms,
            "total_tokens": response.total_tokens,
            "num_retries": response.num_retries,
            "original_model": response.original_model.map(|m| m.as_str()),
            "cost_usd": response.cost_usd,
        }),
    );
    Json(response).into_response()
}

fn respond_error(ctx: &RequestContext, err: GatewayError) -> Response {
    logger::event(
        "llm_response",
        json!({
            "request_id": ctx.request_id,
            "error_kind": err.kind(),
            "error_code": err.code(),
            "provider": err.provider().map(|m| m.as_str()),
            "elapsed_ms": ctx.elapsed_ms(),
        }),
    );
    error_response(&err, Some(&ctx.request_id))
}
