//! Gateway error taxonomy
//!
//! One variant per error kind from the wire contract. Provider-originated
//! variants carry the provider tag, the upstream status where one exists,
//! and enough detail for logs; the client only ever sees the user-safe
//! message and a stable code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::logger;
use crate::providers::ModelType;

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Credential absent; no network call was attempted.
    #[error("missing API key for {0}")]
    ApiKeyMissing(ModelType),
    /// Transport deadline hit, or the request deadline expired mid-call.
    #[error("{detail}")]
    Timeout {
        provider: Option<ModelType>,
        detail: String,
    },
    /// Upstream 429.
    #[error("{detail}")]
    RateLimit { provider: ModelType, detail: String },
    /// Upstream 5xx or unreachable.
    #[error("{detail}")]
    Unavailable {
        provider: Option<ModelType>,
        detail: String,
    },
    /// 2xx body that failed to parse.
    #[error("{detail}")]
    InvalidResponse { provider: ModelType, detail: String },
    /// 2xx body with no candidate text.
    #[error("{detail}")]
    EmptyResponse { provider: ModelType, detail: String },
    /// Upstream rejection that is not retryable (4xx other than 429).
    #[error("{detail}")]
    Upstream {
        provider: ModelType,
        code: u16,
        retryable: bool,
        detail: String,
    },
    /// Caller validation failure.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Request body failed to decode.
    #[error("malformed JSON body: {0}")]
    InvalidJson(String),
    /// Request body over the size cap.
    #[error("request body too large")]
    PayloadTooLarge,
    /// Denied by the gateway's own rate limiter.
    #[error("rate limit exceeded, try again later")]
    ClientRateLimited,
    /// Estimated cost over the caller's cap.
    #[error("estimated cost ${estimated:.6} exceeds budget ${budget:.6}")]
    BudgetExceeded { estimated: f64, budget: f64 },
    /// No price catalog entry for the pair.
    #[error("no price known for {provider}/{version}")]
    UnknownModelPrice { provider: String, version: String },
    /// Router found nothing available.
    #[error("no models available")]
    NoModelsAvailable,
    /// Router found no alternative after a failure.
    #[error("no fallback available")]
    NoFallbackAvailable,
    /// Client disconnected or cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable taxonomy tag, e.g. `timeout`, `rate_limit`.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ApiKeyMissing(_) => "api_key_missing",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::RateLimit { .. } => "rate_limit",
            GatewayError::ClientRateLimited => "rate_limit",
            GatewayError::Unavailable { .. } => "unavailable",
            GatewayError::InvalidResponse { .. } => "invalid_response",
            GatewayError::EmptyResponse { .. } => "empty_response",
            GatewayError::Upstream { .. } => "provider_error",
            GatewayError::InvalidRequest(_) | GatewayError::InvalidJson(_) => "invalid_request",
            GatewayError::PayloadTooLarge => "invalid_request",
            GatewayError::BudgetExceeded { .. } => "budget_exceeded",
            GatewayError::UnknownModelPrice { .. } => "unknown_model_price",
            GatewayError::NoModelsAvailable => "no_models_available",
            GatewayError::NoFallbackAvailable => "no_fallback_available",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ApiKeyMissing(_) => "API_KEY_MISSING",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::RateLimit { .. } => "UPSTREAM_RATE_LIMITED",
            GatewayError::ClientRateLimited => "RATE_LIMITED",
            GatewayError::Unavailable { .. } => "UNAVAILABLE",
            GatewayError::InvalidResponse { .. } => "INVALID_RESPONSE",
            GatewayError::EmptyResponse { .. } => "EMPTY_RESPONSE",
            GatewayError::Upstream { .. } => "PROVIDER_ERROR",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::InvalidJson(_) => "INVALID_JSON",
            GatewayError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            GatewayError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            GatewayError::UnknownModelPrice { .. } => "UNKNOWN_MODEL_PRICE",
            GatewayError::NoModelsAvailable => "NO_MODELS_AVAILABLE",
            GatewayError::NoFallbackAvailable => "NO_FALLBACK_AVAILABLE",
            GatewayError::Cancelled => "CANCELLED",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the retry engine may try again.
    pub fn retryable(&self) -> bool {
        match self {
            GatewayError::Timeout { .. }
            | GatewayError::RateLimit { .. }
            | GatewayError::Unavailable { .. } => true,
            GatewayError::Upstream { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Provider this error originated from, when there is one.
    pub fn provider(&self) -> Option<ModelType> {
        match self {
            GatewayError::ApiKeyMissing(p) => Some(*p),
            GatewayError::Timeout { provider, .. } => *provider,
            GatewayError::RateLimit { provider, .. } => Some(*provider),
            GatewayError::Unavailable { provider, .. } => *provider,
            GatewayError::InvalidResponse { provider, .. } => Some(*provider),
            GatewayError::EmptyResponse { provider, .. } => Some(*provider),
            GatewayError::Upstream { provider, .. } => Some(*provider),
            _ => None,
        }
    }

    /// Upstream HTTP status, where the error wraps one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            GatewayError::RateLimit { .. } => Some(429),
            GatewayError::Upstream { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// HTTP status surfaced to the caller.
    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::ApiKeyMissing(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            GatewayError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ClientRateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidResponse { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::EmptyResponse { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) | GatewayError::InvalidJson(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BudgetExceeded { .. } => StatusCode::BAD_REQUEST,
            GatewayError::UnknownModelPrice { .. } => StatusCode::BAD_REQUEST,
            GatewayError::NoModelsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoFallbackAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Render an error as the standard `{error, code, request_id}` body.
pub fn error_response(err: &GatewayError, request_id: Option<&str>) -> Response {
    let status = err.http_status();

    logger::error(
        "gateway",
        &format!(
            "Returning error response: status={}, code={}, request_id={}, detail={}",
            status.as_u16(),
            err.code(),
            request_id.unwrap_or("-"),
            err
        ),
    );

    let mut body = serde_json::json!({
        "error": err.to_string(),
        "code": err.code(),
    });
    if let Some(id) = request_id {
        body["request_id"] = serde_json::Value::from(id);
    }

    (status, Json(body)).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        error_response(&self, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(GatewayError::Timeout {
            provider: None,
            detail: "t".into()
        }
        .retryable());
        assert!(GatewayError::RateLimit {
            provider: ModelType::OpenAi,
            detail: "r".into()
        }
        .retryable());
        assert!(GatewayError::Unavailable {
            provider: Some(ModelType::OpenAi),
            detail: "u".into()
        }
        .retryable());

        assert!(!GatewayError::ApiKeyMissing(ModelType::Claude).retryable());
        assert!(!GatewayError::InvalidResponse {
            provider: ModelType::OpenAi,
            detail: "bad".into()
        }
        .retryable());
        assert!(!GatewayError::EmptyResponse {
            provider: ModelType::OpenAi,
            detail: "empty".into()
        }
        .retryable());
        assert!(!GatewayError::Cancelled.retryable());
    }

    #[test]
    fn upstream_respects_explicit_flag() {
        let err = GatewayError::Upstream {
            provider: ModelType::Mistral,
            code: 418,
            retryable: true,
            detail: "teapot".into(),
        };
        assert!(err.retryable());
        assert_eq!(err.upstream_status(), Some(418));
    }

    #[test]
    fn status_mapping_stays_in_contract() {
        let allowed = [400u16, 405, 408, 413, 429, 500, 502, 503, 504];
        let samples = vec![
            GatewayError::ApiKeyMissing(ModelType::OpenAi),
            GatewayError::Timeout {
                provider: None,
                detail: "t".into(),
            },
            GatewayError::ClientRateLimited,
            GatewayError::InvalidJson("x".into()),
            GatewayError::PayloadTooLarge,
            GatewayError::BudgetExceeded {
                estimated: 1.0,
                budget: 0.5,
            },
            GatewayError::NoModelsAvailable,
            GatewayError::Cancelled,
            GatewayError::Internal("boom".into()),
        ];
        for err in samples {
            assert!(
                allowed.contains(&err.http_status().as_u16()),
                "{:?} maps outside the contract",
                err
            );
        }
    }

    #[test]
    fn client_rate_limit_code() {
        assert_eq!(GatewayError::ClientRateLimited.code(), "RATE_LIMITED");
        assert_eq!(
            GatewayError::BudgetExceeded {
                estimated: 0.1,
                budget: 0.0
            }
            .code(),
            "BUDGET_EXCEEDED"
        );
    }
}
