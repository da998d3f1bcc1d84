//! Request validation
//!
//! Field-level checks performed after decode and before any work is done.
//! Length bounds differ per endpoint: the legacy surface accepts shorter
//! prompts than the versioned gateway surface.

use uuid::Uuid;

use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::types::QueryRequest;

/// Query length bound for the legacy `/api/*` endpoints.
pub const MAX_QUERY_CHARS_V0: usize = 32_000;
/// Query length bound for the `/v1/gateway/*` endpoints.
pub const MAX_QUERY_CHARS_GATEWAY: usize = 100_000;

/// Validate the common request fields against an endpoint's length bound.
pub fn validate_query(req: &QueryRequest, max_chars: usize) -> GatewayResult<()> {
    if req.query.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "query must not be empty".to_string(),
        ));
    }
    let chars = req.query.chars().count();
    if chars > max_chars {
        return Err(GatewayError::InvalidRequest(format!(
            "query length {} exceeds the {} character limit",
            chars, max_chars
        )));
    }
    if let Some(cost) = req.max_cost_usd {
        if !cost.is_finite() || cost < 0.0 {
            return Err(GatewayError::InvalidRequest(
                "max_cost_usd must be a non-negative number".to_string(),
            ));
        }
    }
    if let Some(id) = req.request_id.as_deref() {
        if Uuid::parse_str(id).is_err() {
            return Err(GatewayError::InvalidRequest(
                "request_id must be a UUID".to_string(),
            ));
        }
    }
    Ok(())
}

/// Additional checks for the parallel endpoint: a non-empty target set.
pub fn validate_parallel(req: &QueryRequest) -> GatewayResult<()> {
    match req.models.as_deref() {
        Some(models) if !models.is_empty() => Ok(()),
        _ => Err(GatewayError::InvalidRequest(
            "models must name at least one provider".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ModelType;

    fn base_request(query: &str) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            ..QueryRequest::default()
        }
    }

    #[test]
    fn empty_query_is_rejected() {
        let err = validate_query(&base_request(""), MAX_QUERY_CHARS_V0).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn length_bounds_differ_per_endpoint() {
        let long = base_request(&"x".repeat(50_000));
        assert!(validate_query(&long, MAX_QUERY_CHARS_V0).is_err());
        assert!(validate_query(&long, MAX_QUERY_CHARS_GATEWAY).is_ok());
    }

    #[test]
    fn negative_budget_is_rejected() {
        let mut req = base_request("q");
        req.max_cost_usd = Some(-0.01);
        assert!(validate_query(&req, MAX_QUERY_CHARS_V0).is_err());

        req.max_cost_usd = Some(0.0);
        assert!(validate_query(&req, MAX_QUERY_CHARS_V0).is_ok());
    }

    #[test]
    fn request_id_must_be_a_uuid() {
        let mut req = base_request("q");
        req.request_id = Some("not-a-uuid".to_string());
        assert!(validate_query(&req, MAX_QUERY_CHARS_V0).is_err());

        req.request_id = Some("2b1c8f1e-92ab-4f3f-8a63-0f4b8f0f9d11".to_string());
        assert!(validate_query(&req, MAX_QUERY_CHARS_V0).is_ok());
    }

    #[test]
    fn parallel_requires_models() {
        let mut req = base_request("q");
        assert!(validate_parallel(&req).is_err());
        req.models = Some(vec![]);
        assert!(validate_parallel(&req).is_err());
        req.models = Some(vec![ModelType::OpenAi]);
        assert!(validate_parallel(&req).is_ok());
    }
}
