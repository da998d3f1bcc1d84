//! Gateway wire types
//!
//! Request and response structures shared by the HTTP handlers, the cache
//! and the dispatcher.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::error::GatewayError;
use crate::providers::ModelType;

/// Semantic category used to pick a default provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TextGeneration,
    Summarization,
    SentimentAnalysis,
    QuestionAnswering,
    Other,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TextGeneration => "text_generation",
            TaskType::Summarization => "summarization",
            TaskType::SentimentAnalysis => "sentiment_analysis",
            TaskType::QuestionAnswering => "question_answering",
            TaskType::Other => "other",
        }
    }
}

/// Incoming query, shared by the v0 and gateway endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub query: String,
    pub model: Option<ModelType>,
    pub model_version: Option<String>,
    pub task_type: Option<TaskType>,
    pub request_id: Option<String>,
    /// Fan-out target set for the parallel endpoint.
    pub models: Option<Vec<ModelType>>,
    /// Per-model version overrides for the parallel endpoint.
    pub model_versions: Option<HashMap<ModelType, String>>,
    pub max_cost_usd: Option<f64>,
    pub dry_run: bool,
    pub tenant: Option<String>,
}

/// Error details embedded in a per-provider result.
#[derive(Debug, Clone, Serialize)]
pub struct QueryFault {
    pub kind: String,
    pub message: String,
}

impl QueryFault {
    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of a single provider call.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub response: String,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub num_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryFault>,
}

impl QueryResult {
    /// Error-bearing result for a provider that never produced text.
    pub fn from_error(err: &GatewayError, num_retries: u32, response_time_ms: u64) -> Self {
        Self {
            response: String::new(),
            response_time_ms,
            status_code: err.upstream_status().unwrap_or(0),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            num_retries,
            error: Some(QueryFault::from_error(err)),
        }
    }
}

/// Normalized external response for single-model queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub response: String,
    pub model: ModelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub num_retries: u32,
    pub request_id: String,
    /// Set only when the router fell back from the requested model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_model: Option<ModelType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Collected fan-out results, one entry per requested model.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelResponse {
    pub request_id: String,
    pub elapsed_time_ms: u64,
    pub responses: HashMap<ModelType, QueryResult>,
}

/// Request body for `/v1/gateway/cost-estimate`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CostEstimateRequest {
    pub model: Option<ModelType>,
    pub model_version: Option<String>,
    pub query: Option<String>,
    pub input_tokens: Option<i64>,
    pub expected_output_tokens: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_request_deserializes_wire_tags() {
        let req: QueryRequest = serde_json::from_str(
            r#"{"query":"hi","model":"vertex_ai","task_type":"text_generation"}"#,
        )
        .unwrap();
        assert_eq!(req.model, Some(ModelType::VertexAi));
        assert_eq!(req.task_type, Some(TaskType::TextGeneration));
        assert_eq!(req.tenant, None);
        assert!(!req.dry_run);
    }

    #[test]
    fn unknown_model_tag_is_rejected() {
        let res = serde_json::from_str::<QueryRequest>(r#"{"query":"hi","model":"palm"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn parallel_map_keys_serialize_as_tags() {
        let mut responses = HashMap::new();
        responses.insert(
            ModelType::OpenAi,
            QueryResult {
                response: "hi".into(),
                response_time_ms: 5,
                status_code: 200,
                input_tokens: 3,
                output_tokens: 1,
                total_tokens: 4,
                num_retries: 0,
                error: None,
            },
        );
        let parallel = ParallelResponse {
            request_id: "r".into(),
            elapsed_time_ms: 6,
            responses,
        };
        let json = serde_json::to_value(&parallel).unwrap();
        assert_eq!(json["responses"]["openai"]["total_tokens"], 4);
    }

    #[test]
    fn successful_result_totals_add_up() {
        let result = QueryResult {
            response: "ok".into(),
            response_time_ms: 1,
            status_code: 200,
            input_tokens: 10,
            output_tokens: 7,
            total_tokens: 17,
            num_retries: 0,
            error: None,
        };
        assert_eq!(result.total_tokens, result.input_tokens + result.output_tokens);
    }
}
