//! Provider clients
//!
//! One adapter per upstream vendor behind a common contract: translate a
//! uniform `(prompt, version)` call into the vendor's HTTP exchange, map
//! its failures into the gateway taxonomy, and normalize token accounting.
//! Dispatch is a closed enum resolved by the factory at the composition
//! root; clients never know about each other.

pub mod bedrock;
pub mod claude;
pub mod gemini;
pub mod mistral;
pub mod openai;
pub mod vertex;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::config::{KeyStore, Settings};
use crate::gateway::context::{estimate_tokens, RequestContext};
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::types::QueryResult;

/// Default sampling temperature sent to every provider.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Output cap for the chat-style providers.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 150;
/// Output cap for Bedrock and Vertex, which serve longer completions.
pub const LARGE_MAX_OUTPUT_TOKENS: u32 = 1024;

/// Stable wire tag for each supported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "mistral")]
    Mistral,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "vertex_ai")]
    VertexAi,
    #[serde(rename = "bedrock")]
    Bedrock,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::OpenAi => "openai",
            ModelType::Gemini => "gemini",
            ModelType::Mistral => "mistral",
            ModelType::Claude => "claude",
            ModelType::VertexAi => "vertex_ai",
            ModelType::Bedrock => "bedrock",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(ModelType::OpenAi),
            "gemini" => Some(ModelType::Gemini),
            "mistral" => Some(ModelType::Mistral),
            "claude" => Some(ModelType::Claude),
            "vertex_ai" => Some(ModelType::VertexAi),
            "bedrock" => Some(ModelType::Bedrock),
            _ => None,
        }
    }

    pub fn all() -> [ModelType; 6] {
        [
            ModelType::OpenAi,
            ModelType::Gemini,
            ModelType::Mistral,
            ModelType::Claude,
            ModelType::VertexAi,
            ModelType::Bedrock,
        ]
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a provider supports, for callers that branch on features.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub supports_streaming: bool,
    pub supports_json_schema: bool,
    pub max_tokens: u32,
    pub supported_regions: &'static [&'static str],
}

// ============================================
// Shared HTTP clients
// ============================================

/// Process-wide pooled HTTP client for provider calls. Built once; never
/// constructed per request.
pub fn shared_client() -> &'static reqwest::Client {
    static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
        let settings = crate::config::settings();
        reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(settings.http_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(settings.http_idle_timeout_secs))
            .build()
            .unwrap_or_default()
    });
    &CLIENT
}

/// Short-timeout client for availability probes.
pub fn probe_client() -> &'static reqwest::Client {
    static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default()
    });
    &CLIENT
}

// ============================================
// Client contract
// ============================================

/// Uniform contract implemented by every vendor adapter.
pub trait ProviderClient: Send + Sync {
    fn model_type(&self) -> ModelType;

    fn capabilities(&self) -> Capabilities;

    /// Documented default model version for this provider.
    fn default_version(&self) -> &'static str;

    /// Versions accepted without being replaced by the default.
    fn allowed_versions(&self) -> &'static [&'static str];

    /// Resolve a requested version against the allowlist; empty or
    /// unrecognized versions map to the default.
    fn resolve_version(&self, requested: Option<&str>) -> String {
        match requested {
            Some(v) if self.allowed_versions().contains(&v) => v.to_string(),
            _ => self.default_version().to_string(),
        }
    }

    /// Run one prompt against the upstream. Never retries by itself;
    /// `num_retries` is filled in by the retry engine.
    fn query(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        version: &str,
    ) -> impl Future<Output = GatewayResult<QueryResult>> + Send;

    /// Cheap liveness probe; any 2xx from the vendor's catalog endpoint
    /// counts as available.
    fn check_availability(&self) -> impl Future<Output = bool> + Send;
}

/// Closed dispatch over the vendor adapters.
#[derive(Clone)]
pub enum Client {
    OpenAi(openai::OpenAiClient),
    Gemini(gemini::GeminiClient),
    Mistral(mistral::MistralClient),
    Claude(claude::ClaudeClient),
    VertexAi(vertex::VertexAiClient),
    Bedrock(bedrock::BedrockClient),
}

impl Client {
    pub fn model_type(&self) -> ModelType {
        match self {
            Client::OpenAi(c) => c.model_type(),
            Client::Gemini(c) => c.model_type(),
            Client::Mistral(c) => c.model_type(),
            Client::Claude(c) => c.model_type(),
            Client::VertexAi(c) => c.model_type(),
            Client::Bedrock(c) => c.model_type(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Client::OpenAi(c) => c.capabilities(),
            Client::Gemini(c) => c.capabilities(),
            Client::Mistral(c) => c.capabilities(),
            Client::Claude(c) => c.capabilities(),
            Client::VertexAi(c) => c.capabilities(),
            Client::Bedrock(c) => c.capabilities(),
        }
    }

    pub fn resolve_version(&self, requested: Option<&str>) -> String {
        match self {
            Client::OpenAi(c) => c.resolve_version(requested),
            Client::Gemini(c) => c.resolve_version(requested),
            Client::Mistral(c) => c.resolve_version(requested),
            Client::Claude(c) => c.resolve_version(requested),
            Client::VertexAi(c) => c.resolve_version(requested),
            Client::Bedrock(c) => c.resolve_version(requested),
        }
    }

    pub async fn query(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        version: &str,
    ) -> GatewayResult<QueryResult> {
        match self {
            Client::OpenAi(c) => c.query(ctx, prompt, version).await,
            Client::Gemini(c) => c.query(ctx, prompt, version).await,
            Client::Mistral(c) => c.query(ctx, prompt, version).await,
            Client::Claude(c) => c.query(ctx, prompt, version).await,
            Client::VertexAi(c) => c.query(ctx, prompt, version).await,
            Client::Bedrock(c) => c.query(ctx, prompt, version).await,
        }
    }

    pub async fn check_availability(&self) -> bool {
        match self {
            Client::OpenAi(c) => c.check_availability().await,
            Client::Gemini(c) => c.check_availability().await,
            Client::Mistral(c) => c.check_availability().await,
            Client::Claude(c) => c.check_availability().await,
            Client::VertexAi(c) => c.check_availability().await,
            Client::Bedrock(c) => c.check_availability().await,
        }
    }
}

/// Factory: resolve the adapter for a model tag.
pub fn client_for(model: ModelType, settings: &Arc<Settings>, keys: &Arc<KeyStore>) -> Client {
    let key = keys.api_key(model);
    match model {
        ModelType::OpenAi => Client::OpenAi(openai::OpenAiClient::new(Arc::clone(settings), key)),
        ModelType::Gemini => Client::Gemini(gemini::GeminiClient::new(Arc::clone(settings), key)),
        ModelType::Mistral => {
            Client::Mistral(mistral::MistralClient::new(Arc::clone(settings), key))
        }
        ModelType::Claude => Client::Claude(claude::ClaudeClient::new(Arc::clone(settings), key)),
        ModelType::VertexAi => {
            Client::VertexAi(vertex::VertexAiClient::new(Arc::clone(settings), key))
        }
        ModelType::Bedrock => {
            Client::Bedrock(bedrock::BedrockClient::new(Arc::clone(settings), key))
        }
    }
}

// ============================================
// Shared adapter helpers
// ============================================

/// Whether a credential triggers the offline short-circuit.
pub(crate) fn is_test_key(settings: &Settings, key: &str) -> bool {
    settings.allow_test_keys && key.starts_with("test_")
}

/// Deterministic synthetic result for `test_` credentials: short sleep, no
/// network. Offline demos and the test suite depend on this behavior.
pub(crate) async fn test_key_result(
    model: ModelType,
    prompt: &str,
    version: &str,
    start: Instant,
) -> QueryResult {
    tokio::time::sleep(Duration::from_millis(25)).await;
    let response = format!(
        "This is a canned {} response generated for offline use ({}).",
        model.as_str(),
        version
    );
    let input_tokens = estimate_tokens(prompt);
    let output_tokens = estimate_tokens(&response);
    QueryResult {
        response,
        response_time_ms: start.elapsed().as_millis() as u64,
        status_code: 200,
        input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
        num_retries: 0,
        error: None,
    }
}

fn truncate_detail(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(500) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Map an upstream HTTP status into the error taxonomy.
pub(crate) fn map_status(provider: ModelType, status: u16, body: &str) -> GatewayError {
    match status {
        429 => GatewayError::RateLimit {
            provider,
            detail: format!("{} returned 429: {}", provider, truncate_detail(body)),
        },
        s if s >= 500 => GatewayError::Unavailable {
            provider: Some(provider),
            detail: format!("{} returned {}: {}", provider, s, truncate_detail(body)),
        },
        s => GatewayError::Upstream {
            provider,
            code: s,
            retryable: false,
            detail: format!("{} returned {}: {}", provider, s, truncate_detail(body)),
        },
    }
}

/// Map a transport-level failure into the error taxonomy.
pub(crate) fn map_transport(provider: ModelType, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout {
            provider: Some(provider),
            detail: format!("{} request timed out", provider),
        }
    } else if err.is_connect() {
        GatewayError::Unavailable {
            provider: Some(provider),
            detail: format!("{} unreachable: {}", provider, err),
        }
    } else {
        GatewayError::Unavailable {
            provider: Some(provider),
            detail: format!("{} transport error: {}", provider, err),
        }
    }
}

/// Fill token counts with the estimator when the provider omitted them and
/// keep the total consistent.
pub(crate) fn reconcile_tokens(
    prompt: &str,
    response: &str,
    input: Option<i64>,
    output: Option<i64>,
) -> (i64, i64, i64) {
    let input_tokens = input.unwrap_or_else(|| estimate_tokens(prompt));
    let output_tokens = output.unwrap_or_else(|| estimate_tokens(response));
    (input_tokens, output_tokens, input_tokens + output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_round_trip() {
        for model in ModelType::all() {
            assert_eq!(ModelType::from_str(model.as_str()), Some(model));
            let json = serde_json::to_string(&model).unwrap();
            assert_eq!(json, format!("\"{}\"", model.as_str()));
        }
        assert_eq!(ModelType::from_str("palm"), None);
    }

    #[test]
    fn status_mapping_follows_contract() {
        let err = map_status(ModelType::OpenAi, 429, "slow down");
        assert_eq!(err.kind(), "rate_limit");
        assert!(err.retryable());

        let err = map_status(ModelType::OpenAi, 503, "down");
        assert_eq!(err.kind(), "unavailable");
        assert!(err.retryable());

        let err = map_status(ModelType::OpenAi, 400, "bad prompt");
        assert!(!err.retryable());
        assert_eq!(err.upstream_status(), Some(400));
    }

    #[test]
    fn version_resolution_uses_allowlist() {
        let settings = Arc::new(Settings::default());
        let client = openai::OpenAiClient::new(settings, Some("test_key".into()));
        assert_eq!(client.resolve_version(Some("gpt-4")), "gpt-4");
        assert_eq!(client.resolve_version(Some("gpt-99")), "gpt-3.5-turbo");
        assert_eq!(client.resolve_version(None), "gpt-3.5-turbo");
        assert_eq!(client.resolve_version(Some("")), "gpt-3.5-turbo");
    }

    #[test]
    fn test_key_detection_honors_flag() {
        let mut settings = Settings::default();
        assert!(is_test_key(&settings, "test_abc"));
        assert!(!is_test_key(&settings, "sk-abc"));
        settings.allow_test_keys = false;
        assert!(!is_test_key(&settings, "test_abc"));
    }

    #[tokio::test]
    async fn synthetic_result_is_deterministic() {
        let a = test_key_result(ModelType::Claude, "hello", "claude-3-sonnet", Instant::now())
            .await;
        let b = test_key_result(ModelType::Claude, "hello", "claude-3-sonnet", Instant::now())
            .await;
        assert_eq!(a.response, b.response);
        assert_eq!(a.status_code, 200);
        assert_eq!(a.total_tokens, a.input_tokens + a.output_tokens);
        assert!(a.error.is_none());
    }

    #[test]
    fn token_reconciliation_prefers_reported_counts() {
        let (input, output, total) = reconcile_tokens("abcd", "efgh", Some(10), Some(5));
        assert_eq!((input, output, total), (10, 5, 15));

        let (input, output, total) = reconcile_tokens("abcd", "efghefgh", None, None);
        assert_eq!((input, output, total), (1, 2, 3));
    }
}
