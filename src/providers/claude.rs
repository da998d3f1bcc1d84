//! Anthropic Claude messages adapter

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::gateway::context::RequestContext;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::types::QueryResult;
use crate::providers::{
    self, Capabilities, ModelType, ProviderClient, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_TEMPERATURE,
};

const ALLOWED_VERSIONS: &[&str] = &[
    "claude-3-sonnet",
    "claude-3-opus",
    "claude-3-haiku",
    "claude-3-5-sonnet",
];
const DEFAULT_VERSION: &str = "claude-3-sonnet";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct ClaudeClient {
    settings: Arc<Settings>,
    key: Option<String>,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
}

impl ClaudeClient {
    pub fn new(settings: Arc<Settings>, key: Option<String>) -> Self {
        Self { settings, key }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/v1/messages",
            self.settings.claude_base_url.trim_end_matches('/')
        )
    }

    fn models_url(&self) -> String {
        format!(
            "{}/v1/models",
            self.settings.claude_base_url.trim_end_matches('/')
        )
    }
}

impl ProviderClient for ClaudeClient {
    fn model_type(&self) -> ModelType {
        ModelType::Claude
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: true,
            supports_json_schema: false,
            max_tokens: 4096,
            supported_regions: &["global"],
        }
    }

    fn default_version(&self) -> &'static str {
        DEFAULT_VERSION
    }

    fn allowed_versions(&self) -> &'static [&'static str] {
        ALLOWED_VERSIONS
    }

    async fn query(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        version: &str,
    ) -> GatewayResult<QueryResult> {
        let start = Instant::now();
        let Some(key) = self.key.as_deref() else {
            return Err(GatewayError::ApiKeyMissing(ModelType::Claude));
        };
        if providers::is_test_key(&self.settings, key) {
            return Ok(providers::test_key_result(ModelType::Claude, prompt, version, start).await);
        }

        let body = MessagesRequest {
            model: version,
            max_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let send = providers::shared_client()
            .post(self.messages_url())
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .timeout(Duration::from_secs(self.settings.http_timeout_secs))
            .send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            r = send => r.map_err(|e| providers::map_transport(ModelType::Claude, &e))?,
        };

        let status = response.status().as_u16();
        let text = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            t = response.text() => t.map_err(|e| providers::map_transport(ModelType::Claude, &e))?,
        };

        if !(200..300).contains(&status) {
            return Err(providers::map_status(ModelType::Claude, status, &text));
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| GatewayError::InvalidResponse {
                provider: ModelType::Claude,
                detail: format!("claude response failed to decode: {}", e),
            })?;

        let content = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(GatewayError::EmptyResponse {
                provider: ModelType::Claude,
                detail: "claude returned no candidate text".to_string(),
            });
        }

        let (input_tokens, output_tokens, total_tokens) = providers::reconcile_tokens(
            prompt,
            &content,
            parsed.usage.as_ref().and_then(|u| u.input_tokens),
            parsed.usage.as_ref().and_then(|u| u.output_tokens),
        );

        Ok(QueryResult {
            response: content,
            response_time_ms: start.elapsed().as_millis() as u64,
            status_code: status,
            input_tokens,
            output_tokens,
            total_tokens,
            num_retries: 0,
            error: None,
        })
    }

    async fn check_availability(&self) -> bool {
        let Some(key) = self.key.as_deref() else {
            return false;
        };
        if providers::is_test_key(&self.settings, key) {
            return true;
        }
        match providers::probe_client()
            .get(self.models_url())
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
