//! Mistral adapter
//!
//! Mistral's chat API is OpenAI-shaped; only the host, the allowlist and
//! the auth header source differ.

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
    "mistral-medium",
    "mistral-small",
    "mistral-large",
    "open-mixtral-8x7b",
];
const DEFAULT_VERSION: &str = "mistral-medium";

#[derive(Clone)]
pub struct MistralClient {
    settings: Arc<Settings>,
    key: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
}

impl MistralClient {
    pub fn new(settings: Arc<Settings>, key: Option<String>) -> Self {
        Self { settings, key }
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.mistral_base_url.trim_end_matches('/')
        )
    }

    fn models_url(&self) -> String {
        format!(
            "{}/v1/models",
            self.settings.mistral_base_url.trim_end_matches('/')
        )
    }
}

impl ProviderClient for MistralClient {
    fn model_type(&self) -> ModelType {
        ModelType::Mistral
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
            return Err(GatewayError::ApiKeyMissing(ModelType::Mistral));
        };
        if providers::is_test_key(&self.settings, key) {
            return Ok(
                providers::test_key_result(ModelType::Mistral, prompt, version, start).await,
            );
        }

        let body = ChatRequest {
            model: version,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        };

        let send = providers::shared_client()
            .post(self.chat_url())
            .bearer_auth(key)
            .json(&body)
            .timeout(Duration::from_secs(self.settings.http_timeout_secs))
            .send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            r = send => r.map_err(|e| providers::map_transport(ModelType::Mistral, &e))?,
        };

        let status = response.status().as_u16();
        let text = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            t = response.text() => t.map_err(|e| providers::map_transport(ModelType::Mistral, &e))?,
        };

        if !(200..300).contains(&status) {
            return Err(providers::map_status(ModelType::Mistral, status, &text));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| GatewayError::InvalidResponse {
                provider: ModelType::Mistral,
                detail: format!("mistral response failed to decode: {}", e),
            })?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::EmptyResponse {
                provider: ModelType::Mistral,
                detail: "mistral returned no candidate text".to_string(),
            })?;

        let (input_tokens, output_tokens, total_tokens) = providers::reconcile_tokens(
            prompt,
            &content,
            parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
            parsed.usage.as_ref().and_then(|u| u.completion_tokens),
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
            .bearer_auth(key)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_refuses_without_network() {
        let client = MistralClient::new(Arc::new(Settings::default()), None);
        let ctx = RequestContext::new(None, None, None);
        let err = client.query(&ctx, "hi", DEFAULT_VERSION).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ApiKeyMissing(ModelType::Mistral)
        ));
    }

    #[test]
    fn unknown_version_maps_to_default() {
        let client = MistralClient::new(Arc::new(Settings::default()), Some("test_k".into()));
        assert_eq!(client.resolve_version(Some("mistral-tiny")), DEFAULT_VERSION);
        assert_eq!(client.resolve_version(Some("mistral-large")), "mistral-large");
    }
}
