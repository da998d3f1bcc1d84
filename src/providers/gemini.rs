//! Google Gemini (Generative Language API) adapter

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

const ALLOWED_VERSIONS: &[&str] = &["gemini-pro", "gemini-1.5-pro", "gemini-1.5-flash"];
const DEFAULT_VERSION: &str = "gemini-pro";

#[derive(Clone)]
pub struct GeminiClient {
    settings: Arc<Settings>,
    key: Option<String>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<CandidatePart>>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<i64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<i64>,
}

impl GeminiClient {
    pub fn new(settings: Arc<Settings>, key: Option<String>) -> Self {
        Self { settings, key }
    }

    fn generate_url(&self, version: &str, key: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.settings.gemini_base_url.trim_end_matches('/'),
            version,
            key
        )
    }

    fn models_url(&self, key: &str) -> String {
        format!(
            "{}/v1beta/models?key={}",
            self.settings.gemini_base_url.trim_end_matches('/'),
            key
        )
    }
}

impl ProviderClient for GeminiClient {
    fn model_type(&self) -> ModelType {
        ModelType::Gemini
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: true,
            supports_json_schema: true,
            max_tokens: 8192,
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
            return Err(GatewayError::ApiKeyMissing(ModelType::Gemini));
        };
        if providers::is_test_key(&self.settings, key) {
            return Ok(providers::test_key_result(ModelType::Gemini, prompt, version, start).await);
        }

        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: DEFAULT_TEMPERATURE,
                max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            },
        };

        let send = providers::shared_client()
            .post(self.generate_url(version, key))
            .json(&body)
            .timeout(Duration::from_secs(self.settings.http_timeout_secs))
            .send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            r = send => r.map_err(|e| providers::map_transport(ModelType::Gemini, &e))?,
        };

        let status = response.status().as_u16();
        let text = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            t = response.text() => t.map_err(|e| providers::map_transport(ModelType::Gemini, &e))?,
        };

        if !(200..300).contains(&status) {
            return Err(providers::map_status(ModelType::Gemini, status, &text));
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| GatewayError::InvalidResponse {
                provider: ModelType::Gemini,
                detail: format!("gemini response failed to decode: {}", e),
            })?;

        let content = parsed
            .candidates
            .as_deref()
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.content.as_ref())
            .and_then(|content| content.parts.as_deref())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::EmptyResponse {
                provider: ModelType::Gemini,
                detail: "gemini returned no candidate text".to_string(),
            })?;

        let (input_tokens, output_tokens, total_tokens) = providers::reconcile_tokens(
            prompt,
            &content,
            parsed
                .usage_metadata
                .as_ref()
                .and_then(|u| u.prompt_token_count),
            parsed
                .usage_metadata
                .as_ref()
                .and_then(|u| u.candidates_token_count),
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
            .get(self.models_url(key))
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
        let client = GeminiClient::new(Arc::new(Settings::default()), None);
        let ctx = RequestContext::new(None, None, None);
        let err = client.query(&ctx, "hi", DEFAULT_VERSION).await.unwrap_err();
        assert!(matches!(err, GatewayError::ApiKeyMissing(ModelType::Gemini)));
    }

    #[test]
    fn candidate_parts_concatenate() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]}}],
                "usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":1,"totalTokenCount":3}}"#,
        )
        .unwrap();
        let joined = parsed.candidates.unwrap()[0]
            .content
            .as_ref()
            .unwrap()
            .parts
            .as_ref()
            .unwrap()
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        assert_eq!(joined, "Hello");
    }

    #[test]
    fn empty_candidates_decode_cleanly() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(parsed.candidates.unwrap().is_empty());
    }
}
