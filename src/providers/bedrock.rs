//! AWS Bedrock adapter (Anthropic models)
//!
//! Invokes Anthropic models through the Bedrock runtime using the
//! messages body shape. Authentication sends the configured secret as a
//! Bearer token; real SigV4 signing is a deployment prerequisite, not
//! emulated here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::gateway::context::RequestContext;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::types::QueryResult;
use crate::providers::{
    self, Capabilities, ModelType, ProviderClient, DEFAULT_TEMPERATURE, LARGE_MAX_OUTPUT_TOKENS,
};

const ALLOWED_VERSIONS: &[&str] = &[
    "anthropic.claude-3-sonnet-20240229-v1:0",
    "anthropic.claude-3-haiku-20240307-v1:0",
    "anthropic.claude-3-opus-20240229-v1:0",
];
const DEFAULT_VERSION: &str = "anthropic.claude-3-sonnet-20240229-v1:0";
const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

#[derive(Clone)]
pub struct BedrockClient {
    settings: Arc<Settings>,
    key: Option<String>,
}

#[derive(Serialize)]
struct InvokeRequest<'a> {
    anthropic_version: &'a str,
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
struct InvokeResponse {
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

impl BedrockClient {
    pub fn new(settings: Arc<Settings>, key: Option<String>) -> Self {
        Self { settings, key }
    }

    fn invoke_url(&self, version: &str) -> String {
        format!(
            "{}/model/{}/invoke",
            self.settings.bedrock_base_url.trim_end_matches('/'),
            version
        )
    }

    fn catalog_url(&self) -> String {
        format!(
            "{}/foundation-models",
            self.settings.bedrock_control_base_url.trim_end_matches('/')
        )
    }
}

impl ProviderClient for BedrockClient {
    fn model_type(&self) -> ModelType {
        ModelType::Bedrock
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: false,
            supports_json_schema: false,
            max_tokens: LARGE_MAX_OUTPUT_TOKENS,
            supported_regions: &["us-east-1", "us-west-2", "eu-central-1", "ap-southeast-1"],
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
            return Err(GatewayError::ApiKeyMissing(ModelType::Bedrock));
        };
        if providers::is_test_key(&self.settings, key) {
            return Ok(
                providers::test_key_result(ModelType::Bedrock, prompt, version, start).await,
            );
        }
        // Both halves of the AWS credential pair must be present
        if self.settings.aws_access_key_id.is_none() {
            return Err(GatewayError::ApiKeyMissing(ModelType::Bedrock));
        }

        let body = InvokeRequest {
            anthropic_version: BEDROCK_ANTHROPIC_VERSION,
            max_tokens: LARGE_MAX_OUTPUT_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let send = providers::shared_client()
            .post(self.invoke_url(version))
            .bearer_auth(key)
            .json(&body)
            .timeout(Duration::from_secs(self.settings.http_timeout_secs))
            .send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            r = send => r.map_err(|e| providers::map_transport(ModelType::Bedrock, &e))?,
        };

        let status = response.status().as_u16();
        let text = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            t = response.text() => t.map_err(|e| providers::map_transport(ModelType::Bedrock, &e))?,
        };

        if !(200..300).contains(&status) {
            return Err(providers::map_status(ModelType::Bedrock, status, &text));
        }

        let parsed: InvokeResponse =
            serde_json::from_str(&text).map_err(|e| GatewayError::InvalidResponse {
                provider: ModelType::Bedrock,
                detail: format!("bedrock response failed to decode: {}", e),
            })?;

        let content = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(GatewayError::EmptyResponse {
                provider: ModelType::Bedrock,
                detail: "bedrock returned no candidate text".to_string(),
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
        if self.settings.aws_access_key_id.is_none() {
            return false;
        }
        match providers::probe_client()
            .get(self.catalog_url())
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
        let client = BedrockClient::new(Arc::new(Settings::default()), None);
        let ctx = RequestContext::new(None, None, None);
        let err = client.query(&ctx, "hi", DEFAULT_VERSION).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ApiKeyMissing(ModelType::Bedrock)
        ));
    }

    #[test]
    fn invoke_url_embeds_model_id() {
        let client = BedrockClient::new(Arc::new(Settings::default()), Some("k".into()));
        let url = client.invoke_url(DEFAULT_VERSION);
        assert!(url.ends_with(&format!("/model/{}/invoke", DEFAULT_VERSION)));
    }

    #[test]
    fn messages_body_decodes() {
        let parsed: InvokeResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"pong"}],
                "usage":{"input_tokens":4,"output_tokens":1}}"#,
        )
        .unwrap();
        assert_eq!(parsed.content[0].text.as_deref(), Some("pong"));
        assert_eq!(parsed.usage.unwrap().output_tokens, Some(1));
    }
}
