//! Price catalog and cost estimation
//!
//! The catalog is a versioned, immutable snapshot mapping
//! `(provider, model_version)` to per-1k-token prices. The loader is
//! separate from the consumer so a future reload is a pure pointer swap.
//! Lookups of unknown pairs fail loudly; a price is never silently zero.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::gateway::error::GatewayError;
use crate::logger;

/// Output tokens assumed for an estimate when the caller does not say.
pub const DEFAULT_EXPECTED_OUTPUT_TOKENS: i64 = 100;

/// Per-1k-token prices for one model version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Versioned price document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceCatalog {
    pub version: String,
    pub last_updated: String,
    pub providers: HashMap<String, HashMap<String, ModelPrice>>,
}

/// A pre-call cost estimate with the unit prices that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub cost_usd: f64,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub input_tokens: i64,
    pub expected_output_tokens: i64,
}

/// Blended cost for a known token split.
pub fn cost_usd(
    input_tokens: i64,
    output_tokens: i64,
    input_per_1k: f64,
    output_per_1k: f64,
) -> f64 {
    (input_tokens as f64 / 1000.0) * input_per_1k
        + (output_tokens as f64 / 1000.0) * output_per_1k
}

impl PriceCatalog {
    /// Catalog shipped with the binary; used when no file is configured.
    pub fn builtin() -> Self {
        fn price(input: f64, output: f64) -> ModelPrice {
            ModelPrice {
                input_per_1k: input,
                output_per_1k: output,
            }
        }

        let mut providers: HashMap<String, HashMap<String, ModelPrice>> = HashMap::new();

        let mut openai = HashMap::new();
        openai.insert("gpt-3.5-turbo".into(), price(0.0005, 0.0015));
        openai.insert("gpt-4".into(), price(0.03, 0.06));
        openai.insert("gpt-4-turbo".into(), price(0.01, 0.03));
        openai.insert("gpt-4o".into(), price(0.005, 0.015));
        providers.insert("openai".into(), openai);

        let mut claude = HashMap::new();
        claude.insert("claude-3-sonnet".into(), price(0.003, 0.015));
        claude.insert("claude-3-opus".into(), price(0.015, 0.075));
        claude.insert("claude-3-haiku".into(), price(0.00025, 0.00125));
        claude.insert("claude-3-5-sonnet".into(), price(0.003, 0.015));
        providers.insert("claude".into(), claude);

        let mut mistral = HashMap::new();
        mistral.insert("mistral-medium".into(), price(0.0027, 0.0081));
        mistral.insert("mistral-small".into(), price(0.001, 0.003));
        mistral.insert("mistral-large".into(), price(0.004, 0.012));
        mistral.insert("open-mixtral-8x7b".into(), price(0.0007, 0.0007));
        providers.insert("mistral".into(), mistral);

        let mut gemini = HashMap::new();
        gemini.insert("gemini-pro".into(), price(0.000125, 0.000375));
        gemini.insert("gemini-1.5-pro".into(), price(0.00125, 0.00375));
        gemini.insert("gemini-1.5-flash".into(), price(0.000075, 0.0003));
        providers.insert("gemini".into(), gemini.clone());
        providers.insert("vertex_ai".into(), gemini);

        let mut bedrock = HashMap::new();
        bedrock.insert(
            "anthropic.claude-3-sonnet-20240229-v1:0".into(),
            price(0.003, 0.015),
        );
        bedrock.insert(
            "anthropic.claude-3-haiku-20240307-v1:0".into(),
            price(0.00025, 0.00125),
        );
        bedrock.insert(
            "anthropic.claude-3-opus-20240229-v1:0".into(),
            price(0.015, 0.075),
        );
        providers.insert("bedrock".into(), bedrock);

        Self {
            version: "builtin-1".to_string(),
            last_updated: "2024-06-01".to_string(),
            providers,
        }
    }

    /// Parse a catalog document from a JSON file.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read price catalog {}: {}", path, e))?;
        serde_json::from_str(&raw)
            .map_err(|e| format!("failed to parse price catalog {}: {}", path, e))
    }

    /// Load the configured catalog, falling back to the builtin one.
    pub fn load(settings: &Settings) -> Arc<Self> {
        let catalog = match settings.price_catalog_path.as_deref() {
            Some(path) => match Self::from_file(path) {
                Ok(catalog) => {
                    logger::info(
                        "pricing",
                        &format!("Loaded price catalog {} from {}", catalog.version, path),
                    );
                    catalog
                }
                Err(err) => {
                    logger::error("pricing", &err);
                    Self::builtin()
                }
            },
            None => Self::builtin(),
        };
        Arc::new(catalog)
    }

    /// Unit prices for a `(provider, version)` pair.
    pub fn lookup(&self, provider: &str, version: &str) -> Result<ModelPrice, GatewayError> {
        self.providers
            .get(provider)
            .and_then(|models| models.get(version))
            .copied()
            .ok_or_else(|| GatewayError::UnknownModelPrice {
                provider: provider.to_string(),
                version: version.to_string(),
            })
    }

    /// Pre-call cost bound for a prompt of `input_tokens`.
    pub fn estimate(
        &self,
        provider: &str,
        version: &str,
        input_tokens: i64,
        expected_output_tokens: Option<i64>,
    ) -> Result<CostEstimate, GatewayError> {
        let price = self.lookup(provider, version)?;
        let expected_output = expected_output_tokens.unwrap_or(DEFAULT_EXPECTED_OUTPUT_TOKENS);
        Ok(CostEstimate {
            cost_usd: cost_usd(
                input_tokens,
                expected_output,
                price.input_per_1k,
                price.output_per_1k,
            ),
            input_per_1k: price.input_per_1k,
            output_per_1k: price.output_per_1k,
            input_tokens,
            expected_output_tokens: expected_output,
        })
    }

    /// Actual cost from provider-reported token counts, when priced.
    pub fn actual_cost(
        &self,
        provider: &str,
        version: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Option<f64> {
        let price = self.lookup(provider, version).ok()?;
        Some(cost_usd(
            input_tokens,
            output_tokens,
            price.input_per_1k,
            price.output_per_1k,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_cost() {
        assert!((cost_usd(1000, 2000, 1.0, 2.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn lookup_known_pair() {
        let catalog = PriceCatalog::builtin();
        let price = catalog.lookup("claude", "claude-3-sonnet").unwrap();
        assert!((price.input_per_1k - 0.003).abs() < 1e-9);
    }

    #[test]
    fn unknown_pair_is_an_error_not_zero() {
        let catalog = PriceCatalog::builtin();
        let err = catalog.lookup("openai", "gpt-99").unwrap_err();
        match err {
            GatewayError::UnknownModelPrice { provider, version } => {
                assert_eq!(provider, "openai");
                assert_eq!(version, "gpt-99");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn estimate_defaults_expected_output() {
        let catalog = PriceCatalog::builtin();
        let est = catalog
            .estimate("claude", "claude-3-sonnet", 75, None)
            .unwrap();
        assert_eq!(est.expected_output_tokens, DEFAULT_EXPECTED_OUTPUT_TOKENS);
        let by_hand = cost_usd(75, 100, 0.003, 0.015);
        assert!((est.cost_usd - by_hand).abs() < 1e-12);
    }

    #[test]
    fn estimate_exceeds_tiny_budget() {
        // A ~300 char prompt against claude-3-sonnet costs well over $0.00001
        let catalog = PriceCatalog::builtin();
        let est = catalog
            .estimate("claude", "claude-3-sonnet", 75, None)
            .unwrap();
        assert!(est.cost_usd > 0.00001);
    }
}
