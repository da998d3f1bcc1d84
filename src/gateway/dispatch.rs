//! Provider dispatch
//!
//! `run_provider` wraps a single provider call in the retry engine.
//! `dispatch_parallel` fans one prompt out to a set of providers, each in
//! its own task with its own retry cycle, and collects results under a
//! dispatch-level deadline. Per-model failure never aborts siblings; the
//! result map always carries exactly one entry per requested model.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::gateway::context::RequestContext;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::retry::{self, RetryConfig};
use crate::gateway::types::{ParallelResponse, QueryRequest, QueryResult};
use crate::gateway::AppState;
use crate::providers::{self, ModelType};

/// Outcome of one provider dispatch, retries included.
pub(crate) struct ProviderAttempt {
    pub outcome: GatewayResult<QueryResult>,
    pub retries: u32,
    pub version: String,
}

/// Resolve the client for `model` and run the prompt through the retry
/// engine. Successful results come back with `num_retries` filled in.
pub(crate) async fn run_provider(
    state: &AppState,
    ctx: &RequestContext,
    model: ModelType,
    prompt: &str,
    requested_version: Option<&str>,
) -> ProviderAttempt {
    let client = providers::client_for(model, &state.settings, &state.keys);
    let version = client.resolve_version(requested_version);
    let config = RetryConfig::from_settings(&state.settings);

    let attempted = retry::run(ctx, &config, || {
        let client = client.clone();
        let ctx = ctx.clone();
        let prompt = prompt.to_string();
        let version = version.clone();
        async move { client.query(&ctx, &prompt, &version).await }
    })
    .await;

    let outcome = attempted.outcome.map(|mut result| {
        result.num_retries = attempted.retries;
        result
    });

    ProviderAttempt {
        outcome,
        retries: attempted.retries,
        version,
    }
}

/// Fan one query out to `models` concurrently and collect per-provider
/// results. Waits for all tasks or the parallel deadline, whichever comes
/// first; models still missing at the deadline are recorded with a timeout
/// error. Cancelling the parent context cancels every in-flight task.
pub async fn dispatch_parallel(
    state: &AppState,
    ctx: &RequestContext,
    req: &QueryRequest,
    models: &[ModelType],
) -> ParallelResponse {
    let start = Instant::now();

    let mut seen = HashSet::new();
    let targets: Vec<ModelType> = models
        .iter()
        .copied()
        .filter(|m| seen.insert(*m))
        .collect();

    let dispatch_ctx = ctx.child();
    let results: Arc<Mutex<HashMap<ModelType, QueryResult>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let mut handles = Vec::with_capacity(targets.len());
    for model in targets.iter().copied() {
        let child = dispatch_ctx.child();
        let state = state.clone();
        let prompt = req.query.clone();
        let version = req
            .model_versions
            .as_ref()
            .and_then(|versions| versions.get(&model))
            .cloned()
            .or_else(|| req.model_version.clone());
        let results = Arc::clone(&results);

        handles.push(tokio::spawn(async move {
            let task_start = Instant::now();
            let attempt = run_provider(&state, &child, model, &prompt, version.as_deref()).await;
            let result = match attempt.outcome {
                Ok(result) => result,
                Err(err) => QueryResult::from_error(
                    &err,
                    attempt.retries,
                    task_start.elapsed().as_millis() as u64,
                ),
            };
            results.lock().await.insert(model, result);
        }));
    }

    let deadline = Duration::from_secs(state.settings.parallel_timeout_secs);
    if tokio::time::timeout(deadline, futures_util::future::join_all(handles))
        .await
        .is_err()
    {
        dispatch_ctx.cancel();
    }

    let mut responses = {
        let mut guard = results.lock().await;
        std::mem::take(&mut *guard)
    };
    for model in &targets {
        responses.entry(*model).or_insert_with(|| {
            QueryResult::from_error(
                &GatewayError::Timeout {
                    provider: Some(*model),
                    detail: "parallel dispatch deadline exceeded".to_string(),
                },
                0,
                start.elapsed().as_millis() as u64,
            )
        });
    }

    ParallelResponse {
        request_id: ctx.request_id.clone(),
        elapsed_time_ms: start.elapsed().as_millis() as u64,
        responses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeyStore, Settings};
    use crate::gateway::routing::ModelRouter;

    fn test_state(keys: Vec<(ModelType, &str)>) -> AppState {
        let settings = Arc::new(Settings {
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            parallel_timeout_secs: 10,
            ..Settings::default()
        });
        let key_map = keys
            .into_iter()
            .map(|(m, k)| (m, k.to_string()))
            .collect();
        let keys = Arc::new(KeyStore::with_keys(key_map));
        let router = Arc::new(ModelRouter::pinned(
            Arc::clone(&settings),
            Arc::clone(&keys),
            HashMap::new(),
        ));
        AppState::assemble(settings, keys, router)
    }

    fn parallel_request(models: &[ModelType]) -> QueryRequest {
        QueryRequest {
            query: "x".to_string(),
            models: Some(models.to_vec()),
            ..QueryRequest::default()
        }
    }

    #[tokio::test]
    async fn one_entry_per_requested_model() {
        let state = test_state(vec![
            (ModelType::OpenAi, "test_openai"),
            (ModelType::Claude, "test_claude"),
        ]);
        let ctx = RequestContext::new(None, None, None);
        let models = [ModelType::OpenAi, ModelType::Claude, ModelType::Gemini];
        let req = parallel_request(&models);

        let response = dispatch_parallel(&state, &ctx, &req, &models).await;
        assert_eq!(response.responses.len(), 3);

        assert!(response.responses[&ModelType::OpenAi].error.is_none());
        assert!(response.responses[&ModelType::Claude].error.is_none());
        // Gemini has no key configured, so its slot carries the error
        let gemini = &response.responses[&ModelType::Gemini];
        assert_eq!(gemini.error.as_ref().unwrap().kind, "api_key_missing");
    }

    #[tokio::test]
    async fn duplicate_models_collapse() {
        let state = test_state(vec![(ModelType::OpenAi, "test_openai")]);
        let ctx = RequestContext::new(None, None, None);
        let models = [ModelType::OpenAi, ModelType::OpenAi];
        let req = parallel_request(&models);

        let response = dispatch_parallel(&state, &ctx, &req, &models).await;
        assert_eq!(response.responses.len(), 1);
    }

    #[tokio::test]
    async fn per_model_failure_does_not_abort_siblings() {
        let state = test_state(vec![(ModelType::Mistral, "test_mistral")]);
        let ctx = RequestContext::new(None, None, None);
        let models = [ModelType::Mistral, ModelType::Bedrock];
        let req = parallel_request(&models);

        let response = dispatch_parallel(&state, &ctx, &req, &models).await;
        assert!(response.responses[&ModelType::Mistral].error.is_none());
        assert!(response.responses[&ModelType::Bedrock].error.is_some());
    }
}
