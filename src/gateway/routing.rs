//! Model routing
//!
//! Tracks provider availability behind a TTL and picks a model for each
//! request: explicit preference first, then the task-type default, then a
//! uniformly random available model. On a retryable failure the router
//! offers exactly one alternative, never the model that just failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::json;

use crate::config::{KeyStore, Settings};
use crate::gateway::context::RequestContext;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::types::{QueryRequest, TaskType};
use crate::logger;
use crate::providers::{self, ModelType};

/// Default provider for each task category.
pub fn default_model_for_task(task: TaskType) -> Option<ModelType> {
    match task {
        TaskType::TextGeneration => Some(ModelType::OpenAi),
        TaskType::Summarization => Some(ModelType::Claude),
        TaskType::SentimentAnalysis => Some(ModelType::Gemini),
        TaskType::QuestionAnswering => Some(ModelType::Mistral),
        TaskType::Other => None,
    }
}

struct AvailabilityState {
    available: HashMap<ModelType, bool>,
    last_updated: Option<Instant>,
}

pub struct ModelRouter {
    settings: Arc<Settings>,
    keys: Arc<KeyStore>,
    state: RwLock<AvailabilityState>,
    /// Serializes refreshes so concurrent stale readers probe once.
    refresh_gate: tokio::sync::Mutex<()>,
    ttl: Duration,
    probing: AtomicBool,
    rng: Mutex<StdRng>,
}

impl ModelRouter {
    pub fn new(settings: Arc<Settings>, keys: Arc<KeyStore>) -> Self {
        let ttl = Duration::from_secs(settings.availability_ttl_secs);
        Self {
            settings,
            keys,
            state: RwLock::new(AvailabilityState {
                available: HashMap::new(),
                last_updated: None,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
            ttl,
            probing: AtomicBool::new(true),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Router with fixed availability and probing disabled. For tests.
    pub fn pinned(
        settings: Arc<Settings>,
        keys: Arc<KeyStore>,
        available: HashMap<ModelType, bool>,
    ) -> Self {
        let router = Self::new(settings, keys);
        router.pin_availability(available);
        router
    }

    /// Overwrite the availability map and stop probing.
    pub fn pin_availability(&self, available: HashMap<ModelType, bool>) {
        self.probing.store(false, Ordering::SeqCst);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.available = available;
        state.last_updated = Some(Instant::now());
    }

    /// Current availability snapshot, refreshed first if the TTL expired.
    pub async fn availability(&self) -> HashMap<ModelType, bool> {
        self.ensure_fresh().await;
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .available
            .clone()
    }

    fn is_stale(&self) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        match state.last_updated {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// Probe all providers when the snapshot is stale. Probes run without
    /// any lock into a local map; the shared map is swapped atomically
    /// under the write lock.
    async fn ensure_fresh(&self) {
        if !self.probing.load(Ordering::SeqCst) || !self.is_stale() {
            return;
        }

        let _gate = self.refresh_gate.lock().await;
        if !self.is_stale() {
            return;
        }

        let probes = ModelType::all().map(|model| {
            let client = providers::client_for(model, &self.settings, &self.keys);
            async move { (model, client.check_availability().await) }
        });
        let results = futures_util::future::join_all(probes).await;

        let fresh: HashMap<ModelType, bool> = results.into_iter().collect();
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.available = fresh.clone();
            state.last_updated = Some(Instant::now());
        }

        logger::event(
            "router_activity",
            json!({
                "action": "availability_refreshed",
                "available": fresh
                    .iter()
                    .filter(|(_, &up)| up)
                    .map(|(m, _)| m.as_str())
                    .collect::<Vec<_>>(),
            }),
        );
    }

    fn available_models(map: &HashMap<ModelType, bool>) -> Vec<ModelType> {
        let mut models: Vec<ModelType> = map
            .iter()
            .filter(|(_, &up)| up)
            .map(|(&model, _)| model)
            .collect();
        models.sort_by_key(|m| m.as_str());
        models
    }

    fn pick_random(&self, candidates: &[ModelType]) -> Option<ModelType> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        candidates.choose(&mut *rng).copied()
    }

    /// Select a model for a request.
    pub async fn route_request(
        &self,
        ctx: &RequestContext,
        req: &QueryRequest,
    ) -> GatewayResult<ModelType> {
        if ctx.is_cancelled() {
            return Err(ctx.cancellation_error());
        }

        let availability = self.availability().await;

        if let Some(preferred) = req.model {
            if availability.get(&preferred).copied().unwrap_or(false) {
                logger::event(
                    "router_activity",
                    json!({
                        "action": "route_selected",
                        "request_id": ctx.request_id,
                        "model": preferred.as_str(),
                        "reason": "user_preference",
                    }),
                );
                return Ok(preferred);
            }
            logger::event(
                "router_activity",
                json!({
                    "action": "user_preference_unavailable",
                    "request_id": ctx.request_id,
                    "model": preferred.as_str(),
                }),
            );
        }

        if let Some(task) = req.task_type {
            if let Some(candidate) = default_model_for_task(task) {
                if availability.get(&candidate).copied().unwrap_or(false) {
                    logger::event(
                        "router_activity",
                        json!({
                            "action": "route_selected",
                            "request_id": ctx.request_id,
                            "model": candidate.as_str(),
                            "reason": "task_type",
                            "task_type": task.as_str(),
                        }),
                    );
                    return Ok(candidate);
                }
            }
        }

        let candidates = Self::available_models(&availability);
        match self.pick_random(&candidates) {
            Some(model) => {
                logger::event(
                    "router_activity",
                    json!({
                        "action": "route_selected",
                        "request_id": ctx.request_id,
                        "model": model.as_str(),
                        "reason": "random",
                    }),
                );
                Ok(model)
            }
            None => Err(GatewayError::NoModelsAvailable),
        }
    }

    /// Pick an alternative after `original_model` failed. Only retryable
    /// failures are eligible; the failed model is never offered back.
    pub async fn fallback_on_error(
        &self,
        ctx: &RequestContext,
        original_model: ModelType,
        req: &QueryRequest,
        err: &GatewayError,
    ) -> GatewayResult<ModelType> {
        if !err.retryable() {
            return Err(err.clone());
        }
        if ctx.is_cancelled() {
            return Err(ctx.cancellation_error());
        }

        let availability = self.availability().await;
        let candidates: Vec<ModelType> = Self::available_models(&availability)
            .into_iter()
            .filter(|&m| m != original_model)
            .collect();

        let chosen = match req.model {
            Some(preferred) if preferred != original_model && candidates.contains(&preferred) => {
                Some(preferred)
            }
            _ => self.pick_random(&candidates),
        };

        match chosen {
            Some(model) => {
                logger::event(
                    "router_activity",
                    json!({
                        "action": "fallback_selected",
                        "request_id": ctx.request_id,
                        "from": original_model.as_str(),
                        "to": model.as_str(),
                        "error_kind": err.kind(),
                    }),
                );
                Ok(model)
            }
            None => Err(GatewayError::NoFallbackAvailable),
        }
    }
}
