//! Response cache with single-flight deduplication
//!
//! Entries are keyed by a SHA-256 fingerprint of the canonical request and
//! expire after a TTL, with LRU eviction at the item cap. Concurrent misses
//! on the same key share one upstream call: the first arrival leads the
//! flight, followers await its result on a watch channel.
//!
//! The entries map and the flights map use separate locks and neither lock
//! is ever held across an await point or together with the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::config::Settings;
use crate::gateway::error::GatewayError;
use crate::gateway::types::{QueryRequest, QueryResponse};
use crate::logger;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_items: usize,
    pub cleanup_interval: Duration,
}

impl CacheConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            enabled: settings.cache_enabled,
            ttl: Duration::from_secs(settings.cache_ttl_secs),
            max_items: settings.cache_max_items.max(1),
            cleanup_interval: Duration::from_secs(settings.cache_cleanup_secs),
        }
    }
}

struct CacheEntry {
    response: QueryResponse,
    created_at: Instant,
    last_accessed: Instant,
}

type FlightResult = Result<QueryResponse, GatewayError>;
type FlightSender = watch::Sender<Option<FlightResult>>;
type FlightReceiver = watch::Receiver<Option<FlightResult>>;

pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    flights: Mutex<HashMap<String, FlightReceiver>>,
    config: CacheConfig,
}

/// Cache key: SHA-256 over the canonical JSON of `{query, model, task_type}`
/// with lexically sorted keys and unset fields omitted.
///
/// `model_version` is deliberately not part of the key, so semantically
/// identical requests share a slot across versions.
pub fn fingerprint(req: &QueryRequest) -> String {
    let mut doc = serde_json::Map::new();
    if let Some(model) = req.model {
        doc.insert("model".to_string(), serde_json::json!(model));
    }
    if !req.query.is_empty() {
        doc.insert("query".to_string(), serde_json::json!(req.query));
    }
    if let Some(task) = req.task_type {
        doc.insert("task_type".to_string(), serde_json::json!(task));
    }
    let canonical = serde_json::Value::Object(doc).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Outcome of joining a cache flight.
pub enum Flight {
    /// This caller builds the value and must call [`FlightGuard::complete`].
    Leader(FlightGuard),
    /// Another caller is already building; await its result.
    Waiter(FlightReceiver),
}

/// Completion handle held by a flight leader. Dropping the guard without
/// completing resolves all waiters with an error so nobody hangs.
pub struct FlightGuard {
    cache: Arc<ResponseCache>,
    key: String,
    tx: Option<FlightSender>,
}

impl FlightGuard {
    pub fn complete(mut self, result: FlightResult) {
        self.finish(result);
    }

    fn finish(&mut self, result: FlightResult) {
        if let Some(tx) = self.tx.take() {
            self.cache
                .flights
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.key);
            let _ = tx.send(Some(result));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.finish(Err(GatewayError::Internal(
            "query aborted before completion".to_string(),
        )));
    }
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(CacheConfig::from_settings(settings))
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    /// Look up a fingerprint. Hits come back marked `cached` and refresh
    /// their LRU position; expired entries are dropped on the way out.
    pub fn get(&self, key: &str) -> Option<QueryResponse> {
        if !self.config.enabled {
            return None;
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(key) {
            Some(entry) if entry.created_at.elapsed() < self.config.ttl => {
                entry.last_accessed = Instant::now();
                let mut response = entry.response.clone();
                response.cached = true;
                Some(response)
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a response, evicting the least recently used entry when the
    /// item cap is reached.
    pub fn set(&self, key: String, response: QueryResponse) {
        if !self.config.enabled {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.config.max_items && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                response,
                created_at: now,
                last_accessed: now,
            },
        );
    }

    /// Join the flight for a key: the first arrival leads, everyone else
    /// waits. Coalescing applies even when storage is disabled.
    pub fn begin_flight(self: &Arc<Self>, key: &str) -> Flight {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rx) = flights.get(key) {
            return Flight::Waiter(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        flights.insert(key.to_string(), rx);
        Flight::Leader(FlightGuard {
            cache: Arc::clone(self),
            key: key.to_string(),
            tx: Some(tx),
        })
    }

    /// Await the leader's result.
    pub async fn await_flight(mut rx: FlightReceiver) -> FlightResult {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(GatewayError::Internal(
                    "query leader vanished".to_string(),
                ));
            }
        }
    }

    /// Drop entries past their TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        let ttl = self.config.ttl;
        entries.retain(|_, entry| entry.created_at.elapsed() < ttl);
        let removed = before - entries.len();
        if removed > 0 {
            logger::debug("cache", &format!("Swept {} expired entries", removed));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::TaskType;
    use crate::providers::ModelType;
    use chrono::Utc;

    fn request(query: &str) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            model: Some(ModelType::OpenAi),
            task_type: Some(TaskType::TextGeneration),
            ..QueryRequest::default()
        }
    }

    fn response(text: &str) -> QueryResponse {
        QueryResponse {
            response: text.to_string(),
            model: ModelType::OpenAi,
            model_version: None,
            response_time_ms: 1,
            timestamp: Utc::now(),
            cached: false,
            error: None,
            error_type: None,
            input_tokens: 1,
            output_tokens: 1,
            total_tokens: 2,
            num_retries: 0,
            request_id: "r".to_string(),
            original_model: None,
            cost_usd: None,
        }
    }

    fn small_cache(ttl: Duration, max_items: usize) -> Arc<ResponseCache> {
        Arc::new(ResponseCache::new(CacheConfig {
            enabled: true,
            ttl,
            max_items,
            cleanup_interval: Duration::from_secs(600),
        }))
    }

    #[test]
    fn fingerprint_depends_only_on_query_model_task() {
        let a = request("hello");
        let mut b = request("hello");
        b.model_version = Some("gpt-4".to_string());
        b.request_id = Some("11111111-2222-3333-4444-555555555555".to_string());
        b.max_cost_usd = Some(1.0);
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = request("hello!");
        assert_ne!(fingerprint(&a), fingerprint(&c));

        let mut d = request("hello");
        d.model = Some(ModelType::Claude);
        assert_ne!(fingerprint(&a), fingerprint(&d));

        let mut e = request("hello");
        e.task_type = Some(TaskType::Summarization);
        assert_ne!(fingerprint(&a), fingerprint(&e));
    }

    #[test]
    fn fingerprint_omits_unset_fields() {
        let bare = QueryRequest {
            query: "q".to_string(),
            ..QueryRequest::default()
        };
        // Stable across restarts: the canonical form of a bare query is fixed
        let expected = hex::encode(Sha256::digest(r#"{"query":"q"}"#.as_bytes()));
        assert_eq!(fingerprint(&bare), expected);
    }

    #[test]
    fn get_after_set_hits_and_marks_cached() {
        let cache = small_cache(Duration::from_secs(60), 10);
        let key = fingerprint(&request("hi"));
        assert!(cache.get(&key).is_none());

        cache.set(key.clone(), response("hi there"));
        let hit = cache.get(&key).unwrap();
        assert!(hit.cached);
        assert_eq!(hit.response, "hi there");
    }

    #[test]
    fn expired_entries_miss() {
        let cache = small_cache(Duration::from_millis(10), 10);
        let key = fingerprint(&request("hi"));
        cache.set(key.clone(), response("hi"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = small_cache(Duration::from_secs(60), 2);
        cache.set("a".into(), response("a"));
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b".into(), response("b"));
        std::thread::sleep(Duration::from_millis(2));
        // Touch "a" so "b" becomes least recently used
        assert!(cache.get("a").is_some());
        std::thread::sleep(Duration::from_millis(2));

        cache.set("c".into(), response("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = Arc::new(ResponseCache::new(CacheConfig {
            enabled: false,
            ttl: Duration::from_secs(60),
            max_items: 10,
            cleanup_interval: Duration::from_secs(600),
        }));
        cache.set("k".into(), response("v"));
        assert!(cache.get("k").is_none());
        // Coalescing still applies
        assert!(matches!(cache.begin_flight("k"), Flight::Leader(_)));
        assert!(matches!(cache.begin_flight("k"), Flight::Waiter(_)));
    }

    #[tokio::test]
    async fn single_flight_shares_one_build() {
        let cache = small_cache(Duration::from_secs(60), 10);
        let key = "shared".to_string();

        let leader = match cache.begin_flight(&key) {
            Flight::Leader(guard) => guard,
            Flight::Waiter(_) => panic!("first arrival must lead"),
        };

        let mut waiters = Vec::new();
        for _ in 0..8 {
            match cache.begin_flight(&key) {
                Flight::Leader(_) => panic!("only one leader per key"),
                Flight::Waiter(rx) => {
                    waiters.push(tokio::spawn(ResponseCache::await_flight(rx)))
                }
            }
        }

        leader.complete(Ok(response("built once")));

        for waiter in waiters {
            let result = waiter.await.unwrap().unwrap();
            assert_eq!(result.response, "built once");
        }

        // Flight is gone, the next arrival leads again
        assert!(matches!(cache.begin_flight(&key), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn leader_failure_propagates_and_clears_flight() {
        let cache = small_cache(Duration::from_secs(60), 10);
        let leader = match cache.begin_flight("k") {
            Flight::Leader(guard) => guard,
            Flight::Waiter(_) => unreachable!(),
        };
        let rx = match cache.begin_flight("k") {
            Flight::Waiter(rx) => rx,
            Flight::Leader(_) => unreachable!(),
        };

        leader.complete(Err(GatewayError::NoModelsAvailable));

        let err = ResponseCache::await_flight(rx).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoModelsAvailable));
        assert!(matches!(cache.begin_flight("k"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn dropped_leader_resolves_waiters() {
        let cache = small_cache(Duration::from_secs(60), 10);
        let leader = match cache.begin_flight("k") {
            Flight::Leader(guard) => guard,
            Flight::Waiter(_) => unreachable!(),
        };
        let rx = match cache.begin_flight("k") {
            Flight::Waiter(rx) => rx,
            Flight::Leader(_) => unreachable!(),
        };

        drop(leader);
        let err = ResponseCache::await_flight(rx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let cache = small_cache(Duration::from_millis(20), 10);
        cache.set("old".into(), response("old"));
        std::thread::sleep(Duration::from_millis(30));
        cache.set("new".into(), response("new"));
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
