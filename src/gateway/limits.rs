//! Per-client rate limiting
//!
//! Token bucket keyed by client IP. Each bucket refills continuously at the
//! configured rate and holds at most `burst` tokens; refill-then-consume is
//! atomic per bucket under that bucket's own lock. Buckets idle for longer
//! than one full refill interval are evicted to bound memory.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

use crate::config::Settings;
use crate::logger;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: f64,
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            requests_per_minute: settings.rate_limit_per_minute,
            burst: settings.rate_limit_burst,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

type AllowFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
    config: RateLimitConfig,
    last_sweep: Mutex<Instant>,
    allow_override: RwLock<Option<AllowFn>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
            last_sweep: Mutex::new(Instant::now()),
            allow_override: RwLock::new(None),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(RateLimitConfig::from_settings(settings))
    }

    fn refill_per_sec(&self) -> f64 {
        self.config.requests_per_minute / 60.0
    }

    /// How long an untouched full drain takes to refill; also the idle TTL
    /// for bucket eviction.
    fn refill_interval(&self) -> Duration {
        let rate = self.refill_per_sec();
        if rate <= 0.0 {
            return Duration::from_secs(3600);
        }
        Duration::from_secs_f64(self.config.burst as f64 / rate)
    }

    /// Try to admit one request for `client`. Denials consume nothing.
    pub fn allow(&self, client: &str) -> bool {
        if let Some(f) = self.allow_override.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return f(client);
        }

        self.maybe_sweep();

        let bucket = {
            let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(buckets.entry(client.to_string()).or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: self.config.burst as f64,
                    last_refill: Instant::now(),
                }))
            }))
        };

        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.refill_per_sec()).min(self.config.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Replace the admission check with an arbitrary predicate. Pass `None`
    /// to restore the real bucket check. For tests.
    pub fn set_allow_client_func(&self, f: Option<AllowFn>) {
        *self
            .allow_override
            .write()
            .unwrap_or_else(|e| e.into_inner()) = f;
    }

    /// Evict buckets idle for longer than one refill interval. Runs at most
    /// once per interval.
    fn maybe_sweep(&self) {
        let idle_ttl = self.refill_interval();
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < idle_ttl {
                return;
            }
            *last = Instant::now();
        }

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket
                .lock()
                .map(|b| b.last_refill.elapsed() < idle_ttl)
                .unwrap_or(false)
        });
        let evicted = before - buckets.len();
        if evicted > 0 {
            logger::debug("limits", &format!("Evicted {} idle buckets", evicted));
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

/// Client identity for rate limiting: the first non-private hop in
/// `X-Forwarded-For`, else the remote address.
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        for hop in forwarded.split(',') {
            if let Ok(ip) = hop.trim().parse::<IpAddr>() {
                if !is_private_ip(ip) {
                    return ip.to_string();
                }
            }
        }
    }
    remote.ip().to_string()
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || (segments[0] & 0xfe00) == 0xfc00
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate_per_minute: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: rate_per_minute,
            burst,
        })
    }

    #[test]
    fn burst_then_denial() {
        let limiter = limiter(60.0, 2);
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
    }

    #[test]
    fn clients_have_independent_buckets() {
        let limiter = limiter(60.0, 1);
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        assert!(limiter.allow("5.6.7.8"));
    }

    #[test]
    fn refill_restores_capacity() {
        // 600 per minute = one token every 100ms
        let limiter = limiter(600.0, 1);
        assert!(limiter.allow("c"));
        assert!(!limiter.allow("c"));
        std::thread::sleep(Duration::from_millis(150));
        assert!(limiter.allow("c"));
    }

    #[test]
    fn throughput_is_bounded_by_capacity_plus_refill() {
        // Over a ~200ms window with burst 3 and 600/min (10/s) at most
        // 3 + 2 = 5 requests may pass
        let limiter = limiter(600.0, 3);
        let started = Instant::now();
        let mut admitted = 0;
        while started.elapsed() < Duration::from_millis(200) {
            if limiter.allow("c") {
                admitted += 1;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(admitted <= 5, "admitted {} requests", admitted);
    }

    #[test]
    fn denial_does_not_consume() {
        // One token every 100ms; hammering while empty must not push the
        // next refill further away
        let limiter = limiter(600.0, 1);
        assert!(limiter.allow("c"));
        for _ in 0..20 {
            let _ = limiter.allow("c");
        }
        std::thread::sleep(Duration::from_millis(150));
        assert!(limiter.allow("c"));
    }

    #[test]
    fn override_predicate_wins() {
        let limiter = limiter(60.0, 0);
        assert!(!limiter.allow("c"));
        limiter.set_allow_client_func(Some(Arc::new(|_| true)));
        assert!(limiter.allow("c"));
        limiter.set_allow_client_func(None);
        assert!(!limiter.allow("c"));
    }

    #[test]
    fn idle_buckets_are_evicted() {
        // Burst 1 at 6000/min refills in 10ms, so the idle TTL is tiny
        let limiter = limiter(6000.0, 1);
        limiter.allow("a");
        limiter.allow("b");
        assert_eq!(limiter.bucket_count(), 2);
        std::thread::sleep(Duration::from_millis(50));
        limiter.allow("fresh");
        assert!(limiter.bucket_count() <= 2);
    }

    #[test]
    fn forwarded_for_skips_private_hops() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "10.0.0.1, 203.0.113.7, 198.51.100.2".parse().unwrap(),
        );
        let remote: SocketAddr = "192.168.1.1:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, remote), "203.0.113.7");
    }

    #[test]
    fn falls_back_to_remote_addr() {
        let headers = HeaderMap::new();
        let remote: SocketAddr = "203.0.113.9:4321".parse().unwrap();
        assert_eq!(client_ip(&headers, remote), "203.0.113.9");

        let mut private_only = HeaderMap::new();
        private_only.insert("x-forwarded-for", "10.0.0.1, 172.16.2.2".parse().unwrap());
        assert_eq!(client_ip(&private_only, remote), "203.0.113.9");
    }
}
