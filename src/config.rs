//! Gateway configuration
//!
//! Environment-backed settings plus the API key store. Settings are read
//! once into an immutable snapshot; keys live behind a store that supports
//! masked display, optional AES-GCM encryption at rest, and timestamped
//! rotation checks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::logger;
use crate::providers::ModelType;

// ============================================
// Environment helpers
// ============================================

/// Read an env var as a string, falling back to `default` when unset or empty.
pub fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

/// Read an env var if set and non-empty.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Read an env var as an integer.
///
/// The key is looked up verbatim; a missing value or a parse failure falls
/// back to `default`.
pub fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Read an env var as a float, falling back to `default` on parse failure.
pub fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

/// Read an env var as a boolean (`true`/`false`/`1`/`0`/`yes`/`no`).
pub fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

// ============================================
// Settings
// ============================================

/// Immutable settings snapshot for the gateway process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_level: String,

    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_max_items: usize,
    pub cache_cleanup_secs: u64,

    pub http_timeout_secs: u64,
    pub http_max_idle: usize,
    pub http_max_idle_per_host: usize,
    pub http_idle_timeout_secs: u64,

    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    pub jitter: f64,

    pub availability_ttl_secs: u64,

    pub rate_limit_per_minute: f64,
    pub rate_limit_burst: u32,

    pub request_timeout_secs: u64,
    pub parallel_timeout_secs: u64,

    pub openai_base_url: String,
    pub claude_base_url: String,
    pub gemini_base_url: String,
    pub mistral_base_url: String,
    pub vertex_base_url: String,
    pub bedrock_base_url: String,
    pub bedrock_control_base_url: String,

    pub vertex_project: Option<String>,
    pub vertex_location: String,
    pub aws_access_key_id: Option<String>,
    pub aws_region: String,

    pub price_catalog_path: Option<String>,
    pub allow_test_keys: bool,
    pub encryption_key: Option<String>,
    pub key_rotation_hours: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            log_level: "info".to_string(),

            cache_enabled: true,
            cache_ttl_secs: 300,
            cache_max_items: 1000,
            cache_cleanup_secs: 600,

            http_timeout_secs: 30,
            http_max_idle: 100,
            http_max_idle_per_host: 20,
            http_idle_timeout_secs: 90,

            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_factor: 2.0,
            jitter: 0.1,

            availability_ttl_secs: 300,

            rate_limit_per_minute: 60.0,
            rate_limit_burst: 10,

            request_timeout_secs: 30,
            parallel_timeout_secs: 60,

            openai_base_url: "https://api.openai.com".to_string(),
            claude_base_url: "https://api.anthropic.com".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com".to_string(),
            mistral_base_url: "https://api.mistral.ai".to_string(),
            vertex_base_url: "https://us-central1-aiplatform.googleapis.com".to_string(),
            bedrock_base_url: "https://bedrock-runtime.us-east-1.amazonaws.com".to_string(),
            bedrock_control_base_url: "https://bedrock.us-east-1.amazonaws.com".to_string(),

            vertex_project: None,
            vertex_location: "us-central1".to_string(),
            aws_access_key_id: None,
            aws_region: "us-east-1".to_string(),

            price_catalog_path: None,
            allow_test_keys: true,
            encryption_key: None,
            key_rotation_hours: None,
        }
    }
}

impl Settings {
    /// Build settings from the process environment on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let vertex_location = env_string("VERTEX_AI_LOCATION", &defaults.vertex_location);
        let aws_region = env_string("AWS_REGION", &defaults.aws_region);

        Self {
            port: env_u64("PORT", defaults.port as u64) as u16,
            log_level: env_string("LOG_LEVEL", &defaults.log_level),

            cache_enabled: env_bool("CACHE_ENABLED", defaults.cache_enabled),
            cache_ttl_secs: env_u64("CACHE_TTL", defaults.cache_ttl_secs),
            cache_max_items: env_u64("CACHE_MAX_ITEMS", defaults.cache_max_items as u64) as usize,
            cache_cleanup_secs: env_u64("CACHE_CLEANUP_INTERVAL", defaults.cache_cleanup_secs),

            http_timeout_secs: env_u64("HTTP_TIMEOUT", defaults.http_timeout_secs),
            http_max_idle: env_u64("MAX_IDLE_CONNS", defaults.http_max_idle as u64) as usize,
            http_max_idle_per_host: env_u64(
                "MAX_IDLE_CONNS_PER_HOST",
                defaults.http_max_idle_per_host as u64,
            ) as usize,
            http_idle_timeout_secs: env_u64("IDLE_CONN_TIMEOUT", defaults.http_idle_timeout_secs),

            max_retries: env_u64("MAX_RETRIES", defaults.max_retries as u64) as u32,
            initial_backoff_ms: env_u64("INITIAL_BACKOFF", defaults.initial_backoff_ms),
            max_backoff_ms: env_u64("MAX_BACKOFF", defaults.max_backoff_ms),
            backoff_factor: env_f64("BACKOFF_FACTOR", defaults.backoff_factor),
            jitter: env_f64("JITTER", defaults.jitter),

            availability_ttl_secs: env_u64("AVAILABILITY_TTL", defaults.availability_ttl_secs),

            rate_limit_per_minute: env_f64("RATE_LIMIT", defaults.rate_limit_per_minute),
            rate_limit_burst: env_u64("RATE_LIMIT_BURST", defaults.rate_limit_burst as u64) as u32,

            request_timeout_secs: env_u64("REQUEST_TIMEOUT", defaults.request_timeout_secs),
            parallel_timeout_secs: env_u64("PARALLEL_TIMEOUT", defaults.parallel_timeout_secs),

            openai_base_url: env_string("OPENAI_BASE_URL", &defaults.openai_base_url),
            claude_base_url: env_string("CLAUDE_BASE_URL", &defaults.claude_base_url),
            gemini_base_url: env_string("GEMINI_BASE_URL", &defaults.gemini_base_url),
            mistral_base_url: env_string("MISTRAL_BASE_URL", &defaults.mistral_base_url),
            vertex_base_url: env_string(
                "VERTEX_AI_BASE_URL",
                &format!("https://{}-aiplatform.googleapis.com", vertex_location),
            ),
            bedrock_base_url: env_string(
                "BEDROCK_BASE_URL",
                &format!("https://bedrock-runtime.{}.amazonaws.com", aws_region),
            ),
            bedrock_control_base_url: env_string(
                "BEDROCK_CONTROL_BASE_URL",
                &format!("https://bedrock.{}.amazonaws.com", aws_region),
            ),

            vertex_project: env_opt("VERTEX_AI_PROJECT_ID"),
            vertex_location,
            aws_access_key_id: env_opt("AWS_ACCESS_KEY_ID"),
            aws_region,

            price_catalog_path: env_opt("PRICE_CATALOG_PATH"),
            allow_test_keys: env_bool("ALLOW_TEST_KEYS", defaults.allow_test_keys),
            encryption_key: env_opt("LLM_PROXY_ENCRYPTION_KEY"),
            key_rotation_hours: env_opt("KEY_ROTATION_HOURS")
                .and_then(|v| v.trim().parse::<u64>().ok()),
        }
    }
}

static SETTINGS: Lazy<Arc<Settings>> = Lazy::new(|| Arc::new(Settings::from_env()));

/// Process-wide settings snapshot.
pub fn settings() -> Arc<Settings> {
    Arc::clone(&SETTINGS)
}

// ============================================
// API keys
// ============================================

/// AES-256-GCM cipher for keeping API keys encrypted in memory.
///
/// The cipher key is the SHA-256 of the configured passphrase. Every seal
/// uses a fresh random 96-bit nonce; the nonce is prepended to the
/// ciphertext and the whole blob is base64-encoded.
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Option<String> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self.cipher.encrypt(nonce, plaintext.as_bytes()).ok()?;
        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Some(BASE64.encode(blob))
    }

    pub fn open(&self, sealed: &str) -> Option<String> {
        let blob = BASE64.decode(sealed).ok()?;
        if blob.len() < 12 {
            return None;
        }
        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self.cipher.decrypt(nonce, ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

#[derive(Clone)]
enum KeyMaterial {
    Plain(String),
    Sealed(String),
}

/// A provider credential.
///
/// `Display` and `Debug` only ever show the masked form; the raw value is
/// reachable solely through [`KeyStore::api_key`].
#[derive(Clone)]
pub struct ApiKey {
    material: KeyMaterial,
    masked: String,
    pub provider: ModelType,
    pub version: u32,
    pub last_rotated: DateTime<Utc>,
    pub encrypted: bool,
}

impl ApiKey {
    fn new(provider: ModelType, raw: String, cipher: Option<&KeyCipher>) -> Self {
        let masked = mask_key(&raw);
        let (material, encrypted) = match cipher.and_then(|c| c.seal(&raw)) {
            Some(sealed) => (KeyMaterial::Sealed(sealed), true),
            None => (KeyMaterial::Plain(raw), false),
        };
        Self {
            material,
            masked,
            provider,
            version: 1,
            last_rotated: Utc::now(),
            encrypted,
        }
    }

    fn reveal(&self, cipher: Option<&KeyCipher>) -> Option<String> {
        match &self.material {
            KeyMaterial::Plain(v) => Some(v.clone()),
            KeyMaterial::Sealed(sealed) => cipher.and_then(|c| c.open(sealed)),
        }
    }

    fn rotated_from(&self, raw: String, cipher: Option<&KeyCipher>) -> Self {
        let mut next = ApiKey::new(self.provider, raw, cipher);
        next.version = self.version + 1;
        next
    }

    pub fn masked(&self) -> &str {
        &self.masked
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.masked)
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("provider", &self.provider)
            .field("value", &self.masked)
            .field("version", &self.version)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

fn mask_key(raw: &str) -> String {
    if raw.len() > 8 {
        format!("{}…{}", &raw[..4], &raw[raw.len() - 2..])
    } else {
        "***".to_string()
    }
}

/// Env var holding the credential for each provider.
fn key_env_var(provider: ModelType) -> &'static str {
    match provider {
        ModelType::OpenAi => "OPENAI_API_KEY",
        ModelType::Gemini => "GEMINI_API_KEY",
        ModelType::Mistral => "MISTRAL_API_KEY",
        ModelType::Claude => "CLAUDE_API_KEY",
        ModelType::VertexAi => "VERTEX_AI_API_KEY",
        ModelType::Bedrock => "AWS_SECRET_ACCESS_KEY",
    }
}

static KEY_FORMATS: Lazy<HashMap<ModelType, Regex>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        ModelType::OpenAi,
        Regex::new(r"^sk-[A-Za-z0-9_-]{32,}$").unwrap(),
    );
    m.insert(
        ModelType::Claude,
        Regex::new(r"^sk-ant-[A-Za-z0-9_-]{32,}$").unwrap(),
    );
    m.insert(
        ModelType::Gemini,
        Regex::new(r"^AIza[0-9A-Za-z_-]{35}$").unwrap(),
    );
    m.insert(
        ModelType::Mistral,
        Regex::new(r"^[A-Za-z0-9]{32,}$").unwrap(),
    );
    m
});

/// Check a key against the provider's expected format.
///
/// A mismatch only produces a warning; the key stays usable so a malformed
/// entry degrades one provider instead of aborting startup.
fn validate_key_format(provider: ModelType, raw: &str) {
    if raw.starts_with("test_") {
        return;
    }
    if let Some(re) = KEY_FORMATS.get(&provider) {
        if !re.is_match(raw) {
            logger::warn(
                "config",
                &format!(
                    "API key for {} does not match the expected format ({})",
                    provider,
                    mask_key(raw)
                ),
            );
        }
    }
}

/// Provider credential store with rotation and optional at-rest encryption.
pub struct KeyStore {
    keys: RwLock<HashMap<ModelType, ApiKey>>,
    cipher: Option<KeyCipher>,
    rotation: Option<Duration>,
    last_check: Mutex<Instant>,
}

impl KeyStore {
    /// Load credentials from the environment.
    pub fn from_env(settings: &Settings) -> Self {
        let cipher = settings
            .encryption_key
            .as_deref()
            .map(KeyCipher::from_passphrase);
        let mut keys = HashMap::new();
        for model in ModelType::all() {
            if let Some(raw) = env_opt(key_env_var(model)) {
                validate_key_format(model, &raw);
                keys.insert(model, ApiKey::new(model, raw, cipher.as_ref()));
            }
        }
        Self {
            keys: RwLock::new(keys),
            cipher,
            rotation: settings
                .key_rotation_hours
                .map(|h| Duration::from_secs(h * 3600)),
            last_check: Mutex::new(Instant::now()),
        }
    }

    /// Store with fixed credentials, bypassing the environment. For tests.
    pub fn with_keys(fixed: HashMap<ModelType, String>) -> Self {
        let keys = fixed
            .into_iter()
            .map(|(model, raw)| (model, ApiKey::new(model, raw, None)))
            .collect();
        Self {
            keys: RwLock::new(keys),
            cipher: None,
            rotation: None,
            last_check: Mutex::new(Instant::now()),
        }
    }

    /// Plaintext credential for a provider, if configured.
    pub fn api_key(&self, provider: ModelType) -> Option<String> {
        self.maybe_rotate();
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(&provider)
            .and_then(|k| k.reveal(self.cipher.as_ref()))
    }

    /// Key metadata (masked value, version, rotation timestamp).
    pub fn key_info(&self, provider: ModelType) -> Option<ApiKey> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(&provider).cloned()
    }

    /// Re-read credentials from the environment when the rotation interval
    /// has elapsed. A changed value bumps the key version.
    fn maybe_rotate(&self) {
        let Some(interval) = self.rotation else {
            return;
        };
        {
            let mut last = self.last_check.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < interval {
                return;
            }
            *last = Instant::now();
        }

        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        for model in ModelType::all() {
            let fresh = env_opt(key_env_var(model));
            match (keys.get(&model), fresh) {
                (Some(current), Some(raw)) => {
                    let unchanged = current
                        .reveal(self.cipher.as_ref())
                        .map(|v| v == raw)
                        .unwrap_or(false);
                    if !unchanged {
                        validate_key_format(model, &raw);
                        let rotated = current.rotated_from(raw, self.cipher.as_ref());
                        logger::info(
                            "config",
                            &format!(
                                "Rotated API key for {} to version {}",
                                model, rotated.version
                            ),
                        );
                        keys.insert(model, rotated);
                    }
                }
                (None, Some(raw)) => {
                    validate_key_format(model, &raw);
                    keys.insert(model, ApiKey::new(model, raw, self.cipher.as_ref()));
                }
                _ => {}
            }
        }
    }
}
