//! Global logger module
//!
//! Structured JSON logging for the gateway. Every record is one JSON line
//! on stderr; writes go through an async batch writer so hot paths never
//! block on I/O.

use std::io::Write;
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config;

static INIT: Once = Once::new();

// Log record for batching
#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: LogLevel,
    source: String,
    message: String,
    fields: Option<Value>,
}

// Async log channel sender
static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);

static MIN_LEVEL: Lazy<LogLevel> = Lazy::new(|| {
    LogLevel::from_str(&config::settings().log_level).unwrap_or(LogLevel::Info)
});

// ============================================
// Log levels
// ============================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn severity(&self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

// ============================================
// Writer
// ============================================

/// Initialize the logging pipeline. Safe to call more than once.
pub fn init() {
    INIT.call_once(spawn_batch_writer);
}

/// Batch writer: drains the channel and flushes JSON lines to stderr
/// every 100 records or once per second, whichever comes first.
fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();

    {
        let mut sender = LOG_SENDER.write().unwrap();
        *sender = Some(tx);
    }

    std::thread::spawn(move || {
        let mut buffer = Vec::with_capacity(100);
        let mut last_flush = Instant::now();
        let flush_interval = Duration::from_secs(1);

        loop {
            let timeout = flush_interval
                .checked_sub(last_flush.elapsed())
                .unwrap_or_else(|| Duration::from_secs(0));

            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    buffer.push(msg);
                    if buffer.len() >= 100 || last_flush.elapsed() >= flush_interval {
                        flush_logs(&mut buffer);
                        last_flush = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        flush_logs(&mut buffer);
                    }
                    last_flush = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }

        if !buffer.is_empty() {
            flush_logs(&mut buffer);
        }
    });
}

fn render_line(msg: &LogMessage) -> String {
    let mut doc = serde_json::Map::new();
    doc.insert("ts".to_string(), Value::from(msg.timestamp));
    doc.insert("level".to_string(), Value::from(msg.level.as_str()));
    doc.insert("source".to_string(), Value::from(msg.source.clone()));
    if !msg.message.is_empty() {
        doc.insert("message".to_string(), Value::from(msg.message.clone()));
    }
    if let Some(Value::Object(fields)) = &msg.fields {
        for (k, v) in fields {
            doc.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Value::Object(doc).to_string()
}

fn flush_logs(buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }

    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    for msg in buffer.drain(..) {
        let _ = writeln!(out, "{}", render_line(&msg));
    }
    let _ = out.flush();
}

// ============================================
// Recording
// ============================================

fn log_internal(level: LogLevel, source: &str, message: &str, fields: Option<Value>) {
    if level.severity() < MIN_LEVEL.severity() {
        return;
    }

    let msg = LogMessage {
        timestamp: chrono::Utc::now().timestamp_millis(),
        level,
        source: source.to_string(),
        message: message.to_string(),
        fields,
    };

    // Route through the async channel; fall back to a direct write if the
    // writer has not been initialized yet.
    if let Some(sender) = LOG_SENDER.read().unwrap().as_ref() {
        let _ = sender.send(msg);
    } else {
        eprintln!("{}", render_line(&msg));
    }
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message, None);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message, None);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message, None);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message, None);
}

/// Record a structured event (`llm_request`, `llm_response`,
/// `router_activity`). The fields object is flattened into the line.
pub fn event(name: &str, fields: Value) {
    log_internal(LogLevel::Info, name, "", Some(fields));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_single_json_line() {
        let msg = LogMessage {
            timestamp: 1700000000000,
            level: LogLevel::Info,
            source: "llm_request".to_string(),
            message: String::new(),
            fields: Some(json!({"request_id": "abc", "model": "openai"})),
        };
        let line = render_line(&msg);
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["source"], "llm_request");
        assert_eq!(parsed["request_id"], "abc");
        assert_eq!(parsed["model"], "openai");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn fields_never_override_envelope() {
        let msg = LogMessage {
            timestamp: 1,
            level: LogLevel::Warn,
            source: "router_activity".to_string(),
            message: "m".to_string(),
            fields: Some(json!({"level": "debug"})),
        };
        let parsed: Value = serde_json::from_str(&render_line(&msg)).unwrap();
        assert_eq!(parsed["level"], "warn");
    }

    #[test]
    fn level_parsing_round_trips() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::from_str(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::from_str("verbose"), None);
    }
}
