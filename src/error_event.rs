//! Error event — immutable, fingerprinted, filtered error snapshot.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::filter::ParamFilter;

const MAX_MESSAGE_LEN: usize = 10_000;
const MAX_BACKTRACE_LEN: usize = 50;
const MAX_NORMALIZED_MESSAGE_LEN: usize = 200;
const FINGERPRINT_LEN: usize = 32;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
});
static DIGIT_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static SINGLE_QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new("'[^']*'").unwrap());
static DOUBLE_QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new("\"[^\"]*\"").unwrap());

/// Caller-supplied input to [`ErrorEvent::new`]. `extra` carries whatever
/// other key/value pairs the caller attached; `request_id`/`user_id`/`params`
/// are pulled out of it and everything left over becomes `context`.
pub struct ErrorEventInput<'a> {
    pub exception_class: &'a str,
    pub message: &'a str,
    pub backtrace: Option<Vec<String>>,
    pub extra: Map<String, Value>,
}

/// Immutable error snapshot (spec.md §3, §4.4).
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    exception_class: String,
    message: String,
    backtrace: Vec<String>,
    fingerprint: String,
    timestamp: DateTime<Utc>,
    request_id: Option<String>,
    user_id: Option<String>,
    params: Option<Value>,
    context: Map<String, Value>,
}

impl ErrorEvent {
    /// Run the full construction pipeline: truncate message/backtrace,
    /// compute the fingerprint, filter params, coerce `user_id`, and split
    /// `extra` into `request_id`/`user_id`/`params`/`context`.
    pub fn new(input: ErrorEventInput<'_>, filter: &ParamFilter) -> Self {
        let ErrorEventInput { exception_class, message, backtrace, mut extra } = input;

        let message = truncate_message(message);
        let backtrace: Vec<String> = backtrace.unwrap_or_default().into_iter().take(MAX_BACKTRACE_LEN).collect();
        let fingerprint = compute_fingerprint(exception_class, &message, &backtrace);

        let request_id = extra.remove("request_id").and_then(|v| match v {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        });
        let user_id = extra.remove("user_id").and_then(|v| match v {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        });
        let params = extra.remove("params").map(|v| match v {
            Value::Object(_) => filter.filter(&v),
            _ => Value::Null,
        }).filter(|v| !v.is_null());

        Self {
            exception_class: exception_class.to_string(),
            message,
            backtrace,
            fingerprint,
            timestamp: Utc::now(),
            request_id,
            user_id,
            params,
            context: extra,
        }
    }

    pub fn exception_class(&self) -> &str {
        &self.exception_class
    }
    pub fn message(&self) -> &str {
        &self.message
    }
    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }
    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    /// Serialize to a mapping of only the non-absent fields
    /// (`timestamp` as ISO-8601 UTC, second precision).
    pub fn to_h(&self) -> Value {
        let mut map = Map::new();
        map.insert("exception_class".to_string(), Value::String(self.exception_class.clone()));
        map.insert("message".to_string(), Value::String(self.message.clone()));
        map.insert("backtrace".to_string(), Value::Array(self.backtrace.iter().cloned().map(Value::String).collect()));
        map.insert("fingerprint".to_string(), Value::String(self.fingerprint.clone()));
        map.insert("timestamp".to_string(), Value::String(self.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string()));
        if let Some(request_id) = &self.request_id {
            map.insert("request_id".to_string(), Value::String(request_id.clone()));
        }
        if let Some(user_id) = &self.user_id {
            map.insert("user_id".to_string(), Value::String(user_id.clone()));
        }
        if let Some(params) = &self.params {
            map.insert("params".to_string(), params.clone());
        }
        if !self.context.is_empty() {
            map.insert("context".to_string(), Value::Object(self.context.clone()));
        }
        Value::Object(map)
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_LEN {
        message.to_string()
    } else {
        let mut truncated: String = message.chars().take(MAX_MESSAGE_LEN).collect();
        truncated.push_str("...");
        truncated
    }
}

fn normalize_message(message: &str) -> String {
    let normalized = UUID_RE.replace_all(message, "UUID");
    let normalized = DIGIT_RUN_RE.replace_all(&normalized, "N");
    let normalized = SINGLE_QUOTED_RE.replace_all(&normalized, "'X'");
    let normalized = DOUBLE_QUOTED_RE.replace_all(&normalized, "\"X\"");
    normalized.chars().take(MAX_NORMALIZED_MESSAGE_LEN).collect()
}

fn first_clean_backtrace_frame(backtrace: &[String]) -> Option<&str> {
    backtrace
        .iter()
        .find(|frame| {
            !frame.contains("/gems/")
                && !frame.contains("/ruby/")
                && !frame.contains("/vendor/")
                && !frame.starts_with('<')
        })
        .map(|s| s.as_str())
}

fn compute_fingerprint(exception_class: &str, message: &str, backtrace: &[String]) -> String {
    let mut parts = vec![exception_class.to_string(), normalize_message(message)];
    if let Some(frame) = first_clean_backtrace_frame(backtrace) {
        parts.push(frame.to_string());
    }
    let joined = parts.join("\n");
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest).chars().take(FINGERPRINT_LEN).collect()
}
