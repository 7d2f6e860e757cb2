//! Span record — mutable span state, limits enforcement, OTLP serialization.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::ids;

/// Hard caps enforced at mutation time (spec.md §3). Violations are
/// silently dropped or truncated, never raised as errors.
pub const MAX_ATTRIBUTES: usize = 128;
pub const MAX_EVENTS: usize = 128;
pub const MAX_EVENT_ATTRIBUTES: usize = 32;
pub const MAX_KEY_LEN: usize = 128;
pub const MAX_STRING_LEN: usize = 4096;
pub const MAX_ARRAY_LEN: usize = 32;
pub const MAX_NAME_LEN: usize = 256;

/// The operation category a span represents, used to derive its OTLP `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    HttpServer,
    HttpClient,
    Db,
    View,
    Search,
    Job,
    Rake,
    Cache,
    Internal,
}

impl Category {
    /// Parse a category name, falling back to `Internal` for anything unknown.
    pub fn parse(name: &str) -> Self {
        match name {
            "http_server" => Category::HttpServer,
            "http_client" => Category::HttpClient,
            "db" => Category::Db,
            "view" => Category::View,
            "search" => Category::Search,
            "job" => Category::Job,
            "rake" => Category::Rake,
            "cache" => Category::Cache,
            _ => Category::Internal,
        }
    }

    /// The OTLP span kind this category maps to (spec.md §3 table).
    pub fn kind(self) -> Kind {
        match self {
            Category::HttpServer => Kind::Server,
            Category::HttpClient | Category::Db | Category::Search => Kind::Client,
            Category::Job => Kind::Consumer,
            Category::View | Category::Cache | Category::Rake | Category::Internal => {
                Kind::Internal
            }
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Category::HttpServer => "http_server",
            Category::HttpClient => "http_client",
            Category::Db => "db",
            Category::View => "view",
            Category::Search => "search",
            Category::Job => "job",
            Category::Rake => "rake",
            Category::Cache => "cache",
            Category::Internal => "internal",
        }
    }
}

/// OTLP span kind, numerically encoded per the OTLP spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Internal = 1,
    Server = 2,
    Client = 3,
    Consumer = 5,
}

impl Kind {
    pub fn numeric(self) -> u32 {
        self as u32
    }
}

/// Span completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCode {
    #[default]
    Unset = 0,
    Ok = 1,
    Error = 2,
}

impl StatusCode {
    pub fn numeric(self) -> u32 {
        self as u32
    }
}

/// A heterogeneous attribute/event value (spec.md §9 "Dynamic attribute types").
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<AttributeValue>),
    Null,
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}
impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}
impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}
impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(v as i64)
    }
}
impl From<u16> for AttributeValue {
    fn from(v: u16) -> Self {
        AttributeValue::Int(v as i64)
    }
}
impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}
impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}
impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(v: Vec<T>) -> Self {
        AttributeValue::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Recursively truncate/cap a value per spec.md §3's sanitization rules.
fn sanitize_value(value: AttributeValue) -> AttributeValue {
    match value {
        AttributeValue::String(s) => AttributeValue::String(truncate_chars(&s, MAX_STRING_LEN)),
        AttributeValue::Array(items) => AttributeValue::Array(
            items.into_iter().take(MAX_ARRAY_LEN).map(sanitize_value).collect(),
        ),
        other => other,
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn truncate_key(key: &str) -> String {
    truncate_chars(key, MAX_KEY_LEN)
}

fn now_unix_nano() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// An event recorded during a span's lifetime.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nano: u64,
    pub attributes: Vec<(String, AttributeValue)>,
}

/// A timed unit of work within a trace (spec.md §3, §4.3).
#[derive(Debug, Clone)]
pub struct Span {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    name: String,
    category: Category,
    kind: Kind,
    start_time: u64,
    end_time: Option<u64>,
    attributes: Vec<(String, AttributeValue)>,
    events: Vec<SpanEvent>,
    status_code: StatusCode,
    status_message: Option<String>,
}

impl Span {
    /// Construct a span. Unknown categories fall back to `internal`; a
    /// malformed parent id is dropped; a malformed trace id is replaced with
    /// a freshly generated one.
    pub fn construct(
        name: &str,
        category: Category,
        trace_id: Option<&str>,
        parent_span_id: Option<&str>,
        attributes: Vec<(String, AttributeValue)>,
    ) -> Self {
        let mut span = Self {
            trace_id: ids::trace_id_or_generate(trace_id),
            span_id: ids::generate_span_id(),
            parent_span_id: ids::span_id_or_none(parent_span_id),
            name: truncate_chars(name, MAX_NAME_LEN),
            category,
            kind: category.kind(),
            start_time: now_unix_nano(),
            end_time: None,
            attributes: Vec::new(),
            events: Vec::new(),
            status_code: StatusCode::Unset,
            status_message: None,
        };
        for (key, value) in attributes {
            span.add_attribute(&key, value);
        }
        span
    }

    /// Create a fresh root span: allocates a new [`crate::Trace`], installs it
    /// as the current trace in the calling execution context's
    /// [`crate::ScopedContext`], and returns a parentless span on it.
    pub fn new_root(
        name: &str,
        category: Category,
        attributes: Vec<(String, AttributeValue)>,
        sample_rate: f64,
    ) -> Self {
        let trace = crate::trace::Trace::new(None, None, sample_rate);
        let trace_id = trace.trace_id().to_string();
        crate::context::ScopedContext::set_current_trace(Some(trace));
        Self::construct(name, category, Some(&trace_id), None, attributes)
    }

    /// Create a child span sharing this span's trace id, parented to it.
    pub fn create_child(
        &self,
        name: &str,
        category: Category,
        attributes: Vec<(String, AttributeValue)>,
    ) -> Self {
        Self::construct(
            name,
            category,
            Some(&self.trace_id),
            Some(&self.span_id),
            attributes,
        )
    }

    /// Stamp the end time at the current instant. Idempotent: subsequent
    /// calls simply overwrite the end time.
    pub fn finish(&mut self) {
        let end = now_unix_nano().max(self.start_time);
        self.end_time = Some(end);
    }

    /// Add (or drop, if at cap) an attribute.
    pub fn add_attribute(&mut self, key: &str, value: impl Into<AttributeValue>) {
        if self.attributes.len() >= MAX_ATTRIBUTES {
            return;
        }
        self.attributes.push((truncate_key(key), sanitize_value(value.into())));
    }

    /// Record an event with the given attributes, subject to the event and
    /// per-event-attribute caps.
    pub fn add_event(&mut self, name: &str, attributes: Vec<(String, AttributeValue)>) {
        if self.events.len() >= MAX_EVENTS {
            return;
        }
        let attributes = attributes
            .into_iter()
            .take(MAX_EVENT_ATTRIBUTES)
            .map(|(k, v)| (truncate_key(&k), sanitize_value(v)))
            .collect();
        self.events.push(SpanEvent {
            name: truncate_chars(name, MAX_NAME_LEN),
            time_unix_nano: now_unix_nano(),
            attributes,
        });
    }

    /// Mark this span as failed due to an exception: sets the status to
    /// `ERROR`, truncates and stores the message, and records an `exception`
    /// event carrying type/message/stacktrace (first 30 backtrace lines).
    pub fn record_exception(&mut self, exception_class: &str, message: &str, backtrace: &[String]) {
        self.status_code = StatusCode::Error;
        self.status_message = Some(truncate_chars(message, MAX_STRING_LEN));

        let stacktrace = backtrace.iter().take(30).cloned().collect::<Vec<_>>().join("\n");
        self.add_event(
            "exception",
            vec![
                ("exception.type".to_string(), exception_class.into()),
                ("exception.message".to_string(), message.into()),
                ("exception.stacktrace".to_string(), stacktrace.into()),
            ],
        );
    }

    /// Set the status to `ERROR` with an optional message.
    pub fn set_error(&mut self, message: Option<&str>) {
        self.status_code = StatusCode::Error;
        self.status_message = message.map(|m| truncate_chars(m, MAX_STRING_LEN));
    }

    /// Set the status to `OK`, clearing any status message.
    pub fn set_ok(&mut self) {
        self.status_code = StatusCode::Ok;
        self.status_message = None;
    }

    /// True if this span has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// True if this span's status is `ERROR`.
    pub fn is_error(&self) -> bool {
        self.status_code == StatusCode::Error
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
    pub fn span_id(&self) -> &str {
        &self.span_id
    }
    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn category(&self) -> Category {
        self.category
    }
    pub fn kind(&self) -> Kind {
        self.kind
    }
    pub fn start_time(&self) -> u64 {
        self.start_time
    }
    pub fn end_time(&self) -> Option<u64> {
        self.end_time
    }
    pub fn attributes(&self) -> &[(String, AttributeValue)] {
        &self.attributes
    }
    pub fn events(&self) -> &[SpanEvent] {
        &self.events
    }
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Serialize to an OTLP `Span` JSON object (spec.md §4.3).
    pub fn to_otlp(&self) -> serde_json::Value {
        let mut obj = json!({
            "traceId": self.trace_id,
            "spanId": self.span_id,
            "name": self.name,
            "kind": self.kind.numeric(),
            "startTimeUnixNano": self.start_time.to_string(),
            "endTimeUnixNano": self.end_time.unwrap_or(self.start_time).to_string(),
            "attributes": self.attributes.iter().map(|(k, v)| json!({
                "key": k,
                "value": wrap_otlp_value(v),
            })).collect::<Vec<_>>(),
            "status": status_to_otlp(self.status_code, self.status_message.as_deref()),
        });

        if let Some(parent) = &self.parent_span_id {
            obj["parentSpanId"] = json!(parent);
        }
        if !self.events.is_empty() {
            obj["events"] = json!(self
                .events
                .iter()
                .map(|e| json!({
                    "name": e.name,
                    "timeUnixNano": e.time_unix_nano.to_string(),
                    "attributes": e.attributes.iter().map(|(k, v)| json!({
                        "key": k,
                        "value": wrap_otlp_value(v),
                    })).collect::<Vec<_>>(),
                }))
                .collect::<Vec<_>>());
        }
        obj
    }
}

fn status_to_otlp(code: StatusCode, message: Option<&str>) -> serde_json::Value {
    let mut status = json!({ "code": code.numeric() });
    if let Some(message) = message {
        status["message"] = json!(message);
    }
    status
}

fn wrap_otlp_value(value: &AttributeValue) -> serde_json::Value {
    match value {
        AttributeValue::String(s) => json!({ "stringValue": s }),
        AttributeValue::Int(i) => json!({ "intValue": i.to_string() }),
        AttributeValue::Float(f) => json!({ "doubleValue": f }),
        AttributeValue::Bool(b) => json!({ "boolValue": b }),
        AttributeValue::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(wrap_otlp_value).collect::<Vec<_>>() }
        }),
        AttributeValue::Null => json!({ "stringValue": "" }),
    }
}
