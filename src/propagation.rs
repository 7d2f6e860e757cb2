//! W3C Trace Context codec — `traceparent` header extract/inject (spec.md §4.6).

use std::collections::HashMap;

use crate::ids;

/// The decoded contents of a `traceparent` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContext {
    pub trace_id: String,
    pub parent_span_id: String,
    pub sampled: bool,
}

/// Look up `traceparent` under the header-naming conventions a host
/// framework might use (`traceparent`, `Traceparent`, `HTTP_TRACEPARENT`),
/// parse it, and return the decoded trace context. Returns `None` on any
/// lookup or parse failure — extraction never raises.
pub fn extract(headers: &HashMap<String, String>) -> Option<ExtractedContext> {
    let raw = headers
        .get("traceparent")
        .or_else(|| headers.get("Traceparent"))
        .or_else(|| headers.get("HTTP_TRACEPARENT"))?;
    parse_traceparent(raw)
}

fn parse_traceparent(raw: &str) -> Option<ExtractedContext> {
    let parts: Vec<&str> = raw.split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    let [version, trace_id, parent_span_id, flags] = [parts[0], parts[1], parts[2], parts[3]];

    if version != "00" {
        return None;
    }
    if !ids::is_valid_trace_id(trace_id) {
        return None;
    }
    if !ids::is_valid_span_id(parent_span_id) {
        return None;
    }
    let flags = u8::from_str_radix(flags, 16).ok()?;
    let sampled = (flags & 0x01) != 0;

    Some(ExtractedContext { trace_id: trace_id.to_string(), parent_span_id: parent_span_id.to_string(), sampled })
}

/// Format the current trace/span as a `traceparent` header value and write
/// it under the lowercase `traceparent` key. If no span is current, returns
/// `headers` unchanged.
pub fn inject(mut headers: HashMap<String, String>) -> HashMap<String, String> {
    let Some(span) = crate::context::ScopedContext::current_span() else {
        return headers;
    };
    let sampled = crate::context::ScopedContext::current_trace().map(|t| t.sampled()).unwrap_or(false);
    let flags = if sampled { "01" } else { "00" };
    headers.insert("traceparent".to_string(), format!("00-{}-{}-{}", span.trace_id(), span.span_id(), flags));
    headers
}

/// Pure formatting helper (no context dependency), used where the caller
/// already has explicit ids rather than relying on [`ScopedContext`](crate::context::ScopedContext).
pub fn format_traceparent(trace_id: &str, span_id: &str, sampled: bool) -> String {
    format!("00-{}-{}-{}", trace_id, span_id, if sampled { "01" } else { "00" })
}
