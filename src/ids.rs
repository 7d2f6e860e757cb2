//! Identifier codec — 128-bit trace ids and 64-bit span ids as lowercase hex.

use once_cell::sync::Lazy;
use regex::Regex;

static TRACE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9a-f]{32}$").unwrap());
static SPAN_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9a-f]{16}$").unwrap());

/// Generate a new 128-bit trace id: 16 random bytes, lowercase hex.
pub fn generate_trace_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// Generate a new 64-bit span id: 8 random bytes, lowercase hex.
pub fn generate_span_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

/// True if `id` is exactly 32 lowercase hex characters.
pub fn is_valid_trace_id(id: &str) -> bool {
    TRACE_ID_RE.is_match(id)
}

/// True if `id` is exactly 16 lowercase hex characters.
pub fn is_valid_span_id(id: &str) -> bool {
    SPAN_ID_RE.is_match(id)
}

/// Return `id` if valid, otherwise generate a fresh trace id.
pub fn trace_id_or_generate(id: Option<&str>) -> String {
    match id {
        Some(id) if is_valid_trace_id(id) => id.to_string(),
        _ => generate_trace_id(),
    }
}

/// Return `id` if valid, otherwise `None` (used for parent span ids, which
/// are simply dropped rather than replaced when malformed).
pub fn span_id_or_none(id: Option<&str>) -> Option<String> {
    id.filter(|id| is_valid_span_id(id)).map(|id| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_trace_id_is_valid() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(is_valid_trace_id(&id));
    }

    #[test]
    fn generated_span_id_is_valid() {
        let id = generate_span_id();
        assert_eq!(id.len(), 16);
        assert!(is_valid_span_id(&id));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(!is_valid_trace_id("not-hex"));
        assert!(!is_valid_trace_id("abc123"));
        assert!(!is_valid_span_id(""));
    }

    #[test]
    fn trace_id_or_generate_keeps_valid_input() {
        let valid = generate_trace_id();
        assert_eq!(trace_id_or_generate(Some(&valid)), valid);
    }

    #[test]
    fn trace_id_or_generate_replaces_malformed_input() {
        let replaced = trace_id_or_generate(Some("bogus"));
        assert!(is_valid_trace_id(&replaced));
    }

    #[test]
    fn span_id_or_none_drops_malformed_input() {
        assert_eq!(span_id_or_none(Some("bogus")), None);
        assert_eq!(span_id_or_none(None), None);
    }

    #[test]
    fn ids_are_unique_across_many_draws() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_span_id()));
        }
    }
}
