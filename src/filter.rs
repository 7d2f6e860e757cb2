//! Parameter filter — redacts sensitive values out of arbitrary JSON before
//! it reaches an error report (spec.md §5).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Keys considered sensitive by default, matched case-insensitively as a
/// substring against a mapping key, in addition to any configured patterns.
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "password",
    "password_confirmation",
    "token",
    "secret",
    "api_key",
    "access_token",
];

/// Recursion depth at which the filter gives up and replaces the remainder
/// of a subtree with a sentinel, rather than recursing further.
pub const MAX_DEPTH: usize = 10;

/// Sequence (array) length at which elements past the cap are dropped.
pub const MAX_SEQUENCE_LEN: usize = 100;

static DEFAULT_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    let alternation = DEFAULT_SENSITIVE_KEYS.join("|");
    Regex::new(&format!("(?i){alternation}")).unwrap()
});

/// A compiled set of sensitive-key patterns used to decide whether a given
/// mapping key's value should be redacted.
#[derive(Debug, Clone)]
pub struct ParamFilter {
    patterns: Vec<Regex>,
}

impl Default for ParamFilter {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl ParamFilter {
    /// Build a filter from caller-supplied extra key patterns (regexes or
    /// plain substrings — both are matched case-insensitively), on top of
    /// the built-in defaults.
    pub fn new(extra_keys: &[String]) -> Self {
        let mut patterns = vec![DEFAULT_KEY_RE.clone()];
        for key in extra_keys {
            if let Ok(re) = Regex::new(&format!("(?i){key}")) {
                patterns.push(re);
            }
        }
        Self { patterns }
    }

    fn key_is_sensitive(&self, key: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(key))
    }

    /// Filter a JSON value, redacting sensitive mapping values and bounding
    /// recursion depth and sequence length.
    pub fn filter(&self, value: &Value) -> Value {
        self.filter_at(value, 0)
    }

    fn filter_at(&self, value: &Value, depth: usize) -> Value {
        if depth >= MAX_DEPTH {
            return serde_json::json!({ "__truncated__": "max depth exceeded" });
        }
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, val) in map {
                    if self.key_is_sensitive(key) {
                        out.insert(key.clone(), Value::String("[FILTERED]".to_string()));
                    } else {
                        out.insert(key.clone(), self.filter_at(val, depth + 1));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .take(MAX_SEQUENCE_LEN)
                    .map(|v| self.filter_at(v, depth + 1))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_default_sensitive_keys() {
        let filter = ParamFilter::default();
        let input = json!({ "username": "alice", "password": "hunter2" });
        let out = filter.filter(&input);
        assert_eq!(out["username"], "alice");
        assert_eq!(out["password"], "[FILTERED]");
    }

    #[test]
    fn matches_sensitive_keys_case_insensitively() {
        let filter = ParamFilter::default();
        let input = json!({ "API_KEY": "xyz" });
        assert_eq!(filter.filter(&input)["API_KEY"], "[FILTERED]");
    }

    #[test]
    fn matches_substring_within_a_key() {
        let filter = ParamFilter::default();
        let input = json!({ "user_secret_value": "xyz" });
        assert_eq!(filter.filter(&input)["user_secret_value"], "[FILTERED]");
    }

    #[test]
    fn recurses_into_nested_objects_and_arrays() {
        let filter = ParamFilter::default();
        let input = json!({
            "user": { "token": "abc", "name": "bob" },
            "items": [{ "secret": "s1" }, { "name": "ok" }],
        });
        let out = filter.filter(&input);
        assert_eq!(out["user"]["token"], "[FILTERED]");
        assert_eq!(out["user"]["name"], "bob");
        assert_eq!(out["items"][0]["secret"], "[FILTERED]");
        assert_eq!(out["items"][1]["name"], "ok");
    }

    #[test]
    fn caps_recursion_depth() {
        let filter = ParamFilter::default();
        let mut value = json!("leaf");
        for _ in 0..(MAX_DEPTH + 5) {
            value = json!({ "nested": value });
        }
        let out = filter.filter(&value);
        let mut cursor = &out;
        for _ in 0..MAX_DEPTH {
            cursor = &cursor["nested"];
        }
        assert_eq!(cursor["__truncated__"], "max depth exceeded");
    }

    #[test]
    fn caps_sequence_length() {
        let filter = ParamFilter::default();
        let items: Vec<Value> = (0..150).map(|i| json!(i)).collect();
        let out = filter.filter(&json!({ "items": items }));
        assert_eq!(out["items"].as_array().unwrap().len(), MAX_SEQUENCE_LEN);
    }

    #[test]
    fn custom_keys_extend_defaults() {
        let filter = ParamFilter::new(&["ssn".to_string()]);
        let input = json!({ "ssn": "123-45-6789", "password": "x" });
        let out = filter.filter(&input);
        assert_eq!(out["ssn"], "[FILTERED]");
        assert_eq!(out["password"], "[FILTERED]");
    }

    #[test]
    fn non_mapping_values_pass_through_unchanged() {
        let filter = ParamFilter::default();
        assert_eq!(filter.filter(&json!(42)), json!(42));
        assert_eq!(filter.filter(&json!("hello")), json!("hello"));
        assert_eq!(filter.filter(&json!(null)), json!(null));
    }
}
