//! Trace — trace id plus the per-trace sampling decision.

use crate::ids;

/// A logical end-to-end operation identified by a 32-hex-char trace id,
/// carrying the sampling decision inherited by every span in the trace.
///
/// Immutable after construction (spec.md §3, §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    trace_id: String,
    sampled: bool,
}

impl Trace {
    /// Construct a trace.
    ///
    /// If `trace_id` is omitted or malformed, a fresh one is generated. If
    /// `sampled` is omitted, the decision is drawn as `rand() < sample_rate`.
    pub fn new(trace_id: Option<&str>, sampled: Option<bool>, sample_rate: f64) -> Self {
        let trace_id = ids::trace_id_or_generate(trace_id);
        let sampled = sampled.unwrap_or_else(|| rand::random::<f64>() < sample_rate);
        Self { trace_id, sampled }
    }

    /// Construct a trace from an already-validated trace id and decision,
    /// e.g. when reconstructing from an extracted W3C `traceparent`.
    pub fn from_parts(trace_id: String, sampled: bool) -> Self {
        debug_assert!(ids::is_valid_trace_id(&trace_id));
        Self { trace_id, sampled }
    }

    /// The 32-hex-char trace id.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Whether this trace was chosen for export.
    pub fn sampled(&self) -> bool {
        self.sampled
    }
}
