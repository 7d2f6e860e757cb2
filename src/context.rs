//! Per-execution-context trace/span storage (spec.md §3, §4.6).
//!
//! One OS thread is treated as one execution context: the current trace and
//! span stack live in a `thread_local!`, so concurrent threads never observe
//! each other's state and no locking is required.

use std::cell::RefCell;

use crate::span::Span;
use crate::trace::Trace;

struct ContextState {
    current_trace: Option<Trace>,
    span_stack: Vec<Span>,
}

impl ContextState {
    fn new() -> Self {
        Self { current_trace: None, span_stack: Vec::new() }
    }
}

thread_local! {
    static STATE: RefCell<ContextState> = RefCell::new(ContextState::new());
}

/// Per-execution-context storage for the current trace and active span stack.
///
/// All methods are associated functions operating on the calling thread's
/// storage; `ScopedContext` itself holds no data.
pub struct ScopedContext;

impl ScopedContext {
    /// The current trace, if any.
    pub fn current_trace() -> Option<Trace> {
        STATE.with(|s| s.borrow().current_trace.clone())
    }

    /// The current trace id, if a trace is active.
    pub fn current_trace_id() -> Option<String> {
        STATE.with(|s| s.borrow().current_trace.as_ref().map(|t| t.trace_id().to_string()))
    }

    /// Replace the current trace (used by [`crate::Span::new_root`] and the
    /// W3C extraction path).
    pub fn set_current_trace(trace: Option<Trace>) {
        STATE.with(|s| s.borrow_mut().current_trace = trace);
    }

    /// The innermost active span, if any.
    pub fn current_span() -> Option<Span> {
        STATE.with(|s| s.borrow().span_stack.last().cloned())
    }

    /// Push a span onto the stack, making it the current span.
    pub fn push_span(span: Span) {
        STATE.with(|s| s.borrow_mut().span_stack.push(span));
    }

    /// Pop the innermost span off the stack, if any.
    pub fn pop_span() -> Option<Span> {
        STATE.with(|s| s.borrow_mut().span_stack.pop())
    }

    /// Run `body` with `span` pushed as current, guaranteeing it is popped
    /// again on every exit path — including `body` panicking.
    pub fn with_span<T>(span: Span, body: impl FnOnce() -> T) -> T {
        struct PopGuard;
        impl Drop for PopGuard {
            fn drop(&mut self) {
                ScopedContext::pop_span();
            }
        }

        Self::push_span(span);
        let _guard = PopGuard;
        body()
    }

    /// Run `body` with `trace` installed as current and a fresh, empty span
    /// stack, restoring the previous trace and stack afterward (including on
    /// panic).
    pub fn with_trace<T>(trace: Trace, body: impl FnOnce() -> T) -> T {
        struct RestoreGuard {
            trace: Option<Trace>,
            stack: Vec<Span>,
        }
        impl Drop for RestoreGuard {
            fn drop(&mut self) {
                STATE.with(|s| {
                    let mut state = s.borrow_mut();
                    state.current_trace = self.trace.take();
                    state.span_stack = std::mem::take(&mut self.stack);
                });
            }
        }

        let (previous_trace, previous_stack) = STATE.with(|s| {
            let mut state = s.borrow_mut();
            let previous_trace = state.current_trace.take();
            let previous_stack = std::mem::take(&mut state.span_stack);
            state.current_trace = Some(trace);
            (previous_trace, previous_stack)
        });

        let _guard = RestoreGuard { trace: previous_trace, stack: previous_stack };
        body()
    }

    /// Clear the current trace and span stack.
    pub fn clear() {
        STATE.with(|s| {
            let mut state = s.borrow_mut();
            state.current_trace = None;
            state.span_stack.clear();
        });
    }
}
