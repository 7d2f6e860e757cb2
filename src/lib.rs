//! miniapm — an embedded application-performance-monitoring client.
//!
//! Distributed trace context propagation (W3C `traceparent`), a span model
//! with OTLP-JSON serialization, fingerprinted error reporting, and an
//! asynchronous batching transport to a remote collector. Host-framework
//! adapters (HTTP middleware, job runners, database drivers) are external
//! collaborators built on top of the contract exposed here; this crate only
//! implements the core.
//!
//! ```no_run
//! use miniapm::{Apm, Config, Category};
//!
//! let config = Config::new("https://collector.example.com", "my-service")
//!     .with_api_key("secret")
//!     .with_environment("production");
//! let apm = Apm::new(config).expect("valid configuration").start().expect("not already started");
//!
//! apm.span("GET /users", Category::HttpServer, vec![], |span| {
//!     span.add_attribute("http.method", "GET");
//! });
//!
//! apm.stop();
//! ```

pub mod batch;
pub mod context;
pub mod error;
pub mod error_event;
pub mod filter;
pub mod ids;
pub mod propagation;
pub mod span;
pub mod trace;
pub mod transport;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};

pub use error::{ApmError, Result};
pub use error_event::{ErrorEvent, ErrorEventInput};
pub use span::{AttributeValue, Category, Span};
pub use trace::Trace;
pub use transport::TransportResult;

use batch::{BatchSender, BatchSenderConfig, StatsSnapshot};
use context::ScopedContext;
use filter::ParamFilter;
use transport::otlp::ResourceAttributes;
use transport::HttpTransport;

type BeforeSend = Box<dyn Fn(&mut Span) -> anyhow::Result<bool> + Send + Sync>;

/// Configuration accepted by [`Apm::new`]. Built fluently; nothing is
/// validated until `new()` is called.
pub struct Config {
    endpoint: String,
    api_key: Option<String>,
    enabled: bool,
    sample_rate: f64,
    batch_size: usize,
    flush_interval: f64,
    max_queue_size: usize,
    max_concurrent_sends: usize,
    service_name: String,
    environment: String,
    service_version: Option<String>,
    host: Option<String>,
    git_sha: Option<String>,
    ignored_exceptions: HashSet<String>,
    filter_parameters: Vec<String>,
    before_send: Option<BeforeSend>,
}

impl Config {
    /// Start from the two required settings; everything else defaults per
    /// the option table (`sample_rate = 1.0`, `batch_size = 100`,
    /// `flush_interval = 5.0`, `max_queue_size = 10_000`).
    pub fn new(endpoint: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            enabled: true,
            sample_rate: 1.0,
            batch_size: 100,
            flush_interval: 5.0,
            max_queue_size: 10_000,
            max_concurrent_sends: 4,
            service_name: service_name.into(),
            environment: "development".to_string(),
            service_version: None,
            host: None,
            git_sha: None,
            ignored_exceptions: HashSet::new(),
            filter_parameters: Vec::new(),
            before_send: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, seconds: f64) -> Self {
        self.flush_interval = seconds;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_max_concurrent_sends(mut self, n: usize) -> Self {
        self.max_concurrent_sends = n;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_git_sha(mut self, git_sha: impl Into<String>) -> Self {
        self.git_sha = Some(git_sha.into());
        self
    }

    pub fn with_ignored_exceptions(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.ignored_exceptions = names.into_iter().collect();
        self
    }

    pub fn with_filter_parameters(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.filter_parameters = patterns.into_iter().collect();
        self
    }

    /// Install a hook run on every finished span before it is enqueued.
    /// Returning `Ok(false)` drops the span; returning `Err` or panicking is
    /// caught and logged, and the original span proceeds unmodified — the
    /// hook can never prevent a span from being recorded except by explicit
    /// `Ok(false)`.
    pub fn with_before_send(
        mut self,
        hook: impl Fn(&mut Span) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.before_send = Some(Box::new(hook));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() || !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ApmError::config(format!("invalid endpoint: {:?}", self.endpoint)));
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ApmError::config(format!("sample_rate must be within [0, 1], got {}", self.sample_rate)));
        }
        if self.batch_size == 0 {
            return Err(ApmError::config("batch_size must be positive"));
        }
        if self.flush_interval <= 0.0 {
            return Err(ApmError::config("flush_interval must be positive"));
        }
        if self.max_queue_size == 0 {
            return Err(ApmError::config("max_queue_size must be positive"));
        }
        if self.max_concurrent_sends == 0 {
            return Err(ApmError::config("max_concurrent_sends must be positive"));
        }
        Ok(())
    }
}

/// The public façade: configuration, lifecycle, span/error submission, and
/// statistics (spec.md §6).
pub struct Apm {
    config: Config,
    filter: ParamFilter,
    sender: BatchSender,
    transport: HttpTransport,
    started: AtomicBool,
}

impl Apm {
    /// Validate `config` and build an `Apm`, not yet started. The only
    /// operation that raises [`ApmError::Config`] to the caller.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let filter = ParamFilter::new(&config.filter_parameters);
        let resource = ResourceAttributes {
            service_name: config.service_name.clone(),
            environment: config.environment.clone(),
            service_version: config.service_version.clone(),
            host_name: config.host.clone(),
            git_sha: config.git_sha.clone(),
        };
        let sender = BatchSender::new(BatchSenderConfig {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            resource,
            batch_size: config.batch_size,
            flush_interval: Duration::from_secs_f64(config.flush_interval),
            max_queue_size: config.max_queue_size,
            max_concurrent_sends: config.max_concurrent_sends,
        });
        Ok(Self { config, filter, sender, transport: HttpTransport::new(), started: AtomicBool::new(false) })
    }

    /// Start the background batch sender. Idempotent per-instance only in
    /// the sense that a second call returns [`ApmError::AlreadyStarted`];
    /// the underlying sender's own `start()` is separately idempotent.
    pub fn start(self) -> Result<Self> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ApmError::AlreadyStarted);
        }
        self.sender.start();
        Ok(self)
    }

    /// Stop the background batch sender, flushing pending work first.
    /// Idempotent.
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.sender.stop();
        }
    }

    /// Whether telemetry submission is currently active (`enabled` in
    /// config AND the sender has been started).
    pub fn enabled(&self) -> bool {
        self.config.enabled && self.started.load(Ordering::SeqCst)
    }

    /// Run `body` with a new span current: a child of the current span if
    /// one exists, otherwise a fresh root. The span is finished and
    /// enqueued when `body` returns (or unwinds).
    pub fn span<T>(
        &self,
        name: &str,
        category: Category,
        attributes: Vec<(String, AttributeValue)>,
        body: impl FnOnce(&mut Span) -> T,
    ) -> T {
        let span = match ScopedContext::current_span() {
            Some(parent) => parent.create_child(name, category, attributes),
            None => Span::new_root(name, category, attributes, self.config.sample_rate),
        };
        let current = span.clone();

        // Holds the span for the duration of `body`. If `body` panics, the
        // unwind drops `guard` with `span` still `Some`, and `Drop` finishes
        // and records it so it is never silently lost. On the success path
        // below we `.take()` it out first, so `Drop` then has nothing to do.
        struct FinishGuard<'a> {
            apm: &'a Apm,
            span: Option<Span>,
        }
        impl Drop for FinishGuard<'_> {
            fn drop(&mut self) {
                if let Some(mut span) = self.span.take() {
                    span.finish();
                    self.apm.record_span(span);
                }
            }
        }

        let mut guard = FinishGuard { apm: self, span: Some(span) };
        let result = ScopedContext::with_span(current, || {
            body(guard.span.as_mut().expect("span present while body runs"))
        });

        let mut span = guard.span.take().expect("span present after body returns");
        span.finish();
        self.record_span(span);
        result
    }

    /// Submit an already-finished span directly, bypassing [`Apm::span`].
    /// Runs the `before_send` hook, then enqueues unless the hook drops it.
    pub fn record_span(&self, mut span: Span) {
        if !self.enabled() {
            return;
        }
        if let Some(hook) = self.config.before_send.as_ref() {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&mut span))) {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return,
                Ok(Err(error)) => {
                    tracing::warn!(%error, "before_send hook returned an error; keeping the original span");
                }
                Err(_) => {
                    tracing::warn!("before_send hook panicked; keeping the original span");
                }
            }
        }
        self.sender.enqueue_span(span);
    }

    /// Record an error as an [`ErrorEvent`], applying the parameter filter
    /// and fingerprinting pipeline. No-op if `exception_class` is in
    /// `ignored_exceptions` or the client is disabled.
    pub fn record_error(&self, exception_class: &str, message: &str, backtrace: Option<Vec<String>>, extra: Map<String, Value>) {
        if !self.enabled() || self.config.ignored_exceptions.contains(exception_class) {
            return;
        }
        let event = ErrorEvent::new(ErrorEventInput { exception_class, message, backtrace, extra }, &self.filter);
        self.sender.enqueue_error(event);
    }

    /// The current execution context's trace id, if any.
    pub fn current_trace_id(&self) -> Option<String> {
        ScopedContext::current_trace_id()
    }

    /// The current execution context's innermost span id, if any.
    pub fn current_span_id(&self) -> Option<String> {
        ScopedContext::current_span().map(|s| s.span_id().to_string())
    }

    /// Force an immediate drain and dispatch of pending spans/errors,
    /// blocking the calling thread up to 5 s.
    pub fn flush(&self) {
        self.sender.flush();
    }

    /// A snapshot of the batch sender's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.sender.stats()
    }

    /// A no-body POST to `{endpoint}/health`. Returns `false` if no API key
    /// is configured or the request did not succeed.
    pub async fn healthy(&self) -> bool {
        let Some(api_key) = self.config.api_key.as_ref() else {
            return false;
        };
        let url = format!("{}/health", self.config.endpoint);
        self.transport.post_empty(&url, api_key).await.success
    }
}

impl Drop for Apm {
    fn drop(&mut self) {
        self.stop();
    }
}
