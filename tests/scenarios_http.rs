//! End-to-end scenarios seeded by spec.md §8 (S1, S6, S7, S8), driven
//! against the loopback server in `support`.

mod support;

use std::sync::Once;
use std::time::Duration;

use miniapm::span::{Category, Span};
use miniapm::transport::otlp::{OtlpExporter, ResourceAttributes};
use miniapm::{Apm, Config};
use support::MockServer;

static INIT_LOGGING: Once = Once::new();

/// Install a `tracing` subscriber once per test binary so the warn/error
/// events the batch sender emits on retry and permanent failure are visible
/// under `cargo test -- --nocapture` instead of silently dropped.
fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter("miniapm=debug").try_init();
    });
}

#[tokio::test]
async fn s1_single_span_export() {
    init_logging();
    let server = MockServer::start(vec![200]);
    let resource =
        ResourceAttributes { service_name: "svc".to_string(), environment: "test".to_string(), ..Default::default() };
    let exporter = OtlpExporter::new(server.url(), Some("k".to_string()), resource);

    let mut span = Span::construct("GET /a", Category::HttpServer, None, None, vec![]);
    span.add_attribute("http.method", "GET");
    span.add_attribute("http.status_code", 200i64);
    span.finish();

    let result = exporter.export(&[span]).await.expect("api key configured");
    assert!(result.success);

    assert_eq!(server.request_count(), 1);
    let request = server.last_request().unwrap();
    assert!(request.request_line.starts_with("POST /ingest/v1/traces"));
    assert_eq!(request.header("authorization"), Some("Bearer k"));

    let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
    let resource_attrs = &body["resourceSpans"][0]["resource"]["attributes"];
    let has_service_name = resource_attrs
        .as_array()
        .unwrap()
        .iter()
        .any(|a| a["key"] == "service.name" && a["value"]["stringValue"] == "svc");
    assert!(has_service_name);

    let exported_span = &body["resourceSpans"][0]["scopeSpans"][0]["spans"][0];
    assert_eq!(exported_span["kind"], 2);
    assert_eq!(exported_span["status"]["code"], 0);
}

#[tokio::test]
async fn s6_retry_on_500_then_success() {
    init_logging();
    let server = MockServer::start(vec![500, 500, 200]);
    let apm = Apm::new(
        Config::new(server.url(), "svc")
            .with_api_key("k")
            .with_batch_size(1)
            .with_flush_interval(0.1),
    )
    .unwrap()
    .start()
    .unwrap();

    let mut span = Span::construct("op", Category::Internal, None, None, vec![]);
    span.finish();
    apm.record_span(span);

    let deadline = std::time::Instant::now() + Duration::from_secs(6);
    while std::time::Instant::now() < deadline && apm.stats().sent.span == 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let stats = apm.stats();
    assert_eq!(stats.sent.span, 1);
    assert!(stats.retries >= 2);
    assert!(server.request_count() >= 3);
    apm.stop();
}

#[tokio::test]
async fn s7_4xx_not_retried() {
    init_logging();
    let server = MockServer::start(vec![401]);
    let apm = Apm::new(
        Config::new(server.url(), "svc")
            .with_api_key("k")
            .with_batch_size(1)
            .with_flush_interval(0.1),
    )
    .unwrap()
    .start()
    .unwrap();

    let mut span = Span::construct("op", Category::Internal, None, None, vec![]);
    span.finish();
    apm.record_span(span);

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(server.request_count(), 1);
    let stats = apm.stats();
    assert_eq!(stats.failed.span, 1);
    assert_eq!(stats.retries, 0);
    apm.stop();
}

#[tokio::test]
async fn s8_graceful_shutdown_flushes() {
    init_logging();
    let server = MockServer::start(vec![200]);
    let apm = Apm::new(
        Config::new(server.url(), "svc")
            .with_api_key("k")
            .with_batch_size(100)
            .with_flush_interval(60.0),
    )
    .unwrap()
    .start()
    .unwrap();

    let mut span = Span::construct("op", Category::Internal, None, None, vec![]);
    span.finish();
    apm.record_span(span);

    apm.stop();

    assert_eq!(server.request_count(), 1);
    assert_eq!(apm.stats().sent.span, 1);
}
