//! OTLP span exporter — composes a `resourceSpans` payload and POSTs it to
//! the trace ingest endpoint (spec.md §4.8).

use serde_json::{json, Value};

use crate::span::Span;
use crate::transport::{HttpTransport, TransportResult};

const SDK_NAME: &str = "miniapm-rust";

/// Resource-level attributes attached to every exported batch.
#[derive(Debug, Clone, Default)]
pub struct ResourceAttributes {
    pub service_name: String,
    pub environment: String,
    pub service_version: Option<String>,
    pub host_name: Option<String>,
    pub git_sha: Option<String>,
}

impl ResourceAttributes {
    fn to_otlp(&self) -> Vec<Value> {
        let mut attrs = vec![
            attr("service.name", &self.service_name),
            attr("deployment.environment", &self.environment),
            attr("telemetry.sdk.name", SDK_NAME),
            attr("telemetry.sdk.version", env!("CARGO_PKG_VERSION")),
            attr("telemetry.sdk.language", "rust"),
        ];
        if let Some(v) = &self.service_version {
            attrs.push(attr("service.version", v));
        }
        if let Some(v) = &self.host_name {
            attrs.push(attr("host.name", v));
        }
        if let Some(v) = &self.git_sha {
            attrs.push(attr("git.sha", v));
        }
        attrs
    }
}

fn attr(key: &str, value: &str) -> Value {
    json!({ "key": key, "value": { "stringValue": value } })
}

/// Exports batches of finished spans as OTLP over HTTP.
pub struct OtlpExporter {
    transport: HttpTransport,
    endpoint: String,
    api_key: Option<String>,
    resource: ResourceAttributes,
}

impl OtlpExporter {
    pub fn new(endpoint: String, api_key: Option<String>, resource: ResourceAttributes) -> Self {
        Self { transport: HttpTransport::new(), endpoint, api_key, resource }
    }

    /// Export a non-empty batch of spans. If no API key is configured,
    /// does nothing and returns `None`.
    pub async fn export(&self, spans: &[Span]) -> Option<TransportResult> {
        let api_key = self.api_key.as_ref()?;
        if spans.is_empty() {
            return None;
        }

        let payload = json!({
            "resourceSpans": [{
                "resource": { "attributes": self.resource.to_otlp() },
                "scopeSpans": [{
                    "scope": { "name": SDK_NAME, "version": env!("CARGO_PKG_VERSION") },
                    "spans": spans.iter().map(Span::to_otlp).collect::<Vec<_>>(),
                }],
            }],
        });

        let url = format!("{}/ingest/v1/traces", self.endpoint);
        Some(self.transport.post(&url, &payload, api_key).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Category;

    #[test]
    fn resource_attributes_always_include_required_fields() {
        let resource = ResourceAttributes {
            service_name: "svc".to_string(),
            environment: "test".to_string(),
            ..Default::default()
        };
        let attrs = resource.to_otlp();
        let keys: Vec<&str> = attrs.iter().map(|a| a["key"].as_str().unwrap()).collect();
        assert!(keys.contains(&"service.name"));
        assert!(keys.contains(&"deployment.environment"));
        assert!(keys.contains(&"telemetry.sdk.name"));
        assert!(keys.contains(&"telemetry.sdk.version"));
        assert!(keys.contains(&"telemetry.sdk.language"));
        assert!(!keys.contains(&"service.version"));
    }

    #[test]
    fn resource_attributes_include_optional_fields_when_set() {
        let resource = ResourceAttributes {
            service_name: "svc".to_string(),
            environment: "test".to_string(),
            service_version: Some("1.2.3".to_string()),
            host_name: Some("box-1".to_string()),
            git_sha: Some("abc123".to_string()),
        };
        let attrs = resource.to_otlp();
        let keys: Vec<&str> = attrs.iter().map(|a| a["key"].as_str().unwrap()).collect();
        assert!(keys.contains(&"service.version"));
        assert!(keys.contains(&"host.name"));
        assert!(keys.contains(&"git.sha"));
    }

    #[tokio::test]
    async fn export_does_nothing_without_api_key() {
        let exporter = OtlpExporter::new("http://localhost:1".to_string(), None, ResourceAttributes::default());
        let span = Span::construct("op", Category::Internal, None, None, vec![]);
        assert!(exporter.export(&[span]).await.is_none());
    }

    #[tokio::test]
    async fn export_does_nothing_for_empty_batch() {
        let exporter = OtlpExporter::new(
            "http://localhost:1".to_string(),
            Some("key".to_string()),
            ResourceAttributes::default(),
        );
        assert!(exporter.export(&[]).await.is_none());
    }
}
