//! Error event exporter — single-per-event POST to the error ingest endpoint
//! (spec.md §4.9; per the spec's Open Questions, single-per-event is
//! canonical, not the batched variant).

use crate::error_event::ErrorEvent;
use crate::transport::{HttpTransport, TransportResult};

/// Aggregate result of exporting several errors one at a time.
#[derive(Debug, Clone)]
pub struct ExportBatchResult {
    pub success: bool,
    pub sent: usize,
    pub failed: usize,
    pub status: u16,
}

/// Exports [`ErrorEvent`]s, one HTTP POST per event.
pub struct ErrorExporter {
    transport: HttpTransport,
    endpoint: String,
    api_key: Option<String>,
}

impl ErrorExporter {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self { transport: HttpTransport::new(), endpoint, api_key }
    }

    /// Export a single error event. Does nothing if no API key is configured.
    pub async fn export(&self, error: &ErrorEvent) -> Option<TransportResult> {
        let api_key = self.api_key.as_ref()?;
        let url = format!("{}/ingest/errors", self.endpoint);
        Some(self.transport.post(&url, &error.to_h(), api_key).await)
    }

    /// Export a batch of errors individually, aggregating the outcome.
    pub async fn export_batch(&self, errors: &[ErrorEvent]) -> ExportBatchResult {
        let mut sent = 0usize;
        let mut failed = 0usize;
        let mut last_status = 0u16;
        let mut any_succeeded = false;

        for error in errors {
            match self.export(error).await {
                Some(result) => {
                    last_status = result.status;
                    if result.success {
                        sent += 1;
                        any_succeeded = true;
                    } else {
                        failed += 1;
                    }
                }
                None => failed += 1,
            }
        }

        ExportBatchResult { success: any_succeeded, sent, failed, status: last_status }
    }
}
