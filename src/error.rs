//! Error types for miniapm.

use thiserror::Error;

/// Errors the core can return to a caller.
///
/// Per the error taxonomy: only configuration validation at [`crate::Apm::start`]
/// is fatal and reaches the caller. Transport, server, encoding, and callback
/// errors are captured into [`crate::transport::TransportResult`] or counted in
/// the batch sender's stats — they never surface as `ApmError`.
#[derive(Error, Debug)]
pub enum ApmError {
    /// Invalid configuration detected at `start()`.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `start()` called while already started.
    #[error("already started")]
    AlreadyStarted,
}

impl ApmError {
    /// Construct a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for miniapm operations.
pub type Result<T> = std::result::Result<T, ApmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_message() {
        let err = ApmError::config("sample_rate must be within [0, 1]");
        assert_eq!(
            err.to_string(),
            "invalid configuration: sample_rate must be within [0, 1]"
        );
    }

    #[test]
    fn already_started_message() {
        assert_eq!(ApmError::AlreadyStarted.to_string(), "already started");
    }
}
