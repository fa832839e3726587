//! Structured logging setup

use shuttlecap_core::CaptureError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "shuttlecap=info";

/// Installs the process-wide `tracing` subscriber
#[derive(Debug, Default)]
pub struct DebugLogger;

impl DebugLogger {
    /// Initialize logging from `RUST_LOG`, falling back to [`DEFAULT_FILTER`]
    ///
    /// Fails if another subscriber is already installed.
    pub fn init_logging() -> Result<(), CaptureError> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|e| {
            debug!("RUST_LOG not usable ({}), using {}", e, DEFAULT_FILTER);
            EnvFilter::new(DEFAULT_FILTER)
        });
        Self::init_with_filter(filter)
    }

    /// Initialize logging with an explicit filter directive such as `"shuttlecap=debug"`
    pub fn init_with_directive(directive: &str) -> Result<(), CaptureError> {
        let filter = EnvFilter::try_new(directive).map_err(|e| CaptureError::InvalidConfiguration {
            message: format!("bad log filter '{directive}': {e}"),
        })?;
        Self::init_with_filter(filter)
    }

    fn init_with_filter(filter: EnvFilter) -> Result<(), CaptureError> {
        let directives = filter.to_string();
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init()
            .map_err(|e| CaptureError::Initialization {
                reason: format!("logging: {e}"),
            })?;
        info!("Logging initialized with filter '{}'", directives);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_directive_rejected() {
        let err = DebugLogger::init_with_directive("shuttlecap=notalevel").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_second_init_fails_cleanly() {
        let _ = DebugLogger::init_with_directive("shuttlecap=debug");
        let second = DebugLogger::init_logging().unwrap_err();
        assert_eq!(second.error_code(), "INITIALIZATION_FAILED");
    }
}
