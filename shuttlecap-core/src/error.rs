//! Capture error types and handling
//!
//! Every failure that prevents a capture session from being established is
//! reported through [`CaptureError`]. Conditions that happen while frames are
//! flowing (dropped packets, overflow, unknown format codes) are logged and
//! counted instead; they never surface as errors.

use thiserror::Error;

/// Main error type for capture operations
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The USB I/O subsystem could not be initialized
    #[error("Initialization failed: {reason}")]
    Initialization {
        /// Failure reason
        reason: String,
    },

    /// A required setting was not supplied before use
    #[error("Missing configuration: {field}")]
    MissingConfiguration {
        /// Name of the missing field
        field: String,
    },

    /// An operator setting was out of range
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// The capture device could not be opened or claimed
    #[error("Device open failed: card {card_index} - {reason}")]
    DeviceOpen {
        /// Index of the card that was requested
        card_index: usize,
        /// Failure reason
        reason: String,
    },

    /// A control request to the device failed
    #[error("Device control request {request} failed: {reason}")]
    DeviceControl {
        /// Vendor request number
        request: u8,
        /// Failure reason
        reason: String,
    },

    /// An isochronous transfer could not be submitted
    #[error("Transfer submission failed on endpoint {endpoint:#04x}: {reason}")]
    TransferSubmission {
        /// Endpoint address
        endpoint: u8,
        /// Failure reason
        reason: String,
    },

    /// The device has been unplugged
    #[error("Device disconnected")]
    Disconnected,

    /// Operation is not valid in the current session state
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        /// State the operation requires
        expected: String,
        /// State the session is in
        actual: String,
    },

    /// The shared I/O pump was started or stopped out of order
    #[error("I/O pump error: {message}")]
    PumpState {
        /// Error message
        message: String,
    },

    /// A background thread could not be started
    #[error("Thread spawn failed: {name} - {source}")]
    ThreadSpawn {
        /// Thread name
        name: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

impl CaptureError {
    /// Stable machine-readable code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            CaptureError::Initialization { .. } => "INITIALIZATION_FAILED",
            CaptureError::MissingConfiguration { .. } => "MISSING_CONFIGURATION",
            CaptureError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            CaptureError::DeviceOpen { .. } => "DEVICE_OPEN_FAILED",
            CaptureError::DeviceControl { .. } => "DEVICE_CONTROL_FAILED",
            CaptureError::TransferSubmission { .. } => "TRANSFER_SUBMISSION_FAILED",
            CaptureError::Disconnected => "DEVICE_DISCONNECTED",
            CaptureError::InvalidState { .. } => "INVALID_STATE",
            CaptureError::PumpState { .. } => "PUMP_STATE",
            CaptureError::ThreadSpawn { .. } => "THREAD_SPAWN_FAILED",
        }
    }

    /// Check if the caller can retry with the same session or settings
    pub fn is_recoverable(&self) -> bool {
        match self {
            CaptureError::InvalidConfiguration { .. } => true,
            CaptureError::MissingConfiguration { .. } => true,
            CaptureError::InvalidState { .. } => true,
            CaptureError::PumpState { .. } => true,
            CaptureError::Disconnected => false,
            _ => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            CaptureError::Initialization { .. } => ErrorCategory::System,
            CaptureError::MissingConfiguration { .. } => ErrorCategory::Configuration,
            CaptureError::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            CaptureError::DeviceOpen { .. } => ErrorCategory::Device,
            CaptureError::DeviceControl { .. } => ErrorCategory::Device,
            CaptureError::TransferSubmission { .. } => ErrorCategory::Transport,
            CaptureError::Disconnected => ErrorCategory::Device,
            CaptureError::InvalidState { .. } => ErrorCategory::State,
            CaptureError::PumpState { .. } => ErrorCategory::State,
            CaptureError::ThreadSpawn { .. } => ErrorCategory::System,
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// System-level errors (threads, USB subsystem)
    System,
    /// Configuration and parameter errors
    Configuration,
    /// Device and hardware errors
    Device,
    /// USB transfer errors
    Transport,
    /// State management errors
    State,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let open = CaptureError::DeviceOpen {
            card_index: 0,
            reason: "no such device".to_string(),
        };
        assert_eq!(open.category(), ErrorCategory::Device);
        assert!(!open.is_recoverable());
        assert_eq!(open.error_code(), "DEVICE_OPEN_FAILED");

        let state = CaptureError::InvalidState {
            expected: "Configured".to_string(),
            actual: "Unconfigured".to_string(),
        };
        assert_eq!(state.category(), ErrorCategory::State);
        assert!(state.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = CaptureError::TransferSubmission {
            endpoint: 0x83,
            reason: "busy".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Transfer submission failed on endpoint 0x83: busy"
        );
    }
}
