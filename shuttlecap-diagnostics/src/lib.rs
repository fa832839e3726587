//! # Shuttlecap Diagnostics
//!
//! Logging setup and capture health reports for shuttlecap.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod capture_report;
pub mod debug_logger;

// Re-export main types
pub use capture_report::{CaptureReport, ReportError};
pub use debug_logger::DebugLogger;
