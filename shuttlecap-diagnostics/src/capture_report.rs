//! Capture health reports
//!
//! A [`CaptureReport`] bundles the pipeline counters and pool statistics of
//! one session into a serialisable snapshot that can be logged or written
//! out as JSON.

use serde::{Deserialize, Serialize};
use shuttlecap_core::format::VideoFormat;
use shuttlecap_core::pool::PoolStats;
use shuttlecap_core::stats::CaptureStats;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while rendering a report
#[derive(Error, Debug)]
pub enum ReportError {
    /// JSON encoding failed
    #[error("Report serialization failed: {source}")]
    Serialization {
        #[from]
        /// Underlying serde_json error
        source: serde_json::Error,
    },
}

/// Snapshot of one capture session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureReport {
    /// Session the snapshot was taken from
    pub session_id: Uuid,
    /// Device description
    pub description: String,
    /// Session state name
    pub state: String,
    /// Time since the session started capturing
    pub uptime: Duration,
    /// Pipeline counters
    pub stats: CaptureStats,
    /// Video frame pool activity
    pub video_pool: PoolStats,
    /// Audio frame pool activity
    pub audio_pool: PoolStats,
    /// Most recent video format delivered, if any
    pub last_video_format: Option<VideoFormat>,
}

impl CaptureReport {
    /// Human readable problems worth surfacing to an operator
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.video_pool.exhausted > 0 {
            warnings.push(format!(
                "video pool ran dry {} times; the consumer is releasing frames too slowly",
                self.video_pool.exhausted
            ));
        }
        if self.audio_pool.exhausted > 0 {
            warnings.push(format!(
                "audio pool ran dry {} times",
                self.audio_pool.exhausted
            ));
        }
        if self.stats.frames_dropped_backwards > 0 {
            warnings.push(format!(
                "{} blocks arrived out of order and were dropped",
                self.stats.frames_dropped_backwards
            ));
        }
        if self.stats.unsupported_formats > 0 {
            let code = self
                .last_video_format
                .map(|f| format!(" (last code 0x{:04x})", f.id))
                .unwrap_or_default();
            warnings.push(format!(
                "{} frames had an unsupported video format{}",
                self.stats.unsupported_formats, code
            ));
        }
        if self.stats.transfer_errors > 0 {
            warnings.push(format!(
                "{} USB transfers completed with an error",
                self.stats.transfer_errors
            ));
        }
        warnings
    }

    /// Render as pretty-printed JSON
    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a report previously written with [`CaptureReport::to_json`]
    pub fn from_json(json: &str) -> Result<Self, ReportError> {
        Ok(serde_json::from_str(json)?)
    }
}
