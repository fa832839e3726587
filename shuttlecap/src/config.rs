//! Configuration types and defaults

use serde::{Deserialize, Serialize};
use shuttlecap_core::error::{CaptureError, CaptureResult};
use shuttlecap_core::format::PixelFormat;
use shuttlecap_core::input::{capture_mode_word, AudioInput, VideoInput, AUTODETECT_VIDEO_MODE};
use shuttlecap_core::pool::PoolConfig;

/// Isochronous transfers kept in flight per endpoint
pub const DEFAULT_TRANSFERS_PER_ENDPOINT: usize = 6;

/// Capture session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Pixel layout requested from the card
    pub pixel_format: PixelFormat,
    /// Video connector
    pub video_input: VideoInput,
    /// Audio source
    pub audio_input: AudioInput,
    /// Video mode id (only autodetect exists)
    pub video_mode: u32,
    /// Pool used when no video allocator is supplied
    pub video_pool: PoolConfig,
    /// Pool used when no audio allocator is supplied
    pub audio_pool: PoolConfig,
    /// Isochronous transfers kept in flight per endpoint
    pub transfers_per_endpoint: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::default(),
            video_input: VideoInput::default(),
            audio_input: AudioInput::default(),
            video_mode: AUTODETECT_VIDEO_MODE,
            video_pool: PoolConfig::video(),
            audio_pool: PoolConfig::audio(),
            transfers_per_endpoint: DEFAULT_TRANSFERS_PER_ENDPOINT,
        }
    }
}

impl CaptureConfig {
    /// Small pools for tests and loopback replays
    pub fn testing() -> Self {
        Self {
            video_pool: PoolConfig::small(256 * 1024, 8),
            audio_pool: PoolConfig::small(65536, 16),
            ..Self::default()
        }
    }

    /// Mode word committed to the device
    pub fn mode_word(&self) -> u32 {
        capture_mode_word(self.pixel_format, self.video_input, self.audio_input)
    }

    /// Check the configuration for values the session can not work with
    pub fn validate(&self) -> CaptureResult<()> {
        if self.video_mode != AUTODETECT_VIDEO_MODE {
            return Err(CaptureError::InvalidConfiguration {
                message: format!("unknown video mode id {}", self.video_mode),
            });
        }
        for (name, pool) in [("video", &self.video_pool), ("audio", &self.audio_pool)] {
            if pool.frame_size == 0 || pool.num_frames == 0 {
                return Err(CaptureError::InvalidConfiguration {
                    message: format!("{name} pool needs at least one non-empty frame"),
                });
            }
        }
        if self.transfers_per_endpoint == 0 {
            return Err(CaptureError::InvalidConfiguration {
                message: "at least one transfer per endpoint is required".to_string(),
            });
        }
        Ok(())
    }
}
