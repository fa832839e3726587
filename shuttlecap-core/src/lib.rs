//! # Shuttlecap Core
//!
//! Building blocks of the capture pipeline: frame buffers and their pools,
//! the device format-code decoder, wrapping timecode ordering, and the
//! stream wire format.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format;
pub mod frame;
pub mod input;
pub mod pool;
pub mod stats;
pub mod timecode;
pub mod wire_format;

// Re-export main types
pub use error::{CaptureError, CaptureResult, ErrorCategory};
pub use format::{
    decode_video_format, guess_sample_rate, v210_stride, AudioFormat, DecodedFormat,
    FormatStatus, PixelFormat, VideoFormat, DEFAULT_SAMPLE_RATE, NO_SIGNAL_FORMAT,
};
pub use frame::{Frame, FrameAllocator, FrameStorage};
pub use input::{capture_mode_word, AudioInput, VideoInput, VideoMode, AUTODETECT_VIDEO_MODE};
pub use pool::{PoolConfig, PoolFrameAllocator, PoolStats};
pub use stats::{CaptureCounters, CaptureStats};
pub use timecode::timecode_precedes;
pub use wire_format::{
    find_marker, BlockHeader, AUDIO_PAYLOAD_OFFSET, AUDIO_SYNC_PATTERN, BLOCK_HEADER_LEN,
    VIDEO_PAYLOAD_OFFSET, VIDEO_SYNC_PATTERN,
};
