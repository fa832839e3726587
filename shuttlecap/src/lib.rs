//! # Shuttlecap - USB3 HDMI/SDI Capture Pipeline
//!
//! Shuttlecap turns the isochronous packet streams of a USB3 HDMI/SDI
//! capture card into matched pairs of video frames and embedded audio
//! blocks, delivered to a consumer callback together with the decoded video
//! format and an estimated audio sample rate.
//!
//! ## Key Features
//!
//! - **Zero-allocation hot path**: frames come from preallocated pools
//! - **Timecode pairing**: video and audio are matched by a wrapping 16-bit timecode
//! - **Format decoding**: device mode codes map to resolution, rate and interlacing
//! - **Pluggable transport**: hardware bindings and the in-memory loopback share one trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shuttlecap::loopback::LoopbackContext;
//! use shuttlecap::{CaptureInterface, IoPump, UsbCapture};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), shuttlecap::CaptureError> {
//!     let context = LoopbackContext::new();
//!     let device = context.add_device("Loopback card");
//!
//!     let mut capture = UsbCapture::builder(0, Arc::new(device))
//!         .frame_callback(|pair| {
//!             println!(
//!                 "{}x{} frame with {} audio bytes",
//!                 pair.video_format.width,
//!                 pair.video_format.height,
//!                 pair.audio.len()
//!             );
//!         })
//!         .on_disconnect(|| eprintln!("card unplugged"))
//!         .build()?;
//!
//!     capture.configure()?;
//!     IoPump::start(Arc::new(context))?;
//!     capture.start()?;
//!
//!     // ... capture runs until the application shuts down
//!
//!     capture.stop()?;
//!     IoPump::stop()?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use shuttlecap_core::{
    decode_video_format, AudioFormat, AudioInput, CaptureError, CaptureResult, CaptureStats,
    DecodedFormat, ErrorCategory, FormatStatus, Frame, FrameAllocator, PixelFormat, PoolConfig,
    PoolFrameAllocator, PoolStats, VideoFormat, VideoInput, VideoMode,
};

pub use shuttlecap_media::{CaptureInterface, DequeueHooks, FrameCallback, PairedFrames};

#[cfg(feature = "diagnostics")]
pub use shuttlecap_diagnostics::{CaptureReport, DebugLogger};

// Public API modules
pub mod config;
pub mod event;
pub mod loopback;
pub mod pump;
pub mod session;
pub mod usb;

// Re-export main API types
pub use config::CaptureConfig;
pub use event::{CaptureEvent, EventStream};
pub use pump::{IoPump, TransferHandler};
pub use session::{CaptureBuilder, CaptureState, DisconnectCallback, UsbCapture};
pub use usb::{
    find_xfer_size_for_width, Endpoint, IsoTransfer, RejectedTransfer, TransferStatus,
    UsbContext, UsbDevice,
};
