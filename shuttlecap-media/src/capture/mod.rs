//! Producer contract shared by every capture backend
//!
//! A backend delivers matched video/audio pairs through a single
//! [`FrameCallback`] and takes its buffers from [`FrameAllocator`]s, so a
//! consumer can not tell a USB card from a replay or synthetic source.
//!
//! [`FrameAllocator`]: shuttlecap_core::frame::FrameAllocator

use crate::pairing::{DequeueHooks, FrameCallback};
use shuttlecap_core::error::{CaptureError, CaptureResult};
use shuttlecap_core::format::PixelFormat;
use shuttlecap_core::input::{AudioInput, VideoInput, VideoMode, AUTODETECT_VIDEO_MODE};
use std::collections::BTreeMap;

/// Operations every capture source offers
///
/// The descriptor queries have defaults matching the hardware this crate
/// drives: a single autodetect video mode, both pixel formats, four video
/// inputs and two audio inputs.
pub trait CaptureInterface: Send {
    /// Video modes by id
    fn available_video_modes(&self) -> BTreeMap<u32, VideoMode> {
        BTreeMap::from([(AUTODETECT_VIDEO_MODE, VideoMode::autodetect())])
    }

    /// Currently selected video mode id
    fn current_video_mode(&self) -> u32 {
        AUTODETECT_VIDEO_MODE
    }

    /// Select a video mode by id
    fn set_video_mode(&mut self, video_mode_id: u32) -> CaptureResult<()> {
        if self.available_video_modes().contains_key(&video_mode_id) {
            Ok(())
        } else {
            Err(CaptureError::InvalidConfiguration {
                message: format!("unknown video mode id {video_mode_id}"),
            })
        }
    }

    /// Pixel formats the source can deliver
    fn available_pixel_formats(&self) -> Vec<PixelFormat> {
        PixelFormat::ALL.to_vec()
    }

    /// Currently selected pixel format
    fn current_pixel_format(&self) -> PixelFormat;

    /// Select the pixel format
    fn set_pixel_format(&mut self, pixel_format: PixelFormat) -> CaptureResult<()>;

    /// Video inputs by id
    fn available_video_inputs(&self) -> BTreeMap<u32, String> {
        VideoInput::ALL
            .into_iter()
            .map(|input| (input.id(), input.name().to_string()))
            .collect()
    }

    /// Currently selected video input id
    fn current_video_input(&self) -> u32;

    /// Select the video input by id
    fn set_video_input(&mut self, video_input_id: u32) -> CaptureResult<()>;

    /// Audio inputs by id
    fn available_audio_inputs(&self) -> BTreeMap<u32, String> {
        AudioInput::ALL
            .into_iter()
            .map(|input| (input.id(), input.name().to_string()))
            .collect()
    }

    /// Currently selected audio input id
    fn current_audio_input(&self) -> u32;

    /// Select the audio input by id
    fn set_audio_input(&mut self, audio_input_id: u32) -> CaptureResult<()>;

    /// Register the consumer of matched pairs; must happen before `configure`
    fn set_frame_callback(&mut self, callback: FrameCallback) -> CaptureResult<()>;

    /// Register init/cleanup closures for the dequeue thread
    fn set_dequeue_hooks(&mut self, hooks: DequeueHooks) -> CaptureResult<()>;

    /// Human readable name of the source
    fn description(&self) -> String;

    /// Open the source and start the dequeue thread
    fn configure(&mut self) -> CaptureResult<()>;

    /// Start delivering frames
    fn start(&mut self) -> CaptureResult<()>;

    /// Stop delivering frames and release the source
    fn stop(&mut self) -> CaptureResult<()>;

    /// Whether the source went away for good
    fn is_disconnected(&self) -> bool;
}
