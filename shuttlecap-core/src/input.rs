//! Operator-selectable inputs and modes
//!
//! The card is configured with one 32-bit mode word. Video and audio input
//! selections occupy disjoint bits of that word, so their ids are the bit
//! patterns themselves.

use crate::error::{CaptureError, CaptureResult};
use crate::format::PixelFormat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Video connector feeding the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VideoInput {
    /// HDMI or SDI, whichever is connected
    #[default]
    HdmiSdi,
    /// Analog component
    Component,
    /// Analog composite
    Composite,
    /// S-video
    SVideo,
}

impl VideoInput {
    /// Every input in id order
    pub const ALL: [VideoInput; 4] = [
        VideoInput::HdmiSdi,
        VideoInput::Component,
        VideoInput::Composite,
        VideoInput::SVideo,
    ];

    /// Bits of the mode word selecting this input
    pub fn id(self) -> u32 {
        match self {
            VideoInput::HdmiSdi => 0x0000_0000,
            VideoInput::Component => 0x0200_0000,
            VideoInput::Composite => 0x0400_0000,
            VideoInput::SVideo => 0x0600_0000,
        }
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            VideoInput::HdmiSdi => "HDMI/SDI",
            VideoInput::Component => "Component",
            VideoInput::Composite => "Composite",
            VideoInput::SVideo => "S-video",
        }
    }

    /// Look up an input by its id
    pub fn from_id(id: u32) -> CaptureResult<Self> {
        Self::ALL
            .into_iter()
            .find(|input| input.id() == id)
            .ok_or_else(|| CaptureError::InvalidConfiguration {
                message: format!("unknown video input id 0x{id:08x}"),
            })
    }
}

impl fmt::Display for VideoInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Audio source feeding the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioInput {
    /// Audio embedded in the HDMI/SDI signal
    #[default]
    Embedded,
    /// Analog line input
    Analog,
}

impl AudioInput {
    /// Every input in id order
    pub const ALL: [AudioInput; 2] = [AudioInput::Embedded, AudioInput::Analog];

    /// Bits of the mode word selecting this input
    pub fn id(self) -> u32 {
        match self {
            AudioInput::Embedded => 0x0000_0000,
            AudioInput::Analog => 0x1000_0000,
        }
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            AudioInput::Embedded => "Embedded",
            AudioInput::Analog => "Analog",
        }
    }

    /// Look up an input by its id
    pub fn from_id(id: u32) -> CaptureResult<Self> {
        Self::ALL
            .into_iter()
            .find(|input| input.id() == id)
            .ok_or_else(|| CaptureError::InvalidConfiguration {
                message: format!("unknown audio input id 0x{id:08x}"),
            })
    }
}

impl fmt::Display for AudioInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Id of the only video mode this hardware offers
pub const AUTODETECT_VIDEO_MODE: u32 = 0;

/// Selectable video mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMode {
    /// Display name
    pub name: String,
    /// When set the remaining fields are meaningless
    pub autodetect: bool,
    /// Width in pixels
    pub width: u32,
    /// Height in lines
    pub height: u32,
    /// Frame rate numerator
    pub frame_rate_num: u32,
    /// Frame rate denominator
    pub frame_rate_den: u32,
    /// Whether the mode is interlaced
    pub interlaced: bool,
}

impl VideoMode {
    /// The autodetect pseudo-mode
    pub fn autodetect() -> Self {
        Self {
            name: "Autodetect".to_string(),
            autodetect: true,
            width: 0,
            height: 0,
            frame_rate_num: 0,
            frame_rate_den: 0,
            interlaced: false,
        }
    }
}

/// Base bits of every capture mode word
const MODE_WORD_BASE: u32 = 0x0900_0000;
/// Mode word bit requesting 8-bit samples
const MODE_WORD_EIGHT_BIT: u32 = 0x2000_0000;

/// Build the 32-bit mode word the card is programmed with
pub fn capture_mode_word(
    pixel_format: PixelFormat,
    video_input: VideoInput,
    audio_input: AudioInput,
) -> u32 {
    let mut word = MODE_WORD_BASE | video_input.id() | audio_input.id();
    if pixel_format == PixelFormat::EightBitYCbCr {
        word |= MODE_WORD_EIGHT_BIT;
    }
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_ids_round_trip() {
        for input in VideoInput::ALL {
            assert_eq!(VideoInput::from_id(input.id()).ok(), Some(input));
        }
        for input in AudioInput::ALL {
            assert_eq!(AudioInput::from_id(input.id()).ok(), Some(input));
        }
    }

    #[test]
    fn test_unknown_input_rejected() {
        let err = VideoInput::from_id(0x0100_0000).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
        assert!(AudioInput::from_id(0x2000_0000).is_err());
    }

    #[test]
    fn test_mode_word() {
        assert_eq!(
            capture_mode_word(
                PixelFormat::EightBitYCbCr,
                VideoInput::HdmiSdi,
                AudioInput::Embedded
            ),
            0x2900_0000
        );
        assert_eq!(
            capture_mode_word(
                PixelFormat::TenBitYCbCr,
                VideoInput::SVideo,
                AudioInput::Analog
            ),
            0x1f00_0000
        );
    }
}
