//! Video and audio format descriptors
//!
//! The device reports its current video mode as a 16-bit code in every frame
//! header. [`decode_video_format`] turns that code into geometry and timing.
//! Audio blocks carry no sample rate, so [`guess_sample_rate`] infers it from
//! the block length and the frame rate.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Format code the device sends while no input signal is present
pub const NO_SIGNAL_FORMAT: u16 = 0x0800;

/// Bit that selects 8-bit (`width * 2`) stride over packed 10-bit stride
const EIGHT_BIT_FLAG: u16 = 0x0800;
/// High bits every real video mode code carries
const VALID_MODE_MASK: u16 = 0xe000;
/// Deep colour, dropframe and reserved bits ignored by the mode table
const NORMALIZE_MASK: u16 = 0xe80c;

/// Sample rates the device is known to produce
pub const CANDIDATE_SAMPLE_RATES: [u32; 3] = [32000, 44100, 48000];
/// Sample rate assumed before any audio has been measured
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
/// Bytes per audio sample
pub const AUDIO_BYTES_PER_SAMPLE: usize = 3;
/// Channels in every audio block
pub const AUDIO_CHANNELS: usize = 8;

/// Pixel layout the card is asked to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit 4:2:2 in Cb Y Cr Y order (UYVY)
    #[default]
    EightBitYCbCr,
    /// 10-bit 4:2:2 packed as v210
    TenBitYCbCr,
}

impl PixelFormat {
    /// All formats the hardware supports
    pub const ALL: [PixelFormat; 2] = [PixelFormat::EightBitYCbCr, PixelFormat::TenBitYCbCr];

    /// Bytes per line for a given width
    pub fn stride(self, width: u32) -> u32 {
        match self {
            PixelFormat::EightBitYCbCr => width * 2,
            PixelFormat::TenBitYCbCr => v210_stride(width),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::EightBitYCbCr => write!(f, "8-bit 4:2:2 Y'CbCr"),
            PixelFormat::TenBitYCbCr => write!(f, "10-bit 4:2:2 Y'CbCr (v210)"),
        }
    }
}

/// Line stride of packed 10-bit 4:2:2: six pixels per 16 bytes
pub fn v210_stride(width: u32) -> u32 {
    width.div_ceil(6) * 16
}

/// Decoded video geometry and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    /// Raw device code, for logging
    pub id: u16,
    /// Active width in pixels
    pub width: u32,
    /// Active height in lines
    pub height: u32,
    /// Bytes per line
    pub stride: u32,
    /// First line of the second field, zero for progressive
    pub second_field_start: u32,
    /// Blanking lines above the picture
    pub extra_lines_top: u32,
    /// Blanking lines below the picture
    pub extra_lines_bottom: u32,
    /// Frame rate numerator
    pub frame_rate_nom: u32,
    /// Frame rate denominator
    pub frame_rate_den: u32,
    /// Whether the picture is interlaced
    pub interlaced: bool,
    /// Whether an input signal is present
    pub has_signal: bool,
    /// Whether the source is connected at all
    pub is_connected: bool,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            id: 0,
            width: 0,
            height: 0,
            stride: 0,
            second_field_start: 0,
            extra_lines_top: 0,
            extra_lines_bottom: 0,
            frame_rate_nom: 0,
            frame_rate_den: 0,
            interlaced: false,
            has_signal: false,
            is_connected: true,
        }
    }
}

impl VideoFormat {
    /// Frame rate as a float, zero if the denominator is zero
    pub fn frame_rate(&self) -> f64 {
        if self.frame_rate_den == 0 {
            0.0
        } else {
            f64::from(self.frame_rate_nom) / f64::from(self.frame_rate_den)
        }
    }
}

/// Decoded audio block layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Raw device code, for logging
    pub id: u16,
    /// Bits per sample
    pub bits_per_sample: u32,
    /// Number of interleaved channels
    pub num_channels: u32,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioFormat {
    /// 24-bit, 8-channel layout the card always delivers
    pub fn embedded(id: u16, sample_rate: u32) -> Self {
        Self {
            id,
            bits_per_sample: (AUDIO_BYTES_PER_SAMPLE * 8) as u32,
            num_channels: AUDIO_CHANNELS as u32,
            sample_rate,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            id: 0,
            bits_per_sample: 0,
            num_channels: 0,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

/// How a format code was recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatStatus {
    /// The device reported the no-signal code
    NoSignal,
    /// The code is a known video mode
    Supported,
    /// Well-formed code missing from the mode table; geometry is a 2x2 placeholder
    Unsupported,
    /// Not a video mode code at all
    Invalid,
}

/// Result of [`decode_video_format`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedFormat {
    /// Geometry and timing, always populated
    pub format: VideoFormat,
    /// Classification of the code
    pub status: FormatStatus,
}

impl DecodedFormat {
    /// Whether the frame should be delivered with its video payload
    ///
    /// Only [`FormatStatus::Invalid`] counts as failure; unsupported modes
    /// are delivered so the consumer can show an explicit notice.
    pub fn is_success(&self) -> bool {
        self.status != FormatStatus::Invalid
    }
}

struct ModeEntry {
    normalized: u16,
    width: u32,
    height: u32,
    second_field_start: u32,
    extra_lines_top: u32,
    extra_lines_bottom: u32,
    frame_rate_nom: u32,
    frame_rate_den: u32,
    interlaced: bool,
}

#[allow(clippy::too_many_arguments)]
const fn mode(
    normalized: u16,
    width: u32,
    height: u32,
    second_field_start: u32,
    extra_lines_top: u32,
    extra_lines_bottom: u32,
    frame_rate_nom: u32,
    frame_rate_den: u32,
    interlaced: bool,
) -> ModeEntry {
    ModeEntry {
        normalized,
        width,
        height,
        second_field_start,
        extra_lines_top,
        extra_lines_bottom,
        frame_rate_nom,
        frame_rate_den,
        interlaced,
    }
}

#[rustfmt::skip]
const MODE_TABLE: [ModeEntry; 18] = [
    mode(0x01f1,  720,  480,   0, 40,  5, 60000, 1001, false),
    mode(0x0131,  720,  576,   0, 44,  5,    50,    1, false),
    mode(0x0141, 1280,  720,   0, 25,  5,    50,    1, false),
    mode(0x0151,  720,  576,   0, 44,  5,    50,    1, false),
    mode(0x0011,  720,  576,   0, 44,  5,    50,    1, false),
    mode(0x0143, 1280,  720,   0, 25,  5,    50,    1, false),
    mode(0x0161, 1280,  720,   0, 25,  5,    50,    1, false),
    mode(0x0103, 1280,  720,   0, 25,  5,    60,    1, false),
    mode(0x0125, 1280,  720,   0, 25,  5,    60,    1, false),
    mode(0x0121, 1280,  720,   0, 25,  5, 60000, 1001, false),
    mode(0x01c3, 1920, 1080,   0, 41,  4,    30,    1, false),
    mode(0x0003, 1920, 1080, 583, 20, 25,    30,    1,  true),
    mode(0x01e1, 1920, 1080,   0, 41,  4, 30000, 1001, false),
    mode(0x0021, 1920, 1080, 583, 20, 25, 30000, 1001,  true),
    mode(0x0063, 1920, 1080,   0, 41,  4,    25,    1, false),
    mode(0x0043, 1920, 1080, 583, 20, 25,    25,    1,  true),
    mode(0x0083, 1920, 1080,   0, 41,  4,    24,    1, false),
    mode(0x00a1, 1920, 1080,   0, 41,  4, 24000, 1001, false),
];

/// Legacy 480i codes, matched with the 8-bit flag cleared
const NTSC_CODES: [u16; 3] = [0xe101, 0xe1c1, 0xe001];
/// Legacy 576i codes, matched with the 8-bit flag cleared
const PAL_CODES: [u16; 5] = [0xe109, 0xe1c9, 0xe009, 0xe3e9, 0xe3e1];

/// Every normalized code in the mode table, for diagnostics and tests
pub fn known_mode_codes() -> impl Iterator<Item = u16> {
    MODE_TABLE.iter().map(|m| m.normalized)
}

fn line_stride(code: u16, width: u32) -> u32 {
    if code & EIGHT_BIT_FLAG != 0 {
        PixelFormat::EightBitYCbCr.stride(width)
    } else {
        PixelFormat::TenBitYCbCr.stride(width)
    }
}

/// Decode a device format code
pub fn decode_video_format(code: u16) -> DecodedFormat {
    let mut format = VideoFormat {
        id: code,
        ..VideoFormat::default()
    };

    if code == NO_SIGNAL_FORMAT {
        format.width = 720;
        format.height = 525;
        format.stride = 720 * 2;
        format.frame_rate_nom = 3013;
        format.frame_rate_den = 100;
        format.has_signal = false;
        return DecodedFormat {
            format,
            status: FormatStatus::NoSignal,
        };
    }

    if code & VALID_MODE_MASK != VALID_MODE_MASK {
        debug!(
            "Video format 0x{:04x} does not appear to be a video format. Assuming 60 Hz.",
            code
        );
        format.frame_rate_nom = 60;
        format.frame_rate_den = 1;
        return DecodedFormat {
            format,
            status: FormatStatus::Invalid,
        };
    }

    format.has_signal = true;
    let legacy = code & !EIGHT_BIT_FLAG;

    if NTSC_CODES.contains(&legacy) {
        format.width = 720;
        format.height = 480;
        format.stride = line_stride(code, 720);
        format.extra_lines_top = 17;
        format.extra_lines_bottom = 28;
        format.frame_rate_nom = 30000;
        format.frame_rate_den = 1001;
        format.second_field_start = 280;
        format.interlaced = true;
        return DecodedFormat {
            format,
            status: FormatStatus::Supported,
        };
    }

    if PAL_CODES.contains(&legacy) {
        format.width = 720;
        format.height = 576;
        format.stride = line_stride(code, 720);
        format.extra_lines_top = 22;
        format.extra_lines_bottom = 27;
        format.frame_rate_nom = 25;
        format.frame_rate_den = 1;
        format.second_field_start = 335;
        format.interlaced = true;
        return DecodedFormat {
            format,
            status: FormatStatus::Supported,
        };
    }

    let normalized = code & !NORMALIZE_MASK;
    if let Some(entry) = MODE_TABLE.iter().find(|m| m.normalized == normalized) {
        format.width = entry.width;
        format.height = entry.height;
        format.stride = line_stride(code, entry.width);
        format.second_field_start = entry.second_field_start;
        format.extra_lines_top = entry.extra_lines_top;
        format.extra_lines_bottom = entry.extra_lines_bottom;
        format.frame_rate_nom = entry.frame_rate_nom;
        format.frame_rate_den = entry.frame_rate_den;
        format.interlaced = entry.interlaced;
        return DecodedFormat {
            format,
            status: FormatStatus::Supported,
        };
    }

    warn!("Unsupported video format: 0x{:04x}", code);
    format.width = 2;
    format.height = 2;
    format.stride = 4;
    format.frame_rate_nom = 1;
    format.frame_rate_den = 1;
    DecodedFormat {
        format,
        status: FormatStatus::Unsupported,
    }
}

/// Infer the sample rate of an audio block
///
/// `len` is the raw block length in bytes (24-bit, 8 channels). Returns the
/// nearest standard rate within 100 Hz, or `fallback` if none is close.
pub fn guess_sample_rate(video_format: &VideoFormat, len: usize, fallback: u32) -> u32 {
    if video_format.frame_rate_den == 0 {
        return fallback;
    }
    let samples = (len / AUDIO_BYTES_PER_SAMPLE / AUDIO_CHANNELS) as u64;
    let per_second =
        samples * u64::from(video_format.frame_rate_nom) / u64::from(video_format.frame_rate_den);

    CANDIDATE_SAMPLE_RATES
        .iter()
        .copied()
        .find(|&rate| per_second.abs_diff(u64::from(rate)) <= 100)
        .unwrap_or(fallback)
}
