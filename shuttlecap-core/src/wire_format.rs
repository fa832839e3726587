//! Device stream wire format
//!
//! Each isochronous stream is a continuous byte stream. A block starts with a
//! stream-specific sync marker followed by a 4-byte little-endian header:
//!
//! ```text
//! +--------------+----------------+----------------+---------------
//! | sync marker  | timecode (u16) | format (u16)   | payload ...
//! +--------------+----------------+----------------+---------------
//! ```
//!
//! The header bytes stay part of the block that follows, which is why the
//! consumer is handed a payload offset along with every frame.

use bytes::Buf;

/// Marker that starts every video frame
pub const VIDEO_SYNC_PATTERN: &[u8] = b"\x00\x00\xff\xff";
/// Marker that starts every audio block
pub const AUDIO_SYNC_PATTERN: &[u8] = b"DeckLinkAudioResyncT";

/// Size of the header that follows either marker
pub const BLOCK_HEADER_LEN: usize = 4;
/// Bytes of header at the start of a delivered video frame
pub const VIDEO_PAYLOAD_OFFSET: usize = 44;
/// Bytes of header at the start of a delivered audio block
pub const AUDIO_PAYLOAD_OFFSET: usize = BLOCK_HEADER_LEN;

/// Header that follows a sync marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHeader {
    /// Wrapping timecode of the block
    pub timecode: u16,
    /// Device format code of the block
    pub format: u16,
}

impl BlockHeader {
    /// Parse a header from the bytes right after a marker
    ///
    /// A header cut short by the end of a packet is zero-padded; the
    /// device never splits one in practice.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut raw = [0u8; BLOCK_HEADER_LEN];
        let n = bytes.len().min(BLOCK_HEADER_LEN);
        raw[..n].copy_from_slice(&bytes[..n]);

        let mut buf = &raw[..];
        Self {
            timecode: buf.get_u16_le(),
            format: buf.get_u16_le(),
        }
    }

    /// Serialize the header as it appears on the wire
    pub fn to_bytes(self) -> [u8; BLOCK_HEADER_LEN] {
        let t = self.timecode.to_le_bytes();
        let f = self.format.to_le_bytes();
        [t[0], t[1], f[0], f[1]]
    }
}

/// Position of the first occurrence of `pattern` in `haystack`
pub fn find_marker(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || haystack.len() < pattern.len() {
        return None;
    }
    let first = pattern[0];
    let last_start = haystack.len() - pattern.len();
    let mut pos = 0;
    while pos <= last_start {
        let skip = haystack[pos..=last_start].iter().position(|&b| b == first)?;
        pos += skip;
        if &haystack[pos..pos + pattern.len()] == pattern {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse() {
        let header = BlockHeader::parse(&[0x34, 0x12, 0x01, 0xe9, 0xaa]);
        assert_eq!(header.timecode, 0x1234);
        assert_eq!(header.format, 0xe901);
        assert_eq!(BlockHeader::parse(&header.to_bytes()), header);
    }

    #[test]
    fn test_short_header_is_padded() {
        let header = BlockHeader::parse(&[0x01]);
        assert_eq!(header.timecode, 1);
        assert_eq!(header.format, 0);
    }

    #[test]
    fn test_find_marker() {
        let mut stream = vec![0xffu8, 0x00, 0x00, 0xfe];
        assert_eq!(find_marker(&stream, VIDEO_SYNC_PATTERN), None);

        stream.extend_from_slice(VIDEO_SYNC_PATTERN);
        assert_eq!(find_marker(&stream, VIDEO_SYNC_PATTERN), Some(4));

        let audio = b"xxDeckLinkAudioResyncTyy";
        assert_eq!(find_marker(audio, AUDIO_SYNC_PATTERN), Some(2));
        assert_eq!(find_marker(b"Deck", AUDIO_SYNC_PATTERN), None);
    }

    #[test]
    fn test_marker_overlapping_prefix() {
        // 00 00 00 ff ff: the marker starts at the second zero
        let stream = [0x00, 0x00, 0x00, 0xff, 0xff];
        assert_eq!(find_marker(&stream, VIDEO_SYNC_PATTERN), Some(1));
    }
}
