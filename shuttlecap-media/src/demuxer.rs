//! Isochronous packet demuxer
//!
//! Each endpoint delivers a continuous byte stream chopped into iso packets
//! with no relation to frame boundaries. The demuxer scans every packet for
//! the stream's sync marker, appends the bytes in between to the frame being
//! built, and on every marker closes that frame, queues it for pairing and
//! starts a fresh one.
//!
//! Everything here runs on the USB event thread: it never blocks beyond the
//! short allocator and queue locks and never touches the heap.

use crate::pairing::{PairingQueues, QueuedFrame};
use shuttlecap_core::format::{decode_video_format, FormatStatus, NO_SIGNAL_FORMAT};
use shuttlecap_core::frame::{Frame, FrameAllocator};
use shuttlecap_core::stats::CaptureCounters;
use shuttlecap_core::wire_format::{
    find_marker, BlockHeader, AUDIO_PAYLOAD_OFFSET, AUDIO_SYNC_PATTERN, VIDEO_PAYLOAD_OFFSET,
    VIDEO_SYNC_PATTERN,
};
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;
use tracing::{trace, warn};

/// Smallest width transfer sizing is ever computed for
pub const MIN_WIDTH: u32 = 640;
/// Width assumed before the first frame has been decoded
pub const INITIAL_ASSUMED_WIDTH: u32 = 1280;

/// Which of the two device streams a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// Video frames on the video endpoint
    Video,
    /// Audio blocks on the audio endpoint
    Audio,
}

impl StreamRole {
    /// Marker that starts a block of this stream
    pub fn sync_pattern(self) -> &'static [u8] {
        match self {
            StreamRole::Video => VIDEO_SYNC_PATTERN,
            StreamRole::Audio => AUDIO_SYNC_PATTERN,
        }
    }

    /// Header bytes in front of the payload of a delivered block
    pub fn payload_offset(self) -> usize {
        match self {
            StreamRole::Video => VIDEO_PAYLOAD_OFFSET,
            StreamRole::Audio => AUDIO_PAYLOAD_OFFSET,
        }
    }

    /// Lowercase name for logs
    pub fn name(self) -> &'static str {
        match self {
            StreamRole::Video => "video",
            StreamRole::Audio => "audio",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One received iso packet
#[derive(Debug, Clone, Copy)]
pub struct IsoPacket<'a> {
    /// Whether the packet completed without error
    pub completed: bool,
    /// Bytes actually received
    pub data: &'a [u8],
}

impl<'a> IsoPacket<'a> {
    /// A successfully received packet
    pub fn ok(data: &'a [u8]) -> Self {
        Self {
            completed: true,
            data,
        }
    }
}

/// Splits both device streams into frames
pub struct PacketDemuxer {
    video_allocator: Arc<dyn FrameAllocator>,
    audio_allocator: Arc<dyn FrameAllocator>,
    queues: Arc<PairingQueues>,
    counters: Arc<CaptureCounters>,
    current_video: Frame,
    current_audio: Frame,
    assumed_width: u32,
    last_video_format: Option<u16>,
}

impl PacketDemuxer {
    /// Create a demuxer feeding `queues`
    ///
    /// The first frames are allocated right away so the first marker has
    /// something to close.
    pub fn new(
        video_allocator: Arc<dyn FrameAllocator>,
        audio_allocator: Arc<dyn FrameAllocator>,
        queues: Arc<PairingQueues>,
        counters: Arc<CaptureCounters>,
    ) -> Self {
        let current_video = video_allocator.alloc_frame();
        let current_audio = audio_allocator.alloc_frame();
        Self {
            video_allocator,
            audio_allocator,
            queues,
            counters,
            current_video,
            current_audio,
            assumed_width: INITIAL_ASSUMED_WIDTH,
            last_video_format: None,
        }
    }

    /// Width transfer sizing should currently plan for
    pub fn assumed_width(&self) -> u32 {
        self.assumed_width
    }

    /// Last video format code seen in a block header
    pub fn last_video_format(&self) -> Option<u16> {
        self.last_video_format
    }

    /// Frame currently being filled for `role`
    pub fn current(&self, role: StreamRole) -> &Frame {
        match role {
            StreamRole::Video => &self.current_video,
            StreamRole::Audio => &self.current_audio,
        }
    }

    fn current_mut(&mut self, role: StreamRole) -> &mut Frame {
        match role {
            StreamRole::Video => &mut self.current_video,
            StreamRole::Audio => &mut self.current_audio,
        }
    }

    /// Route one batch of packets from a single endpoint
    pub fn decode_packets<'a, I>(&mut self, role: StreamRole, packets: I)
    where
        I: IntoIterator<Item = IsoPacket<'a>>,
    {
        let pattern = role.sync_pattern();
        for (index, packet) in packets.into_iter().enumerate() {
            if !packet.completed {
                trace!(
                    "Skipping incomplete {} packet {} ({} bytes)",
                    role,
                    index,
                    packet.data.len()
                );
                CaptureCounters::bump(&self.counters.packets_skipped);
                continue;
            }

            let mut rest = packet.data;
            while !rest.is_empty() {
                match find_marker(rest, pattern) {
                    None => {
                        self.current_mut(role).append(rest, role.name());
                        break;
                    }
                    Some(pos) => {
                        self.current_mut(role).append(&rest[..pos], role.name());
                        // The header stays in the stream so it opens the next block.
                        rest = &rest[pos + pattern.len()..];
                        let header = BlockHeader::parse(rest);
                        match role {
                            StreamRole::Video => self.start_new_video_frame(header),
                            StreamRole::Audio => self.start_new_audio_block(header),
                        }
                    }
                }
            }
        }
    }

    fn start_new_video_frame(&mut self, header: BlockHeader) {
        if !self.current_video.is_empty() {
            let mut frame = mem::take(&mut self.current_video);
            frame.mark_received(Instant::now());

            if header.format == NO_SIGNAL_FORMAT {
                // No real audio accompanies a no-signal period, but every
                // video entry needs an audio partner to be paired with.
                let fake_audio = self.audio_allocator.alloc_frame();
                if !fake_audio.has_data() {
                    warn!("Couldn't allocate fake audio frame, also dropping no-signal video frame.");
                    CaptureCounters::bump(&self.counters.allocation_failures);
                    frame.release();
                    self.current_video = self.fresh_frame(StreamRole::Video);
                    return;
                }
                self.push(StreamRole::Audio, header, fake_audio);
            }
            self.push(StreamRole::Video, header, frame);
            self.note_video_format(header.format);
        }

        if !self.current_video.has_data() {
            self.current_video = self.fresh_frame(StreamRole::Video);
        }
    }

    fn start_new_audio_block(&mut self, header: BlockHeader) {
        if !self.current_audio.is_empty() {
            let mut frame = mem::take(&mut self.current_audio);
            frame.mark_received(Instant::now());
            self.push(StreamRole::Audio, header, frame);
        }

        if !self.current_audio.has_data() {
            self.current_audio = self.fresh_frame(StreamRole::Audio);
        }
    }

    fn push(&self, role: StreamRole, header: BlockHeader, frame: Frame) {
        let queued = QueuedFrame {
            format: header.format,
            timecode: header.timecode,
            frame,
        };
        if self.queues.enqueue(role, queued) {
            match role {
                StreamRole::Video => CaptureCounters::bump(&self.counters.video_frames_queued),
                StreamRole::Audio => CaptureCounters::bump(&self.counters.audio_blocks_queued),
            }
        }
    }

    fn fresh_frame(&self, role: StreamRole) -> Frame {
        let frame = match role {
            StreamRole::Video => self.video_allocator.alloc_frame(),
            StreamRole::Audio => self.audio_allocator.alloc_frame(),
        };
        if !frame.has_data() {
            CaptureCounters::bump(&self.counters.allocation_failures);
        }
        frame
    }

    /// Remember the width of a newly seen format for transfer sizing
    fn note_video_format(&mut self, code: u16) {
        if self.last_video_format == Some(code) {
            return;
        }
        self.last_video_format = Some(code);

        let decoded = decode_video_format(code);
        if matches!(
            decoded.status,
            FormatStatus::Supported | FormatStatus::NoSignal
        ) {
            self.assumed_width = decoded.format.width.max(MIN_WIDTH);
        }
    }

    /// Return both in-progress frames to their allocators
    pub fn release_current(&mut self) {
        mem::take(&mut self.current_video).release();
        mem::take(&mut self.current_audio).release();
    }
}

impl fmt::Debug for PacketDemuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketDemuxer")
            .field("current_video", &self.current_video)
            .field("current_audio", &self.current_audio)
            .field("assumed_width", &self.assumed_width)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shuttlecap_core::pool::{PoolConfig, PoolFrameAllocator};

    struct Rig {
        video_pool: Arc<PoolFrameAllocator>,
        audio_pool: Arc<PoolFrameAllocator>,
        queues: Arc<PairingQueues>,
        demuxer: PacketDemuxer,
    }

    fn rig(video_frames: usize, audio_frames: usize) -> Rig {
        let video_pool = PoolFrameAllocator::new(PoolConfig::small(4096, video_frames));
        let audio_pool = PoolFrameAllocator::new(PoolConfig::small(1024, audio_frames));
        let counters = Arc::new(CaptureCounters::default());
        let queues = Arc::new(PairingQueues::new(
            video_frames,
            audio_frames,
            Arc::clone(&counters),
        ));
        let demuxer = PacketDemuxer::new(
            video_pool.clone(),
            audio_pool.clone(),
            Arc::clone(&queues),
            counters,
        );
        Rig {
            video_pool,
            audio_pool,
            queues,
            demuxer,
        }
    }

    fn video_block(timecode: u16, format: u16, payload: &[u8]) -> Vec<u8> {
        let mut block = VIDEO_SYNC_PATTERN.to_vec();
        block.extend_from_slice(
            &BlockHeader {
                timecode,
                format,
            }
            .to_bytes(),
        );
        block.extend_from_slice(payload);
        block
    }

    #[test]
    fn test_bytes_before_first_marker_fill_current_frame() {
        let mut rig = rig(4, 4);
        rig.demuxer
            .decode_packets(StreamRole::Video, [IsoPacket::ok(b"garbage")]);
        assert_eq!(rig.demuxer.current(StreamRole::Video).data(), b"garbage");
        assert_eq!(rig.queues.pending(), (0, 0));
    }

    #[test]
    fn test_marker_closes_frame_and_keeps_header() {
        let mut rig = rig(4, 4);
        let mut stream = video_block(1, 0xe901, b"first");
        stream.extend(video_block(2, 0xe901, b"second"));
        rig.demuxer
            .decode_packets(StreamRole::Video, [IsoPacket::ok(&stream)]);

        // the leading marker found an empty frame, so only one was closed
        assert_eq!(rig.queues.pending(), (1, 0));
        let current = rig.demuxer.current(StreamRole::Video);
        assert_eq!(&current.data()[..4], &[2, 0, 0x01, 0xe9]);
        assert_eq!(&current.data()[4..], b"second");
    }

    #[test]
    fn test_marker_split_across_packets_is_not_seen() {
        let mut rig = rig(4, 4);
        rig.demuxer.decode_packets(
            StreamRole::Video,
            [IsoPacket::ok(b"ab\x00\x00"), IsoPacket::ok(b"\xff\xffcd")],
        );
        assert_eq!(rig.demuxer.current(StreamRole::Video).len(), 8);
    }

    #[test]
    fn test_incomplete_packets_skipped() {
        let mut rig = rig(4, 4);
        rig.demuxer.decode_packets(
            StreamRole::Audio,
            [
                IsoPacket {
                    completed: false,
                    data: b"lost",
                },
                IsoPacket::ok(b"kept"),
            ],
        );
        assert_eq!(rig.demuxer.current(StreamRole::Audio).data(), b"kept");
    }

    #[test]
    fn test_no_signal_frame_gets_fake_audio() {
        let mut rig = rig(4, 4);
        let mut stream = video_block(1, NO_SIGNAL_FORMAT, b"black");
        stream.extend(video_block(2, NO_SIGNAL_FORMAT, b""));
        rig.demuxer
            .decode_packets(StreamRole::Video, [IsoPacket::ok(&stream)]);

        assert_eq!(rig.queues.pending(), (1, 1));
        let (video, audio) = rig.queues.try_pair().unwrap();
        assert_eq!(video.format, NO_SIGNAL_FORMAT);
        assert!(audio.frame.is_empty());
        assert!(audio.frame.has_data());
    }

    #[test]
    fn test_no_signal_without_audio_buffers_drops_video() {
        // the demuxer holds the only audio frame as its in-progress block
        let mut rig = rig(4, 1);
        let mut stream = video_block(1, NO_SIGNAL_FORMAT, b"black");
        stream.extend(video_block(2, NO_SIGNAL_FORMAT, b""));
        rig.demuxer
            .decode_packets(StreamRole::Video, [IsoPacket::ok(&stream)]);

        assert_eq!(rig.queues.pending(), (0, 0));
        // one frame in progress, the dropped one went back to the pool
        assert_eq!(rig.video_pool.free_count(), 3);
        assert_eq!(rig.audio_pool.free_count(), 0);
    }

    #[test]
    fn test_assumed_width_follows_decoded_format() {
        let mut rig = rig(4, 4);
        assert_eq!(rig.demuxer.assumed_width(), INITIAL_ASSUMED_WIDTH);

        let mut stream = video_block(1, 0xe901, b"x");
        stream.extend(video_block(2, 0xe82d, b"y"));
        stream.extend(video_block(3, 0xe82d, b""));
        rig.demuxer
            .decode_packets(StreamRole::Video, [IsoPacket::ok(&stream)]);
        assert_eq!(rig.demuxer.assumed_width(), 1920);
    }

    #[test]
    fn test_exhausted_pool_drops_silently() {
        let mut rig = rig(1, 4);
        let mut stream = video_block(1, 0xe901, b"one");
        stream.extend(video_block(2, 0xe901, b"two"));
        stream.extend(video_block(3, 0xe901, b"three"));
        rig.demuxer
            .decode_packets(StreamRole::Video, [IsoPacket::ok(&stream)]);

        // only the first frame had storage; the rest of the stream was discarded
        assert_eq!(rig.queues.pending(), (1, 0));
        assert!(!rig.demuxer.current(StreamRole::Video).has_data());
    }

    #[test]
    fn test_release_current_returns_frames() {
        let mut rig = rig(2, 2);
        rig.demuxer.release_current();
        assert_eq!(rig.video_pool.free_count(), 2);
        assert_eq!(rig.audio_pool.free_count(), 2);
    }
}
