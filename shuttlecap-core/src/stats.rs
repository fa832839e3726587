//! Pipeline counters
//!
//! Counters are bumped from the USB event thread and the dequeue thread with
//! relaxed atomics and read back as a [`CaptureStats`] snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the demuxer and the pairing engine
#[derive(Debug, Default)]
pub struct CaptureCounters {
    /// Iso packets skipped because of a bad status
    pub packets_skipped: AtomicU64,
    /// Video frames handed to the pairing queue
    pub video_frames_queued: AtomicU64,
    /// Audio blocks handed to the pairing queue
    pub audio_blocks_queued: AtomicU64,
    /// Blocks dropped because their timecode went backwards
    pub frames_dropped_backwards: AtomicU64,
    /// Frames dropped because the allocator was exhausted
    pub allocation_failures: AtomicU64,
    /// Video/audio pairs delivered to the consumer
    pub pairs_delivered: AtomicU64,
    /// Pairs delivered without video because decoding failed
    pub video_decode_failures: AtomicU64,
    /// Pairs delivered with an unrecognised format code
    pub unsupported_formats: AtomicU64,
    /// Completed transfers that carried an error status
    pub transfer_errors: AtomicU64,
}

impl CaptureCounters {
    /// Increment one counter
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> CaptureStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CaptureStats {
            packets_skipped: get(&self.packets_skipped),
            video_frames_queued: get(&self.video_frames_queued),
            audio_blocks_queued: get(&self.audio_blocks_queued),
            frames_dropped_backwards: get(&self.frames_dropped_backwards),
            allocation_failures: get(&self.allocation_failures),
            pairs_delivered: get(&self.pairs_delivered),
            video_decode_failures: get(&self.video_decode_failures),
            unsupported_formats: get(&self.unsupported_formats),
            transfer_errors: get(&self.transfer_errors),
        }
    }
}

/// Point-in-time copy of [`CaptureCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    /// Iso packets skipped because of a bad status
    pub packets_skipped: u64,
    /// Video frames handed to the pairing queue
    pub video_frames_queued: u64,
    /// Audio blocks handed to the pairing queue
    pub audio_blocks_queued: u64,
    /// Blocks dropped because their timecode went backwards
    pub frames_dropped_backwards: u64,
    /// Frames dropped because the allocator was exhausted
    pub allocation_failures: u64,
    /// Video/audio pairs delivered to the consumer
    pub pairs_delivered: u64,
    /// Pairs delivered without video because decoding failed
    pub video_decode_failures: u64,
    /// Pairs delivered with an unrecognised format code
    pub unsupported_formats: u64,
    /// Completed transfers that carried an error status
    pub transfer_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let counters = CaptureCounters::default();
        CaptureCounters::bump(&counters.pairs_delivered);
        CaptureCounters::bump(&counters.pairs_delivered);
        CaptureCounters::bump(&counters.packets_skipped);

        let stats = counters.snapshot();
        assert_eq!(stats.pairs_delivered, 2);
        assert_eq!(stats.packets_skipped, 1);
        assert_eq!(stats.audio_blocks_queued, 0);
    }
}
