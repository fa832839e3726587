//! Integration tests for the demux and pairing pipeline
//!
//! Synthetic packet streams are pushed through a [`PacketDemuxer`] while a
//! [`DequeueWorker`] delivers matched pairs to a channel-backed callback.

use shuttlecap_core::wire_format::{AUDIO_SYNC_PATTERN, VIDEO_SYNC_PATTERN};
use shuttlecap_core::*;
use shuttlecap_media::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

const NTSC_8BIT: u16 = 0xe901;
/// Samples per channel in one 29.97 fps block at 48 kHz (rounded down)
const SAMPLES_PER_BLOCK: usize = 1601;

struct Pipeline {
    video_pool: Arc<PoolFrameAllocator>,
    audio_pool: Arc<PoolFrameAllocator>,
    queues: Arc<PairingQueues>,
    counters: Arc<CaptureCounters>,
    demuxer: PacketDemuxer,
}

fn pipeline() -> Pipeline {
    let video_pool = PoolFrameAllocator::new(PoolConfig::small(4096, 8));
    let audio_pool = PoolFrameAllocator::new(PoolConfig::small(65536, 8));
    let counters = Arc::new(CaptureCounters::default());
    let queues = Arc::new(PairingQueues::new(8, 8, Arc::clone(&counters)));
    let demuxer = PacketDemuxer::new(
        video_pool.clone(),
        audio_pool.clone(),
        Arc::clone(&queues),
        Arc::clone(&counters),
    );
    Pipeline {
        video_pool,
        audio_pool,
        queues,
        counters,
        demuxer,
    }
}

fn block(pattern: &[u8], timecode: u16, format: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = pattern.to_vec();
    out.extend_from_slice(&BlockHeader { timecode, format }.to_bytes());
    out.extend_from_slice(payload);
    out
}

#[derive(Debug)]
struct Delivered {
    timecode: u16,
    width: u32,
    height: u32,
    interlaced: bool,
    sample_rate: u32,
    video_payload: Vec<u8>,
    has_video: bool,
}

fn channel_callback() -> (FrameCallback, mpsc::Receiver<Delivered>) {
    let (tx, rx) = mpsc::channel();
    let callback: FrameCallback = Box::new(move |pair: PairedFrames| {
        let delivered = Delivered {
            timecode: pair.timecode,
            width: pair.video_format.width,
            height: pair.video_format.height,
            interlaced: pair.video_format.interlaced,
            sample_rate: pair.audio_format.sample_rate,
            video_payload: pair.video.payload(BLOCK_HEADER_LEN).to_vec(),
            has_video: pair.video.has_data(),
        };
        pair.video.release();
        pair.audio.release();
        let _ = tx.send(delivered);
    });
    (callback, rx)
}

// ============================================================================
// END-TO-END TESTS
// ============================================================================

#[test]
fn test_two_ntsc_frames_pair_with_48k_audio() -> anyhow::Result<()> {
    let mut p = pipeline();
    let (callback, rx) = channel_callback();
    let mut worker = DequeueWorker::spawn(
        "test-dequeue".to_string(),
        Arc::clone(&p.queues),
        callback,
        DequeueHooks::default(),
        Arc::clone(&p.counters),
    )?;

    // frame bodies spill over into a second packet before the next marker
    let video = [
        block(VIDEO_SYNC_PATTERN, 1, NTSC_8BIT, b"frame-"),
        b"one".to_vec(),
        block(VIDEO_SYNC_PATTERN, 2, NTSC_8BIT, b"frame-"),
        b"two".to_vec(),
        block(VIDEO_SYNC_PATTERN, 3, NTSC_8BIT, b""),
    ];
    p.demuxer.decode_packets(
        StreamRole::Video,
        video.iter().map(|packet| IsoPacket::ok(packet)),
    );

    let samples = vec![0u8; SAMPLES_PER_BLOCK * 3 * 8];
    let audio = [
        block(AUDIO_SYNC_PATTERN, 1, 0, &samples),
        block(AUDIO_SYNC_PATTERN, 2, 0, &samples),
        block(AUDIO_SYNC_PATTERN, 3, 0, b""),
    ];
    p.demuxer.decode_packets(
        StreamRole::Audio,
        audio.iter().map(|packet| IsoPacket::ok(packet)),
    );

    let first = rx.recv_timeout(Duration::from_secs(5))?;
    let second = rx.recv_timeout(Duration::from_secs(5))?;
    for delivered in [&first, &second] {
        assert!(delivered.has_video);
        assert_eq!(delivered.width, 720);
        assert_eq!(delivered.height, 480);
        assert!(delivered.interlaced);
        assert_eq!(delivered.sample_rate, 48000);
    }
    assert_eq!(first.timecode, 2);
    assert_eq!(second.timecode, 3);
    assert_eq!(first.video_payload, b"frame-one");
    assert_eq!(second.video_payload, b"frame-two");

    worker.stop();
    assert!(rx.try_recv().is_err());
    assert_eq!(p.counters.snapshot().pairs_delivered, 2);
    assert_eq!(p.queues.pending(), (0, 0));

    p.demuxer.release_current();
    assert_eq!(p.video_pool.free_count(), 8);
    assert_eq!(p.audio_pool.free_count(), 8);
    Ok(())
}

#[test]
fn test_undecodable_video_still_delivers_audio() -> anyhow::Result<()> {
    let mut p = pipeline();
    let (callback, rx) = channel_callback();
    let mut worker = DequeueWorker::spawn(
        "test-dequeue-invalid".to_string(),
        Arc::clone(&p.queues),
        callback,
        DequeueHooks::default(),
        Arc::clone(&p.counters),
    )?;

    let mut video = block(VIDEO_SYNC_PATTERN, 10, 0x0123, b"noise");
    video.extend(block(VIDEO_SYNC_PATTERN, 11, 0x0123, b""));
    p.demuxer
        .decode_packets(StreamRole::Video, [IsoPacket::ok(&video)]);

    let mut audio = block(AUDIO_SYNC_PATTERN, 10, 0, b"pcm");
    audio.extend(block(AUDIO_SYNC_PATTERN, 11, 0, b""));
    p.demuxer
        .decode_packets(StreamRole::Audio, [IsoPacket::ok(&audio)]);

    let delivered = rx.recv_timeout(Duration::from_secs(5))?;
    assert!(!delivered.has_video);
    assert_eq!(delivered.sample_rate, 48000);
    assert_eq!(p.counters.snapshot().video_decode_failures, 1);

    worker.stop();
    Ok(())
}

/// Stamps a sequence number on every frame it hands out
struct TaggingAllocator {
    pool: Arc<PoolFrameAllocator>,
    next_tag: AtomicU64,
}

impl FrameAllocator for TaggingAllocator {
    fn alloc_frame(&self) -> Frame {
        let mut frame = self.pool.alloc_frame();
        if frame.has_data() {
            frame.userdata = Some(self.next_tag.fetch_add(1, Ordering::Relaxed));
        }
        frame
    }

    fn release_frame(&self, frame: Frame) {
        self.pool.release_frame(frame);
    }
}

#[test]
fn test_userdata_tags_survive_pairing() -> anyhow::Result<()> {
    let video_pool = PoolFrameAllocator::new(PoolConfig::small(4096, 4));
    let audio_pool = PoolFrameAllocator::new(PoolConfig::small(4096, 4));
    let tagging = Arc::new(TaggingAllocator {
        pool: Arc::clone(&video_pool),
        next_tag: AtomicU64::new(100),
    });
    let counters = Arc::new(CaptureCounters::default());
    let queues = Arc::new(PairingQueues::new(4, 4, Arc::clone(&counters)));
    let mut demuxer = PacketDemuxer::new(
        tagging,
        audio_pool.clone(),
        Arc::clone(&queues),
        Arc::clone(&counters),
    );

    let (tx, rx) = mpsc::channel();
    let callback: FrameCallback = Box::new(move |pair: PairedFrames| {
        let _ = tx.send((pair.video.userdata, pair.audio.userdata));
    });
    let mut worker = DequeueWorker::spawn(
        "test-dequeue-tags".to_string(),
        Arc::clone(&queues),
        callback,
        DequeueHooks::default(),
        Arc::clone(&counters),
    )?;

    let mut video = block(VIDEO_SYNC_PATTERN, 1, NTSC_8BIT, b"a");
    video.extend(block(VIDEO_SYNC_PATTERN, 2, NTSC_8BIT, b"b"));
    video.extend(block(VIDEO_SYNC_PATTERN, 3, NTSC_8BIT, b""));
    demuxer.decode_packets(StreamRole::Video, [IsoPacket::ok(&video)]);

    let mut audio = block(AUDIO_SYNC_PATTERN, 1, 0, b"x");
    audio.extend(block(AUDIO_SYNC_PATTERN, 2, 0, b"y"));
    audio.extend(block(AUDIO_SYNC_PATTERN, 3, 0, b""));
    demuxer.decode_packets(StreamRole::Audio, [IsoPacket::ok(&audio)]);

    let (first_video, first_audio) = rx.recv_timeout(Duration::from_secs(5))?;
    let (second_video, _) = rx.recv_timeout(Duration::from_secs(5))?;
    assert!(first_video.is_some_and(|tag| tag >= 100));
    assert!(second_video.is_some_and(|tag| tag >= 100));
    assert_ne!(first_video, second_video);
    assert_eq!(first_audio, None);

    worker.stop();
    demuxer.release_current();
    assert_eq!(video_pool.free_count(), 4);
    assert_eq!(audio_pool.free_count(), 4);
    Ok(())
}

#[test]
fn test_single_stream_never_fires_callback() -> anyhow::Result<()> {
    let mut p = pipeline();
    let (callback, rx) = channel_callback();
    let mut worker = DequeueWorker::spawn(
        "test-dequeue-stall".to_string(),
        Arc::clone(&p.queues),
        callback,
        DequeueHooks::default(),
        Arc::clone(&p.counters),
    )?;

    let mut video = block(VIDEO_SYNC_PATTERN, 1, NTSC_8BIT, b"a");
    video.extend(block(VIDEO_SYNC_PATTERN, 2, NTSC_8BIT, b"b"));
    video.extend(block(VIDEO_SYNC_PATTERN, 3, NTSC_8BIT, b""));
    p.demuxer
        .decode_packets(StreamRole::Video, [IsoPacket::ok(&video)]);

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(p.queues.pending(), (2, 0));

    worker.stop();
    drop(p.queues.drain());
    assert_eq!(p.video_pool.free_count(), 7);
    Ok(())
}

#[test]
fn test_dequeue_hooks_run_on_worker_thread() -> anyhow::Result<()> {
    let p = pipeline();
    let (callback, _rx) = channel_callback();
    let (tx, rx) = mpsc::channel();
    let init_tx = tx.clone();
    let hooks = DequeueHooks {
        init: Some(Box::new(move || {
            let name = std::thread::current().name().map(str::to_string);
            let _ = init_tx.send(("init", name));
        })),
        cleanup: Some(Box::new(move || {
            let _ = tx.send(("cleanup", None));
        })),
    };

    let mut worker = DequeueWorker::spawn(
        "hooked-dequeue".to_string(),
        Arc::clone(&p.queues),
        callback,
        hooks,
        Arc::clone(&p.counters),
    )?;
    let (stage, name) = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(stage, "init");
    assert_eq!(name.as_deref(), Some("hooked-dequeue"));

    worker.stop();
    let (stage, _) = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(stage, "cleanup");
    Ok(())
}

// ============================================================================
// DROP POLICY TESTS
// ============================================================================

#[test]
fn test_backwards_block_returns_buffer_to_pool() {
    let mut p = pipeline();
    let mut audio = block(AUDIO_SYNC_PATTERN, 5, 0, b"one");
    audio.extend(block(AUDIO_SYNC_PATTERN, 6, 0, b"two"));
    // timecode 6 again: the block it closes is a duplicate
    audio.extend(block(AUDIO_SYNC_PATTERN, 6, 0, b"three"));
    audio.extend(block(AUDIO_SYNC_PATTERN, 4, 0, b""));
    p.demuxer
        .decode_packets(StreamRole::Audio, [IsoPacket::ok(&audio)]);

    assert_eq!(p.queues.pending(), (0, 1));
    assert_eq!(p.counters.snapshot().frames_dropped_backwards, 2);
    // one queued, one in progress
    assert_eq!(p.audio_pool.free_count(), 6);
}
