//! Dual-queue pairing engine
//!
//! The demuxer feeds completed video frames and audio blocks into two
//! ordered queues guarded by a single lock. A dedicated dequeue thread parks
//! on a condition variable until both queues hold at least one entry, then
//! pops the oldest of each and hands the pair to the consumer callback.
//!
//! Pairs are matched purely by arrival order. Both streams come from the same
//! device clock, so the FIFO position already lines them up.

use crate::demuxer::StreamRole;
use parking_lot::{Condvar, Mutex};
use shuttlecap_core::error::{CaptureError, CaptureResult};
use shuttlecap_core::format::{
    decode_video_format, guess_sample_rate, AudioFormat, FormatStatus, VideoFormat,
    DEFAULT_SAMPLE_RATE,
};
use shuttlecap_core::frame::Frame;
use shuttlecap_core::stats::CaptureCounters;
use shuttlecap_core::timecode::timecode_precedes;
use shuttlecap_core::wire_format::{AUDIO_PAYLOAD_OFFSET, VIDEO_PAYLOAD_OFFSET};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// A closed frame waiting to be paired
#[derive(Debug)]
pub struct QueuedFrame {
    /// Format code from the block header
    pub format: u16,
    /// Wrapping timecode from the block header
    pub timecode: u16,
    /// The frame itself
    pub frame: Frame,
}

struct PendingQueues {
    video: VecDeque<QueuedFrame>,
    audio: VecDeque<QueuedFrame>,
    quit: bool,
}

impl PendingQueues {
    fn queue_mut(&mut self, role: StreamRole) -> &mut VecDeque<QueuedFrame> {
        match role {
            StreamRole::Video => &mut self.video,
            StreamRole::Audio => &mut self.audio,
        }
    }
}

/// The two pending queues and their wakeup condition
pub struct PairingQueues {
    state: Mutex<PendingQueues>,
    not_empty: Condvar,
    counters: Arc<CaptureCounters>,
}

impl PairingQueues {
    /// Create empty queues with room for the given number of entries
    ///
    /// Sizing the queues to the allocator pools means pushing never has to
    /// grow them, since every queued frame comes out of one of the pools.
    pub fn new(video_capacity: usize, audio_capacity: usize, counters: Arc<CaptureCounters>) -> Self {
        Self {
            state: Mutex::new(PendingQueues {
                video: VecDeque::with_capacity(video_capacity),
                audio: VecDeque::with_capacity(audio_capacity),
                quit: false,
            }),
            not_empty: Condvar::new(),
            counters,
        }
    }

    /// Append a closed frame to its stream's queue
    ///
    /// A frame whose timecode does not come strictly after the current tail
    /// is a duplicate or out-of-order arrival. It is released straight back
    /// to its allocator and `false` is returned.
    pub fn enqueue(&self, role: StreamRole, queued: QueuedFrame) -> bool {
        let rejected = {
            let mut state = self.state.lock();
            let queue = state.queue_mut(role);
            match queue.back() {
                Some(tail) if !timecode_precedes(tail.timecode, queued.timecode) => {
                    warn!(
                        "{} blocks going backwards: prev=0x{:04x}, cur=0x{:04x} (dropped)",
                        role.name(),
                        tail.timecode,
                        queued.timecode
                    );
                    Some(queued)
                }
                _ => {
                    queue.push_back(queued);
                    self.not_empty.notify_one();
                    None
                }
            }
        };

        match rejected {
            Some(dropped) => {
                CaptureCounters::bump(&self.counters.frames_dropped_backwards);
                dropped.frame.release();
                false
            }
            None => true,
        }
    }

    /// Block until both queues have an entry or a stop is requested
    ///
    /// Returns `None` once stopped.
    pub fn wait_pair(&self) -> Option<(QueuedFrame, QueuedFrame)> {
        let mut state = self.state.lock();
        loop {
            if state.quit {
                return None;
            }
            if !state.video.is_empty() && !state.audio.is_empty() {
                let video = state.video.pop_front()?;
                let audio = state.audio.pop_front()?;
                return Some((video, audio));
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Pop a pair if one is ready, without blocking
    pub fn try_pair(&self) -> Option<(QueuedFrame, QueuedFrame)> {
        let mut state = self.state.lock();
        if state.video.is_empty() || state.audio.is_empty() {
            return None;
        }
        let video = state.video.pop_front()?;
        let audio = state.audio.pop_front()?;
        Some((video, audio))
    }

    /// Raise the quit flag and wake the dequeue thread
    pub fn request_stop(&self) {
        self.state.lock().quit = true;
        self.not_empty.notify_all();
    }

    /// Whether a stop has been requested
    pub fn is_stopping(&self) -> bool {
        self.state.lock().quit
    }

    /// Number of (video, audio) entries waiting
    pub fn pending(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.video.len(), state.audio.len())
    }

    /// Entries each queue holds before it has to grow
    pub fn capacity(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.video.capacity(), state.audio.capacity())
    }

    /// Remove every waiting entry
    ///
    /// The caller owns the returned frames; dropping them returns them to
    /// their allocators.
    pub fn drain(&self) -> Vec<QueuedFrame> {
        let mut state = self.state.lock();
        let mut drained: Vec<QueuedFrame> = state.video.drain(..).collect();
        drained.extend(state.audio.drain(..));
        drained
    }
}

impl fmt::Debug for PairingQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (video, audio) = self.pending();
        f.debug_struct("PairingQueues")
            .field("video", &video)
            .field("audio", &audio)
            .finish()
    }
}

/// One matched video/audio pair as delivered to the consumer
///
/// The consumer owns both frames and must eventually release them (dropping
/// them has the same effect).
#[derive(Debug)]
pub struct PairedFrames {
    /// Timecode of the video frame
    pub timecode: u16,
    /// Video frame, empty if its format could not be decoded
    pub video: Frame,
    /// Header bytes before the video payload, zero when `video` is empty
    pub video_offset: usize,
    /// Decoded video format
    pub video_format: VideoFormat,
    /// How the video format code was recognised
    pub video_status: FormatStatus,
    /// Audio block
    pub audio: Frame,
    /// Header bytes before the audio payload
    pub audio_offset: usize,
    /// Audio layout and estimated sample rate
    pub audio_format: AudioFormat,
}

/// Consumer of matched pairs
pub type FrameCallback = Box<dyn FnMut(PairedFrames) + Send + 'static>;

/// Closure run once on the dequeue thread
pub type DequeueHook = Box<dyn FnOnce() + Send + 'static>;

/// Optional setup and teardown run on the dequeue thread itself
#[derive(Default)]
pub struct DequeueHooks {
    /// Runs before the first pair is waited for
    pub init: Option<DequeueHook>,
    /// Runs after the last pair was delivered
    pub cleanup: Option<DequeueHook>,
}

impl fmt::Debug for DequeueHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DequeueHooks")
            .field("init", &self.init.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// Turns popped queue entries into [`PairedFrames`]
///
/// Remembers the last measured sample rate so blocks that carry no audio
/// keep reporting a sensible rate.
#[derive(Debug)]
pub struct PairDispatcher {
    last_sample_rate: u32,
    counters: Arc<CaptureCounters>,
}

impl PairDispatcher {
    /// Start at the default 48 kHz
    pub fn new(counters: Arc<CaptureCounters>) -> Self {
        Self {
            last_sample_rate: DEFAULT_SAMPLE_RATE,
            counters,
        }
    }

    /// Most recent sample rate estimate
    pub fn last_sample_rate(&self) -> u32 {
        self.last_sample_rate
    }

    /// Decode and assemble one pair
    pub fn dispatch(&mut self, video: QueuedFrame, audio: QueuedFrame) -> PairedFrames {
        let decoded = decode_video_format(video.format);
        let mut audio_format = AudioFormat::embedded(audio.format, self.last_sample_rate);

        CaptureCounters::bump(&self.counters.pairs_delivered);
        if !decoded.is_success() {
            CaptureCounters::bump(&self.counters.video_decode_failures);
            video.frame.release();
            return PairedFrames {
                timecode: video.timecode,
                video: Frame::empty(),
                video_offset: 0,
                video_format: decoded.format,
                video_status: decoded.status,
                audio: audio.frame,
                audio_offset: AUDIO_PAYLOAD_OFFSET,
                audio_format,
            };
        }

        if decoded.status == FormatStatus::Unsupported {
            CaptureCounters::bump(&self.counters.unsupported_formats);
        }
        if !audio.frame.is_empty() {
            audio_format.sample_rate =
                guess_sample_rate(&decoded.format, audio.frame.len(), self.last_sample_rate);
            self.last_sample_rate = audio_format.sample_rate;
        }

        PairedFrames {
            timecode: video.timecode,
            video: video.frame,
            video_offset: VIDEO_PAYLOAD_OFFSET,
            video_format: decoded.format,
            video_status: decoded.status,
            audio: audio.frame,
            audio_offset: AUDIO_PAYLOAD_OFFSET,
            audio_format,
        }
    }
}

/// Handle to a running dequeue thread
#[derive(Debug)]
pub struct DequeueWorker {
    queues: Arc<PairingQueues>,
    handle: Option<JoinHandle<()>>,
}

impl DequeueWorker {
    /// Start the dequeue thread
    pub fn spawn(
        name: String,
        queues: Arc<PairingQueues>,
        mut callback: FrameCallback,
        hooks: DequeueHooks,
        counters: Arc<CaptureCounters>,
    ) -> CaptureResult<Self> {
        let worker_queues = Arc::clone(&queues);
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!("{} running", thread_name);
                if let Some(init) = hooks.init {
                    init();
                }
                let mut dispatcher = PairDispatcher::new(counters);
                while let Some((video, audio)) = worker_queues.wait_pair() {
                    callback(dispatcher.dispatch(video, audio));
                }
                if let Some(cleanup) = hooks.cleanup {
                    cleanup();
                }
                debug!("{} exiting", thread_name);
            })
            .map_err(|source| CaptureError::ThreadSpawn { name, source })?;

        info!("Dequeue thread started");
        Ok(Self {
            queues,
            handle: Some(handle),
        })
    }

    /// Whether the thread is still attached
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Signal the thread to quit and wait for it
    ///
    /// After this returns no callback is in flight.
    pub fn stop(&mut self) {
        self.queues.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Dequeue thread panicked inside the frame callback");
            }
        }
    }
}

impl Drop for DequeueWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
