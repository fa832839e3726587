//! USB capture session
//!
//! [`UsbCapture`] drives one card through its lifecycle:
//!
//! ```text
//! Unconfigured --configure--> Configured --start--> Capturing
//!       |                         |                    |
//!       |                         +---- unplug ----> Disconnected
//!       +------------------- stop (any state) -------> Stopped
//! ```
//!
//! Completed transfers arrive on the shared [`IoPump`] thread, are decoded
//! by the session's [`PacketDemuxer`] and resubmitted. Matched pairs reach
//! the consumer on a dedicated dequeue thread.

use crate::config::CaptureConfig;
use crate::event::{CaptureEvent, EventStream, EVENT_CHANNEL_CAPACITY};
use crate::pump::{IoPump, TransferHandler};
use crate::usb::{
    Endpoint, IsoTransfer, RejectedTransfer, TransferStatus, UsbDevice, MODE_CONTROL_REQUEST,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shuttlecap_core::error::{CaptureError, CaptureResult};
use shuttlecap_core::format::{decode_video_format, PixelFormat, VideoFormat};
use shuttlecap_core::frame::FrameAllocator;
use shuttlecap_core::input::{AudioInput, VideoInput};
use shuttlecap_core::pool::{PoolFrameAllocator, PoolStats};
use shuttlecap_core::stats::{CaptureCounters, CaptureStats};
use shuttlecap_media::{
    CaptureInterface, DequeueHooks, DequeueWorker, FrameCallback, PacketDemuxer, PairedFrames,
    PairingQueues, INITIAL_ASSUMED_WIDTH,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Called once when the card goes away
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Lifecycle state of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureState {
    /// Created, device not opened yet
    Unconfigured,
    /// Device open and dequeue thread running
    Configured,
    /// Transfers in flight
    Capturing,
    /// The device went away
    Disconnected,
    /// Torn down
    Stopped,
}

impl CaptureState {
    /// Lower-case state name
    pub fn name(self) -> &'static str {
        match self {
            CaptureState::Unconfigured => "unconfigured",
            CaptureState::Configured => "configured",
            CaptureState::Capturing => "capturing",
            CaptureState::Disconnected => "disconnected",
            CaptureState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State touched from the pump thread
struct SessionShared {
    id: Uuid,
    device: Arc<dyn UsbDevice>,
    demuxer: Mutex<PacketDemuxer>,
    queues: Arc<PairingQueues>,
    ten_bit: AtomicBool,
    stopping: AtomicBool,
    disconnected: AtomicBool,
    retired: Mutex<Vec<IsoTransfer>>,
    on_disconnect: Option<DisconnectCallback>,
    events: broadcast::Sender<CaptureEvent>,
    counters: Arc<CaptureCounters>,
}

impl SessionShared {
    fn pixel_format(&self) -> PixelFormat {
        if self.ten_bit.load(Ordering::Relaxed) {
            PixelFormat::TenBitYCbCr
        } else {
            PixelFormat::EightBitYCbCr
        }
    }

    fn emit(&self, event: CaptureEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn mark_disconnected(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Capture device went away, no longer resubmitting transfers");
        self.emit(CaptureEvent::Disconnected {
            session_id: self.id,
        });
        if let Some(callback) = &self.on_disconnect {
            callback();
        }
    }

    fn retire(&self, transfer: IsoTransfer) {
        self.retired.lock().push(transfer);
    }

    fn resubmit(&self, mut transfer: IsoTransfer) {
        if self.stopping.load(Ordering::SeqCst) || self.disconnected.load(Ordering::SeqCst) {
            self.retire(transfer);
            return;
        }
        transfer.reset();
        if let Err(RejectedTransfer {
            transfer,
            disconnected,
            reason,
        }) = self.device.submit(transfer)
        {
            if disconnected {
                self.mark_disconnected();
            } else if !self.stopping.load(Ordering::SeqCst) {
                error!(
                    "Error re-submitting transfer on {}: {}",
                    transfer.endpoint(),
                    reason
                );
                CaptureCounters::bump(&self.counters.transfer_errors);
                self.emit(CaptureEvent::SubmitFailed {
                    session_id: self.id,
                    endpoint: transfer.endpoint().address(),
                });
            }
            self.retire(transfer);
        }
    }
}

impl TransferHandler for SessionShared {
    fn on_transfer_complete(&self, mut transfer: IsoTransfer) {
        match transfer.status() {
            TransferStatus::Completed => {}
            TransferStatus::NoDevice => {
                self.mark_disconnected();
                self.retire(transfer);
                return;
            }
            TransferStatus::Cancelled | TransferStatus::Pending => {
                self.retire(transfer);
                return;
            }
            TransferStatus::Error(code) => {
                error!(
                    "Transfer on {} failed with status {}, retiring it",
                    transfer.endpoint(),
                    code
                );
                CaptureCounters::bump(&self.counters.transfer_errors);
                self.emit(CaptureEvent::TransferFailed {
                    session_id: self.id,
                    endpoint: transfer.endpoint().address(),
                    code,
                });
                self.retire(transfer);
                return;
            }
        }

        let endpoint = transfer.endpoint();
        let assumed_width = {
            let mut demuxer = self.demuxer.lock();
            demuxer.decode_packets(endpoint.role(), transfer.packets());
            demuxer.assumed_width()
        };
        if endpoint == Endpoint::Video {
            transfer.resize_for_width(self.pixel_format(), assumed_width);
        }
        self.resubmit(transfer);
    }

    fn on_pump_exit(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        error!("USB event thread exited, session {} receives no more data", self.id);
        self.emit(CaptureEvent::PumpExited {
            session_id: self.id,
        });
    }
}

/// Fluent builder for a [`UsbCapture`]
pub struct CaptureBuilder {
    card_index: usize,
    device: Arc<dyn UsbDevice>,
    config: CaptureConfig,
    video_allocator: Option<Arc<dyn FrameAllocator>>,
    audio_allocator: Option<Arc<dyn FrameAllocator>>,
    callback: Option<FrameCallback>,
    hooks: DequeueHooks,
    on_disconnect: Option<DisconnectCallback>,
}

impl CaptureBuilder {
    /// Replace the whole configuration
    pub fn config(mut self, config: CaptureConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the pixel format
    pub fn pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.config.pixel_format = pixel_format;
        self
    }

    /// Set the video input
    pub fn video_input(mut self, input: VideoInput) -> Self {
        self.config.video_input = input;
        self
    }

    /// Set the audio input
    pub fn audio_input(mut self, input: AudioInput) -> Self {
        self.config.audio_input = input;
        self
    }

    /// Use a caller-supplied allocator for video frames
    pub fn video_allocator(mut self, allocator: Arc<dyn FrameAllocator>) -> Self {
        self.video_allocator = Some(allocator);
        self
    }

    /// Use a caller-supplied allocator for audio blocks
    pub fn audio_allocator(mut self, allocator: Arc<dyn FrameAllocator>) -> Self {
        self.audio_allocator = Some(allocator);
        self
    }

    /// Set the consumer of matched pairs
    pub fn frame_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(PairedFrames) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Set init/cleanup closures for the dequeue thread
    pub fn dequeue_hooks(mut self, hooks: DequeueHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the disconnect notification
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
        self
    }

    /// Validate the configuration and create the session
    pub fn build(self) -> CaptureResult<UsbCapture> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(UsbCapture {
            id: Uuid::new_v4(),
            card_index: self.card_index,
            config: self.config,
            state: CaptureState::Unconfigured,
            device: self.device,
            description: String::new(),
            video_allocator: self.video_allocator,
            audio_allocator: self.audio_allocator,
            video_pool: None,
            audio_pool: None,
            callback: self.callback,
            hooks: Some(self.hooks),
            on_disconnect: self.on_disconnect,
            shared: None,
            worker: None,
            events,
            counters: Arc::new(CaptureCounters::default()),
            started_at: None,
        })
    }
}

impl fmt::Debug for CaptureBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureBuilder")
            .field("card_index", &self.card_index)
            .field("config", &self.config)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Capture session for one USB card
pub struct UsbCapture {
    id: Uuid,
    card_index: usize,
    config: CaptureConfig,
    state: CaptureState,
    device: Arc<dyn UsbDevice>,
    description: String,
    video_allocator: Option<Arc<dyn FrameAllocator>>,
    audio_allocator: Option<Arc<dyn FrameAllocator>>,
    video_pool: Option<Arc<PoolFrameAllocator>>,
    audio_pool: Option<Arc<PoolFrameAllocator>>,
    callback: Option<FrameCallback>,
    hooks: Option<DequeueHooks>,
    on_disconnect: Option<DisconnectCallback>,
    shared: Option<Arc<SessionShared>>,
    worker: Option<DequeueWorker>,
    events: broadcast::Sender<CaptureEvent>,
    counters: Arc<CaptureCounters>,
    started_at: Option<Instant>,
}

impl UsbCapture {
    /// Start building a session for card `card_index`
    pub fn builder(card_index: usize, device: Arc<dyn UsbDevice>) -> CaptureBuilder {
        CaptureBuilder {
            card_index,
            device,
            config: CaptureConfig::default(),
            video_allocator: None,
            audio_allocator: None,
            callback: None,
            hooks: DequeueHooks::default(),
            on_disconnect: None,
        }
    }

    /// Session id stamped on every transfer and event
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Card index the session opens
    pub fn card_index(&self) -> usize {
        self.card_index
    }

    /// Active configuration
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> CaptureState {
        match self.state {
            CaptureState::Configured | CaptureState::Capturing if self.is_disconnected() => {
                CaptureState::Disconnected
            }
            state => state,
        }
    }

    /// Subscribe to session events
    pub fn events(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    /// Register the disconnect notification; must happen before `configure`
    pub fn set_disconnect_callback<F>(&mut self, callback: F) -> CaptureResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.require(CaptureState::Unconfigured)?;
        self.on_disconnect = Some(Box::new(callback));
        Ok(())
    }

    /// Pipeline counters
    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    /// Activity of the built-in video pool, if one is in use
    pub fn video_pool_stats(&self) -> Option<PoolStats> {
        self.video_pool.as_ref().map(|pool| pool.stats())
    }

    /// Activity of the built-in audio pool, if one is in use
    pub fn audio_pool_stats(&self) -> Option<PoolStats> {
        self.audio_pool.as_ref().map(|pool| pool.stats())
    }

    /// Time spent capturing
    pub fn uptime(&self) -> Duration {
        self.started_at.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Last video format seen on the wire
    pub fn last_video_format(&self) -> Option<VideoFormat> {
        let shared = self.shared.as_ref()?;
        let code = shared.demuxer.lock().last_video_format()?;
        Some(decode_video_format(code).format)
    }

    /// Snapshot of the session's health
    #[cfg(feature = "diagnostics")]
    pub fn report(&self) -> shuttlecap_diagnostics::CaptureReport {
        shuttlecap_diagnostics::CaptureReport {
            session_id: self.id,
            description: self.description(),
            state: self.state().to_string(),
            uptime: self.uptime(),
            stats: self.stats(),
            video_pool: self.video_pool_stats().unwrap_or_default(),
            audio_pool: self.audio_pool_stats().unwrap_or_default(),
            last_video_format: self.last_video_format(),
        }
    }

    fn require(&self, expected: CaptureState) -> CaptureResult<()> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(CaptureError::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    fn emit(&self, event: CaptureEvent) {
        let _ = self.events.send(event);
    }

    fn device_is_open(&self) -> bool {
        matches!(self.state(), CaptureState::Configured | CaptureState::Capturing)
    }

    /// Push the current mode word to the card if it is open
    fn commit_mode(&self) -> CaptureResult<()> {
        if !self.device_is_open() {
            return Ok(());
        }
        self.write_mode()
    }

    fn write_mode(&self) -> CaptureResult<()> {
        let word = self.config.mode_word();
        debug!("Setting capture mode {:#010x} on card {}", word, self.card_index);
        self.device
            .control_write(MODE_CONTROL_REQUEST, &word.to_be_bytes())
    }

    fn check_settable(&self) -> CaptureResult<()> {
        match self.state() {
            CaptureState::Stopped | CaptureState::Disconnected => Err(CaptureError::InvalidState {
                expected: "unconfigured, configured or capturing".to_string(),
                actual: self.state().to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn allocators(&mut self) -> (Arc<dyn FrameAllocator>, Arc<dyn FrameAllocator>) {
        let video: Arc<dyn FrameAllocator> = match &self.video_allocator {
            Some(allocator) => Arc::clone(allocator),
            None => {
                let pool = PoolFrameAllocator::new(self.config.video_pool);
                self.video_pool = Some(Arc::clone(&pool));
                pool
            }
        };
        let audio: Arc<dyn FrameAllocator> = match &self.audio_allocator {
            Some(allocator) => Arc::clone(allocator),
            None => {
                let pool = PoolFrameAllocator::new(self.config.audio_pool);
                self.audio_pool = Some(Arc::clone(&pool));
                pool
            }
        };
        (video, audio)
    }

    /// Stop I/O, join the dequeue thread, close the card, then free buffers
    fn teardown(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };

        shared.stopping.store(true, Ordering::SeqCst);
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }

        let in_flight = self.device.close();
        IoPump::unregister(self.id);

        let retired = std::mem::take(&mut *shared.retired.lock());
        let freed = in_flight.len() + retired.len();
        drop(in_flight);
        drop(retired);

        shared.demuxer.lock().release_current();
        for queued in shared.queues.drain() {
            queued.frame.release();
        }
        debug!("Card {}: freed {} transfers", self.card_index, freed);
    }
}

impl CaptureInterface for UsbCapture {
    fn current_pixel_format(&self) -> PixelFormat {
        self.config.pixel_format
    }

    fn set_pixel_format(&mut self, pixel_format: PixelFormat) -> CaptureResult<()> {
        self.check_settable()?;
        self.config.pixel_format = pixel_format;
        if let Some(shared) = &self.shared {
            shared
                .ten_bit
                .store(pixel_format == PixelFormat::TenBitYCbCr, Ordering::Relaxed);
        }
        self.commit_mode()
    }

    fn current_video_input(&self) -> u32 {
        self.config.video_input.id()
    }

    fn set_video_input(&mut self, video_input_id: u32) -> CaptureResult<()> {
        self.check_settable()?;
        self.config.video_input = VideoInput::from_id(video_input_id)?;
        self.commit_mode()
    }

    fn current_audio_input(&self) -> u32 {
        self.config.audio_input.id()
    }

    fn set_audio_input(&mut self, audio_input_id: u32) -> CaptureResult<()> {
        self.check_settable()?;
        self.config.audio_input = AudioInput::from_id(audio_input_id)?;
        self.commit_mode()
    }

    fn set_frame_callback(&mut self, callback: FrameCallback) -> CaptureResult<()> {
        self.require(CaptureState::Unconfigured)?;
        self.callback = Some(callback);
        Ok(())
    }

    fn set_dequeue_hooks(&mut self, hooks: DequeueHooks) -> CaptureResult<()> {
        self.require(CaptureState::Unconfigured)?;
        self.hooks = Some(hooks);
        Ok(())
    }

    fn description(&self) -> String {
        if self.description.is_empty() {
            format!("USB capture card {}", self.card_index)
        } else {
            self.description.clone()
        }
    }

    fn configure(&mut self) -> CaptureResult<()> {
        self.require(CaptureState::Unconfigured)?;
        if self.callback.is_none() {
            return Err(CaptureError::MissingConfiguration {
                field: "frame_callback".to_string(),
            });
        }
        self.config.validate()?;

        self.device.open(self.card_index)?;
        self.description = self.device.description();
        if let Err(e) = self.write_mode() {
            self.device.close();
            return Err(e);
        }

        let (video_allocator, audio_allocator) = self.allocators();
        // Every queued entry holds a frame from one of the allocators.
        let queues = Arc::new(PairingQueues::new(
            video_allocator
                .capacity()
                .unwrap_or(self.config.video_pool.num_frames),
            audio_allocator
                .capacity()
                .unwrap_or(self.config.audio_pool.num_frames),
            Arc::clone(&self.counters),
        ));
        let demuxer = PacketDemuxer::new(
            video_allocator,
            audio_allocator,
            Arc::clone(&queues),
            Arc::clone(&self.counters),
        );

        let Some(callback) = self.callback.take() else {
            self.device.close();
            return Err(CaptureError::MissingConfiguration {
                field: "frame_callback".to_string(),
            });
        };
        let worker = match DequeueWorker::spawn(
            format!("shuttlecap-dq-{}", self.card_index),
            Arc::clone(&queues),
            callback,
            self.hooks.take().unwrap_or_default(),
            Arc::clone(&self.counters),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                self.device.close();
                return Err(e);
            }
        };

        let shared = Arc::new(SessionShared {
            id: self.id,
            device: Arc::clone(&self.device),
            demuxer: Mutex::new(demuxer),
            queues,
            ten_bit: AtomicBool::new(self.config.pixel_format == PixelFormat::TenBitYCbCr),
            stopping: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            retired: Mutex::new(Vec::with_capacity(2 * self.config.transfers_per_endpoint)),
            on_disconnect: self.on_disconnect.take(),
            events: self.events.clone(),
            counters: Arc::clone(&self.counters),
        });
        IoPump::register(self.id, Arc::clone(&shared) as Arc<dyn TransferHandler>);

        self.shared = Some(shared);
        self.worker = Some(worker);
        self.state = CaptureState::Configured;
        self.emit(CaptureEvent::Configured {
            session_id: self.id,
        });
        info!("Configured card {}: {}", self.card_index, self.description);
        Ok(())
    }

    fn start(&mut self) -> CaptureResult<()> {
        self.require(CaptureState::Configured)?;
        let shared = self
            .shared
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| CaptureError::InvalidState {
                expected: "configured".to_string(),
                actual: self.state().to_string(),
            })?;

        for endpoint in Endpoint::ALL {
            for _ in 0..self.config.transfers_per_endpoint {
                let transfer = match endpoint {
                    Endpoint::Video => IsoTransfer::video(
                        self.id,
                        self.config.pixel_format,
                        INITIAL_ASSUMED_WIDTH,
                    ),
                    Endpoint::Audio => IsoTransfer::audio(self.id),
                };
                if let Err(rejected) = self.device.submit(transfer) {
                    error!(
                        "Error submitting iso transfer on {}: {}",
                        endpoint, rejected.reason
                    );
                    if rejected.disconnected {
                        shared.mark_disconnected();
                    }
                    shared.retire(rejected.transfer);
                    return Err(CaptureError::TransferSubmission {
                        endpoint: endpoint.address(),
                        reason: rejected.reason,
                    });
                }
            }
        }

        self.state = CaptureState::Capturing;
        self.started_at = Some(Instant::now());
        self.emit(CaptureEvent::CaptureStarted {
            session_id: self.id,
        });
        info!(
            "Card {} capturing with {} transfers per endpoint",
            self.card_index, self.config.transfers_per_endpoint
        );
        Ok(())
    }

    fn stop(&mut self) -> CaptureResult<()> {
        if self.state == CaptureState::Stopped {
            return Ok(());
        }
        self.teardown();
        self.state = CaptureState::Stopped;
        self.emit(CaptureEvent::CaptureStopped {
            session_id: self.id,
        });
        info!("Card {} stopped", self.card_index);
        Ok(())
    }

    fn is_disconnected(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.disconnected.load(Ordering::SeqCst))
    }
}

impl Drop for UsbCapture {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for UsbCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbCapture")
            .field("id", &self.id)
            .field("card_index", &self.card_index)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
