//! # Shuttlecap Media
//!
//! Frame re-assembly and pairing for the capture pipeline. Raw iso packets go
//! through the [`PacketDemuxer`], which slices each stream into frames and
//! queues them in [`PairingQueues`]. A [`DequeueWorker`] pops matched
//! video/audio pairs and hands them to the consumer callback.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod demuxer;
pub mod pairing;

// Re-export main types
pub use capture::CaptureInterface;
pub use demuxer::{IsoPacket, PacketDemuxer, StreamRole, INITIAL_ASSUMED_WIDTH, MIN_WIDTH};
pub use pairing::{
    DequeueHook, DequeueHooks, DequeueWorker, FrameCallback, PairDispatcher, PairedFrames,
    PairingQueues, QueuedFrame,
};
