//! Bounded frame pool
//!
//! [`PoolFrameAllocator`] preallocates every buffer up front and keeps them on
//! a free list behind a short-held lock. Handing out and taking back a buffer
//! never touches the heap, which makes it safe to call from the USB event
//! thread.

use crate::frame::{Frame, FrameAllocator, FrameStorage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Frame pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Capacity of each frame in bytes
    pub frame_size: usize,
    /// Number of frames preallocated
    pub num_frames: usize,
    /// Split each frame into two alternating byte planes
    pub interleaved: bool,
    /// Keep an additional contiguous copy of every frame
    pub mirror_copy: bool,
}

impl PoolConfig {
    /// Video pool: few large frames (8 MiB x 128)
    pub fn video() -> Self {
        Self {
            frame_size: 8 << 20,
            num_frames: 128,
            interleaved: false,
            mirror_copy: false,
        }
    }

    /// Audio pool: many small blocks (64 KiB x 512)
    pub fn audio() -> Self {
        Self {
            frame_size: 65536,
            num_frames: 512,
            interleaved: false,
            mirror_copy: false,
        }
    }

    /// Tiny pool for tests and loopback replays
    pub fn small(frame_size: usize, num_frames: usize) -> Self {
        Self {
            frame_size,
            num_frames,
            interleaved: false,
            mirror_copy: false,
        }
    }

    fn make_storage(&self) -> FrameStorage {
        let storage = if self.interleaved {
            FrameStorage::interleaved(self.frame_size)
        } else {
            FrameStorage::new(self.frame_size)
        };
        if self.mirror_copy {
            storage.with_mirror()
        } else {
            storage
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::video()
    }
}

/// Frame pool metrics
#[derive(Debug, Default)]
struct PoolMetrics {
    allocated: AtomicU64,
    exhausted: AtomicU64,
    released: AtomicU64,
    overflowed: AtomicU64,
}

/// Snapshot of pool activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Frames handed out
    pub allocated: u64,
    /// Allocation attempts that found the pool empty
    pub exhausted: u64,
    /// Frames returned
    pub released: u64,
    /// Returned frames that carried overflow
    pub overflowed: u64,
    /// Frames currently on the free list
    pub free: usize,
    /// Total frames owned by the pool
    pub total: usize,
}

/// Default [`FrameAllocator`]: a fixed free list of equally sized buffers
pub struct PoolFrameAllocator {
    config: PoolConfig,
    freelist: Mutex<Vec<FrameStorage>>,
    metrics: PoolMetrics,
    me: Weak<PoolFrameAllocator>,
}

impl PoolFrameAllocator {
    /// Preallocate every frame of the pool
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let mut freelist = Vec::with_capacity(config.num_frames);
        for _ in 0..config.num_frames {
            freelist.push(config.make_storage());
        }
        info!(
            "Frame pool ready: {} x {} bytes{}",
            config.num_frames,
            config.frame_size,
            if config.interleaved { " (interleaved)" } else { "" }
        );

        Arc::new_cyclic(|me| Self {
            config,
            freelist: Mutex::new(freelist),
            metrics: PoolMetrics::default(),
            me: me.clone(),
        })
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Frames currently available
    pub fn free_count(&self) -> usize {
        self.freelist.lock().len()
    }

    /// Snapshot of pool activity
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.metrics.allocated.load(Ordering::Relaxed),
            exhausted: self.metrics.exhausted.load(Ordering::Relaxed),
            released: self.metrics.released.load(Ordering::Relaxed),
            overflowed: self.metrics.overflowed.load(Ordering::Relaxed),
            free: self.free_count(),
            total: self.config.num_frames,
        }
    }
}

impl FrameAllocator for PoolFrameAllocator {
    fn alloc_frame(&self) -> Frame {
        let storage = self.freelist.lock().pop();
        match storage {
            Some(storage) => {
                self.metrics.allocated.fetch_add(1, Ordering::Relaxed);
                let owner: Weak<dyn FrameAllocator> = self.me.clone();
                Frame::new(storage, owner)
            }
            None => {
                self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Frame overrun (no more spare frames of size {}), dropping frame!",
                    self.config.frame_size
                );
                Frame::empty()
            }
        }
    }

    fn release_frame(&self, mut frame: Frame) {
        if frame.overflow() > 0 {
            self.metrics.overflowed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} bytes overflow after last (pool) frame",
                frame.overflow()
            );
        }
        let Some(storage) = frame.take_storage() else {
            return;
        };
        if storage.capacity() != self.config.frame_size {
            debug!(
                "Discarding foreign buffer of {} bytes returned to pool",
                storage.capacity()
            );
            return;
        }
        self.metrics.released.fetch_add(1, Ordering::Relaxed);
        let mut freelist = self.freelist.lock();
        if freelist.len() < self.config.num_frames {
            freelist.push(storage);
        }
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.config.num_frames)
    }
}
