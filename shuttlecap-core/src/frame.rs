//! Frame buffers and the allocator contract
//!
//! A [`Frame`] is a move-only handle to a fixed-capacity byte buffer that was
//! handed out by a [`FrameAllocator`]. The demuxer appends into it while it is
//! in progress, the pairing engine carries it to the consumer, and the
//! consumer gives it back with [`Frame::release`]. Dropping a frame that still
//! holds storage returns the storage to its owner as well, so a buffer can not
//! leak out of its pool.

use std::fmt;
use std::sync::Weak;
use std::time::Instant;
use tracing::warn;

/// Overflow beyond this many bytes is logged once and the counter restarts.
pub const OVERFLOW_LOG_THRESHOLD: usize = 1 << 20;

/// Pool of frame buffers
///
/// `alloc_frame` is called from the USB event thread and must not block or
/// allocate. Returning [`Frame::empty`] when nothing is free tells the
/// demuxer to silently discard the bytes of that frame.
pub trait FrameAllocator: Send + Sync {
    /// Hand out a free buffer, or an empty frame if none is available
    fn alloc_frame(&self) -> Frame;

    /// Allocate a buffer for a known geometry
    ///
    /// Unlike `alloc_frame` this may sleep. Allocators that do not care
    /// about the geometry fall back to `alloc_frame`.
    fn create_frame(&self, _width: usize, _height: usize, _stride: usize) -> Frame {
        self.alloc_frame()
    }

    /// Take a buffer back
    fn release_frame(&self, frame: Frame);

    /// Most frames the allocator can have outstanding, if bounded
    ///
    /// Used to presize the pairing queues.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Raw storage backing a frame
///
/// In interleaved mode even bytes of the incoming stream land in the first
/// plane and odd bytes in the second one.
pub struct FrameStorage {
    data: Box<[u8]>,
    data2: Option<Box<[u8]>>,
    data_copy: Option<Box<[u8]>>,
}

impl FrameStorage {
    /// Single plane of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            data2: None,
            data_copy: None,
        }
    }

    /// Two byte planes that together hold `size` bytes
    pub fn interleaved(size: usize) -> Self {
        Self {
            data: vec![0u8; size.div_ceil(2)].into_boxed_slice(),
            data2: Some(vec![0u8; size / 2].into_boxed_slice()),
            data_copy: None,
        }
    }

    /// Add a non-interleaved mirror of the full capacity
    pub fn with_mirror(mut self) -> Self {
        self.data_copy = Some(vec![0u8; self.capacity()].into_boxed_slice());
        self
    }

    /// Total number of bytes the storage accepts
    pub fn capacity(&self) -> usize {
        self.data.len() + self.data2.as_ref().map_or(0, |d| d.len())
    }

    /// Whether the storage is split into two byte planes
    pub fn is_interleaved(&self) -> bool {
        self.data2.is_some()
    }
}

impl fmt::Debug for FrameStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStorage")
            .field("capacity", &self.capacity())
            .field("interleaved", &self.is_interleaved())
            .field("mirror", &self.data_copy.is_some())
            .finish()
    }
}

/// A buffer being filled, queued, or delivered
pub struct Frame {
    storage: Option<FrameStorage>,
    len: usize,
    overflow: usize,
    owner: Option<Weak<dyn FrameAllocator>>,
    received_timestamp: Option<Instant>,
    /// Free-form tag for the allocator or consumer
    pub userdata: Option<u64>,
}

impl Frame {
    /// A frame without storage
    ///
    /// Appends to it are ignored. This is what an exhausted allocator
    /// returns and what the consumer receives in place of an undecodable
    /// video frame.
    pub fn empty() -> Self {
        Self {
            storage: None,
            len: 0,
            overflow: 0,
            owner: None,
            received_timestamp: None,
            userdata: None,
        }
    }

    /// Wrap storage handed out by `owner`
    pub fn new(storage: FrameStorage, owner: Weak<dyn FrameAllocator>) -> Self {
        Self {
            storage: Some(storage),
            len: 0,
            overflow: 0,
            owner: Some(owner),
            received_timestamp: None,
            userdata: None,
        }
    }

    /// Whether the frame has storage at all
    pub fn has_data(&self) -> bool {
        self.storage.is_some()
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity in bytes, zero for an empty frame
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map_or(0, FrameStorage::capacity)
    }

    /// Bytes that did not fit and were discarded
    pub fn overflow(&self) -> usize {
        self.overflow
    }

    /// Whether the storage is split into two byte planes
    pub fn is_interleaved(&self) -> bool {
        self.storage
            .as_ref()
            .is_some_and(FrameStorage::is_interleaved)
    }

    /// When the demuxer closed this frame
    pub fn received_timestamp(&self) -> Option<Instant> {
        self.received_timestamp
    }

    /// Stamp the frame as closed
    pub fn mark_received(&mut self, at: Instant) {
        self.received_timestamp = Some(at);
    }

    /// Written part of the first plane
    ///
    /// For a non-interleaved frame this is the whole content.
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Some(s) if s.is_interleaved() => &s.data[..self.len.div_ceil(2)],
            Some(s) => &s.data[..self.len],
            None => &[],
        }
    }

    /// Written part of the second plane, if interleaved
    pub fn data2(&self) -> Option<&[u8]> {
        let storage = self.storage.as_ref()?;
        storage.data2.as_deref().map(|d| &d[..self.len / 2])
    }

    /// Written part of the mirror copy, if one was requested
    pub fn data_copy(&self) -> Option<&[u8]> {
        let storage = self.storage.as_ref()?;
        storage.data_copy.as_deref().map(|d| &d[..self.len])
    }

    /// Content after a fixed header of `offset` bytes
    ///
    /// Uses the mirror copy for interleaved frames, and returns an empty
    /// slice when neither a contiguous plane nor a mirror exists.
    pub fn payload(&self, offset: usize) -> &[u8] {
        let contiguous = if self.is_interleaved() {
            self.data_copy().unwrap_or(&[])
        } else {
            self.data()
        };
        contiguous.get(offset..).unwrap_or(&[])
    }

    /// Append received bytes
    ///
    /// Bytes past the capacity are dropped and counted as overflow. Nothing
    /// happens if the frame has no storage, is already full, or `bytes` is
    /// empty.
    pub fn append(&mut self, bytes: &[u8], frame_type: &str) {
        let len = self.len;
        let Some(storage) = self.storage.as_mut() else {
            return;
        };
        let capacity = storage.capacity();
        if bytes.is_empty() || len >= capacity {
            return;
        }

        let room = capacity - len;
        let take = if bytes.len() > room {
            self.overflow += bytes.len() - room;
            if self.overflow > OVERFLOW_LOG_THRESHOLD {
                warn!(
                    "{} bytes overflow after last {} frame",
                    self.overflow, frame_type
                );
                self.overflow = 0;
            }
            room
        } else {
            bytes.len()
        };
        let bytes = &bytes[..take];

        if let Some(copy) = storage.data_copy.as_mut() {
            copy[len..len + take].copy_from_slice(bytes);
        }
        match storage.data2.as_mut() {
            Some(data2) => {
                // Absolute stream position decides the plane, so an append
                // that starts on an odd byte continues the alternation.
                for (i, &b) in bytes.iter().enumerate() {
                    let pos = len + i;
                    if pos % 2 == 0 {
                        storage.data[pos / 2] = b;
                    } else {
                        data2[pos / 2] = b;
                    }
                }
            }
            None => storage.data[len..len + take].copy_from_slice(bytes),
        }
        self.len += take;
    }

    /// Detach the storage, leaving an empty frame
    ///
    /// Allocators call this from `release_frame` to reclaim the buffer.
    pub fn take_storage(&mut self) -> Option<FrameStorage> {
        self.len = 0;
        self.storage.take()
    }

    /// Hand the frame back to the allocator that produced it
    pub fn release(mut self) {
        if let Some(owner) = self.owner.take().and_then(|w| w.upgrade()) {
            owner.release_frame(self);
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if self.storage.is_none() {
            return;
        }
        if let Some(owner) = self.owner.take().and_then(|w| w.upgrade()) {
            let orphan = Frame {
                storage: self.storage.take(),
                len: self.len,
                overflow: self.overflow,
                owner: None,
                received_timestamp: self.received_timestamp,
                userdata: self.userdata,
            };
            owner.release_frame(orphan);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("overflow", &self.overflow)
            .field("interleaved", &self.is_interleaved())
            .field("userdata", &self.userdata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Weak};

    fn detached(storage: FrameStorage) -> Frame {
        let owner: Weak<crate::pool::PoolFrameAllocator> = Weak::new();
        Frame::new(storage, owner)
    }

    #[test]
    fn test_append_truncates_and_counts_overflow() {
        let mut frame = detached(FrameStorage::new(16));
        frame.append(&[1u8; 10], "video");
        frame.append(&[2u8; 10], "video");

        assert_eq!(frame.len(), 16);
        assert_eq!(frame.capacity(), 16);
        assert_eq!(frame.overflow(), 4);
        assert_eq!(&frame.data()[10..], &[2u8; 6]);
    }

    #[test]
    fn test_append_to_full_frame_is_noop() {
        let mut frame = detached(FrameStorage::new(4));
        frame.append(&[0u8; 4], "audio");
        frame.append(&[0u8; 4], "audio");
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.overflow(), 0);
    }

    #[test]
    fn test_large_overflow_resets_counter() {
        let mut frame = detached(FrameStorage::new(8));
        let big = vec![7u8; OVERFLOW_LOG_THRESHOLD + 100];
        frame.append(&big, "video");
        assert_eq!(frame.len(), 8);
        assert_eq!(frame.overflow(), 0);

        frame.append(&[1, 2, 3], "video");
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_empty_frame_ignores_appends() {
        let mut frame = Frame::empty();
        frame.append(&[1, 2, 3], "video");
        assert!(!frame.has_data());
        assert_eq!(frame.len(), 0);
        assert!(frame.data().is_empty());
    }

    #[test]
    fn test_interleaved_split_even_length() {
        let mut frame = detached(FrameStorage::interleaved(8));
        frame.append(&[0, 1, 2, 3, 4, 5], "video");

        assert_eq!(frame.data(), &[0, 2, 4]);
        assert_eq!(frame.data2(), Some(&[1u8, 3, 5][..]));
    }

    #[test]
    fn test_interleaved_odd_boundaries() {
        let source: Vec<u8> = (0u8..20).collect();

        let mut whole = detached(FrameStorage::interleaved(20));
        whole.append(&source, "video");

        let mut pieces = detached(FrameStorage::interleaved(20));
        pieces.append(&source[..3], "video");
        pieces.append(&source[3..4], "video");
        pieces.append(&source[4..11], "video");
        pieces.append(&source[11..], "video");

        assert_eq!(pieces.data(), whole.data());
        assert_eq!(pieces.data2(), whole.data2());
        let evens: Vec<u8> = source.iter().copied().step_by(2).collect();
        assert_eq!(pieces.data(), &evens[..]);
    }

    #[test]
    fn test_mirror_copy_follows_writes() {
        let mut frame = detached(FrameStorage::interleaved(6).with_mirror());
        frame.append(&[9, 8, 7, 6, 5], "video");
        assert_eq!(frame.data_copy(), Some(&[9u8, 8, 7, 6, 5][..]));
        assert_eq!(frame.payload(2), &[7, 6, 5]);
    }

    /// Hands out fresh heap buffers and counts returns
    struct HeapAllocator {
        released: std::sync::atomic::AtomicUsize,
    }

    impl FrameAllocator for HeapAllocator {
        fn alloc_frame(&self) -> Frame {
            let mut frame = detached(FrameStorage::new(64));
            frame.userdata = Some(0xfeed);
            frame
        }

        fn release_frame(&self, _frame: Frame) {
            self.released
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_create_frame_falls_back_to_alloc() {
        let allocator = HeapAllocator {
            released: Default::default(),
        };
        let frame = allocator.create_frame(720, 486, 1440);
        assert_eq!(frame.capacity(), 64);
        assert_eq!(frame.userdata, Some(0xfeed));
        assert_eq!(allocator.capacity(), None);

        allocator.release_frame(frame);
        assert_eq!(
            allocator.released.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn test_drop_returns_storage_to_owner() {
        let pool = crate::pool::PoolFrameAllocator::new(crate::pool::PoolConfig {
            frame_size: 32,
            num_frames: 2,
            interleaved: false,
            mirror_copy: false,
        });
        let frame = pool.alloc_frame();
        assert_eq!(pool.free_count(), 1);
        drop(frame);
        assert_eq!(pool.free_count(), 2);

        let _keep: Arc<dyn FrameAllocator> = pool;
    }
}
