//! USB transport seam
//!
//! The session talks to the card through [`UsbDevice`] and receives transfer
//! completions from a [`UsbContext`] driven by the I/O pump. Both are traits
//! so a hardware binding and the in-memory [`loopback`](crate::loopback)
//! backend plug in the same way.

use shuttlecap_core::error::CaptureResult;
use shuttlecap_core::format::PixelFormat;
use shuttlecap_media::{IsoPacket, StreamRole};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Size of one video transfer buffer
pub const VIDEO_TRANSFER_LEN: usize = 128 * 1024;
/// Length of one audio iso packet
pub const AUDIO_PACKET_LEN: usize = 0xc0;
/// Iso packets per audio transfer
pub const AUDIO_PACKETS_PER_TRANSFER: usize = 80;
/// Largest iso packet the device accepts
pub const MAX_ISO_PACKET_LEN: usize = 32768;
/// Video iso packets are sized in multiples of this
pub const ISO_PACKET_GRANULARITY: usize = 1024;
/// Vendor control request that commits the capture mode word
pub const MODE_CONTROL_REQUEST: u8 = 215;

/// Widths at or above this always use the largest packet size
const FULL_PACKET_WIDTH: u32 = 1280;
/// Lines of video one packet should roughly hold
const LINES_PER_PACKET: usize = 6;

/// Isochronous IN endpoints of the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Video stream, address 0x83
    Video,
    /// Audio stream, address 0x84
    Audio,
}

impl Endpoint {
    /// Both endpoints
    pub const ALL: [Endpoint; 2] = [Endpoint::Video, Endpoint::Audio];

    /// USB endpoint address
    pub fn address(self) -> u8 {
        match self {
            Endpoint::Video => 0x83,
            Endpoint::Audio => 0x84,
        }
    }

    /// Stream carried by the endpoint
    pub fn role(self) -> StreamRole {
        match self {
            Endpoint::Video => StreamRole::Video,
            Endpoint::Audio => StreamRole::Audio,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.address())
    }
}

/// Completion status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Submitted and not completed yet
    Pending,
    /// Completed normally
    Completed,
    /// The device went away
    NoDevice,
    /// Cancelled during teardown
    Cancelled,
    /// Any other transport failure, with its raw code
    Error(i32),
}

impl TransferStatus {
    /// Raw status code reported in events
    pub fn code(self) -> i32 {
        match self {
            TransferStatus::Pending => -1,
            TransferStatus::Completed => 0,
            TransferStatus::NoDevice => 5,
            TransferStatus::Cancelled => 3,
            TransferStatus::Error(code) => code,
        }
    }
}

/// Per-packet bookkeeping of an iso transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    /// Slot length in the transfer buffer
    pub length: usize,
    /// Bytes the device actually wrote
    pub actual_length: usize,
    /// Whether the packet completed successfully
    pub completed: bool,
}

impl IsoPacketDescriptor {
    fn empty(length: usize) -> Self {
        Self {
            length,
            actual_length: 0,
            completed: false,
        }
    }
}

/// One isochronous transfer and its buffer
///
/// Transfers are created once per session and recycled: the pump hands a
/// completed transfer back to its owner, which decodes it and resubmits it.
pub struct IsoTransfer {
    owner: Uuid,
    endpoint: Endpoint,
    status: TransferStatus,
    buffer: Box<[u8]>,
    packets: Vec<IsoPacketDescriptor>,
}

impl IsoTransfer {
    /// Allocate a transfer of `buffer_len` bytes split into `packet_len` slots
    ///
    /// Room for the smallest video packet size is reserved up front so later
    /// resizing never allocates.
    pub fn new(owner: Uuid, endpoint: Endpoint, buffer_len: usize, packet_len: usize) -> Self {
        let packet_len = packet_len.clamp(1, buffer_len.max(1));
        let num_packets = buffer_len / packet_len;
        let mut packets =
            Vec::with_capacity(num_packets.max(buffer_len / ISO_PACKET_GRANULARITY));
        packets.resize(num_packets, IsoPacketDescriptor::empty(packet_len));
        Self {
            owner,
            endpoint,
            status: TransferStatus::Pending,
            buffer: vec![0u8; buffer_len].into_boxed_slice(),
            packets,
        }
    }

    /// Video transfer sized for `width`
    pub fn video(owner: Uuid, pixel_format: PixelFormat, width: u32) -> Self {
        Self::new(
            owner,
            Endpoint::Video,
            VIDEO_TRANSFER_LEN,
            find_xfer_size_for_width(pixel_format, width),
        )
    }

    /// Audio transfer with fixed packet slots
    pub fn audio(owner: Uuid) -> Self {
        Self::new(
            owner,
            Endpoint::Audio,
            AUDIO_PACKET_LEN * AUDIO_PACKETS_PER_TRANSFER,
            AUDIO_PACKET_LEN,
        )
    }

    /// Session owning the transfer
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Endpoint the transfer reads from
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Completion status
    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Set the completion status
    pub fn set_status(&mut self, status: TransferStatus) {
        self.status = status;
    }

    /// Buffer length in bytes
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Packet descriptors
    pub fn descriptors(&self) -> &[IsoPacketDescriptor] {
        &self.packets
    }

    /// Current packet slot length
    pub fn packet_len(&self) -> usize {
        self.packets.first().map_or(0, |p| p.length)
    }

    /// Clear every packet before (re)submission
    pub fn reset(&mut self) {
        self.status = TransferStatus::Pending;
        for packet in &mut self.packets {
            packet.actual_length = 0;
            packet.completed = false;
        }
    }

    /// Write `data` into packet slot `index`, truncated to the slot length
    ///
    /// Returns the number of bytes stored, or `None` past the last slot.
    pub fn fill_packet(&mut self, index: usize, data: &[u8]) -> Option<usize> {
        let offset = self.packet_offset(index)?;
        let packet = &mut self.packets[index];
        let n = data.len().min(packet.length);
        self.buffer[offset..offset + n].copy_from_slice(&data[..n]);
        packet.actual_length = n;
        packet.completed = true;
        Some(n)
    }

    /// Mark packet slot `index` as failed
    pub fn fail_packet(&mut self, index: usize) {
        if let Some(packet) = self.packets.get_mut(index) {
            packet.actual_length = 0;
            packet.completed = false;
        }
    }

    fn packet_offset(&self, index: usize) -> Option<usize> {
        if index >= self.packets.len() {
            return None;
        }
        Some(self.packets[..index].iter().map(|p| p.length).sum())
    }

    /// Received packets in order, with the bytes the device wrote
    pub fn packets(&self) -> impl Iterator<Item = IsoPacket<'_>> + '_ {
        let mut offset = 0;
        self.packets.iter().map(move |packet| {
            let start = offset;
            offset += packet.length;
            let end = start + packet.actual_length.min(packet.length);
            IsoPacket {
                completed: packet.completed,
                data: &self.buffer[start..end],
            }
        })
    }

    /// Re-split the buffer into `packet_len` slots
    ///
    /// Returns whether the layout changed.
    pub fn set_packet_length(&mut self, packet_len: usize) -> bool {
        let packet_len = packet_len.clamp(1, self.buffer.len().max(1));
        if self.packet_len() == packet_len {
            return false;
        }
        let num_packets = self.buffer.len() / packet_len;
        self.packets.clear();
        self.packets
            .resize(num_packets, IsoPacketDescriptor::empty(packet_len));
        true
    }

    /// Resize video packets for an expected line width
    pub fn resize_for_width(&mut self, pixel_format: PixelFormat, width: u32) -> bool {
        let packet_len = find_xfer_size_for_width(pixel_format, width);
        let changed = self.set_packet_length(packet_len);
        if changed {
            debug!(
                "Video transfer on {} now uses {} packets of {} bytes",
                self.endpoint,
                self.packets.len(),
                packet_len
            );
        }
        changed
    }
}

impl fmt::Debug for IsoTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsoTransfer")
            .field("owner", &self.owner)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status)
            .field("buffer_len", &self.buffer.len())
            .field("packets", &self.packets.len())
            .finish()
    }
}

/// Iso packet size for a given line width
///
/// Wide modes always use the maximum packet size; narrower ones aim at a
/// handful of lines per packet so frames close with little latency.
pub fn find_xfer_size_for_width(pixel_format: PixelFormat, width: u32) -> usize {
    if width >= FULL_PACKET_WIDTH {
        return MAX_ISO_PACKET_LEN;
    }
    let size = pixel_format.stride(width) as usize * LINES_PER_PACKET;
    size.div_ceil(ISO_PACKET_GRANULARITY)
        .saturating_mul(ISO_PACKET_GRANULARITY)
        .clamp(ISO_PACKET_GRANULARITY, MAX_ISO_PACKET_LEN)
}

/// A submission the device refused
#[derive(Debug)]
pub struct RejectedTransfer {
    /// The transfer, handed back to its owner
    pub transfer: IsoTransfer,
    /// Whether the device is gone
    pub disconnected: bool,
    /// Why the submission failed
    pub reason: String,
}

/// Event source shared by every open device
pub trait UsbContext: Send + Sync {
    /// Wait up to `timeout` and pass every completed transfer to `on_complete`
    fn handle_events(
        &self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(IsoTransfer),
    ) -> CaptureResult<()>;

    /// Wake a thread blocked in [`handle_events`](Self::handle_events)
    fn interrupt(&self);
}

/// One capture card
pub trait UsbDevice: Send + Sync {
    /// Open card number `card_index` and claim its interface
    fn open(&self, card_index: usize) -> CaptureResult<()>;

    /// Human readable name of the opened card
    fn description(&self) -> String;

    /// Vendor OUT control transfer
    fn control_write(&self, request: u8, data: &[u8]) -> CaptureResult<()>;

    /// Queue an iso transfer
    fn submit(&self, transfer: IsoTransfer) -> Result<(), RejectedTransfer>;

    /// Release the card and hand back transfers still in flight
    fn close(&self) -> Vec<IsoTransfer>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_addresses() {
        assert_eq!(Endpoint::Video.address(), 0x83);
        assert_eq!(Endpoint::Audio.address(), 0x84);
        assert_eq!(Endpoint::Audio.role(), StreamRole::Audio);
        assert_eq!(Endpoint::Video.to_string(), "0x83");
    }

    #[test]
    fn test_xfer_size_for_width() {
        assert_eq!(find_xfer_size_for_width(PixelFormat::EightBitYCbCr, 1920), 32768);
        assert_eq!(find_xfer_size_for_width(PixelFormat::TenBitYCbCr, 1280), 32768);
        // 720 * 2 * 6 = 8640, rounded up to 9216
        assert_eq!(find_xfer_size_for_width(PixelFormat::EightBitYCbCr, 720), 9216);
        // v210 stride of 720 is 1920; * 6 = 11520 -> 11264 + 1024
        assert_eq!(find_xfer_size_for_width(PixelFormat::TenBitYCbCr, 720), 12288);
        assert_eq!(find_xfer_size_for_width(PixelFormat::EightBitYCbCr, 640), 8192);
    }

    #[test]
    fn test_transfer_layouts() {
        let owner = Uuid::new_v4();
        let audio = IsoTransfer::audio(owner);
        assert_eq!(audio.descriptors().len(), 80);
        assert_eq!(audio.packet_len(), 0xc0);

        let mut video = IsoTransfer::video(owner, PixelFormat::EightBitYCbCr, 1280);
        assert_eq!(video.descriptors().len(), 4);
        assert!(video.resize_for_width(PixelFormat::EightBitYCbCr, 720));
        assert_eq!(video.descriptors().len(), VIDEO_TRANSFER_LEN / 9216);
        assert!(!video.resize_for_width(PixelFormat::EightBitYCbCr, 720));
    }

    #[test]
    fn test_packets_view() {
        let mut xfr = IsoTransfer::new(Uuid::new_v4(), Endpoint::Audio, 12, 4);
        assert_eq!(xfr.fill_packet(0, b"ab"), Some(2));
        assert_eq!(xfr.fill_packet(1, b"cdefgh"), Some(4));
        assert_eq!(xfr.fill_packet(3, b"x"), None);

        let packets: Vec<_> = xfr.packets().collect();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].data, b"ab");
        assert_eq!(packets[1].data, b"cdef");
        assert!(!packets[2].completed);
        assert!(packets[2].data.is_empty());

        xfr.reset();
        assert!(xfr.packets().all(|p| !p.completed && p.data.is_empty()));
    }
}
