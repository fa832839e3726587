//! In-memory USB backend
//!
//! [`LoopbackContext`] and [`LoopbackDevice`] stand in for real hardware.
//! Transfers a session submits wait in per-endpoint queues until a test (or
//! a replay tool) writes stream bytes into them with
//! [`LoopbackDevice::feed_blocks`], at which point they complete through the
//! context exactly like hardware completions would.

use crate::usb::{Endpoint, IsoTransfer, RejectedTransfer, TransferStatus, UsbContext, UsbDevice};
use parking_lot::{Condvar, Mutex};
use shuttlecap_core::error::{CaptureError, CaptureResult};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Default)]
struct DeviceSlot {
    description: String,
    open: bool,
    disconnected: bool,
    fail_open: bool,
    fail_submit: bool,
    video: VecDeque<IsoTransfer>,
    audio: VecDeque<IsoTransfer>,
    controls: Vec<(u8, Vec<u8>)>,
}

impl DeviceSlot {
    fn queue(&mut self, endpoint: Endpoint) -> &mut VecDeque<IsoTransfer> {
        match endpoint {
            Endpoint::Video => &mut self.video,
            Endpoint::Audio => &mut self.audio,
        }
    }
}

#[derive(Default)]
struct LoopbackState {
    completed: VecDeque<IsoTransfer>,
    interrupted: bool,
    devices: Vec<DeviceSlot>,
}

#[derive(Default)]
struct LoopbackShared {
    state: Mutex<LoopbackState>,
    changed: Condvar,
}

/// Completion source for loopback devices
#[derive(Clone, Default)]
pub struct LoopbackContext {
    shared: Arc<LoopbackShared>,
}

impl LoopbackContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a new device
    pub fn add_device(&self, description: impl Into<String>) -> LoopbackDevice {
        let mut state = self.shared.state.lock();
        state.devices.push(DeviceSlot {
            description: description.into(),
            ..DeviceSlot::default()
        });
        LoopbackDevice {
            shared: Arc::clone(&self.shared),
            slot: state.devices.len() - 1,
        }
    }
}

impl UsbContext for LoopbackContext {
    fn handle_events(
        &self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(IsoTransfer),
    ) -> CaptureResult<()> {
        let deadline = Instant::now() + timeout;
        let completed = {
            let mut state = self.shared.state.lock();
            while state.completed.is_empty() && !state.interrupted {
                if self
                    .shared
                    .changed
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            state.interrupted = false;
            std::mem::take(&mut state.completed)
        };

        for transfer in completed {
            on_complete(transfer);
        }
        Ok(())
    }

    fn interrupt(&self) {
        self.shared.state.lock().interrupted = true;
        self.shared.changed.notify_all();
    }
}

/// One simulated capture card
///
/// Clones refer to the same card, so a test can keep a handle while the
/// session owns another.
#[derive(Clone)]
pub struct LoopbackDevice {
    shared: Arc<LoopbackShared>,
    slot: usize,
}

impl LoopbackDevice {
    fn with_slot<R>(&self, f: impl FnOnce(&mut DeviceSlot) -> R) -> R {
        let mut state = self.shared.state.lock();
        f(&mut state.devices[self.slot])
    }

    /// Make the next `open` fail
    pub fn set_fail_open(&self, fail: bool) {
        self.with_slot(|slot| slot.fail_open = fail);
    }

    /// Make submissions fail without the device going away
    pub fn set_fail_submit(&self, fail: bool) {
        self.with_slot(|slot| slot.fail_submit = fail);
    }

    /// Whether the device is currently open
    pub fn is_open(&self) -> bool {
        self.with_slot(|slot| slot.open)
    }

    /// Control writes received so far, oldest first
    pub fn control_writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.with_slot(|slot| slot.controls.clone())
    }

    /// Transfers waiting for data on `endpoint`
    pub fn pending(&self, endpoint: Endpoint) -> usize {
        self.with_slot(|slot| slot.queue(endpoint).len())
    }

    /// Packet slot length and packet count of every queued transfer
    pub fn pending_layouts(&self, endpoint: Endpoint) -> Vec<(usize, usize)> {
        self.with_slot(|slot| {
            slot.queue(endpoint)
                .iter()
                .map(|transfer| (transfer.packet_len(), transfer.descriptors().len()))
                .collect()
        })
    }

    /// Wait until at least `count` transfers are queued on `endpoint`
    pub fn wait_pending(&self, endpoint: Endpoint, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.devices[self.slot].queue(endpoint).len() < count {
            if self
                .shared
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.devices[self.slot].queue(endpoint).len() >= count;
            }
        }
        true
    }

    fn take_pending(&self, endpoint: Endpoint, deadline: Instant) -> Option<IsoTransfer> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(mut transfer) = state.devices[self.slot].queue(endpoint).pop_front() {
                transfer.reset();
                return Some(transfer);
            }
            if self
                .shared
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return None;
            }
        }
    }

    fn complete(&self, mut transfer: IsoTransfer, status: TransferStatus) {
        transfer.set_status(status);
        self.shared.state.lock().completed.push_back(transfer);
        self.shared.changed.notify_all();
    }

    /// Complete the next queued transfer on `endpoint` with `status`
    pub fn complete_next(&self, endpoint: Endpoint, status: TransferStatus, timeout: Duration) -> bool {
        match self.take_pending(endpoint, Instant::now() + timeout) {
            Some(transfer) => {
                self.complete(transfer, status);
                true
            }
            None => false,
        }
    }

    /// Write stream blocks into queued transfers and complete them
    ///
    /// Every block starts at a fresh iso packet and spills over as many
    /// packets (and transfers) as it needs. Returns the number of transfers
    /// completed, which is short if the session stopped resubmitting before
    /// `timeout`.
    pub fn feed_blocks(&self, endpoint: Endpoint, blocks: &[&[u8]], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut current: Option<(IsoTransfer, usize)> = None;
        let mut completed = 0;

        for block in blocks {
            let mut rest: &[u8] = block;
            while !rest.is_empty() {
                let full = current
                    .as_ref()
                    .is_some_and(|(transfer, next)| *next >= transfer.descriptors().len());
                if full {
                    if let Some((transfer, _)) = current.take() {
                        self.complete(transfer, TransferStatus::Completed);
                        completed += 1;
                    }
                }
                if current.is_none() {
                    match self.take_pending(endpoint, deadline) {
                        Some(transfer) => current = Some((transfer, 0)),
                        None => return completed,
                    }
                }
                if let Some((transfer, next)) = current.as_mut() {
                    let written = transfer.fill_packet(*next, rest).unwrap_or(0);
                    *next += 1;
                    rest = &rest[written..];
                }
            }
        }

        if let Some((transfer, _)) = current.take() {
            self.complete(transfer, TransferStatus::Completed);
            completed += 1;
        }
        completed
    }

    /// Unplug the device: every queued transfer completes with `NoDevice`
    pub fn disconnect(&self) {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let slot = &mut state.devices[self.slot];
        slot.disconnected = true;
        for mut transfer in slot.video.drain(..).chain(slot.audio.drain(..)) {
            transfer.set_status(TransferStatus::NoDevice);
            state.completed.push_back(transfer);
        }
        self.shared.changed.notify_all();
        debug!("Loopback device {} unplugged", self.slot);
    }
}

impl UsbDevice for LoopbackDevice {
    fn open(&self, card_index: usize) -> CaptureResult<()> {
        self.with_slot(|slot| {
            if slot.fail_open || slot.disconnected {
                return Err(CaptureError::DeviceOpen {
                    card_index,
                    reason: "no such card".to_string(),
                });
            }
            slot.open = true;
            Ok(())
        })
    }

    fn description(&self) -> String {
        self.with_slot(|slot| slot.description.clone())
    }

    fn control_write(&self, request: u8, data: &[u8]) -> CaptureResult<()> {
        self.with_slot(|slot| {
            if slot.disconnected {
                return Err(CaptureError::Disconnected);
            }
            if !slot.open {
                return Err(CaptureError::DeviceControl {
                    request,
                    reason: "device not open".to_string(),
                });
            }
            slot.controls.push((request, data.to_vec()));
            Ok(())
        })
    }

    fn submit(&self, transfer: IsoTransfer) -> Result<(), RejectedTransfer> {
        let mut state = self.shared.state.lock();
        let slot = &mut state.devices[self.slot];
        if slot.disconnected || !slot.open || slot.fail_submit {
            let disconnected = slot.disconnected;
            let reason = if disconnected {
                "no device"
            } else if !slot.open {
                "device not open"
            } else {
                "endpoint busy"
            };
            return Err(RejectedTransfer {
                transfer,
                disconnected,
                reason: reason.to_string(),
            });
        }
        slot.queue(transfer.endpoint()).push_back(transfer);
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn close(&self) -> Vec<IsoTransfer> {
        self.with_slot(|slot| {
            slot.open = false;
            slot.video
                .drain(..)
                .chain(slot.audio.drain(..))
                .map(|mut transfer| {
                    transfer.set_status(TransferStatus::Cancelled);
                    transfer
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_submit_requires_open_device() {
        let ctx = LoopbackContext::new();
        let device = ctx.add_device("Loopback card");
        let rejected = device.submit(IsoTransfer::audio(Uuid::new_v4())).unwrap_err();
        assert!(!rejected.disconnected);

        device.open(0).unwrap();
        device.submit(IsoTransfer::audio(Uuid::new_v4())).unwrap();
        assert_eq!(device.pending(Endpoint::Audio), 1);
        assert_eq!(device.close().len(), 1);
        assert!(!device.is_open());
    }

    #[test]
    fn test_forced_submit_failure_keeps_device() {
        let ctx = LoopbackContext::new();
        let device = ctx.add_device("Loopback card");
        device.open(0).unwrap();
        device
            .submit(IsoTransfer::new(Uuid::new_v4(), Endpoint::Video, 16, 4))
            .unwrap();
        assert_eq!(device.pending_layouts(Endpoint::Video), vec![(4, 4)]);

        device.set_fail_submit(true);
        let rejected = device.submit(IsoTransfer::audio(Uuid::new_v4())).unwrap_err();
        assert!(!rejected.disconnected);
        assert_eq!(rejected.reason, "endpoint busy");
        assert!(device.is_open());
    }

    #[test]
    fn test_feed_blocks_aligns_blocks_to_packets() {
        let ctx = LoopbackContext::new();
        let device = ctx.add_device("Loopback card");
        device.open(0).unwrap();
        device
            .submit(IsoTransfer::new(Uuid::new_v4(), Endpoint::Video, 16, 4))
            .unwrap();

        let fed = device.feed_blocks(
            Endpoint::Video,
            &[&b"abcdef"[..], &b"xy"[..]],
            Duration::from_secs(1),
        );
        assert_eq!(fed, 1);

        let mut seen = Vec::new();
        ctx.handle_events(Duration::from_millis(10), &mut |transfer| {
            assert_eq!(transfer.status(), TransferStatus::Completed);
            seen.extend(transfer.packets().map(|p| p.data.to_vec()));
        })
        .unwrap();
        assert_eq!(seen, vec![b"abcd".to_vec(), b"ef".to_vec(), b"xy".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_disconnect_completes_pending_transfers() {
        let ctx = LoopbackContext::new();
        let device = ctx.add_device("Loopback card");
        device.open(0).unwrap();
        device.submit(IsoTransfer::audio(Uuid::new_v4())).unwrap();
        device.disconnect();

        let mut statuses = Vec::new();
        ctx.handle_events(Duration::from_millis(10), &mut |t| statuses.push(t.status()))
            .unwrap();
        assert_eq!(statuses, vec![TransferStatus::NoDevice]);
        assert!(device.submit(IsoTransfer::audio(Uuid::new_v4())).unwrap_err().disconnected);
    }

    #[test]
    fn test_interrupt_wakes_handler() {
        let ctx = LoopbackContext::new();
        ctx.interrupt();
        let start = Instant::now();
        ctx.handle_events(Duration::from_secs(5), &mut |_| {}).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
