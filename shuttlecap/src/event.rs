//! Capture session events
//!
//! Lifecycle changes and runtime failures are broadcast to every
//! [`EventStream`] subscribed to a session. Events are plain values so they
//! can be sent from the USB event thread without allocating.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of each session's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened to a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    /// The device was opened and the dequeue thread started
    Configured {
        /// Session id
        session_id: Uuid,
    },
    /// Transfers were submitted
    CaptureStarted {
        /// Session id
        session_id: Uuid,
    },
    /// The device went away; the session is unusable from now on
    Disconnected {
        /// Session id
        session_id: Uuid,
    },
    /// A transfer completed with an error and was retired
    TransferFailed {
        /// Session id
        session_id: Uuid,
        /// Endpoint address
        endpoint: u8,
        /// Transport status code
        code: i32,
    },
    /// The device refused to take a completed transfer back
    SubmitFailed {
        /// Session id
        session_id: Uuid,
        /// Endpoint address
        endpoint: u8,
    },
    /// The USB event thread died; no more completions will arrive
    PumpExited {
        /// Session id
        session_id: Uuid,
    },
    /// The session was torn down
    CaptureStopped {
        /// Session id
        session_id: Uuid,
    },
}

impl CaptureEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            CaptureEvent::Configured { .. } => "configured",
            CaptureEvent::CaptureStarted { .. } => "capture_started",
            CaptureEvent::Disconnected { .. } => "disconnected",
            CaptureEvent::TransferFailed { .. } => "transfer_failed",
            CaptureEvent::SubmitFailed { .. } => "submit_failed",
            CaptureEvent::PumpExited { .. } => "pump_exited",
            CaptureEvent::CaptureStopped { .. } => "capture_stopped",
        }
    }

    /// Session the event belongs to
    pub fn session_id(&self) -> Uuid {
        match *self {
            CaptureEvent::Configured { session_id }
            | CaptureEvent::CaptureStarted { session_id }
            | CaptureEvent::Disconnected { session_id }
            | CaptureEvent::TransferFailed { session_id, .. }
            | CaptureEvent::SubmitFailed { session_id, .. }
            | CaptureEvent::PumpExited { session_id }
            | CaptureEvent::CaptureStopped { session_id } => session_id,
        }
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(
            self,
            CaptureEvent::Disconnected { .. }
                | CaptureEvent::TransferFailed { .. }
                | CaptureEvent::SubmitFailed { .. }
                | CaptureEvent::PumpExited { .. }
        )
    }
}

/// Stream of session events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<CaptureEvent>,
}

impl EventStream {
    /// Wrap a broadcast receiver
    pub fn new(receiver: broadcast::Receiver<CaptureEvent>) -> Self {
        Self { receiver }
    }

    /// Get the next event from the stream
    ///
    /// Events missed because the subscriber fell behind are skipped.
    /// Returns `None` once the session is gone.
    pub async fn next(&mut self) -> Option<CaptureEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<CaptureEvent>, broadcast::error::TryRecvError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_stream_delivery() {
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut stream = EventStream::new(rx);
        let session_id = Uuid::new_v4();

        assert_eq!(stream.try_next().unwrap(), None);
        tx.send(CaptureEvent::Configured { session_id }).unwrap();

        let event = tokio_test::block_on(stream.next()).unwrap();
        assert_eq!(event.event_type(), "configured");
        assert_eq!(event.session_id(), session_id);
        assert!(!event.is_error_event());
    }

    #[test]
    fn test_runtime_failures_are_error_events() {
        let session_id = Uuid::new_v4();
        let submit = CaptureEvent::SubmitFailed {
            session_id,
            endpoint: 0x83,
        };
        let pump = CaptureEvent::PumpExited { session_id };

        assert_eq!(submit.event_type(), "submit_failed");
        assert_eq!(pump.event_type(), "pump_exited");
        assert!(submit.is_error_event() && pump.is_error_event());
        assert_eq!(pump.session_id(), session_id);
        assert!(!CaptureEvent::CaptureStopped { session_id }.is_error_event());
    }

    #[test]
    fn test_closed_stream_ends() {
        let (tx, rx) = broadcast::channel::<CaptureEvent>(4);
        let mut stream = EventStream::new(rx);
        drop(tx);
        assert_eq!(tokio_test::block_on(stream.next()), None);
    }
}
