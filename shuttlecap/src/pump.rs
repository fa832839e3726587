//! Process-wide USB event thread
//!
//! One pump serves every capture session. It repeatedly waits on the
//! [`UsbContext`] for completed transfers and routes each one to the session
//! that owns it, looked up by the session id stamped on the transfer.
//! Starting a second pump while one runs, or stopping one that is not
//! running, is an error. If the event thread dies on its own, every
//! registered session is told through [`TransferHandler::on_pump_exit`] and
//! the pump counts as stopped, so it can be started again.

use crate::usb::{IsoTransfer, UsbContext};
use dashmap::DashMap;
use parking_lot::Mutex;
use shuttlecap_core::error::{CaptureError, CaptureResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Name of the pump thread
pub const PUMP_THREAD_NAME: &str = "shuttlecap-usb";
/// How long one event wait may block before checking for shutdown
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Receiver of completed transfers
pub trait TransferHandler: Send + Sync {
    /// Called on the pump thread for every completed transfer
    fn on_transfer_complete(&self, transfer: IsoTransfer);

    /// Called when the event thread exits without being asked to
    fn on_pump_exit(&self) {}
}

struct RunningPump {
    should_quit: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    context: Arc<dyn UsbContext>,
    handle: JoinHandle<()>,
}

static PUMP: Mutex<Option<RunningPump>> = parking_lot::const_mutex(None);
static ROUTES: OnceLock<DashMap<Uuid, Arc<dyn TransferHandler>>> = OnceLock::new();

fn routes() -> &'static DashMap<Uuid, Arc<dyn TransferHandler>> {
    ROUTES.get_or_init(DashMap::new)
}

/// Handle to the shared USB event thread
#[derive(Debug)]
pub struct IoPump;

impl IoPump {
    /// Start the event thread on `context`
    pub fn start(context: Arc<dyn UsbContext>) -> CaptureResult<()> {
        let mut pump = PUMP.lock();
        if let Some(running) = pump.take() {
            if !running.exited.load(Ordering::SeqCst) {
                *pump = Some(running);
                return Err(CaptureError::PumpState {
                    message: "USB event thread is already running".to_string(),
                });
            }
            running.reap();
        }

        let should_quit = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        let thread_quit = Arc::clone(&should_quit);
        let thread_exited = Arc::clone(&exited);
        let thread_context = Arc::clone(&context);
        let handle = thread::Builder::new()
            .name(PUMP_THREAD_NAME.to_string())
            .spawn(move || {
                run(thread_context, &thread_quit);
                thread_exited.store(true, Ordering::SeqCst);
            })
            .map_err(|source| CaptureError::ThreadSpawn {
                name: PUMP_THREAD_NAME.to_string(),
                source,
            })?;

        *pump = Some(RunningPump {
            should_quit,
            exited,
            context,
            handle,
        });
        info!("USB event thread started");
        Ok(())
    }

    /// Stop the event thread and wait for it to exit
    ///
    /// Stopping a thread that already died on its own only reaps it.
    pub fn stop() -> CaptureResult<()> {
        let running = PUMP.lock().take().ok_or_else(|| CaptureError::PumpState {
            message: "USB event thread is not running".to_string(),
        })?;

        running.should_quit.store(true, Ordering::SeqCst);
        running.context.interrupt();
        running.reap();
        info!("USB event thread stopped");
        Ok(())
    }

    /// Whether the event thread is running
    pub fn is_running() -> bool {
        PUMP.lock()
            .as_ref()
            .is_some_and(|running| !running.exited.load(Ordering::SeqCst))
    }

    /// Route completions of transfers owned by `session_id` to `handler`
    pub fn register(session_id: Uuid, handler: Arc<dyn TransferHandler>) {
        routes().insert(session_id, handler);
        debug!("Registered transfer route for session {}", session_id);
    }

    /// Stop routing completions for `session_id`
    ///
    /// Transfers that complete afterwards are freed by the pump.
    pub fn unregister(session_id: Uuid) {
        if routes().remove(&session_id).is_some() {
            debug!("Removed transfer route for session {}", session_id);
        }
    }

    /// Sessions with a registered route
    pub fn route_count() -> usize {
        routes().len()
    }
}

impl RunningPump {
    fn reap(self) {
        if self.handle.join().is_err() {
            error!("USB event thread panicked");
        }
    }
}

fn run(context: Arc<dyn UsbContext>, should_quit: &AtomicBool) {
    raise_priority();

    let mut dispatch = |transfer: IsoTransfer| {
        let owner = transfer.owner();
        let handler = routes().get(&owner).map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => handler.on_transfer_complete(transfer),
            None => trace!("Dropping transfer of unregistered session {}", owner),
        }
    };

    while !should_quit.load(Ordering::SeqCst) {
        if let Err(e) = context.handle_events(POLL_TIMEOUT, &mut dispatch) {
            error!("USB event handling failed, event thread exiting: {}", e);
            notify_exit();
            return;
        }
    }
}

fn notify_exit() {
    let handlers: Vec<Arc<dyn TransferHandler>> = routes()
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    for handler in handlers {
        handler.on_pump_exit();
    }
}

#[cfg(target_os = "linux")]
fn raise_priority() {
    // SAFETY: sched_param is plain data; all-zero is a valid value.
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = 1;
    // SAFETY: `param` is initialised and pid 0 is the calling thread.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc == -1 {
        warn!(
            "Couldn't set realtime priority for USB thread: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_priority() {}
