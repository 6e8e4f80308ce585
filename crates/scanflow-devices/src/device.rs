/*!
 * Device record and frontend API surface.
 *
 * A device record is shared between the registry, the event loop and any
 * open frontend handle. Three actors touch it concurrently: the
 * event-loop thread (HTTP completions, timers, the cancel event), the
 * frontend caller (open/start/read/cancel/close) and discovery (add and
 * remove). The state machine state is published through a seq-cst atomic
 * so callers can observe transitions without the device mutex; everything
 * else mutable lives behind it.
 */
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, Span};
use url::Url;

use scanflow_core::eloop::{EloopEvent, EloopHandle, EloopTimer};
use scanflow_core::logging::device_span;
use scanflow_core::types::{ProtoId, Status};

use crate::decoder::{ImageDecoder, RasterDecoder};
use crate::http::{HttpClient, HttpTransport};
use crate::options::{DeviceOptions, ScanOption, ScanOptions, ScanParameters};
use crate::protocol::{ProtoHandler, ProtoOp, ProtoScanParams};
use crate::queue::{ImageQueue, Pollable};
use crate::registry::DeviceTable;

bitflags! {
    /// Device lifecycle flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// Present in the device table
        const LISTED = 1 << 0;
        /// Capabilities known, device can be opened
        const READY = 1 << 1;
        /// Removed from the table; no new I/O is started
        const HALTED = 1 << 2;
        /// Endpoint probing in progress; counts against table readiness
        const INIT_WAIT = 1 << 3;
        /// Between start and the final read
        const SCANNING = 1 << 4;
        /// read may be called
        const READING = 1 << 5;
    }
}

/// Scan state machine states.
///
/// ```text
///  ----->CLOSED
///  |       |
///  |       V
///  |  -->IDLE
///  |  |    |
///  |  |    V
///  |  |  SCANNING -> CANCEL_REQ -> CANCEL_WAIT ---
///  |  |    |                           |         |
///  |  |    V                           V         |
///  |  |  CLEANUP                   CANCELLING    |
///  |  |    |                           |         |
///  |  |    V                           |         |
///  |  ---DONE<------------------------------------
///  |       |
///  --------
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DeviceState {
    /// No frontend handle is open
    Closed = 0,
    /// Open, no job running
    Idle = 1,
    /// Job operation chain in progress
    Scanning = 2,
    /// Cancel requested by the frontend, event not yet delivered
    CancelReq = 3,
    /// Cancel delivered, waiting for a job resource to cancel against
    CancelWait = 4,
    /// Cancel request submitted to the scanner
    Cancelling = 5,
    /// Cleaning up job leftovers on the scanner
    Cleanup = 6,
    /// Job finished; caller drains remaining data
    Done = 7,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Idle,
            2 => DeviceState::Scanning,
            3 => DeviceState::CancelReq,
            4 => DeviceState::CancelWait,
            5 => DeviceState::Cancelling,
            6 => DeviceState::Cleanup,
            7 => DeviceState::Done,
            _ => DeviceState::Closed,
        }
    }

    /// Whether the state machine is between `Idle` and `Done`, i.e. a
    /// job is in flight
    pub fn is_working(self) -> bool {
        self > DeviceState::Idle && self < DeviceState::Done
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Closed => "CLOSED",
            DeviceState::Idle => "IDLE",
            DeviceState::Scanning => "SCANNING",
            DeviceState::CancelReq => "CANCEL_REQ",
            DeviceState::CancelWait => "CANCEL_WAIT",
            DeviceState::Cancelling => "CANCELLING",
            DeviceState::Cleanup => "CLEANUP",
            DeviceState::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// One advertised endpoint of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Protocol spoken at the endpoint
    pub proto: ProtoId,
    /// Absolute base URI
    pub uri: Url,
}

/// Mutable device state guarded by the device mutex.
///
/// Mutated on the event-loop thread, except for the job-reset and option
/// fields the frontend writes at well-defined points (start, set_option).
pub(crate) struct DeviceInner {
    /// Capabilities, options and derived parameters
    pub opt: DeviceOptions,
    /// Bound protocol handler, if any
    pub proto: Option<Box<dyn ProtoHandler>>,
    /// Endpoints discovered for this device
    pub endpoints: Vec<Endpoint>,
    /// Index of the endpoint being probed / in use
    pub endpoint_current: Option<usize>,
    /// Base URI of the current endpoint
    pub base_uri: Option<Url>,
    /// Job resource URI returned by `SCAN`
    pub location: Option<String>,
    /// Wire parameters of the current job
    pub wire_params: ProtoScanParams,
    /// Consecutive failed attempts of the current operation
    pub failed_attempt: u32,
    /// Operation currently in flight or about to be retried
    pub op_current: ProtoOp,
    /// HTTP status observed right before a `CHECK` was scheduled
    pub checking_http_status: Option<u16>,
    /// Armed retry timer, if any
    pub stm_timer: Option<EloopTimer>,
    /// Sticky job completion status
    pub job_status: Status,
    /// Total count of received images
    pub job_images_received: u32,
    /// Pixels to skip from the left of each returned image
    pub job_skip_x: i32,
    /// Lines to skip from the top of each returned image
    pub job_skip_y: i32,
}

/// Read-pipeline state, touched only by the frontend caller
pub(crate) struct ReadState {
    /// Image decoder
    pub decoder: Box<dyn ImageDecoder>,
    /// Image currently being decoded
    pub image: Option<Bytes>,
    /// Single-line buffer; empty while no image is under decode
    pub line_buf: Vec<u8>,
    /// Current image line, 0-based
    pub line_num: i32,
    /// Lines at `line_end` and beyond are past the decoded window
    pub line_end: i32,
    /// Current offset in the line
    pub line_off: usize,
    /// Leading lines to synthesize instead of decoding
    pub skip_lines: i32,
    /// Bytes to skip at each line beginning
    pub skip_bytes: usize,
}

/// A network scanner device
pub struct Device {
    pub(crate) name: String,
    pub(crate) span: Span,
    pub(crate) table: Weak<DeviceTable>,
    pub(crate) eloop: EloopHandle,
    pub(crate) http: Arc<HttpClient>,

    flags: AtomicU32,
    stm_state: AtomicU8,
    pub(crate) read_non_blocking: AtomicBool,

    pub(crate) inner: Mutex<DeviceInner>,
    pub(crate) stm_cond: Condvar,
    pub(crate) read: Mutex<ReadState>,
    pub(crate) queue: ImageQueue,
    pub(crate) pollable: Pollable,
    pub(crate) cancel_event: Mutex<Option<EloopEvent>>,

    pub(crate) retry_attempts: u32,
    pub(crate) retry_pause: Duration,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("flags", &self.flags())
            .field("state", &self.state())
            .finish()
    }
}

impl Device {
    /// Create a device record. Called by the registry on the event-loop
    /// thread; the caller adds it to the table and kicks off probing.
    pub(crate) fn new(
        name: &str,
        endpoints: Vec<Endpoint>,
        table: Weak<DeviceTable>,
        eloop: EloopHandle,
        transport: Arc<dyn HttpTransport>,
        retry_attempts: u32,
        retry_pause: Duration,
    ) -> std::io::Result<Arc<Self>> {
        let pollable = Pollable::new()?;
        let http = Arc::new(HttpClient::new(transport, eloop.clone()));

        let dev = Arc::new(Self {
            name: name.to_string(),
            span: device_span(name),
            table,
            eloop,
            http,
            flags: AtomicU32::new((DeviceFlags::LISTED | DeviceFlags::INIT_WAIT).bits()),
            stm_state: AtomicU8::new(DeviceState::Closed as u8),
            read_non_blocking: AtomicBool::new(false),
            inner: Mutex::new(DeviceInner {
                opt: DeviceOptions::default(),
                proto: None,
                endpoints,
                endpoint_current: None,
                base_uri: None,
                location: None,
                wire_params: ProtoScanParams::default(),
                failed_attempt: 0,
                op_current: ProtoOp::None,
                checking_http_status: None,
                stm_timer: None,
                job_status: Status::Good,
                job_images_received: 0,
                job_skip_x: 0,
                job_skip_y: 0,
            }),
            stm_cond: Condvar::new(),
            read: Mutex::new(ReadState {
                decoder: Box::new(RasterDecoder::new()),
                image: None,
                line_buf: Vec::new(),
                line_num: 0,
                line_end: 0,
                line_off: 0,
                skip_lines: 0,
                skip_bytes: 0,
            }),
            queue: ImageQueue::new(),
            pollable,
            cancel_event: Mutex::new(None),
            retry_attempts,
            retry_pause,
        });

        debug!(parent: &dev.span, "device created");
        Ok(dev)
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current flags snapshot
    pub fn flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits_retain(self.flags.load(Ordering::SeqCst))
    }

    pub(crate) fn flags_set(&self, flags: DeviceFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn flags_clear(&self, flags: DeviceFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Current state machine state
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.stm_state.load(Ordering::SeqCst))
    }

    /// Whether a job is in flight
    pub fn state_working(&self) -> bool {
        self.state().is_working()
    }

    /// Move the state machine to `state` and wake every waiter.
    ///
    /// Must not be called with the device mutex held; it takes the mutex
    /// itself to pair the store with waiting readers.
    pub(crate) fn state_set(&self, state: DeviceState) {
        if self.state() != state {
            debug!(parent: &self.span, "state={}", state);
            self.stm_state.store(state as u8, Ordering::SeqCst);
            drop(self.inner.lock());
            self.stm_cond.notify_all();

            if !self.state_working() {
                self.pollable.signal();
            }
        }
    }

    /// Atomically claim a closed device for open; loses to a concurrent
    /// open
    pub(crate) fn try_claim(&self) -> Result<(), ()> {
        self.stm_state
            .compare_exchange(
                DeviceState::Closed as u8,
                DeviceState::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| debug!(parent: &self.span, "state={}", DeviceState::Idle))
            .map_err(|_| ())
    }

    /// Request cancellation: a compare-and-set from `Scanning` plus a
    /// one-shot event the event-loop thread acts on. Concurrent or
    /// repeated requests are silently dropped.
    pub(crate) fn stm_cancel_req(&self) {
        let ok = self
            .stm_state
            .compare_exchange(
                DeviceState::Scanning as u8,
                DeviceState::CancelReq as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if ok {
            if let Some(event) = self.cancel_event.lock().as_ref() {
                event.trigger();
            }
        }
    }

    /// Block until the state machine leaves the working states
    pub(crate) fn stm_wait_while_working(&self) {
        let mut inner = self.inner.lock();
        while self.state_working() {
            self.stm_cond.wait(&mut inner);
        }
    }

    /// Update the sticky job status
    pub(crate) fn job_set_status(&self, status: Status) {
        let mut inner = self.inner.lock();
        self.job_set_status_locked(&mut inner, status);
    }

    /// Update the sticky job status with the device mutex already held.
    ///
    /// `Good` never changes anything. `Cancelled` always wins and purges
    /// the image queue. Any other error is kept only if it is the first
    /// one and no image has been delivered yet; once the caller has
    /// images, it learns about errors on the next read cycle.
    pub(crate) fn job_set_status_locked(&self, inner: &mut DeviceInner, status: Status) {
        match status {
            Status::Good => return,
            Status::Cancelled => {}
            _ => {
                if inner.job_images_received > 0 {
                    return;
                }
                if inner.job_status != Status::Good {
                    return;
                }
            }
        }

        if status != inner.job_status {
            debug!(parent: &self.span, "job status={}", status);
            inner.job_status = status;

            if status == Status::Cancelled {
                self.queue.purge();
            }
        }
    }

    /// Current option values
    pub fn options(&self) -> ScanOptions {
        self.inner.lock().opt.current.clone()
    }

    /// Apply one option assignment. Rejected while a scan is in progress.
    pub fn set_option(&self, option: ScanOption) -> Result<(), Status> {
        if self.flags().contains(DeviceFlags::SCANNING) {
            return Err(Status::Inval);
        }
        self.inner.lock().opt.set(option)
    }

    /// Frontend parameters derived from the current options
    pub fn parameters(&self) -> ScanParameters {
        self.inner.lock().opt.params
    }

    /// Start a scan job.
    ///
    /// If the previous job is still producing but has buffered at least
    /// one image, the new job simply consumes the next queued image; no
    /// new `SCAN` is issued. Otherwise the job state is reset and the
    /// operation chain is started on the event-loop thread; the call
    /// returns once the machine has left `Idle`.
    pub fn start(self: &Arc<Self>) -> Result<(), Status> {
        if self.flags().contains(DeviceFlags::SCANNING) {
            return Err(Status::Inval);
        }

        {
            let inner = self.inner.lock();
            if inner.opt.params.lines == 0 || inner.opt.params.pixels_per_line == 0 {
                return Err(Status::Inval);
            }
        }

        self.flags_set(DeviceFlags::SCANNING);
        self.pollable.reset();
        self.read_non_blocking.store(false, Ordering::SeqCst);

        // The previous job may still be running; synchronize with it
        {
            let mut inner = self.inner.lock();
            while self.state_working() && self.queue.is_empty() {
                self.stm_cond.wait(&mut inner);
            }

            if !self.queue.is_empty() {
                drop(inner);
                self.flags_set(DeviceFlags::READING);
                return Ok(());
            }

            inner.job_status = Status::Good;
            inner.location = None;
            inner.failed_attempt = 0;
            inner.job_images_received = 0;
        }

        self.state_set(DeviceState::Idle);

        let dev = self.clone();
        self.eloop.call(move || dev.stm_start_scan());

        {
            let mut inner = self.inner.lock();
            while self.state() == DeviceState::Idle {
                self.stm_cond.wait(&mut inner);
            }
        }

        self.flags_set(DeviceFlags::READING);
        Ok(())
    }

    /// Request cancellation of the running job
    pub fn cancel(&self) {
        self.stm_cancel_req();
    }

    /// Switch between blocking and non-blocking reads. Only valid while
    /// scanning.
    pub fn set_io_mode(&self, non_blocking: bool) -> Result<(), Status> {
        if !self.flags().contains(DeviceFlags::SCANNING) {
            return Err(Status::Inval);
        }
        self.read_non_blocking.store(non_blocking, Ordering::SeqCst);
        Ok(())
    }

    /// File descriptor that becomes readable whenever the state or the
    /// image queue changes. Only valid while scanning.
    pub fn select_fd(&self) -> Result<RawFd, Status> {
        if !self.flags().contains(DeviceFlags::SCANNING) {
            return Err(Status::Inval);
        }
        Ok(self.pollable.fd())
    }

    /// Close the device: cancel a job in progress, wait for the machine
    /// to settle, tear down the cancel event.
    pub(crate) fn close_internal(&self) {
        if self.state() != DeviceState::Closed {
            if self.state_working() {
                self.stm_cancel_req();
                self.stm_wait_while_working();
            }

            *self.cancel_event.lock() = None;
            self.state_set(DeviceState::Closed);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!(parent: &self.span, "device destroyed");
        debug_assert!(!self.flags().contains(DeviceFlags::LISTED));
        debug_assert!(self.flags().contains(DeviceFlags::HALTED));
        debug_assert_eq!(self.state(), DeviceState::Closed);
    }
}

/// An open frontend handle to a device.
///
/// The handle keeps the device alive even after it disappears from the
/// registry. Dropping the handle closes the device, cancelling any job
/// still in progress.
pub struct DeviceHandle {
    dev: Arc<Device>,
}

impl DeviceHandle {
    pub(crate) fn new(dev: Arc<Device>) -> Self {
        Self { dev }
    }

    /// Device name
    pub fn name(&self) -> &str {
        self.dev.name()
    }

    /// Current option values
    pub fn options(&self) -> ScanOptions {
        self.dev.options()
    }

    /// Apply one option assignment
    pub fn set_option(&self, option: ScanOption) -> Result<(), Status> {
        self.dev.set_option(option)
    }

    /// Frontend parameters derived from the current options
    pub fn parameters(&self) -> ScanParameters {
        self.dev.parameters()
    }

    /// Start a scan job
    pub fn start(&self) -> Result<(), Status> {
        self.dev.start()
    }

    /// Request cancellation of the running job
    pub fn cancel(&self) {
        self.dev.cancel()
    }

    /// Read decoded raster data; see [`Device::read`]
    pub fn read(&self, data: &mut [u8]) -> Result<usize, Status> {
        self.dev.read(data)
    }

    /// Switch between blocking and non-blocking reads
    pub fn set_io_mode(&self, non_blocking: bool) -> Result<(), Status> {
        self.dev.set_io_mode(non_blocking)
    }

    /// File descriptor for select/poll-driven frontends
    pub fn select_fd(&self) -> Result<RawFd, Status> {
        self.dev.select_fd()
    }

    /// Close the handle
    pub fn close(self) {}

    /// The underlying device, for introspection
    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.dev.close_internal();
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.dev.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(!DeviceState::Closed.is_working());
        assert!(!DeviceState::Idle.is_working());
        assert!(DeviceState::Scanning.is_working());
        assert!(DeviceState::CancelReq.is_working());
        assert!(DeviceState::CancelWait.is_working());
        assert!(DeviceState::Cancelling.is_working());
        assert!(DeviceState::Cleanup.is_working());
        assert!(!DeviceState::Done.is_working());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            DeviceState::Closed,
            DeviceState::Idle,
            DeviceState::Scanning,
            DeviceState::CancelReq,
            DeviceState::CancelWait,
            DeviceState::Cancelling,
            DeviceState::Cleanup,
            DeviceState::Done,
        ] {
            assert_eq!(DeviceState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_flags_are_disjoint() {
        let all = DeviceFlags::all();
        assert_eq!(all.bits().count_ones(), 6);
    }
}
