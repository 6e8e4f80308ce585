//! End-to-end scenarios for the device scanning core, driven through a
//! scripted protocol handler and HTTP transport.
//!
//! The handler speaks a miniature eSCL-like dialect: capabilities are
//! served as JSON, `SCAN` returns a job location, `LOAD` serves PNG
//! pages until a 404 ends the job. The transport simulates the scanner
//! side, including transient 503 replies and gated (held) responses for
//! cancellation-timing tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use parking_lot::Mutex;
use tokio::sync::Notify;

use scanflow_core::config::{Config, StaticDevice};

use scanflow_devices::device::Device;
use scanflow_devices::http::{HttpError, HttpReply, HttpRequest, HttpTransport};
use scanflow_devices::protocol::{ProtoCtx, ProtoError};
use scanflow_devices::{
    Backend, ColorMode, DeviceCaps, DeviceState, Endpoint, HandlerRegistry, ProtoHandler, ProtoId,
    ProtoOp, ProtoPayload, ProtoResult, ScanOption, Source, SourceCaps, Status,
};

// ---------------------------------------------------------------------
// Scripted scanner
// ---------------------------------------------------------------------

#[derive(Default)]
struct ScannerScript {
    /// Capabilities served to the prober
    caps: DeviceCaps,
    /// Capability queries to fail with HTTP 500 before succeeding
    caps_failures: usize,
    /// `SCAN` requests to answer with 503 before succeeding
    scan_busy: usize,
    /// `LOAD` requests to answer with 503 before serving pages
    load_busy: usize,
    /// Pages served by successive `LOAD` requests
    pages: VecDeque<Bytes>,
    /// Route the end of job through `CLEANUP` instead of plain `FINISH`
    cleanup: bool,
    /// Hold `SCAN` replies until notified
    hold_scan: Option<Arc<Notify>>,
    /// Hold `LOAD` replies until notified
    hold_load: Option<Arc<Notify>>,
    /// `failed_attempt` values observed at each decode
    attempts_seen: Vec<u32>,
    /// Operations submitted, in order
    ops_submitted: Vec<&'static str>,
}

type Script = Arc<Mutex<ScannerScript>>;

fn reply(status: u16, body: Bytes) -> HttpReply {
    HttpReply {
        status,
        body,
        content_type: None,
    }
}

struct TestTransport {
    script: Script,
}

#[async_trait]
impl HttpTransport for TestTransport {
    async fn roundtrip(&self, request: HttpRequest) -> Result<HttpReply, HttpError> {
        let path = request.uri.path().to_string();
        let method = request.method.clone();

        if path.ends_with("/caps") {
            let mut s = self.script.lock();
            if s.caps_failures > 0 {
                s.caps_failures -= 1;
                return Ok(reply(500, Bytes::new()));
            }
            let body = serde_json::to_vec(&s.caps).unwrap();
            return Ok(reply(200, body.into()));
        }

        if method == reqwest::Method::POST && path.ends_with("/jobs") {
            let hold = self.script.lock().hold_scan.clone();
            if let Some(hold) = hold {
                hold.notified().await;
            }
            let mut s = self.script.lock();
            if s.scan_busy > 0 {
                s.scan_busy -= 1;
                return Ok(reply(503, Bytes::new()));
            }
            return Ok(reply(201, Bytes::from_static(b"jobs/1")));
        }

        if path.ends_with("/next") {
            let hold = self.script.lock().hold_load.clone();
            if let Some(hold) = hold {
                hold.notified().await;
            }
            let mut s = self.script.lock();
            if s.load_busy > 0 {
                s.load_busy -= 1;
                return Ok(reply(503, Bytes::new()));
            }
            return match s.pages.pop_front() {
                Some(page) => Ok(reply(200, page)),
                None => Ok(reply(404, Bytes::new())),
            };
        }

        if path.ends_with("/status") {
            return Ok(reply(200, Bytes::new()));
        }

        if method == reqwest::Method::DELETE {
            return Ok(reply(200, Bytes::new()));
        }

        Ok(reply(404, Bytes::new()))
    }
}

// ---------------------------------------------------------------------
// Scripted protocol handler
// ---------------------------------------------------------------------

struct TestHandler {
    script: Script,
}

impl TestHandler {
    fn note_attempt(&self, ctx: &ProtoCtx<'_>) {
        self.script.lock().attempts_seen.push(ctx.failed_attempt);
    }

    fn note_op(&self, op: &'static str) {
        self.script.lock().ops_submitted.push(op);
    }
}

impl ProtoHandler for TestHandler {
    fn name(&self) -> &'static str {
        "eSCL"
    }

    fn proto(&self) -> ProtoId {
        ProtoId::Escl
    }

    fn devcaps_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError> {
        Ok(HttpRequest::get(ctx.base_uri.join("caps")?))
    }

    fn devcaps_decode(&self, ctx: &ProtoCtx<'_>) -> Result<DeviceCaps, ProtoError> {
        let reply = ctx.reply()?;
        if reply.status != 200 {
            return Err(ProtoError::Malformed(format!("HTTP {}", reply.status)));
        }
        serde_json::from_slice(&reply.body).map_err(|err| ProtoError::Malformed(err.to_string()))
    }

    fn scan_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError> {
        self.note_op("SCAN");
        Ok(HttpRequest::post(
            ctx.base_uri.join("jobs")?,
            Bytes::new(),
            "text/plain",
        ))
    }

    fn scan_decode(&self, ctx: &ProtoCtx<'_>) -> ProtoResult {
        self.note_attempt(ctx);
        let Ok(reply) = ctx.reply() else {
            return ProtoResult {
                status: Status::IoError,
                ..Default::default()
            };
        };

        match reply.status {
            201 => ProtoResult {
                next: ProtoOp::Load,
                payload: ProtoPayload::Location(String::from_utf8_lossy(&reply.body).into_owned()),
                ..Default::default()
            },
            503 if ctx.failed_attempt < ctx.retry_attempts => ProtoResult {
                next: ProtoOp::Scan,
                delay: ctx.retry_pause,
                ..Default::default()
            },
            503 => ProtoResult {
                status: Status::DeviceBusy,
                err: Some("scanner busy".to_string()),
                ..Default::default()
            },
            other => ProtoResult {
                status: Status::IoError,
                err: Some(format!("SCAN: HTTP {}", other)),
                ..Default::default()
            },
        }
    }

    fn load_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError> {
        self.note_op("LOAD");
        let location = ctx.location.unwrap_or_default();
        Ok(HttpRequest::get(
            ctx.base_uri.join(&format!("{}/next", location))?,
        ))
    }

    fn load_decode(&self, ctx: &ProtoCtx<'_>) -> ProtoResult {
        self.note_attempt(ctx);
        let Ok(reply) = ctx.reply() else {
            return ProtoResult {
                status: Status::IoError,
                ..Default::default()
            };
        };

        match reply.status {
            200 => ProtoResult {
                next: ProtoOp::Load,
                payload: ProtoPayload::Image(reply.body.clone()),
                ..Default::default()
            },
            503 if ctx.failed_attempt < ctx.retry_attempts => ProtoResult {
                next: ProtoOp::Check,
                delay: ctx.retry_pause,
                ..Default::default()
            },
            404 => ProtoResult {
                next: if self.script.lock().cleanup {
                    ProtoOp::Cleanup
                } else {
                    ProtoOp::Finish
                },
                ..Default::default()
            },
            other => ProtoResult {
                status: Status::IoError,
                err: Some(format!("LOAD: HTTP {}", other)),
                ..Default::default()
            },
        }
    }

    fn status_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError> {
        self.note_op("CHECK");
        Ok(HttpRequest::get(ctx.base_uri.join("status")?))
    }

    fn status_decode(&self, ctx: &ProtoCtx<'_>) -> ProtoResult {
        self.note_attempt(ctx);
        ProtoResult {
            next: ProtoOp::Load,
            ..Default::default()
        }
    }

    fn cancel_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError> {
        self.note_op("CANCEL");
        let location = ctx.location.unwrap_or_default();
        Ok(HttpRequest::delete(ctx.base_uri.join(location)?))
    }

    fn cleanup_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError> {
        self.note_op("CLEANUP");
        let location = ctx.location.unwrap_or_default();
        Ok(HttpRequest::delete(
            ctx.base_uri.join(&format!("{}/leftovers", location))?,
        ))
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

const DEVICE_NAME: &str = "Example Scanner 9000";
const DEVICE_URI: &str = "http://192.0.2.55:8080/eSCL";

/// Small capability set so pages stay tiny: 100x80 px at 300 dpi units
fn small_caps() -> DeviceCaps {
    let mut sources = BTreeMap::new();
    sources.insert(
        Source::Platen,
        SourceCaps {
            min_wid_px: 4,
            max_wid_px: 100,
            min_hei_px: 4,
            max_hei_px: 80,
            resolutions: vec![300],
            colormodes: vec![ColorMode::Grayscale, ColorMode::Color],
        },
    );
    DeviceCaps {
        vendor: "Example".to_string(),
        model: "Scanner 9000".to_string(),
        units: 300,
        sources,
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.devices.push(StaticDevice {
        name: DEVICE_NAME.to_string(),
        uri: DEVICE_URI.to_string(),
        proto: ProtoId::Escl,
    });
    config.http.retry_pause_ms = 10;
    config
}

fn new_script() -> Script {
    let script = ScannerScript {
        caps: small_caps(),
        ..Default::default()
    };
    Arc::new(Mutex::new(script))
}

fn backend_with(script: &Script, config: Config) -> Backend {
    let mut handlers = HandlerRegistry::new();
    let handler_script = script.clone();
    handlers.register(ProtoId::Escl, move || {
        Box::new(TestHandler {
            script: handler_script.clone(),
        }) as Box<dyn ProtoHandler>
    });

    let transport = Arc::new(TestTransport {
        script: script.clone(),
    });

    Backend::with_transport(config, handlers, transport).unwrap()
}

/// Gray PNG where every pixel carries its column index
fn page_png(width: u32, height: u32) -> Bytes {
    let mut pixels = Vec::with_capacity((width * height) as usize);
    for _ in 0..height {
        for x in 0..width {
            pixels.push(x as u8);
        }
    }
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(&pixels, width, height, ExtendedColorType::L8)
        .unwrap();
    Bytes::from(out)
}

/// Drain a whole job: read until a terminal status, collecting the data
fn read_to_end(handle: &scanflow_devices::DeviceHandle) -> (Vec<u8>, Status) {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match handle.read(&mut buf) {
            Ok(len) => out.extend_from_slice(&buf[..len]),
            Err(status) => return (out, status),
        }
    }
}

fn wait_for_state(dev: &Arc<Device>, want: DeviceState) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while dev.state() != want {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for state {}, still {}",
            want,
            dev.state()
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Poll a condition that depends on work still queued on the event loop
fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting until {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[test]
fn happy_single_page() {
    let script = new_script();
    script.lock().pages.push_back(page_png(100, 80));

    let backend = backend_with(&script, test_config());
    backend.start();

    let devices = backend.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name, DEVICE_NAME);
    assert_eq!(devices[0].vendor, "Example");
    assert_eq!(devices[0].model, "Scanner 9000");
    assert_eq!(devices[0].kind, "eSCL network scanner");

    let handle = backend.open(Some(DEVICE_NAME)).unwrap();
    handle.set_option(ScanOption::ColorMode(ColorMode::Grayscale)).unwrap();

    let params = handle.parameters();
    assert_eq!(params.pixels_per_line, 100);
    assert_eq!(params.lines, 80);
    assert_eq!(params.bytes_per_line, 100);

    handle.start().unwrap();
    let (data, status) = read_to_end(&handle);

    assert_eq!(status, Status::Eof);
    assert_eq!(data.len(), (params.lines * params.bytes_per_line) as usize);
    // First line carries the column ramp produced by the page
    assert_eq!(&data[..4], &[0, 1, 2, 3]);

    // Exactly one job was issued, ending without a cancel
    {
        let s = script.lock();
        assert_eq!(s.ops_submitted.iter().filter(|op| **op == "SCAN").count(), 1);
        assert!(!s.ops_submitted.contains(&"CANCEL"));
    }

    // The machine has finished; DONE collapses to IDLE as soon as a read
    // arrives in DONE with the queue drained, which depends on timing
    assert!(matches!(
        handle.device().state(),
        DeviceState::Done | DeviceState::Idle
    ));
    drop(handle);
    backend.stop();
}

#[test]
fn cleanup_chain_runs_after_last_page() {
    let script = new_script();
    {
        let mut s = script.lock();
        s.pages.push_back(page_png(100, 80));
        s.cleanup = true;
    }

    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(None).unwrap();
    handle.set_option(ScanOption::ColorMode(ColorMode::Grayscale)).unwrap();
    handle.start().unwrap();
    let (data, status) = read_to_end(&handle);

    assert_eq!(status, Status::Eof);
    assert!(!data.is_empty());
    assert!(script.lock().ops_submitted.contains(&"CLEANUP"));

    drop(handle);
    backend.stop();
}

#[test]
fn cancel_during_scan_in_flight() {
    let script = new_script();
    let gate = Arc::new(Notify::new());
    script.lock().hold_scan = Some(gate.clone());

    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(None).unwrap();
    handle.start().unwrap();

    let dev = handle.device().clone();
    assert!(dev.state().is_working());

    // Cancel while the SCAN reply is still held by the scanner: no job
    // resource exists yet, so the machine parks in CANCEL_WAIT
    handle.cancel();
    wait_for_state(&dev, DeviceState::CancelWait);

    // Release the reply; the machine now has a location to cancel against
    gate.notify_one();
    wait_for_state(&dev, DeviceState::Done);

    let (data, status) = read_to_end(&handle);
    assert_eq!(status, Status::Cancelled);
    assert!(data.is_empty());
    assert!(script.lock().ops_submitted.contains(&"CANCEL"));

    drop(handle);
    backend.stop();
}

#[test]
fn cancel_after_location_known() {
    let script = new_script();
    let gate = Arc::new(Notify::new());
    {
        let mut s = script.lock();
        s.pages.push_back(page_png(100, 80));
        s.hold_load = Some(gate.clone());
    }

    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(None).unwrap();
    handle.start().unwrap();

    let dev = handle.device().clone();

    // Wait until SCAN completed and the LOAD is in flight, then cancel:
    // the machine goes straight to CANCELLING
    let deadline = Instant::now() + Duration::from_secs(2);
    while !script.lock().ops_submitted.contains(&"LOAD") {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(2));
    }

    handle.cancel();
    wait_for_state(&dev, DeviceState::Done);

    let (data, status) = read_to_end(&handle);
    assert_eq!(status, Status::Cancelled);
    assert!(data.is_empty());
    // The cancelled job purged its queue, so the final read lands in
    // DONE with nothing buffered and the machine returns to IDLE
    assert_eq!(dev.state(), DeviceState::Idle);

    // Repeated cancel is idempotent
    handle.cancel();
    handle.cancel();
    assert_eq!(dev.state(), DeviceState::Idle);

    drop(handle);
    backend.stop();
}

#[test]
fn endpoint_failover() {
    let script = new_script();
    script.lock().caps_failures = 1;

    let backend = backend_with(&script, Config {
        http: scanflow_core::config::HttpConfig {
            retry_pause_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    });
    backend.start();

    // Two endpoints; the first fails its capability query with 500
    backend.table().event_found(
        DEVICE_NAME,
        false,
        vec![
            Endpoint {
                proto: ProtoId::Escl,
                uri: url::Url::parse("http://192.0.2.55:8080/eSCL").unwrap(),
            },
            Endpoint {
                proto: ProtoId::Escl,
                uri: url::Url::parse("http://192.0.2.55:9090/eSCL").unwrap(),
            },
        ],
    );

    // The found event lands asynchronously; wait for probing to settle
    // on the second endpoint
    wait_until("device becomes ready", || {
        backend
            .table()
            .find(DEVICE_NAME)
            .map_or(false, |dev| dev.flags().contains(scanflow_devices::DeviceFlags::READY))
    });

    let handle = backend.open(Some(DEVICE_NAME)).unwrap();
    let dev = handle.device().clone();
    assert!(dev.flags().contains(scanflow_devices::DeviceFlags::READY));
    assert!(!dev
        .flags()
        .contains(scanflow_devices::DeviceFlags::INIT_WAIT));
    assert_eq!(script.lock().caps_failures, 0);

    drop(handle);
    backend.stop();
}

#[test]
fn all_endpoints_failing_deletes_device() {
    let script = new_script();
    script.lock().caps_failures = 2;

    let backend = backend_with(&script, test_config());
    backend.start();

    backend.table().event_found(
        "Broken Scanner",
        false,
        vec![
            Endpoint {
                proto: ProtoId::Escl,
                uri: url::Url::parse("http://192.0.2.77:8080/eSCL").unwrap(),
            },
            Endpoint {
                proto: ProtoId::Escl,
                uri: url::Url::parse("http://192.0.2.77:9090/eSCL").unwrap(),
            },
        ],
    );

    // Both endpoints fail their capability query, which exhausts the
    // candidate list and deletes the device
    wait_until("broken device is deleted", || {
        script.lock().caps_failures == 0 && backend.table().find("Broken Scanner").is_none()
    });

    // The static device survives, the broken one is gone
    let devices = backend.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name, DEVICE_NAME);
    assert!(backend.open(Some("Broken Scanner")).is_err());

    backend.stop();
}

#[test]
fn transient_load_retries_then_advances() {
    let script = new_script();
    {
        let mut s = script.lock();
        s.load_busy = 3;
        s.pages.push_back(page_png(100, 80));
    }

    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(None).unwrap();
    handle.set_option(ScanOption::ColorMode(ColorMode::Grayscale)).unwrap();
    handle.start().unwrap();
    let (data, status) = read_to_end(&handle);

    assert_eq!(status, Status::Eof);
    assert_eq!(data.len(), 100 * 80);

    {
        let s = script.lock();
        // Exactly three timer-scheduled CHECK retries
        assert_eq!(
            s.ops_submitted.iter().filter(|op| **op == "CHECK").count(),
            3
        );
        // failed_attempt climbed once per retry and reset on progress:
        // the final LOAD (the 404 ending the job) observed zero again
        assert_eq!(s.attempts_seen.iter().max(), Some(&3));
        assert_eq!(s.attempts_seen.last(), Some(&0));
    }

    drop(handle);
    backend.stop();
}

#[test]
fn scan_busy_exhausts_retry_budget() {
    let script = new_script();
    // More 503s than the budget allows
    script.lock().scan_busy = 1000;

    let mut config = test_config();
    config.http.retry_attempts = 3;
    config.http.retry_pause_ms = 1;

    let backend = backend_with(&script, config);
    backend.start();

    let handle = backend.open(None).unwrap();
    handle.start().unwrap();
    let (data, status) = read_to_end(&handle);

    assert!(data.is_empty());
    assert_eq!(status, Status::DeviceBusy);

    drop(handle);
    backend.stop();
}

#[test]
fn clip_beyond_right_edge() {
    let script = new_script();
    {
        let mut s = script.lock();
        // A wide minimum window so a narrow request at the right edge
        // must overhang it
        s.caps
            .sources
            .get_mut(&Source::Platen)
            .unwrap()
            .min_wid_px = 50;
        s.pages.push_back(page_png(100, 80));
    }

    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(None).unwrap();
    handle.set_option(ScanOption::ColorMode(ColorMode::Grayscale)).unwrap();

    // Degenerate window at 60 px from the left: it is widened to the
    // 50 px minimum, which hangs 10 px past the right edge. The scan
    // window is pulled back to 50..100 and those 10 leading pixels are
    // clipped out of the returned image at read time.
    let px_to_mm = |px: f64| px * 25.4 / 300.0;
    handle.set_option(ScanOption::TlX(px_to_mm(60.0))).unwrap();
    handle.set_option(ScanOption::BrX(px_to_mm(60.0))).unwrap();

    let params = handle.parameters();
    assert_eq!(params.pixels_per_line, 50);
    assert_eq!(params.bytes_per_line, 50);
    assert_eq!(params.lines, 80);

    handle.start().unwrap();
    let (data, status) = read_to_end(&handle);
    assert_eq!(status, Status::Eof);
    assert_eq!(data.len(), (params.lines * params.bytes_per_line) as usize);

    // The mock serves the full 100 px page, so after dropping the 10
    // leading pixels each delivered line starts at column 10
    let line = &data[..50];
    assert_eq!(line[0], 10);
    assert_eq!(line[49], 59);

    drop(handle);
    backend.stop();
}

#[test]
fn multi_image_buffering_reuses_job() {
    let script = new_script();
    {
        let mut s = script.lock();
        s.pages.push_back(page_png(100, 80));
        s.pages.push_back(page_png(100, 80));
    }

    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(None).unwrap();
    handle.set_option(ScanOption::ColorMode(ColorMode::Grayscale)).unwrap();

    handle.start().unwrap();
    let (first, status) = read_to_end(&handle);
    assert_eq!(status, Status::Eof);
    assert_eq!(first.len(), 100 * 80);

    // Second start consumes the buffered second image without issuing a
    // fresh SCAN
    handle.start().unwrap();
    let (second, status) = read_to_end(&handle);
    assert_eq!(status, Status::Eof);
    assert_eq!(second.len(), 100 * 80);

    assert_eq!(
        script
            .lock()
            .ops_submitted
            .iter()
            .filter(|op| **op == "SCAN")
            .count(),
        1
    );

    assert!(matches!(
        handle.device().state(),
        DeviceState::Done | DeviceState::Idle
    ));
    drop(handle);
    backend.stop();
}

#[test]
fn non_blocking_read_returns_empty() {
    let script = new_script();
    let gate = Arc::new(Notify::new());
    {
        let mut s = script.lock();
        s.pages.push_back(page_png(100, 80));
        s.hold_load = Some(gate.clone());
    }

    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(None).unwrap();
    handle.set_option(ScanOption::ColorMode(ColorMode::Grayscale)).unwrap();
    handle.start().unwrap();

    handle.set_io_mode(true).unwrap();
    assert!(handle.select_fd().unwrap() >= 0);

    // Queue is empty and the job is working: an empty read, not a block
    let mut buf = [0u8; 64];
    assert_eq!(handle.read(&mut buf), Ok(0));

    // Let the page through and drain it
    gate.notify_one();
    handle.set_io_mode(false).unwrap();
    let (data, status) = read_to_end(&handle);
    assert_eq!(status, Status::Eof);
    assert_eq!(data.len(), 100 * 80);

    drop(handle);
    backend.stop();
}

// ---------------------------------------------------------------------
// Frontend API gating
// ---------------------------------------------------------------------

#[test]
fn open_close_open_preserves_defaults() {
    let script = new_script();
    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(Some(DEVICE_NAME)).unwrap();
    let defaults = handle.options();
    assert_eq!(defaults.source, Source::Platen);
    assert_eq!(defaults.colormode, ColorMode::Grayscale);
    assert_eq!(defaults.resolution, 300);
    drop(handle);

    let handle = backend.open(Some(DEVICE_NAME)).unwrap();
    assert_eq!(handle.options(), defaults);
    drop(handle);

    backend.stop();
}

#[test]
fn open_rejects_unknown_and_busy() {
    let script = new_script();
    let backend = backend_with(&script, test_config());
    backend.start();

    assert!(matches!(
        backend.open(Some("No Such Device")),
        Err(Status::Inval)
    ));

    let first = backend.open(Some(DEVICE_NAME)).unwrap();
    assert!(matches!(
        backend.open(Some(DEVICE_NAME)),
        Err(Status::DeviceBusy)
    ));

    drop(first);
    let again = backend.open(Some(DEVICE_NAME)).unwrap();
    drop(again);

    backend.stop();
}

#[test]
fn set_option_rejected_while_scanning() {
    let script = new_script();
    let gate = Arc::new(Notify::new());
    {
        let mut s = script.lock();
        s.pages.push_back(page_png(100, 80));
        s.hold_load = Some(gate.clone());
    }

    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(None).unwrap();
    handle.set_option(ScanOption::ColorMode(ColorMode::Grayscale)).unwrap();
    handle.start().unwrap();

    assert_eq!(
        handle.set_option(ScanOption::Resolution(300)),
        Err(Status::Inval)
    );
    assert_eq!(handle.start(), Err(Status::Inval));

    gate.notify_one();
    let (_, status) = read_to_end(&handle);
    assert_eq!(status, Status::Eof);

    // Not scanning anymore: io mode and select fd are rejected now
    assert_eq!(handle.set_io_mode(true), Err(Status::Inval));
    assert!(handle.select_fd().is_err());

    drop(handle);
    backend.stop();
}

#[test]
fn duplicate_found_events_are_ignored() {
    let script = new_script();
    let backend = backend_with(&script, test_config());
    backend.start();

    let endpoint = Endpoint {
        proto: ProtoId::Escl,
        uri: url::Url::parse(DEVICE_URI).unwrap(),
    };
    backend
        .table()
        .event_found(DEVICE_NAME, false, vec![endpoint.clone()]);
    backend
        .table()
        .event_found(DEVICE_NAME, false, vec![endpoint]);

    wait_until("device is listed", || backend.table().size() >= 1);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(backend.table().size(), 1);
    assert_eq!(backend.devices().len(), 1);
    backend.stop();
}

#[test]
fn removed_event_halts_device_but_open_handle_survives() {
    let script = new_script();
    script.lock().pages.push_back(page_png(100, 80));

    let backend = backend_with(&script, test_config());
    backend.start();

    let handle = backend.open(Some(DEVICE_NAME)).unwrap();
    handle.set_option(ScanOption::ColorMode(ColorMode::Grayscale)).unwrap();

    backend.table().event_removed(DEVICE_NAME);

    // Give the removal time to land on the event loop
    let deadline = Instant::now() + Duration::from_secs(2);
    while backend.table().size() != 0 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(2));
    }

    // The handle still works against the detached device record
    assert_eq!(handle.options().source, Source::Platen);
    assert!(handle
        .device()
        .flags()
        .contains(scanflow_devices::DeviceFlags::HALTED));

    drop(handle);
    backend.stop();
}

#[test]
fn init_scan_barrier_delays_listing() {
    let script = new_script();
    let mut config = Config::default();
    config.listing.table_ready_timeout_ms = 200;
    config.http.retry_pause_ms = 10;

    let backend = backend_with(&script, config);
    backend.start();
    backend.table().event_init_scan_started();
    std::thread::sleep(Duration::from_millis(50));

    // Listing waits for the barrier and gives up after the timeout
    let started = Instant::now();
    assert!(backend.devices().is_empty());
    assert!(started.elapsed() >= Duration::from_millis(100));

    backend.table().event_init_scan_finished();
    std::thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    assert!(backend.devices().is_empty());
    assert!(started.elapsed() < Duration::from_millis(150));

    backend.stop();
}
