/*!
 * Protocol handler abstraction.
 *
 * A protocol handler knows how to phrase each scan operation as an HTTP
 * request and how to read the scanner's reply back into the next step of
 * the operation chain. The device state machine stays protocol-agnostic:
 * it submits whatever the handler builds and follows whatever the decode
 * returns.
 */
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

use scanflow_core::types::{ProtoId, Status};

use crate::caps::DeviceCaps;
use crate::caps::{ColorMode, Source};
use crate::http::{HttpReply, HttpRequest};

/// A protocol operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtoOp {
    /// No operation
    None,
    /// Start a scan job
    Scan,
    /// Load the next page of the job
    Load,
    /// Poll scanner status
    Check,
    /// Cancel the job
    Cancel,
    /// Clean up job leftovers on the scanner
    Cleanup,
    /// The chain is complete
    Finish,
}

impl fmt::Display for ProtoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtoOp::None => "NONE",
            ProtoOp::Scan => "SCAN",
            ProtoOp::Load => "LOAD",
            ProtoOp::Check => "CHECK",
            ProtoOp::Cancel => "CANCEL",
            ProtoOp::Cleanup => "CLEANUP",
            ProtoOp::Finish => "FINISH",
        };
        write!(f, "{}", name)
    }
}

/// Scan parameters as sent to the scanner: window in pixels at the
/// protocol's reference DPI, plus resolution, source and mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtoScanParams {
    /// Window X offset
    pub x_off: i32,
    /// Window Y offset
    pub y_off: i32,
    /// Window width
    pub wid: i32,
    /// Window height
    pub hei: i32,
    /// Horizontal resolution, DPI
    pub x_res: u32,
    /// Vertical resolution, DPI
    pub y_res: u32,
    /// Scan source
    pub source: Source,
    /// Color mode
    pub colormode: ColorMode,
}

impl Default for ProtoScanParams {
    fn default() -> Self {
        Self {
            x_off: 0,
            y_off: 0,
            wid: 0,
            hei: 0,
            x_res: 0,
            y_res: 0,
            source: Source::Platen,
            colormode: ColorMode::Color,
        }
    }
}

/// Payload extracted from an operation reply
#[derive(Debug, Clone, Default)]
pub enum ProtoPayload {
    /// Nothing of value
    #[default]
    None,
    /// The job resource URI returned by `SCAN`
    Location(String),
    /// An encoded page image returned by `LOAD`
    Image(Bytes),
}

/// Result of decoding an operation reply
#[derive(Debug, Clone)]
pub struct ProtoResult {
    /// Next operation in the chain
    pub next: ProtoOp,
    /// Delay before submitting `next`; zero means immediately
    pub delay: Duration,
    /// Job status carried by this reply
    pub status: Status,
    /// Extracted payload, if any
    pub payload: ProtoPayload,
    /// Diagnostic for the device log, if the reply was unhealthy
    pub err: Option<String>,
}

impl Default for ProtoResult {
    fn default() -> Self {
        Self {
            next: ProtoOp::Finish,
            delay: Duration::ZERO,
            status: Status::Good,
            payload: ProtoPayload::None,
            err: None,
        }
    }
}

/// Error building a request or decoding a capability document
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Request URI could not be constructed
    #[error("URI error: {0}")]
    Uri(#[from] url::ParseError),

    /// Reply could not be understood
    #[error("protocol error: {0}")]
    Malformed(String),
}

/// Everything a handler may look at while building or decoding an
/// operation.
///
/// The context is a read-only window into the device record, assembled
/// by the state machine for each call.
pub struct ProtoCtx<'a> {
    /// Base URI of the current endpoint
    pub base_uri: &'a Url,
    /// Job resource URI, once `SCAN` returned one
    pub location: Option<&'a str>,
    /// Wire scan parameters of the current job
    pub params: &'a ProtoScanParams,
    /// Device capabilities
    pub caps: &'a DeviceCaps,
    /// Consecutive failed attempts of the current operation
    pub failed_attempt: u32,
    /// Retry budget before a transient failure becomes terminal
    pub retry_attempts: u32,
    /// Pause between retries
    pub retry_pause: Duration,
    /// HTTP status observed right before a `CHECK` was scheduled
    pub checking_http_status: Option<u16>,
    /// The reply being decoded; absent while building a request
    pub reply: Option<&'a HttpReply>,
}

impl<'a> ProtoCtx<'a> {
    /// The reply under decode, or an error if called out of order
    pub fn reply(&self) -> Result<&'a HttpReply, ProtoError> {
        self.reply
            .ok_or_else(|| ProtoError::Malformed("no reply to decode".to_string()))
    }
}

/// A protocol handler: one `build`/`decode` pair per operation.
///
/// `CANCEL` and `CLEANUP` have no decode methods; the state machine
/// decodes them itself, unconditionally mapping to `FINISH`.
pub trait ProtoHandler: Send {
    /// Human-readable protocol name
    fn name(&self) -> &'static str;

    /// Protocol identifier this handler implements
    fn proto(&self) -> ProtoId;

    /// Build the capability query
    fn devcaps_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError>;

    /// Decode the capability reply
    fn devcaps_decode(&self, ctx: &ProtoCtx<'_>) -> Result<DeviceCaps, ProtoError>;

    /// Build the `SCAN` request
    fn scan_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError>;

    /// Decode the `SCAN` reply
    fn scan_decode(&self, ctx: &ProtoCtx<'_>) -> ProtoResult;

    /// Build the `LOAD` request
    fn load_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError>;

    /// Decode the `LOAD` reply
    fn load_decode(&self, ctx: &ProtoCtx<'_>) -> ProtoResult;

    /// Build the `CHECK` request
    fn status_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError>;

    /// Decode the `CHECK` reply
    fn status_decode(&self, ctx: &ProtoCtx<'_>) -> ProtoResult;

    /// Build the `CANCEL` request
    fn cancel_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError>;

    /// Build the `CLEANUP` request
    fn cleanup_query(&self, ctx: &ProtoCtx<'_>) -> Result<HttpRequest, ProtoError>;
}

/// Factory of protocol handlers, one per protocol identifier
type HandlerFactory = Box<dyn Fn() -> Box<dyn ProtoHandler> + Send + Sync>;

/// Registry of protocol handler factories.
///
/// The endpoint prober binds a fresh handler whenever it moves to an
/// endpoint speaking a different protocol.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<ProtoId, HandlerFactory>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("protocols", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler factory for a protocol
    pub fn register<F>(&mut self, proto: ProtoId, factory: F)
    where
        F: Fn() -> Box<dyn ProtoHandler> + Send + Sync + 'static,
    {
        self.factories.insert(proto, Box::new(factory));
    }

    /// Check whether a protocol is supported
    pub fn supports(&self, proto: ProtoId) -> bool {
        self.factories.contains_key(&proto)
    }

    /// Create a handler for a protocol
    pub fn create(&self, proto: ProtoId) -> Option<Box<dyn ProtoHandler>> {
        self.factories.get(&proto).map(|factory| factory())
    }
}
