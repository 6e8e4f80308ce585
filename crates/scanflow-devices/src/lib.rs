/*!
 * Scanflow Devices
 *
 * The device scanning core of the scanflow network scanner backend:
 * device registry, endpoint probing, the scan state machine,
 * cancellation, image buffering and line-by-line delivery through a
 * blocking frontend API.
 *
 * Protocol codecs are pluggable: implement [`ProtoHandler`] for each
 * protocol the backend should speak and register it in a
 * [`HandlerRegistry`] handed to the [`Backend`].
 */

#![warn(missing_docs)]

pub mod backend;
pub mod caps;
pub mod decoder;
pub mod device;
pub mod discovery;
pub mod geom;
pub mod http;
mod machine;
pub mod options;
pub mod protocol;
pub mod queue;
mod read;
pub mod registry;

pub use backend::Backend;
pub use caps::{ColorMode, DeviceCaps, FrameFormat, Source, SourceCaps};
pub use device::{Device, DeviceFlags, DeviceHandle, DeviceState, Endpoint};
pub use options::{ScanOption, ScanOptions, ScanParameters};
pub use protocol::{
    HandlerRegistry, ProtoCtx, ProtoHandler, ProtoOp, ProtoPayload, ProtoResult, ProtoScanParams,
};
pub use registry::{DeviceInfo, DeviceTable};

// Re-export the shared scalar types alongside the device API
pub use scanflow_core::types::{ProtoId, Status};

/// Scanflow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
