/*!
 * Backend facade.
 *
 * Owns the event loop and the device table, and wires configuration,
 * protocol handlers and the HTTP transport together. One backend drives
 * any number of devices; each device is independent.
 */
use std::sync::Arc;

use scanflow_core::config::Config;
use scanflow_core::eloop::EventLoop;
use scanflow_core::error::{Error, Result};
use scanflow_core::types::Status;

use crate::device::DeviceHandle;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::protocol::HandlerRegistry;
use crate::registry::{DeviceInfo, DeviceTable};

/// The scanner backend
pub struct Backend {
    eloop: Option<EventLoop>,
    table: Arc<DeviceTable>,
}

impl Backend {
    /// Create a backend with the default reqwest transport
    pub fn new(config: Config, handlers: HandlerRegistry) -> Result<Self> {
        let transport =
            Arc::new(ReqwestTransport::new().map_err(|err| Error::other(err.to_string()))?);
        Self::with_transport(config, handlers, transport)
    }

    /// Create a backend over a custom HTTP transport
    pub fn with_transport(
        config: Config,
        handlers: HandlerRegistry,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let eloop = EventLoop::new()?;
        let table = DeviceTable::new(eloop.handle(), handlers, transport, config);

        Ok(Self {
            eloop: Some(eloop),
            table,
        })
    }

    /// Start device management: ingest statically configured devices and
    /// begin probing them
    pub fn start(&self) {
        self.table.start_management();
    }

    /// Stop device management: purge the table, halting all pending I/O.
    ///
    /// Open handles keep their devices alive; close them before dropping
    /// the backend.
    pub fn stop(&self) {
        self.table.stop_management();
    }

    /// The device table, for discovery glue and direct inspection
    pub fn table(&self) -> &Arc<DeviceTable> {
        &self.table
    }

    /// List ready devices, waiting for table readiness first
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.table.list()
    }

    /// Open a device by name, or the first ready device when `name` is
    /// `None`
    pub fn open(&self, name: Option<&str>) -> std::result::Result<DeviceHandle, Status> {
        self.table.open(name)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.table.stop_management();
        if let Some(eloop) = self.eloop.take() {
            eloop.shutdown();
        }
    }
}
