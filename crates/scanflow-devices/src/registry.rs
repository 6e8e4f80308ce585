/*!
 * Device registry.
 *
 * A process-wide table of known devices, unique by name, mutated only on
 * the event-loop thread. Frontend callers synchronize against table
 * readiness through a condition variable: the table is ready when no
 * device is still probing and discovery has finished its initial sweep.
 *
 * The endpoint prober also lives here: it walks a device's endpoint
 * list, binds the matching protocol handler and fetches capabilities,
 * deleting the device when every candidate failed.
 */
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use scanflow_core::config::Config;
use scanflow_core::eloop::{EloopEvent, EloopHandle};
use scanflow_core::types::{ProtoId, Status};

use crate::device::{Device, DeviceFlags, DeviceHandle, Endpoint};
use crate::http::{HttpError, HttpReply, HttpTransport};
use crate::protocol::HandlerRegistry;

/// A device listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Vendor string from the capabilities
    pub vendor: String,
    /// Model string; the network name when `model_is_netname` is set
    pub model: String,
    /// Device kind, e.g. "eSCL network scanner"
    pub kind: String,
}

struct TableInner {
    devices: Vec<Arc<Device>>,
    /// Whether discovery has finished its initial sweep
    init_scan_done: bool,
}

/// The device table
pub struct DeviceTable {
    inner: Mutex<TableInner>,
    cond: Condvar,
    pub(crate) eloop: EloopHandle,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) config: Config,
}

impl DeviceTable {
    /// Create an empty table.
    ///
    /// `init_scan_done` starts true: with no discovery attached there is
    /// nothing to wait for. Discovery glue flips it through
    /// [`DeviceTable::event_init_scan_started`] when a sweep begins.
    pub fn new(
        eloop: EloopHandle,
        handlers: HandlerRegistry,
        transport: Arc<dyn HttpTransport>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TableInner {
                devices: Vec::new(),
                init_scan_done: true,
            }),
            cond: Condvar::new(),
            eloop,
            handlers,
            transport,
            config,
        })
    }

    /// Add a device to the table and start probing its endpoints. No-op
    /// if the name is already known. Runs on the event-loop thread.
    pub(crate) fn add(
        self: &Arc<Self>,
        name: &str,
        mut endpoints: Vec<Endpoint>,
        init_scan: bool,
        statically: bool,
    ) {
        debug!(
            "{} adding: \"{}\" ({} endpoint(s), init_scan={})",
            if statically {
                "statically"
            } else {
                "dynamically"
            },
            name,
            endpoints.len(),
            init_scan
        );

        if self.find(name).is_some() {
            debug!("device \"{}\" already exists", name);
            return;
        }

        if endpoints.is_empty() {
            warn!("device \"{}\" has no endpoints", name);
            return;
        }

        for endpoint in &mut endpoints {
            if endpoint.proto == ProtoId::Escl {
                fix_end_slash(&mut endpoint.uri);
            }
        }

        let dev = match Device::new(
            name,
            endpoints,
            Arc::downgrade(self),
            self.eloop.clone(),
            self.transport.clone(),
            self.config.http.retry_attempts,
            self.config.retry_pause(),
        ) {
            Ok(dev) => dev,
            Err(err) => {
                warn!("device \"{}\": {}", name, err);
                return;
            }
        };

        self.inner.lock().devices.push(dev.clone());
        dev.probe_endpoint(0);
    }

    /// Remove a device from the table, halting all pending I/O.
    ///
    /// References to the device may still exist, so memory is freed
    /// later, when the last handle drops. Runs on the event-loop thread.
    pub(crate) fn del(&self, dev: &Arc<Device>) {
        debug!("\"{}\" removed from device table", dev.name());
        debug_assert!(dev.flags().contains(DeviceFlags::LISTED));

        dev.flags_clear(DeviceFlags::LISTED);
        self.inner.lock().devices.retain(|d| !Arc::ptr_eq(d, dev));

        dev.http_cancel();

        dev.flags_set(DeviceFlags::HALTED);
        dev.flags_clear(DeviceFlags::READY | DeviceFlags::INIT_WAIT);
    }

    /// Find a device by name
    pub fn find(&self, name: &str) -> Option<Arc<Device>> {
        self.inner
            .lock()
            .devices
            .iter()
            .find(|dev| dev.name() == name)
            .cloned()
    }

    /// Snapshot of the devices matching any of the given flags
    pub fn collect(&self, flags: DeviceFlags) -> Vec<Arc<Device>> {
        self.inner
            .lock()
            .devices
            .iter()
            .filter(|dev| dev.flags().intersects(flags))
            .cloned()
            .collect()
    }

    /// Number of devices in the table
    pub fn size(&self) -> usize {
        self.inner.lock().devices.len()
    }

    /// Remove every device. Runs on the event-loop thread.
    pub(crate) fn purge(&self) {
        for dev in self.collect(DeviceFlags::all()) {
            self.del(&dev);
        }
    }

    /// Track whether discovery's initial sweep is still pending
    pub(crate) fn set_init_scan_done(&self, done: bool) {
        self.inner.lock().init_scan_done = done;
    }

    fn ready_locked(&self, inner: &TableInner) -> bool {
        inner.init_scan_done
            && !inner
                .devices
                .iter()
                .any(|dev| dev.flags().contains(DeviceFlags::INIT_WAIT))
    }

    /// Wait until the table is ready, bounded by the configured timeout
    pub(crate) fn sync(&self) {
        let deadline = Instant::now() + self.config.table_ready_timeout();
        let mut inner = self.inner.lock();

        while !self.ready_locked(&inner) {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
    }

    /// Wake everyone waiting for table readiness.
    ///
    /// Must not be called with the table mutex held.
    pub(crate) fn broadcast(&self) {
        drop(self.inner.lock());
        self.cond.notify_all();
    }

    /// List ready devices, sorted by name
    pub fn list(&self) -> Vec<DeviceInfo> {
        self.sync();

        let mut list: Vec<DeviceInfo> = self
            .collect(DeviceFlags::READY)
            .iter()
            .map(|dev| {
                let inner = dev.inner.lock();
                let proto_name = inner.proto.as_ref().map_or("unknown", |p| p.name());
                DeviceInfo {
                    name: dev.name().to_string(),
                    vendor: inner.opt.caps.vendor.clone(),
                    model: if self.config.listing.model_is_netname {
                        dev.name().to_string()
                    } else {
                        inner.opt.caps.model.clone()
                    },
                    kind: format!("{} network scanner", proto_name),
                }
            })
            .collect();

        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Open a device by name, or the first ready device when `name` is
    /// empty. Waits for table readiness first.
    pub fn open(self: &Arc<Self>, name: Option<&str>) -> Result<DeviceHandle, Status> {
        self.sync();

        let dev = match name {
            Some(name) if !name.is_empty() => self.find(name),
            _ => self.collect(DeviceFlags::READY).into_iter().next(),
        };

        let Some(dev) = dev else {
            return Err(Status::Inval);
        };
        if !dev.flags().contains(DeviceFlags::READY) {
            return Err(Status::Inval);
        }

        // Claim the device; concurrent opens race on this transition
        if dev.try_claim().is_err() {
            return Err(Status::DeviceBusy);
        }

        let weak = Arc::downgrade(&dev);
        let event = EloopEvent::new(&self.eloop, move || {
            if let Some(dev) = weak.upgrade() {
                dev.stm_cancel_event_callback();
            }
        });
        *dev.cancel_event.lock() = Some(event);

        Ok(DeviceHandle::new(dev))
    }
}

/// eSCL base URIs must end with a slash for path joins to resolve
/// against them
fn fix_end_slash(uri: &mut url::Url) {
    let path = uri.path();
    if !path.ends_with('/') {
        let fixed = format!("{}/", path);
        uri.set_path(&fixed);
    }
}

impl Device {
    /// Probe the endpoint at `index`: bind the matching protocol handler
    /// if needed and fetch capabilities
    pub(crate) fn probe_endpoint(self: &Arc<Self>, index: usize) {
        let built = {
            let mut inner = self.inner.lock();

            let Some(endpoint) = inner.endpoints.get(index).cloned() else {
                drop(inner);
                self.probe_advance(index);
                return;
            };

            let rebind = match inner.endpoint_current {
                None => true,
                Some(current) => inner.endpoints[current].proto != endpoint.proto,
            };

            if rebind || inner.proto.is_none() {
                let handler = self
                    .table
                    .upgrade()
                    .and_then(|table| table.handlers.create(endpoint.proto));

                match handler {
                    Some(handler) => {
                        debug!(parent: &self.span, "using protocol \"{}\"", handler.name());
                        inner.proto = Some(handler);
                    }
                    None => {
                        debug!(
                            parent: &self.span,
                            "no handler for protocol \"{}\"", endpoint.proto
                        );
                        inner.proto = None;
                    }
                }
            }

            inner.endpoint_current = Some(index);
            inner.base_uri = Some(endpoint.uri);

            self.with_proto(&inner, None, |proto, ctx| proto.devcaps_query(ctx))
        };

        match built {
            Some(Ok(request)) => {
                let dev = self.clone();
                self.http
                    .submit(request, move |result| dev.capabilities_callback(result));
            }
            other => {
                if let Some(Err(err)) = other {
                    debug!(parent: &self.span, "capabilities query: {}", err);
                }
                self.probe_advance(index);
            }
        }
    }

    /// Move the prober to the next endpoint, or delete the device when
    /// the candidate list is exhausted
    fn probe_advance(self: &Arc<Self>, index: usize) {
        let next_exists = index + 1 < self.inner.lock().endpoints.len();

        if next_exists {
            self.probe_endpoint(index + 1);
        } else if let Some(table) = self.table.upgrade() {
            table.del(self);
            table.broadcast();
        }
    }

    /// Capability-fetch completion callback
    pub(crate) fn capabilities_callback(self: &Arc<Self>, result: Result<HttpReply, HttpError>) {
        let outcome = match result {
            Err(err) => Err(format!("scanner capabilities query: {}", err)),
            Ok(reply) => {
                let inner = self.inner.lock();
                match self.with_proto(&inner, Some(&reply), |proto, ctx| proto.devcaps_decode(ctx))
                {
                    Some(Ok(caps)) => Ok(caps),
                    Some(Err(err)) => Err(format!("scanner capabilities: {}", err)),
                    None => Err("scanner capabilities: no protocol handler".to_string()),
                }
            }
        };

        match outcome {
            Ok(caps) => {
                caps.dump();
                self.inner.lock().opt.set_caps(caps);

                self.flags_set(DeviceFlags::READY);
                self.flags_clear(DeviceFlags::INIT_WAIT);

                let weak = Arc::downgrade(self);
                self.http.set_onerror(move |err| {
                    if let Some(dev) = weak.upgrade() {
                        dev.http_onerror(err);
                    }
                });

                if let Some(table) = self.table.upgrade() {
                    table.broadcast();
                }
            }
            Err(err) => {
                debug!(parent: &self.span, "{}", err);
                let current = self.inner.lock().endpoint_current.unwrap_or(0);
                self.probe_advance(current);

                if let Some(table) = self.table.upgrade() {
                    table.broadcast();
                }
            }
        }
    }
}
