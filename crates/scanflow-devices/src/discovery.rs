/*!
 * Discovery glue and registry lifecycle.
 *
 * Inbound discovery events (device found, device removed, initial sweep
 * finished) may arrive on any thread; they are marshalled onto the event
 * loop before touching the table. Engine start ingests the statically
 * configured devices, engine stop purges the table; a purge halts all
 * pending I/O but leaves memory to outstanding handles.
 */
use std::sync::Arc;

use tracing::warn;
use url::Url;

use crate::device::Endpoint;
use crate::registry::DeviceTable;

impl DeviceTable {
    /// A device appeared. Endpoints are consumed in list order by the
    /// prober; eSCL URIs are trailing-slash-normalized on ingestion.
    pub fn event_found(self: &Arc<Self>, name: &str, init_scan: bool, endpoints: Vec<Endpoint>) {
        let table = self.clone();
        let name = name.to_string();
        self.eloop
            .call(move || table.add(&name, endpoints, init_scan, false));
    }

    /// A device disappeared
    pub fn event_removed(self: &Arc<Self>, name: &str) {
        let table = self.clone();
        let name = name.to_string();
        self.eloop.call(move || {
            if let Some(dev) = table.find(&name) {
                table.del(&dev);
            }
        });
    }

    /// Discovery started its initial sweep; table readiness now waits
    /// for [`DeviceTable::event_init_scan_finished`]
    pub fn event_init_scan_started(self: &Arc<Self>) {
        let table = self.clone();
        self.eloop.call(move || {
            table.set_init_scan_done(false);
        });
    }

    /// Discovery finished its initial sweep
    pub fn event_init_scan_finished(self: &Arc<Self>) {
        let table = self.clone();
        self.eloop.call(move || {
            table.set_init_scan_done(true);
            table.broadcast();
        });
    }

    /// Ingest statically configured devices. Blocks until the table has
    /// picked them up.
    pub(crate) fn start_management(self: &Arc<Self>) {
        let table = self.clone();
        self.eloop.call_wait(move || {
            for dev_conf in table.config.devices.clone() {
                match Url::parse(&dev_conf.uri) {
                    Ok(uri) => table.add(
                        &dev_conf.name,
                        vec![Endpoint {
                            proto: dev_conf.proto,
                            uri,
                        }],
                        true,
                        true,
                    ),
                    Err(err) => {
                        warn!("static device \"{}\": invalid URI: {}", dev_conf.name, err);
                    }
                }
            }
        });
    }

    /// Purge the table. Blocks until every device has been removed and
    /// its pending I/O halted.
    pub(crate) fn stop_management(self: &Arc<Self>) {
        let table = self.clone();
        self.eloop.call_wait(move || table.purge());
    }
}
