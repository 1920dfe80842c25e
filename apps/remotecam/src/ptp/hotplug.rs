//! USB hotplug watcher for cameras.
//!
//! Watches USB connect/disconnect events with nusb and reports newly attached
//! PTP devices as probe hints, so the session can re-probe for the camera the
//! user just plugged in.

use log::{debug, error, info, warn};
use mtp_rs::MtpDevice;
use nusb::hotplug::HotplugEvent;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::transport::ProbeHint;

/// Time a freshly attached device gets to finish USB enumeration.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Locations of currently attached PTP/MTP devices.
fn current_locations() -> BTreeSet<u64> {
    match MtpDevice::list_devices() {
        Ok(devices) => devices.into_iter().map(|d| d.location_id).collect(),
        Err(e) => {
            warn!("Failed to enumerate PTP devices: {}", e);
            BTreeSet::new()
        }
    }
}

/// Locations in `current` that weren't in `known`, in ascending order.
fn newly_attached(known: &BTreeSet<u64>, current: &BTreeSet<u64>) -> Vec<u64> {
    current.difference(known).copied().collect()
}

/// Spawns the watcher. `on_attach` runs on the runtime for every newly attached device.
pub fn spawn_hotplug_watcher<F>(runtime: &Handle, on_attach: F) -> JoinHandle<()>
where
    F: Fn(ProbeHint) + Send + Sync + 'static,
{
    runtime.spawn(async move {
        let mut stream = match nusb::watch_devices() {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start USB hotplug watcher: {}", e);
                return;
            }
        };

        let mut known = current_locations();
        debug!("USB hotplug watcher started ({} device(s) attached)", known.len());

        use futures_util::StreamExt;
        while let Some(event) = stream.next().await {
            match event {
                HotplugEvent::Connected(device_info) => {
                    debug!(
                        "USB device connected: {:04x}:{:04x}",
                        device_info.vendor_id(),
                        device_info.product_id()
                    );
                    tokio::time::sleep(SETTLE_DELAY).await;
                    let current = current_locations();
                    for location_id in newly_attached(&known, &current) {
                        info!("Camera attached at location {}", location_id);
                        on_attach(ProbeHint::for_location(location_id));
                    }
                    known = current;
                }
                HotplugEvent::Disconnected(device_id) => {
                    debug!("USB device disconnected: {:?}", device_id);
                    known = current_locations();
                }
            }
        }

        warn!("USB hotplug watcher stream ended unexpectedly");
    })
}
