//! Observer interface the host implements to receive session callbacks.

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::ptp::{CameraHandle, CapturedPicture, LiveViewFrame};
use crate::ptp::types::{PropertyId, PropertyValue};

/// Receives one callback per camera event, in emission order, never concurrently.
///
/// Every method defaults to doing nothing, so hosts implement only what they show.
pub trait SessionObserver: Send + Sync {
    fn camera_started(&self, _camera: &CameraHandle) {}

    fn camera_stopped(&self, _camera: &CameraHandle) {}

    /// No camera is attached. Hosts usually show a "connect a camera" notice.
    fn no_camera_found(&self) {}

    /// The session stopped because of `message`.
    fn error(&self, _message: &str) {}

    fn property_changed(&self, _id: PropertyId, _value: PropertyValue) {}

    /// A property became settable or read-only.
    fn property_state_changed(&self, _id: PropertyId, _enabled: bool) {}

    /// The set of values a property accepts changed.
    fn property_desc_changed(&self, _id: PropertyId, _values: &[PropertyValue]) {}

    fn live_view_started(&self) {}

    fn live_view_stopped(&self) {}

    /// Only called while the host is in the foreground.
    fn live_view_data(&self, _frame: &LiveViewFrame) {}

    /// A picture with a thumbnail was captured.
    fn captured_picture(&self, _picture: &CapturedPicture) {}

    /// A picture was captured but the camera sent no thumbnail. The image itself isn't passed on.
    fn no_thumbnail_available(&self, _handle: u32, _filename: &str) {}

    fn bulb_started(&self) {}

    fn bulb_exposure_time(&self, _seconds: u32) {}

    fn bulb_stopped(&self) {}

    fn focus_started(&self) {}

    fn focus_ended(&self, _has_focused: bool) {}

    fn focus_points_changed(&self) {}

    fn object_added(&self, _handle: u32, _format: &str) {}
}

/// Observer that writes every callback to the log. Used by the CLI host.
#[derive(Default)]
pub struct LoggingObserver {
    started: Option<mpsc::UnboundedSender<CameraHandle>>,
}

impl LoggingObserver {
    /// Also sends every started camera to `started`.
    pub fn forwarding_started(started: mpsc::UnboundedSender<CameraHandle>) -> Self {
        Self { started: Some(started) }
    }
}

impl SessionObserver for LoggingObserver {
    fn camera_started(&self, camera: &CameraHandle) {
        info!(
            "Camera ready: {} ({:?}, capabilities {:?})",
            camera.display_name(),
            camera.variant(),
            camera.capabilities()
        );
        if let Some(started) = &self.started {
            let _ = started.send(camera.clone());
        }
    }

    fn camera_stopped(&self, camera: &CameraHandle) {
        info!("Camera stopped: {}", camera.display_name());
    }

    fn no_camera_found(&self) {
        info!("No camera found. Connect a camera over USB, then reload.");
    }

    fn error(&self, message: &str) {
        warn!("Camera session stopped: {}", message);
    }

    fn property_changed(&self, id: PropertyId, value: PropertyValue) {
        debug!("Property {:#06x} = {}", id, value);
    }

    fn property_state_changed(&self, id: PropertyId, enabled: bool) {
        debug!("Property {:#06x} enabled={}", id, enabled);
    }

    fn property_desc_changed(&self, id: PropertyId, values: &[PropertyValue]) {
        debug!("Property {:#06x} accepts {} value(s)", id, values.len());
    }

    fn live_view_started(&self) {
        info!("Live view started");
    }

    fn live_view_stopped(&self) {
        info!("Live view stopped");
    }

    fn captured_picture(&self, picture: &CapturedPicture) {
        info!("Captured {} (handle {:#010x})", picture.filename, picture.handle);
    }

    fn no_thumbnail_available(&self, _handle: u32, filename: &str) {
        info!("No thumbnail available for {}", filename);
    }

    fn bulb_exposure_time(&self, seconds: u32) {
        debug!("Bulb exposure: {}s", seconds);
    }

    fn focus_ended(&self, has_focused: bool) {
        debug!("Focus ended, in focus: {}", has_focused);
    }

    fn object_added(&self, handle: u32, format: &str) {
        debug!("Object added: {:#010x} ({})", handle, format);
    }
}
