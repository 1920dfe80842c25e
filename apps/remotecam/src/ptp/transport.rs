//! The transport seam: how the session talks to a camera.
//!
//! A transport probes USB for a camera, opens a PTP session on it, issues
//! commands and delivers the camera's notifications on a channel. All methods
//! block; the session calls them from `spawn_blocking` workers.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::camera::{CameraCommand, CameraHandle, CommandReply};
use super::errors::TransportError;
use super::types::{CapturedPicture, LiveViewFrame, PropertyId, PropertyValue};

/// Which camera to open. The default picks the first candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeHint {
    /// USB location of the camera the host was launched for.
    pub location_id: Option<u64>,
}

impl ProbeHint {
    pub fn for_location(location_id: u64) -> Self {
        Self {
            location_id: Some(location_id),
        }
    }
}

/// A camera whose PTP session was opened by a probe.
pub struct OpenedCamera {
    pub camera: CameraHandle,
    /// Notifications for this camera, in the order the device sent them.
    /// The sender side is dropped when the connection ends.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

pub enum ProbeOutcome {
    Opened(OpenedCamera),
    /// No candidate device is attached. Not an error.
    NoDevice,
}

/// Raw notification from an open camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PropertyChanged { id: PropertyId, value: PropertyValue },
    PropertyStateChanged { id: PropertyId, enabled: bool },
    PropertyDescChanged { id: PropertyId, values: Vec<PropertyValue> },
    LiveViewStarted,
    LiveViewStopped,
    LiveViewData(LiveViewFrame),
    CapturedPicture(CapturedPicture),
    BulbStarted,
    BulbExposureTime { seconds: u32 },
    BulbStopped,
    FocusStarted,
    FocusEnded { has_focused: bool },
    FocusPointsChanged,
    ObjectAdded { handle: u32, format: String },
    /// The device went away (unplugged, powered off).
    Detached,
    /// The connection broke or the device violated the protocol.
    Failed { message: String },
}

pub trait Transport: Send + Sync + 'static {
    /// Enumerates attached devices and opens a PTP session on the hinted (or first) one.
    fn probe_and_open(&self, hint: &ProbeHint) -> Result<ProbeOutcome, TransportError>;

    fn issue_command(&self, camera: &CameraHandle, command: &CameraCommand) -> Result<CommandReply, TransportError>;

    /// Closes the camera's session. Closing an already closed camera does nothing.
    fn close(&self, camera: &CameraHandle);
}
