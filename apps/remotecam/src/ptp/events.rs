//! Outward session events and the single listener that receives them.

use super::camera::CameraHandle;
use super::types::{CapturedPicture, LiveViewFrame, PropertyId, PropertyValue};

/// Notification emitted by the camera session, in emission order.
#[derive(Debug, Clone)]
pub enum CameraEvent {
    /// The handle is valid from now on.
    CameraStarted(CameraHandle),
    CameraStopped(CameraHandle),
    /// No camera is attached. Expected and recoverable.
    NoCameraFound,
    /// The session stopped because of a transport or protocol failure.
    Error(String),
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
}

impl CameraEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CameraStarted(_) => "camera-started",
            Self::CameraStopped(_) => "camera-stopped",
            Self::NoCameraFound => "no-camera-found",
            Self::Error(_) => "error",
            Self::PropertyChanged { .. } => "property-changed",
            Self::PropertyStateChanged { .. } => "property-state-changed",
            Self::PropertyDescChanged { .. } => "property-desc-changed",
            Self::LiveViewStarted => "live-view-started",
            Self::LiveViewStopped => "live-view-stopped",
            Self::LiveViewData(_) => "live-view-data",
            Self::CapturedPicture(_) => "captured-picture",
            Self::BulbStarted => "bulb-started",
            Self::BulbExposureTime { .. } => "bulb-exposure-time",
            Self::BulbStopped => "bulb-stopped",
            Self::FocusStarted => "focus-started",
            Self::FocusEnded { .. } => "focus-ended",
            Self::FocusPointsChanged => "focus-points-changed",
            Self::ObjectAdded { .. } => "object-added",
        }
    }
}

/// Receives session events. At most one listener is installed at a time, and
/// it's never called concurrently.
pub trait CameraListener: Send + Sync {
    fn on_event(&self, event: CameraEvent);
}
