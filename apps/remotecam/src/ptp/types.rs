//! Camera domain types shared by transports, the session state machine and observers.
//!
//! These types are serializable so hosts can forward them as JSON payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// USB vendor ID for Canon (EOS bodies expose remote storage browsing).
pub const CANON_VENDOR_ID: u16 = 0x04a9;
/// USB vendor ID for Nikon.
pub const NIKON_VENDOR_ID: u16 = 0x04b0;

/// Device property code, for example 0x5007 (F-number) or 0xd101 (EOS aperture).
pub type PropertyId = u32;
/// Device property value as reported by the camera.
pub type PropertyValue = i32;

/// Information about a USB camera detected during probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDeviceInfo {
    /// Format: "ptp-{location_id}".
    pub id: String,
    /// Stable for a given USB port.
    pub location_id: u64,
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl CameraDeviceInfo {
    /// Builds the device ID used in logs and events.
    pub fn device_id_for(location_id: u64) -> String {
        format!("ptp-{}", location_id)
    }

    /// Returns a display name for the camera.
    ///
    /// Prefers product name, falls back to "{manufacturer} camera", then "PTP camera (vendor:product)".
    pub fn display_name(&self) -> String {
        if let Some(product) = &self.product {
            return product.clone();
        }
        if let Some(manufacturer) = &self.manufacturer {
            return format!("{} camera", manufacturer);
        }
        format!("PTP camera ({:04x}:{:04x})", self.vendor_id, self.product_id)
    }
}

/// An extended operation a connected camera may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    LiveView,
    Capture,
    BulbExposure,
    FocusControl,
    RemoteStorageBrowse,
}

impl Capability {
    const ALL: [Capability; 5] = [
        Capability::LiveView,
        Capability::Capture,
        Capability::BulbExposure,
        Capability::FocusControl,
        Capability::RemoteStorageBrowse,
    ];

    fn bit(self) -> u8 {
        match self {
            Self::LiveView => 1,
            Self::Capture => 1 << 1,
            Self::BulbExposure => 1 << 2,
            Self::FocusControl => 1 << 3,
            Self::RemoteStorageBrowse => 1 << 4,
        }
    }
}

/// A set of capabilities, queried instead of checking the concrete camera kind.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// Camera family, selected from the USB vendor ID at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CameraVariant {
    /// Canon EOS: full vendor extension set including SD card browsing.
    Eos,
    Nikon,
    /// Any other PTP still-image device: core operations only.
    Generic,
}

impl CameraVariant {
    pub fn from_vendor_id(vendor_id: u16) -> Self {
        match vendor_id {
            CANON_VENDOR_ID => Self::Eos,
            NIKON_VENDOR_ID => Self::Nikon,
            _ => Self::Generic,
        }
    }

    pub fn capabilities(self) -> CapabilitySet {
        use Capability::*;
        match self {
            Self::Eos => [LiveView, Capture, BulbExposure, FocusControl, RemoteStorageBrowse]
                .into_iter()
                .collect(),
            Self::Nikon => [LiveView, Capture, FocusControl].into_iter().collect(),
            Self::Generic => CapabilitySet::empty().with(Capture),
        }
    }
}

/// Live view / capture / focus / bulb flags of a started camera.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubState {
    pub live_view: bool,
    pub capturing: bool,
    pub focusing: bool,
    pub exposing: bool,
}

/// Storage container on the camera, for example the SD card slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    /// PTP storage ID.
    pub id: u32,
    /// For example, "SD1".
    pub description: String,
    /// In bytes.
    pub max_capacity: u64,
    /// In bytes.
    pub free_space_bytes: u64,
    /// For example, "RemovableRam".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,
}

/// Object (file or folder) on camera storage.
///
/// `parent` is a flat reference only. No tree is built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEntry {
    pub handle: u32,
    pub parent: u32,
    pub storage_id: u32,
    pub name: String,
    /// Object format code name, for example "ExifJpeg" or "Association".
    pub format: String,
    pub is_folder: bool,
    /// In bytes.
    pub size: u64,
}

/// One live view preview frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveViewFrame {
    /// JPEG-encoded preview image.
    pub jpeg: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

/// A picture the camera reports after capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPicture {
    pub handle: u32,
    pub filename: String,
    pub thumbnail: Option<Arc<[u8]>>,
    pub image: Option<Arc<[u8]>>,
}
