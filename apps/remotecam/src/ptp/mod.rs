//! PTP camera support: transport seam, camera session state machine and storage enumeration.
//!
//! # Architecture
//!
//! - `types`: Camera domain types (device info, capabilities, storage and object entries)
//! - `camera`: Connected camera handle and commands
//! - `transport`: The blocking transport trait the session drives
//! - `session_machine`: Probing, started and stopped states, event delivery
//! - `enumerator`: Flat storage and object listing
//! - `usb`: Transport over USB using mtp-rs
//! - `hotplug`: nusb watcher that reports newly attached cameras
//! - `in_memory`: Virtual cameras for tests and the `virtual-camera` build
//!
//! # Platform Support
//!
//! USB access is available on macOS and Linux. On macOS, the system daemon
//! `ptpcamerad` may claim cameras first; opening then fails with `ExclusiveAccess`.

pub mod camera;
pub mod enumerator;
pub mod errors;
pub mod events;
#[cfg(any(test, feature = "virtual-camera"))]
pub mod in_memory;
#[cfg(any(target_os = "macos", target_os = "linux"))]
pub mod hotplug;
pub mod session_machine;
pub mod transport;
pub mod types;
#[cfg(any(target_os = "macos", target_os = "linux"))]
pub mod usb;

pub use camera::{CameraCommand, CameraHandle, CommandReply};
pub use enumerator::{ALL_OBJECTS_HANDLE, ROOT_HANDLE, StorageBrowser, list_objects, list_storages};
pub use errors::{EnumerationError, SessionError, TransportError};
pub use events::{CameraEvent, CameraListener};
pub use session_machine::{CameraSession, SessionState};
pub use transport::{ProbeHint, ProbeOutcome, Transport, TransportEvent};
pub use types::{
    CameraDeviceInfo, CameraVariant, Capability, CapabilitySet, CapturedPicture, LiveViewFrame, ObjectEntry,
    StorageEntry, SubState,
};

#[cfg(test)]
mod session_machine_test;
