//! Connected camera handle and the commands it accepts.

use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::enumerator::StorageBrowser;
use super::types::{
    Capability, CameraDeviceInfo, CameraVariant, CapabilitySet, PropertyId, PropertyValue, SubState,
};
use crate::ignore_poison::IgnorePoison;

/// Handle to a connected, identified camera.
///
/// Clones share the same connection. The handle becomes invalid once the
/// session stops; transports must not be called with an invalid handle.
#[derive(Clone)]
pub struct CameraHandle {
    inner: Arc<CameraInner>,
}

struct CameraInner {
    info: CameraDeviceInfo,
    variant: CameraVariant,
    capabilities: CapabilitySet,
    properties: Mutex<HashMap<PropertyId, PropertyValue>>,
    sub_state: Mutex<SubState>,
    storage: Option<Arc<dyn StorageBrowser>>,
    valid: AtomicBool,
}

impl CameraHandle {
    /// Creates a handle for a freshly opened camera.
    ///
    /// `storage` is kept only if the camera variant supports remote storage browsing.
    pub fn new(info: CameraDeviceInfo, storage: Option<Arc<dyn StorageBrowser>>) -> Self {
        let variant = CameraVariant::from_vendor_id(info.vendor_id);
        let capabilities = variant.capabilities();
        let storage = if capabilities.contains(Capability::RemoteStorageBrowse) {
            storage
        } else {
            if storage.is_some() {
                debug!("{}: {:?} camera, ignoring storage browser", info.id, variant);
            }
            None
        };

        Self {
            inner: Arc::new(CameraInner {
                info,
                variant,
                capabilities,
                properties: Mutex::new(HashMap::new()),
                sub_state: Mutex::new(SubState::default()),
                storage,
                valid: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    pub fn info(&self) -> &CameraDeviceInfo {
        &self.inner.info
    }

    pub fn display_name(&self) -> String {
        self.inner.info.display_name()
    }

    pub fn variant(&self) -> CameraVariant {
        self.inner.variant
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.inner.capabilities
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.inner.capabilities.contains(capability)
    }

    /// Storage browser for cameras with `RemoteStorageBrowse`, `None` otherwise.
    pub fn storage_browser(&self) -> Option<Arc<dyn StorageBrowser>> {
        self.inner.storage.clone()
    }

    /// Last value the camera reported for a property.
    pub fn property(&self, id: PropertyId) -> Option<PropertyValue> {
        self.inner.properties.lock_ignore_poison().get(&id).copied()
    }

    pub fn sub_state(&self) -> SubState {
        *self.inner.sub_state.lock_ignore_poison()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same opened connection.
    pub fn same_connection(&self, other: &CameraHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn record_property(&self, id: PropertyId, value: PropertyValue) {
        self.inner.properties.lock_ignore_poison().insert(id, value);
    }

    pub(crate) fn update_sub_state(&self, update: impl FnOnce(&mut SubState)) {
        let mut sub_state = self.inner.sub_state.lock_ignore_poison();
        update(&mut *sub_state);
    }

    /// Marks the connection closed and clears live view, capture, focus and bulb flags.
    pub(crate) fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
        *self.inner.sub_state.lock_ignore_poison() = SubState::default();
    }
}

impl fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraHandle")
            .field("id", &self.inner.info.id)
            .field("variant", &self.inner.variant)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A camera control operation.
///
/// Byte-level encoding is the transport's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraCommand {
    StartLiveView,
    StopLiveView,
    Capture,
    StartBulb,
    StopBulb,
    /// Autofocus at the current focus point.
    Focus,
    SetProperty { id: PropertyId, value: PropertyValue },
}

impl CameraCommand {
    /// Capability the camera must have for this command, if any.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            Self::StartLiveView | Self::StopLiveView => Some(Capability::LiveView),
            Self::Capture => Some(Capability::Capture),
            Self::StartBulb | Self::StopBulb => Some(Capability::BulbExposure),
            Self::Focus => Some(Capability::FocusControl),
            Self::SetProperty { .. } => None,
        }
    }
}

/// Transport reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Accepted,
    Value(PropertyValue),
}
