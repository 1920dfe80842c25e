//! In-memory transport with scriptable virtual cameras.
//!
//! Backs the `virtual-camera` build and the session tests. A virtual camera
//! answers commands the way a real body does: starting live view produces
//! `LiveViewStarted`, a capture produces `CapturedPicture` followed by
//! `ObjectAdded`, and so on. Tests can also push arbitrary events with `emit`.

use log::{debug, info};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::camera::{CameraCommand, CameraHandle, CommandReply};
use super::enumerator::{ALL_OBJECTS_HANDLE, ROOT_HANDLE, StorageBrowser};
use super::errors::TransportError;
use super::transport::{OpenedCamera, ProbeHint, ProbeOutcome, Transport, TransportEvent};
use super::types::{
    CANON_VENDOR_ID, CameraDeviceInfo, CapturedPicture, LiveViewFrame, NIKON_VENDOR_ID, ObjectEntry, StorageEntry,
};
use crate::ignore_poison::IgnorePoison;

/// Storage ID of the first SD card slot on EOS bodies.
pub const SD_CARD_STORAGE_ID: u32 = 0x0002_0001;
/// Handle of the picture folder on the virtual SD card.
pub const PICTURE_FOLDER_HANDLE: u32 = 0x9000_0000;

/// A camera that can be attached to the in-memory transport.
#[derive(Clone)]
pub struct VirtualCamera {
    pub info: CameraDeviceInfo,
    pub storage: Option<Arc<InMemoryStorage>>,
    /// Captured pictures carry a thumbnail.
    pub thumbnails: bool,
}

impl VirtualCamera {
    fn with_ids(location_id: u64, vendor_id: u16, product_id: u16, manufacturer: &str, product: &str) -> Self {
        Self {
            info: CameraDeviceInfo {
                id: CameraDeviceInfo::device_id_for(location_id),
                location_id,
                vendor_id,
                product_id,
                manufacturer: Some(manufacturer.to_string()),
                product: Some(product.to_string()),
                serial_number: Some(format!("VC{:08}", location_id)),
            },
            storage: None,
            thumbnails: true,
        }
    }

    /// A Canon EOS body with a populated SD card.
    pub fn eos(location_id: u64) -> Self {
        Self::with_ids(location_id, CANON_VENDOR_ID, 0x32d1, "Canon Inc.", "Canon EOS R6")
            .with_storage(InMemoryStorage::sd_card())
    }

    pub fn nikon(location_id: u64) -> Self {
        Self::with_ids(location_id, NIKON_VENDOR_ID, 0x0441, "Nikon Corp.", "Nikon Z 6")
    }

    /// A PTP still-image device from a vendor without extensions.
    pub fn generic(location_id: u64) -> Self {
        Self::with_ids(location_id, 0x054c, 0x0994, "Sony", "ILCE-7M3")
    }

    #[must_use]
    pub fn with_storage(mut self, storage: InMemoryStorage) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    #[must_use]
    pub fn without_thumbnails(mut self) -> Self {
        self.thumbnails = false;
        self
    }
}

struct OpenConnection {
    camera: CameraHandle,
    thumbnails: bool,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct TransportState {
    attached: Vec<VirtualCamera>,
    probe_delays: VecDeque<Duration>,
    probe_failures: VecDeque<TransportError>,
    command_failures: VecDeque<TransportError>,
    open: Vec<OpenConnection>,
    probes: usize,
    commands: Vec<(String, CameraCommand)>,
    closed: Vec<String>,
    next_handle: u32,
}

/// Transport whose devices live in memory.
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<TransportState>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugs in a camera. It's found by the next probe.
    pub fn attach(&self, camera: VirtualCamera) {
        info!("Virtual camera attached: {}", camera.info.id);
        self.state.lock_ignore_poison().attached.push(camera);
    }

    /// Unplugs the camera at `location_id`. An open connection to it reports `Detached`.
    pub fn detach(&self, location_id: u64) {
        let mut state = self.state.lock_ignore_poison();
        state.attached.retain(|c| c.info.location_id != location_id);
        state.open.retain(|conn| {
            if conn.camera.info().location_id != location_id {
                return true;
            }
            let _ = conn.events.send(TransportEvent::Detached);
            false
        });
        info!("Virtual camera detached: {}", CameraDeviceInfo::device_id_for(location_id));
    }

    /// The next probe sleeps for `delay` before looking for devices.
    pub fn delay_next_probe(&self, delay: Duration) {
        self.state.lock_ignore_poison().probe_delays.push_back(delay);
    }

    pub fn fail_next_probe(&self, error: TransportError) {
        self.state.lock_ignore_poison().probe_failures.push_back(error);
    }

    pub fn fail_next_command(&self, error: TransportError) {
        self.state.lock_ignore_poison().command_failures.push_back(error);
    }

    /// Sends a notification from the most recently opened camera.
    /// Returns false if no camera is open.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let state = self.state.lock_ignore_poison();
        state.open.last().is_some_and(|conn| conn.events.send(event).is_ok())
    }

    /// Sends a live view frame from the most recently opened camera.
    pub fn emit_frame(&self, width: u32, height: u32) -> bool {
        self.emit(TransportEvent::LiveViewData(LiveViewFrame {
            jpeg: Arc::from(fake_jpeg(width as usize / 8)),
            width,
            height,
        }))
    }

    pub fn probe_count(&self) -> usize {
        self.state.lock_ignore_poison().probes
    }

    pub fn open_count(&self) -> usize {
        self.state.lock_ignore_poison().open.len()
    }

    /// Commands received so far, as (device ID, command).
    pub fn commands(&self) -> Vec<(String, CameraCommand)> {
        self.state.lock_ignore_poison().commands.clone()
    }

    /// Device IDs of closed connections, in close order.
    pub fn closed(&self) -> Vec<String> {
        self.state.lock_ignore_poison().closed.clone()
    }

    fn pick(attached: &[VirtualCamera], hint: &ProbeHint) -> Option<VirtualCamera> {
        hint.location_id
            .and_then(|loc| attached.iter().find(|c| c.info.location_id == loc))
            .or_else(|| attached.first())
            .cloned()
    }
}

impl Transport for InMemoryTransport {
    fn probe_and_open(&self, hint: &ProbeHint) -> Result<ProbeOutcome, TransportError> {
        let delay = {
            let mut state = self.state.lock_ignore_poison();
            state.probes += 1;
            state.probe_delays.pop_front()
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock_ignore_poison();
        if let Some(error) = state.probe_failures.pop_front() {
            debug!("Virtual probe failing: {}", error);
            return Err(error);
        }
        let Some(device) = Self::pick(&state.attached, hint) else {
            debug!("Virtual probe: nothing attached");
            return Ok(ProbeOutcome::NoDevice);
        };

        let storage = device.storage.clone().map(|s| s as Arc<dyn StorageBrowser>);
        let camera = CameraHandle::new(device.info.clone(), storage);
        let (tx, rx) = mpsc::unbounded_channel();
        state.open.push(OpenConnection {
            camera: camera.clone(),
            thumbnails: device.thumbnails,
            events: tx,
        });
        debug!("Virtual probe opened {}", camera.id());
        Ok(ProbeOutcome::Opened(OpenedCamera { camera, events: rx }))
    }

    fn issue_command(&self, camera: &CameraHandle, command: &CameraCommand) -> Result<CommandReply, TransportError> {
        let mut state = self.state.lock_ignore_poison();
        state.commands.push((camera.id().to_string(), command.clone()));
        if let Some(error) = state.command_failures.pop_front() {
            return Err(error);
        }

        let next_handle = 0x0001_0000 + state.next_handle;
        let Some(conn) = state.open.iter().find(|c| c.camera.same_connection(camera)) else {
            return Err(TransportError::NotConnected {
                device_id: camera.id().to_string(),
            });
        };

        let mut reply = CommandReply::Accepted;
        let mut used_handle = false;
        let events = match command {
            CameraCommand::StartLiveView => vec![TransportEvent::LiveViewStarted],
            CameraCommand::StopLiveView => vec![TransportEvent::LiveViewStopped],
            CameraCommand::Capture => {
                used_handle = true;
                let filename = format!("IMG_{:04}.JPG", next_handle & 0xffff);
                vec![
                    TransportEvent::CapturedPicture(CapturedPicture {
                        handle: next_handle,
                        filename,
                        thumbnail: conn.thumbnails.then(|| Arc::from(fake_jpeg(16))),
                        image: Some(Arc::from(fake_jpeg(256))),
                    }),
                    TransportEvent::ObjectAdded {
                        handle: next_handle,
                        format: "ExifJpeg".to_string(),
                    },
                ]
            }
            CameraCommand::StartBulb => vec![TransportEvent::BulbStarted],
            CameraCommand::StopBulb => vec![TransportEvent::BulbStopped],
            CameraCommand::Focus => vec![
                TransportEvent::FocusStarted,
                TransportEvent::FocusEnded { has_focused: true },
            ],
            CameraCommand::SetProperty { id, value } => {
                reply = CommandReply::Value(*value);
                vec![TransportEvent::PropertyChanged { id: *id, value: *value }]
            }
        };

        for event in events {
            let _ = conn.events.send(event);
        }
        if used_handle {
            state.next_handle += 1;
        }
        Ok(reply)
    }

    fn close(&self, camera: &CameraHandle) {
        let mut state = self.state.lock_ignore_poison();
        let before = state.open.len();
        state.open.retain(|c| !c.camera.same_connection(camera));
        if state.open.len() < before {
            state.closed.push(camera.id().to_string());
        }
    }
}

/// SOI marker, filler, EOI marker.
fn fake_jpeg(filler: usize) -> Vec<u8> {
    let mut bytes = vec![0xff, 0xd8];
    bytes.resize(2 + filler, 0);
    bytes.extend_from_slice(&[0xff, 0xd9]);
    bytes
}

/// Storage containers and objects held in memory.
#[derive(Default)]
pub struct InMemoryStorage {
    storages: Vec<StorageEntry>,
    objects: Vec<ObjectEntry>,
    failing_storages: HashSet<u32>,
    failing_objects: HashSet<u32>,
}

impl InMemoryStorage {
    /// An SD card with one picture folder holding three pictures.
    pub fn sd_card() -> Self {
        let mut storage = Self::default().with_storage(StorageEntry {
            id: SD_CARD_STORAGE_ID,
            description: "SD1".to_string(),
            max_capacity: 64_021_856_256,
            free_space_bytes: 61_335_166_976,
            storage_type: Some("RemovableRam".to_string()),
        });
        storage = storage.with_object(ObjectEntry {
            handle: PICTURE_FOLDER_HANDLE,
            parent: ROOT_HANDLE,
            storage_id: SD_CARD_STORAGE_ID,
            name: "100CANON".to_string(),
            format: "Association".to_string(),
            is_folder: true,
            size: 0,
        });
        for (offset, name) in ["IMG_0001.JPG", "IMG_0002.CR3", "IMG_0003.JPG"].iter().enumerate() {
            storage = storage.with_object(ObjectEntry {
                handle: PICTURE_FOLDER_HANDLE + 1 + offset as u32,
                parent: PICTURE_FOLDER_HANDLE,
                storage_id: SD_CARD_STORAGE_ID,
                name: name.to_string(),
                format: if name.ends_with(".JPG") { "ExifJpeg" } else { "Undefined" }.to_string(),
                is_folder: false,
                size: 6_291_456,
            });
        }
        storage
    }

    #[must_use]
    pub fn with_storage(mut self, entry: StorageEntry) -> Self {
        self.storages.push(entry);
        self
    }

    #[must_use]
    pub fn with_object(mut self, entry: ObjectEntry) -> Self {
        self.objects.push(entry);
        self
    }

    /// Info lookups for this storage fail.
    #[must_use]
    pub fn failing_storage(mut self, storage_id: u32) -> Self {
        self.failing_storages.insert(storage_id);
        self
    }

    /// Info lookups for this object fail.
    #[must_use]
    pub fn failing_object(mut self, handle: u32) -> Self {
        self.failing_objects.insert(handle);
        self
    }

    fn invalid(what: &str, id: u32) -> TransportError {
        TransportError::Protocol {
            device_id: "virtual".to_string(),
            message: format!("Invalid{} {:#010x}", what, id),
        }
    }

    fn has_storage(&self, storage_id: u32) -> bool {
        self.storages.iter().any(|s| s.id == storage_id)
    }
}

impl StorageBrowser for InMemoryStorage {
    fn storage_ids(&self) -> Result<Vec<u32>, TransportError> {
        Ok(self.storages.iter().map(|s| s.id).collect())
    }

    fn storage_info(&self, storage_id: u32) -> Result<StorageEntry, TransportError> {
        if self.failing_storages.contains(&storage_id) {
            return Err(Self::invalid("StorageID", storage_id));
        }
        self.storages
            .iter()
            .find(|s| s.id == storage_id)
            .cloned()
            .ok_or_else(|| Self::invalid("StorageID", storage_id))
    }

    fn object_handles(&self, storage_id: u32, parent: u32) -> Result<Vec<u32>, TransportError> {
        if !self.has_storage(storage_id) {
            return Err(Self::invalid("StorageID", storage_id));
        }
        Ok(self
            .objects
            .iter()
            .filter(|o| o.storage_id == storage_id && (parent == ALL_OBJECTS_HANDLE || o.parent == parent))
            .map(|o| o.handle)
            .collect())
    }

    fn object_info(&self, storage_id: u32, handle: u32) -> Result<ObjectEntry, TransportError> {
        if self.failing_objects.contains(&handle) {
            return Err(Self::invalid("ObjectHandle", handle));
        }
        self.objects
            .iter()
            .find(|o| o.storage_id == storage_id && o.handle == handle)
            .cloned()
            .ok_or_else(|| Self::invalid("ObjectHandle", handle))
    }
}
