//! USB transport built on `mtp-rs`.
//!
//! Opens a PTP session on an attached camera, exposes its storage for browsing
//! and polls the device for events. The `Transport` methods are blocking: they
//! run the async `mtp-rs` calls with `block_on` on the stored runtime handle,
//! which is safe because the session only calls them from `spawn_blocking` workers.
//!
//! All device access goes through one async mutex per camera. The event loop
//! holds it for at most one poll interval at a time, so storage listing and
//! commands get their turn even while the camera sends nothing.

use log::{debug, info, warn};
use mtp_rs::mtp::DeviceEvent;
use mtp_rs::ptp::{
    DevicePropertyCode, EventCode, ObjectFormatCode, PropertyDataType, PropertyValue as PtpValue, ResponseCode,
};
use mtp_rs::{MtpDevice, MtpDeviceBuilder, ObjectHandle, StorageId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};

use super::camera::{CameraCommand, CameraHandle, CommandReply};
use super::enumerator::{ALL_OBJECTS_HANDLE, ROOT_HANDLE, StorageBrowser};
use super::errors::TransportError;
use super::transport::{OpenedCamera, ProbeHint, ProbeOutcome, Transport, TransportEvent};
use super::types::{
    CameraDeviceInfo, CameraVariant, Capability, CapturedPicture, ObjectEntry, PropertyId, PropertyValue, StorageEntry,
};
use crate::config::SessionConfig;
use crate::ignore_poison::IgnorePoison;

/// How long to wait for the device lock before skipping an event poll.
const DEVICE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Back-off after an unexpected event poll error.
const EVENT_ERROR_BACKOFF: Duration = Duration::from_millis(500);

type SharedDevice = Arc<AsyncMutex<MtpDevice>>;

struct UsbConnection {
    camera: CameraHandle,
    device: SharedDevice,
    /// Set while a capture is in flight; the next added object is the picture.
    capture_pending: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
}

/// Camera transport over USB.
pub struct UsbTransport {
    runtime: Handle,
    open_timeout: Duration,
    poll_interval: Duration,
    connections: Mutex<Vec<UsbConnection>>,
}

impl UsbTransport {
    pub fn new(runtime: Handle, config: &SessionConfig) -> Self {
        Self {
            runtime,
            open_timeout: config.open_timeout(),
            poll_interval: config.event_poll_interval(),
            connections: Mutex::new(Vec::new()),
        }
    }

    async fn open(&self, location_id: u64, vendor_id: u16, product_id: u16) -> Result<OpenedCamera, TransportError> {
        let device_id = CameraDeviceInfo::device_id_for(location_id);
        debug!("Opening {} (timeout={:?})...", device_id, self.open_timeout);

        let device = MtpDeviceBuilder::new()
            .timeout(self.open_timeout)
            .open_by_location(location_id)
            .await
            .map_err(|e| {
                if e.is_exclusive_access() {
                    TransportError::ExclusiveAccess {
                        device_id: device_id.clone(),
                        blocking_process: None,
                    }
                } else {
                    map_mtp_error(e, &device_id)
                }
            })?;

        let ptp_info = device.device_info();
        let non_empty = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };
        let info = CameraDeviceInfo {
            id: device_id.clone(),
            location_id,
            vendor_id,
            product_id,
            manufacturer: non_empty(&ptp_info.manufacturer),
            product: non_empty(&ptp_info.model),
            serial_number: non_empty(&ptp_info.serial_number),
        };
        debug!("Device opened: {} {}", ptp_info.manufacturer, ptp_info.model);

        let device: SharedDevice = Arc::new(AsyncMutex::new(device));
        let storage = CameraVariant::from_vendor_id(vendor_id)
            .capabilities()
            .contains(Capability::RemoteStorageBrowse)
            .then(|| {
                Arc::new(UsbStorageBrowser::new(self.runtime.clone(), Arc::clone(&device), device_id.clone()))
                    as Arc<dyn StorageBrowser>
            });
        let camera = CameraHandle::new(info, storage);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let capture_pending = Arc::new(AtomicBool::new(false));
        self.runtime.spawn(run_event_loop(
            device_id,
            Arc::clone(&device),
            EventLoopChannels {
                events: events_tx,
                shutdown: shutdown.subscribe(),
                capture_pending: Arc::clone(&capture_pending),
            },
            self.poll_interval,
        ));

        self.connections.lock_ignore_poison().push(UsbConnection {
            camera: camera.clone(),
            device,
            capture_pending,
            shutdown,
        });

        Ok(OpenedCamera {
            camera,
            events: events_rx,
        })
    }

    fn connection_parts(&self, camera: &CameraHandle) -> Result<(SharedDevice, Arc<AtomicBool>), TransportError> {
        self.connections
            .lock_ignore_poison()
            .iter()
            .find(|c| c.camera.same_connection(camera))
            .map(|c| (Arc::clone(&c.device), Arc::clone(&c.capture_pending)))
            .ok_or_else(|| TransportError::NotConnected {
                device_id: camera.id().to_string(),
            })
    }
}

impl Transport for UsbTransport {
    fn probe_and_open(&self, hint: &ProbeHint) -> Result<ProbeOutcome, TransportError> {
        let devices = MtpDevice::list_devices().map_err(|e| map_mtp_error(e, "usb"))?;
        debug!("Found {} PTP/MTP device(s)", devices.len());

        let candidate = hint
            .location_id
            .and_then(|loc| devices.iter().find(|d| d.location_id == loc))
            .or_else(|| devices.first());
        let Some(candidate) = candidate else {
            return Ok(ProbeOutcome::NoDevice);
        };
        if let Some(loc) = hint.location_id
            && candidate.location_id != loc
        {
            debug!("Hinted location {} not attached, using {}", loc, candidate.location_id);
        }

        let (location_id, vendor_id, product_id) = (candidate.location_id, candidate.vendor_id, candidate.product_id);
        self.runtime
            .block_on(self.open(location_id, vendor_id, product_id))
            .map(ProbeOutcome::Opened)
    }

    fn issue_command(&self, camera: &CameraHandle, command: &CameraCommand) -> Result<CommandReply, TransportError> {
        let (device, capture_pending) = self.connection_parts(camera)?;
        let device_id = camera.id();

        match command {
            CameraCommand::Capture => {
                capture_pending.store(true, Ordering::Release);
                let result = self.runtime.block_on(async {
                    let device = device.lock().await;
                    // Storage 0 and an undefined format let the camera choose
                    device
                        .session()
                        .initiate_capture(StorageId(0), ObjectFormatCode::Undefined)
                        .await
                });
                if let Err(e) = result {
                    capture_pending.store(false, Ordering::Release);
                    return Err(map_mtp_error(e, device_id));
                }
                debug!("Capture initiated on {}", device_id);
                Ok(CommandReply::Accepted)
            }
            CameraCommand::SetProperty { id, value } => {
                let (id, value) = (*id, *value);
                self.runtime
                    .block_on(async {
                        let device = device.lock().await;
                        let code = property_code(id)?;
                        let desc = device.session().get_device_prop_desc(code).await?;
                        let typed = typed_value(value, desc.data_type)?;
                        device.session().set_device_prop_value_typed(code, &typed).await
                    })
                    .map_err(|e| map_mtp_error(e, device_id))?;
                debug!("Property {:#06x} set to {} on {}", id, value, device_id);
                Ok(CommandReply::Value(value))
            }
            // TODO: Encode live view, bulb and autofocus as EOS (0x91xx) and Nikon (0x92xx) vendor operations via `PtpSession::execute`.
            _ => Err(TransportError::Unsupported {
                device_id: device_id.to_string(),
                operation: format!("{:?}", command),
            }),
        }
    }

    fn close(&self, camera: &CameraHandle) {
        let connection = {
            let mut connections = self.connections.lock_ignore_poison();
            let index = connections.iter().position(|c| c.camera.same_connection(camera));
            index.map(|i| connections.swap_remove(i))
        };
        let Some(connection) = connection else {
            debug!("close: {} already closed", camera.id());
            return;
        };

        let _ = connection.shutdown.send(());
        info!("Closed camera session: {}", camera.id());
        // Dropping the last device reference closes the PTP session
        drop(connection);
    }
}

/// Device calls the event loop makes.
trait EventSource: Send + Sync + 'static {
    /// Waits for the next device event, possibly forever.
    fn next_event(&self) -> impl Future<Output = Result<DeviceEvent, mtp_rs::Error>> + Send;

    fn property_value(&self, id: PropertyId) -> impl Future<Output = Result<PropertyValue, mtp_rs::Error>> + Send;

    /// File name and format name of an object.
    fn object_summary(&self, handle: ObjectHandle)
    -> impl Future<Output = Result<(String, String), mtp_rs::Error>> + Send;

    fn thumbnail(&self, handle: ObjectHandle) -> impl Future<Output = Result<Vec<u8>, mtp_rs::Error>> + Send;
}

impl EventSource for MtpDevice {
    async fn next_event(&self) -> Result<DeviceEvent, mtp_rs::Error> {
        MtpDevice::next_event(self).await
    }

    async fn property_value(&self, id: PropertyId) -> Result<PropertyValue, mtp_rs::Error> {
        let desc = self.session().get_device_prop_desc(property_code(id)?).await?;
        integer_value(&desc.current_value)
    }

    async fn object_summary(&self, handle: ObjectHandle) -> Result<(String, String), mtp_rs::Error> {
        let info = self.session().get_object_info(handle).await?;
        Ok((info.filename, format!("{:?}", info.format)))
    }

    async fn thumbnail(&self, handle: ObjectHandle) -> Result<Vec<u8>, mtp_rs::Error> {
        self.session().get_thumb(handle).await
    }
}

struct EventLoopChannels {
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: broadcast::Receiver<()>,
    capture_pending: Arc<AtomicBool>,
}

/// Polls the device for events until shutdown or disconnect.
async fn run_event_loop<D: EventSource>(
    device_id: String,
    device: Arc<AsyncMutex<D>>,
    mut channels: EventLoopChannels,
    poll_interval: Duration,
) {
    debug!("PTP event loop started for {}", device_id);

    loop {
        let poll_result = tokio::select! {
            biased;

            _ = channels.shutdown.recv() => {
                debug!("PTP event loop shutting down (signal): {}", device_id);
                break;
            }

            result = poll_events(&device_id, &device, poll_interval, &channels.capture_pending) => result,
        };

        match poll_result {
            Ok(translated) => {
                if !translated.into_iter().all(|event| channels.events.send(event).is_ok()) {
                    debug!("PTP event loop: session dropped the receiver for {}", device_id);
                    break;
                }
            }
            Err(mtp_rs::Error::Timeout) => tokio::time::sleep(poll_interval).await,
            Err(mtp_rs::Error::Disconnected) => {
                info!("Camera disconnected (event loop): {}", device_id);
                let _ = channels.events.send(TransportEvent::Detached);
                break;
            }
            Err(e) => {
                warn!("PTP event error for {}: {:?}", device_id, e);
                tokio::time::sleep(EVENT_ERROR_BACKOFF).await;
            }
        }
    }

    debug!("PTP event loop exited for {}", device_id);
}

/// Waits up to `hold` for one event while holding the device lock, then translates it.
async fn poll_events<D: EventSource>(
    device_id: &str,
    device: &AsyncMutex<D>,
    hold: Duration,
    capture_pending: &AtomicBool,
) -> Result<Vec<TransportEvent>, mtp_rs::Error> {
    // Device busy with a command or listing
    let guard = tokio::time::timeout(DEVICE_LOCK_TIMEOUT, device.lock())
        .await
        .map_err(|_| mtp_rs::Error::Timeout)?;
    // Interrupt reads never end on an idle camera
    let event = tokio::time::timeout(hold, guard.next_event())
        .await
        .map_err(|_| mtp_rs::Error::Timeout)??;
    Ok(translate_device_event(&*guard, device_id, event, capture_pending).await)
}

/// Maps a device event to transport events. Events the session doesn't track map to nothing.
async fn translate_device_event<D: EventSource>(
    device: &D,
    device_id: &str,
    event: DeviceEvent,
    capture_pending: &AtomicBool,
) -> Vec<TransportEvent> {
    match event {
        DeviceEvent::ObjectAdded { handle } => {
            debug!("Object added: {:?} on {}", handle, device_id);
            let (filename, format) = match device.object_summary(handle).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!("Object info failed for {:?} on {}: {}", handle, device_id, e);
                    (format!("{:08x}", handle.0), "Undefined".to_string())
                }
            };

            let mut translated = Vec::with_capacity(2);
            if capture_pending.swap(false, Ordering::AcqRel) {
                let thumbnail = match device.thumbnail(handle).await {
                    Ok(bytes) if !bytes.is_empty() => Some(Arc::from(bytes)),
                    Ok(_) => None,
                    Err(e) => {
                        debug!("No thumbnail for {}: {}", filename, e);
                        None
                    }
                };
                translated.push(TransportEvent::CapturedPicture(CapturedPicture {
                    handle: handle.0,
                    filename,
                    thumbnail,
                    image: None,
                }));
            }
            translated.push(TransportEvent::ObjectAdded {
                handle: handle.0,
                format,
            });
            translated
        }
        DeviceEvent::Unknown { code, params } if code == u16::from(EventCode::DevicePropChanged) => {
            let id = params[0];
            match device.property_value(id).await {
                Ok(value) => vec![TransportEvent::PropertyChanged { id, value }],
                Err(e) => {
                    debug!("Couldn't read property {:#06x} on {}: {}", id, device_id, e);
                    Vec::new()
                }
            }
        }
        DeviceEvent::ObjectRemoved { handle } => {
            debug!("Object removed: {:?} on {}", handle, device_id);
            Vec::new()
        }
        DeviceEvent::ObjectInfoChanged { handle } => {
            debug!("Object changed: {:?} on {}", handle, device_id);
            Vec::new()
        }
        DeviceEvent::StorageInfoChanged { storage_id } => {
            debug!("Storage info changed: {:?} on {}", storage_id, device_id);
            Vec::new()
        }
        DeviceEvent::StoreAdded { storage_id } => {
            info!("Storage added: {:?} on {}", storage_id, device_id);
            Vec::new()
        }
        DeviceEvent::StoreRemoved { storage_id } => {
            info!("Storage removed: {:?} on {}", storage_id, device_id);
            Vec::new()
        }
        DeviceEvent::DeviceInfoChanged => {
            debug!("Device info changed: {}", device_id);
            Vec::new()
        }
        DeviceEvent::DeviceReset => {
            warn!("Device reset: {}", device_id);
            vec![TransportEvent::Failed {
                message: format!("Camera {} reset its session", device_id),
            }]
        }
        DeviceEvent::Unknown { code, params } => {
            debug!("Unknown event {:04x} {:?} on {}", code, params, device_id);
            Vec::new()
        }
    }
}

fn invalid_data(message: String) -> mtp_rs::Error {
    mtp_rs::Error::InvalidData { message }
}

fn property_code(id: PropertyId) -> Result<DevicePropertyCode, mtp_rs::Error> {
    u16::try_from(id)
        .map(DevicePropertyCode::from)
        .map_err(|_| invalid_data(format!("Property code {:#x} is out of range", id)))
}

/// Reads an integer property value. Unsigned 32-bit values keep their bit pattern.
fn integer_value(value: &PtpValue) -> Result<PropertyValue, mtp_rs::Error> {
    match *value {
        PtpValue::Int8(v) => Ok(v.into()),
        PtpValue::Uint8(v) => Ok(v.into()),
        PtpValue::Int16(v) => Ok(v.into()),
        PtpValue::Uint16(v) => Ok(v.into()),
        PtpValue::Int32(v) => Ok(v),
        PtpValue::Uint32(v) => Ok(v as i32),
        _ => Err(invalid_data(format!("{:?} isn't a 32-bit property value", value))),
    }
}

/// Encodes `value` as the property's declared data type.
fn typed_value(value: PropertyValue, data_type: PropertyDataType) -> Result<PtpValue, mtp_rs::Error> {
    let out_of_range = |_| invalid_data(format!("{} doesn't fit a {:?} property", value, data_type));
    Ok(match data_type {
        PropertyDataType::Int8 => PtpValue::Int8(i8::try_from(value).map_err(out_of_range)?),
        PropertyDataType::Uint8 => PtpValue::Uint8(u8::try_from(value).map_err(out_of_range)?),
        PropertyDataType::Int16 => PtpValue::Int16(i16::try_from(value).map_err(out_of_range)?),
        PropertyDataType::Uint16 => PtpValue::Uint16(u16::try_from(value).map_err(out_of_range)?),
        PropertyDataType::Int32 => PtpValue::Int32(value),
        PropertyDataType::Uint32 => PtpValue::Uint32(value as u32),
        other => return Err(invalid_data(format!("{:?} properties can't be set", other))),
    })
}

/// Storage browsing over an open USB session.
///
/// Object infos come back with the handle listing, so they're cached per
/// listing and served from the cache by `object_info`.
struct UsbStorageBrowser {
    runtime: Handle,
    device: SharedDevice,
    device_id: String,
    objects: Mutex<HashMap<u32, ObjectEntry>>,
}

impl UsbStorageBrowser {
    fn new(runtime: Handle, device: SharedDevice, device_id: String) -> Self {
        Self {
            runtime,
            device,
            device_id,
            objects: Mutex::new(HashMap::new()),
        }
    }

    fn map_err(&self, e: mtp_rs::Error) -> TransportError {
        map_mtp_error(e, &self.device_id)
    }

    fn to_entry(
        storage_id: u32,
        parent: u32,
        handle: ObjectHandle,
        filename: &str,
        format: ObjectFormatCode,
        size: u64,
    ) -> ObjectEntry {
        let is_folder = format == ObjectFormatCode::Association;
        ObjectEntry {
            handle: handle.0,
            parent,
            storage_id,
            name: filename.to_string(),
            format: format!("{:?}", format),
            is_folder,
            size: if is_folder { 0 } else { size },
        }
    }
}

impl StorageBrowser for UsbStorageBrowser {
    fn storage_ids(&self) -> Result<Vec<u32>, TransportError> {
        self.runtime.block_on(async {
            let device = self.device.lock().await;
            let storages = device.storages().await.map_err(|e| self.map_err(e))?;
            Ok(storages.iter().map(|s| s.id().0).collect())
        })
    }

    fn storage_info(&self, storage_id: u32) -> Result<StorageEntry, TransportError> {
        self.runtime.block_on(async {
            let device = self.device.lock().await;
            let storage = device
                .storage(StorageId(storage_id))
                .await
                .map_err(|e| self.map_err(e))?;
            let info = storage.info();
            Ok(StorageEntry {
                id: storage_id,
                description: info.description.clone(),
                max_capacity: info.max_capacity,
                free_space_bytes: info.free_space_bytes,
                storage_type: Some(format!("{:?}", info.storage_type)),
            })
        })
    }

    fn object_handles(&self, storage_id: u32, parent: u32) -> Result<Vec<u32>, TransportError> {
        let infos = self.runtime.block_on(async {
            let device = self.device.lock().await;
            let storage = device
                .storage(StorageId(storage_id))
                .await
                .map_err(|e| self.map_err(e))?;
            let parent_opt = if parent == ALL_OBJECTS_HANDLE {
                None
            } else {
                Some(ObjectHandle(parent))
            };
            storage.list_objects(parent_opt).await.map_err(|e| self.map_err(e))
        })?;

        let entry_parent = if parent == ALL_OBJECTS_HANDLE { ROOT_HANDLE } else { parent };
        let mut objects = self.objects.lock_ignore_poison();
        Ok(infos
            .iter()
            .map(|info| {
                let entry = Self::to_entry(storage_id, entry_parent, info.handle, &info.filename, info.format, info.size);
                let handle = entry.handle;
                objects.insert(handle, entry);
                handle
            })
            .collect())
    }

    fn object_info(&self, storage_id: u32, handle: u32) -> Result<ObjectEntry, TransportError> {
        if let Some(entry) = self.objects.lock_ignore_poison().get(&handle)
            && entry.storage_id == storage_id
        {
            return Ok(entry.clone());
        }

        // Not listed through this browser: the parent is unknown
        self.runtime.block_on(async {
            let device = self.device.lock().await;
            let storage = device
                .storage(StorageId(storage_id))
                .await
                .map_err(|e| self.map_err(e))?;
            let info = storage
                .get_object_info(ObjectHandle(handle))
                .await
                .map_err(|e| self.map_err(e))?;
            Ok(Self::to_entry(
                storage_id,
                ROOT_HANDLE,
                info.handle,
                &info.filename,
                info.format,
                info.size,
            ))
        })
    }
}

/// Maps an `mtp-rs` error to a transport error for `device_id`.
pub(crate) fn map_mtp_error(e: mtp_rs::Error, device_id: &str) -> TransportError {
    let device_id = device_id.to_string();
    match e {
        mtp_rs::Error::NoDevice => TransportError::DeviceNotFound { device_id },
        mtp_rs::Error::Disconnected => TransportError::Disconnected { device_id },
        mtp_rs::Error::Timeout => TransportError::Timeout { device_id },
        mtp_rs::Error::Cancelled => TransportError::Other {
            device_id,
            message: "Operation cancelled".to_string(),
        },
        mtp_rs::Error::SessionNotOpen => TransportError::NotConnected { device_id },
        mtp_rs::Error::Protocol { code, operation } => match code {
            ResponseCode::DeviceBusy => TransportError::DeviceBusy { device_id },
            ResponseCode::AccessDenied => TransportError::Other {
                device_id,
                message: "Access denied. The camera rejected the operation.".to_string(),
            },
            _ => TransportError::Protocol {
                device_id,
                message: format!("{:?} (operation: {:?})", code, operation),
            },
        },
        mtp_rs::Error::InvalidData { message } => TransportError::Protocol {
            device_id,
            message: format!("Invalid data from camera: {}", message),
        },
        mtp_rs::Error::Io(io_err) => TransportError::Other {
            device_id,
            message: format!("I/O error: {}", io_err),
        },
        mtp_rs::Error::Usb(usb_err) => {
            let msg = usb_err.to_string().to_lowercase();
            if msg.contains("exclusive access") || msg.contains("device or resource busy") {
                TransportError::ExclusiveAccess {
                    device_id,
                    blocking_process: None,
                }
            } else {
                TransportError::Other {
                    device_id,
                    message: format!("USB error: {}", usb_err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtp_rs::ptp::OperationCode;
    use std::collections::VecDeque;

    /// Device whose events are scripted. Once the script runs out, `next_event` never returns.
    #[derive(Default)]
    struct ScriptedDevice {
        events: Mutex<VecDeque<DeviceEvent>>,
        properties: HashMap<PropertyId, PropertyValue>,
        thumbnail: Vec<u8>,
    }

    impl ScriptedDevice {
        fn with_events(events: impl IntoIterator<Item = DeviceEvent>) -> Self {
            Self {
                events: Mutex::new(events.into_iter().collect()),
                ..Self::default()
            }
        }
    }

    impl EventSource for ScriptedDevice {
        async fn next_event(&self) -> Result<DeviceEvent, mtp_rs::Error> {
            let next = self.events.lock().unwrap().pop_front();
            match next {
                Some(event) => Ok(event),
                None => std::future::pending().await,
            }
        }

        async fn property_value(&self, id: PropertyId) -> Result<PropertyValue, mtp_rs::Error> {
            self.properties.get(&id).copied().ok_or(mtp_rs::Error::Protocol {
                code: ResponseCode::DevicePropNotSupported,
                operation: OperationCode::GetDevicePropDesc,
            })
        }

        async fn object_summary(&self, handle: ObjectHandle) -> Result<(String, String), mtp_rs::Error> {
            Ok((format!("IMG_{:04}.JPG", handle.0), "Jpeg".to_string()))
        }

        async fn thumbnail(&self, _handle: ObjectHandle) -> Result<Vec<u8>, mtp_rs::Error> {
            Ok(self.thumbnail.clone())
        }
    }

    fn channels() -> (
        EventLoopChannels,
        mpsc::UnboundedReceiver<TransportEvent>,
        broadcast::Sender<()>,
    ) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let channels = EventLoopChannels {
            events,
            shutdown: shutdown_rx,
            capture_pending: Arc::new(AtomicBool::new(false)),
        };
        (channels, events_rx, shutdown)
    }

    #[test]
    fn test_map_connection_errors() {
        assert_eq!(
            map_mtp_error(mtp_rs::Error::Disconnected, "ptp-9"),
            TransportError::Disconnected {
                device_id: "ptp-9".to_string()
            }
        );
        assert!(map_mtp_error(mtp_rs::Error::SessionNotOpen, "ptp-9").is_connection_lost());
        assert!(!map_mtp_error(mtp_rs::Error::Timeout, "ptp-9").is_connection_lost());
    }

    #[test]
    fn test_map_busy_response() {
        let err = mtp_rs::Error::Protocol {
            code: ResponseCode::DeviceBusy,
            operation: OperationCode::DeleteObject,
        };
        assert_eq!(
            map_mtp_error(err, "ptp-9"),
            TransportError::DeviceBusy {
                device_id: "ptp-9".to_string()
            }
        );
    }

    #[test]
    fn test_integer_property_values() {
        assert_eq!(integer_value(&PtpValue::Uint16(400)).unwrap(), 400);
        assert_eq!(integer_value(&PtpValue::Int16(-1000)).unwrap(), -1000);
        assert_eq!(integer_value(&PtpValue::Uint32(u32::MAX)).unwrap(), -1);
        assert!(integer_value(&PtpValue::String("1/250".to_string())).is_err());
    }

    #[test]
    fn test_typed_values_follow_the_declared_type() {
        assert_eq!(typed_value(56, PropertyDataType::Uint16).unwrap(), PtpValue::Uint16(56));
        assert_eq!(typed_value(-3, PropertyDataType::Int8).unwrap(), PtpValue::Int8(-3));
        assert_eq!(typed_value(-1, PropertyDataType::Uint32).unwrap(), PtpValue::Uint32(u32::MAX));
        assert!(typed_value(300, PropertyDataType::Uint8).is_err());
        assert!(typed_value(1, PropertyDataType::String).is_err());
    }

    #[test]
    fn test_property_code_range() {
        assert_eq!(property_code(0x5007).unwrap(), DevicePropertyCode::FNumber);
        assert!(property_code(0x1_0000).is_err());
    }

    #[tokio::test]
    async fn test_device_reset_fails_the_session() {
        let device = ScriptedDevice::default();
        let translated = translate_device_event(&device, "ptp-9", DeviceEvent::DeviceReset, &AtomicBool::new(false)).await;
        assert!(matches!(translated[..], [TransportEvent::Failed { .. }]));
    }

    #[tokio::test]
    async fn test_storage_events_are_not_forwarded() {
        let device = ScriptedDevice::default();
        let translated =
            translate_device_event(&device, "ptp-9", DeviceEvent::DeviceInfoChanged, &AtomicBool::new(false)).await;
        assert!(translated.is_empty());
    }

    #[tokio::test]
    async fn test_property_change_reads_current_value() {
        let device = ScriptedDevice {
            properties: [(0x5007, 56)].into_iter().collect(),
            ..ScriptedDevice::default()
        };
        let event = DeviceEvent::Unknown {
            code: u16::from(EventCode::DevicePropChanged),
            params: [0x5007, 0, 0],
        };

        let translated = translate_device_event(&device, "ptp-9", event, &AtomicBool::new(false)).await;
        assert_eq!(translated, vec![TransportEvent::PropertyChanged { id: 0x5007, value: 56 }]);
    }

    #[tokio::test]
    async fn test_unreadable_property_change_is_dropped() {
        let device = ScriptedDevice::default();
        let event = DeviceEvent::Unknown {
            code: u16::from(EventCode::DevicePropChanged),
            params: [0xd101, 0, 0],
        };
        assert!(translate_device_event(&device, "ptp-9", event, &AtomicBool::new(false)).await.is_empty());
    }

    #[tokio::test]
    async fn test_object_after_capture_is_the_picture() {
        let device = ScriptedDevice {
            thumbnail: vec![0xff, 0xd8, 0xff, 0xd9],
            ..ScriptedDevice::default()
        };
        let pending = AtomicBool::new(true);
        let added = || DeviceEvent::ObjectAdded {
            handle: ObjectHandle(12),
        };

        let first = translate_device_event(&device, "ptp-9", added(), &pending).await;
        let second = translate_device_event(&device, "ptp-9", added(), &pending).await;

        let [TransportEvent::CapturedPicture(picture), TransportEvent::ObjectAdded { handle: 12, .. }] = &first[..] else {
            panic!("expected a picture then an object, got {:?}", first);
        };
        assert_eq!(picture.filename, "IMG_0012.JPG");
        assert!(picture.thumbnail.is_some());
        assert_eq!(
            second,
            vec![TransportEvent::ObjectAdded {
                handle: 12,
                format: "Jpeg".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_idle_device_does_not_keep_the_lock() {
        let device = Arc::new(AsyncMutex::new(ScriptedDevice::default()));
        let (channels, _events, shutdown) = channels();
        let event_loop = tokio::spawn(run_event_loop(
            "ptp-9".to_string(),
            Arc::clone(&device),
            channels,
            Duration::from_millis(20),
        ));

        // Give the loop time to start waiting on the silent device
        tokio::time::sleep(Duration::from_millis(30)).await;
        for _ in 0..3 {
            let guard = tokio::time::timeout(Duration::from_secs(1), device.lock()).await;
            assert!(guard.is_ok(), "device lock stayed held by the event loop");
        }

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), event_loop)
            .await
            .expect("event loop didn't stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_event_loop_forwards_then_detaches() {
        let device = Arc::new(AsyncMutex::new(ScriptedDevice::with_events([
            DeviceEvent::ObjectAdded {
                handle: ObjectHandle(3),
            },
            DeviceEvent::DeviceReset,
        ])));
        let (channels, mut events, _shutdown) = channels();
        tokio::spawn(run_event_loop(
            "ptp-9".to_string(),
            device,
            channels,
            Duration::from_millis(20),
        ));

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::ObjectAdded {
                handle: 3,
                format: "Jpeg".to_string()
            })
        );
        assert!(matches!(events.recv().await, Some(TransportEvent::Failed { .. })));
    }
}
