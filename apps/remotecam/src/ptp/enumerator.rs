//! Flat storage and object enumeration over a camera's storage containers.
//!
//! Every call is a blocking round trip to the device. Run it on a blocking
//! worker (`tokio::task::spawn_blocking`), never on the event dispatch path.
//! Results are snapshots: call again after anything changes on the device.

use log::{debug, warn};
use std::collections::BTreeMap;

use super::errors::{EnumerationError, TransportError};
use super::types::{ObjectEntry, StorageEntry};

/// Parent handle meaning "the root of the storage".
pub const ROOT_HANDLE: u32 = 0;

/// Device-side wildcard for "all objects in storage", sent in place of `ROOT_HANDLE`.
pub const ALL_OBJECTS_HANDLE: u32 = 0xFFFF_FFFF;

/// Blocking access to a device's storage containers and object handles.
pub trait StorageBrowser: Send + Sync {
    /// IDs of all storage containers. An empty list means nothing to enumerate.
    fn storage_ids(&self) -> Result<Vec<u32>, TransportError>;

    fn storage_info(&self, storage_id: u32) -> Result<StorageEntry, TransportError>;

    /// Handles of the objects directly under `parent`, or of all objects for `ALL_OBJECTS_HANDLE`.
    fn object_handles(&self, storage_id: u32, parent: u32) -> Result<Vec<u32>, TransportError>;

    fn object_info(&self, storage_id: u32, handle: u32) -> Result<ObjectEntry, TransportError>;
}

/// Lists all storage containers the device reports, keyed by storage ID.
///
/// Returns `Unavailable` if there's no device or it reports no storage IDs.
/// A storage whose info fetch fails is logged and left out.
pub fn list_storages(device: Option<&dyn StorageBrowser>) -> Result<BTreeMap<u32, StorageEntry>, EnumerationError> {
    let Some(device) = device else {
        return Err(EnumerationError::Unavailable);
    };

    let storage_ids = device.storage_ids()?;
    if storage_ids.is_empty() {
        debug!("list_storages: device reported no storage IDs");
        return Err(EnumerationError::Unavailable);
    }

    let mut storages = BTreeMap::new();
    for storage_id in storage_ids {
        match device.storage_info(storage_id) {
            Ok(info) => {
                storages.insert(storage_id, info);
            }
            Err(e) => warn!("list_storages: storage info failed for {:#010x}: {}", storage_id, e),
        }
    }

    debug!("list_storages: {} storage(s)", storages.len());
    Ok(storages)
}

/// Lists the objects under `parent` as a flat list, without recursing into folders.
///
/// `ROOT_HANDLE` is translated to `ALL_OBJECTS_HANDLE` before querying. An object
/// whose info fetch fails is logged and left out.
pub fn list_objects(
    device: Option<&dyn StorageBrowser>,
    storage_id: u32,
    parent: u32,
) -> Result<Vec<ObjectEntry>, EnumerationError> {
    let Some(device) = device else {
        return Err(EnumerationError::Unavailable);
    };

    let parent = if parent == ROOT_HANDLE { ALL_OBJECTS_HANDLE } else { parent };
    let handles = device.object_handles(storage_id, parent)?;

    let mut objects = Vec::with_capacity(handles.len());
    for handle in handles {
        match device.object_info(storage_id, handle) {
            Ok(info) => objects.push(info),
            Err(e) => warn!("list_objects: object info failed for handle {}: {}", handle, e),
        }
    }

    debug!(
        "list_objects: storage={:#010x}, parent={:#010x}, {} object(s)",
        storage_id,
        parent,
        objects.len()
    );
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Device stub that reports fixed handles and fails selected lookups.
    struct StubDevice {
        storage_ids: Vec<u32>,
        failing_storages: HashSet<u32>,
        handles: Vec<u32>,
        failing_handles: HashSet<u32>,
        queried_parents: Mutex<Vec<u32>>,
    }

    impl StubDevice {
        fn new(storage_ids: &[u32], handles: &[u32]) -> Self {
            Self {
                storage_ids: storage_ids.to_vec(),
                failing_storages: HashSet::new(),
                handles: handles.to_vec(),
                failing_handles: HashSet::new(),
                queried_parents: Mutex::new(Vec::new()),
            }
        }

        fn failure(id: u32) -> TransportError {
            TransportError::Protocol {
                device_id: "stub".to_string(),
                message: format!("InvalidHandle {}", id),
            }
        }
    }

    impl StorageBrowser for StubDevice {
        fn storage_ids(&self) -> Result<Vec<u32>, TransportError> {
            Ok(self.storage_ids.clone())
        }

        fn storage_info(&self, storage_id: u32) -> Result<StorageEntry, TransportError> {
            if self.failing_storages.contains(&storage_id) {
                return Err(Self::failure(storage_id));
            }
            Ok(StorageEntry {
                id: storage_id,
                description: format!("SD{}", storage_id & 0xff),
                max_capacity: 64_000_000_000,
                free_space_bytes: 32_000_000_000,
                storage_type: Some("RemovableRam".to_string()),
            })
        }

        fn object_handles(&self, _storage_id: u32, parent: u32) -> Result<Vec<u32>, TransportError> {
            self.queried_parents.lock().unwrap().push(parent);
            Ok(self.handles.clone())
        }

        fn object_info(&self, storage_id: u32, handle: u32) -> Result<ObjectEntry, TransportError> {
            if self.failing_handles.contains(&handle) {
                return Err(Self::failure(handle));
            }
            Ok(ObjectEntry {
                handle,
                parent: ROOT_HANDLE,
                storage_id,
                name: format!("IMG_{:04}.JPG", handle),
                format: "ExifJpeg".to_string(),
                is_folder: false,
                size: 4096,
            })
        }
    }

    #[test]
    fn test_list_storages_without_device_is_unavailable() {
        assert_eq!(list_storages(None), Err(EnumerationError::Unavailable));
    }

    #[test]
    fn test_list_storages_with_no_storage_ids_is_unavailable() {
        let device = StubDevice::new(&[], &[]);
        assert_eq!(list_storages(Some(&device)), Err(EnumerationError::Unavailable));
    }

    #[test]
    fn test_list_storages_skips_failing_storage() {
        let mut device = StubDevice::new(&[0x0001_0001, 0x0002_0001], &[]);
        device.failing_storages.insert(0x0001_0001);

        let storages = list_storages(Some(&device)).unwrap();
        assert_eq!(storages.len(), 1);
        assert_eq!(storages[&0x0002_0001].description, "SD1");
    }

    #[test]
    fn test_list_objects_skips_failing_entry() {
        let mut device = StubDevice::new(&[0x0002_0001], &[1, 2, 3]);
        device.failing_handles.insert(2);

        let objects = list_objects(Some(&device), 0x0002_0001, ROOT_HANDLE).unwrap();
        let handles: Vec<u32> = objects.iter().map(|o| o.handle).collect();
        assert_eq!(handles, vec![1, 3]);
    }

    #[test]
    fn test_list_objects_translates_root_to_wildcard() {
        let device = StubDevice::new(&[0x0002_0001], &[]);
        list_objects(Some(&device), 0x0002_0001, ROOT_HANDLE).unwrap();
        list_objects(Some(&device), 0x0002_0001, 0x9000_0000).unwrap();

        let parents = device.queried_parents.lock().unwrap().clone();
        assert_eq!(parents, vec![ALL_OBJECTS_HANDLE, 0x9000_0000]);
    }

    #[test]
    fn test_list_objects_without_device_is_unavailable() {
        assert_eq!(list_objects(None, 0x0002_0001, ROOT_HANDLE), Err(EnumerationError::Unavailable));
    }
}
