/*!
 * Device registry for one gateway.
 *
 * Devices are stored under their key (the friendly id). A reverse index
 * resolves a vendor device id to the current key, so streams addressed by
 * device id reach the same device after it was re-keyed.
 *
 * The registry is owned by the coordinator task and needs no locking.
 */
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::device::Device;
use crate::profile::EntityCategory;

/// Device map plus device-id index
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    index: HashMap<String, String>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a device under its key, returning whatever it replaced
    pub fn register_device(&mut self, device: Device) -> Option<Device> {
        let key = device.key().to_string();

        if let Some(stale_key) = self.index.get(&device.device_id).cloned() {
            if stale_key != key {
                debug!("Re-keying {} from {} to {}", device.device_id, stale_key, key);
                self.devices.remove(&stale_key);
            }
        }

        let device_id = device.device_id.clone();
        self.index.insert(device_id.clone(), key.clone());
        let replaced = self.devices.insert(key.clone(), device);

        if let Some(previous) = &replaced {
            if previous.device_id != device_id {
                warn!(
                    "Key {} now belongs to {}, dropping {}",
                    key, device_id, previous.device_id
                );
                if self.index.get(&previous.device_id) == Some(&key) {
                    self.index.remove(&previous.device_id);
                }
            }
        }
        replaced
    }

    /// Remove a device by key
    pub fn unregister_device(&mut self, key: &str) -> Option<Device> {
        let device = self.devices.remove(key)?;
        if self.index.get(&device.device_id).map(String::as_str) == Some(key) {
            self.index.remove(&device.device_id);
        }
        Some(device)
    }

    /// Get a device by key
    pub fn get_device(&self, key: &str) -> Option<&Device> {
        self.devices.get(key)
    }

    /// Get a device by key for mutation
    pub fn get_device_mut(&mut self, key: &str) -> Option<&mut Device> {
        self.devices.get_mut(key)
    }

    /// Current key of a vendor device id
    pub fn key_for(&self, device_id: &str) -> Option<&str> {
        self.index.get(device_id).map(String::as_str)
    }

    /// Resolve either a key or a device id to the current key
    pub fn resolve_key(&self, key_or_id: &str) -> Option<String> {
        if self.devices.contains_key(key_or_id) {
            return Some(key_or_id.to_string());
        }
        self.key_for(key_or_id).map(str::to_string)
    }

    /// Get a device by key or device id
    pub fn resolve(&self, key_or_id: &str) -> Option<&Device> {
        self.resolve_key(key_or_id)
            .and_then(|key| self.devices.get(&key))
    }

    /// All devices
    pub fn get_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Devices whose primary profile maps to `category`
    pub fn get_devices_by_category(&self, category: EntityCategory) -> Vec<&Device> {
        self.devices
            .values()
            .filter(|d| d.category() == Some(category))
            .collect()
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
