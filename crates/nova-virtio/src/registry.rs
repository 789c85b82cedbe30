//! Device registry
//!
//! The bus manager registers every brought-up device here under its
//! device-node name ("virtio-blk0", "virtio-input1", ...) so drivers can
//! look their device up at attach time. The table is bounded and keeps
//! its own lock; nothing in the queue engine depends on it.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;

use crate::device::VirtioDevice;
use crate::{VirtioError, VirtioResult};

/// Most devices one registry tracks.
pub const MAX_DEVICES: usize = 10;

/// Bounded, name-keyed table of live VirtIO devices.
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<String, Arc<VirtioDevice>>>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a device under `name`. Fails when the table is full or
    /// the name is taken; the device is not dropped in either case, the
    /// caller keeps its `Arc`.
    pub fn register(&self, name: &str, device: Arc<VirtioDevice>) -> VirtioResult<()> {
        let mut devices = self.devices.lock();
        if devices.len() >= MAX_DEVICES {
            return Err(VirtioError::RegistryFull);
        }
        if devices.contains_key(name) {
            return Err(VirtioError::AlreadyRegistered);
        }
        devices.insert(String::from(name), device);
        Ok(())
    }

    /// Remove and return the device registered under `name`.
    pub fn unregister(&self, name: &str) -> Option<Arc<VirtioDevice>> {
        self.devices.lock().remove(name)
    }

    /// Look up a device by name.
    pub fn get(&self, name: &str) -> Option<Arc<VirtioDevice>> {
        self.devices.lock().get(name).cloned()
    }

    pub fn count(&self) -> usize {
        self.devices.lock().len()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The system-wide registry instance used by the bus manager.
pub static DEVICES: DeviceRegistry = DeviceRegistry::new();
