use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::capture::domain::frame_source::AcquisitionError;

/// Tracks which physical capture devices are currently held.
///
/// Shared by every source that may open the same devices; each device id
/// can be leased by at most one holder at a time.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    held: Mutex<HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Leases `device`, failing with [`AcquisitionError::DeviceBusy`] if it
    /// is already held. The lease is returned when dropped.
    pub fn acquire(self: &Arc<Self>, device: &str) -> Result<DeviceLease, AcquisitionError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(device.to_string()) {
            return Err(AcquisitionError::DeviceBusy(device.to_string()));
        }
        Ok(DeviceLease {
            registry: Arc::clone(self),
            device: device.to_string(),
        })
    }

    pub fn is_held(&self, device: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(device)
    }
}

/// Exclusive hold on one device; released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    registry: Arc<DeviceRegistry>,
    device: String,
}

impl DeviceLease {
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.registry
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.device);
    }
}
