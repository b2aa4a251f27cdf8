//! Accelerator memory hooks.
//!
//! Device operations are synchronous and never recover: any failure reported by a
//! [`DeviceMemory`] implementation is logged and the process is aborted through
//! [`fatal_device_error`]. There is no dependency tracking between host and device
//! copies; callers issue `copy_to_device`/`copy_to_host` in the order they need.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

/// Raw device address handed out by a [`DeviceMemory`] implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Failure reported by a device API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("allocation of {elements} elements failed: {reason}")]
    AllocationFailed { elements: usize, reason: String },

    #[error("unknown device pointer {0}")]
    InvalidPointer(DevicePtr),

    #[error("copy of {requested} elements into a {allocated}-element buffer")]
    SizeMismatch { requested: usize, allocated: usize },

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Memory lifecycle primitives of an accelerator
pub trait DeviceMemory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reserve room for `elements` f32 values
    fn allocate(&self, elements: usize) -> Result<DevicePtr, DeviceError>;

    fn copy_to_device(&self, ptr: DevicePtr, src: &[f32]) -> Result<(), DeviceError>;

    fn copy_to_host(&self, ptr: DevicePtr, dst: &mut [f32]) -> Result<(), DeviceError>;

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;
}

/// Report a device failure and terminate the process
pub fn fatal_device_error(operation: &str, device: &str, err: &DeviceError) -> ! {
    tracing::error!(operation, device, error = %err, "device operation failed, aborting");
    eprintln!("Device error in {} on {}: {}", operation, device, err);
    std::process::abort()
}

/// Unwrap a device result or abort
pub fn check<T>(result: Result<T, DeviceError>, operation: &str, device: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal_device_error(operation, device, &err),
    }
}

/// Device memory emulated with host buffers.
///
/// Used where no accelerator is present and as the test double for the lifecycle
/// hooks. Addresses are opaque, monotonically increasing handles.
#[derive(Debug)]
pub struct HostMirrorDevice {
    buffers: Mutex<HashMap<DevicePtr, Vec<f32>>>,
    next_address: AtomicU64,
    capacity: Option<usize>,
}

impl HostMirrorDevice {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            next_address: AtomicU64::new(0x1000),
            capacity: None,
        }
    }

    /// Limit the total number of elements that may be resident at once
    pub fn with_capacity(mut self, elements: usize) -> Self {
        self.capacity = Some(elements);
        self
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn resident_elements(&self) -> usize {
        self.buffers.lock().values().map(Vec::len).sum()
    }
}

impl Default for HostMirrorDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory for HostMirrorDevice {
    fn name(&self) -> &'static str {
        "host-mirror"
    }

    fn allocate(&self, elements: usize) -> Result<DevicePtr, DeviceError> {
        let mut buffers = self.buffers.lock();
        if let Some(capacity) = self.capacity {
            let resident: usize = buffers.values().map(Vec::len).sum();
            if resident + elements > capacity {
                return Err(DeviceError::AllocationFailed {
                    elements,
                    reason: format!("{} of {} elements already resident", resident, capacity),
                });
            }
        }
        let step = (elements.max(1) * std::mem::size_of::<f32>()) as u64;
        let ptr = DevicePtr(self.next_address.fetch_add(step, Ordering::Relaxed));
        buffers.insert(ptr, vec![0.0; elements]);
        Ok(ptr)
    }

    fn copy_to_device(&self, ptr: DevicePtr, src: &[f32]) -> Result<(), DeviceError> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.get_mut(&ptr).ok_or(DeviceError::InvalidPointer(ptr))?;
        if buffer.len() != src.len() {
            return Err(DeviceError::SizeMismatch {
                requested: src.len(),
                allocated: buffer.len(),
            });
        }
        buffer.copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host(&self, ptr: DevicePtr, dst: &mut [f32]) -> Result<(), DeviceError> {
        let buffers = self.buffers.lock();
        let buffer = buffers.get(&ptr).ok_or(DeviceError::InvalidPointer(ptr))?;
        if buffer.len() != dst.len() {
            return Err(DeviceError::SizeMismatch {
                requested: dst.len(),
                allocated: buffer.len(),
            });
        }
        dst.copy_from_slice(buffer);
        Ok(())
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        self.buffers
            .lock()
            .remove(&ptr)
            .map(|_| ())
            .ok_or(DeviceError::InvalidPointer(ptr))
    }
}

lazy_static! {
    static ref CURRENT_DEVICE: RwLock<Arc<dyn DeviceMemory>> = RwLock::new(Arc::new(HostMirrorDevice::new()));
}

/// Device used by tensors that allocate without naming one
pub fn current_device() -> Arc<dyn DeviceMemory> {
    CURRENT_DEVICE.read().clone()
}

/// Swap the process-wide device handle. Existing allocations keep their device.
pub fn set_device(device: Arc<dyn DeviceMemory>) {
    tracing::info!(device = device.name(), "device memory handle installed");
    *CURRENT_DEVICE.write() = device;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_mirror_round_trip() {
        let device = HostMirrorDevice::new();
        let ptr = device.allocate(3).unwrap();
        device.copy_to_device(ptr, &[1.0, 2.0, 3.0]).unwrap();

        let mut back = [0.0; 3];
        device.copy_to_host(ptr, &mut back).unwrap();
        assert_eq!(back, [1.0, 2.0, 3.0]);

        assert_eq!(device.live_allocations(), 1);
        device.free(ptr).unwrap();
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn test_host_mirror_reports_failures() {
        let device = HostMirrorDevice::new().with_capacity(4);
        let ptr = device.allocate(4).unwrap();
        assert!(matches!(device.allocate(1), Err(DeviceError::AllocationFailed { .. })));
        assert!(matches!(
            device.copy_to_device(ptr, &[1.0]),
            Err(DeviceError::SizeMismatch { requested: 1, allocated: 4 })
        ));

        device.free(ptr).unwrap();
        assert_eq!(device.free(ptr), Err(DeviceError::InvalidPointer(ptr)));
    }

    #[test]
    fn test_distinct_addresses() {
        let device = HostMirrorDevice::new();
        let a = device.allocate(8).unwrap();
        let b = device.allocate(8).unwrap();
        assert_ne!(a, b);
        assert_eq!(device.resident_elements(), 16);
    }
}
