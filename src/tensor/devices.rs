//! Accelerator memory lifecycle for tensors.
//!
//! A tensor owns at most one device allocation. Allocation is lazy, copies are
//! synchronous and explicit, and the allocation is released when the tensor node
//! is dropped. Device failures abort the process.

use std::sync::Arc;

use crate::backend::device::{check, current_device, DeviceMemory, DevicePtr};
use super::core::{Tensor, TensorNode};

/// Device buffer mirroring a tensor's data
pub(crate) struct DeviceAllocation {
    memory: Arc<dyn DeviceMemory>,
    ptr: DevicePtr,
    elements: usize,
}

impl DeviceAllocation {
    fn release(self) {
        check(self.memory.free(self.ptr), "free_device", self.memory.name());
    }
}

impl Tensor {
    /// Allocate device memory on the process-wide device if not already allocated
    pub fn allocate_device(&self) -> DevicePtr {
        self.allocate_device_on(current_device())
    }

    /// Allocate device memory on `memory` if not already allocated.
    ///
    /// An existing allocation is kept even if it lives on another device.
    pub fn allocate_device_on(&self, memory: Arc<dyn DeviceMemory>) -> DevicePtr {
        let mut slot = self.0.device.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.ptr;
        }

        let elements = self.numel();
        let ptr = check(memory.allocate(elements), "allocate_device", memory.name());
        tracing::debug!(tensor = %self.id(), device = memory.name(), %ptr, elements, "device buffer allocated");
        *slot = Some(DeviceAllocation { memory, ptr, elements });
        ptr
    }

    /// Upload the host buffer, allocating on first use
    pub fn copy_to_device(&self) {
        self.allocate_device();
        let slot = self.0.device.lock();
        if let Some(alloc) = slot.as_ref() {
            let data = self.data();
            check(alloc.memory.copy_to_device(alloc.ptr, &data), "copy_to_device", alloc.memory.name());
        }
    }

    /// Download the device buffer into the host buffer
    pub fn copy_to_host(&self) {
        let slot = self.0.device.lock();
        let alloc = match slot.as_ref() {
            Some(alloc) => alloc,
            None => panic!("contract violation: copy_to_host on tensor {} without a device buffer", self.id()),
        };
        let mut data = self.data_mut();
        assert_eq!(
            data.len(),
            alloc.elements,
            "contract violation: tensor {} was resized after its device buffer was allocated",
            self.id()
        );
        check(alloc.memory.copy_to_host(alloc.ptr, &mut data), "copy_to_host", alloc.memory.name());
    }

    /// Release the device buffer; no-op when none is allocated
    pub fn free_device(&self) {
        let released = self.0.device.lock().take();
        if let Some(alloc) = released {
            tracing::debug!(tensor = %self.id(), ptr = %alloc.ptr, "device buffer freed");
            alloc.release();
        }
    }

    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.0.device.lock().as_ref().map(|alloc| alloc.ptr)
    }
}

impl Drop for TensorNode {
    fn drop(&mut self) {
        if let Some(alloc) = self.device.get_mut().take() {
            alloc.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::HostMirrorDevice;

    #[test]
    fn test_allocation_is_lazy_and_idempotent() {
        let device = Arc::new(HostMirrorDevice::new());
        let t = Tensor::ones([4], false);
        assert_eq!(t.device_ptr(), None);

        let first = t.allocate_device_on(device.clone());
        let second = t.allocate_device_on(device.clone());
        assert_eq!(first, second);
        assert_eq!(t.device_ptr(), Some(first));
        assert_eq!(device.live_allocations(), 1);
    }

    #[test]
    fn test_copy_round_trip() {
        let device = Arc::new(HostMirrorDevice::new());
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0], [3], false).unwrap();
        t.allocate_device_on(device.clone());
        t.copy_to_device();

        t.data_mut().iter_mut().for_each(|v| *v = 0.0);
        t.copy_to_host();
        assert_eq!(t.to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_free_and_drop_release_memory() {
        let device = Arc::new(HostMirrorDevice::new());

        let a = Tensor::zeros([2, 2], false);
        a.allocate_device_on(device.clone());
        a.free_device();
        a.free_device();
        assert_eq!(a.device_ptr(), None);
        assert_eq!(device.live_allocations(), 0);

        let b = Tensor::zeros([8], false);
        b.allocate_device_on(device.clone());
        assert_eq!(device.live_allocations(), 1);
        drop(b);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    #[should_panic(expected = "without a device buffer")]
    fn test_copy_to_host_requires_allocation() {
        Tensor::zeros([2], false).copy_to_host();
    }
}
