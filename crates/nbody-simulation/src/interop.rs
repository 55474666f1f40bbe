//! Positions kept in renderer-owned vertex buffers
//!
//! The binding owns two shared buffers, one per position slot, registered with
//! the compute side. Compute only touches them through a [`MappedBuffer`]
//! guard; the renderer may read whichever slot is not currently mapped.

use crate::backend::{BufferView, ComputeBackend, DeviceId, GraphicsResource, MapFlags, SharedBuffer};
use crate::error::{DeviceError, Result, SimulationError};
use nbody_physics::{body_array_bytes, Scalar};

/// Shared position buffers bound to one device
#[derive(Debug)]
pub struct InteropBinding {
    device: DeviceId,
    buffers: Vec<SharedBuffer>,
    resources: Vec<GraphicsResource>,
    size_mismatches: usize,
}

impl InteropBinding {
    /// Create and register both position buffers for `body_count` bodies.
    ///
    /// A buffer that comes back smaller than asked for is logged and counted
    /// but does not fail the attach.
    pub fn attach<T: Scalar, B: ComputeBackend + ?Sized>(
        backend: &B,
        device: DeviceId,
        body_count: usize,
    ) -> Result<Self> {
        let mut binding = Self {
            device,
            buffers: Vec::with_capacity(2),
            resources: Vec::with_capacity(2),
            size_mismatches: 0,
        };

        let bytes = body_array_bytes::<T>(body_count);
        match binding.populate(backend, bytes) {
            Ok(()) => {
                log::info!("Attached shared position buffers ({} bytes each) to {}", bytes, device);
                Ok(binding)
            }
            Err(e) => {
                if let Err(release) = binding.release(backend) {
                    log::warn!("Releasing partial interop binding failed: {}", release);
                }
                Err(SimulationError::Allocation(e))
            }
        }
    }

    fn populate<B: ComputeBackend + ?Sized>(&mut self, backend: &B, bytes: usize) -> std::result::Result<(), DeviceError> {
        for _ in 0..2 {
            let buffer = backend.create_shared_buffer(bytes)?;
            let actual = backend.shared_buffer_size(&buffer);
            self.buffers.push(buffer);
            self.check_size(bytes, actual?);

            let resource = backend.register_shared_buffer(self.device, &self.buffers[self.buffers.len() - 1])?;
            self.resources.push(resource);
        }
        Ok(())
    }

    fn check_size(&mut self, expected: usize, actual: usize) {
        if actual < expected {
            log::warn!(
                "Shared buffer size mismatch: expected {} bytes, got {}",
                expected,
                actual
            );
            self.size_mismatches += 1;
        }
    }

    fn slot(&self, slot: usize) -> std::result::Result<&SharedBuffer, DeviceError> {
        self.buffers
            .get(slot)
            .ok_or_else(|| DeviceError::mapping(u64::MAX, format!("no position slot {slot}")))
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Shared buffer backing position slot `slot`
    pub fn shared_buffer(&self, slot: usize) -> Option<&SharedBuffer> {
        self.buffers.get(slot)
    }

    /// How many size mismatches have been detected so far
    pub fn size_mismatches(&self) -> usize {
        self.size_mismatches
    }

    /// Map slot `slot` for compute access until the guard is dropped
    pub fn map<'a, B: ComputeBackend + ?Sized>(
        &'a self,
        backend: &'a B,
        slot: usize,
        flags: MapFlags,
    ) -> std::result::Result<MappedBuffer<'a, B>, DeviceError> {
        let resource = self
            .resources
            .get(slot)
            .ok_or_else(|| DeviceError::mapping(u64::MAX, format!("no position slot {slot}")))?;
        let view = backend.map_resource(resource, flags)?;
        Ok(MappedBuffer {
            backend,
            resource,
            view,
            mapped: true,
        })
    }

    /// Copy slot `slot` to the host through a read-only mapping.
    ///
    /// Only the bytes the buffer actually holds are copied; the rest of `dst`
    /// is zeroed.
    pub fn read<B: ComputeBackend + ?Sized>(
        &self,
        backend: &B,
        slot: usize,
        dst: &mut [u8],
    ) -> std::result::Result<(), DeviceError> {
        let available = backend.shared_buffer_size(self.slot(slot)?)?;
        let (held, missing) = dst.split_at_mut(available.min(dst.len()));

        let mapped = self.map(backend, slot, MapFlags::ReadOnly)?;
        backend.copy_to_host(mapped.view(), held)?;
        missing.fill(0);
        mapped.unmap()
    }

    /// Renderer-side overwrite of slot `slot`
    pub fn write<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &B,
        slot: usize,
        data: &[u8],
    ) -> std::result::Result<(), DeviceError> {
        let actual = backend.shared_buffer_size(self.slot(slot)?)?;
        self.check_size(data.len(), actual);
        backend.update_shared_buffer(self.slot(slot)?, 0, data)
    }

    /// Unregister and delete both buffers
    pub fn release<B: ComputeBackend + ?Sized>(self, backend: &B) -> std::result::Result<(), DeviceError> {
        let mut first_error = None;
        for resource in self.resources {
            if let Err(e) = backend.unregister_resource(resource) {
                log::warn!("Unregistering shared buffer failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        for buffer in self.buffers {
            if let Err(e) = backend.delete_shared_buffer(buffer) {
                log::warn!("Deleting shared buffer failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Compute-side mapping of a shared buffer, unmapped on drop
pub struct MappedBuffer<'a, B: ComputeBackend + ?Sized> {
    backend: &'a B,
    resource: &'a GraphicsResource,
    view: BufferView,
    mapped: bool,
}

impl<B: ComputeBackend + ?Sized> MappedBuffer<'_, B> {
    pub fn view(&self) -> BufferView {
        self.view
    }

    /// Unmap now and report the result
    pub fn unmap(mut self) -> std::result::Result<(), DeviceError> {
        self.mapped = false;
        self.backend.unmap_resource(self.resource)
    }
}

impl<B: ComputeBackend + ?Sized> Drop for MappedBuffer<'_, B> {
    fn drop(&mut self) {
        if self.mapped {
            if let Err(e) = self.backend.unmap_resource(self.resource) {
                log::error!("Failed to unmap graphics resource {}: {}", self.resource.id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, HostBackendConfig};

    #[test]
    fn test_attach_and_release() {
        let backend = HostBackend::new(HostBackendConfig::default()).unwrap();
        let binding = InteropBinding::attach::<f32, _>(&backend, DeviceId(0), 32).unwrap();
        assert_eq!(binding.size_mismatches(), 0);
        assert_eq!(backend.live_resources(), 2);
        assert_eq!(backend.live_allocations(), 2);

        binding.release(&backend).unwrap();
        assert_eq!(backend.live_resources(), 0);
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_size_mismatch_is_recorded_not_fatal() {
        let mut config = HostBackendConfig::default();
        config.shared_buffer_limit = Some(64);
        let backend = HostBackend::new(config).unwrap();

        let mut binding = InteropBinding::attach::<f32, _>(&backend, DeviceId(0), 32).unwrap();
        assert_eq!(binding.size_mismatches(), 2);

        binding.write(&backend, 0, &[1u8; 32 * 16]).unwrap();
        assert_eq!(binding.size_mismatches(), 3);

        // Reads stop at the end of the short buffer
        let mut out = vec![9u8; 32 * 16];
        binding.read(&backend, 0, &mut out).unwrap();
        assert!(out[..64].iter().all(|b| *b == 1));
        assert!(out[64..].iter().all(|b| *b == 0));
        binding.release(&backend).unwrap();
    }

    #[test]
    fn test_guard_unmaps_on_drop() {
        let backend = HostBackend::new(HostBackendConfig::default()).unwrap();
        let binding = InteropBinding::attach::<f32, _>(&backend, DeviceId(0), 4).unwrap();

        {
            let mapped = binding.map(&backend, 1, MapFlags::WriteDiscard).unwrap();
            backend.copy_to_device(mapped.view(), 0, &[5u8; 64]).unwrap();
            assert!(binding.map(&backend, 1, MapFlags::ReadOnly).is_err());
        }

        let mut out = [0u8; 64];
        binding.read(&backend, 1, &mut out).unwrap();
        assert_eq!(out, [5u8; 64]);
        assert_eq!(
            backend
                .read_shared_buffer(binding.shared_buffer(1).unwrap().id())
                .unwrap(),
            vec![5u8; 64]
        );
        binding.release(&backend).unwrap();
    }
}
