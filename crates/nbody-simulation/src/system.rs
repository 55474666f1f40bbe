//! The body system: authoritative simulation state across devices
//!
//! Owns the body storage (and optional interop binding), drives the
//! integrator over every device partition and flips the position double
//! buffer after each step.

use crate::backend::region::RegionRead;
use crate::backend::{BufferView, ComputeBackend, DeviceId, MapFlags, SharedBuffer};
use crate::error::{Result, SimulationError};
use crate::integrator::{IntegrationJob, Integrator};
use crate::interop::InteropBinding;
use crate::loader::BodyFileReader;
use crate::memory::{select_devices, BodyArray, BodyStorage, DevicePartition, MemoryMode};
use crate::params::SimulationConfig;
use crate::partition::partition_bodies;
use nbody_physics::{Scalar, COMPONENTS_PER_BODY, DEFAULT_DAMPING, DEFAULT_SOFTENING};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

/// Resources created together at initialization and released together
#[derive(Debug)]
struct Resources {
    storage: BodyStorage,
    interop: Option<InteropBinding>,
}

/// Host view of a body array returned by [`BodySystem::get_array`]
pub struct HostArray<'a, T> {
    inner: HostArrayInner<'a>,
    staging: &'a [T],
}

enum HostArrayInner<'a> {
    Staging,
    Pinned(RegionRead<'a>),
}

impl<T> HostArray<'_, T> {
    /// Whether this borrows device-visible pinned memory directly
    pub fn is_zero_copy(&self) -> bool {
        matches!(self.inner, HostArrayInner::Pinned(_))
    }
}

impl<T: Scalar> Deref for HostArray<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match &self.inner {
            HostArrayInner::Staging => self.staging,
            HostArrayInner::Pinned(region) => region.cast_prefix::<T>(),
        }
    }
}

/// N-body state spread over one or more devices of backend `B`
pub struct BodySystem<T: Scalar, B: ComputeBackend, I: Integrator<B, T>> {
    backend: Arc<B>,
    integrator: I,
    config: SimulationConfig,
    devices: Vec<DeviceId>,
    mode: MemoryMode,
    /// `None` after a failed re-initialization
    resources: Option<Resources>,
    damping: T,
    softening_squared: T,
    read_index: usize,
    host_positions: Vec<T>,
    host_velocities: Vec<T>,
}

impl<T: Scalar, B: ComputeBackend, I: Integrator<B, T>> BodySystem<T, B, I> {
    /// Partition, allocate and (optionally) attach interop for `config`.
    pub fn new(backend: Arc<B>, integrator: I, config: SimulationConfig) -> Result<Self> {
        if config.body_count == 0 {
            return Err(SimulationError::invalid_config("body count must be at least 1"));
        }
        if config.block_size == 0 {
            return Err(SimulationError::invalid_config("block size must be at least 1"));
        }

        let devices = select_devices(&config, backend.as_ref())?;
        let mode = MemoryMode::select(&config, backend.as_ref())?;

        log::info!(
            "Creating {} body system: {} bodies, {} precision, {:?} on {} device(s)",
            backend.name(),
            config.body_count,
            T::NAME,
            mode,
            devices.len()
        );

        let mut system = Self {
            backend,
            integrator,
            config,
            devices,
            mode,
            resources: None,
            damping: T::from_f64(f64::from(DEFAULT_DAMPING)),
            softening_squared: T::ZERO,
            read_index: 0,
            host_positions: Vec::new(),
            host_velocities: Vec::new(),
        };
        system.resources = Some(system.initialize()?);
        system.set_softening(T::from_f64(f64::from(DEFAULT_SOFTENING)))?;
        Ok(system)
    }

    fn initialize(&mut self) -> Result<Resources> {
        let backend = self.backend.as_ref();
        let body_count = self.config.body_count;

        let capabilities = self
            .devices
            .iter()
            .map(|device| backend.capabilities(*device))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let ranges = partition_bodies(&capabilities, body_count)?;
        let placements: Vec<_> = self.devices.iter().copied().zip(ranges).collect();

        for (device, range) in &placements {
            log::debug!("{}: bodies {}..{}", device, range.offset, range.end());
        }

        let storage = BodyStorage::allocate::<T, B>(
            backend,
            self.mode,
            &placements,
            body_count,
            self.config.use_interop,
        )?;

        let interop = if self.config.use_interop {
            match InteropBinding::attach::<T, B>(backend, self.devices[0], body_count) {
                Ok(binding) => Some(binding),
                Err(e) => {
                    if let Err(release) = storage.release(backend) {
                        log::warn!("Releasing storage after failed attach: {}", release);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let scalars = COMPONENTS_PER_BODY * body_count;
        if self.mode == MemoryMode::HostMapped {
            self.host_positions = Vec::new();
            self.host_velocities = Vec::new();
        } else {
            self.host_positions = vec![T::ZERO; scalars];
            self.host_velocities = vec![T::ZERO; scalars];
        }
        self.read_index = 0;

        Ok(Resources { storage, interop })
    }

    /// Release every device resource. The system is unusable afterwards until
    /// re-initialized.
    fn finalize(&mut self) -> Result<()> {
        let Some(resources) = self.resources.take() else {
            return Ok(());
        };
        let backend = self.backend.as_ref();

        let mut first_error = None;
        for device in &self.devices {
            if let Err(e) = backend.synchronize(*device) {
                log::warn!("{} failed before release: {}", device, e);
            }
        }
        if let Some(binding) = resources.interop {
            if let Err(e) = binding.release(backend) {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = resources.storage.release(backend) {
            first_error.get_or_insert(e);
        }

        self.host_positions = Vec::new();
        self.host_velocities = Vec::new();
        log::debug!("Body system finalized");

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn resources(&self) -> Result<&Resources> {
        self.resources.as_ref().ok_or(SimulationError::Unusable)
    }

    /// Advance every body by `delta_time` and swap the position buffers.
    ///
    /// With one device the work is only issued; with several the call waits
    /// for all of them before swapping.
    pub fn update(&mut self, delta_time: T) -> Result<()> {
        let resources = self.resources.as_ref().ok_or(SimulationError::Unusable)?;
        let backend = self.backend.as_ref();
        let read = self.read_index;
        let write = 1 - read;

        let mapped = match &resources.interop {
            Some(binding) => Some((
                binding.map(backend, read, MapFlags::ReadOnly)?,
                binding.map(backend, write, MapFlags::WriteDiscard)?,
            )),
            None => None,
        };

        let active = resources
            .storage
            .partitions()
            .iter()
            .filter(|partition| partition.count() > 0);

        for partition in active.clone() {
            let (read_positions, write_positions) = match &mapped {
                Some((read_map, write_map)) => (read_map.view(), write_map.view()),
                None => (position_view(partition, read)?, position_view(partition, write)?),
            };

            let job = IntegrationJob {
                device: partition.device,
                offset: partition.offset(),
                count: partition.count(),
                body_count: self.config.body_count,
                read_positions,
                write_positions,
                velocities: partition.velocity_view(),
                delta_time,
                damping: self.damping,
                softening_squared: self.softening_squared,
                block_size: self.config.block_size,
                uses_shared_buffer: mapped.is_some(),
            };
            self.integrator.integrate(backend, &job)?;

            if let Some(event) = partition.event() {
                backend.record_event(event)?;
            }
        }

        if let Some((read_map, write_map)) = mapped {
            read_map.unmap()?;
            write_map.unmap()?;
        }

        if resources.storage.partitions().len() > 1 {
            for event in active.filter_map(DevicePartition::event) {
                backend.synchronize_event(event)?;
            }
        }

        self.read_index = write;
        Ok(())
    }

    /// Blocking snapshot of `array` (`4 * body_count` scalars).
    ///
    /// Positions come from the current read buffer. In host-mapped mode the
    /// returned slice is the pinned memory itself.
    pub fn get_array(&mut self, array: BodyArray) -> Result<HostArray<'_, T>> {
        let resources = self.resources.as_ref().ok_or(SimulationError::Unusable)?;
        let backend = self.backend.as_ref();
        let read = self.read_index;

        for device in &self.devices {
            backend.synchronize(*device)?;
        }

        if resources.storage.mode() == MemoryMode::HostMapped {
            let pinned = resources
                .storage
                .pinned(array, slot_of(array, read))
                .ok_or(SimulationError::Unusable)?;
            return Ok(HostArray {
                inner: HostArrayInner::Pinned(pinned.region().read()),
                staging: &[],
            });
        }

        let primary = resources.storage.primary().ok_or(SimulationError::Unusable)?;
        let staging = match array {
            BodyArray::Position => &mut self.host_positions,
            BodyArray::Velocity => &mut self.host_velocities,
        };
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(staging.as_mut_slice());

        match (array, &resources.interop) {
            (BodyArray::Position, Some(binding)) => binding.read(backend, read, bytes)?,
            (BodyArray::Position, None) => {
                backend.copy_to_host(position_view(primary, read)?, bytes)?
            }
            (BodyArray::Velocity, _) => backend.copy_to_host(primary.velocity_view(), bytes)?,
        }

        Ok(HostArray {
            inner: HostArrayInner::Staging,
            staging: staging.as_slice(),
        })
    }

    /// Overwrite `array` from `data` (`4 * body_count` scalars).
    ///
    /// Resets the double buffer so that slot 0 is the read buffer and writes
    /// positions there.
    pub fn set_array(&mut self, array: BodyArray, data: &[T]) -> Result<()> {
        let expected = COMPONENTS_PER_BODY * self.config.body_count;
        if self.resources.is_none() {
            return Err(SimulationError::Unusable);
        }
        if data.len() != expected {
            return Err(SimulationError::BodyCountMismatch {
                expected,
                actual: data.len(),
            });
        }

        self.read_index = 0;
        let read = self.read_index;
        let backend = self.backend.as_ref();
        let bytes: &[u8] = bytemuck::cast_slice(data);

        for device in &self.devices {
            backend.synchronize(*device)?;
        }

        let resources = self.resources.as_mut().ok_or(SimulationError::Unusable)?;
        if resources.storage.mode() == MemoryMode::HostMapped {
            let pinned = resources
                .storage
                .pinned(array, slot_of(array, read))
                .ok_or(SimulationError::Unusable)?;
            pinned.region().write().copy_from_slice(bytes);
            return Ok(());
        }

        let primary = resources.storage.primary().ok_or(SimulationError::Unusable)?;
        match (array, &mut resources.interop) {
            (BodyArray::Position, Some(binding)) => binding.write(backend, read, bytes)?,
            (BodyArray::Position, None) => {
                backend.copy_to_device(position_view(primary, read)?, 0, bytes)?
            }
            (BodyArray::Velocity, _) => backend.copy_to_device(primary.velocity_view(), 0, bytes)?,
        }
        Ok(())
    }

    /// Replace the whole system with bodies read from `path`.
    ///
    /// The file is read and checked before anything is released. If
    /// re-initialization fails the system stays unusable.
    pub fn load_state<R: BodyFileReader<T> + ?Sized>(&mut self, reader: &R, path: &Path) -> Result<()> {
        self.resources()?;

        let data = reader.read(path)?;
        let expected = COMPONENTS_PER_BODY * data.body_count;
        if data.body_count == 0 {
            return Err(SimulationError::Load(format!("{} holds no bodies", path.display())));
        }
        for actual in [data.positions.len(), data.velocities.len()] {
            if actual != expected {
                return Err(SimulationError::BodyCountMismatch { expected, actual });
            }
        }

        log::info!("Loading {} bodies from {}", data.body_count, path.display());

        if let Err(e) = self.finalize() {
            log::warn!("Finalize before reload reported: {}", e);
        }
        self.config.body_count = data.body_count;
        self.resources = Some(self.initialize()?);

        for device in self.devices.clone() {
            self.integrator
                .set_softening_squared(self.backend.as_ref(), device, self.softening_squared)?;
        }

        self.set_array(BodyArray::Position, &data.positions)?;
        self.set_array(BodyArray::Velocity, &data.velocities)?;
        Ok(())
    }

    /// Set the softening length; the kernel uses its square.
    pub fn set_softening(&mut self, softening: T) -> Result<()> {
        self.resources()?;
        self.softening_squared = softening * softening;
        for device in &self.devices {
            self.integrator
                .set_softening_squared(self.backend.as_ref(), *device, self.softening_squared)?;
        }
        Ok(())
    }

    /// Set the per-step velocity damping factor.
    pub fn set_damping(&mut self, damping: T) -> Result<()> {
        self.resources()?;
        self.damping = damping;
        Ok(())
    }

    pub fn body_count(&self) -> usize {
        self.config.body_count
    }

    pub fn damping(&self) -> T {
        self.damping
    }

    pub fn softening_squared(&self) -> T {
        self.softening_squared
    }

    /// Position slot the next update reads from (and the renderer draws)
    pub fn read_index(&self) -> usize {
        self.read_index
    }

    pub fn write_index(&self) -> usize {
        1 - self.read_index
    }

    pub fn memory_mode(&self) -> MemoryMode {
        self.mode
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Devices in partition order, primary first
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn is_usable(&self) -> bool {
        self.resources.is_some()
    }

    pub fn partitions(&self) -> Result<&[DevicePartition]> {
        Ok(self.resources()?.storage.partitions())
    }

    /// Device view of the current read buffer, `None` when positions live in
    /// shared graphics buffers
    pub fn current_read_buffer(&self) -> Result<Option<BufferView>> {
        let primary = self
            .resources()?
            .storage
            .primary()
            .ok_or(SimulationError::Unusable)?;
        Ok(primary.position_view(self.read_index))
    }

    /// Shared buffer holding the current read positions, for the renderer
    pub fn shared_position_buffer(&self) -> Result<Option<&SharedBuffer>> {
        Ok(self
            .resources()?
            .interop
            .as_ref()
            .and_then(|binding| binding.shared_buffer(self.read_index)))
    }

    pub fn interop(&self) -> Result<Option<&InteropBinding>> {
        Ok(self.resources()?.interop.as_ref())
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn integrator(&self) -> &I {
        &self.integrator
    }
}

impl<T: Scalar, B: ComputeBackend, I: Integrator<B, T>> Drop for BodySystem<T, B, I> {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            log::error!("Failed to release body system: {}", e);
        }
    }
}

fn position_view(partition: &DevicePartition, slot: usize) -> Result<BufferView> {
    partition.position_view(slot).ok_or_else(|| {
        SimulationError::invalid_config(format!("{} has no position storage", partition.device))
    })
}

/// Storage slot of `array` when positions are read from `read`
fn slot_of(array: BodyArray, read: usize) -> usize {
    match array {
        BodyArray::Position => read,
        BodyArray::Velocity => 0,
    }
}
