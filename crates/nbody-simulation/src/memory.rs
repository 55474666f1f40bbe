//! Body storage for the three memory modes
//!
//! Positions are double buffered (two slots), velocities are single. Which
//! allocation actually owns the bytes depends on the mode:
//!
//! - `DeviceOnly`: three private allocations on the primary device.
//! - `PeerToPeer`: the same three allocations, with every other device
//!   holding non-owning aliases after peer access to the primary is enabled.
//! - `HostMapped`: three pinned host allocations that every device views
//!   directly.
//!
//! When positions live in shared graphics buffers (see [`crate::interop`]) no
//! position storage is allocated here at all.

use crate::backend::{
    BufferView, ComputeBackend, DeviceBuffer, DeviceId, Event, PinnedBuffer,
};
use crate::error::{DeviceError, Result, SimulationError};
use crate::params::SimulationConfig;
use crate::partition::BodyRange;
use nbody_physics::{body_array_bytes, Scalar};

/// Where body state lives for the lifetime of a body system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    DeviceOnly,
    HostMapped,
    PeerToPeer,
}

/// Per-body array selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyArray {
    Position,
    Velocity,
}

impl MemoryMode {
    /// Pick the mode for `config`, checking that the backend can provide it.
    pub fn select<B: ComputeBackend + ?Sized>(config: &SimulationConfig, backend: &B) -> Result<Self> {
        if config.use_host_mapped {
            if config.use_interop {
                return Err(SimulationError::capability_mismatch(
                    "graphics interop cannot be combined with host-mapped memory",
                ));
            }
            if !backend.supports_mapped_host_memory() {
                return Err(SimulationError::capability_mismatch(format!(
                    "{} backend cannot map host memory",
                    backend.name()
                )));
            }
            return Ok(Self::HostMapped);
        }

        if config.device_count > 1 {
            if config.use_interop {
                return Err(SimulationError::capability_mismatch(
                    "graphics interop requires a single device",
                ));
            }
            if !config.use_peer_to_peer {
                return Err(SimulationError::capability_mismatch(
                    "multiple devices need host-mapped or peer-to-peer memory",
                ));
            }
            return Ok(Self::PeerToPeer);
        }

        Ok(Self::DeviceOnly)
    }
}

/// Devices a body system runs on: the primary first, then the next available
/// ones in id order.
pub fn select_devices<B: ComputeBackend + ?Sized>(
    config: &SimulationConfig,
    backend: &B,
) -> Result<Vec<DeviceId>> {
    if config.device_count == 0 {
        return Err(SimulationError::invalid_config("device count must be at least 1"));
    }

    let available = backend.device_count();
    if config.primary_device >= available {
        return Err(SimulationError::capability_mismatch(format!(
            "primary device {} not present ({} available)",
            config.primary_device, available
        )));
    }
    if config.device_count > available {
        return Err(SimulationError::capability_mismatch(format!(
            "{} devices requested, {} available",
            config.device_count, available
        )));
    }

    let primary = DeviceId(config.primary_device);
    let devices = std::iter::once(primary)
        .chain((0..available).map(DeviceId).filter(|id| *id != primary))
        .take(config.device_count as usize)
        .collect();
    Ok(devices)
}

/// A device's slice of the bodies and its views of the body arrays
#[derive(Debug)]
pub struct DevicePartition {
    pub device: DeviceId,
    pub range: BodyRange,
    /// `None` when positions live in shared graphics buffers
    positions: Option<[BufferView; 2]>,
    velocity: BufferView,
    event: Option<Event>,
}

impl DevicePartition {
    pub fn offset(&self) -> usize {
        self.range.offset
    }

    pub fn count(&self) -> usize {
        self.range.count
    }

    pub fn position_view(&self, slot: usize) -> Option<BufferView> {
        self.positions.map(|views| views[slot])
    }

    pub fn velocity_view(&self) -> BufferView {
        self.velocity
    }

    pub fn event(&self) -> Option<&Event> {
        self.event.as_ref()
    }
}

/// All body memory of a body system and the partitions viewing it
#[derive(Debug)]
pub struct BodyStorage {
    mode: MemoryMode,
    body_count: usize,
    partitions: Vec<DevicePartition>,
    device_positions: [Option<DeviceBuffer>; 2],
    device_velocity: Option<DeviceBuffer>,
    pinned_positions: [Option<PinnedBuffer>; 2],
    pinned_velocity: Option<PinnedBuffer>,
}

impl BodyStorage {
    /// Allocate storage for `body_count` bodies of `T` split over `placements`.
    ///
    /// The first placement is the primary device. With `shared_positions` the
    /// position arrays are left to the interop binding. On failure everything
    /// allocated so far is released again.
    pub fn allocate<T: Scalar, B: ComputeBackend + ?Sized>(
        backend: &B,
        mode: MemoryMode,
        placements: &[(DeviceId, BodyRange)],
        body_count: usize,
        shared_positions: bool,
    ) -> Result<Self> {
        let mut storage = Self {
            mode,
            body_count,
            partitions: Vec::with_capacity(placements.len()),
            device_positions: [None, None],
            device_velocity: None,
            pinned_positions: [None, None],
            pinned_velocity: None,
        };

        let bytes = body_array_bytes::<T>(body_count);
        match storage.populate(backend, placements, bytes, shared_positions) {
            Ok(()) => {
                log::info!(
                    "Allocated {:?} storage: {} bodies, {} bytes per array, {} device(s)",
                    mode,
                    body_count,
                    bytes,
                    placements.len()
                );
                Ok(storage)
            }
            Err(e) => {
                if let Err(release) = storage.release(backend) {
                    log::warn!("Releasing partial storage failed: {}", release);
                }
                Err(e)
            }
        }
    }

    fn populate<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &B,
        placements: &[(DeviceId, BodyRange)],
        bytes: usize,
        shared_positions: bool,
    ) -> Result<()> {
        let &(primary, _) = placements
            .first()
            .ok_or_else(|| SimulationError::invalid_config("no devices to allocate on"))?;

        match self.mode {
            MemoryMode::DeviceOnly | MemoryMode::PeerToPeer => {
                if !shared_positions {
                    for slot in &mut self.device_positions {
                        *slot = Some(backend.allocate(primary, bytes).map_err(SimulationError::Allocation)?);
                    }
                }
                let velocity = backend.allocate(primary, bytes).map_err(SimulationError::Allocation)?;
                let velocity = self.device_velocity.insert(velocity);

                for &(device, range) in placements {
                    if device != primary {
                        enable_peer_access(backend, device, primary)?;
                    }
                    let positions = match &self.device_positions {
                        [Some(a), Some(b)] => Some([a.alias(device), b.alias(device)]),
                        _ => None,
                    };
                    let event = backend.create_event(device).map_err(SimulationError::Allocation)?;
                    self.partitions.push(DevicePartition {
                        device,
                        range,
                        positions,
                        velocity: velocity.alias(device),
                        event: Some(event),
                    });
                }
            }
            MemoryMode::HostMapped => {
                for slot in &mut self.pinned_positions {
                    *slot = Some(backend.allocate_pinned(bytes).map_err(SimulationError::Allocation)?);
                }
                let velocity = backend.allocate_pinned(bytes).map_err(SimulationError::Allocation)?;
                self.pinned_velocity = Some(velocity);

                for &(device, range) in placements {
                    let partition = self.host_mapped_partition(backend, device, range)?;
                    self.partitions.push(partition);
                }
            }
        }
        Ok(())
    }

    fn host_mapped_partition<B: ComputeBackend + ?Sized>(
        &self,
        backend: &B,
        device: DeviceId,
        range: BodyRange,
    ) -> Result<DevicePartition> {
        let view = |buffer: &Option<PinnedBuffer>| -> Result<BufferView> {
            let buffer = buffer
                .as_ref()
                .ok_or_else(|| SimulationError::invalid_config("pinned storage missing"))?;
            backend
                .pinned_device_view(device, buffer)
                .map_err(SimulationError::Allocation)
        };

        let positions = [view(&self.pinned_positions[0])?, view(&self.pinned_positions[1])?];
        let velocity = view(&self.pinned_velocity)?;
        let event = backend.create_event(device).map_err(SimulationError::Allocation)?;
        Ok(DevicePartition {
            device,
            range,
            positions: Some(positions),
            velocity,
            event: Some(event),
        })
    }

    /// Release every owned allocation and completion signal.
    ///
    /// Views are dropped without being freed. Keeps going after a failure and
    /// reports the first one.
    pub fn release<B: ComputeBackend + ?Sized>(self, backend: &B) -> std::result::Result<(), DeviceError> {
        let mut first_error = None;
        let mut record = |result: std::result::Result<(), DeviceError>| {
            if let Err(e) = result {
                log::warn!("Release failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        for partition in self.partitions {
            if let Some(event) = partition.event {
                record(backend.destroy_event(event));
            }
        }

        for buffer in self.device_positions.into_iter().flatten() {
            record(backend.free(buffer));
        }
        if let Some(buffer) = self.device_velocity {
            record(backend.free(buffer));
        }

        for buffer in self.pinned_positions.into_iter().flatten() {
            record(backend.free_pinned(buffer));
        }
        if let Some(buffer) = self.pinned_velocity {
            record(backend.free_pinned(buffer));
        }

        log::debug!("Released {:?} storage", self.mode);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    pub fn body_count(&self) -> usize {
        self.body_count
    }

    pub fn partitions(&self) -> &[DevicePartition] {
        &self.partitions
    }

    /// Partition of the primary device, which holds the authoritative copy
    pub fn primary(&self) -> Option<&DevicePartition> {
        self.partitions.first()
    }

    /// Pinned memory behind an array (host-mapped mode only)
    pub fn pinned(&self, array: BodyArray, slot: usize) -> Option<&PinnedBuffer> {
        match array {
            BodyArray::Position => self.pinned_positions.get(slot)?.as_ref(),
            BodyArray::Velocity => self.pinned_velocity.as_ref(),
        }
    }
}

/// Enable `device` → `peer` access, treating "already enabled" as success.
pub fn enable_peer_access<B: ComputeBackend + ?Sized>(
    backend: &B,
    device: DeviceId,
    peer: DeviceId,
) -> Result<()> {
    match backend.enable_peer_access(device, peer) {
        Ok(()) => Ok(()),
        Err(e) if e.is_peer_access_already_enabled() => {
            log::debug!("Peer access {} -> {} already enabled", device, peer);
            Ok(())
        }
        Err(DeviceError::PeerAccessUnsupported { device, peer }) => Err(
            SimulationError::capability_mismatch(format!("{device} cannot access memory of {peer}")),
        ),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, HostBackendConfig};

    fn whole(device: u32, count: usize) -> (DeviceId, BodyRange) {
        (DeviceId(device), BodyRange { offset: 0, count })
    }

    fn halves(count: usize) -> Vec<(DeviceId, BodyRange)> {
        vec![
            (DeviceId(0), BodyRange { offset: 0, count: count / 2 }),
            (DeviceId(1), BodyRange { offset: count / 2, count: count - count / 2 }),
        ]
    }

    #[test]
    fn test_mode_selection() {
        let backend = HostBackend::new(HostBackendConfig::uniform(2)).unwrap();
        let mut config = SimulationConfig::default();
        assert_eq!(MemoryMode::select(&config, &backend).unwrap(), MemoryMode::DeviceOnly);

        config.device_count = 2;
        assert!(matches!(
            MemoryMode::select(&config, &backend),
            Err(SimulationError::DeviceCapabilityMismatch(_))
        ));

        config.use_peer_to_peer = true;
        assert_eq!(MemoryMode::select(&config, &backend).unwrap(), MemoryMode::PeerToPeer);

        config.use_host_mapped = true;
        assert_eq!(MemoryMode::select(&config, &backend).unwrap(), MemoryMode::HostMapped);

        config.use_interop = true;
        assert!(MemoryMode::select(&config, &backend).is_err());
    }

    #[test]
    fn test_primary_device_comes_first() {
        let backend = HostBackend::new(HostBackendConfig::uniform(4)).unwrap();
        let config = SimulationConfig {
            device_count: 3,
            primary_device: 2,
            ..SimulationConfig::default()
        };
        assert_eq!(
            select_devices(&config, &backend).unwrap(),
            vec![DeviceId(2), DeviceId(0), DeviceId(1)]
        );

        let too_many = SimulationConfig {
            device_count: 5,
            ..SimulationConfig::default()
        };
        assert!(select_devices(&too_many, &backend).is_err());
    }

    #[test]
    fn test_device_only_allocates_three_arrays() {
        let backend = HostBackend::new(HostBackendConfig::default()).unwrap();
        let storage =
            BodyStorage::allocate::<f32, _>(&backend, MemoryMode::DeviceOnly, &[whole(0, 64)], 64, false)
                .unwrap();
        assert_eq!(backend.live_allocations(), 3);
        assert_eq!(backend.device_usage(DeviceId(0)), 3 * 64 * 16);
        assert!(storage.primary().unwrap().position_view(1).is_some());

        storage.release(&backend).unwrap();
        assert_eq!(backend.live_allocations(), 0);
        assert_eq!(backend.live_events(), 0);
    }

    #[test]
    fn test_shared_positions_skip_position_allocations() {
        let backend = HostBackend::new(HostBackendConfig::default()).unwrap();
        let storage =
            BodyStorage::allocate::<f64, _>(&backend, MemoryMode::DeviceOnly, &[whole(0, 8)], 8, true)
                .unwrap();
        assert_eq!(backend.live_allocations(), 1);
        assert!(storage.primary().unwrap().position_view(0).is_none());
        storage.release(&backend).unwrap();
    }

    #[test]
    fn test_peer_to_peer_aliases_primary_allocation() {
        let backend = HostBackend::new(HostBackendConfig::uniform(2)).unwrap();
        // Pre-enabled access must be tolerated
        backend.enable_peer_access(DeviceId(1), DeviceId(0)).unwrap();

        let storage =
            BodyStorage::allocate::<f32, _>(&backend, MemoryMode::PeerToPeer, &halves(512), 512, false)
                .unwrap();
        assert_eq!(backend.live_allocations(), 3);
        assert_eq!(backend.device_usage(DeviceId(1)), 0);

        let [primary, peer] = storage.partitions() else {
            panic!("expected two partitions");
        };
        assert_eq!(primary.velocity_view().buffer, peer.velocity_view().buffer);
        assert_eq!(peer.velocity_view().device, DeviceId(1));

        storage.release(&backend).unwrap();
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_enable_peer_access_twice_is_not_fatal() {
        let backend = HostBackend::new(HostBackendConfig::uniform(2)).unwrap();
        enable_peer_access(&backend, DeviceId(1), DeviceId(0)).unwrap();
        enable_peer_access(&backend, DeviceId(1), DeviceId(0)).unwrap();
    }

    #[test]
    fn test_peer_to_peer_without_topology_is_capability_mismatch() {
        let mut config = HostBackendConfig::uniform(2);
        config.peer_access = false;
        let backend = HostBackend::new(config).unwrap();

        let result =
            BodyStorage::allocate::<f32, _>(&backend, MemoryMode::PeerToPeer, &halves(512), 512, false);
        assert!(matches!(result, Err(SimulationError::DeviceCapabilityMismatch(_))));
        assert_eq!(backend.live_allocations(), 0);
        assert_eq!(backend.live_events(), 0);
    }

    #[test]
    fn test_host_mapped_storage_is_shared_by_all_devices() {
        let backend = HostBackend::new(HostBackendConfig::uniform(2)).unwrap();
        let storage =
            BodyStorage::allocate::<f32, _>(&backend, MemoryMode::HostMapped, &halves(256), 256, false)
                .unwrap();
        assert_eq!(backend.device_usage(DeviceId(0)), 0);

        let pinned = storage.pinned(BodyArray::Position, 1).unwrap();
        assert_eq!(pinned.bytes(), 256 * 16);
        assert!(pinned.region().read().iter().all(|b| *b == 0));
        assert!(storage.pinned(BodyArray::Velocity, 0).is_some());

        storage.release(&backend).unwrap();
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_failed_allocation_releases_partial_storage() {
        let mut config = HostBackendConfig::default();
        // Room for two arrays, not three
        config.device_memory = Some(2 * 128 * 16);
        let backend = HostBackend::new(config).unwrap();

        let result =
            BodyStorage::allocate::<f32, _>(&backend, MemoryMode::DeviceOnly, &[whole(0, 128)], 128, false);
        assert!(matches!(result, Err(SimulationError::Allocation(_))));
        assert_eq!(backend.live_allocations(), 0);
        assert_eq!(backend.device_usage(DeviceId(0)), 0);
    }
}
