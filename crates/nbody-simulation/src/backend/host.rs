//! Host-emulated compute backend
//!
//! Each device is a worker thread draining an in-order command queue, which
//! gives the same asynchronous, per-device stream semantics as real hardware.
//! Memory is plain host memory, but access is checked the way a driver would:
//! a device may only touch its own allocations, pinned memory it holds a view
//! of, peer memory once peer access is enabled, and graphics buffers while they
//! are mapped.
//!
//! A failed command poisons its stream. The error is reported by the next
//! synchronization and every later submission on that device.

use super::region::HostRegion;
use super::{
    BufferId, BufferView, ComputeBackend, DeviceBuffer, DeviceCapabilities, DeviceId, Event,
    GraphicsResource, MapFlags, PinnedBuffer, SharedBuffer, SharedBufferId,
};
use crate::error::DeviceError;
use crate::integrator::{IntegrationJob, Integrator};
use nbody_physics::{integrate_range, Scalar, StepParams, Vec4};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

const BACKEND_NAME: &str = "host";

/// Shape of the emulated machine
#[derive(Debug, Clone)]
pub struct HostBackendConfig {
    /// One entry per device, in device order
    pub devices: Vec<DeviceCapabilities>,
    /// Devices can be granted access to each other's memory
    pub peer_access: bool,
    /// Devices can address pinned host memory
    pub mapped_host_memory: bool,
    /// Per-device memory budget in bytes
    pub device_memory: Option<usize>,
    /// Graphics driver silently caps shared buffers at this size
    pub shared_buffer_limit: Option<usize>,
}

impl Default for HostBackendConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceCapabilities {
                compute_units: 16,
                weight_class: 7,
            }],
            peer_access: true,
            mapped_host_memory: true,
            device_memory: None,
            shared_buffer_limit: None,
        }
    }
}

impl HostBackendConfig {
    /// `count` identical devices
    pub fn uniform(count: usize) -> Self {
        let mut config = Self::default();
        config.devices = vec![config.devices[0]; count];
        config
    }
}

type Command = Box<dyn FnOnce() -> Result<(), DeviceError> + Send>;

#[derive(Debug, Default)]
struct StreamProgress {
    submitted: u64,
    completed: u64,
    error: Option<DeviceError>,
}

#[derive(Debug, Default)]
struct StreamShared {
    progress: Mutex<StreamProgress>,
    idle: Condvar,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        format!("panicked: {reason}")
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        format!("panicked: {reason}")
    } else {
        "panicked".to_string()
    }
}

/// In-order command queue of one device
struct Stream {
    device: DeviceId,
    shared: Arc<StreamShared>,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    fn spawn(device: DeviceId) -> Result<Self, DeviceError> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let shared = Arc::new(StreamShared::default());
        let worker_shared = Arc::clone(&shared);

        let worker = std::thread::Builder::new()
            .name(format!("nbody-device-{}", device.0))
            .spawn(move || {
                while let Ok(command) = receiver.recv() {
                    let poisoned = worker_shared.lock().error.is_some();
                    let result = if poisoned {
                        Ok(())
                    } else {
                        // A panicking command fails the stream instead of the worker
                        panic::catch_unwind(AssertUnwindSafe(command)).unwrap_or_else(|payload| {
                            Err(DeviceError::kernel_failed(device, panic_reason(payload.as_ref())))
                        })
                    };

                    let mut progress = worker_shared.lock();
                    if let Err(error) = result {
                        log::error!("{} stream failed: {}", device, error);
                        progress.error.get_or_insert(error);
                    }
                    progress.completed += 1;
                    worker_shared.idle.notify_all();
                }
            })
            .map_err(|e| DeviceError::Lost(format!("failed to start {device}: {e}")))?;

        Ok(Self {
            device,
            shared,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queue a command, returning its ticket
    fn submit(&self, command: Command) -> Result<u64, DeviceError> {
        let mut progress = self.shared.lock();
        if let Some(error) = &progress.error {
            return Err(error.clone());
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| DeviceError::Lost(format!("{} stream closed", self.device)))?;
        sender
            .send(command)
            .map_err(|_| DeviceError::Lost(format!("{} worker exited", self.device)))?;
        progress.submitted += 1;
        Ok(progress.submitted)
    }

    fn latest_ticket(&self) -> u64 {
        self.shared.lock().submitted
    }

    fn wait_for(&self, ticket: u64) -> Result<(), DeviceError> {
        let mut progress = self.shared.lock();
        while progress.completed < ticket {
            progress = self
                .shared
                .idle
                .wait(progress)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &progress.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        let ticket = self.latest_ticket();
        self.wait_for(ticket)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once the queue drains
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{} worker panicked", self.device);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Device(DeviceId),
    Host,
    Graphics,
}

#[derive(Debug)]
struct Allocation {
    owner: Owner,
    region: Arc<HostRegion>,
}

#[derive(Debug)]
struct ResourceEntry {
    device: DeviceId,
    buffer: SharedBufferId,
    mapped: Option<MapFlags>,
}

#[derive(Debug, Default)]
struct HostState {
    allocations: HashMap<BufferId, Allocation>,
    pinned_views: HashSet<(DeviceId, BufferId)>,
    peers: HashSet<(DeviceId, DeviceId)>,
    resources: HashMap<u64, ResourceEntry>,
    events: HashMap<u64, (DeviceId, u64)>,
    device_usage: HashMap<DeviceId, usize>,
    fail_next_allocation: bool,
    kernel_faults: HashSet<DeviceId>,
}

impl HostState {
    /// Resolve a view to its memory, enforcing the access rules
    fn resolve(&self, view: BufferView) -> Result<Arc<HostRegion>, DeviceError> {
        let allocation = self
            .allocations
            .get(&view.buffer)
            .ok_or(DeviceError::InvalidBuffer(view.buffer))?;

        let accessible = match allocation.owner {
            Owner::Device(owner) => owner == view.device || self.peers.contains(&(view.device, owner)),
            Owner::Host => self.pinned_views.contains(&(view.device, view.buffer)),
            Owner::Graphics => self.resources.values().any(|resource| {
                resource.device == view.device
                    && resource.buffer.0 == view.buffer.0
                    && resource.mapped.is_some()
            }),
        };

        if accessible {
            Ok(Arc::clone(&allocation.region))
        } else {
            Err(DeviceError::AccessDenied {
                device: view.device,
                buffer: view.buffer,
            })
        }
    }

    fn resource_mut(&mut self, id: u64) -> Result<&mut ResourceEntry, DeviceError> {
        self.resources
            .get_mut(&id)
            .ok_or_else(|| DeviceError::mapping(id, "not registered"))
    }

    fn take_allocation_fault(&mut self, location: String, bytes: usize) -> Result<(), DeviceError> {
        if std::mem::take(&mut self.fail_next_allocation) {
            return Err(DeviceError::OutOfMemory { location, bytes });
        }
        Ok(())
    }
}

/// Compute backend emulating a multi-device machine on the host
pub struct HostBackend {
    config: HostBackendConfig,
    state: Mutex<HostState>,
    streams: Vec<Stream>,
    next_id: AtomicU64,
}

impl HostBackend {
    pub fn new(config: HostBackendConfig) -> Result<Self, DeviceError> {
        let streams = (0..config.devices.len() as u32)
            .map(|index| Stream::spawn(DeviceId(index)))
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "Host backend: {} device(s), peer access {}, mapped host memory {}",
            config.devices.len(),
            config.peer_access,
            config.mapped_host_memory
        );

        Ok(Self {
            config,
            state: Mutex::new(HostState::default()),
            streams,
            next_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn stream(&self, device: DeviceId) -> Result<&Stream, DeviceError> {
        self.streams
            .get(device.index())
            .ok_or(DeviceError::InvalidDevice(device))
    }

    fn synchronize_all(&self) -> Result<(), DeviceError> {
        self.streams.iter().try_for_each(Stream::synchronize)
    }

    /// Enqueue `kernel` on `device`'s stream with the memory behind `views`.
    ///
    /// Views are resolved (and access-checked) at launch time, so a kernel can
    /// keep using a graphics buffer even if it is unmapped before it runs.
    pub fn launch<F>(&self, device: DeviceId, views: &[BufferView], kernel: F) -> Result<(), DeviceError>
    where
        F: FnOnce(&[Arc<HostRegion>]) -> Result<(), DeviceError> + Send + 'static,
    {
        let stream = self.stream(device)?;

        let (regions, inject_fault) = {
            let mut state = self.lock();
            let regions = views
                .iter()
                .map(|view| {
                    if view.device != device {
                        return Err(DeviceError::AccessDenied {
                            device,
                            buffer: view.buffer,
                        });
                    }
                    state.resolve(*view)
                })
                .collect::<Result<Vec<_>, _>>()?;
            (regions, state.kernel_faults.remove(&device))
        };

        stream.submit(Box::new(move || {
            if inject_fault {
                return Err(DeviceError::kernel_failed(device, "injected fault"));
            }
            kernel(&regions)
        }))?;
        Ok(())
    }

    /// Make the next kernel launched on `device` fail
    pub fn fail_next_kernel(&self, device: DeviceId) {
        self.lock().kernel_faults.insert(device);
    }

    /// Make the next device or pinned allocation fail
    pub fn fail_next_allocation(&self) {
        self.lock().fail_next_allocation = true;
    }

    /// Renderer-side read of a shared buffer.
    ///
    /// Waits for outstanding compute work first and refuses while compute
    /// holds a mapping.
    pub fn read_shared_buffer(&self, id: SharedBufferId) -> Result<Vec<u8>, DeviceError> {
        self.synchronize_all()?;
        let state = self.lock();
        if let Some((resource, _)) = state
            .resources
            .iter()
            .find(|(_, r)| r.buffer == id && r.mapped.is_some())
        {
            return Err(DeviceError::mapping(*resource, "mapped by compute"));
        }
        let allocation = state
            .allocations
            .get(&BufferId(id.0))
            .ok_or(DeviceError::InvalidBuffer(BufferId(id.0)))?;
        let bytes = allocation.region.read().to_vec();
        Ok(bytes)
    }

    /// Live allocations of any kind (device, pinned, graphics)
    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    pub fn live_events(&self) -> usize {
        self.lock().events.len()
    }

    pub fn live_resources(&self) -> usize {
        self.lock().resources.len()
    }

    /// Bytes currently allocated on `device`
    pub fn device_usage(&self, device: DeviceId) -> usize {
        self.lock().device_usage.get(&device).copied().unwrap_or(0)
    }

    pub fn peer_access_enabled(&self, device: DeviceId, peer: DeviceId) -> bool {
        self.lock().peers.contains(&(device, peer))
    }

    pub fn is_mapped(&self, resource: &GraphicsResource) -> bool {
        self.lock()
            .resources
            .get(&resource.id())
            .is_some_and(|r| r.mapped.is_some())
    }

    fn check_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        if device.index() < self.config.devices.len() {
            Ok(())
        } else {
            Err(DeviceError::InvalidDevice(device))
        }
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn device_count(&self) -> u32 {
        self.config.devices.len() as u32
    }

    fn capabilities(&self, device: DeviceId) -> Result<DeviceCapabilities, DeviceError> {
        self.config
            .devices
            .get(device.index())
            .copied()
            .ok_or(DeviceError::InvalidDevice(device))
    }

    fn supports_mapped_host_memory(&self) -> bool {
        self.config.mapped_host_memory
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> bool {
        self.config.peer_access
            && device != peer
            && self.check_device(device).is_ok()
            && self.check_device(peer).is_ok()
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<(), DeviceError> {
        if !self.can_access_peer(device, peer) {
            return Err(DeviceError::PeerAccessUnsupported { device, peer });
        }
        if !self.lock().peers.insert((device, peer)) {
            return Err(DeviceError::PeerAccessAlreadyEnabled { device, peer });
        }
        log::debug!("Enabled peer access {} -> {}", device, peer);
        Ok(())
    }

    fn allocate(&self, device: DeviceId, bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        self.check_device(device)?;
        let mut state = self.lock();
        state.take_allocation_fault(device.to_string(), bytes)?;

        let used = state.device_usage.get(&device).copied().unwrap_or(0);
        if let Some(budget) = self.config.device_memory {
            if used + bytes > budget {
                return Err(DeviceError::OutOfMemory {
                    location: device.to_string(),
                    bytes,
                });
            }
        }

        let id = BufferId(self.next_id());
        state.allocations.insert(
            id,
            Allocation {
                owner: Owner::Device(device),
                region: Arc::new(HostRegion::zeroed(bytes)),
            },
        );
        state.device_usage.insert(device, used + bytes);
        Ok(DeviceBuffer::new(id, device, bytes))
    }

    fn free(&self, buffer: DeviceBuffer) -> Result<(), DeviceError> {
        let mut state = self.lock();
        match state.allocations.get(&buffer.id()) {
            Some(allocation) if allocation.owner == Owner::Device(buffer.device()) => {}
            _ => return Err(DeviceError::InvalidBuffer(buffer.id())),
        }
        state.allocations.remove(&buffer.id());
        if let Some(used) = state.device_usage.get_mut(&buffer.device()) {
            *used = used.saturating_sub(buffer.bytes());
        }
        Ok(())
    }

    fn allocate_pinned(&self, bytes: usize) -> Result<PinnedBuffer, DeviceError> {
        if !self.config.mapped_host_memory {
            return Err(DeviceError::Unsupported {
                backend: BACKEND_NAME,
                operation: "mapped host memory",
            });
        }
        let mut state = self.lock();
        state.take_allocation_fault("pinned host memory".to_string(), bytes)?;

        let id = BufferId(self.next_id());
        let region = Arc::new(HostRegion::zeroed(bytes));
        state.allocations.insert(
            id,
            Allocation {
                owner: Owner::Host,
                region: Arc::clone(&region),
            },
        );
        Ok(PinnedBuffer::new(id, region))
    }

    fn free_pinned(&self, buffer: PinnedBuffer) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.allocations.remove(&buffer.id()).is_none() {
            return Err(DeviceError::InvalidBuffer(buffer.id()));
        }
        state.pinned_views.retain(|(_, id)| *id != buffer.id());
        Ok(())
    }

    fn pinned_device_view(
        &self,
        device: DeviceId,
        buffer: &PinnedBuffer,
    ) -> Result<BufferView, DeviceError> {
        self.check_device(device)?;
        let mut state = self.lock();
        match state.allocations.get(&buffer.id()) {
            Some(allocation) if allocation.owner == Owner::Host => {}
            _ => return Err(DeviceError::InvalidBuffer(buffer.id())),
        }
        state.pinned_views.insert((device, buffer.id()));
        Ok(BufferView {
            device,
            buffer: buffer.id(),
        })
    }

    fn copy_to_device(&self, dst: BufferView, offset: usize, src: &[u8]) -> Result<(), DeviceError> {
        self.stream(dst.device)?.synchronize()?;
        let region = self.lock().resolve(dst)?;

        let mut bytes = region.write();
        let capacity = bytes.len();
        let target = bytes
            .get_mut(offset..offset + src.len())
            .ok_or(DeviceError::OutOfBounds {
                offset,
                len: src.len(),
                capacity,
            })?;
        target.copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host(&self, src: BufferView, dst: &mut [u8]) -> Result<(), DeviceError> {
        self.stream(src.device)?.synchronize()?;
        let region = self.lock().resolve(src)?;

        let bytes = region.read();
        let source = bytes.get(..dst.len()).ok_or(DeviceError::OutOfBounds {
            offset: 0,
            len: dst.len(),
            capacity: bytes.len(),
        })?;
        dst.copy_from_slice(source);
        Ok(())
    }

    fn create_event(&self, device: DeviceId) -> Result<Event, DeviceError> {
        self.check_device(device)?;
        let id = self.next_id();
        self.lock().events.insert(id, (device, 0));
        Ok(Event::new(id, device))
    }

    fn record_event(&self, event: &Event) -> Result<(), DeviceError> {
        let ticket = self.stream(event.device())?.latest_ticket();
        let mut state = self.lock();
        let entry = state
            .events
            .get_mut(&event.id())
            .ok_or_else(|| DeviceError::Lost(format!("event {} destroyed", event.id())))?;
        entry.1 = ticket;
        Ok(())
    }

    fn synchronize_event(&self, event: &Event) -> Result<(), DeviceError> {
        let ticket = self
            .lock()
            .events
            .get(&event.id())
            .map(|(_, ticket)| *ticket)
            .ok_or_else(|| DeviceError::Lost(format!("event {} destroyed", event.id())))?;
        self.stream(event.device())?.wait_for(ticket)
    }

    fn destroy_event(&self, event: Event) -> Result<(), DeviceError> {
        self.lock()
            .events
            .remove(&event.id())
            .map(|_| ())
            .ok_or_else(|| DeviceError::Lost(format!("event {} destroyed twice", event.id())))
    }

    fn synchronize(&self, device: DeviceId) -> Result<(), DeviceError> {
        self.stream(device)?.synchronize()
    }

    fn create_shared_buffer(&self, bytes: usize) -> Result<SharedBuffer, DeviceError> {
        let actual = self
            .config
            .shared_buffer_limit
            .map_or(bytes, |limit| bytes.min(limit));

        let id = self.next_id();
        self.lock().allocations.insert(
            BufferId(id),
            Allocation {
                owner: Owner::Graphics,
                region: Arc::new(HostRegion::zeroed(actual)),
            },
        );
        Ok(SharedBuffer::new(SharedBufferId(id), bytes))
    }

    fn shared_buffer_size(&self, buffer: &SharedBuffer) -> Result<usize, DeviceError> {
        let id = BufferId(buffer.id().0);
        self.lock()
            .allocations
            .get(&id)
            .map(|allocation| allocation.region.len())
            .ok_or(DeviceError::InvalidBuffer(id))
    }

    fn update_shared_buffer(
        &self,
        buffer: &SharedBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        // Graphics commands are ordered after outstanding compute work
        self.synchronize_all()?;

        let state = self.lock();
        if let Some((resource, _)) = state
            .resources
            .iter()
            .find(|(_, r)| r.buffer == buffer.id() && r.mapped.is_some())
        {
            return Err(DeviceError::mapping(*resource, "mapped by compute"));
        }
        let id = BufferId(buffer.id().0);
        let region = state
            .allocations
            .get(&id)
            .map(|allocation| Arc::clone(&allocation.region))
            .ok_or(DeviceError::InvalidBuffer(id))?;
        drop(state);

        let mut bytes = region.write();
        let end = (offset + data.len()).min(bytes.len());
        if offset < end {
            bytes[offset..end].copy_from_slice(&data[..end - offset]);
        }
        Ok(())
    }

    fn delete_shared_buffer(&self, buffer: SharedBuffer) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if let Some((resource, _)) = state.resources.iter().find(|(_, r)| r.buffer == buffer.id()) {
            return Err(DeviceError::mapping(*resource, "buffer deleted while registered"));
        }
        let id = BufferId(buffer.id().0);
        state
            .allocations
            .remove(&id)
            .map(|_| ())
            .ok_or(DeviceError::InvalidBuffer(id))
    }

    fn register_shared_buffer(
        &self,
        device: DeviceId,
        buffer: &SharedBuffer,
    ) -> Result<GraphicsResource, DeviceError> {
        self.check_device(device)?;
        let mut state = self.lock();
        let id = BufferId(buffer.id().0);
        if !state.allocations.contains_key(&id) {
            return Err(DeviceError::InvalidBuffer(id));
        }

        let resource = self.next_id();
        state.resources.insert(
            resource,
            ResourceEntry {
                device,
                buffer: buffer.id(),
                mapped: None,
            },
        );
        Ok(GraphicsResource::new(resource, device, buffer.id()))
    }

    fn map_resource(
        &self,
        resource: &GraphicsResource,
        flags: MapFlags,
    ) -> Result<BufferView, DeviceError> {
        let mut state = self.lock();
        let entry = state.resource_mut(resource.id())?;
        if entry.mapped.is_some() {
            return Err(DeviceError::mapping(resource.id(), "already mapped"));
        }
        entry.mapped = Some(flags);
        Ok(BufferView {
            device: entry.device,
            buffer: BufferId(entry.buffer.0),
        })
    }

    fn unmap_resource(&self, resource: &GraphicsResource) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let entry = state.resource_mut(resource.id())?;
        if entry.mapped.take().is_none() {
            return Err(DeviceError::mapping(resource.id(), "not mapped"));
        }
        Ok(())
    }

    fn unregister_resource(&self, resource: GraphicsResource) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.resource_mut(resource.id())?.mapped.is_some() {
            return Err(DeviceError::mapping(resource.id(), "unregistered while mapped"));
        }
        state.resources.remove(&resource.id());
        Ok(())
    }
}

/// CPU all-pairs integrator for the host backend
#[derive(Debug, Default)]
pub struct HostIntegrator {
    softening_squared: HashMap<DeviceId, f64>,
}

impl HostIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Softening² last pushed to `device`
    pub fn softening_squared(&self, device: DeviceId) -> Option<f64> {
        self.softening_squared.get(&device).copied()
    }
}

impl<T: Scalar> Integrator<HostBackend, T> for HostIntegrator {
    fn set_softening_squared(
        &mut self,
        backend: &HostBackend,
        device: DeviceId,
        softening_squared: T,
    ) -> Result<(), DeviceError> {
        backend.check_device(device)?;
        self.softening_squared.insert(device, softening_squared.to_f64());
        Ok(())
    }

    fn integrate(&self, backend: &HostBackend, job: &IntegrationJob<T>) -> Result<(), DeviceError> {
        let device = job.device;
        let (offset, count, body_count) = (job.offset, job.count, job.body_count);
        let params = StepParams {
            delta_time: job.delta_time,
            damping: job.damping,
            softening_squared: job.softening_squared,
        };
        let views = [job.read_positions, job.write_positions, job.velocities];
        let shared = job.uses_shared_buffer;

        backend.launch(device, &views, move |regions| {
            let [read, write, velocity] = regions else {
                return Err(DeviceError::kernel_failed(device, "expected three buffers"));
            };
            let body_bytes = std::mem::size_of::<Vec4<T>>();
            let out_of_bounds = |capacity: usize| DeviceError::OutOfBounds {
                offset: offset * body_bytes,
                len: count * body_bytes,
                capacity,
            };

            // A short shared buffer only exposes the bodies that fit in it
            let (sources, range) = if shared {
                let fit = body_count
                    .min(read.len() / body_bytes)
                    .min(write.len() / body_bytes);
                let end = (offset + count).min(fit);
                (fit, offset.min(end)..end)
            } else {
                (body_count, offset..offset + count)
            };
            if range.is_empty() {
                return Ok(());
            }

            let mut velocities: Vec<Vec4<T>> = {
                let bytes = velocity.read();
                bytes
                    .cast::<Vec4<T>>()?
                    .get(range.clone())
                    .ok_or_else(|| out_of_bounds(bytes.len()))?
                    .to_vec()
            };
            let mut next = vec![[T::ZERO; 4]; range.len()];

            {
                let bytes = read.read();
                let positions = if shared {
                    bytes.cast_prefix::<Vec4<T>>()
                } else {
                    bytes.cast::<Vec4<T>>()?
                };
                let positions = positions
                    .get(..sources)
                    .ok_or_else(|| out_of_bounds(bytes.len()))?;
                integrate_range(positions, &mut velocities, &mut next, range.start, &params);
            }

            let mut bytes = write.write();
            let capacity = bytes.len();
            let positions = if shared {
                bytes.cast_prefix_mut::<Vec4<T>>()
            } else {
                bytes.cast_mut::<Vec4<T>>()?
            };
            positions
                .get_mut(range.clone())
                .ok_or_else(|| out_of_bounds(capacity))?
                .copy_from_slice(&next);
            drop(bytes);

            let mut bytes = velocity.write();
            let capacity = bytes.len();
            bytes
                .cast_mut::<Vec4<T>>()?
                .get_mut(range)
                .ok_or_else(|| out_of_bounds(capacity))?
                .copy_from_slice(&velocities);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_devices() -> HostBackend {
        HostBackend::new(HostBackendConfig::uniform(2)).expect("backend")
    }

    #[test]
    fn test_peer_access_second_enable_reports_already_enabled() {
        let backend = two_devices();
        backend
            .enable_peer_access(DeviceId(1), DeviceId(0))
            .expect("first enable");
        let second = backend.enable_peer_access(DeviceId(1), DeviceId(0));
        assert!(second.unwrap_err().is_peer_access_already_enabled());
        assert!(backend.peer_access_enabled(DeviceId(1), DeviceId(0)));
    }

    #[test]
    fn test_peer_alias_requires_enabled_access() {
        let backend = two_devices();
        let buffer = backend.allocate(DeviceId(0), 16).expect("allocate");
        let alias = buffer.alias(DeviceId(1));

        let mut out = [0u8; 16];
        let denied = backend.copy_to_host(alias, &mut out);
        assert!(matches!(denied, Err(DeviceError::AccessDenied { .. })));

        backend
            .enable_peer_access(DeviceId(1), DeviceId(0))
            .expect("enable");
        backend.copy_to_host(alias, &mut out).expect("aliased read");
        backend.free(buffer).expect("free");
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_pinned_memory_is_zeroed_and_views_die_with_it() {
        let backend = two_devices();
        let pinned = backend.allocate_pinned(32).expect("pinned");
        assert!(pinned.region().read().iter().all(|b| *b == 0));

        let view = backend
            .pinned_device_view(DeviceId(1), &pinned)
            .expect("view");
        backend.copy_to_device(view, 0, &[7u8; 4]).expect("write");
        assert_eq!(&pinned.region().read()[..4], &[7, 7, 7, 7]);

        backend.free_pinned(pinned).expect("free");
        let mut out = [0u8; 4];
        assert!(matches!(
            backend.copy_to_host(view, &mut out),
            Err(DeviceError::InvalidBuffer(_))
        ));
    }

    #[test]
    fn test_device_budget_is_enforced() {
        let mut config = HostBackendConfig::default();
        config.device_memory = Some(100);
        let backend = HostBackend::new(config).expect("backend");

        let first = backend.allocate(DeviceId(0), 64).expect("fits");
        assert!(matches!(
            backend.allocate(DeviceId(0), 64),
            Err(DeviceError::OutOfMemory { .. })
        ));
        assert_eq!(backend.device_usage(DeviceId(0)), 64);
        backend.free(first).expect("free");
        assert_eq!(backend.device_usage(DeviceId(0)), 0);
    }

    #[test]
    fn test_kernel_failure_is_sticky() {
        let backend = two_devices();
        backend.fail_next_kernel(DeviceId(0));
        backend
            .launch(DeviceId(0), &[], |_| Ok(()))
            .expect("launch is asynchronous");

        assert!(matches!(
            backend.synchronize(DeviceId(0)),
            Err(DeviceError::KernelFailed { .. })
        ));
        assert!(backend.launch(DeviceId(0), &[], |_| Ok(())).is_err());
        // Other devices are unaffected
        backend.synchronize(DeviceId(1)).expect("device 1 healthy");
    }

    #[test]
    fn test_panicking_command_fails_the_stream() {
        let backend = two_devices();
        backend
            .launch(DeviceId(0), &[], |_| -> Result<(), DeviceError> {
                panic!("index out of range")
            })
            .expect("launch is asynchronous");

        match backend.synchronize(DeviceId(0)) {
            Err(DeviceError::KernelFailed { device, reason }) => {
                assert_eq!(device, DeviceId(0));
                assert!(reason.contains("index out of range"));
            }
            other => panic!("expected a kernel failure, got {other:?}"),
        }
        // The worker survives to report the error on later submissions
        assert!(backend.launch(DeviceId(0), &[], |_| Ok(())).is_err());
    }

    #[test]
    fn test_events_complete_in_stream_order() {
        let backend = two_devices();
        let event = backend.create_event(DeviceId(1)).expect("event");
        let buffer = backend.allocate(DeviceId(1), 8).expect("allocate");

        backend
            .launch(DeviceId(1), &[buffer.view()], |regions| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                regions[0].write().copy_from_slice(&[1u8; 8]);
                Ok(())
            })
            .expect("launch");
        backend.record_event(&event).expect("record");
        backend.synchronize_event(&event).expect("sync");

        let mut out = [0u8; 8];
        backend.copy_to_host(buffer.view(), &mut out).expect("read");
        assert_eq!(out, [1u8; 8]);

        backend.destroy_event(event).expect("destroy");
        backend.free(buffer).expect("free");
        assert_eq!(backend.live_events(), 0);
    }

    #[test]
    fn test_shared_buffer_only_accessible_while_mapped() {
        let backend = two_devices();
        let shared = backend.create_shared_buffer(16).expect("shared");
        let resource = backend
            .register_shared_buffer(DeviceId(0), &shared)
            .expect("register");

        let view = backend
            .map_resource(&resource, MapFlags::None)
            .expect("map");
        assert!(backend.map_resource(&resource, MapFlags::None).is_err());
        assert!(backend.read_shared_buffer(shared.id()).is_err());
        backend.copy_to_device(view, 0, &[3u8; 16]).expect("write");
        backend.unmap_resource(&resource).expect("unmap");

        assert!(backend.copy_to_device(view, 0, &[0u8; 16]).is_err());
        assert_eq!(
            backend.read_shared_buffer(shared.id()).expect("renderer read"),
            vec![3u8; 16]
        );

        backend.unregister_resource(resource).expect("unregister");
        backend.delete_shared_buffer(shared).expect("delete");
        assert_eq!(backend.live_resources(), 0);
    }

    #[test]
    fn test_shared_buffer_limit_truncates() {
        let mut config = HostBackendConfig::default();
        config.shared_buffer_limit = Some(8);
        let backend = HostBackend::new(config).expect("backend");

        let shared = backend.create_shared_buffer(32).expect("shared");
        assert_eq!(shared.requested_bytes(), 32);
        assert_eq!(backend.shared_buffer_size(&shared).expect("size"), 8);
        backend
            .update_shared_buffer(&shared, 0, &[9u8; 32])
            .expect("update clips");
        assert_eq!(
            backend.read_shared_buffer(shared.id()).expect("read"),
            vec![9u8; 8]
        );
        backend.delete_shared_buffer(shared).expect("delete");
    }

    #[test]
    fn test_host_integrator_writes_only_its_slice() {
        let backend = two_devices();
        let bytes = 4 * 4 * std::mem::size_of::<f32>();
        let read = backend.allocate(DeviceId(0), bytes).expect("read");
        let write = backend.allocate(DeviceId(0), bytes).expect("write");
        let velocity = backend.allocate(DeviceId(0), bytes).expect("velocity");

        let positions: [f32; 16] = [
            0.0, 0.0, 0.0, 1.0, //
            1.0, 0.0, 0.0, 1.0, //
            0.0, 1.0, 0.0, 1.0, //
            0.0, 0.0, 1.0, 1.0,
        ];
        backend
            .copy_to_device(read.view(), 0, bytemuck::cast_slice(&positions))
            .expect("upload");

        let job = IntegrationJob {
            device: DeviceId(0),
            offset: 2,
            count: 2,
            body_count: 4,
            read_positions: read.view(),
            write_positions: write.view(),
            velocities: velocity.view(),
            delta_time: 0.01f32,
            damping: 1.0,
            softening_squared: 0.0001,
            block_size: 256,
            uses_shared_buffer: false,
        };
        HostIntegrator::new()
            .integrate(&backend, &job)
            .expect("integrate");

        let mut out = [0f32; 16];
        backend
            .copy_to_host(write.view(), bytemuck::cast_slice_mut(&mut out))
            .expect("download");
        assert_eq!(&out[..8], &[0.0; 8]);
        assert_eq!(out[11], 1.0);
        assert_eq!(out[15], 1.0);

        for buffer in [read, write, velocity] {
            backend.free(buffer).expect("free");
        }
    }
}
