//! Compute backend abstraction
//!
//! A backend owns a set of devices, each with one in-order command stream.
//! Every call that targets a device names it explicitly through a [`DeviceId`];
//! nothing in this API depends on an implicit "current device".
//!
//! Ownership is carried by the handle types: [`DeviceBuffer`], [`PinnedBuffer`],
//! [`SharedBuffer`], [`GraphicsResource`] and [`Event`] are not `Clone`, and the
//! functions releasing them take them by value. [`BufferView`] is the only
//! `Copy` handle and it never owns anything.

pub mod gpu;
pub mod host;
pub mod region;

use crate::error::DeviceError;
use region::HostRegion;
use std::fmt;
use std::sync::Arc;

pub use gpu::{ShaderIntegrator, WgpuBackend};
pub use host::{HostBackend, HostBackendConfig, HostIntegrator};

/// Index of a device within a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// Backend-wide allocation key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Key of a buffer owned by the graphics side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedBufferId(pub u64);

/// The two numbers the workload partitioner needs from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Streaming multiprocessors / compute units
    pub compute_units: u32,
    /// Architecture generation (major compute capability)
    pub weight_class: u32,
}

/// Non-owning, device-scoped reference to an allocation.
///
/// Several views may point at the same buffer from different devices
/// (pinned host memory, peer aliases, mapped graphics buffers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferView {
    pub device: DeviceId,
    pub buffer: BufferId,
}

/// Private allocation owned by one device
#[derive(Debug)]
pub struct DeviceBuffer {
    id: BufferId,
    device: DeviceId,
    bytes: usize,
}

impl DeviceBuffer {
    /// Wrap a fresh allocation. Only backends create these.
    pub fn new(id: BufferId, device: DeviceId, bytes: usize) -> Self {
        Self { id, device, bytes }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// View of this buffer from its owning device
    pub fn view(&self) -> BufferView {
        BufferView {
            device: self.device,
            buffer: self.id,
        }
    }

    /// Alias of this buffer as seen from another device.
    ///
    /// Only usable once peer access from `device` to the owner is enabled.
    pub fn alias(&self, device: DeviceId) -> BufferView {
        BufferView {
            device,
            buffer: self.id,
        }
    }
}

/// Page-locked host memory that devices can address directly
#[derive(Debug)]
pub struct PinnedBuffer {
    id: BufferId,
    region: Arc<HostRegion>,
}

impl PinnedBuffer {
    pub fn new(id: BufferId, region: Arc<HostRegion>) -> Self {
        Self { id, region }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn bytes(&self) -> usize {
        self.region.len()
    }

    /// Host-side access to the memory
    pub fn region(&self) -> &HostRegion {
        &self.region
    }
}

/// Buffer owned by the graphics subsystem (vertex buffer the renderer draws from)
#[derive(Debug)]
pub struct SharedBuffer {
    id: SharedBufferId,
    requested: usize,
}

impl SharedBuffer {
    pub fn new(id: SharedBufferId, requested: usize) -> Self {
        Self { id, requested }
    }

    pub fn id(&self) -> SharedBufferId {
        self.id
    }

    /// Size that was asked for when the buffer was created
    pub fn requested_bytes(&self) -> usize {
        self.requested
    }
}

/// Registration of a shared buffer with the compute side
#[derive(Debug)]
pub struct GraphicsResource {
    id: u64,
    device: DeviceId,
    buffer: SharedBufferId,
}

impl GraphicsResource {
    pub fn new(id: u64, device: DeviceId, buffer: SharedBufferId) -> Self {
        Self { id, device, buffer }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn buffer(&self) -> SharedBufferId {
        self.buffer
    }
}

/// How compute intends to use a mapped graphics resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFlags {
    None,
    ReadOnly,
    WriteDiscard,
}

/// Completion signal recorded on a device stream
#[derive(Debug)]
pub struct Event {
    id: u64,
    device: DeviceId,
}

impl Event {
    pub fn new(id: u64, device: DeviceId) -> Self {
        Self { id, device }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }
}

/// Device runtime the body system is built on.
///
/// Copies are blocking. Kernel launches (done by [`crate::Integrator`]
/// implementations) are asynchronous and ordered per device stream; a failure
/// inside a launched kernel is reported by the next synchronizing call on that
/// device.
pub trait ComputeBackend: Send + Sync {
    /// Short backend name for logs and errors
    fn name(&self) -> &'static str;

    fn device_count(&self) -> u32;

    fn capabilities(&self, device: DeviceId) -> Result<DeviceCapabilities, DeviceError>;

    /// Whether devices can address pinned host memory without copies
    fn supports_mapped_host_memory(&self) -> bool;

    /// Whether `device` can be given access to memory owned by `peer`
    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> bool;

    /// Allow `device` to access memory owned by `peer`.
    ///
    /// Returns [`DeviceError::PeerAccessAlreadyEnabled`] when called twice for
    /// the same pair.
    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<(), DeviceError>;

    /// Allocate uninitialized device memory
    fn allocate(&self, device: DeviceId, bytes: usize) -> Result<DeviceBuffer, DeviceError>;

    fn free(&self, buffer: DeviceBuffer) -> Result<(), DeviceError>;

    /// Allocate zeroed, portable, mapped host memory
    fn allocate_pinned(&self, bytes: usize) -> Result<PinnedBuffer, DeviceError>;

    /// Free pinned memory. Every device view of it becomes invalid.
    fn free_pinned(&self, buffer: PinnedBuffer) -> Result<(), DeviceError>;

    /// Device-visible view onto pinned host memory
    fn pinned_device_view(
        &self,
        device: DeviceId,
        buffer: &PinnedBuffer,
    ) -> Result<BufferView, DeviceError>;

    /// Blocking host→device copy into `dst` at byte `offset`
    fn copy_to_device(&self, dst: BufferView, offset: usize, src: &[u8])
        -> Result<(), DeviceError>;

    /// Blocking device→host copy. Waits for earlier work on the view's device.
    fn copy_to_host(&self, src: BufferView, dst: &mut [u8]) -> Result<(), DeviceError>;

    fn create_event(&self, device: DeviceId) -> Result<Event, DeviceError>;

    /// Mark the point of the device stream the event completes at
    fn record_event(&self, event: &Event) -> Result<(), DeviceError>;

    /// Block until the recorded work finished; reports stream failures
    fn synchronize_event(&self, event: &Event) -> Result<(), DeviceError>;

    fn destroy_event(&self, event: Event) -> Result<(), DeviceError>;

    /// Block until every command issued to `device` finished
    fn synchronize(&self, device: DeviceId) -> Result<(), DeviceError>;

    // Graphics interop

    /// Create a renderer-owned buffer of `bytes` (zero-filled).
    ///
    /// The driver may hand back less than requested; check
    /// [`ComputeBackend::shared_buffer_size`].
    fn create_shared_buffer(&self, bytes: usize) -> Result<SharedBuffer, DeviceError>;

    /// Actual size of a shared buffer
    fn shared_buffer_size(&self, buffer: &SharedBuffer) -> Result<usize, DeviceError>;

    /// Renderer-side sub-update of a shared buffer. Data past the end of the
    /// buffer is dropped.
    fn update_shared_buffer(
        &self,
        buffer: &SharedBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError>;

    fn delete_shared_buffer(&self, buffer: SharedBuffer) -> Result<(), DeviceError>;

    /// Register a shared buffer so `device` can map it
    fn register_shared_buffer(
        &self,
        device: DeviceId,
        buffer: &SharedBuffer,
    ) -> Result<GraphicsResource, DeviceError>;

    /// Map a registered resource for compute access
    fn map_resource(
        &self,
        resource: &GraphicsResource,
        flags: MapFlags,
    ) -> Result<BufferView, DeviceError>;

    /// Hand the resource back to the renderer
    fn unmap_resource(&self, resource: &GraphicsResource) -> Result<(), DeviceError>;

    fn unregister_resource(&self, resource: GraphicsResource) -> Result<(), DeviceError>;
}
