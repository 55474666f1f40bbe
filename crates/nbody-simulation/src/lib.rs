//! # N-Body Simulation Engine
//!
//! Body state management for an all-pairs gravitational simulation spread
//! over one or more compute devices: workload partitioning, device-private,
//! host-mapped and peer-to-peer memory, double-buffered positions and sharing
//! of the position buffers with a renderer.

pub mod backend;
pub mod error;
pub mod integrator;
pub mod interop;
pub mod loader;
pub mod memory;
pub mod params;
pub mod partition;
pub mod system;

pub use backend::{
    BufferView, ComputeBackend, DeviceCapabilities, DeviceId, HostBackend, HostBackendConfig,
    HostIntegrator, MapFlags, ShaderIntegrator, WgpuBackend,
};
pub use error::{DeviceError, Result, SimulationError};
pub use integrator::{IntegrationJob, Integrator};
pub use interop::{InteropBinding, MappedBuffer};
pub use loader::{BodyData, BodyFileReader};
pub use memory::{BodyArray, BodyStorage, DevicePartition, MemoryMode};
pub use params::*;
pub use partition::{partition_bodies, BodyRange};
pub use system::{BodySystem, HostArray};
