//! Integration kernel interface
//!
//! The force computation itself lives with the backend that runs it: the host
//! backend ships a CPU kernel, the wgpu backend a compute shader. The body
//! system only hands each device a job describing its slice.

use crate::backend::{BufferView, ComputeBackend, DeviceId};
use crate::error::DeviceError;
use nbody_physics::Scalar;

/// One device's share of an integration step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegrationJob<T> {
    pub device: DeviceId,
    /// First body this device writes
    pub offset: usize,
    /// Number of bodies this device writes
    pub count: usize,
    /// Total bodies; the device reads all of them
    pub body_count: usize,
    /// Entire current position buffer
    pub read_positions: BufferView,
    /// Next position buffer, written only in `[offset, offset + count)`
    pub write_positions: BufferView,
    pub velocities: BufferView,
    pub delta_time: T,
    pub damping: T,
    pub softening_squared: T,
    /// Preferred threads per block (workgroup). Advisory: an integrator with
    /// a fixed launch shape may ignore it, results do not depend on it.
    pub block_size: u32,
    /// Positions live in a mapped graphics buffer
    pub uses_shared_buffer: bool,
}

/// Integration step runner for backend `B` at precision `T`.
pub trait Integrator<B: ComputeBackend, T: Scalar> {
    /// Push softening² into the device's integration context.
    fn set_softening_squared(
        &mut self,
        _backend: &B,
        _device: DeviceId,
        _softening_squared: T,
    ) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Enqueue the job on its device stream. Returns once the work is issued;
    /// failures inside the kernel surface at the next synchronization.
    fn integrate(&self, backend: &B, job: &IntegrationJob<T>) -> Result<(), DeviceError>;
}
