//! Default constants for the body system
//!
//! Simulation units: G = 1, masses and distances are dimensionless.

/// Softening length used when nothing else is configured.
/// The kernel squares it before use.
pub const DEFAULT_SOFTENING: f32 = 0.00125;

/// Velocity damping applied every step
pub const DEFAULT_DAMPING: f32 = 0.995;

/// Threads per block (workgroup) used by device kernels
pub const DEFAULT_BLOCK_SIZE: u32 = 256;

/// Granularity the workload partitioner rounds device shares up to
pub const PARTITION_GRANULARITY: u32 = 256;

/// Compute units of a device in weight class 2 or above are considered this many
/// times faster than older ones when splitting work
pub const MODERN_DEVICE_WEIGHT: f32 = 4.0;

/// Weight class at which `MODERN_DEVICE_WEIGHT` applies
pub const MODERN_WEIGHT_CLASS: u32 = 2;

/// Body count the distributions scale their cluster size against
pub const REFERENCE_BODY_COUNT: f64 = 1024.0;

/// Inner and outer radius of the shell distribution, as multiples of the
/// cluster scale
pub const SHELL_INNER_RADIUS: f64 = 2.5;
pub const SHELL_OUTER_RADIUS: f64 = 4.0;
