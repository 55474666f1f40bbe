//! Error types for the body system.

use crate::backend::{BufferId, DeviceId};
use thiserror::Error;

/// Failures reported by a compute backend.
///
/// `Clone` because an asynchronous failure stays attached to its device stream
/// and is handed out again to every later synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Device id is outside the backend's device range.
    #[error("invalid device {0}")]
    InvalidDevice(DeviceId),

    /// Allocation could not be satisfied.
    #[error("allocation of {bytes} bytes failed on {location}")]
    OutOfMemory {
        /// Where the allocation was attempted ("device 0", "pinned host memory", ...).
        location: String,
        /// Requested size.
        bytes: usize,
    },

    /// Peer access between the two devices was already enabled.
    #[error("peer access from {device} to {peer} is already enabled")]
    PeerAccessAlreadyEnabled {
        /// Accessing device.
        device: DeviceId,
        /// Device owning the memory.
        peer: DeviceId,
    },

    /// The topology cannot give `device` access to `peer`'s memory.
    #[error("{device} cannot access memory of {peer}")]
    PeerAccessUnsupported {
        /// Accessing device.
        device: DeviceId,
        /// Device owning the memory.
        peer: DeviceId,
    },

    /// A buffer handle does not name a live allocation.
    #[error("unknown or released buffer {0}")]
    InvalidBuffer(BufferId),

    /// A device touched memory it has no access to.
    #[error("{device} has no access to buffer {buffer}")]
    AccessDenied {
        /// Device attempting the access.
        device: DeviceId,
        /// Target buffer.
        buffer: BufferId,
    },

    /// Copy range exceeds the allocation.
    #[error("copy of {len} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        /// Byte offset into the buffer.
        offset: usize,
        /// Copy length.
        len: usize,
        /// Buffer size.
        capacity: usize,
    },

    /// A kernel launched on the device failed.
    #[error("kernel failed on {device}: {reason}")]
    KernelFailed {
        /// Device running the kernel.
        device: DeviceId,
        /// Description of the failure.
        reason: String,
    },

    /// A graphics resource is mapped when it must not be, or the other way round.
    #[error("graphics resource {resource}: {reason}")]
    Mapping {
        /// Resource id.
        resource: u64,
        /// What went wrong.
        reason: String,
    },

    /// The backend does not implement the requested operation.
    #[error("operation not supported by {backend} backend: {operation}")]
    Unsupported {
        /// Backend name.
        backend: &'static str,
        /// Operation name.
        operation: &'static str,
    },

    /// The device or its queue is gone.
    #[error("device lost: {0}")]
    Lost(String),
}

impl DeviceError {
    /// Creates a kernel failure.
    #[must_use]
    pub fn kernel_failed(device: DeviceId, reason: impl Into<String>) -> Self {
        Self::KernelFailed {
            device,
            reason: reason.into(),
        }
    }

    /// Creates a mapping error.
    #[must_use]
    pub fn mapping(resource: u64, reason: impl Into<String>) -> Self {
        Self::Mapping {
            resource,
            reason: reason.into(),
        }
    }

    /// Whether this is the benign "peer access already enabled" condition.
    pub fn is_peer_access_already_enabled(&self) -> bool {
        matches!(self, Self::PeerAccessAlreadyEnabled { .. })
    }
}

/// Errors surfaced by the body system API.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Configuration is inconsistent before any resource is touched.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Allocating body storage failed; nothing was kept.
    #[error("allocation failed: {0}")]
    Allocation(#[source] DeviceError),

    /// Hardware or topology cannot provide the requested feature.
    #[error("device capability mismatch: {0}")]
    DeviceCapabilityMismatch(String),

    /// A device computation or copy failed.
    #[error("device failure: {0}")]
    Device(#[from] DeviceError),

    /// Host data does not match the body count.
    #[error("expected {expected} scalars, got {actual}")]
    BodyCountMismatch {
        /// Required scalar count (`4 * body_count`).
        expected: usize,
        /// Provided scalar count.
        actual: usize,
    },

    /// The file reader failed.
    #[error("failed to load bodies: {0}")]
    Load(String),

    /// A previous re-initialization failed; the system can only be dropped.
    #[error("body system is not usable after a failed initialization")]
    Unusable,
}

impl SimulationError {
    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Creates a capability mismatch error.
    #[must_use]
    pub fn capability_mismatch(reason: impl Into<String>) -> Self {
        Self::DeviceCapabilityMismatch(reason.into())
    }
}

/// Result alias for body system operations.
pub type Result<T> = std::result::Result<T, SimulationError>;
