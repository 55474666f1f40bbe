//! # N-Body Physics
//!
//! Precision-generic scalar support, the all-pairs gravitational step used as
//! the reference kernel, and generators for initial body configurations.

pub mod constants;
pub mod distribution;
pub mod kernel;
pub mod scalar;

pub use constants::*;
pub use distribution::*;
pub use kernel::*;
pub use scalar::*;
