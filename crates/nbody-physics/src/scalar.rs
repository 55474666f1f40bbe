//! Floating point precision abstraction
//!
//! Body state can be simulated in single or double precision. Everything that
//! touches raw memory (buffer sizing, byte casts) goes through `size_of::<T>()`
//! so the same code path serves both.

use bytemuck::Pod;
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// Scalar type a body system can be instantiated with.
pub trait Scalar:
    Pod
    + Debug
    + Default
    + PartialOrd
    + Send
    + Sync
    + Add<Output = Self>
    + AddAssign
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    const ZERO: Self;
    const ONE: Self;

    /// Short name used in logs ("f32" / "f64")
    const NAME: &'static str;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
    fn sqrt(self) -> Self;

    /// Size of one scalar in bytes
    fn byte_size() -> usize {
        std::mem::size_of::<Self>()
    }
}

impl Scalar for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const NAME: &'static str = "f32";

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }
}

impl Scalar for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const NAME: &'static str = "f64";

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
}

/// Homogeneous body vector: `xyz` + `w`.
///
/// Positions store mass in `w`, velocities store inverse mass.
pub type Vec4<T> = [T; 4];

/// Number of scalars stored per body in every buffer.
pub const COMPONENTS_PER_BODY: usize = 4;

/// Byte size of one body array (`positions` or `velocities`) for `body_count` bodies.
pub fn body_array_bytes<T: Scalar>(body_count: usize) -> usize {
    COMPONENTS_PER_BODY * body_count * T::byte_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_array_bytes_tracks_precision() {
        assert_eq!(body_array_bytes::<f32>(1000), 16_000);
        assert_eq!(body_array_bytes::<f64>(1000), 32_000);
        assert_eq!(body_array_bytes::<f32>(0), 0);
    }

    #[test]
    fn test_from_f64_round_trips_for_f64() {
        assert_eq!(f64::from_f64(0.00125).to_f64(), 0.00125);
        assert_eq!(f32::NAME, "f32");
    }
}
