//! Host memory regions backing emulated allocations
//!
//! Storage is kept as 64-bit words so every region is aligned for any scalar
//! type the body system can be instantiated with.

use crate::error::DeviceError;
use bytemuck::Pod;
use std::ops::{Deref, DerefMut};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Zero-initialized, fixed-size byte region
#[derive(Debug)]
pub struct HostRegion {
    len: usize,
    words: RwLock<Vec<u64>>,
}

impl HostRegion {
    pub fn zeroed(len: usize) -> Self {
        Self {
            len,
            words: RwLock::new(vec![0u64; len.div_ceil(8)]),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read(&self) -> RegionRead<'_> {
        RegionRead {
            guard: self.words.read().unwrap_or_else(PoisonError::into_inner),
            len: self.len,
        }
    }

    pub fn write(&self) -> RegionWrite<'_> {
        RegionWrite {
            guard: self.words.write().unwrap_or_else(PoisonError::into_inner),
            len: self.len,
        }
    }
}

/// Shared borrow of a region's bytes
pub struct RegionRead<'a> {
    guard: RwLockReadGuard<'a, Vec<u64>>,
    len: usize,
}

/// Error for a region that does not hold a whole number of `T`
fn partial_element<T>(len: usize) -> DeviceError {
    DeviceError::OutOfBounds {
        offset: 0,
        len: len.next_multiple_of(std::mem::size_of::<T>().max(1)),
        capacity: len,
    }
}

/// Byte length of the whole `T`s that fit in `len` bytes
fn whole_prefix<T>(len: usize) -> usize {
    len - len % std::mem::size_of::<T>().max(1)
}

impl RegionRead<'_> {
    /// Reinterpret the region as a slice of `T`.
    pub fn cast<T: Pod>(&self) -> Result<&[T], DeviceError> {
        bytemuck::try_cast_slice(self.deref()).map_err(|_| partial_element::<T>(self.len))
    }

    /// The whole `T`s at the start of the region, ignoring a partial tail
    pub fn cast_prefix<T: Pod>(&self) -> &[T] {
        let bytes = &self.deref()[..whole_prefix::<T>(self.len)];
        bytemuck::try_cast_slice(bytes).unwrap_or_default()
    }
}

impl Deref for RegionRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &bytemuck::cast_slice(self.guard.as_slice())[..self.len]
    }
}

/// Exclusive borrow of a region's bytes
pub struct RegionWrite<'a> {
    guard: RwLockWriteGuard<'a, Vec<u64>>,
    len: usize,
}

impl RegionWrite<'_> {
    pub fn cast_mut<T: Pod>(&mut self) -> Result<&mut [T], DeviceError> {
        let len = self.len;
        bytemuck::try_cast_slice_mut(self.deref_mut()).map_err(|_| partial_element::<T>(len))
    }

    pub fn cast_prefix_mut<T: Pod>(&mut self) -> &mut [T] {
        let whole = whole_prefix::<T>(self.len);
        bytemuck::try_cast_slice_mut(&mut self.deref_mut()[..whole]).unwrap_or_default()
    }
}

impl Deref for RegionWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &bytemuck::cast_slice(self.guard.as_slice())[..self.len]
    }
}

impl DerefMut for RegionWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut(self.guard.as_mut_slice())[..len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_is_zeroed_and_sized() {
        let region = HostRegion::zeroed(12);
        assert_eq!(region.len(), 12);
        assert!(region.read().iter().all(|b| *b == 0));
        assert_eq!(region.read().cast::<f32>().expect("cast").len(), 3);
    }

    #[test]
    fn test_write_then_cast() {
        let region = HostRegion::zeroed(32);
        region.write().cast_mut::<f64>().expect("cast")[3] = 2.5;
        assert_eq!(region.read().cast::<f64>().expect("cast"), &[0.0, 0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_partial_element_is_an_error_not_a_panic() {
        let region = HostRegion::zeroed(100);
        assert!(matches!(
            region.read().cast::<[f32; 4]>(),
            Err(DeviceError::OutOfBounds {
                len: 112,
                capacity: 100,
                ..
            })
        ));
        assert!(region.write().cast_mut::<[f32; 4]>().is_err());

        // The prefix view drops the trailing four bytes
        assert_eq!(region.read().cast_prefix::<[f32; 4]>().len(), 6);
        region.write().cast_prefix_mut::<[f32; 4]>()[5] = [1.0; 4];
        assert_eq!(&region.read()[80..84], &1.0f32.to_ne_bytes());
    }
}
