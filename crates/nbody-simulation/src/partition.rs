//! Static workload split across devices
//!
//! Each device gets a contiguous slice of bodies proportional to its weight,
//! `compute_units × (4 if weight_class ≥ 2 else 1)`. Shares are rounded up to
//! a multiple of [`PARTITION_GRANULARITY`] and the last device takes whatever
//! is left, so the slices always tile `[0, body_count)` exactly.

use crate::backend::DeviceCapabilities;
use crate::error::{Result, SimulationError};
use nbody_physics::{MODERN_DEVICE_WEIGHT, MODERN_WEIGHT_CLASS, PARTITION_GRANULARITY};

/// One device's slice of the bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyRange {
    pub offset: usize,
    pub count: usize,
}

impl BodyRange {
    pub fn end(&self) -> usize {
        self.offset + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Relative throughput of a device
pub fn device_weight(capabilities: &DeviceCapabilities) -> f32 {
    let factor = if capabilities.weight_class >= MODERN_WEIGHT_CLASS {
        MODERN_DEVICE_WEIGHT
    } else {
        1.0
    };
    capabilities.compute_units as f32 * factor
}

/// Split `body_count` bodies across the devices, in device order.
pub fn partition_bodies(
    capabilities: &[DeviceCapabilities],
    body_count: usize,
) -> Result<Vec<BodyRange>> {
    if capabilities.is_empty() {
        return Err(SimulationError::invalid_config("no devices to partition over"));
    }

    if capabilities.len() == 1 {
        return Ok(vec![BodyRange {
            offset: 0,
            count: body_count,
        }]);
    }

    let mut weights: Vec<f32> = capabilities.iter().map(device_weight).collect();
    let mut total: f32 = weights.iter().sum();
    if total <= 0.0 {
        weights.fill(1.0);
        total = weights.len() as f32;
    }

    let granularity = PARTITION_GRANULARITY as usize;
    let last = weights.len() - 1;
    let mut offset = 0;

    let ranges = weights
        .iter()
        .enumerate()
        .map(|(i, weight)| {
            let remaining = body_count - offset;
            let count = if i == last {
                remaining
            } else {
                let raw = (weight / total * body_count as f32) as usize;
                raw.next_multiple_of(granularity).min(remaining)
            };
            let range = BodyRange { offset, count };
            offset += count;
            range
        })
        .collect::<Vec<_>>();

    debug_assert_eq!(offset, body_count);
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(compute_units: u32, weight_class: u32) -> DeviceCapabilities {
        DeviceCapabilities {
            compute_units,
            weight_class,
        }
    }

    fn assert_tiles(ranges: &[BodyRange], body_count: usize) {
        let mut offset = 0;
        for range in ranges {
            assert_eq!(range.offset, offset);
            offset = range.end();
        }
        assert_eq!(offset, body_count);
    }

    #[test]
    fn test_single_device_takes_everything() {
        let ranges = partition_bodies(&[device(1, 0)], 1000).unwrap();
        assert_eq!(ranges, vec![BodyRange { offset: 0, count: 1000 }]);
    }

    #[test]
    fn test_two_equal_devices_split_evenly() {
        let ranges = partition_bodies(&[device(8, 3), device(8, 3)], 1024).unwrap();
        assert_eq!(
            ranges,
            vec![
                BodyRange { offset: 0, count: 512 },
                BodyRange { offset: 512, count: 512 },
            ]
        );
    }

    #[test]
    fn test_modern_devices_weigh_four_times_more() {
        let old = device(10, 1);
        let modern = device(10, 2);
        assert_eq!(device_weight(&modern), 4.0 * device_weight(&old));

        // modern gets 4/5 of 2560 = 2048, the old device the rest
        let ranges = partition_bodies(&[modern, old], 2560).unwrap();
        assert_eq!(ranges[0].count, 2048);
        assert_eq!(ranges[1].count, 512);
    }

    #[test]
    fn test_shares_are_multiples_of_granularity() {
        let devices = [device(7, 2), device(3, 1), device(5, 5), device(2, 0)];
        for body_count in [1, 255, 256, 1000, 4097, 65_536, 100_003] {
            let ranges = partition_bodies(&devices, body_count).unwrap();
            assert_eq!(ranges.len(), devices.len());
            assert_tiles(&ranges, body_count);

            // A rounded share is clamped where it reaches the end
            for range in &ranges[..ranges.len() - 1] {
                assert!(
                    range.count % 256 == 0 || range.end() == body_count,
                    "{body_count}: {range:?}"
                );
            }
            let full = ranges
                .iter()
                .position(|range| range.end() == body_count)
                .unwrap();
            assert!(ranges[full + 1..].iter().all(BodyRange::is_empty));
        }
    }

    #[test]
    fn test_share_below_granularity_is_clamped() {
        let ranges = partition_bodies(&[device(7, 2), device(3, 1)], 255).unwrap();
        assert_eq!(ranges[0], BodyRange { offset: 0, count: 255 });
        assert_eq!(ranges[1], BodyRange { offset: 255, count: 0 });
    }

    #[test]
    fn test_small_counts_leave_later_devices_empty() {
        let ranges = partition_bodies(&[device(4, 3), device(4, 3), device(4, 3)], 100).unwrap();
        assert_eq!(ranges[0], BodyRange { offset: 0, count: 100 });
        assert!(ranges[1].is_empty());
        assert!(ranges[2].is_empty());
        assert_tiles(&ranges, 100);
    }

    #[test]
    fn test_zero_weights_split_equally() {
        let ranges = partition_bodies(&[device(0, 3), device(0, 3)], 1024).unwrap();
        assert_eq!(ranges[0].count, 512);
        assert_tiles(&ranges, 1024);
    }

    #[test]
    fn test_no_devices_is_invalid() {
        assert!(matches!(
            partition_bodies(&[], 10),
            Err(SimulationError::InvalidConfig(_))
        ));
    }
}
