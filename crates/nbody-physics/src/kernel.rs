//! All-pairs gravitational step
//!
//! Reference implementation of the integration kernel. Backends that run on
//! real hardware ship their own version of the same math (see the WGSL shader
//! in `nbody-simulation`); the host backend calls straight into this module.

use crate::scalar::{Scalar, Vec4};
use rayon::prelude::*;

/// Per-step constants shared by every body of a launch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams<T> {
    pub delta_time: T,
    pub damping: T,
    pub softening_squared: T,
}

/// Acceleration contribution of body `bj` on body `bi`.
///
/// a = m_j * r / (|r|² + ε²)^(3/2), with `w` carrying the mass.
/// Coincident bodies with zero softening are skipped, so a body never
/// accelerates itself.
#[inline]
pub fn body_body_interaction<T: Scalar>(
    acceleration: &mut [T; 3],
    bi: &Vec4<T>,
    bj: &Vec4<T>,
    softening_squared: T,
) {
    let r = [bj[0] - bi[0], bj[1] - bi[1], bj[2] - bi[2]];
    let dist_sqr = r[0] * r[0] + r[1] * r[1] + r[2] * r[2] + softening_squared;
    if dist_sqr == T::ZERO {
        return;
    }

    let inv_dist = T::ONE / dist_sqr.sqrt();
    let inv_dist_cube = inv_dist * inv_dist * inv_dist;
    let s = bj[3] * inv_dist_cube;

    acceleration[0] += r[0] * s;
    acceleration[1] += r[1] * s;
    acceleration[2] += r[2] * s;
}

/// Total acceleration on `body` from every body in `positions`.
pub fn compute_body_accel<T: Scalar>(
    body: &Vec4<T>,
    positions: &[Vec4<T>],
    softening_squared: T,
) -> [T; 3] {
    let mut acceleration = [T::ZERO; 3];
    for other in positions {
        body_body_interaction(&mut acceleration, body, other, softening_squared);
    }
    acceleration
}

/// Advance the bodies `[offset, offset + write_positions.len())` by one step.
///
/// `read_positions` must hold the *entire* current position buffer since every
/// body interacts with every other one. `velocities` and `write_positions` are
/// the caller's own slice of the velocity and next-position buffers.
pub fn integrate_range<T: Scalar>(
    read_positions: &[Vec4<T>],
    velocities: &mut [Vec4<T>],
    write_positions: &mut [Vec4<T>],
    offset: usize,
    params: &StepParams<T>,
) {
    debug_assert_eq!(velocities.len(), write_positions.len());
    debug_assert!(offset + write_positions.len() <= read_positions.len());

    write_positions
        .par_iter_mut()
        .zip(velocities.par_iter_mut())
        .enumerate()
        .for_each(|(local, (new_position, velocity))| {
            let position = read_positions[offset + local];
            let accel = compute_body_accel(&position, read_positions, params.softening_squared);

            // v' = (v + a*dt) * damping
            for axis in 0..3 {
                velocity[axis] = (velocity[axis] + accel[axis] * params.delta_time) * params.damping;
            }

            // p' = p + v'*dt, mass untouched
            *new_position = [
                position[0] + velocity[0] * params.delta_time,
                position[1] + velocity[1] * params.delta_time,
                position[2] + velocity[2] * params.delta_time,
                position[3],
            ];
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dt: f64) -> StepParams<f64> {
        StepParams {
            delta_time: dt,
            damping: 1.0,
            softening_squared: 0.0,
        }
    }

    #[test]
    fn test_self_interaction_is_zero() {
        let mut accel = [0.0f64; 3];
        let body = [1.0, 2.0, 3.0, 5.0];
        body_body_interaction(&mut accel, &body, &body, 0.01);
        assert_eq!(accel, [0.0; 3]);

        // Unsoftened self term would be 0 * inf
        body_body_interaction(&mut accel, &body, &body, 0.0);
        assert_eq!(accel, [0.0; 3]);
    }

    #[test]
    fn test_two_bodies_attract_along_axis() {
        let a = [0.0f64, 0.0, 0.0, 1.0];
        let b = [2.0f64, 0.0, 0.0, 4.0];
        let accel = compute_body_accel(&a, &[a, b], 0.0);
        // m_b / r² = 4 / 4
        assert!((accel[0] - 1.0).abs() < 1e-12);
        assert_eq!(accel[1], 0.0);
        assert_eq!(accel[2], 0.0);
    }

    #[test]
    fn test_integrate_range_only_writes_its_slice() {
        let read = vec![
            [0.0f64, 0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, 1.0],
            [0.0, 0.0, 1.0, 1.0],
        ];
        let mut velocities = vec![[0.0f64; 4]; 2];
        let mut written = vec![[0.0f64; 4]; 2];

        integrate_range(&read, &mut velocities, &mut written, 2, &params(0.1));

        // Mass is carried over and bodies move toward the others
        assert_eq!(written[0][3], 1.0);
        assert_eq!(written[1][3], 1.0);
        assert!(written[0][1] < 1.0);
        assert!(written[1][2] < 1.0);
        assert!(velocities[0][1] < 0.0);
        assert!(written.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn test_damping_scales_velocity() {
        let read = vec![[0.0f32, 0.0, 0.0, 0.0]];
        let mut velocities = vec![[2.0f32, 0.0, 0.0, 1.0]];
        let mut written = vec![[0.0f32; 4]];
        let step = StepParams {
            delta_time: 1.0,
            damping: 0.5,
            softening_squared: 0.01,
        };

        integrate_range(&read, &mut velocities, &mut written, 0, &step);

        assert_eq!(velocities[0][0], 1.0);
        assert_eq!(written[0][0], 1.0);
        // inverse mass slot is left alone
        assert_eq!(velocities[0][3], 1.0);
    }
}
