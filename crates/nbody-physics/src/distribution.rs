//! Initial body configurations
//!
//! Generates starting positions and velocities for a body system. All
//! distributions give every body unit mass (`w = 1`) and unit inverse mass in
//! the velocity `w` slot.

use crate::constants::{REFERENCE_BODY_COUNT, SHELL_INNER_RADIUS, SHELL_OUTER_RADIUS};
use crate::scalar::{Scalar, Vec4};
use glam::DVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Shape of the initial cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyDistribution {
    /// Uniform ball with random velocities
    Random,
    /// Thick spherical shell rotating around the z axis
    Shell,
    /// Uniform ball expanding outward from its center
    Expand,
}

/// Host-side positions and velocities for `body_count` bodies
#[derive(Debug, Clone, PartialEq)]
pub struct BodyState<T> {
    pub positions: Vec<Vec4<T>>,
    pub velocities: Vec<Vec4<T>>,
}

impl<T: Scalar> BodyState<T> {
    pub fn body_count(&self) -> usize {
        self.positions.len()
    }

    /// Positions as a flat `4 * body_count` scalar slice
    pub fn flat_positions(&self) -> &[T] {
        bytemuck::cast_slice(&self.positions)
    }

    /// Velocities as a flat `4 * body_count` scalar slice
    pub fn flat_velocities(&self) -> &[T] {
        bytemuck::cast_slice(&self.velocities)
    }
}

/// Generate `body_count` bodies using `distribution`.
///
/// The same `seed` always produces the same bodies.
pub fn generate_bodies<T: Scalar>(
    distribution: BodyDistribution,
    body_count: usize,
    cluster_scale: f64,
    velocity_scale: f64,
    seed: u64,
) -> BodyState<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut positions = Vec::with_capacity(body_count);
    let mut velocities = Vec::with_capacity(body_count);

    match distribution {
        BodyDistribution::Random => {
            let scale = cluster_scale * (body_count as f64 / REFERENCE_BODY_COUNT).max(1.0);
            let vscale = velocity_scale * scale;

            while positions.len() < body_count {
                let point = random_in_unit_ball(&mut rng);
                let velocity = random_in_unit_ball(&mut rng);
                positions.push(to_vec4(point * scale, 1.0));
                velocities.push(to_vec4(velocity * vscale, 1.0));
            }
        }
        BodyDistribution::Shell => {
            let scale = cluster_scale;
            let vscale = scale * velocity_scale;
            let inner = SHELL_INNER_RADIUS * scale;
            let outer = SHELL_OUTER_RADIUS * scale;

            while positions.len() < body_count {
                let point = random_in_unit_ball(&mut rng);
                // Degenerate directions can't be normalized
                let Some(direction) = point.try_normalize() else {
                    continue;
                };

                let radius = inner + (outer - inner) * rng.random::<f64>();
                let position = direction * radius;

                let mut axis = DVec3::Z;
                if 1.0 - direction.dot(axis) < 1e-6 {
                    axis = DVec3::new(direction.y, direction.x, axis.z).normalize();
                }
                let velocity = position.cross(axis);

                positions.push(to_vec4(position, 1.0));
                velocities.push(to_vec4(velocity * vscale, 1.0));
            }
        }
        BodyDistribution::Expand => {
            let mut scale = cluster_scale * body_count as f64 / REFERENCE_BODY_COUNT;
            if scale < 1.0 {
                scale = cluster_scale;
            }
            let vscale = scale * velocity_scale;

            while positions.len() < body_count {
                let point = random_in_unit_ball(&mut rng);
                positions.push(to_vec4(point * scale, 1.0));
                velocities.push(to_vec4(point * vscale, 1.0));
            }
        }
    }

    BodyState {
        positions,
        velocities,
    }
}

/// Rejection-sample a point inside the unit ball
fn random_in_unit_ball(rng: &mut StdRng) -> DVec3 {
    loop {
        let point = DVec3::new(
            rng.random_range(-1.0..=1.0),
            rng.random_range(-1.0..=1.0),
            rng.random_range(-1.0..=1.0),
        );
        if point.length_squared() <= 1.0 {
            return point;
        }
    }
}

fn to_vec4<T: Scalar>(v: DVec3, w: f64) -> Vec4<T> {
    [
        T::from_f64(v.x),
        T::from_f64(v.y),
        T::from_f64(v.z),
        T::from_f64(w),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_requested_count() {
        for distribution in [
            BodyDistribution::Random,
            BodyDistribution::Shell,
            BodyDistribution::Expand,
        ] {
            let state = generate_bodies::<f32>(distribution, 300, 1.54, 8.0, 7);
            assert_eq!(state.body_count(), 300);
            assert_eq!(state.velocities.len(), 300);
            assert_eq!(state.flat_positions().len(), 1200);
            assert!(state.positions.iter().all(|p| p[3] == 1.0));
        }
    }

    #[test]
    fn test_same_seed_same_bodies() {
        let a = generate_bodies::<f64>(BodyDistribution::Random, 64, 1.0, 1.0, 42);
        let b = generate_bodies::<f64>(BodyDistribution::Random, 64, 1.0, 1.0, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn test_shell_stays_between_radii() {
        let scale = 0.5;
        let state = generate_bodies::<f64>(BodyDistribution::Shell, 500, scale, 1.0, 3);
        for p in &state.positions {
            let r = DVec3::new(p[0], p[1], p[2]).length();
            assert!(r >= SHELL_INNER_RADIUS * scale - 1e-9);
            assert!(r <= SHELL_OUTER_RADIUS * scale + 1e-9);
        }
    }

    #[test]
    fn test_expand_velocity_points_outward() {
        let state = generate_bodies::<f64>(BodyDistribution::Expand, 128, 1.0, 2.0, 9);
        for (p, v) in state.positions.iter().zip(&state.velocities) {
            let dot = p[0] * v[0] + p[1] * v[1] + p[2] * v[2];
            assert!(dot >= 0.0);
        }
    }
}
