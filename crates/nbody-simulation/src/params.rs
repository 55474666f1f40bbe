//! Body system configuration and demo presets

use bytemuck::{Pod, Zeroable};
use nbody_physics::{BodyDistribution, DEFAULT_BLOCK_SIZE, DEFAULT_DAMPING, DEFAULT_SOFTENING};

/// Construction parameters of a [`crate::BodySystem`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulationConfig {
    pub body_count: usize,
    /// Devices to spread the bodies over, starting with `primary_device`
    pub device_count: u32,
    /// Threads per block handed to the integrator as a hint
    pub block_size: u32,
    /// Keep positions in renderer-owned shared buffers
    pub use_interop: bool,
    /// Keep all state in pinned host memory (zero-copy)
    pub use_host_mapped: bool,
    /// Share one allocation between devices through peer access
    pub use_peer_to_peer: bool,
    pub primary_device: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            body_count: 16384,
            device_count: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            use_interop: false,
            use_host_mapped: false,
            use_peer_to_peer: false,
            primary_device: 0,
        }
    }
}

impl SimulationConfig {
    pub fn with_body_count(body_count: usize) -> Self {
        Self {
            body_count,
            ..Self::default()
        }
    }
}

/// Demo scene settings
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NBodyParams {
    pub time_step: f32,
    pub cluster_scale: f32,
    pub velocity_scale: f32,
    pub softening: f32,
    pub damping: f32,
    pub point_size: f32,
    /// Camera origin the renderer starts at
    pub camera_origin: [f32; 3],
}

impl Default for NBodyParams {
    fn default() -> Self {
        Self {
            time_step: 0.016,
            cluster_scale: 1.54,
            velocity_scale: 8.0,
            softening: DEFAULT_SOFTENING,
            damping: DEFAULT_DAMPING,
            point_size: 1.0,
            camera_origin: [0.0, -2.0, -100.0],
        }
    }
}

impl NBodyParams {
    /// Built-in demo scenes, cycled through by the driver
    pub const PRESETS: [NBodyParams; 7] = [
        NBodyParams {
            time_step: 0.016,
            cluster_scale: 1.54,
            velocity_scale: 8.0,
            softening: 0.1,
            damping: 1.0,
            point_size: 1.0,
            camera_origin: [0.0, -2.0, -100.0],
        },
        NBodyParams {
            time_step: 0.016,
            cluster_scale: 0.68,
            velocity_scale: 20.0,
            softening: 0.1,
            damping: 1.0,
            point_size: 0.8,
            camera_origin: [0.0, -2.0, -30.0],
        },
        NBodyParams {
            time_step: 0.0006,
            cluster_scale: 0.16,
            velocity_scale: 1000.0,
            softening: 1.0,
            damping: 1.0,
            point_size: 0.07,
            camera_origin: [0.0, 0.0, -1.5],
        },
        NBodyParams {
            time_step: 0.0006,
            cluster_scale: 0.16,
            velocity_scale: 1000.0,
            softening: 1.0,
            damping: 1.0,
            point_size: 0.07,
            camera_origin: [0.0, 0.0, -1.5],
        },
        NBodyParams {
            time_step: 0.0019,
            cluster_scale: 0.32,
            velocity_scale: 276.0,
            softening: 1.0,
            damping: 1.0,
            point_size: 0.07,
            camera_origin: [0.0, 0.0, -5.0],
        },
        NBodyParams {
            time_step: 0.0016,
            cluster_scale: 0.32,
            velocity_scale: 272.0,
            softening: 0.145,
            damping: 1.0,
            point_size: 0.08,
            camera_origin: [0.0, 0.0, -5.0],
        },
        NBodyParams {
            time_step: 0.016,
            cluster_scale: 6.04,
            velocity_scale: 0.0,
            softening: 1.0,
            damping: 1.0,
            point_size: 0.76,
            camera_origin: [0.0, 0.0, -50.0],
        },
    ];

    /// Preset `index`, wrapping around
    pub fn preset(index: usize) -> Self {
        Self::PRESETS[index % Self::PRESETS.len()]
    }

    /// Distribution the demo uses for a preset
    pub fn distribution(index: usize) -> BodyDistribution {
        match index % Self::PRESETS.len() {
            2 | 3 => BodyDistribution::Expand,
            6 => BodyDistribution::Random,
            _ => BodyDistribution::Shell,
        }
    }
}

/// Uniform block of the integration shader (matches WGSL `Params`)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct IntegrateParams {
    pub delta_time: f32,
    pub damping: f32,
    pub softening_sq: f32,
    pub _pad0: f32,
    pub offset: u32,
    pub count: u32,
    pub body_count: u32,
    pub _pad1: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout_is_two_vec4s() {
        assert_eq!(std::mem::size_of::<IntegrateParams>(), 32);
    }

    #[test]
    fn test_presets_wrap() {
        assert_eq!(NBodyParams::preset(7), NBodyParams::preset(0));
        assert_eq!(NBodyParams::distribution(9), BodyDistribution::Expand);
    }

    #[test]
    fn test_default_config_is_single_device() {
        let config = SimulationConfig::default();
        assert_eq!(config.device_count, 1);
        assert!(!config.use_interop && !config.use_host_mapped && !config.use_peer_to_peer);
    }
}
