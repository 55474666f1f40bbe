//! Headless N-body driver
//!
//! Steps a demo scene on emulated host devices and, when a GPU adapter is
//! present, on wgpu with the positions kept in a shared vertex buffer.

use glam::Vec3;
use nbody_physics::generate_bodies;
use nbody_simulation::{
    BodyArray, BodySystem, ComputeBackend, HostBackend, HostBackendConfig, HostIntegrator,
    Integrator, NBodyParams, ShaderIntegrator, SimulationConfig, WgpuBackend,
};
use std::sync::Arc;
use std::time::Instant;

const BODY_COUNT: usize = 4096;
const STEPS: usize = 100;
const LOG_EVERY: usize = 25;
const EMULATED_DEVICES: usize = 2;
const PRESET: usize = 1;

/// Center of mass and kinetic energy of a snapshot
fn summarize(positions: &[f32], velocities: &[f32]) -> (Vec3, f32) {
    let mut weighted = Vec3::ZERO;
    let mut total_mass = 0.0;
    let mut kinetic = 0.0;

    for (p, v) in positions.chunks_exact(4).zip(velocities.chunks_exact(4)) {
        let mass = p[3];
        weighted += Vec3::new(p[0], p[1], p[2]) * mass;
        total_mass += mass;
        kinetic += 0.5 * mass * Vec3::new(v[0], v[1], v[2]).length_squared();
    }

    let center = if total_mass > 0.0 {
        weighted / total_mass
    } else {
        Vec3::ZERO
    };
    (center, kinetic)
}

fn simulate<B, I>(
    label: &str,
    backend: Arc<B>,
    integrator: I,
    config: SimulationConfig,
) -> nbody_simulation::Result<()>
where
    B: ComputeBackend,
    I: Integrator<B, f32>,
{
    let params = NBodyParams::preset(PRESET);
    let mut system = BodySystem::<f32, B, I>::new(backend, integrator, config)?;
    system.set_softening(params.softening)?;
    system.set_damping(params.damping)?;

    let bodies = generate_bodies::<f32>(
        NBodyParams::distribution(PRESET),
        config.body_count,
        f64::from(params.cluster_scale),
        f64::from(params.velocity_scale),
        rand::random(),
    );
    system.set_array(BodyArray::Position, bodies.flat_positions())?;
    system.set_array(BodyArray::Velocity, bodies.flat_velocities())?;

    log::info!(
        "[{}] {} bodies, {:?}, {} device(s)",
        label,
        system.body_count(),
        system.memory_mode(),
        system.devices().len()
    );

    let start = Instant::now();
    for step in 1..=STEPS {
        system.update(params.time_step)?;

        if step % LOG_EVERY == 0 {
            let positions = system.get_array(BodyArray::Position)?.to_vec();
            let velocities = system.get_array(BodyArray::Velocity)?.to_vec();
            let (center, kinetic) = summarize(&positions, &velocities);
            log::info!(
                "[{}] step {:>4}: center of mass {:.4}, kinetic energy {:.4}",
                label,
                step,
                center,
                kinetic
            );
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    let interactions = (config.body_count * config.body_count * STEPS) as f64;
    log::info!(
        "[{}] {} steps in {:.2}s ({:.1} M interactions/s)",
        label,
        STEPS,
        elapsed,
        interactions / elapsed / 1e6
    );
    Ok(())
}

fn main() {
    // Initialize logger (RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting headless N-body simulation...");

    let host = match HostBackend::new(HostBackendConfig::uniform(EMULATED_DEVICES)) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            log::error!("Failed to start host backend: {}", e);
            std::process::exit(1);
        }
    };
    let host_config = SimulationConfig {
        device_count: EMULATED_DEVICES as u32,
        use_peer_to_peer: true,
        ..SimulationConfig::with_body_count(BODY_COUNT)
    };
    if let Err(e) = simulate("host", host, HostIntegrator::new(), host_config) {
        log::error!("Host simulation failed: {}", e);
        std::process::exit(1);
    }

    match pollster::block_on(WgpuBackend::new()) {
        Ok(backend) => {
            let integrator = ShaderIntegrator::new(&backend);
            let gpu_config = SimulationConfig {
                use_interop: true,
                ..SimulationConfig::with_body_count(BODY_COUNT)
            };
            if let Err(e) = simulate("wgpu", Arc::new(backend), integrator, gpu_config) {
                log::error!("GPU simulation failed: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => log::warn!("Skipping GPU run: {}", e),
    }
}
