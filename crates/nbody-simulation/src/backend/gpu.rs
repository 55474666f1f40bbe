//! wgpu compute backend
//!
//! Exposes one adapter as a single device. Device buffers and shared (vertex)
//! buffers are both plain `wgpu::Buffer`s, so a renderer built on the same
//! `wgpu::Device` can draw straight from the position buffer. Mapping a shared
//! buffer for compute is bookkeeping only; wgpu orders queue work itself.
//!
//! Pinned host memory and peer access have no wgpu equivalent and are reported
//! as unsupported.

use super::{
    BufferId, BufferView, ComputeBackend, DeviceBuffer, DeviceCapabilities, DeviceId, Event,
    GraphicsResource, MapFlags, PinnedBuffer, SharedBuffer, SharedBufferId,
};
use crate::error::DeviceError;
use crate::integrator::{IntegrationJob, Integrator};
use crate::params::IntegrateParams;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const BACKEND_NAME: &str = "wgpu";
const DEVICE: DeviceId = DeviceId(0);
/// Fixed by `@workgroup_size` in the shader, whatever the job asks for
const WORKGROUP_SIZE: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Device,
    Shared,
}

struct GpuAllocation {
    buffer: wgpu::Buffer,
    kind: Kind,
}

#[derive(Default)]
struct GpuState {
    buffers: HashMap<BufferId, GpuAllocation>,
    events: HashMap<u64, Option<wgpu::SubmissionIndex>>,
    resources: HashMap<u64, (SharedBufferId, Option<MapFlags>)>,
}

impl GpuState {
    fn buffer(&self, view: BufferView) -> Result<&wgpu::Buffer, DeviceError> {
        if view.device != DEVICE {
            return Err(DeviceError::InvalidDevice(view.device));
        }
        let allocation = self
            .buffers
            .get(&view.buffer)
            .ok_or(DeviceError::InvalidBuffer(view.buffer))?;

        if allocation.kind == Kind::Shared {
            let mapped = self
                .resources
                .values()
                .any(|(buffer, flags)| buffer.0 == view.buffer.0 && flags.is_some());
            if !mapped {
                return Err(DeviceError::AccessDenied {
                    device: view.device,
                    buffer: view.buffer,
                });
            }
        }
        Ok(&allocation.buffer)
    }
}

/// Single-adapter backend on top of wgpu
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: DeviceCapabilities,
    state: Mutex<GpuState>,
    next_id: AtomicU64,
}

impl WgpuBackend {
    /// Open the default high-performance adapter without a surface.
    pub async fn new() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| DeviceError::Lost(format!("no adapter: {e}")))?;

        log::info!("Using GPU: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("N-Body Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                experimental_features: wgpu::ExperimentalFeatures::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| DeviceError::Lost(format!("device request failed: {e}")))?;

        Ok(Self::from_device(device, queue))
    }

    /// Share an existing device, typically the renderer's.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            capabilities: DeviceCapabilities {
                compute_units: 1,
                weight_class: nbody_physics::MODERN_WEIGHT_CLASS,
            },
            state: Mutex::new(GpuState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The vertex buffer behind a shared buffer, for the renderer to draw from
    pub fn vertex_buffer(&self, buffer: &SharedBuffer) -> Option<wgpu::Buffer> {
        self.lock()
            .buffers
            .get(&BufferId(buffer.id().0))
            .map(|allocation| allocation.buffer.clone())
    }

    fn lock(&self) -> MutexGuard<'_, GpuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_device(device: DeviceId) -> Result<(), DeviceError> {
        if device == DEVICE {
            Ok(())
        } else {
            Err(DeviceError::InvalidDevice(device))
        }
    }

    fn unsupported(operation: &'static str) -> DeviceError {
        DeviceError::Unsupported {
            backend: BACKEND_NAME,
            operation,
        }
    }

    fn wait(&self, submission_index: Option<wgpu::SubmissionIndex>) -> Result<(), DeviceError> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| DeviceError::Lost(e.to_string()))
    }

    fn create_buffer(&self, label: &str, bytes: usize, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes as u64,
            usage,
            mapped_at_creation: false,
        })
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn device_count(&self) -> u32 {
        1
    }

    fn capabilities(&self, device: DeviceId) -> Result<DeviceCapabilities, DeviceError> {
        Self::check_device(device)?;
        Ok(self.capabilities)
    }

    fn supports_mapped_host_memory(&self) -> bool {
        false
    }

    fn can_access_peer(&self, _device: DeviceId, _peer: DeviceId) -> bool {
        false
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<(), DeviceError> {
        Err(DeviceError::PeerAccessUnsupported { device, peer })
    }

    fn allocate(&self, device: DeviceId, bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        Self::check_device(device)?;
        let buffer = self.create_buffer(
            "Body Buffer",
            bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
        );

        let id = BufferId(self.next_id());
        self.lock().buffers.insert(
            id,
            GpuAllocation {
                buffer,
                kind: Kind::Device,
            },
        );
        Ok(DeviceBuffer::new(id, device, bytes))
    }

    fn free(&self, buffer: DeviceBuffer) -> Result<(), DeviceError> {
        let allocation = self
            .lock()
            .buffers
            .remove(&buffer.id())
            .ok_or(DeviceError::InvalidBuffer(buffer.id()))?;
        allocation.buffer.destroy();
        Ok(())
    }

    fn allocate_pinned(&self, _bytes: usize) -> Result<PinnedBuffer, DeviceError> {
        Err(Self::unsupported("mapped host memory"))
    }

    fn free_pinned(&self, buffer: PinnedBuffer) -> Result<(), DeviceError> {
        Err(DeviceError::InvalidBuffer(buffer.id()))
    }

    fn pinned_device_view(
        &self,
        _device: DeviceId,
        _buffer: &PinnedBuffer,
    ) -> Result<BufferView, DeviceError> {
        Err(Self::unsupported("mapped host memory"))
    }

    fn copy_to_device(&self, dst: BufferView, offset: usize, src: &[u8]) -> Result<(), DeviceError> {
        let state = self.lock();
        let buffer = state.buffer(dst)?;
        if (offset + src.len()) as u64 > buffer.size() {
            return Err(DeviceError::OutOfBounds {
                offset,
                len: src.len(),
                capacity: buffer.size() as usize,
            });
        }
        self.queue.write_buffer(buffer, offset as u64, src);
        let index = self.queue.submit(std::iter::empty());
        drop(state);
        self.wait(Some(index))
    }

    fn copy_to_host(&self, src: BufferView, dst: &mut [u8]) -> Result<(), DeviceError> {
        let size = dst.len() as u64;
        let staging = self.create_buffer(
            "Readback Staging Buffer",
            dst.len(),
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );

        {
            let state = self.lock();
            let buffer = state.buffer(src)?;
            if size > buffer.size() {
                return Err(DeviceError::OutOfBounds {
                    offset: 0,
                    len: dst.len(),
                    capacity: buffer.size() as usize,
                });
            }

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Readback Encoder"),
                });
            encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
            self.queue.submit(std::iter::once(encoder.finish()));
        }

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait(None)?;

        rx.recv()
            .map_err(|_| DeviceError::Lost("readback callback dropped".to_string()))?
            .map_err(|e| DeviceError::Lost(e.to_string()))?;

        {
            let data = slice.get_mapped_range();
            dst.copy_from_slice(&data);
        }
        staging.unmap();
        Ok(())
    }

    fn create_event(&self, device: DeviceId) -> Result<Event, DeviceError> {
        Self::check_device(device)?;
        let id = self.next_id();
        self.lock().events.insert(id, None);
        Ok(Event::new(id, device))
    }

    fn record_event(&self, event: &Event) -> Result<(), DeviceError> {
        let index = self.queue.submit(std::iter::empty());
        let mut state = self.lock();
        let slot = state
            .events
            .get_mut(&event.id())
            .ok_or_else(|| DeviceError::Lost(format!("event {} destroyed", event.id())))?;
        *slot = Some(index);
        Ok(())
    }

    fn synchronize_event(&self, event: &Event) -> Result<(), DeviceError> {
        let index = self
            .lock()
            .events
            .get(&event.id())
            .cloned()
            .ok_or_else(|| DeviceError::Lost(format!("event {} destroyed", event.id())))?;
        match index {
            Some(index) => self.wait(Some(index)),
            None => Ok(()),
        }
    }

    fn destroy_event(&self, event: Event) -> Result<(), DeviceError> {
        self.lock()
            .events
            .remove(&event.id())
            .map(|_| ())
            .ok_or_else(|| DeviceError::Lost(format!("event {} destroyed twice", event.id())))
    }

    fn synchronize(&self, device: DeviceId) -> Result<(), DeviceError> {
        Self::check_device(device)?;
        self.wait(None)
    }

    fn create_shared_buffer(&self, bytes: usize) -> Result<SharedBuffer, DeviceError> {
        let buffer = self.create_buffer(
            "Body Vertex Buffer",
            bytes,
            wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
        );

        let id = self.next_id();
        self.lock().buffers.insert(
            BufferId(id),
            GpuAllocation {
                buffer,
                kind: Kind::Shared,
            },
        );
        Ok(SharedBuffer::new(SharedBufferId(id), bytes))
    }

    fn shared_buffer_size(&self, buffer: &SharedBuffer) -> Result<usize, DeviceError> {
        let id = BufferId(buffer.id().0);
        self.lock()
            .buffers
            .get(&id)
            .map(|allocation| allocation.buffer.size() as usize)
            .ok_or(DeviceError::InvalidBuffer(id))
    }

    fn update_shared_buffer(
        &self,
        buffer: &SharedBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let state = self.lock();
        if let Some((resource, _)) = state
            .resources
            .iter()
            .find(|(_, (id, flags))| *id == buffer.id() && flags.is_some())
        {
            return Err(DeviceError::mapping(*resource, "mapped by compute"));
        }

        let id = BufferId(buffer.id().0);
        let target = &state
            .buffers
            .get(&id)
            .ok_or(DeviceError::InvalidBuffer(id))?
            .buffer;
        let end = (offset + data.len()).min(target.size() as usize);
        if offset < end {
            self.queue
                .write_buffer(target, offset as u64, &data[..end - offset]);
            self.queue.submit(std::iter::empty());
        }
        Ok(())
    }

    fn delete_shared_buffer(&self, buffer: SharedBuffer) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if let Some(resource) = state
            .resources
            .iter()
            .find_map(|(resource, (id, _))| (*id == buffer.id()).then_some(*resource))
        {
            return Err(DeviceError::mapping(resource, "buffer deleted while registered"));
        }
        let id = BufferId(buffer.id().0);
        let allocation = state
            .buffers
            .remove(&id)
            .ok_or(DeviceError::InvalidBuffer(id))?;
        allocation.buffer.destroy();
        Ok(())
    }

    fn register_shared_buffer(
        &self,
        device: DeviceId,
        buffer: &SharedBuffer,
    ) -> Result<GraphicsResource, DeviceError> {
        Self::check_device(device)?;
        let mut state = self.lock();
        let id = BufferId(buffer.id().0);
        if !state.buffers.contains_key(&id) {
            return Err(DeviceError::InvalidBuffer(id));
        }
        let resource = self.next_id();
        state.resources.insert(resource, (buffer.id(), None));
        Ok(GraphicsResource::new(resource, device, buffer.id()))
    }

    fn map_resource(
        &self,
        resource: &GraphicsResource,
        flags: MapFlags,
    ) -> Result<BufferView, DeviceError> {
        let mut state = self.lock();
        let (buffer, mapped) = state
            .resources
            .get_mut(&resource.id())
            .ok_or_else(|| DeviceError::mapping(resource.id(), "not registered"))?;
        if mapped.is_some() {
            return Err(DeviceError::mapping(resource.id(), "already mapped"));
        }
        *mapped = Some(flags);
        Ok(BufferView {
            device: resource.device(),
            buffer: BufferId(buffer.0),
        })
    }

    fn unmap_resource(&self, resource: &GraphicsResource) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let (_, mapped) = state
            .resources
            .get_mut(&resource.id())
            .ok_or_else(|| DeviceError::mapping(resource.id(), "not registered"))?;
        if mapped.take().is_none() {
            return Err(DeviceError::mapping(resource.id(), "not mapped"));
        }
        Ok(())
    }

    fn unregister_resource(&self, resource: GraphicsResource) -> Result<(), DeviceError> {
        let mut state = self.lock();
        match state.resources.get(&resource.id()) {
            None => Err(DeviceError::mapping(resource.id(), "not registered")),
            Some((_, Some(_))) => Err(DeviceError::mapping(resource.id(), "unregistered while mapped")),
            Some((_, None)) => {
                state.resources.remove(&resource.id());
                Ok(())
            }
        }
    }
}

/// Compute-shader integrator (single precision)
pub struct ShaderIntegrator {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
}

impl ShaderIntegrator {
    pub fn new(backend: &WgpuBackend) -> Self {
        let device = backend.device();

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Integration Compute Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/integrate.wgsl").into()),
        });

        let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Integration Bind Group Layout"),
            entries: &[
                storage(0, true),
                storage(1, false),
                storage(2, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Integration Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Integration Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Integration Params Buffer"),
            size: std::mem::size_of::<IntegrateParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        log::debug!("Integration pipeline created");

        Self {
            pipeline,
            bind_group_layout,
            params_buffer,
        }
    }
}

impl Integrator<WgpuBackend, f32> for ShaderIntegrator {
    fn integrate(&self, backend: &WgpuBackend, job: &IntegrationJob<f32>) -> Result<(), DeviceError> {
        if job.count == 0 {
            return Ok(());
        }

        let params = IntegrateParams {
            delta_time: job.delta_time,
            damping: job.damping,
            softening_sq: job.softening_squared,
            _pad0: 0.0,
            offset: job.offset as u32,
            count: job.count as u32,
            body_count: job.body_count as u32,
            _pad1: 0,
        };
        backend
            .queue()
            .write_buffer(&self.params_buffer, 0, bytemuck::cast_slice(&[params]));

        let state = backend.lock();
        let bind_group = backend.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Integration Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: state.buffer(job.read_positions)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: state.buffer(job.write_positions)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: state.buffer(job.velocities)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.params_buffer.as_entire_binding(),
                },
            ],
        });
        drop(state);

        let mut encoder = backend
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Integration Encoder"),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Integration Compute Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups((job.count as u32).div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        backend.queue().submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Option<WgpuBackend> {
        match pollster::block_on(WgpuBackend::new()) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping wgpu test: {e}");
                None
            }
        }
    }

    #[test]
    fn test_host_features_are_unsupported() {
        let Some(backend) = backend() else { return };
        assert_eq!(backend.device_count(), 1);
        assert!(!backend.supports_mapped_host_memory());
        assert!(backend.allocate_pinned(16).is_err());
        assert!(backend.enable_peer_access(DEVICE, DeviceId(1)).is_err());
    }

    #[test]
    fn test_device_round_trip() {
        let Some(backend) = backend() else { return };
        let buffer = backend.allocate(DEVICE, 32).expect("allocate");
        let data: Vec<u8> = (0..32).collect();
        backend
            .copy_to_device(buffer.view(), 0, &data)
            .expect("upload");

        let mut out = vec![0u8; 32];
        backend
            .copy_to_host(buffer.view(), &mut out)
            .expect("download");
        assert_eq!(out, data);
        backend.free(buffer).expect("free");
    }

    #[test]
    fn test_shader_matches_reference_kernel() {
        let Some(backend) = backend() else { return };
        let positions: Vec<f32> = vec![
            0.0, 0.0, 0.0, 1.0, //
            1.0, 0.0, 0.0, 2.0, //
            0.0, 1.5, 0.0, 1.0,
        ];
        let bytes = positions.len() * 4;
        let read = backend.allocate(DEVICE, bytes).expect("read");
        let write = backend.allocate(DEVICE, bytes).expect("write");
        let velocity = backend.allocate(DEVICE, bytes).expect("velocity");
        backend
            .copy_to_device(read.view(), 0, bytemuck::cast_slice(&positions))
            .expect("upload");
        backend
            .copy_to_device(velocity.view(), 0, &vec![0u8; bytes])
            .expect("zero velocities");

        let job = IntegrationJob {
            device: DEVICE,
            offset: 0,
            count: 3,
            body_count: 3,
            read_positions: read.view(),
            write_positions: write.view(),
            velocities: velocity.view(),
            delta_time: 0.01,
            damping: 0.995,
            softening_squared: 0.01,
            block_size: 256,
            uses_shared_buffer: false,
        };
        ShaderIntegrator::new(&backend)
            .integrate(&backend, &job)
            .expect("integrate");

        let mut gpu = vec![0f32; positions.len()];
        backend
            .copy_to_host(write.view(), bytemuck::cast_slice_mut(&mut gpu))
            .expect("download");

        let bodies: Vec<[f32; 4]> = bytemuck::cast_slice(&positions).to_vec();
        let mut velocities = vec![[0f32; 4]; 3];
        let mut expected = vec![[0f32; 4]; 3];
        nbody_physics::integrate_range(
            &bodies,
            &mut velocities,
            &mut expected,
            0,
            &nbody_physics::StepParams {
                delta_time: 0.01,
                damping: 0.995,
                softening_squared: 0.01,
            },
        );
        for (g, e) in gpu.iter().zip(expected.iter().flatten()) {
            assert!((g - e).abs() < 1e-4, "{g} vs {e}");
        }

        for buffer in [read, write, velocity] {
            backend.free(buffer).expect("free");
        }
    }
}
