//! GPU compute backend via wgpu.
//!
//! # Precision
//!
//! WGSL has no native f64 support, so the tilt kernel runs in f32. Inputs
//! are narrowed on upload and the amplitudes widened on read-back by the
//! caller.
//!
//! # Buffers
//!
//! Every handle maps to one `wgpu::Buffer`. Uniform buffers are padded to
//! 16 bytes; storage buffers can also be copied out for read-back.

use std::borrow::Cow;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::backend::{
    BackendType, Binding, BufferHandle, BufferUsage, ComputeBackend, DeviceInfo, KernelId,
};
use crate::error::{invalid, Result, SsnpError};

const UNIFORM_ALIGNMENT: usize = 16;

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
    usage: BufferUsage,
}

/// GPU compute backend using wgpu.
///
/// Holds the device, queue and the compiled tilt pipeline. Buffers are
/// tracked by handle until released.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    tilt_pipeline: wgpu::ComputePipeline,
    tilt_layout: wgpu::BindGroupLayout,
    device_name: String,
    buffers: Mutex<HashMap<u64, GpuBuffer>>,
    next_id: AtomicU64,
}

fn layout_entry(binding: u32, usage: BufferUsage) -> wgpu::BindGroupLayoutEntry {
    let ty = match usage {
        BufferUsage::ReadOnlyStorage => wgpu::BufferBindingType::Storage { read_only: true },
        BufferUsage::Storage => wgpu::BufferBindingType::Storage { read_only: false },
        BufferUsage::Uniform => wgpu::BufferBindingType::Uniform,
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl WgpuBackend {
    /// Create a new GPU backend asynchronously.
    ///
    /// Any failure to find an adapter, open a device or build the kernel is
    /// reported as [`SsnpError::ResourceExhausted`].
    pub async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| SsnpError::ResourceExhausted("no GPU adapter found".into()))?;

        let device_name = adapter.get_info().name.clone();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("ssnp"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| SsnpError::ResourceExhausted(format!("failed to create device: {e}")))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("tilt_shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/tilt.wgsl"))),
        });

        let entries: Vec<wgpu::BindGroupLayoutEntry> = KernelId::Tilt
            .layout()
            .iter()
            .enumerate()
            .map(|(slot, &usage)| layout_entry(slot as u32, usage))
            .collect();
        let tilt_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("tilt_bind_group_layout"),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("tilt_pipeline_layout"),
            bind_group_layouts: &[&tilt_layout],
            push_constant_ranges: &[],
        });

        let tilt_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("tilt_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        if let Some(error) = device.pop_error_scope().await {
            return Err(SsnpError::ResourceExhausted(format!(
                "failed to build tilt kernel: {error}"
            )));
        }

        Ok(Self {
            device,
            queue,
            tilt_pipeline,
            tilt_layout,
            device_name,
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Create a new GPU backend, blocking the current thread.
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<u64, GpuBuffer>>> {
        self.buffers
            .lock()
            .map_err(|_| SsnpError::ResourceExhausted("GPU buffer table is poisoned".into()))
    }
}

impl ComputeBackend for WgpuBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("GPU ({})", self.device_name),
            backend_type: BackendType::Gpu,
            memory_bytes: None,
        }
    }

    fn allocate_buffer(&self, data: &[u8], usage: BufferUsage) -> Result<BufferHandle> {
        let limits = self.device.limits();
        let (size, flags) = match usage {
            BufferUsage::Uniform => (
                data.len().max(1).next_multiple_of(UNIFORM_ALIGNMENT),
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            ),
            BufferUsage::ReadOnlyStorage | BufferUsage::Storage => (
                data.len().max(4).next_multiple_of(4),
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            ),
        };
        let size = size as u64;
        let binding_limit = match usage {
            BufferUsage::Uniform => limits.max_uniform_buffer_binding_size as u64,
            _ => limits.max_storage_buffer_binding_size as u64,
        };
        if size > limits.max_buffer_size || size > binding_limit {
            return Err(SsnpError::ResourceExhausted(format!(
                "buffer of {size} bytes exceeds device limits"
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ssnp_buffer"),
            size,
            usage: flags,
            mapped_at_creation: false,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(SsnpError::ResourceExhausted(format!(
                "failed to allocate {size} bytes: {error}"
            )));
        }
        if !data.is_empty() {
            // write_buffer needs a multiple of 4 bytes
            let mut padded = data.to_vec();
            padded.resize(data.len().next_multiple_of(4), 0);
            self.queue.write_buffer(&buffer, 0, &padded);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table()?.insert(id, GpuBuffer { buffer, size, usage });
        Ok(BufferHandle::new(id))
    }

    fn dispatch(&self, kernel: KernelId, bindings: &[Binding], workgroups: u32) -> Result<()> {
        let layout = kernel.layout();
        if bindings.len() != layout.len() {
            return invalid(format!(
                "{} kernel takes {} bindings, got {}",
                kernel.name(),
                layout.len(),
                bindings.len()
            ));
        }

        let table = self.table()?;
        let mut entries = Vec::with_capacity(bindings.len());
        for (expected, binding) in bindings.iter().enumerate() {
            let buffer = table
                .get(&binding.handle.id())
                .ok_or_else(|| SsnpError::InvalidArgument(format!("unknown {}", binding.handle)))?;
            if binding.slot as usize != expected || buffer.usage != layout[expected] {
                return invalid(format!(
                    "{} does not fit slot {} of the {} kernel",
                    binding.handle,
                    expected,
                    kernel.name()
                ));
            }
            if binding.offset.checked_add(binding.size).is_none_or(|end| end > buffer.size) {
                return invalid(format!(
                    "slot {} range exceeds {} of {} bytes",
                    expected, binding.handle, buffer.size
                ));
            }
            entries.push(wgpu::BindGroupEntry {
                binding: binding.slot,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer.buffer,
                    offset: binding.offset,
                    size: NonZeroU64::new(binding.size),
                }),
            });
        }

        let pipeline = match kernel {
            KernelId::Tilt => &self.tilt_pipeline,
        };
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tilt_bind_group"),
            layout: &self.tilt_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tilt_encoder"),
            });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("tilt_pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(workgroups, 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        drop(table);

        self.device.poll(wgpu::Maintain::Wait);
        debug!(kernel = kernel.name(), workgroups, "GPU dispatch complete");
        Ok(())
    }

    fn read_back(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        let table = self.table()?;
        let source = table
            .get(&handle.id())
            .ok_or_else(|| SsnpError::InvalidArgument(format!("unknown {handle}")))?;
        if source.usage == BufferUsage::Uniform {
            return invalid(format!("{handle} is a uniform buffer and cannot be read back"));
        }
        let size = source.size;

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging_buffer, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));
        drop(table);

        let staging_slice = staging_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        staging_slice.map_async(wgpu::MapMode::Read, move |result| {
            // receiver outlives the poll below
            let _ = sender.send(result);
        });

        self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|e| SsnpError::ResourceExhausted(format!("map recv failed: {e}")))?
            .map_err(|e| SsnpError::ResourceExhausted(format!("buffer map failed: {e}")))?;

        let data = staging_slice.get_mapped_range();
        let bytes = data.to_vec();
        drop(data);
        staging_buffer.unmap();
        staging_buffer.destroy();

        Ok(bytes)
    }

    fn release(&self, handle: BufferHandle) {
        if let Ok(mut table) = self.buffers.lock() {
            if let Some(entry) = table.remove(&handle.id()) {
                entry.buffer.destroy();
            }
        }
    }
}
