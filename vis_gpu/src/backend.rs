//! [`ComputeBackend`] on top of wgpu storage buffers.
//!
//! Every resource is one storage buffer. A dispatch binds its parameter blob
//! as a uniform at binding 0 followed by the resources, in order, as
//! read-write storage buffers. Pipelines are built lazily per kernel and
//! binding count.

use std::{collections::HashMap, sync::Arc};

use pollster::block_on;
use vis_api::prelude::*;
use wgpu::util::{BufferInitDescriptor, DeviceExt, DownloadBuffer};

use crate::{context::GpuContext, kernels};

/// Smallest buffer handed to wgpu.
const MIN_BUFFER_SIZE: u64 = 16;

struct StoredBuffer {
    buffer: wgpu::Buffer,
    label: &'static str,
    size: u64,
}

struct KernelPipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    buffers: HashMap<ResourceId, StoredBuffer>,
    pipelines: HashMap<(KernelId, usize), KernelPipeline>,
    next_id: u64,
}

/// Saturates so that oversized requests still fail the limit check.
fn padded_size(size: u64) -> u64 {
    size.max(MIN_BUFFER_SIZE)
        .checked_next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
        .unwrap_or(u64::MAX)
}

fn bind_group_layout(device: &wgpu::Device, kernel: KernelId, storage: usize) -> wgpu::BindGroupLayout {
    let mut entries = Vec::with_capacity(storage + 1);
    entries.push(wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    });
    for binding in 1..=storage as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(kernel.label()),
        entries: &entries,
    })
}

impl WgpuBackend {
    pub fn new(gpu: &GpuContext) -> Self {
        Self {
            device: Arc::clone(&gpu.device),
            queue: Arc::clone(&gpu.queue),
            buffers: HashMap::new(),
            pipelines: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, id: ResourceId) -> Result<&StoredBuffer, BackendError> {
        self.buffers.get(&id).ok_or(BackendError::UnknownResource(id))
    }

    fn pipeline(&mut self, kernel: KernelId, storage: usize) -> Result<&KernelPipeline, BackendError> {
        if !self.pipelines.contains_key(&(kernel, storage)) {
            let built = self.build_pipeline(kernel, storage)?;
            log::debug!("built pipeline `{kernel}` with {storage} storage bindings");
            self.pipelines.insert((kernel, storage), built);
        }
        self.pipelines
            .get(&(kernel, storage))
            .ok_or(BackendError::MissingKernel(kernel))
    }

    fn build_pipeline(&self, kernel: KernelId, storage: usize) -> Result<KernelPipeline, BackendError> {
        let source = kernels::source(kernel, storage).ok_or(BackendError::MissingKernel(kernel))?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.label()),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let layout = bind_group_layout(&self.device, kernel, storage);
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kernel.label()),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.label()),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Kernel {
                kernel,
                reason: err.to_string(),
            });
        }
        Ok(KernelPipeline { pipeline, layout })
    }

    fn wait(&self) {
        if let Err(err) = self.device.poll(wgpu::PollType::Wait) {
            log::warn!("device poll failed: {err}");
        }
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn allocate(&mut self, desc: &ResourceDesc) -> Result<ResourceId, BackendError> {
        let size = padded_size(desc.byte_size()?);
        let limits = self.device.limits();
        let max = limits
            .max_buffer_size
            .min(limits.max_storage_buffer_binding_size as u64);
        if size > max {
            return Err(BackendError::Allocation {
                label: desc.label,
                size,
                reason: format!("exceeds the device limit of {max} bytes"),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Allocation {
                label: desc.label,
                size,
                reason: err.to_string(),
            });
        }

        let id = ResourceId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(
            id,
            StoredBuffer {
                buffer,
                label: desc.label,
                size,
            },
        );
        Ok(id)
    }

    fn release(&mut self, id: ResourceId) {
        match self.buffers.remove(&id) {
            Some(stored) => {
                log::trace!("releasing {id} `{}`", stored.label);
                stored.buffer.destroy();
            }
            None => log::warn!("release of unknown resource {id}"),
        }
    }

    fn upload(&mut self, target: ResourceId, bytes: &[u8]) -> Result<(), BackendError> {
        let stored = self.buffer(target)?;
        if bytes.len() as u64 > stored.size {
            return Err(BackendError::UploadOverflow {
                id: target,
                len: bytes.len(),
                capacity: stored.size,
            });
        }
        let aligned = bytes.len() - bytes.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize;
        if aligned > 0 {
            self.queue.write_buffer(&stored.buffer, 0, &bytes[..aligned]);
        }
        if aligned < bytes.len() {
            let mut tail = [0u8; wgpu::COPY_BUFFER_ALIGNMENT as usize];
            tail[..bytes.len() - aligned].copy_from_slice(&bytes[aligned..]);
            self.queue.write_buffer(&stored.buffer, aligned as u64, &tail);
        }
        Ok(())
    }

    fn run_kernel(&mut self, dispatch: &KernelDispatch<'_>) -> Result<(), BackendError> {
        let kernel = dispatch.kernel;
        let limit = self.device.limits().max_compute_workgroups_per_dimension;
        let workgroups = kernels::fold_linear(kernel, dispatch.workgroups, limit);
        if workgroups.iter().any(|&n| n > limit) {
            return Err(BackendError::Kernel {
                kernel,
                reason: format!("workgroups {workgroups:?} exceed {limit}"),
            });
        }
        if workgroups.contains(&0) {
            return Ok(());
        }

        let mut params = dispatch.params.to_vec();
        params.resize(padded_size(params.len() as u64) as usize, 0);
        let uniform = self.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("vis_gpu::params"),
            contents: &params,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let storage = dispatch.resources.len();
        self.pipeline(kernel, storage)?;
        let compiled = self
            .pipelines
            .get(&(kernel, storage))
            .ok_or(BackendError::MissingKernel(kernel))?;
        let buffers = dispatch
            .resources
            .iter()
            .map(|id| self.buffer(*id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(storage + 1);
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        });
        for (i, stored) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: stored.buffer.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.label()),
            layout: &compiled.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.label()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.label()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&compiled.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let [x, y, z] = workgroups;
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_back(&mut self, resource: ResourceId) -> Result<Vec<u8>, BackendError> {
        let stored = self.buffer(resource)?;
        let (tx, rx) = flume::bounded(1);
        DownloadBuffer::read_buffer(&self.device, &self.queue, &stored.buffer.slice(..), move |result| {
            let _ = tx.send(result.map(|download| download.to_vec()));
        });
        self.wait();
        match rx.recv() {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(BackendError::Readback {
                id: resource,
                reason: err.to_string(),
            }),
            Err(err) => Err(BackendError::Readback {
                id: resource,
                reason: err.to_string(),
            }),
        }
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            log::warn!("wgpu backend dropped with {} live buffers", self.buffers.len());
        }
        for (_, stored) in self.buffers.drain() {
            stored.buffer.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizes_are_copy_aligned() {
        assert_eq!(padded_size(0), 16);
        assert_eq!(padded_size(17), 20);
        assert_eq!(padded_size(64), 64);
        assert_eq!(padded_size(u64::MAX - 1), u64::MAX);
    }

    /// Needs an adapter; skipped quietly on machines without one.
    #[test]
    fn interpolation_runs_on_the_device() {
        let Ok(gpu) = GpuContext::new() else {
            return;
        };
        let device = ComputeDevice::new(WgpuBackend::new(&gpu));
        let desc = |label| ResourceDesc::volume(label, [2, 2, 1], 4);
        let (Ok(a), Ok(b), Ok(out)) = (device.allocate(desc("a")), device.allocate(desc("b")), device.allocate(desc("out"))) else {
            panic!("allocation failed");
        };
        device
            .upload(&a, bytemuck::cast_slice(&[0.0f32, 1.0, 2.0, 3.0]))
            .expect("upload a");
        device
            .upload(&b, bytemuck::cast_slice(&[4.0f32, 5.0, 6.0, 7.0]))
            .expect("upload b");
        let params: [u32; 8] = [2, 2, 1, 1, 0.25f32.to_bits(), 0, 0, 0];
        device
            .dispatch(
                KernelId::InterpolateTimesteps,
                bytemuck::cast_slice(&params),
                &[&a, &b, &out],
                [1, 1, 1],
            )
            .expect("dispatch");
        let values = read_f32s(&device.read_back(&out).expect("read back"));
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
