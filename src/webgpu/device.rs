//! WebGPU device and queue management

use super::pipeline::WebGpuPipeline;
use super::queue::{self, Fence, GpuQuerySet, Resources, TIMESTAMP_SIZE};
use crate::driver::{
    BufferDesc, BufferId, BufferRole, Command, Driver, PipelineId, QuerySetId, ShaderBlob,
};
use crate::pipeline::KernelInterface;
use crate::BenchmarkError;
use log::{debug, info};
use std::collections::HashMap;
use wgpu::{Adapter, Device, Instance, Queue};

/// Timestamp writes between passes need both features
const REQUIRED_FEATURES: wgpu::Features =
    wgpu::Features::TIMESTAMP_QUERY.union(wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS);

fn aligned(size: u64) -> u64 {
    size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

fn usage_for(role: BufferRole) -> wgpu::BufferUsages {
    use wgpu::BufferUsages as U;
    match role {
        BufferRole::Storage => U::STORAGE | U::COPY_DST | U::COPY_SRC,
        BufferRole::Constant => U::UNIFORM | U::COPY_DST,
        BufferRole::Upload => U::MAP_WRITE | U::COPY_SRC,
        BufferRole::Readback => U::MAP_READ | U::COPY_DST,
    }
}

/// Driver for the first high-performance adapter wgpu finds
pub struct WebGpuDriver {
    #[allow(dead_code)]
    instance: Instance,
    adapter: Adapter,
    device: Device,
    queue: Queue,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    query_sets: HashMap<QuerySetId, GpuQuerySet>,
    pipelines: HashMap<PipelineId, WebGpuPipeline>,
    fence: Fence,
}

impl WebGpuDriver {
    /// Open the device. Fails if no adapter exists or it lacks timestamp
    /// queries; there is no fallback.
    pub fn new() -> Result<Self, BenchmarkError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, BenchmarkError> {
        let instance = Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(BenchmarkError::NoDevice)?;

        let missing = REQUIRED_FEATURES - adapter.features();
        if !missing.is_empty() {
            return Err(BenchmarkError::MissingFeature(format!("{:?}", missing)));
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Benchmark Device"),
                    required_features: REQUIRED_FEATURES,
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| BenchmarkError::BackendNotAvailable(e.to_string()))?;

        let info = adapter.get_info();
        info!("Selected adapter {} ({:?})", info.name, info.device_type);

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            buffers: HashMap::new(),
            query_sets: HashMap::new(),
            pipelines: HashMap::new(),
            fence: Fence::default(),
        })
    }

    fn buffer(&self, id: BufferId) -> Result<&wgpu::Buffer, BenchmarkError> {
        self.buffers
            .get(&id)
            .ok_or_else(|| BenchmarkError::Execution(format!("unknown buffer {:?}", id)))
    }
}

impl Driver for WebGpuDriver {
    fn device_name(&self) -> String {
        let info = self.adapter.get_info();
        format!("{} ({})", info.name, info.backend.to_str())
    }

    fn timestamp_frequency(&self) -> f64 {
        // A zero period yields inf, which TimestampQuery::new rejects
        1e9 / self.queue.get_timestamp_period() as f64
    }

    fn max_workgroups_per_dimension(&self) -> u32 {
        self.device.limits().max_compute_workgroups_per_dimension
    }

    fn create_buffer(&mut self, id: BufferId, desc: &BufferDesc) -> Result<(), BenchmarkError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: aligned(desc.size),
            usage: usage_for(desc.role),
            mapped_at_creation: false,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BenchmarkError::BufferCreation(format!("{}: {}", desc.label, error)));
        }
        self.buffers.insert(id, buffer);
        Ok(())
    }

    fn create_upload_buffer(
        &mut self,
        id: BufferId,
        desc: &BufferDesc,
        contents: &[u8],
    ) -> Result<(), BenchmarkError> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: aligned(desc.size),
            usage: usage_for(BufferRole::Upload),
            mapped_at_creation: true,
        });
        buffer.slice(..).get_mapped_range_mut()[..contents.len()].copy_from_slice(contents);
        buffer.unmap();
        self.buffers.insert(id, buffer);
        Ok(())
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            buffer.destroy();
        }
    }

    fn create_query_set(&mut self, id: QuerySetId, count: u32) -> Result<(), BenchmarkError> {
        let set = self.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("Timestamp Queries"),
            ty: wgpu::QueryType::Timestamp,
            count,
        });
        let resolve = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Timestamp Resolve"),
            size: count as u64 * TIMESTAMP_SIZE,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        self.query_sets.insert(id, GpuQuerySet { set, resolve });
        Ok(())
    }

    fn create_pipeline(
        &mut self,
        id: PipelineId,
        interface: &KernelInterface,
        blob: &ShaderBlob,
    ) -> Result<(), BenchmarkError> {
        let source = std::str::from_utf8(&blob.bytes).map_err(|e| {
            BenchmarkError::ShaderCompilation(format!(
                "'{}' is not valid WGSL text: {}",
                blob.label, e
            ))
        })?;
        let pipeline = WebGpuPipeline::new(&self.device, interface, &blob.label, source)?;
        self.pipelines.insert(id, pipeline);
        Ok(())
    }

    fn execute(&mut self, commands: Vec<Command>) -> Result<(), BenchmarkError> {
        let resources = Resources {
            device: &self.device,
            buffers: &self.buffers,
            query_sets: &self.query_sets,
            pipelines: &self.pipelines,
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let encoded = queue::encode(&resources, &commands)
            .map(|command_buffer| self.queue.submit(std::iter::once(command_buffer)));
        let scope = pollster::block_on(self.device.pop_error_scope());
        encoded?;
        if let Some(error) = scope {
            return Err(BenchmarkError::Execution(error.to_string()));
        }
        debug!("Submitted {} commands to the wgpu queue", commands.len());
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<(), BenchmarkError> {
        self.fence.signal(&self.queue, value);
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.fence.completed()
    }

    fn wait_for(&mut self, value: u64) -> Result<(), BenchmarkError> {
        self.fence.wait(&self.device, value)
    }

    fn read_buffer(&mut self, id: BufferId, size: u64) -> Result<Vec<u8>, BenchmarkError> {
        let buffer = self.buffer(id)?;
        let mut data = queue::read_mapped(&self.device, buffer, aligned(size))?;
        data.truncate(size as usize);
        Ok(data)
    }
}
