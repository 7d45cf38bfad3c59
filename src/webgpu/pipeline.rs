//! WebGPU compute pipeline management

use crate::pipeline::{BindingKind, KernelInterface};
use crate::BenchmarkError;
use wgpu::{BindGroupLayout, ComputePipeline, Device};

/// WebGPU compute pipeline for a benchmark kernel
pub(crate) struct WebGpuPipeline {
    pub pipeline: ComputePipeline,
    pub bind_group_layout: BindGroupLayout,
}

fn buffer_binding(kind: BindingKind) -> wgpu::BufferBindingType {
    match kind {
        BindingKind::Constant => wgpu::BufferBindingType::Uniform,
        BindingKind::ReadOnly => wgpu::BufferBindingType::Storage { read_only: true },
        BindingKind::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
    }
}

impl WebGpuPipeline {
    /// Compile `source` and lay out bind group 0 from the kernel's declared
    /// bindings, in slot order
    pub fn new(
        device: &Device,
        interface: &KernelInterface,
        label: &str,
        source: &str,
    ) -> Result<Self, BenchmarkError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(BenchmarkError::ShaderCompilation(format!("{}: {}", label, error)));
        }

        let entries: Vec<wgpu::BindGroupLayoutEntry> = interface
            .bindings
            .iter()
            .enumerate()
            .map(|(slot, &kind)| wgpu::BindGroupLayoutEntry {
                binding: slot as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: buffer_binding(kind),
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Benchmark Bind Group Layout"),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Benchmark Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(interface.entry_point),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: Some(interface.entry_point),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(BenchmarkError::PipelineCreation(format!(
                "{}: {}",
                interface.entry_point, error
            )));
        }

        Ok(Self {
            pipeline,
            bind_group_layout,
        })
    }
}
