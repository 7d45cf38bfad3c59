//! Command list encoding and host synchronization for the wgpu queue

use super::pipeline::WebGpuPipeline;
use crate::driver::{BufferId, Command, PipelineId, QuerySetId};
use crate::BenchmarkError;
use log::trace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) const TIMESTAMP_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Timestamp query set with the buffer its slots resolve into. Resolved
/// ticks are then copied into the caller's readback buffer, since
/// `QUERY_RESOLVE` buffers cannot be mapped.
pub(crate) struct GpuQuerySet {
    pub set: wgpu::QuerySet,
    pub resolve: wgpu::Buffer,
}

/// Resources commands refer to by handle
pub(crate) struct Resources<'a> {
    pub device: &'a wgpu::Device,
    pub buffers: &'a HashMap<BufferId, wgpu::Buffer>,
    pub query_sets: &'a HashMap<QuerySetId, GpuQuerySet>,
    pub pipelines: &'a HashMap<PipelineId, WebGpuPipeline>,
}

impl Resources<'_> {
    fn buffer(&self, id: BufferId) -> Result<&wgpu::Buffer, BenchmarkError> {
        self.buffers
            .get(&id)
            .ok_or_else(|| BenchmarkError::Execution(format!("unknown buffer {:?}", id)))
    }

    fn query_set(&self, id: QuerySetId) -> Result<&GpuQuerySet, BenchmarkError> {
        self.query_sets
            .get(&id)
            .ok_or_else(|| BenchmarkError::Execution(format!("unknown query set {:?}", id)))
    }
}

/// Translate one recorded command list into a wgpu command buffer
pub(crate) fn encode(
    res: &Resources<'_>,
    commands: &[Command],
) -> Result<wgpu::CommandBuffer, BenchmarkError> {
    let mut encoder = res
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Benchmark Encoder"),
        });

    for command in commands {
        match command {
            // wgpu tracks resource usage itself
            Command::Transition { buffer, from, to } => {
                trace!("{:?}: {} -> {}", buffer, from, to);
            }
            Command::CopyBuffer { src, dst, size } => {
                encoder.copy_buffer_to_buffer(res.buffer(*src)?, 0, res.buffer(*dst)?, 0, *size);
            }
            Command::WriteTimestamp { query_set, index } => {
                encoder.write_timestamp(&res.query_set(*query_set)?.set, *index);
            }
            Command::ResolveQueries {
                query_set,
                range,
                dst,
            } => {
                let qs = res.query_set(*query_set)?;
                let bytes = (range.end - range.start) as u64 * TIMESTAMP_SIZE;
                encoder.resolve_query_set(&qs.set, range.clone(), &qs.resolve, 0);
                encoder.copy_buffer_to_buffer(&qs.resolve, 0, res.buffer(*dst)?, 0, bytes);
            }
            Command::Dispatch {
                pipeline,
                bindings,
                groups,
            } => {
                let pipeline = res.pipelines.get(pipeline).ok_or_else(|| {
                    BenchmarkError::Execution(format!("unknown pipeline {:?}", pipeline))
                })?;
                let entries = bindings
                    .iter()
                    .enumerate()
                    .map(|(slot, id)| {
                        Ok(wgpu::BindGroupEntry {
                            binding: slot as u32,
                            resource: res.buffer(*id)?.as_entire_binding(),
                        })
                    })
                    .collect::<Result<Vec<_>, BenchmarkError>>()?;
                let bind_group = res.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Benchmark Bind Group"),
                    layout: &pipeline.bind_group_layout,
                    entries: &entries,
                });

                let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Benchmark Compute Pass"),
                    timestamp_writes: None,
                });
                compute_pass.set_pipeline(&pipeline.pipeline);
                compute_pass.set_bind_group(0, &bind_group, &[]);
                compute_pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
            }
            // no counter backend on wgpu
            Command::SampleCounters { .. } => {}
        }
    }

    Ok(encoder.finish())
}

/// Host-visible fence emulated with submitted-work-done callbacks
#[derive(Debug, Default, Clone)]
pub(crate) struct Fence {
    completed: Arc<AtomicU64>,
}

impl Fence {
    /// Raise the completed value once all work submitted so far is done
    pub fn signal(&self, queue: &wgpu::Queue, value: u64) {
        let completed = Arc::clone(&self.completed);
        queue.on_submitted_work_done(move || {
            completed.fetch_max(value, Ordering::SeqCst);
        });
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Block on device polling until `value` is reached
    pub fn wait(&self, device: &wgpu::Device, value: u64) -> Result<(), BenchmarkError> {
        while self.completed() < value {
            let result = device.poll(wgpu::Maintain::Wait);
            if self.completed() < value && result.is_queue_empty() {
                return Err(BenchmarkError::Execution(format!(
                    "queue drained but fence is at {} waiting for {}",
                    self.completed(),
                    value
                )));
            }
        }
        Ok(())
    }
}

/// Map `buffer` for reading and copy out its first `size` bytes
pub(crate) fn read_mapped(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
    size: u64,
) -> Result<Vec<u8>, BenchmarkError> {
    let slice = buffer.slice(..size);
    let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
    slice.map_async(wgpu::MapMode::Read, move |v| {
        sender.send(v).ok();
    });
    device.poll(wgpu::Maintain::Wait);

    pollster::block_on(receiver.receive())
        .ok_or_else(|| BenchmarkError::Execution("buffer map callback dropped".to_string()))?
        .map_err(|e| BenchmarkError::Execution(format!("buffer map failed: {}", e)))?;

    let data = slice.get_mapped_range().to_vec();
    buffer.unmap();
    Ok(data)
}
