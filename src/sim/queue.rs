//! Simulated queue execution

use super::device::{SimClock, SimOptions, SimStats};
use super::CpuKernel;
use crate::driver::{BufferId, Command, CounterSnapshot, PipelineId, QuerySetId};
use log::{debug, error};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

pub(crate) enum Job {
    Execute(Vec<Command>),
    Signal(u64),
}

pub(crate) struct SimPipeline {
    pub kernel: CpuKernel,
    pub workgroup_size: [u32; 3],
    pub binding_count: usize,
}

#[derive(Default)]
pub(crate) struct Memory {
    pub buffers: HashMap<BufferId, Vec<u8>>,
    pub query_sets: HashMap<QuerySetId, Vec<u64>>,
    pub pipelines: HashMap<PipelineId, SimPipeline>,
    pub counter_samples: HashMap<u32, CounterSnapshot>,
}

#[derive(Default)]
pub(crate) struct FenceState {
    pub completed: u64,
    /// Set when a command list fails; the device is lost from then on
    pub fault: Option<String>,
}

pub(crate) struct Shared {
    pub memory: Mutex<Memory>,
    pub fence: Mutex<FenceState>,
    pub fence_cv: Condvar,
    pub stats: Arc<SimStats>,
    pub options: SimOptions,
    pub epoch: Instant,
}

impl Shared {
    pub fn new(options: SimOptions) -> Self {
        Self {
            memory: Mutex::new(Memory::default()),
            fence: Mutex::new(FenceState::default()),
            fence_cv: Condvar::new(),
            stats: Arc::new(SimStats::default()),
            options,
            epoch: Instant::now(),
        }
    }

    fn tick(&self) -> u64 {
        let ns = self.epoch.elapsed().as_nanos() as f64;
        let ticks = (ns * (self.options.tick_frequency / 1e9)) as u64;
        match self.options.clock {
            SimClock::Monotonic => ticks,
            SimClock::Frozen => 1_000,
            SimClock::Reversed => (1u64 << 40).saturating_sub(ticks),
        }
    }

    fn fail(&self, message: String) {
        error!("Simulated device lost: {}", message);
        let mut fence = lock(&self.fence);
        fence.fault.get_or_insert(message);
        self.fence_cv.notify_all();
    }
}

/// Lock ignoring poisoning; a panicked worker already reports a fault
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Worker loop: runs until the driver drops its sender
pub(crate) fn run(shared: Arc<Shared>, jobs: Receiver<Job>) {
    for job in jobs {
        match job {
            Job::Execute(commands) => {
                if lock(&shared.fence).fault.is_some() {
                    continue;
                }
                if let Err(message) = execute(&shared, commands) {
                    shared.fail(message);
                }
            }
            Job::Signal(value) => {
                std::thread::sleep(shared.options.completion_latency);
                let mut fence = lock(&shared.fence);
                fence.completed = fence.completed.max(value);
                debug!("Simulated fence reached {}", fence.completed);
                shared.fence_cv.notify_all();
            }
        }
    }
}

fn execute(shared: &Shared, commands: Vec<Command>) -> Result<(), String> {
    for command in commands {
        match command {
            // access states are validated while recording
            Command::Transition { .. } => {}
            Command::CopyBuffer { src, dst, size } => {
                std::thread::sleep(shared.options.copy_delay);
                copy_buffer(&mut lock(&shared.memory), src, dst, size as usize)?;
                shared.stats.bytes_copied.fetch_add(size, Ordering::SeqCst);
            }
            Command::WriteTimestamp { query_set, index } => {
                let tick = shared.tick();
                let mut memory = lock(&shared.memory);
                let slot = memory
                    .query_sets
                    .get_mut(&query_set)
                    .and_then(|slots| slots.get_mut(index as usize))
                    .ok_or_else(|| format!("timestamp slot {:?}[{}] missing", query_set, index))?;
                *slot = tick;
            }
            Command::ResolveQueries {
                query_set,
                range,
                dst,
            } => {
                let mut memory = lock(&shared.memory);
                let ticks: Vec<u64> = memory
                    .query_sets
                    .get(&query_set)
                    .and_then(|slots| slots.get(range.start as usize..range.end as usize))
                    .ok_or_else(|| format!("query range {:?} of {:?} missing", range, query_set))?
                    .to_vec();
                let bytes: Vec<u8> = ticks.iter().flat_map(|t| t.to_le_bytes()).collect();
                let target = memory
                    .buffers
                    .get_mut(&dst)
                    .and_then(|buffer| buffer.get_mut(..bytes.len()))
                    .ok_or_else(|| format!("resolve target {:?} missing or too small", dst))?;
                target.copy_from_slice(&bytes);
            }
            Command::Dispatch {
                pipeline,
                bindings,
                groups,
            } => {
                std::thread::sleep(shared.options.dispatch_delay);
                let started = Instant::now();
                dispatch(&mut lock(&shared.memory), pipeline, &bindings, groups)?;

                let stats = &shared.stats;
                stats.dispatches.fetch_add(1, Ordering::SeqCst);
                stats.thread_groups.fetch_add(
                    groups.iter().map(|&g| g as u64).product(),
                    Ordering::SeqCst,
                );
                stats.kernel_busy_ns.fetch_add(
                    (started.elapsed() + shared.options.dispatch_delay).as_nanos() as u64,
                    Ordering::SeqCst,
                );
            }
            Command::SampleCounters { slot } => {
                let snapshot = shared.stats.snapshot();
                lock(&shared.memory).counter_samples.insert(slot, snapshot);
            }
        }
    }
    Ok(())
}

fn copy_buffer(
    memory: &mut Memory,
    src: BufferId,
    dst: BufferId,
    size: usize,
) -> Result<(), String> {
    let data = memory
        .buffers
        .get(&src)
        .and_then(|buffer| buffer.get(..size))
        .ok_or_else(|| format!("copy source {:?} missing or too small", src))?
        .to_vec();
    let target = memory
        .buffers
        .get_mut(&dst)
        .and_then(|buffer| buffer.get_mut(..size))
        .ok_or_else(|| format!("copy destination {:?} missing or too small", dst))?;
    target.copy_from_slice(&data);
    Ok(())
}

fn dispatch(
    memory: &mut Memory,
    pipeline: PipelineId,
    bindings: &[BufferId],
    groups: [u32; 3],
) -> Result<(), String> {
    let (kernel, workgroup_size, binding_count) = {
        let p = memory
            .pipelines
            .get(&pipeline)
            .ok_or_else(|| format!("unknown pipeline {:?}", pipeline))?;
        (p.kernel, p.workgroup_size, p.binding_count)
    };
    if bindings.len() != binding_count {
        return Err(format!(
            "pipeline {:?} expects {} bindings, got {}",
            pipeline,
            binding_count,
            bindings.len()
        ));
    }

    let mut bound = Vec::with_capacity(bindings.len());
    for id in bindings {
        match memory.buffers.remove(id) {
            Some(buffer) => bound.push(buffer),
            None => {
                restore(memory, bindings, bound);
                return Err(format!("bound buffer {:?} missing", id));
            }
        }
    }

    let result = kernel(&mut bound, groups, workgroup_size);
    restore(memory, bindings, bound);
    result
}

fn restore(memory: &mut Memory, bindings: &[BufferId], bound: Vec<Vec<u8>>) {
    for (id, buffer) in bindings.iter().zip(bound) {
        memory.buffers.insert(*id, buffer);
    }
}
