//! Simulated device and queue management

use super::queue::{self, Job, Memory, Shared, SimPipeline};
use super::CpuKernel;
use crate::driver::{
    BufferDesc, BufferId, Command, CounterSnapshot, Driver, PipelineId, QuerySetId, ShaderBlob,
};
use crate::pipeline::KernelInterface;
use crate::BenchmarkError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) const COUNTER_NAMES: [&str; 4] = [
    "DispatchCount",
    "ThreadGroupCount",
    "BytesCopied",
    "KernelBusyNanos",
];

/// What the simulated timestamp unit writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimClock {
    /// Nanoseconds since the device was created
    Monotonic,
    /// Always the same tick
    Frozen,
    /// Counts down, so later queries hold smaller ticks
    Reversed,
}

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Extra time every dispatch takes
    pub dispatch_delay: Duration,
    /// Extra time every buffer copy takes
    pub copy_delay: Duration,
    /// Time between reaching a fence signal and retiring it
    pub completion_latency: Duration,
    pub clock: SimClock,
    /// Timestamp ticks per second reported to callers
    pub tick_frequency: f64,
    pub max_workgroups_per_dimension: u32,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            dispatch_delay: Duration::ZERO,
            copy_delay: Duration::ZERO,
            completion_latency: Duration::ZERO,
            clock: SimClock::Monotonic,
            tick_frequency: 1e9,
            max_workgroups_per_dimension: 65535,
        }
    }
}

impl SimOptions {
    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    pub fn with_copy_delay(mut self, delay: Duration) -> Self {
        self.copy_delay = delay;
        self
    }

    pub fn with_completion_latency(mut self, latency: Duration) -> Self {
        self.completion_latency = latency;
        self
    }

    pub fn with_clock(mut self, clock: SimClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tick_frequency(mut self, frequency: f64) -> Self {
        self.tick_frequency = frequency;
        self
    }

    pub fn with_max_workgroups_per_dimension(mut self, limit: u32) -> Self {
        self.max_workgroups_per_dimension = limit;
        self
    }
}

/// Activity counters of the simulated device
#[derive(Debug, Default)]
pub struct SimStats {
    pub(crate) submissions: AtomicU64,
    pub(crate) dispatches: AtomicU64,
    pub(crate) thread_groups: AtomicU64,
    pub(crate) bytes_copied: AtomicU64,
    pub(crate) kernel_busy_ns: AtomicU64,
    pub(crate) signaled: Mutex<Vec<u64>>,
}

impl SimStats {
    /// Command lists handed to the queue
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::SeqCst)
    }

    /// Fence values in the order they were signaled
    pub fn signaled_values(&self) -> Vec<u64> {
        queue::lock(&self.signaled).clone()
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        let values = [
            self.dispatches(),
            self.thread_groups.load(Ordering::SeqCst),
            self.bytes_copied(),
            self.kernel_busy_ns.load(Ordering::SeqCst),
        ];
        COUNTER_NAMES
            .iter()
            .zip(values)
            .map(|(name, value)| (name.to_string(), value as f64))
            .collect()
    }
}

/// A device whose queue runs command lists on a worker thread
pub struct SimulatedDriver {
    shared: Arc<Shared>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    kernels: HashMap<&'static str, CpuKernel>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::with_options(SimOptions::default())
    }

    pub fn with_options(options: SimOptions) -> Self {
        let shared = Arc::new(Shared::new(options));
        let (sender, receiver) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("sim-queue".to_string())
            .spawn(move || queue::run(worker_shared, receiver))
            .ok();

        let mut driver = Self {
            shared,
            jobs: worker.as_ref().map(|_| sender),
            worker,
            kernels: HashMap::new(),
        };
        for (entry_point, kernel) in crate::kernels::cpu_kernels() {
            driver.register_kernel(entry_point, kernel);
        }
        driver
    }

    /// Make `entry_point` available to `create_pipeline`
    pub fn register_kernel(&mut self, entry_point: &'static str, kernel: CpuKernel) {
        self.kernels.insert(entry_point, kernel);
    }

    /// Shared handle to the device's activity counters
    pub fn stats(&self) -> Arc<SimStats> {
        Arc::clone(&self.shared.stats)
    }

    fn send(&self, job: Job) -> Result<(), BenchmarkError> {
        let sender = self.jobs.as_ref().ok_or_else(|| {
            BenchmarkError::Execution("simulated queue is not running".to_string())
        })?;
        sender
            .send(job)
            .map_err(|_| BenchmarkError::Execution("simulated queue has stopped".to_string()))
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, Memory> {
        queue::lock(&self.shared.memory)
    }
}

impl Driver for SimulatedDriver {
    fn device_name(&self) -> String {
        "Simulated Device".to_string()
    }

    fn timestamp_frequency(&self) -> f64 {
        self.shared.options.tick_frequency
    }

    fn max_workgroups_per_dimension(&self) -> u32 {
        self.shared.options.max_workgroups_per_dimension
    }

    fn create_buffer(&mut self, id: BufferId, desc: &BufferDesc) -> Result<(), BenchmarkError> {
        let size = usize::try_from(desc.size)
            .map_err(|_| BenchmarkError::BufferCreation(format!("'{}' is too large", desc.label)))?;
        self.memory().buffers.insert(id, vec![0; size]);
        Ok(())
    }

    fn create_upload_buffer(
        &mut self,
        id: BufferId,
        desc: &BufferDesc,
        contents: &[u8],
    ) -> Result<(), BenchmarkError> {
        if contents.len() as u64 != desc.size {
            return Err(BenchmarkError::BufferCreation(format!(
                "'{}' is {} bytes but {} bytes were supplied",
                desc.label,
                desc.size,
                contents.len()
            )));
        }
        self.memory().buffers.insert(id, contents.to_vec());
        Ok(())
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        self.memory().buffers.remove(&id);
    }

    fn create_query_set(&mut self, id: QuerySetId, count: u32) -> Result<(), BenchmarkError> {
        self.memory().query_sets.insert(id, vec![0; count as usize]);
        Ok(())
    }

    fn create_pipeline(
        &mut self,
        id: PipelineId,
        interface: &KernelInterface,
        blob: &ShaderBlob,
    ) -> Result<(), BenchmarkError> {
        let source = std::str::from_utf8(&blob.bytes).map_err(|e| {
            BenchmarkError::ShaderCompilation(format!("'{}' is not valid UTF-8: {}", blob.label, e))
        })?;
        if !source.contains(&format!("fn {}", interface.entry_point)) {
            return Err(BenchmarkError::ShaderCompilation(format!(
                "entry point '{}' not found in '{}'",
                interface.entry_point, blob.label
            )));
        }

        let kernel = *self.kernels.get(interface.entry_point).ok_or_else(|| {
            BenchmarkError::PipelineCreation(format!(
                "no CPU implementation for '{}'",
                interface.entry_point
            ))
        })?;

        self.memory().pipelines.insert(
            id,
            SimPipeline {
                kernel,
                workgroup_size: interface.workgroup_size,
                binding_count: interface.bindings.len(),
            },
        );
        Ok(())
    }

    fn execute(&mut self, commands: Vec<Command>) -> Result<(), BenchmarkError> {
        self.shared.stats.submissions.fetch_add(1, Ordering::SeqCst);
        self.send(Job::Execute(commands))
    }

    fn signal(&mut self, value: u64) -> Result<(), BenchmarkError> {
        queue::lock(&self.shared.stats.signaled).push(value);
        self.send(Job::Signal(value))
    }

    fn completed_value(&self) -> u64 {
        queue::lock(&self.shared.fence).completed
    }

    fn wait_for(&mut self, value: u64) -> Result<(), BenchmarkError> {
        let mut fence = queue::lock(&self.shared.fence);
        while fence.completed < value && fence.fault.is_none() {
            fence = self
                .shared
                .fence_cv
                .wait(fence)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match &fence.fault {
            Some(fault) => Err(BenchmarkError::Execution(fault.clone())),
            None => Ok(()),
        }
    }

    fn read_buffer(&mut self, id: BufferId, size: u64) -> Result<Vec<u8>, BenchmarkError> {
        let memory = self.memory();
        let buffer = memory
            .buffers
            .get(&id)
            .ok_or_else(|| BenchmarkError::Execution(format!("unknown buffer {:?}", id)))?;
        let size = (size as usize).min(buffer.len());
        Ok(buffer[..size].to_vec())
    }

    fn supported_counters(&self) -> Vec<String> {
        COUNTER_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn counter_sample(&mut self, slot: u32) -> Option<CounterSnapshot> {
        self.memory().counter_samples.get(&slot).cloned()
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_blocks_until_latency_elapses() {
        let latency = Duration::from_millis(30);
        let mut driver =
            SimulatedDriver::with_options(SimOptions::default().with_completion_latency(latency));
        let start = std::time::Instant::now();
        driver.signal(1).unwrap();
        assert_eq!(driver.completed_value(), 0);
        driver.wait_for(1).unwrap();
        assert!(start.elapsed() >= latency);
        assert_eq!(driver.completed_value(), 1);
    }

    #[test]
    fn pipeline_requires_entry_point_in_blob() {
        let mut driver = SimulatedDriver::new();
        let iface = crate::kernels::LinearCopy::INTERFACE;
        let blob = ShaderBlob::wgsl("wrong", b"fn something_else() {}");
        assert!(matches!(
            driver.create_pipeline(PipelineId(0), &iface, &blob),
            Err(BenchmarkError::ShaderCompilation(_))
        ));
    }

    #[test]
    fn faults_surface_from_wait() {
        let mut driver = SimulatedDriver::new();
        driver
            .execute(vec![Command::Dispatch {
                pipeline: PipelineId(42),
                bindings: vec![],
                groups: [1, 1, 1],
            }])
            .unwrap();
        driver.signal(1).unwrap();
        assert!(matches!(
            driver.wait_for(1),
            Err(BenchmarkError::Execution(_))
        ));
    }
}
