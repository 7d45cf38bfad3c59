//! One measured benchmark run, driven through its states in order

use crate::config::BenchmarkConfig;
use crate::context::DeviceContext;
use crate::counters::{CounterProfiler, SampleId};
use crate::driver::{Driver, ShaderBlob};
use crate::kernels::{input_rng, Kernel};
use crate::pipeline::Pipeline;
use crate::results::BenchmarkResult;
use crate::timestamp::TimestampQuery;
use crate::{Backend, BenchmarkError};
use log::{info, warn};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    DeviceReady,
    ResourcesBuilt,
    Recording,
    Submitted,
    Complete,
}

/// Runs one bracketed dispatch of `K` on a device driven by `D`.
///
/// Each step must be called in order; calling one from the wrong state is
/// a protocol error and leaves the runner where it was.
pub struct BenchmarkRunner<D: Driver, K: Kernel> {
    config: BenchmarkConfig,
    backend: Backend,
    kernel: K,
    state: RunState,
    ctx: Option<DeviceContext<D>>,
    timestamps: Option<TimestampQuery>,
    pipeline: Option<Pipeline>,
    resources: Option<K::Resources>,
    profiler: CounterProfiler,
    sample: Option<SampleId>,
}

fn required<'a, T>(slot: &'a mut Option<T>, what: &str) -> Result<&'a mut T, BenchmarkError> {
    slot.as_mut()
        .ok_or_else(|| BenchmarkError::Protocol(format!("{} has not been created", what)))
}

impl<D: Driver, K: Kernel> BenchmarkRunner<D, K> {
    pub fn new(config: BenchmarkConfig, backend: Backend, kernel: K) -> Self {
        Self {
            config,
            backend,
            kernel,
            state: RunState::Uninitialized,
            ctx: None,
            timestamps: None,
            pipeline: None,
            resources: None,
            profiler: CounterProfiler::new(),
            sample: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn expect(&self, expected: RunState, op: &str) -> Result<(), BenchmarkError> {
        if self.state != expected {
            return Err(BenchmarkError::Protocol(format!(
                "{} called in {:?} state, expected {:?}",
                op, self.state, expected
            )));
        }
        Ok(())
    }

    /// Take the opened device, create the timestamp query and start the
    /// counter session if counters were requested
    pub fn initialize(&mut self, driver: D) -> Result<(), BenchmarkError> {
        self.expect(RunState::Uninitialized, "initialize")?;
        let mut ctx = DeviceContext::initialize(driver);
        self.timestamps = Some(TimestampQuery::new(&mut ctx)?);

        if !self.config.counters.is_empty() && self.profiler.initialize(&ctx) {
            self.profiler.create_session()?;
            for name in &self.config.counters {
                if let Err(e) = self.profiler.enable_counter(name) {
                    warn!(
                        "{}; skipping (supported: {})",
                        e,
                        self.profiler.supported().join(", ")
                    );
                }
            }
            self.profiler.begin_session()?;
        }

        self.ctx = Some(ctx);
        self.state = RunState::DeviceReady;
        Ok(())
    }

    /// Validate the workload, create the pipeline and upload every input.
    ///
    /// Configuration errors surface before anything reaches the queue. The
    /// upload submission is fully awaited so it never overlaps the bracket.
    pub fn build(&mut self) -> Result<(), BenchmarkError> {
        self.expect(RunState::DeviceReady, "build")?;
        self.config.validate()?;
        self.kernel.dimensions().validate()?;
        let interface = self.kernel.interface().clone();
        let ctx = required(&mut self.ctx, "device context")?;
        let groups =
            interface.grid_for(self.kernel.workload(), ctx.max_workgroups_per_dimension())?;

        let blob = match &self.config.shader_path {
            Some(path) => ShaderBlob::from_file(path)?,
            None => self.kernel.shader(),
        };

        let pipeline = Pipeline::new(ctx, &interface, &blob)?;

        let kernel = &self.kernel;
        let mut rng = input_rng(self.config.seed);
        let resources = ctx.build_session(|ctx, staging| kernel.build(ctx, staging, &mut rng))?;

        info!(
            "Built {} ({} bytes, grid {:?} of {:?})",
            kernel.variant(),
            kernel.bytes_moved(),
            groups,
            interface.workgroup_size
        );
        self.pipeline = Some(pipeline);
        self.resources = Some(resources);
        self.state = RunState::ResourcesBuilt;
        Ok(())
    }

    /// Reopen the recorder and mark the start of the measured interval
    pub fn begin_recording(&mut self) -> Result<(), BenchmarkError> {
        self.expect(RunState::ResourcesBuilt, "begin_recording")?;
        let ctx = required(&mut self.ctx, "device context")?;
        let timestamps = required(&mut self.timestamps, "timestamp query")?;

        ctx.reset()?;
        if self.profiler.enabled().is_empty() {
            self.sample = None;
        } else {
            self.sample = Some(self.profiler.begin_pass(ctx.recorder()?)?);
        }
        timestamps.mark_start(ctx)?;

        self.state = RunState::Recording;
        Ok(())
    }

    /// Dispatch inside the bracket, then copy results out and submit
    pub fn record_and_submit(&mut self) -> Result<(), BenchmarkError> {
        self.expect(RunState::Recording, "record_and_submit")?;
        let ctx = required(&mut self.ctx, "device context")?;
        let timestamps = required(&mut self.timestamps, "timestamp query")?;
        let pipeline = required(&mut self.pipeline, "pipeline")?;
        let resources = required(&mut self.resources, "workload resources")?;

        self.kernel.dispatch(ctx, pipeline, resources)?;
        timestamps.mark_end(ctx)?;
        if self.sample.is_some() {
            self.profiler.end_pass(ctx.recorder()?)?;
        }
        self.kernel.copy_output(ctx, resources)?;
        timestamps.resolve(ctx)?;
        ctx.submit()?;

        self.state = RunState::Submitted;
        Ok(())
    }

    /// Wait for the measured submission and turn its ticks into a result
    pub fn complete(&mut self) -> Result<BenchmarkResult, BenchmarkError> {
        self.expect(RunState::Submitted, "complete")?;
        let ctx = required(&mut self.ctx, "device context")?;
        let timestamps = required(&mut self.timestamps, "timestamp query")?;
        let resources = required(&mut self.resources, "workload resources")?;

        ctx.signal_and_wait()?;
        let interval = timestamps.read_duration(ctx)?;

        let verification = if self.config.verify {
            let output = ctx.read_back(self.kernel.output_readback(resources))?;
            let verification = self.kernel.verify(resources, &output);
            if !verification.passed() {
                warn!(
                    "{} of {} output elements differ from the CPU reference",
                    verification.mismatches, verification.checked
                );
            }
            Some(verification)
        } else {
            None
        };

        let counters = match self.sample {
            Some(sample) => {
                self.profiler.end_session()?;
                self.profiler.sample_results(ctx, sample)?
            }
            None => BTreeMap::new(),
        };

        let result = BenchmarkResult::from_interval(
            ctx.device_name(),
            self.backend,
            self.kernel.variant(),
            self.kernel.dimensions(),
            self.kernel.bytes_moved(),
            interval,
        )
        .with_verification(verification)
        .with_counters(counters);

        match (result.anomaly, result.bandwidth_gbps) {
            (Some(anomaly), _) => warn!(
                "Timing anomaly ({}): start {} end {}; no bandwidth reported",
                anomaly, interval.start_ticks, interval.end_ticks
            ),
            (None, Some(gbps)) => info!("Measured {:.3} GB/s", gbps),
            (None, None) => {}
        }

        self.state = RunState::Complete;
        Ok(result)
    }

    /// Drive every state in order
    pub fn run(&mut self, driver: D) -> Result<BenchmarkResult, BenchmarkError> {
        info!(
            "Running {} on {} backend ({}x{})",
            self.kernel.variant(),
            self.backend,
            self.config.dimensions.width,
            self.config.dimensions.height
        );
        self.initialize(driver)?;
        self.build()?;
        self.begin_recording()?;
        self.record_and_submit()?;
        self.complete()
    }
}
