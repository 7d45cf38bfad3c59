use gpu_timing_bench::config::{BenchmarkConfig, Dimensions};
use gpu_timing_bench::context::DeviceContext;
use gpu_timing_bench::driver::{BufferDesc, Driver};
use gpu_timing_bench::kernels::{Kernel, LinearCopy, VectorLength};
use gpu_timing_bench::pipeline::Pipeline;
use gpu_timing_bench::runner::{BenchmarkRunner, RunState};
use gpu_timing_bench::sim::{SimClock, SimOptions, SimulatedDriver};
use gpu_timing_bench::timestamp::TimingAnomaly;
use gpu_timing_bench::{Backend, BenchmarkError, ConfigError};
use std::time::{Duration, Instant};

fn config(dims: Dimensions) -> BenchmarkConfig {
    BenchmarkConfig::default()
        .with_dimensions(dims)
        .with_seed(42)
        .with_csv_path(None)
}

#[test]
fn fence_advances_by_one_and_wait_never_returns_early() {
    let latency = Duration::from_millis(20);
    let driver =
        SimulatedDriver::with_options(SimOptions::default().with_completion_latency(latency));
    let stats = driver.stats();
    let mut ctx = DeviceContext::initialize(driver);

    for expected in 1..=4u64 {
        ctx.reset().unwrap();
        ctx.submit().unwrap();
        let started = Instant::now();
        let value = ctx.signal_and_wait().unwrap();
        assert_eq!(value, expected);
        assert!(started.elapsed() >= latency);
        assert!(ctx.driver().completed_value() >= value);
    }
    assert_eq!(stats.signaled_values(), vec![1, 2, 3, 4]);
    assert_eq!(stats.submissions(), 4);
}

#[test]
fn bracket_holds_the_dispatch_but_not_uploads_or_readback_copies() {
    let dispatch_delay = Duration::from_millis(20);
    let copy_delay = Duration::from_millis(150);
    let driver = SimulatedDriver::with_options(
        SimOptions::default()
            .with_dispatch_delay(dispatch_delay)
            .with_copy_delay(copy_delay),
    );
    let stats = driver.stats();
    let dims = Dimensions::new(8, 8);
    let mut runner = BenchmarkRunner::new(config(dims), Backend::Simulated, LinearCopy::new(dims));
    let result = runner.run(driver).unwrap();

    let seconds = result.duration_s.unwrap();
    assert!(seconds >= dispatch_delay.as_secs_f64(), "measured {}", seconds);
    assert!(seconds < copy_delay.as_secs_f64(), "measured {}", seconds);

    // input and params uploads, then the output readback copy
    assert_eq!(stats.dispatches(), 1);
    assert_eq!(stats.bytes_copied(), 256 + 16 + 256);
}

#[test]
fn indivisible_workload_is_rejected_before_any_submission() {
    let driver = SimulatedDriver::new();
    let stats = driver.stats();
    let dims = Dimensions::new(10, 10);
    let mut runner = BenchmarkRunner::new(config(dims), Backend::Simulated, LinearCopy::new(dims));

    let err = runner.run(driver).unwrap_err();
    assert!(err.is_config_error(), "unexpected error: {}", err);
    assert!(matches!(
        err,
        BenchmarkError::Config(ConfigError::NotDivisible {
            axis: 0,
            size: 100,
            group: 64
        })
    ));
    assert_eq!(stats.submissions(), 0);
    assert_eq!(runner.state(), RunState::DeviceReady);
}

#[test]
fn grid_over_the_device_limit_is_rejected_before_any_submission() {
    let driver = SimulatedDriver::new();
    let stats = driver.stats();
    let dims = Dimensions::new(2048, 2048);
    let mut runner = BenchmarkRunner::new(config(dims), Backend::Simulated, LinearCopy::new(dims));

    let err = runner.run(driver).unwrap_err();
    assert!(err.is_config_error(), "unexpected error: {}", err);
    assert_eq!(
        err.to_string(),
        "Configuration error: Dimension 0 needs 65536 thread groups; \
         the device allows at most 65535"
    );
    assert!(matches!(
        err,
        BenchmarkError::Config(ConfigError::GridTooLarge {
            axis: 0,
            groups: 65536,
            limit: 65535
        })
    ));
    assert_eq!(stats.submissions(), 0);
    assert_eq!(runner.state(), RunState::DeviceReady);

    let driver =
        SimulatedDriver::with_options(SimOptions::default().with_max_workgroups_per_dimension(4));
    let stats = driver.stats();
    let dims = Dimensions::new(64, 32);
    let mut runner =
        BenchmarkRunner::new(config(dims), Backend::Simulated, VectorLength::new(dims));
    assert!(matches!(
        runner.run(driver),
        Err(BenchmarkError::Config(ConfigError::GridTooLarge {
            axis: 0,
            groups: 8,
            limit: 4
        }))
    ));
    assert_eq!(stats.submissions(), 0);
}

#[test]
fn workload_past_u32_indexing_is_a_config_error() {
    let driver = SimulatedDriver::new();
    let stats = driver.stats();
    let dims = Dimensions::new(65536, 65536);
    let mut runner = BenchmarkRunner::new(config(dims), Backend::Simulated, LinearCopy::new(dims));

    assert!(matches!(
        runner.run(driver),
        Err(BenchmarkError::Config(ConfigError::WorkloadTooLarge { .. }))
    ));
    assert_eq!(stats.submissions(), 0);
}

#[test]
fn vector_length_tile_must_divide_both_axes() {
    let driver = SimulatedDriver::new();
    let stats = driver.stats();
    let dims = Dimensions::new(16, 12);
    let mut runner =
        BenchmarkRunner::new(config(dims), Backend::Simulated, VectorLength::new(dims));

    assert!(matches!(
        runner.run(driver),
        Err(BenchmarkError::Config(ConfigError::NotDivisible { axis: 1, .. }))
    ));
    assert_eq!(stats.submissions(), 0);
}

#[test]
fn binding_layout_mismatch_is_a_config_error() {
    let mut ctx = DeviceContext::initialize(SimulatedDriver::new());
    let kernel = LinearCopy::new(Dimensions::new(8, 8));
    let pipeline = Pipeline::new(&mut ctx, kernel.interface(), &kernel.shader()).unwrap();
    let params = ctx.create_buffer(&BufferDesc::constant("params", 16)).unwrap();
    let input = ctx.create_buffer(&BufferDesc::storage("input", 256)).unwrap();

    ctx.reset().unwrap();
    assert!(matches!(
        pipeline.dispatch(&mut ctx, &[params, input], kernel.workload()),
        Err(BenchmarkError::Config(ConfigError::BindingCount {
            expected: 3,
            actual: 2,
            ..
        }))
    ));
    assert!(matches!(
        pipeline.dispatch(&mut ctx, &[input, params, input], kernel.workload()),
        Err(BenchmarkError::Config(ConfigError::BindingKind { slot: 0, .. }))
    ));
}

#[test]
fn frozen_clock_is_reported_as_anomaly() {
    let driver = SimulatedDriver::with_options(SimOptions::default().with_clock(SimClock::Frozen));
    let dims = Dimensions::new(8, 8);
    let mut runner = BenchmarkRunner::new(config(dims), Backend::Simulated, LinearCopy::new(dims));
    let result = runner.run(driver).unwrap();

    assert_eq!(result.anomaly, Some(TimingAnomaly::ZeroLength));
    assert_eq!(result.duration_s, None);
    assert_eq!(result.bandwidth_gbps, None);
}

#[test]
fn reversed_clock_is_reported_as_anomaly() {
    let driver = SimulatedDriver::with_options(
        SimOptions::default()
            .with_clock(SimClock::Reversed)
            .with_dispatch_delay(Duration::from_millis(1)),
    );
    let dims = Dimensions::new(8, 8);
    let mut runner =
        BenchmarkRunner::new(config(dims), Backend::Simulated, VectorLength::new(dims));
    let result = runner.run(driver).unwrap();

    assert_eq!(result.anomaly, Some(TimingAnomaly::Reversed));
    assert!(result.interval.end_ticks < result.interval.start_ticks);
    assert_eq!(result.bandwidth_gbps, None);
}

#[test]
fn seeded_runs_verify_against_cpu_reference() {
    for dims in [Dimensions::new(64, 8).with_strides(80, 96), Dimensions::new(32, 16)] {
        let cfg = config(dims).with_verify(true);
        let mut copy = BenchmarkRunner::new(
            cfg.clone(),
            Backend::Simulated,
            LinearCopy::new(dims),
        );
        assert!(copy
            .run(SimulatedDriver::new())
            .unwrap()
            .verification
            .unwrap()
            .passed());

        let mut length =
            BenchmarkRunner::new(cfg, Backend::Simulated, VectorLength::new(dims));
        assert!(length
            .run(SimulatedDriver::new())
            .unwrap()
            .verification
            .unwrap()
            .passed());
    }
}
