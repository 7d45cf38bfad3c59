use clap::{Parser, ValueEnum};
use console::Style;
use gpu_timing_bench::{
    config::{BenchmarkConfig, Dimensions, DEFAULT_CSV_PATH},
    driver::Driver,
    kernels::{LinearCopy, VectorLength},
    reporter,
    results::BenchmarkResult,
    runner::BenchmarkRunner,
    sim::SimulatedDriver,
    Backend, BenchmarkError, KernelVariant,
};
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    /// wgpu on the first high-performance adapter
    Webgpu,
    /// CPU-backed simulated device
    Sim,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Webgpu => Backend::WebGPU,
            BackendArg::Sim => Backend::Simulated,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "gpu-timing-bench")]
#[command(about = "Times one compute dispatch with GPU timestamp queries and reports bandwidth")]
struct Args {
    /// Workload width in elements; also the height when HEIGHT is omitted
    width: Option<u32>,

    /// Workload height in elements
    height: Option<u32>,

    /// Input row pitch in elements (defaults to WIDTH)
    input_stride: Option<u32>,

    /// Output row pitch in elements (defaults to WIDTH)
    output_stride: Option<u32>,

    /// Kernel: 0 / linear_copy or 1 / vector_length
    variant: Option<String>,

    /// Backend to use
    #[arg(long, short = 'b', value_enum, default_value = "webgpu")]
    backend: BackendArg,

    /// Seed for the generated input
    #[arg(long)]
    seed: Option<u64>,

    /// Check the output against a CPU reference
    #[arg(long)]
    verify: bool,

    /// Hardware counter to sample around the dispatch (repeatable)
    #[arg(long = "counter", value_name = "NAME")]
    counters: Vec<String>,

    /// CSV file results are appended to
    #[arg(long, default_value = DEFAULT_CSV_PATH)]
    csv: PathBuf,

    /// Do not append to the CSV file
    #[arg(long)]
    no_csv: bool,

    /// Write the full result as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// WGSL file to load instead of the embedded kernel
    #[arg(long)]
    shader: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> Result<BenchmarkConfig, BenchmarkError> {
        let mut dimensions = Dimensions::default();
        if let Some(width) = self.width {
            dimensions = Dimensions::new(width, self.height.unwrap_or(width));
        }
        dimensions = dimensions.with_strides(
            self.input_stride.unwrap_or(dimensions.width),
            self.output_stride.unwrap_or(dimensions.width),
        );

        let variant = match &self.variant {
            Some(v) => v.parse::<KernelVariant>()?,
            None => KernelVariant::LinearCopy,
        };

        let mut config = BenchmarkConfig::default()
            .with_dimensions(dimensions)
            .with_variant(variant)
            .with_verify(self.verify)
            .with_csv_path((!self.no_csv).then(|| self.csv.clone()))
            .with_json_path(self.json.clone())
            .with_shader_path(self.shader.clone());
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        for name in &self.counters {
            config = config.with_counter(name);
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        let error_style = Style::new().bold().red();
        let kind = if e.is_config_error() {
            "Configuration error"
        } else {
            "Error"
        };
        eprintln!("{}: {}", error_style.apply_to(kind), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), BenchmarkError> {
    let config = args.config()?;
    let backend = Backend::from(args.backend);
    if !backend.is_available() {
        return Err(BenchmarkError::BackendNotAvailable(format!(
            "{} (available: {})",
            backend,
            Backend::available()
                .iter()
                .map(|b| b.name())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let result = match backend {
        Backend::Simulated => run_variant(&config, backend, SimulatedDriver::new())?,
        #[cfg(feature = "webgpu")]
        Backend::WebGPU => {
            run_variant(&config, backend, gpu_timing_bench::webgpu::WebGpuDriver::new()?)?
        }
        #[cfg(not(feature = "webgpu"))]
        Backend::WebGPU => return Err(BenchmarkError::BackendNotAvailable("WebGPU".to_string())),
    };

    reporter::print_result(&result);

    if let Some(path) = &config.csv_path {
        if reporter::append_csv(path, &result)? {
            println!("Appended result to {}", path.display());
        } else {
            log::warn!("Anomalous measurement not appended to {}", path.display());
        }
    }
    if let Some(path) = &config.json_path {
        reporter::export_json(&result, path)?;
        println!("Results saved to {}", path.display());
    }
    Ok(())
}

fn run_variant<D: Driver>(
    config: &BenchmarkConfig,
    backend: Backend,
    driver: D,
) -> Result<BenchmarkResult, BenchmarkError> {
    let dims = config.dimensions;
    match config.variant {
        KernelVariant::LinearCopy => {
            BenchmarkRunner::new(config.clone(), backend, LinearCopy::new(dims)).run(driver)
        }
        KernelVariant::VectorLength => {
            BenchmarkRunner::new(config.clone(), backend, VectorLength::new(dims)).run(driver)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_timing_bench::ConfigError;

    fn config(args: &[&str]) -> Result<BenchmarkConfig, BenchmarkError> {
        let argv = std::iter::once("gpu-timing-bench").chain(args.iter().copied());
        Args::try_parse_from(argv).unwrap().config()
    }

    #[test]
    fn lone_width_sets_a_square_workload() {
        let cfg = config(&["64"]).unwrap();
        assert_eq!(cfg.dimensions, Dimensions::new(64, 64));
        assert_eq!(cfg.variant, KernelVariant::LinearCopy);
        assert_eq!(cfg.csv_path, Some(PathBuf::from(DEFAULT_CSV_PATH)));

        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.dimensions, Dimensions::new(2000, 2000));
    }

    #[test]
    fn strides_default_to_the_width() {
        let cfg = config(&["64", "8"]).unwrap();
        assert_eq!(cfg.dimensions, Dimensions::new(64, 8).with_strides(64, 64));

        let cfg = config(&["64", "8", "80"]).unwrap();
        assert_eq!(cfg.dimensions, Dimensions::new(64, 8).with_strides(80, 64));

        let cfg = config(&["64", "8", "80", "96"]).unwrap();
        assert_eq!(cfg.dimensions, Dimensions::new(64, 8).with_strides(80, 96));
    }

    #[test]
    fn variant_is_selected_by_index_or_name() {
        let cfg = config(&["64", "8", "64", "64", "1"]).unwrap();
        assert_eq!(cfg.variant, KernelVariant::VectorLength);

        let cfg = config(&["64", "8", "64", "64", "linear_copy"]).unwrap();
        assert_eq!(cfg.variant, KernelVariant::LinearCopy);

        assert!(matches!(
            config(&["64", "8", "64", "64", "7"]),
            Err(BenchmarkError::Config(ConfigError::UnknownVariant(_)))
        ));
    }

    #[test]
    fn flags_map_onto_the_config() {
        let cfg = config(&[
            "16",
            "--no-csv",
            "--seed",
            "9",
            "--verify",
            "--counter",
            "DispatchCount",
            "--json",
            "out.json",
            "-b",
            "sim",
        ])
        .unwrap();
        assert_eq!(cfg.csv_path, None);
        assert_eq!(cfg.seed, Some(9));
        assert!(cfg.verify);
        assert_eq!(cfg.counters, vec!["DispatchCount".to_string()]);
        assert_eq!(cfg.json_path, Some(PathBuf::from("out.json")));

        let cfg = config(&["16", "--csv", "runs.csv"]).unwrap();
        assert_eq!(cfg.csv_path, Some(PathBuf::from("runs.csv")));
    }

    #[test]
    fn narrow_stride_is_rejected_before_running() {
        let err = config(&["64", "8", "32"]).unwrap_err();
        assert!(err.is_config_error());
    }
}
