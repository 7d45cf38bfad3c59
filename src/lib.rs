pub mod config;
pub mod context;
pub mod counters;
pub mod driver;
pub mod kernels;
pub mod pipeline;
pub mod recorder;
pub mod reporter;
pub mod results;
pub mod runner;
pub mod sim;
pub mod timestamp;

#[cfg(feature = "webgpu")]
pub mod webgpu;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchmarkError {
    #[error("No GPU device found")]
    NoDevice,

    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Device is missing required feature: {0}")]
    MissingFeature(String),

    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("Buffer creation failed: {0}")]
    BufferCreation(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Resource state error: {0}")]
    ResourceState(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Counter error: {0}")]
    Counter(#[from] counters::CounterError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchmarkError {
    /// True for caller mistakes, as opposed to driver or hardware failures.
    pub fn is_config_error(&self) -> bool {
        matches!(self, BenchmarkError::Config(_))
    }
}

/// Caller mistakes detected before anything is dispatched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Workload dimension '{0}' must be non-zero")]
    ZeroDimension(&'static str),

    #[error("{name} ({stride}) must be at least the width ({width})")]
    StrideTooSmall {
        name: &'static str,
        stride: u32,
        width: u32,
    },

    #[error("Size {size} in dimension {axis} is not a multiple of the thread-group size {group}")]
    NotDivisible { axis: usize, size: u32, group: u32 },

    #[error("{height} rows of pitch {stride} exceed the 32-bit element index range")]
    WorkloadTooLarge { height: u32, stride: u32 },

    #[error("Dimension {axis} needs {groups} thread groups; the device allows at most {limit}")]
    GridTooLarge { axis: usize, groups: u32, limit: u32 },

    #[error("Kernel '{kernel}' declares {expected} bindings but {actual} were supplied")]
    BindingCount {
        kernel: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Kernel '{kernel}' slot {slot} expects a {expected} binding, got {actual}")]
    BindingKind {
        kernel: &'static str,
        slot: usize,
        expected: String,
        actual: String,
    },

    #[error("Unknown kernel variant: {0}")]
    UnknownVariant(String),
}

/// Available GPU backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    WebGPU,
    Simulated,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::WebGPU => "WebGPU",
            Backend::Simulated => "Simulated",
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            #[cfg(feature = "webgpu")]
            Backend::WebGPU => true,
            #[cfg(not(feature = "webgpu"))]
            Backend::WebGPU => false,

            Backend::Simulated => true,
        }
    }

    pub fn all() -> Vec<Backend> {
        vec![Backend::WebGPU, Backend::Simulated]
    }

    pub fn available() -> Vec<Backend> {
        Self::all()
            .into_iter()
            .filter(|b| b.is_available())
            .collect()
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Benchmark kernel variants, selectable by index on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelVariant {
    LinearCopy,
    VectorLength,
}

impl KernelVariant {
    pub fn name(&self) -> &'static str {
        match self {
            KernelVariant::LinearCopy => "linear_copy",
            KernelVariant::VectorLength => "vector_length",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            KernelVariant::LinearCopy => "Strided f32 copy between device buffers",
            KernelVariant::VectorLength => "Reduce packed f32x3 vectors to their lengths",
        }
    }

    pub fn selector(&self) -> u32 {
        match self {
            KernelVariant::LinearCopy => 0,
            KernelVariant::VectorLength => 1,
        }
    }

    pub fn all() -> Vec<KernelVariant> {
        vec![KernelVariant::LinearCopy, KernelVariant::VectorLength]
    }
}

impl std::fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for KernelVariant {
    type Err = ConfigError;

    /// Accepts either the numeric selector or the kernel name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::all()
            .into_iter()
            .find(|v| v.name() == s || v.selector().to_string() == s)
            .ok_or_else(|| ConfigError::UnknownVariant(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_parses_from_selector_and_name() {
        assert_eq!("0".parse::<KernelVariant>(), Ok(KernelVariant::LinearCopy));
        assert_eq!("1".parse::<KernelVariant>(), Ok(KernelVariant::VectorLength));
        assert_eq!(
            "vector_length".parse::<KernelVariant>(),
            Ok(KernelVariant::VectorLength)
        );
        assert!(matches!(
            "7".parse::<KernelVariant>(),
            Err(ConfigError::UnknownVariant(_))
        ));
    }

    #[test]
    fn simulated_backend_is_always_available() {
        assert!(Backend::available().contains(&Backend::Simulated));
    }

    #[test]
    fn config_errors_are_distinct_from_platform_errors() {
        let err: BenchmarkError = ConfigError::ZeroDimension("width").into();
        assert!(err.is_config_error());
        assert!(!BenchmarkError::NoDevice.is_config_error());
    }
}
