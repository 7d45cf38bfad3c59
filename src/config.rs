use crate::{ConfigError, KernelVariant};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default results file, appended to on every successful run
pub const DEFAULT_CSV_PATH: &str = "bandwidth_results.csv";

/// Workload shape in elements. Strides are row pitches of the input and
/// output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    pub input_stride: u32,
    pub output_stride: u32,
}

impl Dimensions {
    /// Tightly packed `width x height` workload
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            input_stride: width,
            output_stride: width,
        }
    }

    pub fn with_strides(mut self, input_stride: u32, output_stride: u32) -> Self {
        self.input_stride = input_stride;
        self.output_stride = output_stride;
        self
    }

    pub fn elements(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 {
            return Err(ConfigError::ZeroDimension("width"));
        }
        if self.height == 0 {
            return Err(ConfigError::ZeroDimension("height"));
        }
        for (name, stride) in [
            ("input stride", self.input_stride),
            ("output stride", self.output_stride),
        ] {
            if stride < self.width {
                return Err(ConfigError::StrideTooSmall {
                    name,
                    stride,
                    width: self.width,
                });
            }
        }
        let stride = self.input_stride.max(self.output_stride);
        if u64::from(self.height) * u64::from(stride) > u64::from(u32::MAX) {
            return Err(ConfigError::WorkloadTooLarge {
                height: self.height,
                stride,
            });
        }
        Ok(())
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(2000, 2000)
    }
}

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub dimensions: Dimensions,

    pub variant: KernelVariant,

    /// Seed for input data; `None` draws from entropy
    pub seed: Option<u64>,

    /// Compare the output buffer against the CPU reference
    pub verify: bool,

    /// Hardware counters to sample around the measured dispatch
    pub counters: Vec<String>,

    /// CSV file results are appended to
    pub csv_path: Option<PathBuf>,

    /// JSON file the full measurement is written to
    pub json_path: Option<PathBuf>,

    /// Kernel blob to load instead of the embedded one
    pub shader_path: Option<PathBuf>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            dimensions: Dimensions::default(),
            variant: KernelVariant::LinearCopy,
            seed: None,
            verify: false,
            counters: Vec::new(),
            csv_path: Some(PathBuf::from(DEFAULT_CSV_PATH)),
            json_path: None,
            shader_path: None,
        }
    }
}

impl BenchmarkConfig {
    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_variant(mut self, variant: KernelVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_counter(mut self, name: &str) -> Self {
        self.counters.push(name.to_string());
        self
    }

    pub fn with_csv_path(mut self, path: Option<PathBuf>) -> Self {
        self.csv_path = path;
        self
    }

    pub fn with_json_path(mut self, path: Option<PathBuf>) -> Self {
        self.json_path = path;
        self
    }

    pub fn with_shader_path(mut self, path: Option<PathBuf>) -> Self {
        self.shader_path = path;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dimensions.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_square_2000_workload() {
        let config = BenchmarkConfig::default();
        assert_eq!(config.dimensions, Dimensions::new(2000, 2000));
        assert_eq!(config.csv_path, Some(PathBuf::from("bandwidth_results.csv")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_and_narrow_strides() {
        assert_eq!(
            Dimensions::new(0, 8).validate(),
            Err(ConfigError::ZeroDimension("width"))
        );
        assert!(matches!(
            Dimensions::new(8, 8).with_strides(4, 8).validate(),
            Err(ConfigError::StrideTooSmall { stride: 4, .. })
        ));
        assert!(Dimensions::new(8, 8).with_strides(16, 8).validate().is_ok());
    }

    #[test]
    fn rejects_buffers_past_u32_indexing() {
        assert_eq!(
            Dimensions::new(65536, 65536).validate(),
            Err(ConfigError::WorkloadTooLarge {
                height: 65536,
                stride: 65536
            })
        );
        assert!(matches!(
            Dimensions::new(1024, 4096).with_strides(1024, 1 << 20).validate(),
            Err(ConfigError::WorkloadTooLarge { stride: 1048576, .. })
        ));
        assert!(Dimensions::new(65535, 65535).validate().is_ok());
    }
}
