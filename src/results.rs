use crate::config::Dimensions;
use crate::kernels::Verification;
use crate::timestamp::{TimestampInterval, TimingAnomaly};
use crate::{Backend, KernelVariant};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Throughput in GB/s, with GB meaning 1024^3 bytes
pub fn throughput_gbps(bytes: u64, seconds: f64) -> f64 {
    bytes as f64 / seconds / BYTES_PER_GIB
}

/// Result of one measured dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Device used
    pub device: String,

    /// Backend used
    pub backend: String,

    /// Kernel benchmarked
    pub variant: String,

    pub dimensions: Dimensions,

    /// Bytes the measured dispatch moves
    pub bytes_moved: u64,

    /// Raw bracket ticks
    pub interval: TimestampInterval,

    /// Elapsed device time, absent when the interval is anomalous
    pub duration_s: Option<f64>,

    pub bandwidth_gbps: Option<f64>,

    pub anomaly: Option<TimingAnomaly>,

    pub verification: Option<Verification>,

    /// Counter deltas over the measured pass
    pub counters: BTreeMap<String, f64>,

    /// Seconds since the Unix epoch
    pub timestamp: String,
}

impl BenchmarkResult {
    pub fn from_interval(
        device: String,
        backend: Backend,
        variant: KernelVariant,
        dimensions: Dimensions,
        bytes_moved: u64,
        interval: TimestampInterval,
    ) -> Self {
        let (duration_s, anomaly) = match interval.seconds() {
            Ok(seconds) => (Some(seconds), None),
            Err(anomaly) => (None, Some(anomaly)),
        };

        Self {
            device,
            backend: backend.name().to_string(),
            variant: variant.name().to_string(),
            dimensions,
            bytes_moved,
            interval,
            duration_s,
            bandwidth_gbps: duration_s.map(|s| throughput_gbps(bytes_moved, s)),
            anomaly,
            verification: None,
            counters: BTreeMap::new(),
            timestamp: unix_timestamp(),
        }
    }

    pub fn with_verification(mut self, verification: Option<Verification>) -> Self {
        self.verification = verification;
        self
    }

    pub fn with_counters(mut self, counters: BTreeMap<String, f64>) -> Self {
        self.counters = counters;
        self
    }

    /// True when the interval produced a usable duration
    pub fn is_valid(&self) -> bool {
        self.anomaly.is_none()
    }

    pub fn duration_us(&self) -> Option<f64> {
        self.duration_s.map(|s| s * 1e6)
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(start: u64, end: u64) -> TimestampInterval {
        TimestampInterval {
            start_ticks: start,
            end_ticks: end,
            tick_frequency: 1e9,
        }
    }

    #[test]
    fn eight_by_eight_copy_bandwidth() {
        let result = BenchmarkResult::from_interval(
            "test".to_string(),
            Backend::Simulated,
            KernelVariant::LinearCopy,
            Dimensions::new(8, 8),
            256,
            interval(0, 100),
        );
        assert!((result.duration_s.unwrap() - 1e-7).abs() < 1e-15);
        assert!((result.bandwidth_gbps.unwrap() - 2.384).abs() < 1e-3);
        assert!(result.is_valid());
    }

    #[test]
    fn anomalous_interval_has_no_bandwidth() {
        let result = BenchmarkResult::from_interval(
            "test".to_string(),
            Backend::Simulated,
            KernelVariant::LinearCopy,
            Dimensions::new(8, 8),
            256,
            interval(100, 40),
        );
        assert_eq!(result.anomaly, Some(TimingAnomaly::Reversed));
        assert_eq!(result.bandwidth_gbps, None);
        assert!(!result.is_valid());
    }
}
