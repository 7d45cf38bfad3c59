//! Benchmark kernels: resource sets, dispatch and CPU references

mod linear_copy;
mod vector_length;

pub use linear_copy::{LinearCopy, LinearCopyResources};
pub use vector_length::{VectorLength, VectorLengthResources};

use crate::config::Dimensions;
use crate::context::{DeviceContext, StagingArena};
use crate::driver::{BufferId, Driver, ShaderBlob};
use crate::pipeline::{KernelInterface, Pipeline};
use crate::sim::CpuKernel;
use crate::{BenchmarkError, KernelVariant};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Constant block shared by both kernels
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub width: u32,
    pub height: u32,
    pub input_stride: u32,
    pub output_stride: u32,
}

impl From<Dimensions> for KernelParams {
    fn from(d: Dimensions) -> Self {
        Self {
            width: d.width,
            height: d.height,
            input_stride: d.input_stride,
            output_stride: d.output_stride,
        }
    }
}

/// Outcome of comparing GPU output against the CPU reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub checked: u64,
    pub mismatches: u64,
    /// (element index, expected, actual)
    pub first_mismatch: Option<(u64, f32, f32)>,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }

    fn compare(expected: impl Iterator<Item = (u64, f32, f32)>, tolerance: f32) -> Self {
        let mut result = Self {
            checked: 0,
            mismatches: 0,
            first_mismatch: None,
        };
        for (index, want, got) in expected {
            result.checked += 1;
            let scale = want.abs().max(1.0);
            if (want - got).abs() > tolerance * scale || got.is_nan() {
                result.mismatches += 1;
                result.first_mismatch.get_or_insert((index, want, got));
            }
        }
        result
    }
}

/// One benchmark kernel: owns its workload shape and knows how to build,
/// bind and dispatch its resource set.
pub trait Kernel {
    type Resources;

    fn variant(&self) -> KernelVariant;

    fn interface(&self) -> &KernelInterface;

    /// Kernel blob handed to pipeline creation
    fn shader(&self) -> ShaderBlob;

    fn dimensions(&self) -> Dimensions;

    /// Threads per axis covered by the dispatch
    fn workload(&self) -> [u32; 3];

    /// Bytes the measured dispatch moves, for throughput
    fn bytes_moved(&self) -> u64;

    /// Allocate and stage every buffer. Runs inside an open build session.
    fn build<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        staging: &mut StagingArena,
        rng: &mut StdRng,
    ) -> Result<Self::Resources, BenchmarkError>;

    /// Bind resources and record the dispatch
    fn dispatch<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        pipeline: &Pipeline,
        resources: &Self::Resources,
    ) -> Result<(), BenchmarkError>;

    /// Move the output into the readback buffer and leave it host readable
    fn copy_output<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        resources: &Self::Resources,
    ) -> Result<(), BenchmarkError>;

    fn output_readback(&self, resources: &Self::Resources) -> BufferId;

    fn verify(&self, resources: &Self::Resources, output: &[u8]) -> Verification;
}

/// Input generator, reproducible when a seed is given
pub fn input_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// CPU implementations registered with the simulated device
pub fn cpu_kernels() -> Vec<(&'static str, CpuKernel)> {
    vec![
        (
            LinearCopy::INTERFACE.entry_point,
            linear_copy::emulate as CpuKernel,
        ),
        (
            VectorLength::INTERFACE.entry_point,
            vector_length::emulate as CpuKernel,
        ),
    ]
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn read_params(bytes: &[u8]) -> Result<KernelParams, String> {
    let size = std::mem::size_of::<KernelParams>();
    if bytes.len() < size {
        return Err(format!("constant buffer holds {} bytes, need {}", bytes.len(), size));
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
}

fn bytes_of_len(values: usize) -> u64 {
    (values * std::mem::size_of::<f32>()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_inputs_repeat() {
        use rand::Rng;
        let (mut r1, mut r2) = (input_rng(Some(7)), input_rng(Some(7)));
        let a: Vec<u32> = (0..4).map(|_| r1.gen()).collect();
        let b: Vec<u32> = (0..4).map(|_| r2.gen()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn verification_counts_mismatches() {
        let v = Verification::compare(
            vec![(0, 1.0, 1.0), (1, 2.0, 2.5), (2, 3.0, f32::NAN)].into_iter(),
            1e-6,
        );
        assert_eq!(v.checked, 3);
        assert_eq!(v.mismatches, 2);
        assert_eq!(v.first_mismatch, Some((1, 2.0, 2.5)));
        assert!(!v.passed());
    }

    #[test]
    fn params_round_trip_through_bytes() {
        let params = KernelParams::from(Dimensions::new(8, 4).with_strides(16, 8));
        let bytes = bytemuck::bytes_of(&params).to_vec();
        assert_eq!(read_params(&bytes), Ok(params));
        assert!(read_params(&bytes[..8]).is_err());
    }
}
