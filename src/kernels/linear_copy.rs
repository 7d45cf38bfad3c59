use super::{bytes_of_len, decode_f32, f32_bytes, read_params, Kernel, KernelParams, Verification};
use crate::config::Dimensions;
use crate::context::{DeviceContext, StagingArena};
use crate::driver::{AccessState, BufferDesc, BufferId, Driver, ShaderBlob};
use crate::pipeline::{BindingKind, KernelInterface, Pipeline};
use crate::{BenchmarkError, KernelVariant};
use rand::rngs::StdRng;
use rand::Rng;
use std::f32::consts::TAU;

const SHADER: &[u8] = include_bytes!("../../shaders/wgsl/linear_copy.wgsl");

/// Strided f32 copy, one thread per element
pub struct LinearCopy {
    dims: Dimensions,
}

pub struct LinearCopyResources {
    pub params: BufferId,
    pub input: BufferId,
    pub output: BufferId,
    pub readback: BufferId,
    /// Host copy of the uploaded input
    pub host_input: Vec<f32>,
}

impl LinearCopy {
    pub const INTERFACE: KernelInterface = KernelInterface {
        entry_point: "linear_copy",
        bindings: &[
            BindingKind::Constant,
            BindingKind::ReadOnly,
            BindingKind::ReadWrite,
        ],
        workgroup_size: [64, 1, 1],
    };

    pub fn new(dims: Dimensions) -> Self {
        Self { dims }
    }

    fn input_len(&self) -> usize {
        self.dims.height as usize * self.dims.input_stride as usize
    }

    fn output_len(&self) -> usize {
        self.dims.height as usize * self.dims.output_stride as usize
    }

    /// magnitude * cos(phi) with magnitude in [1, 10) and phi in [0, 2π)
    fn generate_input(&self, rng: &mut StdRng) -> Vec<f32> {
        (0..self.input_len())
            .map(|_| {
                let magnitude: f32 = rng.gen_range(1.0..10.0);
                let phi: f32 = rng.gen_range(0.0..TAU);
                magnitude * phi.cos()
            })
            .collect()
    }
}

impl Kernel for LinearCopy {
    type Resources = LinearCopyResources;

    fn variant(&self) -> KernelVariant {
        KernelVariant::LinearCopy
    }

    fn interface(&self) -> &KernelInterface {
        &Self::INTERFACE
    }

    fn shader(&self) -> ShaderBlob {
        ShaderBlob::wgsl("linear_copy.wgsl", SHADER)
    }

    fn dimensions(&self) -> Dimensions {
        self.dims
    }

    fn workload(&self) -> [u32; 3] {
        [self.dims.width.saturating_mul(self.dims.height), 1, 1]
    }

    fn bytes_moved(&self) -> u64 {
        self.dims.elements() * std::mem::size_of::<f32>() as u64
    }

    fn build<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        staging: &mut StagingArena,
        rng: &mut StdRng,
    ) -> Result<LinearCopyResources, BenchmarkError> {
        let host_input = self.generate_input(rng);
        let params = KernelParams::from(self.dims);

        let params_buffer = ctx.create_buffer(&BufferDesc::constant(
            "Copy Params",
            std::mem::size_of::<KernelParams>() as u64,
        ))?;
        let input = ctx.create_buffer(&BufferDesc::storage(
            "Copy Input",
            bytes_of_len(host_input.len()),
        ))?;
        let output = ctx.create_buffer(
            &BufferDesc::storage("Copy Output", bytes_of_len(self.output_len()))
                .with_initial_state(AccessState::UnorderedAccess),
        )?;
        let readback = ctx.create_buffer(&BufferDesc::readback(
            "Copy Readback",
            bytes_of_len(self.output_len()),
        ))?;

        ctx.upload(staging, params_buffer, bytemuck::bytes_of(&params))?;
        ctx.upload(staging, input, &f32_bytes(&host_input))?;

        let rec = ctx.recorder()?;
        rec.transition(params_buffer, AccessState::ShaderRead)?;
        rec.transition(input, AccessState::ShaderRead)?;

        Ok(LinearCopyResources {
            params: params_buffer,
            input,
            output,
            readback,
            host_input,
        })
    }

    fn dispatch<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        pipeline: &Pipeline,
        res: &LinearCopyResources,
    ) -> Result<(), BenchmarkError> {
        pipeline.dispatch(ctx, &[res.params, res.input, res.output], self.workload())
    }

    fn copy_output<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        res: &LinearCopyResources,
    ) -> Result<(), BenchmarkError> {
        let rec = ctx.recorder()?;
        rec.transition(res.output, AccessState::CopySource)?;
        rec.transition(res.readback, AccessState::CopyDest)?;
        rec.copy_buffer(res.output, res.readback, bytes_of_len(self.output_len()))?;
        rec.transition(res.readback, AccessState::HostRead)
    }

    fn output_readback(&self, res: &LinearCopyResources) -> BufferId {
        res.readback
    }

    fn verify(&self, res: &LinearCopyResources, output: &[u8]) -> Verification {
        let output = decode_f32(output);
        let d = self.dims;
        let expected = (0..d.height).flat_map(move |y| (0..d.width).map(move |x| (x, y)));
        Verification::compare(
            expected.map(|(x, y)| {
                let src = (y * d.input_stride + x) as usize;
                let dst = (y * d.output_stride + x) as usize;
                let want = res.host_input.get(src).copied().unwrap_or(f32::NAN);
                let got = output.get(dst).copied().unwrap_or(f32::NAN);
                (dst as u64, want, got)
            }),
            0.0,
        )
    }
}

/// CPU version of `linear_copy`; bindings are `[params, input, output]`
pub(crate) fn emulate(
    buffers: &mut [Vec<u8>],
    groups: [u32; 3],
    workgroup: [u32; 3],
) -> Result<(), String> {
    let [params, input, output] = buffers else {
        return Err(format!("linear_copy expects 3 bindings, got {}", buffers.len()));
    };
    let p = read_params(params)?;
    let threads = groups[0] as u64 * workgroup[0] as u64;
    let elements = p.width as u64 * p.height as u64;

    for i in 0..threads.min(elements) {
        let (x, y) = (i % p.width as u64, i / p.width as u64);
        let src = ((y * p.input_stride as u64 + x) * 4) as usize;
        let dst = ((y * p.output_stride as u64 + x) * 4) as usize;
        let value = input
            .get(src..src + 4)
            .ok_or_else(|| format!("input read out of bounds at element {}", i))?;
        output
            .get_mut(dst..dst + 4)
            .ok_or_else(|| format!("output write out of bounds at element {}", i))?
            .copy_from_slice(value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulation_respects_strides() {
        let p = KernelParams {
            width: 2,
            height: 2,
            input_stride: 3,
            output_stride: 4,
        };
        let input: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let mut buffers = vec![
            bytemuck::bytes_of(&p).to_vec(),
            f32_bytes(&input),
            vec![0u8; 8 * 4],
        ];
        emulate(&mut buffers, [1, 1, 1], [64, 1, 1]).unwrap();
        assert_eq!(
            decode_f32(&buffers[2]),
            vec![0.0, 1.0, 0.0, 0.0, 3.0, 4.0, 0.0, 0.0]
        );
    }

    #[test]
    fn bytes_moved_counts_one_f32_per_element() {
        assert_eq!(LinearCopy::new(Dimensions::new(8, 8)).bytes_moved(), 256);
        assert_eq!(LinearCopy::new(Dimensions::new(8, 8)).workload(), [64, 1, 1]);
    }

    #[test]
    fn generated_input_is_bounded() {
        let kernel = LinearCopy::new(Dimensions::new(16, 4));
        let input = kernel.generate_input(&mut super::super::input_rng(Some(1)));
        assert_eq!(input.len(), 64);
        assert!(input.iter().all(|v| v.abs() < 10.0));
    }
}
