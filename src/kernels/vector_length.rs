use super::{bytes_of_len, decode_f32, f32_bytes, read_params, Kernel, KernelParams, Verification};
use crate::config::Dimensions;
use crate::context::{DeviceContext, StagingArena};
use crate::driver::{AccessState, BufferDesc, BufferId, Driver, ShaderBlob};
use crate::pipeline::{BindingKind, KernelInterface, Pipeline};
use crate::{BenchmarkError, KernelVariant};
use rand::rngs::StdRng;
use rand::Rng;
use std::f32::consts::TAU;

const SHADER: &[u8] = include_bytes!("../../shaders/wgsl/vector_length.wgsl");
const COMPONENTS: usize = 3;

/// Length of packed f32x3 vectors, one thread per vector on an 8x8 tile
pub struct VectorLength {
    dims: Dimensions,
}

pub struct VectorLengthResources {
    pub vectors: BufferId,
    pub lengths: BufferId,
    pub params: BufferId,
    pub readback: BufferId,
    pub host_vectors: Vec<[f32; 3]>,
}

impl VectorLength {
    pub const INTERFACE: KernelInterface = KernelInterface {
        entry_point: "vector_length",
        bindings: &[
            BindingKind::ReadOnly,
            BindingKind::ReadWrite,
            BindingKind::Constant,
        ],
        workgroup_size: [8, 8, 1],
    };

    pub fn new(dims: Dimensions) -> Self {
        Self { dims }
    }

    fn output_len(&self) -> usize {
        self.dims.height as usize * self.dims.output_stride as usize
    }

    /// Spherically sampled vectors with magnitude in [1, 10)
    fn generate_input(&self, rng: &mut StdRng) -> Vec<[f32; 3]> {
        let count = self.dims.height as usize * self.dims.input_stride as usize;
        (0..count)
            .map(|_| {
                let magnitude: f32 = rng.gen_range(1.0..10.0);
                let theta: f32 = rng.gen_range(0.0..TAU);
                let phi: f32 = rng.gen_range(0.0..TAU);
                [
                    magnitude * phi.sin() * theta.cos(),
                    magnitude * phi.sin() * theta.sin(),
                    magnitude * phi.cos(),
                ]
            })
            .collect()
    }
}

fn length(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

impl Kernel for VectorLength {
    type Resources = VectorLengthResources;

    fn variant(&self) -> KernelVariant {
        KernelVariant::VectorLength
    }

    fn interface(&self) -> &KernelInterface {
        &Self::INTERFACE
    }

    fn shader(&self) -> ShaderBlob {
        ShaderBlob::wgsl("vector_length.wgsl", SHADER)
    }

    fn dimensions(&self) -> Dimensions {
        self.dims
    }

    fn workload(&self) -> [u32; 3] {
        [self.dims.width, self.dims.height, 1]
    }

    fn bytes_moved(&self) -> u64 {
        self.dims.elements() * (COMPONENTS * std::mem::size_of::<f32>()) as u64
    }

    fn build<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        staging: &mut StagingArena,
        rng: &mut StdRng,
    ) -> Result<VectorLengthResources, BenchmarkError> {
        let host_vectors = self.generate_input(rng);
        let flat: Vec<f32> = host_vectors.iter().flatten().copied().collect();
        let params = KernelParams::from(self.dims);

        let vectors = ctx.create_buffer(&BufferDesc::storage("Vectors", bytes_of_len(flat.len())))?;
        let lengths = ctx.create_buffer(
            &BufferDesc::storage("Lengths", bytes_of_len(self.output_len()))
                .with_initial_state(AccessState::UnorderedAccess),
        )?;
        let params_buffer = ctx.create_buffer(&BufferDesc::constant(
            "Vector Params",
            std::mem::size_of::<KernelParams>() as u64,
        ))?;
        let readback = ctx.create_buffer(&BufferDesc::readback(
            "Lengths Readback",
            bytes_of_len(self.output_len()),
        ))?;

        ctx.upload(staging, vectors, &f32_bytes(&flat))?;
        ctx.upload(staging, params_buffer, bytemuck::bytes_of(&params))?;

        let rec = ctx.recorder()?;
        rec.transition(vectors, AccessState::ShaderRead)?;
        rec.transition(params_buffer, AccessState::ShaderRead)?;

        Ok(VectorLengthResources {
            vectors,
            lengths,
            params: params_buffer,
            readback,
            host_vectors,
        })
    }

    fn dispatch<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        pipeline: &Pipeline,
        res: &VectorLengthResources,
    ) -> Result<(), BenchmarkError> {
        pipeline.dispatch(ctx, &[res.vectors, res.lengths, res.params], self.workload())
    }

    fn copy_output<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        res: &VectorLengthResources,
    ) -> Result<(), BenchmarkError> {
        let rec = ctx.recorder()?;
        rec.transition(res.lengths, AccessState::CopySource)?;
        rec.transition(res.readback, AccessState::CopyDest)?;
        rec.copy_buffer(res.lengths, res.readback, bytes_of_len(self.output_len()))?;
        rec.transition(res.readback, AccessState::HostRead)
    }

    fn output_readback(&self, res: &VectorLengthResources) -> BufferId {
        res.readback
    }

    fn verify(&self, res: &VectorLengthResources, output: &[u8]) -> Verification {
        let output = decode_f32(output);
        let d = self.dims;
        let cells = (0..d.height).flat_map(move |y| (0..d.width).map(move |x| (x, y)));
        Verification::compare(
            cells.map(|(x, y)| {
                let src = (y * d.input_stride + x) as usize;
                let dst = (y * d.output_stride + x) as usize;
                let want = res.host_vectors.get(src).map_or(f32::NAN, |v| length(*v));
                let got = output.get(dst).copied().unwrap_or(f32::NAN);
                (dst as u64, want, got)
            }),
            1e-5,
        )
    }
}

/// CPU version of `vector_length`; bindings are `[vectors, lengths, params]`
pub(crate) fn emulate(
    buffers: &mut [Vec<u8>],
    groups: [u32; 3],
    workgroup: [u32; 3],
) -> Result<(), String> {
    let [vectors, lengths, params] = buffers else {
        return Err(format!("vector_length expects 3 bindings, got {}", buffers.len()));
    };
    let p = read_params(params)?;
    let vectors = decode_f32(vectors);
    let threads_x = groups[0] * workgroup[0];
    let threads_y = groups[1] * workgroup[1];

    for y in 0..threads_y.min(p.height) {
        for x in 0..threads_x.min(p.width) {
            let src = (y * p.input_stride + x) as usize * COMPONENTS;
            let v = vectors
                .get(src..src + COMPONENTS)
                .ok_or_else(|| format!("vector read out of bounds at ({}, {})", x, y))?;
            let dst = (y * p.output_stride + x) as usize * 4;
            lengths
                .get_mut(dst..dst + 4)
                .ok_or_else(|| format!("length write out of bounds at ({}, {})", x, y))?
                .copy_from_slice(&length([v[0], v[1], v[2]]).to_le_bytes());
        }
    }
    Ok(())
}
