//! WebGPU backend (cross-platform)

mod device;
mod pipeline;
mod queue;

pub use device::WebGpuDriver;
