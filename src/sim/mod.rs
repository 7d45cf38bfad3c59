//! Software device for dry runs and protocol tests

mod device;
mod queue;

pub use device::{SimClock, SimOptions, SimStats, SimulatedDriver};

/// CPU implementation of a kernel entry point.
///
/// Receives the bound buffers in slot order, the thread-group grid and the
/// thread-group size.
pub type CpuKernel = fn(&mut [Vec<u8>], [u32; 3], [u32; 3]) -> Result<(), String>;
