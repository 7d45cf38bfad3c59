//! Backend-neutral device interface
//!
//! A [`Driver`] owns one device and one queue. Everything above it (the
//! device context, timestamp queries, kernels) talks to the GPU through
//! resource handles and recorded [`Command`] lists, so the same timing
//! protocol runs against wgpu and against the simulated device.

use crate::pipeline::KernelInterface;
use crate::BenchmarkError;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuerySetId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u32);

/// Where a buffer lives and what it may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Device-private, bindable as a read-only or read-write storage buffer
    Storage,
    /// Device-private, bindable as a constant (uniform) buffer
    Constant,
    /// Host-written staging memory, only ever a copy source
    Upload,
    /// Host-readable memory that GPU results are copied into
    Readback,
}

impl BufferRole {
    pub fn name(&self) -> &'static str {
        match self {
            BufferRole::Storage => "storage",
            BufferRole::Constant => "constant",
            BufferRole::Upload => "upload",
            BufferRole::Readback => "readback",
        }
    }

    /// States a buffer of this role may legally be transitioned into
    pub fn allows(&self, state: AccessState) -> bool {
        use AccessState::*;
        match self {
            BufferRole::Storage => matches!(
                state,
                Common | CopyDest | CopySource | ShaderRead | UnorderedAccess
            ),
            BufferRole::Constant => matches!(state, Common | CopyDest | ShaderRead),
            BufferRole::Upload => matches!(state, CopySource),
            BufferRole::Readback => matches!(state, CopyDest | HostRead),
        }
    }
}

/// GPU-tracked access mode of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessState {
    Common,
    CopyDest,
    CopySource,
    ShaderRead,
    UnorderedAccess,
    HostRead,
}

impl AccessState {
    pub fn name(&self) -> &'static str {
        match self {
            AccessState::Common => "common",
            AccessState::CopyDest => "copy-dest",
            AccessState::CopySource => "copy-source",
            AccessState::ShaderRead => "shader-read",
            AccessState::UnorderedAccess => "unordered-access",
            AccessState::HostRead => "host-read",
        }
    }
}

impl std::fmt::Display for AccessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub role: BufferRole,
    pub initial_state: AccessState,
}

impl BufferDesc {
    pub fn storage(label: &str, size: u64) -> Self {
        Self {
            label: label.to_string(),
            size,
            role: BufferRole::Storage,
            initial_state: AccessState::Common,
        }
    }

    pub fn constant(label: &str, size: u64) -> Self {
        Self {
            label: label.to_string(),
            size,
            role: BufferRole::Constant,
            initial_state: AccessState::Common,
        }
    }

    pub fn readback(label: &str, size: u64) -> Self {
        Self {
            label: label.to_string(),
            size,
            role: BufferRole::Readback,
            initial_state: AccessState::CopyDest,
        }
    }

    pub fn upload(label: &str, size: u64) -> Self {
        Self {
            label: label.to_string(),
            size,
            role: BufferRole::Upload,
            initial_state: AccessState::CopySource,
        }
    }

    pub fn with_initial_state(mut self, state: AccessState) -> Self {
        self.initial_state = state;
        self
    }
}

/// A recorded GPU instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Transition {
        buffer: BufferId,
        from: AccessState,
        to: AccessState,
    },
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        size: u64,
    },
    WriteTimestamp {
        query_set: QuerySetId,
        index: u32,
    },
    ResolveQueries {
        query_set: QuerySetId,
        range: Range<u32>,
        dst: BufferId,
    },
    Dispatch {
        pipeline: PipelineId,
        bindings: Vec<BufferId>,
        groups: [u32; 3],
    },
    SampleCounters {
        slot: u32,
    },
}

/// Source language of a kernel blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderFormat {
    Wgsl,
}

/// An opaque compiled kernel handed to the driver as bytes
#[derive(Debug, Clone)]
pub struct ShaderBlob {
    pub label: String,
    pub format: ShaderFormat,
    pub bytes: Cow<'static, [u8]>,
}

impl ShaderBlob {
    pub fn wgsl(label: &str, bytes: &'static [u8]) -> Self {
        Self {
            label: label.to_string(),
            format: ShaderFormat::Wgsl,
            bytes: Cow::Borrowed(bytes),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, BenchmarkError> {
        let bytes = std::fs::read(path)?;
        Ok(Self {
            label: path.display().to_string(),
            format: ShaderFormat::Wgsl,
            bytes: Cow::Owned(bytes),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Counter values captured at one point of the command stream
pub type CounterSnapshot = BTreeMap<String, f64>;

/// One compute device with a single direct queue and a monotonic fence.
///
/// Handles are allocated by the caller; a driver only stores the native
/// object under the id it is given. `execute` and `signal` enqueue work and
/// return immediately, `wait_for` is the only call that blocks.
pub trait Driver {
    /// Human readable adapter name
    fn device_name(&self) -> String;

    /// Device timestamp ticks per second, read once from the queue
    fn timestamp_frequency(&self) -> f64;

    /// Largest thread-group count a single dispatch may use on any axis
    fn max_workgroups_per_dimension(&self) -> u32;

    fn create_buffer(&mut self, id: BufferId, desc: &BufferDesc) -> Result<(), BenchmarkError>;

    /// Create a host-written upload buffer initialised with `contents`
    fn create_upload_buffer(
        &mut self,
        id: BufferId,
        desc: &BufferDesc,
        contents: &[u8],
    ) -> Result<(), BenchmarkError>;

    fn destroy_buffer(&mut self, id: BufferId);

    fn create_query_set(&mut self, id: QuerySetId, count: u32) -> Result<(), BenchmarkError>;

    fn create_pipeline(
        &mut self,
        id: PipelineId,
        interface: &KernelInterface,
        blob: &ShaderBlob,
    ) -> Result<(), BenchmarkError>;

    /// Hand a closed command list to the queue
    fn execute(&mut self, commands: Vec<Command>) -> Result<(), BenchmarkError>;

    /// Enqueue a fence signal of `value` behind all previously executed work
    fn signal(&mut self, value: u64) -> Result<(), BenchmarkError>;

    /// Highest fence value the device has retired
    fn completed_value(&self) -> u64;

    /// Block until `completed_value() >= value`
    fn wait_for(&mut self, value: u64) -> Result<(), BenchmarkError>;

    /// Map a readback buffer, copy `size` bytes out and unmap it
    fn read_buffer(&mut self, id: BufferId, size: u64) -> Result<Vec<u8>, BenchmarkError>;

    /// Hardware counters this device can sample
    fn supported_counters(&self) -> Vec<String> {
        Vec::new()
    }

    /// Values captured by a retired `SampleCounters` command
    fn counter_sample(&mut self, _slot: u32) -> Option<CounterSnapshot> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_restrict_states() {
        assert!(BufferRole::Storage.allows(AccessState::UnorderedAccess));
        assert!(!BufferRole::Constant.allows(AccessState::UnorderedAccess));
        assert!(!BufferRole::Upload.allows(AccessState::CopyDest));
        assert!(BufferRole::Readback.allows(AccessState::HostRead));
        assert!(!BufferRole::Readback.allows(AccessState::ShaderRead));
    }

    #[test]
    fn descriptors_start_in_role_default_state() {
        assert_eq!(
            BufferDesc::readback("r", 8).initial_state,
            AccessState::CopyDest
        );
        assert_eq!(
            BufferDesc::upload("u", 8).initial_state,
            AccessState::CopySource
        );
        let out = BufferDesc::storage("o", 8).with_initial_state(AccessState::UnorderedAccess);
        assert_eq!(out.initial_state, AccessState::UnorderedAccess);
    }
}
