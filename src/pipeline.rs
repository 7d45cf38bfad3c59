//! Compute pipeline management

use crate::context::DeviceContext;
use crate::driver::{AccessState, BufferId, BufferRole, Driver, PipelineId, ShaderBlob};
use crate::{BenchmarkError, ConfigError};

/// Kind of resource a kernel parameter slot accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Uniform constants
    Constant,
    /// Read-only storage buffer
    ReadOnly,
    /// Read-write (unordered access) storage buffer
    ReadWrite,
}

impl BindingKind {
    pub fn name(&self) -> &'static str {
        match self {
            BindingKind::Constant => "constant",
            BindingKind::ReadOnly => "read-only",
            BindingKind::ReadWrite => "read-write",
        }
    }

    fn required_role(&self) -> BufferRole {
        match self {
            BindingKind::Constant => BufferRole::Constant,
            BindingKind::ReadOnly | BindingKind::ReadWrite => BufferRole::Storage,
        }
    }

    fn required_state(&self) -> AccessState {
        match self {
            BindingKind::Constant | BindingKind::ReadOnly => AccessState::ShaderRead,
            BindingKind::ReadWrite => AccessState::UnorderedAccess,
        }
    }
}

/// Calling convention a kernel blob was compiled against.
///
/// Slot `i` of `bindings` is `@binding(i)` of bind group 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInterface {
    pub entry_point: &'static str,
    pub bindings: &'static [BindingKind],
    pub workgroup_size: [u32; 3],
}

impl KernelInterface {
    /// Thread-group grid covering `workload` threads exactly, with no axis
    /// above `max_groups`
    pub fn grid_for(&self, workload: [u32; 3], max_groups: u32) -> Result<[u32; 3], ConfigError> {
        let mut groups = [0u32; 3];
        for axis in 0..3 {
            let size = workload[axis];
            let group = self.workgroup_size[axis];
            if size == 0 || group == 0 || size % group != 0 {
                return Err(ConfigError::NotDivisible { axis, size, group });
            }
            groups[axis] = size / group;
            if groups[axis] > max_groups {
                return Err(ConfigError::GridTooLarge {
                    axis,
                    groups: groups[axis],
                    limit: max_groups,
                });
            }
        }
        Ok(groups)
    }

    pub fn threads_per_group(&self) -> u32 {
        self.workgroup_size.iter().product()
    }
}

/// A compiled kernel plus its declared binding layout
pub struct Pipeline {
    id: PipelineId,
    interface: KernelInterface,
}

impl Pipeline {
    pub fn new<D: Driver>(
        ctx: &mut DeviceContext<D>,
        interface: &KernelInterface,
        blob: &ShaderBlob,
    ) -> Result<Self, BenchmarkError> {
        let id = ctx.create_pipeline(interface, blob)?;
        Ok(Self {
            id,
            interface: interface.clone(),
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn interface(&self) -> &KernelInterface {
        &self.interface
    }

    /// Bind `bindings` in slot order and record one dispatch over `workload`
    pub fn dispatch<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        bindings: &[BufferId],
        workload: [u32; 3],
    ) -> Result<(), BenchmarkError> {
        let limit = ctx.max_workgroups_per_dimension();
        let groups = self.interface.grid_for(workload, limit)?;
        let rec = ctx.recorder()?;

        let declared = self.interface.bindings;
        if bindings.len() != declared.len() {
            return Err(ConfigError::BindingCount {
                kernel: self.interface.entry_point,
                expected: declared.len(),
                actual: bindings.len(),
            }
            .into());
        }

        for (slot, (&buffer, kind)) in bindings.iter().zip(declared).enumerate() {
            let tracked = rec.buffer(buffer)?;
            if tracked.role != kind.required_role() {
                return Err(ConfigError::BindingKind {
                    kernel: self.interface.entry_point,
                    slot,
                    expected: kind.name().to_string(),
                    actual: format!("{} buffer '{}'", tracked.role.name(), tracked.label),
                }
                .into());
            }
            rec.require_state(buffer, kind.required_state(), kind.name())?;
        }

        for (i, a) in bindings.iter().enumerate() {
            if bindings[i + 1..].contains(a) {
                return Err(BenchmarkError::ResourceState(format!(
                    "buffer {:?} bound to more than one slot",
                    a
                )));
            }
        }

        rec.dispatch(self.id, bindings.to_vec(), groups)
    }
}
