//! Host-side command recording with access-state tracking

use crate::driver::{
    AccessState, BufferDesc, BufferId, BufferRole, Command, PipelineId, QuerySetId,
};
use crate::BenchmarkError;
use std::collections::HashMap;
use std::ops::Range;

/// What the recorder knows about a live buffer
#[derive(Debug, Clone)]
pub struct TrackedBuffer {
    pub label: String,
    pub size: u64,
    pub role: BufferRole,
    pub state: AccessState,
}

/// The single reusable command recorder of a device context.
///
/// Starts closed. Every buffer access is checked against the state the
/// buffer will be in at that point of the stream, so a missing barrier is
/// reported while recording instead of surfacing as garbage on the GPU.
#[derive(Debug)]
pub struct CommandRecorder {
    open: bool,
    commands: Vec<Command>,
    buffers: HashMap<BufferId, TrackedBuffer>,
    query_sets: HashMap<QuerySetId, u32>,
}

impl CommandRecorder {
    pub(crate) fn new() -> Self {
        Self {
            open: false,
            commands: Vec::new(),
            buffers: HashMap::new(),
            query_sets: HashMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn open(&mut self) -> Result<(), BenchmarkError> {
        if self.open {
            return Err(BenchmarkError::Protocol(
                "command recorder reset while still open".to_string(),
            ));
        }
        self.open = true;
        self.commands.clear();
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<Vec<Command>, BenchmarkError> {
        if !self.open {
            return Err(BenchmarkError::Protocol(
                "command recorder closed twice".to_string(),
            ));
        }
        self.open = false;
        Ok(std::mem::take(&mut self.commands))
    }

    pub(crate) fn track_buffer(&mut self, id: BufferId, desc: &BufferDesc) {
        self.buffers.insert(
            id,
            TrackedBuffer {
                label: desc.label.clone(),
                size: desc.size,
                role: desc.role,
                state: desc.initial_state,
            },
        );
    }

    pub(crate) fn untrack_buffer(&mut self, id: BufferId) {
        self.buffers.remove(&id);
    }

    pub(crate) fn track_query_set(&mut self, id: QuerySetId, count: u32) {
        self.query_sets.insert(id, count);
    }

    /// Commands recorded since the last reset
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn buffer(&self, id: BufferId) -> Result<&TrackedBuffer, BenchmarkError> {
        self.buffers
            .get(&id)
            .ok_or_else(|| BenchmarkError::ResourceState(format!("unknown buffer {:?}", id)))
    }

    pub fn state(&self, id: BufferId) -> Result<AccessState, BenchmarkError> {
        Ok(self.buffer(id)?.state)
    }

    fn ensure_open(&self) -> Result<(), BenchmarkError> {
        if self.open {
            Ok(())
        } else {
            Err(BenchmarkError::Protocol(
                "recording into a closed command recorder".to_string(),
            ))
        }
    }

    /// Fail unless `id` is in `expected` at this point of the stream
    pub fn require_state(
        &self,
        id: BufferId,
        expected: AccessState,
        access: &str,
    ) -> Result<(), BenchmarkError> {
        let buffer = self.buffer(id)?;
        if buffer.state != expected {
            return Err(BenchmarkError::ResourceState(format!(
                "{} of '{}' requires {} state, buffer is in {}",
                access, buffer.label, expected, buffer.state
            )));
        }
        Ok(())
    }

    /// Emit a state-transition barrier. No-op when already in `to`.
    pub fn transition(&mut self, id: BufferId, to: AccessState) -> Result<(), BenchmarkError> {
        self.ensure_open()?;
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or_else(|| BenchmarkError::ResourceState(format!("unknown buffer {:?}", id)))?;

        if buffer.state == to {
            return Ok(());
        }
        if !buffer.role.allows(to) {
            return Err(BenchmarkError::ResourceState(format!(
                "{} buffer '{}' cannot enter {} state",
                buffer.role.name(),
                buffer.label,
                to
            )));
        }

        let from = buffer.state;
        buffer.state = to;
        self.commands.push(Command::Transition {
            buffer: id,
            from,
            to,
        });
        Ok(())
    }

    pub fn copy_buffer(
        &mut self,
        src: BufferId,
        dst: BufferId,
        size: u64,
    ) -> Result<(), BenchmarkError> {
        self.ensure_open()?;
        self.require_state(src, AccessState::CopySource, "copy read")?;
        self.require_state(dst, AccessState::CopyDest, "copy write")?;

        let (src_size, dst_size) = (self.buffer(src)?.size, self.buffer(dst)?.size);
        if size > src_size || size > dst_size {
            return Err(BenchmarkError::ResourceState(format!(
                "copy of {} bytes exceeds buffer bounds (src {}, dst {})",
                size, src_size, dst_size
            )));
        }

        self.commands.push(Command::CopyBuffer { src, dst, size });
        Ok(())
    }

    fn query_count(&self, query_set: QuerySetId) -> Result<u32, BenchmarkError> {
        self.query_sets.get(&query_set).copied().ok_or_else(|| {
            BenchmarkError::ResourceState(format!("unknown query set {:?}", query_set))
        })
    }

    pub fn write_timestamp(
        &mut self,
        query_set: QuerySetId,
        index: u32,
    ) -> Result<(), BenchmarkError> {
        self.ensure_open()?;
        let count = self.query_count(query_set)?;
        if index >= count {
            return Err(BenchmarkError::ResourceState(format!(
                "timestamp slot {} out of range for a {}-slot query set",
                index, count
            )));
        }
        self.commands
            .push(Command::WriteTimestamp { query_set, index });
        Ok(())
    }

    /// Copy query results as little-endian u64 ticks into `dst`
    pub fn resolve_queries(
        &mut self,
        query_set: QuerySetId,
        range: Range<u32>,
        dst: BufferId,
    ) -> Result<(), BenchmarkError> {
        self.ensure_open()?;
        let count = self.query_count(query_set)?;
        if range.start >= range.end || range.end > count {
            return Err(BenchmarkError::ResourceState(format!(
                "query range {:?} invalid for a {}-slot query set",
                range, count
            )));
        }
        self.require_state(dst, AccessState::CopyDest, "query resolve")?;

        let needed = (range.end - range.start) as u64 * std::mem::size_of::<u64>() as u64;
        let available = self.buffer(dst)?.size;
        if needed > available {
            return Err(BenchmarkError::ResourceState(format!(
                "resolving {} bytes of queries into a {}-byte buffer",
                needed, available
            )));
        }

        self.commands.push(Command::ResolveQueries {
            query_set,
            range,
            dst,
        });
        Ok(())
    }

    /// Record a dispatch. Binding validation is the pipeline's job.
    pub(crate) fn dispatch(
        &mut self,
        pipeline: PipelineId,
        bindings: Vec<BufferId>,
        groups: [u32; 3],
    ) -> Result<(), BenchmarkError> {
        self.ensure_open()?;
        self.commands.push(Command::Dispatch {
            pipeline,
            bindings,
            groups,
        });
        Ok(())
    }

    pub fn sample_counters(&mut self, slot: u32) -> Result<(), BenchmarkError> {
        self.ensure_open()?;
        self.commands.push(Command::SampleCounters { slot });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder_with(buffers: &[(u32, BufferDesc)]) -> CommandRecorder {
        let mut rec = CommandRecorder::new();
        for (id, desc) in buffers {
            rec.track_buffer(BufferId(*id), desc);
        }
        rec
    }

    #[test]
    fn starts_closed_and_rejects_recording() {
        let mut rec = recorder_with(&[(0, BufferDesc::storage("a", 16))]);
        assert!(!rec.is_open());
        assert!(matches!(
            rec.transition(BufferId(0), AccessState::CopyDest),
            Err(BenchmarkError::Protocol(_))
        ));
    }

    #[test]
    fn reset_requires_closed_recorder() {
        let mut rec = CommandRecorder::new();
        rec.open().unwrap();
        assert!(matches!(rec.open(), Err(BenchmarkError::Protocol(_))));
        rec.close().unwrap();
        assert!(matches!(rec.close(), Err(BenchmarkError::Protocol(_))));
    }

    #[test]
    fn transition_emits_barrier_once() {
        let mut rec = recorder_with(&[(0, BufferDesc::storage("a", 16))]);
        rec.open().unwrap();
        rec.transition(BufferId(0), AccessState::CopyDest).unwrap();
        rec.transition(BufferId(0), AccessState::CopyDest).unwrap();
        assert_eq!(
            rec.commands(),
            &[Command::Transition {
                buffer: BufferId(0),
                from: AccessState::Common,
                to: AccessState::CopyDest,
            }]
        );
    }

    #[test]
    fn copy_requires_copy_states() {
        let mut rec = recorder_with(&[
            (0, BufferDesc::storage("src", 16)),
            (1, BufferDesc::readback("dst", 16)),
        ]);
        rec.open().unwrap();
        assert!(matches!(
            rec.copy_buffer(BufferId(0), BufferId(1), 16),
            Err(BenchmarkError::ResourceState(_))
        ));
        rec.transition(BufferId(0), AccessState::CopySource).unwrap();
        rec.copy_buffer(BufferId(0), BufferId(1), 16).unwrap();
        assert!(rec.copy_buffer(BufferId(0), BufferId(1), 32).is_err());
    }

    #[test]
    fn role_forbids_illegal_states() {
        let mut rec = recorder_with(&[(0, BufferDesc::constant("cb", 16))]);
        rec.open().unwrap();
        assert!(rec
            .transition(BufferId(0), AccessState::UnorderedAccess)
            .is_err());
    }

    #[test]
    fn timestamp_slots_are_bounds_checked() {
        let mut rec = recorder_with(&[(0, BufferDesc::readback("ts", 8))]);
        rec.track_query_set(QuerySetId(0), 2);
        rec.open().unwrap();
        rec.write_timestamp(QuerySetId(0), 1).unwrap();
        assert!(rec.write_timestamp(QuerySetId(0), 2).is_err());
        // two slots need 16 bytes
        assert!(rec.resolve_queries(QuerySetId(0), 0..2, BufferId(0)).is_err());
    }
}
