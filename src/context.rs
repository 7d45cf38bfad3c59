//! Device context: one device, one queue, one recorder, one fence

use crate::driver::{BufferDesc, BufferId, BufferRole, Driver, PipelineId, QuerySetId, ShaderBlob};
use crate::pipeline::KernelInterface;
use crate::recorder::CommandRecorder;
use crate::BenchmarkError;
use log::{debug, info};

/// Upload buffers that must outlive the submission copying out of them.
///
/// Owned by a single build session and handed back to
/// [`DeviceContext::release`] once that submission has been awaited.
#[derive(Debug, Default)]
pub struct StagingArena {
    buffers: Vec<BufferId>,
    bytes: u64,
}

impl StagingArena {
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total bytes staged through this arena
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Owns the driver together with the only command recorder and the
/// monotonic fence counter. Recording, submission and waiting all happen
/// on the thread that owns the context.
pub struct DeviceContext<D: Driver> {
    driver: D,
    recorder: CommandRecorder,
    fence_value: u64,
    submissions: u64,
    retired_submissions: u64,
    next_buffer: u32,
    next_query_set: u32,
    next_pipeline: u32,
}

impl<D: Driver> DeviceContext<D> {
    /// Take ownership of an opened device. The fence starts at 0 and the
    /// recorder starts closed.
    pub fn initialize(driver: D) -> Self {
        info!(
            "Device ready: {} ({:.0} timestamp ticks/s)",
            driver.device_name(),
            driver.timestamp_frequency()
        );
        Self {
            driver,
            recorder: CommandRecorder::new(),
            fence_value: 0,
            submissions: 0,
            retired_submissions: 0,
            next_buffer: 0,
            next_query_set: 0,
            next_pipeline: 0,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn device_name(&self) -> String {
        self.driver.device_name()
    }

    pub fn timestamp_frequency(&self) -> f64 {
        self.driver.timestamp_frequency()
    }

    pub fn max_workgroups_per_dimension(&self) -> u32 {
        self.driver.max_workgroups_per_dimension()
    }

    /// Last fence value signaled on the queue
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    /// Number of command lists handed to the queue so far
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Serial the currently open recording will get when submitted
    pub fn pending_submission(&self) -> u64 {
        self.submissions + 1
    }

    pub fn is_retired(&self, submission: u64) -> bool {
        submission <= self.retired_submissions
    }

    /// Reopen the recorder. It must be closed.
    pub fn reset(&mut self) -> Result<(), BenchmarkError> {
        self.recorder.open()
    }

    /// The open recorder
    pub fn recorder(&mut self) -> Result<&mut CommandRecorder, BenchmarkError> {
        if !self.recorder.is_open() {
            return Err(BenchmarkError::Protocol(
                "command recorder is closed; reset it before recording".to_string(),
            ));
        }
        Ok(&mut self.recorder)
    }

    pub fn tracker(&self) -> &CommandRecorder {
        &self.recorder
    }

    /// Close the recorder and hand its commands to the queue
    pub fn submit(&mut self) -> Result<u64, BenchmarkError> {
        let commands = self.recorder.close()?;
        let count = commands.len();
        self.driver.execute(commands)?;
        self.submissions += 1;
        debug!(
            "Submitted command list #{} ({} commands)",
            self.submissions, count
        );
        Ok(self.submissions)
    }

    /// Signal the next fence value and block until the device retires it
    pub fn signal_and_wait(&mut self) -> Result<u64, BenchmarkError> {
        let value = self.fence_value + 1;
        self.driver.signal(value)?;
        self.fence_value = value;
        debug!("Waiting for fence value {}", value);

        self.driver.wait_for(value)?;
        let completed = self.driver.completed_value();
        if completed < value {
            return Err(BenchmarkError::Execution(format!(
                "fence wait returned at {} before reaching {}",
                completed, value
            )));
        }

        self.retired_submissions = self.submissions;
        Ok(value)
    }

    pub fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId, BenchmarkError> {
        if desc.size == 0 {
            return Err(BenchmarkError::BufferCreation(format!(
                "buffer '{}' has zero size",
                desc.label
            )));
        }
        if !desc.role.allows(desc.initial_state) {
            return Err(BenchmarkError::BufferCreation(format!(
                "{} buffer '{}' cannot start in {} state",
                desc.role.name(),
                desc.label,
                desc.initial_state
            )));
        }

        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.driver.create_buffer(id, desc)?;
        self.recorder.track_buffer(id, desc);
        Ok(id)
    }

    pub fn destroy_buffer(&mut self, id: BufferId) {
        self.driver.destroy_buffer(id);
        self.recorder.untrack_buffer(id);
    }

    pub fn create_query_set(&mut self, count: u32) -> Result<QuerySetId, BenchmarkError> {
        let id = QuerySetId(self.next_query_set);
        self.next_query_set += 1;
        self.driver.create_query_set(id, count)?;
        self.recorder.track_query_set(id, count);
        Ok(id)
    }

    pub fn create_pipeline(
        &mut self,
        interface: &KernelInterface,
        blob: &ShaderBlob,
    ) -> Result<PipelineId, BenchmarkError> {
        if blob.is_empty() {
            return Err(BenchmarkError::ShaderCompilation(format!(
                "kernel blob '{}' is empty",
                blob.label
            )));
        }
        let id = PipelineId(self.next_pipeline);
        self.next_pipeline += 1;
        debug!(
            "Creating pipeline '{}' from '{}' ({} bytes)",
            interface.entry_point,
            blob.label,
            blob.len()
        );
        self.driver.create_pipeline(id, interface, blob)?;
        Ok(id)
    }

    /// Stage `bytes` into `dst` through a transient upload buffer.
    ///
    /// Leaves `dst` in copy-dest state; the caller transitions it to its
    /// steady-state access mode.
    pub fn upload(
        &mut self,
        staging: &mut StagingArena,
        dst: BufferId,
        bytes: &[u8],
    ) -> Result<(), BenchmarkError> {
        let label = format!("{} (upload)", self.recorder.buffer(dst)?.label);
        let desc = BufferDesc::upload(&label, bytes.len() as u64);

        let upload = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.driver.create_upload_buffer(upload, &desc, bytes)?;
        self.recorder.track_buffer(upload, &desc);
        staging.buffers.push(upload);
        staging.bytes += desc.size;

        let recorder = self.recorder()?;
        recorder.transition(dst, crate::driver::AccessState::CopyDest)?;
        recorder.copy_buffer(upload, dst, desc.size)
    }

    /// Destroy staging buffers once the submission using them has retired
    pub fn release(&mut self, staging: StagingArena) -> Result<(), BenchmarkError> {
        if self.retired_submissions < self.submissions || self.recorder.is_open() {
            return Err(BenchmarkError::Protocol(
                "staging buffers released before their upload completed".to_string(),
            ));
        }
        debug!(
            "Releasing {} staging buffers ({} bytes)",
            staging.len(),
            staging.bytes()
        );
        for id in staging.buffers {
            self.destroy_buffer(id);
        }
        Ok(())
    }

    /// Record, submit and fully await one build session
    pub fn build_session<R>(
        &mut self,
        build: impl FnOnce(&mut Self, &mut StagingArena) -> Result<R, BenchmarkError>,
    ) -> Result<R, BenchmarkError> {
        self.reset()?;
        let mut staging = StagingArena::default();
        let built = build(self, &mut staging)?;
        self.submit()?;
        self.signal_and_wait()?;
        self.release(staging)?;
        Ok(built)
    }

    /// Read a readback buffer left in host-read state by a retired submission
    pub fn read_back(&mut self, id: BufferId) -> Result<Vec<u8>, BenchmarkError> {
        if self.recorder.is_open() || self.retired_submissions < self.submissions {
            return Err(BenchmarkError::Protocol(
                "reading back while GPU work is still outstanding".to_string(),
            ));
        }
        let buffer = self.recorder.buffer(id)?;
        if buffer.role != BufferRole::Readback {
            return Err(BenchmarkError::ResourceState(format!(
                "'{}' is a {} buffer and is not host readable",
                buffer.label,
                buffer.role.name()
            )));
        }
        self.recorder
            .require_state(id, crate::driver::AccessState::HostRead, "host read")?;
        let size = buffer.size;
        self.driver.read_buffer(id, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::AccessState;
    use crate::sim::SimulatedDriver;

    #[test]
    fn fence_starts_at_zero_and_advances_by_one() {
        let mut ctx = DeviceContext::initialize(SimulatedDriver::new());
        assert_eq!(ctx.fence_value(), 0);
        for expected in 1..=3 {
            ctx.reset().unwrap();
            ctx.submit().unwrap();
            assert_eq!(ctx.signal_and_wait().unwrap(), expected);
            assert!(ctx.driver().completed_value() >= expected);
        }
    }

    #[test]
    fn submit_closes_recorder() {
        let mut ctx = DeviceContext::initialize(SimulatedDriver::new());
        assert!(ctx.recorder().is_err());
        ctx.reset().unwrap();
        assert!(ctx.reset().is_err());
        ctx.submit().unwrap();
        assert!(ctx.recorder().is_err());
        assert!(ctx.submit().is_err());
    }

    #[test]
    fn upload_lands_in_device_buffer() {
        let mut ctx = DeviceContext::initialize(SimulatedDriver::new());
        let data: Vec<u8> = (0..16).collect();

        let (device, readback) = ctx
            .build_session(|ctx, staging| {
                let device = ctx.create_buffer(&BufferDesc::storage("input", 16))?;
                let readback = ctx.create_buffer(&BufferDesc::readback("readback", 16))?;
                ctx.upload(staging, device, &data)?;
                assert_eq!(staging.len(), 1);

                let rec = ctx.recorder()?;
                rec.transition(device, AccessState::CopySource)?;
                rec.copy_buffer(device, readback, 16)?;
                rec.transition(readback, AccessState::HostRead)?;
                Ok((device, readback))
            })
            .unwrap();

        assert_eq!(ctx.tracker().state(device).unwrap(), AccessState::CopySource);
        assert_eq!(ctx.read_back(readback).unwrap(), data);
    }

    #[test]
    fn read_back_rejects_outstanding_work() {
        let mut ctx = DeviceContext::initialize(SimulatedDriver::new());
        let readback = ctx
            .create_buffer(&BufferDesc::readback("readback", 8))
            .unwrap();
        ctx.reset().unwrap();
        ctx.recorder()
            .unwrap()
            .transition(readback, AccessState::HostRead)
            .unwrap();
        assert!(matches!(
            ctx.read_back(readback),
            Err(BenchmarkError::Protocol(_))
        ));
        ctx.submit().unwrap();
        assert!(ctx.read_back(readback).is_err());
        ctx.signal_and_wait().unwrap();
        assert_eq!(ctx.read_back(readback).unwrap(), vec![0u8; 8]);
    }
}
