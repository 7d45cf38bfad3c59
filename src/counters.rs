//! Optional hardware counter sessions
//!
//! Independent of the timestamp bracket: a profiler brackets passes with
//! counter samples recorded into the command stream, and reports the
//! difference between the end and begin sample of each pass. Devices that
//! expose no counters leave the profiler unavailable and the benchmark
//! carries on without it.

use crate::context::DeviceContext;
use crate::driver::{CounterSnapshot, Driver};
use crate::recorder::CommandRecorder;
use crate::BenchmarkError;
use log::{debug, warn};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CounterError {
    #[error("Counter backend is not available on this device")]
    Unavailable,

    #[error("Unknown counter '{0}'")]
    UnknownCounter(String),

    #[error("Counter '{0}' was not enabled for this session")]
    NotEnabled(String),

    #[error("{op} called while {state}")]
    OutOfOrder {
        op: &'static str,
        state: &'static str,
    },

    #[error("No pass with sample id {0}")]
    UnknownSample(u32),

    #[error("Sample {0} has not been produced by the device yet")]
    NotReady(u32),
}

/// Handle to one profiled pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleId(pub u32);

impl SampleId {
    fn begin_slot(&self) -> u32 {
        self.0 * 2
    }

    fn end_slot(&self) -> u32 {
        self.0 * 2 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProfilerState {
    Unavailable,
    Ready,
    SessionCreated,
    SessionActive,
    InPass(SampleId),
    SessionEnded,
}

impl ProfilerState {
    fn describe(&self) -> &'static str {
        match self {
            ProfilerState::Unavailable => "unavailable",
            ProfilerState::Ready => "no session exists",
            ProfilerState::SessionCreated => "the session is not started",
            ProfilerState::SessionActive => "no pass is open",
            ProfilerState::InPass(_) => "a pass is open",
            ProfilerState::SessionEnded => "the session has ended",
        }
    }
}

pub struct CounterProfiler {
    supported: Vec<String>,
    enabled: Vec<String>,
    passes: u32,
    state: ProfilerState,
}

impl Default for CounterProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterProfiler {
    pub fn new() -> Self {
        Self {
            supported: Vec::new(),
            enabled: Vec::new(),
            passes: 0,
            state: ProfilerState::Unavailable,
        }
    }

    /// Query the device for counters. Returns false when it exposes no counters.
    pub fn initialize<D: Driver>(&mut self, ctx: &DeviceContext<D>) -> bool {
        self.supported = ctx.driver().supported_counters();
        if self.supported.is_empty() {
            warn!(
                "{} exposes no hardware counters; continuing without them",
                ctx.device_name()
            );
            self.state = ProfilerState::Unavailable;
            return false;
        }
        debug!("Hardware counters available: {}", self.supported.join(", "));
        self.state = ProfilerState::Ready;
        true
    }

    pub fn is_available(&self) -> bool {
        self.state != ProfilerState::Unavailable
    }

    pub fn supported(&self) -> &[String] {
        &self.supported
    }

    pub fn enabled(&self) -> &[String] {
        &self.enabled
    }

    pub fn create_session(&mut self) -> Result<(), CounterError> {
        self.transition("create_session", ProfilerState::Ready, ProfilerState::SessionCreated)?;
        self.enabled.clear();
        self.passes = 0;
        Ok(())
    }

    pub fn enable_counter(&mut self, name: &str) -> Result<(), CounterError> {
        self.require("enable_counter", ProfilerState::SessionCreated)?;
        if !self.supported.iter().any(|s| s == name) {
            return Err(CounterError::UnknownCounter(name.to_string()));
        }
        if !self.enabled.iter().any(|s| s == name) {
            self.enabled.push(name.to_string());
        }
        Ok(())
    }

    pub fn begin_session(&mut self) -> Result<(), CounterError> {
        self.transition(
            "begin_session",
            ProfilerState::SessionCreated,
            ProfilerState::SessionActive,
        )
    }

    /// Record the begin sample of a new pass
    pub fn begin_pass(&mut self, rec: &mut CommandRecorder) -> Result<SampleId, BenchmarkError> {
        self.require("begin_pass", ProfilerState::SessionActive)?;
        let sample = SampleId(self.passes);
        rec.sample_counters(sample.begin_slot())?;
        self.passes += 1;
        self.state = ProfilerState::InPass(sample);
        Ok(sample)
    }

    /// Record the end sample of the open pass
    pub fn end_pass(&mut self, rec: &mut CommandRecorder) -> Result<(), BenchmarkError> {
        let ProfilerState::InPass(sample) = self.state else {
            return Err(self.out_of_order("end_pass").into());
        };
        rec.sample_counters(sample.end_slot())?;
        self.state = ProfilerState::SessionActive;
        Ok(())
    }

    pub fn end_session(&mut self) -> Result<(), CounterError> {
        self.transition("end_session", ProfilerState::SessionActive, ProfilerState::SessionEnded)
    }

    /// Counter delta over one pass. The submission holding the pass must
    /// have completed.
    pub fn sample_result<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        sample: SampleId,
        counter: &str,
    ) -> Result<f64, BenchmarkError> {
        self.require("sample_result", ProfilerState::SessionEnded)?;
        if !self.enabled.iter().any(|s| s == counter) {
            return Err(CounterError::NotEnabled(counter.to_string()).into());
        }
        let (begin, end) = self.snapshots(ctx, sample)?;
        Ok(delta(&begin, &end, counter))
    }

    /// Deltas of every enabled counter over one pass
    pub fn sample_results<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        sample: SampleId,
    ) -> Result<BTreeMap<String, f64>, BenchmarkError> {
        self.require("sample_results", ProfilerState::SessionEnded)?;
        let (begin, end) = self.snapshots(ctx, sample)?;
        Ok(self
            .enabled
            .iter()
            .map(|name| (name.clone(), delta(&begin, &end, name)))
            .collect())
    }

    fn snapshots<D: Driver>(
        &self,
        ctx: &mut DeviceContext<D>,
        sample: SampleId,
    ) -> Result<(CounterSnapshot, CounterSnapshot), CounterError> {
        if sample.0 >= self.passes {
            return Err(CounterError::UnknownSample(sample.0));
        }
        let driver = ctx.driver_mut();
        let begin = driver
            .counter_sample(sample.begin_slot())
            .ok_or(CounterError::NotReady(sample.0))?;
        let end = driver
            .counter_sample(sample.end_slot())
            .ok_or(CounterError::NotReady(sample.0))?;
        Ok((begin, end))
    }

    fn require(&self, op: &'static str, expected: ProfilerState) -> Result<(), CounterError> {
        if self.state != expected {
            return Err(self.out_of_order(op));
        }
        Ok(())
    }

    fn transition(
        &mut self,
        op: &'static str,
        from: ProfilerState,
        to: ProfilerState,
    ) -> Result<(), CounterError> {
        self.require(op, from)?;
        self.state = to;
        Ok(())
    }

    fn out_of_order(&self, op: &'static str) -> CounterError {
        if self.state == ProfilerState::Unavailable {
            return CounterError::Unavailable;
        }
        CounterError::OutOfOrder {
            op,
            state: self.state.describe(),
        }
    }
}

fn delta(begin: &CounterSnapshot, end: &CounterSnapshot, counter: &str) -> f64 {
    let value = |s: &CounterSnapshot| s.get(counter).copied().unwrap_or(0.0);
    value(end) - value(begin)
}
