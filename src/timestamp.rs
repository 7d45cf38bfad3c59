//! Two-slot GPU timestamp bracket

use crate::context::DeviceContext;
use crate::driver::{AccessState, BufferDesc, BufferId, Driver, QuerySetId};
use crate::BenchmarkError;
use serde::{Deserialize, Serialize};

const START_SLOT: u32 = 0;
const END_SLOT: u32 = 1;
const SLOT_COUNT: u32 = 2;
const READBACK_SIZE: u64 = SLOT_COUNT as u64 * std::mem::size_of::<u64>() as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BracketState {
    Idle,
    Started,
    Ended,
    Resolved { submission: u64 },
}

/// Why a resolved interval cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingAnomaly {
    /// Both slots hold the same tick
    ZeroLength,
    /// End tick precedes start tick (heap reuse or mixed clock domains)
    Reversed,
}

impl TimingAnomaly {
    pub fn describe(&self) -> &'static str {
        match self {
            TimingAnomaly::ZeroLength => "end timestamp equals start timestamp",
            TimingAnomaly::Reversed => "end timestamp precedes start timestamp",
        }
    }
}

impl std::fmt::Display for TimingAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Raw start/end ticks of one resolved bracket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampInterval {
    pub start_ticks: u64,
    pub end_ticks: u64,
    pub tick_frequency: f64,
}

impl TimestampInterval {
    pub fn anomaly(&self) -> Option<TimingAnomaly> {
        match self.end_ticks.cmp(&self.start_ticks) {
            std::cmp::Ordering::Greater => None,
            std::cmp::Ordering::Equal => Some(TimingAnomaly::ZeroLength),
            std::cmp::Ordering::Less => Some(TimingAnomaly::Reversed),
        }
    }

    /// Elapsed device time in seconds, or the anomaly that prevents it
    pub fn seconds(&self) -> Result<f64, TimingAnomaly> {
        match self.anomaly() {
            Some(anomaly) => Err(anomaly),
            None => Ok((self.end_ticks - self.start_ticks) as f64 / self.tick_frequency),
        }
    }
}

/// Query object with a start and an end slot plus the host-visible buffer
/// they resolve into. Only work recorded between [`mark_start`] and
/// [`mark_end`] is measured.
///
/// [`mark_start`]: TimestampQuery::mark_start
/// [`mark_end`]: TimestampQuery::mark_end
pub struct TimestampQuery {
    query_set: QuerySetId,
    readback: BufferId,
    tick_frequency: f64,
    state: BracketState,
}

impl TimestampQuery {
    pub fn new<D: Driver>(ctx: &mut DeviceContext<D>) -> Result<Self, BenchmarkError> {
        let query_set = ctx.create_query_set(SLOT_COUNT)?;
        let readback =
            ctx.create_buffer(&BufferDesc::readback("Timestamp Readback", READBACK_SIZE))?;
        let tick_frequency = ctx.timestamp_frequency();
        if !(tick_frequency.is_finite() && tick_frequency > 0.0) {
            return Err(BenchmarkError::Execution(format!(
                "device reported timestamp frequency {}",
                tick_frequency
            )));
        }

        Ok(Self {
            query_set,
            readback,
            tick_frequency,
            state: BracketState::Idle,
        })
    }

    pub fn mark_start<D: Driver>(
        &mut self,
        ctx: &mut DeviceContext<D>,
    ) -> Result<(), BenchmarkError> {
        self.expect(BracketState::Idle, "mark_start")?;
        ctx.recorder()?.write_timestamp(self.query_set, START_SLOT)?;
        self.state = BracketState::Started;
        Ok(())
    }

    pub fn mark_end<D: Driver>(
        &mut self,
        ctx: &mut DeviceContext<D>,
    ) -> Result<(), BenchmarkError> {
        self.expect(BracketState::Started, "mark_end")?;
        ctx.recorder()?.write_timestamp(self.query_set, END_SLOT)?;
        self.state = BracketState::Ended;
        Ok(())
    }

    /// Record the copy of both slots into the readback buffer
    pub fn resolve<D: Driver>(&mut self, ctx: &mut DeviceContext<D>) -> Result<(), BenchmarkError> {
        self.expect(BracketState::Ended, "resolve")?;
        let submission = ctx.pending_submission();
        let rec = ctx.recorder()?;
        rec.transition(self.readback, AccessState::CopyDest)?;
        rec.resolve_queries(self.query_set, START_SLOT..SLOT_COUNT, self.readback)?;
        rec.transition(self.readback, AccessState::HostRead)?;
        self.state = BracketState::Resolved { submission };
        Ok(())
    }

    /// Read both ticks once the submission holding `resolve` has retired.
    ///
    /// Re-arms the bracket so the query can be reused.
    pub fn read_duration<D: Driver>(
        &mut self,
        ctx: &mut DeviceContext<D>,
    ) -> Result<TimestampInterval, BenchmarkError> {
        let submission = match self.state {
            BracketState::Resolved { submission } => submission,
            other => {
                return Err(BenchmarkError::Protocol(format!(
                    "read_duration called in {:?} state",
                    other
                )))
            }
        };
        if !ctx.is_retired(submission) {
            return Err(BenchmarkError::Protocol(
                "timestamps read before their submission completed".to_string(),
            ));
        }

        let bytes = ctx.read_back(self.readback)?;
        if bytes.len() < READBACK_SIZE as usize {
            return Err(BenchmarkError::Execution(format!(
                "timestamp readback returned {} bytes",
                bytes.len()
            )));
        }
        let start_ticks = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
        let end_ticks = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default());

        self.state = BracketState::Idle;
        Ok(TimestampInterval {
            start_ticks,
            end_ticks,
            tick_frequency: self.tick_frequency,
        })
    }

    fn expect(&self, expected: BracketState, op: &str) -> Result<(), BenchmarkError> {
        if self.state != expected {
            return Err(BenchmarkError::Protocol(format!(
                "{} called in {:?} state, expected {:?}",
                op, self.state, expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimOptions, SimulatedDriver};

    #[test]
    fn interval_converts_ticks_to_seconds() {
        let interval = TimestampInterval {
            start_ticks: 1_000,
            end_ticks: 3_000,
            tick_frequency: 1e9,
        };
        assert!((interval.seconds().unwrap() - 2e-6).abs() < 1e-15);
        assert_eq!(interval.anomaly(), None);
    }

    #[test]
    fn reversed_or_equal_ticks_are_anomalies() {
        let reversed = TimestampInterval {
            start_ticks: 10,
            end_ticks: 5,
            tick_frequency: 1e9,
        };
        assert_eq!(reversed.seconds(), Err(TimingAnomaly::Reversed));

        let flat = TimestampInterval {
            end_ticks: 10,
            ..reversed
        };
        assert_eq!(flat.seconds(), Err(TimingAnomaly::ZeroLength));
    }

    #[test]
    fn unusable_tick_frequency_is_rejected() {
        for frequency in [0.0, -1.0, f64::INFINITY, f64::NAN] {
            let driver =
                SimulatedDriver::with_options(SimOptions::default().with_tick_frequency(frequency));
            let mut ctx = DeviceContext::initialize(driver);
            assert!(
                matches!(TimestampQuery::new(&mut ctx), Err(BenchmarkError::Execution(_))),
                "accepted frequency {}",
                frequency
            );
        }

        let driver = SimulatedDriver::with_options(SimOptions::default().with_tick_frequency(1e6));
        let mut ctx = DeviceContext::initialize(driver);
        let mut ts = TimestampQuery::new(&mut ctx).unwrap();
        ctx.reset().unwrap();
        ts.mark_start(&mut ctx).unwrap();
        ts.mark_end(&mut ctx).unwrap();
        ts.resolve(&mut ctx).unwrap();
        ctx.submit().unwrap();
        ctx.signal_and_wait().unwrap();
        assert_eq!(ts.read_duration(&mut ctx).unwrap().tick_frequency, 1e6);
    }

    #[test]
    fn bracket_calls_must_be_ordered() {
        let mut ctx = DeviceContext::initialize(SimulatedDriver::new());
        let mut ts = TimestampQuery::new(&mut ctx).unwrap();
        ctx.reset().unwrap();
        assert!(ts.mark_end(&mut ctx).is_err());
        assert!(ts.resolve(&mut ctx).is_err());
        ts.mark_start(&mut ctx).unwrap();
        assert!(ts.mark_start(&mut ctx).is_err());
        ts.mark_end(&mut ctx).unwrap();
        ts.resolve(&mut ctx).unwrap();
        assert!(ts.read_duration(&mut ctx).is_err());
    }

    #[test]
    fn empty_bracket_resolves_after_wait() {
        let mut ctx = DeviceContext::initialize(SimulatedDriver::new());
        let mut ts = TimestampQuery::new(&mut ctx).unwrap();
        ctx.reset().unwrap();
        ts.mark_start(&mut ctx).unwrap();
        ts.mark_end(&mut ctx).unwrap();
        ts.resolve(&mut ctx).unwrap();
        ctx.submit().unwrap();
        assert!(ts.read_duration(&mut ctx).is_err());
        ctx.signal_and_wait().unwrap();

        let interval = ts.read_duration(&mut ctx).unwrap();
        assert!(interval.end_ticks >= interval.start_ticks);
        assert_eq!(interval.tick_frequency, 1e9);
    }
}
