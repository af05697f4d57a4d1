// ============================================================================
// SECTION 14: COLLECTION SCHEDULER
// ============================================================================
// One task per input. Each tick starts at most one collection cycle:
//
//   Idle ──tick──▶ Running ──done──▶ Idle
//                     │
//                  timeout
//                     ▼
//                  Overrun ──done──▶ Idle
//
// Ticks that land while a cycle is still executing are skipped, never
// stacked. An overrun gather is not cancelled; it finishes in the
// background while the timer keeps running.
// ============================================================================

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::accumulator::{Accumulator, CycleReport, MetricDefaults, MetricSink};
use crate::backoff::random_jitter;
use crate::config::{AgentSettings, InputConfig};
use crate::error::InputError;
use crate::metric::Timestamp;
use crate::plugin::Input;
use crate::stats::InputStats;

// ----------------------------------------------------------------------------
// 14.1 Schedule
// ----------------------------------------------------------------------------

/// Effective timing of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSchedule {
    pub interval: Duration,
    pub jitter: Duration,
    /// Gather time after which the cycle counts as overrun
    pub timeout: Duration,
    /// Align ticks to multiples of `interval` on the wall clock
    pub round_interval: bool,
}

impl InputSchedule {
    pub fn resolve(config: &InputConfig, agent: &AgentSettings) -> Self {
        Self {
            interval: config.effective_interval(agent),
            jitter: config.effective_jitter(agent),
            timeout: config.effective_timeout(agent),
            round_interval: agent.round_interval,
        }
    }

    /// Delay until the first tick.
    fn first_delay(&self) -> Duration {
        if !self.round_interval {
            return self.interval;
        }
        let period = self.interval.as_nanos().min(i64::MAX as u128) as i64;
        if period == 0 {
            return self.interval;
        }
        let rem = Timestamp::now().as_nanos().rem_euclid(period);
        Duration::from_nanos((period - rem) as u64)
    }
}

// ----------------------------------------------------------------------------
// 14.2 Running Input
// ----------------------------------------------------------------------------

pub struct RunningInput {
    name: CompactString,
    input: Arc<dyn Input>,
    defaults: Arc<MetricDefaults>,
    sink: Arc<dyn MetricSink>,
    schedule: InputSchedule,
    stats: Arc<InputStats>,
}

impl RunningInput {
    pub fn new(
        name: impl Into<CompactString>,
        input: Arc<dyn Input>,
        defaults: MetricDefaults,
        sink: Arc<dyn MetricSink>,
        schedule: InputSchedule,
        stats: Arc<InputStats>,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            defaults: Arc::new(defaults),
            sink,
            schedule,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &InputSchedule {
        &self.schedule
    }

    pub fn stats(&self) -> &Arc<InputStats> {
        &self.stats
    }

    /// Run one collection cycle to completion, however long it takes.
    ///
    /// The gather runs in its own task so a panic is contained and reported
    /// as a collection error. Past `timeout` one warning is logged and the
    /// cycle is marked overrun.
    pub async fn gather_once(&self) -> CycleReport {
        self.stats.record_start(Timestamp::now());
        let started = Instant::now();

        let acc = Arc::new(Accumulator::new(
            self.name.clone(),
            Arc::clone(&self.defaults),
            Arc::clone(&self.sink),
        ));
        let mut gather = {
            let input = Arc::clone(&self.input);
            let acc = Arc::clone(&acc);
            tokio::spawn(async move { input.gather(&acc).await })
        };

        let joined = match timeout(self.schedule.timeout, &mut gather).await {
            Ok(joined) => joined,
            Err(_) => {
                self.stats.record_overrun();
                let overrun = InputError::timeout(self.name.as_str(), self.schedule.timeout.as_millis() as u64);
                warn!(
                    target: "conduit::scheduler",
                    input = %self.name,
                    error = %overrun,
                    "Collection took longer than expected"
                );
                acc.add_error(overrun);
                gather.await
            }
        };

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => acc.add_error(e),
            Err(e) if e.is_panic() => acc.add_error(InputError::Panicked {
                name: self.name.to_string(),
                message: panic_message(e.into_panic()),
            }),
            Err(e) => acc.add_error(InputError::collection_failed(self.name.as_str(), e.to_string())),
        }

        let report = acc.finish();
        let elapsed = started.elapsed();
        // the overrun was already logged when the timeout fired
        for err in report.errors.iter().filter(|e| !matches!(e, InputError::Timeout { .. })) {
            warn!(target: "conduit::scheduler", input = %self.name, error = %err, "Error in input");
        }
        self.stats
            .record_cycle(elapsed, report.metrics, report.errors.len() as u64);
        trace!(
            target: "conduit::scheduler",
            input = %self.name,
            metrics = report.metrics,
            elapsed_ms = elapsed.as_millis() as u64,
            "Collection cycle finished"
        );
        report
    }

    /// Tick loop of this input. On cancellation no further cycle starts; a
    /// cycle still executing is awaited for at most `drain_timeout`.
    pub async fn run(self: Arc<Self>, token: CancellationToken, drain_timeout: Duration) {
        let period = self.schedule.interval;
        let mut ticker = interval_at(Instant::now() + self.schedule.first_delay(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(
            target: "conduit::scheduler",
            input = %self.name,
            interval = %humantime::format_duration(period),
            "Input scheduled"
        );

        let mut cycle: Option<JoinHandle<CycleReport>> = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if cycle.as_ref().is_some_and(|h| !h.is_finished()) {
                self.stats.record_skip();
                debug!(
                    target: "conduit::scheduler",
                    input = %self.name,
                    state = %self.stats.state(),
                    "Previous collection still running, skipping tick"
                );
                continue;
            }

            let jitter = random_jitter(self.schedule.jitter);
            if !jitter.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(jitter) => {}
                }
            }

            let this = Arc::clone(&self);
            cycle = Some(tokio::spawn(async move { this.gather_once().await }));
        }

        if let Some(handle) = cycle.filter(|h| !h.is_finished()) {
            if timeout(drain_timeout, handle).await.is_err() {
                warn!(
                    target: "conduit::scheduler",
                    input = %self.name,
                    "Collection still running at shutdown, abandoning it"
                );
            }
        }
        debug!(target: "conduit::scheduler", input = %self.name, "Input stopped");
    }
}

impl fmt::Debug for RunningInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningInput")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ----------------------------------------------------------------------------
// 14.3 Scheduler
// ----------------------------------------------------------------------------

/// Drives every input concurrently; each input's cycles stay serialized.
#[derive(Debug)]
pub struct Scheduler {
    inputs: Vec<Arc<RunningInput>>,
    drain_timeout: Duration,
}

impl Scheduler {
    pub fn new(inputs: Vec<Arc<RunningInput>>, drain_timeout: Duration) -> Self {
        Self { inputs, drain_timeout }
    }

    pub fn inputs(&self) -> &[Arc<RunningInput>] {
        &self.inputs
    }

    /// Returns once every input loop has stopped after `token` fires.
    pub async fn run(self, token: CancellationToken) {
        info!(target: "conduit::scheduler", inputs = self.inputs.len(), "Starting collection");

        let mut tasks = JoinSet::new();
        for input in &self.inputs {
            tasks.spawn(Arc::clone(input).run(token.clone(), self.drain_timeout));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(target: "conduit::scheduler", error = %e, "Input task failed");
            }
        }

        info!(target: "conduit::scheduler", "Collection stopped");
    }
}
