// ============================================================================
// SECTION 9: PIPELINE STATISTICS
// ============================================================================
// Lock-free counters per input and per output, registered in a shared
// registry. The `internal` input reads them back as metrics and `Agent::run`
// returns a final snapshot.
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, BufferStatsSnapshot};
use crate::metric::Timestamp;

fn update_max(cell: &AtomicU64, value: u64) {
    let mut max = cell.load(AtomicOrdering::Relaxed);
    while value > max {
        match cell.compare_exchange_weak(max, value, AtomicOrdering::Relaxed, AtomicOrdering::Relaxed)
        {
            Ok(_) => break,
            Err(m) => max = m,
        }
    }
}

// ----------------------------------------------------------------------------
// 9.1 Input Statistics
// ----------------------------------------------------------------------------

/// Scheduler state of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Running,
    /// Still gathering past its timeout
    Overrun,
}

impl CycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CycleState::Running,
            2 => CycleState::Overrun,
            _ => CycleState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CycleState::Idle => 0,
            CycleState::Running => 1,
            CycleState::Overrun => 2,
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleState::Idle => write!(f, "idle"),
            CycleState::Running => write!(f, "running"),
            CycleState::Overrun => write!(f, "overrun"),
        }
    }
}

/// Counters of one input, updated by its scheduler task.
#[derive(Debug)]
pub struct InputStats {
    name: CompactString,
    plugin: CompactString,
    cycles: AtomicU64,
    errors: AtomicU64,
    overruns: AtomicU64,
    skipped: AtomicU64,
    metrics_gathered: AtomicU64,
    last_gather_us: AtomicU64,
    max_gather_us: AtomicU64,
    last_run: AtomicI64,
    state: AtomicU8,
}

impl InputStats {
    pub fn new(name: impl Into<CompactString>, plugin: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            plugin: plugin.into(),
            cycles: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            metrics_gathered: AtomicU64::new(0),
            last_gather_us: AtomicU64::new(0),
            max_gather_us: AtomicU64::new(0),
            last_run: AtomicI64::new(0),
            state: AtomicU8::new(CycleState::Idle.as_u8()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CycleState {
        CycleState::from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CycleState) {
        self.state.store(state.as_u8(), AtomicOrdering::Release);
    }

    pub(crate) fn record_start(&self, at: Timestamp) {
        self.last_run.store(at.as_nanos(), AtomicOrdering::Relaxed);
        self.set_state(CycleState::Running);
    }

    pub(crate) fn record_cycle(&self, duration: Duration, metrics: u64, errors: u64) {
        let us = duration.as_micros() as u64;
        self.cycles.fetch_add(1, AtomicOrdering::Relaxed);
        self.metrics_gathered.fetch_add(metrics, AtomicOrdering::Relaxed);
        self.errors.fetch_add(errors, AtomicOrdering::Relaxed);
        self.last_gather_us.store(us, AtomicOrdering::Relaxed);
        update_max(&self.max_gather_us, us);
        self.set_state(CycleState::Idle);
    }

    pub(crate) fn record_overrun(&self) {
        self.overruns.fetch_add(1, AtomicOrdering::Relaxed);
        self.set_state(CycleState::Overrun);
    }

    pub(crate) fn record_skip(&self) {
        self.skipped.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> InputStatsSnapshot {
        let last_run = self.last_run.load(AtomicOrdering::Relaxed);
        InputStatsSnapshot {
            name: self.name.to_string(),
            plugin: self.plugin.to_string(),
            cycles: self.cycles.load(AtomicOrdering::Relaxed),
            errors: self.errors.load(AtomicOrdering::Relaxed),
            overruns: self.overruns.load(AtomicOrdering::Relaxed),
            skipped_ticks: self.skipped.load(AtomicOrdering::Relaxed),
            metrics_gathered: self.metrics_gathered.load(AtomicOrdering::Relaxed),
            last_gather_us: self.last_gather_us.load(AtomicOrdering::Relaxed),
            max_gather_us: self.max_gather_us.load(AtomicOrdering::Relaxed),
            last_run: (last_run != 0).then(|| Timestamp::from_nanos(last_run)),
            state: self.state(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputStatsSnapshot {
    pub name: String,
    pub plugin: String,
    pub cycles: u64,
    pub errors: u64,
    pub overruns: u64,
    pub skipped_ticks: u64,
    pub metrics_gathered: u64,
    pub last_gather_us: u64,
    pub max_gather_us: u64,
    pub last_run: Option<Timestamp>,
    pub state: CycleState,
}

// ----------------------------------------------------------------------------
// 9.2 Output Statistics
// ----------------------------------------------------------------------------

/// Counters of one output. Buffer counters are read from the buffer itself.
#[derive(Debug)]
pub struct OutputStats {
    name: CompactString,
    plugin: CompactString,
    buffer: Arc<dyn Buffer>,
    writes: AtomicU64,
    write_errors: AtomicU64,
    serialize_errors: AtomicU64,
    metrics_written: AtomicU64,
    bytes_written: AtomicU64,
    last_write_us: AtomicU64,
}

impl OutputStats {
    pub fn new(
        name: impl Into<CompactString>,
        plugin: impl Into<CompactString>,
        buffer: Arc<dyn Buffer>,
    ) -> Self {
        Self {
            name: name.into(),
            plugin: plugin.into(),
            buffer,
            writes: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            serialize_errors: AtomicU64::new(0),
            metrics_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            last_write_us: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn record_write(&self, metrics: usize, bytes: usize, duration: Duration) {
        self.writes.fetch_add(1, AtomicOrdering::Relaxed);
        self.metrics_written.fetch_add(metrics as u64, AtomicOrdering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, AtomicOrdering::Relaxed);
        self.last_write_us
            .store(duration.as_micros() as u64, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_write_error(&self, duration: Duration) {
        self.write_errors.fetch_add(1, AtomicOrdering::Relaxed);
        self.last_write_us
            .store(duration.as_micros() as u64, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_serialize_error(&self) {
        self.serialize_errors.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> OutputStatsSnapshot {
        let buffer = self.buffer.stats();
        OutputStatsSnapshot {
            name: self.name.to_string(),
            plugin: self.plugin.to_string(),
            metrics_added: buffer.accepted,
            metrics_written: self.metrics_written.load(AtomicOrdering::Relaxed),
            metrics_dropped: buffer.dropped + buffer.rejected,
            writes: self.writes.load(AtomicOrdering::Relaxed),
            write_errors: self.write_errors.load(AtomicOrdering::Relaxed),
            serialize_errors: self.serialize_errors.load(AtomicOrdering::Relaxed),
            bytes_written: self.bytes_written.load(AtomicOrdering::Relaxed),
            last_write_us: self.last_write_us.load(AtomicOrdering::Relaxed),
            buffer_size: self.buffer.len(),
            buffer_limit: self.buffer.capacity(),
            buffer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputStatsSnapshot {
    pub name: String,
    pub plugin: String,
    pub metrics_added: u64,
    pub metrics_written: u64,
    /// Overflow drops plus metrics dropped after failed delivery
    pub metrics_dropped: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub serialize_errors: u64,
    pub bytes_written: u64,
    pub last_write_us: u64,
    pub buffer_size: usize,
    pub buffer_limit: usize,
    pub buffer: BufferStatsSnapshot,
}

// ----------------------------------------------------------------------------
// 9.3 Registry
// ----------------------------------------------------------------------------

/// Shared registry of every running plugin's counters.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    inputs: DashMap<String, Arc<InputStats>>,
    outputs: DashMap<String, Arc<OutputStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_input(&self, name: &str, plugin: &str) -> Arc<InputStats> {
        let stats = Arc::new(InputStats::new(name, plugin));
        self.inputs.insert(name.to_string(), Arc::clone(&stats));
        stats
    }

    pub fn register_output(
        &self,
        name: &str,
        plugin: &str,
        buffer: Arc<dyn Buffer>,
    ) -> Arc<OutputStats> {
        let stats = Arc::new(OutputStats::new(name, plugin, buffer));
        self.outputs.insert(name.to_string(), Arc::clone(&stats));
        stats
    }

    pub fn input(&self, name: &str) -> Option<Arc<InputStats>> {
        self.inputs.get(name).map(|s| Arc::clone(s.value()))
    }

    pub fn output(&self, name: &str) -> Option<Arc<OutputStats>> {
        self.outputs.get(name).map(|s| Arc::clone(s.value()))
    }

    /// Snapshots ordered by name
    pub fn input_snapshots(&self) -> Vec<InputStatsSnapshot> {
        let mut out: Vec<_> = self.inputs.iter().map(|e| e.value().snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Snapshots ordered by name
    pub fn output_snapshots(&self) -> Vec<OutputStatsSnapshot> {
        let mut out: Vec<_> = self.outputs.iter().map(|e| e.value().snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{MemoryBuffer, OverflowPolicy};
    use crate::metric::Metric;

    #[test]
    fn test_input_cycle_accounting() {
        let registry = StatsRegistry::new();
        let stats = registry.register_input("cpu", "internal");

        stats.record_start(Timestamp::from_secs(1));
        assert_eq!(stats.state(), CycleState::Running);
        stats.record_overrun();
        assert_eq!(stats.state(), CycleState::Overrun);
        stats.record_cycle(Duration::from_millis(3), 10, 1);
        stats.record_skip();

        let snap = registry.input("cpu").unwrap().snapshot();
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.metrics_gathered, 10);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.overruns, 1);
        assert_eq!(snap.skipped_ticks, 1);
        assert_eq!(snap.last_gather_us, 3000);
        assert_eq!(snap.state, CycleState::Idle);
        assert_eq!(snap.last_run, Some(Timestamp::from_secs(1)));
    }

    #[test]
    fn test_output_snapshot_reads_buffer() {
        let registry = StatsRegistry::new();
        let buffer: Arc<dyn Buffer> = Arc::new(MemoryBuffer::new("out", 1, OverflowPolicy::DropOldest));
        let stats = registry.register_output("out", "discard", Arc::clone(&buffer));

        buffer.accept(Metric::new("a", Timestamp::EPOCH).with_field("v", 1i64));
        buffer.accept(Metric::new("b", Timestamp::EPOCH).with_field("v", 1i64));
        stats.record_write(1, 12, Duration::from_micros(5));

        let snaps = registry.output_snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].metrics_added, 2);
        assert_eq!(snaps[0].metrics_dropped, 1);
        assert_eq!(snaps[0].metrics_written, 1);
        assert_eq!(snaps[0].buffer_size, 1);
        assert_eq!(snaps[0].buffer_limit, 1);
    }
}
