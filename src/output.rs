// ============================================================================
// SECTION 12: OUTPUT DELIVERY
// ============================================================================
// A `RunningOutput` owns one buffer and drives one output plugin:
//
//   trigger (interval | batch ready) → flush_batch → serialize → write
//       ok            → ack, reset backoff
//       retryable     → requeue at head, back off
//       non-retryable → drop
//
// At most one flush runs per output. The output sits behind an async mutex;
// a trigger that finds it locked is skipped, never queued.
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::{random_jitter, Backoff};
use crate::buffer::Buffer;
use crate::config::{AgentSettings, OutputConfig, RetryConfig};
use crate::error::OutputResult;
use crate::filter::MetricFilter;
use crate::logging::PerfTimer;
use crate::metric::Metric;
use crate::plugin::{Output, Serializer};
use crate::stats::{OutputStats, OutputStatsSnapshot};

// ----------------------------------------------------------------------------
// 12.1 Settings & Outcomes
// ----------------------------------------------------------------------------

/// Effective delivery knobs of one output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    pub metric_batch_size: usize,
    pub flush_interval: Duration,
    pub flush_jitter: Duration,
    pub retry: RetryConfig,
    /// Write attempts per batch during the final drain
    pub final_flush_retries: u32,
}

impl OutputSettings {
    pub fn resolve(config: &OutputConfig, agent: &AgentSettings) -> Self {
        Self {
            metric_batch_size: config.metric_batch_size.unwrap_or(agent.metric_batch_size),
            flush_interval: config.flush_interval.unwrap_or(agent.flush_interval),
            flush_jitter: config.flush_jitter.unwrap_or(agent.flush_jitter),
            retry: config.retry.clone(),
            final_flush_retries: agent.final_flush_retries.max(1),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self::resolve(&OutputConfig::new("default"), &AgentSettings::default())
    }
}

/// Result of one flush trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending
    Empty,
    /// Metrics delivered and acked
    Written(usize),
    /// Inside the backoff window; nothing attempted
    Deferred,
    /// Another flush holds the output
    Busy,
    /// Retryable failure; batch back at the head
    Requeued(usize),
    /// Serialization failure, non-retryable failure or retries exhausted
    Dropped(usize),
}

// ----------------------------------------------------------------------------
// 12.2 Running Output
// ----------------------------------------------------------------------------

pub struct RunningOutput {
    name: CompactString,
    settings: OutputSettings,
    filter: MetricFilter,
    buffer: Arc<dyn Buffer>,
    serializer: Arc<dyn Serializer>,
    output: AsyncMutex<Box<dyn Output>>,
    backoff: Mutex<Backoff>,
    batch_ready: Notify,
    stats: Arc<OutputStats>,
}

impl RunningOutput {
    pub fn new(
        name: impl Into<CompactString>,
        output: Box<dyn Output>,
        serializer: Arc<dyn Serializer>,
        buffer: Arc<dyn Buffer>,
        settings: OutputSettings,
        filter: MetricFilter,
        stats: Arc<OutputStats>,
    ) -> Self {
        Self {
            name: name.into(),
            backoff: Mutex::new(Backoff::from_config(&settings.retry)),
            settings,
            filter,
            buffer,
            serializer,
            output: AsyncMutex::new(output),
            batch_ready: Notify::new(),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &OutputSettings {
        &self.settings
    }

    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.buffer
    }

    pub fn stats(&self) -> OutputStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether this output takes the metric at all
    pub fn selects(&self, metric: &Metric) -> bool {
        self.filter.selects(metric)
    }

    /// Route one metric into the buffer. Never blocks.
    pub fn add_metric(&self, metric: Metric) {
        let Some(metric) = self.filter.apply(metric) else {
            return;
        };
        let dropped = self.buffer.accept(metric);
        if dropped > 0 {
            trace!(target: "conduit::output", output = %self.name, dropped, "Buffer overflow");
        }
        if self.buffer.len() >= self.settings.metric_batch_size {
            self.batch_ready.notify_one();
        }
    }

    pub async fn connect(&self) -> OutputResult<()> {
        let mut output = self.output.lock().await;
        output.connect().await
    }

    pub async fn close(&self) {
        let mut output = self.output.lock().await;
        if let Err(e) = output.close().await {
            warn!(target: "conduit::output", output = %self.name, error = %e, "Error closing output");
        }
    }

    // ------------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------------

    /// Send at most one batch.
    pub async fn flush_batch(&self) -> FlushOutcome {
        let Ok(mut output) = self.output.try_lock() else {
            return FlushOutcome::Busy;
        };
        if !self.backoff.lock().should_allow(Instant::now()) {
            return FlushOutcome::Deferred;
        }
        self.write_batch(&mut **output).await
    }

    /// Drain batch by batch until the buffer is empty or a write fails.
    ///
    /// Only metrics pending when the flush started are drained, so a steady
    /// producer cannot keep the flush going forever.
    pub async fn flush_all(&self) -> FlushOutcome {
        let Ok(mut output) = self.output.try_lock() else {
            return FlushOutcome::Busy;
        };
        if !self.backoff.lock().should_allow(Instant::now()) {
            return FlushOutcome::Deferred;
        }

        let budget = self.buffer.len();
        let mut written = 0;
        while written < budget {
            match self.write_batch(&mut **output).await {
                FlushOutcome::Written(n) => written += n,
                FlushOutcome::Empty => break,
                other if written == 0 => return other,
                _ => break,
            }
        }

        if written == 0 {
            FlushOutcome::Empty
        } else {
            FlushOutcome::Written(written)
        }
    }

    async fn write_batch(&self, output: &mut dyn Output) -> FlushOutcome {
        let batch = self.buffer.flush_batch(self.settings.metric_batch_size);
        if batch.is_empty() {
            self.buffer.ack(batch);
            return FlushOutcome::Empty;
        }
        let count = batch.len();

        let payload = match self.serializer.serialize_batch(batch.metrics()) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_serialize_error();
                let dropped = self.buffer.reject(batch, false);
                error!(
                    target: "conduit::output",
                    output = %self.name,
                    dropped,
                    error = %e,
                    "Could not serialize batch, dropping"
                );
                return FlushOutcome::Dropped(dropped);
            }
        };

        let timer = PerfTimer::with_threshold("output_write", self.settings.flush_interval);
        let result = output.write(&payload).await;
        let elapsed = timer.stop();

        match result {
            Ok(()) => {
                self.buffer.ack(batch);
                self.backoff.lock().record_success();
                self.stats.record_write(count, payload.len(), elapsed);
                debug!(
                    target: "conduit::output",
                    output = %self.name,
                    metrics = count,
                    bytes = payload.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Wrote batch"
                );
                FlushOutcome::Written(count)
            }
            Err(e) if e.is_retryable() => {
                self.stats.record_write_error(elapsed);
                let (delay, attempts) = {
                    let mut backoff = self.backoff.lock();
                    let delay = backoff.record_failure(Instant::now());
                    (delay, backoff.attempts())
                };

                if self.settings.retry.max_retries.is_some_and(|max| attempts > max) {
                    self.backoff.lock().reset_attempts();
                    let dropped = self.buffer.reject(batch, false);
                    warn!(
                        target: "conduit::output",
                        output = %self.name,
                        dropped,
                        attempts,
                        error = %e,
                        "Retries exhausted, dropping batch"
                    );
                    return FlushOutcome::Dropped(dropped);
                }

                let lost = self.buffer.reject(batch, true);
                warn!(
                    target: "conduit::output",
                    output = %self.name,
                    metrics = count,
                    attempts,
                    retry_in = %humantime::format_duration(delay),
                    error = %e,
                    "Write failed, will retry"
                );
                if lost > 0 {
                    warn!(target: "conduit::output", output = %self.name, dropped = lost, "Buffer full on requeue, dropped metrics");
                }
                FlushOutcome::Requeued(count)
            }
            Err(e) => {
                self.stats.record_write_error(elapsed);
                let dropped = self.buffer.reject(batch, false);
                error!(
                    target: "conduit::output",
                    output = %self.name,
                    dropped,
                    error = %e,
                    "Write failed permanently, dropping batch"
                );
                FlushOutcome::Dropped(dropped)
            }
        }
    }

    fn log_outcome(&self, trigger: &'static str, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Busy => {
                debug!(target: "conduit::output", output = %self.name, trigger, "Flush already running, skipping")
            }
            FlushOutcome::Deferred => {
                trace!(target: "conduit::output", output = %self.name, trigger, "In backoff window, skipping")
            }
            _ => trace!(target: "conduit::output", output = %self.name, trigger, ?outcome, "Flush finished"),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Flush loop: interval flushes (jittered) drain the buffer, batch-ready
    /// signals send a single batch. Returns when `token` is cancelled; an
    /// in-progress write always completes first.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let period = self.settings.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(
            target: "conduit::output",
            output = %self.name,
            flush_interval = %humantime::format_duration(period),
            batch_size = self.settings.metric_batch_size,
            "Flush loop started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let jitter = random_jitter(self.settings.flush_jitter);
                    if !jitter.is_zero() {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = sleep(jitter) => {}
                        }
                    }
                    let outcome = self.flush_all().await;
                    self.log_outcome("interval", outcome);
                }
                _ = self.batch_ready.notified() => {
                    let outcome = self.flush_batch().await;
                    self.log_outcome("batch", outcome);
                }
            }
            // Triggers raised while that flush ran are dropped.
            let _ = self.batch_ready.notified().now_or_never();
        }

        debug!(target: "conduit::output", output = %self.name, "Flush loop stopped");
    }

    /// Last drain at shutdown: ignores the backoff window, gives each batch
    /// a bounded number of attempts, stops at `deadline`. Returns the number
    /// of metrics written.
    pub async fn final_flush(&self, deadline: Instant) -> usize {
        let mut output = self.output.lock().await;
        let mut written = 0;
        let mut failures = 0;

        while !self.buffer.is_empty() {
            if Instant::now() >= deadline {
                warn!(target: "conduit::output", output = %self.name, "Shutdown deadline reached during final flush");
                break;
            }
            match self.write_batch(&mut **output).await {
                FlushOutcome::Written(n) => {
                    written += n;
                    failures = 0;
                }
                FlushOutcome::Requeued(_) => {
                    failures += 1;
                    if failures >= self.settings.final_flush_retries {
                        warn!(
                            target: "conduit::output",
                            output = %self.name,
                            attempts = failures,
                            "Giving up final flush"
                        );
                        break;
                    }
                    let wait = self
                        .backoff
                        .lock()
                        .remaining(Instant::now())
                        .min(deadline.saturating_duration_since(Instant::now()));
                    sleep(wait).await;
                }
                FlushOutcome::Dropped(_) => failures = 0,
                _ => break,
            }
        }

        written
    }

    /// Drop whatever is still pending, settling it as undelivered.
    pub fn discard_pending(&self) -> usize {
        let batch = self.buffer.flush_batch(usize::MAX);
        let dropped = self.buffer.reject(batch, false);
        if dropped > 0 {
            warn!(target: "conduit::output", output = %self.name, dropped, "Dropping undelivered metrics");
        }
        dropped
    }

    /// Connect, tolerating retryable failures.
    pub(crate) async fn start(&self) -> OutputResult<()> {
        match self.connect().await {
            Ok(()) => {
                info!(target: "conduit::output", output = %self.name, "Connected");
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    target: "conduit::output",
                    output = %self.name,
                    error = %e,
                    "Connect failed, continuing; writes will retry"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for RunningOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningOutput")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::{MemoryBuffer, OverflowPolicy};
    use crate::error::{OutputError, SerializeError, SerializeResult};
    use crate::metric::Timestamp;
    use crate::stats::StatsRegistry;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// One metric name per line.
    pub(crate) struct NameSerializer;

    impl Serializer for NameSerializer {
        fn serialize(&self, metric: &Metric) -> SerializeResult<Vec<u8>> {
            if metric.name() == "poison" {
                return Err(SerializeError::Encode {
                    message: "poison".into(),
                });
            }
            Ok(format!("{}\n", metric.name()).into_bytes())
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    pub(crate) enum Mode {
        Ok,
        Retryable,
        Fatal,
    }

    /// Output that records payloads and fails on demand.
    #[derive(Clone)]
    pub(crate) struct MockOutput {
        pub writes: Arc<Mutex<Vec<(Instant, String)>>>,
        pub attempts: Arc<AtomicUsize>,
        pub mode: Arc<Mutex<Mode>>,
        pub hang: Arc<AtomicBool>,
    }

    impl MockOutput {
        pub fn new() -> Self {
            Self {
                writes: Arc::new(Mutex::new(Vec::new())),
                attempts: Arc::new(AtomicUsize::new(0)),
                mode: Arc::new(Mutex::new(Mode::Ok)),
                hang: Arc::new(AtomicBool::new(false)),
            }
        }

        pub fn set_mode(&self, mode: Mode) {
            *self.mode.lock() = mode;
        }

        pub fn lines(&self) -> Vec<String> {
            self.writes
                .lock()
                .iter()
                .flat_map(|(_, p)| p.lines().map(str::to_string).collect::<Vec<_>>())
                .collect()
        }
    }

    #[async_trait]
    impl Output for MockOutput {
        async fn write(&mut self, payload: &[u8]) -> OutputResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                sleep(Duration::from_secs(5)).await;
            }
            let mode = *self.mode.lock();
            match mode {
                Mode::Ok => {
                    let text = String::from_utf8_lossy(payload).into_owned();
                    self.writes.lock().push((Instant::now(), text));
                    Ok(())
                }
                Mode::Retryable => Err(OutputError::write_failed("mock", "connection refused")),
                Mode::Fatal => Err(OutputError::rejected("mock", "bad request")),
            }
        }
    }

    pub(crate) fn running(mock: &MockOutput, capacity: usize, settings: OutputSettings) -> Arc<RunningOutput> {
        let buffer: Arc<dyn Buffer> = Arc::new(MemoryBuffer::new("mock", capacity, OverflowPolicy::DropOldest));
        let stats = StatsRegistry::new().register_output("mock", "mock", Arc::clone(&buffer));
        Arc::new(RunningOutput::new(
            "mock",
            Box::new(mock.clone()),
            Arc::new(NameSerializer),
            buffer,
            settings,
            MetricFilter::default(),
            stats,
        ))
    }

    fn settings(batch: usize) -> OutputSettings {
        OutputSettings {
            metric_batch_size: batch,
            flush_interval: Duration::from_secs(10),
            flush_jitter: Duration::ZERO,
            retry: RetryConfig {
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(8),
                backoff_multiplier: 2.0,
                max_retries: None,
            },
            final_flush_retries: 3,
        }
    }

    fn m(name: &str) -> Metric {
        Metric::new(name, Timestamp::EPOCH).with_field("v", 1i64)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_and_acks() {
        let mock = MockOutput::new();
        let out = running(&mock, 100, settings(2));
        for name in ["a", "b", "c"] {
            out.add_metric(m(name));
        }

        assert_eq!(out.flush_batch().await, FlushOutcome::Written(2));
        assert_eq!(out.flush_all().await, FlushOutcome::Written(1));
        assert_eq!(out.flush_all().await, FlushOutcome::Empty);
        assert_eq!(mock.lines(), vec!["a", "b", "c"]);

        let stats = out.stats();
        assert_eq!(stats.metrics_written, 3);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.buffer_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_write_inside_backoff_window() {
        let mock = MockOutput::new();
        let out = running(&mock, 100, settings(10));
        out.add_metric(m("a"));

        mock.set_mode(Mode::Retryable);
        assert_eq!(out.flush_all().await, FlushOutcome::Requeued(1));
        assert_eq!(mock.attempts.load(Ordering::SeqCst), 1);

        mock.set_mode(Mode::Ok);
        tokio::time::advance(Duration::from_millis(900)).await;
        assert_eq!(out.flush_all().await, FlushOutcome::Deferred);
        assert_eq!(out.flush_batch().await, FlushOutcome::Deferred);
        assert_eq!(mock.attempts.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(out.flush_all().await, FlushOutcome::Written(1));
        assert_eq!(mock.lines(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let mock = MockOutput::new();
        let out = running(&mock, 100, settings(10));

        mock.set_mode(Mode::Retryable);
        out.add_metric(m("a"));
        out.flush_all().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        out.flush_all().await;
        assert_eq!(out.backoff.lock().current_delay(), Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(2)).await;
        mock.set_mode(Mode::Ok);
        assert_eq!(out.flush_all().await, FlushOutcome::Written(1));
        assert_eq!(out.backoff.lock().current_delay(), Duration::from_secs(1));
        assert_eq!(out.backoff.lock().attempts(), 0);

        // next failure starts from the initial delay again
        mock.set_mode(Mode::Retryable);
        out.add_metric(m("b"));
        out.flush_all().await;
        assert!(!out.backoff.lock().should_allow(Instant::now() + Duration::from_millis(999)));
        assert!(out.backoff.lock().should_allow(Instant::now() + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_and_serialize_failures_drop() {
        let mock = MockOutput::new();
        let out = running(&mock, 100, settings(1));

        out.add_metric(m("poison"));
        assert_eq!(out.flush_batch().await, FlushOutcome::Dropped(1));
        assert_eq!(mock.attempts.load(Ordering::SeqCst), 0);

        mock.set_mode(Mode::Fatal);
        out.add_metric(m("a"));
        assert_eq!(out.flush_batch().await, FlushOutcome::Dropped(1));
        assert!(out.buffer().is_empty());
        assert!(out.backoff.lock().should_allow(Instant::now()));

        let stats = out.stats();
        assert_eq!(stats.serialize_errors, 1);
        assert_eq!(stats.write_errors, 1);
        assert_eq!(stats.metrics_dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retries_drops_batch() {
        let mock = MockOutput::new();
        let mut cfg = settings(10);
        cfg.retry.max_retries = Some(1);
        let out = running(&mock, 100, cfg);
        mock.set_mode(Mode::Retryable);
        out.add_metric(m("a"));

        assert_eq!(out.flush_all().await, FlushOutcome::Requeued(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(out.flush_all().await, FlushOutcome::Dropped(1));
        assert!(out.buffer().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flush_is_skipped() {
        let mock = MockOutput::new();
        mock.hang.store(true, Ordering::SeqCst);
        let out = running(&mock, 100, settings(1));
        out.add_metric(m("a"));
        out.add_metric(m("b"));

        let first = tokio::spawn({
            let out = Arc::clone(&out);
            async move { out.flush_batch().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(out.flush_batch().await, FlushOutcome::Busy);
        assert_eq!(out.flush_all().await, FlushOutcome::Busy);

        assert_eq!(first.await.unwrap(), FlushOutcome::Written(1));
        assert_eq!(mock.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_output_stabilizes_at_capacity() {
        let mock = MockOutput::new();
        mock.set_mode(Mode::Retryable);
        let out = running(&mock, 50, settings(10));

        let mut last_dropped = 0;
        for round in 0..20 {
            for i in 0..25 {
                out.add_metric(m(&format!("m{}-{}", round, i)));
            }
            out.flush_all().await;
            tokio::time::advance(Duration::from_secs(10)).await;

            assert!(out.buffer().len() <= 50);
            let dropped = out.stats().buffer.dropped;
            assert!(dropped >= last_dropped);
            last_dropped = dropped;
        }
        assert_eq!(out.buffer().len(), 50);
        assert_eq!(last_dropped, 20 * 25 - 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_interval_and_batch_triggers() {
        let mock = MockOutput::new();
        let out = running(&mock, 100, settings(3));
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&out).run(token.clone()));

        out.add_metric(m("a"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(mock.lines().is_empty());

        out.add_metric(m("b"));
        out.add_metric(m("c"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.lines(), vec!["a", "b", "c"]);

        out.add_metric(m("d"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.lines(), vec!["a", "b", "c", "d"]);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_bounded_retries() {
        let mock = MockOutput::new();
        mock.set_mode(Mode::Retryable);
        let out = running(&mock, 100, settings(10));
        out.add_metric(m("a"));

        let deadline = Instant::now() + Duration::from_secs(30);
        assert_eq!(out.final_flush(deadline).await, 0);
        assert_eq!(mock.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(out.discard_pending(), 1);
        assert_eq!(out.stats().metrics_dropped, 1);

        mock.set_mode(Mode::Ok);
        out.add_metric(m("b"));
        assert_eq!(out.final_flush(deadline).await, 1);
    }
}
