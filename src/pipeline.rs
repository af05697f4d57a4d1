// ============================================================================
// SECTION 13: PROCESSING PIPELINE
// ============================================================================
// Everything between the accumulator and the buffers:
//
//   Accumulator → processors (by order) → aggregators → OutputRouter
//                                            │              │
//                                            └─ push ───────┘
//
// Aggregators see every processed metric that passes their filter and emit
// their own metrics on their period. Those go straight to the router.
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::accumulator::{Accumulator, MetricDefaults, MetricSink};
use crate::filter::MetricFilter;
use crate::metric::Metric;
use crate::output::RunningOutput;
use crate::plugin::{Aggregator, Processor};

// ----------------------------------------------------------------------------
// 13.1 Output Router
// ----------------------------------------------------------------------------

/// Fans each metric out to every output whose filter selects it. Each output
/// gets its own copy; buffers are never shared.
#[derive(Debug, Default)]
pub struct OutputRouter {
    outputs: Vec<Arc<RunningOutput>>,
}

impl OutputRouter {
    pub fn new(outputs: Vec<Arc<RunningOutput>>) -> Self {
        Self { outputs }
    }

    pub fn outputs(&self) -> &[Arc<RunningOutput>] {
        &self.outputs
    }
}

impl MetricSink for OutputRouter {
    fn emit(&self, metric: Metric) {
        let mut targets = self.outputs.iter().filter(|o| o.selects(&metric));
        let Some(mut current) = targets.next() else {
            trace!(target: "conduit::pipeline", metric = metric.name(), "No output selects metric");
            return;
        };
        for next in targets {
            current.add_metric(metric.clone());
            current = next;
        }
        current.add_metric(metric);
    }
}

// ----------------------------------------------------------------------------
// 13.2 Processors
// ----------------------------------------------------------------------------

pub struct RunningProcessor {
    name: CompactString,
    order: i64,
    filter: MetricFilter,
    processor: Mutex<Box<dyn Processor>>,
}

impl RunningProcessor {
    pub fn new(name: impl Into<CompactString>, order: i64, filter: MetricFilter, processor: Box<dyn Processor>) -> Self {
        Self {
            name: name.into(),
            order,
            filter,
            processor: Mutex::new(processor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> i64 {
        self.order
    }

    /// Run the processor over the metrics its filter selects. Unselected
    /// metrics pass through untouched and keep their position.
    pub fn apply(&self, metrics: Vec<Metric>) -> Vec<Metric> {
        let mut processor = self.processor.lock();
        if self.filter.is_empty() {
            return processor.apply(metrics);
        }

        let mut out = Vec::with_capacity(metrics.len());
        for metric in metrics {
            if self.filter.selects(&metric) {
                out.extend(processor.apply(vec![metric]));
            } else {
                out.push(metric);
            }
        }
        out
    }
}

impl fmt::Debug for RunningProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningProcessor")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 13.3 Aggregators
// ----------------------------------------------------------------------------

pub struct RunningAggregator {
    name: CompactString,
    period: Duration,
    drop_original: bool,
    filter: MetricFilter,
    aggregator: Mutex<Box<dyn Aggregator>>,
    defaults: Arc<MetricDefaults>,
    sink: Arc<dyn MetricSink>,
}

impl RunningAggregator {
    pub fn new(
        name: impl Into<CompactString>,
        period: Duration,
        drop_original: bool,
        filter: MetricFilter,
        aggregator: Box<dyn Aggregator>,
        defaults: MetricDefaults,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            name: name.into(),
            period,
            drop_original,
            filter,
            aggregator: Mutex::new(aggregator),
            defaults: Arc::new(defaults),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn drop_original(&self) -> bool {
        self.drop_original
    }

    /// Feed one metric; returns whether the aggregator took it.
    pub fn add(&self, metric: &Metric) -> bool {
        if !self.filter.selects(metric) {
            return false;
        }
        self.aggregator.lock().add(metric);
        true
    }

    /// Emit the current period's aggregates and start a new period.
    pub fn push(&self) -> u64 {
        let acc = Accumulator::new(self.name.clone(), Arc::clone(&self.defaults), Arc::clone(&self.sink));
        let mut aggregator = self.aggregator.lock();
        aggregator.push(&acc);
        aggregator.reset();
        acc.finish().metrics
    }

    /// Push every `period` until cancelled, then push once more so nothing
    /// observed is lost.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let pushed = self.push();
                    trace!(target: "conduit::pipeline", aggregator = %self.name, pushed, "Aggregator push");
                }
            }
        }

        let pushed = self.push();
        debug!(target: "conduit::pipeline", aggregator = %self.name, pushed, "Final aggregator push");
    }
}

impl fmt::Debug for RunningAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningAggregator")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("drop_original", &self.drop_original)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 13.4 Pipeline
// ----------------------------------------------------------------------------

/// The sink every input accumulator forwards into.
#[derive(Debug)]
pub struct Pipeline {
    processors: Vec<RunningProcessor>,
    aggregators: Vec<Arc<RunningAggregator>>,
    router: Arc<OutputRouter>,
}

impl Pipeline {
    /// Processors run in ascending `order`; ties keep configuration order.
    pub fn new(
        mut processors: Vec<RunningProcessor>,
        aggregators: Vec<Arc<RunningAggregator>>,
        router: Arc<OutputRouter>,
    ) -> Self {
        processors.sort_by_key(RunningProcessor::order);
        Self {
            processors,
            aggregators,
            router,
        }
    }

    pub fn router(&self) -> &Arc<OutputRouter> {
        &self.router
    }

    pub fn aggregators(&self) -> &[Arc<RunningAggregator>] {
        &self.aggregators
    }

    fn forward(&self, metric: Metric) {
        let mut keep = true;
        for aggregator in &self.aggregators {
            if aggregator.add(&metric) && aggregator.drop_original() {
                keep = false;
            }
        }
        if keep {
            self.router.emit(metric);
        }
    }
}

impl MetricSink for Pipeline {
    fn emit(&self, metric: Metric) {
        if self.processors.is_empty() {
            self.forward(metric);
            return;
        }

        let mut metrics = vec![metric];
        for processor in &self.processors {
            metrics = processor.apply(metrics);
            if metrics.is_empty() {
                return;
            }
        }
        for metric in metrics {
            self.forward(metric);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::CollectingSink;
    use crate::buffer::Buffer;
    use crate::config::FilterConfig;
    use crate::metric::Timestamp;
    use crate::output::tests::{running, MockOutput};
    use crate::output::OutputSettings;
    use pretty_assertions::assert_eq;

    struct Rename(&'static str);

    impl Processor for Rename {
        fn apply(&mut self, metrics: Vec<Metric>) -> Vec<Metric> {
            metrics.into_iter().map(|m| m.with_name(self.0)).collect()
        }
    }

    struct DropAll;

    impl Processor for DropAll {
        fn apply(&mut self, _metrics: Vec<Metric>) -> Vec<Metric> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct Count(i64);

    impl Aggregator for Count {
        fn add(&mut self, _metric: &Metric) {
            self.0 += 1;
        }

        fn push(&mut self, acc: &Accumulator) {
            acc.add(Metric::new("count", Timestamp::EPOCH).with_field("n", self.0));
        }

        fn reset(&mut self) {
            self.0 = 0;
        }
    }

    fn m(name: &str) -> Metric {
        Metric::new(name, Timestamp::EPOCH).with_field("v", 1i64)
    }

    fn namepass(patterns: &[&str]) -> MetricFilter {
        MetricFilter::compile(&FilterConfig {
            namepass: patterns.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_processors_run_in_order() {
        let processors = vec![
            RunningProcessor::new("late", 10, MetricFilter::default(), Box::new(Rename("second"))),
            RunningProcessor::new("early", -1, MetricFilter::default(), Box::new(Rename("first"))),
        ];
        let pipeline = Pipeline::new(processors, vec![], Arc::new(OutputRouter::default()));

        let mut names = Vec::new();
        let mut metrics = vec![m("x")];
        for p in &pipeline.processors {
            metrics = p.apply(metrics);
            names.push(metrics[0].name().to_string());
        }
        assert_eq!(pipeline.processors[0].name(), "early");
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_filtered_processor_keeps_order() {
        let p = RunningProcessor::new("r", 0, namepass(&["cpu*"]), Box::new(Rename("renamed")));
        let out = p.apply(vec![m("cpu"), m("mem"), m("cpu2")]);
        let names: Vec<&str> = out.iter().map(Metric::name).collect();
        assert_eq!(names, vec!["renamed", "mem", "renamed"]);
    }

    #[test]
    fn test_aggregator_drop_original() {
        let sink: Arc<CollectingSink> = Arc::new(CollectingSink::new());
        let agg = Arc::new(RunningAggregator::new(
            "count",
            Duration::from_secs(30),
            true,
            namepass(&["cpu"]),
            Box::<Count>::default(),
            MetricDefaults::default(),
            sink.clone(),
        ));

        assert!(agg.add(&m("cpu")));
        assert!(!agg.add(&m("mem")));
        assert!(agg.add(&m("cpu")));

        assert_eq!(agg.push(), 1);
        let pushed = sink.take();
        assert_eq!(pushed[0].field("n"), Some(&2i64.into()));

        agg.push();
        assert_eq!(sink.take()[0].field("n"), Some(&0i64.into()));
    }

    #[test]
    fn test_dropping_processor_stops_metric() {
        let mock = MockOutput::new();
        let output = running(&mock, 10, OutputSettings::default());
        let router = Arc::new(OutputRouter::new(vec![Arc::clone(&output)]));

        let dropping = Pipeline::new(
            vec![RunningProcessor::new("drop", 0, MetricFilter::default(), Box::new(DropAll))],
            vec![],
            Arc::clone(&router),
        );
        dropping.emit(m("x"));
        assert!(output.buffer().is_empty());

        let passing = Pipeline::new(vec![], vec![], router);
        passing.emit(m("y"));
        assert_eq!(output.buffer().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregator_final_push_on_cancel() {
        let sink = Arc::new(CollectingSink::new());
        let agg = Arc::new(RunningAggregator::new(
            "count",
            Duration::from_secs(30),
            false,
            MetricFilter::default(),
            Box::<Count>::default(),
            MetricDefaults::default(),
            sink.clone(),
        ));
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&agg).run(token.clone()));

        agg.add(&m("a"));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.take().len(), 1);

        agg.add(&m("b"));
        agg.add(&m("c"));
        token.cancel();
        task.await.unwrap();
        let last = sink.take();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].field("n"), Some(&2i64.into()));
    }
}
