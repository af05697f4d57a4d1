// ============================================================================
// SECTION 11: ACCUMULATOR
// ============================================================================
// The only interface a source plugin sees. The accumulator turns raw
// observations into metrics (time, name transforms, tag defaults, precision,
// filters) and forwards them into the pipeline. It is created fresh for each
// collection cycle and collects that cycle's errors into a `CycleReport`.
// ============================================================================

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use compact_str::{format_compact, CompactString};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::InputConfig;
use crate::error::{ConfigResult, InputError};
use crate::filter::MetricFilter;
use crate::metric::{Fields, Metric, MetricKind, Tags, Timestamp};
use crate::tracking::{DeliveryTracker, TrackingId};
use crate::MAX_METRIC_NAME_LENGTH;

// ----------------------------------------------------------------------------
// 11.1 Sink
// ----------------------------------------------------------------------------

/// Where an accumulator forwards finished metrics.
///
/// Implementations must not block indefinitely; buffers apply their overflow
/// policy instead.
pub trait MetricSink: Send + Sync {
    fn emit(&self, metric: Metric);
}

// ----------------------------------------------------------------------------
// 11.2 Defaults
// ----------------------------------------------------------------------------

/// Per-source rules applied to every metric an accumulator receives.
#[derive(Debug, Clone, Default)]
pub struct MetricDefaults {
    pub name_override: Option<CompactString>,
    pub name_prefix: Option<CompactString>,
    pub name_suffix: Option<CompactString>,
    /// Tags of the producing plugin
    pub plugin_tags: Tags,
    /// Agent-wide tags, `host` included
    pub global_tags: Tags,
    /// Timestamps are truncated to this; zero keeps nanoseconds
    pub precision: Duration,
    pub filter: MetricFilter,
}

impl MetricDefaults {
    pub fn for_input(config: &InputConfig, global_tags: &Tags, precision: Duration) -> ConfigResult<Self> {
        Ok(Self {
            name_override: config.name_override.as_deref().map(CompactString::from),
            name_prefix: config.name_prefix.as_deref().map(CompactString::from),
            name_suffix: config.name_suffix.as_deref().map(CompactString::from),
            plugin_tags: config
                .tags
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            global_tags: global_tags.clone(),
            precision,
            filter: MetricFilter::compile(&config.filter)?,
        })
    }

    /// Finish a metric: filter, rename, merge tags, truncate time.
    ///
    /// Tag precedence: the metric's own tags win over plugin tags, which win
    /// over global tags.
    pub fn apply(&self, metric: Metric) -> Option<Metric> {
        if !metric.is_valid() {
            debug!(target: "conduit::accumulator", metric = metric.name(), "Dropping metric without fields");
            return None;
        }

        let mut metric = self.filter.apply(metric)?;

        if let Some(name) = &self.name_override {
            metric = metric.with_name(name.clone());
        }
        if self.name_prefix.is_some() || self.name_suffix.is_some() {
            let name = format_compact!(
                "{}{}{}",
                self.name_prefix.as_deref().unwrap_or(""),
                metric.name(),
                self.name_suffix.as_deref().unwrap_or("")
            );
            metric = metric.with_name(name);
        }
        if metric.name().is_empty() || metric.name().len() > MAX_METRIC_NAME_LENGTH {
            debug!(
                target: "conduit::accumulator",
                len = metric.name().len(),
                "Dropping metric with empty or oversized name"
            );
            return None;
        }

        let tags = metric.tags_mut();
        for tag in self.plugin_tags.iter() {
            tags.set_if_absent(tag.key.as_str(), tag.value.clone());
        }
        for tag in self.global_tags.iter() {
            tags.set_if_absent(tag.key.as_str(), tag.value.clone());
        }

        if !self.precision.is_zero() {
            let ts = metric.timestamp().truncate(self.precision);
            metric = metric.with_timestamp(ts);
        }

        Some(metric)
    }
}

// ----------------------------------------------------------------------------
// 11.3 Accumulator
// ----------------------------------------------------------------------------

/// What one collection cycle produced.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Metrics forwarded into the pipeline
    pub metrics: u64,
    pub errors: Vec<InputError>,
}

/// Per-cycle ingestion funnel. Safe to share across tasks spawned by a
/// gather.
pub struct Accumulator {
    source: CompactString,
    defaults: Arc<MetricDefaults>,
    sink: Arc<dyn MetricSink>,
    metrics: AtomicU64,
    errors: Mutex<Vec<InputError>>,
}

impl Accumulator {
    pub fn new(
        source: impl Into<CompactString>,
        defaults: Arc<MetricDefaults>,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            source: source.into(),
            defaults,
            sink,
            metrics: AtomicU64::new(0),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Name of the plugin feeding this accumulator
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Record one observation; `None` stamps the current time.
    pub fn add_metric(
        &self,
        name: impl Into<CompactString>,
        tags: Tags,
        fields: Fields,
        timestamp: Option<Timestamp>,
    ) {
        self.add_kind(name, tags, fields, timestamp, MetricKind::Untyped);
    }

    pub fn add_counter(
        &self,
        name: impl Into<CompactString>,
        tags: Tags,
        fields: Fields,
        timestamp: Option<Timestamp>,
    ) {
        self.add_kind(name, tags, fields, timestamp, MetricKind::Counter);
    }

    pub fn add_gauge(
        &self,
        name: impl Into<CompactString>,
        tags: Tags,
        fields: Fields,
        timestamp: Option<Timestamp>,
    ) {
        self.add_kind(name, tags, fields, timestamp, MetricKind::Gauge);
    }

    fn add_kind(
        &self,
        name: impl Into<CompactString>,
        tags: Tags,
        fields: Fields,
        timestamp: Option<Timestamp>,
        kind: MetricKind,
    ) {
        let ts = timestamp.unwrap_or_else(Timestamp::now);
        self.add(Metric::from_parts(name, tags, fields, ts, kind));
    }

    /// Forward a pre-built metric through the same defaults.
    pub fn add(&self, metric: Metric) {
        if let Some(metric) = self.defaults.apply(metric) {
            self.metrics.fetch_add(1, AtomicOrdering::Relaxed);
            self.sink.emit(metric);
        }
    }

    /// Forward a metric whose delivery outcome the caller wants to hear
    /// about through `tracker`.
    pub fn add_tracking(&self, mut metric: Metric, tracker: &DeliveryTracker) -> TrackingId {
        let tracking = tracker.track();
        let id = tracking.id();
        metric.attach_tracking(tracking);
        self.add(metric);
        id
    }

    /// Record a non-fatal collection error; the cycle goes on.
    pub fn add_error(&self, err: InputError) {
        self.errors.lock().push(err);
    }

    /// Take what the cycle produced so far.
    pub fn finish(&self) -> CycleReport {
        CycleReport {
            metrics: self.metrics.swap(0, AtomicOrdering::Relaxed),
            errors: mem::take(&mut *self.errors.lock()),
        }
    }
}

impl fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accumulator")
            .field("source", &self.source)
            .field("metrics", &self.metrics.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 11.4 Test Support
// ----------------------------------------------------------------------------

/// Sink that keeps everything it receives, for tests and tooling.
#[derive(Debug, Default)]
pub struct CollectingSink {
    metrics: Mutex<Vec<Metric>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Metric> {
        mem::take(&mut *self.metrics.lock())
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricSink for CollectingSink {
    fn emit(&self, metric: Metric) {
        self.metrics.lock().push(metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::metric::FieldValue;
    use pretty_assertions::assert_eq;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().copied().collect()
    }

    fn fields(pairs: &[(&str, i64)]) -> Fields {
        pairs.iter().copied().collect()
    }

    fn accumulator(defaults: MetricDefaults) -> (Accumulator, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let acc = Accumulator::new("test", Arc::new(defaults), sink.clone());
        (acc, sink)
    }

    #[test]
    fn test_defaults_timestamp_when_missing() {
        let (acc, sink) = accumulator(MetricDefaults::default());
        let before = Timestamp::now();
        acc.add_metric("cpu", Tags::new(), fields(&[("v", 1)]), None);
        acc.add_metric("cpu", Tags::new(), fields(&[("v", 2)]), Some(Timestamp::from_secs(7)));

        let metrics = sink.take();
        assert!(metrics[0].timestamp() >= before);
        assert_eq!(metrics[1].timestamp(), Timestamp::from_secs(7));
    }

    #[test]
    fn test_tag_precedence_metric_then_plugin_then_global() {
        let defaults = MetricDefaults {
            plugin_tags: tags(&[("dc", "plugin"), ("role", "plugin")]),
            global_tags: tags(&[("dc", "global"), ("role", "global"), ("host", "h1"), ("env", "prod")]),
            ..MetricDefaults::default()
        };
        let (acc, sink) = accumulator(defaults);
        acc.add_metric("m", tags(&[("dc", "metric")]), fields(&[("v", 1)]), None);

        let m = &sink.take()[0];
        assert_eq!(m.tag("dc"), Some("metric"));
        assert_eq!(m.tag("role"), Some("plugin"));
        assert_eq!(m.tag("host"), Some("h1"));
        assert_eq!(m.tag("env"), Some("prod"));
        assert_eq!(m.tags().len(), 4);
    }

    #[test]
    fn test_name_transforms_and_precision() {
        let defaults = MetricDefaults {
            name_prefix: Some("app_".into()),
            name_suffix: Some("_total".into()),
            precision: Duration::from_secs(1),
            ..MetricDefaults::default()
        };
        let (acc, sink) = accumulator(defaults);
        acc.add_counter("req", Tags::new(), fields(&[("v", 1)]), Some(Timestamp::from_nanos(1_500_000_000)));

        let m = &sink.take()[0];
        assert_eq!(m.name(), "app_req_total");
        assert_eq!(m.kind(), MetricKind::Counter);
        assert_eq!(m.timestamp(), Timestamp::from_secs(1));
    }

    #[test]
    fn test_name_override() {
        let defaults = MetricDefaults {
            name_override: Some("renamed".into()),
            ..MetricDefaults::default()
        };
        let (acc, sink) = accumulator(defaults);
        acc.add_gauge("orig", Tags::new(), fields(&[("v", 1)]), None);
        assert_eq!(sink.take()[0].name(), "renamed");
    }

    #[test]
    fn test_filter_and_fieldless_metrics_dropped() {
        let filter = MetricFilter::compile(&FilterConfig {
            namedrop: vec!["noisy*".into()],
            ..FilterConfig::default()
        })
        .unwrap();
        let (acc, sink) = accumulator(MetricDefaults {
            filter,
            ..MetricDefaults::default()
        });

        acc.add_metric("noisy_thing", Tags::new(), fields(&[("v", 1)]), None);
        acc.add_metric("empty", Tags::new(), Fields::new(), None);
        acc.add_metric("kept", Tags::new(), fields(&[("v", 1)]), None);

        let metrics = sink.take();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].field("v"), Some(&FieldValue::Int(1)));
        assert_eq!(acc.finish().metrics, 1);
    }

    #[test]
    fn test_name_length_enforced_after_transforms() {
        let (acc, sink) = accumulator(MetricDefaults {
            name_prefix: Some("p_".into()),
            ..MetricDefaults::default()
        });

        let just_fits = "x".repeat(MAX_METRIC_NAME_LENGTH - 2);
        acc.add_metric(just_fits.as_str(), Tags::new(), fields(&[("v", 1)]), None);
        acc.add_metric("y".repeat(MAX_METRIC_NAME_LENGTH - 1), Tags::new(), fields(&[("v", 1)]), None);

        let metrics = sink.take();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name().len(), MAX_METRIC_NAME_LENGTH);
        assert_eq!(acc.finish().metrics, 1);
    }

    #[test]
    fn test_errors_collected_into_report() {
        let (acc, _sink) = accumulator(MetricDefaults::default());
        acc.add_error(InputError::collection_failed("test", "disk gone"));
        acc.add_metric("m", Tags::new(), fields(&[("v", 1)]), None);
        acc.add_error(InputError::collection_failed("test", "again"));

        let report = acc.finish();
        assert_eq!(report.metrics, 1);
        assert_eq!(report.errors.len(), 2);

        let empty = acc.finish();
        assert_eq!(empty.metrics, 0);
        assert!(empty.errors.is_empty());
    }

    #[test]
    fn test_tracking_reports_filtered_metric() {
        let filter = MetricFilter::compile(&FilterConfig {
            namepass: vec!["wanted".into()],
            ..FilterConfig::default()
        })
        .unwrap();
        let (acc, sink) = accumulator(MetricDefaults {
            filter,
            ..MetricDefaults::default()
        });
        let tracker = DeliveryTracker::new();

        let dropped = Metric::new("unwanted", Timestamp::EPOCH).with_field("v", 1i64);
        let id = acc.add_tracking(dropped, &tracker);
        let info = tracker.try_delivered().unwrap();
        assert_eq!(info.id, id);

        let kept = Metric::new("wanted", Timestamp::EPOCH).with_field("v", 1i64);
        let id = acc.add_tracking(kept, &tracker);
        assert!(tracker.try_delivered().is_none());
        assert_eq!(sink.take()[0].tracking_id(), Some(id));
        assert!(tracker.try_delivered().is_some());
    }

    #[test]
    fn test_concurrent_adds() {
        let (acc, sink) = accumulator(MetricDefaults::default());
        let acc = Arc::new(acc);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let acc = Arc::clone(&acc);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        acc.add_metric("m", Tags::new(), fields(&[("v", i * 100 + j)]), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sink.len(), 800);
        assert_eq!(acc.finish().metrics, 800);
    }
}
