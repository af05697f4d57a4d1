//! Minimum and maximum of every numeric field, per series, per period.

use ahash::AHashMap;
use compact_str::{format_compact, CompactString};

use crate::accumulator::Accumulator;
use crate::config::PluginOptions;
use crate::error::{ConfigError, ConfigResult};
use crate::metric::{Fields, Metric, MetricKind, Tags, Timestamp};
use crate::plugin::Aggregator;
use crate::registry::BuildContext;

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: f64,
    max: f64,
}

#[derive(Debug)]
struct Series {
    name: CompactString,
    tags: Tags,
    // insertion ordered so the output is stable
    fields: Vec<(CompactString, Bounds)>,
}

#[derive(Debug, Default)]
pub struct MinMax {
    series: AHashMap<u64, Series>,
}

impl MinMax {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(options: &PluginOptions, _ctx: &BuildContext<'_>) -> ConfigResult<Box<dyn Aggregator>> {
        if !options.is_empty() {
            return Err(ConfigError::invalid_options("minmax", "takes no options"));
        }
        Ok(Box::new(Self::new()))
    }
}

impl Aggregator for MinMax {
    fn description(&self) -> &str {
        "Keep the min and max of each numeric field"
    }

    fn add(&mut self, metric: &Metric) {
        let series = self.series.entry(metric.series_id()).or_insert_with(|| Series {
            name: metric.name().into(),
            tags: metric.tags().clone(),
            fields: Vec::new(),
        });

        for field in metric.fields().iter() {
            let Some(v) = field.value.as_f64() else {
                continue;
            };
            match series.fields.iter_mut().find(|(k, _)| *k == field.key) {
                Some((_, b)) => {
                    b.min = b.min.min(v);
                    b.max = b.max.max(v);
                }
                None => series.fields.push((field.key.clone(), Bounds { min: v, max: v })),
            }
        }
    }

    fn push(&mut self, acc: &Accumulator) {
        let now = Timestamp::now();
        for series in self.series.values() {
            if series.fields.is_empty() {
                continue;
            }
            let mut fields = Fields::new();
            for (key, b) in &series.fields {
                fields.set(format_compact!("{}_min", key), b.min);
                fields.set(format_compact!("{}_max", key), b.max);
            }
            acc.add(Metric::from_parts(
                series.name.clone(),
                series.tags.clone(),
                fields,
                now,
                MetricKind::Gauge,
            ));
        }
    }

    fn reset(&mut self) {
        self.series.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{CollectingSink, MetricDefaults};
    use crate::metric::FieldValue;
    use std::sync::Arc;

    fn m(host: &str, v: f64) -> Metric {
        Metric::new("cpu", Timestamp::EPOCH)
            .with_tag("host", host)
            .with_field("usage", v)
            .with_field("label", "x")
    }

    #[test]
    fn test_min_max_per_series() {
        let mut agg = MinMax::new();
        for (host, v) in [("a", 3.0), ("a", 1.0), ("b", 7.0), ("a", 2.0)] {
            agg.add(&m(host, v));
        }

        let sink = Arc::new(CollectingSink::new());
        let acc = Accumulator::new("minmax", Arc::new(MetricDefaults::default()), sink.clone());
        agg.push(&acc);

        let mut out = sink.take();
        out.sort_by(|x, y| x.tag("host").cmp(&y.tag("host")));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].field("usage_min"), Some(&FieldValue::Float(1.0)));
        assert_eq!(out[0].field("usage_max"), Some(&FieldValue::Float(3.0)));
        assert_eq!(out[1].field("usage_min"), Some(&FieldValue::Float(7.0)));
        assert!(out[0].field("label_min").is_none());
        assert_eq!(out[0].kind(), MetricKind::Gauge);

        agg.reset();
        agg.push(&acc);
        assert!(sink.is_empty());
    }
}
