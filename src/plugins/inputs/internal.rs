//! The agent's own pipeline statistics as metrics.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::accumulator::Accumulator;
use crate::config::PluginOptions;
use crate::error::{ConfigResult, InputResult};
use crate::metric::{Fields, Tags};
use crate::plugin::Input;
use crate::registry::BuildContext;
use crate::stats::StatsRegistry;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InternalOptions {
    /// Also emit one `internal_buffer` metric per output
    pub buffer_details: bool,
}

impl Default for InternalOptions {
    fn default() -> Self {
        Self { buffer_details: true }
    }
}

#[derive(Debug)]
pub struct Internal {
    stats: Arc<StatsRegistry>,
    options: InternalOptions,
}

impl Internal {
    pub fn new(stats: Arc<StatsRegistry>, options: InternalOptions) -> Self {
        Self { stats, options }
    }

    pub fn build(options: &PluginOptions, ctx: &BuildContext<'_>) -> ConfigResult<Box<dyn Input>> {
        let options: InternalOptions = options.deserialize("internal")?;
        Ok(Box::new(Self::new(Arc::clone(ctx.stats), options)))
    }
}

#[async_trait]
impl Input for Internal {
    fn description(&self) -> &str {
        "Collect statistics about the agent itself"
    }

    async fn gather(&self, acc: &Accumulator) -> InputResult<()> {
        let inputs = self.stats.input_snapshots();
        let outputs = self.stats.output_snapshots();

        let mut gathered = 0;
        for s in &inputs {
            gathered += s.metrics_gathered;
            let tags: Tags = [("input", s.name.as_str()), ("plugin", s.plugin.as_str())]
                .into_iter()
                .collect();
            let fields: Fields = [
                ("cycles", s.cycles),
                ("errors", s.errors),
                ("overruns", s.overruns),
                ("skipped_ticks", s.skipped_ticks),
                ("metrics_gathered", s.metrics_gathered),
                ("gather_time_us", s.last_gather_us),
                ("max_gather_time_us", s.max_gather_us),
            ]
            .into_iter()
            .collect();
            acc.add_counter("internal_input", tags, fields, None);
        }

        let (mut written, mut dropped) = (0, 0);
        for s in &outputs {
            written += s.metrics_written;
            dropped += s.metrics_dropped;
            let tags: Tags = [("output", s.name.as_str()), ("plugin", s.plugin.as_str())]
                .into_iter()
                .collect();
            let fields: Fields = [
                ("metrics_added", s.metrics_added),
                ("metrics_written", s.metrics_written),
                ("metrics_dropped", s.metrics_dropped),
                ("writes", s.writes),
                ("write_errors", s.write_errors),
                ("serialize_errors", s.serialize_errors),
                ("bytes_written", s.bytes_written),
                ("write_time_us", s.last_write_us),
                ("buffer_size", s.buffer_size as u64),
                ("buffer_limit", s.buffer_limit as u64),
            ]
            .into_iter()
            .collect();
            acc.add_counter("internal_output", tags, fields, None);

            if self.options.buffer_details {
                let tags: Tags = [("output", s.name.as_str())].into_iter().collect();
                let fields: Fields = [
                    ("accepted", s.buffer.accepted),
                    ("dropped", s.buffer.dropped),
                    ("acked", s.buffer.acked),
                    ("rejected", s.buffer.rejected),
                    ("high_water_mark", s.buffer.high_water_mark as u64),
                ]
                .into_iter()
                .collect();
                acc.add_gauge("internal_buffer", tags, fields, None);
            }
        }

        let fields: Fields = [
            ("inputs", inputs.len() as u64),
            ("outputs", outputs.len() as u64),
            ("metrics_gathered", gathered),
            ("metrics_written", written),
            ("metrics_dropped", dropped),
        ]
        .into_iter()
        .collect();
        acc.add_counter("internal_agent", Tags::new(), fields, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{CollectingSink, MetricDefaults};
    use crate::buffer::{Buffer, MemoryBuffer, OverflowPolicy};
    use crate::metric::{FieldValue, Metric, Timestamp};
    use std::time::Duration;

    #[tokio::test]
    async fn test_reports_pipeline_counters() {
        let stats = Arc::new(StatsRegistry::new());
        let cpu = stats.register_input("cpu", "cpu");
        cpu.record_start(Timestamp::now());
        cpu.record_cycle(Duration::from_millis(3), 5, 1);

        let buffer: Arc<dyn Buffer> = Arc::new(MemoryBuffer::new("out", 1, OverflowPolicy::DropOldest));
        stats.register_output("influx", "discard", Arc::clone(&buffer));
        buffer.accept(Metric::new("a", Timestamp::EPOCH).with_field("v", 1i64));
        buffer.accept(Metric::new("b", Timestamp::EPOCH).with_field("v", 1i64));

        let sink = Arc::new(CollectingSink::new());
        let acc = Accumulator::new("internal", Arc::new(MetricDefaults::default()), sink.clone());
        Internal::new(Arc::clone(&stats), InternalOptions::default())
            .gather(&acc)
            .await
            .unwrap();

        let metrics = sink.take();
        let names: Vec<&str> = metrics.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["internal_input", "internal_output", "internal_buffer", "internal_agent"]);

        assert_eq!(metrics[0].tag("input"), Some("cpu"));
        assert_eq!(metrics[0].field("metrics_gathered"), Some(&FieldValue::Uint(5)));
        assert_eq!(metrics[0].field("gather_time_us"), Some(&FieldValue::Uint(3000)));
        assert_eq!(metrics[1].field("metrics_dropped"), Some(&FieldValue::Uint(1)));
        assert_eq!(metrics[1].field("buffer_size"), Some(&FieldValue::Uint(1)));
        assert_eq!(metrics[3].field("outputs"), Some(&FieldValue::Uint(1)));
    }
}
