//! One JSON object per line.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::PluginOptions;
use crate::error::{ConfigResult, SerializeError, SerializeResult};
use crate::metric::{FieldValue, Metric, MetricKind};
use crate::plugin::Serializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// Integer nanoseconds since the epoch
    #[default]
    Unix,
    /// RFC 3339 with nanoseconds
    Rfc3339,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JsonOptions {
    pub timestamp_format: TimestampFormat,
}

#[derive(Serialize)]
struct JsonMetric<'a> {
    name: &'a str,
    tags: BTreeMap<&'a str, &'a str>,
    fields: BTreeMap<&'a str, &'a FieldValue>,
    timestamp: serde_json::Value,
    #[serde(skip_serializing_if = "is_untyped")]
    kind: MetricKind,
}

fn is_untyped(kind: &MetricKind) -> bool {
    *kind == MetricKind::Untyped
}

#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    timestamp_format: TimestampFormat,
}

impl JsonSerializer {
    pub fn new(timestamp_format: TimestampFormat) -> Self {
        Self { timestamp_format }
    }

    pub fn build(options: &PluginOptions) -> ConfigResult<Arc<dyn Serializer>> {
        let options: JsonOptions = options.deserialize("json")?;
        Ok(Arc::new(Self::new(options.timestamp_format)))
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, metric: &Metric) -> SerializeResult<Vec<u8>> {
        if metric.fields().is_empty() {
            return Err(SerializeError::NoFields {
                metric: metric.name().to_string(),
            });
        }

        let timestamp = match self.timestamp_format {
            TimestampFormat::Unix => serde_json::Value::from(metric.timestamp().as_nanos()),
            TimestampFormat::Rfc3339 => serde_json::Value::from(metric.timestamp().to_string()),
        };
        let doc = JsonMetric {
            name: metric.name(),
            tags: metric
                .tags()
                .iter()
                .map(|t| (t.key.as_str(), t.value.as_str()))
                .collect(),
            fields: metric
                .fields()
                .iter()
                .map(|f| (f.key.as_str(), &f.value))
                .collect(),
            timestamp,
            kind: metric.kind(),
        };

        let mut out = serde_json::to_vec(&doc)?;
        out.push(b'\n');
        Ok(out)
    }
}
