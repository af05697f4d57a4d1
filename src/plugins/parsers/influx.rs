//! Line protocol parser.

use std::sync::Arc;

use influxdb_line_protocol::{parse_lines, FieldValue as LineValue};
use serde::Deserialize;

use crate::config::PluginOptions;
use crate::error::{ConfigResult, ParseError, ParseResult};
use crate::metric::{FieldValue, Fields, Metric, MetricKind, Tags, Timestamp};
use crate::plugin::Parser;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfluxParserOptions {
    /// Skip malformed lines instead of failing the payload
    pub skip_invalid: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InfluxParser {
    skip_invalid: bool,
}

impl InfluxParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(options: &PluginOptions) -> ConfigResult<Arc<dyn Parser>> {
        let options: InfluxParserOptions = options.deserialize("influx")?;
        Ok(Arc::new(Self {
            skip_invalid: options.skip_invalid,
        }))
    }
}

impl Parser for InfluxParser {
    fn parse(&self, buf: &[u8]) -> ParseResult<Vec<Metric>> {
        let text = std::str::from_utf8(buf)?;
        let now = Timestamp::now();
        let mut metrics = Vec::new();

        for (i, line) in parse_lines(text).enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(_) if self.skip_invalid => continue,
                Err(e) => {
                    return Err(ParseError::InvalidLine {
                        line: i + 1,
                        message: e.to_string(),
                    })
                }
            };

            let tags: Tags = line
                .series
                .tag_set
                .iter()
                .flatten()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let fields: Fields = line
                .field_set
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        LineValue::I64(n) => FieldValue::Int(*n),
                        LineValue::U64(n) => FieldValue::Uint(*n),
                        LineValue::F64(n) => FieldValue::Float(*n),
                        LineValue::Boolean(b) => FieldValue::Bool(*b),
                        LineValue::String(s) => FieldValue::String(s.to_string().into()),
                    };
                    (k.to_string(), value)
                })
                .collect();
            let timestamp = line.timestamp.map(Timestamp::from_nanos).unwrap_or(now);

            metrics.push(Metric::from_parts(
                line.series.measurement.to_string(),
                tags,
                fields,
                timestamp,
                MetricKind::Untyped,
            ));
        }

        Ok(metrics)
    }
}
