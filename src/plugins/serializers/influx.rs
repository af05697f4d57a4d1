//! Line protocol serializer.

use std::sync::Arc;

use influxdb_line_protocol::LineProtocolBuilder;
use serde::Deserialize;

use crate::config::PluginOptions;
use crate::error::{ConfigResult, SerializeError, SerializeResult};
use crate::metric::{Field, FieldValue, Metric};
use crate::plugin::Serializer;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfluxOptions {
    /// Emit fields in key order instead of insertion order
    pub sort_fields: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InfluxSerializer {
    sort_fields: bool,
}

impl InfluxSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(options: &PluginOptions) -> ConfigResult<Arc<dyn Serializer>> {
        let options: InfluxOptions = options.deserialize("influx")?;
        Ok(Arc::new(Self {
            sort_fields: options.sort_fields,
        }))
    }
}

// The builder changes type after the first field, so each call site needs
// its own expansion.
macro_rules! put_field {
    ($builder:expr, $field:expr) => {
        match &$field.value {
            FieldValue::Int(v) => $builder.field(&$field.key, *v),
            FieldValue::Uint(v) => $builder.field(&$field.key, *v),
            FieldValue::Float(v) => $builder.field(&$field.key, *v),
            FieldValue::Bool(v) => $builder.field(&$field.key, *v),
            FieldValue::String(v) => $builder.field(&$field.key, v.as_str()),
        }
    };
}

impl Serializer for InfluxSerializer {
    fn serialize(&self, metric: &Metric) -> SerializeResult<Vec<u8>> {
        let mut fields: Vec<&Field> = metric.fields().iter().collect();
        if self.sort_fields {
            fields.sort_by(|a, b| a.key.cmp(&b.key));
        }
        if let Some(bad) = fields
            .iter()
            .find(|f| matches!(f.value, FieldValue::Float(v) if !v.is_finite()))
        {
            return Err(SerializeError::UnsupportedValue {
                metric: metric.name().to_string(),
                field: bad.key.to_string(),
                reason: format!("non-finite float {}", bad.value),
            });
        }

        let mut fields = fields.into_iter();
        let Some(first) = fields.next() else {
            return Err(SerializeError::NoFields {
                metric: metric.name().to_string(),
            });
        };

        let mut line = LineProtocolBuilder::new().measurement(metric.name());
        for tag in metric.tags().iter() {
            line = line.tag(&tag.key, &tag.value);
        }
        let mut line = put_field!(line, first);
        for field in fields {
            line = put_field!(line, field);
        }

        Ok(line
            .timestamp(metric.timestamp().as_nanos())
            .close_line()
            .build())
    }
}
