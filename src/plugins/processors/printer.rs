//! Prints every metric passing through, leaving it untouched.

use std::io::{self, Write};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::config::PluginOptions;
use crate::error::ConfigResult;
use crate::metric::Metric;
use crate::plugin::{Processor, Serializer};
use crate::registry::BuildContext;

fn default_format() -> String {
    "influx".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrinterOptions {
    #[serde(default = "default_format")]
    pub data_format: String,
    /// Options handed to the serializer
    #[serde(default)]
    pub serializer: toml::Table,
}

pub struct Printer<W: Write + Send = io::Stdout> {
    serializer: Arc<dyn Serializer>,
    out: W,
}

impl Printer {
    pub fn build(options: &PluginOptions, ctx: &BuildContext<'_>) -> ConfigResult<Box<dyn Processor>> {
        let options: PrinterOptions = options.deserialize("printer")?;
        let serializer = ctx
            .registry
            .serializer(&options.data_format, &PluginOptions::from_table(options.serializer))?;
        Ok(Box::new(Printer::with_writer(serializer, io::stdout())))
    }
}

impl<W: Write + Send> Printer<W> {
    pub fn with_writer(serializer: Arc<dyn Serializer>, out: W) -> Self {
        Self { serializer, out }
    }
}

impl<W: Write + Send> Processor for Printer<W> {
    fn description(&self) -> &str {
        "Print all metrics that pass through this filter"
    }

    fn apply(&mut self, metrics: Vec<Metric>) -> Vec<Metric> {
        for metric in &metrics {
            match self.serializer.serialize(metric) {
                Ok(bytes) => {
                    if let Err(e) = self.out.write_all(&bytes) {
                        debug!(target: "conduit::processor", error = %e, "Printer write failed");
                    }
                }
                Err(e) => debug!(target: "conduit::processor", metric = metric.name(), error = %e, "Cannot print metric"),
            }
        }
        metrics
    }
}
