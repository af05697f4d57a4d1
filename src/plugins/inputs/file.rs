//! Reads whole files every cycle and parses them with a configured parser.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::trace;

use crate::accumulator::Accumulator;
use crate::config::PluginOptions;
use crate::error::{ConfigError, ConfigResult, InputError, InputResult};
use crate::plugin::{Input, Parser};
use crate::registry::BuildContext;

fn default_data_format() -> String {
    "influx".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileInputOptions {
    /// Paths or glob patterns
    pub files: Vec<String>,
    #[serde(default = "default_data_format")]
    pub data_format: String,
    /// Tag every metric with the path it came from under this key
    #[serde(default)]
    pub file_tag: Option<String>,
    /// Options handed to the parser
    #[serde(default)]
    pub parser: toml::Table,
}

pub struct FileInput {
    name: String,
    patterns: Vec<String>,
    file_tag: Option<String>,
    parser: Arc<dyn Parser>,
}

impl FileInput {
    pub fn new(name: impl Into<String>, patterns: Vec<String>, file_tag: Option<String>, parser: Arc<dyn Parser>) -> Self {
        Self {
            name: name.into(),
            patterns,
            file_tag,
            parser,
        }
    }

    pub fn build(options: &PluginOptions, ctx: &BuildContext<'_>) -> ConfigResult<Box<dyn Input>> {
        let options: FileInputOptions = options.deserialize(ctx.name)?;
        if options.files.is_empty() {
            return Err(ConfigError::invalid_options(ctx.name, "at least one file is required"));
        }
        for pattern in &options.files {
            glob::Pattern::new(pattern)
                .map_err(|e| ConfigError::invalid_options(ctx.name, format!("bad pattern '{}': {}", pattern, e)))?;
        }
        let parser = ctx
            .registry
            .parser(&options.data_format, &PluginOptions::from_table(options.parser))?;
        Ok(Box::new(Self::new(ctx.name, options.files, options.file_tag, parser)))
    }

    fn resolve(&self, acc: &Accumulator) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for pattern in &self.patterns {
            match glob::glob(pattern) {
                Ok(entries) => {
                    let before = paths.len();
                    for entry in entries {
                        match entry {
                            Ok(path) => paths.push(path),
                            Err(e) => acc.add_error(InputError::collection_failed(self.name.as_str(), e.to_string())),
                        }
                    }
                    if paths.len() == before {
                        acc.add_error(InputError::collection_failed(
                            self.name.as_str(),
                            format!("no files match '{}'", pattern),
                        ));
                    }
                }
                Err(e) => acc.add_error(InputError::collection_failed(self.name.as_str(), e.to_string())),
            }
        }
        paths
    }
}

#[async_trait]
impl Input for FileInput {
    fn description(&self) -> &str {
        "Parse complete files each interval"
    }

    async fn gather(&self, acc: &Accumulator) -> InputResult<()> {
        for path in self.resolve(acc) {
            let buf = match tokio::fs::read(&path).await {
                Ok(buf) => buf,
                Err(e) => {
                    acc.add_error(InputError::collection_failed(
                        self.name.as_str(),
                        format!("{}: {}", path.display(), e),
                    ));
                    continue;
                }
            };
            let metrics = match self.parser.parse(&buf) {
                Ok(metrics) => metrics,
                Err(e) => {
                    acc.add_error(InputError::collection_failed(
                        self.name.as_str(),
                        format!("{}: {}", path.display(), e),
                    ));
                    continue;
                }
            };

            trace!(target: "conduit::input", input = %self.name, path = %path.display(), metrics = metrics.len(), "Parsed file");
            let source = path.to_string_lossy();
            for metric in metrics {
                match &self.file_tag {
                    Some(key) => acc.add(metric.with_tag(key.as_str(), &*source)),
                    None => acc.add(metric),
                }
            }
        }
        Ok(())
    }
}
