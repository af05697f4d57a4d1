// ============================================================================
// SECTION 6: CONFIGURATION SYSTEM
// ============================================================================
// TOML file merged with `CONDUIT_`-prefixed environment variables. Agent-wide
// defaults live in `[agent]`; every plugin table may override the knobs that
// apply to it and carries its own free-form `options` table.
// ============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::buffer::OverflowPolicy;
use crate::error::{ConfigError, ConfigResult};
use crate::{
    DEFAULT_AGGREGATOR_PERIOD, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_FINAL_FLUSH_RETRIES,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_INITIAL_BACKOFF, DEFAULT_INTERVAL, DEFAULT_MAX_BACKOFF,
    DEFAULT_METRIC_BATCH_SIZE, DEFAULT_METRIC_BUFFER_LIMIT, DEFAULT_SHUTDOWN_TIMEOUT,
    MAX_TAG_KEY_LENGTH, MAX_TAG_VALUE_LENGTH, MIN_INTERVAL,
};

// ----------------------------------------------------------------------------
// 6.1 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSettings,

    /// Tags added to every metric unless the metric or its input sets the key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global_tags: BTreeMap<String, String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub inputs: Vec<InputConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processors: Vec<ProcessorConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregators: Vec<AggregatorConfig>,

    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CONDUIT_").split("__"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(toml_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges and cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        self.agent.validate()?;
        check_interval("agent.interval", self.agent.interval)?;

        if self.agent.flush_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "agent.flush_interval",
                "flush interval must be greater than zero",
            ));
        }

        if self.agent.metric_buffer_limit < self.agent.metric_batch_size {
            return Err(ConfigError::invalid_value(
                "agent.metric_buffer_limit",
                format!(
                    "buffer limit {} is smaller than batch size {}",
                    self.agent.metric_buffer_limit, self.agent.metric_batch_size
                ),
            ));
        }

        check_tags("global_tags", &self.global_tags)?;

        if self.inputs.is_empty() {
            return Err(ConfigError::missing_field("inputs"));
        }
        if self.outputs.is_empty() {
            return Err(ConfigError::missing_field("outputs"));
        }

        for (i, input) in self.inputs.iter().enumerate() {
            input.validate()?;
            if let Some(interval) = input.interval {
                check_interval(&format!("inputs[{}].interval", i), interval)?;
            }
            if input.timeout.is_some_and(|t| t.is_zero()) {
                return Err(ConfigError::invalid_value(
                    format!("inputs[{}].timeout", i),
                    "timeout must be greater than zero",
                ));
            }
            check_tags(&format!("inputs[{}].tags", i), &input.tags)?;
        }

        for (i, aggregator) in self.aggregators.iter().enumerate() {
            aggregator.validate()?;
            if aggregator.period.is_zero() {
                return Err(ConfigError::invalid_value(
                    format!("aggregators[{}].period", i),
                    "period must be greater than zero",
                ));
            }
        }

        for (i, output) in self.outputs.iter().enumerate() {
            output.validate()?;
            let field = |name: &str| format!("outputs[{}].{}", i, name);

            if output.flush_interval.is_some_and(|d| d.is_zero()) {
                return Err(ConfigError::invalid_value(
                    field("flush_interval"),
                    "flush interval must be greater than zero",
                ));
            }

            let batch = output.metric_batch_size.unwrap_or(self.agent.metric_batch_size);
            let limit = output
                .metric_buffer_limit
                .unwrap_or(self.agent.metric_buffer_limit);
            if limit < batch {
                return Err(ConfigError::invalid_value(
                    field("metric_buffer_limit"),
                    format!("buffer limit {} is smaller than batch size {}", limit, batch),
                ));
            }

            if output.retry.initial_backoff > output.retry.max_backoff {
                return Err(ConfigError::invalid_value(
                    field("retry.initial_backoff"),
                    "initial backoff exceeds max backoff",
                ));
            }
        }

        check_unique_aliases("inputs", self.inputs.iter().map(|p| p.display_name()))?;
        check_unique_aliases("outputs", self.outputs.iter().map(|p| p.display_name()))?;

        Ok(())
    }

    /// Render a runnable starting configuration
    pub fn generate_default_config() -> String {
        let config = Self {
            inputs: vec![InputConfig::new("internal")],
            outputs: vec![OutputConfig::new("stdout")],
            ..Self::default()
        };
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn check_interval(field: &str, interval: Duration) -> ConfigResult<()> {
    if interval < MIN_INTERVAL {
        return Err(ConfigError::invalid_value(
            field,
            format!(
                "interval must be at least {}",
                humantime::format_duration(MIN_INTERVAL)
            ),
        ));
    }
    Ok(())
}

fn check_tags(field: &str, tags: &BTreeMap<String, String>) -> ConfigResult<()> {
    for (key, value) in tags {
        if key.is_empty() || key.len() > MAX_TAG_KEY_LENGTH {
            return Err(ConfigError::invalid_value(
                field,
                format!("tag key '{}' must be 1..={} bytes", key, MAX_TAG_KEY_LENGTH),
            ));
        }
        if value.len() > MAX_TAG_VALUE_LENGTH {
            return Err(ConfigError::invalid_value(
                field,
                format!("tag '{}' value exceeds {} bytes", key, MAX_TAG_VALUE_LENGTH),
            ));
        }
    }
    Ok(())
}

fn check_unique_aliases<'a>(
    section: &str,
    names: impl Iterator<Item = &'a str>,
) -> ConfigResult<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::invalid_value(
                section,
                format!("'{}' is configured twice; set a distinct alias", name),
            ));
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Agent Settings
// ----------------------------------------------------------------------------

/// Agent-wide defaults
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AgentSettings {
    /// Default collection interval for every input
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Align collection ticks to multiples of the interval
    #[serde(default = "default_true")]
    pub round_interval: bool,

    /// Upper bound of the random delay added before each collection
    #[serde(default, with = "humantime_serde")]
    pub collection_jitter: Duration,

    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    #[serde(default, with = "humantime_serde")]
    pub flush_jitter: Duration,

    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub metric_batch_size: usize,

    #[serde(default = "default_buffer_limit")]
    #[validate(range(min = 1))]
    pub metric_buffer_limit: usize,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Timestamp precision; zero keeps nanoseconds
    #[serde(default, with = "humantime_serde")]
    pub precision: Duration,

    /// Overrides the detected hostname for the `host` tag
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(default)]
    pub omit_hostname: bool,

    /// Bound on the whole shutdown sequence
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Write attempts per batch during the final drain
    #[serde(default = "default_final_flush_retries")]
    #[validate(range(min = 1))]
    pub final_flush_retries: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            round_interval: true,
            collection_jitter: Duration::ZERO,
            flush_interval: default_flush_interval(),
            flush_jitter: Duration::ZERO,
            metric_batch_size: default_batch_size(),
            metric_buffer_limit: default_buffer_limit(),
            overflow_policy: OverflowPolicy::default(),
            precision: Duration::ZERO,
            hostname: String::new(),
            omit_hostname: false,
            shutdown_timeout: default_shutdown_timeout(),
            final_flush_retries: default_final_flush_retries(),
        }
    }
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_flush_interval() -> Duration {
    DEFAULT_FLUSH_INTERVAL
}

fn default_batch_size() -> usize {
    DEFAULT_METRIC_BATCH_SIZE
}

fn default_buffer_limit() -> usize {
    DEFAULT_METRIC_BUFFER_LIMIT
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

fn default_final_flush_retries() -> u32 {
    DEFAULT_FINAL_FLUSH_RETRIES
}

fn default_aggregator_period() -> Duration {
    DEFAULT_AGGREGATOR_PERIOD
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 6.3 Plugin Options & Filters
// ----------------------------------------------------------------------------

/// Free-form per-plugin options, decoded by the plugin constructor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginOptions(toml::Table);

impl PluginOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: toml::Table) -> Self {
        Self(table)
    }

    /// Parse options from a TOML snippet
    pub fn parse(s: &str) -> ConfigResult<Self> {
        toml::from_str(s)
            .map(Self)
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })
    }

    /// Decode into the plugin's typed option struct
    pub fn deserialize<T: DeserializeOwned>(&self, plugin: &str) -> ConfigResult<T> {
        toml::Value::Table(self.0.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::invalid_options(plugin, e.to_string()))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Name/tag/field selection shared by inputs, processors, aggregators and outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Only metrics whose name matches one of these globs pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namepass: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namedrop: Vec<String>,

    /// Only metrics with a tag matching one of the globs for its key pass
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tagpass: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tagdrop: BTreeMap<String, Vec<String>>,

    /// Fields kept on a passing metric
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fieldpass: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fielddrop: Vec<String>,
}

// ----------------------------------------------------------------------------
// 6.4 Plugin Tables
// ----------------------------------------------------------------------------

/// One `[[inputs]]` table
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InputConfig {
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub plugin: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub interval: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub collection_jitter: Option<Duration>,

    /// Collection timeout; defaults to the effective interval
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_override: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_suffix: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(flatten)]
    pub filter: FilterConfig,

    #[serde(default, skip_serializing_if = "PluginOptions::is_empty")]
    pub options: PluginOptions,
}

impl InputConfig {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            alias: None,
            interval: None,
            collection_jitter: None,
            timeout: None,
            name_override: None,
            name_prefix: None,
            name_suffix: None,
            tags: BTreeMap::new(),
            filter: FilterConfig::default(),
            options: PluginOptions::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.plugin)
    }

    pub fn effective_interval(&self, agent: &AgentSettings) -> Duration {
        self.interval.unwrap_or(agent.interval)
    }

    pub fn effective_jitter(&self, agent: &AgentSettings) -> Duration {
        self.collection_jitter.unwrap_or(agent.collection_jitter)
    }

    pub fn effective_timeout(&self, agent: &AgentSettings) -> Duration {
        self.timeout.unwrap_or_else(|| self.effective_interval(agent))
    }
}

/// One `[[processors]]` table
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProcessorConfig {
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub plugin: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Position in the chain; ties keep configuration order
    #[serde(default)]
    pub order: i64,

    #[serde(flatten)]
    pub filter: FilterConfig,

    #[serde(default, skip_serializing_if = "PluginOptions::is_empty")]
    pub options: PluginOptions,
}

impl ProcessorConfig {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            alias: None,
            order: 0,
            filter: FilterConfig::default(),
            options: PluginOptions::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.plugin)
    }
}

/// One `[[aggregators]]` table
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AggregatorConfig {
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub plugin: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default = "default_aggregator_period", with = "humantime_serde")]
    pub period: Duration,

    /// Drop the original metrics instead of passing them on
    #[serde(default)]
    pub drop_original: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_override: Option<String>,

    #[serde(flatten)]
    pub filter: FilterConfig,

    #[serde(default, skip_serializing_if = "PluginOptions::is_empty")]
    pub options: PluginOptions,
}

impl AggregatorConfig {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            alias: None,
            period: default_aggregator_period(),
            drop_original: false,
            name_override: None,
            filter: FilterConfig::default(),
            options: PluginOptions::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.plugin)
    }
}

/// Retry/backoff knobs of one output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    #[serde(default = "default_backoff_multiplier")]
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,

    /// Drop a batch after this many consecutive retryable failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retries: None,
        }
    }
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_data_format() -> String {
    "influx".into()
}

/// One `[[outputs]]` table
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OutputConfig {
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub plugin: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Serializer used to encode batches
    #[serde(default = "default_data_format")]
    pub data_format: String,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub flush_interval: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub flush_jitter: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub metric_batch_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub metric_buffer_limit: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow_policy: Option<OverflowPolicy>,

    #[serde(default)]
    #[validate]
    pub retry: RetryConfig,

    #[serde(flatten)]
    pub filter: FilterConfig,

    #[serde(default, skip_serializing_if = "PluginOptions::is_empty")]
    pub options: PluginOptions,

    /// Options handed to the `data_format` serializer
    #[serde(default, skip_serializing_if = "PluginOptions::is_empty")]
    pub serializer: PluginOptions,
}

impl OutputConfig {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            alias: None,
            data_format: default_data_format(),
            flush_interval: None,
            flush_jitter: None,
            metric_batch_size: None,
            metric_buffer_limit: None,
            overflow_policy: None,
            retry: RetryConfig::default(),
            filter: FilterConfig::default(),
            options: PluginOptions::new(),
            serializer: PluginOptions::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.plugin)
    }
}

// ----------------------------------------------------------------------------
// 6.5 Logging Configuration
// ----------------------------------------------------------------------------

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
    #[default]
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Also write logs to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
        [[inputs]]
        type = "internal"

        [[outputs]]
        type = "discard"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = AgentConfig::from_str(MINIMAL).unwrap();
        assert_eq!(config.agent.interval, Duration::from_secs(10));
        assert!(config.agent.round_interval);
        assert_eq!(config.agent.metric_batch_size, 1000);
        assert_eq!(config.agent.metric_buffer_limit, 10_000);
        assert_eq!(config.agent.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.agent.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.outputs[0].data_format, "influx");
        assert_eq!(config.outputs[0].retry, RetryConfig::default());
    }

    #[test]
    fn test_full_plugin_tables() {
        let config = AgentConfig::from_str(
            r#"
            [agent]
            interval = "2s"
            flush_interval = "5s"
            omit_hostname = true

            [global_tags]
            dc = "eu-1"

            [[inputs]]
            type = "file"
            alias = "app"
            interval = "1s"
            namepass = ["app_*"]
            tags = { role = "web" }
            [inputs.tagpass]
            env = ["prod*"]
            [inputs.options]
            files = ["/tmp/metrics.lp"]

            [[outputs]]
            type = "file"
            data_format = "json"
            metric_batch_size = 10
            overflow_policy = "drop_newest"
            [outputs.retry]
            initial_backoff = "500ms"
            max_retries = 5
            [outputs.options]
            path = "/tmp/out.json"
            [outputs.serializer]
            timestamp_format = "rfc3339"
            "#,
        )
        .unwrap();

        let input = &config.inputs[0];
        assert_eq!(input.display_name(), "app");
        assert_eq!(input.effective_interval(&config.agent), Duration::from_secs(1));
        assert_eq!(input.effective_timeout(&config.agent), Duration::from_secs(1));
        assert_eq!(input.filter.namepass, vec!["app_*".to_string()]);
        assert_eq!(input.filter.tagpass["env"], vec!["prod*".to_string()]);
        assert_eq!(input.tags["role"], "web");
        assert!(!input.options.is_empty());

        let output = &config.outputs[0];
        assert_eq!(output.metric_batch_size, Some(10));
        assert_eq!(output.overflow_policy, Some(OverflowPolicy::DropNewest));
        assert_eq!(output.retry.initial_backoff, Duration::from_millis(500));
        assert_eq!(output.retry.max_retries, Some(5));
        assert_eq!(output.options.get_str("path"), Some("/tmp/out.json"));
        assert_eq!(output.serializer.get_str("timestamp_format"), Some("rfc3339"));
    }

    #[test]
    fn test_rejects_tiny_interval() {
        let err = AgentConfig::from_str(
            r#"
            [agent]
            interval = "1ms"
            [[inputs]]
            type = "internal"
            [[outputs]]
            type = "discard"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_rejects_buffer_smaller_than_batch() {
        let err = AgentConfig::from_str(
            r#"
            [[inputs]]
            type = "internal"
            [[outputs]]
            type = "discard"
            metric_batch_size = 100
            metric_buffer_limit = 10
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("smaller than batch size"));
    }

    #[test]
    fn test_requires_outputs() {
        let err = AgentConfig::from_str("[[inputs]]\ntype = \"internal\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn test_duplicate_names_need_alias() {
        let err = AgentConfig::from_str(
            r#"
            [[inputs]]
            type = "internal"
            [[inputs]]
            type = "internal"
            [[outputs]]
            type = "discard"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = AgentConfig::generate_default_config();
        let config = AgentConfig::from_str(&rendered).unwrap();
        assert_eq!(config.inputs[0].plugin, "internal");
        assert_eq!(config.outputs[0].plugin, "stdout");
        assert_eq!(config.agent.flush_interval, DEFAULT_FLUSH_INTERVAL);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.inputs.len(), 1);

        let missing = AgentConfig::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_plugin_options_deserialize() {
        #[derive(Debug, Deserialize)]
        struct Opts {
            path: String,
            #[serde(default)]
            append: bool,
        }

        let opts = PluginOptions::parse("path = \"/tmp/x\"\nappend = true").unwrap();
        let decoded: Opts = opts.deserialize("file").unwrap();
        assert_eq!(decoded.path, "/tmp/x");
        assert!(decoded.append);

        let err = PluginOptions::new().deserialize::<Opts>("file").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions { .. }));
    }
}
