// ============================================================================
// SECTION 17: AGENT LIFECYCLE
// ============================================================================
// The agent turns a validated `AgentConfig` into running plugins and owns the
// process lifecycle:
//
//   startup:  registry → outputs (+ buffers) → router → aggregators
//             → processors → pipeline → inputs → connect outputs
//   running:  scheduler | one flush loop per output | one push loop per
//             aggregator
//   shutdown: inputs → aggregators (final push) → flush loops
//             → final drain → close
//
// `shutdown_timeout` is split in two: the first half bounds the input drain,
// the rest starts when inputs are done and bounds delivery (aggregator push,
// flush loops, final drain). A hung input cannot starve the final flush.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::{MetricDefaults, MetricSink};
use crate::buffer::{Buffer, MemoryBuffer};
use crate::config::{AgentConfig, AgentSettings};
use crate::error::AgentResult;
use crate::filter::MetricFilter;
use crate::metric::Tags;
use crate::output::{OutputSettings, RunningOutput};
use crate::pipeline::{OutputRouter, Pipeline, RunningAggregator, RunningProcessor};
use crate::registry::{BuildContext, PluginRegistry};
use crate::scheduler::{InputSchedule, RunningInput, Scheduler};
use crate::stats::{InputStatsSnapshot, OutputStatsSnapshot, StatsRegistry};
use crate::{detect_hostname, AGENT_VERSION};

/// Bound on a single output's `close` once the drain is over
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra wait on the scheduler task past its own drain bound
const SCHEDULER_SLACK: Duration = Duration::from_millis(100);

// ----------------------------------------------------------------------------
// 17.1 Report
// ----------------------------------------------------------------------------

/// What the agent did over its lifetime, returned by [`Agent::run`].
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub uptime: Duration,
    pub inputs: Vec<InputStatsSnapshot>,
    pub outputs: Vec<OutputStatsSnapshot>,
    /// Metrics written during the final drain
    pub drained: usize,
    /// Metrics still buffered when the agent gave up on them
    pub undelivered: usize,
}

impl AgentReport {
    pub fn metrics_gathered(&self) -> u64 {
        self.inputs.iter().map(|s| s.metrics_gathered).sum()
    }

    pub fn metrics_written(&self) -> u64 {
        self.outputs.iter().map(|s| s.metrics_written).sum()
    }

    pub fn metrics_dropped(&self) -> u64 {
        self.outputs.iter().map(|s| s.metrics_dropped).sum()
    }
}

// ----------------------------------------------------------------------------
// 17.2 Agent
// ----------------------------------------------------------------------------

/// Fully wired agent, ready to [`run`](Agent::run).
pub struct Agent {
    settings: AgentSettings,
    stats: Arc<StatsRegistry>,
    outputs: Vec<Arc<RunningOutput>>,
    aggregators: Vec<Arc<RunningAggregator>>,
    scheduler: Scheduler,
}

/// Agent-wide tags: `[global_tags]` plus `host` unless omitted.
///
/// An explicit `host` global tag beats both the hostname override and the
/// detected hostname.
pub fn global_tags(config: &AgentConfig) -> Tags {
    let mut tags: Tags = config
        .global_tags
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    if !config.agent.omit_hostname {
        let host = if config.agent.hostname.is_empty() {
            detect_hostname()
        } else {
            config.agent.hostname.clone()
        };
        tags.set_if_absent("host", host);
    }
    tags
}

impl Agent {
    /// Instantiate every configured plugin. Unknown plugin types and invalid
    /// options fail here, before anything runs.
    pub fn new(config: AgentConfig, registry: &PluginRegistry) -> AgentResult<Self> {
        let settings = config.agent.clone();
        let stats = Arc::new(StatsRegistry::new());
        let tags = global_tags(&config);

        // Outputs first: everything upstream routes into them.
        let mut outputs = Vec::with_capacity(config.outputs.len());
        for cfg in &config.outputs {
            let name = cfg.display_name();
            let ctx = BuildContext {
                name,
                stats: &stats,
                registry,
            };
            let output = registry.output(&cfg.plugin, &cfg.options, &ctx)?;
            let serializer = registry.serializer(&cfg.data_format, &cfg.serializer)?;
            let filter = MetricFilter::compile(&cfg.filter)?;

            let buffer: Arc<dyn Buffer> = Arc::new(MemoryBuffer::new(
                name,
                cfg.metric_buffer_limit.unwrap_or(settings.metric_buffer_limit),
                cfg.overflow_policy.unwrap_or(settings.overflow_policy),
            ));
            let output_stats = stats.register_output(name, &cfg.plugin, Arc::clone(&buffer));

            debug!(target: "conduit::agent", output = name, plugin = %cfg.plugin, format = %cfg.data_format, "Output built");
            outputs.push(Arc::new(RunningOutput::new(
                name,
                output,
                serializer,
                buffer,
                OutputSettings::resolve(cfg, &settings),
                filter,
                output_stats,
            )));
        }
        let router = Arc::new(OutputRouter::new(outputs.clone()));

        let mut aggregators = Vec::with_capacity(config.aggregators.len());
        for cfg in &config.aggregators {
            let name = cfg.display_name();
            let ctx = BuildContext {
                name,
                stats: &stats,
                registry,
            };
            let aggregator = registry.aggregator(&cfg.plugin, &cfg.options, &ctx)?;
            let defaults = MetricDefaults {
                name_override: cfg.name_override.as_deref().map(Into::into),
                global_tags: tags.clone(),
                precision: settings.precision,
                ..MetricDefaults::default()
            };
            let sink: Arc<dyn MetricSink> = router.clone();
            aggregators.push(Arc::new(RunningAggregator::new(
                name,
                cfg.period,
                cfg.drop_original,
                MetricFilter::compile(&cfg.filter)?,
                aggregator,
                defaults,
                sink,
            )));
        }

        let mut processors = Vec::with_capacity(config.processors.len());
        for cfg in &config.processors {
            let name = cfg.display_name();
            let ctx = BuildContext {
                name,
                stats: &stats,
                registry,
            };
            let processor = registry.processor(&cfg.plugin, &cfg.options, &ctx)?;
            processors.push(RunningProcessor::new(
                name,
                cfg.order,
                MetricFilter::compile(&cfg.filter)?,
                processor,
            ));
        }

        let pipeline: Arc<dyn MetricSink> = Arc::new(Pipeline::new(processors, aggregators.clone(), router));

        let mut inputs = Vec::with_capacity(config.inputs.len());
        for cfg in &config.inputs {
            let name = cfg.display_name();
            let ctx = BuildContext {
                name,
                stats: &stats,
                registry,
            };
            let input = registry.input(&cfg.plugin, &cfg.options, &ctx)?;
            let defaults = MetricDefaults::for_input(cfg, &tags, settings.precision)?;
            let schedule = InputSchedule::resolve(cfg, &settings);
            debug!(
                target: "conduit::agent",
                input = name,
                plugin = %cfg.plugin,
                interval = ?schedule.interval,
                timeout = ?schedule.timeout,
                "Input built"
            );
            let input_stats = stats.register_input(name, &cfg.plugin);
            inputs.push(Arc::new(RunningInput::new(
                name,
                Arc::from(input),
                defaults,
                Arc::clone(&pipeline),
                schedule,
                input_stats,
            )));
        }

        let (input_budget, _) = shutdown_budgets(settings.shutdown_timeout);
        let scheduler = Scheduler::new(inputs, input_budget);
        Ok(Self {
            settings,
            stats,
            outputs,
            aggregators,
            scheduler,
        })
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    pub fn outputs(&self) -> &[Arc<RunningOutput>] {
        &self.outputs
    }

    /// Run until `token` is cancelled, then shut down in order.
    ///
    /// Only a non-retryable connect failure makes this return an error.
    pub async fn run(self, token: CancellationToken) -> AgentResult<AgentReport> {
        let started = Instant::now();
        let Agent {
            settings,
            stats,
            outputs,
            aggregators,
            scheduler,
        } = self;

        info!(
            target: "conduit::agent",
            version = AGENT_VERSION,
            inputs = scheduler.inputs().len(),
            aggregators = aggregators.len(),
            outputs = outputs.len(),
            "Starting agent"
        );

        for (i, output) in outputs.iter().enumerate() {
            if let Err(e) = output.start().await {
                error!(target: "conduit::agent", output = output.name(), error = %e, "Output failed to start");
                for started in &outputs[..i] {
                    started.close().await;
                }
                return Err(e.into());
            }
        }

        let flush_token = CancellationToken::new();
        let mut flush_loops = JoinSet::new();
        for output in &outputs {
            flush_loops.spawn(Arc::clone(output).run(flush_token.clone()));
        }

        let push_token = CancellationToken::new();
        let mut push_loops = JoinSet::new();
        for aggregator in &aggregators {
            push_loops.spawn(Arc::clone(aggregator).run(push_token.clone()));
        }

        let mut collection = tokio::spawn(scheduler.run(token.clone()));

        info!(target: "conduit::agent", "Agent started");
        token.cancelled().await;

        let shutdown_started = Instant::now();
        let (input_budget, delivery_budget) = shutdown_budgets(settings.shutdown_timeout);
        info!(
            target: "conduit::agent",
            timeout = ?settings.shutdown_timeout,
            "Shutdown requested, stopping inputs"
        );

        // The scheduler bounds each in-flight gather by `input_budget`; the
        // slack covers the task wake-up after those timers fire.
        match timeout_at(shutdown_started + input_budget + SCHEDULER_SLACK, &mut collection).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "conduit::agent", error = %e, "Scheduler task failed"),
            Err(_) => {
                warn!(target: "conduit::agent", "Inputs still running at the shutdown deadline");
                collection.abort();
            }
        }

        let deadline = Instant::now() + delivery_budget;
        push_token.cancel();
        join_until(&mut push_loops, deadline, "aggregator").await;

        // A flush already writing finishes before its loop exits.
        flush_token.cancel();
        join_until(&mut flush_loops, deadline, "output").await;

        let drains = outputs.iter().map(|output| async move {
            let written = match timeout_at(deadline, output.final_flush(deadline)).await {
                Ok(n) => n,
                Err(_) => {
                    warn!(target: "conduit::agent", output = output.name(), "Final flush cut short by the shutdown deadline");
                    0
                }
            };
            let undelivered = output.discard_pending();
            if timeout(CLOSE_TIMEOUT, output.close()).await.is_err() {
                warn!(target: "conduit::agent", output = output.name(), "Close timed out");
            }
            (written, undelivered)
        });
        let (drained, undelivered) = join_all(drains)
            .await
            .into_iter()
            .fold((0, 0), |(w, u), (dw, du)| (w + dw, u + du));

        let report = AgentReport {
            uptime: started.elapsed(),
            inputs: stats.input_snapshots(),
            outputs: stats.output_snapshots(),
            drained,
            undelivered,
        };

        info!(
            target: "conduit::agent",
            gathered = report.metrics_gathered(),
            written = report.metrics_written(),
            dropped = report.metrics_dropped(),
            drained,
            undelivered,
            shutdown_ms = shutdown_started.elapsed().as_millis() as u64,
            "Agent stopped"
        );
        Ok(report)
    }
}

/// Split `shutdown_timeout` into the input drain budget and the delivery
/// budget.
fn shutdown_budgets(shutdown_timeout: Duration) -> (Duration, Duration) {
    let inputs = shutdown_timeout / 2;
    (inputs, shutdown_timeout - inputs)
}

/// Wait for every task in `tasks` until `deadline`; stragglers are detached.
async fn join_until(tasks: &mut JoinSet<()>, deadline: Instant, kind: &'static str) {
    loop {
        match timeout_at(deadline, tasks.join_next()).await {
            Ok(None) => break,
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) => warn!(target: "conduit::agent", kind, error = %e, "Task failed"),
            Err(_) => {
                warn!(
                    target: "conduit::agent",
                    kind,
                    remaining = tasks.len(),
                    "Tasks still running at the shutdown deadline"
                );
                tasks.detach_all();
                break;
            }
        }
    }
}

#[cfg(all(test, feature = "line-protocol"))]
mod tests {
    use super::*;
    use crate::accumulator::Accumulator;
    use crate::config::PluginOptions;
    use crate::error::{AgentError, ConfigError, ConfigResult, InputResult, OutputError, OutputResult};
    use crate::metric::{Metric, Timestamp};
    use crate::plugin::{Input, Output};
    use crate::registry::RegistryBuilder;
    use async_trait::async_trait;
    use std::path::Path;

    struct Counter;

    impl Counter {
        fn build(_: &PluginOptions, _: &BuildContext<'_>) -> ConfigResult<Box<dyn Input>> {
            Ok(Box::new(Counter))
        }
    }

    #[async_trait]
    impl Input for Counter {
        async fn gather(&self, acc: &Accumulator) -> InputResult<()> {
            acc.add(Metric::new("counter", Timestamp::now()).with_field("value", 1i64));
            Ok(())
        }
    }

    struct Hang;

    impl Hang {
        fn build(_: &PluginOptions, _: &BuildContext<'_>) -> ConfigResult<Box<dyn Input>> {
            Ok(Box::new(Hang))
        }
    }

    #[async_trait]
    impl Input for Hang {
        async fn gather(&self, _: &Accumulator) -> InputResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Misconfigured;

    impl Misconfigured {
        fn build(_: &PluginOptions, _: &BuildContext<'_>) -> ConfigResult<Box<dyn Output>> {
            Ok(Box::new(Misconfigured))
        }
    }

    #[async_trait]
    impl Output for Misconfigured {
        async fn connect(&mut self) -> OutputResult<()> {
            Err(OutputError::InvalidConfig {
                name: "misconfigured".into(),
                message: "no endpoint".into(),
            })
        }

        async fn write(&mut self, _: &[u8]) -> OutputResult<()> {
            Ok(())
        }
    }

    fn registry() -> PluginRegistry {
        let mut builder = RegistryBuilder::with_builtins().unwrap();
        builder.input("counter", "Emits one counter per cycle", Counter::build).unwrap();
        builder.input("hang", "Never returns from gather", Hang::build).unwrap();
        builder
            .output("misconfigured", "Always fails to connect", Misconfigured::build)
            .unwrap();
        builder.build()
    }

    fn config(out: &Path, extra: &str) -> AgentConfig {
        AgentConfig::from_str(&format!(
            r#"
            [agent]
            interval = "100ms"
            round_interval = false
            flush_interval = "100ms"
            hostname = "testhost"
            shutdown_timeout = "5s"

            [global_tags]
            dc = "eu"

            [[inputs]]
            type = "counter"

            [[outputs]]
            type = "file"
            [outputs.options]
            files = ["{}"]

            {}
            "#,
            out.display(),
            extra
        ))
        .unwrap()
    }

    async fn run_for(agent: Agent, wall: Duration) -> AgentReport {
        let token = CancellationToken::new();
        let handle = tokio::spawn(agent.run(token.clone()));
        tokio::time::sleep(wall).await;
        token.cancel();
        handle.await.unwrap().unwrap()
    }

    #[test]
    fn test_global_tags_host_rules() {
        let mut cfg = AgentConfig::default();
        cfg.agent.hostname = "override".into();
        assert_eq!(global_tags(&cfg).get("host"), Some("override"));

        cfg.global_tags.insert("host".into(), "explicit".into());
        assert_eq!(global_tags(&cfg).get("host"), Some("explicit"));

        cfg.global_tags.clear();
        cfg.agent.omit_hostname = true;
        assert!(global_tags(&cfg).get("host").is_none());
    }

    #[test]
    fn test_unknown_plugin_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir.path().join("out.lp"), "");
        cfg.inputs[0].plugin = "nope".into();

        let err = Agent::new(cfg, &registry()).err().unwrap();
        assert!(matches!(
            err,
            AgentError::Config(ConfigError::UnknownPlugin { kind: "input", .. })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_delivers_everything_gathered() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.lp");
        let agent = Agent::new(config(&out, ""), &registry()).unwrap();
        assert_eq!(agent.outputs().len(), 1);

        let report = run_for(agent, Duration::from_millis(450)).await;

        assert!(report.metrics_gathered() >= 2);
        assert_eq!(report.metrics_written(), report.metrics_gathered());
        assert_eq!(report.undelivered, 0);

        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len() as u64, report.metrics_written());
        for line in lines {
            assert!(line.starts_with("counter,"), "{}", line);
            assert!(line.contains("dc=eu"));
            assert!(line.contains("host=testhost"));
            assert!(line.contains(" value=1i "));
        }
    }

    #[tokio::test]
    async fn test_hung_input_does_not_starve_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.lp");
        let extra = r#"
            [[inputs]]
            type = "hang"
        "#;
        let mut cfg = config(&out, extra);
        cfg.agent.flush_interval = Duration::from_secs(3600);
        cfg.agent.shutdown_timeout = Duration::from_secs(1);

        let agent = Agent::new(cfg, &registry()).unwrap();
        let report = run_for(agent, Duration::from_millis(450)).await;

        assert!(report.metrics_gathered() >= 2);
        assert_eq!(report.drained as u64, report.metrics_gathered());
        assert_eq!(report.undelivered, 0);
        let text = std::fs::read_to_string(&out).unwrap();
        assert_eq!(text.lines().count() as u64, report.metrics_gathered());
    }

    #[test]
    fn test_shutdown_budget_split() {
        assert_eq!(
            shutdown_budgets(Duration::from_secs(30)),
            (Duration::from_secs(15), Duration::from_secs(15))
        );
        let (inputs, delivery) = shutdown_budgets(Duration::from_millis(1001));
        assert_eq!(inputs + delivery, Duration::from_millis(1001));
    }

    #[tokio::test]
    async fn test_aggregates_pushed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.lp");
        let extra = r#"
            [[aggregators]]
            type = "minmax"
            period = "1h"
            drop_original = true
        "#;
        let agent = Agent::new(config(&out, extra), &registry()).unwrap();
        let report = run_for(agent, Duration::from_millis(350)).await;
        assert!(report.metrics_gathered() >= 1);

        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1, "{}", text);
        assert!(lines[0].contains("value_min=1"));
        assert!(lines[0].contains("value_max=1"));
        assert!(lines[0].contains("host=testhost"));
    }

    #[tokio::test]
    async fn test_output_serializer_options_applied() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("out.json");
        let extra = format!(
            r#"
            [[outputs]]
            type = "file"
            alias = "json"
            data_format = "json"
            [outputs.options]
            files = ["{}"]
            [outputs.serializer]
            timestamp_format = "rfc3339"
            "#,
            json.display()
        );
        let agent = Agent::new(config(&dir.path().join("out.lp"), &extra), &registry()).unwrap();
        let report = run_for(agent, Duration::from_millis(250)).await;
        assert!(report.metrics_gathered() >= 1);

        let text = std::fs::read_to_string(&json).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["name"], "counter");
        assert!(first["timestamp"].as_str().unwrap().contains('T'), "{}", first);
    }

    #[test]
    fn test_unknown_serializer_option_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir.path().join("out.lp"), "");
        cfg.outputs[0].serializer = PluginOptions::parse("no_such_knob = true").unwrap();

        let err = Agent::new(cfg, &registry()).err().unwrap();
        assert!(matches!(err, AgentError::Config(ConfigError::InvalidOptions { .. })));
    }

    #[tokio::test]
    async fn test_fatal_connect_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let extra = r#"
            [[outputs]]
            type = "misconfigured"
        "#;
        let agent = Agent::new(config(&dir.path().join("out.lp"), extra), &registry()).unwrap();

        let err = agent.run(CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, AgentError::Output(OutputError::InvalidConfig { .. })));
    }
}
