// ============================================================================
// SECTION 7: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`. Every subsystem logs under its own
// target (`conduit::scheduler`, `conduit::output`, ...) so operators can tune
// verbosity per component with RUST_LOG.
// ============================================================================

use std::time::Duration;

use tokio::time::Instant;
use tracing::level_filters::LevelFilter;
use tracing::{info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{AgentError, AgentResult};

// ----------------------------------------------------------------------------
// 7.1 Logger Initialization
// ----------------------------------------------------------------------------

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the global subscriber.
///
/// The returned guard flushes the log file writer when dropped; keep it alive
/// for the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> AgentResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
    };
    layers.push(console);

    let mut guard = None;
    if let Some(path) = &config.file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path.file_name().ok_or_else(|| {
            AgentError::Internal(format!("log file path {} has no file name", path.display()))
        })?;

        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
        );
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| AgentError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "conduit::init",
        level = %config.level,
        format = ?config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

// ----------------------------------------------------------------------------
// 7.2 Performance Timing
// ----------------------------------------------------------------------------

/// Times one operation; warns when it runs past an optional threshold.
///
/// Uses the tokio clock so durations follow paused time in tests.
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold: Option<Duration>,
}

impl PerfTimer {
    /// Start a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold: None,
        }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold: Duration) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold: Some(threshold),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();

        if let Some(threshold) = self.threshold {
            if elapsed > threshold {
                warn!(
                    target: "conduit::perf",
                    operation = self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "conduit::perf",
            operation = self.name,
            elapsed_us = elapsed.as_micros() as u64,
            "Operation completed"
        );

        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_parsing() {
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("bogus"), LevelFilter::INFO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_perf_timer_follows_tokio_clock() {
        let timer = PerfTimer::with_threshold("gather", Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(timer.stop(), Duration::from_millis(250));
    }
}
