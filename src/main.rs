// ============================================================================
// SECTION 18: CLI & MAIN ENTRY POINT
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conduit::config::AgentConfig;
use conduit::logging::init_logging;
use conduit::error::AgentError;
use conduit::{Agent, PluginRegistry, AGENT_NAME, AGENT_VERSION};

// ----------------------------------------------------------------------------
// 18.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Conduit CLI
#[derive(Parser, Debug)]
#[command(
    name = "conduit",
    version,
    about = "Metric pipeline agent",
    long_about = "Conduit collects metrics from pluggable inputs on a schedule, runs them \
                  through processors and aggregators and delivers them to every output \
                  through bounded, independently retried buffers."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "conduit.toml", env = "CONDUIT_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CONDUIT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "CONDUIT_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent (default)
    Run,

    /// Validate the configuration file and the plugins it names
    Validate {
        /// Print the parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print a default configuration
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the built-in plugins
    Plugins,
}

// ----------------------------------------------------------------------------
// 18.2 Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, registry: &PluginRegistry, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = AgentConfig::load(config_path)
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

    if verbose {
        println!("\nParsed configuration:");
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
    }

    let summary = (
        config.inputs.len(),
        config.processors.len(),
        config.aggregators.len(),
        config.outputs.len(),
    );
    // Building instantiates every plugin, so bad options surface here too.
    Agent::new(config, registry).context("Failed to build plugins")?;

    println!("Configuration is valid");
    println!("  inputs:      {}", summary.0);
    println!("  processors:  {}", summary.1);
    println!("  aggregators: {}", summary.2);
    println!("  outputs:     {}", summary.3);
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = AgentConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_plugins(registry: &PluginRegistry) {
    for info in registry.list() {
        println!("{:<11} {:<10} {}", info.kind.as_str(), info.name, info.description);
    }
}

fn log_failure(e: AgentError) -> AgentError {
    error!(target: "conduit::agent", category = e.category(), error = %e, "Agent failed");
    e
}

/// Cancel `token` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> AnyhowResult<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to install SIGINT handler")?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!(target: "conduit::agent", "Received SIGTERM"),
                _ = sigint.recv() => info!(target: "conduit::agent", "Received SIGINT"),
            }
            token.cancel();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!(target: "conduit::agent", "Received Ctrl-C");
        }
        token.cancel();
    });

    Ok(())
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();
    let registry = PluginRegistry::builtin().context("Failed to register built-in plugins")?;

    match &cli.command {
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, &registry, *verbose),
        Some(Commands::Plugins) => {
            handle_plugins(&registry);
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _log_guard = init_logging(&logging_config)?;

    info!(target: "conduit::agent", config = %cli.config.display(), "{} v{}", AGENT_NAME, AGENT_VERSION);

    let agent = Agent::new(config, &registry)
        .map_err(log_failure)
        .context("Failed to build agent")?;

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    let report = agent.run(token).await.map_err(log_failure).context("Agent failed")?;
    if report.undelivered > 0 {
        warn!(target: "conduit::agent", undelivered = report.undelivered, "Metrics lost at shutdown");
    }
    info!(
        target: "conduit::agent",
        uptime = %humantime::format_duration(report.uptime),
        gathered = report.metrics_gathered(),
        written = report.metrics_written(),
        "Exiting"
    );
    Ok(())
}
