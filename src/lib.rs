//! # Conduit - Metric Pipeline Agent
//!
//! A long-running agent that collects metrics from pluggable inputs, runs them
//! through an ordered processor/aggregator chain and delivers them to one or
//! more outputs through bounded, independently retried buffers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               CONDUIT AGENT                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SCHEDULER → INPUT.gather(ACCUMULATOR) → PROCESSORS → AGGREGATORS           │
//! │        → per-output BUFFER → FLUSH (batch → SERIALIZER → OUTPUT.write)      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Bounded memory**: every output buffer has a hard capacity and an
//!   overflow policy; producers never block on a slow output.
//! - **Ordered delivery**: FIFO per buffer, failed batches re-enter at the head.
//! - **Isolation**: a slow or failing input/output never stalls the others.
//! - **Graceful shutdown**: in-flight gathers finish, buffers get a final drain.

// ============================================================================
// SECTION 1: MODULES
// ============================================================================

#![warn(rust_2018_idioms)]

pub mod accumulator;
pub mod agent;
pub mod backoff;
pub mod buffer;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod metric;
pub mod output;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod tracking;

pub use accumulator::{Accumulator, CycleReport, MetricSink};
pub use agent::{Agent, AgentReport};
pub use buffer::{Batch, Buffer, MemoryBuffer, OverflowPolicy};
pub use config::AgentConfig;
pub use error::{
    AgentError, AgentResult, ConfigError, InputError, OutputError, ParseError, SerializeError,
};
pub use metric::{FieldValue, Metric, MetricKind, Timestamp};
pub use output::{FlushOutcome, RunningOutput};
pub use plugin::{Aggregator, Input, Output, Parser, Processor, Serializer};
pub use registry::{PluginRegistry, RegistryBuilder};
pub use tracking::{DeliveryInfo, DeliveryTracker, TrackingId};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults applied when the configuration leaves a knob unset. Every one of
// them can be overridden per agent and most per plugin.
// ============================================================================

use std::time::Duration;

/// Agent version - follows semantic versioning
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_NAME: &str = "conduit";

// ----------------------------------------------------------------------------
// Collection
// ----------------------------------------------------------------------------

/// Default collection interval for every input
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Smallest interval accepted from configuration
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

// ----------------------------------------------------------------------------
// Delivery
// ----------------------------------------------------------------------------

/// Default flush interval for every output
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum metrics sent to an output in one write
pub const DEFAULT_METRIC_BATCH_SIZE: usize = 1000;

/// Maximum metrics held in an output buffer before overflow drops kick in
pub const DEFAULT_METRIC_BUFFER_LIMIT: usize = 10_000;

/// First delay applied after a retryable write failure
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Backoff ceiling
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Growth factor between consecutive backoff delays
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Write attempts per batch during the final drain at shutdown
pub const DEFAULT_FINAL_FLUSH_RETRIES: u32 = 3;

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

/// Upper bound on the whole shutdown sequence
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default aggregation period
pub const DEFAULT_AGGREGATOR_PERIOD: Duration = Duration::from_secs(30);

// ----------------------------------------------------------------------------
// Limits
// ----------------------------------------------------------------------------

/// Maximum metric name length
pub const MAX_METRIC_NAME_LENGTH: usize = 256;

/// Maximum tag key length
pub const MAX_TAG_KEY_LENGTH: usize = 128;

/// Maximum tag value length
pub const MAX_TAG_VALUE_LENGTH: usize = 512;

/// Detect the local hostname the way the rest of the agent reports it.
pub fn detect_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}
