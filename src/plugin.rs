// ============================================================================
// SECTION 10: PLUGIN TRAITS
// ============================================================================
// The closed set of capabilities a plugin can provide. The engine never looks
// behind these traits: the scheduler only calls `Input::gather`, the flush
// loop only calls `Serializer` and `Output`.
// ============================================================================

use async_trait::async_trait;

use crate::accumulator::Accumulator;
use crate::error::{InputResult, OutputResult, ParseResult, SerializeResult};
use crate::metric::Metric;

// ----------------------------------------------------------------------------
// 10.1 Input
// ----------------------------------------------------------------------------

/// A metric source polled by the scheduler.
///
/// `gather` is called once per interval and never concurrently with itself
/// for the same input. It may be slow; it is never cancelled, only detected
/// as overrun. Errors are non-fatal: report partial failures through
/// [`Accumulator::add_error`] and keep going, or return an error to end the
/// cycle early. The next cycle runs normally either way.
#[async_trait]
pub trait Input: Send + Sync {
    /// Short human description, listed by `conduit plugins`
    fn description(&self) -> &str {
        ""
    }

    async fn gather(&self, acc: &Accumulator) -> InputResult<()>;
}

// ----------------------------------------------------------------------------
// 10.2 Processor & Aggregator
// ----------------------------------------------------------------------------

/// Transform stage between collection and buffering.
///
/// Takes ownership of the metrics and returns the metrics to pass on; a
/// processor drops a metric by not returning it.
pub trait Processor: Send {
    fn description(&self) -> &str {
        ""
    }

    fn apply(&mut self, metrics: Vec<Metric>) -> Vec<Metric>;
}

/// Stateful stage that folds metrics over a period and emits the result.
pub trait Aggregator: Send {
    fn description(&self) -> &str {
        ""
    }

    /// Observe one metric of the current period.
    fn add(&mut self, metric: &Metric);

    /// Emit the aggregates of the current period.
    fn push(&mut self, acc: &Accumulator);

    /// Start a new period.
    fn reset(&mut self);
}

// ----------------------------------------------------------------------------
// 10.3 Output Side
// ----------------------------------------------------------------------------

/// Encodes metrics for an output. Errors are never retried.
pub trait Serializer: Send + Sync {
    fn serialize(&self, metric: &Metric) -> SerializeResult<Vec<u8>>;

    fn serialize_batch(&self, metrics: &[Metric]) -> SerializeResult<Vec<u8>> {
        let mut out = Vec::new();
        for metric in metrics {
            out.extend(self.serialize(metric)?);
        }
        Ok(out)
    }
}

/// Decodes raw payloads into metrics.
pub trait Parser: Send + Sync {
    fn parse(&self, buf: &[u8]) -> ParseResult<Vec<Metric>>;
}

/// A delivery sink. Each output is driven by its own flush loop, so methods
/// take `&mut self` and are never called concurrently.
#[async_trait]
pub trait Output: Send {
    fn description(&self) -> &str {
        ""
    }

    /// Called once before the first write. A retryable error lets the agent
    /// start anyway; writes then fail and back off until the sink recovers.
    async fn connect(&mut self) -> OutputResult<()> {
        Ok(())
    }

    async fn write(&mut self, payload: &[u8]) -> OutputResult<()>;

    /// Called once after the final drain.
    async fn close(&mut self) -> OutputResult<()> {
        Ok(())
    }
}
