// ============================================================================
// SECTION 8: OUTPUT BUFFER & BACKPRESSURE
// ============================================================================
// Every output owns one bounded buffer. Producers never block on it: when the
// buffer is full the overflow policy decides which metric is dropped, and the
// drop is counted. The flush loop checks batches out of the head, then either
// acks them (delivered) or rejects them (requeued at the head or dropped).
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::metric::Metric;

// ----------------------------------------------------------------------------
// 8.1 Overflow Policy
// ----------------------------------------------------------------------------

/// What to drop when a metric arrives at a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest pending metric to make room
    #[default]
    DropOldest,
    /// Refuse the incoming metric
    DropNewest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::DropOldest => write!(f, "drop_oldest"),
            OverflowPolicy::DropNewest => write!(f, "drop_newest"),
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 Buffer Statistics
// ----------------------------------------------------------------------------

/// Counters of one buffer.
#[derive(Debug, Default)]
pub struct BufferStats {
    /// Metrics stored
    pub accepted: AtomicU64,
    /// Metrics lost to overflow
    pub dropped: AtomicU64,
    /// Metrics delivered
    pub acked: AtomicU64,
    /// Metrics dropped after a failed delivery
    pub rejected: AtomicU64,
    /// Current pending depth
    pub depth: AtomicUsize,
    /// Max depth seen
    pub high_water_mark: AtomicUsize,
}

impl BufferStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_drop(&self, count: usize) {
        if count > 0 {
            self.dropped.fetch_add(count as u64, AtomicOrdering::Relaxed);
        }
    }

    fn update_depth(&self, depth: usize) {
        self.depth.store(depth, AtomicOrdering::Relaxed);

        let mut hwm = self.high_water_mark.load(AtomicOrdering::Relaxed);
        while depth > hwm {
            match self.high_water_mark.compare_exchange_weak(
                hwm,
                depth,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(h) => hwm = h,
            }
        }
    }

    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            accepted: self.accepted.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
            acked: self.acked.load(AtomicOrdering::Relaxed),
            rejected: self.rejected.load(AtomicOrdering::Relaxed),
            depth: self.depth.load(AtomicOrdering::Relaxed),
            high_water_mark: self.high_water_mark.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStatsSnapshot {
    pub accepted: u64,
    pub dropped: u64,
    pub acked: u64,
    pub rejected: u64,
    pub depth: usize,
    pub high_water_mark: usize,
}

// ----------------------------------------------------------------------------
// 8.3 Batch
// ----------------------------------------------------------------------------

/// Metrics checked out of a buffer for one delivery attempt.
///
/// A batch has to be handed back through [`Buffer::ack`] or
/// [`Buffer::reject`]; it cannot be cloned.
#[derive(Debug)]
pub struct Batch {
    id: u64,
    metrics: Vec<Metric>,
}

impl Batch {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 8.4 Buffer Trait
// ----------------------------------------------------------------------------

/// Bounded per-output holding area.
///
/// All methods take `&self` and are safe to call concurrently; producers call
/// `accept` while the output's flush loop checks batches out.
pub trait Buffer: Send + Sync + fmt::Debug {
    /// Insert at the tail. Returns how many metrics overflow dropped.
    fn accept(&self, metric: Metric) -> usize;

    fn accept_all(&self, metrics: Vec<Metric>) -> usize {
        metrics.into_iter().map(|m| self.accept(m)).sum()
    }

    /// Move up to `max` metrics from the head into flight. Never blocks.
    fn flush_batch(&self, max: usize) -> Batch;

    /// Batch delivered; forget it.
    fn ack(&self, batch: Batch);

    /// Batch failed. With `requeue` it goes back to the head in order,
    /// otherwise it is dropped. Returns how many metrics were lost.
    fn reject(&self, batch: Batch, requeue: bool) -> usize;

    /// Pending metrics (in-flight excluded)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metrics currently checked out
    fn in_flight(&self) -> usize;

    fn capacity(&self) -> usize;

    fn policy(&self) -> OverflowPolicy;

    fn stats(&self) -> BufferStatsSnapshot;
}

// ----------------------------------------------------------------------------
// 8.5 In-Memory Buffer
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    pending: VecDeque<Metric>,
    in_flight: AHashMap<u64, usize>,
    in_flight_total: usize,
    next_batch_id: u64,
}

/// `VecDeque` buffer behind a mutex.
pub struct MemoryBuffer {
    name: CompactString,
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner>,
    stats: BufferStats,
}

impl MemoryBuffer {
    pub fn new(name: impl Into<CompactString>, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            policy,
            inner: Mutex::new(Inner {
                pending: VecDeque::with_capacity(capacity.min(4096)),
                ..Inner::default()
            }),
            stats: BufferStats::new(),
        }
    }

    fn settle_dropped(&self, dropped: Vec<Metric>) -> usize {
        let count = dropped.len();
        self.stats.record_drop(count);
        for metric in dropped {
            metric.reject();
        }
        count
    }

    fn checked_in(inner: &mut Inner, batch: &Batch) {
        if let Some(n) = inner.in_flight.remove(&batch.id) {
            inner.in_flight_total -= n;
        }
    }
}

impl Buffer for MemoryBuffer {
    fn accept(&self, metric: Metric) -> usize {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = if inner.pending.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let oldest = inner.pending.pop_front();
                        inner.pending.push_back(metric);
                        oldest
                    }
                    OverflowPolicy::DropNewest => Some(metric),
                }
            } else {
                inner.pending.push_back(metric);
                None
            };
            self.stats.update_depth(inner.pending.len());
            evicted
        };

        match evicted {
            Some(m) => {
                if self.policy == OverflowPolicy::DropOldest {
                    self.stats.accepted.fetch_add(1, AtomicOrdering::Relaxed);
                }
                trace!(target: "conduit::buffer", buffer = %self.name, policy = %self.policy, "Buffer full, dropped metric");
                self.settle_dropped(vec![m])
            }
            None => {
                self.stats.accepted.fetch_add(1, AtomicOrdering::Relaxed);
                0
            }
        }
    }

    fn flush_batch(&self, max: usize) -> Batch {
        let mut inner = self.inner.lock();
        let n = max.min(inner.pending.len());
        let metrics: Vec<Metric> = inner.pending.drain(..n).collect();

        let id = inner.next_batch_id;
        inner.next_batch_id = inner.next_batch_id.wrapping_add(1);
        if n > 0 {
            inner.in_flight.insert(id, n);
            inner.in_flight_total += n;
        }
        self.stats.update_depth(inner.pending.len());

        Batch { id, metrics }
    }

    fn ack(&self, batch: Batch) {
        {
            let mut inner = self.inner.lock();
            Self::checked_in(&mut inner, &batch);
        }
        self.stats
            .acked
            .fetch_add(batch.metrics.len() as u64, AtomicOrdering::Relaxed);
        for metric in batch.metrics {
            metric.accept();
        }
    }

    fn reject(&self, batch: Batch, requeue: bool) -> usize {
        if !requeue {
            {
                let mut inner = self.inner.lock();
                Self::checked_in(&mut inner, &batch);
            }
            let n = batch.metrics.len();
            self.stats.rejected.fetch_add(n as u64, AtomicOrdering::Relaxed);
            for metric in batch.metrics {
                metric.reject();
            }
            return n;
        }

        let overflow = {
            let mut inner = self.inner.lock();
            Self::checked_in(&mut inner, &batch);

            for metric in batch.metrics.into_iter().rev() {
                inner.pending.push_front(metric);
            }

            let excess = inner.pending.len().saturating_sub(self.capacity);
            let overflow: Vec<Metric> = match self.policy {
                OverflowPolicy::DropOldest => inner.pending.drain(..excess).collect(),
                OverflowPolicy::DropNewest => {
                    let keep = inner.pending.len() - excess;
                    inner.pending.drain(keep..).collect()
                }
            };
            self.stats.update_depth(inner.pending.len());
            overflow
        };

        self.settle_dropped(overflow)
    }

    fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn in_flight(&self) -> usize {
        self.inner.lock().in_flight_total
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    fn stats(&self) -> BufferStatsSnapshot {
        self.stats.snapshot()
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("pending", &inner.pending.len())
            .field("in_flight", &inner.in_flight_total)
            .finish()
    }
}
