// ============================================================================
// SECTION 4: DELIVERY TRACKING
// ============================================================================
// A tracked metric holds a reference-counted handle. Every copy made during
// fan-out adds a reference; each copy is settled exactly once, either
// explicitly (ack / reject) or implicitly when it is dropped. When the last
// reference settles the tracker receives a single `DeliveryInfo`.
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

static NEXT_TRACKING_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier handed back by `Accumulator::add_tracking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TrackingId(u64);

impl TrackingId {
    fn next() -> Self {
        Self(NEXT_TRACKING_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trk-{}", self.0)
    }
}

/// Final outcome of a tracked metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub id: TrackingId,
    /// True when no copy was rejected.
    pub delivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// Dropped without delivery attempt (filtered, consumed by a processor)
    Dropped,
    Accepted,
    Rejected,
}

struct TrackingState {
    id: TrackingId,
    pending: AtomicUsize,
    rejected: AtomicBool,
    notify: flume::Sender<DeliveryInfo>,
}

impl TrackingState {
    fn settle(&self, outcome: Settlement) {
        if outcome == Settlement::Rejected {
            self.rejected.store(true, Ordering::Release);
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let info = DeliveryInfo {
                id: self.id,
                delivered: !self.rejected.load(Ordering::Acquire),
            };
            // Receiver gone means nobody waits for the outcome.
            let _ = self.notify.send(info);
        }
    }
}

/// One outstanding copy of a tracked metric.
pub struct TrackingRef {
    state: Arc<TrackingState>,
    outcome: Settlement,
}

impl TrackingRef {
    pub fn id(&self) -> TrackingId {
        self.state.id
    }

    /// Record how this copy ends; the settlement happens on drop.
    pub(crate) fn settle_as(&mut self, outcome: Settlement) {
        self.outcome = outcome;
    }
}

impl Clone for TrackingRef {
    fn clone(&self) -> Self {
        self.state.pending.fetch_add(1, Ordering::Relaxed);
        Self {
            state: Arc::clone(&self.state),
            outcome: Settlement::Dropped,
        }
    }
}

impl Drop for TrackingRef {
    fn drop(&mut self) {
        self.state.settle(self.outcome);
    }
}

impl fmt::Debug for TrackingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingRef")
            .field("id", &self.state.id)
            .field("pending", &self.state.pending.load(Ordering::Relaxed))
            .finish()
    }
}

/// Source of tracking references and sink of delivery notifications.
#[derive(Clone)]
pub struct DeliveryTracker {
    tx: flume::Sender<DeliveryInfo>,
    rx: flume::Receiver<DeliveryInfo>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn track(&self) -> TrackingRef {
        TrackingRef {
            state: Arc::new(TrackingState {
                id: TrackingId::next(),
                pending: AtomicUsize::new(1),
                rejected: AtomicBool::new(false),
                notify: self.tx.clone(),
            }),
            outcome: Settlement::Dropped,
        }
    }

    /// Wait for the next settled metric.
    pub async fn delivered(&self) -> Option<DeliveryInfo> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_delivered(&self) -> Option<DeliveryInfo> {
        self.rx.try_recv().ok()
    }

    /// All notifications available right now.
    pub fn drain(&self) -> Vec<DeliveryInfo> {
        self.rx.try_iter().collect()
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryTracker")
            .field("queued", &self.rx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_copy_accepted() {
        let tracker = DeliveryTracker::new();
        let mut r = tracker.track();
        let id = r.id();
        r.settle_as(Settlement::Accepted);
        drop(r);

        let info = tracker.try_delivered().unwrap();
        assert_eq!(info, DeliveryInfo { id, delivered: true });
        assert!(tracker.try_delivered().is_none());
    }

    #[test]
    fn test_notifies_once_after_all_copies() {
        let tracker = DeliveryTracker::new();
        let mut a = tracker.track();
        let mut b = a.clone();
        let c = a.clone();

        a.settle_as(Settlement::Accepted);
        drop(a);
        assert!(tracker.try_delivered().is_none());

        b.settle_as(Settlement::Accepted);
        drop(b);
        assert!(tracker.try_delivered().is_none());

        drop(c);
        let info = tracker.try_delivered().unwrap();
        assert!(info.delivered);
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn test_any_rejection_marks_undelivered() {
        let tracker = DeliveryTracker::new();
        let mut a = tracker.track();
        let mut b = a.clone();
        a.settle_as(Settlement::Accepted);
        b.settle_as(Settlement::Rejected);
        drop(a);
        drop(b);

        assert!(!tracker.try_delivered().unwrap().delivered);
    }

    #[test]
    fn test_ids_are_unique() {
        let tracker = DeliveryTracker::new();
        let a = tracker.track();
        let b = tracker.track();
        assert_ne!(a.id(), b.id());
    }
}
