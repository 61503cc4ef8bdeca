//! Server counters.
//!
//! Tracked with relaxed atomics so the intent path never takes a lock for
//! bookkeeping. Read through [`StatsCounters::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub intents_applied: u64,
    /// Update/Delete intents whose target no longer existed.
    pub intents_dropped: u64,
    pub protocol_violations: u64,
    pub notifications_delivered: u64,
    pub recipients_dropped: u64,
}

#[derive(Debug, Default)]
pub struct StatsCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    intents_applied: AtomicU64,
    intents_dropped: AtomicU64,
    protocol_violations: AtomicU64,
    notifications_delivered: AtomicU64,
    recipients_dropped: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        // Saturating: a close without a matching open must not wrap.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn intent_applied(&self) {
        self.intents_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn intent_dropped(&self) {
        self.intents_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fanned_out(&self, delivered: usize, dropped: usize) {
        self.notifications_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.recipients_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            intents_applied: self.intents_applied.load(Ordering::Relaxed),
            intents_dropped: self.intents_dropped.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            recipients_dropped: self.recipients_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_snapshot_is_zero() {
        assert_eq!(StatsCounters::new().snapshot(), ServerStats::default());
    }

    #[test]
    fn test_connection_counts() {
        let stats = StatsCounters::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 1);
    }

    #[test]
    fn test_close_without_open_saturates() {
        let stats = StatsCounters::new();
        stats.connection_closed();
        assert_eq!(stats.snapshot().active_connections, 0);
    }

    #[test]
    fn test_fan_out_counts() {
        let stats = StatsCounters::new();
        stats.fanned_out(3, 1);
        stats.fanned_out(2, 0);

        let snap = stats.snapshot();
        assert_eq!(snap.notifications_delivered, 5);
        assert_eq!(snap.recipients_dropped, 1);
    }
}
