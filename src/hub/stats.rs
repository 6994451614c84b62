//! Hub-wide delivery counters.
//!
//! Written only by the Hub task, read from anywhere without going through the
//! command channel.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared between the Hub task and its handles.
#[derive(Debug, Default)]
pub(crate) struct HubCounters {
    admitted: AtomicU64,
    evicted: AtomicU64,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl HubCounters {
    pub(crate) fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_broadcast(&self, delivered: usize, dropped: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> HubStats {
        let admitted = self.admitted.load(Ordering::Relaxed);
        let evicted = self.evicted.load(Ordering::Relaxed);
        HubStats {
            connected: admitted.saturating_sub(evicted),
            admitted,
            evicted,
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the Hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Clients currently registered.
    pub connected: u64,
    /// Clients ever admitted.
    pub admitted: u64,
    /// Clients removed from the registry.
    pub evicted: u64,
    /// Broadcasts processed.
    pub broadcasts: u64,
    /// Frames accepted into an outbox by broadcasts.
    pub delivered: u64,
    /// Frames dropped because an outbox was full.
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_derives_connected() {
        let counters = HubCounters::default();
        counters.record_admitted();
        counters.record_admitted();
        counters.record_evicted();
        counters.record_broadcast(3, 1);

        let stats = counters.snapshot();
        assert_eq!(stats.connected, 1);
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.broadcasts, 1);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.dropped, 1);
    }
}
