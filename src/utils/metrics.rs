//! Observability counters for a client instance.
//!
//! Atomic counters, owned by the client and shared with the io task; an
//! explicit context object rather than a process-wide global.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for one CM client.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total connections established (handshake completed)
    pub connections_total: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Failed handshakes
    pub handshakes_failed: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total bytes sent (frame payloads)
    pub bytes_sent: AtomicU64,
    /// Total bytes received (frame payloads)
    pub bytes_received: AtomicU64,
    /// Jobs fulfilled by a correlated reply
    pub jobs_completed: AtomicU64,
    /// Jobs that timed out locally
    pub jobs_timed_out: AtomicU64,
    /// Events posted to the callback dispatcher
    pub events_posted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_timed_out: self.jobs_timed_out.load(Ordering::Relaxed),
            events_posted: self.events_posted.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub handshakes_total: u64,
    pub handshakes_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub jobs_completed: u64,
    pub jobs_timed_out: u64,
    pub events_posted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.messages_sent);
        Metrics::incr(&metrics.messages_sent);
        Metrics::add(&metrics.bytes_sent, 128);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 128);
        assert_eq!(snap.messages_received, 0);
    }
}
