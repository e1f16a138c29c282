use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counter sink shared by the acceptor, handlers, and dispatcher. The
/// stats tick snapshots it periodically; nothing here is served over the
/// network.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub handshakes_completed: AtomicU64,
    pub messages_processed: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub frames_fanned_out: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    latency_total_us: AtomicU64,
    latency_samples: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub handshakes_completed: u64,
    pub messages_processed: u64,
    pub messages_rejected: u64,
    pub frames_fanned_out: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub avg_message_latency_us: u64,
}

impl Metrics {
    /// Claim a connection slot if fewer than `max` are active. The slot is
    /// held until [`Metrics::release_connection`].
    pub fn try_claim_connection(&self, max: usize) -> bool {
        self.connections_active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if (n as usize) < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    pub fn release_connection(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.latency_total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total_us = self.latency_total_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            frames_fanned_out: self.frames_fanned_out.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            avg_message_latency_us: if samples > 0 { total_us / samples } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_respects_capacity() {
        let metrics = Metrics::default();
        assert!(metrics.try_claim_connection(2));
        assert!(metrics.try_claim_connection(2));
        assert!(!metrics.try_claim_connection(2));

        metrics.release_connection();
        assert!(metrics.try_claim_connection(2));
    }

    #[test]
    fn latency_averages() {
        let metrics = Metrics::default();
        assert_eq!(metrics.snapshot().avg_message_latency_us, 0);
        metrics.record_latency(Duration::from_micros(100));
        metrics.record_latency(Duration::from_micros(300));
        assert_eq!(metrics.snapshot().avg_message_latency_us, 200);
    }
}
