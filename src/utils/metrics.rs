//! Observability and Metrics
//!
//! Atomic transport counters. Each reactor owns one [`Metrics`] instance;
//! read it through [`Reactor::metrics`](crate::transport::reactor::Reactor::metrics).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for one reactor
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted or initiated
    pub connections_total: AtomicU64,
    /// Connections not yet torn down
    pub connections_active: AtomicU64,
    /// Connections that completed negotiation
    pub negotiations_success: AtomicU64,
    /// Connections closed with a fault reason
    pub connection_faults: AtomicU64,
    /// Frames written completely
    pub frames_sent: AtomicU64,
    /// Messages whose bytes were fully flushed
    pub messages_sent: AtomicU64,
    /// Messages decoded from the wire
    pub messages_received: AtomicU64,
    /// Total bytes written
    pub bytes_sent: AtomicU64,
    /// Total bytes read
    pub bytes_received: AtomicU64,
    /// Certified messages acknowledged by the peer
    pub messages_certified: AtomicU64,
    /// Certified retransmissions
    pub retransmissions: AtomicU64,
    /// Messages delivered to the failure channel
    pub messages_failed: AtomicU64,
    /// Received duplicates of certified messages
    pub duplicates_dropped: AtomicU64,
    /// Undecodable frames
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            negotiations_success: AtomicU64::new(0),
            connection_faults: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_certified: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, fault: bool) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        if fault {
            self.connection_faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn negotiated(&self) {
        self.negotiations_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, byte_count: usize) {
        self.bytes_sent.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, message_count: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.messages_sent
            .fetch_add(message_count as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, byte_count: usize) {
        self.bytes_received
            .fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn certified(&self) {
        self.messages_certified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retransmitted(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            negotiations_success: self.negotiations_success.load(Ordering::Relaxed),
            connection_faults: self.connection_faults.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_certified: self.messages_certified.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            negotiations_success = snapshot.negotiations_success,
            connection_faults = snapshot.connection_faults,
            frames_sent = snapshot.frames_sent,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            messages_certified = snapshot.messages_certified,
            retransmissions = snapshot.retransmissions,
            messages_failed = snapshot.messages_failed,
            duplicates_dropped = snapshot.duplicates_dropped,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub negotiations_success: u64,
    pub connection_faults: u64,
    pub frames_sent: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_certified: u64,
    pub retransmissions: u64,
    pub messages_failed: u64,
    pub duplicates_dropped: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed(false);
        metrics.connection_closed(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.connections_active, 0);
        assert_eq!(snapshot.connection_faults, 1);
    }

    #[test]
    fn test_frame_counters() {
        let metrics = Metrics::new();
        metrics.bytes_written(100);
        metrics.bytes_written(20);
        metrics.frame_sent(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_sent, 120);
        assert_eq!(snapshot.frames_sent, 1);
        assert_eq!(snapshot.messages_sent, 4);
    }
}
