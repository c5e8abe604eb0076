//! Transport layer metrics collection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Total bytes handed to carriers.
    pub bytes_sent: u64,
    /// Total bytes read from carriers.
    pub bytes_received: u64,
    /// Frames fully written or posted.
    pub frames_sent: u64,
    /// Frames fully assembled.
    pub frames_received: u64,
    /// Submits that had to wait in an outbound queue.
    pub writes_queued: u64,
    /// Submits delayed because no RDMA send credit was left.
    pub credit_stalls: u64,
    /// Connections that came up.
    pub connections_opened: u64,
    /// Connections torn down.
    pub connections_closed: u64,
    /// Connections currently up.
    pub active_connections: u32,
    /// Frames rejected for violating the wire format.
    pub protocol_errors: u64,
    /// Queued frames discarded at teardown.
    pub frames_discarded: u64,
}

/// Thread-safe transport layer metrics collector, shared by every transport
/// created from one context.
pub struct TransportMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    writes_queued: AtomicU64,
    credit_stalls: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU32,
    protocol_errors: AtomicU64,
    frames_discarded: AtomicU64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a new TransportMetrics instance with all counters initialized to zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            writes_queued: AtomicU64::new(0),
            credit_stalls: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
            protocol_errors: AtomicU64::new(0),
            frames_discarded: AtomicU64::new(0),
        }
    }

    /// Adds to the bytes sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the bytes received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the frames sent counter.
    pub fn add_frames_sent(&self, n: u64) {
        self.frames_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Increments the frames received counter.
    pub fn inc_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_writes_queued(&self) {
        self.writes_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_credit_stalls(&self) {
        self.credit_stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frames_discarded(&self, n: u64) {
        self.frames_discarded.fetch_add(n, Ordering::Relaxed);
    }

    /// Records a connection coming up.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection going down.
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Returns a snapshot of all current metric values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            writes_queued: self.writes_queued.load(Ordering::Relaxed),
            credit_stalls: self.credit_stalls.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        let m = TransportMetrics::new();
        let s = m.snapshot();
        assert_eq!(s.bytes_sent, 0);
        assert_eq!(s.active_connections, 0);
    }

    #[test]
    fn test_connection_gauge() {
        let m = TransportMetrics::new();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        let s = m.snapshot();
        assert_eq!(s.connections_opened, 2);
        assert_eq!(s.connections_closed, 1);
        assert_eq!(s.active_connections, 1);
        m.connection_closed();
        m.connection_closed();
        assert_eq!(m.snapshot().active_connections, 0);
    }

    #[test]
    fn test_counters() {
        let m = TransportMetrics::new();
        m.add_bytes_sent(100);
        m.add_bytes_received(40);
        m.add_frames_sent(1);
        m.inc_frames_received();
        m.inc_writes_queued();
        m.inc_credit_stalls();
        m.inc_protocol_errors();
        m.add_frames_discarded(3);
        let s = m.snapshot();
        assert_eq!(s.bytes_sent, 100);
        assert_eq!(s.bytes_received, 40);
        assert_eq!(s.frames_sent, 1);
        assert_eq!(s.frames_received, 1);
        assert_eq!(s.writes_queued, 1);
        assert_eq!(s.credit_stalls, 1);
        assert_eq!(s.protocol_errors, 1);
        assert_eq!(s.frames_discarded, 3);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = TransportMetrics::new();
        m.add_bytes_sent(7);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"bytes_sent\":7"));
    }
}
