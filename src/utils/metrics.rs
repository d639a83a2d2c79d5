//! Observability and Metrics
//!
//! Counters for one stream factory: datagram traffic, session churn and
//! socket errors. Uses atomic counters so the reader and writer tasks can
//! record without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use crate::transport::session::StreamFamily;

/// Metrics collector owned by a stream factory
#[derive(Debug)]
pub struct FactoryMetrics {
    /// Datagrams read from the socket
    pub datagrams_received: AtomicU64,
    /// Bytes read from the socket
    pub bytes_received: AtomicU64,
    /// Datagrams written to the socket
    pub datagrams_sent: AtomicU64,
    /// Bytes written to the socket
    pub bytes_sent: AtomicU64,
    /// Datagrams dropped before reaching a session
    pub datagrams_dropped: AtomicU64,
    /// Datagrams a session rejected
    pub session_errors: AtomicU64,
    /// Current-protocol sessions created
    pub current_sessions_created: AtomicU64,
    /// Legacy sessions created
    pub legacy_sessions_created: AtomicU64,
    /// Sessions removed by the reaper
    pub sessions_reaped: AtomicU64,
    /// Failed socket writes
    pub send_errors: AtomicU64,
    start_time: Instant,
}

impl FactoryMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            session_errors: AtomicU64::new(0),
            current_sessions_created: AtomicU64::new(0),
            legacy_sessions_created: AtomicU64::new(0),
            sessions_reaped: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a datagram read from the socket
    pub fn datagram_received(&self, byte_count: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    /// Record a datagram written to the socket
    pub fn datagram_sent(&self, byte_count: usize) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    /// Record a datagram dropped before routing
    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a datagram a session failed to process
    pub fn session_error(&self) {
        self.session_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a newly classified session
    pub fn session_created(&self, family: StreamFamily) {
        let counter = match family {
            StreamFamily::Current => &self.current_sessions_created,
            StreamFamily::Legacy => &self.legacy_sessions_created,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session removed by the reaper
    pub fn session_reaped(&self) {
        self.sessions_reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed socket write
    pub fn send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            session_errors: self.session_errors.load(Ordering::Relaxed),
            current_sessions_created: self.current_sessions_created.load(Ordering::Relaxed),
            legacy_sessions_created: self.legacy_sessions_created.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            datagrams_received = snapshot.datagrams_received,
            bytes_received = snapshot.bytes_received,
            datagrams_sent = snapshot.datagrams_sent,
            bytes_sent = snapshot.bytes_sent,
            datagrams_dropped = snapshot.datagrams_dropped,
            session_errors = snapshot.session_errors,
            current_sessions_created = snapshot.current_sessions_created,
            legacy_sessions_created = snapshot.legacy_sessions_created,
            sessions_reaped = snapshot.sessions_reaped,
            send_errors = snapshot.send_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Stream factory metrics snapshot"
        );
    }
}

impl Default for FactoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub datagrams_dropped: u64,
    pub session_errors: u64,
    pub current_sessions_created: u64,
    pub legacy_sessions_created: u64,
    pub sessions_reaped: u64,
    pub send_errors: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Sessions created across both families
    pub fn sessions_created(&self) -> u64 {
        self.current_sessions_created + self.legacy_sessions_created
    }
}

/// Timer for measuring a loop pass
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
