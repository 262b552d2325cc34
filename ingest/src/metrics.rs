//! Metrics collection for rate ingestion.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Ingestion metrics.
pub struct IngestMetrics {
    /// Payloads read from the stream.
    pub messages_received: AtomicU64,
    /// Messages published to the rate store.
    pub messages_applied: AtomicU64,
    /// Messages dropped without touching the store.
    pub messages_dropped: AtomicU64,
    /// Entries applied across all messages.
    pub entries_applied: AtomicU64,
    /// Entries skipped across all messages.
    pub entries_skipped: AtomicU64,
    /// Fatal stream failures.
    pub stream_failures: AtomicU64,
    /// Store version produced by the last applied message.
    pub last_version: AtomicU64,
    /// Unix time in milliseconds of the last applied message, 0 if none.
    pub last_applied_ms: AtomicI64,
}

impl IngestMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_applied: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            entries_applied: AtomicU64::new(0),
            entries_skipped: AtomicU64::new(0),
            stream_failures: AtomicU64::new(0),
            last_version: AtomicU64::new(0),
            last_applied_ms: AtomicI64::new(0),
        }
    }

    /// Increment messages received.
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message published as store `version`.
    pub fn message_applied(&self, entries: usize, skipped: usize, version: u64) {
        self.messages_applied.fetch_add(1, Ordering::Relaxed);
        self.entries_applied.fetch_add(entries as u64, Ordering::Relaxed);
        self.entries_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        self.last_version.store(version, Ordering::Relaxed);
        self.last_applied_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Record a dropped message and the entries it carried.
    pub fn message_dropped(&self, skipped: usize) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        self.entries_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
    }

    /// Record a fatal stream failure.
    pub fn stream_failed(&self) {
        self.stream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_applied: self.messages_applied.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            entries_skipped: self.entries_skipped.load(Ordering::Relaxed),
            stream_failures: self.stream_failures.load(Ordering::Relaxed),
            last_version: self.last_version.load(Ordering::Relaxed),
            last_applied_ms: self.last_applied_ms.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP ratefeed_messages_received Total rate messages received
# TYPE ratefeed_messages_received counter
ratefeed_messages_received {}

# HELP ratefeed_messages_applied Total rate messages published to the store
# TYPE ratefeed_messages_applied counter
ratefeed_messages_applied {}

# HELP ratefeed_messages_dropped Total rate messages dropped
# TYPE ratefeed_messages_dropped counter
ratefeed_messages_dropped {}

# HELP ratefeed_entries_applied Total rate entries applied
# TYPE ratefeed_entries_applied counter
ratefeed_entries_applied {}

# HELP ratefeed_entries_skipped Total rate entries skipped
# TYPE ratefeed_entries_skipped counter
ratefeed_entries_skipped {}

# HELP ratefeed_stream_failures Total fatal stream failures
# TYPE ratefeed_stream_failures counter
ratefeed_stream_failures {}

# HELP ratefeed_table_version Version of the last published rate table
# TYPE ratefeed_table_version gauge
ratefeed_table_version {}

# HELP ratefeed_last_applied_ms Unix time of the last published rate table in milliseconds
# TYPE ratefeed_last_applied_ms gauge
ratefeed_last_applied_ms {}
"#,
            snapshot.messages_received,
            snapshot.messages_applied,
            snapshot.messages_dropped,
            snapshot.entries_applied,
            snapshot.entries_skipped,
            snapshot.stream_failures,
            snapshot.last_version,
            snapshot.last_applied_ms,
        )
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestMetricsSnapshot {
    pub messages_received: u64,
    pub messages_applied: u64,
    pub messages_dropped: u64,
    pub entries_applied: u64,
    pub entries_skipped: u64,
    pub stream_failures: u64,
    pub last_version: u64,
    pub last_applied_ms: i64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<IngestMetrics>;
