//! In-process counters for range fetches.
//!
//! Counters are lock-free so the fetch completion path can update them from
//! whichever runtime worker finishes the RPC.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters shared by every iterator of a query.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    /// Scan RPCs handed to the transport.
    fetches_issued: AtomicU64,
    /// Scan RPCs whose result reached the iterator (data or exhaustion).
    fetches_completed: AtomicU64,
    /// Scan RPCs that failed in transport or decoding.
    fetches_failed: AtomicU64,
    /// In-flight scans cancelled by the iterator.
    fetches_cancelled: AtomicU64,
    /// Chunks decoded with at least one record.
    chunks_decoded: AtomicU64,
    /// Records decoded from chunks.
    rows_decoded: AtomicU64,
    /// Raw chunk bytes decoded.
    bytes_decoded: AtomicU64,
    /// Records handed to consumers.
    rows_yielded: AtomicU64,
    /// Fetches currently in flight.
    inflight: AtomicU64,
    /// Highest `inflight` value observed.
    inflight_peak: AtomicU64,
}

/// Immutable snapshot view of [`ScanMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanMetricsSnapshot {
    pub fetches_issued: u64,
    pub fetches_completed: u64,
    pub fetches_failed: u64,
    pub fetches_cancelled: u64,
    pub chunks_decoded: u64,
    pub rows_decoded: u64,
    pub bytes_decoded: u64,
    pub rows_yielded: u64,
    pub inflight: u64,
    pub inflight_peak: u64,
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fetch_issued(&self) {
        self.fetches_issued.fetch_add(1, Ordering::Relaxed);
        let now = self.inflight.fetch_add(1, Ordering::AcqRel) + 1;
        self.inflight_peak.fetch_max(now, Ordering::AcqRel);
    }

    pub fn record_fetch_completed(&self) {
        self.fetches_completed.fetch_add(1, Ordering::Relaxed);
        self.leave_inflight();
    }

    pub fn record_fetch_failed(&self) {
        self.fetches_failed.fetch_add(1, Ordering::Relaxed);
        self.leave_inflight();
    }

    pub fn record_fetch_cancelled(&self) {
        self.fetches_cancelled.fetch_add(1, Ordering::Relaxed);
        self.leave_inflight();
    }

    pub fn record_chunk(&self, rows: usize, bytes: usize) {
        self.chunks_decoded.fetch_add(1, Ordering::Relaxed);
        self.rows_decoded.fetch_add(rows as u64, Ordering::Relaxed);
        self.bytes_decoded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_row_yielded(&self) {
        self.record_rows_yielded(1);
    }

    pub fn record_rows_yielded(&self, rows: usize) {
        self.rows_yielded.fetch_add(rows as u64, Ordering::Relaxed);
    }

    fn leave_inflight(&self) {
        // Saturate rather than wrap if a completion races a cancel.
        let _ = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> ScanMetricsSnapshot {
        ScanMetricsSnapshot {
            fetches_issued: self.fetches_issued.load(Ordering::Relaxed),
            fetches_completed: self.fetches_completed.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            fetches_cancelled: self.fetches_cancelled.load(Ordering::Relaxed),
            chunks_decoded: self.chunks_decoded.load(Ordering::Relaxed),
            rows_decoded: self.rows_decoded.load(Ordering::Relaxed),
            bytes_decoded: self.bytes_decoded.load(Ordering::Relaxed),
            rows_yielded: self.rows_yielded.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Acquire),
            inflight_peak: self.inflight_peak.load(Ordering::Acquire),
        }
    }
}
