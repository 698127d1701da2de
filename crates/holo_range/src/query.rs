//! Range query descriptor.
//!
//! A `RangeQuery` is an immutable description of a scan. It starts fresh
//! iterators (each with its own cursor) and offers a one-call collect path.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::config::ScanConfig;
use crate::error::Result;
use crate::fetch::RangeTransaction;
use crate::iterator::{RangeIterator, ScanParams};
use crate::materialize;
use crate::metrics::ScanMetrics;
use crate::mode::StreamingMode;
use crate::selector::{KeyRange, KeySelector};
use crate::wire::KeyValue;

/// Row limit value meaning "no limit".
pub const ROW_LIMIT_UNLIMITED: usize = 0;

#[derive(Clone)]
pub struct RangeQuery {
    pub(crate) txn: Arc<dyn RangeTransaction>,
    pub(crate) begin: KeySelector,
    pub(crate) end: KeySelector,
    pub(crate) snapshot: bool,
    pub(crate) row_limit: usize,
    pub(crate) reverse: bool,
    pub(crate) mode: StreamingMode,
    pub(crate) target_bytes: usize,
    pub(crate) metrics: Option<Arc<ScanMetrics>>,
    executor: Option<Handle>,
}

impl RangeQuery {
    /// Query over `[begin, end)` as resolved by the two selectors.
    pub fn new(txn: Arc<dyn RangeTransaction>, begin: KeySelector, end: KeySelector) -> Self {
        let defaults = ScanConfig::default();
        Self {
            txn,
            begin,
            end,
            snapshot: false,
            row_limit: defaults.row_limit,
            reverse: false,
            mode: defaults.streaming_mode,
            target_bytes: defaults.target_bytes,
            metrics: None,
            executor: None,
        }
    }

    /// Query over the raw key range `[range.begin, range.end)`.
    pub fn from_range(txn: Arc<dyn RangeTransaction>, range: &KeyRange) -> Self {
        let (begin, end) = range.selectors();
        Self::new(txn, begin, end)
    }

    /// Applies configured defaults (mode, limit, byte target).
    pub fn with_config(mut self, config: &ScanConfig) -> Self {
        self.row_limit = config.row_limit;
        self.mode = config.streaming_mode;
        self.target_bytes = config.target_bytes;
        self
    }

    /// Caps the number of rows returned; 0 means unlimited.
    pub fn limit(mut self, row_limit: usize) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn streaming_mode(mut self, mode: StreamingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Snapshot reads add no read conflicts in the owning transaction.
    pub fn snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn target_bytes(mut self, target_bytes: usize) -> Self {
        self.target_bytes = target_bytes;
        self
    }

    pub fn metrics(mut self, metrics: Arc<ScanMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runtime used for fetch completions. Defaults to the caller's runtime.
    pub fn executor(mut self, executor: Handle) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn begin(&self) -> &KeySelector {
        &self.begin
    }

    pub fn end(&self) -> &KeySelector {
        &self.end
    }

    pub fn row_limit(&self) -> usize {
        self.row_limit
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    pub fn mode(&self) -> StreamingMode {
        self.mode
    }

    /// Starts a new iterator. The first fetch is issued before this returns.
    ///
    /// When no executor was set and the caller is not inside a Tokio runtime,
    /// no fetch is issued and the first read fails with `InvalidState`.
    pub fn iter(&self) -> RangeIterator {
        let executor = self
            .executor
            .clone()
            .or_else(|| Handle::try_current().ok());
        let params = ScanParams {
            txn: Arc::clone(&self.txn),
            row_limit: self.row_limit,
            target_bytes: self.target_bytes,
            mode: self.mode,
            snapshot: self.snapshot,
            reverse: self.reverse,
            metrics: self.metrics.clone(),
        };
        RangeIterator::start(params, self.begin.clone(), self.end.clone(), executor)
    }

    /// Collects every matching record. Without a row limit this holds the
    /// whole range in memory.
    pub async fn collect(&self) -> Result<Vec<KeyValue>> {
        materialize::collect(self).await
    }
}

impl std::fmt::Debug for RangeQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeQuery")
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("snapshot", &self.snapshot)
            .field("row_limit", &self.row_limit)
            .field("reverse", &self.reverse)
            .field("mode", &self.mode)
            .field("target_bytes", &self.target_bytes)
            .finish_non_exhaustive()
    }
}
