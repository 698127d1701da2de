//! In-memory ordered store and transaction.
//!
//! `MemoryTransaction` answers scan requests the way a remote store would:
//! it resolves selectors, sizes each chunk from the streaming mode, and
//! serializes replies into pooled wire buffers. It doubles as the test and
//! workload transport, so it also carries fault injection and counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::anyhow;

use crate::fetch::{PendingChunk, RangeTransaction, ScanRequest};
use crate::mode::StreamingMode;
use crate::pool::BufferPool;
use crate::wire::{ChunkWriter, KeyValue};

/// Rows in the first `Iterator`-mode chunk; doubles per iteration.
const ITERATOR_BASE_ROWS: usize = 16;
/// Largest `Iterator`-mode chunk.
const ITERATOR_MAX_ROWS: usize = 1_024;
const SMALL_ROWS: usize = 32;
const MEDIUM_ROWS: usize = 128;
const LARGE_ROWS: usize = 512;

/// Shared ordered keyspace.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    pool: BufferPool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_pool(pool: BufferPool) -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(BTreeMap::new()),
            pool,
        })
    }

    pub fn insert(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.write().insert(key.into(), value.into());
    }

    pub fn extend<I>(&self, records: I)
    where
        I: IntoIterator<Item = KeyValue>,
    {
        let mut data = self.write();
        for record in records {
            data.insert(record.key, record.value);
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Opens a transaction with default (fault-free) behaviour.
    pub fn begin(self: &Arc<Self>) -> Arc<MemoryTransaction> {
        self.begin_with(MemoryTxnConfig::default())
    }

    pub fn begin_with(self: &Arc<Self>, config: MemoryTxnConfig) -> Arc<MemoryTransaction> {
        Arc::new(MemoryTransaction {
            store: Arc::clone(self),
            config,
            staged_clears: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            stats: Arc::new(TransportStats::default()),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-transaction behaviour knobs.
#[derive(Clone, Debug, Default)]
pub struct MemoryTxnConfig {
    /// Fixed rows per chunk for every mode except `Exact`.
    pub chunk_rows: Option<usize>,
    /// Delay before each reply resolves.
    pub latency: Duration,
    /// Fail the fetch with this iteration number.
    pub fail_at_iteration: Option<u32>,
    /// Truncate the reply of the fetch with this iteration number.
    pub corrupt_at_iteration: Option<u32>,
    /// Never resolve the fetch with this iteration number.
    pub stall_at_iteration: Option<u32>,
}

/// Transport-side counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    issued: AtomicU64,
    inflight: AtomicU64,
    inflight_peak: AtomicU64,
    cancel_hooks: AtomicU64,
}

impl TransportStats {
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn inflight_peak(&self) -> u64 {
        self.inflight_peak.load(Ordering::Acquire)
    }

    /// Times an iterator invoked a reply's cancel hook.
    pub fn cancel_hooks(&self) -> u64 {
        self.cancel_hooks.load(Ordering::Acquire)
    }

    fn enter(self: &Arc<Self>) -> InflightGuard {
        self.issued.fetch_add(1, Ordering::AcqRel);
        let now = self.inflight.fetch_add(1, Ordering::AcqRel) + 1;
        self.inflight_peak.fetch_max(now, Ordering::AcqRel);
        InflightGuard(Arc::clone(self))
    }
}

/// Counts a reply as in flight until it resolves or is dropped.
struct InflightGuard(Arc<TransportStats>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A transaction over a [`MemoryStore`].
///
/// Reads see committed data only; clears are staged until `commit`.
pub struct MemoryTransaction {
    store: Arc<MemoryStore>,
    config: MemoryTxnConfig,
    staged_clears: Mutex<Vec<Vec<u8>>>,
    requests: Mutex<Vec<ScanRequest>>,
    stats: Arc<TransportStats>,
}

impl MemoryTransaction {
    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    /// Every scan request received, in arrival order.
    pub fn requests(&self) -> Vec<ScanRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn staged_clears(&self) -> Vec<Vec<u8>> {
        self.staged_clears
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies staged clears to the store.
    pub fn commit(&self) -> anyhow::Result<usize> {
        let clears = std::mem::take(
            &mut *self
                .staged_clears
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut data = self.store.write();
        let mut removed = 0;
        for key in &clears {
            if data.remove(key).is_some() {
                removed += 1;
            }
        }
        tracing::debug!(staged = clears.len(), removed, "memory transaction committed");
        Ok(removed)
    }

    fn rows_for(&self, request: &ScanRequest) -> usize {
        if request.mode == StreamingMode::Exact {
            return usize::MAX;
        }
        if let Some(rows) = self.config.chunk_rows {
            return rows.max(1);
        }
        match request.mode {
            StreamingMode::Iterator => {
                let shift = request.iteration.saturating_sub(1).min(16);
                (ITERATOR_BASE_ROWS << shift).min(ITERATOR_MAX_ROWS)
            }
            StreamingMode::Small => SMALL_ROWS,
            StreamingMode::Medium => MEDIUM_ROWS,
            StreamingMode::Large => LARGE_ROWS,
            StreamingMode::WantAll | StreamingMode::Serial | StreamingMode::Exact => usize::MAX,
        }
    }

    /// Builds the reply for `request` from the current store contents.
    fn encode_reply(&self, request: &ScanRequest) -> crate::pool::PooledBuffer {
        let data = self.store.read();
        let (keys, values): (Vec<&Vec<u8>>, Vec<&Vec<u8>>) = data.iter().unzip();
        let begin = request.begin.resolve(&keys);
        let end = request.end.resolve(&keys);
        let available = end.saturating_sub(begin);

        let mut take = available.min(self.rows_for(request));
        if request.row_limit > 0 {
            take = take.min(request.row_limit);
        }
        let indices: Box<dyn Iterator<Item = usize>> = if request.reverse {
            Box::new((end - take..end).rev())
        } else {
            Box::new(begin..begin + take)
        };

        let mut writer = ChunkWriter::new(&self.store.pool, 64);
        let mut bytes = 0usize;
        for idx in indices {
            let (key, value) = (keys[idx], values[idx]);
            writer.push(key, value);
            bytes += key.len() + value.len();
            if request.target_bytes > 0 && bytes >= request.target_bytes {
                break;
            }
        }
        let more = writer.count() < available;
        writer.finish(more)
    }
}

impl RangeTransaction for MemoryTransaction {
    fn get_range(&self, request: ScanRequest) -> PendingChunk {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let guard = self.stats.enter();
        let stats = Arc::clone(&self.stats);
        let iteration = request.iteration;

        if self.config.fail_at_iteration == Some(iteration) {
            return PendingChunk::new(async move {
                let _guard = guard;
                Err(anyhow!("injected transport failure at iteration {iteration}"))
            })
            .on_cancel(move || {
                stats.cancel_hooks.fetch_add(1, Ordering::AcqRel);
            });
        }

        let stall = self.config.stall_at_iteration == Some(iteration);
        let mut buffer = self.encode_reply(&request);
        if self.config.corrupt_at_iteration == Some(iteration) {
            buffer.as_mut_vec().pop();
        }
        let latency = self.config.latency;

        PendingChunk::new(async move {
            let _guard = guard;
            if stall {
                std::future::pending::<()>().await;
            }
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(buffer)
        })
        .on_cancel(move || {
            stats.cancel_hooks.fetch_add(1, Ordering::AcqRel);
        })
    }

    fn clear(&self, key: &[u8]) {
        self.staged_clears
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.to_vec());
    }
}
