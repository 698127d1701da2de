//! Range scans over HoloStore transactions.
//!
//! A `RangeQuery` describes a scan between two key selectors. Iterating it
//! pages through the range in chunks, keeping one fetch in flight ahead of
//! the consumer so network latency overlaps with processing. The transport
//! is supplied by the caller through `RangeTransaction`; `memory` provides
//! an in-process implementation used by tests and the scan workload.

pub mod config;
pub mod error;
pub mod fetch;
pub mod iterator;
mod materialize;
pub mod memory;
pub mod metrics;
pub mod mode;
pub mod pool;
pub mod query;
pub mod selector;
pub mod wire;

pub use config::ScanConfig;
pub use error::{RangeError, Result};
pub use fetch::{CancelHandle, FetchOutcome, PendingChunk, RangeTransaction, ScanRequest};
pub use iterator::{BlockingRangeIterator, FetchWait, IteratorCancelHandle, RangeIterator, Readiness};
pub use memory::{MemoryStore, MemoryTransaction, MemoryTxnConfig, TransportStats};
pub use metrics::{ScanMetrics, ScanMetricsSnapshot};
pub use mode::StreamingMode;
pub use pool::{BufferPool, PooledBuffer};
pub use query::{RangeQuery, ROW_LIMIT_UNLIMITED};
pub use selector::{continuation_selectors, KeyRange, KeySelector};
pub use wire::{read_summary, ChunkSummary, ChunkWriter, DecodedChunk, KeyValue};
