//! Whole-range collection.
//!
//! `Exact` scans know their size up front, so they go out as one request with
//! nothing to pipeline. Every other mode drains a regular iterator.

use tracing::{debug, warn};

use crate::error::Result;
use crate::fetch::{FetchOutcome, ScanRequest};
use crate::mode::StreamingMode;
use crate::query::RangeQuery;
use crate::wire::KeyValue;

pub(crate) async fn collect(query: &RangeQuery) -> Result<Vec<KeyValue>> {
    let mode = query.mode.for_materialize(query.row_limit);
    if mode == StreamingMode::Exact {
        return collect_exact(query).await;
    }
    query.clone().streaming_mode(mode).iter().collect().await
}

async fn collect_exact(query: &RangeQuery) -> Result<Vec<KeyValue>> {
    let request = ScanRequest {
        begin: query.begin.clone(),
        end: query.end.clone(),
        row_limit: query.row_limit,
        target_bytes: 0,
        mode: StreamingMode::Exact,
        iteration: 1,
        snapshot: query.snapshot,
        reverse: query.reverse,
    };
    debug!(row_limit = request.row_limit, reverse = request.reverse, "single-shot range read");

    let metrics = query.metrics.as_deref();
    if let Some(metrics) = metrics {
        metrics.record_fetch_issued();
    }
    let outcome = match query.txn.get_range(request).wait().await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "single-shot range read failed");
            if let Some(metrics) = metrics {
                metrics.record_fetch_failed();
            }
            return Err(err);
        }
    };
    if let Some(metrics) = metrics {
        metrics.record_fetch_completed();
    }

    match outcome {
        FetchOutcome::Exhausted => Ok(Vec::new()),
        FetchOutcome::Chunk(chunk) => {
            let records = chunk.to_records();
            if let Some(metrics) = metrics {
                metrics.record_chunk(chunk.len(), chunk.byte_len());
                metrics.record_rows_yielded(records.len());
            }
            Ok(records)
        }
    }
}
