//! Shared helpers for range scan integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use holo_range::{KeyValue, MemoryStore, MemoryTransaction, MemoryTxnConfig, RangeQuery};

/// Upper bound for polling loops that wait on background completions.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Zero-padded key for record `idx`, so byte order matches numeric order.
pub fn key(idx: usize) -> Vec<u8> {
    format!("key{idx:05}").into_bytes()
}

pub fn value(idx: usize) -> Vec<u8> {
    format!("value-{idx}").into_bytes()
}

/// Store holding `key(0)..key(count)`.
pub fn numbered_store(count: usize) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.extend((0..count).map(|idx| KeyValue::new(key(idx), value(idx))));
    store
}

/// Store holding single-letter keys `a`, `b`, `c`, `d`.
pub fn letter_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    for (idx, letter) in ["a", "b", "c", "d"].into_iter().enumerate() {
        store.insert(letter, format!("{}", idx + 1));
    }
    store
}

/// Transaction that answers `rows` records per fetch.
pub fn chunked(store: &Arc<MemoryStore>, rows: usize) -> Arc<MemoryTransaction> {
    store.begin_with(MemoryTxnConfig {
        chunk_rows: Some(rows),
        ..Default::default()
    })
}

/// Query over every numbered key.
pub fn full_range(txn: &Arc<MemoryTransaction>) -> RangeQuery {
    RangeQuery::from_range(txn.clone(), &holo_range::KeyRange::starts_with(b"key"))
}

pub fn keys_of(records: &[KeyValue]) -> Vec<Vec<u8>> {
    records.iter().map(|kv| kv.key.clone()).collect()
}

/// Polls `check` until it holds or `SETTLE_TIMEOUT` passes.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
