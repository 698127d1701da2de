mod common;

use std::time::Duration;

use anyhow::Result;
use holo_range::{MemoryTxnConfig, RangeError, ScanConfig, StreamingMode};

use common::{chunked, full_range, key, numbered_store};

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?)
}

#[test]
fn blocking_iterator_drains_range() -> Result<()> {
    let rt = runtime()?;
    let store = numbered_store(45);
    let txn = chunked(&store, 8);

    let iter = full_range(&txn)
        .executor(rt.handle().clone())
        .iter()
        .into_blocking()?;
    let keys = iter
        .map(|record| record.map(|kv| kv.key))
        .collect::<Result<Vec<_>, RangeError>>()?;
    assert_eq!(keys, (0..45).map(key).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn blocking_iterator_reports_failure_then_ends() -> Result<()> {
    let rt = runtime()?;
    let store = numbered_store(10);
    let txn = store.begin_with(MemoryTxnConfig {
        chunk_rows: Some(4),
        fail_at_iteration: Some(2),
        latency: Duration::from_millis(2),
        ..Default::default()
    });

    let mut iter = full_range(&txn)
        .executor(rt.handle().clone())
        .iter()
        .into_blocking()?;
    for idx in 0..4 {
        let record = iter.next().expect("record")?;
        assert_eq!(record.key, key(idx));
    }
    assert!(matches!(iter.next(), Some(Err(RangeError::Transport(_)))));
    assert!(iter.next().is_none());
    Ok(())
}

#[test]
fn blocking_remove_last_and_commit() -> Result<()> {
    let rt = runtime()?;
    let store = numbered_store(6);
    let txn = chunked(&store, 2);

    let mut iter = full_range(&txn)
        .executor(rt.handle().clone())
        .iter()
        .into_blocking()?;
    while let Some(record) = iter.next() {
        let record = record?;
        if record.key.ends_with(b"1") || record.key.ends_with(b"4") {
            iter.remove_last()?;
        }
    }
    assert_eq!(txn.commit()?, 2);
    assert_eq!(store.len(), 4);
    assert_eq!(store.get(&key(1)), None);
    Ok(())
}

#[test]
fn config_from_lookup_drives_query() -> Result<()> {
    let rt = runtime()?;
    let store = numbered_store(30);
    let txn = chunked(&store, 4);
    let config = ScanConfig::from_lookup(|name| match name {
        "HOLO_RANGE_STREAMING_MODE" => Some("small".to_string()),
        "HOLO_RANGE_ROW_LIMIT" => Some("9".to_string()),
        _ => None,
    });

    let query = full_range(&txn)
        .with_config(&config)
        .executor(rt.handle().clone());
    assert_eq!(query.mode(), StreamingMode::Small);
    assert_eq!(query.row_limit(), 9);

    let records = query.iter().into_blocking()?.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(records.len(), 9);
    assert!(txn.requests().iter().all(|r| r.mode == StreamingMode::Small));
    Ok(())
}

#[test]
fn blocking_adapter_rejects_current_thread_runtime() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let store = numbered_store(5);
    let txn = chunked(&store, 2);

    let iter = full_range(&txn).executor(rt.handle().clone()).iter();
    assert!(matches!(
        iter.into_blocking(),
        Err(RangeError::InvalidState(_))
    ));
    Ok(())
}

#[test]
fn iterator_without_runtime_fails_on_first_read() {
    let store = numbered_store(5);
    let txn = chunked(&store, 2);

    let iter = full_range(&txn).iter();
    assert!(txn.requests().is_empty());
    assert!(matches!(iter.peek_ready(), Err(RangeError::InvalidState(_))));
    assert!(matches!(
        full_range(&txn).iter().into_blocking(),
        Err(RangeError::InvalidState(_))
    ));
}
