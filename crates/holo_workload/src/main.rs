//! Scan workload for exercising the prefetching range iterator.
//!
//! This binary loads a dense keyspace into an in-memory store, runs
//! concurrent range scans with random bounds, direction and limits, checks
//! every scan for ordering and completeness, and writes a JSON report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_range::{
    KeySelector, KeyValue, MemoryStore, MemoryTxnConfig, RangeQuery, ScanConfig, ScanMetrics,
    ScanMetricsSnapshot, StreamingMode,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-scan-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of keys loaded before scanning.
    #[arg(long, default_value_t = 100_000)]
    keys: usize,

    /// Key prefix. Keys are generated as `{key_prefix}{idx:010}`.
    #[arg(long, default_value = "scan_")]
    key_prefix: String,

    /// Size in bytes of every value.
    #[arg(long, default_value_t = 64)]
    value_size: usize,

    /// Number of concurrent scanning clients.
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Streaming mode for scans. Defaults to HOLO_RANGE_STREAMING_MODE, then `iterator`.
    #[arg(long)]
    mode: Option<StreamingMode>,

    /// Byte budget per fetch (0 lets the store pick). Defaults to HOLO_RANGE_TARGET_BYTES.
    #[arg(long)]
    target_bytes: Option<usize>,

    /// Fixed rows per fetch, overriding the mode's sizing.
    #[arg(long)]
    chunk_rows: Option<usize>,

    /// Simulated round-trip latency per fetch.
    #[arg(long, default_value = "0s")]
    fetch_latency: humantime::Duration,

    /// Percent of scans that run in reverse.
    #[arg(long, default_value_t = 50)]
    reverse_pct: u8,

    /// Percent of scans that carry a random row limit.
    #[arg(long, default_value_t = 25)]
    limit_pct: u8,

    /// Materialize scans with a single collect call instead of iterating.
    #[arg(long, default_value_t = false)]
    collect: bool,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// When true, any failed scan aborts the run.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Write the JSON report to this path.
    #[arg(long, default_value = ".tmp/scan/report.json")]
    out: PathBuf,
}

/// Metadata embedded in the report for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct ReportMeta {
    keys: usize,
    key_prefix: String,
    value_size: usize,
    clients: usize,
    duration_ms: u64,
    mode: StreamingMode,
    target_bytes: usize,
    chunk_rows: Option<usize>,
    fetch_latency_ms: u64,
    reverse_pct: u8,
    limit_pct: u8,
    collect: bool,
    seed: u64,
}

/// Full workload report.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct Report {
    meta: ReportMeta,
    metrics: ScanMetricsSnapshot,
    transport_inflight_peak: u64,
    scans: Vec<ScanRecord>,
}

/// One scan issued during the run.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct ScanRecord {
    client: usize,
    begin: usize,
    end: usize,
    reverse: bool,
    limit: usize,
    rows: usize,
    fetches: u32,
    call_us: u64,
    return_us: u64,
    result: ScanResult,
}

/// Result of a scan with structured error encoding.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ScanResult {
    Ok,
    Err { error: String },
}

/// Parameters of one randomly generated scan.
#[derive(Debug, Clone, Copy)]
struct ScanPlan {
    begin: usize,
    end: usize,
    reverse: bool,
    limit: usize,
}

impl ScanPlan {
    fn expected_rows(&self) -> usize {
        let span = self.end - self.begin;
        if self.limit == 0 {
            span
        } else {
            span.min(self.limit)
        }
    }

    /// Index of the `n`th record this scan should return.
    fn expected_index(&self, n: usize) -> usize {
        if self.reverse {
            self.end - 1 - n
        } else {
            self.begin + n
        }
    }
}

/// Settings shared by every client.
struct Workload {
    store: Arc<MemoryStore>,
    metrics: Arc<ScanMetrics>,
    txn_config: MemoryTxnConfig,
    key_prefix: String,
    keys: usize,
    mode: StreamingMode,
    target_bytes: usize,
    reverse_pct: u8,
    limit_pct: u8,
    collect: bool,
    fail_fast: bool,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        // Run the scan workload.
        Command::Run(args) => run(args).await,
    }
}

/// Run the workload and write the JSON report.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    anyhow::ensure!(args.reverse_pct <= 100, "--reverse-pct must be <= 100");
    anyhow::ensure!(args.limit_pct <= 100, "--limit-pct must be <= 100");

    let defaults = ScanConfig::from_env();
    let mode = args.mode.unwrap_or(defaults.streaming_mode);
    let target_bytes = args.target_bytes.unwrap_or(defaults.target_bytes);
    let duration: Duration = args.duration.into();
    let fetch_latency: Duration = args.fetch_latency.into();
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let store = MemoryStore::new();
    let value = vec![b'v'; args.value_size];
    store.extend((0..args.keys).map(|idx| KeyValue::new(make_key(&args.key_prefix, idx), value.clone())));
    tracing::info!(keys = store.len(), %mode, seed, "keyspace loaded");

    let workload = Arc::new(Workload {
        store,
        metrics: Arc::new(ScanMetrics::new()),
        txn_config: MemoryTxnConfig {
            chunk_rows: args.chunk_rows,
            latency: fetch_latency,
            ..Default::default()
        },
        key_prefix: args.key_prefix.clone(),
        keys: args.keys,
        mode,
        target_bytes,
        reverse_pct: args.reverse_pct,
        limit_pct: args.limit_pct,
        collect: args.collect,
        fail_fast: args.fail_fast,
    });

    let start = time::Instant::now();
    let deadline = start + duration;

    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let workload = Arc::clone(&workload);
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_client(client_id, workload, seed, start, deadline).await
        }));
    }

    let mut scans = Vec::new();
    let mut transport_inflight_peak = 0;
    for task in tasks {
        let (mut records, peak) = task.await.context("client task panicked")??;
        scans.append(&mut records);
        transport_inflight_peak = transport_inflight_peak.max(peak);
    }
    scans.sort_by_key(|scan| (scan.call_us, scan.client));

    let failed = scans
        .iter()
        .filter(|scan| matches!(scan.result, ScanResult::Err { .. }))
        .count();
    let metrics = workload.metrics.snapshot();
    tracing::info!(
        scans = scans.len(),
        failed,
        rows = metrics.rows_yielded,
        fetches = metrics.fetches_issued,
        inflight_peak = transport_inflight_peak,
        "scan workload finished"
    );

    let report = Report {
        meta: ReportMeta {
            keys: args.keys,
            key_prefix: args.key_prefix.clone(),
            value_size: args.value_size,
            clients: args.clients,
            duration_ms: duration.as_millis() as u64,
            mode,
            target_bytes,
            chunk_rows: args.chunk_rows,
            fetch_latency_ms: fetch_latency.as_millis() as u64,
            reverse_pct: args.reverse_pct,
            limit_pct: args.limit_pct,
            collect: args.collect,
            seed,
        },
        metrics,
        transport_inflight_peak,
        scans,
    };
    write_report(&args.out, &report).context("write report")?;
    eprintln!("wrote report: {}", args.out.display());
    Ok(())
}

/// Run scans on one client until the deadline, returning its records and
/// the highest per-transaction in-flight fetch count it saw.
async fn run_client(
    client_id: usize,
    workload: Arc<Workload>,
    seed: u64,
    start: time::Instant,
    deadline: time::Instant,
) -> anyhow::Result<(Vec<ScanRecord>, u64)> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut records = Vec::new();
    let mut inflight_peak = 0;

    while time::Instant::now() < deadline {
        let plan = random_plan(&mut rng, &workload);
        let txn = workload.store.begin_with(workload.txn_config.clone());
        let query = RangeQuery::new(
            txn.clone(),
            KeySelector::first_greater_or_equal(make_key(&workload.key_prefix, plan.begin)),
            KeySelector::first_greater_or_equal(make_key(&workload.key_prefix, plan.end)),
        )
        .reverse(plan.reverse)
        .limit(plan.limit)
        .streaming_mode(workload.mode)
        .target_bytes(workload.target_bytes)
        .snapshot(true)
        .metrics(Arc::clone(&workload.metrics));

        let call_us = start.elapsed().as_micros() as u64;
        let outcome = if workload.collect {
            collect_scan(&query, &plan, &workload.key_prefix).await
        } else {
            iterate_scan(&query, &plan, &workload.key_prefix).await
        };
        let return_us = start.elapsed().as_micros() as u64;
        inflight_peak = inflight_peak.max(txn.stats().inflight_peak());

        let (rows, fetches, result) = match outcome {
            Ok((rows, fetches)) => (rows, fetches, ScanResult::Ok),
            Err(err) => {
                tracing::warn!(client = client_id, ?plan, error = %err, "scan failed");
                if workload.fail_fast {
                    anyhow::bail!("client {client_id} scan {plan:?} failed: {err:#}");
                }
                (0, 0, ScanResult::Err { error: format!("{err:#}") })
            }
        };
        records.push(ScanRecord {
            client: client_id,
            begin: plan.begin,
            end: plan.end,
            reverse: plan.reverse,
            limit: plan.limit,
            rows,
            fetches,
            call_us,
            return_us,
            result,
        });
    }

    Ok((records, inflight_peak))
}

fn random_plan(rng: &mut SmallRng, workload: &Workload) -> ScanPlan {
    let a = rng.gen_range(0..=workload.keys);
    let b = rng.gen_range(0..=workload.keys);
    let (begin, end) = if a <= b { (a, b) } else { (b, a) };
    let reverse = rng.gen_range(0..100) < workload.reverse_pct as u32;
    let limit = if rng.gen_range(0..100) < workload.limit_pct as u32 {
        rng.gen_range(1..=1_000)
    } else {
        0
    };
    ScanPlan {
        begin,
        end,
        reverse,
        limit,
    }
}

/// Walk the scan record by record, checking each key against the plan.
async fn iterate_scan(
    query: &RangeQuery,
    plan: &ScanPlan,
    key_prefix: &str,
) -> anyhow::Result<(usize, u32)> {
    let mut iter = query.iter();
    let mut rows = 0;
    while let Some(record) = iter.next().await? {
        check_record(&record, rows, plan, key_prefix)?;
        rows += 1;
    }
    anyhow::ensure!(
        rows == plan.expected_rows(),
        "scan returned {rows} rows, expected {}",
        plan.expected_rows()
    );
    Ok((rows, iter.fetches_issued()))
}

/// Materialize the scan in one call, then check it.
async fn collect_scan(
    query: &RangeQuery,
    plan: &ScanPlan,
    key_prefix: &str,
) -> anyhow::Result<(usize, u32)> {
    let records = query.collect().await?;
    for (n, record) in records.iter().enumerate() {
        check_record(record, n, plan, key_prefix)?;
    }
    anyhow::ensure!(
        records.len() == plan.expected_rows(),
        "collect returned {} rows, expected {}",
        records.len(),
        plan.expected_rows()
    );
    Ok((records.len(), 0))
}

fn check_record(record: &KeyValue, n: usize, plan: &ScanPlan, key_prefix: &str) -> anyhow::Result<()> {
    let expected = make_key(key_prefix, plan.expected_index(n));
    anyhow::ensure!(
        record.key == expected,
        "record {n} has key {:?}, expected {:?}",
        String::from_utf8_lossy(&record.key),
        String::from_utf8_lossy(&expected)
    );
    Ok(())
}

fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}{idx:010}").into_bytes()
}

/// Serialize and write the workload report JSON.
fn write_report(path: &PathBuf, report: &Report) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        // Ensure the output directory exists before writing.
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_expectations_cover_both_directions() {
        let forward = ScanPlan {
            begin: 10,
            end: 20,
            reverse: false,
            limit: 4,
        };
        assert_eq!(forward.expected_rows(), 4);
        assert_eq!(forward.expected_index(0), 10);

        let backward = ScanPlan {
            reverse: true,
            limit: 0,
            ..forward
        };
        assert_eq!(backward.expected_rows(), 10);
        assert_eq!(backward.expected_index(0), 19);
        assert_eq!(backward.expected_index(9), 10);
    }

    #[test]
    fn keys_sort_numerically() {
        assert!(make_key("p", 9) < make_key("p", 10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn iterate_scan_checks_ordering() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.extend((0..50).map(|idx| KeyValue::new(make_key("t", idx), "v")));
        let txn = store.begin_with(MemoryTxnConfig {
            chunk_rows: Some(7),
            ..Default::default()
        });
        let plan = ScanPlan {
            begin: 5,
            end: 45,
            reverse: true,
            limit: 0,
        };
        let query = RangeQuery::new(
            txn.clone(),
            KeySelector::first_greater_or_equal(make_key("t", plan.begin)),
            KeySelector::first_greater_or_equal(make_key("t", plan.end)),
        )
        .reverse(true);
        let (rows, fetches) = iterate_scan(&query, &plan, "t").await?;
        assert_eq!(rows, 40);
        assert_eq!(fetches, 6);
        assert_eq!(collect_scan(&query, &plan, "t").await?.0, 40);
        Ok(())
    }
}
