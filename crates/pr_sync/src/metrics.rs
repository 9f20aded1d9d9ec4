use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

pub static RUNS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("pr_sync_runs_total", "Total number of sync walks started")
        .expect("pr_sync runs total")
});

pub static LAST_RUN_TIMESTAMP: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pr_sync_last_run_timestamp_seconds",
        "Unix timestamp when the last sync walk started"
    )
    .expect("pr_sync last run timestamp")
});

pub static RUN_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "pr_sync_run_duration_seconds",
        "Duration of sync walks in seconds",
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    )
    .expect("pr_sync run duration histogram")
});

pub static REPOS_PROCESSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pr_sync_repositories_processed_total",
        "Repositories walked grouped by outcome (complete, budget_stop, error)",
        &["outcome"]
    )
    .expect("pr_sync repositories processed")
});

pub static RECORDS_EMITTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pr_sync_records_emitted_total",
        "Pull requests normalized and queued for the sink"
    )
    .expect("pr_sync records emitted")
});

pub static RECORDS_SKIPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pr_sync_records_skipped_total",
        "Pull requests passed over during a walk grouped by reason",
        &["reason"]
    )
    .expect("pr_sync records skipped")
});

pub static BATCHES_FLUSHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pr_sync_batches_flushed_total",
        "Batches handed to the sink successfully"
    )
    .expect("pr_sync batches flushed")
});

pub static BUDGET_STOPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pr_sync_budget_stops_total",
        "Walks ended early because the rate-limit budget fell below the threshold"
    )
    .expect("pr_sync budget stops")
});

pub static RATE_LIMIT_REMAINING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pr_sync_rate_limit_remaining",
        "Remaining core API budget at the last governor refresh"
    )
    .expect("pr_sync rate limit remaining")
});

pub static FETCH_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pr_sync_fetch_requests_total",
        "Client facade calls grouped by operation and outcome",
        &["op", "outcome"]
    )
    .expect("pr_sync fetch requests total")
});

pub static FETCH_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "pr_sync_fetch_latency_seconds",
        "Latency of client facade calls grouped by operation",
        &["op"],
        vec![0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]
    )
    .expect("pr_sync fetch latency seconds")
});

/// Dumps every registered metric in the text exposition format, for a
/// textfile collector to pick up. Written through a temp file so a scrape
/// never sees half a file.
pub async fn write_textfile(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buf)
        .context("encoding metrics")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, &buf)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("publishing {}", path.display()))?;
    Ok(())
}
