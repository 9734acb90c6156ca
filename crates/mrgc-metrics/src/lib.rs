//! Metrics Collector (C2): read-side aggregation over the State Store
//! Adapter's `MetricPoint` and `CleanupAudit` tables.
//!
//! This crate owns no storage of its own — every function here is a pure
//! read-and-aggregate over whatever [`mrgc_state::StateStore`] it is handed,
//! mirroring how the original implementation's metrics collector queried the
//! shared state manager rather than keeping a private copy of the data.
//! Percentiles use floor-indexing into the sorted sample (`values[(n as f64
//! * p) as usize]`), not interpolation; a window with zero samples reports
//! `0.0`/`count: 0` rather than failing.

#![forbid(unsafe_code)]

use std::time::Duration;

use mrgc_proto::{HealthStatus, Region};
use serde::Serialize;
use mrgc_state::StateStore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error(transparent)]
    Store(#[from] mrgc_state::StateStoreError),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

/// Percentile/average summary of a sample of metric values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentileStats {
    pub count: usize,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl PercentileStats {
    fn from_values(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self {
                count: 0,
                avg: 0.0,
                p50: 0.0,
                p90: 0.0,
                p99: 0.0,
            };
        }
        values.sort_by(|a, b| a.partial_cmp(b).expect("metric values are never NaN"));
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        Self {
            count: values.len(),
            avg,
            p50: percentile(&values, 0.50),
            p90: percentile(&values, 0.90),
            p99: percentile(&values, 0.99),
        }
    }
}

/// Floor-indexed percentile: `sorted[floor(len * p)]`, clamped to the last
/// element. No interpolation between samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = ((sorted.len() as f64) * p) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Cluster-wide requests-per-second over `window`, derived from the
/// `"requests"` metric (one point per completed inference request).
pub async fn cluster_rps<S: StateStore + ?Sized>(
    store: &S,
    region: &str,
    window: Duration,
) -> Result<f64> {
    let points = store.get_metrics("requests", region, window).await?;
    let secs = window.as_secs_f64();
    if secs <= 0.0 {
        return Ok(0.0);
    }
    let total: f64 = points.iter().map(|p| p.value).sum();
    Ok(total / secs)
}

/// Mean queue depth across all `"queue_depth"` samples in a region over
/// `window`. Returns `0.0` when there are no samples.
pub async fn average_queue_depth<S: StateStore + ?Sized>(
    store: &S,
    region: &str,
    window: Duration,
) -> Result<f64> {
    let points = store.get_metrics("queue_depth", region, window).await?;
    if points.is_empty() {
        return Ok(0.0);
    }
    let sum: f64 = points.iter().map(|p| p.value).sum();
    Ok(sum / points.len() as f64)
}

/// Queue-depth distribution for a single model pool within a region.
pub async fn model_load_stats<S: StateStore + ?Sized>(
    store: &S,
    region: &str,
    pool: &str,
    window: Duration,
) -> Result<PercentileStats> {
    let points = store.get_metrics("queue_depth", region, window).await?;
    let values = points
        .into_iter()
        .filter(|p| p.dimensions.get("model_pool").map(String::as_str) == Some(pool))
        .map(|p| p.value)
        .collect();
    Ok(PercentileStats::from_values(values))
}

/// End-to-end inference latency distribution for a single model pool within
/// a region, derived from the `"inference_latency_ms"` metric.
pub async fn inference_latency_stats<S: StateStore + ?Sized>(
    store: &S,
    region: &str,
    pool: &str,
    window: Duration,
) -> Result<PercentileStats> {
    let points = store
        .get_metrics("inference_latency_ms", region, window)
        .await?;
    let values = points
        .into_iter()
        .filter(|p| p.dimensions.get("model_pool").map(String::as_str) == Some(pool))
        .map(|p| p.value)
        .collect();
    Ok(PercentileStats::from_values(values))
}

/// Cleanup validation success rate over `window`, combining the audit
/// table's failure records with the `"cleanup_attempts"` counter metric
/// recorded by whatever component performed the validation. Cluster-wide:
/// `CleanupAudit` carries no region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CleanupSuccessRate {
    pub attempts: u64,
    pub failed: u64,
    pub success_rate: f64,
}

pub async fn cleanup_success_rate<S: StateStore + ?Sized>(
    store: &S,
    region: &str,
    window: Duration,
) -> Result<CleanupSuccessRate> {
    let failed = store.get_failed_validations(window).await?.len() as u64;
    let attempts_points = store.get_metrics("cleanup_attempts", region, window).await?;
    let attempts = attempts_points.iter().map(|p| p.value).sum::<f64>() as u64;

    let success_rate = if attempts == 0 {
        1.0
    } else {
        (attempts.saturating_sub(failed)) as f64 / attempts as f64
    };

    Ok(CleanupSuccessRate {
        attempts,
        failed,
        success_rate,
    })
}

/// A single composite snapshot of cluster health, combining traffic,
/// load, cleanup, and routing-health signals. Intended for the Router's
/// own `/metrics` self-stats endpoint and for operator dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterHealthSummary {
    pub region: Region,
    pub rps: f64,
    pub avg_queue_depth: f64,
    pub healthy_count: usize,
    pub degraded_count: usize,
    pub unhealthy_count: usize,
    pub cleanup: CleanupSuccessRate,
}

pub async fn cluster_health_summary<S: StateStore + ?Sized>(
    store: &S,
    region: &str,
    window: Duration,
) -> Result<ClusterHealthSummary> {
    let rps = cluster_rps(store, region, window).await?;
    let avg_queue_depth = average_queue_depth(store, region, window).await?;
    let cleanup = cleanup_success_rate(store, region, window).await?;

    let routing = store.top_instances(region, usize::MAX).await?;
    let mut healthy_count = 0;
    let mut degraded_count = 0;
    let mut unhealthy_count = 0;
    for r in &routing {
        match r.health_status {
            HealthStatus::Healthy => healthy_count += 1,
            HealthStatus::Degraded => degraded_count += 1,
            HealthStatus::Unhealthy => unhealthy_count += 1,
        }
    }

    Ok(ClusterHealthSummary {
        region: region.to_string(),
        rps,
        avg_queue_depth,
        healthy_count,
        degraded_count,
        unhealthy_count,
        cleanup,
    })
}
