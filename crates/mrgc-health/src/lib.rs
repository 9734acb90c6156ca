//! Health Monitor (C4): bounded-concurrency worker probing, routing-state
//! write-back, and region-health aggregation.
//!
//! Every probe cycle fans out across all `available` workers in a region
//! with no more than [`mrgc_config::HealthMonitorConfig::max_concurrent_probes`]
//! probes in flight at once, classifies each response, and overwrites that
//! worker's `RoutingState` row with a freshly computed routing score. A
//! worker whose heartbeat has gone stale is drained out of rotation in the
//! same cycle, independent of probe results.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use mrgc_config::HealthMonitorConfig;
use mrgc_proto::{
    HealthProbeResponse, HealthStatus, Region, RoutingState, Worker, WorkerState,
    DEMOTED_LATENCY_SENTINEL_MS, DEMOTED_QUEUE_DEPTH_SENTINEL,
};
use mrgc_state::StateStore;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Store(#[from] mrgc_state::StateStoreError),
    #[error(transparent)]
    Registry(#[from] mrgc_registry::RegistryError),
}

pub type Result<T> = std::result::Result<T, HealthError>;

/// Outcome of a single probe attempt, successful or not.
pub struct ProbeRecord {
    pub response: Option<HealthProbeResponse>,
    pub rtt: Duration,
    pub error: Option<String>,
}

/// Trait-at-the-seam adapter for reaching a worker's `GET /health` endpoint.
/// Grounded on the same shape as the bounded-concurrency fan-out idiom this
/// crate uses to drive it: an async trait object the monitor is indifferent
/// to the transport of.
#[async_trait]
pub trait WorkerProbe: Send + Sync {
    async fn probe(&self, worker: &Worker, timeout: Duration) -> ProbeRecord;
}

/// Default `WorkerProbe` backed by a shared `reqwest::Client`.
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerProbe for ReqwestProbe {
    async fn probe(&self, worker: &Worker, timeout: Duration) -> ProbeRecord {
        let start = Instant::now();
        let url = format!("http://{}/health", worker.ip_address);
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<HealthProbeResponse>().await {
                Ok(body) => ProbeRecord {
                    response: Some(body),
                    rtt: start.elapsed(),
                    error: None,
                },
                Err(e) => ProbeRecord {
                    response: None,
                    rtt: start.elapsed(),
                    error: Some(e.to_string()),
                },
            },
            Ok(resp) => ProbeRecord {
                response: None,
                rtt: start.elapsed(),
                error: Some(format!("http status {}", resp.status())),
            },
            Err(e) => ProbeRecord {
                response: None,
                rtt: start.elapsed(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Classifies a probe outcome against the prior consecutive-failure count,
/// returning the new status and updated failure count.
///
/// A successful response with acceptable queue depth and RTT is `healthy`;
/// a successful response exceeding either threshold is `degraded`. A failed
/// probe (non-2xx, timeout, connection error) is `degraded` until
/// `failure_threshold` consecutive failures accumulate, at which point it
/// becomes `unhealthy`.
pub fn classify(
    record: &ProbeRecord,
    config: &HealthMonitorConfig,
    consecutive_failures: u32,
) -> (HealthStatus, u32) {
    match &record.response {
        Some(resp) => {
            let within_bounds =
                resp.queue_depth <= config.degraded_queue_depth && record.rtt <= config.degraded_rtt;
            if within_bounds {
                (HealthStatus::Healthy, 0)
            } else {
                (HealthStatus::Degraded, 0)
            }
        }
        None => {
            let failures = consecutive_failures + 1;
            if failures >= config.failure_threshold {
                (HealthStatus::Unhealthy, failures)
            } else {
                (HealthStatus::Degraded, failures)
            }
        }
    }
}

/// Tallies from a single probe cycle over one region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub probed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub drained_stale: usize,
}

/// Aggregate region health from per-worker counts (spec.md's 80%/50%
/// thresholds): >=80% healthy is `healthy`, >=50% is `degraded`, otherwise
/// `unhealthy`. A region with no instances at all is `unhealthy`.
pub fn aggregate_region_health(summary: &CycleSummary) -> (HealthStatus, Option<String>) {
    let total = summary.healthy + summary.degraded + summary.unhealthy;
    if total == 0 {
        return (HealthStatus::Unhealthy, Some("no instances".to_string()));
    }
    let healthy_fraction = summary.healthy as f64 / total as f64;
    let status = if healthy_fraction >= 0.8 {
        HealthStatus::Healthy
    } else if healthy_fraction >= 0.5 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    };
    (status, None)
}

/// Drives probe cycles for a single region, holding the in-process
/// consecutive-failure counters that persist across cycles but not across
/// process restarts — the same scope the routing-score cache itself has.
pub struct HealthMonitor<P: WorkerProbe> {
    probe: P,
    config: HealthMonitorConfig,
    failure_counts: RwLock<HashMap<String, u32>>,
}

impl<P: WorkerProbe> HealthMonitor<P> {
    pub fn new(probe: P, config: HealthMonitorConfig) -> Self {
        Self {
            probe,
            config,
            failure_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Runs one full probe cycle over every `available` worker in `region`,
    /// then drains any worker whose heartbeat has gone stale.
    pub async fn run_cycle<S: StateStore + ?Sized>(
        &self,
        store: &S,
        region: &Region,
    ) -> Result<CycleSummary> {
        let workers = store
            .list_by_region(region, Some(WorkerState::Available))
            .await?;

        let probe = &self.probe;
        let timeout = self.config.probe_timeout;
        let results = stream::iter(workers.into_iter().map(|worker| {
            let probe = probe;
            async move {
                let record = probe.probe(&worker, timeout).await;
                (worker, record)
            }
        }))
        .buffer_unordered(self.config.max_concurrent_probes)
        .collect::<Vec<_>>()
        .await;

        let mut summary = CycleSummary::default();
        for (worker, record) in results {
            summary.probed += 1;
            if let Some(err) = &record.error {
                debug!(instance = %worker.instance_id, error = %err, "probe failed");
            }

            let prev_failures = *self
                .failure_counts
                .read()
                .get(&worker.instance_id)
                .unwrap_or(&0);
            let (status, failures) = classify(&record, &self.config, prev_failures);
            self.failure_counts
                .write()
                .insert(worker.instance_id.clone(), failures);

            let (queue_depth, avg_latency_ms) = match (&record.response, status) {
                (Some(resp), _) => (resp.queue_depth, record.rtt.as_secs_f64() * 1000.0),
                (None, HealthStatus::Unhealthy) => {
                    (DEMOTED_QUEUE_DEPTH_SENTINEL, DEMOTED_LATENCY_SENTINEL_MS)
                }
                (None, _) => (worker.queue_depth, record.rtt.as_secs_f64() * 1000.0),
            };
            let routing_score = mrgc_registry::compute_routing_score(queue_depth, avg_latency_ms, status);

            store
                .put_routing_state(RoutingState {
                    instance_id: worker.instance_id.clone(),
                    region: worker.region.clone(),
                    routing_score,
                    queue_depth,
                    avg_latency_ms,
                    health_status: status,
                    subnet_cidr: worker.subnet_cidr.clone(),
                    last_updated: mrgc_proto::now_unix(),
                })
                .await?;

            match status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
            }
        }

        let stale = mrgc_registry::find_stale(store, region, self.config.stale_heartbeat_timeout).await?;
        for worker in stale {
            warn!(instance = %worker.instance_id, "stale heartbeat, draining");
            mrgc_registry::begin_draining(store, &worker.instance_id, true).await?;
            summary.drained_stale += 1;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn cfg() -> HealthMonitorConfig {
        HealthMonitorConfig::default()
    }

    fn healthy_record() -> ProbeRecord {
        ProbeRecord {
            response: Some(HealthProbeResponse {
                status: "ok".to_string(),
                queue_depth: 2,
                gpu_healthy: true,
                enclave_healthy: true,
                models_loaded: vec!["llama-70b".to_string()],
            }),
            rtt: Duration::from_millis(50),
            error: None,
        }
    }

    #[test]
    fn classify_healthy_response_resets_failures() {
        let (status, failures) = classify(&healthy_record(), &cfg(), 2);
        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(failures, 0);
    }

    #[test]
    fn classify_high_queue_depth_is_degraded() {
        let mut record = healthy_record();
        record.response.as_mut().unwrap().queue_depth = 9;
        let (status, failures) = classify(&record, &cfg(), 0);
        assert_eq!(status, HealthStatus::Degraded);
        assert_eq!(failures, 0);
    }

    #[test]
    fn classify_failures_below_threshold_stay_degraded() {
        let record = ProbeRecord {
            response: None,
            rtt: Duration::from_secs(10),
            error: Some("timeout".to_string()),
        };
        let (status, failures) = classify(&record, &cfg(), 1);
        assert_eq!(status, HealthStatus::Degraded);
        assert_eq!(failures, 2);
    }

    #[test]
    fn classify_failures_at_threshold_go_unhealthy() {
        let record = ProbeRecord {
            response: None,
            rtt: Duration::from_secs(10),
            error: Some("timeout".to_string()),
        };
        let (status, failures) = classify(&record, &cfg(), 2);
        assert_eq!(status, HealthStatus::Unhealthy);
        assert_eq!(failures, 3);
    }

    #[test]
    fn aggregate_region_health_empty_is_unhealthy_no_instances() {
        let summary = CycleSummary::default();
        let (status, reason) = aggregate_region_health(&summary);
        assert_eq!(status, HealthStatus::Unhealthy);
        assert_eq!(reason.as_deref(), Some("no instances"));
    }

    #[test]
    fn aggregate_region_health_thresholds() {
        let mostly_healthy = CycleSummary {
            probed: 10,
            healthy: 9,
            degraded: 1,
            unhealthy: 0,
            drained_stale: 0,
        };
        assert_eq!(aggregate_region_health(&mostly_healthy).0, HealthStatus::Healthy);

        let half_healthy = CycleSummary {
            probed: 10,
            healthy: 5,
            degraded: 5,
            unhealthy: 0,
            drained_stale: 0,
        };
        assert_eq!(aggregate_region_health(&half_healthy).0, HealthStatus::Degraded);

        let mostly_unhealthy = CycleSummary {
            probed: 10,
            healthy: 2,
            degraded: 0,
            unhealthy: 8,
            drained_stale: 0,
        };
        assert_eq!(aggregate_region_health(&mostly_unhealthy).0, HealthStatus::Unhealthy);
    }

    struct StubProbe {
        responses: StdHashMap<String, ProbeRecord>,
    }

    #[async_trait::async_trait]
    impl WorkerProbe for StubProbe {
        async fn probe(&self, worker: &Worker, _timeout: Duration) -> ProbeRecord {
            match self.responses.get(&worker.instance_id) {
                Some(ProbeRecord {
                    response,
                    rtt,
                    error,
                }) => ProbeRecord {
                    response: response.clone(),
                    rtt: *rtt,
                    error: error.clone(),
                },
                None => ProbeRecord {
                    response: None,
                    rtt: Duration::from_secs(0),
                    error: Some("no stub configured".to_string()),
                },
            }
        }
    }

    fn worker(id: &str, region: &str) -> Worker {
        Worker {
            instance_id: id.to_string(),
            region: region.to_string(),
            model_pool: "llama-70b".to_string(),
            ip_address: "10.0.0.1".to_string(),
            subnet_id: "subnet-1".to_string(),
            availability_zone: "az1".to_string(),
            subnet_cidr: "10.0.0.0/24".to_string(),
            state: WorkerState::Available,
            queue_depth: 0,
            last_heartbeat: mrgc_proto::now_unix(),
            launch_time: mrgc_proto::now_unix(),
            metadata: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn run_cycle_writes_routing_state_for_each_worker() {
        let store = mrgc_state::InMemoryStateStore::new();
        store.register_instance(worker("i-1", "us-east-1")).await.unwrap();

        let mut responses = StdHashMap::new();
        responses.insert("i-1".to_string(), healthy_record());
        let monitor = HealthMonitor::new(StubProbe { responses }, cfg());

        let summary = monitor
            .run_cycle(&store, &"us-east-1".to_string())
            .await
            .unwrap();
        assert_eq!(summary.healthy, 1);

        let routing = store.get_routing_state("i-1").await.unwrap().unwrap();
        assert_eq!(routing.health_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn run_cycle_drains_stale_workers() {
        let store = mrgc_state::InMemoryStateStore::new();
        let mut stale = worker("i-stale", "us-east-1");
        stale.last_heartbeat = mrgc_proto::now_unix() - 200;
        store.register_instance(stale).await.unwrap();

        let monitor = HealthMonitor::new(
            StubProbe {
                responses: StdHashMap::new(),
            },
            cfg(),
        );
        let summary = monitor
            .run_cycle(&store, &"us-east-1".to_string())
            .await
            .unwrap();
        assert_eq!(summary.drained_stale, 1);

        let w = store.get_instance("i-stale").await.unwrap().unwrap();
        assert_eq!(w.state, WorkerState::Draining);
    }
}
