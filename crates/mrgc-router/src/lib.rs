#![forbid(unsafe_code)]
//! Regional Router (C5): stateless per-request worker selection and forward.
//!
//! Reads candidates from C3 (score-ordered), applies the tie-break chain,
//! forwards the opaque encrypted payload over HTTP, and maps the outcome
//! back to a client-facing status. The router keeps only a per-process
//! request-stats cache; authoritative routing state lives in the state
//! store.

use mrgc_config::RouterConfig;
use mrgc_proto::InferenceHeaders;
use mrgc_state::StateStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("state store: {0}")]
    Store(#[from] mrgc_state::StateStoreError),
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// A routable worker: `RoutingState`'s score/health fields joined with the
/// `Worker` row's dispatch address, since C3's score-ordered read doesn't
/// itself carry `model_pool` or `ip_address`.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub instance_id: String,
    pub ip_address: String,
    pub routing_score: u8,
    pub queue_depth: u32,
    pub avg_latency_ms: f64,
    pub subnet_cidr: String,
}

/// Selects candidates for `model_pool`: top-K by score, filtered to the
/// pool and to the hard routing-score floor, then tie-broken per spec.md
/// §4.5: lower `queue_depth`, then lower `avg_latency_ms`, then same-subnet
/// affinity (if `subnet_hint` is given), then lexicographic `instance_id`.
pub async fn select_candidates<S: StateStore + ?Sized>(
    store: &S,
    region: &str,
    model_pool: &str,
    subnet_hint: Option<&str>,
    config: &RouterConfig,
) -> Result<Vec<Candidate>> {
    let top = store.top_instances(region, config.candidate_pool_size).await?;
    let mut candidates = Vec::new();
    for r in top {
        if r.routing_score <= config.dispatch_score_floor {
            continue;
        }
        let Some(worker) = store.get_instance(&r.instance_id).await? else {
            continue;
        };
        if worker.model_pool != model_pool {
            continue;
        }
        candidates.push(Candidate {
            instance_id: r.instance_id,
            ip_address: worker.ip_address,
            routing_score: r.routing_score,
            queue_depth: r.queue_depth,
            avg_latency_ms: r.avg_latency_ms,
            subnet_cidr: r.subnet_cidr,
        });
    }

    candidates.sort_by(|a, b| {
        b.routing_score
            .cmp(&a.routing_score)
            .then(a.queue_depth.cmp(&b.queue_depth))
            .then(a.avg_latency_ms.total_cmp(&b.avg_latency_ms))
            .then_with(|| match subnet_hint {
                Some(hint) => {
                    let a_match = a.subnet_cidr == hint;
                    let b_match = b.subnet_cidr == hint;
                    b_match.cmp(&a_match)
                }
                None => std::cmp::Ordering::Equal,
            })
            .then(a.instance_id.cmp(&b.instance_id))
    });

    Ok(candidates)
}

/// Outcome of one forward attempt, mirroring spec.md §4.5 step 5's mapping.
#[derive(Debug)]
pub enum ForwardOutcome {
    Success { status: u16, body: Vec<u8> },
    ConnectError,
    Timeout,
    Other { status: u16, body: Vec<u8> },
}

/// Forwards the opaque payload to one candidate's inference endpoint.
pub async fn forward_request(
    client: &reqwest::Client,
    target_ip: &str,
    payload: Vec<u8>,
    headers: &InferenceHeaders,
    timeout: Duration,
) -> ForwardOutcome {
    let url = format!("http://{target_ip}:8080/inference");
    let result = client
        .post(&url)
        .header("Content-Type", "application/octet-stream")
        .header("X-KMS-Key-ARN", &headers.kms_key_arn)
        .header("X-Tenant-ID", &headers.tenant_id)
        .header("X-Model-Pool", &headers.model_pool)
        .header("X-Request-ID", &headers.request_id)
        .timeout(timeout)
        .body(payload)
        .send()
        .await;

    match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            if (200..300).contains(&status) {
                ForwardOutcome::Success { status, body }
            } else {
                ForwardOutcome::Other { status, body }
            }
        }
        Err(e) if e.is_timeout() => ForwardOutcome::Timeout,
        Err(_) => ForwardOutcome::ConnectError,
    }
}

/// Processes one inference request end to end: select a candidate, forward,
/// retry once on connect error against the next candidate, never retry on
/// timeout.
pub async fn process_request<S: StateStore + ?Sized>(
    store: &S,
    client: &reqwest::Client,
    region: &str,
    payload: Vec<u8>,
    headers: &InferenceHeaders,
    subnet_hint: Option<&str>,
    config: &RouterConfig,
) -> (ForwardOutcome, Option<String>) {
    let candidates = match select_candidates(store, region, &headers.model_pool, subnet_hint, config).await {
        Ok(c) => c,
        Err(_) => return (ForwardOutcome::ConnectError, None),
    };

    if candidates.is_empty() {
        return (ForwardOutcome::Other { status: 503, body: b"no_capacity".to_vec() }, None);
    }

    let first = &candidates[0];
    let outcome = forward_request(client, &first.ip_address, payload.clone(), headers, config.forward_timeout).await;

    match outcome {
        ForwardOutcome::ConnectError => {
            demote(store, &first.instance_id).await;
            if let Some(second) = candidates.get(1) {
                let retried = forward_request(client, &second.ip_address, payload, headers, config.forward_timeout).await;
                (retried, Some(second.instance_id.clone()))
            } else {
                (ForwardOutcome::Other { status: 503, body: b"no_capacity".to_vec() }, Some(first.instance_id.clone()))
            }
        }
        other => (other, Some(first.instance_id.clone())),
    }
}

/// Demotes a worker's routing score to zero in the shared store after a
/// connect failure. Best-effort: failures here are logged, not propagated,
/// since the request path must still complete.
async fn demote<S: StateStore + ?Sized>(store: &S, instance_id: &str) {
    if let Ok(Some(mut state)) = store.get_routing_state(instance_id).await {
        state.routing_score = 0;
        if let Err(e) = store.put_routing_state(state).await {
            tracing::warn!(instance_id, error = %e, "failed to demote unresponsive worker");
        }
    }
}

/// Per-process request counters, exposed on the router's `/metrics`
/// endpoint. Distinct from `mrgc-metrics`'s cluster-wide aggregates: this
/// is this one router process's own view.
#[derive(Default)]
pub struct RouterStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_routing_time_micros: AtomicU64,
}

#[derive(Debug, serde::Serialize)]
pub struct RouterStatsSnapshot {
    pub region: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate_pct: f64,
    pub avg_routing_time_seconds: f64,
}

impl RouterStats {
    pub fn record(&self, success: bool, routing_time: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_routing_time_micros
            .fetch_add(routing_time.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, region: &str) -> RouterStatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let total_micros = self.total_routing_time_micros.load(Ordering::Relaxed);

        let success_rate_pct = if total > 0 {
            (successful as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let avg_routing_time_seconds = if total > 0 {
            (total_micros as f64 / total as f64) / 1_000_000.0
        } else {
            0.0
        };

        RouterStatsSnapshot {
            region: region.to_string(),
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            success_rate_pct,
            avg_routing_time_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrgc_proto::{HealthStatus, RoutingState, Worker, WorkerState};
    use mrgc_state::InMemoryStateStore;
    use std::collections::HashMap;

    fn router_config() -> RouterConfig {
        RouterConfig {
            candidate_pool_size: 10,
            dispatch_score_floor: 50,
            forward_timeout: Duration::from_secs(1),
            cache_refresh_interval: Duration::from_secs(30),
        }
    }

    fn routing_state(id: &str, region: &str, score: u8, queue_depth: u32, latency: f64) -> RoutingState {
        RoutingState {
            instance_id: id.to_string(),
            region: region.to_string(),
            routing_score: score,
            queue_depth,
            avg_latency_ms: latency,
            health_status: HealthStatus::Healthy,
            subnet_cidr: "10.0.1.1".to_string(),
            last_updated: mrgc_proto::now_unix(),
        }
    }

    fn worker(id: &str, region: &str, pool: &str) -> Worker {
        Worker {
            instance_id: id.to_string(),
            region: region.to_string(),
            model_pool: pool.to_string(),
            ip_address: format!("10.0.0.{}", id.len()),
            subnet_id: "subnet-a".to_string(),
            availability_zone: "az-a".to_string(),
            subnet_cidr: "10.0.1.1".to_string(),
            state: WorkerState::Available,
            queue_depth: 0,
            last_heartbeat: mrgc_proto::now_unix(),
            launch_time: mrgc_proto::now_unix(),
            metadata: HashMap::new(),
        }
    }

    async fn seed(store: &InMemoryStateStore, id: &str, region: &str, score: u8, queue_depth: u32, latency: f64) {
        store.register_instance(worker(id, region, "default")).await.unwrap();
        store
            .put_routing_state(routing_state(id, region, score, queue_depth, latency))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_registry_yields_no_candidates() {
        let store = InMemoryStateStore::new();
        let config = router_config();
        let candidates = select_candidates(&store, "us-east-1", "default", None, &config)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn candidates_below_score_floor_are_excluded() {
        let store = InMemoryStateStore::new();
        seed(&store, "i-1", "us-east-1", 40, 0, 10.0).await;
        let config = router_config();
        let candidates = select_candidates(&store, "us-east-1", "default", None, &config)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn candidates_from_a_different_model_pool_are_excluded() {
        let store = InMemoryStateStore::new();
        store.register_instance(worker("i-other-pool", "us-east-1", "vision")).await.unwrap();
        store
            .put_routing_state(routing_state("i-other-pool", "us-east-1", 80, 0, 10.0))
            .await
            .unwrap();
        let config = router_config();
        let candidates = select_candidates(&store, "us-east-1", "default", None, &config)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn tie_break_prefers_lower_queue_depth_then_lower_latency() {
        let store = InMemoryStateStore::new();
        seed(&store, "i-b", "us-east-1", 80, 3, 50.0).await;
        seed(&store, "i-a", "us-east-1", 80, 1, 10.0).await;
        let config = router_config();
        let candidates = select_candidates(&store, "us-east-1", "default", None, &config)
            .await
            .unwrap();
        assert_eq!(candidates[0].instance_id, "i-a");
    }

    #[tokio::test]
    async fn tie_break_falls_back_to_lexicographic_instance_id() {
        let store = InMemoryStateStore::new();
        seed(&store, "i-z", "us-east-1", 80, 2, 20.0).await;
        seed(&store, "i-a", "us-east-1", 80, 2, 20.0).await;
        let config = router_config();
        let candidates = select_candidates(&store, "us-east-1", "default", None, &config)
            .await
            .unwrap();
        assert_eq!(candidates[0].instance_id, "i-a");
    }

    #[tokio::test]
    async fn connect_error_demotes_worker_score_to_zero() {
        let store = InMemoryStateStore::new();
        seed(&store, "i-dead", "us-east-1", 80, 0, 5.0).await;
        demote(&store, "i-dead").await;
        let state = store.get_routing_state("i-dead").await.unwrap().unwrap();
        assert_eq!(state.routing_score, 0);
    }

    #[tokio::test]
    async fn stats_track_success_rate_and_average_routing_time() {
        let stats = RouterStats::default();
        stats.record(true, Duration::from_millis(10));
        stats.record(false, Duration::from_millis(30));
        let snapshot = stats.snapshot("us-east-1");
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.success_rate_pct, 50.0);
        assert!(snapshot.avg_routing_time_seconds > 0.0);
    }
}
