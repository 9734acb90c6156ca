//! Instance Registry (C3): worker lifecycle transitions and the routing-score
//! formula the Health Monitor and Regional Router both depend on.
//!
//! Registration seeds a worker in `launching` state with the deliberately
//! low [`mrgc_proto::INITIAL_ROUTING_SCORE`] so a just-started instance
//! does not receive disproportionate traffic before the Health Monitor has
//! probed it even once. Everything else here is a thin, validated wrapper
//! over [`StateStore`] — no state lives in this crate.

#![forbid(unsafe_code)]

use std::time::Duration;

use mrgc_proto::{
    HealthStatus, ProtoError, Region, RoutingState, Worker, WorkerState, INITIAL_ROUTING_SCORE,
};
use mrgc_state::{MutationOutcome, RegisterOutcome, StateStore};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Invalid(#[from] ProtoError),
    #[error(transparent)]
    Store(#[from] mrgc_state::StateStoreError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// `queue_score = max(0, 100 - queue_depth * 10)`
fn queue_score(queue_depth: u32) -> f64 {
    (100i64 - i64::from(queue_depth) * 10).max(0) as f64
}

/// `latency_score = max(0, 100 - avg_latency_ms / 10)`
fn latency_score(avg_latency_ms: f64) -> f64 {
    (100.0 - avg_latency_ms / 10.0).max(0.0)
}

fn health_score(health: HealthStatus) -> f64 {
    match health {
        HealthStatus::Healthy => 100.0,
        HealthStatus::Degraded => 50.0,
        HealthStatus::Unhealthy => 0.0,
    }
}

/// `routing_score = 0.5*queue_score + 0.3*latency_score + 0.2*health_score`,
/// with each weighted term floored before summing (property P8) so the
/// result is reproducible across languages without floating-point rounding
/// drift.
pub fn compute_routing_score(queue_depth: u32, avg_latency_ms: f64, health: HealthStatus) -> u8 {
    let weighted = (0.5 * queue_score(queue_depth)).floor()
        + (0.3 * latency_score(avg_latency_ms)).floor()
        + (0.2 * health_score(health)).floor();
    weighted.clamp(0.0, 100.0) as u8
}

/// Registers a new worker and seeds its initial routing state. Returns
/// [`RegisterOutcome::Conflict`] without touching routing state if the
/// instance ID is already registered (registration is not an upsert).
pub async fn register<S: StateStore + ?Sized>(
    store: &S,
    mut worker: Worker,
) -> Result<RegisterOutcome> {
    mrgc_proto::validate_instance_id(&worker.instance_id)?;
    mrgc_proto::validate_region(&worker.region)?;
    worker.state = WorkerState::Launching;

    let outcome = store.register_instance(worker.clone()).await?;
    if outcome == RegisterOutcome::Created {
        store
            .put_routing_state(RoutingState {
                instance_id: worker.instance_id,
                region: worker.region,
                routing_score: INITIAL_ROUTING_SCORE,
                queue_depth: worker.queue_depth,
                avg_latency_ms: 0.0,
                health_status: HealthStatus::Degraded,
                subnet_cidr: worker.subnet_cidr,
                last_updated: mrgc_proto::now_unix(),
            })
            .await?;
    }
    Ok(outcome)
}

/// Marks a worker `available`, making it eligible for the Health Monitor's
/// next probe cycle. Idempotent.
pub async fn mark_available<S: StateStore + ?Sized>(
    store: &S,
    instance_id: &str,
) -> Result<MutationOutcome> {
    Ok(store
        .update_instance_state(instance_id, WorkerState::Available, None)
        .await?)
}

/// Begins draining a worker: flips lifecycle state but leaves its routing
/// score untouched until the Health Monitor's next cycle recomputes it,
/// unless `demote_immediately` is set (used by the Failover Controller,
/// which cannot wait out a full probe cycle).
pub async fn begin_draining<S: StateStore + ?Sized>(
    store: &S,
    instance_id: &str,
    demote_immediately: bool,
) -> Result<MutationOutcome> {
    let outcome = store
        .update_instance_state(instance_id, WorkerState::Draining, None)
        .await?;
    if outcome == MutationOutcome::Ok && demote_immediately {
        demote_to_zero(store, instance_id).await?;
    }
    Ok(outcome)
}

/// Quarantines a worker and immediately zeroes its routing score: unlike
/// draining, a quarantined instance must stop receiving new traffic before
/// the next probe cycle, not after (invariant I4).
pub async fn quarantine<S: StateStore + ?Sized>(
    store: &S,
    instance_id: &str,
) -> Result<MutationOutcome> {
    let outcome = store
        .update_instance_state(instance_id, WorkerState::Quarantined, None)
        .await?;
    if outcome == MutationOutcome::Ok {
        demote_to_zero(store, instance_id).await?;
    }
    Ok(outcome)
}

async fn demote_to_zero<S: StateStore + ?Sized>(store: &S, instance_id: &str) -> Result<()> {
    let Some(mut routing) = store.get_routing_state(instance_id).await? else {
        return Ok(());
    };
    routing.routing_score = 0;
    routing.queue_depth = mrgc_proto::DEMOTED_QUEUE_DEPTH_SENTINEL;
    routing.avg_latency_ms = mrgc_proto::DEMOTED_LATENCY_SENTINEL_MS;
    routing.health_status = HealthStatus::Unhealthy;
    routing.last_updated = mrgc_proto::now_unix();
    store.put_routing_state(routing).await?;
    Ok(())
}

/// Default generic staleness check (spec.md §4.3): a worker is stale when
/// its last heartbeat is older than `timeout`. Distinct from the Health
/// Monitor's own, separately-configured stale-heartbeat-drain check.
pub fn is_stale(last_heartbeat: i64, timeout: Duration) -> bool {
    mrgc_proto::now_unix() - last_heartbeat > timeout.as_secs() as i64
}

/// All workers in `region` whose heartbeat is older than `timeout`.
pub async fn find_stale<S: StateStore + ?Sized>(
    store: &S,
    region: &Region,
    timeout: Duration,
) -> Result<Vec<Worker>> {
    let workers = store.list_by_region(region, None).await?;
    Ok(workers
        .into_iter()
        .filter(|w| is_stale(w.last_heartbeat, timeout))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn worker(id: &str, region: &str) -> Worker {
        Worker {
            instance_id: id.to_string(),
            region: region.to_string(),
            model_pool: "llama-70b".to_string(),
            ip_address: "10.0.0.1".to_string(),
            subnet_id: "subnet-1".to_string(),
            availability_zone: "az1".to_string(),
            subnet_cidr: "10.0.0.0/24".to_string(),
            state: WorkerState::Launching,
            queue_depth: 0,
            last_heartbeat: mrgc_proto::now_unix(),
            launch_time: mrgc_proto::now_unix(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn routing_score_formula_matches_spec() {
        // queue_depth=2 -> queue_score=80 -> 0.5*80=40
        // avg_latency_ms=50 -> latency_score=95 -> 0.3*95=28.5 -> floor 28
        // healthy -> health_score=100 -> 0.2*100=20
        // total = 40 + 28 + 20 = 88
        let score = compute_routing_score(2, 50.0, HealthStatus::Healthy);
        assert_eq!(score, 88);
    }

    #[test]
    fn routing_score_clamps_to_zero_for_overloaded_unhealthy_worker() {
        let score = compute_routing_score(99, 99999.0, HealthStatus::Unhealthy);
        assert_eq!(score, 0);
    }

    #[tokio::test]
    async fn register_seeds_initial_routing_score() {
        let store = mrgc_state::InMemoryStateStore::new();
        let outcome = register(&store, worker("i-1", "us-east-1")).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Created);

        let routing = store.get_routing_state("i-1").await.unwrap().unwrap();
        assert_eq!(routing.routing_score, INITIAL_ROUTING_SCORE);
    }

    #[tokio::test]
    async fn register_rejects_empty_instance_id() {
        let store = mrgc_state::InMemoryStateStore::new();
        let err = register(&store, worker("", "us-east-1")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Invalid(ProtoError::EmptyInstanceId)));
    }

    #[tokio::test]
    async fn quarantine_zeroes_routing_score_immediately() {
        let store = mrgc_state::InMemoryStateStore::new();
        register(&store, worker("i-1", "us-east-1")).await.unwrap();
        store
            .put_routing_state(RoutingState {
                instance_id: "i-1".to_string(),
                region: "us-east-1".to_string(),
                routing_score: 80,
                queue_depth: 1,
                avg_latency_ms: 20.0,
                health_status: HealthStatus::Healthy,
                subnet_cidr: "10.0.0.0/24".to_string(),
                last_updated: mrgc_proto::now_unix(),
            })
            .await
            .unwrap();

        let outcome = quarantine(&store, "i-1").await.unwrap();
        assert_eq!(outcome, MutationOutcome::Ok);

        let worker = store.get_instance("i-1").await.unwrap().unwrap();
        assert_eq!(worker.state, WorkerState::Quarantined);
        let routing = store.get_routing_state("i-1").await.unwrap().unwrap();
        assert_eq!(routing.routing_score, 0);
        assert_eq!(routing.queue_depth, mrgc_proto::DEMOTED_QUEUE_DEPTH_SENTINEL);
    }

    #[tokio::test]
    async fn find_stale_filters_by_heartbeat_age() {
        let store = mrgc_state::InMemoryStateStore::new();
        let mut fresh = worker("i-fresh", "us-east-1");
        fresh.last_heartbeat = mrgc_proto::now_unix();
        let mut stale = worker("i-stale", "us-east-1");
        stale.last_heartbeat = mrgc_proto::now_unix() - 120;

        store.register_instance(fresh).await.unwrap();
        store.register_instance(stale).await.unwrap();

        let stale_workers = find_stale(&store, &"us-east-1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stale_workers.len(), 1);
        assert_eq!(stale_workers[0].instance_id, "i-stale");
    }
}
