//! State Store Adapter (C1): typed operations over the five logical tables
//! that back the replicated key-value store, plus an in-memory
//! implementation used by every other crate's tests and by local/dev runs.
//!
//! The real, durable substrate (a replicated KV store such as DynamoDB) is
//! explicitly out of scope (spec.md §1); this crate defines the seam —
//! [`StateStore`] — that a production adapter would implement, and ships
//! the in-memory adapter behind it. Every operation here is idempotent
//! where spec.md requires it, and every write fails fast with a
//! retryable-vs-terminal distinction; callers retry, the adapter never does
//! (spec.md §4.1).

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mrgc_proto::{CleanupAudit, MetricPoint, Region, RoutingState, ScalingDecision, Worker, WorkerState};
use parking_lot::RwLock;
use thiserror::Error;

// ─── TTLs (spec.md §3) ──────────────────────────────────────────────────────

pub const WORKER_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
pub const ROUTING_STATE_TTL: Duration = Duration::from_secs(3600);
pub const SCALING_DECISION_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
pub const CLEANUP_AUDIT_TTL: Duration = Duration::from_secs(90 * 24 * 3600);
pub const METRIC_POINT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

// ─── Errors & outcomes ──────────────────────────────────────────────────────

/// Transient/terminal discriminant per §9: "exception-based control flow...
/// collapses to explicit result discriminants ok | transient | terminal".
/// Missing-entity is deliberately NOT an error (§7): it is expressed through
/// `Option`/empty `Vec` and the `MutationOutcome`/`RegisterOutcome` enums.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("terminal storage error: {0}")]
    Terminal(String),
}

pub type Result<T> = std::result::Result<T, StateStoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Ok,
    NotFound,
}

/// The per-(region, model_pool) scaling-state row the Autoscaler persists
/// its dwell timers and last-action timestamp in (spec.md §4.7 step 6, §5's
/// "compare-and-set on `last_scale_time`" soft idempotency barrier).
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingStateRow {
    pub region: Region,
    pub model_pool: String,
    pub desired_capacity: u32,
    pub last_scale_action: Option<mrgc_proto::ScalingAction>,
    /// Unix seconds; 0 means "never scaled".
    pub last_scale_time: i64,
    pub high_rps_since: Option<i64>,
    pub low_rps_since: Option<i64>,
}

impl ScalingStateRow {
    pub fn initial(region: Region, model_pool: String, min_instances: u32) -> Self {
        Self {
            region,
            model_pool,
            desired_capacity: min_instances,
            last_scale_action: None,
            last_scale_time: 0,
            high_rps_since: None,
            low_rps_since: None,
        }
    }
}

// ─── The adapter trait ──────────────────────────────────────────────────────

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn register_instance(&self, worker: Worker) -> Result<RegisterOutcome>;
    async fn update_instance_state(
        &self,
        instance_id: &str,
        state: WorkerState,
        queue_depth: Option<u32>,
    ) -> Result<MutationOutcome>;
    /// Updates `last_heartbeat` and `queue_depth` only. MUST NOT overwrite
    /// `state` (spec.md §4.1, property P7).
    async fn heartbeat(&self, instance_id: &str, queue_depth: u32) -> Result<MutationOutcome>;
    async fn get_instance(&self, instance_id: &str) -> Result<Option<Worker>>;
    async fn list_by_region(&self, region: &str, state: Option<WorkerState>) -> Result<Vec<Worker>>;
    async fn list_by_pool(&self, pool: &str) -> Result<Vec<Worker>>;
    async fn delete_instance(&self, instance_id: &str) -> Result<MutationOutcome>;

    /// Overwrites; there is no partial update of a RoutingState row.
    async fn put_routing_state(&self, state: RoutingState) -> Result<()>;
    async fn get_routing_state(&self, instance_id: &str) -> Result<Option<RoutingState>>;
    /// Ordered by `routing_score` descending.
    async fn top_instances(&self, region: &str, limit: usize) -> Result<Vec<RoutingState>>;

    async fn record_scaling_decision(&self, decision: ScalingDecision) -> Result<()>;
    async fn get_recent_scaling_decisions(
        &self,
        pool: &str,
        window: Duration,
    ) -> Result<Vec<ScalingDecision>>;

    async fn record_cleanup_validation(&self, audit: CleanupAudit) -> Result<()>;
    async fn get_failed_validations(&self, window: Duration) -> Result<Vec<CleanupAudit>>;

    async fn record_metric(&self, point: MetricPoint) -> Result<()>;
    async fn get_metrics(&self, name: &str, region: &str, window: Duration) -> Result<Vec<MetricPoint>>;

    async fn get_scaling_state(&self, region: &str, pool: &str) -> Result<Option<ScalingStateRow>>;
    async fn put_scaling_state(&self, row: ScalingStateRow) -> Result<()>;
    /// Compare-and-set on `last_scale_time`: succeeds (and writes `new_row`)
    /// only if the stored row's `last_scale_time` still equals
    /// `expected_last_scale_time`. Used so two racing Autoscaler ticks
    /// cannot both apply a scaling action (spec.md §5).
    async fn cas_scaling_state_last_action(
        &self,
        region: &str,
        pool: &str,
        expected_last_scale_time: Option<i64>,
        new_row: ScalingStateRow,
    ) -> Result<bool>;
}

// ─── In-memory implementation ───────────────────────────────────────────────

struct Timestamped<T> {
    value: T,
    written_at: i64,
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn not_expired(written_at: i64, ttl: Duration) -> bool {
    now() - written_at < ttl.as_secs() as i64
}

/// Process-local, RwLock-guarded in-memory adapter. Grounded on
/// `claw-metrics::MetricStore`'s concurrency idiom (`RwLock<HashMap<...>>`)
/// rather than `claw-persist::JsonStore`'s file-backed style: a durable
/// substrate is explicitly out of scope, so there is nothing to snapshot to
/// disk here — only the in-process view tests and local runs need.
#[derive(Default)]
pub struct InMemoryStateStore {
    workers: RwLock<HashMap<String, Timestamped<Worker>>>,
    routing: RwLock<HashMap<String, Timestamped<RoutingState>>>,
    scaling_decisions: RwLock<Vec<Timestamped<ScalingDecision>>>,
    cleanup_audits: RwLock<Vec<Timestamped<CleanupAudit>>>,
    metrics: RwLock<Vec<Timestamped<MetricPoint>>>,
    scaling_state: RwLock<HashMap<(String, String), ScalingStateRow>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn register_instance(&self, worker: Worker) -> Result<RegisterOutcome> {
        let mut workers = self.workers.write();
        if workers.contains_key(&worker.instance_id) {
            return Ok(RegisterOutcome::Conflict);
        }
        workers.insert(
            worker.instance_id.clone(),
            Timestamped {
                value: worker,
                written_at: now(),
            },
        );
        Ok(RegisterOutcome::Created)
    }

    async fn update_instance_state(
        &self,
        instance_id: &str,
        state: WorkerState,
        queue_depth: Option<u32>,
    ) -> Result<MutationOutcome> {
        let mut workers = self.workers.write();
        match workers.get_mut(instance_id) {
            Some(entry) => {
                entry.value.state = state;
                if let Some(qd) = queue_depth {
                    entry.value.queue_depth = qd;
                }
                entry.written_at = now();
                Ok(MutationOutcome::Ok)
            }
            None => Ok(MutationOutcome::NotFound),
        }
    }

    async fn heartbeat(&self, instance_id: &str, queue_depth: u32) -> Result<MutationOutcome> {
        let mut workers = self.workers.write();
        match workers.get_mut(instance_id) {
            Some(entry) => {
                let new_hb = now();
                entry.value.last_heartbeat = entry.value.last_heartbeat.max(new_hb);
                entry.value.queue_depth = queue_depth;
                entry.written_at = now();
                Ok(MutationOutcome::Ok)
            }
            None => Ok(MutationOutcome::NotFound),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Worker>> {
        let workers = self.workers.read();
        Ok(workers.get(instance_id).and_then(|e| {
            not_expired(e.written_at, WORKER_TTL).then(|| e.value.clone())
        }))
    }

    async fn list_by_region(&self, region: &str, state: Option<WorkerState>) -> Result<Vec<Worker>> {
        let workers = self.workers.read();
        Ok(workers
            .values()
            .filter(|e| not_expired(e.written_at, WORKER_TTL))
            .map(|e| &e.value)
            .filter(|w| w.region == region)
            .filter(|w| state.is_none_or(|s| w.state == s))
            .cloned()
            .collect())
    }

    async fn list_by_pool(&self, pool: &str) -> Result<Vec<Worker>> {
        let workers = self.workers.read();
        Ok(workers
            .values()
            .filter(|e| not_expired(e.written_at, WORKER_TTL))
            .map(|e| &e.value)
            .filter(|w| w.model_pool == pool)
            .cloned()
            .collect())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<MutationOutcome> {
        let mut workers = self.workers.write();
        match workers.remove(instance_id) {
            Some(_) => Ok(MutationOutcome::Ok),
            None => Ok(MutationOutcome::NotFound),
        }
    }

    async fn put_routing_state(&self, state: RoutingState) -> Result<()> {
        self.routing.write().insert(
            state.instance_id.clone(),
            Timestamped {
                value: state,
                written_at: now(),
            },
        );
        Ok(())
    }

    async fn get_routing_state(&self, instance_id: &str) -> Result<Option<RoutingState>> {
        let routing = self.routing.read();
        Ok(routing.get(instance_id).and_then(|e| {
            not_expired(e.written_at, ROUTING_STATE_TTL).then(|| e.value.clone())
        }))
    }

    async fn top_instances(&self, region: &str, limit: usize) -> Result<Vec<RoutingState>> {
        let routing = self.routing.read();
        let mut rows: Vec<RoutingState> = routing
            .values()
            .filter(|e| not_expired(e.written_at, ROUTING_STATE_TTL))
            .map(|e| e.value.clone())
            .filter(|r| r.region == region)
            .collect();
        rows.sort_by(|a, b| b.routing_score.cmp(&a.routing_score));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn record_scaling_decision(&self, decision: ScalingDecision) -> Result<()> {
        self.scaling_decisions.write().push(Timestamped {
            written_at: now(),
            value: decision,
        });
        Ok(())
    }

    async fn get_recent_scaling_decisions(
        &self,
        pool: &str,
        window: Duration,
    ) -> Result<Vec<ScalingDecision>> {
        let cutoff = now() - window.as_secs() as i64;
        let decisions = self.scaling_decisions.read();
        Ok(decisions
            .iter()
            .filter(|e| not_expired(e.written_at, SCALING_DECISION_TTL))
            .map(|e| &e.value)
            .filter(|d| d.model_pool == pool && d.timestamp >= cutoff)
            .cloned()
            .collect())
    }

    async fn record_cleanup_validation(&self, audit: CleanupAudit) -> Result<()> {
        self.cleanup_audits.write().push(Timestamped {
            written_at: now(),
            value: audit,
        });
        Ok(())
    }

    async fn get_failed_validations(&self, window: Duration) -> Result<Vec<CleanupAudit>> {
        let cutoff = now() - window.as_secs() as i64;
        let audits = self.cleanup_audits.read();
        Ok(audits
            .iter()
            .filter(|e| not_expired(e.written_at, CLEANUP_AUDIT_TTL))
            .map(|e| &e.value)
            .filter(|a| {
                a.status == mrgc_proto::ValidationStatus::Failed && a.validation_timestamp >= cutoff
            })
            .cloned()
            .collect())
    }

    async fn record_metric(&self, point: MetricPoint) -> Result<()> {
        self.metrics.write().push(Timestamped {
            written_at: now(),
            value: point,
        });
        Ok(())
    }

    async fn get_metrics(&self, name: &str, region: &str, window: Duration) -> Result<Vec<MetricPoint>> {
        let cutoff = now() - window.as_secs() as i64;
        let metrics = self.metrics.read();
        Ok(metrics
            .iter()
            .filter(|e| not_expired(e.written_at, METRIC_POINT_TTL))
            .map(|e| &e.value)
            .filter(|m| m.metric_name == name && m.region == region && m.timestamp_minute >= cutoff)
            .cloned()
            .collect())
    }

    async fn get_scaling_state(&self, region: &str, pool: &str) -> Result<Option<ScalingStateRow>> {
        Ok(self
            .scaling_state
            .read()
            .get(&(region.to_string(), pool.to_string()))
            .cloned())
    }

    async fn put_scaling_state(&self, row: ScalingStateRow) -> Result<()> {
        self.scaling_state
            .write()
            .insert((row.region.clone(), row.model_pool.clone()), row);
        Ok(())
    }

    async fn cas_scaling_state_last_action(
        &self,
        region: &str,
        pool: &str,
        expected_last_scale_time: Option<i64>,
        new_row: ScalingStateRow,
    ) -> Result<bool> {
        let mut state = self.scaling_state.write();
        let key = (region.to_string(), pool.to_string());
        let current = state.get(&key).map(|r| r.last_scale_time);
        if current != expected_last_scale_time {
            return Ok(false);
        }
        state.insert(key, new_row);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrgc_proto::HealthStatus;

    fn worker(id: &str, region: &str) -> Worker {
        Worker {
            instance_id: id.to_string(),
            region: region.to_string(),
            model_pool: "default".to_string(),
            ip_address: "10.0.0.1".to_string(),
            subnet_id: "subnet-1".to_string(),
            availability_zone: "az1".to_string(),
            subnet_cidr: "10.0.0.0/24".to_string(),
            state: WorkerState::Launching,
            queue_depth: 0,
            last_heartbeat: now(),
            launch_time: now(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn register_then_conflict_on_repeat() {
        let store = InMemoryStateStore::new();
        let outcome = store.register_instance(worker("i-1", "us-east-1")).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Created);

        let repeat = store.register_instance(worker("i-1", "us-east-1")).await.unwrap();
        assert_eq!(repeat, RegisterOutcome::Conflict);

        let listed = store.list_by_region("us-east-1", None).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_never_mutates_state() {
        let store = InMemoryStateStore::new();
        store.register_instance(worker("i-1", "us-east-1")).await.unwrap();
        store
            .update_instance_state("i-1", WorkerState::Available, None)
            .await
            .unwrap();

        store.heartbeat("i-1", 3).await.unwrap();

        let w = store.get_instance("i-1").await.unwrap().unwrap();
        assert_eq!(w.state, WorkerState::Available);
        assert_eq!(w.queue_depth, 3);
    }

    #[tokio::test]
    async fn heartbeat_on_missing_instance_is_not_found() {
        let store = InMemoryStateStore::new();
        let outcome = store.heartbeat("ghost", 1).await.unwrap();
        assert_eq!(outcome, MutationOutcome::NotFound);
    }

    #[tokio::test]
    async fn top_instances_orders_by_score_descending() {
        let store = InMemoryStateStore::new();
        for (id, score) in [("i-1", 40u8), ("i-2", 90), ("i-3", 60)] {
            store
                .put_routing_state(RoutingState {
                    instance_id: id.to_string(),
                    region: "us-east-1".to_string(),
                    routing_score: score,
                    queue_depth: 0,
                    avg_latency_ms: 10.0,
                    health_status: HealthStatus::Healthy,
                    subnet_cidr: "10.0.0.0/24".to_string(),
                    last_updated: now(),
                })
                .await
                .unwrap();
        }

        let top = store.top_instances("us-east-1", 2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].instance_id, "i-2");
        assert_eq!(top[1].instance_id, "i-3");
    }

    #[tokio::test]
    async fn cas_scaling_state_rejects_stale_expectation() {
        let store = InMemoryStateStore::new();
        let row = ScalingStateRow::initial("us-east-1".to_string(), "default".to_string(), 2);
        store.put_scaling_state(row.clone()).await.unwrap();

        let mut updated = row.clone();
        updated.last_scale_time = now();
        let ok = store
            .cas_scaling_state_last_action("us-east-1", "default", Some(123), updated.clone())
            .await
            .unwrap();
        assert!(!ok, "cas must reject when expected last_scale_time doesn't match");

        let ok2 = store
            .cas_scaling_state_last_action("us-east-1", "default", Some(0), updated)
            .await
            .unwrap();
        assert!(ok2);
    }

    #[tokio::test]
    async fn failed_validations_filters_by_status_and_window() {
        let store = InMemoryStateStore::new();
        store
            .record_cleanup_validation(CleanupAudit {
                instance_id: "i-1".to_string(),
                validation_timestamp: now(),
                status: mrgc_proto::ValidationStatus::Failed,
                subchecks: HashMap::new(),
                integrity_check: false,
                failure_reason: Some("disk not scrubbed".to_string()),
                quarantine_reason: None,
            })
            .await
            .unwrap();
        store
            .record_cleanup_validation(CleanupAudit {
                instance_id: "i-2".to_string(),
                validation_timestamp: now(),
                status: mrgc_proto::ValidationStatus::Passed,
                subchecks: HashMap::new(),
                integrity_check: true,
                failure_reason: None,
                quarantine_reason: None,
            })
            .await
            .unwrap();

        let failed = store.get_failed_validations(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].instance_id, "i-1");
    }
}
