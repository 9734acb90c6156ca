#![forbid(unsafe_code)]
//! Autoscaler (C7): per-region, per-pool instance count control.
//!
//! Each tick compares current request rate against dwell-timer-gated
//! thresholds derived from `target_rps_per_instance`. A scale-up or
//! scale-down action only fires once the threshold has been crossed
//! continuously for the configured dwell period; crossing back clears the
//! timer. Every tick records a [`ScalingDecision`], including ticks that
//! decide [`ScalingAction::None`] — the audit trail has to explain every
//! non-action too, not just the active ones.

use async_trait::async_trait;
use mrgc_config::AutoscalerConfig;
use mrgc_proto::{Region, ScalingAction, ScalingDecision, Worker};
use mrgc_state::{ScalingStateRow, StateStore};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutoscalerError {
    #[error("state store: {0}")]
    Store(#[from] mrgc_state::StateStoreError),
    #[error("compute api: {0}")]
    Compute(#[from] ComputeApiError),
}

pub type Result<T> = std::result::Result<T, AutoscalerError>;

/// Scale-up threshold carries a 20% buffer over the raw per-instance target
/// so a brief spike above nominal capacity doesn't immediately trigger a
/// launch; scale-down has no such buffer; it fires as soon as load drops
/// under half of nominal capacity.
const SCALE_UP_BUFFER: f64 = 1.2;
const SCALE_DOWN_FACTOR: f64 = 0.5;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Adapter over the fleet-provisioning backend. Grounded on the same
/// launch/terminate shape the teacher's provider adapter and this crate's
/// siblings (`WorkerProbe`, `TrafficDirector`) already use as their seam.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn launch(&self, region: &Region, pool: &str) -> std::result::Result<Worker, ComputeApiError>;
    async fn terminate(&self, instance_id: &str) -> std::result::Result<(), ComputeApiError>;
}

#[derive(Debug, Error)]
pub enum ComputeApiError {
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("terminate failed: {0}")]
    TerminateFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub action: ScalingAction,
    pub desired_capacity: u32,
    pub reason: String,
    /// `true` if a concurrent tick won the compare-and-set race and this
    /// tick's action (if any) was dropped without being applied.
    pub lost_race: bool,
}

/// Evaluates one autoscaler tick for `(region, pool)` and persists the
/// updated dwell-timer / scaling-state row via compare-and-set. Does not
/// itself call out to `ComputeApi`; callers apply the returned action with
/// [`apply_scale_up`] / [`apply_scale_down`].
pub async fn tick<S: StateStore + ?Sized>(
    store: &S,
    region: &Region,
    pool: &str,
    current_rps: f64,
    current_count: u32,
    config: &AutoscalerConfig,
) -> Result<TickOutcome> {
    let existing = store.get_scaling_state(region, pool).await?;
    let expected_last_scale_time = existing.as_ref().map(|r| r.last_scale_time);
    let mut state = existing.unwrap_or_else(|| {
        ScalingStateRow::initial(region.clone(), pool.to_string(), config.min_instances)
    });

    let now = now_unix();
    let cooldown_secs = config.cooldown.as_secs() as i64;
    let in_cooldown = state.last_scale_time != 0 && now - state.last_scale_time < cooldown_secs;

    let mut action = ScalingAction::None;
    let mut desired_capacity = current_count.max(config.min_instances);
    let mut reason = "no scaling needed".to_string();

    if in_cooldown {
        reason = "in cooldown period".to_string();
    } else {
        let target_rps = config.target_rps_per_instance * current_count as f64;

        if current_count < config.max_instances {
            let scale_up_threshold = target_rps * SCALE_UP_BUFFER;
            if current_rps > scale_up_threshold {
                match state.high_rps_since {
                    None => {
                        state.high_rps_since = Some(now);
                        reason = "high rps, starting dwell timer".to_string();
                    }
                    Some(since) => {
                        let duration = now - since;
                        if duration >= config.scale_up_dwell.as_secs() as i64 {
                            action = ScalingAction::ScaleUp;
                            desired_capacity = (current_count + 1).min(config.max_instances);
                            reason = format!("rps {current_rps:.1} over {scale_up_threshold:.1} for {duration}s");
                        } else {
                            reason = format!("rps over threshold for {duration}s, below dwell");
                        }
                    }
                }
            } else if state.high_rps_since.is_some() {
                state.high_rps_since = None;
            }
        }

        if action == ScalingAction::None && current_count > config.min_instances {
            let scale_down_threshold = target_rps * SCALE_DOWN_FACTOR;
            if current_rps < scale_down_threshold {
                match state.low_rps_since {
                    None => {
                        state.low_rps_since = Some(now);
                        reason = "low rps, starting dwell timer".to_string();
                    }
                    Some(since) => {
                        let duration = now - since;
                        if duration >= config.scale_down_dwell.as_secs() as i64 {
                            action = ScalingAction::ScaleDown;
                            desired_capacity = (current_count - 1).max(config.min_instances);
                            reason = format!("rps {current_rps:.1} under {scale_down_threshold:.1} for {duration}s");
                        } else {
                            reason = format!("rps under threshold for {duration}s, below dwell");
                        }
                    }
                }
            } else if state.low_rps_since.is_some() {
                state.low_rps_since = None;
            }
        }
    }

    if action != ScalingAction::None {
        state.desired_capacity = desired_capacity;
        state.last_scale_action = Some(action);
        state.last_scale_time = now;
        state.high_rps_since = None;
        state.low_rps_since = None;
    }

    let accepted = store
        .cas_scaling_state_last_action(region, pool, expected_last_scale_time, state.clone())
        .await?;

    let outcome = if accepted {
        TickOutcome {
            action,
            desired_capacity,
            reason,
            lost_race: false,
        }
    } else {
        tracing::warn!(%region, pool, "lost scaling race to a concurrent tick");
        TickOutcome {
            action: ScalingAction::None,
            desired_capacity: current_count,
            reason: "lost race to concurrent tick".to_string(),
            lost_race: true,
        }
    };

    store
        .record_scaling_decision(ScalingDecision {
            model_pool: pool.to_string(),
            timestamp: now,
            region: region.clone(),
            current_capacity: current_count,
            desired_capacity: outcome.desired_capacity,
            min_capacity: config.min_instances,
            max_capacity: config.max_instances,
            current_rps,
            target_rps: config.target_rps_per_instance * current_count as f64,
            action: outcome.action,
            reason: outcome.reason.clone(),
        })
        .await?;

    Ok(outcome)
}

/// Picks the scale-down target: the instance in `(region, pool)` with the
/// lowest routing score, i.e. the least useful to keep serving traffic.
/// Workers with no routing state yet (score unknown) are treated as score 0
/// and are preferred for termination.
pub async fn select_scale_down_candidate<S: StateStore + ?Sized>(
    store: &S,
    region: &Region,
    pool: &str,
) -> Result<Option<String>> {
    let workers = store.list_by_pool(pool).await?;
    let mut best: Option<(String, u8)> = None;
    for worker in workers.into_iter().filter(|w| &w.region == region) {
        let score = store
            .get_routing_state(&worker.instance_id)
            .await?
            .map(|r| r.routing_score)
            .unwrap_or(0);
        if best.as_ref().map(|(_, s)| score < *s).unwrap_or(true) {
            best = Some((worker.instance_id, score));
        }
    }
    Ok(best.map(|(id, _)| id))
}

/// Applies a `ScaleUp` action: launches one instance and registers it.
pub async fn apply_scale_up<S: StateStore + ?Sized, C: ComputeApi + ?Sized>(
    store: &S,
    compute: &C,
    region: &Region,
    pool: &str,
) -> Result<Worker> {
    let worker = compute.launch(region, pool).await?;
    mrgc_registry::register(store, worker.clone()).await.map_err(|e| {
        AutoscalerError::Compute(ComputeApiError::LaunchFailed(e.to_string()))
    })?;
    Ok(worker)
}

/// Applies a `ScaleDown` action: selects the weakest instance in the pool
/// and terminates it. Returns `Ok(None)` if there was nothing to terminate.
pub async fn apply_scale_down<S: StateStore + ?Sized, C: ComputeApi + ?Sized>(
    store: &S,
    compute: &C,
    region: &Region,
    pool: &str,
) -> Result<Option<String>> {
    let Some(instance_id) = select_scale_down_candidate(store, region, pool).await? else {
        return Ok(None);
    };
    compute.terminate(&instance_id).await?;
    store.delete_instance(&instance_id).await?;
    Ok(Some(instance_id))
}
