//! Failover Controller (C6): the four-state cross-region traffic-weight
//! state machine (`normal` / `degraded` / `failover_active` / `recovering`).
//!
//! Grounded on the data-carrying-enum-variant + `transition()` pattern the
//! teacher's own failover state machine used, but driven by the healthy-
//! instance ratio of a region rather than a single instance's health score.
//! Weight tables and latency-based target priority are taken verbatim from
//! the original implementation's `FailoverHandler`.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use mrgc_config::{FailoverConfig, DEFAULT_CROSS_REGION_LATENCY_MS};
use mrgc_proto::{MetricPoint, Region, ScalingAction, ScalingDecision};
use mrgc_state::StateStore;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error(transparent)]
    Store(#[from] mrgc_state::StateStoreError),
}

pub type Result<T> = std::result::Result<T, FailoverError>;

/// A candidate cross-region failover target, ranked by latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossRegionRoute {
    pub source_region: Region,
    pub target_region: Region,
    pub latency_ms: u32,
    /// 1 = primary (<30ms), 2 = secondary (<60ms), 3 = tertiary.
    pub priority: u8,
}

/// A record of one failover activation, kept on the controller the same way
/// the original implementation's handler kept its own `failover_events`
/// list rather than pushing it into shared state.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverEvent {
    pub timestamp: i64,
    pub from_region: Region,
    pub to_regions: Vec<Region>,
    pub reason: String,
    pub affected_instances: u32,
}

fn priority_for_latency(latency_ms: u32) -> u8 {
    if latency_ms < 30 {
        1
    } else if latency_ms < 60 {
        2
    } else {
        3
    }
}

/// Which of the four states the controller is in, without the data each
/// variant carries — used for comparing "what state are we recommended to
/// be in" against "what state are we actually in" during a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverPhase {
    Normal,
    Degraded,
    FailoverActive,
    Recovering,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailoverState {
    Normal,
    Degraded { since: i64 },
    FailoverActive { since: i64, targets: Vec<Region> },
    Recovering { since: i64 },
}

impl FailoverState {
    pub fn phase(&self) -> FailoverPhase {
        match self {
            Self::Normal => FailoverPhase::Normal,
            Self::Degraded { .. } => FailoverPhase::Degraded,
            Self::FailoverActive { .. } => FailoverPhase::FailoverActive,
            Self::Recovering { .. } => FailoverPhase::Recovering,
        }
    }
}

/// What the controller decided to do on this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum FailoverTransition {
    NoAction,
    EnteredDegraded,
    InitiatedFailover { targets: Vec<Region> },
    StartedRecovery,
    CompletedRecovery,
}

/// Which phase the healthy-instance ratio alone recommends, independent of
/// the controller's current state (spec/original `evaluate_region_health`).
/// A region with zero instances always recommends failover. A ratio
/// strictly between the degraded and recovery thresholds recommends
/// staying in whatever phase the controller is already in.
pub fn evaluate_region_health(
    current_phase: FailoverPhase,
    healthy_ratio: f64,
    total_instances: u32,
    config: &FailoverConfig,
) -> FailoverPhase {
    if total_instances == 0 {
        return FailoverPhase::FailoverActive;
    }
    if healthy_ratio < config.failover_threshold {
        FailoverPhase::FailoverActive
    } else if healthy_ratio < config.degraded_threshold {
        FailoverPhase::Degraded
    } else if healthy_ratio >= config.recovery_threshold {
        FailoverPhase::Normal
    } else {
        current_phase
    }
}

/// Drives the failover state machine for a single region.
pub struct FailoverController {
    pub region: Region,
    pub all_regions: Vec<Region>,
    pub state: FailoverState,
    config: FailoverConfig,
    latency_matrix: HashMap<(String, String), u32>,
    /// In-process log of every failover activation, same shape as the
    /// original implementation's `self.failover_events`.
    failover_events: Vec<FailoverEvent>,
}

impl FailoverController {
    pub fn new(
        region: Region,
        all_regions: Vec<Region>,
        config: FailoverConfig,
        latency_matrix: HashMap<(String, String), u32>,
    ) -> Self {
        Self {
            region,
            all_regions,
            state: FailoverState::Normal,
            config,
            latency_matrix,
            failover_events: Vec::new(),
        }
    }

    /// All failover activations recorded so far, oldest first.
    pub fn failover_events(&self) -> &[FailoverEvent] {
        &self.failover_events
    }

    /// Prioritized failover targets for this controller's region, sorted by
    /// `(priority, latency_ms)` ascending — nearest, lowest-priority-number
    /// region first.
    pub fn failover_targets(&self) -> Vec<CrossRegionRoute> {
        let mut routes: Vec<CrossRegionRoute> = self
            .all_regions
            .iter()
            .filter(|r| **r != self.region)
            .map(|target| {
                let latency_ms = self
                    .latency_matrix
                    .get(&(self.region.clone(), target.clone()))
                    .copied()
                    .unwrap_or(DEFAULT_CROSS_REGION_LATENCY_MS);
                CrossRegionRoute {
                    source_region: self.region.clone(),
                    target_region: target.clone(),
                    latency_ms,
                    priority: priority_for_latency(latency_ms),
                }
            })
            .collect();
        routes.sort_by_key(|r| (r.priority, r.latency_ms));
        routes
    }

    /// Evaluates the current healthy/total instance counts and applies
    /// whatever state transition the original implementation's monitor
    /// loop would apply this tick. On entering FAILOVER_ACTIVE this also
    /// records a [`FailoverEvent`] (spec.md §4.6: timestamp, from/to,
    /// reason, affected instance count) and a `failover_event` metric via
    /// `store`, mirroring the original's `initiate_failover`.
    pub async fn transition<S: StateStore + ?Sized>(
        &mut self,
        store: &S,
        healthy_instances: u32,
        total_instances: u32,
    ) -> Result<FailoverTransition> {
        let healthy_ratio = if total_instances == 0 {
            0.0
        } else {
            f64::from(healthy_instances) / f64::from(total_instances)
        };
        let recommended =
            evaluate_region_health(self.state.phase(), healthy_ratio, total_instances, &self.config);
        let now = mrgc_proto::now_unix();

        let transition = match (self.state.phase(), recommended) {
            (current, FailoverPhase::FailoverActive) if current != FailoverPhase::FailoverActive => {
                let targets: Vec<Region> = self
                    .failover_targets()
                    .into_iter()
                    .map(|r| r.target_region)
                    .collect();
                warn!(region = %self.region, ?targets, "initiating failover");
                self.state = FailoverState::FailoverActive {
                    since: now,
                    targets: targets.clone(),
                };

                let reason = format!(
                    "healthy ratio {healthy_ratio:.2} below failover threshold {:.2}",
                    self.config.failover_threshold
                );
                self.failover_events.push(FailoverEvent {
                    timestamp: now,
                    from_region: self.region.clone(),
                    to_regions: targets.clone(),
                    reason: reason.clone(),
                    affected_instances: total_instances,
                });
                store
                    .record_metric(MetricPoint {
                        metric_name: "failover_event".to_string(),
                        timestamp_minute: mrgc_proto::bucket_to_minute(now),
                        region: self.region.clone(),
                        value: 1.0,
                        unit: "Count".to_string(),
                        dimensions: HashMap::from([
                            ("from_region".to_string(), self.region.clone()),
                            ("to_regions".to_string(), targets.join(",")),
                        ]),
                    })
                    .await?;

                FailoverTransition::InitiatedFailover { targets }
            }
            (FailoverPhase::Recovering, FailoverPhase::Normal) => {
                info!(region = %self.region, "recovery complete, returning to normal");
                self.state = FailoverState::Normal;
                FailoverTransition::CompletedRecovery
            }
            (FailoverPhase::FailoverActive, FailoverPhase::Normal) => {
                if healthy_ratio >= self.config.recovery_threshold {
                    info!(region = %self.region, healthy_ratio, "entering recovery");
                    self.state = FailoverState::Recovering { since: now };
                    FailoverTransition::StartedRecovery
                } else {
                    FailoverTransition::NoAction
                }
            }
            (FailoverPhase::Normal, FailoverPhase::Degraded) => {
                warn!(region = %self.region, healthy_ratio, "entering degraded state");
                self.state = FailoverState::Degraded { since: now };
                FailoverTransition::EnteredDegraded
            }
            _ => FailoverTransition::NoAction,
        };
        Ok(transition)
    }

    /// Routing preference weights (0-100) for the current state, per the
    /// original implementation's four weight tables. Unlike the original,
    /// a `failover_active` state with only one failover target adds its
    /// 15% secondary share on top of the primary's local share rather than
    /// silently overwriting the local region's 5% floor — see DESIGN.md.
    pub fn routing_preference(&self) -> HashMap<Region, u8> {
        match &self.state {
            FailoverState::Normal => self.uniform_preference(100, 10),
            FailoverState::Degraded { .. } => self.uniform_preference(70, 30),
            FailoverState::Recovering { .. } => self.uniform_preference(50, 25),
            FailoverState::FailoverActive { targets, .. } => {
                let mut weights = HashMap::new();
                weights.insert(self.region.clone(), 5);
                if let Some(primary) = targets.first() {
                    weights.insert(primary.clone(), 80);
                }
                let secondary = targets.get(1).cloned().unwrap_or_else(|| self.region.clone());
                *weights.entry(secondary).or_insert(0) += 15;
                weights
            }
        }
    }

    fn uniform_preference(&self, local_weight: u8, sibling_weight: u8) -> HashMap<Region, u8> {
        let mut weights = HashMap::new();
        weights.insert(self.region.clone(), local_weight);
        for r in &self.all_regions {
            if r != &self.region {
                weights.insert(r.clone(), sibling_weight);
            }
        }
        weights
    }
}

/// Trait-at-the-seam adapter for whatever mechanism actually shifts live
/// traffic between regions (DNS weighted routing, a load balancer API, a
/// service mesh control plane).
#[async_trait]
pub trait TrafficDirector: Send + Sync {
    async fn set_weight(&self, region: &str, weight: u8) -> std::result::Result<(), TrafficDirectorError>;
    async fn get_weights(&self) -> std::result::Result<HashMap<Region, u8>, TrafficDirectorError>;
    async fn get_endpoint_health(&self, region: &str) -> std::result::Result<bool, TrafficDirectorError>;
}

#[derive(Debug, Error)]
#[error("traffic director error: {0}")]
pub struct TrafficDirectorError(pub String);

pub async fn apply_routing_preference<D: TrafficDirector + ?Sized>(
    director: &D,
    preference: &HashMap<Region, u8>,
) -> std::result::Result<(), TrafficDirectorError> {
    for (region, weight) in preference {
        director.set_weight(region, *weight).await?;
    }
    Ok(())
}

/// Requests additional capacity in each failover target region, split
/// evenly, recording one `ScalingDecision` per target (spec.md §4.6's
/// cross-component trigger into the Autoscaler).
pub async fn trigger_failover_scaling<S: StateStore + ?Sized>(
    store: &S,
    from_region: &str,
    target_regions: &[Region],
    additional_capacity_needed: u32,
) -> Result<()> {
    if target_regions.is_empty() {
        return Ok(());
    }
    let capacity_per_region = additional_capacity_needed / target_regions.len() as u32;
    for target in target_regions {
        store
            .record_scaling_decision(ScalingDecision {
                model_pool: "all".to_string(),
                timestamp: mrgc_proto::now_unix(),
                region: target.clone(),
                current_capacity: 0,
                desired_capacity: capacity_per_region,
                min_capacity: 0,
                max_capacity: 100,
                current_rps: 0.0,
                target_rps: 1.5,
                action: ScalingAction::ScaleUp,
                reason: format!("Failover from {from_region}"),
            })
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> FailoverController {
        FailoverController::new(
            "us-east-1".to_string(),
            vec![
                "us-east-1".to_string(),
                "us-east-2".to_string(),
                "us-west-2".to_string(),
            ],
            FailoverConfig::default(),
            mrgc_config_test_latency_matrix(),
        )
    }

    fn mrgc_config_test_latency_matrix() -> HashMap<(String, String), u32> {
        [
            (("us-east-1".to_string(), "us-east-2".to_string()), 15),
            (("us-east-1".to_string(), "us-west-2".to_string()), 70),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn failover_targets_sorted_by_priority_then_latency() {
        let targets = controller().failover_targets();
        assert_eq!(targets[0].target_region, "us-east-2");
        assert_eq!(targets[0].priority, 1);
        assert_eq!(targets[1].target_region, "us-west-2");
        assert_eq!(targets[1].priority, 3);
    }

    #[tokio::test]
    async fn healthy_cluster_stays_normal() {
        let store = mrgc_state::InMemoryStateStore::new();
        let mut c = controller();
        let t = c.transition(&store, 10, 10).await.unwrap();
        assert_eq!(t, FailoverTransition::NoAction);
        assert_eq!(c.state.phase(), FailoverPhase::Normal);
    }

    #[tokio::test]
    async fn zero_instances_forces_failover_active() {
        let store = mrgc_state::InMemoryStateStore::new();
        let mut c = controller();
        let t = c.transition(&store, 0, 0).await.unwrap();
        assert!(matches!(t, FailoverTransition::InitiatedFailover { .. }));
        assert_eq!(c.state.phase(), FailoverPhase::FailoverActive);
        assert_eq!(c.failover_events().len(), 1);
        assert_eq!(c.failover_events()[0].affected_instances, 0);
    }

    #[tokio::test]
    async fn degraded_ratio_enters_degraded_from_normal() {
        let store = mrgc_state::InMemoryStateStore::new();
        let mut c = controller();
        let t = c.transition(&store, 4, 10).await.unwrap(); // ratio 0.4, between 0.3 and 0.5
        assert_eq!(t, FailoverTransition::EnteredDegraded);
    }

    #[tokio::test]
    async fn recovery_sequence_goes_through_recovering_before_normal() {
        let store = mrgc_state::InMemoryStateStore::new();
        let mut c = controller();
        c.transition(&store, 1, 10).await.unwrap(); // ratio 0.1 -> failover active
        assert_eq!(c.state.phase(), FailoverPhase::FailoverActive);

        let t = c.transition(&store, 9, 10).await.unwrap(); // ratio 0.9 >= recovery threshold
        assert_eq!(t, FailoverTransition::StartedRecovery);
        assert_eq!(c.state.phase(), FailoverPhase::Recovering);

        let t2 = c.transition(&store, 9, 10).await.unwrap();
        assert_eq!(t2, FailoverTransition::CompletedRecovery);
        assert_eq!(c.state.phase(), FailoverPhase::Normal);
    }

    #[test]
    fn routing_preference_matches_weight_tables() {
        let c = controller();
        let prefs = c.routing_preference();
        assert_eq!(prefs[&"us-east-1".to_string()], 100);
        assert_eq!(prefs[&"us-east-2".to_string()], 10);
    }

    #[tokio::test]
    async fn failover_active_preference_gives_primary_target_most_weight() {
        let store = mrgc_state::InMemoryStateStore::new();
        let mut c = controller();
        c.transition(&store, 0, 10).await.unwrap();
        let prefs = c.routing_preference();
        assert_eq!(prefs[&"us-east-1".to_string()], 5);
        assert_eq!(prefs[&"us-east-2".to_string()], 80);
        assert_eq!(prefs[&"us-west-2".to_string()], 15);
    }

    #[tokio::test]
    async fn trigger_failover_scaling_splits_capacity_evenly() {
        let store = mrgc_state::InMemoryStateStore::new();
        trigger_failover_scaling(
            &store,
            "us-east-1",
            &["us-east-2".to_string(), "us-west-2".to_string()],
            10,
        )
        .await
        .unwrap();

        let decisions = store
            .get_recent_scaling_decisions("all", std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| d.desired_capacity == 5));
    }
}
