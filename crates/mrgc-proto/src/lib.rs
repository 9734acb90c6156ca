//! Shared domain types for the multi-region GPU cluster control plane.
//!
//! These are the typed records that cross component boundaries: the five
//! logical tables behind the State Store Adapter (Worker, RoutingState,
//! ScalingDecision, CleanupAudit, MetricPoint), plus the wire types for the
//! worker and ingress HTTP interfaces.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// AWS-style region identifier, e.g. `"us-east-1"`. Kept as a plain string
/// rather than a closed enum: the cluster's region list is configuration
/// (see `mrgc-config`), not a compile-time constant.
pub type Region = String;

/// Model pool name, e.g. `"llama-70b"`. Opaque to the control plane.
pub type ModelPool = String;

// ─── Worker lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Launching,
    Available,
    Draining,
    Terminated,
    Quarantined,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launching => write!(f, "launching"),
            Self::Available => write!(f, "available"),
            Self::Draining => write!(f, "draining"),
            Self::Terminated => write!(f, "terminated"),
            Self::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// A GPU-bearing compute node running the opaque inference endpoint inside a
/// confidential enclave. Primary key `instance_id`; secondary indices
/// `region` and `model_pool`. TTL: 7 days after last update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub instance_id: String,
    pub region: Region,
    pub model_pool: ModelPool,
    pub ip_address: String,
    pub subnet_id: String,
    pub availability_zone: String,
    pub subnet_cidr: String,
    pub state: WorkerState,
    pub queue_depth: u32,
    pub last_heartbeat: i64,
    pub launch_time: i64,
    pub metadata: HashMap<String, String>,
}

// ─── Routing state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// The routing-relevant view of a worker, continually overwritten by the
/// Health Monitor. Primary key `instance_id`; secondary index
/// `(region, routing_score desc)`. TTL: 1 hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingState {
    pub instance_id: String,
    pub region: Region,
    /// 0..100, higher is preferred. See `mrgc-registry` for the formula.
    pub routing_score: u8,
    pub queue_depth: u32,
    pub avg_latency_ms: f64,
    pub health_status: HealthStatus,
    pub subnet_cidr: String,
    pub last_updated: i64,
}

/// Bootstrap routing score assigned on registration, before the worker has
/// been probed even once. Deliberately low so a just-launched instance does
/// not receive disproportionate traffic while still warming up. Standardized
/// per spec's open-question resolution (see DESIGN.md).
pub const INITIAL_ROUTING_SCORE: u8 = 10;

/// Sentinel queue depth the Health Monitor writes when demoting a worker it
/// considers unhealthy or stale — high enough that any read ignoring the
/// zeroed score still disprefers the worker.
pub const DEMOTED_QUEUE_DEPTH_SENTINEL: u32 = 99;

/// Sentinel latency the Health Monitor writes alongside a demoted worker.
pub const DEMOTED_LATENCY_SENTINEL_MS: f64 = 99999.0;

// ─── Scaling decisions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    None,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScaleUp => write!(f, "scale_up"),
            Self::ScaleDown => write!(f, "scale_down"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Composite key `(model_pool, timestamp)`. TTL: 30 days. Every tick of the
/// Autoscaler records one of these, including ticks that decide `None` —
/// the audit trail has to explain every non-action too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub model_pool: ModelPool,
    pub timestamp: i64,
    pub region: Region,
    pub current_capacity: u32,
    pub desired_capacity: u32,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub current_rps: f64,
    pub target_rps: f64,
    pub action: ScalingAction,
    pub reason: String,
}

// ─── Cleanup audit ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Passed,
    Failed,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Primary key `(instance_id, validation_timestamp)`; secondary index
/// `(status, timestamp)`. TTL: 90 days. Records the post-request cleanup
/// validation that gates whether a worker may keep routing traffic or must
/// be quarantined (see invariant I4 in spec.md).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupAudit {
    pub instance_id: String,
    pub validation_timestamp: i64,
    pub status: ValidationStatus,
    /// Named boolean subchecks, e.g. `{"memory_wiped": true, "disk_scrubbed": true}`.
    pub subchecks: HashMap<String, bool>,
    pub integrity_check: bool,
    pub failure_reason: Option<String>,
    pub quarantine_reason: Option<String>,
}

// ─── Metrics ────────────────────────────────────────────────────────────────

/// Composite key `(metric_name, timestamp_minute)`; secondary index
/// `(region, timestamp)`. TTL: 30 days. Timestamp is always bucketed to the
/// minute (`(unix_seconds / 60) * 60`) before storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub metric_name: String,
    pub timestamp_minute: i64,
    pub region: Region,
    pub value: f64,
    pub unit: String,
    pub dimensions: HashMap<String, String>,
}

pub fn bucket_to_minute(unix_seconds: i64) -> i64 {
    (unix_seconds / 60) * 60
}

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

// ─── Worker HTTP interface (consumed by Router and Health Monitor) ─────────

/// Response body of the worker's `GET /health` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthProbeResponse {
    pub status: String,
    #[serde(default)]
    pub queue_depth: u32,
    #[serde(default)]
    pub gpu_healthy: bool,
    #[serde(default)]
    pub enclave_healthy: bool,
    #[serde(default)]
    pub models_loaded: Vec<String>,
}

/// The headers required/optional on the ingress `/inference` and worker
/// `/inference` interfaces (spec.md §6).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferenceHeaders {
    pub kms_key_arn: String,
    pub tenant_id: String,
    pub model_pool: ModelPool,
    pub request_id: String,
}

// ─── Validation ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("empty instance_id")]
    EmptyInstanceId,
    #[error("empty region")]
    EmptyRegion,
}

pub fn validate_instance_id(instance_id: &str) -> Result<(), ProtoError> {
    if instance_id.trim().is_empty() {
        return Err(ProtoError::EmptyInstanceId);
    }
    Ok(())
}

pub fn validate_region(region: &str) -> Result<(), ProtoError> {
    if region.trim().is_empty() {
        return Err(ProtoError::EmptyRegion);
    }
    Ok(())
}
