//! Ambient operational counters and audit logging for the control plane.
//!
//! Distinct from `mrgc-metrics` (the domain-level Metrics Collector, C2):
//! this crate tracks what the control loops themselves *did* — probe
//! cycles run, failovers triggered, scale actions applied, requests
//! demoted — not the RPS/latency data the cluster is serving.
//!
//! - [`OperationsMetrics`] — atomic counters for control-loop operations
//! - [`MetricsExporter`] — Prometheus text format export
//! - [`AuditLogger`] — structured, capacity-bounded audit trail

#![forbid(unsafe_code)]

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────
// Atomic Counter
// ─────────────────────────────────────────────────────────────

/// A thread-safe u64 counter backed by an atomic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment the counter by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current counter value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────
// Operations Metrics
// ─────────────────────────────────────────────────────────────

/// Atomic operation counters for the control plane's own loops.
///
/// All counters are thread-safe and can be shared via [`Arc`].
///
/// # Example
/// ```rust
/// # use mrgc_observe::OperationsMetrics;
/// # use std::sync::Arc;
/// let metrics = Arc::new(OperationsMetrics::new());
/// metrics.health_probe_cycles_total.inc();
/// assert_eq!(metrics.health_probe_cycles_total.get(), 1);
/// ```
#[derive(Debug, Default)]
pub struct OperationsMetrics {
    /// Total health probe cycles completed (C4).
    pub health_probe_cycles_total: Counter,
    /// Total individual worker probes that timed out or errored.
    pub probe_failures_total: Counter,
    /// Total autoscaler ticks evaluated (C7), action or not.
    pub scaling_ticks_total: Counter,
    /// Total scale-up actions applied.
    pub scale_ups_total: Counter,
    /// Total scale-down actions applied.
    pub scale_downs_total: Counter,
    /// Total scale actions dropped to a losing CAS race.
    pub scaling_races_lost_total: Counter,
    /// Total failover transitions (Normal->Degraded, Degraded->FailoverActive, etc).
    pub failover_transitions_total: Counter,
    /// Total recovery sequences completed (FailoverActive/Recovering -> Normal).
    pub recoveries_completed_total: Counter,
    /// Total inference requests forwarded by the router (C5).
    pub requests_forwarded_total: Counter,
    /// Total inference requests that failed after the retry-once budget.
    pub requests_failed_total: Counter,
    /// Total worker demotions (routing_score zeroed after a connect failure).
    pub worker_demotions_total: Counter,
}

impl OperationsMetrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed health probe cycle.
    pub fn record_health_probe_cycle(&self) {
        self.health_probe_cycles_total.inc();
    }

    /// Record a single probe failure (timeout or connect error).
    pub fn record_probe_failure(&self) {
        self.probe_failures_total.inc();
        warn!(
            counter = "probe_failures_total",
            value = self.probe_failures_total.get(),
            "worker probe failed"
        );
    }

    /// Record an autoscaler tick, regardless of outcome.
    pub fn record_scaling_tick(&self) {
        self.scaling_ticks_total.inc();
    }

    /// Record an applied scale-up.
    pub fn record_scale_up(&self) {
        self.scale_ups_total.inc();
        info!(
            counter = "scale_ups_total",
            value = self.scale_ups_total.get(),
            "scale-up applied"
        );
    }

    /// Record an applied scale-down.
    pub fn record_scale_down(&self) {
        self.scale_downs_total.inc();
        info!(
            counter = "scale_downs_total",
            value = self.scale_downs_total.get(),
            "scale-down applied"
        );
    }

    /// Record a scaling decision dropped by a losing CAS race.
    pub fn record_scaling_race_lost(&self) {
        self.scaling_races_lost_total.inc();
        warn!(
            counter = "scaling_races_lost_total",
            value = self.scaling_races_lost_total.get(),
            "scaling action lost the compare-and-set race"
        );
    }

    /// Record a failover FSM transition.
    pub fn record_failover_transition(&self) {
        self.failover_transitions_total.inc();
        warn!(
            counter = "failover_transitions_total",
            value = self.failover_transitions_total.get(),
            "failover transition"
        );
    }

    /// Record a completed recovery back to Normal.
    pub fn record_recovery_completed(&self) {
        self.recoveries_completed_total.inc();
        info!(
            counter = "recoveries_completed_total",
            value = self.recoveries_completed_total.get(),
            "recovery completed"
        );
    }

    /// Record a successfully forwarded inference request.
    pub fn record_request_forwarded(&self) {
        self.requests_forwarded_total.inc();
    }

    /// Record a request that failed after the retry-once budget.
    pub fn record_request_failed(&self) {
        self.requests_failed_total.inc();
        warn!(
            counter = "requests_failed_total",
            value = self.requests_failed_total.get(),
            "request failed"
        );
    }

    /// Record a worker demotion.
    pub fn record_worker_demotion(&self) {
        self.worker_demotions_total.inc();
    }
}

// ─────────────────────────────────────────────────────────────
// Metrics Exporter (Prometheus text format)
// ─────────────────────────────────────────────────────────────

/// Exports [`OperationsMetrics`] in Prometheus text format.
pub struct MetricsExporter {
    metrics: Arc<OperationsMetrics>,
    /// Label prefix added to all metric names (default: `mrgc`).
    prefix: String,
}

impl MetricsExporter {
    /// Create a new exporter wrapping the given metrics.
    pub fn new(metrics: Arc<OperationsMetrics>) -> Self {
        Self {
            metrics,
            prefix: "mrgc".to_string(),
        }
    }

    /// Create with a custom metric name prefix.
    pub fn with_prefix(metrics: Arc<OperationsMetrics>, prefix: impl Into<String>) -> Self {
        Self {
            metrics,
            prefix: prefix.into(),
        }
    }

    /// Render all metrics as a Prometheus text format string.
    ///
    /// Each metric is rendered with `# HELP`, `# TYPE`, and value lines.
    pub fn render(&self) -> String {
        let m = &self.metrics;
        let p = &self.prefix;
        let mut out = String::new();

        self.write_counter(
            &mut out,
            p,
            "health_probe_cycles_total",
            "Total health probe cycles completed",
            m.health_probe_cycles_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "probe_failures_total",
            "Total worker probes that timed out or errored",
            m.probe_failures_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "scaling_ticks_total",
            "Total autoscaler ticks evaluated",
            m.scaling_ticks_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "scale_ups_total",
            "Total scale-up actions applied",
            m.scale_ups_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "scale_downs_total",
            "Total scale-down actions applied",
            m.scale_downs_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "scaling_races_lost_total",
            "Total scaling actions dropped to a losing compare-and-set race",
            m.scaling_races_lost_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "failover_transitions_total",
            "Total failover FSM transitions",
            m.failover_transitions_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "recoveries_completed_total",
            "Total recovery sequences completed back to Normal",
            m.recoveries_completed_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "requests_forwarded_total",
            "Total inference requests forwarded",
            m.requests_forwarded_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "requests_failed_total",
            "Total inference requests that failed after the retry budget",
            m.requests_failed_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "worker_demotions_total",
            "Total worker demotions after a connect failure",
            m.worker_demotions_total.get(),
        );

        out
    }

    fn write_counter(&self, out: &mut String, prefix: &str, name: &str, help: &str, value: u64) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
        out.push_str(&format!("{prefix}_{name} {value}\n\n"));
    }
}

// ─────────────────────────────────────────────────────────────
// Audit Logger
// ─────────────────────────────────────────────────────────────

/// Category of control-plane operation being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// An instance was launched (scale-up).
    InstanceLaunch,
    /// An instance was terminated (scale-down).
    InstanceTerminate,
    /// A health probe cycle over a region/pool.
    HealthProbe,
    /// A failover FSM transition.
    Failover,
    /// A recovery sequence back to Normal.
    Recovery,
    /// An autoscaler decision (action or none).
    ScalingDecision,
    /// A router worker demotion after a connect failure.
    WorkerDemotion,
}

/// Outcome of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    /// Completed successfully.
    Success,
    /// Failed with an error.
    Failure,
    /// Blocked by a safety constraint (e.g. below minimum instance count).
    BlockedBySafety,
    /// Requires operator confirmation.
    PendingConfirmation,
}

/// A single structured audit log entry for a control-plane operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneAuditEntry {
    /// Unique entry ID.
    pub id: String,
    /// Timestamp when the operation occurred.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Control loop or component that initiated the operation.
    pub actor: String,
    /// Operation category.
    pub kind: OperationKind,
    /// Target resource (instance ID, region, pool).
    pub resource_id: Option<String>,
    /// Operation outcome.
    pub outcome: OperationOutcome,
    /// Duration of the operation in milliseconds.
    pub duration_ms: Option<u64>,
    /// Additional structured details (region, pool, reason, etc.).
    pub details: HashMap<String, String>,
}

/// Structured audit logger for control-plane operations.
///
/// Maintains an in-memory log with thread-safe access. Emits structured
/// tracing events for each logged entry.
pub struct AuditLogger {
    entries: RwLock<Vec<ControlPlaneAuditEntry>>,
    /// Maximum number of entries to retain in memory.
    max_entries: usize,
}

impl AuditLogger {
    /// Create a new audit logger retaining up to `max_entries` in memory.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_entries,
        }
    }

    /// Create with default capacity (10,000 entries).
    pub fn default_capacity() -> Self {
        Self::new(10_000)
    }

    /// Log a control-plane operation.
    pub fn log(
        &self,
        actor: impl Into<String>,
        kind: OperationKind,
        resource_id: Option<&str>,
        outcome: OperationOutcome,
        duration_ms: Option<u64>,
        details: HashMap<String, String>,
    ) {
        let entry = ControlPlaneAuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.into(),
            kind,
            resource_id: resource_id.map(String::from),
            outcome,
            duration_ms,
            details,
        };

        let details_json = serde_json::to_string(&entry.details).unwrap_or_default();
        match outcome {
            OperationOutcome::Success => {
                info!(
                    audit_id = %entry.id,
                    actor = %entry.actor,
                    kind = ?entry.kind,
                    resource_id = ?entry.resource_id,
                    duration_ms = ?entry.duration_ms,
                    details = %details_json,
                    "control-plane operation succeeded"
                );
            }
            OperationOutcome::Failure => {
                error!(
                    audit_id = %entry.id,
                    actor = %entry.actor,
                    kind = ?entry.kind,
                    resource_id = ?entry.resource_id,
                    details = %details_json,
                    "control-plane operation failed"
                );
            }
            OperationOutcome::BlockedBySafety => {
                warn!(
                    audit_id = %entry.id,
                    actor = %entry.actor,
                    kind = ?entry.kind,
                    resource_id = ?entry.resource_id,
                    details = %details_json,
                    "control-plane operation blocked by safety constraint"
                );
            }
            OperationOutcome::PendingConfirmation => {
                info!(
                    audit_id = %entry.id,
                    actor = %entry.actor,
                    kind = ?entry.kind,
                    resource_id = ?entry.resource_id,
                    details = %details_json,
                    "control-plane operation pending operator confirmation"
                );
            }
        }

        let mut entries = self.entries.write();
        entries.push(entry);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
    }

    /// Query entries filtered by kind and/or actor.
    pub fn query(
        &self,
        kind: Option<OperationKind>,
        actor: Option<&str>,
        limit: usize,
    ) -> Vec<ControlPlaneAuditEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .filter(|e| actor.is_none_or(|a| e.actor == a))
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Return all entries as a JSON array string.
    pub fn to_json(&self) -> String {
        let entries = self.entries.read();
        serde_json::to_string_pretty(&*entries).unwrap_or_else(|_| "[]".to_string())
    }

    /// Total number of entries logged.
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_metrics_counters() {
        let m = OperationsMetrics::new();
        assert_eq!(m.health_probe_cycles_total.get(), 0);

        m.record_health_probe_cycle();
        m.record_health_probe_cycle();
        assert_eq!(m.health_probe_cycles_total.get(), 2);

        m.record_probe_failure();
        assert_eq!(m.probe_failures_total.get(), 1);

        m.record_scale_up();
        m.record_scale_down();
        assert_eq!(m.scale_ups_total.get(), 1);
        assert_eq!(m.scale_downs_total.get(), 1);

        m.record_failover_transition();
        assert_eq!(m.failover_transitions_total.get(), 1);
    }

    #[test]
    fn test_metrics_exporter_prometheus_format() {
        let metrics = Arc::new(OperationsMetrics::new());
        metrics.record_scale_up();
        metrics.record_scale_up();
        metrics.record_scaling_race_lost();

        let exporter = MetricsExporter::new(metrics);
        let output = exporter.render();

        assert!(
            output.contains("# HELP mrgc_scale_ups_total"),
            "must have HELP line"
        );
        assert!(
            output.contains("# TYPE mrgc_scale_ups_total counter"),
            "must have TYPE line"
        );
        assert!(
            output.contains("mrgc_scale_ups_total 2"),
            "must have correct count"
        );
        assert!(
            output.contains("mrgc_scaling_races_lost_total 1"),
            "must have race-loss count"
        );
        assert!(
            output.contains("mrgc_failover_transitions_total 0"),
            "zero counters must appear"
        );
    }

    #[test]
    fn test_metrics_exporter_custom_prefix() {
        let metrics = Arc::new(OperationsMetrics::new());
        let exporter = MetricsExporter::with_prefix(metrics, "myapp");
        let output = exporter.render();
        assert!(
            output.contains("myapp_health_probe_cycles_total"),
            "custom prefix must be used"
        );
        assert!(
            !output.contains("mrgc_health_probe_cycles_total"),
            "default prefix must not appear"
        );
    }

    #[test]
    fn test_audit_logger_log_and_query() {
        let logger = AuditLogger::new(100);

        logger.log(
            "autoscaler",
            OperationKind::InstanceLaunch,
            Some("i-test-1"),
            OperationOutcome::Success,
            Some(1500),
            HashMap::from([("region".to_string(), "us-east".to_string())]),
        );

        logger.log(
            "autoscaler",
            OperationKind::InstanceLaunch,
            Some("i-test-2"),
            OperationOutcome::Failure,
            Some(300),
            HashMap::new(),
        );

        assert_eq!(logger.count(), 2);

        let all = logger.query(None, None, 10);
        assert_eq!(all.len(), 2);

        let successes = logger.query(None, Some("autoscaler"), 10);
        assert_eq!(successes.len(), 2);

        let launches = logger.query(Some(OperationKind::InstanceLaunch), None, 10);
        assert_eq!(launches.len(), 2);
    }

    #[test]
    fn test_audit_logger_json_output() {
        let logger = AuditLogger::new(100);
        logger.log(
            "health-monitor",
            OperationKind::HealthProbe,
            None,
            OperationOutcome::Success,
            Some(50),
            HashMap::new(),
        );

        let json = logger.to_json();
        assert!(
            json.contains("health_probe"),
            "JSON must contain operation kind"
        );
        assert!(json.contains("success"), "JSON must contain outcome");
        assert!(
            json.contains("health-monitor"),
            "JSON must contain actor"
        );
    }

    #[test]
    fn test_audit_logger_evicts_old_entries() {
        let logger = AuditLogger::new(5);

        for i in 0..10 {
            logger.log(
                "autoscaler",
                OperationKind::HealthProbe,
                Some(&format!("i-{i}")),
                OperationOutcome::Success,
                None,
                HashMap::new(),
            );
        }

        assert_eq!(
            logger.count(),
            5,
            "logger must evict old entries over max_entries"
        );
    }

    #[test]
    fn test_audit_logger_blocked_by_safety_logged() {
        let logger = AuditLogger::new(100);
        logger.log(
            "autoscaler",
            OperationKind::InstanceTerminate,
            Some("i-primary-1"),
            OperationOutcome::BlockedBySafety,
            None,
            HashMap::from([(
                "reason".to_string(),
                "would drop below minimum instance count".to_string(),
            )]),
        );

        let blocked = logger.query(None, None, 1);
        assert_eq!(blocked[0].outcome, OperationOutcome::BlockedBySafety);
        assert_eq!(
            blocked[0].details["reason"],
            "would drop below minimum instance count"
        );
    }
}
