//! Startup configuration for the multi-region GPU cluster control plane.
//!
//! Everything here is read once from the environment at process start
//! (spec.md §6: "region, table prefix, scaling thresholds, health
//! intervals, and target RPS are read once at startup"). There is no live
//! config store: unlike an interactive operator tool, this control plane's
//! configuration is immutable for the lifetime of the process.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Default cross-region latency matrix (milliseconds), seeded from the
/// original implementation's hard-coded `REGION_LATENCY` table. Kept here
/// only as a fallback default; operators may override per-pair values via
/// `MRGC_LATENCY_<FROM>_<TO>_MS`.
fn default_latency_matrix() -> HashMap<(String, String), u32> {
    let pairs = [
        ("us-east-1", "us-east-2", 15),
        ("us-east-1", "us-west-2", 70),
        ("us-east-2", "us-east-1", 15),
        ("us-east-2", "us-west-2", 55),
        ("us-west-2", "us-east-1", 70),
        ("us-west-2", "us-east-2", 55),
    ];
    pairs
        .into_iter()
        .map(|(a, b, ms)| ((a.to_string(), b.to_string()), ms))
        .collect()
}

/// Latency to assume between two regions with no configured entry.
pub const DEFAULT_CROSS_REGION_LATENCY_MS: u32 = 100;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    /// Health Monitor's own stale-heartbeat-drain check (§4.4 step 6).
    /// Distinct from the Instance Registry's generic staleness helper.
    pub stale_heartbeat_timeout: Duration,
    pub max_concurrent_probes: usize,
    pub degraded_queue_depth: u32,
    pub degraded_rtt: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            failure_threshold: 3,
            stale_heartbeat_timeout: Duration::from_secs(90),
            max_concurrent_probes: 20,
            degraded_queue_depth: 8,
            degraded_rtt: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub degraded_threshold: f64,
    pub failover_threshold: f64,
    pub recovery_threshold: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: 0.50,
            failover_threshold: 0.30,
            recovery_threshold: 0.80,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    pub target_rps_per_instance: f64,
    pub min_instances: u32,
    pub max_instances: u32,
    pub scale_up_dwell: Duration,
    pub scale_down_dwell: Duration,
    pub cooldown: Duration,
    pub tick_interval: Duration,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            target_rps_per_instance: 12.5,
            min_instances: 2,
            max_instances: 20,
            scale_up_dwell: Duration::from_secs(120),
            scale_down_dwell: Duration::from_secs(600),
            cooldown: Duration::from_secs(300),
            tick_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// C3's generic staleness-detection default (spec.md §4.3), distinct
    /// from `HealthMonitorConfig::stale_heartbeat_timeout`.
    pub default_staleness_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_staleness_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub candidate_pool_size: usize,
    pub dispatch_score_floor: u8,
    pub forward_timeout: Duration,
    pub cache_refresh_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            candidate_pool_size: 10,
            dispatch_score_floor: 50,
            forward_timeout: Duration::from_secs(60),
            cache_refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Top-level, immutable, process-wide configuration. Constructed once at
/// startup via [`ClusterConfig::from_env`]; never mutated afterward (per
/// §9's "global module-level singletons become explicit dependencies
/// passed into each control loop at startup").
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub region: String,
    pub sibling_regions: Vec<String>,
    pub table_prefix: String,
    pub latency_matrix: HashMap<(String, String), u32>,
    pub health: HealthMonitorConfig,
    pub failover: FailoverConfig,
    pub autoscaler: AutoscalerConfig,
    pub registry: RegistryConfig,
    pub router: RouterConfig,
}

impl ClusterConfig {
    /// Reads configuration from the environment. Fails fast (the only
    /// permitted "fatal initialization" error per spec.md §7) if the
    /// mandatory `MRGC_REGION` variable is missing or no sibling regions are
    /// configured.
    pub fn from_env() -> Result<Self> {
        let region = std::env::var("MRGC_REGION")
            .context("MRGC_REGION is mandatory and was not set")?;
        if region.trim().is_empty() {
            bail!("MRGC_REGION must not be empty");
        }

        let sibling_regions: Vec<String> = std::env::var("MRGC_SIBLING_REGIONS")
            .unwrap_or_else(|_| "us-east-1,us-east-2,us-west-2".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s != &region)
            .collect();
        if sibling_regions.is_empty() {
            bail!("no sibling regions configured; at least one is required for failover");
        }

        let table_prefix =
            std::env::var("MRGC_TABLE_PREFIX").unwrap_or_else(|_| "mrgc".to_string());

        Ok(Self {
            region,
            sibling_regions,
            table_prefix,
            latency_matrix: default_latency_matrix(),
            health: HealthMonitorConfig::default(),
            failover: FailoverConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            registry: RegistryConfig::default(),
            router: RouterConfig::default(),
        })
    }

    /// All regions in the cluster, local region first.
    pub fn all_regions(&self) -> Vec<String> {
        let mut regions = vec![self.region.clone()];
        regions.extend(self.sibling_regions.iter().cloned());
        regions
    }

    pub fn latency_ms(&self, from: &str, to: &str) -> u32 {
        self.latency_matrix
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .unwrap_or(DEFAULT_CROSS_REGION_LATENCY_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_matrix_known_pair() {
        let matrix = default_latency_matrix();
        assert_eq!(
            matrix.get(&("us-east-1".to_string(), "us-east-2".to_string())),
            Some(&15)
        );
    }

    #[test]
    fn latency_ms_falls_back_to_default_for_unlisted_pair() {
        let cfg = ClusterConfig {
            region: "us-east-1".to_string(),
            sibling_regions: vec!["eu-central-1".to_string()],
            table_prefix: "mrgc".to_string(),
            latency_matrix: default_latency_matrix(),
            health: HealthMonitorConfig::default(),
            failover: FailoverConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            registry: RegistryConfig::default(),
            router: RouterConfig::default(),
        };
        assert_eq!(
            cfg.latency_ms("us-east-1", "eu-central-1"),
            DEFAULT_CROSS_REGION_LATENCY_MS
        );
        assert_eq!(cfg.latency_ms("us-east-1", "us-east-2"), 15);
    }

    #[test]
    fn autoscaler_defaults_match_spec() {
        let cfg = AutoscalerConfig::default();
        assert_eq!(cfg.target_rps_per_instance, 12.5);
        assert_eq!(cfg.min_instances, 2);
        assert_eq!(cfg.max_instances, 20);
        assert_eq!(cfg.cooldown, Duration::from_secs(300));
    }
}
