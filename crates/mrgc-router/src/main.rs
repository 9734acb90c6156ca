//! Regional Router process entry point.
//!
//! Serves the `/inference`, `/health`, and `/metrics` HTTP endpoints, and
//! drives this region's Health Monitor, Failover Controller, and
//! per-pool Autoscaler ticks as background tasks. Per spec.md §7 these are
//! independent control loops; running them in one process here is a
//! deployment simplification, not a change to their semantics — each loop
//! only ever talks to the shared state store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use mrgc_config::ClusterConfig;
use mrgc_failover::{FailoverController, TrafficDirector, TrafficDirectorError};
use mrgc_health::{HealthMonitor, ReqwestProbe};
use mrgc_observe::{AuditLogger, MetricsExporter, OperationKind, OperationOutcome, OperationsMetrics};
use mrgc_proto::InferenceHeaders;
use mrgc_router::{process_request, ForwardOutcome, RouterStats};
use mrgc_state::{InMemoryStateStore, StateStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

struct AppState<S: StateStore + ?Sized> {
    store: Arc<S>,
    client: reqwest::Client,
    config: ClusterConfig,
    stats: RouterStats,
    metrics: Arc<OperationsMetrics>,
    audit: Arc<AuditLogger>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mrgc_router=info".parse()?)
                .add_directive("mrgc_health=info".parse()?)
                .add_directive("mrgc_failover=info".parse()?)
                .add_directive("mrgc_autoscaler=info".parse()?),
        )
        .json()
        .init();

    let config = ClusterConfig::from_env().context("failed to load cluster configuration")?;
    info!(region = %config.region, siblings = ?config.sibling_regions, "mrgc-router starting");

    // TODO: swap in the real replicated KV adapter once one is wired up;
    // every control-loop crate only depends on the `StateStore` trait.
    let store: Arc<InMemoryStateStore> = Arc::new(InMemoryStateStore::new());
    let client = reqwest::Client::new();
    let metrics = Arc::new(OperationsMetrics::new());
    let audit = Arc::new(AuditLogger::default_capacity());

    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        client,
        config: config.clone(),
        stats: RouterStats::default(),
        metrics: Arc::clone(&metrics),
        audit: Arc::clone(&audit),
    });

    spawn_health_monitor(Arc::clone(&store), config.clone(), Arc::clone(&metrics), Arc::clone(&audit));
    spawn_failover_controller(Arc::clone(&store), config.clone(), Arc::clone(&metrics), Arc::clone(&audit));
    spawn_autoscaler(Arc::clone(&store), config.clone(), Arc::clone(&metrics), Arc::clone(&audit));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/inference", post(inference_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080")
        .await
        .context("failed to bind :8080")?;
    info!("listening on :8080");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn health_handler(
    State(state): State<Arc<AppState<InMemoryStateStore>>>,
) -> impl IntoResponse {
    let instances = state
        .store
        .list_by_region(&state.config.region, None)
        .await
        .unwrap_or_default();
    let healthy = instances
        .iter()
        .filter(|w| w.state == mrgc_proto::WorkerState::Available)
        .count();

    Json(serde_json::json!({
        "status": "healthy",
        "region": state.config.region,
        "available_capacity": healthy,
        "total_instances": instances.len(),
    }))
}

async fn metrics_handler(
    State(state): State<Arc<AppState<InMemoryStateStore>>>,
) -> impl IntoResponse {
    let prometheus = MetricsExporter::new(Arc::clone(&state.metrics)).render();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prometheus,
    )
        .into_response()
}

async fn status_handler(
    State(state): State<Arc<AppState<InMemoryStateStore>>>,
) -> impl IntoResponse {
    let snapshot = state.stats.snapshot(&state.config.region);
    match mrgc_metrics::cluster_health_summary(state.store.as_ref(), &state.config.region, Duration::from_secs(300)).await {
        Ok(summary) => Json(serde_json::json!({ "router": snapshot, "cluster": summary })).into_response(),
        Err(_) => Json(serde_json::json!({ "router": snapshot })).into_response(),
    }
}

async fn inference_handler(
    State(state): State<Arc<AppState<InMemoryStateStore>>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let started = std::time::Instant::now();

    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": "No payload provided", "success": false}))).into_response();
    }

    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);

    let (Some(kms_key_arn), Some(tenant_id)) = (header_str("X-KMS-Key-ARN"), header_str("X-Tenant-ID")) else {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": "Missing required header", "success": false}))).into_response();
    };
    let model_pool = header_str("X-Model-Pool").unwrap_or_else(|| "default".to_string());
    let request_id = header_str("X-Request-ID").unwrap_or_else(|| format!("req-{}", mrgc_proto::now_unix()));

    let inference_headers = InferenceHeaders {
        kms_key_arn,
        tenant_id,
        model_pool,
        request_id: request_id.clone(),
    };

    let (outcome, _instance_id) = process_request(
        state.store.as_ref(),
        &state.client,
        &state.config.region,
        body.to_vec(),
        &inference_headers,
        None,
        &state.config.router,
    )
    .await;

    let routing_time = started.elapsed();

    match outcome {
        ForwardOutcome::Success { status, body } => {
            state.stats.record(true, routing_time);
            state.metrics.record_request_forwarded();
            (StatusCode::from_u16(status).unwrap_or(StatusCode::OK), body).into_response()
        }
        ForwardOutcome::Other { status, body } => {
            state.stats.record(false, routing_time);
            state.metrics.record_request_failed();
            (StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE), body).into_response()
        }
        ForwardOutcome::Timeout => {
            state.stats.record(false, routing_time);
            state.metrics.record_request_failed();
            (StatusCode::GATEWAY_TIMEOUT, Json(serde_json::json!({"error": "timeout", "success": false, "request_id": request_id}))).into_response()
        }
        ForwardOutcome::ConnectError => {
            state.stats.record(false, routing_time);
            state.metrics.record_request_failed();
            state.metrics.record_worker_demotion();
            state.audit.log(
                "regional_router",
                OperationKind::WorkerDemotion,
                None,
                OperationOutcome::Failure,
                Some(routing_time.as_millis() as u64),
                HashMap::from([("region".to_string(), state.config.region.clone())]),
            );
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"error": "connect error", "success": false, "request_id": request_id}))).into_response()
        }
    }
}

fn spawn_health_monitor(
    store: Arc<InMemoryStateStore>,
    config: ClusterConfig,
    metrics: Arc<OperationsMetrics>,
    audit: Arc<AuditLogger>,
) {
    tokio::spawn(async move {
        let monitor = HealthMonitor::new(ReqwestProbe::new(), config.health.clone());
        let mut ticker = tokio::time::interval(config.health.interval);
        loop {
            ticker.tick().await;
            let started = std::time::Instant::now();
            match monitor.run_cycle(store.as_ref(), &config.region).await {
                Ok(summary) => {
                    info!(?summary, "health monitor cycle complete");
                    metrics.record_health_probe_cycle();
                    audit.log(
                        "health_monitor",
                        OperationKind::HealthProbe,
                        Some(config.region.as_str()),
                        OperationOutcome::Success,
                        Some(started.elapsed().as_millis() as u64),
                        HashMap::new(),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "health monitor cycle failed");
                    metrics.record_probe_failure();
                    audit.log(
                        "health_monitor",
                        OperationKind::HealthProbe,
                        Some(config.region.as_str()),
                        OperationOutcome::Failure,
                        Some(started.elapsed().as_millis() as u64),
                        HashMap::from([("error".to_string(), e.to_string())]),
                    );
                }
            }
        }
    });
}

fn spawn_failover_controller(
    store: Arc<InMemoryStateStore>,
    config: ClusterConfig,
    metrics: Arc<OperationsMetrics>,
    audit: Arc<AuditLogger>,
) {
    tokio::spawn(async move {
        let mut controller = FailoverController::new(
            config.region.clone(),
            config.all_regions(),
            config.failover.clone(),
            config.latency_matrix.clone(),
        );
        let director = NoopTrafficDirector::default();
        let mut ticker = tokio::time::interval(config.health.interval);
        loop {
            ticker.tick().await;
            let instances = match store.list_by_region(&config.region, None).await {
                Ok(w) => w,
                Err(e) => {
                    warn!(error = %e, "failover controller: failed to list instances");
                    continue;
                }
            };
            let total = instances.len() as u32;
            let mut healthy = 0u32;
            for worker in &instances {
                if let Ok(Some(state)) = store.get_routing_state(&worker.instance_id).await {
                    if state.health_status == mrgc_proto::HealthStatus::Healthy {
                        healthy += 1;
                    }
                }
            }
            let transition = match controller.transition(store.as_ref(), healthy, total).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failover controller: failed to record transition");
                    continue;
                }
            };
            if transition != mrgc_failover::FailoverTransition::NoAction {
                info!(?transition, "failover controller state change");
                metrics.record_failover_transition();
                if transition == mrgc_failover::FailoverTransition::CompletedRecovery {
                    metrics.record_recovery_completed();
                }
                audit.log(
                    "failover_controller",
                    if matches!(transition, mrgc_failover::FailoverTransition::CompletedRecovery) {
                        OperationKind::Recovery
                    } else {
                        OperationKind::Failover
                    },
                    Some(config.region.as_str()),
                    OperationOutcome::Success,
                    None,
                    HashMap::from([("transition".to_string(), format!("{transition:?}"))]),
                );
            }
            if let mrgc_failover::FailoverTransition::InitiatedFailover { targets } = &transition {
                let mut available_targets = Vec::new();
                for target in targets {
                    match store.list_by_region(target, Some(mrgc_proto::WorkerState::Available)).await {
                        Ok(w) if !w.is_empty() => available_targets.push(target.clone()),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, target = %target, "failover: failed to check target capacity"),
                    }
                }
                if available_targets.is_empty() {
                    error!(region = %config.region, ?targets, "No healthy failover targets available!");
                } else {
                    let additional_capacity_needed = total.saturating_sub(healthy);
                    if let Err(e) = mrgc_failover::trigger_failover_scaling(
                        store.as_ref(),
                        &config.region,
                        &available_targets,
                        additional_capacity_needed,
                    )
                    .await
                    {
                        warn!(error = %e, "failed to request failover scaling");
                    }
                }
            }
            if let Err(e) = mrgc_failover::apply_routing_preference(&director, &controller.routing_preference()).await {
                warn!(error = %e, "failed to apply routing preference");
            }
        }
    });
}

fn spawn_autoscaler(
    store: Arc<InMemoryStateStore>,
    config: ClusterConfig,
    metrics: Arc<OperationsMetrics>,
    audit: Arc<AuditLogger>,
) {
    tokio::spawn(async move {
        let compute = NoopComputeApi::default();
        let mut ticker = tokio::time::interval(config.autoscaler.tick_interval);
        loop {
            ticker.tick().await;
            let pools: Vec<String> = store
                .list_by_region(&config.region, None)
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|w| w.model_pool)
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect();

            for pool in pools {
                let current_count = store
                    .list_by_pool(&pool)
                    .await
                    .map(|w| w.iter().filter(|w| w.region == config.region).count() as u32)
                    .unwrap_or(0);
                let current_rps = mrgc_metrics::cluster_rps(store.as_ref(), &config.region, Duration::from_secs(300))
                    .await
                    .unwrap_or(0.0);

                metrics.record_scaling_tick();
                match mrgc_autoscaler::tick(store.as_ref(), &config.region, &pool, current_rps, current_count, &config.autoscaler).await {
                    Ok(outcome) => {
                        match outcome.action {
                            mrgc_proto::ScalingAction::ScaleUp => {
                                match mrgc_autoscaler::apply_scale_up(store.as_ref(), &compute, &config.region, &pool).await {
                                    Ok(_) => {
                                        metrics.record_scale_up();
                                        audit.log(
                                            "autoscaler",
                                            OperationKind::InstanceLaunch,
                                            Some(pool.as_str()),
                                            OperationOutcome::Success,
                                            None,
                                            HashMap::from([("region".to_string(), config.region.clone())]),
                                        );
                                    }
                                    Err(e) => {
                                        error!(error = %e, pool = %pool, "scale up failed");
                                        audit.log(
                                            "autoscaler",
                                            OperationKind::InstanceLaunch,
                                            Some(pool.as_str()),
                                            OperationOutcome::Failure,
                                            None,
                                            HashMap::from([("error".to_string(), e.to_string())]),
                                        );
                                    }
                                }
                            }
                            mrgc_proto::ScalingAction::ScaleDown => {
                                match mrgc_autoscaler::apply_scale_down(store.as_ref(), &compute, &config.region, &pool).await {
                                    Ok(_) => {
                                        metrics.record_scale_down();
                                        audit.log(
                                            "autoscaler",
                                            OperationKind::InstanceTerminate,
                                            Some(pool.as_str()),
                                            OperationOutcome::Success,
                                            None,
                                            HashMap::from([("region".to_string(), config.region.clone())]),
                                        );
                                    }
                                    Err(e) => {
                                        error!(error = %e, pool = %pool, "scale down failed");
                                        audit.log(
                                            "autoscaler",
                                            OperationKind::InstanceTerminate,
                                            Some(pool.as_str()),
                                            OperationOutcome::Failure,
                                            None,
                                            HashMap::from([("error".to_string(), e.to_string())]),
                                        );
                                    }
                                }
                            }
                            mrgc_proto::ScalingAction::None => {}
                        }
                        info!(pool = %pool, action = %outcome.action, reason = %outcome.reason, "autoscaler tick");
                    }
                    Err(e) => warn!(error = %e, pool = %pool, "autoscaler tick failed"),
                }
            }
        }
    });
}

/// Traffic-weight adapter placeholder. A real deployment points this at the
/// cloud load balancer's weighted-routing API; wiring that up is out of
/// scope here, same as the dropped fleet-provisioning client.
#[derive(Default)]
struct NoopTrafficDirector {
    weights: std::sync::Mutex<HashMap<String, u8>>,
}

#[async_trait]
impl TrafficDirector for NoopTrafficDirector {
    async fn set_weight(&self, region: &str, weight: u8) -> std::result::Result<(), TrafficDirectorError> {
        self.weights.lock().unwrap().insert(region.to_string(), weight);
        Ok(())
    }

    async fn get_weights(&self) -> std::result::Result<HashMap<String, u8>, TrafficDirectorError> {
        Ok(self.weights.lock().unwrap().clone())
    }

    async fn get_endpoint_health(&self, _region: &str) -> std::result::Result<bool, TrafficDirectorError> {
        Ok(true)
    }
}

/// Fleet-provisioning adapter placeholder; see `NoopTrafficDirector`.
#[derive(Default)]
struct NoopComputeApi;

#[async_trait]
impl mrgc_autoscaler::ComputeApi for NoopComputeApi {
    async fn launch(&self, region: &mrgc_proto::Region, pool: &str) -> std::result::Result<mrgc_proto::Worker, mrgc_autoscaler::ComputeApiError> {
        Ok(mrgc_proto::Worker {
            instance_id: format!("i-{}", uuid::Uuid::new_v4()),
            region: region.to_string(),
            model_pool: pool.to_string(),
            ip_address: "0.0.0.0".to_string(),
            subnet_id: "subnet-unset".to_string(),
            availability_zone: "unset".to_string(),
            subnet_cidr: "0.0.0.0/0".to_string(),
            state: mrgc_proto::WorkerState::Launching,
            queue_depth: 0,
            last_heartbeat: mrgc_proto::now_unix(),
            launch_time: mrgc_proto::now_unix(),
            metadata: HashMap::new(),
        })
    }

    async fn terminate(&self, _instance_id: &str) -> std::result::Result<(), mrgc_autoscaler::ComputeApiError> {
        Ok(())
    }
}
