//! HTTP API for simulation control
//!
//! REST endpoints for starting, stopping and inspecting simulations plus the
//! metrics sub-routes and the per-project WebSocket log stream. The engine
//! is injected through shared state; this layer only translates between the
//! wire and engine calls.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::engine::SimulationEngine;
use crate::error::{Error, Result};
use crate::log_stream::LogEntry;

/// Shared application state
pub struct AppState {
    pub engine: Arc<SimulationEngine>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Body for the connector-test endpoint
#[derive(Debug, Deserialize)]
pub struct ConnectorTestRequest {
    pub target_type: String,
    pub config: Value,
}

/// Build the full API router
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let metrics_routes = Router::new()
        .route("/", get(get_all_metrics))
        .route("/connectors", get(get_connector_metrics))
        .route("/devices", get(get_device_metrics))
        .route("/devices/:device_id", get(get_device_metrics_by_id))
        .route("/project/:project_id", get(get_project_metrics))
        .route("/health", get(get_metrics_health))
        .route("/reset", delete(reset_all_metrics))
        .route("/reset/project/:project_id", delete(reset_project_metrics));

    Router::new()
        .route("/health", get(health_check))
        .route("/simulation/status", get(get_all_simulation_status))
        .route("/simulation/emergency-stop", post(emergency_stop))
        .route("/simulation/connectors/test", post(test_connector))
        .route("/simulation/connectors/types", get(get_connector_types))
        .route("/simulation/devices/:device_id/test", post(test_device))
        .nest("/simulation/metrics", metrics_routes)
        .route("/simulation/:project_id/start", post(start_simulation))
        .route("/simulation/:project_id/stop", post(stop_simulation))
        .route("/simulation/:project_id/status", get(get_simulation_status))
        .route("/simulation/:project_id/validate", get(validate_project))
        .route("/simulation/:project_id/logs", get(stream_logs))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the shutdown future resolves
pub async fn serve(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    info!("🌐 Simulation API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::internal(e))?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn start_simulation(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<Value>> {
    state.engine.start_project(&project_id).await?;
    Ok(Json(json!({
        "message": "Simulation started successfully",
        "project_id": project_id,
    })))
}

async fn stop_simulation(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<Value>> {
    state.engine.stop_project(&project_id).await?;
    Ok(Json(json!({
        "message": "Simulation stopped successfully",
        "project_id": project_id,
    })))
}

async fn get_simulation_status(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<crate::engine::SimulationStatus>> {
    Ok(Json(state.engine.status(&project_id).await?))
}

async fn get_all_simulation_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<crate::engine::SimulationStatus>>> {
    Ok(Json(state.engine.status_all().await?))
}

async fn validate_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<crate::engine::ValidationReport>> {
    Ok(Json(state.engine.validate_project(&project_id).await?))
}

async fn emergency_stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stopped = state.engine.emergency_stop_all().await;
    Json(json!({
        "message": "Emergency stop completed",
        "stopped_projects": stopped,
        "count": stopped.len(),
    }))
}

async fn test_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>> {
    Ok(Json(state.engine.test_device(&device_id).await?))
}

async fn test_connector(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectorTestRequest>,
) -> Result<Json<Value>> {
    Ok(Json(
        state
            .engine
            .test_target(&request.target_type, &request.config)
            .await?,
    ))
}

async fn get_connector_types() -> Json<Value> {
    Json(json!({
        "supported_types": crate::connector::supported_kinds(),
        "message": "List of supported target connector types",
    }))
}

// ----------------------------------------------------------------------------
// Metrics handlers
// ----------------------------------------------------------------------------

async fn get_all_metrics(State(state): State<Arc<AppState>>) -> Json<crate::metrics::MetricsDocument> {
    Json(state.engine.metrics().all_metrics())
}

async fn get_connector_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.engine.metrics().connector_snapshots()).unwrap_or_default())
}

async fn get_device_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.engine.metrics().device_snapshots()).unwrap_or_default())
}

async fn get_device_metrics_by_id(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<crate::metrics::DeviceMetricsSnapshot>> {
    state
        .engine
        .metrics()
        .device_snapshot(&device_id)
        .map(Json)
        .ok_or_else(|| Error::not_found("device", device_id))
}

async fn get_project_metrics(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Json<crate::metrics::ProjectMetricsSummary> {
    Json(state.engine.metrics().project_summary(&project_id))
}

async fn get_metrics_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let system = state.engine.metrics().system();
    Json(json!({
        "status": "healthy",
        "uptime_seconds": system.uptime_seconds,
        "total_connectors": system.total_connectors,
        "total_devices": system.total_devices,
        "metrics_collection_active": true,
    }))
}

async fn reset_all_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.engine.metrics().reset_all();
    Json(json!({"message": "All metrics reset successfully"}))
}

async fn reset_project_metrics(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Json<Value> {
    state.engine.metrics().reset_project(&project_id);
    Json(json!({
        "message": format!("Metrics for project {} reset successfully", project_id)
    }))
}

// ----------------------------------------------------------------------------
// Log streaming
// ----------------------------------------------------------------------------

async fn stream_logs(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_log_socket(socket, state, project_id))
        .into_response()
}

async fn handle_log_socket(mut socket: WebSocket, state: Arc<AppState>, project_id: String) {
    let Some(bundle) = state.engine.subscribe_logs(&project_id).await else {
        let notice = json!({
            "error": "Project not running",
            "message": format!("Project {} is not currently running", project_id),
        });
        let _ = socket.send(Message::Text(notice.to_string())).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    // Acknowledge, replay recent history, then stream live
    if send_entry(&mut socket, &bundle.ack).await.is_err() {
        return;
    }

    for entry in &bundle.subscription.replay {
        if send_entry(&mut socket, entry).await.is_err() {
            return;
        }
        // Small pacing delay so slow clients are not overwhelmed by replay
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut receiver = bundle.subscription.receiver;
    loop {
        tokio::select! {
            entry = receiver.recv() => {
                match entry {
                    Some(entry) => {
                        if send_entry(&mut socket, &entry).await.is_err() {
                            break;
                        }
                    }
                    // Hub dropped this subscriber (or the project stopped)
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Ignore client chatter, answer pings at the protocol level
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!("Log subscriber for project {} disconnected", project_id);
}

async fn send_entry(socket: &mut WebSocket, entry: &LogEntry) -> std::result::Result<(), ()> {
    let frame = match serde_json::to_string(entry) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Failed to serialize log entry: {}", e);
            return Err(());
        }
    };
    socket.send(Message::Text(frame)).await.map_err(|_| ())
}
