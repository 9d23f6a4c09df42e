//! Simulation engine
//!
//! Process-wide registry of running projects. Owns starting and stopping
//! project simulations, status aggregation, pre-flight validation, log
//! subscriptions and the emergency stop path. Constructed once in `main`
//! and dependency-injected into the API layer.

use crate::config::{LogStreamConfig, SimulatorConfig};
use crate::connector::{build_connector, validate_target_config};
use crate::error::{Error, Result};
use crate::generator::build_generator;
use crate::log_stream::{LogEntry, LogHub, LogSubscription};
use crate::metrics::MetricsCollector;
use crate::model::JsonMap;
use crate::project::SimulationProject;
use crate::simulator::{DeviceSimulator, DeviceStatus, SimulatorOptions};
use crate::store::DescriptorStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

/// Aggregated status of one project's simulation
#[derive(Debug, Clone, Serialize)]
pub struct SimulationStatus {
    pub project_id: String,
    pub is_running: bool,
    pub active_devices: usize,
    pub total_devices: usize,
    pub messages_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    pub devices: Vec<DeviceStatus>,
    pub errors: Vec<SimulationError>,
}

impl SimulationStatus {
    fn not_running(project_id: &str, total_devices: usize) -> Self {
        Self {
            project_id: project_id.to_string(),
            is_running: false,
            active_devices: 0,
            total_devices,
            messages_sent: 0,
            started_at: None,
            last_activity: None,
            devices: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// One device's most recent error, surfaced in the status report
#[derive(Debug, Clone, Serialize)]
pub struct SimulationError {
    pub device_id: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

/// Pre-flight validation report for a project
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub valid_devices: usize,
    pub total_devices: usize,
}

/// A log subscription together with its acknowledgement frame
pub struct LogSubscriptionBundle {
    pub ack: LogEntry,
    pub subscription: LogSubscription,
}

/// Process-wide simulation registry
pub struct SimulationEngine {
    store: Arc<dyn DescriptorStore>,
    metrics: Arc<MetricsCollector>,
    projects: RwLock<HashMap<String, Arc<SimulationProject>>>,
    simulator_config: SimulatorConfig,
    log_config: LogStreamConfig,
}

impl SimulationEngine {
    pub fn new(
        store: Arc<dyn DescriptorStore>,
        metrics: Arc<MetricsCollector>,
        simulator_config: SimulatorConfig,
        log_config: LogStreamConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            projects: RwLock::new(HashMap::new()),
            simulator_config,
            log_config,
        }
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    // ------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------

    /// Start simulation for a project. Succeeds iff at least one device
    /// simulator could be constructed and launched.
    #[instrument(skip(self))]
    pub async fn start_project(&self, project_id: &str) -> Result<usize> {
        // Hold the write lock across construction so concurrent starts of
        // the same project are serialized
        let mut projects = self.projects.write().await;
        if projects.contains_key(project_id) {
            return Err(Error::AlreadyRunning {
                project_id: project_id.to_string(),
            });
        }

        crate::store::require_project(self.store.as_ref(), project_id).await?;

        let devices = self.store.devices_for_project(project_id).await?;
        let hub = Arc::new(LogHub::new(&self.log_config));
        let options = SimulatorOptions::from(&self.simulator_config);
        let mut simulators = Vec::new();

        for device in devices {
            if !device.enabled {
                continue;
            }

            let payload_ref = match &device.payload_ref {
                Some(id) => id.clone(),
                None => {
                    warn!("Device {} has no payload assigned, skipping", device.id);
                    continue;
                }
            };
            let payload = match self.store.payload(&payload_ref).await? {
                Some(payload) => payload,
                None => {
                    warn!("Payload {} not found for device {}, skipping", payload_ref, device.id);
                    continue;
                }
            };
            let generator = match build_generator(&payload) {
                Ok(generator) => generator,
                Err(e) => {
                    error!("Invalid payload template for device {}: {}", device.id, e);
                    continue;
                }
            };

            let target_ref = match &device.target_ref {
                Some(id) => id.clone(),
                None => {
                    warn!("Device {} has no target assigned, skipping", device.id);
                    continue;
                }
            };
            let target = match self.store.target(&target_ref).await? {
                Some(target) => target,
                None => {
                    warn!("Target {} not found for device {}, skipping", target_ref, device.id);
                    continue;
                }
            };
            let connector = match build_connector(&target) {
                Ok(connector) => connector,
                Err(e) => {
                    error!("Invalid target config for device {}: {}", device.id, e);
                    continue;
                }
            };

            simulators.push(DeviceSimulator::new(
                device,
                generator,
                connector,
                self.metrics.clone(),
                hub.clone(),
                options.clone(),
            ));
        }

        if simulators.is_empty() {
            return Err(Error::config(format!(
                "no valid device simulators could be created for project {}",
                project_id
            )));
        }

        let launched = simulators.len();
        let project = SimulationProject::start(project_id.to_string(), simulators, hub);
        projects.insert(project_id.to_string(), project);

        info!("🚀 Simulation started for project {} ({} devices)", project_id, launched);
        Ok(launched)
    }

    /// Stop simulation for a project: cancel, drain, remove from the map
    #[instrument(skip(self))]
    pub async fn stop_project(&self, project_id: &str) -> Result<()> {
        let project = {
            let mut projects = self.projects.write().await;
            projects.remove(project_id).ok_or_else(|| Error::NotRunning {
                project_id: project_id.to_string(),
            })?
        };

        project.stop().await;
        info!("🛑 Simulation stopped for project {}", project_id);
        Ok(())
    }

    /// Stop every running project, continuing past individual failures.
    /// Returns the ids that were stopped.
    pub async fn emergency_stop_all(&self) -> Vec<String> {
        let running: Vec<String> = self.projects.read().await.keys().cloned().collect();
        let mut stopped = Vec::new();

        for project_id in running {
            match self.stop_project(&project_id).await {
                Ok(()) => stopped.push(project_id),
                Err(e) => {
                    error!("Emergency stop failed for project {}: {}", project_id, e);
                }
            }
        }

        info!("Emergency stop completed: {} projects stopped", stopped.len());
        stopped
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub async fn status(&self, project_id: &str) -> Result<SimulationStatus> {
        let project = self.projects.read().await.get(project_id).cloned();

        let Some(project) = project else {
            // Not running: report the enabled-device count from the store
            let total = self
                .store
                .devices_for_project(project_id)
                .await?
                .iter()
                .filter(|d| d.enabled)
                .count();
            return Ok(SimulationStatus::not_running(project_id, total));
        };

        let devices: Vec<DeviceStatus> = project
            .device_handles()
            .iter()
            .map(|handle| handle.status())
            .collect();

        let errors: Vec<SimulationError> = project
            .device_handles()
            .iter()
            .filter_map(|handle| {
                let stats = handle.stats();
                stats.last_error.map(|error_message| SimulationError {
                    device_id: handle.device_id.clone(),
                    error_message,
                    timestamp: stats.last_error_at.unwrap_or_else(Utc::now),
                })
            })
            .collect();

        let last_activity = devices
            .iter()
            .filter_map(|d| d.last_message_at)
            .max();

        Ok(SimulationStatus {
            project_id: project_id.to_string(),
            is_running: project.is_running(),
            active_devices: project.active_devices(),
            total_devices: project.device_handles().len(),
            messages_sent: project.total_messages_sent(),
            started_at: Some(project.started_at()),
            last_activity,
            devices,
            errors,
        })
    }

    pub async fn status_all(&self) -> Result<Vec<SimulationStatus>> {
        let ids: Vec<String> = self.projects.read().await.keys().cloned().collect();
        let mut statuses = Vec::with_capacity(ids.len());
        for project_id in ids {
            statuses.push(self.status(&project_id).await?);
        }
        Ok(statuses)
    }

    pub async fn running_project_ids(&self) -> Vec<String> {
        self.projects.read().await.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Validation and probes
    // ------------------------------------------------------------------

    /// Inspect a project's devices without starting anything
    pub async fn validate_project(&self, project_id: &str) -> Result<ValidationReport> {
        if self.store.project(project_id).await?.is_none() {
            return Ok(ValidationReport {
                valid: false,
                errors: vec!["Project not found".to_string()],
                warnings: Vec::new(),
                valid_devices: 0,
                total_devices: 0,
            });
        }

        let devices = self.store.devices_for_project(project_id).await?;
        let enabled: Vec<_> = devices.into_iter().filter(|d| d.enabled).collect();
        if enabled.is_empty() {
            return Ok(ValidationReport {
                valid: false,
                errors: vec!["No devices found in project".to_string()],
                warnings: Vec::new(),
                valid_devices: 0,
                total_devices: 0,
            });
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut valid_devices = 0;

        for device in &enabled {
            let Some(payload_ref) = &device.payload_ref else {
                errors.push(format!("Device '{}' has no payload generator assigned", device.name));
                continue;
            };
            if self.store.payload(payload_ref).await?.is_none() {
                errors.push(format!("Device '{}' has invalid payload generator", device.name));
                continue;
            }

            let Some(target_ref) = &device.target_ref else {
                errors.push(format!("Device '{}' has no target system assigned", device.name));
                continue;
            };
            if self.store.target(target_ref).await?.is_none() {
                errors.push(format!("Device '{}' has invalid target system", device.name));
                continue;
            }

            if device.send_interval_secs < 1 {
                errors.push(format!("Device '{}' has invalid send interval", device.name));
                continue;
            }
            if device.send_interval_secs < 5 {
                warnings.push(format!(
                    "Device '{}' has very short send interval ({}s)",
                    device.name, device.send_interval_secs
                ));
            }

            valid_devices += 1;
        }

        if valid_devices == 0 {
            errors.push("No valid devices found for simulation".to_string());
        }

        Ok(ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
            valid_devices,
            total_devices: enabled.len(),
        })
    }

    /// Dry-run one device: generate a sample payload, then connect and send
    /// a probe through its target
    pub async fn test_device(&self, device_id: &str) -> Result<Value> {
        let device = self
            .store
            .device(device_id)
            .await?
            .ok_or_else(|| Error::not_found("device", device_id))?;

        let Some(payload_ref) = &device.payload_ref else {
            return Ok(json!({"success": false, "error": "No payload generator assigned"}));
        };
        let Some(payload) = self.store.payload(payload_ref).await? else {
            return Ok(json!({"success": false, "error": "Payload generator not found"}));
        };

        let mut generator = match build_generator(&payload) {
            Ok(generator) => generator,
            Err(e) => {
                return Ok(json!({
                    "success": false,
                    "error": format!("Payload generation failed: {}", e)
                }));
            }
        };
        let sample = match generator.generate(&device.metadata) {
            Ok(sample) => sample,
            Err(e) => {
                return Ok(json!({
                    "success": false,
                    "error": format!("Payload generation failed: {}", e)
                }));
            }
        };

        let Some(target_ref) = &device.target_ref else {
            return Ok(json!({
                "success": false,
                "error": "No target system assigned",
                "payload": Value::Object(sample),
            }));
        };
        let Some(target) = self.store.target(target_ref).await? else {
            return Ok(json!({
                "success": false,
                "error": "Target system not found",
                "payload": Value::Object(sample),
            }));
        };

        let probe = self.probe_target(&target, &sample).await;
        let mut report = match probe {
            Ok(()) => json!({
                "success": true,
                "message": "Device configuration test successful",
            }),
            Err(e) => json!({
                "success": false,
                "error": format!("Target connection failed: {}", e),
            }),
        };
        report["payload"] = Value::Object(sample);
        Ok(report)
    }

    /// Factory-validate a raw connector config, then connect, send a probe
    /// payload and disconnect
    pub async fn test_target(&self, kind: &str, config: &Value) -> Result<Value> {
        validate_target_config(kind, config)?;

        let target = crate::model::TargetDescriptor {
            id: "connector-test".to_string(),
            name: "connector-test".to_string(),
            kind: crate::model::TargetKind::parse(kind)
                .ok_or_else(|| Error::invalid_config("kind", "unsupported target kind"))?,
            config: config.clone(),
        };

        let mut probe = JsonMap::new();
        probe.insert("test".to_string(), json!(true));
        probe.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        probe.insert(
            "message".to_string(),
            json!("Connection test from FleetSim"),
        );

        match self.probe_target(&target, &probe).await {
            Ok(()) => Ok(json!({
                "success": true,
                "message": "Connection test successful",
                "test_payload": Value::Object(probe),
            })),
            Err(e) => Ok(json!({
                "success": false,
                "error": format!("Connection test failed: {}", e),
            })),
        }
    }

    async fn probe_target(
        &self,
        target: &crate::model::TargetDescriptor,
        payload: &JsonMap,
    ) -> Result<()> {
        let mut connector = build_connector(target)?;
        connector.connect().await?;
        let result = connector.send(payload).await;
        connector.disconnect().await;
        result
    }

    // ------------------------------------------------------------------
    // Log streaming
    // ------------------------------------------------------------------

    /// Attach a log subscriber to a running project. `None` means the
    /// project is not running; the caller informs the subscriber.
    pub async fn subscribe_logs(&self, project_id: &str) -> Option<LogSubscriptionBundle> {
        let project = self.projects.read().await.get(project_id).cloned()?;
        let subscription = project.hub().subscribe();
        Some(LogSubscriptionBundle {
            ack: LogEntry::connection_established(project_id),
            subscription,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn snapshot_store(devices: Value) -> Arc<InMemoryStore> {
        let doc = json!({
            "projects": [{"id": "p1", "name": "plant-floor"}],
            "devices": devices,
            "payloads": [
                {"id": "pl-schema", "name": "telemetry", "kind": "schema",
                 "schema": {"fields": [
                     {"name": "t", "type": "number", "generator": {"type": "fixed", "value": 42}}
                 ]}},
                {"id": "pl-bad-script", "name": "broken", "kind": "script",
                 "script": "import os\nresult = #{x: 1};"}
            ],
            "targets": [
                {"id": "t-http", "name": "ingest", "kind": "http",
                 "config": {"url": "http://127.0.0.1:1/ingest", "method": "POST"}}
            ]
        });
        Arc::new(InMemoryStore::from_document(serde_json::from_value(doc).unwrap()))
    }

    fn engine(store: Arc<InMemoryStore>) -> SimulationEngine {
        SimulationEngine::new(
            store,
            Arc::new(MetricsCollector::default()),
            SimulatorConfig::default(),
            LogStreamConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_start_unknown_project_not_found() {
        let engine = engine(snapshot_store(json!([])));
        let err = engine.start_project("ghost").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_start_with_no_valid_devices_fails() {
        // Only device has a script payload that is rejected at construction
        let engine = engine(snapshot_store(json!([
            {"id": "d1", "name": "bad", "project_id": "p1",
             "payload_ref": "pl-bad-script", "target_ref": "t-http",
             "send_interval_secs": 1}
        ])));
        let err = engine.start_project("p1").await.unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_INVALID");
        assert!(engine.running_project_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_double_start_is_already_running() {
        let engine = engine(snapshot_store(json!([
            {"id": "d1", "name": "sensor", "project_id": "p1",
             "payload_ref": "pl-schema", "target_ref": "t-http",
             "send_interval_secs": 60}
        ])));

        assert_eq!(engine.start_project("p1").await.unwrap(), 1);
        let err = engine.start_project("p1").await.unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_RUNNING");

        engine.stop_project("p1").await.unwrap();
        assert!(engine.running_project_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let engine = engine(snapshot_store(json!([])));
        let err = engine.stop_project("p1").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_RUNNING");
    }

    #[tokio::test]
    async fn test_status_when_not_running() {
        let engine = engine(snapshot_store(json!([
            {"id": "d1", "name": "sensor", "project_id": "p1",
             "payload_ref": "pl-schema", "target_ref": "t-http"},
            {"id": "d2", "name": "offline", "project_id": "p1",
             "payload_ref": "pl-schema", "target_ref": "t-http", "enabled": false}
        ])));

        let status = engine.status("p1").await.unwrap();
        assert!(!status.is_running);
        assert_eq!(status.total_devices, 1);
        assert_eq!(status.active_devices, 0);
        assert_eq!(status.messages_sent, 0);
    }

    #[tokio::test]
    async fn test_validate_project_rules() {
        let engine = engine(snapshot_store(json!([
            {"id": "d1", "name": "ok", "project_id": "p1",
             "payload_ref": "pl-schema", "target_ref": "t-http",
             "send_interval_secs": 3},
            {"id": "d2", "name": "no-payload", "project_id": "p1",
             "target_ref": "t-http"},
            {"id": "d3", "name": "no-target", "project_id": "p1",
             "payload_ref": "pl-schema"},
            {"id": "d4", "name": "bad-target", "project_id": "p1",
             "payload_ref": "pl-schema", "target_ref": "missing"}
        ])));

        let report = engine.validate_project("p1").await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.valid_devices, 1);
        assert_eq!(report.total_devices, 4);
        assert_eq!(report.errors.len(), 3);
        // d1's 3s interval draws a warning
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_validate_missing_project() {
        let engine = engine(snapshot_store(json!([])));
        let report = engine.validate_project("ghost").await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors, vec!["Project not found".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_logs_when_not_running() {
        let engine = engine(snapshot_store(json!([])));
        assert!(engine.subscribe_logs("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_emergency_stop_clears_registry() {
        let engine = engine(snapshot_store(json!([
            {"id": "d1", "name": "sensor", "project_id": "p1",
             "payload_ref": "pl-schema", "target_ref": "t-http",
             "send_interval_secs": 60}
        ])));

        engine.start_project("p1").await.unwrap();
        let stopped = engine.emergency_stop_all().await;
        assert_eq!(stopped, vec!["p1".to_string()]);
        assert!(engine.running_project_ids().await.is_empty());
    }
}
