//! Metrics collection for simulation monitoring
//!
//! A process-wide, thread-safe aggregator shared by every device simulator.
//! Connector metrics are keyed by logical connector id (device id plus
//! connector kind); device metrics are keyed by `(project_id, device_id)` so
//! project summaries never depend on id formats. Everything lives in memory
//! and resets on restart.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Default sliding window for recent response times and outcomes
pub const DEFAULT_RESPONSE_WINDOW: usize = 100;

/// Device metrics key: project first, so summaries filter on the key itself
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub project_id: String,
    pub device_id: String,
}

impl DeviceKey {
    pub fn new(project_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            device_id: device_id.into(),
        }
    }
}

// ============================================================================
// Connector metrics
// ============================================================================

/// Counters and recent-window tracking for one logical connector
#[derive(Debug)]
struct ConnectorMetrics {
    connector_type: String,
    total_attempts: u64,
    successful_sends: u64,
    failed_sends: u64,
    connection_failures: u64,
    total_bytes_sent: u64,
    recent_response_times: VecDeque<f64>,
    recent_outcomes: VecDeque<bool>,
    last_success_time: Option<DateTime<Utc>>,
    last_failure_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ConnectorMetrics {
    fn new(connector_type: &str) -> Self {
        Self {
            connector_type: connector_type.to_string(),
            total_attempts: 0,
            successful_sends: 0,
            failed_sends: 0,
            connection_failures: 0,
            total_bytes_sent: 0,
            recent_response_times: VecDeque::new(),
            recent_outcomes: VecDeque::new(),
            last_success_time: None,
            last_failure_time: None,
            last_error: None,
        }
    }

    fn record_success(&mut self, response_time: f64, bytes_sent: u64, window: usize) {
        self.total_attempts += 1;
        self.successful_sends += 1;
        self.total_bytes_sent += bytes_sent;
        self.last_success_time = Some(Utc::now());

        self.recent_response_times.push_back(response_time);
        while self.recent_response_times.len() > window {
            self.recent_response_times.pop_front();
        }
        self.push_outcome(true, window);
    }

    fn record_failure(&mut self, error: &str, is_connection_error: bool, window: usize) {
        self.total_attempts += 1;
        self.failed_sends += 1;
        self.last_failure_time = Some(Utc::now());
        self.last_error = Some(error.to_string());
        if is_connection_error {
            self.connection_failures += 1;
        }
        self.push_outcome(false, window);
    }

    fn push_outcome(&mut self, success: bool, window: usize) {
        self.recent_outcomes.push_back(success);
        while self.recent_outcomes.len() > window {
            self.recent_outcomes.pop_front();
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.successful_sends as f64 / self.total_attempts as f64
        }
    }

    fn recent_success_rate(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            0.0
        } else {
            let successes = self.recent_outcomes.iter().filter(|s| **s).count();
            successes as f64 / self.recent_outcomes.len() as f64
        }
    }

    fn avg_response_time(&self) -> f64 {
        if self.recent_response_times.is_empty() {
            0.0
        } else {
            self.recent_response_times.iter().sum::<f64>() / self.recent_response_times.len() as f64
        }
    }

    fn snapshot(&self) -> ConnectorMetricsSnapshot {
        ConnectorMetricsSnapshot {
            connector_type: self.connector_type.clone(),
            total_attempts: self.total_attempts,
            successful_sends: self.successful_sends,
            failed_sends: self.failed_sends,
            connection_failures: self.connection_failures,
            total_bytes_sent: self.total_bytes_sent,
            success_rate: self.success_rate(),
            recent_success_rate: self.recent_success_rate(),
            avg_response_time: self.avg_response_time(),
            last_success_time: self.last_success_time,
            last_failure_time: self.last_failure_time,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view of one connector's metrics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorMetricsSnapshot {
    pub connector_type: String,
    pub total_attempts: u64,
    pub successful_sends: u64,
    pub failed_sends: u64,
    pub connection_failures: u64,
    pub total_bytes_sent: u64,
    pub success_rate: f64,
    pub recent_success_rate: f64,
    pub avg_response_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ============================================================================
// Device metrics
// ============================================================================

#[derive(Debug)]
struct DeviceMetrics {
    device_name: String,
    messages_generated: u64,
    messages_sent: u64,
    payload_generation_failures: u64,
    send_failures: u64,
    total_retries: u64,
    uptime_start: DateTime<Utc>,
    last_activity: Option<DateTime<Utc>>,
}

impl DeviceMetrics {
    fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
            messages_generated: 0,
            messages_sent: 0,
            payload_generation_failures: 0,
            send_failures: 0,
            total_retries: 0,
            uptime_start: Utc::now(),
            last_activity: None,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }

    fn send_success_rate(&self) -> f64 {
        let attempts = self.messages_sent + self.send_failures;
        if attempts == 0 {
            0.0
        } else {
            self.messages_sent as f64 / attempts as f64
        }
    }

    fn snapshot(&self, key: &DeviceKey) -> DeviceMetricsSnapshot {
        DeviceMetricsSnapshot {
            device_id: key.device_id.clone(),
            device_name: self.device_name.clone(),
            project_id: key.project_id.clone(),
            messages_generated: self.messages_generated,
            messages_sent: self.messages_sent,
            payload_generation_failures: self.payload_generation_failures,
            send_failures: self.send_failures,
            total_retries: self.total_retries,
            send_success_rate: self.send_success_rate(),
            uptime_seconds: (Utc::now() - self.uptime_start).num_milliseconds() as f64 / 1000.0,
            last_activity: self.last_activity,
        }
    }
}

/// Read-only view of one device's metrics
#[derive(Debug, Clone, Serialize)]
pub struct DeviceMetricsSnapshot {
    pub device_id: String,
    pub device_name: String,
    pub project_id: String,
    pub messages_generated: u64,
    pub messages_sent: u64,
    pub payload_generation_failures: u64,
    pub send_failures: u64,
    pub total_retries: u64,
    pub send_success_rate: f64,
    pub uptime_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

// ============================================================================
// Aggregate views
// ============================================================================

/// Per-project aggregation over its devices
#[derive(Debug, Clone, Serialize)]
pub struct ProjectMetricsSummary {
    pub project_id: String,
    pub total_devices: usize,
    pub total_messages_sent: u64,
    pub total_failures: u64,
    pub avg_success_rate: f64,
    pub uptime_seconds: f64,
}

/// System-level view
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub uptime_seconds: f64,
    pub total_connectors: usize,
    pub total_devices: usize,
}

/// Full metrics document
#[derive(Debug, Clone, Serialize)]
pub struct MetricsDocument {
    pub connectors: HashMap<String, ConnectorMetricsSnapshot>,
    pub devices: HashMap<String, DeviceMetricsSnapshot>,
    pub system: SystemMetrics,
}

// ============================================================================
// Collector
// ============================================================================

/// Central metrics collector shared across all simulators
pub struct MetricsCollector {
    connectors: RwLock<HashMap<String, ConnectorMetrics>>,
    devices: RwLock<HashMap<DeviceKey, DeviceMetrics>>,
    start_time: RwLock<DateTime<Utc>>,
    window: usize,
}

impl MetricsCollector {
    pub fn new(window: usize) -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            start_time: RwLock::new(Utc::now()),
            window: window.max(1),
        }
    }

    // ------------------------------------------------------------------
    // Connector recording
    // ------------------------------------------------------------------

    pub fn record_connector_success(
        &self,
        connector_id: &str,
        connector_type: &str,
        response_time: f64,
        bytes_sent: u64,
    ) {
        let mut connectors = self.connectors.write().unwrap();
        connectors
            .entry(connector_id.to_string())
            .or_insert_with(|| ConnectorMetrics::new(connector_type))
            .record_success(response_time, bytes_sent, self.window);
    }

    pub fn record_connector_failure(
        &self,
        connector_id: &str,
        connector_type: &str,
        error: &str,
        is_connection_error: bool,
    ) {
        let mut connectors = self.connectors.write().unwrap();
        connectors
            .entry(connector_id.to_string())
            .or_insert_with(|| ConnectorMetrics::new(connector_type))
            .record_failure(error, is_connection_error, self.window);
    }

    // ------------------------------------------------------------------
    // Device recording
    // ------------------------------------------------------------------

    fn with_device<F: FnOnce(&mut DeviceMetrics)>(&self, key: &DeviceKey, name: &str, f: F) {
        let mut devices = self.devices.write().unwrap();
        let metrics = devices
            .entry(key.clone())
            .or_insert_with(|| DeviceMetrics::new(name));
        f(metrics);
    }

    pub fn record_message_generated(&self, key: &DeviceKey, name: &str) {
        self.with_device(key, name, |m| {
            m.messages_generated += 1;
            m.touch();
        });
    }

    pub fn record_message_sent(&self, key: &DeviceKey, name: &str) {
        self.with_device(key, name, |m| {
            m.messages_sent += 1;
            m.touch();
        });
    }

    pub fn record_payload_failure(&self, key: &DeviceKey, name: &str) {
        self.with_device(key, name, |m| {
            m.payload_generation_failures += 1;
            m.touch();
        });
    }

    pub fn record_send_failure(&self, key: &DeviceKey, name: &str) {
        self.with_device(key, name, |m| {
            m.send_failures += 1;
            m.touch();
        });
    }

    pub fn record_retry(&self, key: &DeviceKey, name: &str) {
        self.with_device(key, name, |m| m.total_retries += 1);
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn connector_snapshots(&self) -> HashMap<String, ConnectorMetricsSnapshot> {
        self.connectors
            .read()
            .unwrap()
            .iter()
            .map(|(id, metrics)| (id.clone(), metrics.snapshot()))
            .collect()
    }

    pub fn device_snapshots(&self) -> HashMap<String, DeviceMetricsSnapshot> {
        self.devices
            .read()
            .unwrap()
            .iter()
            .map(|(key, metrics)| (key.device_id.clone(), metrics.snapshot(key)))
            .collect()
    }

    pub fn device_snapshot(&self, device_id: &str) -> Option<DeviceMetricsSnapshot> {
        self.devices
            .read()
            .unwrap()
            .iter()
            .find(|(key, _)| key.device_id == device_id)
            .map(|(key, metrics)| metrics.snapshot(key))
    }

    pub fn project_summary(&self, project_id: &str) -> ProjectMetricsSummary {
        let devices = self.devices.read().unwrap();
        let project_devices: Vec<_> = devices
            .iter()
            .filter(|(key, _)| key.project_id == project_id)
            .map(|(_, metrics)| metrics)
            .collect();

        let uptime = self.uptime_seconds();
        if project_devices.is_empty() {
            return ProjectMetricsSummary {
                project_id: project_id.to_string(),
                total_devices: 0,
                total_messages_sent: 0,
                total_failures: 0,
                avg_success_rate: 0.0,
                uptime_seconds: uptime,
            };
        }

        let total_messages = project_devices.iter().map(|m| m.messages_sent).sum();
        let total_failures = project_devices
            .iter()
            .map(|m| m.send_failures + m.payload_generation_failures)
            .sum();
        let avg_success_rate = project_devices
            .iter()
            .map(|m| m.send_success_rate())
            .sum::<f64>()
            / project_devices.len() as f64;

        ProjectMetricsSummary {
            project_id: project_id.to_string(),
            total_devices: project_devices.len(),
            total_messages_sent: total_messages,
            total_failures,
            avg_success_rate,
            uptime_seconds: uptime,
        }
    }

    pub fn system(&self) -> SystemMetrics {
        SystemMetrics {
            uptime_seconds: self.uptime_seconds(),
            total_connectors: self.connectors.read().unwrap().len(),
            total_devices: self.devices.read().unwrap().len(),
        }
    }

    pub fn all_metrics(&self) -> MetricsDocument {
        MetricsDocument {
            connectors: self.connector_snapshots(),
            devices: self.device_snapshots(),
            system: self.system(),
        }
    }

    fn uptime_seconds(&self) -> f64 {
        let start = *self.start_time.read().unwrap();
        (Utc::now() - start).num_milliseconds() as f64 / 1000.0
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Drop device metrics for one project
    pub fn reset_project(&self, project_id: &str) {
        self.devices
            .write()
            .unwrap()
            .retain(|key, _| key.project_id != project_id);
    }

    /// Drop everything and rewind the uptime clock
    pub fn reset_all(&self) {
        self.connectors.write().unwrap().clear();
        self.devices.write().unwrap().clear();
        *self.start_time.write().unwrap() = Utc::now();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_success_rate_identities() {
        let collector = MetricsCollector::default();
        let snapshot = collector.connector_snapshots();
        assert!(snapshot.is_empty());

        collector.record_connector_failure("c1", "http", "boom", false);
        collector.record_connector_success("c1", "http", 0.05, 128);
        collector.record_connector_success("c1", "http", 0.07, 128);

        let snapshot = &collector.connector_snapshots()["c1"];
        assert_eq!(snapshot.total_attempts, 3);
        assert_eq!(snapshot.successful_sends, 2);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.recent_success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.total_bytes_sent, 256);
    }

    #[test]
    fn test_connection_failures_counted_separately() {
        let collector = MetricsCollector::default();
        collector.record_connector_failure("c1", "mqtt", "refused", true);
        collector.record_connector_failure("c1", "mqtt", "nack", false);

        let snapshot = &collector.connector_snapshots()["c1"];
        assert_eq!(snapshot.failed_sends, 2);
        assert_eq!(snapshot.connection_failures, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("nack"));
    }

    #[test]
    fn test_window_is_bounded() {
        let collector = MetricsCollector::new(10);
        for _ in 0..25 {
            collector.record_connector_success("c1", "http", 0.01, 1);
        }
        let connectors = collector.connectors.read().unwrap();
        let metrics = connectors.get("c1").unwrap();
        assert_eq!(metrics.recent_response_times.len(), 10);
        assert_eq!(metrics.recent_outcomes.len(), 10);
    }

    #[test]
    fn test_device_send_success_rate() {
        let collector = MetricsCollector::default();
        let key = DeviceKey::new("p1", "d1");
        collector.record_message_sent(&key, "sensor");
        collector.record_message_sent(&key, "sensor");
        collector.record_send_failure(&key, "sensor");

        let snapshot = collector.device_snapshot("d1").unwrap();
        assert!((snapshot.send_success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.project_id, "p1");
    }

    #[test]
    fn test_project_summary_filters_by_project() {
        let collector = MetricsCollector::default();
        collector.record_message_sent(&DeviceKey::new("p1", "d1"), "a");
        collector.record_message_sent(&DeviceKey::new("p1", "d2"), "b");
        collector.record_send_failure(&DeviceKey::new("p2", "d3"), "c");

        let summary = collector.project_summary("p1");
        assert_eq!(summary.total_devices, 2);
        assert_eq!(summary.total_messages_sent, 2);
        assert_eq!(summary.total_failures, 0);

        let other = collector.project_summary("p2");
        assert_eq!(other.total_devices, 1);
        assert_eq!(other.total_failures, 1);

        let empty = collector.project_summary("p3");
        assert_eq!(empty.total_devices, 0);
        assert_eq!(empty.avg_success_rate, 0.0);
    }

    #[test]
    fn test_reset_project_and_all() {
        let collector = MetricsCollector::default();
        collector.record_message_sent(&DeviceKey::new("p1", "d1"), "a");
        collector.record_message_sent(&DeviceKey::new("p2", "d2"), "b");
        collector.record_connector_success("c1", "http", 0.01, 1);

        collector.reset_project("p1");
        assert!(collector.device_snapshot("d1").is_none());
        assert!(collector.device_snapshot("d2").is_some());

        collector.reset_all();
        assert_eq!(collector.system().total_devices, 0);
        assert_eq!(collector.system().total_connectors, 0);
    }

    proptest! {
        #[test]
        fn prop_success_rate_matches_counts(outcomes in proptest::collection::vec(any::<bool>(), 0..200)) {
            let collector = MetricsCollector::default();
            let mut successes = 0u64;
            for (i, success) in outcomes.iter().enumerate() {
                if *success {
                    successes += 1;
                    collector.record_connector_success("c", "http", 0.01, 1);
                } else {
                    collector.record_connector_failure("c", "http", &format!("e{}", i), false);
                }
            }

            if outcomes.is_empty() {
                prop_assert!(collector.connector_snapshots().get("c").is_none());
            } else {
                let snapshot = &collector.connector_snapshots()["c"];
                let expected = successes as f64 / outcomes.len() as f64;
                prop_assert!((snapshot.success_rate - expected).abs() < 1e-9);
            }
        }
    }
}
