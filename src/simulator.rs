//! Individual device simulator
//!
//! One instance per enabled device. The control loop runs as an independent
//! tokio task: generate a payload, ensure the target session, send with
//! retry, record metrics, emit a log event, sleep to the next tick. Nothing
//! escapes the loop — every failure is classified, counted and either
//! retried or, past the consecutive-error cap, stops the device itself.

use crate::connector::{backoff_delay, CircuitBreakerSnapshot, TargetConnector};
use crate::error::Error;
use crate::generator::PayloadGenerator;
use crate::log_stream::{EventType, LogEntry, LogHub};
use crate::metrics::{DeviceKey, MetricsCollector};
use crate::model::{DeviceDescriptor, JsonMap};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Per-tick retry behavior
#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_consecutive_errors: u32,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_consecutive_errors: 10,
        }
    }
}

impl From<&crate::config::SimulatorConfig> for SimulatorOptions {
    fn from(config: &crate::config::SimulatorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            max_consecutive_errors: config.max_consecutive_errors,
        }
    }
}

/// Which counter a recorded error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorScope {
    General,
    Connection,
    Send,
}

/// Statistics owned by one simulator, read by status endpoints
#[derive(Debug, Default, Clone)]
pub struct DeviceStats {
    pub messages_sent: u64,
    pub errors: u64,
    pub connection_errors: u64,
    pub send_errors: u64,
    pub consecutive_errors: u32,
    pub total_retries: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_connection_attempt: Option<DateTime<Utc>>,
}

impl DeviceStats {
    /// A successful send resets the consecutive-error run
    fn increment_messages(&mut self) {
        self.messages_sent += 1;
        let now = Utc::now();
        self.last_message_at = Some(now);
        self.last_success_at = Some(now);
        self.consecutive_errors = 0;
    }

    fn record_error(&mut self, error: &str, scope: ErrorScope) {
        self.errors += 1;
        self.consecutive_errors += 1;
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
        match scope {
            ErrorScope::Connection => self.connection_errors += 1,
            ErrorScope::Send => self.send_errors += 1,
            ErrorScope::General => {}
        }
    }

    fn record_retry(&mut self) {
        self.total_retries += 1;
    }
}

/// Wire shape of one device's status
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub device_name: String,
    pub is_running: bool,
    pub is_connected: bool,
    pub messages_sent: u64,
    pub errors: u64,
    pub connection_errors: u64,
    pub send_errors: u64,
    pub consecutive_errors: u32,
    pub total_retries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connection_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_stats: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
}

/// Shared view of a running simulator, held by the project for status reads
pub struct DeviceHandle {
    pub device_id: String,
    pub device_name: String,
    pub project_id: String,
    running: AtomicBool,
    connected: AtomicBool,
    stats: Mutex<DeviceStats>,
    connector_stats: Mutex<Option<Value>>,
    circuit: Mutex<Option<CircuitBreakerSnapshot>>,
}

impl DeviceHandle {
    fn new(descriptor: &DeviceDescriptor) -> Self {
        Self {
            device_id: descriptor.id.clone(),
            device_name: descriptor.name.clone(),
            project_id: descriptor.project_id.clone(),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            stats: Mutex::new(DeviceStats::default()),
            connector_stats: Mutex::new(None),
            circuit: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn status(&self) -> DeviceStatus {
        let stats = self.stats();
        DeviceStatus {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            is_running: self.is_running(),
            is_connected: self.is_connected(),
            messages_sent: stats.messages_sent,
            errors: stats.errors,
            connection_errors: stats.connection_errors,
            send_errors: stats.send_errors,
            consecutive_errors: stats.consecutive_errors,
            total_retries: stats.total_retries,
            last_message_at: stats.last_message_at,
            last_success_at: stats.last_success_at,
            last_error: stats.last_error,
            last_error_at: stats.last_error_at,
            last_connection_attempt: stats.last_connection_attempt,
            websocket_stats: self.connector_stats.lock().unwrap().clone(),
            circuit_breaker: self.circuit.lock().unwrap().clone(),
        }
    }
}

/// Simulates an individual device
pub struct DeviceSimulator {
    descriptor: DeviceDescriptor,
    generator: PayloadGenerator,
    connector: Box<dyn TargetConnector>,
    handle: Arc<DeviceHandle>,
    metrics: Arc<MetricsCollector>,
    hub: Arc<LogHub>,
    options: SimulatorOptions,
    connector_id: String,
    connector_kind: &'static str,
    device_key: DeviceKey,
}

impl DeviceSimulator {
    pub fn new(
        descriptor: DeviceDescriptor,
        generator: PayloadGenerator,
        connector: Box<dyn TargetConnector>,
        metrics: Arc<MetricsCollector>,
        hub: Arc<LogHub>,
        options: SimulatorOptions,
    ) -> Self {
        let handle = Arc::new(DeviceHandle::new(&descriptor));
        let connector_kind = connector.kind();
        let connector_id = format!("{}_{}", descriptor.id, connector_kind);
        let device_key = DeviceKey::new(descriptor.project_id.clone(), descriptor.id.clone());

        Self {
            descriptor,
            generator,
            connector,
            handle,
            metrics,
            hub,
            options,
            connector_id,
            connector_kind,
            device_key,
        }
    }

    pub fn handle(&self) -> Arc<DeviceHandle> {
        self.handle.clone()
    }

    fn log_event(&self, event_type: EventType, message: impl Into<String>) {
        self.hub.publish(LogEntry::new(
            &self.descriptor.id,
            &self.descriptor.name,
            event_type,
            message,
        ));
    }

    fn log_event_with_payload(
        &self,
        event_type: EventType,
        message: impl Into<String>,
        payload: &JsonMap,
    ) {
        self.hub.publish(
            LogEntry::new(&self.descriptor.id, &self.descriptor.name, event_type, message)
                .with_payload(Value::Object(payload.clone())),
        );
    }

    /// Copy connector-side observability into the shared handle
    fn refresh_connector_view(&self) {
        *self.handle.connector_stats.lock().unwrap() = self.connector.connection_stats();
        *self.handle.circuit.lock().unwrap() = self.connector.circuit_state();
        self.handle
            .connected
            .store(self.connector.is_connected(), Ordering::SeqCst);
    }

    /// Main simulation loop for the device
    #[instrument(skip(self, token), fields(device = %self.descriptor.id))]
    pub async fn run(mut self, token: CancellationToken) {
        self.handle.running.store(true, Ordering::SeqCst);
        self.log_event(EventType::Started, "Device simulation started");

        if self.connector.manages_reconnection() {
            self.log_event(EventType::Info, "Auto-reconnection enabled for WebSocket connector");
        }

        // Initial connection to the target system
        self.ensure_connection(&token).await;

        let interval = Duration::from_secs(self.descriptor.send_interval_secs.max(1));

        while !token.is_cancelled() {
            let consecutive = self.handle.stats.lock().unwrap().consecutive_errors;
            if consecutive >= self.options.max_consecutive_errors {
                self.log_event(
                    EventType::Error,
                    format!(
                        "Device stopped due to {} consecutive errors",
                        self.options.max_consecutive_errors
                    ),
                );
                break;
            }

            let payload = self.build_payload();
            let sent = self.send_with_retry(&payload, &token).await;
            if token.is_cancelled() {
                break;
            }

            if sent {
                self.handle.stats.lock().unwrap().increment_messages();
                self.log_event_with_payload(
                    EventType::MessageSent,
                    format!("Message sent successfully to {} target", self.connector_kind),
                    &payload,
                );
            } else {
                self.handle
                    .stats
                    .lock()
                    .unwrap()
                    .record_error("Failed to send message after retries", ErrorScope::Send);
                self.log_event(
                    EventType::Error,
                    "Failed to send message to target system after retries",
                );
            }

            self.refresh_connector_view();

            // Wait for the next tick, responsive to cancellation
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        // Shutdown path: stop adapter background work, best-effort disconnect
        self.handle.running.store(false, Ordering::SeqCst);
        self.safe_disconnect().await;
        self.log_event(EventType::Stopped, "Device simulation stopped");
        debug!("Simulator for device {} exited", self.descriptor.id);
    }

    /// Generate the tick's payload; on failure, count it and fall back
    fn build_payload(&mut self) -> JsonMap {
        match self.generator.generate(&self.descriptor.metadata) {
            Ok(mut payload) => {
                if !payload.contains_key("device_id") {
                    payload.insert(
                        "device_id".to_string(),
                        Value::String(self.descriptor.id.clone()),
                    );
                }
                if !payload.contains_key("device_name") {
                    payload.insert(
                        "device_name".to_string(),
                        Value::String(self.descriptor.name.clone()),
                    );
                }
                self.metrics
                    .record_message_generated(&self.device_key, &self.descriptor.name);
                payload
            }
            Err(e) => {
                self.metrics
                    .record_payload_failure(&self.device_key, &self.descriptor.name);
                let message = e.to_string();
                self.handle
                    .stats
                    .lock()
                    .unwrap()
                    .record_error(&message, ErrorScope::General);
                self.log_event(
                    EventType::Warning,
                    format!("{}, using fallback payload", message),
                );

                let mut fallback = JsonMap::new();
                fallback.insert(
                    "device_id".to_string(),
                    Value::String(self.descriptor.id.clone()),
                );
                fallback.insert(
                    "device_name".to_string(),
                    Value::String(self.descriptor.name.clone()),
                );
                fallback.insert(
                    "timestamp".to_string(),
                    Value::String(Utc::now().to_rfc3339()),
                );
                fallback.insert(
                    "error".to_string(),
                    Value::String("payload_generation_failed".to_string()),
                );
                fallback.insert("message".to_string(), Value::String(message));
                fallback
            }
        }
    }

    /// Establish the target session with exponential backoff.
    ///
    /// WebSocket adapters run their own reconnection loop, so they get a
    /// single attempt here and the adapter takes over afterwards.
    async fn ensure_connection(&mut self, token: &CancellationToken) -> bool {
        if self.handle.is_connected() && self.connector.is_connected() {
            return true;
        }

        if self.connector.manages_reconnection() {
            self.handle.stats.lock().unwrap().last_connection_attempt = Some(Utc::now());
            return match self.connector.connect().await {
                Ok(()) => {
                    self.handle.connected.store(true, Ordering::SeqCst);
                    self.log_event(
                        EventType::Connected,
                        format!("Connected to {} target", self.connector_kind),
                    );
                    true
                }
                Err(e) => {
                    self.handle
                        .stats
                        .lock()
                        .unwrap()
                        .record_error(&e.to_string(), ErrorScope::Connection);
                    self.log_event(
                        EventType::Warning,
                        format!("{}, auto-reconnection will handle retries", e),
                    );
                    false
                }
            };
        }

        for attempt in 0..=self.options.max_retries {
            if token.is_cancelled() {
                return false;
            }

            self.handle.stats.lock().unwrap().last_connection_attempt = Some(Utc::now());
            match self.connector.connect().await {
                Ok(()) => {
                    self.handle.connected.store(true, Ordering::SeqCst);
                    self.log_event(
                        EventType::Connected,
                        format!("Connected to {} target", self.connector_kind),
                    );
                    return true;
                }
                Err(e) => {
                    let message = format!("Connection attempt {} failed: {}", attempt + 1, e);
                    self.handle
                        .stats
                        .lock()
                        .unwrap()
                        .record_error(&message, ErrorScope::Connection);

                    if attempt < self.options.max_retries {
                        self.handle.stats.lock().unwrap().record_retry();
                        self.log_event(EventType::Warning, format!("{}, retrying...", message));
                        let delay =
                            backoff_delay(self.options.retry_delay, attempt, Duration::from_secs(60));
                        tokio::select! {
                            _ = token.cancelled() => return false,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        self.log_event(
                            EventType::Error,
                            format!(
                                "Failed to connect after {} attempts",
                                self.options.max_retries + 1
                            ),
                        );
                    }
                }
            }
        }

        false
    }

    /// Deliver one payload with retry and backoff, recording metrics
    async fn send_with_retry(&mut self, payload: &JsonMap, token: &CancellationToken) -> bool {
        let payload_bytes = serde_json::to_vec(&Value::Object(payload.clone()))
            .map(|b| b.len() as u64)
            .unwrap_or(0);

        // WebSocket adapters retry internally: one attempt is final here
        if self.connector.manages_reconnection() {
            let send_start = Instant::now();
            return match self.connector.send(payload).await {
                Ok(()) => {
                    self.metrics.record_connector_success(
                        &self.connector_id,
                        self.connector_kind,
                        send_start.elapsed().as_secs_f64(),
                        payload_bytes,
                    );
                    self.metrics
                        .record_message_sent(&self.device_key, &self.descriptor.name);
                    self.handle.connected.store(true, Ordering::SeqCst);
                    true
                }
                Err(e) => {
                    let message = e.to_string();
                    self.metrics.record_connector_failure(
                        &self.connector_id,
                        self.connector_kind,
                        &message,
                        e.is_connection_error(),
                    );
                    self.metrics
                        .record_send_failure(&self.device_key, &self.descriptor.name);
                    self.handle.connected.store(false, Ordering::SeqCst);
                    false
                }
            };
        }

        for attempt in 0..=self.options.max_retries {
            if token.is_cancelled() {
                return false;
            }

            if !self.handle.is_connected() && !self.ensure_connection(token).await {
                self.metrics.record_connector_failure(
                    &self.connector_id,
                    self.connector_kind,
                    "Connection failed",
                    true,
                );
                self.metrics
                    .record_send_failure(&self.device_key, &self.descriptor.name);
                return false;
            }

            let send_start = Instant::now();
            match self.connector.send(payload).await {
                Ok(()) => {
                    self.metrics.record_connector_success(
                        &self.connector_id,
                        self.connector_kind,
                        send_start.elapsed().as_secs_f64(),
                        payload_bytes,
                    );
                    self.metrics
                        .record_message_sent(&self.device_key, &self.descriptor.name);
                    return true;
                }
                Err(e) => {
                    let message = format!("Send attempt {} failed: {}", attempt + 1, e);

                    if attempt < self.options.max_retries {
                        {
                            let mut stats = self.handle.stats.lock().unwrap();
                            stats.record_retry();
                        }
                        self.metrics
                            .record_retry(&self.device_key, &self.descriptor.name);
                        self.log_event(EventType::Warning, format!("{}, retrying...", message));

                        // Force a reconnect before the next attempt
                        self.handle.connected.store(false, Ordering::SeqCst);
                        if matches!(e, Error::SendFailed { .. } | Error::ConnectionFailed { .. }) {
                            self.connector.disconnect().await;
                        }

                        let delay =
                            backoff_delay(self.options.retry_delay, attempt, Duration::from_secs(60));
                        tokio::select! {
                            _ = token.cancelled() => return false,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        // The run loop records the tick-level failure once;
                        // here only the connector-level accounting happens
                        self.metrics.record_connector_failure(
                            &self.connector_id,
                            self.connector_kind,
                            &message,
                            e.is_connection_error(),
                        );
                        self.metrics
                            .record_send_failure(&self.device_key, &self.descriptor.name);
                        self.log_event(
                            EventType::Error,
                            format!(
                                "Send failed after {} attempts: {}",
                                self.options.max_retries + 1,
                                e
                            ),
                        );
                    }
                }
            }
        }

        false
    }

    /// Best-effort disconnect on the shutdown path
    async fn safe_disconnect(&mut self) {
        if self.handle.is_connected() || self.connector.is_connected() {
            self.connector.disconnect().await;
            self.handle.connected.store(false, Ordering::SeqCst);
            self.log_event(EventType::Disconnected, "Disconnected from target system");
        } else {
            // Still release adapter background tasks (WebSocket monitor)
            self.connector.disconnect().await;
        }
        info!("Device {} disconnected", self.descriptor.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogStreamConfig;
    use crate::error::Result;
    use crate::generator::{build_generator, PayloadGenerator};
    use crate::model::{PayloadDescriptor, PayloadKind, PayloadSchema};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU32;

    fn descriptor(interval: u64) -> DeviceDescriptor {
        serde_json::from_value(serde_json::json!({
            "id": "d1",
            "name": "sensor-1",
            "project_id": "p1",
            "send_interval_secs": interval,
            "metadata": {"site": "factory-a"}
        }))
        .unwrap()
    }

    fn fixed_generator() -> PayloadGenerator {
        build_generator(&PayloadDescriptor {
            id: "pl1".into(),
            name: "telemetry".into(),
            kind: PayloadKind::Schema,
            schema: Some(
                serde_json::from_value::<PayloadSchema>(serde_json::json!({
                    "fields": [
                        {"name": "t", "type": "number", "generator": {"type": "fixed", "value": 42}}
                    ]
                }))
                .unwrap(),
            ),
            script: None,
        })
        .unwrap()
    }

    /// Connector whose outcomes are scripted per call
    struct ScriptedConnector {
        outcomes: Arc<Mutex<Vec<bool>>>,
        sends: Arc<AtomicU32>,
        connected: bool,
    }

    impl ScriptedConnector {
        fn new(outcomes: Vec<bool>) -> (Self, Arc<AtomicU32>) {
            let sends = Arc::new(AtomicU32::new(0));
            (
                Self {
                    outcomes: Arc::new(Mutex::new(outcomes)),
                    sends: sends.clone(),
                    connected: false,
                },
                sends,
            )
        }
    }

    #[async_trait]
    impl TargetConnector for ScriptedConnector {
        fn kind(&self) -> &'static str {
            "http"
        }

        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn send(&mut self, _payload: &JsonMap) -> Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            let ok = if outcomes.is_empty() {
                true
            } else {
                outcomes.remove(0)
            };
            if ok {
                Ok(())
            } else {
                Err(Error::send("scripted failure"))
            }
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn build_simulator(
        outcomes: Vec<bool>,
        options: SimulatorOptions,
    ) -> (DeviceSimulator, Arc<DeviceHandle>, Arc<AtomicU32>, Arc<LogHub>) {
        let (connector, sends) = ScriptedConnector::new(outcomes);
        let hub = Arc::new(LogHub::new(&LogStreamConfig::default()));
        let simulator = DeviceSimulator::new(
            descriptor(1),
            fixed_generator(),
            Box::new(connector),
            Arc::new(MetricsCollector::default()),
            hub.clone(),
            options,
        );
        let handle = simulator.handle();
        (simulator, handle, sends, hub)
    }

    fn fast_options() -> SimulatorOptions {
        SimulatorOptions {
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            max_consecutive_errors: 10,
        }
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_with_retries() {
        // First two attempts fail, third succeeds: one tick, two retries
        let (mut simulator, handle, sends, _hub) =
            build_simulator(vec![false, false, true], fast_options());

        let token = CancellationToken::new();
        simulator.ensure_connection(&token).await;
        let payload = simulator.build_payload();
        let sent = simulator.send_with_retry(&payload, &token).await;
        assert!(sent);
        simulator.handle.stats.lock().unwrap().increment_messages();

        let stats = handle.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.total_retries, 2);
        assert_eq!(stats.consecutive_errors, 0);
        assert_eq!(sends.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_send_gives_up_after_max_retries() {
        let (mut simulator, handle, sends, _hub) =
            build_simulator(vec![false; 10], fast_options());

        let token = CancellationToken::new();
        simulator.ensure_connection(&token).await;
        let payload = simulator.build_payload();
        let sent = simulator.send_with_retry(&payload, &token).await;
        assert!(!sent);

        // max_retries + 1 attempts total; the run loop owns the final
        // tick-level error record
        assert_eq!(sends.load(Ordering::SeqCst), 4);
        let stats = handle.stats();
        assert_eq!(stats.total_retries, 3);
        assert_eq!(stats.send_errors, 0);
    }

    #[tokio::test]
    async fn test_self_stop_after_consecutive_error_cap() {
        let options = SimulatorOptions {
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
            max_consecutive_errors: 3,
        };
        let (simulator, handle, _sends, hub) = build_simulator(vec![false; 100], options);

        let token = CancellationToken::new();
        let run = tokio::spawn(simulator.run(token.clone()));

        // The loop must terminate on its own within a bounded time
        tokio::time::timeout(Duration::from_secs(30), run)
            .await
            .expect("simulator must self-stop")
            .unwrap();

        assert!(!handle.is_running());
        let buffered = hub.buffered();
        let cap_entry = buffered
            .iter()
            .find(|e| e.event_type == EventType::Error && e.message.contains("consecutive errors"))
            .expect("self-stop log entry present");
        assert!(cap_entry.message.contains('3'));
        // Stopped event emitted after the cap entry
        assert_eq!(buffered[0].event_type, EventType::Stopped);
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop_and_emits_stopped() {
        let (simulator, handle, _sends, hub) = build_simulator(vec![], fast_options());
        let token = CancellationToken::new();
        let run = tokio::spawn(simulator.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_running());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancellation must end the loop")
            .unwrap();

        assert!(!handle.is_running());
        assert_eq!(hub.buffered()[0].event_type, EventType::Stopped);
    }

    #[tokio::test]
    async fn test_payload_carries_device_identity_and_metadata() {
        let (mut simulator, _handle, _sends, _hub) = build_simulator(vec![], fast_options());
        let payload = simulator.build_payload();
        assert_eq!(payload["t"], serde_json::json!(42));
        assert_eq!(payload["device_id"], serde_json::json!("d1"));
        assert_eq!(payload["device_name"], serde_json::json!("sensor-1"));
        assert_eq!(payload["site"], serde_json::json!("factory-a"));
    }

    #[test]
    fn test_consecutive_error_runs() {
        let mut stats = DeviceStats::default();
        for n in 1..=5 {
            stats.record_error("boom", ErrorScope::Send);
            assert_eq!(stats.consecutive_errors, n);
        }
        stats.increment_messages();
        assert_eq!(stats.consecutive_errors, 0);
        assert_eq!(stats.errors, 5);
        assert_eq!(stats.messages_sent, 1);
    }

    proptest! {
        #[test]
        fn prop_consecutive_errors_track_run_length(runs in proptest::collection::vec(1u32..6, 1..8)) {
            let mut stats = DeviceStats::default();
            for run in &runs {
                for _ in 0..*run {
                    stats.record_error("e", ErrorScope::General);
                }
                prop_assert_eq!(stats.consecutive_errors, *run);
                stats.increment_messages();
                prop_assert_eq!(stats.consecutive_errors, 0);
            }
            prop_assert_eq!(stats.errors as u32, runs.iter().sum::<u32>());
        }

        #[test]
        fn prop_backoff_formula(attempt in 0u32..12) {
            let base = Duration::from_millis(100);
            let cap = Duration::from_secs(60);
            let expected = std::cmp::min(base * 2u32.pow(attempt), cap);
            prop_assert_eq!(backoff_delay(base, attempt, cap), expected);
        }
    }
}
