//! WebSocket target adapter with automatic reconnection
//!
//! Holds a long-lived framed connection and delivers one text frame per
//! payload. Unlike the other adapters this one manages its own resilience:
//! an embedded circuit breaker gates connection attempts, send-triggered
//! reconnects back off exponentially, and an on-demand monitor task pings
//! the socket and re-dials when the ping fails. The device simulator
//! therefore exempts WebSocket connectors from its outer retry loops.

use crate::error::{Error, Result};
use crate::model::JsonMap;
use async_trait::async_trait;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{backoff_delay, CircuitBreaker, TargetConnector};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SEND_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(60);
const BREAKER_THRESHOLD: u32 = 3;
const BREAKER_RECOVERY: Duration = Duration::from_secs(30);
/// Idle delay between monitor passes while disconnected
const MONITOR_IDLE: Duration = Duration::from_secs(5);

/// WebSocket target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketTargetConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Seconds between keep-alive pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
}

fn default_ping_interval() -> u64 {
    20
}

impl WebSocketTargetConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(Error::invalid_config(
                "url",
                "WebSocket URL must start with ws:// or wss://",
            ));
        }
        if self.ping_interval == 0 || self.ping_interval > 300 {
            return Err(Error::invalid_config(
                "ping_interval",
                "ping interval must be between 1 and 300 seconds",
            ));
        }
        for name in self.headers.keys() {
            HeaderName::try_from(name.as_str()).map_err(|_| {
                Error::invalid_config("headers", format!("invalid header name: {}", name))
            })?;
        }
        Ok(())
    }
}

/// State shared between the connector and its monitor task
struct WsShared {
    config: WebSocketTargetConfig,
    stream: tokio::sync::Mutex<Option<WsStream>>,
    connected: AtomicBool,
    breaker: std::sync::Mutex<CircuitBreaker>,
    retry_count: AtomicU32,
}

impl WsShared {
    /// Dial the endpoint once, gated by the circuit breaker
    async fn establish(&self) -> Result<()> {
        if !self.breaker.lock().unwrap().allow_call() {
            return Err(Error::CircuitOpen);
        }

        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::connection_with_source("invalid WebSocket request", e))?;
        for (name, value) in &self.config.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| Error::connection_with_source("invalid header name", e))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::connection_with_source("invalid header value", e))?;
            request.headers_mut().insert(name, value);
        }

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request)).await {
            Ok(Ok((stream, _response))) => {
                *self.stream.lock().await = Some(stream);
                self.connected.store(true, Ordering::SeqCst);
                self.retry_count.store(0, Ordering::SeqCst);
                self.breaker.lock().unwrap().record_success();
                info!("WebSocket connected to {}", self.config.url);
                Ok(())
            }
            Ok(Err(e)) => {
                self.connected.store(false, Ordering::SeqCst);
                self.breaker.lock().unwrap().record_failure();
                Err(Error::connection_with_source(
                    format!("WebSocket handshake with {} failed", self.config.url),
                    e,
                ))
            }
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                self.breaker.lock().unwrap().record_failure();
                Err(Error::Timeout {
                    timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
                })
            }
        }
    }

    /// One send attempt on the current socket
    async fn try_send(&self, frame: String) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::connection("WebSocket is not connected"))?;

        match stream.send(Message::Text(frame)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *guard = None;
                self.connected.store(false, Ordering::SeqCst);
                Err(Error::send_with_source("WebSocket send failed", e))
            }
        }
    }

    /// Single reconnect with exponential backoff, bounded by the retry cap
    async fn reconnect_with_backoff(&self) -> Result<()> {
        let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst);
        if attempt >= MAX_SEND_RETRIES {
            return Err(Error::connection(format!(
                "max reconnection attempts ({}) reached",
                MAX_SEND_RETRIES
            )));
        }

        let delay = backoff_delay(RETRY_BASE, attempt, RETRY_CAP);
        debug!(
            "WebSocket reconnect attempt {}/{} after {:?}",
            attempt + 1,
            MAX_SEND_RETRIES,
            delay
        );
        tokio::time::sleep(delay).await;
        self.establish().await
    }

    /// Keep-alive probe on the current socket
    async fn ping(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::connection("WebSocket is not connected"))?;

        match stream.send(Message::Ping(Vec::new())).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *guard = None;
                self.connected.store(false, Ordering::SeqCst);
                Err(Error::connection_with_source("WebSocket ping failed", e))
            }
        }
    }

    fn stats(&self, monitor_active: bool) -> Value {
        let breaker = self.breaker.lock().unwrap().snapshot();
        json!({
            "connected": self.connected.load(Ordering::SeqCst),
            "circuit_state": breaker.state,
            "failure_count": breaker.failure_count,
            "retry_count": self.retry_count.load(Ordering::SeqCst),
            "last_failure_at": breaker.last_failure_at,
            "auto_reconnect_active": monitor_active,
        })
    }
}

/// Connector for WebSocket endpoints
pub struct WebSocketConnector {
    shared: Arc<WsShared>,
    monitor: Option<tokio::task::JoinHandle<()>>,
    monitor_token: CancellationToken,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketTargetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(WsShared {
                config,
                stream: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                breaker: std::sync::Mutex::new(CircuitBreaker::new(
                    BREAKER_THRESHOLD,
                    BREAKER_RECOVERY,
                )),
                retry_count: AtomicU32::new(0),
            }),
            monitor: None,
            monitor_token: CancellationToken::new(),
        })
    }

    /// Start the background ping/reconnect monitor (idempotent)
    pub fn start_monitor(&mut self) {
        if self
            .monitor
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
        {
            return;
        }

        self.monitor_token = CancellationToken::new();
        let token = self.monitor_token.clone();
        let shared = self.shared.clone();

        self.monitor = Some(tokio::spawn(async move {
            let ping_interval = Duration::from_secs(shared.config.ping_interval);
            loop {
                let delay = if shared.connected.load(Ordering::SeqCst) {
                    if let Err(e) = shared.ping().await {
                        warn!("WebSocket keep-alive lost: {}", e);
                        MONITOR_IDLE
                    } else {
                        ping_interval
                    }
                } else {
                    if let Err(e) = shared.establish().await {
                        debug!("WebSocket automatic reconnection failed: {}", e);
                    }
                    MONITOR_IDLE
                };

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }));
    }

    /// Stop the background monitor
    pub fn stop_monitor(&mut self) {
        self.monitor_token.cancel();
        if let Some(handle) = self.monitor.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl TargetConnector for WebSocketConnector {
    fn kind(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.start_monitor();
        self.shared.establish().await
    }

    async fn send(&mut self, payload: &JsonMap) -> Result<()> {
        let frame = serde_json::to_string(&Value::Object(payload.clone()))?;

        // First attempt on the current connection
        match self.shared.try_send(frame.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("WebSocket send attempt failed, trying reconnect: {}", e);
            }
        }

        // One reconnect-and-retry before reporting a final failure
        self.shared.reconnect_with_backoff().await?;
        self.shared.try_send(frame).await
    }

    async fn disconnect(&mut self) {
        self.stop_monitor();

        let mut guard = self.shared.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            if let Err(e) = stream.close(None).await {
                warn!("Error closing WebSocket: {}", e);
            }
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        info!("WebSocket disconnected from {}", self.shared.config.url);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn manages_reconnection(&self) -> bool {
        true
    }

    fn connection_stats(&self) -> Option<Value> {
        let monitor_active = self
            .monitor
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        Some(self.shared.stats(monitor_active))
    }
}

impl Drop for WebSocketConnector {
    fn drop(&mut self) {
        self.monitor_token.cancel();
        if let Some(handle) = self.monitor.take() {
            handle.abort();
        }
    }
}
