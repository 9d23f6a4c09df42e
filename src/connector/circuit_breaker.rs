//! Circuit breaker for target connectors
//!
//! A small state machine that short-circuits sends after repeated failures
//! so a struggling downstream gets room to recover. Opt-in per connector
//! kind: the factory wraps HTTP adapters in [`BreakerConnector`]; the
//! WebSocket adapter embeds its own breaker.

use crate::error::{Error, Result};
use crate::model::JsonMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

use super::TargetConnector;

/// Default consecutive failures before the circuit opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default cooldown before a half-open probe is allowed
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast, calls short-circuit
    Open,
    /// Probing whether the downstream recovered
    HalfOpen,
}

/// Observable breaker state for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// CLOSED → OPEN → HALF_OPEN state machine
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    failure_count: u32,
    state: CircuitState,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            failure_count: 0,
            state: CircuitState::Closed,
            last_failure: None,
            last_failure_at: None,
        }
    }

    /// Gate a call. In OPEN state this returns `false` until the recovery
    /// timeout has elapsed since the last failure, at which point the
    /// breaker moves to HALF_OPEN and admits a single probe.
    pub fn allow_call(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = self
                    .last_failure
                    .map(|t| t.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: close the circuit and clear the count
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    /// Record a failed call, opening the circuit at the threshold.
    /// A failed HALF_OPEN probe reopens immediately.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());

        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            self.state = CircuitState::Open;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Manually reset to CLOSED
    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
        self.last_failure = None;
        self.last_failure_at = None;
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs(),
            last_failure_at: self.last_failure_at,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }
}

// ============================================================================
// Breaker wrapper connector
// ============================================================================

/// Wraps any connector with circuit breaker protection on `send`
pub struct BreakerConnector {
    inner: Box<dyn TargetConnector>,
    breaker: CircuitBreaker,
}

impl BreakerConnector {
    pub fn new(inner: Box<dyn TargetConnector>, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    pub fn with_defaults(inner: Box<dyn TargetConnector>) -> Self {
        Self::new(inner, CircuitBreaker::default())
    }
}

#[async_trait]
impl TargetConnector for BreakerConnector {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn connect(&mut self) -> Result<()> {
        self.inner.connect().await
    }

    async fn send(&mut self, payload: &JsonMap) -> Result<()> {
        if !self.breaker.allow_call() {
            return Err(Error::CircuitOpen);
        }

        match self.inner.send(payload).await {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn manages_reconnection(&self) -> bool {
        self.inner.manages_reconnection()
    }

    fn connection_stats(&self) -> Option<serde_json::Value> {
        self.inner.connection_stats()
    }

    fn circuit_state(&self) -> Option<CircuitBreakerSnapshot> {
        Some(self.breaker.snapshot())
    }
}
