//! Outbound connector layer
//!
//! One adapter per target kind, all implementing [`TargetConnector`]. A
//! device simulator owns its connector exclusively; connectors are never
//! shared across simulators. The [`factory`] resolves a target descriptor to
//! a concrete adapter and validates its configuration up front.

pub mod circuit_breaker;
pub mod factory;
pub mod ftp;
pub mod http;
pub mod kafka;
pub mod mqtt;
pub mod pubsub;
pub mod websocket;

pub use circuit_breaker::{BreakerConnector, CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use factory::{build_connector, supported_kinds, validate_target_config};

use crate::error::Result;
use crate::model::JsonMap;
use async_trait::async_trait;
use serde_json::Value;

/// Capability set realized by every target adapter
///
/// Contract:
/// - `connect` is idempotent and bounded by a kind-appropriate timeout.
/// - `send` returns `Ok(())` iff the target acknowledged the payload per its
///   protocol semantics; a failure must not leave state that prevents the
///   next call.
/// - `disconnect` is best-effort and safe on a never-connected adapter.
#[async_trait]
pub trait TargetConnector: Send + std::fmt::Debug {
    /// Stable kind name used in connector ids and log lines
    fn kind(&self) -> &'static str;

    /// Establish the kind-specific session
    async fn connect(&mut self) -> Result<()>;

    /// Deliver one payload
    async fn send(&mut self, payload: &JsonMap) -> Result<()>;

    /// Release the session
    async fn disconnect(&mut self);

    /// Whether a live session is currently held
    fn is_connected(&self) -> bool;

    /// Adapters that run their own reconnection loop (WebSocket) are
    /// exempted from the simulator's outer connect-retry logic
    fn manages_reconnection(&self) -> bool {
        false
    }

    /// Kind-specific connection statistics for status endpoints
    fn connection_stats(&self) -> Option<Value> {
        None
    }

    /// Circuit breaker state, when the adapter is wrapped in one
    fn circuit_state(&self) -> Option<CircuitBreakerSnapshot> {
        None
    }
}

/// Exponential backoff delay for the nth retry: `min(base * 2^attempt, cap)`
pub fn backoff_delay(
    base: std::time::Duration,
    attempt: u32,
    cap: std::time::Duration,
) -> std::time::Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(cap)
}

/// Clone a payload, stamping `timestamp` (ISO-8601 UTC) when absent.
///
/// HTTP and MQTT framing require the stamp; other adapters forward the
/// payload untouched.
pub(crate) fn with_timestamp(payload: &JsonMap) -> JsonMap {
    let mut out = payload.clone();
    out.entry("timestamp".to_string())
        .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));
    out
}
