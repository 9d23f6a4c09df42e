//! Connector factory
//!
//! Resolves a target descriptor to a concrete adapter, validating the
//! kind-specific configuration up front. Invalid kinds and invalid configs
//! fail fast so a device with a broken target never launches.

use crate::error::{Error, Result};
use crate::model::{TargetDescriptor, TargetKind};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::ftp::{FtpConnector, FtpTargetConfig};
use super::http::{HttpConnector, HttpTargetConfig};
use super::kafka::{KafkaConnector, KafkaTargetConfig};
use super::mqtt::{MqttConnector, MqttTargetConfig};
use super::pubsub::{PubSubConnector, PubSubTargetConfig};
use super::websocket::{WebSocketConnector, WebSocketTargetConfig};
use super::{BreakerConnector, TargetConnector};

/// Kind names accepted by the factory, in wire form
pub fn supported_kinds() -> Vec<&'static str> {
    vec!["http", "mqtt", "kafka", "websocket", "ftp", "pubsub"]
}

fn parse_config<T: DeserializeOwned>(kind: TargetKind, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone()).map_err(|e| Error::Config {
        message: format!("invalid {} configuration: {}", kind, e).into(),
        source: Some(Box::new(e)),
    })
}

/// Build a connector for a target descriptor
///
/// HTTP adapters come back wrapped in the default circuit breaker; the
/// WebSocket adapter carries its own breaker internally.
pub fn build_connector(target: &TargetDescriptor) -> Result<Box<dyn TargetConnector>> {
    match target.kind {
        TargetKind::Http => {
            let config: HttpTargetConfig = parse_config(target.kind, &target.config)?;
            let connector = HttpConnector::new(config)?;
            Ok(Box::new(BreakerConnector::with_defaults(Box::new(connector))))
        }
        TargetKind::Mqtt => {
            let config: MqttTargetConfig = parse_config(target.kind, &target.config)?;
            Ok(Box::new(MqttConnector::new(config)?))
        }
        TargetKind::Kafka => {
            let config: KafkaTargetConfig = parse_config(target.kind, &target.config)?;
            Ok(Box::new(KafkaConnector::new(config)?))
        }
        TargetKind::Websocket => {
            let config: WebSocketTargetConfig = parse_config(target.kind, &target.config)?;
            Ok(Box::new(WebSocketConnector::new(config)?))
        }
        TargetKind::Ftp => {
            let config: FtpTargetConfig = parse_config(target.kind, &target.config)?;
            Ok(Box::new(FtpConnector::new(config)?))
        }
        TargetKind::Pubsub => {
            let config: PubSubTargetConfig = parse_config(target.kind, &target.config)?;
            Ok(Box::new(PubSubConnector::new(config)?))
        }
    }
}

/// Validate a raw (kind, config) pair without building an adapter.
/// Used by the connector-test endpoint and project validation.
pub fn validate_target_config(kind: &str, config: &Value) -> Result<TargetKind> {
    let kind = TargetKind::parse(kind)
        .ok_or_else(|| Error::invalid_config("kind", format!("unsupported target kind: {}", kind)))?;

    match kind {
        TargetKind::Http => parse_config::<HttpTargetConfig>(kind, config)?.validate()?,
        TargetKind::Mqtt => parse_config::<MqttTargetConfig>(kind, config)?.validate()?,
        TargetKind::Kafka => parse_config::<KafkaTargetConfig>(kind, config)?.validate()?,
        TargetKind::Websocket => parse_config::<WebSocketTargetConfig>(kind, config)?.validate()?,
        TargetKind::Ftp => parse_config::<FtpTargetConfig>(kind, config)?.validate()?,
        TargetKind::Pubsub => parse_config::<PubSubTargetConfig>(kind, config)?.validate()?,
    }

    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(kind: TargetKind, config: Value) -> TargetDescriptor {
        TargetDescriptor {
            id: "t1".to_string(),
            name: "test-target".to_string(),
            kind,
            config,
        }
    }

    #[test]
    fn test_http_target_gets_breaker() {
        let connector = build_connector(&target(
            TargetKind::Http,
            json!({"url": "http://localhost:9000/ingest", "method": "POST"}),
        ))
        .unwrap();
        assert_eq!(connector.kind(), "http");
        assert!(connector.circuit_state().is_some());
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let err = build_connector(&target(TargetKind::Http, json!({"method": "POST"})))
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_INVALID");

        let err = build_connector(&target(
            TargetKind::Mqtt,
            json!({"host": "broker", "topic": "t", "qos": 9}),
        ))
        .unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_INVALID");
    }

    #[test]
    fn test_kafka_without_breaker() {
        let connector = build_connector(&target(
            TargetKind::Kafka,
            json!({"bootstrap_servers": "localhost:9092", "topic": "t"}),
        ))
        .unwrap();
        assert_eq!(connector.kind(), "kafka");
        assert!(connector.circuit_state().is_none());
    }

    #[test]
    fn test_validate_target_config_kind_dispatch() {
        assert!(validate_target_config("http", &json!({"url": "https://x.test/a"})).is_ok());
        assert!(validate_target_config("smtp", &json!({})).is_err());
        assert!(validate_target_config(
            "kafka",
            &json!({"bootstrap_servers": "b:9092", "topic": "t",
                    "key_static": "k", "key_field": "f"})
        )
        .is_err());
    }

    #[test]
    fn test_websocket_manages_reconnection() {
        let connector = build_connector(&target(
            TargetKind::Websocket,
            json!({"url": "ws://localhost:9001/feed"}),
        ))
        .unwrap();
        assert!(connector.manages_reconnection());
    }
}
