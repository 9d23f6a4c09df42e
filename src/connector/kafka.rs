//! Kafka target adapter
//!
//! Wraps an rdkafka `FutureProducer`. Connecting validates the bootstrap
//! list with a bounded metadata fetch; each send is a send-and-wait with a
//! delivery timeout. Records carry an optional message key (static value or
//! a field read from the payload — exactly one) and an optional fixed
//! partition.

use crate::error::{Error, Result};
use crate::model::JsonMap;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::TargetConnector;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

const SECURITY_PROTOCOLS: &[&str] = &["PLAINTEXT", "SSL", "SASL_PLAINTEXT", "SASL_SSL"];

/// Kafka target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaTargetConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    #[serde(default)]
    pub sasl_mechanism: Option<String>,
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
    /// Fixed partition; absent lets the partitioner decide
    #[serde(default)]
    pub partition: Option<i32>,
    /// Static message key; mutually exclusive with `key_field`
    #[serde(default)]
    pub key_static: Option<String>,
    /// Payload field whose value becomes the message key
    #[serde(default)]
    pub key_field: Option<String>,
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

impl KafkaTargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(Error::invalid_config(
                "bootstrap_servers",
                "bootstrap server list cannot be empty",
            ));
        }
        if self.topic.is_empty() {
            return Err(Error::invalid_config("topic", "topic cannot be empty"));
        }
        if self.key_static.is_some() && self.key_field.is_some() {
            return Err(Error::invalid_config(
                "key_static",
                "key_static and key_field are mutually exclusive",
            ));
        }
        let protocol = self.security_protocol.to_ascii_uppercase();
        if !SECURITY_PROTOCOLS.contains(&protocol.as_str()) {
            return Err(Error::invalid_config(
                "security_protocol",
                format!("unsupported security protocol: {}", self.security_protocol),
            ));
        }
        Ok(())
    }
}

/// Connector for Apache Kafka
pub struct KafkaConnector {
    config: KafkaTargetConfig,
    producer: Option<FutureProducer>,
}

impl KafkaConnector {
    pub fn new(config: KafkaTargetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            producer: None,
        })
    }

    fn build_producer(&self) -> Result<FutureProducer> {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("client.id", "fleetsim-engine")
            // Bound how long a produce call can sit in the local queue
            .set(
                "message.timeout.ms",
                DELIVERY_TIMEOUT.as_millis().to_string(),
            )
            .set("request.timeout.ms", "10000")
            .set("socket.timeout.ms", "10000")
            .set("retries", "2")
            .set("retry.backoff.ms", "100");

        let protocol = self.config.security_protocol.to_ascii_uppercase();
        if protocol != "PLAINTEXT" {
            cfg.set("security.protocol", &protocol);
            if let Some(mechanism) = &self.config.sasl_mechanism {
                cfg.set("sasl.mechanism", mechanism);
                if let Some(username) = &self.config.sasl_username {
                    cfg.set("sasl.username", username);
                }
                if let Some(password) = &self.config.sasl_password {
                    cfg.set("sasl.password", password);
                }
            }
        }

        cfg.create().map_err(|e| Error::ConnectionFailed {
            message: format!("failed to create Kafka producer: {}", e).into(),
            source: Some(Box::new(e)),
        })
    }

    /// Resolve the message key per the exactly-one rule: static value if
    /// configured, else the stringified payload field, else no key.
    fn message_key(&self, payload: &JsonMap) -> Option<String> {
        if let Some(key) = &self.config.key_static {
            return Some(key.clone());
        }

        if let Some(field) = &self.config.key_field {
            return match payload.get(field) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
                None => {
                    warn!("Key field '{}' not found in payload, sending without key", field);
                    None
                }
            };
        }

        None
    }
}

#[async_trait]
impl TargetConnector for KafkaConnector {
    fn kind(&self) -> &'static str {
        "kafka"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.producer.is_some() {
            return Ok(());
        }

        let producer = self.build_producer()?;

        // Validate the bootstrap list with a bounded metadata fetch;
        // fetch_metadata blocks, so keep it off the async workers
        let probe = producer.clone();
        let topic = self.config.topic.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(Some(&topic), BOOTSTRAP_TIMEOUT)
        })
        .await
        .map_err(|e| Error::internal(e))?;

        metadata.map_err(|e| Error::ConnectionFailed {
            message: format!("Kafka bootstrap failed: {}", e).into(),
            source: Some(Box::new(e)),
        })?;

        debug!(
            "Kafka producer ready for {} (topic {})",
            self.config.bootstrap_servers, self.config.topic
        );
        self.producer = Some(producer);
        Ok(())
    }

    async fn send(&mut self, payload: &JsonMap) -> Result<()> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| Error::connection("Kafka producer is not connected"))?;

        let bytes = serde_json::to_vec(&Value::Object(payload.clone()))?;
        let key = self.message_key(payload);

        let mut record: FutureRecord<'_, String, Vec<u8>> =
            FutureRecord::to(&self.config.topic).payload(&bytes);
        if let Some(key) = key.as_ref() {
            record = record.key(key);
        }
        if let Some(partition) = self.config.partition {
            record = record.partition(partition);
        }

        match producer.send(record, Timeout::After(DELIVERY_TIMEOUT)).await {
            Ok((partition, offset)) => {
                debug!(
                    "Kafka record delivered to partition {} at offset {}",
                    partition, offset
                );
                Ok(())
            }
            Err((err, _)) => Err(Error::SendFailed {
                message: format!("Kafka delivery failed: {}", err).into(),
                source: Some(Box::new(err)),
            }),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(producer) = self.producer.take() {
            // Flush pending deliveries off the async workers
            let _ = tokio::task::spawn_blocking(move || {
                producer.flush(Timeout::After(Duration::from_secs(5)))
            })
            .await;
        }
    }

    fn is_connected(&self) -> bool {
        self.producer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> KafkaTargetConfig {
        KafkaTargetConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            topic: "telemetry".to_string(),
            security_protocol: "PLAINTEXT".to_string(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            partition: None,
            key_static: None,
            key_field: None,
        }
    }

    #[test]
    fn test_key_exclusivity_rejected_at_construction() {
        let mut cfg = config();
        cfg.key_static = Some("fixed".to_string());
        cfg.key_field = Some("device_id".to_string());
        let err = KafkaConnector::new(cfg).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_INVALID");
    }

    #[test]
    fn test_key_selection_order() {
        let mut payload = JsonMap::new();
        payload.insert("device_id".into(), json!("dev-7"));
        payload.insert("seq".into(), json!(12));

        let mut cfg = config();
        cfg.key_static = Some("fixed".to_string());
        let connector = KafkaConnector::new(cfg).unwrap();
        assert_eq!(connector.message_key(&payload), Some("fixed".to_string()));

        let mut cfg = config();
        cfg.key_field = Some("device_id".to_string());
        let connector = KafkaConnector::new(cfg).unwrap();
        assert_eq!(connector.message_key(&payload), Some("dev-7".to_string()));

        // Non-string field values are stringified
        let mut cfg = config();
        cfg.key_field = Some("seq".to_string());
        let connector = KafkaConnector::new(cfg).unwrap();
        assert_eq!(connector.message_key(&payload), Some("12".to_string()));

        // Neither configured: no key
        let connector = KafkaConnector::new(config()).unwrap();
        assert_eq!(connector.message_key(&payload), None);
    }

    #[test]
    fn test_missing_key_field_sends_without_key() {
        let payload = JsonMap::new();
        let mut cfg = config();
        cfg.key_field = Some("absent".to_string());
        let connector = KafkaConnector::new(cfg).unwrap();
        assert_eq!(connector.message_key(&payload), None);
    }

    #[test]
    fn test_validate_security_protocol() {
        let mut cfg = config();
        cfg.security_protocol = "KERBEROS".to_string();
        assert!(cfg.validate().is_err());
        cfg.security_protocol = "sasl_ssl".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[tokio::test]
    async fn test_send_without_connect_fails() {
        let mut connector = KafkaConnector::new(config()).unwrap();
        let err = connector.send(&JsonMap::new()).await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
