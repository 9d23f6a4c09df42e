//! Descriptor snapshots consumed by the simulation runtime
//!
//! These are the immutable views of projects, devices, payload templates and
//! target systems that the engine loads when a project starts. They are
//! created and maintained outside the runtime; the runtime never writes them
//! back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object type used for payloads and device metadata
pub type JsonMap = Map<String, Value>;

// ============================================================================
// Projects and devices
// ============================================================================

/// A logical grouping of virtual devices started and stopped together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A simulated emitter with a fixed cadence, payload template and target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub project_id: String,
    /// Free-form metadata merged into every outbound payload
    #[serde(default)]
    pub metadata: JsonMap,
    /// Payload template reference; a device without one is skipped at start
    #[serde(default)]
    pub payload_ref: Option<String>,
    /// Target system reference; a device without one is skipped at start
    #[serde(default)]
    pub target_ref: Option<String>,
    /// Seconds between ticks (1..=3600)
    #[serde(default = "default_send_interval")]
    pub send_interval_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_send_interval() -> u64 {
    10
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Payload templates
// ============================================================================

/// How a payload template produces values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Typed field list evaluated per tick
    Schema,
    /// Sandboxed user script evaluated per tick
    Script,
}

/// A payload template bound to one or more devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub id: String,
    pub name: String,
    pub kind: PayloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<PayloadSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

/// Ordered field list for schema-driven payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// A single schema field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<GeneratorSpec>,
}

/// Value type produced by a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Uuid,
    Timestamp,
}

/// Value generator variant for a schema field
///
/// Unknown variants deserialize to [`GeneratorSpec::Unknown`] and fall back
/// to a type-appropriate default at generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeneratorSpec {
    Fixed {
        value: Value,
    },
    RandomInt {
        #[serde(default)]
        min: i64,
        #[serde(default = "default_int_max")]
        max: i64,
    },
    RandomFloat {
        #[serde(default)]
        min: f64,
        #[serde(default = "default_float_max")]
        max: f64,
        #[serde(default = "default_decimals")]
        decimals: u32,
    },
    RandomChoice {
        #[serde(default)]
        choices: Vec<Value>,
    },
    RandomString {
        #[serde(default = "default_string_length")]
        length: usize,
    },
    Random,
    #[serde(other)]
    Unknown,
}

fn default_int_max() -> i64 {
    100
}

fn default_float_max() -> f64 {
    100.0
}

fn default_decimals() -> u32 {
    2
}

fn default_string_length() -> usize {
    10
}

// ============================================================================
// Target systems
// ============================================================================

/// Supported outbound target kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Http,
    Mqtt,
    Kafka,
    Websocket,
    Ftp,
    Pubsub,
}

impl TargetKind {
    /// Stable name used in connector ids and log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Http => "http",
            TargetKind::Mqtt => "mqtt",
            TargetKind::Kafka => "kafka",
            TargetKind::Websocket => "websocket",
            TargetKind::Ftp => "ftp",
            TargetKind::Pubsub => "pubsub",
        }
    }

    /// Parse a kind from its wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(TargetKind::Http),
            "mqtt" => Some(TargetKind::Mqtt),
            "kafka" => Some(TargetKind::Kafka),
            "websocket" => Some(TargetKind::Websocket),
            "ftp" => Some(TargetKind::Ftp),
            "pubsub" => Some(TargetKind::Pubsub),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A target system a device delivers payloads to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub id: String,
    pub name: String,
    pub kind: TargetKind,
    /// Kind-specific configuration, validated by the connector factory
    pub config: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_defaults() {
        let device: DeviceDescriptor = serde_json::from_value(json!({
            "id": "d1",
            "name": "sensor-1",
            "project_id": "p1"
        }))
        .unwrap();

        assert!(device.enabled);
        assert_eq!(device.send_interval_secs, 10);
        assert!(device.payload_ref.is_none());
        assert!(device.target_ref.is_none());
    }

    #[test]
    fn test_unknown_generator_variant() {
        let spec: FieldSpec = serde_json::from_value(json!({
            "name": "t",
            "type": "number",
            "generator": {"type": "gaussian", "mean": 5}
        }))
        .unwrap();

        assert!(matches!(spec.generator, Some(GeneratorSpec::Unknown)));
    }

    #[test]
    fn test_target_kind_roundtrip() {
        for kind in [
            TargetKind::Http,
            TargetKind::Mqtt,
            TargetKind::Kafka,
            TargetKind::Websocket,
            TargetKind::Ftp,
            TargetKind::Pubsub,
        ] {
            assert_eq!(TargetKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TargetKind::parse("smtp"), None);
    }

    #[test]
    fn test_generator_spec_parsing() {
        let spec: GeneratorSpec = serde_json::from_value(json!({
            "type": "random_float",
            "min": 18.0,
            "max": 25.0,
            "decimals": 1
        }))
        .unwrap();

        match spec {
            GeneratorSpec::RandomFloat { min, max, decimals } => {
                assert_eq!(min, 18.0);
                assert_eq!(max, 25.0);
                assert_eq!(decimals, 1);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
