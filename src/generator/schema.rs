//! Schema-driven payload generator
//!
//! Evaluates an ordered field list per tick. Each field produces a value
//! from its generator spec; unknown generator variants fall back to a
//! type-appropriate default. The device's metadata map is merged on top of
//! the generated fields and wins on key collision.

use crate::error::Result;
use crate::model::{FieldSpec, FieldType, GeneratorSpec, JsonMap, PayloadSchema};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

const RANDOM_STRING_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Payload generator backed by a typed field schema
pub struct SchemaGenerator {
    schema: PayloadSchema,
}

impl SchemaGenerator {
    pub fn new(schema: PayloadSchema) -> Self {
        Self { schema }
    }

    /// Generate one payload: schema fields first, metadata merged on top
    pub fn generate(&self, metadata: &JsonMap) -> Result<JsonMap> {
        let mut rng = rand::thread_rng();
        let mut payload = JsonMap::new();

        for field in &self.schema.fields {
            payload.insert(field.name.clone(), generate_field(field, &mut rng));
        }

        for (key, value) in metadata {
            payload.insert(key.clone(), value.clone());
        }

        Ok(payload)
    }
}

fn generate_field(field: &FieldSpec, rng: &mut impl Rng) -> Value {
    let spec = field.generator.as_ref();
    match field.field_type {
        FieldType::String => generate_string(spec, rng),
        FieldType::Number => generate_number(spec, rng),
        FieldType::Boolean => generate_boolean(spec, rng),
        FieldType::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
        FieldType::Timestamp => Value::String(chrono::Utc::now().to_rfc3339()),
    }
}

fn generate_string(spec: Option<&GeneratorSpec>, rng: &mut impl Rng) -> Value {
    match spec {
        Some(GeneratorSpec::Fixed { value }) => match value {
            Value::String(_) => value.clone(),
            other => Value::String(other.to_string()),
        },
        Some(GeneratorSpec::RandomChoice { choices }) if !choices.is_empty() => choices
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| Value::String("default".to_string())),
        Some(GeneratorSpec::RandomString { length }) => {
            let s: String = (0..*length)
                .map(|_| *RANDOM_STRING_CHARSET.choose(rng).unwrap_or(&b'a') as char)
                .collect();
            Value::String(s)
        }
        _ => Value::String("default".to_string()),
    }
}

fn generate_number(spec: Option<&GeneratorSpec>, rng: &mut impl Rng) -> Value {
    match spec {
        Some(GeneratorSpec::Fixed { value }) if value.is_number() => value.clone(),
        Some(GeneratorSpec::RandomInt { min, max }) => {
            let (lo, hi) = if min <= max { (*min, *max) } else { (*max, *min) };
            Value::from(rng.gen_range(lo..=hi))
        }
        Some(GeneratorSpec::RandomFloat { min, max, decimals }) => {
            let (lo, hi) = if min <= max { (*min, *max) } else { (*max, *min) };
            let raw = if lo < hi { rng.gen_range(lo..hi) } else { lo };
            Value::from(round_to(raw, *decimals))
        }
        _ => Value::from(0),
    }
}

fn generate_boolean(spec: Option<&GeneratorSpec>, rng: &mut impl Rng) -> Value {
    match spec {
        Some(GeneratorSpec::Fixed { value }) if value.is_boolean() => value.clone(),
        Some(GeneratorSpec::Random) => Value::Bool(rng.gen_bool(0.5)),
        _ => Value::Bool(true),
    }
}

/// Round to a fixed number of decimal places
pub(crate) fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals.min(12) as i32);
    (value * factor).round() / factor
}
