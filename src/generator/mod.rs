//! Payload generation pipeline
//!
//! Two generator kinds share one contract: device metadata in, JSON object
//! out. Schema generators evaluate a typed field list; script generators run
//! sandboxed user code. Both are side-effect free with respect to runtime
//! state and perform no I/O.

pub mod schema;
pub mod script;

pub use schema::SchemaGenerator;
pub use script::ScriptGenerator;

use crate::error::{Error, Result};
use crate::model::{JsonMap, PayloadDescriptor, PayloadKind};

/// A payload generator bound to one device
#[derive(Debug)]
pub enum PayloadGenerator {
    Schema(SchemaGenerator),
    Script(ScriptGenerator),
}

impl PayloadGenerator {
    /// Produce one payload from the device's metadata
    pub fn generate(&mut self, metadata: &JsonMap) -> Result<JsonMap> {
        match self {
            PayloadGenerator::Schema(generator) => generator.generate(metadata),
            PayloadGenerator::Script(generator) => generator.generate(metadata),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PayloadGenerator::Schema(_) => "schema",
            PayloadGenerator::Script(_) => "script",
        }
    }
}

/// Build a generator from a payload descriptor, enforcing kind/config pairing
pub fn build_generator(descriptor: &PayloadDescriptor) -> Result<PayloadGenerator> {
    match descriptor.kind {
        PayloadKind::Schema => {
            let schema = descriptor.schema.clone().ok_or_else(|| {
                Error::invalid_config("schema", "schema payload is missing its field list")
            })?;
            Ok(PayloadGenerator::Schema(SchemaGenerator::new(schema)))
        }
        PayloadKind::Script => {
            let source = descriptor.script.as_deref().ok_or_else(|| {
                Error::invalid_config("script", "script payload is missing its source")
            })?;
            Ok(PayloadGenerator::Script(ScriptGenerator::new(source)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PayloadSchema;

    fn descriptor(kind: PayloadKind) -> PayloadDescriptor {
        PayloadDescriptor {
            id: "pl1".to_string(),
            name: "telemetry".to_string(),
            kind,
            schema: None,
            script: None,
        }
    }

    #[test]
    fn test_schema_kind_requires_schema() {
        let err = build_generator(&descriptor(PayloadKind::Schema)).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_INVALID");

        let mut ok = descriptor(PayloadKind::Schema);
        ok.schema = Some(PayloadSchema { fields: vec![] });
        assert!(build_generator(&ok).is_ok());
    }

    #[test]
    fn test_script_kind_requires_source() {
        let err = build_generator(&descriptor(PayloadKind::Script)).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_INVALID");

        let mut ok = descriptor(PayloadKind::Script);
        ok.script = Some("result = #{seq: 1};".to_string());
        assert!(build_generator(&ok).is_ok());
    }
}
