//! Sandboxed script payload generator
//!
//! Runs user-supplied rhai code inside a locked-down interpreter. The
//! sandbox holds no module resolver (imports cannot resolve), caps
//! operations and data sizes, and exposes only a small allow-list of
//! registered helpers for time, randomness, UUIDs and rounding. Scripts are
//! compiled once at construction and the parsed syntax tree is walked
//! before any execution: module imports and calls to denylisted functions
//! fail construction, so a forbidden script never reaches a device.
//!
//! Per call the script runs with a fresh scope containing a read-only
//! `device_metadata` map and a `result` output binding; whatever the script
//! left in `result` becomes the payload. A runtime failure produces an
//! `{"error": ...}` payload instead of crashing the tick.

use crate::error::{Error, Result};
use crate::model::JsonMap;
use once_cell::sync::Lazy;
use rand::Rng;
use rhai::{ASTNode, Dynamic, Engine, Expr, Scope, Stmt, AST};
use serde_json::Value;

use super::schema::round_to;

/// One locked-down interpreter shared by every script generator; all
/// per-call state lives in the scope
static SANDBOX: Lazy<Engine> = Lazy::new(build_sandbox);

/// Function names user code may not call, checked against the parsed
/// syntax tree before execution
const DENIED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "open",
    "file",
    "spawn",
    "system",
    "command",
    "__import__",
];

const MAX_OPERATIONS: u64 = 200_000;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_STRING_SIZE: usize = 64 * 1024;
const MAX_COLLECTION_SIZE: usize = 4096;

/// Payload generator that executes sandboxed user code
#[derive(Debug)]
pub struct ScriptGenerator {
    ast: AST,
}

impl ScriptGenerator {
    /// Compile the script and screen its syntax tree. Rejection here
    /// surfaces as `ConfigInvalid`, so a device with a broken script is
    /// never launched.
    pub fn new(source: &str) -> Result<Self> {
        let ast = SANDBOX.compile(source).map_err(|e| {
            Error::invalid_config("script", format!("script failed to compile: {}", e))
        })?;
        screen_ast(&ast)?;
        Ok(Self { ast })
    }

    /// Run the script once against the device metadata
    pub fn generate(&self, metadata: &JsonMap) -> Result<JsonMap> {
        let metadata_dynamic = rhai::serde::to_dynamic(metadata)
            .map_err(|e| Error::payload(format!("metadata conversion failed: {}", e)))?;

        let mut scope = Scope::new();
        scope.push_constant("device_metadata", metadata_dynamic);
        scope.push("result", rhai::Map::new());

        if let Err(e) = SANDBOX.run_ast_with_scope(&mut scope, &self.ast) {
            let mut out = JsonMap::new();
            out.insert("error".to_string(), Value::String(e.to_string()));
            return Ok(out);
        }

        let result = scope
            .get_value::<Dynamic>("result")
            .unwrap_or(Dynamic::UNIT);
        let value: Value = rhai::serde::from_dynamic(&result)
            .map_err(|e| Error::payload(format!("script result conversion failed: {}", e)))?;

        match value {
            Value::Object(map) => Ok(map),
            other => Err(Error::payload(format!(
                "script result must be an object, got {}",
                type_name(&other)
            ))),
        }
    }
}

/// Static sweep over the parsed syntax tree. Module imports and calls to
/// denylisted functions fail construction before any execution happens;
/// rhai exposes no host attribute surface, so a forbidden capability would
/// have to arrive as one of these two node shapes.
fn screen_ast(ast: &AST) -> Result<()> {
    let mut violation: Option<String> = None;

    ast.walk(&mut |path| {
        let Some(node) = path.last() else {
            return true;
        };
        match node {
            ASTNode::Stmt(Stmt::Import(..)) => {
                violation = Some("import statements are not allowed".to_string());
                false
            }
            ASTNode::Stmt(Stmt::Export(..)) => {
                violation = Some("export statements are not allowed".to_string());
                false
            }
            ASTNode::Expr(Expr::FnCall(call, _))
                if DENIED_CALLS.contains(&call.name.as_str()) =>
            {
                violation = Some(format!("call to forbidden function: {}", call.name));
                false
            }
            _ => true,
        }
    });

    match violation {
        Some(message) => Err(Error::invalid_config("script", message)),
        None => Ok(()),
    }
}

/// Build the restricted interpreter shared by all calls
fn build_sandbox() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
    engine.set_max_string_size(MAX_STRING_SIZE);
    engine.set_max_array_size(MAX_COLLECTION_SIZE);
    engine.set_max_map_size(MAX_COLLECTION_SIZE);
    // No modules may load and no script functions may be defined, so the
    // AST screen only has to cover top-level statements
    engine.set_max_modules(0);
    engine.set_max_functions(0);
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.disable_symbol("eval");

    // Allow-listed helpers
    engine.register_fn("now_iso", || chrono::Utc::now().to_rfc3339());
    engine.register_fn("now_millis", || chrono::Utc::now().timestamp_millis());
    engine.register_fn("uuid_v4", || uuid::Uuid::new_v4().to_string());
    engine.register_fn("rand_bool", || rand::random::<bool>());
    engine.register_fn("rand_int", |min: i64, max: i64| {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        rand::thread_rng().gen_range(lo..=hi)
    });
    engine.register_fn("rand_float", |min: f64, max: f64| {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        if lo < hi {
            rand::thread_rng().gen_range(lo..hi)
        } else {
            lo
        }
    });
    engine.register_fn("rand_choice", |values: rhai::Array| -> Dynamic {
        if values.is_empty() {
            Dynamic::UNIT
        } else {
            let index = rand::thread_rng().gen_range(0..values.len());
            values[index].clone()
        }
    });
    engine.register_fn("round_to", |value: f64, decimals: i64| {
        round_to(value, decimals.clamp(0, 12) as u32)
    });

    engine
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
