//! Tool contracts
//!
//! The engine never talks to the outside world directly: tools are invoked
//! through the [`ToolInvoker`] capability, and everything the engine needs
//! to know about a tool ahead of time (schema, aliases, risk category,
//! version) lives in the reflected [`ToolDescriptor`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::execution::ExecutionId;

/// JSON parameter type accepted by a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    /// Whether a JSON value inhabits this type
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

/// One reflected parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Expected type
    pub param_type: ParamType,
    /// Whether the parameter must be present
    #[serde(default)]
    pub required: bool,
    /// Inclusive numeric lower bound
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound
    #[serde(default)]
    pub max: Option<f64>,
}

impl ParamSpec {
    /// Required parameter of the given type
    pub fn required(param_type: ParamType) -> Self {
        Self {
            param_type,
            required: true,
            min: None,
            max: None,
        }
    }

    /// Optional parameter of the given type
    pub fn optional(param_type: ParamType) -> Self {
        Self {
            param_type,
            required: false,
            min: None,
            max: None,
        }
    }

    /// Add an inclusive numeric range
    pub fn bounded(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }
}

/// Reflected parameter schema; ordered so fingerprints are stable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Parameter name → spec
    pub params: BTreeMap<String, ParamSpec>,
}

impl ToolSchema {
    /// Build from a list of `(name, spec)` pairs
    pub fn new(params: Vec<(&str, ParamSpec)>) -> Self {
        Self {
            params: params
                .into_iter()
                .map(|(name, spec)| (name.to_string(), spec))
                .collect(),
        }
    }

    /// Validate a parameter object against the schema
    pub fn validate(&self, tool: &str, params: &Value) -> EngineResult<()> {
        let object = params
            .as_object()
            .ok_or_else(|| EngineError::ValidationFailed(format!("{}: params not an object", tool)))?;

        for (name, spec) in &self.params {
            match object.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(EngineError::ValidationFailed(format!(
                            "{}: missing required parameter '{}'",
                            tool, name
                        )));
                    }
                }
                Some(value) => {
                    if !spec.param_type.matches(value) {
                        return Err(EngineError::ValidationFailed(format!(
                            "{}: parameter '{}' has wrong type",
                            tool, name
                        )));
                    }
                    if let Some(n) = value.as_f64() {
                        if spec.min.is_some_and(|min| n < min)
                            || spec.max.is_some_and(|max| n > max)
                        {
                            return Err(EngineError::ValidationFailed(format!(
                                "{}: parameter '{}' out of range",
                                tool, name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Side-effect category, the input to risk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// No externally visible effect
    ReadOnly,
    /// Creates or mutates a booking
    Booking,
    /// Sends an external communication
    Communication,
    /// Moves money
    Payment,
}

/// Reflected description of a registered tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Canonical tool name
    pub name: String,
    /// Tool version string
    pub version: String,
    /// Parameter schema
    pub schema: ToolSchema,
    /// LLM-friendly alias → canonical parameter name
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Side-effect category
    pub category: ToolCategory,
}

impl ToolDescriptor {
    /// Create a descriptor
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        schema: ToolSchema,
        category: ToolCategory,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            schema,
            aliases: HashMap::new(),
            category,
        }
    }

    /// Add a parameter alias
    pub fn with_alias(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), canonical.into());
        self
    }

    /// Stable fingerprint of name, version, and schema
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"@");
        hasher.update(self.version.as_bytes());
        hasher.update(b"#");
        // BTreeMap ordering makes this serialisation deterministic.
        if let Ok(schema) = serde_json::to_vec(&self.schema) {
            hasher.update(&schema);
        }
        hex::encode(hasher.finalize())
    }

    /// Rewrite aliased parameter names to canonical ones
    pub fn apply_aliases(&self, params: &Value) -> Value {
        let Some(object) = params.as_object() else {
            return params.clone();
        };
        let mut out = serde_json::Map::new();
        for (key, value) in object {
            let canonical = self.aliases.get(key).cloned().unwrap_or_else(|| key.clone());
            out.insert(canonical, value.clone());
        }
        Value::Object(out)
    }
}

/// Registry of reflected tools available to this deployment
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a descriptor
    pub fn register(&self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    /// Descriptor by tool name
    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).map(|d| d.clone())
    }

    /// Whether a tool is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Fingerprints of every registered tool
    pub fn fingerprints(&self) -> HashMap<String, String> {
        self.tools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().fingerprint()))
            .collect()
    }
}

/// A resolved tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Owning execution
    pub execution_id: ExecutionId,
    /// Step id within the plan
    pub step_id: String,
    /// Canonical tool name
    pub tool: String,
    /// Fully resolved parameters
    pub params: Value,
    /// Trace id carried for correlation
    pub trace_id: String,
}

/// Compensation declared by a tool at success time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationDirective {
    /// Compensating tool name
    pub tool: String,
    /// Pre-mapped parameters, when the tool supplies them directly
    #[serde(default)]
    pub params: Option<Value>,
}

/// Result of a tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the call succeeded
    pub success: bool,
    /// JSON output on success
    #[serde(default)]
    pub output: Option<Value>,
    /// Error message on failure
    #[serde(default)]
    pub error: Option<String>,
    /// HTTP-ish status code, when the tool surface has one
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Wall time of the call
    pub latency_ms: u64,
    /// Compensation declared by the tool
    #[serde(default)]
    pub compensation: Option<CompensationDirective>,
}

impl ToolOutcome {
    /// Successful outcome with output
    pub fn ok(output: Value, latency_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            status_code: None,
            latency_ms,
            compensation: None,
        }
    }

    /// Failed outcome with an error message
    pub fn failed(error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            status_code: None,
            latency_ms,
            compensation: None,
        }
    }
}

/// Capability that executes tools on the engine's behalf
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Execute a call under a hard deadline with cooperative cancellation
    async fn execute(
        &self,
        call: &ToolCall,
        deadline: Duration,
        cancel: CancelToken,
    ) -> EngineResult<ToolOutcome>;
}
