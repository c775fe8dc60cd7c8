use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub mod builtins;
pub mod plugins;

pub use builtins::{ReaderTool, ShellTool};
pub use plugins::{PluginManifest, PluginTool, discover_plugins};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no tool named `{0}` is registered")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tool timed out after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Execution(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Stable slug used in error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Timeout(_) => "timeout",
            Self::Execution(_) => "execution_failed",
            Self::Io(_) => "io_error",
        }
    }
}

// ── Tool trait and registry ──────────────────────────────────────────────────

/// JSON-friendly type hint for a tool parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn json_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub param_type: ParamType,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            param_type: ParamType::String,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            param_type: ParamType::String,
        }
    }

    pub fn of_type(mut self, param_type: ParamType) -> Self {
        self.param_type = param_type;
        self
    }
}

/// Static metadata about a tool, used by the model to decide which tool to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub params: Vec<ToolParam>,
}

impl ToolSpec {
    /// OpenAI-compatible `tools` array element:
    ///
    /// ```json
    /// {
    ///   "type": "function",
    ///   "function": {
    ///     "name": "shell",
    ///     "description": "...",
    ///     "parameters": { "type": "object", "properties": { ... }, "required": [...] }
    ///   }
    /// }
    /// ```
    ///
    /// Accepted as-is by Ollama's `/api/chat`.
    pub fn to_openai_tool_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required: Vec<String> = Vec::new();

        for p in &self.params {
            properties.insert(
                p.name.clone(),
                serde_json::json!({
                    "type": p.param_type.json_type(),
                    "description": p.description,
                }),
            );
            if p.required {
                required.push(p.name.clone());
            }
        }

        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }
}

/// Capability: JSON arguments in, JSON result or error out.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn invoke(&self, args: &Value) -> Result<Value, ToolError>;
}

/// Name → capability map.  Built once at startup, read-only afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<(String, Box<dyn Tool>)>,
}

impl ToolRegistry {
    /// Register under the tool's own spec name.  A later registration with
    /// the same name replaces the earlier one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.spec().name;
        self.register_as(name, tool);
    }

    pub fn register_as(&mut self, name: impl Into<String>, tool: Box<dyn Tool>) {
        let name = name.into();
        if let Some(slot) = self.tools.iter_mut().find(|(existing, _)| *existing == name) {
            warn!(tool = %name, "tool registered twice; replacing earlier entry");
            slot.1 = tool;
            return;
        }
        debug!(tool = %name, "tool registered");
        self.tools.push((name, tool));
    }

    pub fn resolve(&self, name: &str) -> Result<&dyn Tool, ToolError> {
        self.tools
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, tool)| tool.as_ref())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub async fn invoke(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        self.resolve(name)?.invoke(args).await
    }

    /// Keep only the named tools.  An empty list keeps everything.
    pub fn retain_enabled(&mut self, enabled: &[String]) {
        if enabled.is_empty() {
            return;
        }
        for name in enabled {
            if !self.tools.iter().any(|(existing, _)| existing == name) {
                warn!(tool = %name, "enabled tool is not registered; skipping");
            }
        }
        self.tools.retain(|(name, _)| enabled.contains(name));
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|(name, tool)| {
                let mut spec = tool.spec();
                spec.name = name.clone();
                spec
            })
            .collect()
    }

    /// The `tools` JSON array for a model request, or `None` when empty.
    pub fn to_openai_tools(&self) -> Option<Value> {
        if self.tools.is_empty() {
            return None;
        }
        Some(Value::Array(
            self.list_specs()
                .iter()
                .map(ToolSpec::to_openai_tool_schema)
                .collect(),
        ))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ── Argument helpers ─────────────────────────────────────────────────────────

pub fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required string `{key}`")))
}

/// Accepts numbers and numeric strings; models emit both.
pub fn optional_u64(args: &Value, key: &str) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ToolError::InvalidArguments(format!("`{key}` must be a non-negative integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ToolError::InvalidArguments(format!("`{key}` must be a non-negative integer"))),
        Some(_) => Err(ToolError::InvalidArguments(format!(
            "`{key}` must be a non-negative integer"
        ))),
    }
}

/// Largest byte offset ≤ `max` on a UTF-8 char boundary.
pub fn truncate_byte_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

// ── ToolRegistry tests ───────────────────────────────────────────────────────
