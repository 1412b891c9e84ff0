//! Tools the chat model may call mid-conversation

mod knowledge;
mod nodes;
mod registry;
mod weather;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

pub use knowledge::{CollectionMetadata, KnowledgeBase};
pub use nodes::{NodeRead, NodeReader};
pub use registry::ToolRegistry;
pub use weather::Weather;

/// Arguments of a function call, already parsed from JSON
pub type ToolArgs = Map<String, Value>;

/// Result type alias for tool execution
pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Errors reported back to the model as a tool result
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// A required argument key is absent
    #[error("missing required argument: {0}")]
    MissingArgument(String),

    /// An argument is present but unusable
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// The tool itself failed
    #[error("{0}")]
    Failed(String),
}

impl From<crate::Error> for ToolError {
    fn from(e: crate::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(e: reqwest::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Machine-readable description of a tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

impl ToolDefinition {
    /// Render as a chat-completions `tools` entry
    #[must_use]
    pub fn to_function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "strict": true,
                "parameters": self.parameters,
            }
        })
    }
}

/// A named capability the model can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name the model calls this tool by
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    /// One-time setup, run at session start
    ///
    /// # Errors
    ///
    /// Returns error if the tool's backend cannot be prepared
    async fn init(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Run the tool with the model's arguments
    ///
    /// # Errors
    ///
    /// Returns a [`ToolError`] that is reported back to the model
    async fn execute(&self, args: &ToolArgs) -> ToolResult<Value>;
}

/// Fetch a required string argument
///
/// # Errors
///
/// Returns error if the key is absent or not a string
pub fn required_str<'a>(args: &'a ToolArgs, key: &str) -> ToolResult<&'a str> {
    match args.get(key) {
        None | Some(Value::Null) => Err(ToolError::MissingArgument(key.to_string())),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(ToolError::InvalidArgument {
            name: key.to_string(),
            reason: format!("expected string, got {other}"),
        }),
    }
}

/// Fetch a required non-negative integer argument
///
/// # Errors
///
/// Returns error if the key is absent or not a non-negative integer
pub fn required_u64(args: &ToolArgs, key: &str) -> ToolResult<u64> {
    match args.get(key) {
        None | Some(Value::Null) => Err(ToolError::MissingArgument(key.to_string())),
        Some(value) => value.as_u64().ok_or_else(|| ToolError::InvalidArgument {
            name: key.to_string(),
            reason: format!("expected non-negative integer, got {value}"),
        }),
    }
}

/// Render a tool result the way it is stored in the tool turn
///
/// Mappings and sequences use literal notation (`{'temperature': 21.0}`),
/// with single-quoted strings and `True`/`False`/`None`. A bare string
/// result is passed through unquoted.
#[must_use]
pub fn stringify_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => literal(other),
    }
}

/// Render a tool failure as a result payload
#[must_use]
pub fn error_payload(error: &ToolError) -> String {
    stringify_result(&json!({ "error": error.to_string() }))
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", quote(k), literal(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
