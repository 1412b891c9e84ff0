//! Tool registry: name lookup, definitions, and call dispatch

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::{Tool, ToolArgs, ToolDefinition, ToolError, error_payload, stringify_result};
use crate::{Error, Result};

/// Registered tools, in registration order
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool
    ///
    /// # Errors
    ///
    /// Returns error if a tool with the same name is already registered
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(Error::Config(format!("tool registered twice: {name}")));
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions of every registered tool
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Run one-time initialization for every tool
    ///
    /// # Errors
    ///
    /// Returns the first initialization failure
    pub async fn init_all(&self) -> Result<()> {
        for tool in &self.tools {
            tool.init().await?;
            tracing::info!(tool = tool.name(), "tool initialized");
        }
        Ok(())
    }

    /// Execute a model-issued call and render the tool turn content
    ///
    /// Argument and execution failures become an error payload for the
    /// model.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownTool` if no tool has this name
    pub async fn execute(&self, name: &str, arguments: &str) -> Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        let outcome = match parse_arguments(arguments) {
            Ok(args) => tool.execute(&args).await,
            Err(e) => Err(e),
        };

        Ok(match outcome {
            Ok(result) => {
                tracing::info!(tool = name, "tool call succeeded");
                stringify_result(&result)
            }
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool call failed");
                error_payload(&e)
            }
        })
    }
}

fn parse_arguments(arguments: &str) -> std::result::Result<ToolArgs, ToolError> {
    if arguments.trim().is_empty() {
        return Ok(ToolArgs::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ToolError::InvalidArgument {
            name: "arguments".to_string(),
            reason: format!("expected an object, got {other}"),
        }),
        Err(e) => Err(ToolError::InvalidArgument {
            name: "arguments".to_string(),
            reason: e.to_string(),
        }),
    }
}
