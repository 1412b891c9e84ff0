//! Industrial automation node reads grouped by category

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::{Value, json};

use super::{Tool, ToolArgs, ToolDefinition, ToolError, ToolResult, required_str};
use crate::Result;
use crate::config::NodeCategory;

const NAME: &str = "get_opcua_nodes";

/// Reads the current value of one automation node
#[async_trait]
pub trait NodeReader: Send + Sync {
    /// Open the connection to the node server
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Returns error if the node cannot be read
    async fn read(&self, node_id: &str) -> Result<Value>;
}

/// `get_opcua_nodes` tool
pub struct NodeRead {
    reader: Arc<dyn NodeReader>,
    categories: BTreeMap<String, NodeCategory>,
}

impl NodeRead {
    #[must_use]
    pub fn new(reader: Arc<dyn NodeReader>, categories: Vec<NodeCategory>) -> Self {
        Self {
            reader,
            categories: categories
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }

    fn category_description(&self) -> String {
        let mut lines =
            vec!["The category of information to gather from the lab's OPC UA server\n".to_string()];
        lines.extend(
            self.categories
                .values()
                .map(|c| format!("{} : {}", c.name, c.description)),
        );
        lines.join("\n")
    }
}

#[async_trait]
impl Tool for NodeRead {
    fn name(&self) -> &str {
        NAME
    }

    fn definition(&self) -> ToolDefinition {
        let names: Vec<&str> = self.categories.keys().map(String::as_str).collect();
        ToolDefinition {
            name: NAME.to_string(),
            description: "Gather the current state of OPC UA nodes from the lab's OPC UA server."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "category": {
                        "type": "string",
                        "enum": names,
                        "description": self.category_description(),
                    },
                },
                "required": ["category"],
                "additionalProperties": false,
            }),
        }
    }

    async fn init(&self) -> Result<()> {
        self.reader.connect().await
    }

    async fn execute(&self, args: &ToolArgs) -> ToolResult<Value> {
        let name = required_str(args, "category")?;
        let category = self
            .categories
            .get(name)
            .ok_or_else(|| ToolError::InvalidArgument {
                name: "category".to_string(),
                reason: format!("unknown category '{name}'"),
            })?;

        let values = try_join_all(
            category
                .nodes
                .iter()
                .map(|node| self.reader.read(&node.node_id)),
        )
        .await?;

        let results: Vec<Value> = category
            .nodes
            .iter()
            .zip(values)
            .map(|(node, value)| {
                json!({
                    "node_id": node.node_id,
                    "alias": node.alias,
                    "current_value": value,
                })
            })
            .collect();

        tracing::debug!(category = name, nodes = results.len(), "read node category");
        Ok(json!({ "results": results }))
    }
}
