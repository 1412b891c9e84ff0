//! Vector database search over a Qdrant-compatible REST API
//!
//! Each searchable collection has a companion record in the `metadata`
//! collection naming the embedding model its vectors were built with. The
//! record is read once and reused for every query embedding.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::OnceCell;

use super::{Tool, ToolArgs, ToolDefinition, ToolError, ToolResult, required_str, required_u64};
use crate::config::DatabaseConfig;
use crate::{Error, Result};

const NAME: &str = "search_knowledge_base";
const METADATA_COLLECTION: &str = "metadata";
const DEFAULT_DESCRIPTION: &str =
    "Query a vector database to retrieve additional information about the lab or your subsystem.";

/// Embedding parameters recorded for a collection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectionMetadata {
    pub name: String,
    pub embedding_model: String,
    pub dimensionality: usize,
}

/// `search_knowledge_base` tool
pub struct KnowledgeBase {
    client: Client,
    db_url: String,
    collection: String,
    description: String,
    api_base: String,
    api_key: String,
    metadata: OnceCell<CollectionMetadata>,
}

impl KnowledgeBase {
    #[must_use]
    pub fn new(database: &DatabaseConfig, api_base: &str, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            db_url: database.url.trim_end_matches('/').to_string(),
            collection: database.collection.clone(),
            description: database
                .description
                .clone()
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            metadata: OnceCell::new(),
        }
    }

    /// Metadata for the configured collection, fetched on first use
    async fn metadata(&self) -> Result<&CollectionMetadata> {
        self.metadata.get_or_try_init(|| self.fetch_metadata()).await
    }

    async fn fetch_metadata(&self) -> Result<CollectionMetadata> {
        let url = format!(
            "{}/collections/{METADATA_COLLECTION}/points/scroll",
            self.db_url
        );
        let body = json!({
            "filter": { "must": [{ "key": "name", "match": { "value": self.collection } }] },
            "limit": 1,
            "with_payload": true,
            "with_vector": false,
        });

        let response: Value = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let metadata = parse_scroll_metadata(&response)?.ok_or_else(|| {
            Error::Tool(format!(
                "metadata for collection {} not found",
                self.collection
            ))
        })?;

        tracing::info!(
            collection = %metadata.name,
            model = %metadata.embedding_model,
            dimensionality = metadata.dimensionality,
            "loaded collection metadata"
        );
        Ok(metadata)
    }

    async fn embed(&self, model: &str, query: &str) -> Result<Vec<f64>> {
        let response: Value = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({ "input": query, "model": model }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_embedding(&response)
            .ok_or_else(|| Error::Tool("embedding response has no vector".to_string()))
    }

    async fn search(&self, vector: Vec<f64>, limit: u64) -> Result<Vec<Value>> {
        let url = format!("{}/collections/{}/points/search", self.db_url, self.collection);
        let response: Value = self
            .client
            .post(&url)
            .json(&json!({
                "vector": vector,
                "limit": limit,
                "with_payload": true,
                "with_vector": false,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(parse_search_payloads(&response))
    }
}

fn parse_scroll_metadata(response: &Value) -> Result<Option<CollectionMetadata>> {
    let Some(payload) = response
        .pointer("/result/points/0/payload")
        .filter(|p| !p.is_null())
    else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_value(payload.clone())?))
}

fn parse_embedding(response: &Value) -> Option<Vec<f64>> {
    response
        .pointer("/data/0/embedding")?
        .as_array()?
        .iter()
        .map(Value::as_f64)
        .collect()
}

fn parse_search_payloads(response: &Value) -> Vec<Value> {
    response
        .get("result")
        .and_then(Value::as_array)
        .map(|points| {
            points
                .iter()
                .filter_map(|p| p.get("payload").cloned())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Tool for KnowledgeBase {
    fn name(&self) -> &str {
        NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: NAME.to_string(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The question, keywords, or phrase to use for searching the database.",
                    },
                    "limit": {
                        "type": "integer",
                        "description": "The maximum number of results to return.",
                    },
                },
                "required": ["query", "limit"],
                "additionalProperties": false,
            }),
        }
    }

    async fn init(&self) -> Result<()> {
        self.metadata().await.map(|_| ())
    }

    async fn execute(&self, args: &ToolArgs) -> ToolResult<Value> {
        let query = required_str(args, "query")?;
        let limit = required_u64(args, "limit")?;
        if limit == 0 {
            return Err(ToolError::InvalidArgument {
                name: "limit".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let metadata = self.metadata().await?;
        let vector = self.embed(&metadata.embedding_model, query).await?;
        if vector.len() != metadata.dimensionality {
            tracing::warn!(
                expected = metadata.dimensionality,
                actual = vector.len(),
                "embedding dimensionality mismatch"
            );
        }

        let payloads = self.search(vector, limit).await?;
        tracing::debug!(query, hits = payloads.len(), "knowledge base search");
        Ok(Value::Array(payloads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> KnowledgeBase {
        KnowledgeBase::new(
            &DatabaseConfig {
                url: "http://127.0.0.1:9/".to_string(),
                collection: "lab".to_string(),
                description: None,
            },
            "http://127.0.0.1:9/v1",
            "sk-test",
        )
    }

    #[test]
    fn metadata_from_scroll_response() {
        let response = json!({
            "result": {
                "points": [{
                    "id": 7,
                    "payload": { "name": "lab", "embedding_model": "text-embedding-3-small", "dimensionality": 1536 }
                }],
                "next_page_offset": null
            },
            "status": "ok"
        });

        let metadata = parse_scroll_metadata(&response).unwrap().unwrap();
        assert_eq!(metadata.embedding_model, "text-embedding-3-small");
        assert_eq!(metadata.dimensionality, 1536);
    }

    #[test]
    fn empty_scroll_means_missing_metadata() {
        let response = json!({ "result": { "points": [] } });
        assert!(parse_scroll_metadata(&response).unwrap().is_none());
    }

    #[test]
    fn malformed_metadata_is_an_error() {
        let response = json!({ "result": { "points": [{ "payload": { "name": "lab" } }] } });
        assert!(parse_scroll_metadata(&response).is_err());
    }

    #[test]
    fn embedding_and_search_parsing() {
        let embedding = json!({ "data": [{ "embedding": [0.5, -0.25] }] });
        assert_eq!(parse_embedding(&embedding), Some(vec![0.5, -0.25]));

        let search = json!({
            "result": [
                { "id": 1, "score": 0.9, "payload": { "text": "Robot cell A" } },
                { "id": 2, "score": 0.7 }
            ]
        });
        assert_eq!(parse_search_payloads(&search), vec![json!({ "text": "Robot cell A" })]);
    }

    #[test]
    fn default_description_applies() {
        let definition = tool().definition();
        assert_eq!(definition.description, DEFAULT_DESCRIPTION);
        assert_eq!(definition.parameters["required"], json!(["query", "limit"]));
    }

    #[tokio::test]
    async fn argument_errors_precede_lazy_init() {
        let tool = tool();

        let no_limit = json!({ "query": "robots" }).as_object().cloned().unwrap();
        assert!(matches!(
            tool.execute(&no_limit).await,
            Err(ToolError::MissingArgument(key)) if key == "limit"
        ));

        let zero = json!({ "query": "robots", "limit": 0 }).as_object().cloned().unwrap();
        assert!(matches!(
            tool.execute(&zero).await,
            Err(ToolError::InvalidArgument { .. })
        ));
    }
}
