//! Chat completion client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolDefinition;
use crate::{Error, Result};

/// A function call requested by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments object, as sent by the model
    pub arguments: String,
}

/// How a completion ended
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The model answered with text
    Direct(String),
    /// The model asked for function calls; `message` is the raw assistant
    /// message to replay
    ToolCalls { message: Value, calls: Vec<ToolCall> },
    /// Any other finish reason (length, content filter, ...)
    Unhandled { finish_reason: String },
}

impl Completion {
    /// Classify a response choice by its finish reason
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidModelMessage` if a `tool_calls` finish carries
    /// no calls or a call missing its id or function name
    pub fn from_choice(finish_reason: Option<&str>, message: Value) -> Result<Self> {
        let completion = match finish_reason {
            Some("stop") => Self::Direct(
                message
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            Some("tool_calls") => {
                let calls = parse_tool_calls(&message)?;
                Self::ToolCalls { message, calls }
            }
            other => Self::Unhandled {
                finish_reason: other.unwrap_or("none").to_string(),
            },
        };
        Ok(completion)
    }
}

fn parse_tool_calls(message: &Value) -> Result<Vec<ToolCall>> {
    let calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .filter(|calls| !calls.is_empty())
        .ok_or_else(|| {
            Error::InvalidModelMessage("tool_calls finish without any calls".to_string())
        })?;

    calls.iter().enumerate().map(parse_tool_call).collect()
}

fn parse_tool_call((index, call): (usize, &Value)) -> Result<ToolCall> {
    let malformed =
        |what: &str| Error::InvalidModelMessage(format!("tool call {index} has no {what}"));

    let id = call
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("id"))?;
    let function = call.get("function").ok_or_else(|| malformed("function"))?;
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("function name"))?;

    Ok(ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: function
            .get("arguments")
            .and_then(Value::as_str)
            .unwrap_or("{}")
            .to_string(),
    })
}

/// Chat-completion capability
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete over `messages`, offering `tools` to the model
    ///
    /// An empty `tools` slice sends the request without tool definitions.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the response is malformed
    async fn complete(&self, messages: &[Value], tools: &[ToolDefinition]) -> Result<Completion>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Value,
    finish_reason: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client
pub struct OpenAiChat {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    #[must_use]
    pub fn new(api_base: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, messages: &[Value], tools: &[ToolDefinition]) -> Result<Completion> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            tools: (!tools.is_empty())
                .then(|| tools.iter().map(ToolDefinition::to_function_schema).collect()),
        };

        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "requesting chat completion"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Chat(format!("chat API error {status}: {body}")));
        }

        let result: ChatCompletionResponse = response.json().await?;
        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Chat("response has no choices".to_string()))?;

        tracing::debug!(finish_reason = ?choice.finish_reason, "chat completion received");
        Completion::from_choice(choice.finish_reason.as_deref(), choice.message)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stop_is_direct_answer() {
        let completion =
            Completion::from_choice(Some("stop"), json!({ "role": "assistant", "content": "Hi." }))
                .unwrap();
        assert_eq!(completion, Completion::Direct("Hi.".to_string()));
    }

    #[test]
    fn tool_calls_keep_raw_message() {
        let message = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "c1",
                "type": "function",
                "function": { "name": "get_weather", "arguments": "{\"city\":\"Paris\",\"country\":\"FR\"}" }
            }]
        });

        let Completion::ToolCalls { message: raw, calls } =
            Completion::from_choice(Some("tool_calls"), message.clone()).unwrap()
        else {
            panic!("expected tool calls");
        };
        assert_eq!(raw, message);
        assert_eq!(
            calls,
            vec![ToolCall {
                id: "c1".to_string(),
                name: "get_weather".to_string(),
                arguments: "{\"city\":\"Paris\",\"country\":\"FR\"}".to_string(),
            }]
        );
    }

    #[test]
    fn other_reasons_are_unhandled() {
        assert_eq!(
            Completion::from_choice(Some("length"), json!({})).unwrap(),
            Completion::Unhandled {
                finish_reason: "length".to_string()
            }
        );
        assert_eq!(
            Completion::from_choice(None, json!({})).unwrap(),
            Completion::Unhandled {
                finish_reason: "none".to_string()
            }
        );
    }

    #[test]
    fn malformed_tool_call_is_rejected() {
        let message = json!({
            "role": "assistant",
            "tool_calls": [
                { "id": "c1", "function": { "name": "get_weather", "arguments": "{}" } },
                { "id": "c2", "function": { "arguments": "{}" } }
            ]
        });

        let err = Completion::from_choice(Some("tool_calls"), message).unwrap_err();
        assert!(matches!(
            &err,
            Error::InvalidModelMessage(msg) if msg == "tool call 1 has no function name"
        ));
    }

    #[test]
    fn tool_calls_finish_needs_calls() {
        for message in [
            json!({ "role": "assistant" }),
            json!({ "role": "assistant", "tool_calls": [] }),
        ] {
            assert!(matches!(
                Completion::from_choice(Some("tool_calls"), message),
                Err(Error::InvalidModelMessage(_))
            ));
        }

        let idless = json!({ "tool_calls": [{ "function": { "name": "get_weather" } }] });
        assert!(matches!(
            Completion::from_choice(Some("tool_calls"), idless),
            Err(Error::InvalidModelMessage(msg)) if msg == "tool call 0 has no id"
        ));
    }

    #[test]
    fn request_omits_empty_tools() {
        let messages = vec![json!({ "role": "user", "content": "hi" })];
        let request = ChatCompletionRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            tools: None,
        };
        let body = serde_json::to_value(&request).unwrap();

        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][0]["content"], "hi");
    }
}
