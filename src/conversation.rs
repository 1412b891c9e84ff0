//! Conversation log
//!
//! An append-only list of turns behind a fixed developer (system) prompt.
//! The serialized form follows the chat-completions message schema and is
//! what gets replayed to the model on every request.

use serde_json::{Value, json};

use crate::{Error, Result};

/// One conversational contribution
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    /// System prompt
    Developer(String),
    /// Transcribed user speech
    User(String),
    /// Model reply
    Assistant(String),
    /// Result of a tool call, keyed by the call's identifier
    Tool {
        tool_call_id: String,
        content: String,
    },
    /// Model-issued function-call message, kept verbatim for replay
    ModelCall(Value),
}

impl Turn {
    /// Render this turn as a chat message
    #[must_use]
    pub fn to_message(&self) -> Value {
        match self {
            Self::Developer(content) => json!({ "role": "developer", "content": content }),
            Self::User(content) => json!({ "role": "user", "content": content }),
            Self::Assistant(content) => json!({ "role": "assistant", "content": content }),
            Self::Tool {
                tool_call_id,
                content,
            } => json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }),
            Self::ModelCall(raw) => raw.clone(),
        }
    }
}

/// Whether a raw model message carries at least one function call
fn has_tool_calls(message: &Value) -> bool {
    message
        .get("tool_calls")
        .and_then(Value::as_array)
        .is_some_and(|calls| !calls.is_empty())
}

/// Ordered conversation history
#[derive(Debug, Clone)]
pub struct Conversation {
    prompt: Turn,
    turns: Vec<Turn>,
}

impl Conversation {
    /// Create an empty conversation led by `prompt`
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Turn::Developer(prompt.into()),
            turns: Vec::new(),
        }
    }

    /// Append a turn
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTurn` for a second developer prompt and
    /// `Error::InvalidModelMessage` for a model message without tool calls
    pub fn add(&mut self, turn: Turn) -> Result<()> {
        match &turn {
            Turn::Developer(_) => {
                return Err(Error::InvalidTurn(
                    "the developer prompt is fixed at construction".to_string(),
                ));
            }
            Turn::ModelCall(message) if !has_tool_calls(message) => {
                return Err(Error::InvalidModelMessage(
                    "model message has no function call".to_string(),
                ));
            }
            _ => {}
        }
        self.turns.push(turn);
        Ok(())
    }

    /// Append a raw model message that requested function calls
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidModelMessage` if the message has no tool calls
    pub fn add_model_call(&mut self, message: Value) -> Result<()> {
        self.add(Turn::ModelCall(message))
    }

    /// Drop every turn except the system prompt
    pub fn reset(&mut self) {
        self.turns.clear();
    }

    /// Stored turns, excluding the system prompt
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Messages to submit to the model, system prompt first
    #[must_use]
    pub fn to_ordered_sequence(&self) -> Vec<Value> {
        std::iter::once(&self.prompt)
            .chain(&self.turns)
            .map(Turn::to_message)
            .collect()
    }

    /// The ordered sequence as a JSON string
    #[must_use]
    pub fn to_json(&self) -> String {
        Value::Array(self.to_ordered_sequence()).to_string()
    }
}
