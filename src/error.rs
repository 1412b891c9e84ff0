//! Error types for the assistant

use thiserror::Error;

use crate::session::{SessionState, Trigger};

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the assistant
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Input device error (discovery, dispatch)
    #[error("input error: {0}")]
    Input(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Chat completion error
    #[error("chat error: {0}")]
    Chat(String),

    /// Tool backend error (initialization, transport)
    #[error("tool error: {0}")]
    Tool(String),

    /// The model asked for a tool that is not registered
    #[error("unknown tool requested by model: {0}")]
    UnknownTool(String),

    /// A raw model message was stored without any function call in it
    #[error("invalid model message: {0}")]
    InvalidModelMessage(String),

    /// A turn that cannot be appended to the conversation
    #[error("invalid turn: {0}")]
    InvalidTurn(String),

    /// A trigger was fired in a state that has no transition for it
    #[error("illegal transition: {trigger} in state {state}")]
    IllegalTransition {
        /// State the machine was in
        state: SessionState,
        /// Trigger that was rejected
        trigger: Trigger,
    },

    /// The chat completion ended for a reason the session does not handle
    #[error("unhandled completion finish reason: {0}")]
    UnhandledCompletion(String),

    /// OPC UA connection or read error
    #[error("OPC UA error: {0}")]
    OpcUa(String),

    /// Telemetry sink error
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
