//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct AssistantConfigFile {
    /// OpenAI-compatible API settings
    #[serde(default)]
    pub api: ApiFileConfig,

    /// Chat completion settings
    #[serde(default)]
    pub chat: ChatFileConfig,

    /// Speech-to-text settings
    #[serde(default)]
    pub transcription: TranscriptionFileConfig,

    /// Text-to-speech settings
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Push-to-talk device settings
    #[serde(default)]
    pub input: InputFileConfig,

    /// Vector database for the knowledge base tool
    #[serde(default)]
    pub database: Option<DatabaseFileConfig>,

    /// Periodic state publishing
    #[serde(default)]
    pub telemetry: TelemetryFileConfig,

    /// OPC UA server for node reads and state publishing
    #[serde(default)]
    pub opcua: Option<OpcUaFileConfig>,

    /// Automation node categories for the node read tool
    #[serde(default)]
    pub nodes: NodesFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiFileConfig {
    pub key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatFileConfig {
    /// Model identifier (e.g. "gpt-4o-mini")
    pub model: Option<String>,

    /// System prompt placed at the head of every conversation
    pub prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscriptionFileConfig {
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub model: Option<String>,
    pub voice: Option<String>,
    /// Free-form speaking style passed to the synthesizer
    pub instructions: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InputFileConfig {
    /// "keyboard" or "gamepad"
    pub kind: Option<String>,
    pub primary_key: Option<char>,
    pub secondary_key: Option<char>,
    /// Device discovery attempts before giving up
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseFileConfig {
    pub url: String,
    pub collection: String,
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TelemetryFileConfig {
    pub enabled: Option<bool>,
    pub period_ms: Option<u64>,
    pub state_key: Option<String>,
    pub conversation_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpcUaFileConfig {
    /// Endpoint, e.g. "opc.tcp://localhost:4840"
    pub url: String,
    /// Node the session state is written to
    pub state_node_id: Option<String>,
    /// Node the serialized conversation is written to
    pub conversation_node_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodesFileConfig {
    #[serde(default)]
    pub categories: Vec<NodeCategoryFileConfig>,
}

#[derive(Debug, Deserialize)]
pub struct NodeCategoryFileConfig {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<NodeFileConfig>,
}

#[derive(Debug, Deserialize)]
pub struct NodeFileConfig {
    pub node_id: String,
    pub alias: String,
}

/// Parse a config file from TOML text
///
/// # Errors
///
/// Returns error if the text is not valid TOML for this schema
pub fn parse_config_file(content: &str) -> Result<AssistantConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load a config file from an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_config_file_from(path: &Path) -> Result<AssistantConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let config = parse_config_file(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Load the TOML config file from the standard path
///
/// Returns `AssistantConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> AssistantConfigFile {
    let Some(path) = config_file_path() else {
        return AssistantConfigFile::default();
    };

    if !path.exists() {
        return AssistantConfigFile::default();
    }

    match load_config_file_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            AssistantConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}
