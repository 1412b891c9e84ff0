//! Configuration management
//!
//! Values come from built-in defaults, then the TOML file, then environment
//! variables. The session only ever sees a validated [`Config`].

pub mod file;

use std::path::Path;
use std::time::Duration;

use self::file::AssistantConfigFile;
use crate::{Error, Result};

/// Default OpenAI-compatible API base URL
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TRANSCRIPTION_MODEL: &str = "gpt-4o-transcribe";
const DEFAULT_SPEECH_MODEL: &str = "gpt-4o-mini-tts";
const DEFAULT_VOICE: &str = "alloy";
const DEFAULT_PROMPT: &str =
    "You are a helpful voice assistant. Keep responses concise and conversational.";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_TELEMETRY_PERIOD_MS: u64 = 200;

/// Assistant configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the speech and chat endpoints
    pub api_key: String,

    /// Base URL of the OpenAI-compatible API
    pub api_base: String,

    /// Chat completion configuration
    pub chat: ChatConfig,

    /// Transcription model
    pub transcription_model: String,

    /// Speech synthesis configuration
    pub speech: SpeechConfig,

    /// Push-to-talk device configuration
    pub input: InputConfig,

    /// Knowledge base (vector database) configuration, if enabled
    pub database: Option<DatabaseConfig>,

    /// State publishing configuration
    pub telemetry: TelemetryConfig,

    /// OPC UA server, if configured
    pub opcua: Option<OpcUaConfig>,

    /// Node categories exposed to the node read tool
    pub node_categories: Vec<NodeCategory>,
}

/// Chat completion configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub model: String,
    /// System prompt, always the first turn of the conversation
    pub prompt: String,
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub model: String,
    pub voice: String,
    pub instructions: Option<String>,
}

/// Which physical device drives the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputKind {
    #[default]
    Keyboard,
    Gamepad,
}

impl std::str::FromStr for InputKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyboard" => Ok(Self::Keyboard),
            "gamepad" | "joycon" => Ok(Self::Gamepad),
            other => Err(Error::Config(format!("unknown input kind: {other}"))),
        }
    }
}

/// Push-to-talk device configuration
#[derive(Debug, Clone)]
pub struct InputConfig {
    pub kind: InputKind,
    /// Keyboard key for the primary button
    pub primary_key: char,
    /// Keyboard key for the secondary button
    pub secondary_key: char,
    /// Device discovery attempts before failing
    pub max_attempts: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            kind: InputKind::Keyboard,
            primary_key: 'u',
            secondary_key: 'i',
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Vector database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub collection: String,
    pub description: Option<String>,
}

/// OPC UA server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcUaConfig {
    pub url: String,
}

/// State publishing configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub period: Duration,
    /// Key the current state name is written under
    pub state_key: String,
    /// Key the serialized conversation is written under
    pub conversation_key: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period: Duration::from_millis(DEFAULT_TELEMETRY_PERIOD_MS),
            state_key: "assistant/state".to_string(),
            conversation_key: "assistant/conversation".to_string(),
        }
    }
}

/// A named group of automation nodes
#[derive(Debug, Clone)]
pub struct NodeCategory {
    pub name: String,
    pub description: String,
    pub nodes: Vec<NodeDescriptor>,
}

/// One readable automation node
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub alias: String,
}

impl Config {
    /// Load configuration from an optional explicit file, the default file
    /// location, and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if an explicit file cannot be loaded or the resulting
    /// configuration is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::load_config_file_from(path)?,
            None => file::load_config_file(),
        };
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with environment lookups and validate
    ///
    /// # Errors
    ///
    /// Returns error if the merged configuration is invalid
    pub fn resolve<F>(fc: AssistantConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = env("OPENAI_API_KEY").or(fc.api.key).unwrap_or_default();
        let api_base = env("PARLEY_API_BASE")
            .or(fc.api.base_url)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let kind = match env("PARLEY_INPUT").or(fc.input.kind) {
            Some(kind) => kind.parse()?,
            None => InputKind::default(),
        };
        let input_defaults = InputConfig::default();
        let input = InputConfig {
            kind,
            primary_key: fc.input.primary_key.unwrap_or(input_defaults.primary_key),
            secondary_key: fc.input.secondary_key.unwrap_or(input_defaults.secondary_key),
            max_attempts: fc.input.max_attempts.unwrap_or(input_defaults.max_attempts),
        };

        let telemetry_defaults = TelemetryConfig::default();
        let mut telemetry = TelemetryConfig {
            enabled: fc.telemetry.enabled.unwrap_or(telemetry_defaults.enabled),
            period: fc
                .telemetry
                .period_ms
                .map_or(telemetry_defaults.period, Duration::from_millis),
            state_key: fc.telemetry.state_key.unwrap_or(telemetry_defaults.state_key),
            conversation_key: fc
                .telemetry
                .conversation_key
                .unwrap_or(telemetry_defaults.conversation_key),
        };

        // Configured state nodes turn publishing on and replace the keys
        let opcua = fc.opcua.map(|ua| {
            if let Some(node) = ua.state_node_id {
                telemetry.state_key = node;
                telemetry.enabled = true;
            }
            if let Some(node) = ua.conversation_node_id {
                telemetry.conversation_key = node;
                telemetry.enabled = true;
            }
            OpcUaConfig {
                url: env("PARLEY_OPCUA_URL").unwrap_or(ua.url),
            }
        });

        let config = Self {
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            chat: ChatConfig {
                model: fc.chat.model.unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
                prompt: fc.chat.prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            },
            transcription_model: fc
                .transcription
                .model
                .unwrap_or_else(|| DEFAULT_TRANSCRIPTION_MODEL.to_string()),
            speech: SpeechConfig {
                model: fc.speech.model.unwrap_or_else(|| DEFAULT_SPEECH_MODEL.to_string()),
                voice: fc.speech.voice.unwrap_or_else(|| DEFAULT_VOICE.to_string()),
                instructions: fc.speech.instructions,
            },
            input,
            database: fc.database.map(|db| DatabaseConfig {
                url: db.url.trim_end_matches('/').to_string(),
                collection: db.collection,
                description: db.description,
            }),
            telemetry,
            opcua,
            node_categories: fc
                .nodes
                .categories
                .into_iter()
                .map(|c| NodeCategory {
                    name: c.name,
                    description: c.description,
                    nodes: c
                        .nodes
                        .into_iter()
                        .map(|n| NodeDescriptor {
                            node_id: n.node_id,
                            alias: n.alias,
                        })
                        .collect(),
                })
                .collect(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::Config(
                "API key required (set OPENAI_API_KEY or [api] key)".to_string(),
            ));
        }
        if self.chat.prompt.trim().is_empty() {
            return Err(Error::Config("chat prompt cannot be empty".to_string()));
        }
        if self.input.primary_key.eq_ignore_ascii_case(&self.input.secondary_key) {
            return Err(Error::Config(
                "primary and secondary keys must differ".to_string(),
            ));
        }
        if self.input.max_attempts == 0 {
            return Err(Error::Config("input max_attempts must be positive".to_string()));
        }
        if self.telemetry.period.is_zero() {
            return Err(Error::Config("telemetry period must be positive".to_string()));
        }

        check_http_url("api base_url", &self.api_base)?;
        if let Some(database) = &self.database {
            check_http_url("database url", &database.url)?;
        }
        if let Some(opcua) = &self.opcua {
            let parsed = url::Url::parse(&opcua.url)
                .map_err(|e| Error::Config(format!("invalid opcua url '{}': {e}", opcua.url)))?;
            if parsed.scheme() != "opc.tcp" {
                return Err(Error::Config(format!(
                    "opcua url must use opc.tcp, got {}",
                    parsed.scheme()
                )));
            }
        }
        Ok(())
    }
}

fn check_http_url(what: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| Error::Config(format!("invalid {what} '{value}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Config(format!(
            "{what} must use http or https, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::file::parse_config_file;
    use super::*;

    fn env_with_key(key: &str) -> Option<String> {
        (key == "OPENAI_API_KEY").then(|| "sk-test".to_string())
    }

    #[test]
    fn defaults_apply() {
        let config = Config::resolve(AssistantConfigFile::default(), env_with_key).unwrap();

        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.input.kind, InputKind::Keyboard);
        assert_eq!(config.input.primary_key, 'u');
        assert_eq!(config.telemetry.period, Duration::from_millis(200));
        assert!(!config.telemetry.enabled);
        assert!(config.database.is_none());
        assert!(config.opcua.is_none());
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let result = Config::resolve(AssistantConfigFile::default(), |_| None);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_file() {
        let fc = parse_config_file(
            r#"
            [api]
            key = "from-file"
            base_url = "http://file.local/v1/"

            [input]
            kind = "keyboard"
            "#,
        )
        .unwrap();

        let config = Config::resolve(fc, |key| match key {
            "OPENAI_API_KEY" => Some("from-env".to_string()),
            "PARLEY_INPUT" => Some("joycon".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.api_key, "from-env");
        assert_eq!(config.api_base, "http://file.local/v1");
        assert_eq!(config.input.kind, InputKind::Gamepad);
    }

    #[test]
    fn same_keys_are_rejected() {
        let fc = parse_config_file("[input]\nprimary_key = \"x\"\nsecondary_key = \"X\"").unwrap();
        assert!(matches!(
            Config::resolve(fc, env_with_key),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn blank_prompt_is_rejected() {
        let fc = parse_config_file("[chat]\nprompt = \"  \"").unwrap();
        assert!(Config::resolve(fc, env_with_key).is_err());
    }

    #[test]
    fn non_http_urls_are_rejected() {
        let fc = parse_config_file("[api]\nbase_url = \"ftp://example.com\"").unwrap();
        assert!(matches!(
            Config::resolve(fc, env_with_key),
            Err(Error::Config(_))
        ));

        let fc = parse_config_file("[database]\nurl = \"not a url\"\ncollection = \"lab\"").unwrap();
        assert!(Config::resolve(fc, env_with_key).is_err());
    }

    #[test]
    fn opcua_nodes_enable_publishing() {
        let fc = parse_config_file(
            r#"
            [opcua]
            url = "opc.tcp://plc.local:4840"
            state_node_id = "ns=2;s=Assistant.State"
            conversation_node_id = "ns=2;s=Assistant.Conversation"
            "#,
        )
        .unwrap();

        let config = Config::resolve(fc, env_with_key).unwrap();

        assert_eq!(
            config.opcua,
            Some(OpcUaConfig {
                url: "opc.tcp://plc.local:4840".to_string()
            })
        );
        assert!(config.telemetry.enabled);
        assert_eq!(config.telemetry.state_key, "ns=2;s=Assistant.State");
        assert_eq!(config.telemetry.conversation_key, "ns=2;s=Assistant.Conversation");
    }

    #[test]
    fn opcua_without_nodes_keeps_telemetry_off() {
        let fc = parse_config_file("[opcua]\nurl = \"opc.tcp://plc.local:4840\"").unwrap();
        let config = Config::resolve(fc, env_with_key).unwrap();

        assert!(config.opcua.is_some());
        assert!(!config.telemetry.enabled);
        assert_eq!(config.telemetry.state_key, "assistant/state");
    }

    #[test]
    fn opcua_url_needs_opc_tcp() {
        let fc = parse_config_file("[opcua]\nurl = \"http://plc.local:4840\"").unwrap();
        assert!(matches!(
            Config::resolve(fc, env_with_key),
            Err(Error::Config(message)) if message.contains("opc.tcp")
        ));
    }

    #[test]
    fn unknown_input_kind_is_rejected() {
        assert!("trackpad".parse::<InputKind>().is_err());
        assert_eq!("Gamepad".parse::<InputKind>().unwrap(), InputKind::Gamepad);
    }
}
