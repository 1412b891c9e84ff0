//! Parley - push-to-talk voice assistant
//!
//! This library provides the pieces of a spoken conversation loop:
//! - Push-to-talk input (keyboard or Joy-Con)
//! - Voice capture, transcription, synthesis, and playback
//! - Chat completion with tool calls
//! - OPC UA node reads and state publishing
//! - The session state machine that ties them together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Input Sources                       │
//! │          Keyboard   │   Joy-Con (evdev)              │
//! └────────────────────┬────────────────────────────────┘
//!                      │ ButtonEvent
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Session                           │
//! │  Idle → Listening → Processing → Speaking → Idle    │
//! └───────┬──────────────┬─────────────┬────────────────┘
//!         │              │             │
//!    Capture/STT    Chat + Tools    TTS/Playback
//! ```

pub mod chat;
pub mod config;
pub mod conversation;
pub mod error;
pub mod input;
pub mod opcua_client;
pub mod session;
pub mod telemetry;
pub mod tools;
pub mod voice;

pub use config::Config;
pub use conversation::{Conversation, Turn};
pub use error::{Error, Result};
pub use input::{Button, ButtonEvent, InputSource, ListenerId, ListenerRegistry, Phase};
pub use session::{PendingArguments, Session, SessionParts, SessionState, StateMachine, Trigger};
pub use tools::{Tool, ToolDefinition, ToolError, ToolRegistry};
