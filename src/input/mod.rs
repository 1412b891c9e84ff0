//! Push-to-talk input sources
//!
//! Physical controls are reduced to two logical buttons: [`Button::Primary`]
//! (start/stop recording) and [`Button::Secondary`] (cancel, reset, interrupt).
//! Each device variant translates its native codes into those roles and fans
//! every transition out to the currently registered listeners.

mod gamepad;
mod keyboard;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::Result;
use crate::config::{InputConfig, InputKind};

pub use gamepad::{GamepadInput, connect_with_retry};
pub use keyboard::{KeyMap, KeyboardInput};

/// Logical button role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    /// Confirm / start / stop
    Primary,
    /// Cancel / reset / interrupt
    Secondary,
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "PRIMARY"),
            Self::Secondary => write!(f, "SECONDARY"),
        }
    }
}

/// Button transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pressed,
    Released,
}

/// A single observed button transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub button: Button,
    pub phase: Phase,
}

impl ButtonEvent {
    #[must_use]
    pub const fn pressed(button: Button) -> Self {
        Self {
            button,
            phase: Phase::Pressed,
        }
    }

    #[must_use]
    pub const fn released(button: Button) -> Self {
        Self {
            button,
            phase: Phase::Released,
        }
    }

    /// Whether this event is a press of `button`
    #[must_use]
    pub fn is_press_of(&self, button: Button) -> bool {
        self.button == button && self.phase == Phase::Pressed
    }
}

/// Callback invoked for every button transition
pub type Listener = Arc<dyn Fn(ButtonEvent) + Send + Sync>;

/// Opaque handle returned by [`InputSource::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Listener map shared between the session and a device's dispatch loop
///
/// Registration happens on the coordinator while dispatch runs on the
/// device thread/task, so the map sits behind a lock. Dispatch clones the
/// callbacks out before invoking them; a callback may therefore register or
/// remove listeners without deadlocking.
///
/// A dispatch loop that dies calls [`ListenerRegistry::close`]. No further
/// events will arrive after that.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<HashMap<ListenerId, Listener>>>,
    closed: CancellationToken,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    pub fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId::new();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        tracing::trace!(%id, "listener added");
        id
    }

    /// Remove a callback, returning whether it was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let removed = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        tracing::trace!(%id, removed, "listener removed");
        removed
    }

    /// Number of registered callbacks
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the event stream as ended
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::warn!("input event stream closed");
        }
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled once the event stream has ended
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Deliver an event to every registered callback
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, event: ButtonEvent) -> usize {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        tracing::debug!(button = %event.button, phase = ?event.phase, listeners = snapshot.len(), "button event");

        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A device that produces [`ButtonEvent`]s
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Human-readable variant name for logs
    fn name(&self) -> &'static str;

    /// Start the background dispatch loop
    ///
    /// # Errors
    ///
    /// Returns error if the source is already listening or the device
    /// cannot be opened after the configured number of attempts
    async fn begin_listening(&self) -> Result<()>;

    /// Stop the dispatch loop and wait for it to finish
    ///
    /// Safe to call when not listening.
    async fn stop_listening(&self);

    /// Register a callback for every subsequent button transition
    fn add_listener(&self, listener: Listener) -> ListenerId;

    /// Remove a callback; unknown handles are ignored
    fn remove_listener(&self, id: ListenerId);

    /// Token cancelled when the device stops delivering events for good
    fn closed(&self) -> CancellationToken;
}

/// Build the input source selected by configuration
///
/// `interrupt` is cancelled when the operator asks to quit through the
/// device itself (Ctrl+C while the keyboard holds the terminal in raw mode).
#[must_use]
pub fn from_config(config: &InputConfig, interrupt: CancellationToken) -> Box<dyn InputSource> {
    match config.kind {
        InputKind::Keyboard => Box::new(KeyboardInput::new(
            KeyMap::new(config.primary_key, config.secondary_key),
            interrupt,
        )),
        InputKind::Gamepad => Box::new(GamepadInput::new(config.max_attempts)),
    }
}
