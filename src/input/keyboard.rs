//! Keyboard-backed input
//!
//! Puts the terminal in raw mode and reads key events on a dedicated thread.
//! Raw mode swallows SIGINT, so Ctrl+C is forwarded through the interrupt
//! token instead.

use std::io::stdout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use crossterm::event::{
    self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, KeyboardEnhancementFlags,
    PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use tokio_util::sync::CancellationToken;

use super::{Button, ButtonEvent, InputSource, Listener, ListenerId, ListenerRegistry, Phase};
use crate::{Error, Result};

/// How long the reader thread blocks before rechecking its running flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Character-to-role mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMap {
    primary: char,
    secondary: char,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self::new('u', 'i')
    }
}

impl KeyMap {
    #[must_use]
    pub fn new(primary: char, secondary: char) -> Self {
        Self {
            primary: primary.to_ascii_lowercase(),
            secondary: secondary.to_ascii_lowercase(),
        }
    }

    /// Translate a terminal key event into a button event
    ///
    /// Returns `None` for unmapped keys and auto-repeat.
    #[must_use]
    pub fn translate(&self, key: &KeyEvent) -> Option<ButtonEvent> {
        let KeyCode::Char(c) = key.code else {
            return None;
        };

        let button = match c.to_ascii_lowercase() {
            c if c == self.primary => Button::Primary,
            c if c == self.secondary => Button::Secondary,
            _ => return None,
        };

        let phase = match key.kind {
            KeyEventKind::Press => Phase::Pressed,
            KeyEventKind::Release => Phase::Released,
            KeyEventKind::Repeat => return None,
        };

        Some(ButtonEvent { button, phase })
    }
}

fn is_ctrl_c(key: &KeyEvent) -> bool {
    key.kind == KeyEventKind::Press
        && key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char('c' | 'C'))
}

/// Keyboard input source
pub struct KeyboardInput {
    keymap: KeyMap,
    listeners: ListenerRegistry,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    enhanced: AtomicBool,
    interrupt: CancellationToken,
}

impl KeyboardInput {
    /// Create a keyboard source; nothing is read until [`InputSource::begin_listening`]
    #[must_use]
    pub fn new(keymap: KeyMap, interrupt: CancellationToken) -> Self {
        Self {
            keymap,
            listeners: ListenerRegistry::new(),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            enhanced: AtomicBool::new(false),
            interrupt,
        }
    }

    /// Whether the reader thread is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the terminal to report key releases when it can
    fn push_enhancement(&self) {
        if matches!(terminal::supports_keyboard_enhancement(), Ok(true)) {
            let flags = KeyboardEnhancementFlags::REPORT_EVENT_TYPES;
            if execute!(stdout(), PushKeyboardEnhancementFlags(flags)).is_ok() {
                self.enhanced.store(true, Ordering::SeqCst);
                return;
            }
        }
        tracing::debug!("terminal does not report key releases");
    }

    fn pop_enhancement(&self) {
        if self.enhanced.swap(false, Ordering::SeqCst) {
            let _ = execute!(stdout(), PopKeyboardEnhancementFlags);
        }
    }
}

#[async_trait]
impl InputSource for KeyboardInput {
    fn name(&self) -> &'static str {
        "keyboard"
    }

    async fn begin_listening(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Input("keyboard is already listening".to_string()));
        }

        if let Err(e) = enable_raw_mode() {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::Input(format!("failed to enable raw mode: {e}")));
        }
        self.push_enhancement();

        let keymap = self.keymap;
        let listeners = self.listeners.clone();
        let running = Arc::clone(&self.running);
        let interrupt = self.interrupt.clone();

        let handle = thread::Builder::new()
            .name("keyboard-input".to_string())
            .spawn(move || {
                tracing::debug!("keyboard reader started");
                if let Err(e) = read_loop(keymap, &listeners, &running, &interrupt) {
                    tracing::error!(error = %e, "keyboard input failed");
                    listeners.close();
                }
                running.store(false, Ordering::SeqCst);
                tracing::debug!("keyboard reader stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                let _ = disable_raw_mode();
                Error::Input(format!("failed to spawn keyboard thread: {e}"))
            })?;

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(
            primary = %self.keymap.primary,
            secondary = %self.keymap.secondary,
            "keyboard input listening"
        );
        Ok(())
    }

    async fn stop_listening(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        self.running.store(false, Ordering::SeqCst);
        if !matches!(
            tokio::task::spawn_blocking(move || handle.join()).await,
            Ok(Ok(()))
        ) {
            tracing::warn!("keyboard reader did not shut down cleanly");
        }

        self.pop_enhancement();
        if let Err(e) = disable_raw_mode() {
            tracing::warn!(error = %e, "failed to restore terminal mode");
        }
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn closed(&self) -> CancellationToken {
        self.listeners.closed()
    }
}

impl Drop for KeyboardInput {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.pop_enhancement();
            let _ = disable_raw_mode();
        }
    }
}

/// Read keys until `running` is cleared; an error ends the loop for good
fn read_loop(
    keymap: KeyMap,
    listeners: &ListenerRegistry,
    running: &AtomicBool,
    interrupt: &CancellationToken,
) -> std::io::Result<()> {
    while running.load(Ordering::SeqCst) {
        if !event::poll(POLL_INTERVAL)? {
            continue;
        }

        let Event::Key(key) = event::read()? else {
            continue;
        };

        if is_ctrl_c(&key) {
            tracing::info!("interrupt requested from keyboard");
            interrupt.cancel();
            continue;
        }

        if let Some(event) = keymap.translate(&key) {
            listeners.dispatch(event);
        }
    }
    Ok(())
}
