//! Gamepad-backed input (right Joy-Con over evdev)
//!
//! Only available on Linux. Other platforms get a source that refuses to
//! start, so the session fails at init instead of running without controls.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{InputSource, Listener, ListenerId, ListenerRegistry};
use crate::{Error, Result};

/// Device names the right Joy-Con registers under
const DEVICE_NAMES: &[&str] = &["Nintendo Switch Right Joy-Con", "Joy-Con (R)"];

/// Delay between discovery attempts
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Poll `discover` until it yields a value, sleeping `delay` between misses
///
/// # Errors
///
/// Returns `Error::Input` once `max_attempts` attempts have all missed
pub async fn connect_with_retry<T, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut discover: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 1..=max_attempts {
        if let Some(found) = discover().await {
            return Ok(found);
        }
        tracing::warn!(attempt, max_attempts, "input device not found, retrying");
        tokio::time::sleep(delay).await;
    }

    Err(Error::Input(format!(
        "input device not found after {max_attempts} attempts"
    )))
}

/// Gamepad input source
pub struct GamepadInput {
    max_attempts: u32,
    listeners: ListenerRegistry,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GamepadInput {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            listeners: ListenerRegistry::new(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl InputSource for GamepadInput {
    fn name(&self) -> &'static str {
        "gamepad"
    }

    async fn begin_listening(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(Error::Input("gamepad is already listening".to_string()));
        }

        *task = Some(platform::spawn_reader(self.max_attempts, self.listeners.clone()).await?);
        Ok(())
    }

    async fn stop_listening(&self) {
        let Some(handle) = self.task.lock().await.take() else {
            return;
        };

        handle.abort();
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!(error = %e, "gamepad reader ended abnormally"),
        }
        tracing::debug!("gamepad reader stopped");
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

#[cfg(target_os = "linux")]
mod platform {
    use evdev::{Device, InputEventKind, Key};
    use tokio::task::JoinHandle;

    use super::{DEVICE_NAMES, RETRY_DELAY, connect_with_retry};
    use crate::input::{Button, ButtonEvent, ListenerRegistry, Phase};
    use crate::{Error, Result};

    /// Translate an evdev key transition into a button event
    ///
    /// A is primary, B is secondary. Everything else, including
    /// auto-repeat (value 2), is dropped.
    pub(super) fn translate(key: Key, value: i32) -> Option<ButtonEvent> {
        let button = match key {
            Key::BTN_EAST => Button::Primary,
            Key::BTN_SOUTH => Button::Secondary,
            _ => return None,
        };
        let phase = match value {
            1 => Phase::Pressed,
            0 => Phase::Released,
            _ => return None,
        };
        Some(ButtonEvent { button, phase })
    }

    fn find_device() -> Option<(std::path::PathBuf, Device)> {
        evdev::enumerate().find(|(_, device)| {
            device
                .name()
                .is_some_and(|name| DEVICE_NAMES.contains(&name))
        })
    }

    pub(super) async fn spawn_reader(
        max_attempts: u32,
        listeners: ListenerRegistry,
    ) -> Result<JoinHandle<()>> {
        let (path, device) = connect_with_retry(max_attempts, RETRY_DELAY, || async {
            tokio::task::spawn_blocking(find_device).await.ok().flatten()
        })
        .await?;

        tracing::info!(
            name = device.name().unwrap_or_default(),
            path = %path.display(),
            "connected to gamepad"
        );

        let mut events = device
            .into_event_stream()
            .map_err(|e| Error::Input(format!("failed to open gamepad event stream: {e}")))?;

        Ok(tokio::spawn(async move {
            loop {
                match events.next_event().await {
                    Ok(event) => {
                        if let InputEventKind::Key(key) = event.kind() {
                            if let Some(button_event) = translate(key, event.value()) {
                                listeners.dispatch(button_event);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "gamepad read failed");
                        listeners.close();
                        break;
                    }
                }
            }
        }))
    }

}

#[cfg(not(target_os = "linux"))]
mod platform {
    use tokio::task::JoinHandle;

    use crate::input::ListenerRegistry;
    use crate::{Error, Result};

    #[allow(clippy::unused_async)]
    pub(super) async fn spawn_reader(
        _max_attempts: u32,
        _listeners: ListenerRegistry,
    ) -> Result<JoinHandle<()>> {
        Err(Error::Input(
            "gamepad input is only supported on Linux".to_string(),
        ))
    }
}
