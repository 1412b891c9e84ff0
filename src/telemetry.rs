//! Periodic publication of the session state and conversation
//!
//! The session pushes a [`Snapshot`] into a watch channel after every
//! transition and every conversation change. A publisher task samples the
//! latest snapshot on a fixed period and writes it to a [`TelemetrySink`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::TelemetryConfig;
use crate::session::SessionState;

/// Latest externally visible session status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: SessionState,
    /// Conversation as a JSON array of chat messages
    pub conversation: String,
}

/// Destination for published values
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Open the connection, run once before publishing starts
    ///
    /// # Errors
    ///
    /// Returns error if the destination is unreachable
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Returns error if the value cannot be written
    async fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Release the connection after publishing has stopped
    async fn close(&self) {}
}

/// Sink that emits values as tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn write(&self, key: &str, value: &str) -> Result<()> {
        tracing::trace!(target: "parley_assistant::telemetry", key, value, "telemetry");
        Ok(())
    }
}

/// Spawn the publisher task
///
/// Runs until `shutdown` is cancelled or the snapshot sender is dropped.
/// Write failures are logged and retried on the next tick.
pub fn spawn_publisher(
    mut snapshots: watch::Receiver<Snapshot>,
    sink: Arc<dyn TelemetrySink>,
    config: &TelemetryConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = config.period;
    let state_key = config.state_key.clone();
    let conversation_key = config.conversation_key.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(period_ms = period.as_millis(), "telemetry publisher started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if snapshots.has_changed().is_err() {
                break;
            }
            let snapshot = snapshots.borrow_and_update().clone();

            if let Err(e) = sink.write(&state_key, &snapshot.state.to_string()).await {
                tracing::warn!(error = %e, key = %state_key, "telemetry write failed");
            }
            if let Err(e) = sink.write(&conversation_key, &snapshot.conversation).await {
                tracing::warn!(error = %e, key = %conversation_key, "telemetry write failed");
            }
        }

        tracing::debug!("telemetry publisher stopped");
    })
}
