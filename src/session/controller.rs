//! Session controller: runs each state's work and fires the next trigger

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::machine::{SessionState, StateMachine, Trigger};
use crate::chat::{ChatModel, Completion};
use crate::config::TelemetryConfig;
use crate::conversation::{Conversation, Turn};
use crate::input::{Button, ButtonEvent, InputSource, ListenerId};
use crate::telemetry::{Snapshot, TelemetrySink, spawn_publisher};
use crate::tools::ToolRegistry;
use crate::voice::{AudioPlayback, Recorder, Transcriber};
use crate::{Error, Result};

/// Values handed from one state to the next within a cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingArguments {
    /// WAV file produced by the last recording
    pub recording: Option<PathBuf>,
    /// Reply text waiting to be spoken
    pub reply: Option<String>,
}

/// Everything a session needs from the outside world
pub struct SessionParts {
    pub input: Box<dyn InputSource>,
    pub recorder: Arc<dyn Recorder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub chat: Arc<dyn ChatModel>,
    pub playback: AudioPlayback,
    pub tools: ToolRegistry,
    /// Where state snapshots are published, if anywhere
    pub telemetry: Option<Arc<dyn TelemetrySink>>,
    pub telemetry_config: TelemetryConfig,
}

/// One push-to-talk conversation session
pub struct Session {
    machine: StateMachine,
    conversation: Conversation,
    pending: PendingArguments,
    input: Box<dyn InputSource>,
    recorder: Arc<dyn Recorder>,
    transcriber: Arc<dyn Transcriber>,
    chat: Arc<dyn ChatModel>,
    playback: AudioPlayback,
    tools: ToolRegistry,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    telemetry_config: TelemetryConfig,
    snapshots: watch::Sender<Snapshot>,
    halt: CancellationToken,
    publisher: Option<JoinHandle<()>>,
}

impl Session {
    /// Create a session in `Initial` whose conversation starts with `prompt`
    ///
    /// # Errors
    ///
    /// Returns error if the transition table is inconsistent
    pub fn new(parts: SessionParts, prompt: &str) -> Result<Self> {
        let machine = StateMachine::new()?;
        let conversation = Conversation::new(prompt);
        let (snapshots, _) = watch::channel(Snapshot {
            state: machine.state(),
            conversation: conversation.to_json(),
        });

        Ok(Self {
            machine,
            conversation,
            pending: PendingArguments::default(),
            input: parts.input,
            recorder: parts.recorder,
            transcriber: parts.transcriber,
            chat: parts.chat,
            playback: parts.playback,
            tools: parts.tools,
            telemetry: parts.telemetry,
            telemetry_config: parts.telemetry_config,
            snapshots,
            halt: CancellationToken::new(),
            publisher: None,
        })
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.machine.state()
    }

    #[must_use]
    pub const fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    #[must_use]
    pub const fn pending(&self) -> &PendingArguments {
        &self.pending
    }

    /// Receive a snapshot after every transition and conversation change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// Run states until one fails
    ///
    /// The session is left in `Error` and the causing error is returned.
    ///
    /// # Errors
    ///
    /// Always returns the error that ended the session
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(input = self.input.name(), "session started");
        loop {
            self.step().await?;
        }
    }

    /// Perform the current state's work and fire the resulting trigger
    ///
    /// On failure the session moves to `Error` before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or `Error::IllegalTransition` when
    /// stepping from `Error`
    pub async fn step(&mut self) -> Result<SessionState> {
        let outcome = match self.handle().await {
            Ok(trigger) => self.machine.fire(trigger),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(state) => {
                self.publish();
                Ok(state)
            }
            Err(e) => {
                tracing::error!(state = %self.machine.state(), error = %e, "session failed");
                if self.machine.can_fire(Trigger::Fault) {
                    self.machine.fire(Trigger::Fault)?;
                    self.publish();
                }
                Err(e)
            }
        }
    }

    /// Stop the input device, any recording, and the telemetry publisher
    pub async fn shutdown(&mut self) {
        self.halt.cancel();
        self.input.stop_listening().await;
        if let Some(publisher) = self.publisher.take() {
            let _ = publisher.await;
        }
        if let Some(sink) = &self.telemetry {
            sink.close().await;
        }
        tracing::info!("session stopped");
    }

    async fn handle(&mut self) -> Result<Trigger> {
        match self.machine.state() {
            SessionState::Initial => self.on_initial().await,
            SessionState::Idle => self.on_idle().await,
            SessionState::Reset => Ok(self.on_reset()),
            SessionState::Listening => self.on_listening().await,
            SessionState::Processing => self.on_processing().await,
            SessionState::Speaking => self.on_speaking().await,
            // No transition leaves Error, so firing fails
            SessionState::Error => Ok(Trigger::Fault),
        }
    }

    async fn on_initial(&mut self) -> Result<Trigger> {
        self.input.begin_listening().await?;
        tracing::info!(input = self.input.name(), "started input listener");

        self.tools.init_all().await?;

        if let Some(sink) = self.telemetry.clone() {
            sink.connect().await?;
            self.publisher = Some(spawn_publisher(
                self.snapshots.subscribe(),
                sink,
                &self.telemetry_config,
                self.halt.child_token(),
            ));
        }

        Ok(Trigger::InitComplete)
    }

    async fn on_idle(&mut self) -> Result<Trigger> {
        let (id, mut events) = self.forward_events();
        tracing::info!(
            "Press {} to start recording or {} to reset",
            Button::Primary,
            Button::Secondary
        );

        let closed = self.input.closed();
        let trigger = loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => event,
                () = closed.cancelled() => None,
            };
            match event {
                Some(event) if event.is_press_of(Button::Primary) => {
                    break Ok(Trigger::StartListening);
                }
                Some(event) if event.is_press_of(Button::Secondary) => {
                    break Ok(Trigger::StartReset);
                }
                Some(_) => {}
                None => break Err(input_closed()),
            }
        };

        self.input.remove_listener(id);
        trigger
    }

    fn on_reset(&mut self) -> Trigger {
        tracing::info!("resetting conversation");
        self.conversation.reset();
        self.pending = PendingArguments::default();
        Trigger::ResetComplete
    }

    async fn on_listening(&mut self) -> Result<Trigger> {
        // Session shutdown also ends a recording in progress
        let stop = self.halt.child_token();
        let cancelled = Arc::new(AtomicBool::new(false));

        let id = self.input.add_listener({
            let stop = stop.clone();
            let cancelled = Arc::clone(&cancelled);
            Arc::new(move |event: ButtonEvent| {
                if event.is_press_of(Button::Primary) {
                    stop.cancel();
                } else if event.is_press_of(Button::Secondary) {
                    cancelled.store(true, Ordering::SeqCst);
                    stop.cancel();
                }
            })
        });
        tracing::info!(
            "Recording... Press {} to stop or {} to cancel",
            Button::Primary,
            Button::Secondary
        );

        let recorder = Arc::clone(&self.recorder);
        let worker_stop = stop.clone();
        let mut worker = tokio::task::spawn_blocking(move || recorder.record(worker_stop));

        let closed = self.input.closed();
        let recording = tokio::select! {
            recording = &mut worker => recording,
            () = closed.cancelled() => {
                stop.cancel();
                worker.await
            }
        };

        self.input.remove_listener(id);
        let recording =
            recording.map_err(|e| Error::Audio(format!("capture worker failed: {e}")))?;

        if closed.is_cancelled() {
            discard_recording(recording);
            self.pending.recording = None;
            return Err(input_closed());
        }

        if cancelled.load(Ordering::SeqCst) {
            discard_recording(recording);
            tracing::info!("recording cancelled");
            self.pending.recording = None;
            return Ok(Trigger::AbandonRecording);
        }

        match recording {
            Some(path) => {
                self.pending.recording = Some(path);
                Ok(Trigger::StartProcessing)
            }
            None => {
                tracing::warn!("nothing was recorded");
                self.pending.recording = None;
                Ok(Trigger::AbandonRecording)
            }
        }
    }

    async fn on_processing(&mut self) -> Result<Trigger> {
        let path = self
            .pending
            .recording
            .clone()
            .ok_or_else(|| Error::Stt("no recording to transcribe".to_string()))?;

        let transcript = self.transcriber.transcribe(&path).await?;
        tracing::info!(user = %transcript, "user turn");
        self.conversation.add(Turn::User(transcript))?;
        self.publish();

        let reply = self.respond().await?;
        tracing::info!(assistant = %reply, "assistant turn");
        self.pending.reply = Some(reply);
        Ok(Trigger::StartSpeaking)
    }

    /// Complete over the conversation, running one round of tool calls
    async fn respond(&mut self) -> Result<String> {
        let definitions = self.tools.definitions();
        let completion = self
            .chat
            .complete(&self.conversation.to_ordered_sequence(), &definitions)
            .await?;

        let (message, calls) = match completion {
            Completion::Direct(text) => return self.add_reply(text),
            Completion::ToolCalls { message, calls } => (message, calls),
            Completion::Unhandled { finish_reason } => {
                return Err(Error::UnhandledCompletion(finish_reason));
            }
        };

        self.conversation.add_model_call(message)?;
        for call in calls {
            tracing::info!(tool = %call.name, id = %call.id, "running tool call");
            let content = self.tools.execute(&call.name, &call.arguments).await?;
            self.conversation.add(Turn::Tool {
                tool_call_id: call.id,
                content,
            })?;
        }
        self.publish();

        match self
            .chat
            .complete(&self.conversation.to_ordered_sequence(), &[])
            .await?
        {
            Completion::Direct(text) => self.add_reply(text),
            Completion::ToolCalls { .. } => {
                Err(Error::UnhandledCompletion("tool_calls".to_string()))
            }
            Completion::Unhandled { finish_reason } => {
                Err(Error::UnhandledCompletion(finish_reason))
            }
        }
    }

    fn add_reply(&mut self, text: String) -> Result<String> {
        self.conversation.add(Turn::Assistant(text.clone()))?;
        self.publish();
        Ok(text)
    }

    async fn on_speaking(&mut self) -> Result<Trigger> {
        let reply = self
            .pending
            .reply
            .clone()
            .ok_or_else(|| Error::Tts("no reply to speak".to_string()))?;

        // A dead input device also ends playback
        let closed = self.input.closed();
        let interrupt = closed.child_token();
        let id = self.input.add_listener({
            let interrupt = interrupt.clone();
            Arc::new(move |event: ButtonEvent| {
                if event.is_press_of(Button::Secondary) {
                    interrupt.cancel();
                }
            })
        });
        tracing::info!("Speaking... Press {} to interrupt", Button::Secondary);

        let outcome = self.playback.play(&reply, &interrupt).await;
        self.input.remove_listener(id);

        if closed.is_cancelled() {
            return Err(input_closed());
        }
        let outcome = outcome?;
        tracing::debug!(?outcome, "speaking finished");
        Ok(Trigger::FinishSpeaking)
    }

    /// Register a listener that forwards every event into a channel
    fn forward_events(&self) -> (ListenerId, mpsc::UnboundedReceiver<ButtonEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.input.add_listener(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        (id, rx)
    }

    fn publish(&self) {
        self.snapshots.send_replace(Snapshot {
            state: self.machine.state(),
            conversation: self.conversation.to_json(),
        });
    }
}

fn input_closed() -> Error {
    Error::Input("input device stopped delivering events".to_string())
}

fn discard_recording(recording: Option<PathBuf>) {
    if let Some(path) = recording {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!(error = %e, path = %path.display(), "could not discard recording");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.halt.cancel();
    }
}
