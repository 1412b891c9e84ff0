//! Shared test utilities
//!
//! Test doubles for every collaborator of a session. None of them touch
//! audio hardware or the network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use parley_assistant::chat::{ChatModel, Completion, ToolCall};
use parley_assistant::config::TelemetryConfig;
use parley_assistant::tools::{Tool, ToolArgs, ToolDefinition, ToolResult};
use parley_assistant::voice::{
    AudioOutput, AudioPlayback, AudioSink, AudioStream, FRAME_SIZE, Frame, FrameSource,
    RECORDING_FILE, Recorder, SAMPLE_RATE, SpeechSynthesizer, Transcriber, record_frames,
};
use parley_assistant::{
    Button, ButtonEvent, Error, InputSource, ListenerId, ListenerRegistry, Result, Session,
    SessionParts, ToolRegistry,
};

/// Input source that replays one scripted batch of events per registration
///
/// Every `add_listener` call pops the next batch and dispatches it right
/// after the listener is registered. Clones share state, so a test can keep
/// one clone for inspection and hand another to the session.
#[derive(Clone, Default)]
pub struct ScriptedInput {
    registry: ListenerRegistry,
    script: Arc<Mutex<VecDeque<Vec<ButtonEvent>>>>,
    adds: Arc<AtomicUsize>,
    removes: Arc<AtomicUsize>,
    listening: Arc<AtomicBool>,
}

impl ScriptedInput {
    pub fn new(script: Vec<Vec<ButtonEvent>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Self::default()
        }
    }

    /// Handle for emitting events from other doubles
    pub fn registry(&self) -> ListenerRegistry {
        self.registry.clone()
    }

    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Listeners currently registered
    pub fn active(&self) -> usize {
        self.registry.len()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Simulate the device dying
    pub fn close(&self) {
        self.registry.close();
    }
}

#[async_trait]
impl InputSource for ScriptedInput {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn begin_listening(&self) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(Error::Input("already listening".to_string()));
        }
        Ok(())
    }

    async fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    fn add_listener(&self, listener: parley_assistant::input::Listener) -> ListenerId {
        let id = self.registry.add(listener);
        self.adds.fetch_add(1, Ordering::SeqCst);

        let batch = self.script.lock().unwrap().pop_front().unwrap_or_default();
        for event in batch {
            self.registry.dispatch(event);
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.registry.remove(id);
        self.removes.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self) -> CancellationToken {
        self.registry.closed()
    }
}

pub fn press(button: Button) -> ButtonEvent {
    ButtonEvent::pressed(button)
}

pub fn release(button: Button) -> ButtonEvent {
    ButtonEvent::released(button)
}

/// Emit `event` on `registry`, or close it when there is no event
fn emit(registry: &ListenerRegistry, event: Option<ButtonEvent>) {
    match event {
        Some(event) => {
            registry.dispatch(event);
        }
        None => registry.close(),
    }
}

/// Microphone stand-in: `frames` frames of tone, then a button event
///
/// The event goes through the input registry, the same path a real press
/// takes, so the session's listener is what stops the recording. Without
/// an event the input is closed instead.
pub struct FakeMic {
    frames: usize,
    read: usize,
    event: Option<ButtonEvent>,
    registry: ListenerRegistry,
}

impl FrameSource for FakeMic {
    fn read_frame(&mut self, n: usize) -> Result<Frame> {
        let index = self.read;
        self.read += 1;

        if index < self.frames {
            return Ok(Frame {
                samples: vec![1000; n],
                overflowed: false,
            });
        }
        if index == self.frames {
            emit(&self.registry, self.event);
        }
        Ok(Frame::default())
    }
}

/// Recorder that drives the real capture loop from a [`FakeMic`]
pub struct FakeRecorder {
    output: PathBuf,
    frames: usize,
    event: Option<ButtonEvent>,
    registry: ListenerRegistry,
    calls: AtomicUsize,
}

impl FakeRecorder {
    /// Records `frames` frames, then emits `event` on `input`
    pub fn new(dir: &Path, frames: usize, event: ButtonEvent, input: &ScriptedInput) -> Self {
        Self {
            output: dir.join(RECORDING_FILE),
            frames,
            event: Some(event),
            registry: input.registry(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Records `frames` frames, then closes `input`
    pub fn closing_input(dir: &Path, frames: usize, input: &ScriptedInput) -> Self {
        Self {
            event: None,
            ..Self::new(dir, frames, press(Button::Primary), input)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Recorder for FakeRecorder {
    fn record(&self, stop: CancellationToken) -> Option<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut mic = FakeMic {
            frames: self.frames,
            read: 0,
            event: self.event,
            registry: self.registry.clone(),
        };
        record_frames(&mut mic, &stop, FRAME_SIZE, SAMPLE_RATE, &self.output)
    }
}

/// Transcriber returning fixed text and remembering what it was given
pub struct StubTranscriber {
    text: String,
    seen: Mutex<Vec<PathBuf>>,
}

impl StubTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<PathBuf> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        self.seen.lock().unwrap().push(audio.to_path_buf());
        Ok(self.text.clone())
    }
}

/// One request observed by [`ScriptedChat`]
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Value>,
    pub tools: Vec<String>,
}

/// Chat model returning queued completions in order
#[derive(Default)]
pub struct ScriptedChat {
    responses: Mutex<VecDeque<Completion>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new(responses: Vec<Completion>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, messages: &[Value], tools: &[ToolDefinition]) -> Result<Completion> {
        self.requests.lock().unwrap().push(ChatRequest {
            messages: messages.to_vec(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Chat("no scripted completion left".to_string()))
    }
}

/// Completion requesting a single function call
pub fn tool_call_completion(id: &str, name: &str, arguments: &str) -> Completion {
    let message = json!({
        "role": "assistant",
        "content": null,
        "tool_calls": [{
            "id": id,
            "type": "function",
            "function": { "name": name, "arguments": arguments }
        }]
    });
    Completion::ToolCalls {
        message,
        calls: vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }],
    }
}

/// Synthesizer producing `total` bytes in uneven network-sized pieces
pub struct StubSynthesizer {
    total: usize,
    piece: usize,
    requests: Mutex<Vec<String>>,
}

impl StubSynthesizer {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            piece: 700,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for StubSynthesizer {
    async fn synthesize_stream(&self, text: &str) -> Result<AudioStream> {
        self.requests.lock().unwrap().push(text.to_string());
        #[allow(clippy::cast_possible_truncation)]
        let bytes: Vec<u8> = (0..self.total).map(|i| i as u8).collect();
        let pieces: Vec<Result<Vec<u8>>> =
            bytes.chunks(self.piece).map(|p| Ok(p.to_vec())).collect();
        Ok(futures::stream::iter(pieces).boxed())
    }
}

/// Audio output recording every chunk written to it
///
/// Optionally emits a button event, or closes the input, right after chunk
/// number `n` (1-based) is written.
#[derive(Default)]
pub struct RecordingOutput {
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    drained: Arc<AtomicBool>,
    trigger: Option<(usize, Option<ButtonEvent>, ListenerRegistry)>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitting_after(chunk: usize, event: ButtonEvent, input: &ScriptedInput) -> Self {
        Self {
            trigger: Some((chunk, Some(event), input.registry())),
            ..Self::default()
        }
    }

    pub fn closing_input_after(chunk: usize, input: &ScriptedInput) -> Self {
        Self {
            trigger: Some((chunk, None, input.registry())),
            ..Self::default()
        }
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }
}

impl AudioOutput for RecordingOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(RecordingSink {
            chunks: Arc::clone(&self.chunks),
            drained: Arc::clone(&self.drained),
            trigger: self.trigger.clone(),
        }))
    }
}

struct RecordingSink {
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    drained: Arc<AtomicBool>,
    trigger: Option<(usize, Option<ButtonEvent>, ListenerRegistry)>,
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let written = {
            let mut chunks = self.chunks.lock().unwrap();
            chunks.push(chunk.to_vec());
            chunks.len()
        };
        if let Some((n, event, registry)) = &self.trigger {
            if written == *n {
                emit(registry, *event);
            }
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        self.drained.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// `get_weather` stand-in with a fixed temperature
pub struct FixedWeather {
    pub temperature: f64,
    pub calls: Mutex<Vec<ToolArgs>>,
}

impl FixedWeather {
    pub fn new(temperature: f64) -> Self {
        Self {
            temperature,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Tool for FixedWeather {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_weather".to_string(),
            description: "Get the weather of a city in degrees Celsius.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "city": { "type": "string" },
                    "country": { "type": "string" },
                },
                "required": ["city", "country"],
                "additionalProperties": false,
            }),
        }
    }

    async fn execute(&self, args: &ToolArgs) -> ToolResult<Value> {
        self.calls.lock().unwrap().push(args.clone());
        Ok(json!({ "temperature": self.temperature }))
    }
}

/// Collaborators of one test session, kept for inspection
pub struct Harness {
    pub input: ScriptedInput,
    pub recorder: Arc<FakeRecorder>,
    pub transcriber: Arc<StubTranscriber>,
    pub chat: Arc<ScriptedChat>,
    pub synthesizer: Arc<StubSynthesizer>,
    pub output: Arc<RecordingOutput>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    /// Harness whose recorder captures `frames` frames before PRIMARY stops it
    pub fn new(script: Vec<Vec<ButtonEvent>>, frames: usize, chat: Vec<Completion>) -> Self {
        let input = ScriptedInput::new(script);
        let dir = tempfile::tempdir().unwrap();
        Self {
            recorder: Arc::new(FakeRecorder::new(
                dir.path(),
                frames,
                press(Button::Primary),
                &input,
            )),
            transcriber: Arc::new(StubTranscriber::new("what's the weather in Melbourne")),
            chat: Arc::new(ScriptedChat::new(chat)),
            synthesizer: Arc::new(StubSynthesizer::new(3 * 1024)),
            output: Arc::new(RecordingOutput::new()),
            input,
            dir,
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: StubSynthesizer) -> Self {
        self.synthesizer = Arc::new(synthesizer);
        self
    }

    pub fn with_output(mut self, output: RecordingOutput) -> Self {
        self.output = Arc::new(output);
        self
    }

    pub fn with_recorder(mut self, recorder: FakeRecorder) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    pub fn session(&self, tools: ToolRegistry) -> Session {
        let parts = SessionParts {
            input: Box::new(self.input.clone()),
            recorder: self.recorder.clone(),
            transcriber: self.transcriber.clone(),
            chat: self.chat.clone(),
            playback: AudioPlayback::new(self.synthesizer.clone(), self.output.clone()),
            tools,
            telemetry: None,
            telemetry_config: TelemetryConfig::default(),
        };
        Session::new(parts, "You are a lab assistant.").unwrap()
    }
}

/// Registry holding a [`FixedWeather`] at 21.0 degrees
pub fn weather_tools() -> (ToolRegistry, Arc<FixedWeather>) {
    let weather = Arc::new(FixedWeather::new(21.0));
    let mut tools = ToolRegistry::new();
    tools.register(weather.clone()).unwrap();
    (tools, weather)
}
