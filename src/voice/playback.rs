//! Streamed audio playback to speakers
//!
//! Synthesized audio is written in fixed-size chunks as it arrives. The
//! interrupt token is checked before every chunk, so a barge-in stops
//! playback within one chunk of audio.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::tts::SpeechSynthesizer;
use crate::{Error, Result};

/// Sample rate of synthesized speech
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Bytes written to the sink per step
pub const CHUNK_SIZE: usize = 1024;

/// Queued samples above which `write` waits for the device
const HIGH_WATER_SAMPLES: usize = PLAYBACK_SAMPLE_RATE as usize / 2;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Every chunk was written and the sink drained
    Finished { chunks: usize },
    /// The interrupt token was cancelled; `chunks` were written before it
    Interrupted { chunks: usize },
}

impl PlaybackOutcome {
    #[must_use]
    pub const fn chunks(&self) -> usize {
        match self {
            Self::Finished { chunks } | Self::Interrupted { chunks } => *chunks,
        }
    }
}

/// An open audio output accepting 24 kHz mono s16le PCM
#[async_trait]
pub trait AudioSink: Send {
    /// Queue one chunk, waiting while the device is far behind
    ///
    /// # Errors
    ///
    /// Returns error if the device failed
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Wait until another chunk can be queued without falling far behind
    ///
    /// Returns as soon as `interrupt` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns error if the device failed
    async fn ready(&mut self, _interrupt: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Wait until everything queued has been played
    ///
    /// # Errors
    ///
    /// Returns error if the device failed
    async fn drain(&mut self) -> Result<()>;
}

/// Opens audio sinks
pub trait AudioOutput: Send + Sync {
    /// # Errors
    ///
    /// Returns error if no output device can be opened
    fn open(&self) -> Result<Box<dyn AudioSink>>;
}

/// Splits an arbitrary byte stream into fixed-size chunks
#[derive(Debug)]
pub struct Rechunker {
    size: usize,
    buffer: Vec<u8>,
}

impl Rechunker {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            buffer: Vec::with_capacity(size),
        }
    }

    /// Add bytes and return every chunk completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while self.buffer.len() >= self.size {
            let rest = self.buffer.split_off(self.size);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    /// The final partial chunk, if any
    #[must_use]
    pub fn finish(self) -> Option<Vec<u8>> {
        (!self.buffer.is_empty()).then_some(self.buffer)
    }
}

/// Speaks text through a synthesizer and an audio output
pub struct AudioPlayback {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    output: Arc<dyn AudioOutput>,
}

impl AudioPlayback {
    #[must_use]
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            synthesizer,
            output,
        }
    }

    /// Play `text`, stopping early if `interrupt` is cancelled
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or the audio device fails
    pub async fn play(&self, text: &str, interrupt: &CancellationToken) -> Result<PlaybackOutcome> {
        let mut stream = self.synthesizer.synthesize_stream(text).await?;
        let mut sink = self.output.open()?;
        let mut chunker = Rechunker::new(CHUNK_SIZE);
        let mut chunks = 0usize;

        while let Some(piece) = stream.next().await {
            for chunk in chunker.push(&piece?) {
                sink.ready(interrupt).await?;
                if interrupt.is_cancelled() {
                    tracing::info!(chunks, "playback interrupted");
                    return Ok(PlaybackOutcome::Interrupted { chunks });
                }
                sink.write(&chunk).await?;
                chunks += 1;
            }
        }

        if let Some(last) = chunker.finish() {
            sink.ready(interrupt).await?;
            if interrupt.is_cancelled() {
                tracing::info!(chunks, "playback interrupted");
                return Ok(PlaybackOutcome::Interrupted { chunks });
            }
            sink.write(&last).await?;
            chunks += 1;
        }

        sink.drain().await?;
        tracing::debug!(chunks, "playback complete");
        Ok(PlaybackOutcome::Finished { chunks })
    }
}

/// The default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct SpeakerOutput;

impl SpeakerOutput {
    fn output_config(device: &cpal::Device) -> Result<StreamConfig> {
        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        };

        let supported = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        Ok(supported
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config())
    }

    fn build_stream(queue: Arc<Mutex<VecDeque<i16>>>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
        let config = Self::output_config(&device)?;
        let channels = usize::from(config.channels.max(1));

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels,
            "audio playback initialized"
        );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                    for frame in data.chunks_mut(channels) {
                        let sample = queue.pop_front().map_or(0.0, |s| f32::from(s) / 32768.0);
                        frame.fill(sample);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        Ok(stream)
    }
}

impl AudioOutput for SpeakerOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        // cpal streams are not Send, so the stream stays on its own thread
        let thread = {
            let queue = Arc::clone(&queue);
            let closed = Arc::clone(&closed);
            std::thread::Builder::new()
                .name("audio-playback".to_string())
                .spawn(move || {
                    let stream = match Self::build_stream(queue) {
                        Ok(stream) => {
                            let _ = ready_tx.send(Ok(()));
                            stream
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    while !closed.load(Ordering::Acquire) {
                        std::thread::park_timeout(Duration::from_millis(100));
                    }
                    drop(stream);
                })?
        };

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited".to_string()))??;

        Ok(Box::new(SpeakerSink {
            queue,
            closed,
            thread,
            carry: None,
        }))
    }
}

/// Sink backed by a playing cpal stream
struct SpeakerSink {
    queue: Arc<Mutex<VecDeque<i16>>>,
    closed: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    /// Odd trailing byte of the previous chunk
    carry: Option<u8>,
}

impl SpeakerSink {
    fn queued(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn check_alive(&self) -> Result<()> {
        if self.thread.is_finished() {
            return Err(Error::Audio("playback thread exited".to_string()));
        }
        Ok(())
    }
}

/// Poll until `queued()` is at or below the high-water mark
///
/// Gives up waiting as soon as `interrupt` is cancelled.
async fn wait_for_room<Q, A>(queued: Q, alive: A, interrupt: &CancellationToken) -> Result<()>
where
    Q: Fn() -> usize,
    A: Fn() -> Result<()>,
{
    while queued() > HIGH_WATER_SAMPLES {
        alive()?;
        tokio::select! {
            () = interrupt.cancelled() => return Ok(()),
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
    Ok(())
}

#[async_trait]
impl AudioSink for SpeakerSink {
    async fn ready(&mut self, interrupt: &CancellationToken) -> Result<()> {
        wait_for_room(|| self.queued(), || self.check_alive(), interrupt).await
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let mut bytes = Vec::with_capacity(chunk.len() + 1);
        bytes.extend(self.carry.take());
        bytes.extend_from_slice(chunk);

        let mut pairs = bytes.chunks_exact(2);
        let samples: Vec<i16> = pairs
            .by_ref()
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.carry = pairs.remainder().first().copied();

        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(samples);
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        while self.queued() > 0 {
            self.check_alive()?;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        // Let the device play out its own buffer
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.thread.thread().unpark();
    }
}
