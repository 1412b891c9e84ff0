//! Voice pipeline integration tests
//!
//! Tests capture and playback without requiring audio hardware

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use parley_assistant::voice::{
    AudioOutput, AudioPlayback, AudioSink, AudioStream, CHUNK_SIZE, Frame, FrameSource,
    PlaybackOutcome, SAMPLE_RATE, SpeechSynthesizer, record_frames,
};
use parley_assistant::{Error, Result};

mod common;

use common::{RecordingOutput, StubSynthesizer};

/// Frame source replaying queued reads, then cancelling `stop`
struct QueuedFrames {
    reads: VecDeque<Result<Frame>>,
    stop: CancellationToken,
}

impl QueuedFrames {
    fn new(reads: Vec<Result<Frame>>, stop: &CancellationToken) -> Self {
        Self {
            reads: reads.into(),
            stop: stop.clone(),
        }
    }
}

impl FrameSource for QueuedFrames {
    fn read_frame(&mut self, _n: usize) -> Result<Frame> {
        let read = self.reads.pop_front().unwrap_or_else(|| Ok(Frame::default()));
        if self.reads.is_empty() {
            self.stop.cancel();
        }
        read
    }
}

fn frame(samples: &[i16], overflowed: bool) -> Result<Frame> {
    Ok(Frame {
        samples: samples.to_vec(),
        overflowed,
    })
}

#[test]
fn test_record_frames_writes_every_sample() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("user.wav");
    let stop = CancellationToken::new();
    let mut source = QueuedFrames::new(
        vec![frame(&[1, 2, 3], false), frame(&[4, 5, 6], false)],
        &stop,
    );

    let recording = record_frames(&mut source, &stop, 3, SAMPLE_RATE, &path);

    assert_eq!(recording, Some(path.clone()));
    let samples: Vec<i16> = hound::WavReader::open(&path)
        .unwrap()
        .into_samples::<i16>()
        .map(|s| s.unwrap())
        .collect();
    assert_eq!(samples, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_record_frames_keeps_overflowed_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("user.wav");
    let stop = CancellationToken::new();
    let mut source = QueuedFrames::new(
        vec![frame(&[7, 7], true), frame(&[8, 8], false)],
        &stop,
    );

    assert!(record_frames(&mut source, &stop, 2, SAMPLE_RATE, &path).is_some());
    assert_eq!(hound::WavReader::open(&path).unwrap().len(), 4);
}

#[test]
fn test_record_frames_read_error_abandons_recording() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("user.wav");
    let stop = CancellationToken::new();
    let mut source = QueuedFrames::new(
        vec![
            frame(&[1, 2], false),
            Err(Error::Audio("device unplugged".to_string())),
            frame(&[3, 4], false),
        ],
        &stop,
    );

    assert_eq!(record_frames(&mut source, &stop, 2, SAMPLE_RATE, &path), None);
    assert!(!path.exists());
}

#[test]
fn test_record_frames_already_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("user.wav");
    let stop = CancellationToken::new();
    stop.cancel();
    let mut source = QueuedFrames::new(vec![frame(&[1, 2], false)], &stop);

    assert_eq!(record_frames(&mut source, &stop, 2, SAMPLE_RATE, &path), None);
    assert_eq!(source.reads.len(), 1);
}

#[tokio::test]
async fn test_playback_writes_tail_chunk() {
    let output = Arc::new(RecordingOutput::new());
    let playback = AudioPlayback::new(
        Arc::new(StubSynthesizer::new(2 * CHUNK_SIZE + 100)),
        output.clone(),
    );

    let outcome = playback
        .play("Good morning.", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, PlaybackOutcome::Finished { chunks: 3 });
    let chunks = output.chunks();
    assert_eq!(chunks[0].len(), CHUNK_SIZE);
    assert_eq!(chunks[1].len(), CHUNK_SIZE);
    assert_eq!(chunks[2].len(), 100);
    assert!(output.drained());

    let bytes: Vec<u8> = chunks.concat();
    #[allow(clippy::cast_possible_truncation)]
    let expected: Vec<u8> = (0..2 * CHUNK_SIZE + 100).map(|i| i as u8).collect();
    assert_eq!(bytes, expected);
}

#[tokio::test]
async fn test_playback_interrupted_before_first_chunk() {
    let output = Arc::new(RecordingOutput::new());
    let synthesizer = Arc::new(StubSynthesizer::new(4 * CHUNK_SIZE));
    let playback = AudioPlayback::new(synthesizer.clone(), output.clone());
    let interrupt = CancellationToken::new();
    interrupt.cancel();

    let outcome = playback.play("Never heard.", &interrupt).await.unwrap();

    assert_eq!(outcome, PlaybackOutcome::Interrupted { chunks: 0 });
    assert!(output.chunks().is_empty());
    assert!(!output.drained());
    assert_eq!(synthesizer.requests(), vec!["Never heard.".to_string()]);
}

/// Synthesizer whose stream fails after one good piece
struct BrokenSynthesizer;

#[async_trait]
impl SpeechSynthesizer for BrokenSynthesizer {
    async fn synthesize_stream(&self, _text: &str) -> Result<AudioStream> {
        let pieces: Vec<Result<Vec<u8>>> = vec![
            Ok(vec![0; CHUNK_SIZE]),
            Err(Error::Tts("connection reset".to_string())),
        ];
        Ok(futures::stream::iter(pieces).boxed())
    }
}

#[tokio::test]
async fn test_playback_stream_error_propagates() {
    let output = Arc::new(RecordingOutput::new());
    let playback = AudioPlayback::new(Arc::new(BrokenSynthesizer), output.clone());

    let result = playback.play("Hello.", &CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::Tts(_))));
    assert_eq!(output.chunks().len(), 1);
    assert!(!output.drained());
}

/// Output whose device stays full after the first chunk
#[derive(Default)]
struct BackloggedOutput {
    writes: Arc<AtomicUsize>,
}

impl AudioOutput for BackloggedOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(BackloggedSink {
            writes: Arc::clone(&self.writes),
        }))
    }
}

struct BackloggedSink {
    writes: Arc<AtomicUsize>,
}

#[async_trait]
impl AudioSink for BackloggedSink {
    async fn ready(&mut self, interrupt: &CancellationToken) -> Result<()> {
        if self.writes.load(Ordering::SeqCst) > 0 {
            interrupt.cancelled().await;
        }
        Ok(())
    }

    async fn write(&mut self, _chunk: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_reaches_a_full_device() {
    let output = Arc::new(BackloggedOutput::default());
    let playback = AudioPlayback::new(
        Arc::new(StubSynthesizer::new(4 * CHUNK_SIZE)),
        output.clone(),
    );
    let interrupt = CancellationToken::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            interrupt.cancel();
        });
    }

    let play = playback.play("Stop me.", &interrupt);
    let outcome = tokio::time::timeout(Duration::from_secs(1), play)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome, PlaybackOutcome::Interrupted { chunks: 1 });
    assert_eq!(output.writes.load(Ordering::SeqCst), 1);
}
