//! Audio capture from microphone

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Sample rate for audio capture
pub const SAMPLE_RATE: u32 = 44100;

/// Samples per read: a tenth of a second
pub const FRAME_SIZE: usize = (SAMPLE_RATE / 10) as usize;

/// File name of the recording inside the scratch directory
pub const RECORDING_FILE: &str = "user.wav";

/// Callback buffers held between the audio thread and the reader
const CHANNEL_CAPACITY: usize = 64;

/// One read from an input stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub samples: Vec<i16>,
    /// Device data was dropped before this frame
    pub overflowed: bool,
}

/// Blocking source of fixed-size audio frames
pub trait FrameSource {
    /// Read up to `n` mono samples
    ///
    /// # Errors
    ///
    /// Returns error if the stream fails or stalls
    fn read_frame(&mut self, n: usize) -> Result<Frame>;
}

/// Records one utterance
///
/// `record` blocks until `stop` is cancelled and must run on a blocking
/// worker.
pub trait Recorder: Send + Sync {
    /// Record until `stop` is cancelled; `None` if nothing usable was captured
    fn record(&self, stop: CancellationToken) -> Option<PathBuf>;
}

/// Read frames from `source` until `stop` is cancelled and save them as WAV
///
/// Overflow is logged and ignored. Any read error abandons the recording.
/// Returns `None` when no frame was captured.
pub fn record_frames<S: FrameSource + ?Sized>(
    source: &mut S,
    stop: &CancellationToken,
    frame_size: usize,
    sample_rate: u32,
    path: &Path,
) -> Option<PathBuf> {
    let mut samples = Vec::new();
    let mut frames = 0usize;

    while !stop.is_cancelled() {
        match source.read_frame(frame_size) {
            Ok(frame) => {
                if frame.overflowed {
                    tracing::warn!("audio input overflow, samples dropped");
                }
                if !frame.samples.is_empty() {
                    samples.extend_from_slice(&frame.samples);
                    frames += 1;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "audio capture failed");
                return None;
            }
        }
    }

    if frames == 0 {
        tracing::warn!("no audio captured");
        return None;
    }

    match write_wav(&samples, sample_rate, path) {
        Ok(()) => {
            tracing::info!(
                path = %path.display(),
                frames,
                samples = samples.len(),
                "audio saved"
            );
            Some(path.to_path_buf())
        }
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "failed to save recording");
            None
        }
    }
}

/// Write mono 16-bit PCM samples as a WAV file
///
/// # Errors
///
/// Returns error if the file cannot be created or encoded
pub fn write_wav(samples: &[i16], sample_rate: u32, path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| Error::Audio(e.to_string()))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| Error::Audio(e.to_string()))?;
    }
    writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(())
}

/// Convert an f32 sample in [-1.0, 1.0] to i16
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn to_pcm16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Frames fed by a cpal input stream callback
struct StreamFrames {
    rx: Receiver<Vec<i16>>,
    overflowed: Arc<AtomicBool>,
    pending: Vec<i16>,
    stall_timeout: Duration,
}

impl FrameSource for StreamFrames {
    fn read_frame(&mut self, n: usize) -> Result<Frame> {
        while self.pending.len() < n {
            match self.rx.recv_timeout(self.stall_timeout) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::Audio("input stream stalled".to_string()));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Audio("input stream closed".to_string()));
                }
            }
        }

        let rest = self.pending.split_off(n);
        Ok(Frame {
            samples: std::mem::replace(&mut self.pending, rest),
            overflowed: self.overflowed.swap(false, Ordering::Relaxed),
        })
    }
}

/// Records from the default input device into `<scratch>/user.wav`
pub struct MicrophoneRecorder {
    output: PathBuf,
}

impl MicrophoneRecorder {
    #[must_use]
    pub fn new(scratch_dir: &Path) -> Self {
        Self {
            output: scratch_dir.join(RECORDING_FILE),
        }
    }

    fn input_config(device: &cpal::Device) -> Result<StreamConfig> {
        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
                && c.sample_format() == cpal::SampleFormat::F32
        };

        let supported = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| c.channels() == 1 && supports_rate(c))
            .or_else(|| {
                // Fallback: any channel count, downmixed in the callback
                device
                    .supported_input_configs()
                    .ok()?
                    .find(|c| supports_rate(c))
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        Ok(supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config())
    }

    fn open(&self) -> Result<(cpal::Stream, StreamFrames)> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
        let config = Self::input_config(&device)?;
        let channels = usize::from(config.channels.max(1));

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels,
            "audio capture initialized"
        );

        let (tx, rx) = mpsc::sync_channel::<Vec<i16>>(CHANNEL_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));
        let overflow_flag = Arc::clone(&overflowed);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    #[allow(clippy::cast_precision_loss)]
                    let mono: Vec<i16> = data
                        .chunks(channels)
                        .map(|frame| to_pcm16(frame.iter().sum::<f32>() / frame.len() as f32))
                        .collect();
                    if let Err(TrySendError::Full(_)) = tx.try_send(mono) {
                        overflow_flag.store(true, Ordering::Relaxed);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let frames = StreamFrames {
            rx,
            overflowed,
            pending: Vec::with_capacity(FRAME_SIZE * 2),
            stall_timeout: Duration::from_secs(2),
        };
        Ok((stream, frames))
    }
}

impl Recorder for MicrophoneRecorder {
    fn record(&self, stop: CancellationToken) -> Option<PathBuf> {
        // The stream is not Send; it lives and dies on this worker thread
        let (stream, mut frames) = match self.open() {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!(error = %e, "failed to open input stream");
                return None;
            }
        };

        tracing::debug!("audio capture started");
        let recording = record_frames(&mut frames, &stop, FRAME_SIZE, SAMPLE_RATE, &self.output);
        drop(stream);
        tracing::debug!("audio capture stopped");
        recording
    }
}
