//! Voice processing module
//!
//! Handles audio capture, transcription, synthesis, and playback.

mod capture;
mod playback;
mod stt;
mod tts;

pub use capture::{
    FRAME_SIZE, Frame, FrameSource, MicrophoneRecorder, RECORDING_FILE, Recorder, SAMPLE_RATE,
    record_frames, to_pcm16, write_wav,
};
pub use playback::{
    AudioOutput, AudioPlayback, AudioSink, CHUNK_SIZE, PLAYBACK_SAMPLE_RATE, PlaybackOutcome,
    Rechunker, SpeakerOutput,
};
pub use stt::{OpenAiTranscriber, Transcriber};
pub use tts::{AudioStream, OpenAiSynthesizer, SpeechSynthesizer};
