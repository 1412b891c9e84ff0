//! Text-to-speech (TTS) processing
//!
//! Synthesis is streamed: the reply's raw PCM arrives in network-sized
//! pieces and playback can start before the last piece is received.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::{Error, Result};

/// Stream of raw audio bytes (24 kHz mono s16le PCM)
pub type AudioStream = BoxStream<'static, Result<Vec<u8>>>;

/// Turns reply text into streamed audio
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// # Errors
    ///
    /// Returns error if the synthesis request cannot be started
    async fn synthesize_stream(&self, text: &str) -> Result<AudioStream>;
}

#[derive(serde::Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
}

/// OpenAI-compatible `/audio/speech` client
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    voice: String,
    instructions: Option<String>,
}

impl OpenAiSynthesizer {
    /// Create a new synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(
        api_base: &str,
        api_key: &str,
        model: &str,
        voice: &str,
        instructions: Option<String>,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            voice: voice.to_string(),
            instructions,
        })
    }

    fn request<'a>(&'a self, text: &'a str) -> SpeechRequest<'a> {
        SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: "pcm",
            instructions: self.instructions.as_deref(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSynthesizer {
    async fn synthesize_stream(&self, text: &str) -> Result<AudioStream> {
        tracing::debug!(chars = text.len(), voice = %self.voice, "starting speech synthesis");

        let response = self
            .client
            .post(format!("{}/audio/speech", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&self.request(text))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("TTS API error {status}: {body}")));
        }

        Ok(response
            .bytes_stream()
            .map(|piece| piece.map(|b| b.to_vec()).map_err(Error::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_asks_for_raw_pcm() {
        let tts = OpenAiSynthesizer::new(
            "https://api.openai.com/v1/",
            "sk-test",
            "gpt-4o-mini-tts",
            "alloy",
            Some("Speak calmly.".to_string()),
        )
        .unwrap();

        let body = serde_json::to_value(tts.request("hello")).unwrap();
        assert_eq!(body["response_format"], "pcm");
        assert_eq!(body["instructions"], "Speak calmly.");
        assert_eq!(body["input"], "hello");
        assert_eq!(tts.api_base, "https://api.openai.com/v1");
    }

    #[test]
    fn instructions_are_optional() {
        let tts = OpenAiSynthesizer::new("http://x", "sk-test", "m", "alloy", None).unwrap();
        let body = serde_json::to_value(tts.request("hi")).unwrap();
        assert!(body.get("instructions").is_none());
    }
}
