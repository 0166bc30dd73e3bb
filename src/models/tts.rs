//! Text-to-speech HTTP adapter
//!
//! Posts reply text to the synthesis backend and decodes the returned PCM16
//! payload into f32 samples for the `audio_response` event.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ModelsConfig, PipelineConfig};

use super::{
    decode_pcm16, map_status, map_transport_error, with_retry, ModelError, RetryPolicy,
    SpeechSynthesis, Synthesis,
};

pub struct HttpTts {
    client: reqwest::Client,
    url: String,
    deadline: Duration,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice: &'a str,
}

#[derive(Deserialize)]
struct TtsResponse {
    /// Base64 little-endian PCM16.
    audio: String,
    sample_rate: u32,
}

impl HttpTts {
    pub fn new(models: &ModelsConfig, pipeline: &PipelineConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url: models.tts_url.clone(),
            deadline: pipeline.tts_deadline(),
            retry: RetryPolicy::default(),
        })
    }

    async fn attempt(&self, text: &str, voice: &str) -> Result<TtsResponse, ModelError> {
        let request = TtsRequest { text, voice };
        let send = self.client.post(&self.url).json(&request).send();

        let response = tokio::time::timeout(self.deadline, send)
            .await
            .map_err(|_| ModelError::Timeout)?
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        response
            .json::<TtsResponse>()
            .await
            .map_err(|e| ModelError::Unavailable(format!("malformed TTS response: {e}")))
    }
}

#[async_trait]
impl SpeechSynthesis for HttpTts {
    async fn synthesize(
        &self,
        text: String,
        voice: String,
        cancel: CancellationToken,
    ) -> Result<Synthesis, ModelError> {
        if text.trim().is_empty() {
            return Err(ModelError::InvalidInput("empty synthesis text".into()));
        }

        let started = Instant::now();
        let response =
            with_retry("tts", &self.retry, &cancel, || self.attempt(&text, &voice)).await?;

        if response.sample_rate == 0 {
            return Err(ModelError::Unavailable("TTS returned zero sample rate".into()));
        }

        let samples = decode_pcm16(&response.audio)?;
        let duration_s = samples.len() as f64 / response.sample_rate as f64;
        debug!("synthesized {:.2}s of audio for {} chars", duration_s, text.len());

        Ok(Synthesis {
            samples,
            sample_rate: response.sample_rate,
            duration_s,
            processing_ms: started.elapsed().as_millis() as u64,
        })
    }
}
