//! Speech-to-text HTTP adapter
//!
//! Posts one utterance of PCM16 audio to the transcription backend and
//! returns the transcript. Audio travels base64-encoded to keep the wire
//! format JSON end to end.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ModelsConfig, PipelineConfig};

use super::{
    encode_pcm16, map_status, map_transport_error, with_retry, ModelError, RetryPolicy,
    SpeechToText, Transcription,
};

pub struct HttpStt {
    client: reqwest::Client,
    url: String,
    deadline: Duration,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct SttRequest<'a> {
    /// Base64 little-endian PCM16.
    audio: &'a str,
    sample_rate: u32,
}

#[derive(Deserialize)]
struct SttResponse {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

impl HttpStt {
    pub fn new(models: &ModelsConfig, pipeline: &PipelineConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url: models.stt_url.clone(),
            deadline: pipeline.stt_deadline(),
            retry: RetryPolicy::default(),
        })
    }

    async fn attempt(&self, audio_b64: &str, sample_rate: u32) -> Result<SttResponse, ModelError> {
        let request = SttRequest { audio: audio_b64, sample_rate };
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
            .json::<SttResponse>()
            .await
            .map_err(|e| ModelError::Unavailable(format!("malformed STT response: {e}")))
    }
}

#[async_trait]
impl SpeechToText for HttpStt {
    async fn transcribe(
        &self,
        audio: Vec<f32>,
        sample_rate: u32,
        cancel: CancellationToken,
    ) -> Result<Transcription, ModelError> {
        if audio.is_empty() {
            return Err(ModelError::InvalidInput("empty audio buffer".into()));
        }
        if sample_rate == 0 {
            return Err(ModelError::InvalidInput("sample rate must be non-zero".into()));
        }

        let started = Instant::now();
        let audio_b64 = encode_pcm16(&audio);
        debug!(
            "transcribing {:.2}s of audio ({} samples)",
            audio.len() as f64 / sample_rate as f64,
            audio.len()
        );

        let response = with_retry("stt", &self.retry, &cancel, || {
            self.attempt(&audio_b64, sample_rate)
        })
        .await?;

        Ok(Transcription {
            text: response.text.trim().to_string(),
            confidence: response.confidence,
            processing_ms: started.elapsed().as_millis() as u64,
        })
    }
}
