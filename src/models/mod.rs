//! External model clients
//!
//! Typed adapters wrapping the STT, LLM-with-vision, and TTS backends behind
//! one request/timeout/retry contract. Adapters are stateless values handed
//! to the supervisor at construction, so tests can substitute fakes.

pub mod llm;
pub mod stt;
pub mod tts;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::memory::MemorySnapshot;
use crate::types::{ConversationTurn, ErrorKind, ScreenImage};

pub use llm::HttpLlm;
pub use stt::HttpStt;
pub use tts::HttpTts;

/// Uniform failure contract across all three adapters. One policy table in
/// the coordinator handles every stage the same way.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("call exceeded its deadline")]
    Timeout,
    #[error("backend unreachable: {0}")]
    Unavailable(String),
    #[error("backend rejected the request: {0}")]
    Rejected(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::Timeout => ErrorKind::Timeout,
            ModelError::Unavailable(_) => ErrorKind::UpstreamUnavailable,
            ModelError::Rejected(_) => ErrorKind::UpstreamRejected,
            ModelError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Only transport-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Timeout | ModelError::Unavailable(_))
    }
}

/// Bounded retry with exponential backoff, applied inside every adapter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Run `call` under the retry policy. Cancellation (fired on preemption or
/// connection shutdown) surfaces promptly as `Timeout`, during the call and
/// during backoff sleeps alike.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, ModelError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ModelError>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ModelError::Timeout);
        }

        let result = tokio::select! {
            r = call() => r,
            _ = cancel.cancelled() => return Err(ModelError::Timeout),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{label} succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    "{label} attempt {attempt}/{} failed: {err}, retrying",
                    policy.max_attempts
                );
                let jitter = Duration::from_millis(rand::rng().random_range(0..100));
                let backoff = delay.saturating_add(jitter).min(policy.max_delay);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(ModelError::Timeout),
                }
                delay = delay.saturating_mul(2).min(policy.max_delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Successful transcription of one speech session.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub confidence: Option<f32>,
    pub processing_ms: u64,
}

/// One LLM invocation for a transcribed utterance.
#[derive(Debug)]
pub struct RespondRequest {
    pub user_text: String,
    pub memory: MemorySnapshot,
    pub screen_image: Option<ScreenImage>,
    /// Correlation hint (connection/session id) passed through to the backend.
    pub session_hint: String,
}

/// LLM reply, with the screen-capture sentinel already normalised out of the
/// text by the adapter.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub processing_ms: u64,
    /// One-line screen description when an image was attached.
    pub screen_summary: Option<String>,
    /// The model asked for a current screen image.
    pub needs_screen: bool,
    pub screen_reason: Option<String>,
}

/// Synthesised speech for one reply.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub duration_s: f64,
    pub processing_ms: u64,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        audio: Vec<f32>,
        sample_rate: u32,
        cancel: CancellationToken,
    ) -> Result<Transcription, ModelError>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn respond(
        &self,
        request: RespondRequest,
        cancel: CancellationToken,
    ) -> Result<LlmReply, ModelError>;

    /// Fold `turns` into `existing_summary`, returning the replacement
    /// summary. Participates in the same retry/timeout policy as `respond`.
    async fn summarise(
        &self,
        turns: Vec<ConversationTurn>,
        existing_summary: String,
        cancel: CancellationToken,
    ) -> Result<String, ModelError>;
}

#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    async fn synthesize(
        &self,
        text: String,
        voice: String,
        cancel: CancellationToken,
    ) -> Result<Synthesis, ModelError>;
}

/// The adapter bundle handed to the supervisor. Cheap to clone; shared across
/// connections (the underlying HTTP clients pool connections internally).
#[derive(Clone)]
pub struct ModelClients {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn SpeechSynthesis>,
}

impl ModelClients {
    /// Build the HTTP adapters from configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let models = &config.models;
        let pipeline = &config.pipeline;
        Ok(Self {
            stt: Arc::new(HttpStt::new(models, pipeline)?),
            llm: Arc::new(HttpLlm::new(models, pipeline)?),
            tts: Arc::new(HttpTts::new(models, pipeline)?),
        })
    }
}

/// Encode f32 samples as base64 little-endian PCM16 for the wire.
pub(crate) fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        bytes.extend_from_slice(&clamped.to_le_bytes());
    }
    BASE64.encode(&bytes)
}

/// Decode base64 little-endian PCM16 back to f32 samples.
pub(crate) fn decode_pcm16(data: &str) -> Result<Vec<f32>, ModelError> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|e| ModelError::InvalidInput(format!("bad base64 audio: {e}")))?;
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect())
}

/// Map a reqwest transport error onto the failure contract.
pub(crate) fn map_transport_error(err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout
    } else {
        ModelError::Unavailable(err.to_string())
    }
}

/// Map a non-success HTTP status onto the failure contract.
pub(crate) fn map_status(status: reqwest::StatusCode, body: &str) -> ModelError {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    if status == reqwest::StatusCode::BAD_REQUEST {
        ModelError::InvalidInput(detail)
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ModelError::Unavailable(detail)
    } else {
        ModelError::Rejected(detail)
    }
}
