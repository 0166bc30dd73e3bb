//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-frame voice-activity verdict supplied by the client's detector.
///
/// Field names follow the client's camelCase wire format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VadVerdict {
    #[serde(rename = "isSpeaking")]
    pub is_speaking: bool,
    #[serde(default)]
    pub energy: f32,
    #[serde(default)]
    pub confidence: f32,
}

impl VadVerdict {
    pub fn speech() -> Self {
        Self { is_speaking: true, energy: 0.5, confidence: 1.0 }
    }

    pub fn silence() -> Self {
        Self { is_speaking: false, energy: 0.0, confidence: 1.0 }
    }
}

/// A completed (user, assistant) exchange stored in conversation memory.
///
/// Turns are created on successful LLM response and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Monotonic per-connection sequence number, assigned at append time.
    pub seq: u64,
    pub user_text: String,
    pub assistant_text: String,
    /// One-line description of the screen context, when a capture was used.
    pub screen_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    /// Estimated token footprint of this turn (~4 chars per token).
    pub fn estimated_tokens(&self) -> usize {
        let chars = self.user_text.len()
            + self.assistant_text.len()
            + self.screen_summary.as_deref().map_or(0, str::len);
        chars.div_ceil(4)
    }
}

/// A maximal contiguous span of speech frames, delivered as one audio blob
/// to transcription.
#[derive(Debug, Clone)]
pub struct SpeechSession {
    /// Unique per connection, monotonically increasing.
    pub id: u64,
    pub connection_id: String,
    /// Mono f32 samples at `sample_rate`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub started_at: DateTime<Utc>,
    pub last_speech_at: DateTime<Utc>,
    /// Screen capture attached by the client at end of session, if any.
    pub screen_image: Option<ScreenImage>,
}

impl SpeechSession {
    /// Accumulated speech duration in seconds (sample-count based).
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// A validated screen capture, held as raw bytes plus the declared media type.
#[derive(Clone)]
pub struct ScreenImage {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl std::fmt::Debug for ScreenImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenImage")
            .field("media_type", &self.media_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ScreenImage {
    /// Parse a client-supplied image string: either a `data:` URI or bare
    /// base64. The payload must decode and carry a recognisable image header.
    pub fn parse(raw: &str) -> Result<Self, ScreenImageError> {
        let (media_type, payload) = match raw.strip_prefix("data:") {
            Some(rest) => {
                let (meta, data) = rest
                    .split_once(',')
                    .ok_or(ScreenImageError::MalformedDataUri)?;
                let media_type = meta
                    .split(';')
                    .next()
                    .filter(|m| !m.is_empty())
                    .unwrap_or("image/jpeg");
                (media_type.to_string(), data)
            }
            None => ("image/jpeg".to_string(), raw),
        };

        let bytes = BASE64
            .decode(payload.trim())
            .map_err(|_| ScreenImageError::InvalidBase64)?;
        if bytes.is_empty() {
            return Err(ScreenImageError::Empty);
        }
        image::guess_format(&bytes).map_err(|_| ScreenImageError::NotAnImage)?;

        Ok(Self { bytes, media_type })
    }

    /// Re-encode as a data URI for multimodal LLM payloads.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, BASE64.encode(&self.bytes))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScreenImageError {
    #[error("data URI missing comma separator")]
    MalformedDataUri,
    #[error("image payload is not valid base64")]
    InvalidBase64,
    #[error("image payload is empty")]
    Empty,
    #[error("payload does not look like an image")]
    NotAnImage,
}

/// Failure taxonomy for the whole core (kinds, not types).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Stage exceeded its deadline.
    Timeout,
    /// Adapter could not reach its backend.
    UpstreamUnavailable,
    /// Backend returned a hard refusal.
    UpstreamRejected,
    /// Input failed local validation.
    InvalidInput,
    /// STT returned empty text; the session is dropped silently.
    EmptyTranscription,
    /// Screen-capture round trip timed out or no share was active.
    ScreenUnavailable,
    /// Outbound queue overflow; the connection is closed.
    Backpressure,
    /// Invariant violation; the connection is closed after an error event.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::UpstreamRejected => "upstream_rejected",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::EmptyTranscription => "empty_transcription",
            ErrorKind::ScreenUnavailable => "screen_unavailable",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
