//! Wire protocol for the `/ws` endpoint
//!
//! Text-framed JSON in both directions, tagged by `type`. Inbound messages
//! carry a client-clock `timestamp` in milliseconds since epoch.

use serde::{Deserialize, Serialize};

use crate::types::VadVerdict;

fn default_sample_rate() -> u32 {
    16000
}

/// Client → server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Speech frame. May also carry a pre-accumulated whole utterance
    /// (`isSpeaking=false` with a non-empty buffer).
    #[serde(rename = "audio_data")]
    AudioData {
        data: Vec<f32>,
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        vad: VadVerdict,
        /// Data URI / base64 JPEG attached at end of utterance.
        #[serde(default)]
        screen_image: Option<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// Silence-only signal (no samples).
    #[serde(rename = "vad_state")]
    VadState {
        vad: VadVerdict,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename = "voice_assistant_start")]
    VoiceAssistantStart {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename = "voice_assistant_stop")]
    VoiceAssistantStop {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename = "screen_share_start")]
    ScreenShareStart {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename = "screen_share_stop")]
    ScreenShareStop {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// Reply to a `screen_capture_request`.
    #[serde(rename = "screen_capture_response")]
    ScreenCaptureResponse {
        screen_image: String,
        #[serde(default)]
        request_data: Option<serde_json::Value>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// Error kinds surfaced to the client in `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventErrorKind {
    SttFailed,
    LlmFailed,
    TtsFailed,
    ScreenUnavailable,
    Backpressure,
    Internal,
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First `isSpeaking=true` frame after idle.
    #[serde(rename = "speech_active")]
    SpeechActive,
    /// Rate-limited notice that only silence is arriving.
    #[serde(rename = "speech_inactive")]
    SpeechInactive,
    #[serde(rename = "transcription_result")]
    TranscriptionResult {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        /// Seconds spent in the STT stage.
        processing_time: f64,
    },
    #[serde(rename = "ai_response")]
    AiResponse {
        text: String,
        processing_time: f64,
    },
    #[serde(rename = "audio_response")]
    AudioResponse {
        audio_data: Vec<f32>,
        sample_rate: u32,
        /// Playback duration in seconds.
        duration: f64,
    },
    #[serde(rename = "screen_capture_request")]
    ScreenCaptureRequest {
        reason: String,
        original_text: String,
    },
    #[serde(rename = "error")]
    Error {
        kind: EventErrorKind,
        message: String,
    },
    /// Server keepalive probe.
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck,
}

impl ServerMessage {
    /// Critical events survive outbound-queue pressure; progress and
    /// keepalive chatter may be dropped first.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ServerMessage::TranscriptionResult { .. }
                | ServerMessage::AiResponse { .. }
                | ServerMessage::AudioResponse { .. }
                | ServerMessage::ScreenCaptureRequest { .. }
                | ServerMessage::Error { .. }
        )
    }

    pub fn error(kind: EventErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error { kind, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_data_parse() {
        let m: ClientMessage = serde_json::from_str(
            r#"{"type":"audio_data","data":[0.0,0.1],"sample_rate":16000,
                "vad":{"isSpeaking":true,"energy":0.5,"confidence":0.9},
                "timestamp":1700000000000}"#,
        )
        .unwrap();
        match m {
            ClientMessage::AudioData { data, sample_rate, vad, screen_image, .. } => {
                assert_eq!(data.len(), 2);
                assert_eq!(sample_rate, 16000);
                assert!(vad.is_speaking);
                assert!(screen_image.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_sample_rate_defaults() {
        let m: ClientMessage = serde_json::from_str(
            r#"{"type":"audio_data","data":[],"vad":{"isSpeaking":false}}"#,
        )
        .unwrap();
        match m {
            ClientMessage::AudioData { sample_rate, .. } => assert_eq!(sample_rate, 16000),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let r = serde_json::from_str::<ClientMessage>(r#"{"type":"jazz_hands"}"#);
        assert!(r.is_err());
    }

    #[test]
    fn test_error_kind_wire_names() {
        let msg = ServerMessage::error(EventErrorKind::SttFailed, "boom");
        let s = serde_json::to_string(&msg).unwrap();
        assert!(s.contains(r#""kind":"stt_failed""#));
        assert!(s.contains(r#""type":"error""#));
    }

    #[test]
    fn test_criticality_split() {
        assert!(ServerMessage::error(EventErrorKind::Internal, "x").is_critical());
        assert!(ServerMessage::ScreenCaptureRequest {
            reason: "r".into(),
            original_text: "t".into()
        }
        .is_critical());
        assert!(!ServerMessage::SpeechActive.is_critical());
        assert!(!ServerMessage::HeartbeatAck.is_critical());
    }

    #[test]
    fn test_transcription_confidence_omitted_when_none() {
        let msg = ServerMessage::TranscriptionResult {
            text: "hi".into(),
            confidence: None,
            processing_time: 0.2,
        };
        let s = serde_json::to_string(&msg).unwrap();
        assert!(!s.contains("confidence"));
    }
}
