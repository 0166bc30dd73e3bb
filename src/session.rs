//! Speech session aggregator
//!
//! State machine over a connection's audio stream. Consumes per-frame
//! samples and VAD verdicts, emits at most one completed utterance per
//! natural utterance. Pure over an injected clock so the transition table
//! is unit-testable without a transport.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use crate::config::AudioConfig;
use crate::types::{ScreenImage, SpeechSession, VadVerdict};

/// At most one silence notice per this interval while idle.
const INACTIVE_NOTICE_INTERVAL: Duration = Duration::from_secs(2);

/// After this much continuous silence, notices stop until the next speech.
const INACTIVE_SUPPRESS_AFTER: Duration = Duration::from_secs(5);

/// Outputs of one aggregator step, in emission order.
#[derive(Debug)]
pub enum AggregatorEvent {
    /// First speech frame after idle.
    SpeechActive,
    /// Rate-limited notice that only silence is arriving.
    SpeechInactive,
    /// A session closed with enough speech to transcribe.
    Completed(SpeechSession),
}

struct OpenCapture {
    id: u64,
    samples: Vec<f32>,
    started_at: chrono::DateTime<Utc>,
    last_speech_at: chrono::DateTime<Utc>,
    screen_image: Option<ScreenImage>,
}

pub struct SpeechAggregator {
    connection_id: String,
    config: AudioConfig,
    enabled: bool,
    open: Option<OpenCapture>,
    next_session_id: u64,
    silence_since: Option<Instant>,
    last_inactive_notice: Option<Instant>,
}

impl SpeechAggregator {
    pub fn new(connection_id: impl Into<String>, config: AudioConfig) -> Self {
        Self {
            connection_id: connection_id.into(),
            config,
            enabled: true,
            open: None,
            next_session_id: 0,
            silence_since: None,
            last_inactive_notice: None,
        }
    }

    /// Gate ingest (`voice_assistant_start` / `voice_assistant_stop`).
    /// Disabling discards any open capture.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled && self.open.take().is_some() {
            debug!("{}: ingest disabled, open capture discarded", self.connection_id);
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_open_session(&self) -> bool {
        self.open.is_some()
    }

    /// One `audio_data` frame.
    pub fn handle_audio(
        &mut self,
        samples: Vec<f32>,
        sample_rate: u32,
        vad: &VadVerdict,
        screen_image: Option<ScreenImage>,
        now: Instant,
    ) -> Vec<AggregatorEvent> {
        if !self.enabled {
            return Vec::new();
        }

        let samples = match self.normalize_rate(samples, sample_rate) {
            Some(s) => s,
            None => return Vec::new(),
        };

        if vad.is_speaking {
            self.on_speech(samples, screen_image, now)
        } else if !samples.is_empty() {
            // Client-side VAD delivered a whole utterance in one frame.
            self.on_whole_utterance(samples, screen_image, now)
        } else {
            if let (Some(open), Some(image)) = (self.open.as_mut(), screen_image) {
                open.screen_image = Some(image);
            }
            self.on_silence(now)
        }
    }

    /// One `vad_state` message (silence-only signal).
    pub fn handle_vad(&mut self, vad: &VadVerdict, now: Instant) -> Vec<AggregatorEvent> {
        if !self.enabled || vad.is_speaking {
            return Vec::new();
        }
        self.on_silence(now)
    }

    /// Connection teardown: any open capture is discarded.
    pub fn discard_open(&mut self) {
        if self.open.take().is_some() {
            debug!("{}: open capture discarded on shutdown", self.connection_id);
        }
    }

    fn on_speech(
        &mut self,
        samples: Vec<f32>,
        screen_image: Option<ScreenImage>,
        now: Instant,
    ) -> Vec<AggregatorEvent> {
        self.silence_since = None;
        self.last_inactive_notice = None;

        let mut events = Vec::new();
        if self.open.is_none() {
            self.open = Some(self.new_capture());
            events.push(AggregatorEvent::SpeechActive);
        }

        let max_samples = self.max_samples();
        let mut remainder: Option<Vec<f32>> = None;
        {
            let open = self.open.as_mut().expect("capture opened above");
            open.last_speech_at = Utc::now();
            if let Some(image) = screen_image {
                open.screen_image = Some(image);
            }

            let space = max_samples.saturating_sub(open.samples.len());
            if samples.len() > space {
                open.samples.extend_from_slice(&samples[..space]);
                let rest = samples[space..].to_vec();
                if !rest.is_empty() {
                    remainder = Some(rest);
                }
            } else {
                open.samples.extend_from_slice(&samples);
            }
        }

        // Forced closure at the maximum duration; trailing samples from the
        // same frame seed the next session.
        if self.open.as_ref().is_some_and(|o| o.samples.len() >= max_samples) {
            let capture = self.open.take().expect("checked above");
            events.push(AggregatorEvent::Completed(self.finish(capture)));

            if let Some(rest) = remainder {
                let mut next = self.new_capture();
                next.samples = rest;
                self.open = Some(next);
            }
        }

        events
    }

    fn on_silence(&mut self, now: Instant) -> Vec<AggregatorEvent> {
        match self.open.take() {
            Some(capture) => {
                self.silence_since = Some(now);
                let duration = self.duration_of(&capture.samples);
                if duration >= self.config.min_speech_duration_s {
                    vec![AggregatorEvent::Completed(self.finish(capture))]
                } else {
                    debug!(
                        "{}: capture of {:.2}s below minimum, discarded",
                        self.connection_id, duration
                    );
                    Vec::new()
                }
            }
            None => self.maybe_inactive_notice(now),
        }
    }

    /// Atomic completion of a client-accumulated utterance: min bound
    /// discards, max bound truncates.
    fn on_whole_utterance(
        &mut self,
        mut samples: Vec<f32>,
        screen_image: Option<ScreenImage>,
        now: Instant,
    ) -> Vec<AggregatorEvent> {
        // An open server-side capture closes under the normal silence rules
        // before the delivered utterance is considered.
        let mut events = self.on_silence(now);

        let duration = self.duration_of(&samples);
        if duration < self.config.min_speech_duration_s {
            debug!(
                "{}: delivered utterance of {:.2}s below minimum, discarded",
                self.connection_id, duration
            );
            return events;
        }
        samples.truncate(self.max_samples());

        let mut capture = self.new_capture();
        capture.samples = samples;
        capture.screen_image = screen_image;
        events.push(AggregatorEvent::Completed(self.finish(capture)));
        events
    }

    fn maybe_inactive_notice(&mut self, now: Instant) -> Vec<AggregatorEvent> {
        let since = *self.silence_since.get_or_insert(now);
        if now.duration_since(since) >= INACTIVE_SUPPRESS_AFTER {
            return Vec::new();
        }
        let due = self
            .last_inactive_notice
            .map_or(true, |last| now.duration_since(last) >= INACTIVE_NOTICE_INTERVAL);
        if due {
            self.last_inactive_notice = Some(now);
            vec![AggregatorEvent::SpeechInactive]
        } else {
            Vec::new()
        }
    }

    fn new_capture(&mut self) -> OpenCapture {
        self.next_session_id += 1;
        let now = Utc::now();
        OpenCapture {
            id: self.next_session_id,
            samples: Vec::new(),
            started_at: now,
            last_speech_at: now,
            screen_image: None,
        }
    }

    fn finish(&self, capture: OpenCapture) -> SpeechSession {
        SpeechSession {
            id: capture.id,
            connection_id: self.connection_id.clone(),
            samples: capture.samples,
            sample_rate: self.config.sample_rate,
            started_at: capture.started_at,
            last_speech_at: capture.last_speech_at,
            screen_image: capture.screen_image,
        }
    }

    fn duration_of(&self, samples: &[f32]) -> f64 {
        samples.len() as f64 / self.config.sample_rate as f64
    }

    fn max_samples(&self) -> usize {
        (self.config.max_speech_duration_s * self.config.sample_rate as f64) as usize
    }

    fn normalize_rate(&self, samples: Vec<f32>, sample_rate: u32) -> Option<Vec<f32>> {
        if sample_rate == self.config.sample_rate {
            return Some(samples);
        }
        if sample_rate == 0 || self.config.reject_foreign_rates {
            debug!(
                "{}: rejecting frame at {}Hz (canonical {}Hz)",
                self.connection_id, sample_rate, self.config.sample_rate
            );
            return None;
        }
        Some(resample_linear(&samples, sample_rate, self.config.sample_rate))
    }
}

/// Linear-interpolation resampler. Good enough for mono speech on its way
/// to transcription.
fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if samples.is_empty() || from == to {
        return samples.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples.get(idx + 1).copied().unwrap_or(a);
        out.push(a + (b - a) * frac);
    }
    out
}
