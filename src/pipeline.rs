//! Inference pipeline coordinator
//!
//! Drives STT → LLM → TTS for each completed speech session, emitting
//! progress and final events through the outbound queue. Enforces
//! at-most-one in-flight job per connection: a newer session cancels a job
//! that has not yet produced committed AI text, and queues (depth 1) behind
//! one that has. Slow inference never blocks the ingest path: the handoff
//! channel has capacity 1 and the coordinator drains it even mid-job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::memory::{ConversationMemory, MemorySnapshot};
use crate::models::{LlmReply, ModelClients, RespondRequest};
use crate::protocol::{EventErrorKind, ServerMessage};
use crate::server::outbound::OutboundQueue;
use crate::types::{ScreenImage, SpeechSession};

/// Coordinator knobs lifted out of the full config.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub voice_preset: String,
    pub screen_capture_wait: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            voice_preset: config.models.voice_preset.clone(),
            screen_capture_wait: config.pipeline.screen_capture_wait(),
        }
    }
}

/// Handles returned by [`spawn`]. `sessions` is the capacity-1 handoff from
/// the aggregator; `screen_replies` forwards `screen_capture_response`
/// messages to a pending wait.
pub struct PipelineHandle {
    pub sessions: mpsc::Sender<SpeechSession>,
    pub screen_replies: mpsc::Sender<ScreenImage>,
    pub task: JoinHandle<()>,
}

struct JobContext {
    connection_id: String,
    clients: ModelClients,
    memory: Arc<ConversationMemory>,
    outbound: Arc<OutboundQueue>,
    settings: CoordinatorSettings,
}

/// Start the coordinator task for one connection.
pub fn spawn(
    connection_id: String,
    clients: ModelClients,
    memory: Arc<ConversationMemory>,
    outbound: Arc<OutboundQueue>,
    settings: CoordinatorSettings,
    shutdown: CancellationToken,
) -> PipelineHandle {
    let (sessions_tx, sessions_rx) = mpsc::channel(1);
    let (screen_tx, screen_rx) = mpsc::channel(1);
    let ctx = JobContext { connection_id, clients, memory, outbound, settings };
    let task = tokio::spawn(run(ctx, sessions_rx, screen_rx, shutdown));
    PipelineHandle { sessions: sessions_tx, screen_replies: screen_tx, task }
}

async fn run(
    ctx: JobContext,
    mut sessions_rx: mpsc::Receiver<SpeechSession>,
    mut screen_rx: mpsc::Receiver<ScreenImage>,
    shutdown: CancellationToken,
) {
    let mut pending: Option<SpeechSession> = None;
    let mut input_closed = false;

    'outer: loop {
        let session = match pending.take() {
            Some(s) => s,
            None => {
                if input_closed {
                    break;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = sessions_rx.recv() => match next {
                        Some(s) => s,
                        None => break,
                    },
                }
            }
        };

        let cancel = shutdown.child_token();
        let committed = Arc::new(AtomicBool::new(false));
        debug!(
            "{}: starting pipeline job for session {} ({:.2}s of audio)",
            ctx.connection_id,
            session.id,
            session.duration_s()
        );
        let job = run_job(&ctx, &mut screen_rx, session, cancel.clone(), committed.clone());
        tokio::pin!(job);

        let mut queued: Option<SpeechSession> = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    cancel.cancel();
                    return;
                }
                _ = &mut job => break,
                next = sessions_rx.recv(), if !input_closed => {
                    match next {
                        None => input_closed = true,
                        Some(newer) => {
                            if committed.load(Ordering::SeqCst) {
                                // AI text is out; the job finishes its
                                // synthesis and the newer session waits.
                                if let Some(dropped) = queued.replace(newer) {
                                    warn!(
                                        "{}: utterance {} dropped, superseded while awaiting synthesis",
                                        ctx.connection_id, dropped.id
                                    );
                                    ctx.outbound.push_or_fail(ServerMessage::error(
                                        EventErrorKind::Internal,
                                        format!(
                                            "utterance {} dropped: superseded while a response was queued",
                                            dropped.id
                                        ),
                                    ));
                                }
                            } else {
                                info!(
                                    "{}: job preempted by newer session {}",
                                    ctx.connection_id, newer.id
                                );
                                cancel.cancel();
                                pending = Some(newer);
                                continue 'outer;
                            }
                        }
                    }
                }
            }
        }

        if pending.is_none() {
            pending = queued;
        }
    }

    debug!("{}: pipeline coordinator stopped", ctx.connection_id);
}

/// One utterance→response cycle. Every event this emits goes through the
/// outbound queue; a preempted job is dropped wholesale and emits nothing
/// further.
async fn run_job(
    ctx: &JobContext,
    screen_rx: &mut mpsc::Receiver<ScreenImage>,
    session: SpeechSession,
    cancel: CancellationToken,
    committed: Arc<AtomicBool>,
) {
    let session_hint = format!("{}/{}", ctx.connection_id, session.id);

    // ── STT ──────────────────────────────────────────────
    let transcription = match ctx
        .clients
        .stt
        .transcribe(session.samples.clone(), session.sample_rate, cancel.clone())
        .await
    {
        Ok(t) => t,
        Err(e) => {
            if cancel.is_cancelled() {
                debug!("{session_hint}: job cancelled during transcription");
                return;
            }
            warn!("{session_hint}: transcription failed: {e}");
            ctx.outbound.push_or_fail(ServerMessage::error(
                EventErrorKind::SttFailed,
                format!("transcription failed: {e}"),
            ));
            return;
        }
    };

    if transcription.text.is_empty() {
        // Noise or breath: drop the session without bothering the client.
        debug!("{session_hint}: empty transcription, session dropped");
        return;
    }

    ctx.outbound.push_or_fail(ServerMessage::TranscriptionResult {
        text: transcription.text.clone(),
        confidence: transcription.confidence,
        processing_time: transcription.processing_ms as f64 / 1000.0,
    });

    // ── LLM ──────────────────────────────────────────────
    let snapshot = ctx.memory.snapshot().await;
    let request = RespondRequest {
        user_text: transcription.text.clone(),
        memory: snapshot.clone(),
        screen_image: session.screen_image.clone(),
        session_hint: session_hint.clone(),
    };
    let reply = match ctx.clients.llm.respond(request, cancel.clone()).await {
        Ok(r) => r,
        Err(e) => {
            if cancel.is_cancelled() {
                debug!("{session_hint}: job cancelled during response generation");
                return;
            }
            warn!("{session_hint}: LLM failed: {e}");
            ctx.outbound.push_or_fail(ServerMessage::error(
                EventErrorKind::LlmFailed,
                format!("response generation failed: {e}"),
            ));
            return;
        }
    };

    let reply = if reply.needs_screen {
        match resolve_screen(ctx, screen_rx, &session, &snapshot, &transcription.text, &session_hint, reply, &cancel)
            .await
        {
            Some(r) => r,
            None => return,
        }
    } else {
        reply
    };

    ctx.outbound.push_or_fail(ServerMessage::AiResponse {
        text: reply.text.clone(),
        processing_time: reply.processing_ms as f64 / 1000.0,
    });
    committed.store(true, Ordering::SeqCst);

    // ── TTS ──────────────────────────────────────────────
    match ctx
        .clients
        .tts
        .synthesize(reply.text.clone(), ctx.settings.voice_preset.clone(), cancel.clone())
        .await
    {
        Ok(synthesis) => {
            ctx.outbound.push_or_fail(ServerMessage::AudioResponse {
                audio_data: synthesis.samples,
                sample_rate: synthesis.sample_rate,
                duration: synthesis.duration_s,
            });
        }
        Err(e) => {
            // The text answer stands; only the audio is missing.
            warn!("{session_hint}: synthesis failed: {e}");
            ctx.outbound.push_or_fail(ServerMessage::error(
                EventErrorKind::TtsFailed,
                format!("synthesis failed: {e}"),
            ));
        }
    }

    // The turn is committed once AI text exists, with or without audio.
    ctx.memory.append(transcription.text, reply.text, reply.screen_summary);
    info!("{session_hint}: pipeline complete");
}

/// The model asked for a current screen image. Sessions that already carried
/// one are re-invoked with it directly; otherwise the client is asked and
/// given a bounded window to answer.
#[allow(clippy::too_many_arguments)]
async fn resolve_screen(
    ctx: &JobContext,
    screen_rx: &mut mpsc::Receiver<ScreenImage>,
    session: &SpeechSession,
    snapshot: &MemorySnapshot,
    user_text: &str,
    session_hint: &str,
    initial: LlmReply,
    cancel: &CancellationToken,
) -> Option<LlmReply> {
    if let Some(image) = &session.screen_image {
        return reinvoke_with_image(ctx, snapshot, user_text, session_hint, image.clone(), initial, cancel)
            .await;
    }

    ctx.outbound.push_or_fail(ServerMessage::ScreenCaptureRequest {
        reason: initial
            .screen_reason
            .clone()
            .unwrap_or_else(|| "a current view of your screen is needed".to_string()),
        original_text: user_text.to_string(),
    });

    // Stale replies from an earlier request must not satisfy this one.
    while screen_rx.try_recv().is_ok() {}

    let image = tokio::select! {
        _ = cancel.cancelled() => None,
        reply = tokio::time::timeout(ctx.settings.screen_capture_wait, screen_rx.recv()) => {
            reply.ok().flatten()
        }
    };

    match image {
        Some(image) => {
            reinvoke_with_image(ctx, snapshot, user_text, session_hint, image, initial, cancel).await
        }
        None if !initial.text.is_empty() => {
            debug!("{session_hint}: screen capture unavailable, using initial reply");
            Some(initial)
        }
        None => {
            ctx.outbound.push_or_fail(ServerMessage::error(
                EventErrorKind::ScreenUnavailable,
                "screen capture request timed out",
            ));
            None
        }
    }
}

async fn reinvoke_with_image(
    ctx: &JobContext,
    snapshot: &MemorySnapshot,
    user_text: &str,
    session_hint: &str,
    image: ScreenImage,
    initial: LlmReply,
    cancel: &CancellationToken,
) -> Option<LlmReply> {
    let request = RespondRequest {
        user_text: user_text.to_string(),
        memory: snapshot.clone(),
        screen_image: Some(image),
        session_hint: session_hint.to_string(),
    };
    match ctx.clients.llm.respond(request, cancel.clone()).await {
        Ok(mut reply) => {
            // A second request for the screen is never honoured.
            reply.needs_screen = false;
            if reply.text.is_empty() && !initial.text.is_empty() {
                Some(initial)
            } else {
                Some(reply)
            }
        }
        Err(e) if !initial.text.is_empty() => {
            warn!("{session_hint}: re-invocation with screen failed, using initial reply: {e}");
            Some(initial)
        }
        Err(e) => {
            warn!("{session_hint}: re-invocation with screen failed: {e}");
            ctx.outbound.push_or_fail(ServerMessage::error(
                EventErrorKind::LlmFailed,
                format!("response generation failed: {e}"),
            ));
            None
        }
    }
}
