//! Per-connection supervisor
//!
//! Owns the WebSocket for its lifetime: demultiplexes inbound messages into
//! the aggregator and coordinator, runs the single writer task over the
//! bounded outbound queue, keeps the link alive, and tears everything down
//! on disconnect (retaining memory for the reconnect grace period).

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::memory::ConversationMemory;
use crate::pipeline::{self, CoordinatorSettings, PipelineHandle};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server::outbound::OutboundQueue;
use crate::server::ServerState;
use crate::session::{AggregatorEvent, SpeechAggregator};
use crate::types::ScreenImage;

pub async fn serve_connection(socket: WebSocket, state: ServerState, connection_id: String) {
    info!("{connection_id}: connected");

    let (ws_tx, ws_rx) = socket.split();
    let config = state.config.clone();
    let outbound = Arc::new(OutboundQueue::new(config.server.outbound_queue_depth));
    let shutdown = CancellationToken::new();

    let memory = state.registry.claim(&connection_id, || {
        ConversationMemory::new(state.clients.llm.clone(), config.memory.clone())
    });

    let pipeline = pipeline::spawn(
        connection_id.clone(),
        state.clients.clone(),
        memory,
        outbound.clone(),
        CoordinatorSettings::from_config(&config),
        shutdown.clone(),
    );

    let writer = tokio::spawn(write_loop(ws_tx, outbound.clone()));

    read_loop(ws_rx, &state, &connection_id, &outbound, &pipeline).await;

    // Teardown: cancel the in-flight job, drain the writer, keep memory
    // for the grace period.
    shutdown.cancel();
    outbound.close();
    let PipelineHandle { sessions, screen_replies, task } = pipeline;
    drop(sessions);
    drop(screen_replies);
    if let Err(e) = task.await {
        error!("{connection_id}: pipeline task panicked: {e}");
    }
    if let Err(e) = writer.await {
        error!("{connection_id}: writer task panicked: {e}");
    }
    state.registry.release(connection_id.clone());
    info!("{connection_id}: disconnected");
}

/// Single writer: the only task that touches the sink, preserving enqueue
/// order end to end.
async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, outbound: Arc<OutboundQueue>) {
    while let Some(event) = outbound.pop().await {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                error!("failed to serialize outbound event: {e}");
                continue;
            }
        };
        if ws_tx.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

/// What the keepalive timer wants done when its deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeepaliveAction {
    /// Send a heartbeat probe and keep waiting.
    Probe,
    /// The idle limit is reached; close the connection.
    Close,
}

/// Two-stage idle tracking: a probe after `heartbeat_after` without inbound
/// traffic, a close at `idle_close`. Pure over injected instants so the
/// transitions are testable without a socket.
struct KeepaliveTimer {
    heartbeat_after: Duration,
    idle_close: Duration,
    last_inbound: Instant,
    probe_sent: bool,
}

impl KeepaliveTimer {
    fn new(heartbeat_after: Duration, idle_close: Duration, now: Instant) -> Self {
        Self { heartbeat_after, idle_close, last_inbound: now, probe_sent: false }
    }

    /// When the read loop should wake if no inbound message arrives.
    fn deadline(&self) -> Instant {
        if self.probe_sent {
            self.last_inbound + self.idle_close
        } else {
            self.last_inbound + self.heartbeat_after
        }
    }

    fn on_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
        self.probe_sent = false;
    }

    fn on_deadline(&mut self, now: Instant) -> KeepaliveAction {
        if now.duration_since(self.last_inbound) >= self.idle_close {
            KeepaliveAction::Close
        } else {
            self.probe_sent = true;
            KeepaliveAction::Probe
        }
    }
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    state: &ServerState,
    connection_id: &str,
    outbound: &Arc<OutboundQueue>,
    pipeline: &PipelineHandle,
) {
    let config = &state.config;
    let mut aggregator = SpeechAggregator::new(connection_id, config.audio.clone());
    let mut keepalive = KeepaliveTimer::new(
        Duration::from_secs(config.server.heartbeat_after_s),
        Duration::from_secs(config.server.idle_close_s),
        Instant::now(),
    );
    let mut screen_sharing = false;

    loop {
        if outbound.is_closed() {
            // Backpressure teardown already queued its diagnostic.
            break;
        }

        let message = tokio::select! {
            _ = tokio::time::sleep_until(keepalive.deadline().into()) => {
                match keepalive.on_deadline(Instant::now()) {
                    KeepaliveAction::Close => {
                        warn!(
                            "{connection_id}: no inbound traffic for {:?}, closing",
                            keepalive.idle_close
                        );
                        break;
                    }
                    KeepaliveAction::Probe => {
                        debug!("{connection_id}: idle, sending heartbeat probe");
                        let _ = outbound.push(ServerMessage::Heartbeat);
                        continue;
                    }
                }
            }
            next = ws_rx.next() => next,
        };

        let message = match message {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                warn!("{connection_id}: read error: {e}");
                break;
            }
            None => break,
        };

        keepalive.on_inbound(Instant::now());

        match message {
            Message::Text(text) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => {
                        handle_message(msg, connection_id, &mut aggregator, outbound, pipeline, &mut screen_sharing)
                            .await
                    }
                    Err(e) => {
                        // Unknown or malformed types are ignored for forward
                        // compatibility.
                        warn!("{connection_id}: ignoring unparseable message: {e}");
                    }
                }
            }
            Message::Close(_) => {
                debug!("{connection_id}: close frame received");
                break;
            }
            Message::Binary(_) => {
                debug!("{connection_id}: binary frames not supported, ignored");
            }
            // Ping/pong handled by the transport layer.
            _ => {}
        }
    }

    aggregator.discard_open();
}

async fn handle_message(
    message: ClientMessage,
    connection_id: &str,
    aggregator: &mut SpeechAggregator,
    outbound: &Arc<OutboundQueue>,
    pipeline: &PipelineHandle,
    screen_sharing: &mut bool,
) {
    let now = Instant::now();
    match message {
        ClientMessage::AudioData { data, sample_rate, vad, screen_image, .. } => {
            let image = screen_image.as_deref().and_then(|raw| match ScreenImage::parse(raw) {
                Ok(img) => Some(img),
                Err(e) => {
                    warn!("{connection_id}: discarding malformed screen image: {e}");
                    None
                }
            });
            let events = aggregator.handle_audio(data, sample_rate, &vad, image, now);
            dispatch_events(events, connection_id, outbound, pipeline).await;
        }
        ClientMessage::VadState { vad, .. } => {
            let events = aggregator.handle_vad(&vad, now);
            dispatch_events(events, connection_id, outbound, pipeline).await;
        }
        ClientMessage::VoiceAssistantStart { .. } => {
            debug!("{connection_id}: voice assistant enabled");
            aggregator.set_enabled(true);
        }
        ClientMessage::VoiceAssistantStop { .. } => {
            debug!("{connection_id}: voice assistant disabled");
            aggregator.set_enabled(false);
        }
        ClientMessage::ScreenShareStart { .. } => {
            debug!("{connection_id}: screen share started");
            *screen_sharing = true;
        }
        ClientMessage::ScreenShareStop { .. } => {
            debug!("{connection_id}: screen share stopped");
            *screen_sharing = false;
        }
        ClientMessage::ScreenCaptureResponse { screen_image, .. } => {
            if !*screen_sharing {
                debug!("{connection_id}: screen capture reply without an active share");
            }
            match ScreenImage::parse(&screen_image) {
                Ok(image) => {
                    // try_send: a reply with no pending wait is stale.
                    if pipeline.screen_replies.try_send(image).is_err() {
                        debug!("{connection_id}: screen capture reply with no pending request");
                    }
                }
                Err(e) => warn!("{connection_id}: malformed screen capture reply: {e}"),
            }
        }
        ClientMessage::Heartbeat { .. } => {
            let _ = outbound.push(ServerMessage::HeartbeatAck);
        }
    }
}

/// Fan aggregator outputs out to the client and the coordinator. The
/// session handoff is the capacity-1 channel of the preemption contract;
/// the coordinator drains it even mid-job, so this await is short.
async fn dispatch_events(
    events: Vec<AggregatorEvent>,
    connection_id: &str,
    outbound: &Arc<OutboundQueue>,
    pipeline: &PipelineHandle,
) {
    for event in events {
        match event {
            AggregatorEvent::SpeechActive => {
                let _ = outbound.push(ServerMessage::SpeechActive);
            }
            AggregatorEvent::SpeechInactive => {
                let _ = outbound.push(ServerMessage::SpeechInactive);
            }
            AggregatorEvent::Completed(session) => {
                debug!(
                    "{connection_id}: handing session {} ({:.2}s) to the pipeline",
                    session.id,
                    session.duration_s()
                );
                if pipeline.sessions.send(session).await.is_err() {
                    warn!("{connection_id}: pipeline coordinator gone, session dropped");
                }
            }
        }
    }
}
