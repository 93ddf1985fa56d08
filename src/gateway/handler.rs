//! Per-connection WebSocket lifecycle.
//!
//! Each accepted connection runs three tasks: the frame loop (this
//! handler) reading and gating client frames, a sender task draining the
//! outbound queue, and a pump task that owns the realtime session and the
//! FSM. All call-state mutation happens inside the pump, so the session
//! needs no locking; the frame loop talks to it over channels.
//!
//! Barge-in flushes queued synthesized audio by bumping a generation
//! counter: the sender drops droppable (tts_audio) messages from older
//! generations instead of writing them to the socket.

use crate::audio::{self, JitterTracker};
use crate::config::GatewayConfig;
use crate::events::{AuthFrame, ClientEvent, ConnectedConfig, ServerEvent};
use crate::fsm::{CallContext, CallFsm, CallFsmEvent, CallState, FsmAction, TurnMetrics};
use crate::gateway::GatewayState;
use crate::gateway::admission::AdmissionDecision;
use crate::gateway::audio_queue::{BoundedAudioQueue, PushOutcome};
use crate::gateway::limits::{FrameGates, GateVerdict};
use crate::metrics;
use crate::rl::{SelectionContext, feedback};
use crate::security::phone;
use crate::session::{RealtimeSession, SessionErrorKind, SessionEvent};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CLOSE_POLICY: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;
const MAX_CALL_ID_LEN: usize = 100;

/// Query parameters on the stream endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    /// Raw caller line; hashed immediately, never logged.
    pub cli: Option<String>,
    /// Skill/profile hint for policy context.
    pub skill: Option<String>,
}

/// HTTP entry point: admission gates, then the WebSocket upgrade.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    Query(query): Query<StreamQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> Response {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    match state.admission.check(addr.ip(), origin) {
        AdmissionDecision::Allow => {}
        AdmissionDecision::DenyPolicy(gate) => {
            warn!("connection from {addr} rejected by {gate} allowlist");
            metrics::http_response(403);
            return StatusCode::FORBIDDEN.into_response();
        }
        AdmissionDecision::DenyRate => {
            warn!("connection rate exceeded for {}", addr.ip());
            metrics::http_response(429);
            metrics::rate_limit_hit("conn_per_min");
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
    }

    if call_id.is_empty() || call_id.len() > MAX_CALL_ID_LEN {
        metrics::http_response(400);
        return StatusCode::BAD_REQUEST.into_response();
    }

    metrics::http_response(101);
    ws.protocols(["realtime-v1"])
        .on_upgrade(move |socket| handle_connection(socket, state, call_id, query))
}

/// One serialized outbound message plus its flush metadata.
struct Outbound {
    message: Message,
    /// Synthesized audio may be dropped by a barge-in flush.
    droppable: bool,
    generation: u64,
}

/// Handle to the outbound queue shared by frame loop and pump.
#[derive(Clone)]
struct OutboundSender {
    tx: mpsc::UnboundedSender<Outbound>,
    flush_gen: Arc<AtomicU64>,
}

impl OutboundSender {
    fn event(&self, event: &ServerEvent) {
        let _ = self.tx.send(Outbound {
            message: Message::Text(event.to_json().into()),
            droppable: false,
            generation: 0,
        });
    }

    fn droppable_event(&self, event: &ServerEvent) {
        let _ = self.tx.send(Outbound {
            message: Message::Text(event.to_json().into()),
            droppable: true,
            generation: self.flush_gen.load(Ordering::SeqCst),
        });
    }

    /// Invalidate all queued droppable messages.
    fn flush_droppable(&self) {
        self.flush_gen.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self, code: u16, reason: &'static str) {
        let _ = self.tx.send(Outbound {
            message: Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
            droppable: false,
            generation: 0,
        });
    }

    fn close_normal(&self) {
        let _ = self.tx.send(Outbound {
            message: Message::Close(None),
            droppable: false,
            generation: 0,
        });
    }
}

async fn run_sender(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    flush_gen: Arc<AtomicU64>,
) {
    while let Some(out) = rx.recv().await {
        if out.droppable && out.generation < flush_gen.load(Ordering::SeqCst) {
            continue;
        }
        let is_close = matches!(out.message, Message::Close(_));
        if ws_tx.send(out.message).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
}

/// Commands from the frame loop to the pump.
enum PumpCommand {
    /// Frames are waiting in the audio queue.
    AudioReady,
    BargeIn,
    /// Client asked to end the call.
    Stop,
    /// Socket closed or idled out.
    ClientGone,
}

async fn handle_connection(
    socket: WebSocket,
    state: GatewayState,
    call_id: String,
    query: StreamQuery,
) {
    let config = Arc::clone(&state.config);
    let conn_id = uuid::Uuid::new_v4();
    info!(%call_id, %conn_id, "client connected");
    let (ws_tx, mut ws_rx) = socket.split();

    let flush_gen = Arc::new(AtomicU64::new(0));
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
    let out = OutboundSender {
        tx: out_tx,
        flush_gen: Arc::clone(&flush_gen),
    };
    let sender_handle = tokio::spawn(run_sender(ws_tx, out_rx, Arc::clone(&flush_gen)));

    // -- Authentication --------------------------------------------------
    if !config.auth.dev_allow_no_jwt
        && !authenticate(&state, &config, &mut ws_rx, &out, &call_id).await
    {
        let _ = sender_handle.await;
        return;
    }

    // -- Caller line -----------------------------------------------------
    let cli_hash = query.cli.as_deref().and_then(|raw| {
        match phone::hash_phone_number(raw, &config.phone) {
            Ok(hash) => {
                if let Ok(masked) = phone::mask_number(raw, &config.phone.default_country_code) {
                    debug!(%call_id, cli = %masked, "caller line attached");
                }
                Some(hash.value)
            }
            Err(e) => {
                warn!(%call_id, "caller line unusable: {e}");
                None
            }
        }
    });

    // -- Session bring-up ------------------------------------------------
    let profile = query.skill.clone().unwrap_or_else(|| "general".to_owned());
    let context = CallContext::new(profile.clone());
    let selection = SelectionContext {
        profile: profile.clone(),
        time_of_day: context.time_of_day.to_owned(),
    };
    let variant = state
        .policy
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .select(Some(&selection));

    if let Err(e) = state.registry.insert(&call_id, &variant, cli_hash) {
        warn!(%call_id, "admission refused: {e}");
        out.event(&ServerEvent::Error {
            message: "call already active".to_owned(),
        });
        out.close(CLOSE_POLICY, "duplicate call_id");
        let _ = sender_handle.await;
        return;
    }
    info!(%call_id, %variant, "session admitted");

    let fsm = CallFsm::new(call_id.clone(), variant, context);
    let session = (state.sessions)(&call_id);

    let audio_queue = Arc::new(BoundedAudioQueue::new(config.limits.max_audio_buffer_frames));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<PumpCommand>();

    let pump_handle = tokio::spawn(run_pump(
        session,
        fsm,
        cmd_rx,
        PumpDeps {
            call_id: call_id.clone(),
            state: state.clone(),
            out: out.clone(),
            audio: Arc::clone(&audio_queue),
        },
    ));

    // -- Frame loop ------------------------------------------------------
    run_frame_loop(&config, &mut ws_rx, &out, &audio_queue, &cmd_tx).await;

    drop(cmd_tx);
    let _ = pump_handle.await;
    // Close the outbound queue so the sender drains and exits.
    drop(out);
    let _ = sender_handle.await;
    info!(%call_id, "connection finished");
}

/// Read and validate the auth frame. Returns `false` when the connection
/// must close (the 1008 close is already queued).
async fn authenticate(
    state: &GatewayState,
    config: &GatewayConfig,
    ws_rx: &mut SplitStream<WebSocket>,
    out: &OutboundSender,
    call_id: &str,
) -> bool {
    let handshake = Duration::from_secs(config.auth.handshake_timeout_seconds);
    let first_text = tokio::time::timeout(handshake, async {
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await;

    let reject = |reason: &str| {
        warn!(%call_id, "authentication failed: {reason}");
        out.event(&ServerEvent::AuthError {
            message: "Invalid or missing JWT token".to_owned(),
        });
        out.close(CLOSE_POLICY, "authentication failed");
        false
    };

    let text = match first_text {
        Ok(Some(text)) => text,
        Ok(None) => return reject("socket closed before auth"),
        Err(_) => return reject("auth frame timeout"),
    };
    let Ok(frame) = serde_json::from_str::<AuthFrame>(text.as_str()) else {
        return reject("first frame is not an auth frame");
    };
    match state.jwt.validate(&frame.jwt, call_id) {
        Ok(_claims) => true,
        Err(e) => reject(&e.to_string()),
    }
}

async fn run_frame_loop(
    config: &GatewayConfig,
    ws_rx: &mut SplitStream<WebSocket>,
    out: &OutboundSender,
    audio_queue: &Arc<BoundedAudioQueue>,
    cmd_tx: &mpsc::UnboundedSender<PumpCommand>,
) {
    let mut gates = FrameGates::new(&config.limits);
    let mut jitter = JitterTracker::new();
    let idle = Duration::from_secs(config.limits.idle_timeout_seconds);

    loop {
        let message = match tokio::time::timeout(idle, ws_rx.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("socket read error: {e}");
                let _ = cmd_tx.send(PumpCommand::ClientGone);
                return;
            }
            Ok(None) => {
                let _ = cmd_tx.send(PumpCommand::ClientGone);
                return;
            }
            Err(_) => {
                info!("idle timeout after {}s", idle.as_secs());
                let _ = cmd_tx.send(PumpCommand::ClientGone);
                return;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                let _ = cmd_tx.send(PumpCommand::ClientGone);
                return;
            }
            Message::Binary(_) => {
                metrics::rate_limit_hit("schema");
                continue;
            }
            // Ping/pong frames are handled by the transport.
            _ => continue,
        };

        match gates.check(text.len()) {
            GateVerdict::Pass => {}
            GateVerdict::TooLarge => {
                warn!("frame too large: {} bytes", text.len());
                metrics::rate_limit_hit("frame_size");
                continue;
            }
            GateVerdict::MsgRate { retry_after } => {
                metrics::rate_limit_hit("messages_per_sec");
                out.event(&ServerEvent::RateLimitExceeded {
                    message: "Too many messages per second".to_owned(),
                    retry_after,
                });
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            GateVerdict::ByteRate { retry_after } => {
                metrics::rate_limit_hit("bytes_per_sec");
                out.event(&ServerEvent::RateLimitExceeded {
                    message: "Byte rate exceeded".to_owned(),
                    retry_after,
                });
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        }

        let event = match serde_json::from_str::<ClientEvent>(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                debug!("invalid client frame: {e}");
                metrics::rate_limit_hit("schema");
                continue;
            }
        };

        match event {
            ClientEvent::AudioChunk {
                audio, timestamp, ..
            } => {
                let frame = match audio::decode_frame(&audio) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("bad audio frame: {e}");
                        metrics::rate_limit_hit("schema");
                        continue;
                    }
                };
                if let Some(gap) = jitter.observe()
                    && gap > audio::JITTER_WARN_MS
                {
                    warn!("inter-frame jitter {gap:.0}ms");
                }
                if audio_queue.push(frame, timestamp) == PushOutcome::DroppedOldest {
                    metrics::audio_frame_dropped();
                }
                let _ = cmd_tx.send(PumpCommand::AudioReady);
            }
            ClientEvent::BargeIn { .. } => {
                let _ = cmd_tx.send(PumpCommand::BargeIn);
            }
            ClientEvent::Stop { .. } => {
                let _ = cmd_tx.send(PumpCommand::Stop);
                return;
            }
            ClientEvent::Ping { timestamp } => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                out.event(&ServerEvent::Pong {
                    timestamp: ServerEvent::now_iso(),
                    latency_ms: ((now - timestamp) * 1000.0).max(0.0),
                });
            }
        }
    }
}

struct PumpDeps {
    call_id: String,
    state: GatewayState,
    out: OutboundSender,
    audio: Arc<BoundedAudioQueue>,
}

/// The pump owns the realtime session and the FSM: it drains inbound
/// audio, forwards session events to the client in emission order, and
/// closes the reward loop when the call ends.
async fn run_pump(
    mut session: Box<dyn RealtimeSession>,
    mut fsm: CallFsm,
    mut cmd_rx: mpsc::UnboundedReceiver<PumpCommand>,
    deps: PumpDeps,
) {
    let config = Arc::clone(&deps.state.config);

    if let Err(e) = session.open().await {
        warn!(call_id = %deps.call_id, "backend open failed: {e}");
        deps.out.event(&ServerEvent::ProviderError {
            message: "Failed to connect to realtime backend".to_owned(),
        });
        deps.out.close(CLOSE_INTERNAL, "backend unavailable");
        deps.state.registry.teardown(&deps.call_id);
        return;
    }
    metrics::set_backend(session.kind() == crate::session::BackendKind::Local);

    deps.out.event(&ServerEvent::Connected {
        call_id: deps.call_id.clone(),
        timestamp: ServerEvent::now_iso(),
        config: ConnectedConfig {
            stt_mode: config.realtime.stt_mode.clone(),
            llm_mode: config.realtime.llm_mode.clone(),
            tts_mode: config.realtime.tts_mode.clone(),
        },
    });

    let mut resume_at: Option<tokio::time::Instant> = None;
    let mut frame_number: u32 = 0;
    let mut last_user_text: Option<String> = None;
    let mut close_normally = false;

    /// One wake-up of the pump loop, resolved before any state mutation so
    /// the select borrows end before the handlers run.
    enum Step {
        Resume,
        Command(Option<PumpCommand>),
        Event(Option<SessionEvent>),
    }

    loop {
        let step = {
            let resume_timer = async {
                match resume_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = resume_timer => Step::Resume,
                command = cmd_rx.recv() => Step::Command(command),
                event = session.next_event() => Step::Event(event),
            }
        };

        match step {
            Step::Resume => {
                resume_at = None;
                fsm.handle_event(CallFsmEvent::Resume);
            }
            Step::Command(None) | Step::Command(Some(PumpCommand::ClientGone)) => break,
            Step::Command(Some(PumpCommand::Stop)) => {
                close_normally = true;
                break;
            }
            Step::Command(Some(PumpCommand::AudioReady)) => {
                drain_audio(&mut session, &mut fsm, &deps, &mut resume_at).await;
            }
            Step::Command(Some(PumpCommand::BargeIn)) => {
                let action = fsm.handle_event(CallFsmEvent::BargeIn);
                if let FsmAction::CancelAndResume { debounce } = action {
                    metrics::barge_in(fsm.policy_variant());
                    deps.out.flush_droppable();
                    deps.audio.clear();
                    frame_number = 0;
                    if let Err(e) = session.cancel().await {
                        warn!(call_id = %deps.call_id, "cancel failed: {e}");
                    }
                    resume_at = Some(tokio::time::Instant::now() + debounce);
                }
                deps.out.event(&ServerEvent::BargeInAck {
                    timestamp: ServerEvent::now_iso(),
                });
            }
            Step::Event(None) => {
                warn!(call_id = %deps.call_id, "backend event stream ended");
                deps.out.event(&ServerEvent::Error {
                    message: "realtime backend terminated".to_owned(),
                });
                deps.out.close(CLOSE_INTERNAL, "backend terminated");
                break;
            }
            Step::Event(Some(event)) => {
                handle_session_event(
                    event,
                    &mut session,
                    &mut fsm,
                    &deps,
                    &mut frame_number,
                    &mut last_user_text,
                    &mut resume_at,
                )
                .await;
            }
        }
    }

    finish_call(&mut session, &mut fsm, &deps, &last_user_text).await;
    if close_normally {
        deps.out.close_normal();
    }
}

async fn drain_audio(
    session: &mut Box<dyn RealtimeSession>,
    fsm: &mut CallFsm,
    deps: &PumpDeps,
    resume_at: &mut Option<tokio::time::Instant>,
) {
    while let Some((frame, timestamp)) = deps.audio.try_pop() {
        match fsm.state() {
            // Input is suppressed during the debounce; drop silently.
            CallState::Barred => continue,
            CallState::Ended => break,
            // The FSM only tracks audio while listening; mid-turn frames
            // still flow to the backend (voice barge-in detection).
            CallState::Listening => {
                fsm.handle_event(CallFsmEvent::AudioChunk);
            }
            _ => {}
        }
        if let Err(e) = session.send_audio(frame, timestamp).await {
            warn!(call_id = %deps.call_id, "audio forward failed: {e}");
            deps.out.event(&ServerEvent::ProviderError {
                message: "audio path error".to_owned(),
            });
            if let FsmAction::ResumeAfter { backoff } = fsm.handle_event(CallFsmEvent::Error) {
                *resume_at = Some(tokio::time::Instant::now() + backoff);
            }
            break;
        }
    }
}

fn fsm_event_for(event: &SessionEvent) -> Option<CallFsmEvent> {
    match event {
        SessionEvent::SttStarted | SessionEvent::SttStopped => None,
        SessionEvent::SttFinal { .. } => Some(CallFsmEvent::SttFinal),
        SessionEvent::LlmToken { .. } => Some(CallFsmEvent::LlmToken),
        SessionEvent::LlmComplete => Some(CallFsmEvent::LlmComplete),
        SessionEvent::TtsAudio { .. } => Some(CallFsmEvent::TtsAudio),
        SessionEvent::TtsComplete { .. } => Some(CallFsmEvent::TtsComplete),
        SessionEvent::Error { .. } => Some(CallFsmEvent::Error),
    }
}

async fn handle_session_event(
    event: SessionEvent,
    session: &mut Box<dyn RealtimeSession>,
    fsm: &mut CallFsm,
    deps: &PumpDeps,
    frame_number: &mut u32,
    last_user_text: &mut Option<String>,
    resume_at: &mut Option<tokio::time::Instant>,
) {
    // Stale output from a cancelled turn: swallow while barred.
    if fsm.state() == CallState::Barred
        && matches!(
            event,
            SessionEvent::LlmToken { .. }
                | SessionEvent::LlmComplete
                | SessionEvent::TtsAudio { .. }
                | SessionEvent::TtsComplete { .. }
        )
    {
        return;
    }

    match &event {
        SessionEvent::SttStarted => deps.out.event(&ServerEvent::SttStarted),
        SessionEvent::SttStopped => deps.out.event(&ServerEvent::SttStopped),
        SessionEvent::SttFinal { text, confidence } => {
            *last_user_text = Some(text.clone());
            deps.out.event(&ServerEvent::SttFinal {
                text: text.clone(),
                confidence: *confidence,
            });
        }
        SessionEvent::LlmToken { text } => {
            deps.out.event(&ServerEvent::LlmToken { text: text.clone() });
        }
        SessionEvent::LlmComplete => deps.out.event(&ServerEvent::LlmComplete),
        SessionEvent::TtsAudio { pcm } => {
            metrics::audio_frame_sent();
            deps.out.droppable_event(&ServerEvent::TtsAudio {
                codec: "pcm16",
                audio: audio::encode_frame(pcm),
                sample_rate: audio::SAMPLE_RATE,
                frame_size_ms: audio::FRAME_MS,
                frame_number: *frame_number,
            });
            *frame_number += 1;
        }
        SessionEvent::TtsComplete { total_frames } => {
            deps.out.event(&ServerEvent::TtsComplete {
                total_frames: *total_frames,
            });
            *frame_number = 0;
        }
        SessionEvent::Error { kind, message } => {
            let message = message.clone();
            match kind {
                SessionErrorKind::Provider | SessionErrorKind::Transport => {
                    deps.out.event(&ServerEvent::ProviderError { message });
                }
                _ => deps.out.event(&ServerEvent::Error { message }),
            }
        }
    }

    let Some(fsm_event) = fsm_event_for(&event) else {
        return;
    };
    match fsm.handle_event(fsm_event) {
        FsmAction::TurnComplete(metrics) => {
            record_turn(session, metrics).await;
        }
        FsmAction::ResumeAfter { backoff } => {
            *resume_at = Some(tokio::time::Instant::now() + backoff);
        }
        FsmAction::CancelAndResume { debounce } => {
            // Only reachable for barge-in, which arrives as a command; kept
            // for completeness.
            let _ = session.cancel().await;
            *resume_at = Some(tokio::time::Instant::now() + debounce);
        }
        FsmAction::EmitReward(_) | FsmAction::None => {}
    }
}

async fn record_turn(session: &mut Box<dyn RealtimeSession>, turn: TurnMetrics) {
    if let Some(ms) = turn.stt_to_llm_ms {
        metrics::stage_latency("stt_to_llm", ms);
    }
    if let Some(ms) = turn.llm_to_tts_ms {
        metrics::stage_latency("llm_to_tts", ms);
    }
    if let Some(ms) = turn.e2e_ms {
        metrics::e2e_latency(ms);
        session.observe_e2e(ms).await;
    }
}

/// Terminal path: enrich signals, emit the reward exactly once, close the
/// backend, release the registry slot.
async fn finish_call(
    session: &mut Box<dyn RealtimeSession>,
    fsm: &mut CallFsm,
    deps: &PumpDeps,
    last_user_text: &Option<String>,
) {
    if let Some(text) = last_user_text {
        let context = fsm.context_mut();
        if context.user_rating.is_none()
            && let Some(rating) = feedback::parse_rating(text)
        {
            context.user_rating = Some(rating);
        }
        if feedback::mentions_handover(text) {
            context.handover = true;
        }
        if context.user_rating.is_some_and(|r| r >= 4) {
            context.resolution = true;
        }
    }

    if let FsmAction::EmitReward(signals) = fsm.handle_event(CallFsmEvent::CallEnded) {
        let profile = fsm.context().profile.clone();
        let variant = fsm.policy_variant().to_owned();
        let reward = deps
            .state
            .policy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .complete(&variant, &profile, &signals);
        info!(
            call_id = %deps.call_id,
            %variant,
            "call ended with reward {reward:.3}"
        );
    }

    if let Err(e) = session.close().await {
        debug!(call_id = %deps.call_id, "backend close: {e}");
    }
    deps.state.registry.teardown(&deps.call_id);
}
