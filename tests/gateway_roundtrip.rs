//! Socket-level gateway tests: a real server on an ephemeral port, a
//! tungstenite client, and scripted realtime backends.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tom::config::GatewayConfig;
use tom::error::Result;
use tom::gateway::{GatewayState, build_router};
use tom::rl::{PolicyBandit, PolicyRouter, RewardCalculator};
use tom::session::{
    BackendKind, ControlCommand, RealtimeSession, SessionEvent, SessionFactory,
};

const JWT_SECRET: &str = "roundtrip-secret";

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

// --- Scripted backend ----------------------------------------------------

/// Shared assertion handles for scripted sessions.
#[derive(Default)]
struct ScriptControl {
    cancelled: AtomicBool,
    frames_received: AtomicU32,
}

/// What the scripted backend does once enough audio arrived.
#[derive(Clone, Copy)]
enum Script {
    /// One full turn: stt_final → tokens → two frames → tts_complete.
    ShortTurn,
    /// A long synthesized stream (a frame every 10 ms until cancelled).
    LongSpeech,
}

struct ScriptedSession {
    control: Arc<ScriptControl>,
    script: Script,
    trigger_after: u32,
    fired: bool,
    opened: bool,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: mpsc::Receiver<SessionEvent>,
}

impl ScriptedSession {
    fn new(control: Arc<ScriptControl>, script: Script, trigger_after: u32) -> Self {
        let (event_tx, event_rx) = mpsc::channel(512);
        Self {
            control,
            script,
            trigger_after,
            fired: false,
            opened: false,
            event_tx,
            event_rx,
        }
    }

    fn fire(&mut self) {
        self.fired = true;
        let tx = self.event_tx.clone();
        let control = Arc::clone(&self.control);
        let script = self.script;
        tokio::spawn(async move {
            let _ = tx.send(SessionEvent::SttStarted).await;
            let _ = tx
                .send(SessionEvent::SttFinal {
                    text: "hello gateway".to_owned(),
                    confidence: 0.92,
                })
                .await;
            let _ = tx
                .send(SessionEvent::LlmToken {
                    text: "Hi".to_owned(),
                })
                .await;
            let _ = tx
                .send(SessionEvent::LlmToken {
                    text: " there.".to_owned(),
                })
                .await;
            match script {
                Script::ShortTurn => {
                    let _ = tx.send(SessionEvent::LlmComplete).await;
                    for _ in 0..2 {
                        let _ = tx
                            .send(SessionEvent::TtsAudio {
                                pcm: vec![0u8; tom::audio::FRAME_BYTES],
                            })
                            .await;
                    }
                    let _ = tx.send(SessionEvent::TtsComplete { total_frames: 2 }).await;
                }
                Script::LongSpeech => {
                    for _ in 0..500 {
                        if control.cancelled.load(Ordering::SeqCst) {
                            break;
                        }
                        let _ = tx
                            .send(SessionEvent::TtsAudio {
                                pcm: vec![0u8; tom::audio::FRAME_BYTES],
                            })
                            .await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl RealtimeSession for ScriptedSession {
    async fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    async fn send_audio(&mut self, _frame: Vec<u8>, _ts: f64) -> Result<()> {
        let seen = self.control.frames_received.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.fired && seen >= self.trigger_after {
            self.fire();
        }
        Ok(())
    }

    async fn send_event(&mut self, _command: ControlCommand) -> Result<()> {
        Ok(())
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    async fn cancel(&mut self) -> Result<()> {
        self.control.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}

// --- Harness -------------------------------------------------------------

fn test_config(dir: &tempfile::TempDir, dev_auth: bool) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.jwt_secret = JWT_SECRET.to_owned();
    config.auth.dev_allow_no_jwt = dev_auth;
    config.rl.bandit_state_path = dir
        .path()
        .join("bandit.json")
        .to_string_lossy()
        .into_owned();
    config.rl.deploy_state_path = dir
        .path()
        .join("deploy.json")
        .to_string_lossy()
        .into_owned();
    config
}

fn scripted_state(
    config: GatewayConfig,
    control: Arc<ScriptControl>,
    script: Script,
    trigger_after: u32,
) -> GatewayState {
    let bandit = PolicyBandit::with_seed(&config.rl.bandit_state_path, 7);
    let guard = tom::rl::DeployGuard::with_seed(
        config.rl.deploy.clone(),
        &config.rl.deploy_state_path,
        bandit,
        7,
    )
    .unwrap();
    let policy = PolicyRouter::with_guard(guard, RewardCalculator::default());

    let factory: Arc<SessionFactory> = Arc::new(move |_call_id: &str| {
        Box::new(ScriptedSession::new(
            Arc::clone(&control),
            script,
            trigger_after,
        )) as Box<dyn RealtimeSession>
    });
    GatewayState::new(config, policy, None).with_session_factory(factory)
}

async fn spawn_gateway(state: GatewayState) -> SocketAddr {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn connect_client(addr: SocketAddr, call_id: &str) -> WsClient {
    let url = format!("ws://{addr}/ws/stream/{call_id}");
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "realtime-v1".parse().unwrap());
    let (client, _response) = connect_async(request).await.unwrap();
    client
}

#[derive(Serialize)]
struct TokenClaims {
    iss: String,
    aud: String,
    call_id: String,
    iat: u64,
    exp: u64,
    nonce: String,
}

fn make_jwt(call_id: &str, nonce: &str) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let claims = TokenClaims {
        iss: "tom-bridge".to_owned(),
        aud: "tom-gateway".to_owned(),
        call_id: call_id.to_owned(),
        iat: now,
        exp: now + 30,
        nonce: nonce.to_owned(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

async fn send_json(client: &mut WsClient, value: serde_json::Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

/// Receive the next text frame as JSON, with a timeout.
async fn recv_json(client: &mut WsClient) -> Option<serde_json::Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .ok()??
            .ok()?;
        match message {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Wait for a frame with the given `type`, skipping others.
async fn recv_until(client: &mut WsClient, wanted: &str) -> Option<serde_json::Value> {
    for _ in 0..200 {
        let frame = recv_json(client).await?;
        if frame["type"] == wanted {
            return Some(frame);
        }
    }
    None
}

fn silence_chunk(seq: u32) -> serde_json::Value {
    serde_json::json!({
        "type": "audio_chunk",
        "audio": BASE64.encode(vec![0u8; tom::audio::FRAME_BYTES]),
        "timestamp": f64::from(seq) * 0.02,
        "audio_length": tom::audio::FRAME_SAMPLES,
    })
}

// --- Scenarios -----------------------------------------------------------

#[tokio::test]
async fn happy_path_streams_a_full_turn() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(ScriptControl::default());
    let state = scripted_state(
        test_config(&dir, false),
        Arc::clone(&control),
        Script::ShortTurn,
        10,
    );
    let addr = spawn_gateway(state).await;

    let mut client = connect_client(addr, "c1").await;
    send_json(&mut client, serde_json::json!({"jwt": make_jwt("c1", "hp-n1")})).await;

    let connected = recv_until(&mut client, "connected").await.unwrap();
    assert_eq!(connected["call_id"], "c1");
    assert!(connected["config"]["stt_mode"].is_string());

    for seq in 0..50 {
        send_json(&mut client, silence_chunk(seq)).await;
    }

    let stt = recv_until(&mut client, "stt_final").await.unwrap();
    assert_eq!(stt["text"], "hello gateway");

    let token = recv_until(&mut client, "llm_token").await.unwrap();
    assert_eq!(token["text"], "Hi");

    let tts = recv_until(&mut client, "tts_audio").await.unwrap();
    assert_eq!(tts["codec"], "pcm16");
    assert_eq!(tts["sample_rate"], 16_000);
    assert_eq!(tts["frame_size_ms"], 20);

    let complete = recv_until(&mut client, "tts_complete").await.unwrap();
    assert_eq!(complete["total_frames"], 2);

    assert!(control.frames_received.load(Ordering::SeqCst) >= 10);

    send_json(&mut client, serde_json::json!({"type": "stop", "timestamp": 1.0})).await;
}

#[tokio::test]
async fn replayed_nonce_closes_second_connection() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(ScriptControl::default());
    let state = scripted_state(
        test_config(&dir, false),
        control,
        Script::ShortTurn,
        10,
    );
    let addr = spawn_gateway(state).await;

    let mut first = connect_client(addr, "r1").await;
    send_json(&mut first, serde_json::json!({"jwt": make_jwt("r1", "N1")})).await;
    assert!(recv_until(&mut first, "connected").await.is_some());

    let mut second = connect_client(addr, "r2").await;
    send_json(&mut second, serde_json::json!({"jwt": make_jwt("r2", "N1")})).await;

    // Expect auth_error then a 1008 close.
    let mut saw_close_1008 = false;
    while let Ok(Some(Ok(message))) =
        tokio::time::timeout(Duration::from_secs(5), second.next()).await
    {
        if let Message::Close(Some(frame)) = message {
            saw_close_1008 = u16::from(frame.code) == 1008;
            break;
        }
    }
    assert!(saw_close_1008, "second connection must close with 1008");
}

#[tokio::test]
async fn message_flood_is_limited_but_connection_survives() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(ScriptControl::default());
    let state = scripted_state(test_config(&dir, true), control, Script::ShortTurn, 1000);
    let addr = spawn_gateway(state).await;

    let mut client = connect_client(addr, "flood").await;
    assert!(recv_until(&mut client, "connected").await.is_some());

    for _ in 0..200 {
        send_json(&mut client, serde_json::json!({"type": "ping", "timestamp": 0.0})).await;
    }

    let mut saw_rate_limit = false;
    let mut drained = 0;
    while drained < 250 {
        let Some(frame) = recv_json(&mut client).await else {
            break;
        };
        drained += 1;
        if frame["type"] == "rate_limit_exceeded" {
            saw_rate_limit = true;
            break;
        }
    }
    assert!(saw_rate_limit, "expected at least one rate_limit_exceeded");

    // The connection is still usable afterwards.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    send_json(&mut client, serde_json::json!({"type": "ping", "timestamp": 0.0})).await;
    assert!(recv_until(&mut client, "pong").await.is_some());
}

#[tokio::test]
async fn barge_in_acks_and_stops_audio() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(ScriptControl::default());
    let state = scripted_state(
        test_config(&dir, true),
        Arc::clone(&control),
        Script::LongSpeech,
        5,
    );
    let addr = spawn_gateway(state).await;

    let mut client = connect_client(addr, "barge").await;
    assert!(recv_until(&mut client, "connected").await.is_some());

    for seq in 0..10 {
        send_json(&mut client, silence_chunk(seq)).await;
    }
    // Wait until synthesized audio is flowing.
    assert!(recv_until(&mut client, "tts_audio").await.is_some());

    send_json(&mut client, serde_json::json!({"type": "barge_in", "timestamp": 1.0})).await;
    assert!(recv_until(&mut client, "barge_in_ack").await.is_some());
    assert!(control.cancelled.load(Ordering::SeqCst));

    // After the ack the stream quiesces: drain briefly and require silence.
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(Some(Ok(message))) =
        tokio::time::timeout(Duration::from_millis(50), client.next()).await
    {
        drop(message);
    }
    let quiet = tokio::time::timeout(Duration::from_millis(300), client.next()).await;
    assert!(quiet.is_err(), "audio must stop flowing after barge-in");
}

#[tokio::test]
async fn duplicate_call_id_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(ScriptControl::default());
    let state = scripted_state(test_config(&dir, true), control, Script::ShortTurn, 10);
    let addr = spawn_gateway(state).await;

    let mut first = connect_client(addr, "dup").await;
    assert!(recv_until(&mut first, "connected").await.is_some());

    let mut second = connect_client(addr, "dup").await;
    let mut saw_close = false;
    while let Ok(Some(Ok(message))) =
        tokio::time::timeout(Duration::from_secs(5), second.next()).await
    {
        if let Message::Close(Some(frame)) = message {
            saw_close = u16::from(frame.code) == 1008;
            break;
        }
    }
    assert!(saw_close, "second session for same call must close with 1008");
}

#[tokio::test]
async fn ping_returns_pong_with_latency() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(ScriptControl::default());
    let state = scripted_state(test_config(&dir, true), control, Script::ShortTurn, 10);
    let addr = spawn_gateway(state).await;

    let mut client = connect_client(addr, "ping").await;
    assert!(recv_until(&mut client, "connected").await.is_some());

    let sent_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64();
    send_json(
        &mut client,
        serde_json::json!({"type": "ping", "timestamp": sent_at}),
    )
    .await;
    let pong = recv_until(&mut client, "pong").await.unwrap();
    assert!(pong["latency_ms"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn oversized_frames_are_dropped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(ScriptControl::default());
    let state = scripted_state(test_config(&dir, true), control, Script::ShortTurn, 10);
    let addr = spawn_gateway(state).await;

    let mut client = connect_client(addr, "big").await;
    assert!(recv_until(&mut client, "connected").await.is_some());

    let huge = "x".repeat(70 * 1024);
    client.send(Message::Text(huge)).await.unwrap();

    // Connection still answers pings.
    send_json(&mut client, serde_json::json!({"type": "ping", "timestamp": 0.0})).await;
    assert!(recv_until(&mut client, "pong").await.is_some());
}
