//! Provider-backed realtime session.
//!
//! Connects to an external realtime voice API over WebSocket, pushes
//! caller audio into its input buffer, and maps the provider's event
//! vocabulary onto the unified [`SessionEvent`] stream.

use crate::audio;
use crate::config::ProviderConfig;
use crate::error::{GatewayError, Result};
use crate::session::{BackendKind, ControlCommand, RealtimeSession, SessionErrorKind, SessionEvent};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_SIZE: usize = 64;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Session served by an external realtime provider.
pub struct ProviderRealtimeSession {
    session_id: String,
    config: ProviderConfig,
    writer: Option<WsSink>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: mpsc::Receiver<SessionEvent>,
    reader_cancel: CancellationToken,
    opened: bool,
    closed: bool,
}

impl ProviderRealtimeSession {
    /// Create an unopened provider session.
    pub fn new(session_id: impl Into<String>, config: ProviderConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Self {
            session_id: session_id.into(),
            config,
            writer: None,
            event_tx,
            event_rx,
            reader_cancel: CancellationToken::new(),
            opened: false,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(GatewayError::Session("session is closed".to_owned()));
        }
        if !self.opened {
            return Err(GatewayError::Session("session not opened".to_owned()));
        }
        Ok(())
    }

    async fn send_json(&mut self, payload: serde_json::Value) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| GatewayError::Session("provider socket missing".to_owned()))?;
        writer
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| GatewayError::Session(format!("provider send failed: {e}")))
    }

    fn session_config(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "session.update",
            "session": {
                "modalities": ["text", "audio"],
                "model": self.config.model,
                "instructions": format!(
                    "You are a helpful phone assistant. Respond in {}.",
                    self.config.language
                ),
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": 0.5,
                    "prefix_padding_ms": 300,
                    "silence_duration_ms": 500,
                },
            }
        })
    }
}

/// Map one provider message onto unified session events.
///
/// Audio deltas fan out into exact 20 ms frames; `tts_frames` carries the
/// per-response frame count used by the synthesized `tts_complete`.
pub(crate) fn map_provider_event(
    value: &serde_json::Value,
    tts_frames: &mut u32,
) -> Vec<SessionEvent> {
    match value["type"].as_str() {
        Some("conversation.item.input_audio_buffer.speech_started") => {
            vec![SessionEvent::SttStarted]
        }
        Some("conversation.item.input_audio_buffer.speech_stopped") => {
            vec![SessionEvent::SttStopped]
        }
        Some("conversation.item.input_audio_buffer.committed") => {
            vec![SessionEvent::SttFinal {
                text: value["transcript"].as_str().unwrap_or_default().to_owned(),
                confidence: value["confidence"].as_f64().unwrap_or(0.95) as f32,
            }]
        }
        Some("conversation.item.participant.speech_delta") => {
            vec![SessionEvent::LlmToken {
                text: value["delta"].as_str().unwrap_or_default().to_owned(),
            }]
        }
        Some("conversation.item.participant.speech_stopped") => {
            vec![SessionEvent::LlmComplete]
        }
        Some("conversation.item.participant.audio.delta") => {
            let Some(b64) = value["delta"].as_str() else {
                return Vec::new();
            };
            let Ok(pcm) = BASE64.decode(b64) else {
                warn!("undecodable provider audio delta");
                return Vec::new();
            };
            let frames = audio::frames_from_pcm(&pcm);
            *tts_frames += frames.len() as u32;
            frames
                .into_iter()
                .map(|pcm| SessionEvent::TtsAudio { pcm })
                .collect()
        }
        Some("conversation.item.participant.audio.done") => {
            let total = std::mem::take(tts_frames);
            vec![SessionEvent::TtsComplete {
                total_frames: total,
            }]
        }
        Some("error") => {
            vec![SessionEvent::Error {
                kind: SessionErrorKind::Provider,
                message: value["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown provider error")
                    .to_owned(),
            }]
        }
        other => {
            debug!("ignoring provider event type {other:?}");
            Vec::new()
        }
    }
}

async fn run_reader(
    session_id: String,
    mut reader: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut tts_frames: u32 = 0;
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = reader.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(session = %session_id, "invalid JSON from provider: {e}");
                        continue;
                    }
                };
                for event in map_provider_event(&value, &mut tts_frames) {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                info!(session = %session_id, "provider connection closed");
                let _ = event_tx
                    .send(SessionEvent::Error {
                        kind: SessionErrorKind::Transport,
                        message: "provider connection closed".to_owned(),
                    })
                    .await;
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(session = %session_id, "provider read error: {e}");
                let _ = event_tx
                    .send(SessionEvent::Error {
                        kind: SessionErrorKind::Transport,
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

#[async_trait]
impl RealtimeSession for ProviderRealtimeSession {
    async fn open(&mut self) -> Result<()> {
        if self.closed {
            return Err(GatewayError::Session("session is closed".to_owned()));
        }
        if self.opened {
            return Ok(());
        }

        info!(session = %self.session_id, "connecting to realtime provider {}", self.config.ws_url);
        let mut request = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::Session(format!("bad provider URL: {e}")))?;
        let auth = format!("Bearer {}", self.config.api_key);
        request.headers_mut().insert(
            "Authorization",
            auth.parse()
                .map_err(|_| GatewayError::Session("unusable API key".to_owned()))?,
        );

        let (mut ws, _response) = connect_async(request)
            .await
            .map_err(|e| GatewayError::Session(format!("provider connect failed: {e}")))?;

        ws.send(Message::Text(self.session_config().to_string()))
            .await
            .map_err(|e| GatewayError::Session(format!("session config send failed: {e}")))?;

        // Wait for the session acknowledgment before accepting audio.
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let message = tokio::time::timeout_at(deadline, ws.next())
                .await
                .map_err(|_| GatewayError::Session("provider handshake timed out".to_owned()))?;
            match message {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value = serde_json::from_str(&text)
                        .map_err(|e| GatewayError::Session(format!("handshake parse: {e}")))?;
                    match value["type"].as_str() {
                        Some("session.created") | Some("session.updated") => break,
                        Some("error") => {
                            return Err(GatewayError::Session(format!(
                                "provider rejected session: {}",
                                value["error"]["message"].as_str().unwrap_or("unknown")
                            )));
                        }
                        _ => continue,
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(GatewayError::Session(format!("handshake failed: {e}")));
                }
                None => {
                    return Err(GatewayError::Session(
                        "provider closed during handshake".to_owned(),
                    ));
                }
            }
        }

        let (writer, reader) = ws.split();
        self.writer = Some(writer);
        self.reader_cancel = CancellationToken::new();
        tokio::spawn(run_reader(
            self.session_id.clone(),
            reader,
            self.event_tx.clone(),
            self.reader_cancel.clone(),
        ));

        self.opened = true;
        info!(session = %self.session_id, "provider realtime session opened");
        Ok(())
    }

    async fn send_audio(&mut self, frame: Vec<u8>, timestamp: f64) -> Result<()> {
        self.ensure_open()?;
        self.send_json(serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": BASE64.encode(&frame),
            "timestamp": timestamp,
        }))
        .await
    }

    async fn send_event(&mut self, command: ControlCommand) -> Result<()> {
        self.ensure_open()?;
        let payload = match command {
            ControlCommand::CommitAudio => {
                serde_json::json!({"type": "input_audio_buffer.commit"})
            }
            ControlCommand::CreateResponse => serde_json::json!({"type": "response.create"}),
        };
        self.send_json(payload).await
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.closed {
            return None;
        }
        self.event_rx.recv().await
    }

    async fn cancel(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.send_json(serde_json::json!({
            "type": "conversation.item.participant.speech.interrupt"
        }))
        .await?;
        info!(session = %self.session_id, "provider turn cancelled");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.opened = false;
        self.reader_cancel.cancel();
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.send(Message::Close(None)).await;
        }
        info!(session = %self.session_id, "provider realtime session closed");
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Provider
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn speech_lifecycle_events_map() {
        let mut frames = 0;
        let started = serde_json::json!({
            "type": "conversation.item.input_audio_buffer.speech_started"
        });
        assert_eq!(
            map_provider_event(&started, &mut frames),
            vec![SessionEvent::SttStarted]
        );

        let committed = serde_json::json!({
            "type": "conversation.item.input_audio_buffer.committed",
            "transcript": "guten tag",
            "confidence": 0.8,
        });
        let events = map_provider_event(&committed, &mut frames);
        assert!(matches!(
            &events[0],
            SessionEvent::SttFinal { text, .. } if text == "guten tag"
        ));
    }

    #[test]
    fn audio_deltas_become_exact_frames() {
        let mut frames = 0;
        // 1.5 frames of PCM: expect two frames, second zero-padded.
        let pcm = vec![1u8; audio::FRAME_BYTES * 3 / 2];
        let delta = serde_json::json!({
            "type": "conversation.item.participant.audio.delta",
            "delta": BASE64.encode(&pcm),
        });
        let events = map_provider_event(&delta, &mut frames);
        assert_eq!(events.len(), 2);
        assert_eq!(frames, 2);
        for event in &events {
            let SessionEvent::TtsAudio { pcm } = event else {
                panic!("expected audio frame");
            };
            assert_eq!(pcm.len(), audio::FRAME_BYTES);
        }

        let done = serde_json::json!({
            "type": "conversation.item.participant.audio.done"
        });
        let events = map_provider_event(&done, &mut frames);
        assert_eq!(
            events,
            vec![SessionEvent::TtsComplete { total_frames: 2 }]
        );
        assert_eq!(frames, 0);
    }

    #[test]
    fn provider_errors_map_to_error_events() {
        let mut frames = 0;
        let error = serde_json::json!({
            "type": "error",
            "error": {"message": "quota exceeded"},
        });
        let events = map_provider_event(&error, &mut frames);
        assert!(matches!(
            &events[0],
            SessionEvent::Error { kind: SessionErrorKind::Provider, message } if message == "quota exceeded"
        ));
    }

    #[test]
    fn unknown_events_are_ignored() {
        let mut frames = 0;
        let unknown = serde_json::json!({"type": "session.heartbeat"});
        assert!(map_provider_event(&unknown, &mut frames).is_empty());
    }

    #[tokio::test]
    async fn unopened_session_rejects_operations() {
        let mut session = ProviderRealtimeSession::new("t", ProviderConfig::default());
        assert!(session.send_audio(vec![0; 640], 0.0).await.is_err());
        assert!(session.cancel().await.is_err());
    }
}
