//! Wire frames exchanged with the telephony bridge.
//!
//! All frames are JSON objects tagged by `type`. Unknown types fail to
//! deserialize and are rejected by the gateway's schema gate.

use serde::{Deserialize, Serialize};

/// First client frame when authentication is required.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthFrame {
    /// Signed HS256 token.
    pub jwt: String,
}

/// Client → server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// One 20 ms PCM16/16k frame, base64-encoded.
    AudioChunk {
        audio: String,
        timestamp: f64,
        /// Informational sample count.
        #[serde(default)]
        audio_length: u32,
    },
    /// The caller interrupted the agent mid-response.
    BargeIn { timestamp: f64 },
    /// End the call.
    Stop { timestamp: f64 },
    /// Liveness probe; answered with `pong`.
    Ping { timestamp: f64 },
}

impl ClientEvent {
    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioChunk { .. } => "audio_chunk",
            Self::BargeIn { .. } => "barge_in",
            Self::Stop { .. } => "stop",
            Self::Ping { .. } => "ping",
        }
    }
}

/// Modes reported to the client on connect.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedConfig {
    pub stt_mode: String,
    pub llm_mode: String,
    pub tts_mode: String,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        call_id: String,
        timestamp: String,
        config: ConnectedConfig,
    },
    SttStarted,
    SttFinal {
        text: String,
        confidence: f32,
    },
    SttStopped,
    LlmToken {
        text: String,
    },
    LlmComplete,
    TtsAudio {
        codec: &'static str,
        audio: String,
        sample_rate: u32,
        frame_size_ms: u32,
        frame_number: u32,
    },
    TtsComplete {
        total_frames: u32,
    },
    BargeInAck {
        timestamp: String,
    },
    Pong {
        timestamp: String,
        latency_ms: f64,
    },
    RateLimitExceeded {
        message: String,
        retry_after: u64,
    },
    AuthError {
        message: String,
    },
    ProviderError {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// Serialize to the wire representation.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_owned())
    }

    /// ISO-8601 timestamp for server-stamped frames.
    pub fn now_iso() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn audio_chunk_parses() {
        let json = r#"{"type":"audio_chunk","audio":"AAAA","timestamp":1.5,"audio_length":320}"#;
        let ev: ClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            ClientEvent::AudioChunk {
                timestamp,
                audio_length,
                ..
            } => {
                assert!((timestamp - 1.5).abs() < f64::EPSILON);
                assert_eq!(audio_length, 320);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let json = r#"{"type":"mystery","timestamp":1.0}"#;
        assert!(serde_json::from_str::<ClientEvent>(json).is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let json = r#"{"type":"audio_chunk","timestamp":1.0}"#;
        assert!(serde_json::from_str::<ClientEvent>(json).is_err());
    }

    #[test]
    fn barge_in_parses() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"type":"barge_in","timestamp":2.0}"#).unwrap();
        assert_eq!(ev.kind(), "barge_in");
    }

    #[test]
    fn tts_audio_serializes_contract_fields() {
        let ev = ServerEvent::TtsAudio {
            codec: "pcm16",
            audio: "AAAA".to_owned(),
            sample_rate: 16_000,
            frame_size_ms: 20,
            frame_number: 7,
        };
        let json = ev.to_json();
        assert!(json.contains(r#""type":"tts_audio""#));
        assert!(json.contains(r#""codec":"pcm16""#));
        assert!(json.contains(r#""frame_number":7"#));
    }

    #[test]
    fn connected_carries_modes() {
        let ev = ServerEvent::Connected {
            call_id: "c1".to_owned(),
            timestamp: ServerEvent::now_iso(),
            config: ConnectedConfig {
                stt_mode: "local".to_owned(),
                llm_mode: "local".to_owned(),
                tts_mode: "local".to_owned(),
            },
        };
        let json = ev.to_json();
        assert!(json.contains(r#""type":"connected""#));
        assert!(json.contains(r#""stt_mode":"local""#));
    }
}
