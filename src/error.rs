//! Error types for the voice gateway.

/// Top-level error type for the gateway and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Authentication failure (JWT, nonce replay).
    #[error("auth error: {0}")]
    Auth(String),

    /// Malformed or invalid client frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio frame decoding/validation error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text engine error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model streaming error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Realtime session (backend) error.
    #[error("session error: {0}")]
    Session(String),

    /// Policy routing / bandit error.
    #[error("policy error: {0}")]
    Policy(String),

    /// Persisted state load/save error.
    #[error("state error: {0}")]
    State(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Phone number normalization/hashing error.
    #[error("phone error: {0}")]
    Phone(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GatewayError>;
