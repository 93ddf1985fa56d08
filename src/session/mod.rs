//! Realtime session abstraction over STT+LLM+TTS pipelines.
//!
//! Both the on-prem pipeline and the external provider implement one
//! contract; a failover decorator composes them. Events arrive as a lazy
//! per-session stream consumed via [`RealtimeSession::next_event`].

pub mod engines;
pub mod failover;
pub mod local;
pub mod provider;

pub use failover::FailoverSession;
pub use local::LocalRealtimeSession;
pub use provider::ProviderRealtimeSession;

use crate::error::Result;
use async_trait::async_trait;

/// Which backend currently serves a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Provider,
    Local,
}

impl BackendKind {
    /// Label used in metrics and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Local => "local",
        }
    }
}

/// Error classification carried by session error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    Transport,
    Stt,
    Llm,
    Tts,
    Provider,
}

/// Typed events yielded by a realtime session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SttStarted,
    SttFinal { text: String, confidence: f32 },
    SttStopped,
    LlmToken { text: String },
    LlmComplete,
    /// One 20 ms PCM16/16k frame.
    TtsAudio { pcm: Vec<u8> },
    TtsComplete { total_frames: u32 },
    Error { kind: SessionErrorKind, message: String },
}

/// Control-plane commands accepted by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Commit the buffered utterance to STT now.
    CommitAudio,
    /// Ask for a response from the committed transcript.
    CreateResponse,
}

/// Unified contract for local and provider backends.
#[async_trait]
pub trait RealtimeSession: Send {
    /// Establish the downstream pipeline. Idempotent when already open.
    async fn open(&mut self) -> Result<()>;

    /// Enqueue one 20 ms PCM16 frame without blocking on the pipeline.
    async fn send_audio(&mut self, frame: Vec<u8>, timestamp: f64) -> Result<()>;

    /// Send a control-plane command.
    async fn send_event(&mut self, command: ControlCommand) -> Result<()>;

    /// Await the next session event; `None` once the stream has ended.
    async fn next_event(&mut self) -> Option<SessionEvent>;

    /// Interrupt the in-flight LLM/TTS turn and drop queued output. The
    /// downstream stops emitting audio within one frame duration.
    async fn cancel(&mut self) -> Result<()>;

    /// Tear down; subsequent operations fail.
    async fn close(&mut self) -> Result<()>;

    /// Feed one observed end-to-end latency sample in milliseconds.
    /// Plain backends ignore it; the failover wrapper drives its latency
    /// trigger from these samples.
    async fn observe_e2e(&mut self, ms: f64) {
        let _ = ms;
    }

    /// Which backend this session runs on.
    fn kind(&self) -> BackendKind;
}

/// Factory signature used by the gateway to build sessions per call.
pub type SessionFactory =
    dyn Fn(&str) -> Box<dyn RealtimeSession> + Send + Sync;
