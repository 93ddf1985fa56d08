//! On-prem realtime session: STT → LLM → TTS against local engines.
//!
//! Audio frames accumulate in an utterance buffer. An energy gate detects
//! end of speech (enough consecutive sub-threshold frames after real
//! speech) and commits the buffer: transcribe, stream the LLM reply,
//! synthesize sentence by sentence, and emit exact 20 ms frames. A
//! per-turn cancellation token makes barge-in stop synthesis between
//! frames.

use crate::audio;
use crate::config::{EndpointingConfig, RealtimeConfig};
use crate::error::{GatewayError, Result};
use crate::session::engines::{
    ChatMessage, HttpSttEngine, HttpTtsEngine, LlmEngine, OpenAiCompatLlm, SttEngine, TtsEngine,
    drain_sentences,
};
use crate::session::{BackendKind, ControlCommand, RealtimeSession, SessionErrorKind, SessionEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_SIZE: usize = 64;
const TOKEN_CHANNEL_SIZE: usize = 64;
/// Frames of leading silence kept ahead of detected speech.
const SILENCE_PREROLL_FRAMES: usize = 50;

/// Engine handles shared with turn tasks.
#[derive(Clone)]
pub struct LocalEngines {
    pub stt: Arc<dyn SttEngine>,
    pub llm: Arc<dyn LlmEngine>,
    pub tts: Arc<dyn TtsEngine>,
}

impl LocalEngines {
    /// Build HTTP engine clients from config.
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            stt: Arc::new(HttpSttEngine::new(&config.engines)),
            llm: Arc::new(OpenAiCompatLlm::new(&config.engines)),
            tts: Arc::new(HttpTtsEngine::new(&config.engines)),
        }
    }
}

/// Local STT/LLM/TTS pipeline behind the session contract.
pub struct LocalRealtimeSession {
    session_id: String,
    endpointing: EndpointingConfig,
    system_prompt: String,
    engines: LocalEngines,
    opened: bool,
    closed: bool,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: mpsc::Receiver<SessionEvent>,
    utterance: Vec<u8>,
    speech_frames: u32,
    silent_frames: u32,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    turn_running: Arc<AtomicBool>,
    turn_cancel: CancellationToken,
    session_cancel: CancellationToken,
}

impl LocalRealtimeSession {
    /// Build a session with HTTP engine clients from config.
    pub fn new(session_id: impl Into<String>, config: &RealtimeConfig) -> Self {
        Self::with_engines(session_id, config, LocalEngines::from_config(config))
    }

    /// Build a session around injected engines (tests, alternative stacks).
    pub fn with_engines(
        session_id: impl Into<String>,
        config: &RealtimeConfig,
        engines: LocalEngines,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let session_cancel = CancellationToken::new();
        Self {
            session_id: session_id.into(),
            endpointing: config.endpointing.clone(),
            system_prompt: config.engines.system_prompt.clone(),
            engines,
            opened: false,
            closed: false,
            event_tx,
            event_rx,
            utterance: Vec::new(),
            speech_frames: 0,
            silent_frames: 0,
            history: Arc::new(Mutex::new(Vec::new())),
            turn_running: Arc::new(AtomicBool::new(false)),
            turn_cancel: session_cancel.child_token(),
            session_cancel,
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

    fn commit_utterance(&mut self) {
        if self.turn_running.swap(true, Ordering::SeqCst) {
            debug!(session = %self.session_id, "turn already running, commit skipped");
            return;
        }
        let pcm = std::mem::take(&mut self.utterance);
        self.speech_frames = 0;
        self.silent_frames = 0;

        let turn_cancel = self.session_cancel.child_token();
        self.turn_cancel = turn_cancel.clone();

        let ctx = TurnContext {
            session_id: self.session_id.clone(),
            engines: self.engines.clone(),
            system_prompt: self.system_prompt.clone(),
            history: Arc::clone(&self.history),
            event_tx: self.event_tx.clone(),
            turn_running: Arc::clone(&self.turn_running),
        };
        tokio::spawn(async move {
            run_turn(ctx, pcm, turn_cancel).await;
        });
    }
}

struct TurnContext {
    session_id: String,
    engines: LocalEngines,
    system_prompt: String,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    event_tx: mpsc::Sender<SessionEvent>,
    turn_running: Arc<AtomicBool>,
}

async fn run_turn(ctx: TurnContext, pcm: Vec<u8>, cancel: CancellationToken) {
    let result = run_turn_inner(&ctx, pcm, &cancel).await;
    if let Err(e) = result {
        warn!(session = %ctx.session_id, "turn failed: {e}");
        let kind = match &e {
            GatewayError::Stt(_) => SessionErrorKind::Stt,
            GatewayError::Llm(_) => SessionErrorKind::Llm,
            GatewayError::Tts(_) => SessionErrorKind::Tts,
            _ => SessionErrorKind::Transport,
        };
        let _ = ctx
            .event_tx
            .send(SessionEvent::Error {
                kind,
                message: e.to_string(),
            })
            .await;
    }
    ctx.turn_running.store(false, Ordering::SeqCst);
}

async fn run_turn_inner(
    ctx: &TurnContext,
    pcm: Vec<u8>,
    cancel: &CancellationToken,
) -> Result<()> {
    let send = |event: SessionEvent| {
        let tx = ctx.event_tx.clone();
        async move {
            tx.send(event)
                .await
                .map_err(|_| GatewayError::Channel("event receiver dropped".to_owned()))
        }
    };

    send(SessionEvent::SttStarted).await?;
    let transcript = ctx.engines.stt.transcribe(&pcm).await?;
    if cancel.is_cancelled() {
        return Ok(());
    }
    if transcript.text.trim().is_empty() {
        debug!(session = %ctx.session_id, "empty transcription, turn dropped");
        send(SessionEvent::SttStopped).await?;
        return Ok(());
    }
    send(SessionEvent::SttFinal {
        text: transcript.text.clone(),
        confidence: transcript.confidence,
    })
    .await?;

    let messages: Vec<ChatMessage> = {
        let history = ctx.history.lock().await;
        std::iter::once(ChatMessage::system(ctx.system_prompt.clone()))
            .chain(history.iter().cloned())
            .chain(std::iter::once(ChatMessage::user(transcript.text.clone())))
            .collect()
    };

    let (token_tx, mut token_rx) = mpsc::channel::<String>(TOKEN_CHANNEL_SIZE);
    let llm = Arc::clone(&ctx.engines.llm);
    let llm_cancel = cancel.clone();
    let llm_handle =
        tokio::spawn(async move { llm.stream_reply(&messages, token_tx, llm_cancel).await });

    let mut sentence_buffer = String::new();
    let mut total_frames: u32 = 0;

    while let Some(token) = token_rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        send(SessionEvent::LlmToken {
            text: token.clone(),
        })
        .await?;
        sentence_buffer.push_str(&token);
        for sentence in drain_sentences(&mut sentence_buffer) {
            total_frames += synthesize_sentence(ctx, &sentence, cancel).await?;
        }
    }

    let full_text = match llm_handle.await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => return Err(e),
        Err(e) => return Err(GatewayError::Llm(format!("turn task panicked: {e}"))),
    };

    if cancel.is_cancelled() {
        return Ok(());
    }
    send(SessionEvent::LlmComplete).await?;

    // Flush the unterminated tail.
    let tail = sentence_buffer.trim().to_owned();
    if !tail.is_empty() {
        total_frames += synthesize_sentence(ctx, &tail, cancel).await?;
    }
    if cancel.is_cancelled() {
        return Ok(());
    }
    send(SessionEvent::TtsComplete { total_frames }).await?;

    let mut history = ctx.history.lock().await;
    history.push(ChatMessage::user(transcript.text));
    history.push(ChatMessage::assistant(full_text));
    Ok(())
}

async fn synthesize_sentence(
    ctx: &TurnContext,
    sentence: &str,
    cancel: &CancellationToken,
) -> Result<u32> {
    if cancel.is_cancelled() {
        return Ok(0);
    }
    let pcm = ctx.engines.tts.synthesize(sentence).await?;
    let mut emitted = 0;
    for frame in audio::frames_from_pcm(&pcm) {
        // Barge-in budget: stop within one frame duration.
        if cancel.is_cancelled() {
            break;
        }
        ctx.event_tx
            .send(SessionEvent::TtsAudio { pcm: frame })
            .await
            .map_err(|_| GatewayError::Channel("event receiver dropped".to_owned()))?;
        emitted += 1;
    }
    Ok(emitted)
}

#[async_trait]
impl RealtimeSession for LocalRealtimeSession {
    async fn open(&mut self) -> Result<()> {
        if self.closed {
            return Err(GatewayError::Session("session is closed".to_owned()));
        }
        if self.opened {
            return Ok(());
        }
        self.opened = true;
        info!(session = %self.session_id, "local realtime session opened");
        Ok(())
    }

    async fn send_audio(&mut self, frame: Vec<u8>, _timestamp: f64) -> Result<()> {
        self.ensure_open()?;

        let rms = audio::rms_energy(&frame);
        self.utterance.extend_from_slice(&frame);

        if rms >= self.endpointing.speech_rms_threshold {
            self.speech_frames += 1;
            self.silent_frames = 0;
        } else if self.speech_frames > 0 {
            self.silent_frames += 1;
            if self.silent_frames >= self.endpointing.silence_frames
                && self.speech_frames >= self.endpointing.min_speech_frames
            {
                self.commit_utterance();
            }
        } else {
            // No speech yet: keep only a bounded pre-roll.
            let max_bytes = SILENCE_PREROLL_FRAMES * audio::FRAME_BYTES;
            if self.utterance.len() > max_bytes {
                let excess = self.utterance.len() - max_bytes;
                self.utterance.drain(..excess);
            }
        }
        Ok(())
    }

    async fn send_event(&mut self, command: ControlCommand) -> Result<()> {
        self.ensure_open()?;
        match command {
            ControlCommand::CommitAudio => {
                if !self.utterance.is_empty() {
                    self.commit_utterance();
                }
            }
            ControlCommand::CreateResponse => {
                // The commit path already creates the response.
                debug!(session = %self.session_id, "create_response is implicit on commit");
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.closed {
            return None;
        }
        self.event_rx.recv().await
    }

    async fn cancel(&mut self) -> Result<()> {
        self.turn_cancel.cancel();
        self.utterance.clear();
        self.speech_frames = 0;
        self.silent_frames = 0;
        info!(session = %self.session_id, "turn cancelled");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.opened = false;
        self.session_cancel.cancel();
        info!(session = %self.session_id, "local realtime session closed");
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::session::engines::Transcript;
    use std::time::Duration;

    struct ScriptedStt {
        text: &'static str,
    }

    #[async_trait]
    impl SttEngine for ScriptedStt {
        async fn transcribe(&self, _pcm: &[u8]) -> Result<Transcript> {
            Ok(Transcript {
                text: self.text.to_owned(),
                confidence: 0.9,
            })
        }
    }

    struct ScriptedLlm {
        tokens: Vec<&'static str>,
        delay: Duration,
    }

    #[async_trait]
    impl LlmEngine for ScriptedLlm {
        async fn stream_reply(
            &self,
            _messages: &[ChatMessage],
            tokens: mpsc::Sender<String>,
            cancel: CancellationToken,
        ) -> Result<String> {
            let mut full = String::new();
            for token in &self.tokens {
                if cancel.is_cancelled() {
                    break;
                }
                tokio::time::sleep(self.delay).await;
                full.push_str(token);
                if tokens.send((*token).to_owned()).await.is_err() {
                    break;
                }
            }
            Ok(full)
        }
    }

    struct ScriptedTts {
        frames: usize,
    }

    #[async_trait]
    impl TtsEngine for ScriptedTts {
        async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
            Ok(vec![0u8; self.frames * audio::FRAME_BYTES])
        }
    }

    fn scripted_session(delay: Duration) -> LocalRealtimeSession {
        let engines = LocalEngines {
            stt: Arc::new(ScriptedStt { text: "hello" }),
            llm: Arc::new(ScriptedLlm {
                tokens: vec!["Hi", " there", "."],
                delay,
            }),
            tts: Arc::new(ScriptedTts { frames: 3 }),
        };
        LocalRealtimeSession::with_engines("test", &RealtimeConfig::default(), engines)
    }

    fn loud_frame() -> Vec<u8> {
        let mut frame = Vec::with_capacity(audio::FRAME_BYTES);
        for _ in 0..audio::FRAME_SAMPLES {
            frame.extend_from_slice(&2000i16.to_le_bytes());
        }
        frame
    }

    fn silent_frame() -> Vec<u8> {
        vec![0u8; audio::FRAME_BYTES]
    }

    async fn collect_until_complete(session: &mut LocalRealtimeSession) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
                .await
                .expect("timed out waiting for session event")
                .expect("event stream ended early");
            let done = matches!(
                event,
                SessionEvent::TtsComplete { .. } | SessionEvent::Error { .. }
            );
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn silence_after_speech_commits_a_full_turn() {
        let mut session = scripted_session(Duration::ZERO);
        session.open().await.unwrap();

        for _ in 0..12 {
            session.send_audio(loud_frame(), 0.0).await.unwrap();
        }
        for _ in 0..25 {
            session.send_audio(silent_frame(), 0.0).await.unwrap();
        }

        let events = collect_until_complete(&mut session).await;
        assert_eq!(events[0], SessionEvent::SttStarted);
        assert!(matches!(&events[1], SessionEvent::SttFinal { text, .. } if text == "hello"));
        let token_count = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::LlmToken { .. }))
            .count();
        assert_eq!(token_count, 3);
        let frame_count = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::TtsAudio { .. }))
            .count();
        assert_eq!(frame_count, 3);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::TtsComplete { total_frames: 3 })
        ));
    }

    #[tokio::test]
    async fn explicit_commit_triggers_a_turn() {
        let mut session = scripted_session(Duration::ZERO);
        session.open().await.unwrap();
        for _ in 0..5 {
            session.send_audio(loud_frame(), 0.0).await.unwrap();
        }
        session
            .send_event(ControlCommand::CommitAudio)
            .await
            .unwrap();
        let events = collect_until_complete(&mut session).await;
        assert!(matches!(events[0], SessionEvent::SttStarted));
    }

    #[tokio::test]
    async fn cancel_stops_audio_emission() {
        let mut session = scripted_session(Duration::from_millis(50));
        session.open().await.unwrap();
        for _ in 0..12 {
            session.send_audio(loud_frame(), 0.0).await.unwrap();
        }
        for _ in 0..25 {
            session.send_audio(silent_frame(), 0.0).await.unwrap();
        }

        // Wait for the turn to start streaming, then barge in.
        let first = tokio::time::timeout(Duration::from_secs(5), session.next_event())
            .await
            .unwrap();
        assert_eq!(first, Some(SessionEvent::SttStarted));
        session.cancel().await.unwrap();

        // Drain whatever was in flight; the stream must quiesce without a
        // TtsComplete.
        let mut saw_complete = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(300), session.next_event()).await
        {
            if matches!(event, SessionEvent::TtsComplete { .. }) {
                saw_complete = true;
            }
        }
        assert!(!saw_complete, "cancelled turn must not complete");
    }

    #[tokio::test]
    async fn closed_session_rejects_audio() {
        let mut session = scripted_session(Duration::ZERO);
        session.open().await.unwrap();
        session.close().await.unwrap();
        assert!(session.send_audio(loud_frame(), 0.0).await.is_err());
        assert!(session.open().await.is_err());
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let mut session = scripted_session(Duration::ZERO);
        session.open().await.unwrap();
        session.open().await.unwrap();
    }

    #[tokio::test]
    async fn preroll_stays_bounded_without_speech() {
        let mut session = scripted_session(Duration::ZERO);
        session.open().await.unwrap();
        for _ in 0..200 {
            session.send_audio(silent_frame(), 0.0).await.unwrap();
        }
        assert!(session.utterance.len() <= SILENCE_PREROLL_FRAMES * audio::FRAME_BYTES);
    }
}
