//! Per-call finite state machine.
//!
//! The FSM tracks one call through LISTENING → THINKING → SPEAKING turns,
//! handles barge-in via the BARRED debounce state, accounts per-turn stage
//! latencies, and emits exactly one reward when the call ends. It is
//! deliberately pure: callers receive [`FsmAction`]s describing the side
//! effects to run (cancel the backend, schedule a resume, apply a reward).

use crate::rl::FeedbackSignals;
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// States of a live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Waiting for caller speech.
    Listening,
    /// STT final received, LLM turn in flight.
    Thinking,
    /// Tokens/TTS streaming out to the caller.
    Speaking,
    /// Input suppressed after barge-in or error, pending debounce.
    Barred,
    /// Terminal; absorbing.
    Ended,
}

/// Events fed to the FSM by the downstream pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFsmEvent {
    AudioChunk,
    SttFinal,
    LlmToken,
    LlmComplete,
    TtsAudio,
    TtsComplete,
    BargeIn,
    Error,
    /// Debounce elapsed; re-enable input.
    Resume,
    CallEnded,
}

impl CallFsmEvent {
    fn name(self) -> &'static str {
        match self {
            Self::AudioChunk => "audio_chunk",
            Self::SttFinal => "stt_final",
            Self::LlmToken => "llm_token",
            Self::LlmComplete => "llm_complete",
            Self::TtsAudio => "tts_audio",
            Self::TtsComplete => "tts_complete",
            Self::BargeIn => "barge_in",
            Self::Error => "error",
            Self::Resume => "resume",
            Self::CallEnded => "call_ended",
        }
    }
}

/// Context carried by a call for policy selection and reward signals.
#[derive(Debug, Clone, Serialize)]
pub struct CallContext {
    /// Caller profile tag (e.g. `kfz`, `it`, `general`).
    pub profile: String,
    /// Coarse time bucket at call start.
    pub time_of_day: &'static str,
    pub barge_in_count: u32,
    pub repeat_count: u32,
    pub call_duration_sec: f64,
    pub user_rating: Option<u8>,
    pub resolution: bool,
    pub handover: bool,
}

impl CallContext {
    /// Build a context for a new call.
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            time_of_day: time_of_day_bucket(chrono::Local::now().hour()),
            barge_in_count: 0,
            repeat_count: 0,
            call_duration_sec: 0.0,
            user_rating: None,
            resolution: false,
            handover: false,
        }
    }
}

/// Map an hour of day onto the coarse context bucket.
pub fn time_of_day_bucket(hour: u32) -> &'static str {
    match hour {
        6..=11 => "morning",
        12..=17 => "afternoon",
        18..=21 => "evening",
        _ => "night",
    }
}

/// One appended entry in the call's event log.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedTransition {
    pub event: &'static str,
    pub from: CallState,
    pub to: CallState,
    pub at: DateTime<Utc>,
}

/// Per-turn latency measurements, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TurnMetrics {
    /// STT final → first LLM token.
    pub stt_to_llm_ms: Option<f64>,
    /// First LLM token → first TTS frame.
    pub llm_to_tts_ms: Option<f64>,
    /// STT final → first TTS frame.
    pub e2e_ms: Option<f64>,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum FsmAction {
    /// Nothing beyond the state change.
    None,
    /// Barge-in: cancel the backend, flush queued output, resume after the
    /// debounce.
    CancelAndResume { debounce: Duration },
    /// Error recovery: resume listening after the backoff.
    ResumeAfter { backoff: Duration },
    /// A full turn completed; record its latencies.
    TurnComplete(TurnMetrics),
    /// Terminal transition: apply this reward exactly once.
    EmitReward(FeedbackSignals),
}

const BARGE_IN_DEBOUNCE: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// FSM instance for one call.
pub struct CallFsm {
    call_id: String,
    state: CallState,
    context: CallContext,
    policy_variant: String,
    started_at: Instant,
    last_activity: Instant,
    events: Vec<LoggedTransition>,
    // Per-turn stamps.
    t_stt: Option<Instant>,
    t_first_token: Option<Instant>,
    t_first_audio: Option<Instant>,
    reward_emitted: bool,
}

impl CallFsm {
    /// Create the FSM for a freshly admitted call.
    pub fn new(call_id: impl Into<String>, policy_variant: impl Into<String>, context: CallContext) -> Self {
        Self {
            call_id: call_id.into(),
            state: CallState::Listening,
            context,
            policy_variant: policy_variant.into(),
            started_at: Instant::now(),
            last_activity: Instant::now(),
            events: Vec::new(),
            t_stt: None,
            t_first_token: None,
            t_first_audio: None,
            reward_emitted: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn policy_variant(&self) -> &str {
        &self.policy_variant
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    /// Mutable context access for signal enrichment before `call_ended`.
    pub fn context_mut(&mut self) -> &mut CallContext {
        &mut self.context
    }

    /// Appended transition log.
    pub fn transitions(&self) -> &[LoggedTransition] {
        &self.events
    }

    /// Time since the last observed event.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn transition(&mut self, event: CallFsmEvent, to: CallState) {
        let from = self.state;
        self.state = to;
        self.last_activity = Instant::now();
        self.events.push(LoggedTransition {
            event: event.name(),
            from,
            to,
            at: Utc::now(),
        });
        debug!(
            call_id = %self.call_id,
            "transition {from:?} -> {to:?} ({})",
            event.name()
        );
    }

    fn reset_turn(&mut self) {
        self.t_stt = None;
        self.t_first_token = None;
        self.t_first_audio = None;
    }

    fn turn_metrics(&self) -> TurnMetrics {
        let ms = |a: Option<Instant>, b: Option<Instant>| -> Option<f64> {
            let (a, b) = (a?, b?);
            Some(b.duration_since(a).as_secs_f64() * 1000.0)
        };
        TurnMetrics {
            stt_to_llm_ms: ms(self.t_stt, self.t_first_token),
            llm_to_tts_ms: ms(self.t_first_token, self.t_first_audio),
            e2e_ms: ms(self.t_stt, self.t_first_audio),
        }
    }

    fn end_call(&mut self, event: CallFsmEvent) -> FsmAction {
        self.transition(event, CallState::Ended);
        if self.reward_emitted {
            return FsmAction::None;
        }
        self.reward_emitted = true;
        self.context.call_duration_sec = self.started_at.elapsed().as_secs_f64();
        let signals = FeedbackSignals {
            resolution: self.context.resolution,
            user_rating: self.context.user_rating,
            barge_in_count: self.context.barge_in_count,
            repeats: self.context.repeat_count,
            handover: self.context.handover,
            duration_sec: self.context.call_duration_sec,
        };
        FsmAction::EmitReward(signals)
    }

    fn invalid(&self, event: CallFsmEvent) -> FsmAction {
        warn!(
            call_id = %self.call_id,
            "invalid transition: {:?} + {}",
            self.state,
            event.name()
        );
        FsmAction::None
    }

    /// Advance the FSM and return the side effect to execute.
    pub fn handle_event(&mut self, event: CallFsmEvent) -> FsmAction {
        use CallFsmEvent as E;
        use CallState as S;

        // ENDED is absorbing.
        if self.state == S::Ended {
            if event != E::CallEnded {
                warn!(call_id = %self.call_id, "event {} after call end", event.name());
            }
            return FsmAction::None;
        }

        // Cross-state events first.
        match event {
            E::CallEnded => return self.end_call(event),
            E::BargeIn => {
                if self.state == S::Barred {
                    // Repeated barge-in while debouncing is idempotent.
                    return FsmAction::None;
                }
                self.context.barge_in_count += 1;
                self.transition(event, S::Barred);
                self.reset_turn();
                return FsmAction::CancelAndResume {
                    debounce: BARGE_IN_DEBOUNCE,
                };
            }
            E::Error => {
                self.transition(event, S::Barred);
                self.reset_turn();
                return FsmAction::ResumeAfter {
                    backoff: ERROR_BACKOFF,
                };
            }
            _ => {}
        }

        match (self.state, event) {
            (S::Listening, E::AudioChunk) => {
                self.last_activity = Instant::now();
                FsmAction::None
            }
            (S::Listening, E::SttFinal) => {
                self.t_stt = Some(Instant::now());
                self.transition(event, S::Thinking);
                FsmAction::None
            }
            (S::Thinking, E::LlmToken) => {
                self.t_first_token = Some(Instant::now());
                self.transition(event, S::Speaking);
                FsmAction::None
            }
            (S::Thinking, E::LlmComplete) => {
                // Completion without a single token: broken turn.
                warn!(call_id = %self.call_id, "llm_complete without tokens");
                self.transition(CallFsmEvent::Error, S::Barred);
                self.reset_turn();
                FsmAction::ResumeAfter {
                    backoff: ERROR_BACKOFF,
                }
            }
            (S::Speaking, E::LlmToken | E::LlmComplete) => {
                self.last_activity = Instant::now();
                FsmAction::None
            }
            (S::Speaking, E::TtsAudio) => {
                if self.t_first_audio.is_none() {
                    self.t_first_audio = Some(Instant::now());
                }
                self.last_activity = Instant::now();
                FsmAction::None
            }
            (S::Speaking, E::TtsComplete) => {
                let metrics = self.turn_metrics();
                self.transition(event, S::Listening);
                self.reset_turn();
                FsmAction::TurnComplete(metrics)
            }
            (S::Barred, E::Resume) => {
                self.transition(event, S::Listening);
                FsmAction::None
            }
            (S::Barred, E::AudioChunk) => {
                // Dropped silently while input is suppressed.
                FsmAction::None
            }
            (_, ev) => self.invalid(ev),
        }
    }
}
