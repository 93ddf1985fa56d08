//! Failover decorator: provider first, on-prem pipeline on trouble.
//!
//! Wraps a provider session and cuts over to a locally constructed
//! session when the provider misbehaves: an error burst inside the
//! window, a rolling p95 end-to-end latency above the trigger, or a
//! failure to open at all. After cutover the session stays on local; no
//! automatic return to the provider is attempted.

use crate::config::FallbackConfig;
use crate::error::Result;
use crate::metrics;
use crate::session::{BackendKind, ControlCommand, RealtimeSession, SessionEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Builds the replacement local session at cutover time.
pub type LocalFactory = Box<dyn Fn() -> Box<dyn RealtimeSession> + Send>;

/// Provider session with automatic local failover.
pub struct FailoverSession {
    config: FallbackConfig,
    backend: Box<dyn RealtimeSession>,
    local_factory: LocalFactory,
    on_local: bool,
    errors: VecDeque<Instant>,
    e2e_samples: VecDeque<f64>,
    cutover_at: Option<Instant>,
}

impl FailoverSession {
    /// Wrap `provider`, holding `local_factory` in reserve.
    pub fn new(
        provider: Box<dyn RealtimeSession>,
        local_factory: LocalFactory,
        config: FallbackConfig,
    ) -> Self {
        Self {
            config,
            backend: provider,
            local_factory,
            on_local: false,
            errors: VecDeque::new(),
            e2e_samples: VecDeque::new(),
            cutover_at: None,
        }
    }

    /// Whether the session has cut over to the local pipeline.
    pub fn on_local(&self) -> bool {
        self.on_local
    }

    /// When the cutover happened, if it did.
    pub fn cutover_at(&self) -> Option<Instant> {
        self.cutover_at
    }

    /// Record one provider-path error; returns whether the burst threshold
    /// is now reached.
    fn record_error(&mut self) -> bool {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.error_window_seconds);
        while let Some(first) = self.errors.front() {
            if now.duration_since(*first) > window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
        self.errors.push_back(now);
        self.errors.len() >= self.config.error_burst as usize
    }

    fn p95(&self) -> Option<f64> {
        if self.e2e_samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.e2e_samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    async fn observe_latency(&mut self, ms: f64) {
        self.e2e_samples.push_back(ms);
        while self.e2e_samples.len() > self.config.latency_window {
            self.e2e_samples.pop_front();
        }
        if self.on_local {
            return;
        }
        if let Some(p95) = self.p95()
            && p95 > self.config.trigger_ms
        {
            warn!("e2e p95 {p95:.0}ms above {:.0}ms", self.config.trigger_ms);
            if let Err(e) = self.cutover("latency_trigger").await {
                warn!("latency-triggered cutover failed: {e}");
            }
        }
    }

    /// Close the provider (best-effort), open the local replacement, and
    /// route everything there from now on.
    async fn cutover(&mut self, reason: &str) -> Result<()> {
        if self.on_local {
            return Ok(());
        }
        warn!("cutting over to local backend ({reason})");

        if let Err(e) = self.backend.close().await {
            warn!("provider close during cutover: {e}");
        }
        // Queued provider output dies with the old backend; the in-flight
        // turn counts as cancelled.
        let mut local = (self.local_factory)();
        local.open().await?;
        self.backend = local;
        self.on_local = true;
        self.cutover_at = Some(Instant::now());

        metrics::failover();
        metrics::set_backend(true);
        info!(
            "local backend active (cooldown {}s before any re-evaluation)",
            self.config.cooldown_seconds
        );
        Ok(())
    }

    async fn handle_provider_error(&mut self, context: &str) -> Result<()> {
        if self.on_local {
            return Ok(());
        }
        if self.record_error() {
            warn!(
                "provider error burst ({} in {}s) during {context}",
                self.errors.len(),
                self.config.error_window_seconds
            );
            self.cutover("error_burst").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RealtimeSession for FailoverSession {
    async fn open(&mut self) -> Result<()> {
        match self.backend.open().await {
            Ok(()) => {
                metrics::set_backend(self.on_local);
                Ok(())
            }
            Err(e) if !self.on_local => {
                warn!("provider open failed ({e}), failing over immediately");
                self.cutover("open_failure").await
            }
            Err(e) => Err(e),
        }
    }

    async fn send_audio(&mut self, frame: Vec<u8>, timestamp: f64) -> Result<()> {
        match self.backend.send_audio(frame.clone(), timestamp).await {
            Ok(()) => Ok(()),
            Err(e) if !self.on_local => {
                warn!("provider send_audio failed: {e}");
                self.handle_provider_error("send_audio").await?;
                if self.on_local {
                    // The frame rides on the new backend instead.
                    self.backend.send_audio(frame, timestamp).await
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn send_event(&mut self, command: ControlCommand) -> Result<()> {
        match self.backend.send_event(command).await {
            Ok(()) => Ok(()),
            Err(e) if !self.on_local => {
                warn!("provider send_event failed: {e}");
                self.handle_provider_error("send_event").await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.backend.next_event().await;
        if let Some(SessionEvent::Error { message, .. }) = &event
            && !self.on_local
        {
            warn!("provider event error: {message}");
            if let Err(e) = self.handle_provider_error("recv").await {
                warn!("cutover after recv error failed: {e}");
            }
        }
        event
    }

    async fn cancel(&mut self) -> Result<()> {
        self.backend.cancel().await
    }

    async fn close(&mut self) -> Result<()> {
        self.backend.close().await
    }

    async fn observe_e2e(&mut self, ms: f64) {
        self.observe_latency(ms).await;
    }

    fn kind(&self) -> BackendKind {
        self.backend.kind()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::error::GatewayError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider stub whose operations always fail.
    struct FailingProvider {
        open_fails: bool,
    }

    #[async_trait]
    impl RealtimeSession for FailingProvider {
        async fn open(&mut self) -> Result<()> {
            if self.open_fails {
                Err(GatewayError::Session("connect refused".to_owned()))
            } else {
                Ok(())
            }
        }

        async fn send_audio(&mut self, _frame: Vec<u8>, _ts: f64) -> Result<()> {
            Err(GatewayError::Session("broken pipe".to_owned()))
        }

        async fn send_event(&mut self, _command: ControlCommand) -> Result<()> {
            Err(GatewayError::Session("broken pipe".to_owned()))
        }

        async fn next_event(&mut self) -> Option<SessionEvent> {
            std::future::pending().await
        }

        async fn cancel(&mut self) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Provider
        }
    }

    /// Healthy local stub counting received frames.
    struct CountingLocal {
        frames: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RealtimeSession for CountingLocal {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        async fn send_audio(&mut self, _frame: Vec<u8>, _ts: f64) -> Result<()> {
            self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_event(&mut self, _command: ControlCommand) -> Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<SessionEvent> {
            std::future::pending().await
        }

        async fn cancel(&mut self) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }
    }

    fn factory(frames: Arc<AtomicU32>) -> LocalFactory {
        Box::new(move || {
            Box::new(CountingLocal {
                frames: Arc::clone(&frames),
            })
        })
    }

    fn fast_config() -> FallbackConfig {
        FallbackConfig {
            error_burst: 3,
            error_window_seconds: 60,
            trigger_ms: 800.0,
            cooldown_seconds: 600,
            latency_window: 10,
        }
    }

    #[tokio::test]
    async fn open_failure_cuts_over_immediately() {
        let frames = Arc::new(AtomicU32::new(0));
        let mut session = FailoverSession::new(
            Box::new(FailingProvider { open_fails: true }),
            factory(Arc::clone(&frames)),
            fast_config(),
        );
        session.open().await.unwrap();
        assert!(session.on_local());
        assert_eq!(session.kind(), BackendKind::Local);
    }

    #[tokio::test]
    async fn error_burst_cuts_over_and_audio_continues() {
        let frames = Arc::new(AtomicU32::new(0));
        let mut session = FailoverSession::new(
            Box::new(FailingProvider { open_fails: false }),
            factory(Arc::clone(&frames)),
            fast_config(),
        );
        session.open().await.unwrap();
        assert!(!session.on_local());

        // Two failures stay under the burst threshold.
        session.send_audio(vec![0; 640], 0.0).await.unwrap();
        session.send_audio(vec![0; 640], 0.1).await.unwrap();
        assert!(!session.on_local());

        // The third failure trips the burst; the frame is retried locally.
        session.send_audio(vec![0; 640], 0.2).await.unwrap();
        assert!(session.on_local());
        assert_eq!(frames.load(Ordering::SeqCst), 1);

        session.send_audio(vec![0; 640], 0.3).await.unwrap();
        assert_eq!(frames.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn latency_p95_breach_cuts_over() {
        let frames = Arc::new(AtomicU32::new(0));
        let mut session = FailoverSession::new(
            Box::new(FailingProvider { open_fails: false }),
            factory(Arc::clone(&frames)),
            fast_config(),
        );
        session.open().await.unwrap();

        for _ in 0..10 {
            session.observe_e2e(900.0).await;
        }
        assert!(session.on_local());
    }

    #[tokio::test]
    async fn healthy_latency_stays_on_provider() {
        let frames = Arc::new(AtomicU32::new(0));
        let mut session = FailoverSession::new(
            Box::new(FailingProvider { open_fails: false }),
            factory(Arc::clone(&frames)),
            fast_config(),
        );
        session.open().await.unwrap();

        for _ in 0..50 {
            session.observe_e2e(150.0).await;
        }
        assert!(!session.on_local());
    }

    #[tokio::test]
    async fn local_errors_do_not_retrigger_cutover() {
        let frames = Arc::new(AtomicU32::new(0));
        let mut session = FailoverSession::new(
            Box::new(FailingProvider { open_fails: true }),
            factory(Arc::clone(&frames)),
            fast_config(),
        );
        session.open().await.unwrap();
        assert!(session.on_local());
        let cutover = session.cutover_at().unwrap();

        for _ in 0..10 {
            session.send_audio(vec![0; 640], 0.0).await.unwrap();
            session.observe_e2e(2000.0).await;
        }
        assert_eq!(session.cutover_at().unwrap(), cutover);
    }
}
