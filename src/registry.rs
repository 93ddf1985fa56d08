//! Active-session registry.
//!
//! Enforces at most one live session per `call_id`, drives the
//! active-calls gauge (clamped at zero), and retains ended records for a
//! grace period before the final purge.

use ::metrics::gauge;
use crate::error::{GatewayError, Result};
use crate::metrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Registry entry for one call.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub call_id: String,
    pub policy_variant: String,
    /// Hashed caller line, when a CLI was presented.
    pub cli_hash: Option<String>,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
}

/// Process-wide map of live and recently ended calls.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    active_calls: AtomicI64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a call. Fails when the `call_id` already has a session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Session`] on a duplicate `call_id`.
    pub fn insert(
        &self,
        call_id: &str,
        policy_variant: &str,
        cli_hash: Option<String>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sessions.get(call_id)
            && existing.ended_at.is_none()
        {
            return Err(GatewayError::Session(format!(
                "session already active for call {call_id}"
            )));
        }
        sessions.insert(
            call_id.to_owned(),
            SessionRecord {
                call_id: call_id.to_owned(),
                policy_variant: policy_variant.to_owned(),
                cli_hash,
                started_at: Instant::now(),
                ended_at: None,
            },
        );
        let active = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!(metrics::CALLS_ACTIVE).set(active as f64);
        Ok(())
    }

    /// Mark a call torn down: decrement the gauge (never below zero) and
    /// stamp the record for the grace purge.
    pub fn teardown(&self, call_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = sessions.get_mut(call_id) else {
            return;
        };
        if record.ended_at.is_some() {
            return;
        }
        record.ended_at = Some(Instant::now());

        // Decrement underflow is swallowed; the gauge floors at zero.
        let previous = self.active_calls.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            self.active_calls.fetch_add(1, Ordering::SeqCst);
        }
        let active = self.active_calls.load(Ordering::SeqCst).max(0);
        gauge!(metrics::CALLS_ACTIVE).set(active as f64);
    }

    /// Fetch a copy of a record.
    pub fn get(&self, call_id: &str) -> Option<SessionRecord> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(call_id)
            .cloned()
    }

    /// Number of live (not yet torn down) sessions.
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.ended_at.is_none())
            .count()
    }

    /// Drop ended records older than `grace`.
    pub fn purge_expired(&self, grace: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, record| match record.ended_at {
            Some(ended) => ended.elapsed() < grace,
            None => true,
        });
        before - sessions.len()
    }

    /// Spawn the periodic grace purger.
    pub fn spawn_purger(
        self: Arc<Self>,
        grace: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = self.purge_expired(grace);
                        if purged > 0 {
                            debug!("purged {purged} ended session records");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_call_id_is_rejected() {
        let registry = SessionRegistry::new();
        registry.insert("c1", "v1a", None).unwrap();
        assert!(registry.insert("c1", "v1a", None).is_err());
    }

    #[test]
    fn teardown_allows_reuse_and_keeps_record() {
        let registry = SessionRegistry::new();
        registry.insert("c1", "v1a", None).unwrap();
        registry.teardown("c1");
        assert_eq!(registry.active_count(), 0);
        assert!(registry.get("c1").is_some());
        // A new session for the same call id is admitted after teardown.
        registry.insert("c1", "v2a", None).unwrap();
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn double_teardown_does_not_underflow() {
        let registry = SessionRegistry::new();
        registry.insert("c1", "v1a", None).unwrap();
        registry.teardown("c1");
        registry.teardown("c1");
        assert_eq!(registry.active_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn purge_removes_only_ended_records() {
        let registry = SessionRegistry::new();
        registry.insert("live", "v1a", None).unwrap();
        registry.insert("done", "v1a", None).unwrap();
        registry.teardown("done");
        let purged = registry.purge_expired(Duration::ZERO);
        assert_eq!(purged, 1);
        assert!(registry.get("live").is_some());
        assert!(registry.get("done").is_none());
    }

    #[test]
    fn cli_hash_is_stored_on_the_record() {
        let registry = SessionRegistry::new();
        registry
            .insert("c1", "v1a", Some("abcdef123456".to_owned()))
            .unwrap();
        assert_eq!(
            registry.get("c1").unwrap().cli_hash.as_deref(),
            Some("abcdef123456")
        );
    }
}
