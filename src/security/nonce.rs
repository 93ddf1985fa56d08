//! In-process nonce store with set-if-absent semantics and TTL expiry.
//!
//! Replay protection needs an atomic "claim this nonce once" operation.
//! A single-instance deployment can serve this from an embedded map; the
//! store interface mirrors a KV SETNX-with-TTL so a shared store can be
//! swapped in for multi-instance setups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Expiring set of claimed nonces.
#[derive(Debug, Default)]
pub struct NonceStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl NonceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `nonce` for `ttl`.
    ///
    /// Returns `true` when the nonce was free (claim succeeded), `false`
    /// when it is already held and unexpired (replay).
    pub fn set_if_absent(&self, nonce: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(nonce) {
            Some(expiry) if *expiry > now => false,
            _ => {
                entries.insert(nonce.to_owned(), now + ttl);
                true
            }
        }
    }

    /// Drop expired entries.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, expiry| *expiry > now);
        before - entries.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn a periodic sweeper that runs until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!("nonce sweeper removed {removed} expired entries");
                        }
                    }
                }
            }
        })
    }
}
