//! Connection admission gates, applied before the WebSocket upgrade.
//!
//! Three cheap checks in order: IP allowlist, Origin allowlist, and a
//! per-IP sliding-window connection rate limit.

use crate::config::AdmissionConfig;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CONN_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of the admission gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allow,
    /// Policy rejection (403); carries the gate that fired.
    DenyPolicy(&'static str),
    /// Connection-rate rejection (429).
    DenyRate,
}

/// Stateful admission checker shared across connections.
#[derive(Debug)]
pub struct Admission {
    config: AdmissionConfig,
    conn_windows: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl Admission {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            conn_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Run the gates for one incoming connection attempt.
    pub fn check(&self, ip: IpAddr, origin: Option<&str>) -> AdmissionDecision {
        if !self.config.ip_allowlist.is_empty() {
            let allowed = self
                .config
                .ip_allowlist
                .iter()
                .any(|entry| entry.parse::<IpAddr>().is_ok_and(|a| a == ip));
            if !allowed {
                return AdmissionDecision::DenyPolicy("ip");
            }
        }

        if !self.config.origin_allowlist.is_empty() {
            let allowed = origin
                .is_some_and(|o| self.config.origin_allowlist.iter().any(|entry| entry == o));
            if !allowed {
                return AdmissionDecision::DenyPolicy("origin");
            }
        }

        let now = Instant::now();
        let mut windows = self.conn_windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(ip).or_default();
        while let Some(first) = window.front() {
            if now.duration_since(*first) > CONN_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.config.conn_per_min as usize {
            return AdmissionDecision::DenyRate;
        }
        window.push_back(now);
        AdmissionDecision::Allow
    }
}
