//! TOM: low-latency realtime voice agent gateway.
//!
//! The gateway terminates authenticated telephony-bridge WebSocket
//! sessions carrying PCM16/16 kHz audio and drives each call through a
//! cascaded STT → LLM → TTS turn:
//!
//! Client audio → WS gateway → realtime session (local or provider, with
//! failover) → per-call FSM → synthesized frames back to the client.
//!
//! # Architecture
//!
//! - **gateway**: admission, JWT auth with replay protection, frame
//!   gates, per-connection frame loop / pump / sender tasks
//! - **session**: unified realtime session contract with local and
//!   provider backends plus a failover decorator
//! - **fsm**: per-call state machine with barge-in and latency accounting
//! - **rl**: Thompson-sampling policy bandit behind a deploy guard, with
//!   end-of-call reward credit assignment
//! - **security**: JWT validation, nonce replay store, caller-line hashing
//! - **metrics**: the Prometheus exposition surface

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod fsm;
pub mod gateway;
pub mod metrics;
pub mod registry;
pub mod rl;
pub mod security;
pub mod session;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{GatewayState, build_router};
pub use rl::PolicyRouter;
