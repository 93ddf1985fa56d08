//! WebSocket realtime gateway: routing, shared state, backend wiring.

pub mod admission;
pub mod audio_queue;
pub mod handler;
pub mod limits;

use crate::config::{BackendMode, FallbackPolicy, GatewayConfig};
use crate::registry::SessionRegistry;
use crate::rl::PolicyRouter;
use crate::security::{JwtValidator, NonceStore};
use crate::session::failover::LocalFactory;
use crate::session::{
    FailoverSession, LocalRealtimeSession, ProviderRealtimeSession, RealtimeSession,
    SessionFactory,
};
use admission::Admission;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Mutex};

/// Shared state injected into every connection handler.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<SessionRegistry>,
    pub admission: Arc<Admission>,
    pub nonces: Arc<NonceStore>,
    pub jwt: Arc<JwtValidator>,
    pub policy: Arc<Mutex<PolicyRouter>>,
    pub sessions: Arc<SessionFactory>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl GatewayState {
    /// Assemble the state with the default (config-driven) backend factory.
    pub fn new(
        config: GatewayConfig,
        policy: PolicyRouter,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Self {
        let config = Arc::new(config);
        let nonces = Arc::new(NonceStore::new());
        let jwt = Arc::new(JwtValidator::new(&config.auth, Arc::clone(&nonces)));
        let sessions = default_session_factory(Arc::clone(&config));
        Self {
            admission: Arc::new(Admission::new(config.admission.clone())),
            registry: Arc::new(SessionRegistry::new()),
            nonces,
            jwt,
            policy: Arc::new(Mutex::new(policy)),
            sessions,
            metrics_handle,
            config,
        }
    }

    /// Replace the backend factory (tests inject scripted sessions here).
    pub fn with_session_factory(mut self, sessions: Arc<SessionFactory>) -> Self {
        self.sessions = sessions;
        self
    }
}

/// Build the per-call session per the configured backend and failover
/// policy: provider mode needs egress permission, and the default policy
/// wraps the provider with a local-failover decorator.
pub fn default_session_factory(config: Arc<GatewayConfig>) -> Arc<SessionFactory> {
    Arc::new(move |call_id: &str| -> Box<dyn RealtimeSession> {
        let realtime = &config.realtime;
        let provider_mode = realtime.backend == BackendMode::Provider && realtime.allow_egress;
        if !provider_mode {
            return Box::new(LocalRealtimeSession::new(call_id, realtime));
        }

        let provider = Box::new(ProviderRealtimeSession::new(
            call_id,
            realtime.provider.clone(),
        ));
        match realtime.fallback_policy {
            FallbackPolicy::ProviderThenLocal => {
                let local_config = Arc::clone(&config);
                let local_id = call_id.to_owned();
                let local: LocalFactory = Box::new(move || {
                    Box::new(LocalRealtimeSession::new(
                        local_id.clone(),
                        &local_config.realtime,
                    ))
                });
                Box::new(FailoverSession::new(provider, local, config.fallback.clone()))
            }
            FallbackPolicy::Fixed => provider,
        }
    })
}

/// Build the axum router serving the stream endpoint plus metrics/health.
pub fn build_router(state: GatewayState) -> Router {
    let stream_path = format!(
        "/{}/stream/{{call_id}}",
        state.config.listen.base_path.trim_matches('/')
    );
    Router::new()
        .route(&stream_path, any(handler::stream_handler))
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<GatewayState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
