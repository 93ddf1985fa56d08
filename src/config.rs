//! Configuration types for the voice gateway.
//!
//! All sections carry serde defaults so a partial config deserializes into
//! a fully usable value. `GatewayConfig::from_env()` maps the documented
//! environment keys onto the same structs for deployment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level configuration for the gateway process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address for the WebSocket/metrics server.
    pub listen: ListenConfig,
    /// Authentication settings (JWT + nonce replay protection).
    pub auth: AuthConfig,
    /// Connection admission gates (allowlists, connection rate).
    pub admission: AdmissionConfig,
    /// Per-connection frame/message/byte limits.
    pub limits: LimitsConfig,
    /// Realtime backend selection and engine endpoints.
    pub realtime: RealtimeConfig,
    /// Provider-to-local failover thresholds.
    pub fallback: FallbackConfig,
    /// RL policy routing (bandit, reward, deploy guard).
    pub rl: RlConfig,
    /// Caller-line hashing settings.
    pub phone: PhoneConfig,
    /// Session lifecycle settings.
    pub session: SessionLifecycleConfig,
}

/// Server listen settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind address, e.g. `0.0.0.0:8081`.
    pub addr: String,
    /// URL base segment for the stream endpoint (`/<base>/stream/{call_id}`).
    pub base_path: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8081".to_owned(),
            base_path: "ws".to_owned(),
        }
    }
}

/// JWT validation and replay protection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret. Required in production.
    pub jwt_secret: String,
    /// Expected `aud` claim.
    pub jwt_audience: String,
    /// Expected `iss` claim.
    pub jwt_issuer: String,
    /// Maximum allowed `exp - iat` and token age, in seconds.
    pub jwt_max_ttl_seconds: u64,
    /// Development bypass: accept connections without a JWT frame.
    pub dev_allow_no_jwt: bool,
    /// Nonce TTL for replay protection, in seconds.
    pub nonce_ttl_seconds: u64,
    /// How long to wait for the auth frame before closing, in seconds.
    pub handshake_timeout_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_audience: "tom-gateway".to_owned(),
            jwt_issuer: "tom-bridge".to_owned(),
            jwt_max_ttl_seconds: 60,
            dev_allow_no_jwt: false,
            nonce_ttl_seconds: 120,
            handshake_timeout_seconds: 5,
        }
    }
}

/// Admission gates applied before the WebSocket upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Allowed client IPs. Empty = open.
    pub ip_allowlist: Vec<String>,
    /// Allowed `Origin` header values. Empty = open.
    pub origin_allowlist: Vec<String>,
    /// New connections per IP per minute (sliding window).
    pub conn_per_min: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            ip_allowlist: Vec::new(),
            origin_allowlist: Vec::new(),
            conn_per_min: 30,
        }
    }
}

/// Per-connection frame limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Messages per second per connection (token window).
    pub msgs_per_sec: u32,
    /// Bytes per second per connection.
    pub bytes_per_sec: u32,
    /// Maximum size of a single inbound message, in bytes.
    pub max_frame_size: usize,
    /// Bounded audio queue depth, in 20 ms frames.
    pub max_audio_buffer_frames: usize,
    /// Close the connection after this many seconds without frames.
    pub idle_timeout_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            msgs_per_sec: 120,
            bytes_per_sec: 256 * 1024,
            max_frame_size: 64 * 1024,
            max_audio_buffer_frames: 50,
            idle_timeout_seconds: 30,
        }
    }
}

/// Which realtime backend serves new calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// External realtime provider over WebSocket (requires egress).
    Provider,
    /// On-prem STT/LLM/TTS pipeline.
    #[default]
    Local,
}

/// Failover policy between backends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Start on the provider, cut over to local on trouble.
    #[default]
    ProviderThenLocal,
    /// Stay on the configured backend, no cutover.
    Fixed,
}

/// Realtime backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Preferred backend for new sessions.
    pub backend: BackendMode,
    /// Whether outbound provider connections are permitted at all.
    pub allow_egress: bool,
    /// Failover behavior.
    pub fallback_policy: FallbackPolicy,
    /// Mode strings reported to the client in the `connected` frame.
    pub stt_mode: String,
    pub llm_mode: String,
    pub tts_mode: String,
    /// Provider connection details.
    pub provider: ProviderConfig,
    /// Local engine endpoints.
    pub engines: EngineConfig,
    /// Local pipeline end-of-utterance detection.
    pub endpointing: EndpointingConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendMode::Local,
            allow_egress: false,
            fallback_policy: FallbackPolicy::ProviderThenLocal,
            stt_mode: "local".to_owned(),
            llm_mode: "local".to_owned(),
            tts_mode: "local".to_owned(),
            provider: ProviderConfig::default(),
            engines: EngineConfig::default(),
            endpointing: EndpointingConfig::default(),
        }
    }
}

/// External realtime provider connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider WebSocket URL.
    pub ws_url: String,
    /// Bearer token for the provider.
    pub api_key: String,
    /// Model identifier requested from the provider.
    pub model: String,
    /// Response language hint.
    pub language: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.openai.com/v1/realtime".to_owned(),
            api_key: String::new(),
            model: "gpt-4o-realtime-preview".to_owned(),
            language: "de".to_owned(),
        }
    }
}

/// On-prem engine endpoints for the local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// STT transcription service URL (accepts raw PCM16/16k).
    pub stt_url: String,
    /// OpenAI-compatible chat completions base URL (Ollama, vLLM, ...).
    pub llm_url: String,
    /// Model name passed to the LLM endpoint.
    pub llm_model: String,
    /// Optional bearer token for the LLM endpoint.
    pub llm_api_key: String,
    /// System prompt prefix for the assistant.
    pub system_prompt: String,
    /// TTS synthesis service URL (returns raw PCM16/16k).
    pub tts_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stt_url: "http://127.0.0.1:9010/transcribe".to_owned(),
            llm_url: "http://127.0.0.1:11434".to_owned(),
            llm_model: "qwen3:14b".to_owned(),
            llm_api_key: String::new(),
            system_prompt: "You are a helpful phone assistant. Answer briefly, \
                            in a friendly tone, and keep replies under 50 words."
                .to_owned(),
            tts_url: "http://127.0.0.1:9020/synthesize".to_owned(),
        }
    }
}

/// End-of-utterance detection for the local backend.
///
/// The local pipeline commits the utterance buffer to STT after observing
/// enough consecutive sub-threshold frames following real speech.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointingConfig {
    /// RMS threshold (i16 scale) above which a frame counts as speech.
    pub speech_rms_threshold: f32,
    /// Consecutive silent frames ending an utterance (25 × 20 ms = 500 ms).
    pub silence_frames: u32,
    /// Minimum speech frames for a committable utterance.
    pub min_speech_frames: u32,
}

impl Default for EndpointingConfig {
    fn default() -> Self {
        Self {
            speech_rms_threshold: 200.0,
            silence_frames: 25,
            min_speech_frames: 10,
        }
    }
}

/// Provider-to-local failover thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Provider errors within the window that trigger cutover.
    pub error_burst: u32,
    /// Error-counting window, in seconds.
    pub error_window_seconds: u64,
    /// p95 end-to-end latency (ms) that triggers cutover.
    pub trigger_ms: f64,
    /// Stay on local at least this long after cutover, in seconds.
    pub cooldown_seconds: u64,
    /// Number of recent e2e samples the p95 is computed over.
    pub latency_window: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            error_burst: 3,
            error_window_seconds: 60,
            trigger_ms: 800.0,
            cooldown_seconds: 600,
            latency_window: 50,
        }
    }
}

/// A policy variant registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpec {
    /// Variant id (must match `^v\d+[a-z]$`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Opaque behavior parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// RL policy routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RlConfig {
    /// Bandit posterior state file.
    pub bandit_state_path: String,
    /// Deploy guard state file.
    pub deploy_state_path: String,
    /// Reward function weights.
    pub reward: crate::rl::reward::RewardConfig,
    /// Deploy guard thresholds.
    pub deploy: crate::rl::deploy::DeployConfig,
    /// Variants registered at startup. The base variant is added implicitly
    /// if absent.
    pub variants: Vec<VariantSpec>,
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            bandit_state_path: "data/rl/bandit_state.json".to_owned(),
            deploy_state_path: "data/rl/deploy_state.json".to_owned(),
            reward: crate::rl::reward::RewardConfig::default(),
            deploy: crate::rl::deploy::DeployConfig::default(),
            variants: Vec::new(),
        }
    }
}

/// Caller-line hashing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// Country code prepended to national numbers, e.g. `+49`.
    pub default_country_code: String,
    /// Current hashing pepper. Must be set in production.
    pub pepper: String,
    /// Previous pepper kept during rotation.
    pub previous_pepper: Option<String>,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            default_country_code: "+49".to_owned(),
            pepper: String::new(),
            previous_pepper: None,
        }
    }
}

/// Session record lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLifecycleConfig {
    /// Grace period before an ended session record is purged, in seconds.
    pub grace_seconds: u64,
}

impl Default for SessionLifecycleConfig {
    fn default() -> Self {
        Self { grace_seconds: 300 }
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key)
        && !v.is_empty()
    {
        *target = v;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key)
        && let Ok(parsed) = v.parse()
    {
        *target = parsed;
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        *target = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
}

fn env_csv(key: &str, target: &mut Vec<String>) {
    if let Ok(v) = std::env::var(key) {
        *target = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
    }
}

impl GatewayConfig {
    /// Build a configuration from defaults overridden by environment keys.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        env_string("GATEWAY_LISTEN", &mut cfg.listen.addr);
        env_string("GATEWAY_BASE_PATH", &mut cfg.listen.base_path);

        env_string("JWT_SECRET", &mut cfg.auth.jwt_secret);
        env_string("JWT_AUDIENCE", &mut cfg.auth.jwt_audience);
        env_string("JWT_ISSUER", &mut cfg.auth.jwt_issuer);
        env_parse("JWT_MAX_TTL_SECONDS", &mut cfg.auth.jwt_max_ttl_seconds);
        env_bool("DEV_ALLOW_NO_JWT", &mut cfg.auth.dev_allow_no_jwt);

        env_csv("WS_GATEWAY_IP_ALLOWLIST", &mut cfg.admission.ip_allowlist);
        env_csv(
            "WS_GATEWAY_ORIGIN_ALLOWLIST",
            &mut cfg.admission.origin_allowlist,
        );
        env_parse("RATE_LIMIT_CONN_PER_MIN", &mut cfg.admission.conn_per_min);

        env_parse("RATE_LIMIT_MSGS_PER_SEC", &mut cfg.limits.msgs_per_sec);
        env_parse("RATE_LIMIT_BYTES_PER_SEC", &mut cfg.limits.bytes_per_sec);
        env_parse("MAX_FRAME_SIZE", &mut cfg.limits.max_frame_size);
        env_parse("WS_MAX_AUDIO_BUFFER", &mut cfg.limits.max_audio_buffer_frames);

        if let Ok(v) = std::env::var("REALTIME_BACKEND") {
            cfg.realtime.backend = match v.to_ascii_lowercase().as_str() {
                "provider" => BackendMode::Provider,
                _ => BackendMode::Local,
            };
        }
        env_bool("ALLOW_EGRESS", &mut cfg.realtime.allow_egress);
        if let Ok(v) = std::env::var("FALLBACK_POLICY") {
            cfg.realtime.fallback_policy = match v.to_ascii_lowercase().as_str() {
                "fixed" => FallbackPolicy::Fixed,
                _ => FallbackPolicy::ProviderThenLocal,
            };
        }
        env_string("REALTIME_STT", &mut cfg.realtime.stt_mode);
        env_string("REALTIME_LLM", &mut cfg.realtime.llm_mode);
        env_string("REALTIME_TTS", &mut cfg.realtime.tts_mode);
        env_string("REALTIME_WS_URL", &mut cfg.realtime.provider.ws_url);
        env_string("REALTIME_API_KEY", &mut cfg.realtime.provider.api_key);
        env_string("REALTIME_MODEL", &mut cfg.realtime.provider.model);
        env_string("REALTIME_LANGUAGE", &mut cfg.realtime.provider.language);
        env_string("STT_URL", &mut cfg.realtime.engines.stt_url);
        env_string("LLM_URL", &mut cfg.realtime.engines.llm_url);
        env_string("LLM_MODEL", &mut cfg.realtime.engines.llm_model);
        env_string("LLM_API_KEY", &mut cfg.realtime.engines.llm_api_key);
        env_string("TTS_URL", &mut cfg.realtime.engines.tts_url);

        env_parse("FALLBACK_ERROR_BURST", &mut cfg.fallback.error_burst);
        env_parse("FALLBACK_ERROR_WINDOW", &mut cfg.fallback.error_window_seconds);
        env_parse("FALLBACK_TRIGGER_MS", &mut cfg.fallback.trigger_ms);
        env_parse("FALLBACK_COOLDOWN_SEC", &mut cfg.fallback.cooldown_seconds);

        env_string("RL_BANDIT_STATE", &mut cfg.rl.bandit_state_path);
        env_string("RL_DEPLOY_STATE", &mut cfg.rl.deploy_state_path);

        env_string(
            "PHONE_DEFAULT_COUNTRY_CODE",
            &mut cfg.phone.default_country_code,
        );
        env_string("PHONE_HASH_SALT", &mut cfg.phone.pepper);
        if let Ok(v) = std::env::var("PHONE_HASH_SALT_PREVIOUS")
            && !v.is_empty()
        {
            cfg.phone.previous_pepper = Some(v);
        }

        cfg
    }

    /// Validate production invariants.
    ///
    /// # Errors
    ///
    /// Returns an error when auth is enabled without a JWT secret.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !self.auth.dev_allow_no_jwt && self.auth.jwt_secret.is_empty() {
            return Err(crate::error::GatewayError::Config(
                "JWT_SECRET is required unless DEV_ALLOW_NO_JWT is set".to_owned(),
            ));
        }
        Ok(())
    }
}
