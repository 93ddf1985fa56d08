//! Prometheus metrics surface.
//!
//! Metric names are contracts shared with dashboards and alerting; change
//! them only together with the monitoring stack.

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const CALLS_ACTIVE: &str = "tom_calls_active";
pub const REALTIME_BACKEND: &str = "tom_realtime_backend";
pub const PROVIDER_FAILOVER_TOTAL: &str = "tom_provider_failover_total";
pub const REALTIME_E2E_MS: &str = "tom_realtime_e2e_ms";
pub const STAGE_LATENCY_MS: &str = "tom_stage_latency_ms";
pub const HTTP_RESPONSES_TOTAL: &str = "tom_ws_gateway_http_responses_total";
pub const RATE_LIMIT_TOTAL: &str = "tom_ws_gateway_rate_limit_total";
pub const AUDIO_FRAMES_SENT_TOTAL: &str = "tom_audio_frames_sent_total";
pub const AUDIO_FRAMES_DROPPED_TOTAL: &str = "tom_audio_frames_dropped_total";
pub const BACKPRESSURE_EVENTS_TOTAL: &str = "tom_ws_backpressure_events_total";

pub const RL_POLICY_PULLS_TOTAL: &str = "rl_policy_pulls_total";
pub const RL_REWARD_DISTRIBUTION: &str = "rl_reward_distribution";
pub const RL_ACTIVE_VARIANTS: &str = "rl_active_variants_total";
pub const RL_BLACKLISTED_VARIANTS: &str = "rl_blacklisted_variants_total";
pub const RL_EXPLORATION_RATE: &str = "rl_bandit_exploration_rate";
pub const RL_FEEDBACK_TOTAL: &str = "rl_feedback_total";
pub const RL_ESCALATION_TOTAL: &str = "rl_escalation_total";
pub const RL_USER_RATING_DISTRIBUTION: &str = "rl_user_rating_distribution";
pub const RL_SESSION_DURATION_SECONDS: &str = "rl_session_duration_seconds";
pub const RL_BARGE_IN_TOTAL: &str = "rl_barge_in_total";

/// Install the global Prometheus recorder.
///
/// Call once from the binary before any metric is recorded. The returned
/// handle renders the exposition text for the `/metrics` route.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REALTIME_E2E_MS.to_owned()),
            &[50.0, 100.0, 200.0, 300.0, 500.0, 800.0, 1200.0, 2000.0, 5000.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(STAGE_LATENCY_MS.to_owned()),
            &[20.0, 50.0, 100.0, 200.0, 300.0, 500.0, 800.0, 1500.0, 3000.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(RL_REWARD_DISTRIBUTION.to_owned()),
            &[-1.0, -0.5, -0.2, 0.0, 0.2, 0.5, 0.8, 1.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(RL_USER_RATING_DISTRIBUTION.to_owned()),
            &[1.0, 2.0, 3.0, 4.0, 5.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(RL_SESSION_DURATION_SECONDS.to_owned()),
            &[30.0, 60.0, 120.0, 180.0, 300.0, 600.0, 900.0],
        )?
        .install_recorder()?;
    Ok(handle)
}

/// Record an HTTP gate outcome (admission rejections, upgrades).
pub fn http_response(code: u16) {
    counter!(HTTP_RESPONSES_TOTAL, "code" => code.to_string()).increment(1);
}

/// Record a rate-limit hit by gate type.
pub fn rate_limit_hit(kind: &'static str) {
    counter!(RATE_LIMIT_TOTAL, "type" => kind).increment(1);
}

/// Flip the backend gauges so exactly one backend reads 1.
pub fn set_backend(active_local: bool) {
    gauge!(REALTIME_BACKEND, "backend" => "local").set(if active_local { 1.0 } else { 0.0 });
    gauge!(REALTIME_BACKEND, "backend" => "provider").set(if active_local { 0.0 } else { 1.0 });
}

/// Count one provider→local cutover.
pub fn failover() {
    counter!(PROVIDER_FAILOVER_TOTAL).increment(1);
}

/// Record one synthesized frame delivered to the client.
pub fn audio_frame_sent() {
    counter!(AUDIO_FRAMES_SENT_TOTAL).increment(1);
}

/// Record one inbound frame dropped by backpressure.
pub fn audio_frame_dropped() {
    counter!(AUDIO_FRAMES_DROPPED_TOTAL).increment(1);
    counter!(BACKPRESSURE_EVENTS_TOTAL).increment(1);
}

/// Record a per-turn stage latency sample.
pub fn stage_latency(stage: &'static str, ms: f64) {
    histogram!(STAGE_LATENCY_MS, "stage" => stage).record(ms);
}

/// Record a per-turn end-to-end latency sample.
pub fn e2e_latency(ms: f64) {
    histogram!(REALTIME_E2E_MS).record(ms);
}

/// Record one policy selection.
pub fn policy_pull(variant: &str) {
    counter!(RL_POLICY_PULLS_TOTAL, "policy_variant" => variant.to_owned()).increment(1);
}

/// Record a computed reward for a variant.
pub fn reward(variant: &str, value: f64) {
    histogram!(RL_REWARD_DISTRIBUTION, "policy_variant" => variant.to_owned()).record(value);
}

/// Update the deploy guard population gauges.
pub fn variant_counts(active: usize, blacklisted: usize) {
    gauge!(RL_ACTIVE_VARIANTS).set(active as f64);
    gauge!(RL_BLACKLISTED_VARIANTS).set(blacklisted as f64);
}

/// Publish the bandit's current exploration rate.
pub fn exploration_rate(rate: f64) {
    gauge!(RL_EXPLORATION_RATE).set(rate);
}

/// Count a blacklist escalation for a variant.
pub fn escalation(variant: &str) {
    counter!(RL_ESCALATION_TOTAL, "policy_variant" => variant.to_owned()).increment(1);
}

/// Record an enriched end-of-call feedback event.
pub fn feedback(variant: &str, profile: &str) {
    counter!(RL_FEEDBACK_TOTAL, "policy_variant" => variant.to_owned(), "profile" => profile.to_owned())
        .increment(1);
}

/// Record a parsed user rating (1..=5).
pub fn user_rating(variant: &str, rating: u8) {
    histogram!(RL_USER_RATING_DISTRIBUTION, "policy_variant" => variant.to_owned())
        .record(f64::from(rating));
}

/// Record a finished call's duration.
pub fn session_duration(variant: &str, seconds: f64) {
    histogram!(RL_SESSION_DURATION_SECONDS, "policy_variant" => variant.to_owned()).record(seconds);
}

/// Count one barge-in for a variant.
pub fn barge_in(variant: &str) {
    counter!(RL_BARGE_IN_TOTAL, "policy_variant" => variant.to_owned()).increment(1);
}
