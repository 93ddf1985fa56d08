//! Reward computation from end-of-call feedback signals.
//!
//! The reward is a pure function of the signals: same input, same output,
//! always within [-1, +1].

use serde::{Deserialize, Serialize};

/// Signals collected over one finished call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSignals {
    /// Whether the caller's concern was resolved.
    pub resolution: bool,
    /// Explicit 1..=5 rating, when the caller gave one.
    pub user_rating: Option<u8>,
    /// Times the caller interrupted the agent.
    pub barge_in_count: u32,
    /// Times the agent had to repeat itself.
    pub repeats: u32,
    /// Whether the call was handed over to a human.
    pub handover: bool,
    /// Call duration in seconds.
    pub duration_sec: f64,
}

/// Weights for the reward formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub resolution_weight: f64,
    pub rating_weight: f64,
    pub barge_in_weight: f64,
    pub repeats_weight: f64,
    pub handover_weight: f64,
    /// Call length with the maximum duration bonus, in seconds.
    pub optimal_duration_sec: f64,
    /// Bonus magnitude at the optimum (and penalty cap far from it).
    pub duration_bonus_max: f64,
    pub min_reward: f64,
    pub max_reward: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            resolution_weight: 0.6,
            rating_weight: 0.2,
            barge_in_weight: -0.1,
            repeats_weight: -0.1,
            handover_weight: -0.1,
            optimal_duration_sec: 180.0,
            duration_bonus_max: 0.2,
            min_reward: -1.0,
            max_reward: 1.0,
        }
    }
}

/// Per-summand breakdown for auditing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardComponents {
    pub resolution: f64,
    pub rating: f64,
    pub barge_in: f64,
    pub repeats: f64,
    pub handover: f64,
    pub duration: f64,
    /// Clamped sum of the components.
    pub total: f64,
}

/// Deterministic, bounded scoring of a finished call.
#[derive(Debug, Clone, Default)]
pub struct RewardCalculator {
    config: RewardConfig,
}

impl RewardCalculator {
    /// Build a calculator with the given weights.
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    /// Compute the scalar reward in [-1, +1].
    pub fn calc_reward(&self, signals: &FeedbackSignals) -> f64 {
        self.components(signals).total
    }

    /// Compute each summand plus the clamped total.
    pub fn components(&self, signals: &FeedbackSignals) -> RewardComponents {
        let cfg = &self.config;

        let resolution = if signals.resolution {
            cfg.resolution_weight
        } else {
            0.0
        };

        // 1→-1, 3→0, 5→+1
        let rating = signals
            .user_rating
            .map(|r| cfg.rating_weight * (f64::from(r) - 3.0) / 2.0)
            .unwrap_or(0.0);

        let barge_in = cfg.barge_in_weight * f64::from(signals.barge_in_count.min(3)) / 3.0;
        let repeats = cfg.repeats_weight * f64::from(signals.repeats.min(3)) / 3.0;

        let handover = if signals.handover {
            cfg.handover_weight
        } else {
            0.0
        };

        let duration = self.duration_bonus(signals.duration_sec);

        let total = (resolution + rating + barge_in + repeats + handover + duration)
            .clamp(cfg.min_reward, cfg.max_reward);

        RewardComponents {
            resolution,
            rating,
            barge_in,
            repeats,
            handover,
            duration,
            total,
        }
    }

    /// Duration bonus: maximal at the optimum, linear falloff, clamped to
    /// ±`duration_bonus_max`. Zero and negative durations earn nothing.
    pub fn duration_bonus(&self, duration_sec: f64) -> f64 {
        if duration_sec <= 0.0 {
            return 0.0;
        }
        let cfg = &self.config;
        let deviation = (duration_sec - cfg.optimal_duration_sec).abs();
        let bonus = cfg.duration_bonus_max * (1.0 - deviation / cfg.optimal_duration_sec);
        bonus.clamp(-cfg.duration_bonus_max, cfg.duration_bonus_max)
    }
}
