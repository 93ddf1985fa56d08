//! RL policy routing: bandit selection, deploy guard, reward credit.

pub mod bandit;
pub mod deploy;
pub mod feedback;
pub mod reward;

pub use bandit::{PolicyBandit, PolicyVariant, SelectionContext, VariantStats};
pub use deploy::{DeployConfig, DeployGuard};
pub use reward::{FeedbackSignals, RewardCalculator, RewardConfig};

use crate::config::RlConfig;
use crate::error::Result;
use crate::metrics;
use tracing::{info, warn};

/// Facade over the deploy guard and reward calculator.
///
/// One router exists per process, injected into the gateway state; all
/// mutation goes through its lock so bandit/deploy files have a single
/// writer.
pub struct PolicyRouter {
    guard: DeployGuard,
    reward: RewardCalculator,
}

impl PolicyRouter {
    /// Build the router from config: construct the bandit, register the
    /// configured variants, wrap the deploy guard around both.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed variant ids.
    pub fn from_config(config: &RlConfig) -> Result<Self> {
        let bandit = PolicyBandit::new(&config.bandit_state_path);
        let mut guard = DeployGuard::new(config.deploy.clone(), &config.deploy_state_path, bandit)?;
        for spec in &config.variants {
            let variant = PolicyVariant {
                id: spec.id.clone(),
                name: spec.name.clone(),
                parameters: spec.parameters.clone(),
                description: spec.description.clone(),
            };
            if let Err(e) = guard.add_variant(variant) {
                warn!("skipping configured variant {}: {e}", spec.id);
            }
        }
        Ok(Self {
            guard,
            reward: RewardCalculator::new(config.reward.clone()),
        })
    }

    /// Build a router around an existing guard (tests, tools).
    pub fn with_guard(guard: DeployGuard, reward: RewardCalculator) -> Self {
        Self { guard, reward }
    }

    /// Pick the policy variant for a new call.
    pub fn select(&mut self, context: Option<&SelectionContext>) -> String {
        self.guard.select_for_deployment(context)
    }

    /// Close the reward loop for a finished call: score the signals,
    /// update the bandit posterior, and publish the RL metrics.
    pub fn complete(&mut self, variant: &str, profile: &str, signals: &FeedbackSignals) -> f64 {
        let reward = self.reward.calc_reward(signals);
        self.guard.bandit_mut().update(variant, reward);

        metrics::reward(variant, reward);
        metrics::session_duration(variant, signals.duration_sec);
        metrics::feedback(variant, profile);
        if let Some(rating) = signals.user_rating {
            metrics::user_rating(variant, rating);
        }
        metrics::exploration_rate(self.guard.bandit().exploration_rate());

        info!(
            variant,
            "reward {reward:.3} applied after {:.0}s call",
            signals.duration_sec
        );
        reward
    }

    /// Flush persisted state (shutdown path).
    ///
    /// # Errors
    ///
    /// Returns the first persistence error encountered.
    pub fn flush(&self) -> Result<()> {
        self.guard.bandit().save()?;
        self.guard.save()
    }

    /// Access the guard for operational queries.
    pub fn guard(&self) -> &DeployGuard {
        &self.guard
    }

    /// Mutable access to the guard (variant management).
    pub fn guard_mut(&mut self) -> &mut DeployGuard {
        &mut self.guard
    }
}
