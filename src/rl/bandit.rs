//! Thompson-sampling policy bandit.
//!
//! Each variant carries a Beta(α, β) posterior over "this call went well".
//! Selection draws one sample per variant and picks the argmax; rewards in
//! [-1, +1] are rescaled to [0, 1] and folded into the posterior. State is
//! persisted as a single JSON object, written atomically.

use crate::error::{GatewayError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A named, parameterized behavior configuration selected per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVariant {
    /// Identifier matching `^v\d+[a-z]$`.
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

/// Informational context passed to selection; logged, not yet used for
/// conditioning (the interface reserves it for a contextual extension).
#[derive(Debug, Clone)]
pub struct SelectionContext {
    pub profile: String,
    pub time_of_day: String,
}

/// Persisted posterior state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BanditState {
    pub alpha: BTreeMap<String, f64>,
    pub beta: BTreeMap<String, f64>,
    pub total_rewards: BTreeMap<String, f64>,
    pub total_pulls: BTreeMap<String, u64>,
    pub last_updated: f64,
}

/// Point-in-time statistics for one variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantStats {
    pub pulls: u64,
    pub total_reward: f64,
    pub mean_reward: f64,
    pub alpha: f64,
    pub beta: f64,
    /// Posterior mean α/(α+β); 0 before the first pull.
    pub confidence: f64,
}

/// Returns whether `id` matches the variant id shape `^v\d+[a-z]$`.
pub fn is_valid_variant_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix('v') else {
        return false;
    };
    let Some(last) = rest.chars().last() else {
        return false;
    };
    if !last.is_ascii_lowercase() {
        return false;
    }
    let digits = &rest[..rest.len() - 1];
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Thompson-sampling bandit over registered policy variants.
pub struct PolicyBandit {
    state_path: PathBuf,
    variants: BTreeMap<String, PolicyVariant>,
    state: BanditState,
    rng: StdRng,
}

impl PolicyBandit {
    /// Create a bandit persisting to `state_path`, loading prior state if
    /// present. A corrupt state file is discarded with a warning.
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self::with_rng(state_path, StdRng::from_entropy())
    }

    /// Create a bandit with a fixed RNG seed (deterministic selection).
    pub fn with_seed(state_path: impl Into<PathBuf>, seed: u64) -> Self {
        Self::with_rng(state_path, StdRng::seed_from_u64(seed))
    }

    fn with_rng(state_path: impl Into<PathBuf>, rng: StdRng) -> Self {
        let state_path = state_path.into();
        let state = Self::load_state(&state_path);
        Self {
            state_path,
            variants: BTreeMap::new(),
            state,
            rng,
        }
    }

    fn load_state(path: &Path) -> BanditState {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(_) => {
                info!("no bandit state at {}, starting from priors", path.display());
                return BanditState::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "corrupt bandit state at {} ({e}), starting from priors",
                    path.display()
                );
                BanditState::default()
            }
        }
    }

    /// Register a variant. Idempotent: an already-known id keeps its
    /// posterior untouched.
    ///
    /// # Errors
    ///
    /// Returns an error when the id does not match the required shape.
    pub fn add_variant(&mut self, variant: PolicyVariant) -> Result<()> {
        if !is_valid_variant_id(&variant.id) {
            return Err(GatewayError::Policy(format!(
                "invalid variant id: {}",
                variant.id
            )));
        }
        let id = variant.id.clone();
        self.variants.insert(id.clone(), variant);
        if !self.state.alpha.contains_key(&id) {
            self.state.alpha.insert(id.clone(), 1.0);
            self.state.beta.insert(id.clone(), 1.0);
            self.state.total_rewards.insert(id.clone(), 0.0);
            self.state.total_pulls.insert(id.clone(), 0);
        }
        info!("policy variant registered: {id}");
        Ok(())
    }

    /// Ids of all registered variants.
    pub fn variant_ids(&self) -> Vec<String> {
        self.variants.keys().cloned().collect()
    }

    /// Whether `id` is registered.
    pub fn knows(&self, id: &str) -> bool {
        self.variants.contains_key(id)
    }

    /// Thompson-sample across all registered variants.
    ///
    /// # Errors
    ///
    /// Returns an error when no variants are registered.
    pub fn select(&mut self, context: Option<&SelectionContext>) -> Result<String> {
        let ids = self.variant_ids();
        if let Some(ctx) = context {
            debug!(
                profile = %ctx.profile,
                time_of_day = %ctx.time_of_day,
                "selection context"
            );
        }
        self.select_among(&ids)
    }

    /// Thompson-sample restricted to `candidates`.
    ///
    /// Unknown candidates are skipped; an empty effective set is an error.
    pub fn select_among(&mut self, candidates: &[String]) -> Result<String> {
        let mut best: Option<(String, f64)> = None;
        for id in candidates {
            if !self.variants.contains_key(id) {
                continue;
            }
            let alpha = self.state.alpha.get(id).copied().unwrap_or(1.0);
            let beta = self.state.beta.get(id).copied().unwrap_or(1.0);
            let sample = match Beta::new(alpha, beta) {
                Ok(dist) => dist.sample(&mut self.rng),
                Err(e) => {
                    warn!("degenerate posterior for {id} (α={alpha}, β={beta}): {e}");
                    0.5
                }
            };
            if best.as_ref().is_none_or(|(_, s)| sample > *s) {
                best = Some((id.clone(), sample));
            }
        }
        match best {
            Some((id, sample)) => {
                debug!("policy selected: {id} (sample {sample:.3})");
                Ok(id)
            }
            None => Err(GatewayError::Policy(
                "no policy variants available".to_owned(),
            )),
        }
    }

    /// Fold a reward in [-1, +1] into the variant's posterior and persist.
    ///
    /// Unknown variants are logged and ignored.
    pub fn update(&mut self, variant_id: &str, reward: f64) {
        if !self.variants.contains_key(variant_id) {
            warn!("reward for unknown policy variant: {variant_id}");
            return;
        }

        let normalized = ((reward + 1.0) / 2.0).clamp(0.0, 1.0);
        if let Some(alpha) = self.state.alpha.get_mut(variant_id) {
            *alpha += normalized;
        }
        if let Some(beta) = self.state.beta.get_mut(variant_id) {
            *beta += 1.0 - normalized;
        }
        if let Some(total) = self.state.total_rewards.get_mut(variant_id) {
            *total += reward;
        }
        if let Some(pulls) = self.state.total_pulls.get_mut(variant_id) {
            *pulls += 1;
        }
        self.state.last_updated = unix_now_f64();

        debug!("bandit updated: {variant_id} reward {reward:.3}");

        if let Err(e) = self.save() {
            warn!("failed to persist bandit state: {e}");
        }
    }

    /// Statistics for one variant, `None` when unknown.
    pub fn stats(&self, variant_id: &str) -> Option<VariantStats> {
        if !self.variants.contains_key(variant_id) {
            return None;
        }
        let pulls = self.state.total_pulls.get(variant_id).copied().unwrap_or(0);
        let total_reward = self
            .state
            .total_rewards
            .get(variant_id)
            .copied()
            .unwrap_or(0.0);
        let alpha = self.state.alpha.get(variant_id).copied().unwrap_or(1.0);
        let beta = self.state.beta.get(variant_id).copied().unwrap_or(1.0);
        let (mean_reward, confidence) = if pulls == 0 {
            (0.0, 0.0)
        } else {
            (total_reward / pulls as f64, alpha / (alpha + beta))
        };
        Some(VariantStats {
            pulls,
            total_reward,
            mean_reward,
            alpha,
            beta,
            confidence,
        })
    }

    /// Statistics for every registered variant.
    pub fn all_stats(&self) -> BTreeMap<String, VariantStats> {
        self.variants
            .keys()
            .filter_map(|id| self.stats(id).map(|s| (id.clone(), s)))
            .collect()
    }

    /// Mean posterior variance across variants: how much the bandit is
    /// still exploring.
    pub fn exploration_rate(&self) -> f64 {
        if self.variants.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .variants
            .keys()
            .map(|id| {
                let alpha = self.state.alpha.get(id).copied().unwrap_or(1.0);
                let beta = self.state.beta.get(id).copied().unwrap_or(1.0);
                (alpha * beta) / ((alpha + beta).powi(2) * (alpha + beta + 1.0))
            })
            .sum();
        sum / self.variants.len() as f64
    }

    /// Reset one variant's posterior to the uninformative prior.
    pub fn reset_variant(&mut self, variant_id: &str) {
        if !self.variants.contains_key(variant_id) {
            return;
        }
        self.state.alpha.insert(variant_id.to_owned(), 1.0);
        self.state.beta.insert(variant_id.to_owned(), 1.0);
        self.state.total_rewards.insert(variant_id.to_owned(), 0.0);
        self.state.total_pulls.insert(variant_id.to_owned(), 0);
        info!("policy variant reset: {variant_id}");
        if let Err(e) = self.save() {
            warn!("failed to persist bandit state: {e}");
        }
    }

    /// Persist the posterior atomically (write temp, then rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written or renamed.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.state_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.state)
            .map_err(|e| GatewayError::State(format!("cannot serialize bandit state: {e}")))?;
        let tmp = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }
}

fn unix_now_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn variant(id: &str) -> PolicyVariant {
        PolicyVariant {
            id: id.to_owned(),
            name: format!("variant {id}"),
            parameters: BTreeMap::new(),
            description: String::new(),
        }
    }

    fn temp_bandit(seed: u64) -> (tempfile::TempDir, PolicyBandit) {
        let dir = tempfile::tempdir().unwrap();
        let bandit = PolicyBandit::with_seed(dir.path().join("bandit_state.json"), seed);
        (dir, bandit)
    }

    #[test]
    fn variant_id_shape() {
        assert!(is_valid_variant_id("v1a"));
        assert!(is_valid_variant_id("v42z"));
        assert!(!is_valid_variant_id("v1"));
        assert!(!is_valid_variant_id("1a"));
        assert!(!is_valid_variant_id("va"));
        assert!(!is_valid_variant_id("v1A"));
        assert!(!is_valid_variant_id("v1ab"));
        assert!(!is_valid_variant_id(""));
    }

    #[test]
    fn add_variant_is_idempotent() {
        let (_dir, mut bandit) = temp_bandit(1);
        bandit.add_variant(variant("v1a")).unwrap();
        bandit.update("v1a", 1.0);
        let before = bandit.stats("v1a").unwrap();
        bandit.add_variant(variant("v1a")).unwrap();
        assert_eq!(bandit.stats("v1a").unwrap(), before);
    }

    #[test]
    fn invalid_id_is_rejected() {
        let (_dir, mut bandit) = temp_bandit(1);
        assert!(bandit.add_variant(variant("bogus")).is_err());
    }

    #[test]
    fn select_on_empty_set_errors() {
        let (_dir, mut bandit) = temp_bandit(1);
        assert!(bandit.select(None).is_err());
    }

    #[test]
    fn posterior_mass_grows_by_one_per_update() {
        let (_dir, mut bandit) = temp_bandit(1);
        bandit.add_variant(variant("v1a")).unwrap();
        for i in 0..10 {
            let reward = if i % 2 == 0 { 1.0 } else { -0.5 };
            bandit.update("v1a", reward);
        }
        let stats = bandit.stats("v1a").unwrap();
        assert!(stats.alpha >= 1.0);
        assert!(stats.beta >= 1.0);
        assert!((stats.alpha + stats.beta - 12.0).abs() < 1e-9);
        assert_eq!(stats.pulls, 10);
    }

    #[test]
    fn unknown_variant_update_is_a_noop() {
        let (_dir, mut bandit) = temp_bandit(1);
        bandit.add_variant(variant("v1a")).unwrap();
        bandit.update("v9z", 1.0);
        assert_eq!(bandit.stats("v1a").unwrap().pulls, 0);
    }

    #[test]
    fn good_rewards_dominate_selection() {
        let (_dir, mut bandit) = temp_bandit(7);
        bandit.add_variant(variant("v1a")).unwrap();
        bandit.add_variant(variant("v2a")).unwrap();
        for _ in 0..50 {
            bandit.update("v1a", 1.0);
            bandit.update("v2a", -1.0);
        }
        let mut wins = 0;
        for _ in 0..100 {
            if bandit.select(None).unwrap() == "v1a" {
                wins += 1;
            }
        }
        assert!(wins > 90, "v1a only selected {wins}/100 times");
    }

    #[test]
    fn persisted_state_reproduces_selection_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bandit_state.json");

        let mut first = PolicyBandit::with_seed(&path, 42);
        first.add_variant(variant("v1a")).unwrap();
        first.add_variant(variant("v2a")).unwrap();
        first.update("v1a", 0.8);
        first.update("v2a", -0.3);
        let sequence: Vec<String> = (0..20).map(|_| first.select(None).unwrap()).collect();

        let mut reloaded = PolicyBandit::with_seed(&path, 42);
        reloaded.add_variant(variant("v1a")).unwrap();
        reloaded.add_variant(variant("v2a")).unwrap();
        // Updates consume no RNG draws, so a reload with the same seed
        // and the persisted posterior replays the same selections.
        let replay: Vec<String> = (0..20).map(|_| reloaded.select(None).unwrap()).collect();
        assert_eq!(sequence, replay);
    }

    #[test]
    fn corrupt_state_file_starts_from_priors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bandit_state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let mut bandit = PolicyBandit::with_seed(&path, 1);
        bandit.add_variant(variant("v1a")).unwrap();
        let stats = bandit.stats("v1a").unwrap();
        assert!((stats.alpha - 1.0).abs() < f64::EPSILON);
        assert!((stats.beta - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exploration_rate_shrinks_with_evidence() {
        let (_dir, mut bandit) = temp_bandit(1);
        bandit.add_variant(variant("v1a")).unwrap();
        let fresh = bandit.exploration_rate();
        for _ in 0..100 {
            bandit.update("v1a", 1.0);
        }
        assert!(bandit.exploration_rate() < fresh);
    }

    #[test]
    fn reset_restores_prior() {
        let (_dir, mut bandit) = temp_bandit(1);
        bandit.add_variant(variant("v1a")).unwrap();
        bandit.update("v1a", 1.0);
        bandit.reset_variant("v1a");
        let stats = bandit.stats("v1a").unwrap();
        assert_eq!(stats.pulls, 0);
        assert!((stats.alpha - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_confidence_is_posterior_mean() {
        let (_dir, mut bandit) = temp_bandit(1);
        bandit.add_variant(variant("v1a")).unwrap();
        bandit.update("v1a", 1.0);
        let stats = bandit.stats("v1a").unwrap();
        // α=2, β=1 after one full-reward update.
        assert!((stats.confidence - 2.0 / 3.0).abs() < 1e-9);
    }
}
