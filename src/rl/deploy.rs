//! Deploy guard: governs which policy variants receive live traffic.
//!
//! The guard keeps two disjoint sets over variant ids. `active` always
//! contains the base variant; `blacklisted` collects variants whose mean
//! reward fell below the threshold after enough evaluation pulls. New and
//! low-confidence variants receive fixed traffic slices; the remainder is
//! delegated to the bandit restricted to eligible variants.

use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::rl::bandit::{PolicyBandit, PolicyVariant, SelectionContext, VariantStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Deploy guard thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Always-available fallback variant; never blacklisted or removed.
    pub base_variant: String,
    /// Traffic share reserved for variants with few pulls.
    pub traffic_split_new: f64,
    /// Additional share for evaluated but low-confidence variants.
    pub traffic_split_uncertain: f64,
    /// Mean reward below which an evaluated variant is blacklisted.
    pub blacklist_threshold_reward: f64,
    /// Pulls required before a variant counts as evaluated.
    pub min_pulls_for_evaluation: u64,
    /// Confidence below which an evaluated variant counts as uncertain.
    pub uncertainty_threshold_confidence: f64,
    /// Maximum non-base active variants.
    pub max_active_variants: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            base_variant: "v1a".to_owned(),
            traffic_split_new: 0.10,
            traffic_split_uncertain: 0.20,
            blacklist_threshold_reward: -0.2,
            min_pulls_for_evaluation: 20,
            uncertainty_threshold_confidence: 0.60,
            max_active_variants: 5,
        }
    }
}

/// Persisted guard state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeployStateFile {
    active_variants: Vec<String>,
    blacklisted_variants: Vec<String>,
    last_update: String,
}

/// Health classification for one variant.
#[derive(Debug, Clone, Serialize)]
pub struct VariantHealth {
    pub variant_id: String,
    pub is_active: bool,
    pub is_blacklisted: bool,
    pub is_new: bool,
    pub is_uncertain: bool,
    /// One of `blacklisted`, `new`, `uncertain`, `stable`, `inactive`.
    pub health: &'static str,
    pub stats: Option<VariantStats>,
}

/// Governs bandit traffic across active/new/uncertain/blacklisted variants.
pub struct DeployGuard {
    config: DeployConfig,
    state_path: PathBuf,
    bandit: PolicyBandit,
    active: BTreeSet<String>,
    blacklisted: BTreeSet<String>,
    rng: StdRng,
}

impl DeployGuard {
    /// Build a guard around `bandit`, loading persisted sets from
    /// `state_path`. The base variant is registered and activated
    /// unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if the base variant id is malformed.
    pub fn new(
        config: DeployConfig,
        state_path: impl Into<PathBuf>,
        bandit: PolicyBandit,
    ) -> Result<Self> {
        Self::with_rng(config, state_path, bandit, StdRng::from_entropy())
    }

    /// Deterministic construction for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the base variant id is malformed.
    pub fn with_seed(
        config: DeployConfig,
        state_path: impl Into<PathBuf>,
        bandit: PolicyBandit,
        seed: u64,
    ) -> Result<Self> {
        Self::with_rng(config, state_path, bandit, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        config: DeployConfig,
        state_path: impl Into<PathBuf>,
        mut bandit: PolicyBandit,
        rng: StdRng,
    ) -> Result<Self> {
        let state_path = state_path.into();
        let state = Self::load_state(&state_path);

        bandit.add_variant(PolicyVariant {
            id: config.base_variant.clone(),
            name: "base".to_owned(),
            parameters: Default::default(),
            description: "always-available fallback".to_owned(),
        })?;

        let mut active: BTreeSet<String> = state.active_variants.into_iter().collect();
        let mut blacklisted: BTreeSet<String> = state.blacklisted_variants.into_iter().collect();
        // The base is active by definition and can never be blacklisted.
        blacklisted.remove(&config.base_variant);
        active.insert(config.base_variant.clone());
        active.retain(|id| !blacklisted.contains(id));

        let guard = Self {
            config,
            state_path,
            bandit,
            active,
            blacklisted,
            rng,
        };
        guard.publish_gauges();
        Ok(guard)
    }

    fn load_state(path: &Path) -> DeployStateFile {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(_) => {
                info!("no deploy state at {}, starting fresh", path.display());
                return DeployStateFile::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "corrupt deploy state at {} ({e}), starting fresh",
                    path.display()
                );
                DeployStateFile::default()
            }
        }
    }

    /// Persist the sets atomically.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written or renamed.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.state_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let state = DeployStateFile {
            active_variants: self.active.iter().cloned().collect(),
            blacklisted_variants: self.blacklisted.iter().cloned().collect(),
            last_update: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| GatewayError::State(format!("cannot serialize deploy state: {e}")))?;
        let tmp = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    fn publish_gauges(&self) {
        metrics::variant_counts(self.active.len(), self.blacklisted.len());
    }

    fn is_new(&self, stats: &VariantStats) -> bool {
        stats.pulls < self.config.min_pulls_for_evaluation
    }

    fn is_uncertain(&self, stats: &VariantStats) -> bool {
        stats.pulls >= self.config.min_pulls_for_evaluation
            && stats.confidence < self.config.uncertainty_threshold_confidence
    }

    /// Move underperforming evaluated variants onto the blacklist.
    pub fn refresh_blacklist(&mut self) {
        let mut demoted: Vec<String> = Vec::new();
        for id in &self.active {
            if *id == self.config.base_variant {
                continue;
            }
            let Some(stats) = self.bandit.stats(id) else {
                continue;
            };
            if stats.pulls >= self.config.min_pulls_for_evaluation
                && stats.mean_reward < self.config.blacklist_threshold_reward
            {
                demoted.push(id.clone());
            }
        }
        if demoted.is_empty() {
            return;
        }
        for id in demoted {
            let stats = self.bandit.stats(&id);
            warn!(
                "variant {id} blacklisted (mean reward {:.3} over {} pulls)",
                stats.as_ref().map_or(0.0, |s| s.mean_reward),
                stats.as_ref().map_or(0, |s| s.pulls),
            );
            self.active.remove(&id);
            self.blacklisted.insert(id.clone());
            metrics::escalation(&id);
        }
        if let Err(e) = self.save() {
            warn!("failed to persist deploy state: {e}");
        }
        self.publish_gauges();
    }

    /// Select the policy variant for a new call.
    ///
    /// Never returns a blacklisted variant; falls back to the base when no
    /// other variant is eligible.
    pub fn select_for_deployment(&mut self, context: Option<&SelectionContext>) -> String {
        self.refresh_blacklist();

        let eligible: Vec<String> = self
            .active
            .iter()
            .filter(|id| !self.blacklisted.contains(*id))
            .cloned()
            .collect();

        if eligible.is_empty() {
            let base = self.config.base_variant.clone();
            metrics::policy_pull(&base);
            return base;
        }

        let mut new_variants = Vec::new();
        let mut uncertain_variants = Vec::new();
        for id in &eligible {
            let Some(stats) = self.bandit.stats(id) else {
                continue;
            };
            if self.is_new(&stats) {
                new_variants.push(id.clone());
            } else if self.is_uncertain(&stats) {
                uncertain_variants.push(id.clone());
            }
        }

        let roll: f64 = self.rng.r#gen();
        let selected = if !new_variants.is_empty() && roll < self.config.traffic_split_new {
            let pick = new_variants[self.rng.gen_range(0..new_variants.len())].clone();
            info!("new variant selected for exploration traffic: {pick}");
            pick
        } else if !uncertain_variants.is_empty()
            && roll < self.config.traffic_split_new + self.config.traffic_split_uncertain
        {
            let pick = uncertain_variants[self.rng.gen_range(0..uncertain_variants.len())].clone();
            info!("uncertain variant selected for evaluation traffic: {pick}");
            pick
        } else {
            match self.bandit.select_among(&eligible) {
                Ok(id) => id,
                Err(e) => {
                    warn!("bandit selection failed ({e}), using base variant");
                    self.config.base_variant.clone()
                }
            }
        };

        if let Some(ctx) = context {
            info!(
                variant = %selected,
                profile = %ctx.profile,
                "policy pull"
            );
        }
        metrics::policy_pull(&selected);
        selected
    }

    /// Register a variant and admit it to the active set.
    ///
    /// # Errors
    ///
    /// Returns an error when the variant is blacklisted or the active set
    /// is full (base excluded from the limit).
    pub fn add_variant(&mut self, variant: PolicyVariant) -> Result<()> {
        if self.blacklisted.contains(&variant.id) {
            return Err(GatewayError::Policy(format!(
                "variant {} is blacklisted",
                variant.id
            )));
        }
        let non_base_active = self
            .active
            .iter()
            .filter(|id| **id != self.config.base_variant)
            .count();
        if !self.active.contains(&variant.id) && non_base_active >= self.config.max_active_variants
        {
            return Err(GatewayError::Policy(format!(
                "active variant limit reached ({})",
                self.config.max_active_variants
            )));
        }
        let id = variant.id.clone();
        self.bandit.add_variant(variant)?;
        self.active.insert(id.clone());
        self.save()?;
        self.publish_gauges();
        info!("variant {id} added to deployment");
        Ok(())
    }

    /// Remove a variant from the active set. The base is never removable.
    ///
    /// # Errors
    ///
    /// Returns an error for the base variant or an inactive id.
    pub fn remove_variant(&mut self, variant_id: &str) -> Result<()> {
        if variant_id == self.config.base_variant {
            return Err(GatewayError::Policy(
                "base variant cannot be removed".to_owned(),
            ));
        }
        if !self.active.remove(variant_id) {
            return Err(GatewayError::Policy(format!(
                "variant {variant_id} is not active"
            )));
        }
        self.save()?;
        self.publish_gauges();
        info!("variant {variant_id} removed from deployment");
        Ok(())
    }

    /// Health classification for one variant.
    pub fn variant_health(&self, variant_id: &str) -> VariantHealth {
        let stats = self.bandit.stats(variant_id);
        let is_active = self.active.contains(variant_id);
        let is_blacklisted = self.blacklisted.contains(variant_id);
        let is_new = stats.as_ref().is_some_and(|s| self.is_new(s));
        let is_uncertain = stats.as_ref().is_some_and(|s| self.is_uncertain(s));
        let health = if is_blacklisted {
            "blacklisted"
        } else if !is_active {
            "inactive"
        } else if is_new {
            "new"
        } else if is_uncertain {
            "uncertain"
        } else {
            "stable"
        };
        VariantHealth {
            variant_id: variant_id.to_owned(),
            is_active,
            is_blacklisted,
            is_new,
            is_uncertain,
            health,
            stats,
        }
    }

    /// Currently active variant ids.
    pub fn active_variants(&self) -> Vec<String> {
        self.active.iter().cloned().collect()
    }

    /// Currently blacklisted variant ids.
    pub fn blacklisted_variants(&self) -> Vec<String> {
        self.blacklisted.iter().cloned().collect()
    }

    /// The configured base variant id.
    pub fn base_variant(&self) -> &str {
        &self.config.base_variant
    }

    /// Mutable access to the underlying bandit (reward updates).
    pub fn bandit_mut(&mut self) -> &mut PolicyBandit {
        &mut self.bandit
    }

    /// Shared access to the underlying bandit.
    pub fn bandit(&self) -> &PolicyBandit {
        &self.bandit
    }
}
