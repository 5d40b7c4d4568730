//! Backend registry: the only shared mutable state in the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};

use super::types::{BackendDescriptor, Health, Tier};

/// Concurrency-safe table of configured backends keyed by tier.
///
/// Cloning is cheap and shares the underlying state, so the same registry can
/// be handed to the health prober and to any number of concurrent pipelines.
/// Descriptors are fixed at construction; only health samples change.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Arc<RwLock<BTreeMap<Tier, BackendDescriptor>>>,
}

/// One row of [`BackendRegistry::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub tier: Tier,
    pub endpoint: String,
    pub model: String,
    pub health: Health,
    pub last_checked: Option<DateTime<Utc>>,
}

impl BackendRegistry {
    /// Build a registry from static descriptors.
    ///
    /// Fails if two descriptors claim the same tier.
    pub fn new(descriptors: impl IntoIterator<Item = BackendDescriptor>) -> Result<Self> {
        let mut backends = BTreeMap::new();
        for descriptor in descriptors {
            let tier = descriptor.tier;
            if backends.insert(tier, descriptor).is_some() {
                return Err(Error::Config(format!("duplicate backend for tier {}", tier)));
            }
        }
        Ok(Self {
            backends: Arc::new(RwLock::new(backends)),
        })
    }

    /// All descriptors in fallback priority order.
    pub fn list_tiers(&self) -> Vec<BackendDescriptor> {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends.values().cloned().collect()
    }

    /// Configured tiers in fallback priority order.
    pub fn tiers(&self) -> Vec<Tier> {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends.keys().copied().collect()
    }

    pub fn contains(&self, tier: Tier) -> bool {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends.contains_key(&tier)
    }

    /// Look up one tier's descriptor.
    pub fn get(&self, tier: Tier) -> Result<BackendDescriptor> {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends
            .get(&tier)
            .cloned()
            .ok_or_else(|| Error::unknown_tier(tier))
    }

    /// Latest health sample for a tier.
    pub fn health(&self, tier: Tier) -> Result<Health> {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends
            .get(&tier)
            .map(|d| d.health)
            .ok_or_else(|| Error::unknown_tier(tier))
    }

    /// Record a health sample taken now.
    pub fn mark_health(&self, tier: Tier, health: Health) -> Result<()> {
        self.mark_health_at(tier, health, Utc::now())
    }

    /// Record a health sample taken at `checked_at`.
    pub fn mark_health_at(
        &self,
        tier: Tier,
        health: Health,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut backends = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        let descriptor = backends
            .get_mut(&tier)
            .ok_or_else(|| Error::unknown_tier(tier))?;
        descriptor.health = health;
        descriptor.last_checked = Some(checked_at);
        Ok(())
    }

    /// Serializable health table for status displays.
    pub fn snapshot(&self) -> Vec<HealthReport> {
        self.list_tiers()
            .into_iter()
            .map(|d| HealthReport {
                tier: d.tier,
                endpoint: d.endpoint,
                model: d.model,
                health: d.health,
                last_checked: d.last_checked,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> BackendRegistry {
        BackendRegistry::new(vec![
            BackendDescriptor::new(Tier::Smart, "http://localhost:11436", "qwen2.5:14b"),
            BackendDescriptor::new(Tier::Fast, "http://localhost:11434", "qwen2.5:3b"),
            BackendDescriptor::new(Tier::Balanced, "http://localhost:11435", "qwen2.5:7b"),
        ])
        .unwrap()
    }

    #[test]
    fn test_list_tiers_is_ordered() {
        let tiers: Vec<Tier> = registry().list_tiers().iter().map(|d| d.tier).collect();
        assert_eq!(tiers, vec![Tier::Fast, Tier::Balanced, Tier::Smart]);
    }

    #[test]
    fn test_get_unknown_tier() {
        let err = registry().get(Tier::CloudPrimary).unwrap_err();
        assert!(matches!(err, Error::UnknownTier { tier: Tier::CloudPrimary }));
        assert!(registry().mark_health(Tier::CloudPrimary, Health::Reachable).is_err());
    }

    #[test]
    fn test_duplicate_tier_rejected() {
        let result = BackendRegistry::new(vec![
            BackendDescriptor::new(Tier::Fast, "http://a", "m"),
            BackendDescriptor::new(Tier::Fast, "http://b", "m"),
        ]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_mark_health_is_shared_between_clones() {
        let registry = registry();
        let other = registry.clone();

        assert_eq!(registry.health(Tier::Fast).unwrap(), Health::Unknown);
        other.mark_health(Tier::Fast, Health::Unreachable).unwrap();

        let desc = registry.get(Tier::Fast).unwrap();
        assert_eq!(desc.health, Health::Unreachable);
        assert!(desc.last_checked.is_some());
    }

    #[test]
    fn test_concurrent_mark_health() {
        let registry = registry();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let health = if i % 2 == 0 {
                        Health::Reachable
                    } else {
                        Health::Unreachable
                    };
                    for _ in 0..100 {
                        registry.mark_health(Tier::Balanced, health).unwrap();
                        let _ = registry.list_tiers();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_ne!(registry.health(Tier::Balanced).unwrap(), Health::Unknown);
    }

    #[test]
    fn test_snapshot() {
        let registry = registry();
        registry.mark_health(Tier::Smart, Health::Reachable).unwrap();
        let report = registry.snapshot();
        assert_eq!(report.len(), 3);
        assert_eq!(report[2].tier, Tier::Smart);
        assert_eq!(report[2].health, Health::Reachable);
        assert_eq!(report[0].model, "qwen2.5:3b");
    }
}
