//! Tier selection: turns a query and the registry's health samples into the
//! ordered fallback sequence the dispatcher walks.
//!
//! Selection is pure; it reads the registry but performs no network calls.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{BackendRegistry, Health, Tier};
use crate::complexity::{ComplexityAssessment, ComplexityClassifier};
use crate::error::{Error, Result};
use crate::query::Query;

/// Ordered tiers to attempt for one query, plus why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPlan {
    /// Fallback order; never contains a tier twice
    pub tiers: Vec<Tier>,
    /// Tier the plan starts from before health filtering
    pub starting_tier: Tier,
    /// Whether the explicit override was honoured
    pub override_applied: bool,
    pub assessment: ComplexityAssessment,
    pub reason: String,
}

impl TierPlan {
    pub fn first(&self) -> Option<Tier> {
        self.tiers.first().copied()
    }
}

/// Picks a starting tier and builds the full fallback order.
#[derive(Debug, Clone, Default)]
pub struct TierSelector {
    classifier: ComplexityClassifier,
}

impl TierSelector {
    pub fn new(classifier: ComplexityClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &ComplexityClassifier {
        &self.classifier
    }

    /// Build the fallback sequence for `query`.
    ///
    /// Fails only when the explicit override names a tier the registry does
    /// not contain.
    pub fn select(&self, query: &Query, registry: &BackendRegistry) -> Result<TierPlan> {
        let configured = registry.tiers();
        let assessment = self.classifier.classify(query);

        let mut override_applied = false;
        let mut starting_tier = None;

        if let Some(requested) = query.explicit_tier_override {
            if !configured.contains(&requested) {
                return Err(Error::unknown_tier(requested));
            }
            if registry.health(requested)? != Health::Unreachable {
                starting_tier = Some(requested);
                override_applied = true;
            } else {
                debug!(tier = %requested, "override tier unreachable, using heuristics");
            }
        }

        let starting_tier = match starting_tier {
            Some(tier) => tier,
            None => nearest_configured(assessment.complexity.base_tier(), &configured),
        };

        let ordered = fallback_order(starting_tier, &configured);
        let tiers = filter_unreachable(&ordered, registry)?;

        let reason = format!(
            "{} -> start {} ({}), order [{}]",
            assessment.reason(),
            starting_tier,
            if override_applied { "override" } else { "heuristic" },
            tiers
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        );
        debug!(query_id = %query.id, %reason, "tier plan built");

        Ok(TierPlan {
            tiers,
            starting_tier,
            override_applied,
            assessment,
            reason,
        })
    }
}

/// The configured tier closest to `wanted`, preferring the next more capable
/// local tier, then the next less capable one, then the first configured.
fn nearest_configured(wanted: Tier, configured: &[Tier]) -> Tier {
    if configured.contains(&wanted) {
        return wanted;
    }
    let locals: Vec<Tier> = configured.iter().copied().filter(|t| t.is_local()).collect();
    locals
        .iter()
        .copied()
        .find(|t| *t > wanted)
        .or_else(|| locals.iter().rev().copied().find(|t| *t < wanted))
        .or_else(|| configured.first().copied())
        .unwrap_or(wanted)
}

/// Start tier, then more capable local tiers ascending, then the remaining
/// local tiers ascending, then cloud tiers in order. No duplicates.
fn fallback_order(start: Tier, configured: &[Tier]) -> Vec<Tier> {
    let mut order = vec![start];

    let locals = configured.iter().copied().filter(|t| t.is_local());
    let (above, below): (Vec<Tier>, Vec<Tier>) = locals
        .filter(|t| *t != start)
        .partition(|t| *t > start);

    order.extend(above);
    order.extend(below);
    order.extend(
        configured
            .iter()
            .copied()
            .filter(|t| t.is_cloud() && *t != start),
    );
    order
}

/// Drop tiers whose latest sample is `Unreachable`, keeping at least one
/// local attempt ahead of cloud since samples may be stale.
fn filter_unreachable(ordered: &[Tier], registry: &BackendRegistry) -> Result<Vec<Tier>> {
    let mut unreachable = Vec::new();
    for &tier in ordered {
        if registry.health(tier)? == Health::Unreachable {
            unreachable.push(tier);
        }
    }

    let forced_local = if ordered
        .iter()
        .filter(|t| t.is_local())
        .all(|t| unreachable.contains(t))
    {
        ordered.iter().copied().find(|t| t.is_local())
    } else {
        None
    };
    if let Some(tier) = forced_local {
        debug!(tier = %tier, "all local tiers unreachable, keeping one attempt");
    }

    Ok(ordered
        .iter()
        .copied()
        .filter(|t| Some(*t) == forced_local || !unreachable.contains(t))
        .collect())
}
