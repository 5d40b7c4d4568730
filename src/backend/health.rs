//! Health prober: bounded-time reachability checks that feed the registry.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::Result;

use super::client::InferenceBackend;
use super::registry::BackendRegistry;
use super::types::{Health, Tier};

/// Upper bound on a single probe, whatever the configuration says.
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default staleness bound for health samples.
pub const DEFAULT_HEALTH_TTL: Duration = Duration::from_secs(30);

/// Probes backends and records the result in the registry.
///
/// The prober is the only writer of health samples.
#[derive(Clone)]
pub struct HealthProber {
    registry: BackendRegistry,
    backend: Arc<dyn InferenceBackend>,
    probe_timeout: Duration,
    ttl: Duration,
}

impl HealthProber {
    pub fn new(registry: BackendRegistry, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            registry,
            backend,
            probe_timeout: MAX_PROBE_TIMEOUT,
            ttl: DEFAULT_HEALTH_TTL,
        }
    }

    /// Set the per-probe timeout, clamped to [`MAX_PROBE_TIMEOUT`].
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout.min(MAX_PROBE_TIMEOUT);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Probe one tier and record the sample.
    ///
    /// Returns within the probe timeout; a timeout reports `Unreachable`.
    #[instrument(skip(self))]
    pub async fn probe(&self, tier: Tier) -> Result<Health> {
        let descriptor = self.registry.get(tier)?;
        let health = match tokio::time::timeout(
            self.probe_timeout,
            self.backend.probe(&descriptor),
        )
        .await
        {
            Ok(health) => health,
            Err(_) => {
                warn!(
                    tier = %tier,
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "health probe timed out"
                );
                Health::Unreachable
            }
        };
        self.registry.mark_health(tier, health)?;
        debug!(tier = %tier, health = %health, "health sample recorded");
        Ok(health)
    }

    /// Probe every configured tier concurrently.
    pub async fn probe_all(&self) -> Vec<(Tier, Health)> {
        self.probe_tiers(self.registry.tiers()).await
    }

    /// Probe only tiers whose sample is missing or older than the TTL.
    pub async fn refresh_stale(&self) -> Vec<(Tier, Health)> {
        let now = Utc::now();
        let stale: Vec<Tier> = self
            .registry
            .list_tiers()
            .into_iter()
            .filter(|d| d.is_stale(self.ttl, now))
            .map(|d| d.tier)
            .collect();
        if stale.is_empty() {
            return Vec::new();
        }
        debug!(count = stale.len(), "refreshing stale health samples");
        self.probe_tiers(stale).await
    }

    async fn probe_tiers(&self, tiers: Vec<Tier>) -> Vec<(Tier, Health)> {
        let probes = tiers.into_iter().map(|tier| async move {
            // Tiers come from the registry, so lookup cannot fail.
            let health = self.probe(tier).await.unwrap_or(Health::Unknown);
            (tier, health)
        });
        join_all(probes).await
    }

    /// Probe all tiers on a fixed interval until `cancel` fires.
    pub fn spawn_background(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let prober = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("background health prober stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        prober.probe_all().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::client::BackendFailure;
    use crate::backend::BackendDescriptor;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend whose probe result is scripted per tier.
    struct ScriptedProbe {
        results: HashMap<Tier, Health>,
        hang: Option<Tier>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceBackend for ScriptedProbe {
        async fn generate(
            &self,
            _backend: &BackendDescriptor,
            _prompt: &str,
        ) -> std::result::Result<String, BackendFailure> {
            Err(BackendFailure::Backend("unused".into()))
        }

        async fn probe(&self, backend: &BackendDescriptor) -> Health {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang == Some(backend.tier) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.results
                .get(&backend.tier)
                .copied()
                .unwrap_or(Health::Reachable)
        }
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new(vec![
            BackendDescriptor::new(Tier::Fast, "http://fast", "m"),
            BackendDescriptor::new(Tier::Balanced, "http://balanced", "m"),
            BackendDescriptor::new(Tier::Smart, "http://smart", "m"),
        ])
        .unwrap()
    }

    fn scripted(results: &[(Tier, Health)], hang: Option<Tier>) -> Arc<ScriptedProbe> {
        Arc::new(ScriptedProbe {
            results: results.iter().copied().collect(),
            hang,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_probe_records_health() {
        let registry = registry();
        let backend = scripted(&[(Tier::Fast, Health::Unreachable)], None);
        let prober = HealthProber::new(registry.clone(), backend);

        assert_eq!(prober.probe(Tier::Fast).await.unwrap(), Health::Unreachable);
        assert_eq!(registry.health(Tier::Fast).unwrap(), Health::Unreachable);
        assert!(prober.probe(Tier::CloudPrimary).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_reports_unreachable_within_budget() {
        let registry = registry();
        let backend = scripted(&[], Some(Tier::Smart));
        let prober = HealthProber::new(registry.clone(), backend)
            .with_probe_timeout(Duration::from_secs(10));
        assert_eq!(prober.probe_timeout(), MAX_PROBE_TIMEOUT);

        let started = tokio::time::Instant::now();
        let health = prober.probe(Tier::Smart).await.unwrap();
        assert_eq!(health, Health::Unreachable);
        assert!(started.elapsed() <= MAX_PROBE_TIMEOUT + Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_refresh_stale_skips_fresh_samples() {
        let registry = registry();
        let backend = scripted(&[], None);
        let prober = HealthProber::new(registry.clone(), backend.clone());

        registry.mark_health(Tier::Fast, Health::Reachable).unwrap();
        registry
            .mark_health_at(
                Tier::Balanced,
                Health::Unreachable,
                Utc::now() - chrono::Duration::seconds(120),
            )
            .unwrap();

        let refreshed = prober.refresh_stale().await;
        let tiers: Vec<Tier> = refreshed.iter().map(|(t, _)| *t).collect();
        assert_eq!(tiers, vec![Tier::Balanced, Tier::Smart]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.health(Tier::Balanced).unwrap(), Health::Reachable);
    }

    #[tokio::test]
    async fn test_probe_all() {
        let registry = registry();
        let backend = scripted(&[(Tier::Balanced, Health::Unreachable)], None);
        let prober = HealthProber::new(registry.clone(), backend);

        let results = prober.probe_all().await;
        assert_eq!(results.len(), 3);
        assert!(results.contains(&(Tier::Balanced, Health::Unreachable)));
        assert_eq!(registry.health(Tier::Fast).unwrap(), Health::Reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_prober_stops_on_cancel() {
        let registry = registry();
        let backend = scripted(&[], None);
        let prober = HealthProber::new(registry.clone(), backend.clone());
        let cancel = CancellationToken::new();

        let handle = prober.spawn_background(Duration::from_secs(5), cancel.clone());
        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Ticks at 0s, 5s and 10s, three tiers each.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 9);
    }
}
