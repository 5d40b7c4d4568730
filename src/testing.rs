//! Shared test doubles.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{
    BackendDescriptor, BackendFailure, BackendRegistry, Health, InferenceBackend, Tier,
};

/// What a mock tier does when asked to generate.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(BackendFailure),
    /// Never answers
    Hang,
}

/// Backend scripted per tier. Unscripted tiers refuse connections and probe
/// as unreachable.
#[derive(Debug, Default)]
pub struct MockBackend {
    replies: HashMap<Tier, Reply>,
    probes: HashMap<Tier, Health>,
    calls: Mutex<Vec<Tier>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tier answers `text` and probes reachable.
    pub fn answering(mut self, tier: Tier, text: &str) -> Self {
        self.replies.insert(tier, Reply::Text(text.to_string()));
        self.probes.insert(tier, Health::Reachable);
        self
    }

    pub fn failing(mut self, tier: Tier, failure: BackendFailure) -> Self {
        self.replies.insert(tier, Reply::Fail(failure));
        self
    }

    pub fn hanging(mut self, tier: Tier) -> Self {
        self.replies.insert(tier, Reply::Hang);
        self
    }

    pub fn probing(mut self, tier: Tier, health: Health) -> Self {
        self.probes.insert(tier, health);
        self
    }

    /// Tiers asked to generate, in call order.
    pub fn calls(&self) -> Vec<Tier> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn generate(
        &self,
        backend: &BackendDescriptor,
        _prompt: &str,
    ) -> std::result::Result<String, BackendFailure> {
        self.calls.lock().unwrap().push(backend.tier);
        match self.replies.get(&backend.tier).cloned() {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(failure)) => Err(failure),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(BackendFailure::Timeout("hung".into()))
            }
            None => Err(BackendFailure::Connection("connection refused".into())),
        }
    }

    async fn probe(&self, backend: &BackendDescriptor) -> Health {
        self.probes
            .get(&backend.tier)
            .copied()
            .unwrap_or(Health::Unreachable)
    }
}

/// Registry with the given tiers on dummy endpoints.
pub fn registry(tiers: &[Tier]) -> BackendRegistry {
    BackendRegistry::new(
        tiers
            .iter()
            .map(|t| BackendDescriptor::new(*t, format!("http://{}.test", t), "test-model")),
    )
    .unwrap()
}
