//! Dispatcher: walks the tier sequence one attempt at a time until a backend
//! answers.
//!
//! Attempts are strictly sequential in the order given. A tier is never tried
//! twice for the same prompt, and the first success ends the walk. Failed
//! attempts advance immediately to the next tier with no backoff, since the
//! next tier is a different endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendFailure, BackendRegistry, InferenceBackend, Tier};
use crate::error::{Error, Result};

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    ConnectionError,
    BackendError,
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        self == AttemptOutcome::Success
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::ConnectionError => write!(f, "connection-error"),
            Self::BackendError => write!(f, "backend-error"),
        }
    }
}

/// One backend call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub tier: Tier,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    /// Failure description; `None` on success
    pub detail: Option<String>,
}

/// A successful dispatch: every attempt made, the last one being the success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub attempts: Vec<DispatchAttempt>,
    /// Raw backend text
    pub response: String,
}

impl DispatchResult {
    /// Tier that produced the response.
    pub fn succeeded_tier(&self) -> Option<Tier> {
        self.attempts
            .last()
            .filter(|a| a.outcome.is_success())
            .map(|a| a.tier)
    }

    /// Attempts that failed before the success.
    pub fn failed_attempts(&self) -> &[DispatchAttempt] {
        match self.attempts.split_last() {
            Some((_, failed)) => failed,
            None => &[],
        }
    }
}

/// Counters over every backend request a dispatcher has made.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// One per attempt, so a fallback chain counts each tier it tried
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Mean latency of successful requests
    pub avg_response_time_ms: f64,
}

impl DispatchStats {
    pub fn record_success(&mut self, latency_ms: u64) {
        self.total_requests += 1;
        self.successful_requests += 1;

        let n = self.successful_requests as f64;
        self.avg_response_time_ms = ((n - 1.0) * self.avg_response_time_ms + latency_ms as f64) / n;
    }

    pub fn record_failure(&mut self) {
        self.total_requests += 1;
        self.failed_requests += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Sends prompts to backends along a fallback sequence.
///
/// Clones share one set of [`DispatchStats`].
#[derive(Clone)]
pub struct Dispatcher {
    registry: BackendRegistry,
    backend: Arc<dyn InferenceBackend>,
    stats: Arc<RwLock<DispatchStats>>,
}

impl Dispatcher {
    pub fn new(registry: BackendRegistry, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            registry,
            backend,
            stats: Arc::new(RwLock::new(DispatchStats::default())),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, outcome: AttemptOutcome, latency_ms: u64) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        if outcome.is_success() {
            stats.record_success(latency_ms);
        } else {
            stats.record_failure();
        }
    }

    /// Dispatch without cancellation.
    pub async fn dispatch(&self, prompt: &str, tiers: &[Tier]) -> Result<DispatchResult> {
        self.dispatch_cancellable(prompt, tiers, &CancellationToken::new())
            .await
    }

    /// Try each tier in order until one succeeds.
    ///
    /// Returns [`Error::DispatchExhausted`] carrying every attempt when no tier
    /// answers, and [`Error::Cancelled`] if `cancel` fires first. A request
    /// already in flight when cancellation arrives runs to completion in the
    /// background and its result is discarded.
    #[instrument(skip(self, prompt, cancel), fields(tiers = ?tiers, prompt_chars = prompt.len()))]
    pub async fn dispatch_cancellable(
        &self,
        prompt: &str,
        tiers: &[Tier],
        cancel: &CancellationToken,
    ) -> Result<DispatchResult> {
        let mut attempts: Vec<DispatchAttempt> = Vec::with_capacity(tiers.len());
        let mut tried = HashSet::new();

        for &tier in tiers {
            if !tried.insert(tier) {
                debug!(tier = %tier, "tier already attempted, skipping");
                continue;
            }
            if cancel.is_cancelled() {
                info!(attempts = attempts.len(), "dispatch cancelled");
                return Err(Error::Cancelled);
            }

            let descriptor = self.registry.get(tier)?;
            let timeout = descriptor.timeout;
            let backend = Arc::clone(&self.backend);
            let request = prompt.to_string();

            let started_at = Utc::now();
            let start = Instant::now();
            let handle = tokio::spawn(async move {
                tokio::time::timeout(timeout, backend.generate(&descriptor, &request)).await
            });

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(tier = %tier, "dispatch cancelled, in-flight request discarded");
                    return Err(Error::Cancelled);
                }
                joined = handle => joined,
            };

            let (outcome, detail, response) = match joined {
                Ok(Ok(Ok(text))) if text.trim().is_empty() => (
                    AttemptOutcome::BackendError,
                    Some("empty response".to_string()),
                    None,
                ),
                Ok(Ok(Ok(text))) => (AttemptOutcome::Success, None, Some(text)),
                Ok(Ok(Err(BackendFailure::Timeout(msg)))) => {
                    (AttemptOutcome::Timeout, Some(msg), None)
                }
                Ok(Ok(Err(BackendFailure::Connection(msg)))) => {
                    (AttemptOutcome::ConnectionError, Some(msg), None)
                }
                Ok(Ok(Err(BackendFailure::Backend(msg)))) => {
                    (AttemptOutcome::BackendError, Some(msg), None)
                }
                Ok(Err(_elapsed)) => (
                    AttemptOutcome::Timeout,
                    Some(format!("no response within {}s", timeout.as_secs())),
                    None,
                ),
                Err(join_err) => (
                    AttemptOutcome::BackendError,
                    Some(format!("request task failed: {}", join_err)),
                    None,
                ),
            };

            let latency_ms = start.elapsed().as_millis() as u64;
            self.record(outcome, latency_ms);
            attempts.push(DispatchAttempt {
                tier,
                started_at,
                outcome,
                latency_ms,
                detail: detail.clone(),
            });

            match response {
                Some(response) => {
                    info!(tier = %tier, latency_ms, attempt = attempts.len(), "dispatch succeeded");
                    return Ok(DispatchResult {
                        attempts,
                        response,
                    });
                }
                None => warn!(
                    tier = %tier,
                    %outcome,
                    latency_ms,
                    detail = detail.as_deref().unwrap_or(""),
                    "attempt failed, falling back"
                ),
            }
        }

        warn!(attempts = attempts.len(), "all tiers exhausted");
        Err(Error::exhausted(attempts))
    }
}
