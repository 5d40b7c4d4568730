//! Caller-facing entry point: one query in, one structured result out.
//!
//! ```text
//! query ─▶ health refresh ─▶ tier plan ─▶ augment ─▶ dispatch ─▶ parse ─▶ classify
//! ```
//!
//! Only tier lookup errors, exhaustion, and cancellation reach the caller.
//! Everything else degrades in place.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::action::{Action, ActionClassifier};
use crate::augment::{AugmentedPrompt, ContextAugmenter};
use crate::backend::{BackendRegistry, HealthProber, InferenceBackend, Tier};
use crate::capability::CapabilityTable;
use crate::config::SynthConfig;
use crate::dispatch::{DispatchAttempt, DispatchStats, Dispatcher};
use crate::error::{Error, Result};
use crate::parser::{ResponseParser, StructuredResult};
use crate::query::{ContextHint, Query};
use crate::router::{TierPlan, TierSelector};

/// Everything produced while answering one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub result: StructuredResult,
    pub action: Action,
    /// Every dispatch attempt, the last one successful
    pub attempts: Vec<DispatchAttempt>,
    pub plan: TierPlan,
    pub prompt: AugmentedPrompt,
}

impl QueryOutcome {
    /// Tier that produced the answer.
    pub fn source(&self) -> Option<Tier> {
        self.result.source_attribution
    }
}

/// Wires the routing components together around a shared registry.
#[derive(Clone)]
pub struct Pipeline {
    registry: BackendRegistry,
    prober: HealthProber,
    selector: TierSelector,
    augmenter: ContextAugmenter,
    dispatcher: Dispatcher,
    parser: ResponseParser,
    classifier: ActionClassifier,
    /// Refresh stale health samples before each query
    lazy_probing: bool,
    /// Interval for [`Pipeline::spawn_configured_probing`]
    background_interval: Option<Duration>,
    /// Stops probers spawned by this pipeline
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Pipeline with default policies and no augmentation collaborators.
    pub fn new(registry: BackendRegistry, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            prober: HealthProber::new(registry.clone(), Arc::clone(&backend)),
            dispatcher: Dispatcher::new(registry.clone(), backend),
            registry,
            selector: TierSelector::default(),
            augmenter: ContextAugmenter::default(),
            parser: ResponseParser::default(),
            classifier: ActionClassifier::default(),
            lazy_probing: true,
            background_interval: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Pipeline built from configuration.
    ///
    /// Retrieval and web search collaborators are attached separately with
    /// [`Pipeline::with_augmenter`]; the built-in capabilities are registered.
    ///
    /// A configured background interval takes effect once
    /// [`Pipeline::spawn_configured_probing`] runs. Until then health is
    /// refreshed lazily before each query.
    pub fn from_config(config: &SynthConfig, backend: Arc<dyn InferenceBackend>) -> Result<Self> {
        config.validate()?;
        let registry = config.to_registry()?;
        let mut pipeline = Self::new(registry, backend);
        pipeline.prober = pipeline
            .prober
            .with_probe_timeout(config.health.probe_timeout())
            .with_ttl(config.health.ttl());
        pipeline.selector = TierSelector::new(config.routing.classifier());
        pipeline.augmenter = ContextAugmenter::new(config.augment.clone())
            .with_capabilities(CapabilityTable::with_builtins());
        pipeline.parser = ResponseParser::new(config.confidence);
        pipeline.classifier = ActionClassifier::new(config.confidence.auto_execute_threshold);
        pipeline.background_interval = config.health.background_interval();
        Ok(pipeline)
    }

    pub fn with_augmenter(mut self, augmenter: ContextAugmenter) -> Self {
        self.augmenter = augmenter;
        self
    }

    pub fn with_selector(mut self, selector: TierSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_parser(mut self, parser: ResponseParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_classifier(mut self, classifier: ActionClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Disable the per-query refresh of stale health samples, e.g. when a
    /// background prober is running.
    pub fn with_lazy_probing(mut self, enabled: bool) -> Self {
        self.lazy_probing = enabled;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    pub fn augmenter(&self) -> &ContextAugmenter {
        &self.augmenter
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Request counters for every dispatch made through this pipeline.
    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Probe all tiers on `interval` until `cancel` fires, and stop refreshing
    /// health per query.
    pub fn start_background_probing(
        &mut self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let handle = self.prober.spawn_background(interval, cancel);
        self.lazy_probing = false;
        handle
    }

    /// Start the background prober at the configured interval.
    ///
    /// Returns `None` and keeps lazy probing when no interval is configured.
    /// The prober runs until [`Pipeline::shutdown`].
    pub fn spawn_configured_probing(&mut self) -> Option<JoinHandle<()>> {
        let interval = self.background_interval?;
        info!(interval_secs = interval.as_secs(), "background health probing started");
        Some(self.start_background_probing(interval, self.shutdown.clone()))
    }

    /// Stop background probers started with [`Pipeline::spawn_configured_probing`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Answer a query.
    pub async fn handle_query(
        &self,
        raw_text: impl Into<String>,
        context_hints: Vec<ContextHint>,
        explicit_tier_override: Option<Tier>,
    ) -> Result<QueryOutcome> {
        let query = Query::new(raw_text)
            .with_hints(context_hints)
            .with_override(explicit_tier_override);
        self.handle(query, &CancellationToken::new()).await
    }

    /// Answer a query unless `cancel` fires first.
    pub async fn handle_query_cancellable(
        &self,
        raw_text: impl Into<String>,
        context_hints: Vec<ContextHint>,
        explicit_tier_override: Option<Tier>,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome> {
        let query = Query::new(raw_text)
            .with_hints(context_hints)
            .with_override(explicit_tier_override);
        self.handle(query, cancel).await
    }

    /// Answer a fully built query.
    #[instrument(skip(self, query, cancel), fields(query_id = %query.id))]
    pub async fn handle(&self, query: Query, cancel: &CancellationToken) -> Result<QueryOutcome> {
        if self.lazy_probing {
            let refreshed = self.prober.refresh_stale().await;
            if !refreshed.is_empty() {
                debug!(count = refreshed.len(), "health refreshed before dispatch");
            }
        }

        let plan = self.selector.select(&query, &self.registry)?;

        let prompt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            prompt = self.augmenter.augment(&query) => prompt,
        };

        let dispatch = self
            .dispatcher
            .dispatch_cancellable(&prompt.render(), &plan.tiers, cancel)
            .await?;

        let result = self
            .parser
            .parse(&dispatch.response)
            .with_source(dispatch.succeeded_tier());
        let action = self.classifier.classify(&result);

        info!(
            source = ?result.source_attribution,
            attempts = dispatch.attempts.len(),
            confidence = result.confidence,
            action = ?action.kind(),
            "query answered"
        );

        Ok(QueryOutcome {
            result,
            action,
            attempts: dispatch.attempts,
            plan,
            prompt,
        })
    }
}
