//! Context augmentation: decides which supplementary sources a query needs,
//! consults them concurrently, and fits the result into the prompt budget.

use futures::future::join_all;
use regex::Regex;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::capability::CapabilityTable;
use crate::config::AugmentSettings;
use crate::error::{Error, Result};
use crate::query::Query;

use super::sources::{RetrievalStore, WebSearch};
use super::types::{
    AugmentationNeed, AugmentedPrompt, DegradedSource, Supplement, SupplementKind, WebResult,
};

static CURRENT_EVENTS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(latest|news|today|tonight|tomorrow|yesterday|this\s+(week|month|year)|currently|current|recent(ly)?|right\s+now|weather|forecast|price|stock|score|who\s+won|election|release\s+date)\b")
        .expect("invalid regex")
});

static SEARCH_CUE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(search\s+(for|the\s+web)|look\s+up|google|find\s+online|on\s+the\s+web)\b")
        .expect("invalid regex")
});

static RECALL_CUE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(my\s+notes|remember|earlier|last\s+time|we\s+discussed|i\s+(said|saved|copied)|according\s+to\s+my)\b")
        .expect("invalid regex")
});

static INTERROGATIVE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\?\s*$|^\s*(who|what|when|where|which|how|is|are|did|does|do|can)\b)")
        .expect("invalid regex")
});

static ENTITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][a-zA-Z0-9]+(?:\s+[A-Z][a-zA-Z0-9]+)*\b").expect("invalid regex")
});

/// Capitalised names in `text` that do not open a sentence and do not occur
/// in any context hint.
fn unresolved_entities<'a>(text: &'a str, query: &Query) -> Vec<&'a str> {
    ENTITY_PATTERN
        .find_iter(text)
        .filter(|m| {
            let before = text[..m.start()].trim_end();
            !(before.is_empty() || before.ends_with(['.', '?', '!', ':']))
        })
        .map(|m| m.as_str())
        .filter(|entity| *entity != "I")
        .filter(|entity| {
            let needle = entity.to_lowercase();
            !query
                .context_hints
                .iter()
                .any(|h| h.content.to_lowercase().contains(&needle))
        })
        .collect()
}

async fn bounded<T>(
    source_name: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::collaborator_timeout(
            source_name,
            timeout.as_millis() as u64,
        )),
    }
}

/// Builds an [`AugmentedPrompt`] for each query.
///
/// Every collaborator is optional and best-effort: a missing, failing, or slow
/// source is recorded in [`AugmentedPrompt::degraded`] and the prompt is built
/// from whatever else answered.
#[derive(Clone, Default)]
pub struct ContextAugmenter {
    settings: AugmentSettings,
    retrieval: Option<Arc<dyn RetrievalStore>>,
    web: Option<Arc<dyn WebSearch>>,
    capabilities: CapabilityTable,
}

impl std::fmt::Debug for ContextAugmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextAugmenter")
            .field("settings", &self.settings)
            .field("retrieval", &self.retrieval.is_some())
            .field("web", &self.web.is_some())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl ContextAugmenter {
    pub fn new(settings: AugmentSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn with_retrieval(mut self, store: Arc<dyn RetrievalStore>) -> Self {
        self.retrieval = Some(store);
        self
    }

    pub fn with_web_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.web = Some(search);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn settings(&self) -> &AugmentSettings {
        &self.settings
    }

    /// Decide which sources the query should consult.
    pub fn detect_need(&self, query: &Query) -> AugmentationNeed {
        let text = query.raw_text.as_str();
        let mut need = AugmentationNeed::default();

        let entities = unresolved_entities(text, query);
        let interrogative = INTERROGATIVE_PATTERN.is_match(text);

        if self.settings.web_search_enabled && self.web.is_some() {
            if query.flags.force_web_search {
                need.web_search = true;
                need.reasons.push("web_flag".to_string());
            }
            if CURRENT_EVENTS_PATTERN.is_match(text) {
                need.web_search = true;
                need.reasons.push("current_events".to_string());
            }
            if SEARCH_CUE_PATTERN.is_match(text) {
                need.web_search = true;
                need.reasons.push("search_cue".to_string());
            }
            if interrogative && !entities.is_empty() {
                need.web_search = true;
                need.reasons.push("entity_question".to_string());
            }
        }

        if self.settings.retrieval_enabled && self.retrieval.is_some() {
            if query.flags.force_retrieval {
                need.retrieval = true;
                need.reasons.push("retrieval_flag".to_string());
            }
            if RECALL_CUE_PATTERN.is_match(text) {
                need.retrieval = true;
                need.reasons.push("recall_cue".to_string());
            }
            if !entities.is_empty() {
                need.retrieval = true;
                need.reasons.push("named_entity".to_string());
            }
        }

        need
    }

    /// Build the augmented prompt for `query`.
    ///
    /// Never fails: collaborator errors degrade the prompt instead.
    #[instrument(skip(self, query), fields(query_id = %query.id))]
    pub async fn augment(&self, query: &Query) -> AugmentedPrompt {
        let need = self.detect_need(query);
        let timeout = self.settings.collaborator_timeout();
        let text = query.raw_text.as_str();

        let retrieval = async {
            match (&self.retrieval, need.retrieval) {
                (Some(store), true) => Some(
                    bounded(
                        "retrieval",
                        timeout,
                        store.query(text, self.settings.retrieval_top_k),
                    )
                    .await,
                ),
                _ => None,
            }
        };

        let web = async {
            match (&self.web, need.web_search) {
                (Some(search), true) => Some(
                    bounded("web_search", timeout, search.search(text, self.settings.web_top_n))
                        .await,
                ),
                _ => None,
            }
        };

        let tools = async {
            let capability_timeout = self.settings.capability_timeout();
            join_all(self.capabilities.matching(query).into_iter().map(|cap| async move {
                let name = cap.name().to_string();
                let result = bounded(&name, capability_timeout, cap.execute(query)).await;
                (name, result)
            }))
            .await
        };

        // Sources are independent; wait for all of them (or their timeouts).
        let (retrieved, web_results, tool_outputs) = tokio::join!(retrieval, web, tools);

        let mut supplements = Vec::new();
        let mut degraded = Vec::new();

        for (name, result) in tool_outputs {
            match result {
                Ok(output) if !output.trim().is_empty() => supplements.push(Supplement {
                    kind: SupplementKind::Tool,
                    text: output,
                    source: name,
                    relevance: 1.0,
                }),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        capability = %name,
                        error = %e,
                        "capability failed, continuing without it"
                    );
                    degraded.push(DegradedSource {
                        source: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        match retrieved {
            Some(Ok(snippets)) => supplements.extend(
                snippets
                    .into_iter()
                    .filter(|s| s.relevance >= self.settings.min_relevance)
                    .map(Supplement::from),
            ),
            Some(Err(e)) => {
                warn!(error = %e, "retrieval unavailable, continuing without it");
                degraded.push(DegradedSource {
                    source: "retrieval".to_string(),
                    reason: e.to_string(),
                });
            }
            None => {}
        }

        if let Some(Ok(results)) = &web_results {
            self.write_back(results, timeout).await;
        }

        match web_results {
            Some(Ok(results)) => {
                // Lower-ranked results are dropped before higher-ranked ones.
                supplements.extend(results.into_iter().enumerate().map(|(rank, r)| Supplement {
                    kind: SupplementKind::Web,
                    text: r.text,
                    source: r.source_url,
                    relevance: (self.settings.web_result_relevance - rank as f64 * 0.01).max(0.0),
                }))
            }
            Some(Err(e)) => {
                warn!(error = %e, "web search unavailable, continuing without it");
                degraded.push(DegradedSource {
                    source: "web_search".to_string(),
                    reason: e.to_string(),
                });
            }
            None => {}
        }

        let prompt = fit_to_budget(
            query,
            need,
            supplements,
            degraded,
            self.settings.prompt_budget_chars,
        );
        debug!(
            supplements = prompt.supplements.len(),
            dropped = prompt.dropped,
            degraded = prompt.degraded.len(),
            chars = prompt.rendered_len(),
            "prompt augmented"
        );
        prompt
    }

    /// Store fresh web results in the retrieval store for later questions.
    async fn write_back(&self, results: &[WebResult], timeout: Duration) {
        let store = match &self.retrieval {
            Some(store) if self.settings.web_write_back && !results.is_empty() => store,
            _ => return,
        };
        match bounded("retrieval", timeout, store.add_web_results(results)).await {
            Ok(stored) => debug!(stored, "web results written to retrieval store"),
            Err(e) => warn!(error = %e, "could not store web results"),
        }
    }
}

/// Assemble the prompt, then drop the lowest-relevance supplement until the
/// rendered prompt fits `budget` or no supplements remain.
///
/// The newest hint is kept only if it fits next to the query text on its own.
/// The query text is never shortened.
pub fn fit_to_budget(
    query: &Query,
    need: AugmentationNeed,
    mut supplements: Vec<Supplement>,
    degraded: Vec<DegradedSource>,
    budget: usize,
) -> AugmentedPrompt {
    supplements.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

    let mut prompt = AugmentedPrompt::bare(query.raw_text.clone());
    prompt.need = need;
    prompt.degraded = degraded;

    if let Some(hint) = query.latest_hint() {
        prompt.hint = Some(hint.clone());
        if prompt.rendered_len() > budget {
            debug!(kind = %hint.kind, "context hint exceeds budget, omitted");
            prompt.hint = None;
        }
    }

    prompt.supplements = supplements;
    while prompt.rendered_len() > budget && prompt.supplements.pop().is_some() {
        prompt.dropped += 1;
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::types::{RetrievedSnippet, WebResult};
    use crate::capability::{ArithmeticCapability, Capability};
    use crate::query::{AugmentFlags, ContextHint};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct StaticStore(Vec<RetrievedSnippet>);

    #[async_trait]
    impl RetrievalStore for StaticStore {
        async fn query(&self, _text: &str, top_k: usize) -> Result<Vec<RetrievedSnippet>> {
            Ok(self.0.iter().take(top_k).cloned().collect())
        }
    }

    struct SlowStore;

    #[async_trait]
    impl RetrievalStore for SlowStore {
        async fn query(&self, _text: &str, _top_k: usize) -> Result<Vec<RetrievedSnippet>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![RetrievedSnippet::new("too late", 1.0, "slow")])
        }
    }

    struct StaticSearch(Vec<WebResult>);

    #[async_trait]
    impl WebSearch for StaticSearch {
        async fn search(&self, _text: &str, top_n: usize) -> Result<Vec<WebResult>> {
            Ok(self.0.iter().take(top_n).cloned().collect())
        }
    }

    struct FailingSearch;

    #[async_trait]
    impl WebSearch for FailingSearch {
        async fn search(&self, _text: &str, _top_n: usize) -> Result<Vec<WebResult>> {
            Err(Error::collaborator("web_search", "connection refused"))
        }
    }

    struct BrokenCapability;

    #[async_trait]
    impl Capability for BrokenCapability {
        fn name(&self) -> &str {
            "broken"
        }
        fn can_handle(&self, _query: &Query) -> bool {
            true
        }
        async fn execute(&self, _query: &Query) -> Result<String> {
            Err(Error::capability("broken", "boom"))
        }
    }

    fn forced() -> AugmentFlags {
        AugmentFlags {
            force_retrieval: true,
            force_web_search: true,
        }
    }

    fn web_results() -> Vec<WebResult> {
        vec![
            WebResult::new("Rain expected this afternoon", "https://weather.example/1"),
            WebResult::new("Highs of 14C", "https://weather.example/2"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieval_timeout_keeps_web_results() {
        let augmenter = ContextAugmenter::new(AugmentSettings::default())
            .with_retrieval(Arc::new(SlowStore))
            .with_web_search(Arc::new(StaticSearch(web_results())));

        let query = Query::new("what's the weather today?").with_flags(forced());
        let prompt = augmenter.augment(&query).await;

        assert_eq!(prompt.supplements_of(SupplementKind::Web).count(), 2);
        assert_eq!(prompt.supplements_of(SupplementKind::Retrieved).count(), 0);
        assert_eq!(prompt.degraded.len(), 1);
        assert_eq!(prompt.degraded[0].source, "retrieval");
        assert!(prompt.degraded[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_web_failure_keeps_retrieval() {
        let augmenter = ContextAugmenter::new(AugmentSettings::default())
            .with_retrieval(Arc::new(StaticStore(vec![
                RetrievedSnippet::new("relevant note", 0.9, "notes.md"),
                RetrievedSnippet::new("barely related", 0.1, "misc.md"),
            ])))
            .with_web_search(Arc::new(FailingSearch));

        let query = Query::new("summarise my notes").with_flags(forced());
        let prompt = augmenter.augment(&query).await;

        // Below min_relevance snippets are filtered out.
        assert_eq!(prompt.supplements.len(), 1);
        assert_eq!(prompt.supplements[0].source, "notes.md");
        assert_eq!(prompt.degraded[0].source, "web_search");
    }

    /// Remembers every web result handed to it.
    #[derive(Default)]
    struct RecordingStore(std::sync::Mutex<Vec<WebResult>>);

    #[async_trait]
    impl RetrievalStore for RecordingStore {
        async fn query(&self, _text: &str, _top_k: usize) -> Result<Vec<RetrievedSnippet>> {
            Ok(Vec::new())
        }

        async fn add_web_results(&self, results: &[WebResult]) -> Result<usize> {
            self.0.lock().unwrap().extend_from_slice(results);
            Ok(results.len())
        }
    }

    #[tokio::test]
    async fn test_web_results_written_back_to_store() {
        let store = Arc::new(RecordingStore::default());
        let augmenter = ContextAugmenter::new(AugmentSettings::default())
            .with_retrieval(store.clone())
            .with_web_search(Arc::new(StaticSearch(web_results())));

        let prompt = augmenter
            .augment(&Query::new("weather today?").with_flags(forced()))
            .await;
        assert_eq!(prompt.supplements_of(SupplementKind::Web).count(), 2);
        assert_eq!(*store.0.lock().unwrap(), web_results());
    }

    #[tokio::test]
    async fn test_write_back_can_be_disabled() {
        let store = Arc::new(RecordingStore::default());
        let settings = AugmentSettings {
            web_write_back: false,
            ..AugmentSettings::default()
        };
        let augmenter = ContextAugmenter::new(settings)
            .with_retrieval(store.clone())
            .with_web_search(Arc::new(StaticSearch(web_results())));

        augmenter
            .augment(&Query::new("weather today?").with_flags(forced()))
            .await;
        assert!(store.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_collaborators_yields_bare_prompt() {
        let augmenter = ContextAugmenter::default();
        let prompt = augmenter
            .augment(&Query::new("what is the latest news?").with_flags(forced()))
            .await;
        assert!(!prompt.need.web_search);
        assert!(!prompt.need.retrieval);
        assert_eq!(prompt.render(), "what is the latest news?");
    }

    #[tokio::test]
    async fn test_capability_output_and_failure() {
        let mut table = CapabilityTable::new();
        table.register(Arc::new(ArithmeticCapability)).unwrap();
        table.register(Arc::new(BrokenCapability)).unwrap();
        let augmenter = ContextAugmenter::default().with_capabilities(table);

        let prompt = augmenter.augment(&Query::new("calculate 6 * 7")).await;
        assert_eq!(prompt.supplements.len(), 1);
        assert_eq!(prompt.supplements[0].kind, SupplementKind::Tool);
        assert_eq!(prompt.supplements[0].text, "6 * 7 = 42");
        assert_eq!(prompt.degraded[0].source, "broken");
    }

    #[test]
    fn test_detect_need_signals() {
        let augmenter = ContextAugmenter::default()
            .with_retrieval(Arc::new(StaticStore(vec![])))
            .with_web_search(Arc::new(StaticSearch(vec![])));

        let need = augmenter.detect_need(&Query::new("what is the latest news on the election?"));
        assert!(need.web_search);
        assert!(need.reasons.contains(&"current_events".to_string()));

        let need = augmenter.detect_need(&Query::new("who founded Anthropic?"));
        assert!(need.web_search);
        assert!(need.retrieval);

        let need = augmenter.detect_need(&Query::new("rewrite this sentence"));
        assert_eq!(need, AugmentationNeed::default());
    }

    #[test]
    fn test_entities_resolved_by_hint_are_ignored() {
        let augmenter = ContextAugmenter::default()
            .with_retrieval(Arc::new(StaticStore(vec![])));
        let query = Query::new("summarise what Alice wrote")
            .with_hint(ContextHint::clipboard("Alice: the deploy is done"));
        assert!(!augmenter.detect_need(&query).retrieval);

        let query = Query::new("summarise what Alice wrote");
        assert!(augmenter.detect_need(&query).retrieval);
    }

    #[test]
    fn test_disabled_toggles_win_over_flags() {
        let settings = AugmentSettings {
            web_search_enabled: false,
            ..AugmentSettings::default()
        };
        let augmenter = ContextAugmenter::new(settings)
            .with_web_search(Arc::new(StaticSearch(vec![])));
        let need = augmenter.detect_need(&Query::new("latest news").with_flags(forced()));
        assert!(!need.web_search);
    }

    fn supplement(text: &str, relevance: f64) -> Supplement {
        Supplement {
            kind: SupplementKind::Retrieved,
            text: text.to_string(),
            source: "s".to_string(),
            relevance,
        }
    }

    #[test]
    fn test_budget_drops_lowest_relevance_first() {
        let query = Query::new("q");
        let supplements = vec![
            supplement(&"a".repeat(40), 0.9),
            supplement(&"b".repeat(40), 0.2),
            supplement(&"c".repeat(40), 0.5),
        ];
        let prompt = fit_to_budget(&query, AugmentationNeed::default(), supplements, vec![], 120);

        assert!(prompt.rendered_len() <= 120);
        assert_eq!(prompt.dropped, 1);
        let kept: Vec<f64> = prompt.supplements.iter().map(|s| s.relevance).collect();
        assert_eq!(kept, vec![0.9, 0.5]);
    }

    #[test]
    fn test_oversized_query_is_never_truncated() {
        let text = "x".repeat(200);
        let query = Query::new(text.clone()).with_hint(ContextHint::screen("on screen"));
        let prompt = fit_to_budget(
            &query,
            AugmentationNeed::default(),
            vec![supplement("note", 0.9)],
            vec![],
            50,
        );
        assert_eq!(prompt.render(), text);
        assert!(prompt.hint.is_none());
        assert_eq!(prompt.dropped, 1);
    }

    #[test]
    fn test_hint_kept_when_it_fits() {
        let query = Query::new("explain")
            .with_hint(ContextHint::conversation("older"))
            .with_hint(ContextHint::clipboard("newest"));
        let prompt = fit_to_budget(&query, AugmentationNeed::default(), vec![], vec![], 1000);
        assert_eq!(prompt.hint, Some(ContextHint::clipboard("newest")));
        assert_eq!(prompt.render(), "[clipboard context]\nnewest\n\nexplain");
    }
}
