//! Retrieval store and web search collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::backend::http_client;
use crate::error::{Error, Result};

use super::types::{RetrievedSnippet, WebResult};

/// Source of previously stored knowledge.
#[async_trait]
pub trait RetrievalStore: Send + Sync {
    /// Up to `top_k` snippets, highest relevance first.
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<RetrievedSnippet>>;

    /// Keep web results so later questions can be answered from the store.
    /// Returns how many new documents were stored.
    async fn add_web_results(&self, _results: &[WebResult]) -> Result<usize> {
        Ok(0)
    }
}

/// Live web search.
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Up to `top_n` results in provider rank order.
    async fn search(&self, text: &str, top_n: usize) -> Result<Vec<WebResult>>;
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// SHA-256 of the text
    pub id: String,
    pub text: String,
    pub source: String,
    pub added_at: DateTime<Utc>,
}

/// Lexical-overlap retrieval store held in memory.
///
/// Relevance is the fraction of distinct query terms present in the document.
/// Documents are deduplicated by content hash.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRetrievalStore {
    documents: Arc<RwLock<Vec<Document>>>,
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "i",
    "in", "is", "it", "me", "of", "on", "or", "the", "this", "to", "was", "what", "when",
    "where", "which", "who", "why", "with", "you",
];

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

pub(super) fn content_id(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Readable text files matching `pattern` (supports `~`), as
/// `(path, contents)` pairs. Unreadable entries are skipped.
pub(super) fn corpus_files(pattern: &str) -> Result<Vec<(String, String)>> {
    let expanded = shellexpand::tilde(pattern);
    let paths = glob::glob(&expanded)
        .map_err(|e| Error::Config(format!("invalid corpus pattern '{}': {}", pattern, e)))?;

    let mut files = Vec::new();
    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "skipping unreadable corpus entry");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(text) => files.push((path.display().to_string(), text)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping non-text file"),
        }
    }
    Ok(files)
}

impl InMemoryRetrievalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document; returns false if identical text is already stored.
    pub fn add_document(&self, text: impl Into<String>, source: impl Into<String>) -> bool {
        let text = text.into();
        if text.trim().is_empty() {
            return false;
        }
        let id = content_id(&text);
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        if documents.iter().any(|d| d.id == id) {
            return false;
        }
        documents.push(Document {
            id,
            text,
            source: source.into(),
            added_at: Utc::now(),
        });
        true
    }

    /// Store copied text so later questions can refer back to it.
    pub fn add_clipboard_content(&self, text: impl Into<String>) -> bool {
        self.add_document(text, "clipboard")
    }

    /// Index every file matching `pattern` (supports `~`), one document per
    /// file. Returns the number of documents added.
    pub fn index_glob(&self, pattern: &str) -> Result<usize> {
        let added = corpus_files(pattern)?
            .into_iter()
            .filter(|(path, text)| self.add_document(text.clone(), path.clone()))
            .count();
        debug!(pattern, added, "corpus indexed");
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RetrievalStore for InMemoryRetrievalStore {
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<RetrievedSnippet>> {
        let query_terms = terms(text);
        if query_terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<RetrievedSnippet> = documents
            .iter()
            .filter_map(|doc| {
                let doc_terms = terms(&doc.text);
                let hits = query_terms.intersection(&doc_terms).count();
                (hits > 0).then(|| {
                    RetrievedSnippet::new(
                        doc.text.clone(),
                        hits as f64 / query_terms.len() as f64,
                        doc.source.clone(),
                    )
                })
            })
            .collect();

        scored.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn add_web_results(&self, results: &[WebResult]) -> Result<usize> {
        Ok(results
            .iter()
            .filter(|r| self.add_document(r.text.clone(), r.source_url.clone()))
            .count())
    }
}

/// Drop results whose leading text and URL repeat an earlier result.
///
/// Two results are the same when the first 50 characters of their
/// lowercased text match and they share a URL. Order is preserved.
pub fn dedup_web_results(results: Vec<WebResult>) -> Vec<WebResult> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|r| {
            let lead: String = r.text.to_lowercase().chars().take(50).collect();
            seen.insert((lead, r.source_url.clone()))
        })
        .collect()
}

/// Queries several providers concurrently and merges their results.
///
/// Results keep provider order, then rank order within a provider. A failing
/// provider is skipped; the search fails only if every provider does.
#[derive(Clone, Default)]
pub struct CombinedWebSearch {
    providers: Vec<(String, Arc<dyn WebSearch>)>,
}

impl std::fmt::Debug for CombinedWebSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("CombinedWebSearch")
            .field("providers", &names)
            .finish()
    }
}

impl CombinedWebSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn WebSearch>) -> Self {
        self.providers.push((name.into(), provider));
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl WebSearch for CombinedWebSearch {
    async fn search(&self, text: &str, top_n: usize) -> Result<Vec<WebResult>> {
        if self.providers.is_empty() {
            return Ok(Vec::new());
        }

        let answers = join_all(
            self.providers
                .iter()
                .map(|(name, provider)| async move { (name, provider.search(text, top_n).await) }),
        )
        .await;

        let mut merged = Vec::new();
        let mut failures = Vec::new();
        for (name, answer) in answers {
            match answer {
                Ok(results) => merged.extend(results),
                Err(e) => {
                    warn!(provider = %name, error = %e, "search provider failed, skipping it");
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }
        if failures.len() == self.providers.len() {
            return Err(Error::collaborator("web_search", failures.join("; ")));
        }

        let mut results = dedup_web_results(merged);
        results.truncate(top_n);
        Ok(results)
    }
}

/// DuckDuckGo Instant Answer API client.
#[derive(Debug, Clone)]
pub struct DuckDuckGoSearch {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    abstract_text: String,
    #[serde(default, rename = "AbstractURL")]
    abstract_url: String,
    #[serde(default)]
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RelatedTopic {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "FirstURL")]
    first_url: Option<String>,
    #[serde(default)]
    topics: Vec<RelatedTopic>,
}

impl RelatedTopic {
    fn flatten_into(self, out: &mut Vec<WebResult>) {
        if let (Some(text), Some(url)) = (self.text, self.first_url) {
            out.push(WebResult::new(text, url));
        }
        for topic in self.topics {
            topic.flatten_into(out);
        }
    }
}

impl DuckDuckGoSearch {
    const DEFAULT_BASE_URL: &'static str = "https://api.duckduckgo.com";

    pub fn new() -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl WebSearch for DuckDuckGoSearch {
    async fn search(&self, text: &str, top_n: usize) -> Result<Vec<WebResult>> {
        let response = self
            .http
            .get(format!("{}/", self.base_url.trim_end_matches('/')))
            .query(&[
                ("q", text),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| Error::collaborator("web_search", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::collaborator(
                "web_search",
                format!("status {}", status),
            ));
        }

        // The API answers with a javascript content type, so decode manually.
        let body = response
            .text()
            .await
            .map_err(|e| Error::collaborator("web_search", e.to_string()))?;
        let answer: InstantAnswer = serde_json::from_str(&body)?;

        let mut results = Vec::new();
        if !answer.abstract_text.is_empty() {
            results.push(WebResult::new(answer.abstract_text, answer.abstract_url));
        }
        for topic in answer.related_topics {
            topic.flatten_into(&mut results);
        }
        let mut results = dedup_web_results(results);
        results.truncate(top_n);
        Ok(results)
    }
}

/// Wikipedia title search through the MediaWiki OpenSearch API.
#[derive(Debug, Clone)]
pub struct WikipediaSearch {
    http: Client,
    base_url: String,
}

/// `[query, titles, descriptions, urls]`
#[derive(Debug, Deserialize)]
struct OpenSearchAnswer(String, Vec<String>, Vec<String>, Vec<String>);

impl WikipediaSearch {
    const DEFAULT_BASE_URL: &'static str = "https://en.wikipedia.org";

    pub fn new() -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl WebSearch for WikipediaSearch {
    async fn search(&self, text: &str, top_n: usize) -> Result<Vec<WebResult>> {
        let limit = top_n.to_string();
        let response = self
            .http
            .get(format!("{}/w/api.php", self.base_url.trim_end_matches('/')))
            .query(&[
                ("action", "opensearch"),
                ("search", text),
                ("limit", limit.as_str()),
                ("namespace", "0"),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(|e| Error::collaborator("wikipedia", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::collaborator("wikipedia", format!("status {}", status)));
        }

        let OpenSearchAnswer(_, titles, descriptions, urls) = response
            .json()
            .await
            .map_err(|e| Error::collaborator("wikipedia", e.to_string()))?;

        let results = titles
            .into_iter()
            .zip(urls)
            .enumerate()
            .map(|(i, (title, url))| match descriptions.get(i).filter(|d| !d.is_empty()) {
                Some(description) => WebResult::new(format!("{} - {}", title, description), url),
                None => WebResult::new(title, url),
            })
            .take(top_n)
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_in_memory_ranks_by_overlap() {
        let store = InMemoryRetrievalStore::new();
        store.add_document("Rust ownership rules prevent data races", "rust.md");
        store.add_document("Python uses reference counting", "python.md");
        store.add_document("Rust borrow checker enforces ownership", "borrow.md");

        let results = store.query("rust ownership", 5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].relevance, 1.0);
        assert!(results.iter().all(|r| r.source_label != "python.md"));

        let top1 = store.query("rust ownership", 1).await.unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[tokio::test]
    async fn test_stopword_only_query_returns_nothing() {
        let store = InMemoryRetrievalStore::new();
        store.add_document("what is the time", "a");
        assert!(store.query("what is the", 5).await.unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_documents_ignored() {
        let store = InMemoryRetrievalStore::new();
        assert!(store.add_clipboard_content("same text"));
        assert!(!store.add_document("same text", "elsewhere"));
        assert!(!store.add_document("   ", "blank"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_index_glob() {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [("a.md", "alpha notes"), ("b.md", "beta notes"), ("c.txt", "gamma")] {
            let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
            file.write_all(body.as_bytes()).unwrap();
        }

        let store = InMemoryRetrievalStore::new();
        let pattern = format!("{}/*.md", dir.path().display());
        assert_eq!(store.index_glob(&pattern).unwrap(), 2);
        // Re-indexing adds nothing new.
        assert_eq!(store.index_glob(&pattern).unwrap(), 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_duckduckgo_flattens_topics() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("q", "rust language"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "AbstractText": "Rust is a systems programming language.",
                "AbstractURL": "https://en.wikipedia.org/wiki/Rust",
                "RelatedTopics": [
                    {"Text": "Cargo - package manager", "FirstURL": "https://duckduckgo.com/Cargo"},
                    {"Name": "Group", "Topics": [
                        {"Text": "Rustc - compiler", "FirstURL": "https://duckduckgo.com/Rustc"}
                    ]}
                ]
            })))
            .mount(&server)
            .await;

        let search = DuckDuckGoSearch::new().unwrap().with_base_url(server.uri());
        let results = search.search("rust language", 5).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].source_url, "https://en.wikipedia.org/wiki/Rust");
        assert_eq!(results[2].text, "Rustc - compiler");

        let limited = search.search("rust language", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_duckduckgo_drops_repeated_topics() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "RelatedTopics": [
                    {"Text": "Cargo - package manager", "FirstURL": "https://duckduckgo.com/Cargo"},
                    {"Name": "Tools", "Topics": [
                        {"Text": "Cargo - package manager", "FirstURL": "https://duckduckgo.com/Cargo"}
                    ]}
                ]
            })))
            .mount(&server)
            .await;

        let search = DuckDuckGoSearch::new().unwrap().with_base_url(server.uri());
        assert_eq!(search.search("cargo", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duckduckgo_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let search = DuckDuckGoSearch::new().unwrap().with_base_url(server.uri());
        let err = search.search("anything", 5).await.unwrap_err();
        assert!(matches!(err, Error::Collaborator { .. }));
    }

    #[tokio::test]
    async fn test_web_results_written_back_once() {
        let store = InMemoryRetrievalStore::new();
        let results = vec![
            WebResult::new("Rain expected this afternoon", "https://weather.example/1"),
            WebResult::new("Rain expected this afternoon", "https://weather.example/1"),
            WebResult::new("Clear by evening", "https://weather.example/2"),
        ];

        assert_eq!(store.add_web_results(&results).await.unwrap(), 2);
        assert_eq!(store.add_web_results(&results).await.unwrap(), 0);
        let hits = store.query("rain afternoon", 5).await.unwrap();
        assert_eq!(hits[0].source_label, "https://weather.example/1");
    }

    #[test]
    fn test_dedup_keys_on_lead_text_and_url() {
        let long = "x".repeat(60);
        let results = vec![
            WebResult::new(format!("{}tail one", long), "https://a.example"),
            WebResult::new(format!("{}TAIL TWO", long.to_uppercase()), "https://a.example"),
            WebResult::new(format!("{}tail one", long), "https://b.example"),
            WebResult::new("Short", "https://a.example"),
        ];

        let deduped = dedup_web_results(results);
        let urls: Vec<&str> = deduped.iter().map(|r| r.source_url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example", "https://b.example", "https://a.example"]);
        assert!(deduped[0].text.ends_with("tail one"));
    }

    struct Fixed(Vec<WebResult>);

    #[async_trait]
    impl WebSearch for Fixed {
        async fn search(&self, _text: &str, top_n: usize) -> Result<Vec<WebResult>> {
            Ok(self.0.iter().take(top_n).cloned().collect())
        }
    }

    struct Down;

    #[async_trait]
    impl WebSearch for Down {
        async fn search(&self, _text: &str, _top_n: usize) -> Result<Vec<WebResult>> {
            Err(Error::collaborator("web_search", "connection refused"))
        }
    }

    #[tokio::test]
    async fn test_combined_search_merges_and_dedups() {
        let combined = CombinedWebSearch::new()
            .with_provider(
                "news",
                Arc::new(Fixed(vec![
                    WebResult::new("Election results tonight", "https://news.example/1"),
                    WebResult::new("Polls close at eight", "https://news.example/2"),
                ])),
            )
            .with_provider("broken", Arc::new(Down))
            .with_provider(
                "web",
                Arc::new(Fixed(vec![
                    WebResult::new("election results TONIGHT", "https://news.example/1"),
                    WebResult::new("Turnout figures", "https://web.example/3"),
                ])),
            );

        let results = combined.search("election", 5).await.unwrap();
        let urls: Vec<&str> = results.iter().map(|r| r.source_url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://news.example/1", "https://news.example/2", "https://web.example/3"]
        );

        assert_eq!(combined.search("election", 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_combined_search_fails_only_when_every_provider_fails() {
        let combined = CombinedWebSearch::new()
            .with_provider("a", Arc::new(Down))
            .with_provider("b", Arc::new(Down));
        let err = combined.search("anything", 5).await.unwrap_err();
        assert!(err.to_string().contains("a: "));

        assert!(CombinedWebSearch::new().search("anything", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wikipedia_opensearch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("action", "opensearch"))
            .and(query_param("search", "ferris"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                "ferris",
                ["Ferris wheel", "Ferris Bueller"],
                ["Amusement ride", ""],
                ["https://en.wikipedia.org/wiki/Ferris_wheel", "https://en.wikipedia.org/wiki/Ferris_Bueller"]
            ])))
            .mount(&server)
            .await;

        let search = WikipediaSearch::new().unwrap().with_base_url(server.uri());
        let results = search.search("ferris", 5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "Ferris wheel - Amusement ride");
        assert_eq!(results[1].text, "Ferris Bueller");
        assert_eq!(results[1].source_url, "https://en.wikipedia.org/wiki/Ferris_Bueller");
    }
}
