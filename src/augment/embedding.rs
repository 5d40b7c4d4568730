//! Retrieval store ranked by embedding similarity from a local Ollama server.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, instrument};

use crate::backend::http_client;
use crate::error::{Error, Result};

use super::sources::{content_id, corpus_files, Document, RetrievalStore};
use super::types::{RetrievedSnippet, WebResult};

pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// Longest chunk stored as one document, in characters.
const DEFAULT_CHUNK_CHARS: usize = 1000;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Entry {
    document: Document,
    vector: Vec<f64>,
}

/// Split `text` on blank lines and pack paragraphs into chunks of at most
/// `max_chars`. A paragraph longer than `max_chars` is cut into pieces.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_len = paragraph.chars().count();
        if !current.is_empty() && current.chars().count() + 2 + para_len > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if para_len > max_chars {
            let chars: Vec<char> = paragraph.chars().collect();
            chunks.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Cosine similarity mapped from [-1, 1] onto [0, 1].
fn similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b) + 1.0) / 2.0
}

/// Retrieval store that embeds documents and queries through Ollama's
/// `/api/embeddings` endpoint and ranks by cosine similarity.
///
/// Documents are chunked on paragraph boundaries and deduplicated by content
/// hash. Embedding failures surface as collaborator errors, which the
/// augmenter absorbs.
#[derive(Debug, Clone)]
pub struct EmbeddingRetrievalStore {
    http: Client,
    endpoint: String,
    model: String,
    chunk_chars: usize,
    entries: Arc<RwLock<Vec<Entry>>>,
}

impl EmbeddingRetrievalStore {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            endpoint: endpoint.into(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            chunk_chars: DEFAULT_CHUNK_CHARS,
            entries: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let url = format!("{}/api/embeddings", self.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| Error::collaborator("retrieval", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::collaborator(
                "retrieval",
                format!("embedding request returned status {}", status),
            ));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::collaborator("retrieval", e.to_string()))?;
        if body.embedding.is_empty() {
            return Err(Error::collaborator(
                "retrieval",
                format!("model {} returned an empty embedding", self.model),
            ));
        }
        Ok(body.embedding)
    }

    fn contains(&self, id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.document.id == id)
    }

    /// Chunk, embed, and store `text`. Returns the number of new chunks.
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn add_document(&self, text: &str, source: &str) -> Result<usize> {
        let mut added = 0;
        for chunk in chunk_text(text, self.chunk_chars) {
            let id = content_id(&chunk);
            if self.contains(&id) {
                continue;
            }
            let vector = self.embed(&chunk).await?;

            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            // Another writer may have stored the same chunk while we embedded it.
            if entries.iter().any(|e| e.document.id == id) {
                continue;
            }
            entries.push(Entry {
                document: Document {
                    id,
                    text: chunk,
                    source: source.to_string(),
                    added_at: Utc::now(),
                },
                vector,
            });
            added += 1;
        }
        debug!(added, source, "document embedded");
        Ok(added)
    }

    pub async fn add_clipboard_content(&self, text: &str) -> Result<usize> {
        self.add_document(text, "clipboard").await
    }

    /// Embed every file matching `pattern` (supports `~`). Returns the number
    /// of chunks added.
    pub async fn index_glob(&self, pattern: &str) -> Result<usize> {
        let mut added = 0;
        for (path, text) in corpus_files(pattern)? {
            added += self.add_document(&text, &path).await?;
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RetrievalStore for EmbeddingRetrievalStore {
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<RetrievedSnippet>> {
        if top_k == 0 || text.trim().is_empty() || self.is_empty() {
            return Ok(Vec::new());
        }
        let query_vector = self.embed(text).await?;

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<RetrievedSnippet> = entries
            .iter()
            .map(|e| {
                RetrievedSnippet::new(
                    e.document.text.clone(),
                    similarity(&query_vector, &e.vector),
                    e.document.source.clone(),
                )
            })
            .collect();

        scored.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn add_web_results(&self, results: &[WebResult]) -> Result<usize> {
        let mut added = 0;
        for result in results {
            added += self.add_document(&result.text, &result.source_url).await?;
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn embeds(server: &MockServer, prompt: &str, vector: [f64; 3]) {
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(serde_json::json!({
                "model": "nomic-embed-text",
                "prompt": prompt
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "embedding": vector })),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_chunk_text_packs_paragraphs() {
        let text = "alpha\n\nbeta\n\n\n\ngamma";
        assert_eq!(chunk_text(text, 1000), vec!["alpha\n\nbeta\n\ngamma"]);
        assert_eq!(chunk_text(text, 12), vec!["alpha\n\nbeta", "gamma"]);
        assert_eq!(chunk_text("abcdefg", 3), vec!["abc", "def", "g"]);
        assert!(chunk_text("  \n\n ", 10).is_empty());
    }

    #[test]
    fn test_similarity_is_normalized() {
        assert_eq!(similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.5);
        assert_eq!(similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_query_ranks_by_cosine() {
        let server = MockServer::start().await;
        embeds(&server, "Rust ownership rules", [1.0, 0.0, 0.0]).await;
        embeds(&server, "Baking sourdough bread", [0.0, 1.0, 0.0]).await;
        embeds(&server, "borrow checker", [0.9, 0.1, 0.0]).await;

        let store = EmbeddingRetrievalStore::new(server.uri()).unwrap();
        assert_eq!(store.add_document("Rust ownership rules", "rust.md").await.unwrap(), 1);
        assert_eq!(store.add_document("Baking sourdough bread", "bread.md").await.unwrap(), 1);
        assert_eq!(store.add_document("Rust ownership rules", "again.md").await.unwrap(), 0);
        assert_eq!(store.len(), 2);

        let results = store.query("borrow checker", 5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_label, "rust.md");
        assert!(results[0].relevance > 0.95);
        assert!(results[1].relevance < 0.6);

        assert_eq!(store.query("borrow checker", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_web_results_are_embedded() {
        let server = MockServer::start().await;
        embeds(&server, "Rain expected this afternoon", [0.0, 0.0, 1.0]).await;

        let store = EmbeddingRetrievalStore::new(server.uri()).unwrap();
        let added = store
            .add_web_results(&[WebResult::new(
                "Rain expected this afternoon",
                "https://weather.example/1",
            )])
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_collaborator_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let store = EmbeddingRetrievalStore::new(server.uri())
            .unwrap()
            .with_model("missing-model");
        let err = store.add_document("anything", "a").await.unwrap_err();
        assert!(matches!(err, Error::Collaborator { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_index_glob_embeds_each_file() {
        let server = MockServer::start().await;
        embeds(&server, "alpha notes", [1.0, 0.0, 0.0]).await;
        embeds(&server, "beta notes", [0.0, 1.0, 0.0]).await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "alpha notes").unwrap();
        std::fs::write(dir.path().join("b.md"), "beta notes").unwrap();

        let store = EmbeddingRetrievalStore::new(server.uri()).unwrap();
        let pattern = format!("{}/*.md", dir.path().display());
        assert_eq!(store.index_glob(&pattern).await.unwrap(), 2);
        assert_eq!(store.index_glob(&pattern).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_store_skips_embedding() {
        let store = EmbeddingRetrievalStore::new("http://127.0.0.1:9").unwrap();
        assert!(store.query("anything", 5).await.unwrap().is_empty());
    }
}
