//! Augmentation inputs and the augmented prompt.

use serde::{Deserialize, Serialize};

use crate::query::ContextHint;

/// A passage returned by the retrieval store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSnippet {
    pub text: String,
    /// Relevance in [0, 1]
    pub relevance: f64,
    pub source_label: String,
}

impl RetrievedSnippet {
    pub fn new(text: impl Into<String>, relevance: f64, source_label: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            relevance: relevance.clamp(0.0, 1.0),
            source_label: source_label.into(),
        }
    }
}

/// A result returned by web search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebResult {
    pub text: String,
    pub source_url: String,
}

impl WebResult {
    pub fn new(text: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_url: source_url.into(),
        }
    }
}

/// Where a supplement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplementKind {
    Retrieved,
    Web,
    Tool,
}

/// One droppable piece of supplementary context.
///
/// Web results and tool outputs are given a relevance so that every
/// supplement can be ranked on the same scale during budget truncation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supplement {
    pub kind: SupplementKind,
    pub text: String,
    /// Source label, URL, or capability name
    pub source: String,
    pub relevance: f64,
}

impl From<RetrievedSnippet> for Supplement {
    fn from(snippet: RetrievedSnippet) -> Self {
        Self {
            kind: SupplementKind::Retrieved,
            text: snippet.text,
            source: snippet.source_label,
            relevance: snippet.relevance,
        }
    }
}

/// Which augmentation sources were selected for a query, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AugmentationNeed {
    pub retrieval: bool,
    pub web_search: bool,
    pub reasons: Vec<String>,
}

/// A collaborator that was consulted but contributed nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedSource {
    pub source: String,
    pub reason: String,
}

/// Query text plus whatever context fit in the budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentedPrompt {
    pub query_text: String,
    /// Newest context hint, included verbatim or not at all
    pub hint: Option<ContextHint>,
    /// Highest relevance first
    pub supplements: Vec<Supplement>,
    pub need: AugmentationNeed,
    /// Collaborators that failed or timed out
    pub degraded: Vec<DegradedSource>,
    /// Supplements removed to fit the budget
    pub dropped: usize,
}

impl AugmentedPrompt {
    /// A prompt carrying only the query text.
    pub fn bare(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            hint: None,
            supplements: Vec::new(),
            need: AugmentationNeed::default(),
            degraded: Vec::new(),
            dropped: 0,
        }
    }

    pub fn supplements_of(&self, kind: SupplementKind) -> impl Iterator<Item = &Supplement> {
        self.supplements.iter().filter(move |s| s.kind == kind)
    }

    /// Render the prompt text sent to the backend.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Some(hint) = &self.hint {
            out.push_str(&format!("[{} context]\n{}\n\n", hint.kind, hint.content));
        }

        for (kind, heading) in [
            (SupplementKind::Retrieved, "[knowledge]"),
            (SupplementKind::Web, "[web results]"),
            (SupplementKind::Tool, "[tool output]"),
        ] {
            let mut items = self.supplements_of(kind).peekable();
            if items.peek().is_none() {
                continue;
            }
            out.push_str(heading);
            out.push('\n');
            for item in items {
                out.push_str(&format!("- ({}) {}\n", item.source, item.text));
            }
            out.push('\n');
        }

        out.push_str(&self.query_text);
        out
    }

    /// Rendered length in characters.
    pub fn rendered_len(&self) -> usize {
        self.render().chars().count()
    }
}
