//! Queries and the context that accompanies them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::Tier;

/// Where a context hint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HintKind {
    Clipboard,
    ScreenOcr,
    ConversationHistory,
}

impl std::fmt::Display for HintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clipboard => write!(f, "clipboard"),
            Self::ScreenOcr => write!(f, "screen"),
            Self::ConversationHistory => write!(f, "conversation"),
        }
    }
}

/// A piece of surrounding context captured alongside the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHint {
    pub kind: HintKind,
    pub content: String,
}

impl ContextHint {
    pub fn new(kind: HintKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn clipboard(content: impl Into<String>) -> Self {
        Self::new(HintKind::Clipboard, content)
    }

    pub fn screen(content: impl Into<String>) -> Self {
        Self::new(HintKind::ScreenOcr, content)
    }

    pub fn conversation(content: impl Into<String>) -> Self {
        Self::new(HintKind::ConversationHistory, content)
    }
}

/// Explicit user requests for augmentation, bypassing signal detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AugmentFlags {
    pub force_retrieval: bool,
    pub force_web_search: bool,
}

/// A single user query. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Identifier used to correlate log lines for this query
    pub id: Uuid,
    pub raw_text: String,
    /// Ordered oldest to newest
    pub context_hints: Vec<ContextHint>,
    pub explicit_tier_override: Option<Tier>,
    pub flags: AugmentFlags,
}

impl Query {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_text: raw_text.into(),
            context_hints: Vec::new(),
            explicit_tier_override: None,
            flags: AugmentFlags::default(),
        }
    }

    pub fn with_hint(mut self, hint: ContextHint) -> Self {
        self.context_hints.push(hint);
        self
    }

    pub fn with_hints(mut self, hints: Vec<ContextHint>) -> Self {
        self.context_hints = hints;
        self
    }

    pub fn with_tier_override(mut self, tier: Tier) -> Self {
        self.explicit_tier_override = Some(tier);
        self
    }

    pub fn with_override(mut self, tier: Option<Tier>) -> Self {
        self.explicit_tier_override = tier;
        self
    }

    pub fn with_flags(mut self, flags: AugmentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The newest hint, if any.
    pub fn latest_hint(&self) -> Option<&ContextHint> {
        self.context_hints.last()
    }
}
