//! Query complexity analysis for tier selection.
//!
//! The classifier is cheap: a handful of regexes and length
//! checks over the query text and its newest context hint. It analyzes:
//! - Input size
//! - Multi-part / compound question markers
//! - Code-like or structured content
//! - Reasoning-heavy and error-analysis intent
//! - Explicit user intent ("be thorough", "quickly")

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::backend::Tier;
use crate::query::Query;

/// Coarse complexity bucket; each maps to a starting local tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    Simple,
    Moderate,
    Complex,
}

impl QueryComplexity {
    /// Starting tier for this complexity.
    pub fn base_tier(self) -> Tier {
        match self {
            QueryComplexity::Simple => Tier::Fast,
            QueryComplexity::Moderate => Tier::Balanced,
            QueryComplexity::Complex => Tier::Smart,
        }
    }
}

/// Signals extracted from a query that indicate complexity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexitySignals {
    // Size
    /// Input is over half the long-query threshold
    pub long_input: bool,
    /// Input is over the long-query threshold
    pub very_long_input: bool,

    // Structure
    /// Several questions or enumerated sub-tasks
    pub multi_part: bool,
    /// Source code, stack traces, or shell snippets
    pub code_like: bool,
    /// JSON, tables, or other record-shaped text
    pub structured_content: bool,

    // Intent
    /// Optimization, design, review, comparison
    pub deep_reasoning: bool,
    /// Error or failure analysis
    pub error_analysis: bool,
    /// User explicitly wants a thorough answer
    pub user_wants_thorough: bool,
    /// User explicitly wants a quick answer
    pub user_wants_fast: bool,
}

impl ComplexitySignals {
    /// Calculate a complexity score from the signals.
    /// Higher score = more complex query.
    pub fn score(&self) -> i32 {
        let mut score = 0;

        // Strong positive signals
        if self.deep_reasoning {
            score += 4;
        }
        if self.user_wants_thorough {
            score += 3;
        }

        // Medium positive signals (+2 each)
        if self.very_long_input {
            score += 2;
        } else if self.long_input {
            score += 1;
        }
        if self.multi_part {
            score += 2;
        }
        if self.code_like {
            score += 2;
        }
        if self.error_analysis {
            score += 2;
        }

        // Weak positive signals
        if self.structured_content {
            score += 1;
        }

        // Negative signals
        if self.user_wants_fast {
            score -= 3;
        }

        score
    }

    /// Get human-readable list of active signals.
    pub fn active_signals(&self) -> Vec<&'static str> {
        let mut signals = Vec::new();

        if self.very_long_input {
            signals.push("very_long");
        } else if self.long_input {
            signals.push("long");
        }
        if self.multi_part {
            signals.push("multi_part");
        }
        if self.code_like {
            signals.push("code");
        }
        if self.structured_content {
            signals.push("structured");
        }
        if self.deep_reasoning {
            signals.push("deep_reasoning");
        }
        if self.error_analysis {
            signals.push("error_analysis");
        }
        if self.user_wants_thorough {
            signals.push("user_thorough");
        }
        if self.user_wants_fast {
            signals.push("user_fast");
        }

        signals
    }
}

/// Result of classifying one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    pub complexity: QueryComplexity,
    pub score: i32,
    pub signals: ComplexitySignals,
}

impl ComplexityAssessment {
    /// Short reason string for logs, e.g. `moderate(3:code+structured)`.
    pub fn reason(&self) -> String {
        let level = format!("{:?}", self.complexity).to_lowercase();
        let active = self.signals.active_signals();
        if active.is_empty() {
            format!("{}({})", level, self.score)
        } else {
            format!("{}({}:{})", level, self.score, active.join("+"))
        }
    }
}

/// Pattern-based complexity classifier.
#[derive(Debug, Clone)]
pub struct ComplexityClassifier {
    /// Minimum score for `Moderate`
    pub moderate_threshold: i32,
    /// Minimum score for `Complex`
    pub complex_threshold: i32,
    /// Character count above which input is "very long"
    pub long_query_chars: usize,
}

impl Default for ComplexityClassifier {
    fn default() -> Self {
        Self {
            moderate_threshold: 2,
            complex_threshold: 4,
            long_query_chars: 400,
        }
    }
}

// Lazy-initialized regex patterns
static MULTI_PART_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)(^\s*(\d+[.)]|[-*])\s+\S|\band\s+also\b|\bas\s+well\s+as\b|\badditionally\b|\bfirst\b.*\bthen\b|\bstep\s+by\s+step\b)")
        .expect("invalid regex")
});

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(```|^\s*(def|class|fn|pub\s+fn|import|from\s+\S+\s+import|#include|function|const|let|var)\b|=>|->|\w+\([^)]*\)\s*[{;:]|Traceback \(most recent call last\)|^\s*at\s+\S+\(|\$\s+\w+)")
        .expect("invalid regex")
});

static STRUCTURED_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)(\{\s*"[^"]+"\s*:|^\s*\|.*\|\s*$|^[^,\n]+(,[^,\n]+){3,}$|^\s*<\w+[^>]*>)"#)
        .expect("invalid regex")
});

static DEEP_REASONING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(optimi[sz]e|architect|design|refactor|trade.?offs?|compare|comparison|pros\s+and\s+cons|prove|analy[sz]e|review|security|performance|algorithm)")
        .expect("invalid regex")
});

static ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(error|exception|traceback|stack\s*trace|bug|crash|fail(s|ed|ing)?|broken|not\s+working|doesn'?t\s+work|segfault|panic)")
        .expect("invalid regex")
});

static THOROUGH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(thorough|in\s+detail|detailed|in\s+depth|deep\s+dive|comprehensive|carefully|be\s+careful)")
        .expect("invalid regex")
});

static FAST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bquick(ly)?\b|\bbrief(ly)?\b|\bshort\b|\btl;?dr\b|\bjust\b|\bone\s+word\b|don'?t\s+overthink)")
        .expect("invalid regex")
});

impl ComplexityClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(moderate_threshold: i32, complex_threshold: i32) -> Self {
        Self {
            moderate_threshold,
            complex_threshold,
            ..Self::default()
        }
    }

    pub fn with_long_query_chars(mut self, chars: usize) -> Self {
        self.long_query_chars = chars;
        self
    }

    /// Extract complexity signals from query text and its newest hint.
    pub fn analyze(&self, query: &Query) -> ComplexitySignals {
        let text = query.raw_text.as_str();
        let hint = query.latest_hint().map(|h| h.content.as_str()).unwrap_or("");

        let mut signals = ComplexitySignals::default();

        let len = text.chars().count();
        signals.very_long_input = len > self.long_query_chars;
        signals.long_input = len > self.long_query_chars / 2;

        signals.multi_part = text.matches('?').count() >= 2 || MULTI_PART_PATTERN.is_match(text);
        // Code pasted via clipboard or captured from screen counts as well.
        signals.code_like = CODE_PATTERN.is_match(text) || CODE_PATTERN.is_match(hint);
        signals.structured_content =
            STRUCTURED_PATTERN.is_match(text) || STRUCTURED_PATTERN.is_match(hint);

        signals.deep_reasoning = DEEP_REASONING_PATTERN.is_match(text);
        signals.error_analysis = ERROR_PATTERN.is_match(text) || ERROR_PATTERN.is_match(hint);

        signals.user_wants_thorough = THOROUGH_PATTERN.is_match(text);
        signals.user_wants_fast = FAST_PATTERN.is_match(text);

        signals
    }

    /// Classify a query into a complexity bucket.
    pub fn classify(&self, query: &Query) -> ComplexityAssessment {
        let signals = self.analyze(query);
        let score = signals.score();
        let complexity = if score >= self.complex_threshold {
            QueryComplexity::Complex
        } else if score >= self.moderate_threshold {
            QueryComplexity::Moderate
        } else {
            QueryComplexity::Simple
        };
        ComplexityAssessment {
            complexity,
            score,
            signals,
        }
    }
}
