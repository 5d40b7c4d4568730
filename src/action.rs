//! Action classifier: maps a parsed directive onto the closed set of actions
//! the assistant knows how to perform.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::parser::StructuredResult;

/// Every action the assistant can carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// Open a URL or document
    OpenReference,
    /// Put drafted text on the clipboard
    DraftText,
    /// Search local files
    RunLookup,
    /// Run a shell command
    RunCommand,
    ShowNotification,
    /// Warn that the captured content looks sensitive
    FlagSensitiveContent,
    NoOp,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        ActionKind::OpenReference,
        ActionKind::DraftText,
        ActionKind::RunLookup,
        ActionKind::RunCommand,
        ActionKind::ShowNotification,
        ActionKind::FlagSensitiveContent,
        ActionKind::NoOp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::OpenReference => "open-reference",
            ActionKind::DraftText => "draft-text",
            ActionKind::RunLookup => "run-lookup",
            ActionKind::RunCommand => "run-command",
            ActionKind::ShowNotification => "show-notification",
            ActionKind::FlagSensitiveContent => "flag-sensitive-content",
            ActionKind::NoOp => "no-op",
        }
    }

    /// Resolve a backend-written name, accepting legacy aliases.
    ///
    /// Matching ignores case and treats `_` and `-` alike.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('_', "-");
        let kind = match normalized.as_str() {
            "open-reference" | "open-url" => ActionKind::OpenReference,
            "draft-text" | "add-to-clipboard" => ActionKind::DraftText,
            "run-lookup" | "search-file" => ActionKind::RunLookup,
            "run-command" => ActionKind::RunCommand,
            "show-notification" => ActionKind::ShowNotification,
            "flag-sensitive-content" => ActionKind::FlagSensitiveContent,
            "no-op" | "noop" | "do-nothing" | "none" => ActionKind::NoOp,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether `name` is a legacy action the assistant recognises but no
    /// longer performs. Those answers are shown as text instead.
    pub fn is_unsupported_name(name: &str) -> bool {
        matches!(
            name.trim().to_ascii_lowercase().replace('_', "-").as_str(),
            "fix-error" | "explain-code"
        )
    }

    /// Parameters that must be present for the action to be usable.
    pub fn required_params(self) -> &'static [&'static str] {
        match self {
            ActionKind::OpenReference => &["url"],
            ActionKind::RunLookup => &["query"],
            ActionKind::RunCommand => &["command"],
            _ => &[],
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action from the closed set, ready for the caller to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedAction {
    pub kind: ActionKind,
    pub parameters: BTreeMap<String, String>,
    pub confidence: f64,
    /// Caller should ask before performing it
    pub requires_confirmation: bool,
}

/// Why no action was recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum NoActionReason {
    /// The response carried no directive
    NoDirective,
    /// The directive named an action outside the closed set
    UnknownKind { kind: String },
    /// A known legacy action that is not carried out
    Unsupported { kind: String },
    MissingParameter { kind: ActionKind, parameter: String },
}

/// Classifier verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Recognized(RecognizedAction),
    NoAction {
        reason: NoActionReason,
        /// The answer text, unchanged
        original_text: String,
    },
}

impl Action {
    pub fn recognized(&self) -> Option<&RecognizedAction> {
        match self {
            Action::Recognized(action) => Some(action),
            Action::NoAction { .. } => None,
        }
    }

    pub fn kind(&self) -> Option<ActionKind> {
        self.recognized().map(|a| a.kind)
    }
}

/// Maps structured results onto [`Action`]s. Pure and deterministic.
#[derive(Debug, Clone, Copy)]
pub struct ActionClassifier {
    auto_execute_threshold: f64,
}

impl Default for ActionClassifier {
    fn default() -> Self {
        Self {
            auto_execute_threshold: 0.7,
        }
    }
}

impl ActionClassifier {
    pub fn new(auto_execute_threshold: f64) -> Self {
        Self {
            auto_execute_threshold,
        }
    }

    pub fn classify(&self, result: &StructuredResult) -> Action {
        // A rejected marker may have been ordinary prose, so hand back
        // everything the backend wrote.
        let no_action = |reason: NoActionReason| Action::NoAction {
            reason,
            original_text: result.raw_text.clone(),
        };

        let Some(directive) = &result.action else {
            return no_action(NoActionReason::NoDirective);
        };

        if ActionKind::is_unsupported_name(&directive.kind) {
            debug!(kind = %directive.kind, "unsupported action kind");
            return no_action(NoActionReason::Unsupported {
                kind: directive.kind.clone(),
            });
        }

        let Some(kind) = ActionKind::from_name(&directive.kind) else {
            debug!(kind = %directive.kind, "unrecognized action kind");
            return no_action(NoActionReason::UnknownKind {
                kind: directive.kind.clone(),
            });
        };

        if let Some(missing) = kind
            .required_params()
            .iter()
            .find(|p| directive.parameters.get(**p).map_or(true, |v| v.trim().is_empty()))
        {
            debug!(%kind, parameter = *missing, "action missing required parameter");
            return no_action(NoActionReason::MissingParameter {
                kind,
                parameter: missing.to_string(),
            });
        }

        let requires_confirmation = kind != ActionKind::NoOp
            && (kind == ActionKind::RunCommand
                || result.confidence < self.auto_execute_threshold);

        Action::Recognized(RecognizedAction {
            kind,
            parameters: directive.parameters.clone(),
            confidence: result.confidence,
            requires_confirmation,
        })
    }
}
