//! Error types for synth-core.

use thiserror::Error;

use crate::backend::Tier;
use crate::dispatch::DispatchAttempt;

/// Result type alias using synth-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while routing and dispatching a query.
///
/// Only [`Error::DispatchExhausted`], [`Error::Cancelled`] and
/// [`Error::UnknownTier`] ever reach the caller of
/// [`Pipeline::handle_query`](crate::Pipeline::handle_query). Collaborator and
/// capability failures are absorbed by the augmenter, and per-attempt failures
/// are recorded on [`DispatchAttempt`] instead of being raised.
#[derive(Error, Debug)]
pub enum Error {
    /// A tier was requested that is not present in the registry
    #[error("Unknown tier: {tier}")]
    UnknownTier { tier: Tier },

    /// Every tier in the fallback sequence failed
    #[error("All {} dispatch attempts failed", attempts.len())]
    DispatchExhausted { attempts: Vec<DispatchAttempt> },

    /// The caller abandoned the query
    #[error("Query cancelled")]
    Cancelled,

    /// Retrieval store or web search call failed
    #[error("Collaborator error: {source_name} - {message}")]
    Collaborator {
        source_name: String,
        message: String,
    },

    /// Retrieval store or web search call exceeded its budget
    #[error("Collaborator {source_name} timed out after {timeout_ms}ms")]
    CollaboratorTimeout { source_name: String, timeout_ms: u64 },

    /// A registered capability failed to execute
    #[error("Capability {name} failed: {message}")]
    Capability { name: String, message: String },

    /// HTTP transport error outside the dispatch loop
    #[error("HTTP error: {0}")]
    Http(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an unknown tier error.
    pub fn unknown_tier(tier: Tier) -> Self {
        Self::UnknownTier { tier }
    }

    /// Create a dispatch exhausted error from the recorded attempts.
    pub fn exhausted(attempts: Vec<DispatchAttempt>) -> Self {
        Self::DispatchExhausted { attempts }
    }

    /// Create a collaborator error.
    pub fn collaborator(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a collaborator timeout error.
    pub fn collaborator_timeout(source_name: impl Into<String>, timeout_ms: u64) -> Self {
        Self::CollaboratorTimeout {
            source_name: source_name.into(),
            timeout_ms,
        }
    }

    /// Create a capability error.
    pub fn capability(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Capability {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True when no backend produced an answer.
    ///
    /// Callers use this to tell "nothing reachable" apart from a
    /// low-confidence answer.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::DispatchExhausted { .. })
    }

    /// Attempts recorded before exhaustion, if this is an exhaustion error.
    pub fn attempts(&self) -> Option<&[DispatchAttempt]> {
        match self {
            Self::DispatchExhausted { attempts } => Some(attempts),
            _ => None,
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
