//! # synth-core
//!
//! Query routing and model dispatch for a desktop assistant. A question
//! arrives with optional context (clipboard, screen text, a requested tier);
//! the pipeline augments it, picks an ordered list of model tiers, walks that
//! list until one backend answers, then parses the answer and classifies any
//! embedded action.
//!
//! ## Core Components
//!
//! - **Backend**: Tier descriptors, the shared registry, HTTP clients, and health probing
//! - **Augment**: Retrieval, web search, and capability supplements under a prompt budget
//! - **Router**: Complexity-driven tier selection
//! - **Dispatch**: Ordered fallback across tiers with per-attempt timeouts
//! - **Parser / Action**: Structured answers and the closed action set
//! - **Pipeline**: `handle_query`, wiring all of the above
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use synth_core::{HttpBackend, Pipeline, SynthConfig};
//!
//! let config = SynthConfig::load()?;
//! let pipeline = Pipeline::from_config(&config, Arc::new(HttpBackend::new()?))?;
//!
//! let outcome = pipeline.handle_query("What is 12 * (3 + 4)?", vec![], None).await?;
//! println!("{} (via {:?})", outcome.result.answer_text, outcome.source());
//! ```

pub mod action;
pub mod augment;
pub mod backend;
pub mod capability;
pub mod complexity;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod parser;
pub mod pipeline;
pub mod query;
pub mod router;

mod proptest;
#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use action::{Action, ActionClassifier, ActionKind, NoActionReason, RecognizedAction};
pub use augment::{AugmentedPrompt, ContextAugmenter, Supplement, SupplementKind};
pub use backend::{
    BackendDescriptor, BackendRegistry, Health, HealthProber, HealthReport, HttpBackend,
    InferenceBackend, LatencyClass, Protocol, Tier,
};
pub use capability::{ArithmeticCapability, Capability, CapabilityTable, ClockCapability};
pub use complexity::{
    ComplexityAssessment, ComplexityClassifier, ComplexitySignals, QueryComplexity,
};
pub use config::{
    AugmentSettings, BackendConfig, ConfidenceSettings, HealthSettings, RoutingSettings,
    SynthConfig,
};
pub use dispatch::{AttemptOutcome, DispatchAttempt, DispatchResult, DispatchStats, Dispatcher};
pub use error::{Error, Result};
pub use parser::{parse, ActionDirective, ParseQuality, ResponseParser, StructuredResult};
pub use pipeline::{Pipeline, QueryOutcome};
pub use query::{AugmentFlags, ContextHint, HintKind, Query};
pub use router::{TierPlan, TierSelector};
