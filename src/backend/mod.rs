//! Inference backends: tiers, the shared registry, HTTP clients, and health
//! probing.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use synth_core::backend::{
//!     BackendDescriptor, BackendRegistry, HealthProber, HttpBackend, Tier,
//! };
//!
//! let registry = BackendRegistry::new(vec![
//!     BackendDescriptor::new(Tier::Fast, "http://localhost:11434", "qwen2.5:3b"),
//!     BackendDescriptor::new(Tier::Balanced, "http://localhost:11435", "qwen2.5:7b"),
//! ])?;
//!
//! let prober = HealthProber::new(registry.clone(), Arc::new(HttpBackend::new()?));
//! prober.probe_all().await;
//! for row in registry.snapshot() {
//!     println!("{} -> {}", row.tier, row.health);
//! }
//! ```

mod client;
mod health;
mod registry;
mod types;

pub(crate) use client::http_client;
pub use client::{BackendFailure, HttpBackend, InferenceBackend};
pub use health::{HealthProber, DEFAULT_HEALTH_TTL, MAX_PROBE_TIMEOUT};
pub use registry::{BackendRegistry, HealthReport};
pub use types::{BackendDescriptor, Health, LatencyClass, Protocol, Tier};
