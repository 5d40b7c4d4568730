//! Static configuration: backend tiers, augmentation toggles, and thresholds.
//!
//! Loading merges, later layers overriding earlier ones:
//! 1. Compiled defaults
//! 2. `~/.config/synth/synth.toml`
//! 3. `./synth.toml`
//! 4. `SYNTH_*` environment variables (`__` separates nesting levels, e.g.
//!    `SYNTH_AUGMENT__WEB_SEARCH_ENABLED=false`)
//!
//! There is no hot reload; the configuration is read once at startup.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::backend::{
    BackendDescriptor, BackendRegistry, LatencyClass, Protocol, Tier, MAX_PROBE_TIMEOUT,
};
use crate::complexity::ComplexityClassifier;
use crate::error::{Error, Result};

/// One configured backend tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub tier: Tier,
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub protocol: Protocol,
    /// Defaults per tier when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_class: Option<LatencyClass>,
    /// Defaults per tier when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl BackendConfig {
    pub fn new(tier: Tier, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            tier,
            endpoint: endpoint.into(),
            model: model.into(),
            protocol: Protocol::default(),
            latency_class: None,
            timeout_secs: None,
            api_key: None,
        }
    }

    pub fn to_descriptor(&self) -> BackendDescriptor {
        let mut descriptor = BackendDescriptor::new(self.tier, &self.endpoint, &self.model)
            .with_protocol(self.protocol)
            .with_latency_class(
                self.latency_class
                    .unwrap_or_else(|| self.tier.default_latency_class()),
            )
            .with_timeout(
                self.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.tier.default_timeout()),
            );
        if let Some(key) = &self.api_key {
            descriptor = descriptor.with_api_key(key);
        }
        descriptor
    }
}

/// Health probing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Clamped to 2000
    pub probe_timeout_ms: u64,
    pub ttl_secs: u64,
    /// Probe on an interval instead of lazily before each dispatch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_interval_secs: Option<u64>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2000,
            ttl_secs: 30,
            background_interval_secs: None,
        }
    }
}

impl HealthSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms).min(MAX_PROBE_TIMEOUT)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn background_interval(&self) -> Option<Duration> {
        self.background_interval_secs.map(Duration::from_secs)
    }
}

/// Augmentation toggles, limits, and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentSettings {
    pub retrieval_enabled: bool,
    pub web_search_enabled: bool,
    /// Maximum rendered prompt length in characters
    pub prompt_budget_chars: usize,
    pub retrieval_top_k: usize,
    /// Snippets below this relevance are discarded
    pub min_relevance: f64,
    pub web_top_n: usize,
    /// Relevance assigned to the top web result when ranking for the budget
    pub web_result_relevance: f64,
    pub collaborator_timeout_ms: u64,
    pub capability_timeout_ms: u64,
    /// Store web results in the retrieval store after each search
    pub web_write_back: bool,
    /// Rank retrieval by this Ollama embedding model instead of term overlap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    /// Ollama server for embeddings; the first Ollama backend when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_endpoint: Option<String>,
}

impl Default for AugmentSettings {
    fn default() -> Self {
        Self {
            retrieval_enabled: true,
            web_search_enabled: true,
            prompt_budget_chars: 6000,
            retrieval_top_k: 5,
            min_relevance: 0.3,
            web_top_n: 5,
            web_result_relevance: 0.5,
            collaborator_timeout_ms: 3000,
            capability_timeout_ms: 1000,
            web_write_back: true,
            embedding_model: None,
            embedding_endpoint: None,
        }
    }
}

impl AugmentSettings {
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }
}

/// Complexity score thresholds for tier selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub moderate_threshold: i32,
    pub complex_threshold: i32,
    pub long_query_chars: usize,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        let classifier = ComplexityClassifier::default();
        Self {
            moderate_threshold: classifier.moderate_threshold,
            complex_threshold: classifier.complex_threshold,
            long_query_chars: classifier.long_query_chars,
        }
    }
}

impl RoutingSettings {
    pub fn classifier(&self) -> ComplexityClassifier {
        ComplexityClassifier::with_thresholds(self.moderate_threshold, self.complex_threshold)
            .with_long_query_chars(self.long_query_chars)
    }
}

/// Confidence levels assigned by the response parser.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceSettings {
    /// Marker parsed cleanly
    pub high: f64,
    /// Marker found but partially malformed
    pub moderate: f64,
    /// No marker
    pub low: f64,
    /// Actions below this confidence need user confirmation
    pub auto_execute_threshold: f64,
}

impl Default for ConfidenceSettings {
    fn default() -> Self {
        Self {
            high: 0.9,
            moderate: 0.6,
            low: 0.3,
            auto_execute_threshold: 0.7,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    pub backends: Vec<BackendConfig>,
    pub health: HealthSettings,
    pub augment: AugmentSettings,
    pub routing: RoutingSettings,
    pub confidence: ConfidenceSettings,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            backends: vec![
                BackendConfig::new(Tier::Fast, "http://localhost:11434", "qwen2.5:3b"),
                BackendConfig::new(Tier::Balanced, "http://localhost:11435", "qwen2.5:7b"),
                BackendConfig::new(Tier::Smart, "http://localhost:11436", "qwen2.5:14b"),
            ],
            health: HealthSettings::default(),
            augment: AugmentSettings::default(),
            routing: RoutingSettings::default(),
            confidence: ConfidenceSettings::default(),
        }
    }
}

fn env_provider() -> Env {
    Env::prefixed("SYNTH_").split("__")
}

fn user_config_path() -> std::path::PathBuf {
    dirs::config_dir()
        .map(|d| d.join("synth/synth.toml"))
        .unwrap_or_default()
}

impl SynthConfig {
    /// Figment with every layer, before extraction.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(SynthConfig::default()))
            .merge(Toml::file(user_config_path()))
            .merge(Toml::file("synth.toml"))
            .merge(env_provider())
    }

    /// Load from the standard locations and validate.
    pub fn load() -> Result<Self> {
        let config: SynthConfig = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from one file plus environment overrides, then validate.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let config: SynthConfig = Figment::new()
            .merge(Serialized::defaults(SynthConfig::default()))
            .merge(Toml::file(path))
            .merge(env_provider())
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string over the defaults, then validate.
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let config: SynthConfig = Figment::new()
            .merge(Serialized::defaults(SynthConfig::default()))
            .merge(Toml::string(toml_content))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check semantic constraints, reporting every violation at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.backends.is_empty() {
            errors.push("at least one backend must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.tier) {
                errors.push(format!("tier {} configured more than once", backend.tier));
            }
            if backend.endpoint.trim().is_empty() {
                errors.push(format!("backend {} has an empty endpoint", backend.tier));
            }
            if backend.model.trim().is_empty() {
                errors.push(format!("backend {} has an empty model", backend.tier));
            }
            if backend.timeout_secs == Some(0) {
                errors.push(format!("backend {} timeout_secs must be positive", backend.tier));
            }
        }

        if self.augment.prompt_budget_chars == 0 {
            errors.push("augment.prompt_budget_chars must be positive".to_string());
        }

        let unit = |name: &str, value: f64, errors: &mut Vec<String>| {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{} must be within [0, 1], got {}", name, value));
            }
        };
        unit("augment.min_relevance", self.augment.min_relevance, &mut errors);
        unit(
            "augment.web_result_relevance",
            self.augment.web_result_relevance,
            &mut errors,
        );
        unit("confidence.high", self.confidence.high, &mut errors);
        unit("confidence.moderate", self.confidence.moderate, &mut errors);
        unit("confidence.low", self.confidence.low, &mut errors);
        unit(
            "confidence.auto_execute_threshold",
            self.confidence.auto_execute_threshold,
            &mut errors,
        );

        if self.routing.complex_threshold < self.routing.moderate_threshold {
            errors.push(format!(
                "routing.complex_threshold ({}) must not be below routing.moderate_threshold ({})",
                self.routing.complex_threshold, self.routing.moderate_threshold
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors.join("; ")))
        }
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.backends.iter().map(BackendConfig::to_descriptor).collect()
    }

    /// Build the registry for the configured tiers.
    pub fn to_registry(&self) -> Result<BackendRegistry> {
        BackendRegistry::new(self.descriptors())
    }

    /// Ollama server used for embeddings, when an embedding model is set.
    pub fn embedding_endpoint(&self) -> Option<String> {
        self.augment.embedding_model.as_ref()?;
        self.augment.embedding_endpoint.clone().or_else(|| {
            self.descriptors()
                .into_iter()
                .find(|d| d.protocol == Protocol::Ollama)
                .map(|d| d.endpoint)
        })
    }
}
