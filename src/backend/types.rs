//! Backend tiers, health states, and descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Inference backend tier.
///
/// Declaration order is the fallback priority: local tiers from smallest to
/// largest, then cloud tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    /// Small local model (e.g., qwen2.5:3b)
    Fast = 0,
    /// Mid-size local model (e.g., qwen2.5:7b)
    Balanced = 1,
    /// Largest local model (e.g., qwen2.5:14b)
    Smart = 2,
    /// First cloud fallback
    CloudPrimary = 3,
    /// Second cloud fallback
    CloudSecondary = 4,
}

impl Tier {
    /// All tiers in fallback priority order.
    pub const ALL: [Tier; 5] = [
        Tier::Fast,
        Tier::Balanced,
        Tier::Smart,
        Tier::CloudPrimary,
        Tier::CloudSecondary,
    ];

    /// Whether this tier runs on the private inference server.
    pub fn is_local(self) -> bool {
        matches!(self, Tier::Fast | Tier::Balanced | Tier::Smart)
    }

    pub fn is_cloud(self) -> bool {
        !self.is_local()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Balanced => "balanced",
            Tier::Smart => "smart",
            Tier::CloudPrimary => "cloud-primary",
            Tier::CloudSecondary => "cloud-secondary",
        }
    }

    /// Latency class assumed when the configuration does not name one.
    pub fn default_latency_class(self) -> LatencyClass {
        match self {
            Tier::Fast | Tier::Balanced => LatencyClass::Seconds,
            Tier::Smart | Tier::CloudPrimary | Tier::CloudSecondary => {
                LatencyClass::TensOfSeconds
            }
        }
    }

    /// Per-attempt timeout budget when the configuration does not name one.
    ///
    /// Smaller tiers get shorter budgets; cloud gets the longest.
    pub fn default_timeout(self) -> Duration {
        match self {
            Tier::Fast => Duration::from_secs(20),
            Tier::Balanced => Duration::from_secs(30),
            Tier::Smart => Duration::from_secs(60),
            Tier::CloudPrimary | Tier::CloudSecondary => Duration::from_secs(90),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fast" => Ok(Tier::Fast),
            "balanced" => Ok(Tier::Balanced),
            "smart" => Ok(Tier::Smart),
            "cloud-primary" | "cloud" => Ok(Tier::CloudPrimary),
            "cloud-secondary" => Ok(Tier::CloudSecondary),
            other => Err(format!("unrecognized tier '{}'", other)),
        }
    }
}

/// Reachability of a backend as last observed by the health prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Reachable => write!(f, "reachable"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Coarse expected response latency of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyClass {
    SubSecond,
    Seconds,
    TensOfSeconds,
}

/// Wire protocol spoken by a backend endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Ollama `/api/generate`
    #[default]
    Ollama,
    /// OpenAI-style `/v1/chat/completions`
    OpenaiCompatible,
}

/// Static description of one backend tier plus its mutable health sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub tier: Tier,
    /// Base URL (e.g., "http://localhost:11435")
    pub endpoint: String,
    /// Model identifier sent with each request
    pub model: String,
    pub protocol: Protocol,
    pub latency_class: LatencyClass,
    /// Per-attempt timeout budget
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Bearer key for cloud endpoints
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub health: Health,
    /// When `health` was last sampled
    pub last_checked: Option<DateTime<Utc>>,
}

impl BackendDescriptor {
    /// Create a descriptor with tier defaults and unknown health.
    pub fn new(tier: Tier, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            tier,
            endpoint: endpoint.into(),
            model: model.into(),
            protocol: Protocol::default(),
            latency_class: tier.default_latency_class(),
            timeout: tier.default_timeout(),
            api_key: None,
            health: Health::Unknown,
            last_checked: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_latency_class(mut self, latency_class: LatencyClass) -> Self {
        self.latency_class = latency_class;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Whether the health sample is missing or older than `ttl`.
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match self.last_checked {
            None => true,
            Some(checked) => {
                let age = now.signed_duration_since(checked);
                age.to_std().map_or(false, |age| age > ttl)
            }
        }
    }

    /// Endpoint without a trailing slash, for path joining.
    pub fn base_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
