//! Inference backend trait and the HTTP implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;
use tracing::debug;

use crate::error::{Error, Result};

use super::types::{BackendDescriptor, Health, Protocol};

/// Why a single generate call failed.
///
/// The dispatcher turns these into attempt outcomes; they never reach the
/// caller directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendFailure {
    /// The backend's own client-side timeout fired
    #[error("request timed out: {0}")]
    Timeout(String),
    /// Transport failure: refused, reset, DNS, TLS
    #[error("connection failed: {0}")]
    Connection(String),
    /// Endpoint answered, but with an error status or an unusable body
    #[error("backend error: {0}")]
    Backend(String),
}

/// A way to send a text prompt to a backend and receive text back.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Generate a completion for `prompt` on the given backend.
    async fn generate(
        &self,
        backend: &BackendDescriptor,
        prompt: &str,
    ) -> std::result::Result<String, BackendFailure>;

    /// Lightweight reachability round-trip.
    ///
    /// Any HTTP response, even an error status, counts as reachable.
    async fn probe(&self, backend: &BackendDescriptor) -> Health;
}

const USER_AGENT: &str = concat!("synth-core/", env!("CARGO_PKG_VERSION"));

/// reqwest client shared by inference backends and augmentation sources.
///
/// Reading the system proxy settings can panic when the assistant runs inside
/// the macOS app sandbox. The client is then rebuilt with proxies disabled.
pub(crate) fn http_client() -> Result<Client> {
    let builder = || Client::builder().user_agent(USER_AGENT);
    if let Ok(Ok(client)) = catch_unwind(AssertUnwindSafe(|| builder().build())) {
        return Ok(client);
    }
    debug!("system proxy lookup failed, building client without proxies");
    builder()
        .no_proxy()
        .build()
        .map_err(|e| Error::Http(format!("cannot build HTTP client: {}", e)))
}

/// reqwest-backed client for Ollama and OpenAI-compatible endpoints.
///
/// Each request carries the descriptor's timeout; the dispatcher also wraps
/// the call in its own timeout so a hung connection cannot outlive the budget.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: Client,
}

// Ollama API types
#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpBackend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: http_client()?,
        })
    }

    /// Use an existing reqwest client.
    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    fn probe_url(backend: &BackendDescriptor) -> String {
        match backend.protocol {
            Protocol::Ollama => format!("{}/api/version", backend.base_url()),
            Protocol::OpenaiCompatible => format!("{}/v1/models", backend.base_url()),
        }
    }

    async fn generate_ollama(
        &self,
        backend: &BackendDescriptor,
        prompt: &str,
    ) -> std::result::Result<String, BackendFailure> {
        let url = format!("{}/api/generate", backend.base_url());
        let body = OllamaGenerateRequest {
            model: &backend.model,
            prompt,
            stream: false,
        };

        let response = self
            .http
            .post(&url)
            .timeout(backend.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let text = read_success_body(response).await?;
        let parsed: OllamaGenerateResponse = serde_json::from_str(&text)
            .map_err(|e| BackendFailure::Backend(format!("undecodable Ollama body: {}", e)))?;
        Ok(parsed.response)
    }

    async fn generate_openai(
        &self,
        backend: &BackendDescriptor,
        prompt: &str,
    ) -> std::result::Result<String, BackendFailure> {
        let url = format!("{}/v1/chat/completions", backend.base_url());
        let body = ChatRequest {
            model: &backend.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        let mut request = self.http.post(&url).timeout(backend.timeout).json(&body);
        if let Some(key) = &backend.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let text = read_success_body(response).await?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| BackendFailure::Backend(format!("undecodable chat body: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendFailure::Backend("response contained no choices".to_string()))
    }
}

fn classify_transport_error(err: reqwest::Error) -> BackendFailure {
    if err.is_timeout() {
        BackendFailure::Timeout(err.to_string())
    } else {
        BackendFailure::Connection(err.to_string())
    }
}

async fn read_success_body(
    response: reqwest::Response,
) -> std::result::Result<String, BackendFailure> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BackendFailure::Backend(format!("failed to read body: {}", e)))?;
    if !status.is_success() {
        return Err(BackendFailure::Backend(format!("status {}: {}", status, body)));
    }
    Ok(body)
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn generate(
        &self,
        backend: &BackendDescriptor,
        prompt: &str,
    ) -> std::result::Result<String, BackendFailure> {
        debug!(tier = %backend.tier, model = %backend.model, "sending generate request");
        match backend.protocol {
            Protocol::Ollama => self.generate_ollama(backend, prompt).await,
            Protocol::OpenaiCompatible => self.generate_openai(backend, prompt).await,
        }
    }

    async fn probe(&self, backend: &BackendDescriptor) -> Health {
        let mut request = self.http.get(Self::probe_url(backend));
        if let Some(key) = &backend.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().await {
            Ok(_) => Health::Reachable,
            Err(e) => {
                debug!(tier = %backend.tier, error = %e, "probe failed");
                Health::Unreachable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Tier;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ollama(uri: &str) -> BackendDescriptor {
        BackendDescriptor::new(Tier::Fast, uri, "qwen2.5:3b")
    }

    #[tokio::test]
    async fn test_ollama_generate_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "qwen2.5:3b",
                "stream": false
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"response": "Brain connected!"})),
            )
            .mount(&server)
            .await;

        let backend = HttpBackend::new().unwrap();
        let text = backend.generate(&ollama(&server.uri()), "hi").await.unwrap();
        assert_eq!(text, "Brain connected!");
    }

    #[tokio::test]
    async fn test_ollama_error_status_is_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let backend = HttpBackend::new().unwrap();
        let err = backend
            .generate(&ollama(&server.uri()), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendFailure::Backend(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn test_malformed_body_is_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let backend = HttpBackend::new().unwrap();
        let err = backend
            .generate(&ollama(&server.uri()), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendFailure::Backend(_)));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"response": "late"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let backend = HttpBackend::new().unwrap();
        let desc = ollama(&server.uri()).with_timeout(Duration::from_millis(50));
        let err = backend.generate(&desc, "hi").await.unwrap_err();
        assert!(matches!(err, BackendFailure::Timeout(_)));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        // Nothing listens on port 9 locally.
        let backend = HttpBackend::new().unwrap();
        let desc = ollama("http://127.0.0.1:9").with_timeout(Duration::from_secs(2));
        let err = backend.generate(&desc, "hi").await.unwrap_err();
        assert!(matches!(
            err,
            BackendFailure::Connection(_) | BackendFailure::Timeout(_)
        ));
        assert_eq!(backend.probe(&desc).await, Health::Unreachable);
    }

    #[tokio::test]
    async fn test_openai_compatible_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "cloud answer"}}]
            })))
            .mount(&server)
            .await;

        let desc = BackendDescriptor::new(Tier::CloudPrimary, server.uri(), "gpt-4o-mini")
            .with_protocol(Protocol::OpenaiCompatible)
            .with_api_key("sk-test");
        let backend = HttpBackend::new().unwrap();
        assert_eq!(backend.generate(&desc, "hi").await.unwrap(), "cloud answer");
    }

    #[tokio::test]
    async fn test_probe_error_status_is_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/version"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let backend = HttpBackend::new().unwrap();
        assert_eq!(backend.probe(&ollama(&server.uri())).await, Health::Reachable);
    }
}
