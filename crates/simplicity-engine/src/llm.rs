//! Generative-analysis backend abstraction and implementations.
//!
//! Defines an enum-based dispatch for text-generation backends, avoiding
//! the dyn-compatibility issues with async trait methods. Concrete
//! implementations exist for the Google `generateContent` API (native
//! inline-image support, the default collaborator) and OpenAI-compatible
//! chat completions APIs. A mock backend with a canned-response queue
//! drives the orchestrator in tests.
//!
//! The engine does not care which model is behind the API -- it sends a
//! prompt (optionally with a canvas image attached) and expects a text
//! response containing one JSON object.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::{BackendConfig, BackendType};
use crate::error::EngineError;

/// Overall request timeout for a single backend call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Connect timeout for a single backend call.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sampling temperature for both analysis passes.
const TEMPERATURE: f64 = 0.7;

/// A backend response: the raw text plus the reported output-token count
/// (used for machine-cost logging, not stored in snapshots).
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Raw response text, expected to contain one JSON object.
    pub text: String,
    /// Output tokens reported by the provider, when available.
    pub output_tokens: Option<u64>,
}

/// A text-generation backend that can process a prompt and return text.
///
/// Uses enum dispatch instead of trait objects because async methods are
/// not dyn-compatible in Rust.
pub enum LlmBackend {
    /// Google `generateContent` API.
    Gemini(GeminiBackend),
    /// `OpenAI`-compatible chat completions API.
    OpenAi(OpenAiBackend),
    /// Canned-response queue for tests.
    Mock(MockBackend),
}

impl LlmBackend {
    /// Send a prompt (optionally with an inline PNG) and return the
    /// response text.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Backend`] if the HTTP call fails or the
    /// response text cannot be extracted.
    pub async fn complete(
        &self,
        prompt: &str,
        image_base64: Option<&str>,
    ) -> Result<LlmResponse, EngineError> {
        match self {
            Self::Gemini(backend) => backend.complete(prompt, image_base64).await,
            Self::OpenAi(backend) => backend.complete(prompt, image_base64).await,
            Self::Mock(backend) => backend.complete(),
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &str {
        match self {
            Self::Gemini(_) => "gemini",
            Self::OpenAi(_) => "openai-compatible",
            Self::Mock(_) => "mock",
        }
    }

    /// Access the mock backend, when this is one (test harness hook).
    pub const fn as_mock(&self) -> Option<&MockBackend> {
        match self {
            Self::Mock(backend) => Some(backend),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Gemini backend
// ---------------------------------------------------------------------------

/// Backend for the Google `generateContent` API.
///
/// Requests go to `{api_url}/models/{model}:generateContent?key={api_key}`
/// with the prompt as a text part and the canvas image, when present, as an
/// `inline_data` PNG part.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

impl GeminiBackend {
    /// Create a new Gemini backend.
    pub fn new(config: &BackendConfig, max_output_tokens: u32) -> Self {
        Self {
            client: http_client(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_output_tokens,
        }
    }

    /// Send a prompt and return the response text.
    async fn complete(
        &self,
        prompt: &str,
        image_base64: Option<&str>,
    ) -> Result<LlmResponse, EngineError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_url, self.model, self.api_key
        );

        let mut parts = vec![serde_json::json!({"text": prompt})];
        if let Some(image) = image_base64 {
            parts.push(serde_json::json!({
                "inline_data": {
                    "mime_type": "image/png",
                    "data": image
                }
            }));
        }

        let body = serde_json::json!({
            "contents": [{"parts": parts}],
            "generationConfig": {
                "temperature": TEMPERATURE,
                "maxOutputTokens": self.max_output_tokens
            }
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Backend(format!("Gemini request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            return Err(EngineError::Backend(format!(
                "Gemini returned {status}: {error_body}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Backend(format!("Gemini response parse failed: {e}")))?;

        let text = extract_gemini_content(&json)?;
        Ok(LlmResponse {
            text,
            output_tokens: extract_gemini_output_tokens(&json),
        })
    }
}

/// Concatenate the text parts of a Gemini `generateContent` response.
fn extract_gemini_content(json: &serde_json::Value) -> Result<String, EngineError> {
    let parts = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(serde_json::Value::as_array);

    let text: String = parts
        .into_iter()
        .flatten()
        .filter_map(|part| part.get("text").and_then(serde_json::Value::as_str))
        .collect();

    if text.trim().len() < 10 {
        return Err(EngineError::Backend(
            "Gemini response empty or too short".to_owned(),
        ));
    }
    Ok(text)
}

/// Output-token count reported in a Gemini response, when present.
fn extract_gemini_output_tokens(json: &serde_json::Value) -> Option<u64> {
    json.get("usageMetadata")
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(serde_json::Value::as_u64)
}

// ---------------------------------------------------------------------------
// OpenAI-compatible backend
// ---------------------------------------------------------------------------

/// Backend for `OpenAI`-compatible chat completions APIs.
///
/// Sends requests to `{api_url}/chat/completions`. When an image is
/// attached, the user message uses the multi-part content form with an
/// `image_url` data URL.
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

impl OpenAiBackend {
    /// Create a new `OpenAI`-compatible backend.
    pub fn new(config: &BackendConfig, max_output_tokens: u32) -> Self {
        Self {
            client: http_client(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_output_tokens,
        }
    }

    /// Send a prompt and return the response text.
    async fn complete(
        &self,
        prompt: &str,
        image_base64: Option<&str>,
    ) -> Result<LlmResponse, EngineError> {
        let url = format!("{}/chat/completions", self.api_url);

        let content = image_base64.map_or_else(
            || serde_json::json!(prompt),
            |image| {
                serde_json::json!([
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/png;base64,{image}")
                    }}
                ])
            },
        );

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": content}],
            "temperature": TEMPERATURE,
            "max_tokens": self.max_output_tokens
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Backend(format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            return Err(EngineError::Backend(format!(
                "OpenAI returned {status}: {error_body}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Backend(format!("OpenAI response parse failed: {e}")))?;

        let text = extract_openai_content(&json)?;
        Ok(LlmResponse {
            text,
            output_tokens: extract_openai_output_tokens(&json),
        })
    }
}

/// Extract the text content from an `OpenAI` chat completions response.
fn extract_openai_content(json: &serde_json::Value) -> Result<String, EngineError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(serde_json::Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| {
            EngineError::Backend("OpenAI response missing choices[0].message.content".to_owned())
        })
}

/// Output-token count reported in an `OpenAI` response, when present.
fn extract_openai_output_tokens(json: &serde_json::Value) -> Option<u64> {
    json.get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(serde_json::Value::as_u64)
}

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// Canned-response backend for tests.
///
/// Responses are consumed front-to-back; an exhausted queue or a queued
/// failure produces [`EngineError::Backend`], which exercises the stage
/// retry paths.
#[derive(Debug, Default)]
pub struct MockBackend {
    queue: Mutex<VecDeque<Result<String, String>>>,
    call_count: AtomicU32,
}

impl MockBackend {
    /// Create a mock backend with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn push_response(&self, text: impl Into<String>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Ok(text.into()));
        }
    }

    /// Queue a failure.
    pub fn push_failure(&self, message: impl Into<String>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Err(message.into()));
        }
    }

    /// Number of completed calls so far.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Pop the next canned response.
    fn complete(&self) -> Result<LlmResponse, EngineError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let next = self
            .queue
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        match next {
            Some(Ok(text)) => {
                let tokens = u64::try_from(text.len() / 4).ok();
                Ok(LlmResponse {
                    text,
                    output_tokens: tokens,
                })
            }
            Some(Err(message)) => Err(EngineError::Backend(message)),
            None => Err(EngineError::Backend("mock queue exhausted".to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Create a backend from configuration.
pub fn create_backend(config: &BackendConfig, max_output_tokens: u32) -> LlmBackend {
    match config.backend_type {
        BackendType::Gemini => LlmBackend::Gemini(GeminiBackend::new(config, max_output_tokens)),
        BackendType::OpenAi => LlmBackend::OpenAi(OpenAiBackend::new(config, max_output_tokens)),
    }
}

/// Shared HTTP client with the collaborator-boundary timeouts.
fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_gemini_content_concatenates_parts() {
        let json = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "{\"structures\": []"},
                        {"text": ", \"ok\": true}"}
                    ]
                }
            }],
            "usageMetadata": {"candidatesTokenCount": 42}
        });
        let text = extract_gemini_content(&json);
        assert!(text.is_ok());
        assert_eq!(
            text.unwrap_or_default(),
            "{\"structures\": [], \"ok\": true}"
        );
        assert_eq!(extract_gemini_output_tokens(&json), Some(42));
    }

    #[test]
    fn extract_gemini_content_rejects_empty() {
        let json = serde_json::json!({"candidates": []});
        assert!(extract_gemini_content(&json).is_err());
    }

    #[test]
    fn extract_openai_content_valid() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "{\"narrative\": {}}"}}],
            "usage": {"completion_tokens": 7}
        });
        let text = extract_openai_content(&json);
        assert!(text.is_ok());
        assert_eq!(extract_openai_output_tokens(&json), Some(7));
    }

    #[test]
    fn extract_openai_content_missing_choices() {
        let json = serde_json::json!({"error": "rate_limit"});
        assert!(extract_openai_content(&json).is_err());
    }

    #[tokio::test]
    async fn mock_backend_serves_queue_in_order() {
        let mock = MockBackend::new();
        mock.push_response("first");
        mock.push_failure("provider down");

        let backend = LlmBackend::Mock(mock);
        let first = backend.complete("prompt", None).await;
        assert!(first.is_ok_and(|r| r.text == "first"));
        let second = backend.complete("prompt", None).await;
        assert!(second.is_err());
        let third = backend.complete("prompt", None).await;
        assert!(third.is_err());
        assert!(backend.as_mock().is_some_and(|m| m.call_count() == 3));
    }

    #[test]
    fn create_backend_dispatches_correctly() {
        let gemini = BackendConfig {
            backend_type: BackendType::Gemini,
            api_url: "https://generativelanguage.googleapis.com/v1".to_owned(),
            api_key: "test".to_owned(),
            model: "test-model".to_owned(),
        };
        assert_eq!(create_backend(&gemini, 1000).name(), "gemini");

        let openai = BackendConfig {
            backend_type: BackendType::OpenAi,
            api_url: "https://api.openai.com/v1".to_owned(),
            api_key: "test".to_owned(),
            model: "test-model".to_owned(),
        };
        assert_eq!(create_backend(&openai, 1000).name(), "openai-compatible");
    }
}
