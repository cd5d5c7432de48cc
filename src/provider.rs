//! Provider invoker abstraction and implementations
//!
//! Provides the [`ProviderInvoker`] trait the scheduler dispatches through,
//! plus:
//! - [`EchoProvider`]: testing/demo provider
//! - [`HttpProvider`]: OpenAI, Anthropic, Gemini and DeepSeek chat APIs
//!
//! ## Cancellation contract
//!
//! Every `invoke` receives a [`CancellationToken`]. Implementations must
//! return [`InvocationOutcome::Cancelled`] once they observe cancellation,
//! and may instead return the real outcome if the call had already finished.
//! The scheduler only reclaims the slot when `invoke` returns.
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`: Required for [`ProviderKind::OpenAi`]
//! - `ANTHROPIC_API_KEY`: Required for [`ProviderKind::Anthropic`]
//! - `GEMINI_API_KEY`: Required for [`ProviderKind::Gemini`]
//! - `DEEPSEEK_API_KEY`: Required for [`ProviderKind::DeepSeek`]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConfig, ProviderKind};
use crate::request::InvocationPayload;
use crate::SchedulerError;

/// Whether a provider failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Timeouts, rate limits, 5xx, connection errors.
    Transient,
    /// Bad credentials, malformed requests, unusable responses.
    Permanent,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// A failed provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    /// Retry classification.
    pub kind: ProviderErrorKind,
    /// Human-readable description. Never contains prompt text.
    pub message: String,
}

impl ProviderError {
    /// Build a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Build a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Returns `true` for transient failures.
    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// Result of one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// Generated text.
    Success(String),
    /// The call failed.
    Failure(ProviderError),
    /// The call observed its cancellation token.
    Cancelled,
}

impl From<Result<String, ProviderError>> for InvocationOutcome {
    fn from(result: Result<String, ProviderError>) -> Self {
        match result {
            Ok(text) => Self::Success(text),
            Err(e) => Self::Failure(e),
        }
    }
}

/// Capability interface for a model provider.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn ProviderInvoker>`.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    /// Perform one provider call, honouring `cancel` best-effort.
    async fn invoke(&self, payload: &InvocationPayload, cancel: CancellationToken)
        -> InvocationOutcome;

    /// Short name for logs.
    fn name(&self) -> &str;
}

// ============================================================================
// Echo Provider (Testing)
// ============================================================================

/// Dummy echo provider for testing
///
/// Returns the prompt unchanged after a simulated delay. Cancellation during
/// the delay yields [`InvocationOutcome::Cancelled`].
pub struct EchoProvider {
    /// Simulated call latency
    pub delay: Duration,
}

impl EchoProvider {
    /// Echo provider with a 10ms delay.
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
        }
    }

    /// Echo provider with a custom delay.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderInvoker for EchoProvider {
    async fn invoke(
        &self,
        payload: &InvocationPayload,
        cancel: CancellationToken,
    ) -> InvocationOutcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => InvocationOutcome::Cancelled,
            _ = tokio::time::sleep(self.delay) => InvocationOutcome::Success(payload.prompt.clone()),
        }
    }

    fn name(&self) -> &str {
        "echo"
    }
}

// ============================================================================
// HTTP Provider
// ============================================================================

impl ProviderKind {
    fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::DeepSeek => "https://api.deepseek.com",
            Self::Echo => "",
        }
    }

    fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::DeepSeek => Some("DEEPSEEK_API_KEY"),
            Self::Echo => None,
        }
    }
}

/// Chat-completion provider over HTTPS.
///
/// ## Example
///
/// ```no_run
/// use hybrid_scheduler::config::ProviderKind;
/// use hybrid_scheduler::provider::HttpProvider;
/// use std::time::Duration;
///
/// let provider = HttpProvider::new(ProviderKind::Anthropic, "sk-...")
///     .unwrap()
///     .with_timeout(Duration::from_secs(60))
///     .with_max_tokens(1024);
/// ```
pub struct HttpProvider {
    client: reqwest::Client,
    kind: ProviderKind,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl HttpProvider {
    /// Create a provider for `kind` with an explicit API key.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] for [`ProviderKind::Echo`] or an
    /// empty key.
    pub fn new(kind: ProviderKind, api_key: impl Into<String>) -> Result<Self, SchedulerError> {
        if kind == ProviderKind::Echo {
            return Err(SchedulerError::Config(
                "echo is not an HTTP provider".to_string(),
            ));
        }
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(SchedulerError::Config(format!("{kind:?} API key is empty")));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            kind,
            api_key,
            base_url: kind.default_base_url().to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            timeout: Duration::from_secs(30),
        })
    }

    /// Create a provider reading the API key from the kind's environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if the variable is unset or empty.
    pub fn from_env(kind: ProviderKind) -> Result<Self, SchedulerError> {
        let var = kind
            .api_key_env()
            .ok_or_else(|| SchedulerError::Config("echo is not an HTTP provider".to_string()))?;
        let key = std::env::var(var)
            .map_err(|_| SchedulerError::Config(format!("{var} environment variable not set")))?;
        Self::new(kind, key)
    }

    /// Override the API base URL (proxies, self-hosted gateways, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the default maximum tokens when the payload does not specify one.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the default temperature when the payload does not specify one.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request_builder(&self, payload: &InvocationPayload) -> reqwest::RequestBuilder {
        let max_tokens = payload.options.max_tokens.unwrap_or(self.max_tokens);
        let temperature = payload.options.temperature.unwrap_or(self.temperature);
        let messages = json!([{ "role": "user", "content": payload.prompt }]);

        let builder = match self.kind {
            ProviderKind::OpenAi | ProviderKind::DeepSeek | ProviderKind::Echo => self
                .client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&json!({
                    "model": payload.model,
                    "messages": messages,
                    "max_tokens": max_tokens,
                    "temperature": temperature,
                })),
            ProviderKind::Anthropic => self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&json!({
                    "model": payload.model,
                    "messages": messages,
                    "max_tokens": max_tokens,
                    "temperature": temperature,
                })),
            ProviderKind::Gemini => self
                .client
                .post(format!(
                    "{}/v1beta/models/{}:generateContent",
                    self.base_url, payload.model
                ))
                .query(&[("key", self.api_key.as_str())])
                .json(&json!({
                    "contents": [{ "parts": [{ "text": payload.prompt }] }],
                    "generationConfig": {
                        "maxOutputTokens": max_tokens,
                        "temperature": temperature,
                    },
                })),
        };
        builder.timeout(self.timeout)
    }

    async fn call(&self, payload: &InvocationPayload) -> Result<String, ProviderError> {
        let response = self
            .request_builder(payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(self.kind, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{:?} API error {}: {}", self.kind, status, truncate(&body, 256));
            return Err(match classify_status(status) {
                ProviderErrorKind::Transient => ProviderError::transient(message),
                ProviderErrorKind::Permanent => ProviderError::permanent(message),
            });
        }

        let body: Value = response.json().await.map_err(|e| {
            ProviderError::permanent(format!("{:?} response is not JSON: {e}", self.kind))
        })?;
        extract_text(self.kind, &body)
    }
}

#[async_trait]
impl ProviderInvoker for HttpProvider {
    async fn invoke(
        &self,
        payload: &InvocationPayload,
        cancel: CancellationToken,
    ) -> InvocationOutcome {
        if cancel.is_cancelled() {
            return InvocationOutcome::Cancelled;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => InvocationOutcome::Cancelled,
            result = self.call(payload) => result.into(),
        }
    }

    fn name(&self) -> &str {
        match self.kind {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Echo => "echo",
        }
    }
}

/// Map an HTTP status to a retry classification.
pub fn classify_status(status: reqwest::StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        408 | 425 | 429 | 500..=599 => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Permanent,
    }
}

fn classify_transport_error(kind: ProviderKind, e: reqwest::Error) -> ProviderError {
    let message = format!("{kind:?} request failed: {e}");
    if e.is_builder() || e.is_decode() {
        ProviderError::permanent(message)
    } else {
        ProviderError::transient(message)
    }
}

fn extract_text(kind: ProviderKind, body: &Value) -> Result<String, ProviderError> {
    let pointer = match kind {
        ProviderKind::OpenAi | ProviderKind::DeepSeek | ProviderKind::Echo => {
            "/choices/0/message/content"
        }
        ProviderKind::Anthropic => "/content/0/text",
        ProviderKind::Gemini => "/candidates/0/content/parts/0/text",
    };
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::permanent(format!("{kind:?} response missing {pointer}")))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Build the invoker described by `config`.
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] if an HTTP provider's API key is missing.
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn ProviderInvoker>, SchedulerError> {
    if config.kind == ProviderKind::Echo {
        return Ok(Arc::new(EchoProvider::with_delay(Duration::from_millis(
            config.echo_delay_ms,
        ))));
    }
    let mut provider = HttpProvider::from_env(config.kind)?
        .with_timeout(Duration::from_millis(config.timeout_ms))
        .with_max_tokens(config.max_tokens)
        .with_temperature(config.temperature);
    if let Some(url) = &config.base_url {
        provider = provider.with_base_url(url);
    }
    Ok(Arc::new(provider))
}
