//! Inference adapters: one "send prompt, get text" contract over
//! heterogeneous serving mechanisms.
//!
//! Every adapter validates the prompt, resolves its credential before any
//! network traffic, and retries transient failures with capped exponential
//! backoff. Failures are reported in the returned [`InferenceResult`], never
//! raised to the caller.

use crate::config::{BackendKind, BenchmarkConfig, ConfigError, ModelConfig};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Default base URL of the hosted chat API
pub const DEFAULT_CHAT_BASE_URL: &str = "https://api.openai.com/v1";
/// Default base URL of the managed inference API
pub const DEFAULT_MANAGED_BASE_URL: &str = "https://api-inference.huggingface.co/models";
/// Endpoint prefix that turns an HTTP entry into the echo adapter
pub const ECHO_ENDPOINT_PREFIX: &str = "mock://echo";

const ERROR_BODY_LIMIT: usize = 200;

/// Errors from a single adapter attempt
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Missing API key env: {0}")]
    MissingCredential(String),

    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0} adapter is not implemented")]
    NotImplemented(String),
}

/// Outcome of one adapter call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Raw model text (empty on failure)
    pub raw_output: String,
    /// Whether the call produced output
    pub success: bool,
    /// Last error when the call failed
    pub error: Option<String>,
}

impl InferenceResult {
    /// Successful call
    #[must_use]
    pub fn ok(raw_output: impl Into<String>) -> Self {
        Self {
            raw_output: raw_output.into(),
            success: true,
            error: None,
        }
    }

    /// Failed call
    #[must_use]
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            raw_output: String::new(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl From<Result<String, AdapterError>> for InferenceResult {
    fn from(outcome: Result<String, AdapterError>) -> Self {
        match outcome {
            Ok(text) => Self::ok(text),
            Err(e) => Self::failed(e),
        }
    }
}

/// Uniform inference contract
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    /// Short adapter label for logs
    fn name(&self) -> &str;

    /// Send `prompt` and return the model text.
    ///
    /// `timeout` bounds each attempt; `max_retries` is the attempt budget
    /// (values below 1 are treated as 1).
    async fn infer(&self, prompt: &str, timeout: Duration, max_retries: u32) -> InferenceResult;
}

/// Credential reference: the variable name and the value resolved for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Environment variable name
    pub env: String,
    /// Resolved value, if the variable was set
    pub value: Option<String>,
}

impl Credential {
    /// Credential with an explicit value
    #[must_use]
    pub fn new(env: impl Into<String>, value: Option<String>) -> Self {
        Self {
            env: env.into(),
            value: value.filter(|v| !v.trim().is_empty()),
        }
    }

    /// Read the variable from the process environment
    #[must_use]
    pub fn from_env(env: impl Into<String>) -> Self {
        let env = env.into();
        let value = std::env::var(&env).ok();
        Self::new(env, value)
    }

    /// The value, or a descriptive error naming the variable
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::MissingCredential` when no value is set.
    pub fn require(&self) -> Result<&str, AdapterError> {
        self.value
            .as_deref()
            .ok_or_else(|| AdapterError::MissingCredential(self.env.clone()))
    }
}

/// Generation parameters read from the registry parameter map
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Sampling temperature (0 = deterministic)
    pub temperature: f64,
    /// Output-token budget
    pub max_tokens: u64,
    /// Optional sampling seed
    pub seed: Option<i64>,
    /// Optional base URL override
    pub base_url: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 512,
            seed: None,
            base_url: None,
        }
    }
}

impl GenerationParams {
    /// Extract known keys from a parameter map; unknown keys are ignored
    #[must_use]
    pub fn from_map(params: &HashMap<String, Value>) -> Self {
        let defaults = Self::default();
        Self {
            temperature: params
                .get("temperature")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.temperature),
            max_tokens: params
                .get("max_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.max_tokens),
            seed: params.get("seed").and_then(Value::as_i64),
            base_url: params
                .get("base_url")
                .and_then(Value::as_str)
                .map(|s| s.trim_end_matches('/').to_string()),
        }
    }
}

fn check_prompt(prompt: &str) -> Result<(), AdapterError> {
    if prompt.trim().is_empty() {
        Err(AdapterError::EmptyPrompt)
    } else {
        Ok(())
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn map_transport(err: &reqwest::Error, timeout: Duration) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(timeout)
    } else {
        AdapterError::Transport(err.to_string())
    }
}

/// POST a JSON body and decode a JSON reply; non-2xx is an error
pub(crate) async fn post_json(
    client: &Client,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
    timeout: Duration,
) -> Result<Value, AdapterError> {
    let mut request = client.post(url).json(body).timeout(timeout);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| map_transport(&e, timeout))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| map_transport(&e, timeout))?;

    if !status.is_success() {
        return Err(AdapterError::Http {
            status: status.as_u16(),
            body: truncate_chars(&text, ERROR_BODY_LIMIT),
        });
    }

    serde_json::from_str(&text).map_err(|e| {
        AdapterError::InvalidResponse(format!("{e}: {}", truncate_chars(&text, ERROR_BODY_LIMIT)))
    })
}

/// Extract the first choice of a chat-completions reply
pub(crate) fn chat_completion_text(reply: &Value) -> Result<String, AdapterError> {
    let choice = reply
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| AdapterError::InvalidResponse("reply has no choices".to_string()))?;
    Ok(choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

/// Normalize the heterogeneous reply shapes of managed inference endpoints
#[must_use]
pub fn normalize_generated(reply: Value) -> String {
    let generated = |v: &Value| {
        v.get("generated_text")
            .and_then(Value::as_str)
            .map(String::from)
    };

    match reply {
        Value::String(text) => text,
        Value::Array(ref items) => items
            .first()
            .and_then(generated)
            .unwrap_or_else(|| reply.to_string()),
        Value::Object(_) => generated(&reply).unwrap_or_else(|| reply.to_string()),
        other => other.to_string(),
    }
}

/// Extract the `output` or `text` field of a generic HTTP reply
#[must_use]
pub fn extract_output_field(reply: Value) -> String {
    for key in ["output", "text"] {
        match reply.get(key) {
            Some(Value::String(text)) if !text.is_empty() => return text.clone(),
            Some(Value::Null | Value::String(_)) | None => {}
            Some(other) => return other.to_string(),
        }
    }
    match reply {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// Hosted chat-API adapter (single-turn chat completion)
#[derive(Debug, Clone)]
pub struct ChatApiAdapter {
    client: Client,
    model: String,
    credential: Credential,
    params: GenerationParams,
    retry: RetryPolicy,
}

impl ChatApiAdapter {
    /// Create an adapter for `model`
    #[must_use]
    pub fn new(client: Client, model: &str, credential: Credential, params: GenerationParams) -> Self {
        Self {
            client,
            model: model.to_string(),
            credential,
            params,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the backoff schedule
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self) -> String {
        let base = self
            .params
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_CHAT_BASE_URL);
        format!("{base}/chat/completions")
    }

    fn body(&self, prompt: &str) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.params.temperature,
            "max_tokens": self.params.max_tokens,
        });
        if let (Some(seed), Some(map)) = (self.params.seed, body.as_object_mut()) {
            map.insert("seed".to_string(), json!(seed));
        }
        body
    }
}

#[async_trait]
impl InferenceAdapter for ChatApiAdapter {
    fn name(&self) -> &str {
        &self.model
    }

    async fn infer(&self, prompt: &str, timeout: Duration, max_retries: u32) -> InferenceResult {
        if let Err(e) = check_prompt(prompt) {
            return InferenceResult::failed(e);
        }
        let token = match self.credential.require() {
            Ok(token) => token,
            Err(e) => return InferenceResult::failed(e),
        };

        let url = self.url();
        let body = self.body(prompt);
        let (client, url, body) = (&self.client, url.as_str(), &body);

        self.retry
            .with_attempts(max_retries)
            .run(&self.model, move |_| async move {
                let reply = post_json(client, url, Some(token), body, timeout).await?;
                chat_completion_text(&reply)
            })
            .await
            .into()
    }
}

/// Managed-inference adapter (raw prompt + generation parameters)
#[derive(Debug, Clone)]
pub struct ManagedInferenceAdapter {
    client: Client,
    model: String,
    credential: Credential,
    params: GenerationParams,
    retry: RetryPolicy,
}

impl ManagedInferenceAdapter {
    /// Create an adapter for `model`
    #[must_use]
    pub fn new(client: Client, model: &str, credential: Credential, params: GenerationParams) -> Self {
        Self {
            client,
            model: model.to_string(),
            credential,
            params,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the backoff schedule
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self) -> String {
        let base = self
            .params
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_MANAGED_BASE_URL);
        format!("{base}/{}", self.model)
    }

    fn body(&self, prompt: &str) -> Value {
        json!({
            "inputs": prompt,
            "parameters": {
                "temperature": self.params.temperature,
                "max_new_tokens": self.params.max_tokens,
                "return_full_text": false,
            },
            "options": {"wait_for_model": true},
        })
    }
}

#[async_trait]
impl InferenceAdapter for ManagedInferenceAdapter {
    fn name(&self) -> &str {
        &self.model
    }

    async fn infer(&self, prompt: &str, timeout: Duration, max_retries: u32) -> InferenceResult {
        if let Err(e) = check_prompt(prompt) {
            return InferenceResult::failed(e);
        }
        let token = match self.credential.require() {
            Ok(token) => token,
            Err(e) => return InferenceResult::failed(e),
        };

        let url = self.url();
        let body = self.body(prompt);
        let (client, url, body) = (&self.client, url.as_str(), &body);

        self.retry
            .with_attempts(max_retries)
            .run(&self.model, move |_| async move {
                let reply = post_json(client, url, Some(token), body, timeout).await?;
                Ok(normalize_generated(reply))
            })
            .await
            .into()
    }
}

/// Generic HTTP adapter: POSTs `{prompt, ...params}` and reads `output`/`text`
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    client: Client,
    endpoint: String,
    credential: Option<Credential>,
    params: Map<String, Value>,
    retry: RetryPolicy,
}

impl HttpAdapter {
    /// Create an adapter for `endpoint`; `credential` is sent as a bearer token
    #[must_use]
    pub fn new(
        client: Client,
        endpoint: &str,
        credential: Option<Credential>,
        params: &HashMap<String, Value>,
    ) -> Self {
        let mut merged = Map::new();
        merged.insert("temperature".to_string(), json!(0));
        for (key, value) in params {
            merged.insert(key.clone(), value.clone());
        }
        Self {
            client,
            endpoint: endpoint.to_string(),
            credential,
            params: merged,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the backoff schedule
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn body(&self, prompt: &str) -> Value {
        let mut body = Map::new();
        body.insert("prompt".to_string(), json!(prompt));
        for (key, value) in &self.params {
            if key != "prompt" {
                body.insert(key.clone(), value.clone());
            }
        }
        Value::Object(body)
    }
}

#[async_trait]
impl InferenceAdapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn infer(&self, prompt: &str, timeout: Duration, max_retries: u32) -> InferenceResult {
        if let Err(e) = check_prompt(prompt) {
            return InferenceResult::failed(e);
        }
        let token = match self.credential.as_ref().map(Credential::require).transpose() {
            Ok(token) => token,
            Err(e) => return InferenceResult::failed(e),
        };

        let body = self.body(prompt);
        let (client, url, body) = (&self.client, self.endpoint.as_str(), &body);

        self.retry
            .with_attempts(max_retries)
            .run(&self.endpoint, move |_| async move {
                let reply = post_json(client, url, token, body, timeout).await?;
                Ok(extract_output_field(reply))
            })
            .await
            .into()
    }
}

/// Local-process adapter; an extension point that always reports failure
#[derive(Debug, Clone, Default)]
pub struct LocalProcessAdapter {
    target: String,
}

impl LocalProcessAdapter {
    /// Create a placeholder for `target`
    #[must_use]
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
        }
    }
}

#[async_trait]
impl InferenceAdapter for LocalProcessAdapter {
    fn name(&self) -> &str {
        &self.target
    }

    async fn infer(&self, _prompt: &str, _timeout: Duration, _max_retries: u32) -> InferenceResult {
        tokio::task::yield_now().await;
        InferenceResult::failed(AdapterError::NotImplemented("Local process".to_string()))
    }
}

/// Echo adapter: returns the prompt unchanged, no network
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoAdapter;

#[async_trait]
impl InferenceAdapter for EchoAdapter {
    fn name(&self) -> &str {
        "echo"
    }

    async fn infer(&self, prompt: &str, _timeout: Duration, _max_retries: u32) -> InferenceResult {
        tokio::task::yield_now().await;
        match check_prompt(prompt) {
            Ok(()) => InferenceResult::ok(prompt),
            Err(e) => InferenceResult::failed(e),
        }
    }
}

/// The closed set of adapters selected by [`build_adapter`]
#[derive(Debug, Clone)]
pub enum Adapter {
    ChatApi(ChatApiAdapter),
    ManagedInference(ManagedInferenceAdapter),
    Http(HttpAdapter),
    LocalProcess(LocalProcessAdapter),
    Echo(EchoAdapter),
}

#[async_trait]
impl InferenceAdapter for Adapter {
    fn name(&self) -> &str {
        match self {
            Self::ChatApi(a) => a.name(),
            Self::ManagedInference(a) => a.name(),
            Self::Http(a) => a.name(),
            Self::LocalProcess(a) => a.name(),
            Self::Echo(a) => a.name(),
        }
    }

    async fn infer(&self, prompt: &str, timeout: Duration, max_retries: u32) -> InferenceResult {
        match self {
            Self::ChatApi(a) => a.infer(prompt, timeout, max_retries).await,
            Self::ManagedInference(a) => a.infer(prompt, timeout, max_retries).await,
            Self::Http(a) => a.infer(prompt, timeout, max_retries).await,
            Self::LocalProcess(a) => a.infer(prompt, timeout, max_retries).await,
            Self::Echo(a) => a.infer(prompt, timeout, max_retries).await,
        }
    }
}

/// Resolve the credential for a registry entry.
///
/// An explicit `api_key_env` is read from the environment; otherwise the
/// backend's default variable is taken from the run configuration.
#[must_use]
pub fn resolve_credential(
    model: &ModelConfig,
    kind: BackendKind,
    bench: &BenchmarkConfig,
) -> Option<Credential> {
    match (&model.api_key_env, kind.default_credential_env()) {
        (Some(env), _) => Some(Credential::from_env(env.as_str())),
        (None, Some(env)) => Some(Credential::new(
            env,
            bench.credential_for(env).map(String::from),
        )),
        (None, None) => None,
    }
}

/// Build the adapter for a registry entry
///
/// # Errors
///
/// Returns `ConfigError::UnsupportedBackend` for unknown backend kinds.
pub fn build_adapter(model: &ModelConfig, bench: &BenchmarkConfig) -> Result<Adapter, ConfigError> {
    let kind = model.backend_kind()?;
    let client = Client::new();
    let params = GenerationParams::from_map(&model.params);
    let target = model.model_name_or_endpoint.as_str();
    let credential = resolve_credential(model, kind, bench);

    let adapter = match kind {
        BackendKind::ChatApi => Adapter::ChatApi(ChatApiAdapter::new(
            client,
            target,
            credential.unwrap_or_else(|| Credential::new(crate::config::OPENAI_KEY_ENV, None)),
            params,
        )),
        BackendKind::ManagedInference => Adapter::ManagedInference(ManagedInferenceAdapter::new(
            client,
            target,
            credential.unwrap_or_else(|| Credential::new(crate::config::HF_TOKEN_ENV, None)),
            params,
        )),
        BackendKind::Http if target.starts_with(ECHO_ENDPOINT_PREFIX) => Adapter::Echo(EchoAdapter),
        BackendKind::Http => Adapter::Http(HttpAdapter::new(client, target, credential, &model.params)),
        BackendKind::LocalProcess => Adapter::LocalProcess(LocalProcessAdapter::new(target)),
        BackendKind::Mock => Adapter::Echo(EchoAdapter),
    };

    tracing::debug!(model = %model.id, ?kind, adapter = adapter.name(), "adapter built");
    Ok(adapter)
}
