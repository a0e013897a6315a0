//! Configuration module for the model registry and run settings.
//!
//! The registry (YAML or JSON) lists candidate backends; run settings come
//! from the process environment and may be overridden on the command line.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default credential variable for the hosted chat API
pub const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";
/// Default credential variable for the managed inference API
pub const HF_TOKEN_ENV: &str = "HF_API_TOKEN";

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON configuration: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Unsupported backend kind: {0}")]
    UnsupportedBackend(String),

    #[error("Invalid judge backend: {0}")]
    InvalidJudgeBackend(String),

    #[error("Model registry is empty: {0}")]
    EmptyRegistry(String),

    #[error("Invalid model id '{0}': ids name output files and must not be empty or contain path separators or '..'")]
    InvalidModelId(String),

    #[error("Duplicate model id: {0}")]
    DuplicateModelId(String),
}

/// Environment variable holding the BERTScore checkpoint directory
pub const BERTSCORE_MODEL_ENV: &str = "BENCH_BERTSCORE_MODEL";

/// Category of model-serving mechanism
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hosted chat-completions API
    ChatApi,
    /// Managed inference endpoint (raw prompt + generation parameters)
    ManagedInference,
    /// Generic JSON-over-HTTP endpoint
    Http,
    /// Local process (extension point)
    LocalProcess,
    /// Echo adapter for network-free runs
    Mock,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    /// Parse backend kind from registry string
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnsupportedBackend` for unknown kinds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "chat" | "chat_api" => Ok(Self::ChatApi),
            "hf" | "managed" | "managed_inference" => Ok(Self::ManagedInference),
            "http" => Ok(Self::Http),
            "gguf" | "local" | "local_process" => Ok(Self::LocalProcess),
            "mock" | "echo" => Ok(Self::Mock),
            _ => Err(ConfigError::UnsupportedBackend(s.to_string())),
        }
    }
}

impl BackendKind {
    /// Credential variable used when the registry entry names none
    #[must_use]
    pub const fn default_credential_env(self) -> Option<&'static str> {
        match self {
            Self::ChatApi => Some(OPENAI_KEY_ENV),
            Self::ManagedInference => Some(HF_TOKEN_ENV),
            Self::Http | Self::LocalProcess | Self::Mock => None,
        }
    }
}

/// One candidate backend from the model registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Unique identifier, also used for output file names
    pub id: String,
    /// Display name (defaults to the id)
    #[serde(default)]
    pub name: String,
    /// Backend kind as written in the registry; validated per run
    pub backend: String,
    /// Model name or endpoint URL
    #[serde(alias = "target")]
    pub model_name_or_endpoint: String,
    /// Environment variable holding the credential
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Backend-specific parameters
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    /// Free-form notes
    #[serde(default)]
    pub notes: String,
}

impl ModelConfig {
    /// Resolve the registry backend string
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnsupportedBackend` when the kind is unknown.
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        self.backend.parse()
    }

    /// Name shown in reports
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Check that a model id can serve as a file stem inside the output directory
///
/// # Errors
///
/// Returns `ConfigError::InvalidModelId` for blank ids and for ids holding a
/// slash, a backslash or `..`.
pub fn validate_model_id(id: &str) -> Result<(), ConfigError> {
    if id.trim().is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(ConfigError::InvalidModelId(id.to_string()));
    }
    Ok(())
}

/// Load the model registry from a YAML or JSON file
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, lists no models,
/// or has an invalid or repeated model id.
pub fn load_models_config<P: AsRef<Path>>(path: P) -> Result<Vec<ModelConfig>, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let mut models: Vec<ModelConfig> = if is_json {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };

    if models.is_empty() {
        return Err(ConfigError::EmptyRegistry(path.display().to_string()));
    }

    let mut seen = HashSet::new();
    for model in &models {
        validate_model_id(&model.id)?;
        if !seen.insert(model.id.as_str()) {
            return Err(ConfigError::DuplicateModelId(model.id.clone()));
        }
    }

    for model in &mut models {
        if model.name.is_empty() {
            model.name.clone_from(&model.id);
        }
    }

    Ok(models)
}

/// Backend used by the judge grader
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JudgeBackendKind {
    /// Hosted chat API grader
    Openai,
    /// Managed inference grader
    Hf,
    /// Deterministic offline grader
    Mock,
}

impl std::str::FromStr for JudgeBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "chat" => Ok(Self::Openai),
            "hf" | "managed" => Ok(Self::Hf),
            "mock" => Ok(Self::Mock),
            _ => Err(ConfigError::InvalidJudgeBackend(s.to_string())),
        }
    }
}

/// Run-wide settings, immutable for the duration of a run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkConfig {
    /// Value of `OPENAI_API_KEY`
    pub openai_api_key: Option<String>,
    /// Value of `HF_API_TOKEN`
    pub hf_api_token: Option<String>,
    /// Per-call timeout in seconds
    pub timeout_seconds: u64,
    /// Attempts per adapter/grader call (at least 1)
    pub max_retries: u32,
    /// In-flight example pipelines per model
    pub concurrency: usize,
    /// Whether the judge model grades outputs
    pub do_llm_eval: bool,
    /// Judge model identifier
    pub eval_model: String,
    /// Judge backend
    pub eval_backend: JudgeBackendKind,
    /// BERT checkpoint directory for BERTScore
    pub embedding_model: Option<PathBuf>,
}

const fn default_timeout_seconds() -> u64 {
    60
}
const fn default_max_retries() -> u32 {
    3
}
const fn default_concurrency() -> usize {
    4
}
fn default_eval_model() -> String {
    "Qwen/Qwen2-7B-Instruct".to_string()
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            hf_api_token: None,
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            concurrency: default_concurrency(),
            do_llm_eval: true,
            eval_model: default_eval_model(),
            eval_backend: JudgeBackendKind::Hf,
            embedding_model: None,
        }
    }
}

impl BenchmarkConfig {
    /// Load settings from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let eval_backend = match non_empty("BENCH_EVAL_BACKEND") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to hf judge backend");
                JudgeBackendKind::Hf
            }),
            None => JudgeBackendKind::Hf,
        };

        Self {
            openai_api_key: non_empty(OPENAI_KEY_ENV),
            hf_api_token: non_empty(HF_TOKEN_ENV),
            timeout_seconds: parse_or(&lookup, "BENCH_TIMEOUT", default_timeout_seconds()).max(1),
            max_retries: parse_or(&lookup, "BENCH_MAX_RETRIES", default_max_retries()).max(1),
            concurrency: parse_or(&lookup, "BENCH_CONCURRENCY", default_concurrency()).max(1),
            do_llm_eval: lookup("BENCH_DO_LLM_EVAL")
                .map_or(true, |v| v.trim().eq_ignore_ascii_case("true")),
            eval_model: non_empty("BENCH_EVAL_MODEL").unwrap_or_else(default_eval_model),
            eval_backend,
            embedding_model: non_empty(BERTSCORE_MODEL_ENV).map(PathBuf::from),
        }
    }

    /// Credential value held for a default variable name
    #[must_use]
    pub fn credential_for(&self, env: &str) -> Option<&str> {
        match env {
            OPENAI_KEY_ENV => self.openai_api_key.as_deref(),
            HF_TOKEN_ENV => self.hf_api_token.as_deref(),
            _ => None,
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = %default, "invalid numeric setting");
            default
        }),
        None => default,
    }
}
