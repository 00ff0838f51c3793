//! Inference configuration types and validation.
//!
//! The configuration is plain data owned by an external loader and consumed
//! by `initialize`. This module contains pure types with no infrastructure
//! dependencies apart from reading a JSON file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::prompt::PromptFraming;
use crate::sampling::{
    DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P, SamplingParams,
};

/// Environment variable overriding [`InferenceConfig::model_path`].
pub const ENV_MODEL_PATH: &str = "SURVEYCOACH_MODEL_PATH";

/// Environment variable overriding [`InferenceConfig::preferred_backend`].
pub const ENV_BACKEND: &str = "SURVEYCOACH_BACKEND";

// ── Backend ────────────────────────────────────────────────────────

/// Compute backend an engine is constructed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Accelerated backend (GPU offload).
    #[default]
    Gpu,

    /// Portable CPU backend. Always available.
    Cpu,
}

impl Backend {
    /// Lowercase label as used in configuration files.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(Self::Gpu),
            "cpu" => Ok(Self::Cpu),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

/// Errors from loading or validating an [`InferenceConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Model path cannot be empty")]
    EmptyModelPath,

    #[error("Max tokens must be greater than zero")]
    ZeroMaxTokens,

    #[error("Unknown backend label: {0}")]
    UnknownBackend(String),
}

// ── Config ─────────────────────────────────────────────────────────

/// Configuration consumed by the session manager's `initialize`.
///
/// All fields have defaults so partial files load; sampling values are
/// sanitized later, when a session is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InferenceConfig {
    /// Path to the model weights.
    pub model_path: PathBuf,

    /// Maximum tokens generated per response.
    pub max_tokens: u32,

    /// Top-K sampling limit.
    pub top_k: i32,

    /// Nucleus sampling threshold.
    pub top_p: f32,

    /// Sampling temperature.
    pub temperature: f32,

    /// Preferred backend label (`"gpu"` or `"cpu"`).
    pub preferred_backend: String,

    /// Backend retried once when the preferred one fails to construct.
    pub fallback_backend: Backend,

    /// Prompt framing strings.
    pub framing: PromptFraming,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            temperature: DEFAULT_TEMPERATURE,
            preferred_backend: Backend::Gpu.label().to_string(),
            fallback_backend: Backend::Cpu,
            framing: PromptFraming::default(),
        }
    }
}

impl InferenceConfig {
    /// Create a config for a model path with default parameters.
    pub fn for_model(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    /// Parse a config from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Apply `SURVEYCOACH_*` environment overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(ENV_MODEL_PATH).filter(|p| !p.trim().is_empty()) {
            self.model_path = PathBuf::from(path);
        }
        if let Some(label) = lookup(ENV_BACKEND).filter(|l| !l.trim().is_empty()) {
            self.preferred_backend = label;
        }
    }

    /// Resolve the preferred backend label.
    ///
    /// Unknown labels resolve to [`Backend::Gpu`] so the configured fallback
    /// still gets its chance.
    pub fn preferred_backend(&self) -> Backend {
        self.preferred_backend.parse().unwrap_or_else(|_| {
            tracing::warn!(
                label = %self.preferred_backend,
                "Unknown backend label, using gpu"
            );
            Backend::Gpu
        })
    }

    /// Sampling parameters exactly as configured (not yet sanitized).
    pub const fn sampling(&self) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_tokens,
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
        }
    }
}

/// Validate hard requirements of a configuration.
///
/// Out-of-range sampling values are not errors; they are sanitized when a
/// session is built.
pub fn validate_config(config: &InferenceConfig) -> Result<(), ConfigError> {
    if config.model_path.as_os_str().is_empty() {
        return Err(ConfigError::EmptyModelPath);
    }

    if config.max_tokens == 0 {
        return Err(ConfigError::ZeroMaxTokens);
    }

    Ok(())
}
