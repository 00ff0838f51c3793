//! Command handlers.

pub mod ask;
pub mod check_config;

use std::path::Path;

use anyhow::{Context, Result};
use surveycoach_core::{InferenceConfig, validate_config};

/// Load a config file, apply `SURVEYCOACH_*` overrides and validate it.
pub fn load_config(path: &Path) -> Result<InferenceConfig> {
    let mut config = InferenceConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env_overrides();
    validate_config(&config).context("Invalid config")?;
    Ok(config)
}
