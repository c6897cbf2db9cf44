//! Configuration loading.
//!
//! The gate is configured from a single YAML file; API keys may instead
//! arrive through the environment (`ANTHROPIC_API_KEY`,
//! `OPENAI_API_KEY`) so credentials stay out of checked-in config. The
//! result is validated before anything else starts — a bad ceiling
//! fraction is fatal at startup, never discovered mid-call.

use std::path::Path;

use tokengate_core::{GateConfig, GateError, Provider, Result};
use tracing::info;

const ANTHROPIC_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";

/// Load, override, and validate gate configuration from a YAML file.
///
/// # Errors
///
/// Returns [`GateError::Config`] if the file cannot be read or parsed,
/// or if validation fails.
pub fn load_config(path: &Path) -> Result<GateConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        GateError::Config(format!("Failed to read {}: {e}", path.display()))
    })?;
    let config = parse_config(&raw)?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Parse and validate configuration from a YAML string.
///
/// # Errors
///
/// Returns [`GateError::Config`] on parse or validation failure.
pub fn parse_config(raw: &str) -> Result<GateConfig> {
    let mut config: GateConfig = serde_yaml::from_str(raw)
        .map_err(|e| GateError::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut GateConfig) {
    for (env_var, provider) in [
        (ANTHROPIC_KEY_ENV, Provider::Anthropic),
        (OPENAI_KEY_ENV, Provider::OpenAI),
    ] {
        if let Ok(key) = std::env::var(env_var) {
            if !key.is_empty() {
                match provider {
                    Provider::Anthropic => config.anthropic.api_key = Some(key),
                    Provider::OpenAI => config.openai.api_key = Some(key),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
