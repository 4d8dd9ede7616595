// Copyright 2026 The Towline Project
// SPDX-License-Identifier: Apache-2.0

// Config loader and validator.
//
// Loads towline.yaml, resolves `${VAR}` interpolation from the
// environment, applies defaults, and validates the result.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// All errors that can occur during config loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config source: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("undefined variable ${{{name}}} in config (not set in environment)")]
    UndefinedVariable { name: String },
}

// ---------------------------------------------------------------------------
// ConfigSource trait
// ---------------------------------------------------------------------------

/// Abstraction over where config YAML comes from.
///
/// `FileSource` reads from disk; `StringSource` provides content
/// directly (used in tests to avoid file I/O).
pub trait ConfigSource {
    fn load(&self) -> Result<String, ConfigError>;
}

/// Loads config from a file on disk.
pub struct FileSource {
    pub path: PathBuf,
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<String, ConfigError> {
        Ok(std::fs::read_to_string(&self.path)?)
    }
}

/// Provides config content directly as a string. Used for testing.
pub struct StringSource {
    pub content: String,
}

impl ConfigSource for StringSource {
    fn load(&self) -> Result<String, ConfigError> {
        Ok(self.content.clone())
    }
}

// ---------------------------------------------------------------------------
// Typed config
// ---------------------------------------------------------------------------

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_TEMPERATURE: f64 = 1.0;

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TCP listener binds.
    pub listen: SocketAddr,
    /// Completion endpoint the relay posts to.
    pub api_url: String,
    /// Bearer token sent with every completion call.
    pub api_key: String,
    /// Model name sent in every request body.
    pub model: String,
    /// Sampling temperature sent in every request body.
    pub temperature: f64,
}

/// Raw deserialization shape of towline.yaml.
#[derive(Debug, Deserialize)]
struct RawConfig {
    listen: Option<String>,
    api_url: String,
    api_key: String,
    model: String,
    temperature: Option<f64>,
}

// ---------------------------------------------------------------------------
// Variable interpolation
// ---------------------------------------------------------------------------

/// Resolves `${VAR_NAME}` references in a string from environment variables.
/// Returns `ConfigError::UndefinedVariable` if a referenced variable is not set.
fn resolve_variables(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            let mut found_close = false;
            for c in chars.by_ref() {
                if c == '}' {
                    found_close = true;
                    break;
                }
                var_name.push(c);
            }
            if !found_close || var_name.is_empty() {
                // Malformed interpolation -- treat literally
                result.push('$');
                result.push('{');
                result.push_str(&var_name);
                continue;
            }
            let value = std::env::var(&var_name).map_err(|_| ConfigError::UndefinedVariable {
                name: var_name.clone(),
            })?;
            result.push_str(&value);
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

// ---------------------------------------------------------------------------
// Config loading and validation
// ---------------------------------------------------------------------------

/// Load and validate a towline config from the given source.
///
/// Steps:
/// 1. Read raw YAML from the source
/// 2. Parse into the raw deserialization shape
/// 3. Resolve variable interpolation in string fields
/// 4. Apply defaults (listen, temperature)
/// 5. Validate field values
pub fn load_config(source: &dyn ConfigSource) -> Result<Config, ConfigError> {
    let raw_yaml = source.load()?;
    let raw: RawConfig = serde_yaml::from_str(&raw_yaml)?;

    let api_url = resolve_variables(&raw.api_url)?;
    let api_key = resolve_variables(&raw.api_key)?;
    let model = resolve_variables(&raw.model)?;
    let listen_raw = match &raw.listen {
        Some(l) => resolve_variables(l)?,
        None => DEFAULT_LISTEN.to_string(),
    };

    if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
        return Err(ConfigError::Validation(format!(
            "\"api_url\" must be an http(s) URL, got \"{api_url}\""
        )));
    }
    if api_key.is_empty() {
        return Err(ConfigError::Validation(
            "\"api_key\" must not be empty".to_string(),
        ));
    }
    if model.is_empty() {
        return Err(ConfigError::Validation(
            "\"model\" must not be empty".to_string(),
        ));
    }

    let listen: SocketAddr = listen_raw.parse().map_err(|_| {
        ConfigError::Validation(format!(
            "\"listen\" must be a socket address like {DEFAULT_LISTEN}, got \"{listen_raw}\""
        ))
    })?;

    let temperature = raw.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ConfigError::Validation(format!(
            "\"temperature\" must be within 0.0..=2.0, got {temperature}"
        )));
    }

    Ok(Config {
        listen,
        api_url,
        api_key,
        model,
        temperature,
    })
}
