//! Layered configuration: built-in defaults, then an optional TOML file,
//! then `RESIDUE_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::gateway::openrouter::DEFAULT_BASE_URL;
use crate::inspiration::InspirationMode;
use crate::orchestrator::GeneratorConfig;

/// Hard ceiling on `max_retries`; each attempt costs three model calls.
pub const MAX_RETRIES_CEILING: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResidueConfig {
    /// Base URL of the OpenAI-compatible chat endpoint.
    pub model_endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    /// Model for the research call; defaults to `model`.
    pub research_model: Option<String>,
    pub max_retries: u32,
    pub quality_threshold: f64,
    pub layer: String,
    pub locale: String,
    pub store_path: PathBuf,
    pub request_timeout_secs: u64,
    pub daily_budget_usd: Option<f64>,
    pub inspiration_mode: InspirationMode,
    pub require_known_node: bool,
    pub listen_addr: String,
    pub referer: Option<String>,
    pub app_title: Option<String>,
}

impl Default for ResidueConfig {
    fn default() -> Self {
        let generator = GeneratorConfig::default();
        Self {
            model_endpoint: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: generator.model,
            research_model: None,
            max_retries: generator.max_retries,
            quality_threshold: generator.quality_threshold,
            layer: generator.layer,
            locale: generator.locale,
            store_path: PathBuf::from(".residue_events.sqlite"),
            request_timeout_secs: 120,
            daily_budget_usd: None,
            inspiration_mode: InspirationMode::default(),
            require_known_node: false,
            listen_addr: "127.0.0.1:8787".to_string(),
            referer: None,
            app_title: Some("Residue".to_string()),
        }
    }
}

impl ResidueConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Overlay environment values read through `get`.
    pub fn apply_env<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| get(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RESIDUE_MODEL_ENDPOINT").or_else(|| get("OPENROUTER_BASE_URL")) {
            self.model_endpoint = v;
        }
        if let Some(v) = get("RESIDUE_API_KEY").or_else(|| get("OPENROUTER_API_KEY")) {
            self.api_key = Some(v);
        }
        if let Some(v) = get("RESIDUE_MODEL") {
            self.model = v;
        }
        if let Some(v) = get("RESIDUE_RESEARCH_MODEL") {
            self.research_model = Some(v);
        }
        if let Some(v) = get("RESIDUE_MAX_RETRIES") {
            self.max_retries = parse_env("RESIDUE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RESIDUE_QUALITY_THRESHOLD") {
            self.quality_threshold = parse_env("RESIDUE_QUALITY_THRESHOLD", &v)?;
        }
        if let Some(v) = get("RESIDUE_LOCALE") {
            self.locale = v;
        }
        if let Some(v) = get("RESIDUE_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = get("RESIDUE_TIMEOUT_SECONDS") {
            self.request_timeout_secs = parse_env("RESIDUE_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("RESIDUE_DAILY_BUDGET_USD") {
            self.daily_budget_usd = Some(parse_env("RESIDUE_DAILY_BUDGET_USD", &v)?);
        }
        if let Some(v) = get("RESIDUE_INSPIRATION_MODE") {
            self.inspiration_mode = parse_env("RESIDUE_INSPIRATION_MODE", &v)?;
        }
        if let Some(v) = get("RESIDUE_REQUIRE_KNOWN_NODE") {
            self.require_known_node = parse_bool("RESIDUE_REQUIRE_KNOWN_NODE", &v)?;
        }
        if let Some(v) = get("RESIDUE_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(ConfigError::Invalid(format!(
                "quality_threshold must be within [0, 1], got {}",
                self.quality_threshold
            )));
        }
        if self.max_retries > MAX_RETRIES_CEILING {
            return Err(ConfigError::Invalid(format!(
                "max_retries must be at most {MAX_RETRIES_CEILING}, got {}",
                self.max_retries
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".to_string()));
        }
        if self.layer.trim().is_empty() {
            return Err(ConfigError::Invalid("layer must not be empty".to_string()));
        }
        if let Some(budget) = self.daily_budget_usd {
            if !budget.is_finite() || budget < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "daily_budget_usd must be a non-negative number, got {budget}"
                )));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn research_model(&self) -> &str {
        self.research_model.as_deref().unwrap_or(&self.model)
    }

    pub fn generator(&self) -> GeneratorConfig {
        GeneratorConfig {
            model: self.model.clone(),
            max_retries: self.max_retries,
            quality_threshold: self.quality_threshold,
            layer: self.layer.clone(),
            locale: self.locale.clone(),
        }
    }
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
