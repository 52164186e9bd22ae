//! Engine configuration.
//!
//! Everything tunable lives in an explicit struct handed to the components at
//! construction. `EngineConfig::from_env` fills it from the process
//! environment (the binary loads `.env` first).

use crate::error::{EngineError, Result};
use crate::validator::ValidatorLimits;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LIMIT: u32 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ModelConfig {
    /// Rule-only mode when absent.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            max_tokens: 512,
            temperature: 0.3,
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Row limit for superlative questions that name no number.
    pub default_limit: u32,
    /// Catalog terms a question must share with the lexicon before any
    /// template is tried.
    pub min_keyword_overlap: usize,
    pub limits: ValidatorLimits,
    pub model: ModelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            min_keyword_overlap: 1,
            limits: ValidatorLimits::default(),
            model: ModelConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        config.model.api_key = get("OPENAI_API_KEY");
        if let Some(url) = get("OPENAI_BASE_URL") {
            config.model.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("OPENAI_MODEL").or_else(|| get("MODEL_NAME")) {
            config.model.model = model;
        }
        if let Some(v) = get("MAX_TOKENS") {
            config.model.max_tokens = parse("MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("TEMPERATURE") {
            let temperature: f32 = parse("TEMPERATURE", &v)?;
            if !(0.0..=2.0).contains(&temperature) {
                return Err(EngineError::Configuration(format!(
                    "TEMPERATURE must be between 0 and 2, got {}",
                    temperature
                )));
            }
            config.model.temperature = temperature;
        }
        if let Some(v) = get("MODEL_TIMEOUT_SECS") {
            config.model.timeout = Duration::from_secs(parse("MODEL_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("NL2SQL_DEFAULT_LIMIT") {
            config.default_limit = parse("NL2SQL_DEFAULT_LIMIT", &v)?;
            if config.default_limit == 0 {
                return Err(EngineError::Configuration("NL2SQL_DEFAULT_LIMIT must be positive".to_string()));
            }
        }

        Ok(config)
    }

    pub fn model_enabled(&self) -> bool {
        self.model.api_key.is_some()
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| EngineError::Configuration(format!("Invalid {} '{}': {}", key, value, e)))
}
