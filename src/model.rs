//! Model Translator
//!
//! Fallback path: asks a generative model for SQL given the schema prompt and
//! the question. The model is a capability behind [`ModelBackend`]; without a
//! configured endpoint the engine runs with [`UnavailableModel`].

use crate::arbiter::{CandidateQuery, Origin};
use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const MODEL_CONFIDENCE: f64 = 0.7;

lazy_static! {
    static ref FENCE: Regex = Regex::new(r"(?s)```(?:sql|sqlite)?\s*(.*?)```").unwrap();
    static ref STATEMENT_START: Regex = Regex::new(r"(?i)\b(?:select|with)\b").unwrap();
}

const SYSTEM_PROMPT: &str = "You translate questions into a single SQLite SELECT statement. \
Use only the tables and columns listed in the schema. Return only the SQL, no commentary.";

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Backend used when no inference endpoint is configured.
pub struct UnavailableModel;

#[async_trait]
impl ModelBackend for UnavailableModel {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(EngineError::ModelUnavailable("no model endpoint configured".to_string()))
    }
}

/// OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionModel {
    client: reqwest::Client,
    config: ModelConfig,
    api_key: String,
}

impl ChatCompletionModel {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| EngineError::Configuration("OPENAI_API_KEY is not set".to_string()))?;
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config, api_key })
    }
}

#[async_trait]
impl ModelBackend for ChatCompletionModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::ModelUnavailable(format!("{} returned {}: {}", self.config.base_url, status, text)));
        }

        let response_json: serde_json::Value = response.json().await?;
        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EngineError::ModelUnavailable("No content in model response".to_string()))?;

        Ok(content.to_string())
    }
}

pub struct ModelTranslator {
    backend: Arc<dyn ModelBackend>,
    config: ModelConfig,
}

impl ModelTranslator {
    pub fn new(backend: Arc<dyn ModelBackend>, config: ModelConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Never fails: any backend error or a timeout yields an empty
    /// zero-confidence candidate.
    pub async fn translate(&self, question: &str, schema_prompt: &str) -> CandidateQuery {
        let prompt = build_prompt(question, schema_prompt);
        let outcome = tokio::time::timeout(self.config.timeout, self.backend.generate(&prompt)).await;

        let completion = match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("Model backend '{}' failed: {}", self.backend.name(), e);
                return placeholder(format!("The language model could not be used: {}.", e));
            }
            Err(_) => {
                warn!(
                    "Model backend '{}' timed out after {:?}",
                    self.backend.name(),
                    self.config.timeout
                );
                return placeholder("The language model did not answer in time.".to_string());
            }
        };

        let sql = extract_sql(&completion);
        debug!("Model '{}' proposed: {}", self.backend.name(), sql);
        if sql.is_empty() {
            return placeholder("The language model returned no SQL.".to_string());
        }

        let mut params = BTreeMap::new();
        params.insert("model".to_string(), serde_json::json!(self.backend.name()));
        CandidateQuery {
            sql,
            params,
            confidence: MODEL_CONFIDENCE,
            origin: Origin::Model,
            explanation: crate::explain::MODEL_CAVEAT.to_string(),
            intent: None,
        }
    }
}

fn placeholder(explanation: String) -> CandidateQuery {
    CandidateQuery {
        sql: String::new(),
        params: BTreeMap::new(),
        confidence: 0.0,
        origin: Origin::Model,
        explanation,
        intent: None,
    }
}

pub fn build_prompt(question: &str, schema_prompt: &str) -> String {
    format!("{}\nQuestion: {}\nSQL:", schema_prompt, question.trim())
}

/// Pull the statement out of a completion: fenced block if present, then
/// everything from the first SELECT/WITH, without a trailing semicolon.
pub fn extract_sql(completion: &str) -> String {
    let text = FENCE
        .captures(completion)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(completion);
    let text = match STATEMENT_START.find(text) {
        Some(m) => &text[m.start()..],
        None => text,
    };
    let text = text.trim();
    text.strip_suffix(';').unwrap_or(text).trim().to_string()
}
