use crate::intent::SlotRole;
use crate::validator::RejectionKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Extraction error: template '{template}' needs a {missing} slot")]
    Extraction {
        template: &'static str,
        missing: SlotRole,
    },

    #[error("Validation rejected ({kind}): {detail}")]
    Validation {
        kind: RejectionKind,
        detail: String,
    },

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// Per-request errors are turned into a refusal by the arbiter; only
    /// configuration problems are fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
