//! Engine facade: wires the catalog, lexicon and components together once at
//! startup and exposes the per-request entry points.

use crate::arbiter::{ConfidenceArbiter, Translation};
use crate::catalog::SchemaCatalog;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::extractor::SlotExtractor;
use crate::lexicon::Lexicon;
use crate::matcher::PatternMatcher;
use crate::model::{ChatCompletionModel, ModelBackend, ModelTranslator, UnavailableModel};
use crate::sql_compiler::SqlCompiler;
use crate::validator::{SqlValidator, ValidationVerdict};
use std::sync::Arc;
use tracing::info;

pub struct Engine {
    arbiter: ConfidenceArbiter,
    config: EngineConfig,
}

impl Engine {
    /// Picks the chat-completion backend when an API key is configured and
    /// runs rule-only otherwise.
    pub fn new(catalog: SchemaCatalog, config: EngineConfig) -> Result<Self> {
        let backend: Arc<dyn ModelBackend> = if config.model_enabled() {
            Arc::new(ChatCompletionModel::new(config.model.clone())?)
        } else {
            info!("No model endpoint configured, running rule-only");
            Arc::new(UnavailableModel)
        };
        Self::with_backend(catalog, config, backend)
    }

    pub fn rule_only(catalog: SchemaCatalog, config: EngineConfig) -> Result<Self> {
        Self::with_backend(catalog, config, Arc::new(UnavailableModel))
    }

    pub fn with_backend(catalog: SchemaCatalog, config: EngineConfig, backend: Arc<dyn ModelBackend>) -> Result<Self> {
        // Re-run catalog checks: callers may have built the struct by hand.
        let catalog = Arc::new(SchemaCatalog::new(catalog.tables)?);
        let lexicon = Arc::new(Lexicon::from_catalog(&catalog));

        let arbiter = ConfidenceArbiter::new(
            catalog.clone(),
            PatternMatcher::with_lexicon(lexicon.clone(), config.min_keyword_overlap),
            SlotExtractor::new(catalog.clone(), lexicon, config.default_limit),
            SqlCompiler::new(catalog.clone()),
            SqlValidator::new(catalog.clone(), config.limits),
            ModelTranslator::new(backend.clone(), config.model.clone()),
        );

        info!(
            "Engine ready: {} tables, model backend '{}', default limit {}",
            catalog.tables.len(),
            backend.name(),
            config.default_limit
        );
        Ok(Self { arbiter, config })
    }

    pub async fn translate(&self, question: &str) -> Translation {
        self.arbiter.translate(question).await
    }

    /// Run the validator alone on externally supplied SQL.
    pub fn validate(&self, sql: &str) -> ValidationVerdict {
        self.arbiter.validator().validate(sql)
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        self.arbiter.catalog()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::Origin;
    use crate::error::EngineError;

    #[tokio::test]
    async fn test_rule_only_engine() {
        let engine = Engine::rule_only(SchemaCatalog::storefront(), EngineConfig::default()).unwrap();
        let t = engine.translate("Which are the most expensive products?").await;
        assert_eq!(t.sql.as_deref(), Some("SELECT * FROM products ORDER BY price DESC LIMIT 10"));
        assert_eq!(t.origin, Origin::Rule);
    }

    #[tokio::test]
    async fn test_default_limit_comes_from_config() {
        let config = EngineConfig {
            default_limit: 3,
            ..EngineConfig::default()
        };
        let engine = Engine::new(SchemaCatalog::storefront(), config).unwrap();
        let t = engine.translate("Show the newest orders").await;
        assert_eq!(t.sql.as_deref(), Some("SELECT * FROM orders ORDER BY order_date DESC LIMIT 3"));
    }

    #[test]
    fn test_invalid_catalog_is_fatal() {
        let err = Engine::new(SchemaCatalog { tables: Vec::new() }, EngineConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_validate_external_sql() {
        let engine = Engine::rule_only(SchemaCatalog::storefront(), EngineConfig::default()).unwrap();
        assert!(engine.validate("SELECT name FROM users").accepted);
        assert!(!engine.validate("SELECT * FROM secrets").accepted);
    }
}
