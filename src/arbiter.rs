//! Confidence Arbiter
//!
//! Orchestrates one translation as a small state machine:
//!
//! ```text
//! Start -> RuleMatched | RuleMissed -> ModelAttempted -> Validated -> Answered | Refused
//! ```
//!
//! The rule path is tried first. A missed template, a missing slot, a
//! validator rejection or a low confidence escalates to the model exactly
//! once; a candidate that still fails after the model path is refused.

use crate::catalog::SchemaCatalog;
use crate::explain;
use crate::extractor::SlotExtractor;
use crate::intent::QueryIntent;
use crate::matcher::PatternMatcher;
use crate::model::ModelTranslator;
use crate::sql_compiler::SqlCompiler;
use crate::validator::{Rejection, SqlValidator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Minimum confidence for a validated candidate to be returned.
pub const ACCEPT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Origin {
    Rule,
    Model,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArbiterState {
    Start,
    RuleMatched,
    RuleMissed,
    ModelAttempted,
    Validated,
    Answered,
    Refused,
}

/// A SQL proposal from either path, before the validator has seen it.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateQuery {
    pub sql: String,
    pub params: BTreeMap<String, serde_json::Value>,
    pub confidence: f64,
    pub origin: Origin,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<QueryIntent>,
}

/// What the caller gets back. `sql` is `None` whenever the request was refused.
#[derive(Debug, Clone, Serialize)]
pub struct Translation {
    pub request_id: Uuid,
    pub sql: Option<String>,
    pub confidence: f64,
    pub explanation: String,
    pub origin: Origin,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<QueryIntent>,
    pub states: Vec<ArbiterState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl Translation {
    pub fn is_answered(&self) -> bool {
        self.states.last() == Some(&ArbiterState::Answered)
    }
}

pub struct ConfidenceArbiter {
    catalog: Arc<SchemaCatalog>,
    matcher: PatternMatcher,
    extractor: SlotExtractor,
    compiler: SqlCompiler,
    validator: SqlValidator,
    model: ModelTranslator,
    schema_prompt: String,
}

impl ConfidenceArbiter {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        matcher: PatternMatcher,
        extractor: SlotExtractor,
        compiler: SqlCompiler,
        validator: SqlValidator,
        model: ModelTranslator,
    ) -> Self {
        let schema_prompt = catalog.schema_prompt();
        Self {
            catalog,
            matcher,
            extractor,
            compiler,
            validator,
            model,
            schema_prompt,
        }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn validator(&self) -> &SqlValidator {
        &self.validator
    }

    pub async fn translate(&self, question: &str) -> Translation {
        let request_id = Uuid::new_v4();
        let mut run = Run {
            request_id,
            states: vec![ArbiterState::Start],
        };

        let mut candidate = None;
        let mut intent = None;
        match self.matcher.match_question(question) {
            Some(template) => {
                run.enter(ArbiterState::RuleMatched);
                match self
                    .extractor
                    .extract(question, &template)
                    .and_then(|extraction| self.compiler.compile(&template, &extraction))
                {
                    Ok(rule) => {
                        intent = rule.intent.clone();
                        candidate = Some(rule);
                    }
                    Err(e) => debug!("[{}] Rule path gave up: {}", request_id, e),
                }
            }
            None => run.enter(ArbiterState::RuleMissed),
        }

        let mut model_tried = false;
        let mut candidate = match candidate {
            Some(c) => c,
            None => {
                model_tried = true;
                self.attempt_model(&mut run, question).await
            }
        };

        // At most two passes: the rule candidate, then one model candidate.
        loop {
            run.enter(ArbiterState::Validated);
            let verdict = self.validator.validate(&candidate.sql);
            if verdict.accepted && candidate.confidence >= ACCEPT_THRESHOLD {
                run.enter(ArbiterState::Answered);
                info!(
                    "[{}] Answered via {:?} (confidence {:.2}): {}",
                    request_id, candidate.origin, candidate.confidence, candidate.sql
                );
                return Translation {
                    request_id,
                    sql: Some(candidate.sql),
                    confidence: candidate.confidence,
                    explanation: candidate.explanation,
                    origin: candidate.origin,
                    params: candidate.params,
                    intent: candidate.intent,
                    states: run.states,
                    rejection: None,
                };
            }

            if let Some(rejection) = &verdict.reason {
                if !candidate.sql.is_empty() {
                    warn!(
                        "[{}] {:?} candidate rejected ({}): {}",
                        request_id, candidate.origin, rejection.kind, rejection.detail
                    );
                }
            }

            if model_tried {
                run.enter(ArbiterState::Refused);
                let rejection = if candidate.sql.is_empty() { None } else { verdict.reason };
                let mut explanation = explain::refusal(rejection.as_ref());
                if candidate.sql.is_empty() && candidate.origin == Origin::Model {
                    explanation = format!("{} {}", explanation, candidate.explanation);
                }
                info!("[{}] Refused", request_id);
                return Translation {
                    request_id,
                    sql: None,
                    confidence: 0.0,
                    explanation,
                    origin: Origin::None,
                    params: BTreeMap::new(),
                    intent,
                    states: run.states,
                    rejection,
                };
            }

            model_tried = true;
            candidate = self.attempt_model(&mut run, question).await;
        }
    }

    async fn attempt_model(&self, run: &mut Run, question: &str) -> CandidateQuery {
        run.enter(ArbiterState::ModelAttempted);
        self.model.translate(question, &self.schema_prompt).await
    }
}

struct Run {
    request_id: Uuid,
    states: Vec<ArbiterState>,
}

impl Run {
    fn enter(&mut self, state: ArbiterState) {
        debug!("[{}] -> {:?}", self.request_id, state);
        self.states.push(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::lexicon::Lexicon;
    use crate::model::{ModelBackend, UnavailableModel};
    use crate::config::ModelConfig;
    use crate::validator::{RejectionKind, ValidatorLimits};
    use async_trait::async_trait;

    struct Scripted(&'static str);

    #[async_trait]
    impl ModelBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn arbiter(backend: Arc<dyn ModelBackend>) -> ConfidenceArbiter {
        arbiter_with_limits(backend, ValidatorLimits::default())
    }

    fn arbiter_with_limits(backend: Arc<dyn ModelBackend>, limits: ValidatorLimits) -> ConfidenceArbiter {
        let catalog = Arc::new(SchemaCatalog::storefront());
        let lexicon = Arc::new(Lexicon::from_catalog(&catalog));
        ConfidenceArbiter::new(
            catalog.clone(),
            PatternMatcher::with_lexicon(lexicon.clone(), 1),
            SlotExtractor::new(catalog.clone(), lexicon, 10),
            SqlCompiler::new(catalog.clone()),
            SqlValidator::new(catalog, limits),
            ModelTranslator::new(backend, ModelConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_rule_path_answers() {
        let t = arbiter(Arc::new(UnavailableModel)).translate("How many users do we have?").await;
        assert_eq!(t.sql.as_deref(), Some("SELECT COUNT(*) FROM users"));
        assert_eq!(t.origin, Origin::Rule);
        assert_eq!(t.confidence, 1.0);
        assert_eq!(
            t.states,
            vec![ArbiterState::Start, ArbiterState::RuleMatched, ArbiterState::Validated, ArbiterState::Answered]
        );
    }

    #[tokio::test]
    async fn test_missed_rule_uses_model() {
        let t = arbiter(Arc::new(Scripted("SELECT name, email FROM users")))
            .translate("purple elephant sings")
            .await;
        assert_eq!(t.origin, Origin::Model);
        assert_eq!(t.sql.as_deref(), Some("SELECT name, email FROM users"));
        assert_eq!(
            t.states,
            vec![
                ArbiterState::Start,
                ArbiterState::RuleMissed,
                ArbiterState::ModelAttempted,
                ArbiterState::Validated,
                ArbiterState::Answered
            ]
        );
    }

    #[tokio::test]
    async fn test_extraction_failure_escalates_once() {
        let t = arbiter(Arc::new(Scripted("SELECT * FROM customers_archive")))
            .translate("Which users are the most active?")
            .await;
        assert_eq!(t.sql, None);
        assert_eq!(t.origin, Origin::None);
        assert_eq!(t.rejection.map(|r| r.kind), Some(RejectionKind::UnknownTable));
        let attempts = t.states.iter().filter(|s| **s == ArbiterState::ModelAttempted).count();
        assert_eq!(attempts, 1);
        assert_eq!(t.states.last(), Some(&ArbiterState::Refused));
    }

    #[tokio::test]
    async fn test_model_answer_after_rejected_rule_has_no_rule_intent() {
        let limits = ValidatorLimits {
            max_joins: 0,
            ..ValidatorLimits::default()
        };
        let t = arbiter_with_limits(Arc::new(Scripted("SELECT COUNT(*) FROM orders")), limits)
            .translate("How many orders contain Electronics products?")
            .await;
        assert_eq!(t.origin, Origin::Model);
        assert_eq!(t.sql.as_deref(), Some("SELECT COUNT(*) FROM orders"));
        assert_eq!(t.intent, None);
        assert_eq!(
            t.states,
            vec![
                ArbiterState::Start,
                ArbiterState::RuleMatched,
                ArbiterState::Validated,
                ArbiterState::ModelAttempted,
                ArbiterState::Validated,
                ArbiterState::Answered
            ]
        );
    }

    #[tokio::test]
    async fn test_nonsense_without_model_is_refused() {
        let t = arbiter(Arc::new(UnavailableModel)).translate("purple elephant sings").await;
        assert_eq!(t.sql, None);
        assert_eq!(t.confidence, 0.0);
        assert!(!t.explanation.is_empty());
        assert!(!t.is_answered());
    }
}
