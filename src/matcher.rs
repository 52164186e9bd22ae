//! Pattern Matcher
//!
//! Deterministic rule engine: an ordered list of typed templates, each a
//! recognition predicate plus a SQL skeleton with named placeholders.
//! Templates are evaluated most specific first and the first one whose
//! predicate accepts the question wins.

use crate::catalog::SchemaCatalog;
use crate::intent::{SlotRole, Span};
use crate::lexicon::{tokenize, Hit, Lexicon};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    pub(crate) static ref SUPERLATIVE: Regex = Regex::new(
        r"\b(most|least|highest|lowest|largest|smallest|biggest|greatest|fewest|cheapest|priciest|newest|latest|oldest|youngest|recent|top|bottom|best|worst)\b"
    ).unwrap();
    static ref GROUPED: Regex = Regex::new(
        r"\b(?:how many|count|number of|breakdown|distribution)\b.*\b(?:by|per|each)\b|\bgroup(?:ed)?\s+by\b"
    ).unwrap();
    pub(crate) static ref AGGREGATE: Regex = Regex::new(
        r"\b(total|sum|average|avg|mean|maximum|max|minimum|min|revenue|sales)\b"
    ).unwrap();
    pub(crate) static ref COUNT: Regex = Regex::new(r"\b(?:how many|count|number of)\b").unwrap();
    pub(crate) static ref COMPARISON: Regex = Regex::new(
        r"\b(?:no more than|no less than|more than|greater than|higher than|bigger than|larger than|older than|younger than|cheaper than|less than|fewer than|lower than|at least|at most|up to|over|above|exceeding|under|below|exactly|equal to|equals|priced at|costs?|since|after|before|between)\s+(?:\$\s*)?\d|(?:\$\s*)?\d+(?:\.\d+)?\s*\+"
    ).unwrap();
    static ref EQUALITY: Regex = Regex::new(
        r#"\b(?:whose|where|named|called)\b|(?:^|\s)'[^']+'|"[^"]+"|\bwith\s+(?:the\s+)?[a-z_ ]+?\s+(?:is|=|equals?|of)\s+\S"#
    ).unwrap();
    static ref LIST: Regex = Regex::new(
        r"\b(?:show|list|display|get|find|give|fetch|see|what|which|who|all|every|any)\b"
    ).unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    TopN,
    GroupedCount,
    Aggregate,
    Count,
    ComparisonFilter,
    CategoryFilter,
    EqualityFilter,
    List,
}

/// What the predicate of a template gets to look at.
pub struct Cues<'a> {
    /// ASCII-lowercased question, byte offsets equal to the original.
    pub lower: &'a str,
    pub hits: &'a [Hit],
}

pub struct Template {
    pub kind: TemplateKind,
    pub name: &'static str,
    pub required: &'static [SlotRole],
    pub skeleton: &'static str,
    predicate: fn(&Cues) -> Option<Span>,
}

/// The template that accepted a question.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateMatch {
    pub kind: TemplateKind,
    pub name: &'static str,
    pub required: &'static [SlotRole],
    pub skeleton: &'static str,
    /// Where the recognising cue sits in the question.
    pub cue: Span,
    /// Number of catalog terms recognised in the question.
    pub overlap: usize,
}

fn regex_cue(re: &Regex, text: &str) -> Option<Span> {
    re.find(text).map(|m| (m.start(), m.end()))
}

fn top_n_cue(c: &Cues) -> Option<Span> {
    regex_cue(&SUPERLATIVE, c.lower)
}

fn grouped_count_cue(c: &Cues) -> Option<Span> {
    regex_cue(&GROUPED, c.lower)
}

fn aggregate_cue(c: &Cues) -> Option<Span> {
    if COUNT.is_match(c.lower) {
        return None;
    }
    for m in AGGREGATE.find_iter(c.lower) {
        let rest = &c.lower[m.end()..];
        // "total amount over 100" names a column, not a SUM.
        if m.as_str() == "total" && rest.starts_with(" amount") && COMPARISON.is_match(rest) {
            continue;
        }
        return Some((m.start(), m.end()));
    }
    None
}

fn count_cue(c: &Cues) -> Option<Span> {
    regex_cue(&COUNT, c.lower)
}

fn comparison_cue(c: &Cues) -> Option<Span> {
    regex_cue(&COMPARISON, c.lower)
}

fn category_cue(c: &Cues) -> Option<Span> {
    c.hits
        .iter()
        .find(|h| !h.fuzzy && h.values().next().is_some())
        .map(|h| h.span)
}

fn equality_cue(c: &Cues) -> Option<Span> {
    regex_cue(&EQUALITY, c.lower)
}

fn list_cue(c: &Cues) -> Option<Span> {
    regex_cue(&LIST, c.lower).or_else(|| {
        // A bare table name ("products?") is a listing request too.
        c.hits.iter().find(|h| h.tables().next().is_some()).map(|h| h.span)
    })
}

/// Templates in priority order.
pub fn default_templates() -> Vec<Template> {
    vec![
        Template {
            kind: TemplateKind::TopN,
            name: "top_n",
            required: &[SlotRole::Table, SlotRole::Order],
            skeleton: "SELECT {projection} FROM {from}{where}{group_clause} ORDER BY {column} {direction} LIMIT {limit}",
            predicate: top_n_cue,
        },
        Template {
            kind: TemplateKind::GroupedCount,
            name: "grouped_count",
            required: &[SlotRole::Table, SlotRole::Column],
            skeleton: "SELECT {column}, COUNT(*) FROM {from}{where} GROUP BY {column}",
            predicate: grouped_count_cue,
        },
        Template {
            kind: TemplateKind::Aggregate,
            name: "aggregate",
            required: &[SlotRole::Table, SlotRole::Column],
            skeleton: "SELECT {aggregate}({column}) FROM {from}{where}",
            predicate: aggregate_cue,
        },
        Template {
            kind: TemplateKind::Count,
            name: "count",
            required: &[SlotRole::Table],
            skeleton: "SELECT {count} FROM {from}{where}",
            predicate: count_cue,
        },
        Template {
            kind: TemplateKind::ComparisonFilter,
            name: "comparison_filter",
            required: &[SlotRole::Table, SlotRole::Comparator, SlotRole::Value],
            skeleton: "SELECT {projection} FROM {from}{where}{limit_clause}",
            predicate: comparison_cue,
        },
        Template {
            kind: TemplateKind::CategoryFilter,
            name: "category_filter",
            required: &[SlotRole::Table, SlotRole::Value],
            skeleton: "SELECT {projection} FROM {from}{where}{limit_clause}",
            predicate: category_cue,
        },
        Template {
            kind: TemplateKind::EqualityFilter,
            name: "equality_filter",
            required: &[SlotRole::Table, SlotRole::Value],
            skeleton: "SELECT {projection} FROM {from}{where}{limit_clause}",
            predicate: equality_cue,
        },
        Template {
            kind: TemplateKind::List,
            name: "list",
            required: &[SlotRole::Table],
            skeleton: "SELECT {projection} FROM {from}{where}{limit_clause}",
            predicate: list_cue,
        },
    ]
}

pub struct PatternMatcher {
    templates: Vec<Template>,
    lexicon: Arc<Lexicon>,
    min_keyword_overlap: usize,
}

impl PatternMatcher {
    pub fn new(catalog: &SchemaCatalog, min_keyword_overlap: usize) -> Self {
        Self::with_lexicon(Arc::new(Lexicon::from_catalog(catalog)), min_keyword_overlap)
    }

    pub fn with_lexicon(lexicon: Arc<Lexicon>, min_keyword_overlap: usize) -> Self {
        Self {
            templates: default_templates(),
            lexicon,
            min_keyword_overlap,
        }
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    /// First template whose predicate accepts the question, or `None` when
    /// the question shares too few terms with the catalog.
    pub fn match_question(&self, question: &str) -> Option<TemplateMatch> {
        let lower = question.to_ascii_lowercase();
        let hits = self.lexicon.scan(&tokenize(question));
        let overlap = hits.len();
        if overlap < self.min_keyword_overlap.max(1) {
            debug!("No template: keyword overlap {} below {}", overlap, self.min_keyword_overlap);
            return None;
        }

        let cues = Cues { lower: &lower, hits: &hits };
        for template in &self.templates {
            if let Some(cue) = (template.predicate)(&cues) {
                debug!("Template '{}' accepted cue at {:?}", template.name, cue);
                return Some(TemplateMatch {
                    kind: template.kind,
                    name: template.name,
                    required: template.required,
                    skeleton: template.skeleton,
                    cue,
                    overlap,
                });
            }
        }

        debug!("No template predicate accepted the question");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> PatternMatcher {
        PatternMatcher::new(&SchemaCatalog::storefront(), 1)
    }

    fn kind(question: &str) -> Option<TemplateKind> {
        matcher().match_question(question).map(|m| m.kind)
    }

    #[test]
    fn test_priority_order() {
        assert_eq!(kind("Which are the most expensive products?"), Some(TemplateKind::TopN));
        assert_eq!(kind("How many products per category?"), Some(TemplateKind::GroupedCount));
        assert_eq!(kind("What is the average price of products?"), Some(TemplateKind::Aggregate));
        assert_eq!(kind("How many users do we have?"), Some(TemplateKind::Count));
        assert_eq!(kind("Show products over $100"), Some(TemplateKind::ComparisonFilter));
        assert_eq!(kind("Show products $500+"), Some(TemplateKind::ComparisonFilter));
        assert_eq!(kind("What are the best selling products?"), Some(TemplateKind::TopN));
        assert_eq!(kind("Show me all products in the Electronics category"), Some(TemplateKind::CategoryFilter));
        assert_eq!(kind("Find users whose city is Paris"), Some(TemplateKind::EqualityFilter));
        assert_eq!(kind("List all users"), Some(TemplateKind::List));
    }

    #[test]
    fn test_count_vetoes_aggregate() {
        assert_eq!(kind("What is the total number of orders?"), Some(TemplateKind::Count));
    }

    #[test]
    fn test_total_amount_filter_is_not_aggregate() {
        assert_eq!(
            kind("Show orders with total amount over 100"),
            Some(TemplateKind::ComparisonFilter)
        );
    }

    #[test]
    fn test_no_overlap_no_match() {
        assert!(matcher().match_question("purple elephant sings").is_none());
        assert!(matcher().match_question("show me everything you know").is_none());
    }

    #[test]
    fn test_match_reports_overlap_and_cue() {
        let m = matcher().match_question("How many users do we have?").unwrap();
        assert_eq!(m.name, "count");
        assert_eq!(m.cue, (0, 8));
        assert_eq!(m.overlap, 1);
        assert_eq!(m.required, &[SlotRole::Table]);
    }
}
