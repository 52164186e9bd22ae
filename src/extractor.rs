//! Slot Extractor
//!
//! Pulls tables, columns, values, comparators, limits and orderings out of a
//! question that a template has accepted, using the catalog lexicon. Every
//! slot keeps the byte span it came from; slots are returned in left-to-right
//! order.

use crate::catalog::{ColumnRef, SchemaCatalog};
use crate::error::{EngineError, Result};
use crate::intent::{AggregateOp, QueryIntent, Slot, SlotRole, SlotValue, SortOrder, Span};
use crate::lexicon::{tokenize, Hit, Lexicon, Term, Token};
use crate::matcher::{TemplateKind, TemplateMatch, AGGREGATE, SUPERLATIVE};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref NUMBER: Regex = Regex::new(r"\d+(?:\.\d+)?").unwrap();
    static ref DATE: Regex = Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap();
    static ref LIMIT_BEFORE: Regex = Regex::new(r"\b(?:top|first|last|limit)\s+(\d+)\b").unwrap();
    static ref LIMIT_AFTER: Regex = Regex::new(
        r"\b(\d+)\s+(?:most|least|highest|lowest|largest|smallest|biggest|greatest|cheapest|priciest|newest|latest|oldest|youngest|recent|best|worst)\b"
    ).unwrap();
    static ref YEAR: Regex = Regex::new(r"\b(?:in|during)\s+(\d{4})\b").unwrap();
    static ref COMPARATOR: Regex = Regex::new(
        r"\b(?P<phrase>no more than|no less than|more than|greater than|higher than|bigger than|larger than|older than|younger than|cheaper than|less than|fewer than|lower than|at least|at most|up to|over|above|exceeding|under|below|exactly|equal to|equals|priced at|costs?|since|after|before)\s+(?:\$\s*)?(?P<value>\d{4}-\d{2}-\d{2}|\d+(?:\.\d+)?)"
    ).unwrap();
    static ref PLUS: Regex = Regex::new(r"(?:\$\s*)?(?P<value>\d+(?:\.\d+)?)\s*\+").unwrap();
    static ref BETWEEN: Regex = Regex::new(
        r"\bbetween\s+(?:\$\s*)?(?P<low>\d{4}-\d{2}-\d{2}|\d+(?:\.\d+)?)\s+(?P<and>and)\s+(?:\$\s*)?(?P<high>\d{4}-\d{2}-\d{2}|\d+(?:\.\d+)?)"
    ).unwrap();
    static ref NAMED: Regex = Regex::new(
        r#"\b(?i:named|called)\s+(?:"([^"]+)"|'([^']+)'|([A-Za-z][\w\-]*(?:\s+[A-Z][\w\-]*)*))"#
    ).unwrap();
    static ref QUOTED: Regex = Regex::new(r#"(?:^|\s)(?:"([^"]+)"|'([^']+)')"#).unwrap();
    static ref EQUALS_VALUE: Regex = Regex::new(
        r#"^\s*(?:is|=|==|equals|equal to|of)?\s*(?:"([^"]+)"|'([^']+)'|([A-Za-z0-9][\w\-\.@]*))"#
    ).unwrap();
    static ref GROUP_MARKER: Regex = Regex::new(
        r"\b(?:group(?:ed)?\s+by|for each|in each|by|per|each)\s+(?:the\s+)?"
    ).unwrap();
    static ref BY_MARKER: Regex = Regex::new(r"\bby\s+(?:the\s+)?").unwrap();
    static ref ALL: Regex = Regex::new(r"\b(?:all|every)\b").unwrap();
}

/// Words after a number that only carry its unit.
const UNIT_WORDS: &[&str] = &["dollar", "usd", "buck", "euro", "item", "unit", "piece", "year", "day"];

/// Words that end an equality value rather than being one.
const STOP_WORDS: &[&str] = &[
    "is", "the", "a", "an", "of", "in", "and", "or", "not", "null", "at", "than", "over", "above",
    "under", "below", "more", "less", "greater", "fewer", "between", "exactly", "equal", "equals",
];

/// Question scaffolding and template cue words; anything else the rule path
/// leaves unused makes the match partial.
const FILLER_WORDS: &[&str] = &[
    "a", "an", "the", "all", "every", "any", "each", "some", "me", "us", "i", "we", "you", "our", "my", "your",
    "their", "them", "they", "it", "its", "this", "that", "these", "those", "there", "here", "how", "many",
    "much", "what", "which", "who", "whom", "whose", "where", "when", "show", "list", "display", "get", "find",
    "give", "fetch", "see", "tell", "return", "please", "can", "could", "would", "will", "do", "does", "did",
    "have", "has", "had", "are", "is", "was", "were", "be", "been", "exist", "currently", "of", "in", "on",
    "at", "for", "to", "by", "per", "from", "with", "within", "into", "than", "and", "or", "as", "about",
    "contain", "containing", "include", "including", "having", "count", "number", "total", "sum", "average",
    "avg", "mean", "maximum", "max", "minimum", "min", "most", "least", "highest", "lowest", "largest",
    "smallest", "biggest", "greatest", "fewest", "cheapest", "priciest", "newest", "latest", "oldest",
    "youngest", "recent", "top", "bottom", "best", "worst", "first", "last", "limit", "group", "grouped",
    "breakdown", "distribution", "between", "named", "called", "equal", "equals", "exactly", "over", "above",
    "under", "below", "more", "less", "greater", "fewer", "lower", "higher", "bigger", "larger", "older",
    "younger", "cheaper", "up", "no", "not", "since", "after", "before", "during", "exceeding", "priced",
    "costs", "row", "record", "entry", "left", "available", "data",
];

/// Words that introduce a column condition ("users whose city is ...").
const CONDITION_MARKERS: &[&str] = &["whose", "where", "with", "having", "and"];

/// Comparator phrase → SQL operator, with a lexicon hint for the compared column.
fn comparator(phrase: &str) -> (&'static str, Option<&'static str>) {
    match phrase {
        "no more than" | "at most" | "up to" => ("<=", None),
        "no less than" | "at least" | "since" => (">=", None),
        "older than" => (">", Some("age")),
        "younger than" => ("<", Some("age")),
        "cheaper than" => ("<", Some("cheap")),
        "priced at" | "cost" | "costs" => ("=", Some("cost")),
        "exactly" | "equal to" | "equals" => ("=", None),
        "less than" | "fewer than" | "lower than" | "under" | "below" | "before" => ("<", None),
        _ => (">", None),
    }
}

/// A column condition assembled from a comparator slot and its value slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: ColumnRef,
    pub comparator: String,
    pub value: SlotValue,
}

/// Result of a successful extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub intent: QueryIntent,
    pub slots: Vec<Slot>,
    /// Parts of the question that were assumed or ignored; non-empty means
    /// the template only partially matched.
    pub unresolved: Vec<String>,
    /// The question asked for "all" / "every" row.
    pub wants_all: bool,
}

impl Extraction {
    pub fn is_partial(&self) -> bool {
        !self.unresolved.is_empty()
    }

    /// The earliest table slot drives the FROM clause.
    pub fn base_table(&self) -> Option<&str> {
        self.slots
            .iter()
            .find(|s| s.role == SlotRole::Table)
            .and_then(|s| s.value.as_text())
    }

    pub fn filters(&self) -> Vec<Filter> {
        let mut pending: Vec<(ColumnRef, String)> = Vec::new();
        let mut filters = Vec::new();
        for slot in &self.slots {
            let Some(column) = slot.column.clone() else { continue };
            match slot.role {
                SlotRole::Comparator => {
                    if let Some(op) = slot.value.as_text() {
                        pending.push((column, op.to_string()));
                    }
                }
                SlotRole::Value => {
                    if let Some(idx) = pending.iter().position(|(c, _)| *c == column) {
                        let (column, comparator) = pending.remove(idx);
                        filters.push(Filter {
                            column,
                            comparator,
                            value: slot.value.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        filters
    }

    pub fn order(&self) -> Option<(ColumnRef, SortOrder)> {
        self.slots.iter().find(|s| s.role == SlotRole::Order).and_then(|s| {
            let order = match s.value.as_text()? {
                "ASC" => SortOrder::Asc,
                _ => SortOrder::Desc,
            };
            Some((s.column.clone()?, order))
        })
    }

    pub fn limit(&self) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.role == SlotRole::Limit)
            .and_then(|s| s.value.as_number())
            .map(|n| n as u32)
    }

    pub fn target_column(&self) -> Option<&ColumnRef> {
        self.slots
            .iter()
            .find(|s| s.role == SlotRole::Column)
            .and_then(|s| s.column.as_ref())
    }
}

/// Per-request scratch state.
struct Frame<'q> {
    question: &'q str,
    lower: String,
    tokens: Vec<Token>,
    hits: Vec<Hit>,
    consumed: Vec<Span>,
    base: String,
    mentioned: Vec<(String, Span)>,
    slots: Vec<Slot>,
    unresolved: Vec<String>,
}

impl Frame<'_> {
    fn is_consumed(&self, span: Span) -> bool {
        self.consumed.iter().any(|c| span.0 < c.1 && c.0 < span.1)
    }

    fn has_filter_on(&self, column: &ColumnRef) -> bool {
        self.slots
            .iter()
            .any(|s| s.role == SlotRole::Value && s.column.as_ref() == Some(column))
    }

    /// Table mentioned closest before `pos`, else the base table.
    fn table_before(&self, pos: usize) -> String {
        self.mentioned
            .iter()
            .rev()
            .find(|(_, span)| span.1 <= pos)
            .map(|(t, _)| t.clone())
            .unwrap_or_else(|| self.base.clone())
    }

    fn push_filter(&mut self, column: ColumnRef, op: &str, op_span: Span, value: SlotValue, value_span: Span) {
        self.slots.push(
            Slot::new(SlotRole::Comparator, SlotValue::Text(op.to_string()), op_span).bound_to(column.clone()),
        );
        self.slots.push(Slot::new(SlotRole::Value, value, value_span).bound_to(column));
    }
}

pub struct SlotExtractor {
    catalog: Arc<SchemaCatalog>,
    lexicon: Arc<Lexicon>,
    default_limit: u32,
}

impl SlotExtractor {
    pub fn new(catalog: Arc<SchemaCatalog>, lexicon: Arc<Lexicon>, default_limit: u32) -> Self {
        Self {
            catalog,
            lexicon,
            default_limit,
        }
    }

    /// Fill the slots `template` needs, failing with `EngineError::Extraction`
    /// when a required role cannot be located in the question.
    pub fn extract(&self, question: &str, template: &TemplateMatch) -> Result<Extraction> {
        let tokens = tokenize(question);
        let hits = self.lexicon.scan(&tokens);
        let mut frame = Frame {
            question,
            lower: question.to_ascii_lowercase(),
            tokens,
            hits,
            consumed: Vec::new(),
            base: String::new(),
            mentioned: Vec::new(),
            slots: Vec::new(),
            unresolved: Vec::new(),
        };

        let (named, quoted) = self.reserve_names(&mut frame);
        let numeric = self.reserve_numbers(&mut frame);
        frame.hits.retain(|h| !frame.consumed.iter().any(|c| h.span.0 < c.1 && c.0 < h.span.1));

        if !self.resolve_tables(&mut frame) {
            return Err(EngineError::Extraction {
                template: template.name,
                missing: SlotRole::Table,
            });
        }

        self.extract_names(&mut frame, named);
        self.extract_numeric(&mut frame, numeric);
        self.extract_known_values(&mut frame);
        self.extract_column_equalities(&mut frame);
        let leftover: Vec<(Span, String)> = quoted
            .into_iter()
            .filter(|(span, _)| !frame.slots.iter().any(|s| s.role == SlotRole::Value && s.span == *span))
            .collect();
        self.extract_names(&mut frame, leftover);

        let intent = match template.kind {
            TemplateKind::TopN => {
                self.extract_order(&mut frame);
                let order = frame
                    .slots
                    .iter()
                    .find(|s| s.role == SlotRole::Order)
                    .map(|s| if s.value.as_text() == Some("ASC") { SortOrder::Asc } else { SortOrder::Desc });
                let n = frame
                    .slots
                    .iter()
                    .find(|s| s.role == SlotRole::Limit)
                    .and_then(|s| s.value.as_number())
                    .map(|n| n as u32)
                    .unwrap_or(self.default_limit);
                QueryIntent::TopN {
                    n,
                    order: order.unwrap_or(SortOrder::Desc),
                }
            }
            TemplateKind::GroupedCount => {
                let column = self.extract_group_column(&mut frame);
                QueryIntent::GroupBy {
                    column: column.map(|c| c.column).unwrap_or_default(),
                }
            }
            TemplateKind::Aggregate => {
                let op = self.extract_aggregate(&mut frame);
                QueryIntent::Aggregate { op }
            }
            TemplateKind::Count => QueryIntent::Count,
            TemplateKind::ComparisonFilter | TemplateKind::CategoryFilter | TemplateKind::EqualityFilter => {
                QueryIntent::Filter
            }
            TemplateKind::List => {
                if frame.slots.iter().any(|s| s.role == SlotRole::Value) {
                    QueryIntent::Filter
                } else {
                    QueryIntent::List
                }
            }
        };

        self.flag_unused_words(&mut frame);
        frame.slots.sort_by_key(|s| s.span.0);

        for role in template.required {
            if !frame.slots.iter().any(|s| s.role == *role) {
                debug!("Template '{}' missing required {} slot", template.name, role);
                return Err(EngineError::Extraction {
                    template: template.name,
                    missing: *role,
                });
            }
        }

        debug!(
            "Extracted {} slots for '{}' ({} unresolved)",
            frame.slots.len(),
            template.name,
            frame.unresolved.len()
        );

        Ok(Extraction {
            intent,
            slots: frame.slots,
            unresolved: frame.unresolved,
            wants_all: ALL.is_match(&frame.lower),
        })
    }

    /// Prefer the base table, then other mentioned tables, then anything the
    /// foreign-key graph reaches from the base table.
    fn resolve(&self, frame: &Frame, candidates: &[ColumnRef]) -> Option<ColumnRef> {
        if let Some(c) = candidates.iter().find(|c| c.table.eq_ignore_ascii_case(&frame.base)) {
            return Some(c.clone());
        }
        for (table, _) in &frame.mentioned {
            if let Some(c) = candidates.iter().find(|c| c.table.eq_ignore_ascii_case(table)) {
                if self.catalog.join_path(&frame.base, &c.table).is_some() {
                    return Some(c.clone());
                }
            }
        }
        candidates
            .iter()
            .find(|c| self.catalog.join_path(&frame.base, &c.table).is_some())
            .cloned()
    }

    fn lookup_columns(&self, phrase: &str) -> Vec<ColumnRef> {
        self.lexicon
            .lookup(phrase)
            .into_iter()
            .filter_map(|t| match t {
                Term::Column(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Quoted text and "named X" are literal values: reserve their spans so
    /// the words inside are not read as catalog terms.
    /// Returns "named X" phrases and free-standing quoted strings separately;
    /// a quoted string may still turn out to be a column value.
    fn reserve_names(&self, frame: &mut Frame) -> (Vec<(Span, String)>, Vec<(Span, String)>) {
        let mut named = Vec::new();
        let mut quoted = Vec::new();
        for caps in NAMED.captures_iter(frame.question) {
            let Some(value) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else { continue };
            let Some(whole) = caps.get(0) else { continue };
            frame.consumed.push((value.start(), value.end()));
            named.push(((whole.start(), value.end()), value.as_str().trim().to_string()));
        }
        for caps in QUOTED.captures_iter(frame.question) {
            let Some(value) = caps.get(1).or_else(|| caps.get(2)) else { continue };
            let span = (value.start(), value.end());
            if frame.is_consumed(span) {
                continue;
            }
            frame.consumed.push(span);
            quoted.push((span, value.as_str().trim().to_string()));
        }
        (named, quoted)
    }

    /// Reserve comparator, range, year and limit phrases before table
    /// resolution; unit words after numbers are dropped from the hits.
    fn reserve_numbers(&self, frame: &mut Frame) -> Vec<NumericPhrase> {
        let mut phrases = Vec::new();

        for caps in BETWEEN.captures_iter(&frame.lower) {
            let (Some(whole), Some(low), Some(and), Some(high)) =
                (caps.get(0), caps.name("low"), caps.name("and"), caps.name("high"))
            else {
                continue;
            };
            frame.consumed.push((whole.start(), whole.end()));
            phrases.push(NumericPhrase::Between {
                start: whole.start(),
                low: (low.start(), low.end()),
                and: (and.start(), and.end()),
                high: (high.start(), high.end()),
            });
        }

        for caps in COMPARATOR.captures_iter(&frame.lower) {
            let (Some(phrase), Some(value)) = (caps.name("phrase"), caps.name("value")) else { continue };
            let span = (phrase.start(), value.end());
            if frame.is_consumed(span) {
                continue;
            }
            frame.consumed.push(span);
            phrases.push(NumericPhrase::Compare {
                phrase: (phrase.start(), phrase.end()),
                value: (value.start(), value.end()),
            });
        }

        // "$500+" reads as "over $500".
        for caps in PLUS.captures_iter(&frame.lower) {
            let (Some(whole), Some(value)) = (caps.get(0), caps.name("value")) else { continue };
            let span = (whole.start(), whole.end());
            if frame.is_consumed(span) {
                continue;
            }
            frame.consumed.push(span);
            phrases.push(NumericPhrase::Plus {
                span,
                value: (value.start(), value.end()),
            });
        }

        for caps in YEAR.captures_iter(&frame.lower) {
            let (Some(whole), Some(year)) = (caps.get(0), caps.get(1)) else { continue };
            let span = (whole.start(), whole.end());
            let Ok(y) = year.as_str().parse::<i32>() else { continue };
            if frame.is_consumed(span) || !(1900..=2100).contains(&y) {
                continue;
            }
            frame.consumed.push(span);
            phrases.push(NumericPhrase::Year { span, year: y });
        }

        for re in [&*LIMIT_BEFORE, &*LIMIT_AFTER] {
            for caps in re.captures_iter(&frame.lower) {
                let Some(n) = caps.get(1) else { continue };
                let span = (n.start(), n.end());
                if frame.is_consumed(span) {
                    continue;
                }
                if let Ok(value) = n.as_str().parse::<u32>() {
                    frame.consumed.push(span);
                    phrases.push(NumericPhrase::Limit { span, value });
                }
            }
        }

        let mut leftovers = Vec::new();
        for m in DATE.find_iter(&frame.lower).chain(NUMBER.find_iter(&frame.lower)) {
            let span = (m.start(), m.end());
            if frame.is_consumed(span) {
                continue;
            }
            frame.consumed.push(span);
            leftovers.push(span);
        }

        // Unit words right after any number are noise ("$50 dollars", "3 items").
        let number_ends: Vec<usize> = NUMBER.find_iter(&frame.lower).map(|m| m.end()).collect();
        let lower = frame.lower.clone();
        let unit_spans: Vec<Span> = frame
            .tokens
            .iter()
            .filter(|t| UNIT_WORDS.contains(&t.stem.as_str()))
            .filter(|t| {
                number_ends
                    .iter()
                    .any(|&end| end <= t.span.0 && lower[end..t.span.0].trim().is_empty())
            })
            .map(|t| t.span)
            .collect();
        frame.consumed.extend(unit_spans);

        phrases.extend(leftovers.into_iter().map(NumericPhrase::Loose));
        phrases
    }

    /// Earliest mentioned table wins; without any table mention the table is
    /// inferred from the first column or value mentioned.
    fn resolve_tables(&self, frame: &mut Frame) -> bool {
        for hit in &frame.hits {
            if let Some(table) = hit.tables().next() {
                if !frame.mentioned.iter().any(|(t, _)| t == table) {
                    frame.mentioned.push((table.to_string(), hit.span));
                }
                if hit.fuzzy {
                    let text = &frame.question[hit.span.0..hit.span.1];
                    frame.unresolved.push(format!("read '{}' as table {}", text, table));
                }
            }
        }

        if let Some((table, _)) = frame.mentioned.first().cloned() {
            frame.base = table;
            for (table, span) in frame.mentioned.clone() {
                frame.slots.push(Slot::new(SlotRole::Table, SlotValue::Text(table), span));
            }
            return true;
        }

        let inferred = frame.hits.iter().find_map(|h| {
            h.columns()
                .map(|c| c.table.clone())
                .chain(h.values().map(|(c, _)| c.table.clone()))
                .next()
                .map(|t| (t, h.span))
        });
        match inferred {
            Some((table, span)) => {
                let text = &frame.question[span.0..span.1];
                frame.unresolved.push(format!("table {} inferred from '{}'", table, text));
                frame.slots.push(Slot::new(SlotRole::Table, SlotValue::Text(table.clone()), span));
                frame.base = table;
                true
            }
            None => false,
        }
    }

    fn extract_names(&self, frame: &mut Frame, names: Vec<(Span, String)>) {
        for (span, value) in names {
            let table = frame.table_before(span.0);
            let Some(spec) = self.catalog.table(&table) else { continue };
            let Some(column) = spec.column("name").or_else(|| spec.column("title")) else {
                frame.unresolved.push(format!("no name column for '{}'", value));
                continue;
            };
            let column = ColumnRef::new(&spec.name, &column.name);
            if self.catalog.join_path(&frame.base, &column.table).is_none() {
                continue;
            }
            frame.push_filter(column, "LIKE", span, SlotValue::Text(format!("%{}%", value)), span);
        }
    }

    fn extract_numeric(&self, frame: &mut Frame, phrases: Vec<NumericPhrase>) {
        for phrase in phrases {
            match phrase {
                NumericPhrase::Compare { phrase, value } => {
                    let text = frame.lower[phrase.0..phrase.1].to_string();
                    let raw = frame.lower[value.0..value.1].to_string();
                    let (op, hint) = comparator(&text);
                    let Some(value_slot) = self.parse_value(frame, &raw) else { continue };
                    let Some(column) = self.comparison_column(frame, phrase, hint, &value_slot, &text) else {
                        continue;
                    };
                    frame.push_filter(column, op, phrase, value_slot, value);
                }
                NumericPhrase::Plus { span, value } => {
                    let text = frame.lower[span.0..span.1].to_string();
                    let raw = frame.lower[value.0..value.1].to_string();
                    let Some(value_slot) = self.parse_value(frame, &raw) else { continue };
                    let Some(column) = self.comparison_column(frame, span, None, &value_slot, &text) else {
                        continue;
                    };
                    frame.push_filter(column, ">", span, value_slot, value);
                }
                NumericPhrase::Between { start, low, and, high } => {
                    let low_raw = frame.lower[low.0..low.1].to_string();
                    let high_raw = frame.lower[high.0..high.1].to_string();
                    let (Some(low_value), Some(high_value)) =
                        (self.parse_value(frame, &low_raw), self.parse_value(frame, &high_raw))
                    else {
                        continue;
                    };
                    let span = (start, start + "between".len());
                    let Some(column) = self.comparison_column(frame, span, None, &low_value, "between") else {
                        continue;
                    };
                    frame.push_filter(column.clone(), ">=", span, low_value, low);
                    frame.push_filter(column, "<=", and, high_value, high);
                }
                NumericPhrase::Year { span, year } => {
                    let table = frame.table_before(span.0);
                    let temporal = self
                        .catalog
                        .table(&table)
                        .and_then(|t| t.temporal_column().map(|c| ColumnRef::new(&t.name, &c.name)));
                    let (Some(column), Some(from), Some(to)) = (
                        temporal,
                        NaiveDate::from_ymd_opt(year, 1, 1),
                        NaiveDate::from_ymd_opt(year + 1, 1, 1),
                    ) else {
                        frame.unresolved.push(format!("no date column for year {}", year));
                        continue;
                    };
                    frame.push_filter(column.clone(), ">=", span, SlotValue::Text(from.to_string()), span);
                    frame.push_filter(column, "<", span, SlotValue::Text(to.to_string()), span);
                }
                NumericPhrase::Limit { span, value } => {
                    if !frame.slots.iter().any(|s| s.role == SlotRole::Limit) && value > 0 {
                        frame
                            .slots
                            .push(Slot::new(SlotRole::Limit, SlotValue::Number(value as f64), span));
                    }
                }
                NumericPhrase::Loose(span) => {
                    let text = frame.question[span.0..span.1].to_string();
                    // "5 users" reads as a row limit.
                    let before_table = frame
                        .hits
                        .iter()
                        .find(|h| h.span.0 > span.1)
                        .map_or(false, |h| {
                            frame.lower[span.1..h.span.0].trim().is_empty() && h.tables().next().is_some()
                        });
                    let has_limit = frame.slots.iter().any(|s| s.role == SlotRole::Limit);
                    match text.parse::<u32>() {
                        Ok(n) if before_table && !has_limit && n > 0 => {
                            frame.slots.push(Slot::new(SlotRole::Limit, SlotValue::Number(n as f64), span));
                        }
                        _ => {
                            // Values after a column ("age 30") are picked up by the equality pass.
                            let after_column = frame.hits.iter().any(|h| {
                                h.span.1 <= span.0
                                    && h.columns().next().is_some()
                                    && EQUALS_VALUE
                                        .find(&frame.lower[h.span.1..])
                                        .map_or(false, |m| h.span.1 + m.end() == span.1)
                            });
                            if !after_column {
                                frame.unresolved.push(format!("ignored '{}'", text));
                            }
                        }
                    }
                }
            }
        }
    }

    fn parse_value(&self, frame: &mut Frame, raw: &str) -> Option<SlotValue> {
        if DATE.is_match(raw) {
            return match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
                Ok(date) => Some(SlotValue::Text(date.to_string())),
                Err(_) => {
                    frame.unresolved.push(format!("invalid date '{}'", raw));
                    None
                }
            };
        }
        raw.parse::<f64>().ok().map(SlotValue::Number)
    }

    /// Column compared by a comparator phrase: explicit hint, date column for
    /// dates, the nearest numeric column mentioned before it, or the default
    /// measure of the nearest table (recorded as an assumption).
    fn comparison_column(
        &self,
        frame: &mut Frame,
        phrase: Span,
        hint: Option<&str>,
        value: &SlotValue,
        text: &str,
    ) -> Option<ColumnRef> {
        if let Some(hint) = hint {
            let candidates = self.lookup_columns(hint);
            if let Some(column) = self.resolve(frame, &candidates) {
                return Some(column);
            }
        }

        let table = frame.table_before(phrase.0);
        if value.as_text().is_some() {
            let temporal = self
                .catalog
                .table(&table)
                .and_then(|t| t.temporal_column().map(|c| ColumnRef::new(&t.name, &c.name)));
            if temporal.is_none() {
                frame.unresolved.push(format!("no date column for '{}'", text));
            }
            return temporal;
        }

        let preceding: Vec<ColumnRef> = frame
            .hits
            .iter()
            .rev()
            .filter(|h| h.span.1 <= phrase.0)
            .find_map(|h| {
                let numeric: Vec<ColumnRef> = h
                    .columns()
                    .filter(|c| self.catalog.column(&c.table, &c.column).map_or(false, |s| s.is_numeric()))
                    .cloned()
                    .collect();
                if numeric.is_empty() {
                    None
                } else {
                    Some(numeric)
                }
            })
            .unwrap_or_default();
        if let Some(column) = self.resolve(frame, &preceding) {
            return Some(column);
        }

        let measure = self
            .catalog
            .table(&table)
            .and_then(|t| t.default_measure().map(|c| ColumnRef::new(&t.name, &c.name)))
            .filter(|c| self.catalog.join_path(&frame.base, &c.table).is_some());
        match measure {
            Some(column) => {
                frame
                    .unresolved
                    .push(format!("assumed {} for '{}'", column.column, text));
                Some(column)
            }
            None => {
                frame.unresolved.push(format!("no column to compare for '{}'", text));
                None
            }
        }
    }

    fn extract_known_values(&self, frame: &mut Frame) {
        let hits: Vec<Hit> = frame
            .hits
            .iter()
            .filter(|h| !h.fuzzy && h.tables().next().is_none())
            .cloned()
            .collect();
        for hit in hits {
            let candidates: Vec<ColumnRef> = hit.values().map(|(c, _)| c.clone()).collect();
            if candidates.is_empty() {
                continue;
            }
            let Some(column) = self.resolve(frame, &candidates) else {
                let text = &frame.question[hit.span.0..hit.span.1];
                frame.unresolved.push(format!("'{}' is not reachable from {}", text, frame.base));
                continue;
            };
            if frame.has_filter_on(&column) {
                continue;
            }
            let Some(value) = hit.values().find(|(c, _)| **c == column).map(|(_, v)| v.to_string()) else {
                continue;
            };
            frame.consumed.push(hit.span);
            frame.push_filter(column, "=", hit.span, SlotValue::Text(value), hit.span);
        }
    }

    /// "whose city is Paris", "with status 'shipped'", "where age = 30".
    fn extract_column_equalities(&self, frame: &mut Frame) {
        let hits: Vec<Hit> = frame
            .hits
            .iter()
            .filter(|h| h.columns().next().is_some())
            .cloned()
            .collect();
        for hit in hits {
            let first_token = frame.tokens.iter().position(|t| t.span.0 == hit.span.0);
            let Some(first_token) = first_token else { continue };
            let marker = frame.tokens[..first_token]
                .iter()
                .rev()
                .find(|t| t.text != "the")
                .map(|t| t.text.as_str());
            if !marker.map_or(false, |m| CONDITION_MARKERS.contains(&m)) {
                continue;
            }

            let question = frame.question;
            let rest = &question[hit.span.1..];
            let Some(caps) = EQUALS_VALUE.captures(rest) else { continue };
            let Some(value) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else { continue };
            let quoted = caps.get(3).is_none();
            let mut value_span = (hit.span.1 + value.start(), hit.span.1 + value.end());
            let mut raw = value.as_str().trim_end_matches(|c: char| ".,?!".contains(c)).to_string();
            value_span.1 = value_span.0 + raw.len();
            if raw.is_empty() || (!quoted && STOP_WORDS.contains(&raw.to_ascii_lowercase().as_str())) {
                continue;
            }

            let candidates: Vec<ColumnRef> = hit.columns().cloned().collect();
            let Some(column) = self.resolve(frame, &candidates) else { continue };
            if frame.has_filter_on(&column) {
                continue;
            }
            let Some(spec) = self.catalog.column(&column.table, &column.column) else { continue };

            let slot_value = if spec.is_numeric() {
                match raw.parse::<f64>() {
                    Ok(n) => SlotValue::Number(n),
                    Err(_) => continue,
                }
            } else {
                if !quoted {
                    // Extend over capitalised words: "city is New York".
                    let first_end = value_span.1;
                    for token in frame.tokens.iter().filter(|t| t.span.0 > first_end) {
                        let between = &frame.question[value_span.1..token.span.0];
                        let original = &frame.question[token.span.0..token.span.1];
                        if !between.trim().is_empty() || !original.starts_with(|c: char| c.is_ascii_uppercase()) {
                            break;
                        }
                        value_span.1 = token.span.1;
                    }
                    raw = frame.question[value_span.0..value_span.1].to_string();
                }
                let canonical = spec
                    .values
                    .iter()
                    .find(|v| {
                        v.value.eq_ignore_ascii_case(&raw) || v.aliases.iter().any(|a| a.eq_ignore_ascii_case(&raw))
                    })
                    .map(|v| v.value.clone());
                SlotValue::Text(canonical.unwrap_or(raw))
            };

            frame.consumed.push(value_span);
            frame.push_filter(column, "=", hit.span, slot_value, value_span);
        }
    }

    fn extract_order(&self, frame: &mut Frame) {
        let cues: Vec<(String, Span)> = SUPERLATIVE
            .find_iter(&frame.lower)
            .map(|m| (m.as_str().to_string(), (m.start(), m.end())))
            .collect();
        let Some((first, first_span)) = cues.first().cloned() else { return };
        // "most recent" / "least recent": the adjective picks the column.
        let (word, span, inverted) = match cues.get(1) {
            Some((next, next_span))
                if (first == "most" || first == "least") && frame.lower[first_span.1..next_span.0].trim().is_empty() =>
            {
                (next.clone(), (first_span.0, next_span.1), first == "least")
            }
            _ => (first, first_span, false),
        };
        let base_table = self.catalog.table(&frame.base);
        let temporal = base_table.and_then(|t| t.temporal_column().map(|c| ColumnRef::new(&t.name, &c.name)));

        let explicit_by = self.column_after_marker(frame, &BY_MARKER);
        let following = frame
            .hits
            .iter()
            .filter(|h| h.span.0 >= span.1)
            .find(|h| {
                let gap = &frame.lower[span.1..h.span.0];
                gap.split_whitespace().count() <= 2 && h.columns().next().is_some()
            })
            .map(|h| h.columns().cloned().collect::<Vec<_>>())
            .and_then(|c| self.resolve(frame, &c));

        let (column, order) = match word.as_str() {
            "cheapest" => (self.resolve(frame, &self.lookup_columns("cheap")).or(explicit_by), SortOrder::Asc),
            "priciest" => (self.resolve(frame, &self.lookup_columns("pricey")).or(explicit_by), SortOrder::Desc),
            "youngest" | "oldest" => {
                let age = self
                    .lookup_columns("age")
                    .into_iter()
                    .find(|c| c.table.eq_ignore_ascii_case(&frame.base));
                match (age, word.as_str()) {
                    (Some(age), "oldest") => (Some(age), SortOrder::Desc),
                    (Some(age), _) => (Some(age), SortOrder::Asc),
                    (None, "oldest") => (temporal, SortOrder::Asc),
                    (None, _) => (temporal, SortOrder::Desc),
                }
            }
            "newest" | "latest" | "recent" => (temporal, SortOrder::Desc),
            "top" | "bottom" => {
                let order = if word == "top" { SortOrder::Desc } else { SortOrder::Asc };
                match explicit_by.or(following) {
                    Some(column) => (Some(column), order),
                    None => {
                        let measure =
                            base_table.and_then(|t| t.default_measure().map(|c| ColumnRef::new(&t.name, &c.name)));
                        if let Some(ref column) = measure {
                            frame.unresolved.push(format!("ranked by {} for '{}'", column.column, word));
                        }
                        (measure, order)
                    }
                }
            }
            "least" | "lowest" | "smallest" | "fewest" | "worst" => (following.or(explicit_by), SortOrder::Asc),
            _ => (following.or(explicit_by), SortOrder::Desc),
        };

        let order = if inverted { order.reversed() } else { order };
        if let Some(column) = column {
            frame
                .slots
                .push(Slot::new(SlotRole::Order, SlotValue::Text(order.sql().to_string()), span).bound_to(column));
        }
    }

    fn flag_unused_words(&self, frame: &mut Frame) {
        let mut unused: Vec<Span> = Vec::new();
        let mut phrase: Option<Span> = None;
        for token in &frame.tokens {
            let used = frame.is_consumed(token.span)
                || frame.hits.iter().any(|h| h.span.0 <= token.span.0 && token.span.1 <= h.span.1)
                || FILLER_WORDS.contains(&token.text.as_str())
                || FILLER_WORDS.contains(&token.stem.as_str());
            if used {
                unused.extend(phrase.take());
                continue;
            }
            // Adjacent unknown words are reported as one phrase.
            phrase = match phrase {
                Some((start, end)) if frame.question[end..token.span.0].trim().is_empty() => Some((start, token.span.1)),
                Some(previous) => {
                    unused.push(previous);
                    Some(token.span)
                }
                None => Some(token.span),
            };
        }
        unused.extend(phrase);
        for (start, end) in unused {
            frame.unresolved.push(format!("ignored '{}'", &frame.question[start..end]));
        }
    }

    /// Column named right after a marker such as "by".
    fn column_after_marker(&self, frame: &Frame, marker: &Regex) -> Option<ColumnRef> {
        for m in marker.find_iter(&frame.lower) {
            if let Some(hit) = frame.hits.iter().find(|h| h.span.0 == m.end()) {
                let candidates: Vec<ColumnRef> = hit.columns().cloned().collect();
                if let Some(column) = self.resolve(frame, &candidates) {
                    return Some(column);
                }
            }
        }
        None
    }

    fn extract_group_column(&self, frame: &mut Frame) -> Option<ColumnRef> {
        for m in GROUP_MARKER.find_iter(&frame.lower) {
            let Some(hit) = frame.hits.iter().find(|h| h.span.0 == m.end()) else { continue };
            let candidates: Vec<ColumnRef> = hit.columns().cloned().collect();
            let column = self.resolve(frame, &candidates).or_else(|| {
                // "orders per user" groups by the foreign key to users.
                let target = hit.tables().next()?;
                let base = self.catalog.table(&frame.base)?;
                base.foreign_keys
                    .iter()
                    .find(|fk| fk.referenced_table.eq_ignore_ascii_case(target))
                    .map(|fk| ColumnRef::new(&base.name, &fk.column))
            });
            if let Some(column) = column {
                frame.slots.push(
                    Slot::new(SlotRole::Column, SlotValue::Text(column.column.clone()), hit.span)
                        .bound_to(column.clone()),
                );
                return Some(column);
            }
        }
        None
    }

    fn extract_aggregate(&self, frame: &mut Frame) -> AggregateOp {
        let matches: Vec<(String, Span)> = AGGREGATE
            .find_iter(&frame.lower)
            .map(|m| (m.as_str().to_string(), (m.start(), m.end())))
            .collect();
        let chosen = matches
            .iter()
            .find(|(w, s)| !(w == "total" && frame.lower[s.1..].starts_with(" amount")))
            .or_else(|| matches.first())
            .cloned();
        let (word, cue) = chosen.unwrap_or_else(|| ("sum".to_string(), (0, 0)));
        let op = match word.as_str() {
            "average" | "avg" | "mean" => AggregateOp::Avg,
            "maximum" | "max" => AggregateOp::Max,
            "minimum" | "min" => AggregateOp::Min,
            _ => AggregateOp::Sum,
        };

        let numeric_hits: Vec<(Span, Vec<ColumnRef>)> = frame
            .hits
            .iter()
            .map(|h| {
                let cols: Vec<ColumnRef> = h
                    .columns()
                    .filter(|c| self.catalog.column(&c.table, &c.column).map_or(false, |s| s.is_numeric()))
                    .cloned()
                    .collect();
                (h.span, cols)
            })
            .filter(|(_, cols)| !cols.is_empty())
            .collect();

        let target = numeric_hits
            .iter()
            .filter(|(span, _)| span.0 >= cue.0)
            .chain(numeric_hits.iter())
            .find_map(|(span, cols)| self.resolve(frame, cols).map(|c| (c, *span)));

        let target = match target {
            Some(found) => Some(found),
            None => {
                let measure = self
                    .catalog
                    .table(&frame.base)
                    .and_then(|t| t.default_measure().map(|c| ColumnRef::new(&t.name, &c.name)));
                if let Some(ref column) = measure {
                    frame
                        .unresolved
                        .push(format!("assumed {} for '{}'", column.column, word));
                }
                measure.map(|c| (c, cue))
            }
        };

        if let Some((column, span)) = target {
            frame.slots.push(
                Slot::new(SlotRole::Column, SlotValue::Text(column.column.clone()), span).bound_to(column),
            );
        }
        op
    }
}

enum NumericPhrase {
    Compare { phrase: Span, value: Span },
    Plus { span: Span, value: Span },
    Between { start: usize, low: Span, and: Span, high: Span },
    Year { span: Span, year: i32 },
    Limit { span: Span, value: u32 },
    Loose(Span),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PatternMatcher;

    fn extract(question: &str) -> Result<Extraction> {
        let catalog = Arc::new(SchemaCatalog::storefront());
        let lexicon = Arc::new(Lexicon::from_catalog(&catalog));
        let matcher = PatternMatcher::with_lexicon(lexicon.clone(), 1);
        let extractor = SlotExtractor::new(catalog, lexicon, 10);
        let m = matcher.match_question(question).expect("template");
        extractor.extract(question, &m)
    }

    #[test]
    fn test_count_users() {
        let ex = extract("How many users do we have?").unwrap();
        assert_eq!(ex.intent, QueryIntent::Count);
        assert_eq!(ex.base_table(), Some("users"));
        assert!(ex.filters().is_empty());
        assert!(!ex.is_partial());
    }

    #[test]
    fn test_category_value() {
        let ex = extract("Show me all products in the Electronics category").unwrap();
        assert_eq!(ex.intent, QueryIntent::Filter);
        assert!(ex.wants_all);
        assert_eq!(
            ex.filters(),
            vec![Filter {
                column: ColumnRef::new("products", "category"),
                comparator: "=".to_string(),
                value: SlotValue::Text("Electronics".to_string()),
            }]
        );
    }

    #[test]
    fn test_superlative_order_and_default_limit() {
        let ex = extract("Which are the most expensive products?").unwrap();
        assert_eq!(ex.intent, QueryIntent::TopN { n: 10, order: SortOrder::Desc });
        assert_eq!(ex.order(), Some((ColumnRef::new("products", "price"), SortOrder::Desc)));
        assert_eq!(ex.limit(), None);
        assert!(!ex.is_partial());
    }

    #[test]
    fn test_explicit_limit_and_cheapest() {
        let ex = extract("Show the 5 cheapest products").unwrap();
        assert_eq!(ex.intent, QueryIntent::TopN { n: 5, order: SortOrder::Asc });
        assert_eq!(ex.limit(), Some(5));
    }

    #[test]
    fn test_comparator_with_hint() {
        let ex = extract("Find users older than 30").unwrap();
        assert_eq!(
            ex.filters(),
            vec![Filter {
                column: ColumnRef::new("users", "age"),
                comparator: ">".to_string(),
                value: SlotValue::Number(30.0),
            }]
        );
        assert!(!ex.is_partial());
    }

    #[test]
    fn test_comparator_with_unit_is_partial() {
        let ex = extract("Show products under $50 dollars").unwrap();
        let filters = ex.filters();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].column, ColumnRef::new("products", "price"));
        assert_eq!(filters[0].comparator, "<");
        assert!(ex.is_partial());
    }

    #[test]
    fn test_between_range() {
        let ex = extract("List products with price between 20 and 50").unwrap();
        let filters = ex.filters();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].comparator, ">=");
        assert_eq!(filters[0].value, SlotValue::Number(20.0));
        assert_eq!(filters[1].comparator, "<=");
        assert_eq!(filters[1].value, SlotValue::Number(50.0));
        assert!(!ex.is_partial());
    }

    #[test]
    fn test_earliest_table_wins_and_joins_through_fk() {
        let ex = extract("How many orders contain Electronics products?").unwrap();
        assert_eq!(ex.base_table(), Some("orders"));
        assert_eq!(ex.filters()[0].column, ColumnRef::new("products", "category"));
        let tables: Vec<&str> = ex
            .slots
            .iter()
            .filter(|s| s.role == SlotRole::Table)
            .filter_map(|s| s.value.as_text())
            .collect();
        assert_eq!(tables, vec!["orders", "products"]);
    }

    #[test]
    fn test_group_column() {
        let ex = extract("How many products per category?").unwrap();
        assert_eq!(ex.intent, QueryIntent::GroupBy { column: "category".to_string() });
        assert_eq!(ex.target_column(), Some(&ColumnRef::new("products", "category")));
    }

    #[test]
    fn test_group_by_foreign_key() {
        let ex = extract("How many orders per user?").unwrap();
        assert_eq!(ex.target_column(), Some(&ColumnRef::new("orders", "user_id")));
    }

    #[test]
    fn test_aggregate_column() {
        let ex = extract("What is the average price of products?").unwrap();
        assert_eq!(ex.intent, QueryIntent::Aggregate { op: AggregateOp::Avg });
        assert_eq!(ex.target_column(), Some(&ColumnRef::new("products", "price")));
        assert!(!ex.is_partial());
    }

    #[test]
    fn test_revenue_is_sum_of_total_amount() {
        let ex = extract("What is the total revenue from completed orders?").unwrap();
        assert_eq!(ex.intent, QueryIntent::Aggregate { op: AggregateOp::Sum });
        assert_eq!(ex.target_column(), Some(&ColumnRef::new("orders", "total_amount")));
        assert_eq!(ex.filters()[0].value, SlotValue::Text("completed".to_string()));
    }

    #[test]
    fn test_equality_extends_capitalised_words() {
        let ex = extract("Find users whose city is New York").unwrap();
        assert_eq!(
            ex.filters(),
            vec![Filter {
                column: ColumnRef::new("users", "city"),
                comparator: "=".to_string(),
                value: SlotValue::Text("New York".to_string()),
            }]
        );
    }

    #[test]
    fn test_named_is_like_and_hides_inner_terms() {
        let ex = extract("Show products named \"Book Lamp\"").unwrap();
        let filters = ex.filters();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].comparator, "LIKE");
        assert_eq!(filters[0].value, SlotValue::Text("%Book Lamp%".to_string()));
    }

    #[test]
    fn test_year_range() {
        let ex = extract("List orders in 2024").unwrap();
        let filters = ex.filters();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].column, ColumnRef::new("orders", "order_date"));
        assert_eq!(filters[0].value, SlotValue::Text("2024-01-01".to_string()));
        assert_eq!(filters[1].comparator, "<");
        assert_eq!(filters[1].value, SlotValue::Text("2025-01-01".to_string()));
    }

    #[test]
    fn test_missing_required_order_is_error() {
        let err = extract("Which users are the most active?").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Extraction {
                missing: SlotRole::Order,
                ..
            }
        ));
    }

    #[test]
    fn test_most_recent_orders_by_date() {
        let ex = extract("Show the most recent orders").unwrap();
        assert_eq!(ex.order(), Some((ColumnRef::new("orders", "order_date"), SortOrder::Desc)));
        assert!(!ex.is_partial());

        let ex = extract("List the 5 most recent orders").unwrap();
        assert_eq!(ex.intent, QueryIntent::TopN { n: 5, order: SortOrder::Desc });

        let ex = extract("Who are the most recent users?").unwrap();
        assert_eq!(ex.order(), Some((ColumnRef::new("users", "created_at"), SortOrder::Desc)));
    }

    #[test]
    fn test_least_recent_reverses_order() {
        let ex = extract("Show the least recent orders").unwrap();
        assert_eq!(ex.order(), Some((ColumnRef::new("orders", "order_date"), SortOrder::Asc)));
    }

    #[test]
    fn test_best_selling_orders_by_quantity() {
        let ex = extract("What are the best selling products?").unwrap();
        assert_eq!(ex.base_table(), Some("products"));
        assert_eq!(ex.order(), Some((ColumnRef::new("order_items", "quantity"), SortOrder::Desc)));
        assert!(!ex.is_partial());
    }

    #[test]
    fn test_unused_words_make_match_partial() {
        let ex = extract("Find customers in Paris").unwrap();
        assert_eq!(ex.base_table(), Some("users"));
        assert_eq!(ex.unresolved, vec!["ignored 'Paris'".to_string()]);

        let ex = extract("Show users from San Diego").unwrap();
        assert_eq!(ex.unresolved, vec!["ignored 'San Diego'".to_string()]);
    }

    #[test]
    fn test_status_aliases() {
        for question in ["List shipped orders", "Show orders that are done"] {
            let ex = extract(question).unwrap();
            assert_eq!(ex.filters()[0].column, ColumnRef::new("orders", "status"), "{}", question);
            assert_eq!(ex.filters()[0].value, SlotValue::Text("completed".to_string()), "{}", question);
            assert!(!ex.is_partial(), "{}", question);
        }
    }

    #[test]
    fn test_plus_suffix() {
        let ex = extract("Show products $500+").unwrap();
        assert_eq!(
            ex.filters(),
            vec![Filter {
                column: ColumnRef::new("products", "price"),
                comparator: ">".to_string(),
                value: SlotValue::Number(500.0),
            }]
        );
    }

    #[test]
    fn test_slots_are_in_scan_order() {
        let ex = extract("Show pending orders over 100").unwrap();
        let starts: Vec<usize> = ex.slots.iter().map(|s| s.span.0).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }
}
