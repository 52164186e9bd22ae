//! SQL Validator
//!
//! Gatekeeper run on every candidate regardless of origin. A raw-text scan
//! catches comments, stacked statements and well-known injection payloads; the
//! statement is then parsed with sqlparser and walked so that every table and
//! column it names is checked against the catalog.

use crate::catalog::SchemaCatalog;
use crate::error::{EngineError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Ident, Join, JoinConstraint, JoinOperator, Query,
    Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref INJECTION_PATTERNS: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"\bunion\s+(?:all\s+)?select\b").unwrap(), "UNION SELECT"),
        (Regex::new(r"\bor\s+(\d+)\s*=\s*(\d+)\b").unwrap(), "tautology"),
        (
            Regex::new(r"\b(?:sleep|pg_sleep|benchmark|load_file|randomblob)\s*\(").unwrap(),
            "time or file function",
        ),
        (Regex::new(r"\bwaitfor\s+delay\b").unwrap(), "WAITFOR DELAY"),
        (Regex::new(r"\binto\s+(?:outfile|dumpfile)\b").unwrap(), "file write"),
        (Regex::new(r"\b(?:attach|detach)\s+(?:database\b|')").unwrap(), "ATTACH DATABASE"),
        (Regex::new(r"\bpragma\b").unwrap(), "PRAGMA"),
    ];
}

/// Scalar and aggregate functions a generated query may call.
const ALLOWED_FUNCTIONS: &[&str] = &[
    "COUNT", "SUM", "AVG", "MIN", "MAX", "ROUND", "LOWER", "UPPER", "LENGTH", "COALESCE", "ABS", "DATE",
    "STRFTIME", "SUBSTR", "TRIM", "IFNULL",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionKind {
    UnknownTable,
    UnknownColumn,
    DisallowedStatement,
    MultiStatement,
    InjectionPattern,
    ExcessiveComplexity,
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectionKind::UnknownTable => "UNKNOWN_TABLE",
            RejectionKind::UnknownColumn => "UNKNOWN_COLUMN",
            RejectionKind::DisallowedStatement => "DISALLOWED_STATEMENT",
            RejectionKind::MultiStatement => "MULTI_STATEMENT",
            RejectionKind::InjectionPattern => "INJECTION_PATTERN",
            RejectionKind::ExcessiveComplexity => "EXCESSIVE_COMPLEXITY",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub detail: String,
}

impl Rejection {
    fn new(kind: RejectionKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.detail, self.kind)
    }
}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::Validation {
            kind: r.kind,
            detail: r.detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationVerdict {
    pub accepted: bool,
    pub reason: Option<Rejection>,
}

impl ValidationVerdict {
    fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn reject(rejection: Rejection) -> Self {
        Self {
            accepted: false,
            reason: Some(rejection),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.reason {
            Some(rejection) => Err(rejection.into()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorLimits {
    pub max_joins: usize,
    pub max_subquery_depth: usize,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            max_joins: 3,
            max_subquery_depth: 1,
        }
    }
}

pub struct SqlValidator {
    catalog: Arc<SchemaCatalog>,
    limits: ValidatorLimits,
}

type Check<T = ()> = std::result::Result<T, Rejection>;

impl SqlValidator {
    pub fn new(catalog: Arc<SchemaCatalog>, limits: ValidatorLimits) -> Self {
        Self { catalog, limits }
    }

    pub fn validate(&self, sql: &str) -> ValidationVerdict {
        match self.check(sql) {
            Ok(()) => {
                debug!("Validator accepted: {}", sql);
                ValidationVerdict::accept()
            }
            Err(rejection) => {
                debug!("Validator rejected {}: {}", rejection.kind, rejection.detail);
                ValidationVerdict::reject(rejection)
            }
        }
    }

    fn check(&self, sql: &str) -> Check {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(Rejection::new(RejectionKind::DisallowedStatement, "empty statement"));
        }
        scan_raw(trimmed)?;

        let statements = Parser::parse_sql(&GenericDialect {}, trimmed)
            .map_err(|e| Rejection::new(RejectionKind::DisallowedStatement, format!("unparseable SQL: {}", e)))?;
        match statements.as_slice() {
            [] => Err(Rejection::new(RejectionKind::DisallowedStatement, "empty statement")),
            [Statement::Query(query)] => {
                let mut walker = Walker {
                    catalog: &self.catalog,
                    limits: self.limits,
                    scopes: Vec::new(),
                };
                walker.query(query, 0).map(|_| ())
            }
            [_] => Err(Rejection::new(RejectionKind::DisallowedStatement, "only SELECT statements are allowed")),
            _ => Err(Rejection::new(RejectionKind::MultiStatement, "more than one statement")),
        }
    }
}

/// Replace the contents of single-quoted literals so that payload words and
/// punctuation inside strings do not trip the raw scan.
fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;
    while let Some(c) = chars.next() {
        if in_literal {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push_str("__");
                    continue;
                }
                in_literal = false;
                out.push(c);
            } else {
                out.push('_');
            }
        } else {
            if c == '\'' {
                in_literal = true;
            }
            out.push(c);
        }
    }
    out
}

fn scan_raw(sql: &str) -> Check {
    let masked = mask_literals(sql).to_ascii_lowercase();
    for token in ["--", "/*", "*/", "#"] {
        if masked.contains(token) {
            return Err(Rejection::new(
                RejectionKind::InjectionPattern,
                format!("comment token '{}'", token),
            ));
        }
    }

    let body = masked.trim_end().strip_suffix(';').unwrap_or(&masked);
    if body.contains(';') {
        return Err(Rejection::new(RejectionKind::MultiStatement, "statement separator inside the query"));
    }

    for (pattern, label) in INJECTION_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(body) {
            // Only trivially true comparisons count as a tautology.
            if let (Some(a), Some(b)) = (caps.get(1), caps.get(2)) {
                if a.as_str() != b.as_str() {
                    continue;
                }
            }
            return Err(Rejection::new(RejectionKind::InjectionPattern, format!("{} pattern", label)));
        }
    }
    Ok(())
}

enum Source {
    Table(String),
    /// Output column names of a derived table, lower-cased.
    Derived(Vec<String>),
}

struct Binding {
    name: String,
    source: Source,
}

#[derive(Default)]
struct Scope {
    bindings: Vec<Binding>,
    /// Select-list aliases, usable in WHERE / ORDER BY as SQLite allows.
    aliases: Vec<String>,
}

struct Walker<'a> {
    catalog: &'a SchemaCatalog,
    limits: ValidatorLimits,
    scopes: Vec<Scope>,
}

impl Walker<'_> {
    /// Walk a query at subquery `depth`, returning its output column names.
    fn query(&mut self, query: &Query, depth: usize) -> Check<Vec<String>> {
        if depth > self.limits.max_subquery_depth {
            return Err(Rejection::new(
                RejectionKind::ExcessiveComplexity,
                format!("subquery nesting deeper than {}", self.limits.max_subquery_depth),
            ));
        }
        if query.with.is_some() {
            return Err(Rejection::new(RejectionKind::DisallowedStatement, "WITH clauses are not allowed"));
        }

        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            SetExpr::SetOperation { op, .. } => {
                return Err(Rejection::new(
                    RejectionKind::DisallowedStatement,
                    format!("set operation {} is not allowed", op),
                ))
            }
            other => {
                return Err(Rejection::new(
                    RejectionKind::DisallowedStatement,
                    format!("unsupported query body: {}", other),
                ))
            }
        };

        self.scopes.push(Scope::default());
        let result = self.select(select, depth).and_then(|outputs| {
            for order in &query.order_by {
                self.expr(&order.expr, depth)?;
            }
            if let Some(limit) = &query.limit {
                self.expr(limit, depth)?;
            }
            if let Some(offset) = &query.offset {
                self.expr(&offset.value, depth)?;
            }
            Ok(outputs)
        });
        self.scopes.pop();
        result
    }

    fn select(&mut self, select: &Select, depth: usize) -> Check<Vec<String>> {
        if select.into.is_some() {
            return Err(Rejection::new(RejectionKind::DisallowedStatement, "SELECT INTO is not allowed"));
        }

        // Comma-separated FROM items are joins too and share the FK check.
        let mut joins = select.from.len().saturating_sub(1);
        let mut joined: Vec<String> = Vec::new();
        for from in &select.from {
            joins += self.from_item(from, depth, &mut joined)?;
        }
        if joins > self.limits.max_joins {
            return Err(Rejection::new(
                RejectionKind::ExcessiveComplexity,
                format!("{} joins exceed the limit of {}", joins, self.limits.max_joins),
            ));
        }

        let aliases: Vec<String> = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_ascii_lowercase()),
                _ => None,
            })
            .collect();
        if let Some(scope) = self.scopes.last_mut() {
            scope.aliases = aliases;
        }

        let mut outputs = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    self.expr(expr, depth)?;
                    outputs.push(output_name(expr));
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.expr(expr, depth)?;
                    outputs.push(alias.value.to_ascii_lowercase());
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = name.0.last().map(|i| i.value.as_str()).unwrap_or_default();
                    outputs.extend(self.binding_columns(Some(qualifier))?);
                }
                SelectItem::Wildcard(_) => outputs.extend(self.binding_columns(None)?),
            }
        }

        if let Some(selection) = &select.selection {
            self.expr(selection, depth)?;
        }
        if let GroupByExpr::Expressions(exprs) = &select.group_by {
            for expr in exprs {
                self.expr(expr, depth)?;
            }
        }
        if let Some(having) = &select.having {
            self.expr(having, depth)?;
        }
        Ok(outputs)
    }

    /// Bind one FROM item and its joins; returns the number of joins.
    /// `joined` holds the catalog tables already in the FROM clause.
    fn from_item(&mut self, from: &TableWithJoins, depth: usize, joined: &mut Vec<String>) -> Check<usize> {
        let (table, mut count) = self.bind(&from.relation, depth)?;
        if let Some(table) = table {
            self.follows_foreign_key(joined, &table)?;
            joined.push(table);
        }

        for join in &from.joins {
            count += 1;
            self.join(join, depth, joined, &mut count)?;
        }
        Ok(count)
    }

    /// A table may only enter the FROM clause through a foreign key to a
    /// table already there.
    fn follows_foreign_key(&self, joined: &[String], table: &str) -> Check {
        if !joined.is_empty() && !joined.iter().any(|t| self.catalog.adjacent(t, table)) {
            return Err(Rejection::new(
                RejectionKind::ExcessiveComplexity,
                format!("join to {} does not follow a foreign key", table),
            ));
        }
        Ok(())
    }

    fn join(&mut self, join: &Join, depth: usize, joined: &mut Vec<String>, count: &mut usize) -> Check {
        let constraint = match &join.join_operator {
            JoinOperator::Inner(c) | JoinOperator::LeftOuter(c) | JoinOperator::RightOuter(c) | JoinOperator::FullOuter(c) => c,
            JoinOperator::CrossJoin => {
                return Err(Rejection::new(RejectionKind::ExcessiveComplexity, "CROSS JOIN is not allowed"))
            }
            _ => return Err(Rejection::new(RejectionKind::DisallowedStatement, "unsupported join type")),
        };

        let (table, nested) = self.bind(&join.relation, depth)?;
        *count += nested;
        if let Some(table) = table {
            self.follows_foreign_key(joined, &table)?;
            joined.push(table);
        }

        match constraint {
            JoinConstraint::On(expr) => self.expr(expr, depth),
            JoinConstraint::Using(idents) => {
                for ident in idents {
                    self.column(None, ident)?;
                }
                Ok(())
            }
            JoinConstraint::Natural | JoinConstraint::None => Ok(()),
        }
    }

    /// Returns the catalog table bound (if any) and the joins nested inside.
    fn bind(&mut self, factor: &TableFactor, depth: usize) -> Check<(Option<String>, usize)> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let raw = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
                let table = self
                    .catalog
                    .table(&raw)
                    .map(|t| t.name.clone())
                    .ok_or_else(|| Rejection::new(RejectionKind::UnknownTable, format!("unknown table '{}'", name)))?;
                let binding = alias.as_ref().map(|a| a.name.value.clone()).unwrap_or_else(|| table.clone());
                self.push_binding(binding, Source::Table(table.clone()));
                Ok((Some(table), 0))
            }
            TableFactor::Derived { subquery, alias, .. } => {
                let outputs = {
                    let saved = std::mem::take(&mut self.scopes);
                    let result = self.query(subquery, depth + 1);
                    self.scopes = saved;
                    result?
                };
                let binding = alias.as_ref().map(|a| a.name.value.clone()).unwrap_or_default();
                self.push_binding(binding, Source::Derived(outputs));
                Ok((None, 0))
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                let joins = self.from_item(table_with_joins, depth, &mut Vec::new())?;
                Ok((None, joins))
            }
            other => Err(Rejection::new(
                RejectionKind::DisallowedStatement,
                format!("unsupported FROM item: {}", other),
            )),
        }
    }

    fn push_binding(&mut self, name: String, source: Source) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.bindings.push(Binding {
                name: name.to_ascii_lowercase(),
                source,
            });
        }
    }

    fn binding_has(&self, binding: &Binding, column: &str) -> bool {
        match &binding.source {
            Source::Table(table) => self.catalog.has_column(table, column),
            Source::Derived(outputs) => outputs.iter().any(|o| o.eq_ignore_ascii_case(column)),
        }
    }

    fn find_binding(&self, qualifier: &str) -> Option<&Binding> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|s| s.bindings.iter())
            .find(|b| b.name.eq_ignore_ascii_case(qualifier))
    }

    fn binding_columns(&self, qualifier: Option<&str>) -> Check<Vec<String>> {
        let columns_of = |binding: &Binding| -> Vec<String> {
            match &binding.source {
                Source::Table(table) => self
                    .catalog
                    .table(table)
                    .map(|t| t.columns.iter().map(|c| c.name.to_ascii_lowercase()).collect())
                    .unwrap_or_default(),
                Source::Derived(outputs) => outputs.clone(),
            }
        };
        match qualifier {
            Some(q) => self
                .find_binding(q)
                .map(columns_of)
                .ok_or_else(|| Rejection::new(RejectionKind::UnknownTable, format!("'{}' is not in the FROM clause", q))),
            None => Ok(self
                .scopes
                .last()
                .map(|s| s.bindings.iter().flat_map(columns_of).collect())
                .unwrap_or_default()),
        }
    }

    fn column(&self, qualifier: Option<&Ident>, column: &Ident) -> Check {
        let name = column.value.as_str();
        match qualifier {
            Some(q) => {
                let binding = self.find_binding(&q.value).ok_or_else(|| {
                    Rejection::new(
                        RejectionKind::UnknownTable,
                        format!("'{}' is not in the FROM clause", q.value),
                    )
                })?;
                if self.binding_has(binding, name) {
                    Ok(())
                } else {
                    Err(Rejection::new(
                        RejectionKind::UnknownColumn,
                        format!("unknown column '{}.{}'", q.value, name),
                    ))
                }
            }
            None => {
                let known = self.scopes.iter().any(|s| {
                    s.bindings.iter().any(|b| self.binding_has(b, name))
                        || s.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
                });
                if known {
                    Ok(())
                } else {
                    Err(Rejection::new(RejectionKind::UnknownColumn, format!("unknown column '{}'", name)))
                }
            }
        }
    }

    fn subquery(&mut self, query: &Query, depth: usize) -> Check {
        self.query(query, depth + 1).map(|_| ())
    }

    fn expr(&mut self, expr: &Expr, depth: usize) -> Check {
        match expr {
            Expr::Identifier(ident) => self.column(None, ident),
            Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [.., table, column] => self.column(Some(table), column),
                [column] => self.column(None, column),
                [] => Ok(()),
            },
            Expr::Value(_) | Expr::TypedString { .. } => Ok(()),
            Expr::BinaryOp { left, right, .. } => {
                self.expr(left, depth)?;
                self.expr(right, depth)
            }
            Expr::UnaryOp { expr, .. }
            | Expr::Nested(expr)
            | Expr::IsNull(expr)
            | Expr::IsNotNull(expr)
            | Expr::IsTrue(expr)
            | Expr::IsFalse(expr)
            | Expr::Cast { expr, .. } => self.expr(expr, depth),
            Expr::InList { expr, list, .. } => {
                self.expr(expr, depth)?;
                for item in list {
                    self.expr(item, depth)?;
                }
                Ok(())
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr, depth)?;
                self.subquery(subquery, depth)
            }
            Expr::Between { expr, low, high, .. } => {
                self.expr(expr, depth)?;
                self.expr(low, depth)?;
                self.expr(high, depth)
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                self.expr(expr, depth)?;
                self.expr(pattern, depth)
            }
            Expr::Function(function) => {
                let name = function.name.to_string().to_ascii_uppercase();
                if !ALLOWED_FUNCTIONS.contains(&name.as_str()) {
                    return Err(Rejection::new(
                        RejectionKind::DisallowedStatement,
                        format!("function {} is not allowed", name),
                    ));
                }
                for arg in &function.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                        | FunctionArg::Named { arg: FunctionArgExpr::Expr(e), .. } => self.expr(e, depth)?,
                        FunctionArg::Unnamed(FunctionArgExpr::QualifiedWildcard(name))
                        | FunctionArg::Named { arg: FunctionArgExpr::QualifiedWildcard(name), .. } => {
                            let qualifier = name.0.last().map(|i| i.value.as_str()).unwrap_or_default();
                            self.binding_columns(Some(qualifier))?;
                        }
                        _ => {}
                    }
                }
                Ok(())
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.expr(operand, depth)?;
                }
                for e in conditions.iter().chain(results.iter()) {
                    self.expr(e, depth)?;
                }
                if let Some(e) = else_result {
                    self.expr(e, depth)?;
                }
                Ok(())
            }
            Expr::Subquery(query) | Expr::Exists { subquery: query, .. } => self.subquery(query, depth),
            other => Err(Rejection::new(
                RejectionKind::DisallowedStatement,
                format!("unsupported expression: {}", other),
            )),
        }
    }
}

fn output_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.to_ascii_lowercase(),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_ascii_lowercase()).unwrap_or_default(),
        other => other.to_string().to_ascii_lowercase(),
    }
}
