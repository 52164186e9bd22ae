//! Query intents and extracted slots.

use crate::catalog::ColumnRef;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateOp {
    pub fn sql(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "SUM",
            AggregateOp::Avg => "AVG",
            AggregateOp::Min => "MIN",
            AggregateOp::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            SortOrder::Asc => SortOrder::Desc,
            SortOrder::Desc => SortOrder::Asc,
        }
    }
}

/// What the question asks for, resolved once slots are known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryIntent {
    Count,
    List,
    Aggregate { op: AggregateOp },
    Filter,
    TopN { n: u32, order: SortOrder },
    GroupBy { column: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotRole {
    Table,
    Column,
    Value,
    Comparator,
    Limit,
    Order,
}

impl fmt::Display for SlotRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotRole::Table => "TABLE",
            SlotRole::Column => "COLUMN",
            SlotRole::Value => "VALUE",
            SlotRole::Comparator => "COMPARATOR",
            SlotRole::Limit => "LIMIT",
            SlotRole::Order => "ORDER",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotValue {
    Text(String),
    Number(f64),
}

impl SlotValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SlotValue::Text(s) => Some(s),
            SlotValue::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            SlotValue::Number(n) => Some(*n),
            SlotValue::Text(_) => None,
        }
    }

    /// SQL literal: numbers bare, text single-quoted with quotes doubled.
    pub fn to_sql_literal(&self) -> String {
        match self {
            SlotValue::Number(n) => format_number(*n),
            SlotValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SlotValue::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                serde_json::json!(*n as i64)
            }
            SlotValue::Number(n) => serde_json::json!(n),
            SlotValue::Text(s) => serde_json::json!(s),
        }
    }
}

impl fmt::Display for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotValue::Number(n) => write!(f, "{}", format_number(*n)),
            SlotValue::Text(s) => write!(f, "{}", s),
        }
    }
}

fn format_number(n: f64) -> String {
    format!("{}", n)
}

/// Byte offsets into the original question.
pub type Span = (usize, usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub role: SlotRole,
    pub value: SlotValue,
    pub span: Span,
    /// Column a comparator, value, order or column slot refers to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<ColumnRef>,
}

impl Slot {
    pub fn new(role: SlotRole, value: SlotValue, span: Span) -> Self {
        Self {
            role,
            value,
            span,
            column: None,
        }
    }

    pub fn bound_to(mut self, column: ColumnRef) -> Self {
        self.column = Some(column);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals() {
        assert_eq!(SlotValue::Number(100.0).to_sql_literal(), "100");
        assert_eq!(SlotValue::Number(49.99).to_sql_literal(), "49.99");
        assert_eq!(SlotValue::Text("O'Brien".to_string()).to_sql_literal(), "'O''Brien'");
    }

    #[test]
    fn test_intent_serialization() {
        let json = serde_json::to_value(QueryIntent::TopN { n: 10, order: SortOrder::Desc }).unwrap();
        assert_eq!(json["kind"], "TOP_N");
        assert_eq!(json["order"], "DESC");
        assert_eq!(SlotValue::Number(5.0).to_json(), serde_json::json!(5));
    }
}
