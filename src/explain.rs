//! Human-readable explanations attached to every translation.

use crate::extractor::{Extraction, Filter};
use crate::intent::{AggregateOp, QueryIntent, SortOrder};
use crate::validator::Rejection;

pub const MODEL_CAVEAT: &str =
    "Generated by the language model from the schema; review it before running it on important data.";

fn condition(filter: &Filter) -> String {
    let value = filter.value.to_string();
    let phrase = match filter.comparator.as_str() {
        "=" => format!("is {}", value),
        ">" => format!("is greater than {}", value),
        "<" => format!("is less than {}", value),
        ">=" => format!("is at least {}", value),
        "<=" => format!("is at most {}", value),
        "LIKE" => format!("contains '{}'", value.trim_matches('%')),
        other => format!("{} {}", other, value),
    };
    format!("{} {}", filter.column.column, phrase)
}

fn conditions(filters: &[Filter]) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = filters.iter().map(condition).collect();
    format!(" where {}", parts.join(" and "))
}

/// One sentence describing what a rule-compiled query does.
pub fn describe_rule(extraction: &Extraction) -> String {
    let table = extraction.base_table().unwrap_or("the table");
    let filters = conditions(&extraction.filters());
    let column = extraction
        .target_column()
        .map(|c| c.column.as_str())
        .unwrap_or("value");

    match &extraction.intent {
        QueryIntent::Count => format!("Counting rows in {}{}.", table, filters),
        QueryIntent::List => format!("Listing {}.", table),
        QueryIntent::Filter => format!("Listing {}{}.", table, filters),
        QueryIntent::Aggregate { op } => {
            let what = match op {
                AggregateOp::Sum => "total",
                AggregateOp::Avg => "average",
                AggregateOp::Min => "minimum",
                AggregateOp::Max => "maximum",
            };
            format!("Computing the {} {} of {}{}.", what, column, table, filters)
        }
        QueryIntent::TopN { n, order } => {
            let (by, direction) = match extraction.order() {
                // Columns of a joined table are summed per row.
                Some((c, _)) if !c.table.eq_ignore_ascii_case(table) => {
                    (format!("total {}", c.column.trim_start_matches("total_").replace('_', " ")), order)
                }
                Some((c, _)) => (c.column, order),
                None => (column.to_string(), order),
            };
            let direction = match direction {
                SortOrder::Desc => "highest first",
                SortOrder::Asc => "lowest first",
            };
            format!("Top {} {} by {}, {}{}.", n, table, by, direction, filters.replacen(" where", ", where", 1))
        }
        QueryIntent::GroupBy { column } => format!("Counting {} per {}{}.", table, column, filters),
    }
}

/// Appended when the rule engine had to assume or skip part of the question.
pub fn partial_caveat(unresolved: &[String]) -> String {
    format!(" Partly matched: {}.", unresolved.join("; "))
}

pub fn refusal(rejection: Option<&Rejection>) -> String {
    match rejection {
        Some(r) => format!("No safe query could be produced: {}.", r),
        None => "The question could not be translated into a query for this schema.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnRef;
    use crate::intent::{Slot, SlotRole, SlotValue};

    fn extraction(intent: QueryIntent, slots: Vec<Slot>) -> Extraction {
        Extraction {
            intent,
            slots,
            unresolved: Vec::new(),
            wants_all: false,
        }
    }

    fn table(name: &str) -> Slot {
        Slot::new(SlotRole::Table, SlotValue::Text(name.to_string()), (0, 1))
    }

    #[test]
    fn test_count_description() {
        let ex = extraction(QueryIntent::Count, vec![table("users")]);
        assert_eq!(describe_rule(&ex), "Counting rows in users.");
    }

    #[test]
    fn test_filter_description() {
        let column = ColumnRef::new("products", "category");
        let ex = extraction(
            QueryIntent::Filter,
            vec![
                table("products"),
                Slot::new(SlotRole::Comparator, SlotValue::Text("=".to_string()), (5, 9)).bound_to(column.clone()),
                Slot::new(SlotRole::Value, SlotValue::Text("Electronics".to_string()), (5, 9)).bound_to(column),
            ],
        );
        assert_eq!(describe_rule(&ex), "Listing products where category is Electronics.");
    }

    #[test]
    fn test_top_n_description() {
        let ex = extraction(
            QueryIntent::TopN { n: 10, order: SortOrder::Desc },
            vec![
                table("products"),
                Slot::new(SlotRole::Order, SlotValue::Text("DESC".to_string()), (3, 7))
                    .bound_to(ColumnRef::new("products", "price")),
            ],
        );
        assert_eq!(describe_rule(&ex), "Top 10 products by price, highest first.");
    }

    #[test]
    fn test_top_n_over_joined_column_description() {
        let ex = extraction(
            QueryIntent::TopN { n: 5, order: SortOrder::Desc },
            vec![
                table("products"),
                Slot::new(SlotRole::Order, SlotValue::Text("DESC".to_string()), (3, 7))
                    .bound_to(ColumnRef::new("order_items", "quantity")),
            ],
        );
        assert_eq!(describe_rule(&ex), "Top 5 products by total quantity, highest first.");
    }
}
