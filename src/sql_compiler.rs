//! SQL Compiler
//!
//! Fills the skeleton of the winning template with extracted slots. Joins
//! come from foreign-key paths between the base table and every other table a
//! slot refers to; values are rendered as escaped literals and also returned
//! as named parameters.

use crate::arbiter::{CandidateQuery, Origin};
use crate::catalog::{ColumnRef, JoinStep, SchemaCatalog};
use crate::error::{EngineError, Result};
use crate::explain;
use crate::extractor::Extraction;
use crate::intent::{QueryIntent, SlotRole};
use crate::matcher::TemplateMatch;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const FULL_RULE_CONFIDENCE: f64 = 1.0;
pub const PARTIAL_RULE_CONFIDENCE: f64 = 0.6;

pub struct SqlCompiler {
    catalog: Arc<SchemaCatalog>,
}

impl SqlCompiler {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self { catalog }
    }

    pub fn compile(&self, template: &TemplateMatch, extraction: &Extraction) -> Result<CandidateQuery> {
        let missing = |role| EngineError::Extraction {
            template: template.name,
            missing: role,
        };

        let base = extraction
            .base_table()
            .and_then(|t| self.catalog.table(t))
            .ok_or_else(|| missing(SlotRole::Table))?;

        let filters = extraction.filters();
        let order = extraction.order();
        let target = extraction.target_column().cloned();

        let mut referenced: Vec<&ColumnRef> = filters.iter().map(|f| &f.column).collect();
        referenced.extend(order.as_ref().map(|(c, _)| c));
        referenced.extend(target.as_ref());

        let joins = self.joins_for(&base.name, &referenced).ok_or_else(|| missing(SlotRole::Column))?;
        let qualify = !joins.is_empty();
        let column_sql = |c: &ColumnRef| {
            if qualify {
                c.to_string()
            } else {
                c.column.clone()
            }
        };

        // Ranking base rows by a column of a joined table sums it per base row.
        let ranking = match (&extraction.intent, &order) {
            (QueryIntent::TopN { .. }, Some((column, _))) if !column.table.eq_ignore_ascii_case(&base.name) => {
                let pk = base.primary_key().ok_or_else(|| missing(SlotRole::Order))?;
                Some(Ranking {
                    alias: ranking_alias(column),
                    sum: format!("SUM({})", column),
                    group_by: format!("{}.{}", base.name, pk.name),
                })
            }
            _ => None,
        };

        let projection = match &ranking {
            Some(r) => format!("{}.*, {} AS {}", base.name, r.sum, r.alias),
            None if qualify => format!("DISTINCT {}.*", base.name),
            None => "*".to_string(),
        };
        let group_clause = ranking
            .as_ref()
            .map(|r| format!(" GROUP BY {}", r.group_by))
            .unwrap_or_default();
        let count = match base.primary_key() {
            Some(pk) if qualify => format!("COUNT(DISTINCT {}.{})", base.name, pk.name),
            _ => "COUNT(*)".to_string(),
        };

        let mut from = base.name.clone();
        for step in &joins {
            from.push_str(&format!(" JOIN {} ON {} = {}", step.table, step.left, step.right));
        }

        let mut params: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        params.insert("table".to_string(), serde_json::json!(base.name));

        let conditions: Vec<String> = filters
            .iter()
            .map(|f| {
                params.insert(format!("{} {}", f.column, f.comparator), f.value.to_json());
                format!("{} {} {}", column_sql(&f.column), f.comparator, f.value.to_sql_literal())
            })
            .collect();
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let mut sql = template
            .skeleton
            .replace("{projection}", &projection)
            .replace("{count}", &count)
            .replace("{from}", &from)
            .replace("{where}", &where_clause)
            .replace("{group_clause}", &group_clause);

        match &extraction.intent {
            QueryIntent::TopN { n, order: direction } => {
                let (column, _) = order.as_ref().ok_or_else(|| missing(SlotRole::Order))?;
                params.insert("limit".to_string(), serde_json::json!(n));
                params.insert("column".to_string(), serde_json::json!(column.to_string()));
                let ranked_by = match &ranking {
                    Some(r) => r.alias.clone(),
                    None => column_sql(column),
                };
                sql = sql
                    .replace("{column}", &ranked_by)
                    .replace("{direction}", direction.sql())
                    .replace("{limit}", &n.to_string());
            }
            QueryIntent::Aggregate { op } => {
                let column = target.as_ref().ok_or_else(|| missing(SlotRole::Column))?;
                params.insert("column".to_string(), serde_json::json!(column.to_string()));
                sql = sql
                    .replace("{aggregate}", op.sql())
                    .replace("{column}", &column_sql(column));
            }
            QueryIntent::GroupBy { .. } => {
                let column = target.as_ref().ok_or_else(|| missing(SlotRole::Column))?;
                params.insert("column".to_string(), serde_json::json!(column.to_string()));
                sql = sql.replace("{column}", &column_sql(column));
            }
            _ => {}
        }

        let limit_clause = match extraction.limit() {
            Some(n) if !matches!(extraction.intent, QueryIntent::TopN { .. }) => {
                params.insert("limit".to_string(), serde_json::json!(n));
                format!(" LIMIT {}", n)
            }
            _ => String::new(),
        };
        sql = sql.replace("{limit_clause}", &limit_clause);

        let (confidence, explanation) = if extraction.is_partial() {
            (
                PARTIAL_RULE_CONFIDENCE,
                format!(
                    "{}{}",
                    explain::describe_rule(extraction),
                    explain::partial_caveat(&extraction.unresolved)
                ),
            )
        } else {
            (FULL_RULE_CONFIDENCE, explain::describe_rule(extraction))
        };

        debug!("Compiled '{}' into: {}", template.name, sql);

        Ok(CandidateQuery {
            sql,
            params,
            confidence,
            origin: Origin::Rule,
            explanation,
            intent: Some(extraction.intent.clone()),
        })
    }

    /// Union of the join paths from `base` to every referenced table, each
    /// table joined once. `None` when some table is unreachable.
    fn joins_for(&self, base: &str, referenced: &[&ColumnRef]) -> Option<Vec<JoinStep>> {
        let mut joined: Vec<String> = vec![base.to_ascii_lowercase()];
        let mut steps = Vec::new();
        for column in referenced {
            for step in self.catalog.join_path(base, &column.table)? {
                if joined.contains(&step.table.to_ascii_lowercase()) {
                    continue;
                }
                joined.push(step.table.to_ascii_lowercase());
                steps.push(step);
            }
        }
        Some(steps)
    }
}

struct Ranking {
    alias: String,
    sum: String,
    group_by: String,
}

/// `quantity` -> `total_quantity`, `total_amount` stays as is.
fn ranking_alias(column: &ColumnRef) -> String {
    format!("total_{}", column.column.trim_start_matches("total_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::SlotExtractor;
    use crate::lexicon::Lexicon;
    use crate::matcher::PatternMatcher;

    fn compile(question: &str) -> CandidateQuery {
        let catalog = Arc::new(SchemaCatalog::storefront());
        let lexicon = Arc::new(Lexicon::from_catalog(&catalog));
        let matcher = PatternMatcher::with_lexicon(lexicon.clone(), 1);
        let extractor = SlotExtractor::new(catalog.clone(), lexicon, 10);
        let compiler = SqlCompiler::new(catalog);
        let m = matcher.match_question(question).unwrap();
        let ex = extractor.extract(question, &m).unwrap();
        compiler.compile(&m, &ex).unwrap()
    }

    #[test]
    fn test_count() {
        let q = compile("How many users do we have?");
        assert_eq!(q.sql, "SELECT COUNT(*) FROM users");
        assert_eq!(q.confidence, FULL_RULE_CONFIDENCE);
        assert_eq!(q.origin, Origin::Rule);
        assert_eq!(q.params["table"], serde_json::json!("users"));
    }

    #[test]
    fn test_category_filter() {
        let q = compile("Show me all products in the Electronics category");
        assert_eq!(q.sql, "SELECT * FROM products WHERE category = 'Electronics'");
        assert_eq!(q.params["products.category ="], serde_json::json!("Electronics"));
    }

    #[test]
    fn test_top_n_default_limit() {
        let q = compile("Which are the most expensive products?");
        assert_eq!(q.sql, "SELECT * FROM products ORDER BY price DESC LIMIT 10");
        assert_eq!(q.params["limit"], serde_json::json!(10));
    }

    #[test]
    fn test_explicit_limit_on_list() {
        let q = compile("Show 5 users");
        assert_eq!(q.sql, "SELECT * FROM users LIMIT 5");
    }

    #[test]
    fn test_aggregate() {
        let q = compile("What is the average price of products?");
        assert_eq!(q.sql, "SELECT AVG(price) FROM products");
    }

    #[test]
    fn test_grouped_count() {
        let q = compile("How many products per category?");
        assert_eq!(q.sql, "SELECT category, COUNT(*) FROM products GROUP BY category");
    }

    #[test]
    fn test_join_qualifies_columns() {
        let q = compile("How many orders contain Electronics products?");
        assert_eq!(
            q.sql,
            "SELECT COUNT(DISTINCT orders.id) FROM orders \
             JOIN order_items ON order_items.order_id = orders.id \
             JOIN products ON products.id = order_items.product_id \
             WHERE products.category = 'Electronics'"
        );
    }

    #[test]
    fn test_partial_match_lowers_confidence() {
        let q = compile("Show products under $50");
        assert_eq!(q.sql, "SELECT * FROM products WHERE price < 50");
        assert_eq!(q.confidence, PARTIAL_RULE_CONFIDENCE);
        assert!(q.explanation.contains("Partly matched"));
    }

    #[test]
    fn test_best_selling_ranks_by_units_sold() {
        let q = compile("What are the best selling products?");
        assert_eq!(
            q.sql,
            "SELECT products.*, SUM(order_items.quantity) AS total_quantity FROM products \
             JOIN order_items ON order_items.product_id = products.id \
             GROUP BY products.id ORDER BY total_quantity DESC LIMIT 10"
        );
        assert_eq!(q.confidence, FULL_RULE_CONFIDENCE);
    }

    #[test]
    fn test_top_n_over_joined_column_sums_per_row() {
        let q = compile("Show the top 3 customers by total amount");
        assert_eq!(
            q.sql,
            "SELECT users.*, SUM(orders.total_amount) AS total_amount FROM users \
             JOIN orders ON orders.user_id = users.id \
             GROUP BY users.id ORDER BY total_amount DESC LIMIT 3"
        );
        assert!(q.explanation.contains("by total amount"));
    }

    #[test]
    fn test_most_recent() {
        let q = compile("List the 5 most recent orders");
        assert_eq!(q.sql, "SELECT * FROM orders ORDER BY order_date DESC LIMIT 5");
        assert_eq!(q.confidence, FULL_RULE_CONFIDENCE);
    }

    #[test]
    fn test_shipped_is_completed() {
        let q = compile("List shipped orders");
        assert_eq!(q.sql, "SELECT * FROM orders WHERE status = 'completed'");
    }

    #[test]
    fn test_plus_suffix_is_greater_than() {
        let q = compile("Show products $500+");
        assert_eq!(q.sql, "SELECT * FROM products WHERE price > 500");
    }

    #[test]
    fn test_unknown_words_lower_confidence() {
        let q = compile("Show users from Paris");
        assert_eq!(q.sql, "SELECT * FROM users");
        assert_eq!(q.confidence, PARTIAL_RULE_CONFIDENCE);
        assert!(q.explanation.contains("ignored 'Paris'"));
    }

    #[test]
    fn test_quotes_are_escaped() {
        let q = compile("Find users whose city is \"Coeur d'Alene\"");
        assert_eq!(q.sql, "SELECT * FROM users WHERE city = 'Coeur d''Alene'");
    }
}
