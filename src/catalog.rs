//! Schema Catalog
//!
//! Static description of the tables, columns and foreign keys the engine is
//! allowed to reference. Loaded once at startup (JSON file, SQLite
//! introspection or the built-in storefront schema), validated, and then shared
//! read-only behind an `Arc` by every other component.

use crate::error::{EngineError, Result};
use itertools::Itertools;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub tables: Vec<TableSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    /// Alternative words users say for this table ("customer" for `users`).
    #[serde(default)]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub synonyms: Vec<String>,
    /// Categorical values that may appear verbatim in questions.
    #[serde(default)]
    pub values: Vec<KnownValue>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownValue {
    pub value: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Fully qualified column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// One hop of a join path: `JOIN {table} ON {left} = {right}` where `left`
/// belongs to the newly joined table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    pub table: String,
    pub left: ColumnRef,
    pub right: ColumnRef,
}

impl ColumnSpec {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            primary_key: false,
            synonyms: Vec::new(),
            values: Vec::new(),
        }
    }

    fn primary(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    fn with_synonyms(mut self, synonyms: &[&str]) -> Self {
        self.synonyms = synonyms.iter().map(|s| s.to_string()).collect();
        self
    }

    fn with_values(mut self, values: &[(&str, &[&str])]) -> Self {
        self.values = values
            .iter()
            .map(|(value, aliases)| KnownValue {
                value: value.to_string(),
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
            })
            .collect();
        self
    }

    pub fn is_numeric(&self) -> bool {
        let t = self.data_type.to_ascii_uppercase();
        ["INT", "REAL", "FLOA", "DOUB", "DEC", "NUM"]
            .iter()
            .any(|needle| t.contains(needle))
    }

    pub fn is_temporal(&self) -> bool {
        let t = self.data_type.to_ascii_uppercase();
        t.contains("DATE") || t.contains("TIME")
    }

    pub fn is_textual(&self) -> bool {
        let t = self.data_type.to_ascii_uppercase();
        t.contains("CHAR") || t.contains("TEXT") || t.contains("CLOB") || t.contains("STRING")
    }

    /// Identifier-like columns are never picked as implicit measures.
    pub fn is_key(&self) -> bool {
        self.primary_key || self.name.eq_ignore_ascii_case("id") || self.name.ends_with("_id")
    }
}

impl TableSpec {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// First numeric non-key column, preferring fractional types (money).
    pub fn default_measure(&self) -> Option<&ColumnSpec> {
        let measures: Vec<&ColumnSpec> = self
            .columns
            .iter()
            .filter(|c| c.is_numeric() && !c.is_key())
            .collect();
        let fractional = measures.iter().find(|c| {
            let t = c.data_type.to_ascii_uppercase();
            !t.contains("INT")
        });
        fractional.or_else(|| measures.first()).copied()
    }

    pub fn temporal_column(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.is_temporal())
    }
}

impl SchemaCatalog {
    /// Build a catalog and reject malformed definitions.
    pub fn new(tables: Vec<TableSpec>) -> Result<Self> {
        let catalog = Self { tables };
        catalog.check()?;
        Ok(catalog)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let parsed: SchemaCatalog = serde_json::from_str(json)
            .map_err(|e| EngineError::Configuration(format!("Malformed schema catalog: {}", e)))?;
        Self::new(parsed.tables)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let catalog = Self::from_json_str(&content)?;
        info!("Loaded schema catalog from {} ({} tables)", path.display(), catalog.tables.len());
        Ok(catalog)
    }

    /// Introspect a SQLite database file.
    pub fn from_sqlite(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let catalog = Self::from_connection(&conn)?;
        info!("Introspected schema catalog from {} ({} tables)", path.display(), catalog.tables.len());
        Ok(catalog)
    }

    pub fn from_connection(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let mut info_stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", name))?;
            let columns = info_stmt
                .query_map([], |row| {
                    let column_name: String = row.get(1)?;
                    let data_type: String = row.get(2)?;
                    let not_null: i64 = row.get(3)?;
                    let pk: i64 = row.get(5)?;
                    Ok(ColumnSpec {
                        name: column_name,
                        data_type: if data_type.is_empty() { "TEXT".to_string() } else { data_type.to_ascii_uppercase() },
                        nullable: not_null == 0 && pk == 0,
                        primary_key: pk > 0,
                        synonyms: Vec::new(),
                        values: Vec::new(),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut fk_stmt = conn.prepare(&format!("PRAGMA foreign_key_list(\"{}\")", name))?;
            let foreign_keys = fk_stmt
                .query_map([], |row| {
                    // `to` is NULL for `REFERENCES parent` without a column list.
                    let referenced_column: Option<String> = row.get(4)?;
                    Ok(ForeignKey {
                        referenced_table: row.get(2)?,
                        column: row.get(3)?,
                        referenced_column: referenced_column.unwrap_or_default(),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            debug!("Table {}: {} columns, {} foreign keys", name, columns.len(), foreign_keys.len());
            tables.push(TableSpec {
                name,
                columns,
                foreign_keys,
                synonyms: Vec::new(),
            });
        }

        // Implicit parent keys are the parent's primary key.
        let primary_keys: HashMap<String, String> = tables
            .iter()
            .filter_map(|t| t.primary_key().map(|pk| (t.name.to_ascii_lowercase(), pk.name.clone())))
            .collect();
        for table in &mut tables {
            let table_name = table.name.clone();
            table.foreign_keys.retain_mut(|fk| {
                if !fk.referenced_column.is_empty() {
                    return true;
                }
                match primary_keys.get(&fk.referenced_table.to_ascii_lowercase()) {
                    Some(pk) => {
                        fk.referenced_column = pk.clone();
                        true
                    }
                    None => {
                        warn!(
                            "Skipping foreign key {}.{}: {} has no primary key",
                            table_name, fk.column, fk.referenced_table
                        );
                        false
                    }
                }
            });
        }

        Self::new(tables)
    }

    /// The users / products / orders / order_items schema of the chatbot
    /// application, with the synonyms and categorical values its users type.
    pub fn storefront() -> Self {
        let users = TableSpec {
            name: "users".to_string(),
            columns: vec![
                ColumnSpec::new("id", "INTEGER").primary(),
                ColumnSpec::new("name", "TEXT"),
                ColumnSpec::new("email", "TEXT").with_synonyms(&["email address", "mail"]),
                ColumnSpec::new("age", "INTEGER"),
                ColumnSpec::new("city", "TEXT").with_synonyms(&["town", "location"]),
                ColumnSpec::new("created_at", "DATETIME").with_synonyms(&["signup date", "registration date", "joined"]),
            ],
            foreign_keys: Vec::new(),
            synonyms: ["user", "customer", "client", "people", "person", "buyer"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let products = TableSpec {
            name: "products".to_string(),
            columns: vec![
                ColumnSpec::new("id", "INTEGER").primary(),
                ColumnSpec::new("name", "TEXT"),
                ColumnSpec::new("description", "TEXT"),
                ColumnSpec::new("price", "REAL").with_synonyms(&["cost", "expensive", "cheap", "pricey"]),
                ColumnSpec::new("category", "TEXT").with_values(&[
                    ("Books", &["book", "literature", "novel", "textbook", "reading"]),
                    ("Electronics", &["electronic", "tech", "gadget", "device"]),
                    ("Kitchen", &["cooking", "cookware", "utensil"]),
                    ("Furniture", &["chair", "desk", "sofa"]),
                    ("Clothing", &["clothes", "apparel", "fashion"]),
                    ("Sports", &["sport", "fitness", "exercise"]),
                    ("Home", &["household", "domestic"]),
                    ("Toys", &["toy", "game", "play"]),
                ]),
                ColumnSpec::new("stock_quantity", "INTEGER").with_synonyms(&["stock", "inventory"]),
                ColumnSpec::new("created_at", "DATETIME"),
            ],
            foreign_keys: Vec::new(),
            synonyms: ["item", "goods", "merchandise"].iter().map(|s| s.to_string()).collect(),
        };

        let orders = TableSpec {
            name: "orders".to_string(),
            columns: vec![
                ColumnSpec::new("id", "INTEGER").primary(),
                ColumnSpec::new("user_id", "INTEGER"),
                ColumnSpec::new("total_amount", "REAL").with_synonyms(&["revenue", "sales", "amount", "order value"]),
                ColumnSpec::new("status", "TEXT").with_values(&[
                    ("pending", &["waiting", "processing"]),
                    ("completed", &["finished", "done", "delivered", "fulfilled", "shipped"]),
                    ("cancelled", &["canceled", "rejected"]),
                ]),
                ColumnSpec::new("order_date", "DATETIME").with_synonyms(&["date", "placed"]),
            ],
            foreign_keys: vec![ForeignKey {
                column: "user_id".to_string(),
                referenced_table: "users".to_string(),
                referenced_column: "id".to_string(),
            }],
            synonyms: ["purchase", "transaction"].iter().map(|s| s.to_string()).collect(),
        };

        let order_items = TableSpec {
            name: "order_items".to_string(),
            columns: vec![
                ColumnSpec::new("id", "INTEGER").primary(),
                ColumnSpec::new("order_id", "INTEGER"),
                ColumnSpec::new("product_id", "INTEGER"),
                ColumnSpec::new("quantity", "INTEGER").with_synonyms(&["units", "sold", "selling", "popular", "popularity"]),
                ColumnSpec::new("price", "REAL"),
            ],
            foreign_keys: vec![
                ForeignKey {
                    column: "order_id".to_string(),
                    referenced_table: "orders".to_string(),
                    referenced_column: "id".to_string(),
                },
                ForeignKey {
                    column: "product_id".to_string(),
                    referenced_table: "products".to_string(),
                    referenced_column: "id".to_string(),
                },
            ],
            synonyms: ["line item", "purchased item", "order line"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        Self {
            tables: vec![users, products, orders, order_items],
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnSpec> {
        self.table(table).and_then(|t| t.column(column))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column(table, column).is_some()
    }

    /// Tables joined by a foreign key in either direction.
    pub fn adjacent(&self, a: &str, b: &str) -> bool {
        self.neighbours(a).iter().any(|step| step.table.eq_ignore_ascii_case(b))
    }

    /// Every table reachable in one foreign-key hop from `table`, in catalog
    /// order, with the join condition that reaches it.
    fn neighbours(&self, table: &str) -> Vec<JoinStep> {
        let mut steps = Vec::new();
        for spec in &self.tables {
            for fk in &spec.foreign_keys {
                if spec.name.eq_ignore_ascii_case(table) {
                    steps.push(JoinStep {
                        table: fk.referenced_table.clone(),
                        left: ColumnRef::new(&fk.referenced_table, &fk.referenced_column),
                        right: ColumnRef::new(&spec.name, &fk.column),
                    });
                } else if fk.referenced_table.eq_ignore_ascii_case(table) {
                    steps.push(JoinStep {
                        table: spec.name.clone(),
                        left: ColumnRef::new(&spec.name, &fk.column),
                        right: ColumnRef::new(&fk.referenced_table, &fk.referenced_column),
                    });
                }
            }
        }
        steps
    }

    /// Shortest foreign-key path from `from` to `to` (breadth first, catalog
    /// order breaks ties). Empty when both are the same table.
    pub fn join_path(&self, from: &str, to: &str) -> Option<Vec<JoinStep>> {
        if from.eq_ignore_ascii_case(to) {
            return Some(Vec::new());
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(from.to_ascii_lowercase());
        let mut queue: VecDeque<(String, Vec<JoinStep>)> = VecDeque::new();
        queue.push_back((from.to_string(), Vec::new()));

        while let Some((current, path)) = queue.pop_front() {
            for step in self.neighbours(&current) {
                if !visited.insert(step.table.to_ascii_lowercase()) {
                    continue;
                }
                let mut next_path = path.clone();
                let reached = step.table.clone();
                next_path.push(step);
                if reached.eq_ignore_ascii_case(to) {
                    return Some(next_path);
                }
                queue.push_back((reached, next_path));
            }
        }

        None
    }

    /// Deterministic text rendering used as the model prompt header: tables in
    /// alphabetical order, columns in declared order, then foreign keys.
    pub fn schema_prompt(&self) -> String {
        let mut out = String::from("Database schema:\n");
        for table in self.tables.iter().sorted_by(|a, b| a.name.cmp(&b.name)) {
            let columns = table
                .columns
                .iter()
                .map(|c| {
                    let mut col = format!("{} {}", c.name, c.data_type);
                    if c.primary_key {
                        col.push_str(" PRIMARY KEY");
                    } else if !c.nullable {
                        col.push_str(" NOT NULL");
                    }
                    col
                })
                .join(", ");
            out.push_str(&format!("- {}({})\n", table.name, columns));
            for fk in &table.foreign_keys {
                out.push_str(&format!(
                    "  {}.{} -> {}.{}\n",
                    table.name, fk.column, fk.referenced_table, fk.referenced_column
                ));
            }
        }
        out
    }

    fn check(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(EngineError::Configuration("Schema catalog has no tables".to_string()));
        }

        let mut table_names = HashSet::new();
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(EngineError::Configuration("Table with empty name".to_string()));
            }
            if !table_names.insert(table.name.to_ascii_lowercase()) {
                return Err(EngineError::Configuration(format!("Duplicate table '{}'", table.name)));
            }
            if table.columns.is_empty() {
                return Err(EngineError::Configuration(format!("Table '{}' has no columns", table.name)));
            }
            let mut column_names = HashSet::new();
            for column in &table.columns {
                if column.name.trim().is_empty() {
                    return Err(EngineError::Configuration(format!(
                        "Table '{}' has a column with an empty name",
                        table.name
                    )));
                }
                if !column_names.insert(column.name.to_ascii_lowercase()) {
                    return Err(EngineError::Configuration(format!(
                        "Duplicate column '{}.{}'",
                        table.name, column.name
                    )));
                }
            }
        }

        for table in &self.tables {
            for fk in &table.foreign_keys {
                if table.column(&fk.column).is_none() {
                    return Err(EngineError::Configuration(format!(
                        "Foreign key on unknown column '{}.{}'",
                        table.name, fk.column
                    )));
                }
                if !self.has_column(&fk.referenced_table, &fk.referenced_column) {
                    return Err(EngineError::Configuration(format!(
                        "Foreign key '{}.{}' references unknown '{}.{}'",
                        table.name, fk.column, fk.referenced_table, fk.referenced_column
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storefront_is_valid() {
        let catalog = SchemaCatalog::storefront();
        assert!(catalog.check().is_ok());
        assert_eq!(catalog.tables.len(), 4);
        assert!(catalog.has_column("PRODUCTS", "Category"));
    }

    #[test]
    fn test_join_path_orders_to_products() {
        let catalog = SchemaCatalog::storefront();
        let path = catalog.join_path("orders", "products").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].table, "order_items");
        assert_eq!(path[0].left, ColumnRef::new("order_items", "order_id"));
        assert_eq!(path[0].right, ColumnRef::new("orders", "id"));
        assert_eq!(path[1].table, "products");
        assert_eq!(path[1].left, ColumnRef::new("products", "id"));
        assert_eq!(path[1].right, ColumnRef::new("order_items", "product_id"));
    }

    #[test]
    fn test_join_path_users_to_products_goes_through_orders() {
        let catalog = SchemaCatalog::storefront();
        let tables: Vec<String> = catalog
            .join_path("users", "products")
            .unwrap()
            .into_iter()
            .map(|s| s.table)
            .collect();
        assert_eq!(tables, vec!["orders", "order_items", "products"]);
    }

    #[test]
    fn test_schema_prompt_is_alphabetical() {
        let prompt = SchemaCatalog::storefront().schema_prompt();
        let order_items = prompt.find("- order_items(").unwrap();
        let orders = prompt.find("- orders(").unwrap();
        let products = prompt.find("- products(").unwrap();
        let users = prompt.find("- users(").unwrap();
        assert!(order_items < orders && orders < products && products < users);
        assert!(prompt.contains("  orders.user_id -> users.id"));
        assert_eq!(prompt, SchemaCatalog::storefront().schema_prompt());
    }

    #[test]
    fn test_rejects_dangling_foreign_key() {
        let json = r#"{"tables": [
            {"name": "orders", "columns": [{"name": "id", "type": "INTEGER"}, {"name": "user_id", "type": "INTEGER"}],
             "foreign_keys": [{"column": "user_id", "referenced_table": "users", "referenced_column": "id"}]}
        ]}"#;
        let err = SchemaCatalog::from_json_str(json).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("users.id"));
    }

    #[test]
    fn test_rejects_duplicate_table() {
        let json = r#"{"tables": [
            {"name": "users", "columns": [{"name": "id", "type": "INTEGER"}]},
            {"name": "Users", "columns": [{"name": "id", "type": "INTEGER"}]}
        ]}"#;
        assert!(matches!(
            SchemaCatalog::from_json_str(json),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_from_connection_reads_columns_and_foreign_keys() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, city TEXT);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id), total_amount REAL);",
        )
        .unwrap();

        let catalog = SchemaCatalog::from_connection(&conn).unwrap();
        assert_eq!(catalog.tables.len(), 2);

        let users = catalog.table("users").unwrap();
        assert!(users.column("id").unwrap().primary_key);
        assert!(!users.column("name").unwrap().nullable);
        assert!(users.column("city").unwrap().nullable);

        let orders = catalog.table("orders").unwrap();
        assert_eq!(
            orders.foreign_keys,
            vec![ForeignKey {
                column: "user_id".to_string(),
                referenced_table: "users".to_string(),
                referenced_column: "id".to_string(),
            }]
        );
        assert!(catalog.adjacent("users", "orders"));
    }

    #[test]
    fn test_from_connection_resolves_implicit_parent_key() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE invoices (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers, amount REAL);
             CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);",
        )
        .unwrap();

        let catalog = SchemaCatalog::from_connection(&conn).unwrap();
        assert_eq!(
            catalog.table("invoices").unwrap().foreign_keys,
            vec![ForeignKey {
                column: "customer_id".to_string(),
                referenced_table: "customers".to_string(),
                referenced_column: "id".to_string(),
            }]
        );
        assert!(catalog.adjacent("customers", "invoices"));
    }

    #[test]
    fn test_default_measure_prefers_money() {
        let catalog = SchemaCatalog::storefront();
        assert_eq!(catalog.table("products").unwrap().default_measure().unwrap().name, "price");
        assert_eq!(catalog.table("users").unwrap().default_measure().unwrap().name, "age");
    }
}
