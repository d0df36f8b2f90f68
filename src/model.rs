//! Table, column and foreign-key definitions
//!
//! These describe the *desired* end state of one table. A migration author
//! builds them in code; the inspector can also reverse-engineer one from the
//! live catalog. Either way they render to the `CREATE TABLE` statement used
//! by the rebuilder.

use crate::error::{Error, Result};
use crate::sql::{ident_list, quote_ident};
use serde::Serialize;
use std::collections::HashSet;

/// What happens to a dependent row when its parent row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnDelete {
    Cascade,
    SetNull,
    NoAction,
    /// Only ever reported by the catalog for legacy tables
    Restrict,
    /// Only ever reported by the catalog for legacy tables
    SetDefault,
}

impl OnDelete {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::NoAction => "NO ACTION",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::SetDefault => "SET DEFAULT",
        }
    }

    /// Parse the `on_delete` column of `PRAGMA foreign_key_list`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CASCADE" => Some(OnDelete::Cascade),
            "SET NULL" => Some(OnDelete::SetNull),
            "NO ACTION" | "" => Some(OnDelete::NoAction),
            "RESTRICT" => Some(OnDelete::Restrict),
            "SET DEFAULT" => Some(OnDelete::SetDefault),
            _ => None,
        }
    }
}

impl std::fmt::Display for OnDelete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// One column of a table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Declared type, possibly empty (SQLite allows typeless columns)
    pub sql_type: String,
    pub not_null: bool,
    /// Raw SQL default expression, e.g. `'Activo'` or `CURRENT_TIMESTAMP`
    pub default: Option<String>,
    pub primary_key: bool,
    pub autoincrement: bool,
}

impl ColumnDefinition {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            not_null: false,
            default: None,
            primary_key: false,
            autoincrement: false,
        }
    }

    /// `id INTEGER PRIMARY KEY AUTOINCREMENT`, the shape every FincaFácil table uses
    pub fn id() -> Self {
        Self::new("id", "INTEGER").autoincrement()
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default(mut self, expr: &str) -> Self {
        self.default = Some(expr.to_string());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.primary_key = true;
        self.autoincrement = true;
        self
    }

    fn render(&self, inline_primary_key: bool) -> String {
        let mut out = quote_ident(&self.name);
        if !self.sql_type.is_empty() {
            out.push(' ');
            out.push_str(&self.sql_type);
        }
        if inline_primary_key && self.primary_key {
            out.push_str(" PRIMARY KEY");
            if self.autoincrement {
                out.push_str(" AUTOINCREMENT");
            }
        }
        if self.not_null {
            out.push_str(" NOT NULL");
        }
        if let Some(expr) = &self.default {
            out.push_str(" DEFAULT ");
            out.push_str(&render_default(expr));
        }
        out
    }
}

/// Literal defaults render as-is; anything else is parenthesised so
/// catalog-reported expressions like `datetime('now')` stay valid DDL.
fn render_default(expr: &str) -> String {
    let trimmed = expr.trim();
    let upper = trimmed.to_ascii_uppercase();
    let is_literal = trimmed.starts_with('(')
        || (trimmed.starts_with('\'') && trimmed.ends_with('\''))
        || trimmed.parse::<f64>().is_ok()
        || matches!(
            upper.as_str(),
            "NULL" | "TRUE" | "FALSE" | "CURRENT_TIME" | "CURRENT_DATE" | "CURRENT_TIMESTAMP"
        );
    if is_literal {
        trimmed.to_string()
    } else {
        format!("({})", trimmed)
    }
}

/// `FOREIGN KEY (column) REFERENCES table (column) ON DELETE policy`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyDefinition {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    pub on_delete: OnDelete,
}

impl ForeignKeyDefinition {
    pub fn new(column: &str, references_table: &str, references_column: &str, on_delete: OnDelete) -> Self {
        Self {
            column: column.to_string(),
            references_table: references_table.to_string(),
            references_column: references_column.to_string(),
            on_delete,
        }
    }

    fn render(&self) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            quote_ident(&self.column),
            quote_ident(&self.references_table),
            quote_ident(&self.references_column),
            self.on_delete.as_sql()
        )
    }
}

/// A secondary index declared alongside a table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Desired end-state schema for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    /// Table-level `UNIQUE (..)` groups
    pub unique_constraints: Vec<Vec<String>>,
    /// Raw table-level `CHECK (..)` expressions
    pub checks: Vec<String>,
    pub indexes: Vec<IndexDefinition>,
}

impl TableDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
            checks: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_foreign_key(mut self, column: &str, table: &str, references: &str, on_delete: OnDelete) -> Self {
        self.foreign_keys
            .push(ForeignKeyDefinition::new(column, table, references, on_delete));
        self
    }

    pub fn with_unique(mut self, columns: &[&str]) -> Self {
        self.unique_constraints
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_check(mut self, expr: &str) -> Self {
        self.checks.push(expr.to_string());
        self
    }

    pub fn with_index(mut self, name: &str, columns: &[&str], unique: bool) -> Self {
        self.indexes.push(IndexDefinition {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
        });
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.find_column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn has_autoincrement(&self) -> bool {
        self.columns.iter().any(|c| c.autoincrement)
    }

    /// Check the structural invariants before any DDL runs
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::schema(&self.name, "definition has no columns"));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(Error::schema(
                    &self.name,
                    format!("column `{}` is declared twice", column.name),
                ));
            }
        }

        let autoincrement: Vec<_> = self.columns.iter().filter(|c| c.autoincrement).collect();
        if autoincrement.len() > 1 {
            return Err(Error::schema(&self.name, "more than one AUTOINCREMENT column"));
        }
        if let Some(column) = autoincrement.first() {
            if self.primary_key_columns().len() != 1 {
                return Err(Error::schema(
                    &self.name,
                    format!("AUTOINCREMENT column `{}` must be the only primary key", column.name),
                ));
            }
            if !column.sql_type.eq_ignore_ascii_case("INTEGER") {
                return Err(Error::schema(
                    &self.name,
                    format!("AUTOINCREMENT column `{}` must be INTEGER", column.name),
                ));
            }
        }

        for fk in &self.foreign_keys {
            if !self.has_column(&fk.column) {
                return Err(Error::schema(
                    &self.name,
                    format!("foreign key on unknown column `{}`", fk.column),
                ));
            }
        }
        let grouped = self
            .unique_constraints
            .iter()
            .flatten()
            .chain(self.indexes.iter().flat_map(|i| i.columns.iter()));
        for name in grouped {
            if !self.has_column(name) {
                return Err(Error::schema(
                    &self.name,
                    format!("constraint or index on unknown column `{}`", name),
                ));
            }
        }
        Ok(())
    }

    /// Render the `CREATE TABLE` statement
    pub fn create_sql(&self) -> String {
        let primary_keys = self.primary_key_columns();
        let inline_pk = primary_keys.len() == 1;

        let mut parts: Vec<String> = self.columns.iter().map(|c| c.render(inline_pk)).collect();
        if primary_keys.len() > 1 {
            parts.push(format!("PRIMARY KEY ({})", ident_list(&primary_keys)));
        }
        for group in &self.unique_constraints {
            parts.push(format!("UNIQUE ({})", ident_list(group)));
        }
        for check in &self.checks {
            parts.push(format!("CHECK ({})", check));
        }
        for fk in &self.foreign_keys {
            parts.push(fk.render());
        }

        format!(
            "CREATE TABLE {} (\n    {}\n)",
            quote_ident(&self.name),
            parts.join(",\n    ")
        )
    }

    /// `CREATE INDEX` statements for the declared indexes
    pub fn index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|index| {
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    quote_ident(&index.name),
                    quote_ident(&self.name),
                    ident_list(&index.columns)
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peso() -> TableDefinition {
        TableDefinition::new("peso")
            .with_column(ColumnDefinition::id())
            .with_column(ColumnDefinition::new("animal_id", "INTEGER").not_null())
            .with_column(ColumnDefinition::new("fecha", "DATE").not_null())
            .with_column(ColumnDefinition::new("peso", "REAL").not_null())
            .with_column(ColumnDefinition::new("fecha_creacion", "TIMESTAMP").default("CURRENT_TIMESTAMP"))
            .with_unique(&["animal_id", "fecha"])
            .with_foreign_key("animal_id", "animal", "id", OnDelete::Cascade)
            .with_index("idx_peso_fecha", &["fecha"], false)
    }

    #[test]
    fn test_create_sql_renders_constraints() {
        let sql = peso().create_sql();
        assert!(sql.starts_with("CREATE TABLE \"peso\" ("));
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"animal_id\" INTEGER NOT NULL"));
        assert!(sql.contains("DEFAULT CURRENT_TIMESTAMP"));
        assert!(sql.contains("UNIQUE (\"animal_id\", \"fecha\")"));
        assert!(sql.contains("FOREIGN KEY (\"animal_id\") REFERENCES \"animal\" (\"id\") ON DELETE CASCADE"));
    }

    #[test]
    fn test_composite_primary_key_is_table_level() {
        let def = TableDefinition::new("animal_lote")
            .with_column(ColumnDefinition::new("animal_id", "INTEGER").primary_key())
            .with_column(ColumnDefinition::new("lote_id", "INTEGER").primary_key());
        let sql = def.create_sql();
        assert!(sql.contains("PRIMARY KEY (\"animal_id\", \"lote_id\")"));
        assert!(!sql.contains("INTEGER PRIMARY KEY"));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_expression_defaults_are_parenthesised() {
        assert_eq!(render_default("'Activo'"), "'Activo'");
        assert_eq!(render_default("0"), "0");
        assert_eq!(render_default("-1.5"), "-1.5");
        assert_eq!(render_default("current_timestamp"), "current_timestamp");
        assert_eq!(render_default("datetime('now')"), "(datetime('now'))");
        assert_eq!(render_default("(1 + 1)"), "(1 + 1)");
    }

    #[test]
    fn test_validate_rejects_two_autoincrement_columns() {
        let def = TableDefinition::new("t")
            .with_column(ColumnDefinition::id())
            .with_column(ColumnDefinition::new("other", "INTEGER").autoincrement());
        assert!(matches!(def.validate(), Err(Error::Schema { .. })));
    }

    #[test]
    fn test_validate_rejects_non_integer_autoincrement() {
        let def = TableDefinition::new("t").with_column(ColumnDefinition::new("id", "TEXT").autoincrement());
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_fk_column() {
        let def = TableDefinition::new("t")
            .with_column(ColumnDefinition::id())
            .with_foreign_key("finca_id", "finca", "id", OnDelete::SetNull);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("finca_id"));
    }

    #[test]
    fn test_validate_rejects_duplicate_columns() {
        let def = TableDefinition::new("t")
            .with_column(ColumnDefinition::id())
            .with_column(ColumnDefinition::new("ID", "INTEGER"));
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_index_sql() {
        let stmts = peso().index_sql();
        assert_eq!(
            stmts,
            vec!["CREATE INDEX IF NOT EXISTS \"idx_peso_fecha\" ON \"peso\" (\"fecha\")".to_string()]
        );
    }

    #[test]
    fn test_on_delete_parse() {
        assert_eq!(OnDelete::parse("SET NULL"), Some(OnDelete::SetNull));
        assert_eq!(OnDelete::parse("cascade"), Some(OnDelete::Cascade));
        assert_eq!(OnDelete::parse("NO ACTION"), Some(OnDelete::NoAction));
        assert_eq!(OnDelete::parse("RESTRICT"), Some(OnDelete::Restrict));
        assert_eq!(OnDelete::parse("BOGUS"), None);
    }
}
