//! Target definitions derived from the live catalog
//!
//! Hand-writing the full DDL of a farm table risks dropping columns the
//! application added later. A [`DerivedDefinition`] starts from whatever the
//! table looks like now and applies only the adjustments a step cares about.

use crate::error::{Error, Result};
use crate::inspector;
use crate::model::{ColumnDefinition, ForeignKeyDefinition, OnDelete, TableDefinition};
use crate::sql::strip_stale_suffix;
use diesel::sqlite::SqliteConnection;

/// Make one column reference a parent with a given ON DELETE policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyFix {
    /// Candidate spellings; the first one the table has is used
    pub columns: Vec<String>,
    pub references_table: String,
    /// Defaults to the parent's primary key
    pub references_column: Option<String>,
    pub on_delete: OnDelete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedDefinition {
    pub table: String,
    pub ensure_columns: Vec<ColumnDefinition>,
    pub foreign_keys: Vec<ForeignKeyFix>,
    /// Point references at `*_old` / `*_backup` / `*_rebuild_tmp` back at the base table
    pub retarget_stale_refs: bool,
}

impl DerivedDefinition {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ensure_columns: Vec::new(),
            foreign_keys: Vec::new(),
            retarget_stale_refs: false,
        }
    }

    /// Add `column` unless the table already has it
    pub fn ensure_column(mut self, column: ColumnDefinition) -> Self {
        self.ensure_columns.push(column);
        self
    }

    pub fn foreign_key(mut self, columns: &[&str], references: &str, on_delete: OnDelete) -> Self {
        self.foreign_keys.push(ForeignKeyFix {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            references_table: references.to_string(),
            references_column: None,
            on_delete,
        });
        self
    }

    pub fn retarget_stale_refs(mut self) -> Self {
        self.retarget_stale_refs = true;
        self
    }

    /// Stable textual form, used for migration checksums
    pub fn describe(&self) -> String {
        let mut parts = vec![format!("derive {}", self.table)];
        for column in &self.ensure_columns {
            parts.push(format!(
                "ensure {} {}{}",
                column.name,
                column.sql_type,
                column.default.as_deref().map(|d| format!(" DEFAULT {d}")).unwrap_or_default()
            ));
        }
        for fix in &self.foreign_keys {
            parts.push(format!(
                "fk {} -> {}({}) ON DELETE {}",
                fix.columns.join("/"),
                fix.references_table,
                fix.references_column.as_deref().unwrap_or("pk"),
                fix.on_delete
            ));
        }
        if self.retarget_stale_refs {
            parts.push("retarget stale".to_string());
        }
        parts.join("; ")
    }

    /// Read the live table and apply the adjustments
    pub fn resolve(&self, conn: &mut SqliteConnection) -> Result<TableDefinition> {
        let mut definition = inspector::table_definition(conn, &self.table)?;

        for column in &self.ensure_columns {
            if !definition.has_column(&column.name) {
                definition.columns.push(column.clone());
            }
        }

        for fix in &self.foreign_keys {
            let column = match fix
                .columns
                .iter()
                .find_map(|alias| definition.find_column(alias).map(|c| c.name.clone()))
            {
                Some(column) => column,
                None => {
                    let name = fix.columns.first().ok_or_else(|| {
                        Error::schema(&self.table, "foreign key fix names no column")
                    })?;
                    definition.columns.push(ColumnDefinition::new(name, "INTEGER"));
                    name.clone()
                }
            };
            if !inspector::table_exists(conn, &fix.references_table)? {
                return Err(Error::schema(
                    &self.table,
                    format!("`{}` would reference missing table `{}`", column, fix.references_table),
                ));
            }
            let references_column = match &fix.references_column {
                Some(c) => c.clone(),
                None => inspector::primary_key(conn, &fix.references_table)?,
            };
            // ON DELETE SET NULL can never succeed on a NOT NULL column
            if fix.on_delete == OnDelete::SetNull {
                if let Some(target) = definition
                    .columns
                    .iter_mut()
                    .find(|c| c.name.eq_ignore_ascii_case(&column) && c.not_null)
                {
                    tracing::info!(table = %self.table, column = %column, "dropping NOT NULL for SET NULL reference");
                    target.not_null = false;
                }
            }
            definition
                .foreign_keys
                .retain(|fk| !fk.column.eq_ignore_ascii_case(&column));
            definition.foreign_keys.push(ForeignKeyDefinition::new(
                &column,
                &fix.references_table,
                &references_column,
                fix.on_delete,
            ));
        }

        if self.retarget_stale_refs {
            for fk in definition.foreign_keys.iter_mut() {
                let Some(base) = strip_stale_suffix(&fk.references_table).map(str::to_string) else {
                    continue;
                };
                if inspector::table_exists(conn, &base)? {
                    tracing::info!(
                        table = %self.table,
                        column = %fk.column,
                        from = %fk.references_table,
                        to = %base,
                        "retargeting stale reference"
                    );
                    fk.references_table = base;
                }
            }
        }

        Ok(definition)
    }
}
