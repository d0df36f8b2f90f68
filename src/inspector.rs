//! Schema inspector: what does a table look like right now?
//!
//! Everything here is read-only. Table names are bound as parameters to the
//! table-valued pragma functions (`pragma_table_info(?)` and friends), so no
//! runtime-discovered name is ever spliced into a catalog query.

use crate::db::CountRow;
use crate::error::{Error, Result};
use crate::model::{ColumnDefinition, ForeignKeyDefinition, OnDelete, TableDefinition};
use crate::sql::{self, quote_ident};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Nullable, Text};
use diesel::sqlite::SqliteConnection;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::OnceLock;

// ============================================================================
// Catalog rows
// ============================================================================

#[derive(QueryableByName, Debug)]
struct TableInfoRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    col_type: String,
    #[diesel(sql_type = Integer)]
    not_null: i32,
    #[diesel(sql_type = Nullable<Text>)]
    dflt_value: Option<String>,
    #[diesel(sql_type = Integer)]
    pk: i32,
}

#[derive(QueryableByName, Debug)]
struct ForeignKeyRow {
    #[diesel(sql_type = Integer)]
    seq: i32,
    #[diesel(sql_type = Text)]
    ref_table: String,
    #[diesel(sql_type = Text)]
    from_column: String,
    #[diesel(sql_type = Nullable<Text>)]
    to_column: Option<String>,
    #[diesel(sql_type = Text)]
    on_delete: String,
}

#[derive(QueryableByName, Debug)]
struct NameSqlRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Nullable<Text>)]
    sql: Option<String>,
}

#[derive(QueryableByName, Debug)]
struct IndexListRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    origin: String,
}

#[derive(QueryableByName, Debug)]
struct IndexColumnRow {
    #[diesel(sql_type = Nullable<Text>)]
    name: Option<String>,
}

#[derive(QueryableByName, Debug)]
struct ForeignKeyCheckRow {
    #[diesel(sql_type = Text)]
    table: String,
    #[diesel(sql_type = Nullable<BigInt>)]
    rowid: Option<i64>,
    #[diesel(sql_type = Text)]
    parent: String,
    #[diesel(sql_type = Integer)]
    fkid: i32,
}

// ============================================================================
// Public types
// ============================================================================

/// An explicit index or trigger attached to a table, with its stored DDL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaObject {
    pub name: String,
    pub sql: String,
    /// Indexed columns; `None` entries are expressions. Empty for triggers.
    pub columns: Vec<Option<String>>,
}

/// One row reported by `PRAGMA foreign_key_check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fkid: i32,
}

// ============================================================================
// Operations
// ============================================================================

/// Whether a table named `table` exists (case-insensitive, like SQLite itself)
pub fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let rows: Vec<CountRow> = diesel::sql_query(
        "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE",
    )
    .bind::<Text, _>(table)
    .load(conn)?;
    Ok(rows.first().map(|r| r.count > 0).unwrap_or(false))
}

fn require_table(conn: &mut SqliteConnection, table: &str) -> Result<()> {
    if table_exists(conn, table)? {
        Ok(())
    } else {
        Err(Error::schema(table, "table does not exist"))
    }
}

/// All user tables, alphabetically
pub fn list_tables(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows: Vec<NameSqlRow> = diesel::sql_query(
        "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .load(conn)?;
    Ok(rows.into_iter().map(|r| r.name).collect())
}

/// Column metadata in catalog order
pub fn get_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<ColumnDefinition>> {
    require_table(conn, table)?;
    let rows: Vec<TableInfoRow> = diesel::sql_query(
        "SELECT name, type AS col_type, \"notnull\" AS not_null, dflt_value, pk \
         FROM pragma_table_info(?) ORDER BY cid",
    )
    .bind::<Text, _>(table)
    .load(conn)?;

    let single_pk = rows.iter().filter(|r| r.pk > 0).count() == 1;
    let autoincrement = single_pk && declares_autoincrement(conn, table)?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let primary_key = row.pk > 0;
            ColumnDefinition {
                autoincrement: primary_key
                    && autoincrement
                    && row.col_type.eq_ignore_ascii_case("INTEGER"),
                name: row.name,
                sql_type: row.col_type,
                not_null: row.not_null != 0,
                default: row.dflt_value,
                primary_key,
            }
        })
        .collect())
}

fn autoincrement_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\bAUTOINCREMENT\b").expect("valid regex"))
}

/// The catalog has no AUTOINCREMENT flag; read it off the stored DDL
fn declares_autoincrement(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let rows: Vec<NameSqlRow> = diesel::sql_query(
        "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE",
    )
    .bind::<Text, _>(table)
    .load(conn)?;
    Ok(rows
        .first()
        .and_then(|r| r.sql.as_deref())
        .map(|ddl| autoincrement_pattern().is_match(ddl))
        .unwrap_or(false))
}

/// Declared foreign keys, in declaration order
pub fn get_foreign_keys(conn: &mut SqliteConnection, table: &str) -> Result<Vec<ForeignKeyDefinition>> {
    require_table(conn, table)?;
    let rows: Vec<ForeignKeyRow> = diesel::sql_query(
        "SELECT seq, \"table\" AS ref_table, \"from\" AS from_column, \"to\" AS to_column, on_delete \
         FROM pragma_foreign_key_list(?) ORDER BY id DESC, seq",
    )
    .bind::<Text, _>(table)
    .load(conn)?;

    let mut keys = Vec::with_capacity(rows.len());
    for row in rows {
        if row.seq > 0 {
            return Err(Error::schema(
                table,
                format!("composite foreign key on `{}` is not supported", row.from_column),
            ));
        }
        let on_delete = OnDelete::parse(&row.on_delete).ok_or_else(|| {
            Error::schema(table, format!("unknown ON DELETE policy `{}`", row.on_delete))
        })?;
        let references_column = match row.to_column {
            Some(column) => column,
            // `REFERENCES parent` with no column means the parent's primary key
            None if table_exists(conn, &row.ref_table)? => primary_key(conn, &row.ref_table)?,
            None => "id".to_string(),
        };
        keys.push(ForeignKeyDefinition {
            column: row.from_column,
            references_table: row.ref_table,
            references_column,
            on_delete,
        });
    }
    Ok(keys)
}

/// Name of the single primary-key column, or `rowid` for tables without one
pub fn primary_key(conn: &mut SqliteConnection, table: &str) -> Result<String> {
    let columns = get_columns(conn, table)?;
    let keys: Vec<_> = columns.iter().filter(|c| c.primary_key).collect();
    match keys.as_slice() {
        [] => Ok("rowid".to_string()),
        [key] => Ok(key.name.clone()),
        _ => Err(Error::schema(table, "expected a single-column primary key")),
    }
}

/// Explicit (user-created) indexes on `table`
pub fn get_indexes(conn: &mut SqliteConnection, table: &str) -> Result<Vec<SchemaObject>> {
    require_table(conn, table)?;
    let rows: Vec<NameSqlRow> = diesel::sql_query(
        "SELECT name, sql FROM sqlite_master \
         WHERE type = 'index' AND tbl_name = ? COLLATE NOCASE AND sql IS NOT NULL ORDER BY name",
    )
    .bind::<Text, _>(table)
    .load(conn)?;

    let mut indexes = Vec::with_capacity(rows.len());
    for row in rows {
        let columns = index_columns(conn, &row.name)?;
        indexes.push(SchemaObject {
            name: row.name,
            sql: row.sql.unwrap_or_default(),
            columns,
        });
    }
    Ok(indexes)
}

/// Triggers attached to `table`
pub fn get_triggers(conn: &mut SqliteConnection, table: &str) -> Result<Vec<SchemaObject>> {
    require_table(conn, table)?;
    let rows: Vec<NameSqlRow> = diesel::sql_query(
        "SELECT name, sql FROM sqlite_master \
         WHERE type = 'trigger' AND tbl_name = ? COLLATE NOCASE AND sql IS NOT NULL ORDER BY name",
    )
    .bind::<Text, _>(table)
    .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|row| SchemaObject {
            name: row.name,
            sql: row.sql.unwrap_or_default(),
            columns: Vec::new(),
        })
        .collect())
}

fn index_columns(conn: &mut SqliteConnection, index: &str) -> Result<Vec<Option<String>>> {
    let rows: Vec<IndexColumnRow> =
        diesel::sql_query("SELECT name FROM pragma_index_info(?) ORDER BY seqno")
            .bind::<Text, _>(index)
            .load(conn)?;
    Ok(rows.into_iter().map(|r| r.name).collect())
}

/// Column groups covered by `UNIQUE` constraints (not by `CREATE UNIQUE INDEX`)
fn unique_constraints(conn: &mut SqliteConnection, table: &str) -> Result<Vec<Vec<String>>> {
    let rows: Vec<IndexListRow> =
        diesel::sql_query("SELECT name, origin FROM pragma_index_list(?) ORDER BY seq DESC")
            .bind::<Text, _>(table)
            .load(conn)?;

    let mut groups = Vec::new();
    for row in rows.into_iter().filter(|r| r.origin == "u") {
        let columns: Option<Vec<String>> = index_columns(conn, &row.name)?.into_iter().collect();
        if let Some(columns) = columns {
            groups.push(columns);
        }
    }
    Ok(groups)
}

/// Reverse-engineer the live table into a definition
///
/// Columns, primary key (including AUTOINCREMENT), UNIQUE constraints and
/// foreign keys survive. CHECK constraints are not recoverable from the
/// catalog and are dropped.
pub fn table_definition(conn: &mut SqliteConnection, table: &str) -> Result<TableDefinition> {
    let columns = get_columns(conn, table)?;
    let foreign_keys = get_foreign_keys(conn, table)?;
    let unique = unique_constraints(conn, table)?;
    let name = canonical_table_name(conn, table)?;
    Ok(TableDefinition {
        name,
        columns,
        foreign_keys,
        unique_constraints: unique,
        checks: Vec::new(),
        indexes: Vec::new(),
    })
}

fn canonical_table_name(conn: &mut SqliteConnection, table: &str) -> Result<String> {
    let rows: Vec<NameSqlRow> = diesel::sql_query(
        "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE",
    )
    .bind::<Text, _>(table)
    .load(conn)?;
    rows.into_iter()
        .next()
        .map(|r| r.name)
        .ok_or_else(|| Error::schema(table, "table does not exist"))
}

/// Pick whichever of `candidates` the live table actually has
///
/// Older FincaFácil databases spell the same relationship differently
/// (`finca_id` vs `id_finca`); resolve it once and use the catalog spelling.
pub fn resolve_column<S: AsRef<str>>(
    conn: &mut SqliteConnection,
    table: &str,
    candidates: &[S],
) -> Result<String> {
    let columns = get_columns(conn, table)?;
    candidates
        .iter()
        .find_map(|candidate| {
            columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(candidate.as_ref()))
                .map(|c| c.name.clone())
        })
        .ok_or_else(|| {
            let wanted: Vec<&str> = candidates.iter().map(|c| c.as_ref()).collect();
            Error::schema(table, format!("none of the columns {:?} exist", wanted))
        })
}

/// Structural check that `table` already matches `expected`
///
/// Compares the column-name set and, for each foreign key, its source column,
/// referenced table, ON DELETE policy and the nullability of the source
/// column. DDL text is never compared.
pub fn is_already_normalized(
    conn: &mut SqliteConnection,
    table: &str,
    expected: &TableDefinition,
) -> Result<bool> {
    let live = get_columns(conn, table)?;
    let live_columns: HashSet<String> = live.iter().map(|c| c.name.to_ascii_lowercase()).collect();
    let expected_columns: HashSet<String> = expected
        .columns
        .iter()
        .map(|c| c.name.to_ascii_lowercase())
        .collect();
    if live_columns != expected_columns {
        return Ok(false);
    }

    let live_keys = get_foreign_keys(conn, table)?;
    if live_keys.len() != expected.foreign_keys.len() {
        return Ok(false);
    }
    let all_match = expected.foreign_keys.iter().all(|want| {
        live_keys.iter().any(|have| {
            have.column.eq_ignore_ascii_case(&want.column)
                && have.references_table.eq_ignore_ascii_case(&want.references_table)
                && have.on_delete == want.on_delete
        })
    });
    if !all_match {
        return Ok(false);
    }

    // A SET NULL key on a NOT NULL column looks right but can never fire
    let nullability_matches = expected.foreign_keys.iter().all(|want| {
        let wanted = expected.find_column(&want.column).map(|c| c.not_null);
        let actual = live
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&want.column))
            .map(|c| c.not_null);
        wanted == actual
    });
    Ok(nullability_matches)
}

/// Number of rows in `table`
pub fn count_rows(conn: &mut SqliteConnection, table: &str) -> Result<i64> {
    require_table(conn, table)?;
    let rows: Vec<CountRow> = diesel::sql_query(sql::count_rows(table)).load(conn)?;
    Ok(rows.first().map(|r| r.count).unwrap_or(0))
}

/// `PRAGMA foreign_key_check`, for one table or the whole database
pub fn foreign_key_check(conn: &mut SqliteConnection, table: Option<&str>) -> Result<Vec<ForeignKeyViolation>> {
    let query = match table {
        Some(table) => {
            require_table(conn, table)?;
            format!("PRAGMA foreign_key_check({})", quote_ident(table))
        }
        None => "PRAGMA foreign_key_check".to_string(),
    };
    let rows: Vec<ForeignKeyCheckRow> = diesel::sql_query(query).load(conn)?;
    Ok(rows
        .into_iter()
        .map(|r| ForeignKeyViolation {
            table: r.table,
            rowid: r.rowid,
            parent: r.parent,
            fkid: r.fkid,
        })
        .collect())
}

/// A foreign key still pointing at a `*_old` / `*_backup` / `*_rebuild_tmp` copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleReference {
    pub table: String,
    pub column: String,
    pub references_table: String,
    /// The table the reference should point at
    pub base_table: String,
}

/// Every foreign key in the database that targets a leftover rebuild copy
pub fn stale_references(conn: &mut SqliteConnection) -> Result<Vec<StaleReference>> {
    let mut stale = Vec::new();
    for table in list_tables(conn)? {
        for key in get_foreign_keys(conn, &table)? {
            if let Some(base) = sql::strip_stale_suffix(&key.references_table) {
                stale.push(StaleReference {
                    base_table: base.to_string(),
                    table: table.clone(),
                    column: key.column,
                    references_table: key.references_table,
                });
            }
        }
    }
    Ok(stale)
}
