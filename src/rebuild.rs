//! Table rebuilder
//!
//! SQLite cannot alter constraints in place, so a table whose foreign keys
//! need fixing is rebuilt: rename it aside, create the corrected table under
//! the original name, copy the rows across, drop the old copy and put its
//! indexes and triggers back.
//!
//! Steps 2-6 run in one transaction. Enforcement toggling is not
//! transactional, so [`with_enforcement_suspended`] always restores it, and a
//! leftover `{table}_rebuild_tmp` from an interrupted run is healed on the
//! next attempt.

use crate::db::{foreign_keys_enabled, read_pragma, IntValue};
use crate::error::{Error, Result};
use crate::inspector::{self, SchemaObject};
use crate::model::{ColumnDefinition, TableDefinition};
use crate::sql::{self, ident_list, quote_ident, rebuild_temp_name};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use diesel::sqlite::SqliteConnection;
use regex::Regex;
use serde::Serialize;

/// Where in the rebuild sequence something went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildPhase {
    Suspend,
    Recover,
    Rename,
    Create,
    Copy,
    Verify,
    DropTemp,
    Indexes,
    Sequence,
    Resume,
    Restore,
}

impl std::fmt::Display for RebuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RebuildPhase::Suspend => "suspend enforcement",
            RebuildPhase::Recover => "leftover recovery",
            RebuildPhase::Rename => "rename",
            RebuildPhase::Create => "create",
            RebuildPhase::Copy => "copy",
            RebuildPhase::Verify => "verify",
            RebuildPhase::DropTemp => "drop temp table",
            RebuildPhase::Indexes => "recreate indexes",
            RebuildPhase::Sequence => "carry autoincrement",
            RebuildPhase::Resume => "resume enforcement",
            RebuildPhase::Restore => "restore after failure",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Column mapping
// ============================================================================

/// Where a new column's value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// Copy an old column (possibly under a different name)
    Column(String),
    /// Any SQL expression over the old row's columns
    Expr(String),
    /// Leave the column out of the copy so its DEFAULT applies
    Default,
}

/// Old row -> new row, expressed as the projection of an `INSERT .. SELECT`
///
/// By default every new column that also exists in the old table is carried
/// over by name; old columns with no counterpart are dropped. Rows are only
/// filtered when [`ColumnMapping::keep_rows_where`] says so.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    overrides: Vec<(String, ColumnSource)>,
    filter: Option<String>,
}

/// Resolved `INSERT INTO new (targets) SELECT sources FROM old`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CopyPlan {
    pub targets: Vec<String>,
    pub sources: Vec<String>,
    /// Old columns that nothing was copied from by name
    pub dropped: Vec<String>,
}

impl ColumnMapping {
    /// Carry every same-named column over, drop the rest
    pub fn carry_over() -> Self {
        Self::default()
    }

    /// Fill new column `new` from old column `old`
    pub fn rename(mut self, old: &str, new: &str) -> Self {
        self.set(new, ColumnSource::Column(old.to_string()));
        self
    }

    /// Fill new column `new` from an SQL expression over the old row
    pub fn compute(mut self, new: &str, expr: &str) -> Self {
        self.set(new, ColumnSource::Expr(expr.to_string()));
        self
    }

    /// Let new column `new` take its declared default even if an old column matches
    pub fn use_default(mut self, new: &str) -> Self {
        self.set(new, ColumnSource::Default);
        self
    }

    /// Only copy rows matching `predicate`; everything else is deliberately discarded
    pub fn keep_rows_where(mut self, predicate: &str) -> Self {
        self.filter = Some(predicate.to_string());
        self
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    fn set(&mut self, target: &str, source: ColumnSource) {
        self.overrides.retain(|(t, _)| !t.eq_ignore_ascii_case(target));
        self.overrides.push((target.to_string(), source));
    }

    fn source_for(&self, target: &str) -> Option<&ColumnSource> {
        self.overrides
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(target))
            .map(|(_, s)| s)
    }

    /// Stable textual form, used for migration checksums
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .overrides
            .iter()
            .map(|(target, source)| match source {
                ColumnSource::Column(old) => format!("{target}<-{old}"),
                ColumnSource::Expr(expr) => format!("{target}<-({expr})"),
                ColumnSource::Default => format!("{target}<-DEFAULT"),
            })
            .collect();
        if let Some(filter) = &self.filter {
            parts.push(format!("WHERE {filter}"));
        }
        parts.join("; ")
    }

    pub(crate) fn plan(&self, old_columns: &[ColumnDefinition], new: &TableDefinition) -> Result<CopyPlan> {
        let has_old = |name: &str| {
            old_columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
                .map(|c| c.name.clone())
        };

        for (target, _) in &self.overrides {
            if !new.has_column(target) {
                return Err(Error::schema(
                    &new.name,
                    format!("mapping targets `{}`, which the new definition does not have", target),
                ));
            }
        }

        let mut targets = Vec::new();
        let mut sources = Vec::new();
        let mut carried = Vec::new();
        for column in &new.columns {
            let source = match self.source_for(&column.name) {
                Some(ColumnSource::Column(old)) => {
                    let old = has_old(old).ok_or_else(|| {
                        Error::schema(&new.name, format!("mapping reads missing old column `{}`", old))
                    })?;
                    carried.push(old.to_ascii_lowercase());
                    Some(quote_ident(&old))
                }
                Some(ColumnSource::Expr(expr)) => Some(format!("({})", expr)),
                Some(ColumnSource::Default) => None,
                None => has_old(&column.name).map(|old| {
                    carried.push(old.to_ascii_lowercase());
                    quote_ident(&old)
                }),
            };

            match source {
                Some(expr) => {
                    targets.push(column.name.clone());
                    sources.push(expr);
                }
                None if column.not_null && column.default.is_none() && !is_rowid_alias(column, new) => {
                    return Err(Error::schema(
                        &new.name,
                        format!("NOT NULL column `{}` has no source and no default", column.name),
                    ));
                }
                None => {}
            }
        }

        if targets.is_empty() {
            return Err(Error::schema(
                &new.name,
                "no column of the new definition can be filled from the old table",
            ));
        }

        let dropped = old_columns
            .iter()
            .filter(|c| !carried.contains(&c.name.to_ascii_lowercase()))
            .map(|c| c.name.clone())
            .collect();

        Ok(CopyPlan {
            targets,
            sources,
            dropped,
        })
    }
}

fn is_rowid_alias(column: &ColumnDefinition, table: &TableDefinition) -> bool {
    column.primary_key
        && column.sql_type.eq_ignore_ascii_case("INTEGER")
        && table.primary_key_columns().len() == 1
}

// ============================================================================
// Rebuild
// ============================================================================

/// What happened to a `{table}_rebuild_tmp` left over from an earlier run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeftoverRecovery {
    /// Nothing was left over
    None,
    /// The live table was missing; the temp copy was renamed back first
    RestoredFromTemp,
    /// The live table existed; the stale temp copy was dropped
    DroppedStaleTemp,
}

/// Knobs for a single rebuild
#[derive(Debug, Clone)]
pub struct RebuildOptions {
    /// Run `PRAGMA foreign_key_check` on the rebuilt table before committing
    pub verify_foreign_keys: bool,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            verify_foreign_keys: true,
        }
    }
}

/// Outcome of a successful rebuild
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub table: String,
    /// Rows copied into the new table
    pub rows_migrated: usize,
    /// Rows the old table held
    pub source_rows: i64,
    /// Whether the mapping declared a row filter
    pub filtered: bool,
    pub leftover: LeftoverRecovery,
    pub dropped_columns: Vec<String>,
    pub indexes_recreated: Vec<String>,
    pub triggers_recreated: Vec<String>,
    /// Indexes and triggers not recreated because they name a dropped column
    pub skipped_objects: Vec<String>,
    /// Rows of the rebuilt table failing `PRAGMA foreign_key_check`
    pub foreign_key_violations: usize,
}

/// Rebuild `table` into `definition` with default options
pub fn rebuild(
    conn: &mut SqliteConnection,
    table: &str,
    definition: &TableDefinition,
    mapping: &ColumnMapping,
) -> Result<RebuildReport> {
    rebuild_with(conn, table, definition, mapping, &RebuildOptions::default())
}

/// Rebuild `table` into `definition`, copying rows through `mapping`
pub fn rebuild_with(
    conn: &mut SqliteConnection,
    table: &str,
    definition: &TableDefinition,
    mapping: &ColumnMapping,
    options: &RebuildOptions,
) -> Result<RebuildReport> {
    definition.validate()?;
    if !definition.name.eq_ignore_ascii_case(table) {
        return Err(Error::schema(
            table,
            format!("definition is for `{}`", definition.name),
        ));
    }
    let temp = rebuild_temp_name(table);

    tracing::info!(table, "rebuilding table");
    let report = with_enforcement_suspended(conn, table, |conn| {
        let outcome = conn.transaction::<_, Error, _>(|conn| {
            run_sequence(conn, table, &temp, definition, mapping, options)
        });
        outcome.map_err(|err| restore_after_failure(conn, table, &temp, err))
    })?;

    tracing::info!(
        table,
        rows = report.rows_migrated,
        indexes = report.indexes_recreated.len(),
        "table rebuilt"
    );
    Ok(report)
}

fn run_sequence(
    conn: &mut SqliteConnection,
    table: &str,
    temp: &str,
    definition: &TableDefinition,
    mapping: &ColumnMapping,
    options: &RebuildOptions,
) -> Result<RebuildReport> {
    let leftover = recover_leftover(conn, table, temp)?;

    let old_columns = inspector::get_columns(conn, table)?;
    let plan = mapping.plan(&old_columns, definition)?;
    let indexes = inspector::get_indexes(conn, table)?;
    let triggers = inspector::get_triggers(conn, table)?;
    let high_water = read_sequence(conn, table)?;
    let source_rows = inspector::count_rows(conn, table)?;

    exec(
        conn,
        table,
        RebuildPhase::Rename,
        &format!("ALTER TABLE {} RENAME TO {}", quote_ident(table), quote_ident(temp)),
    )?;
    exec(conn, table, RebuildPhase::Create, &definition.create_sql())?;

    let mut copy = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        quote_ident(&definition.name),
        ident_list(&plan.targets),
        plan.sources.join(", "),
        quote_ident(temp)
    );
    if let Some(filter) = mapping.filter() {
        copy.push_str(&format!(" WHERE {}", filter));
    }
    let rows_migrated = exec(conn, table, RebuildPhase::Copy, &copy)?;
    if mapping.filter().is_none() && rows_migrated as i64 != source_rows {
        return Err(Error::rebuild(
            table,
            RebuildPhase::Verify,
            format!("copied {} of {} rows", rows_migrated, source_rows),
        ));
    }

    exec(conn, table, RebuildPhase::DropTemp, &format!("DROP TABLE {}", quote_ident(temp)))?;

    let mut report = RebuildReport {
        table: definition.name.clone(),
        rows_migrated,
        source_rows,
        filtered: mapping.filter().is_some(),
        leftover,
        dropped_columns: plan.dropped,
        indexes_recreated: Vec::new(),
        triggers_recreated: Vec::new(),
        skipped_objects: Vec::new(),
        foreign_key_violations: 0,
    };

    recreate_indexes(conn, definition, &indexes, &mut report)?;
    let removed: Vec<&str> = old_columns
        .iter()
        .filter(|c| !definition.has_column(&c.name))
        .map(|c| c.name.as_str())
        .collect();
    recreate_triggers(conn, table, triggers, &removed, &mut report)?;

    if let Some(seq) = high_water.filter(|_| definition.has_autoincrement()) {
        carry_sequence(conn, &definition.name, seq)?;
    }

    if options.verify_foreign_keys {
        let violations = inspector::foreign_key_check(conn, Some(&definition.name))?;
        if !violations.is_empty() {
            tracing::warn!(
                table,
                violations = violations.len(),
                "rebuilt table has rows with dangling foreign keys"
            );
        }
        report.foreign_key_violations = violations.len();
    }

    if !report.dropped_columns.is_empty() {
        tracing::info!(table, columns = ?report.dropped_columns, "columns not carried over");
    }
    Ok(report)
}

fn recreate_indexes(
    conn: &mut SqliteConnection,
    definition: &TableDefinition,
    indexes: &[SchemaObject],
    report: &mut RebuildReport,
) -> Result<()> {
    let table = definition.name.as_str();
    for index in indexes {
        if definition.indexes.iter().any(|d| d.name.eq_ignore_ascii_case(&index.name)) {
            continue;
        }
        let missing = index
            .columns
            .iter()
            .flatten()
            .find(|column| !definition.has_column(column));
        if let Some(column) = missing {
            tracing::warn!(table, index = %index.name, column = %column, "index dropped with its column");
            report.skipped_objects.push(index.name.clone());
            continue;
        }
        exec(conn, table, RebuildPhase::Indexes, &index.sql)?;
        report.indexes_recreated.push(index.name.clone());
    }
    for (declared, sql) in definition.indexes.iter().zip(definition.index_sql()) {
        exec(conn, table, RebuildPhase::Indexes, &sql)?;
        report.indexes_recreated.push(declared.name.clone());
    }
    Ok(())
}

/// Put triggers back, except those whose body names a column that is gone
fn recreate_triggers(
    conn: &mut SqliteConnection,
    table: &str,
    triggers: Vec<SchemaObject>,
    removed: &[&str],
    report: &mut RebuildReport,
) -> Result<()> {
    let patterns = removed
        .iter()
        .map(|column| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(column)))
                .map(|pattern| (*column, pattern))
                .map_err(|e| Error::rebuild(table, RebuildPhase::Indexes, e))
        })
        .collect::<Result<Vec<_>>>()?;

    for trigger in triggers {
        if let Some((column, _)) = patterns.iter().find(|(_, p)| p.is_match(&trigger.sql)) {
            tracing::warn!(table, trigger = %trigger.name, column = %column, "trigger dropped with its column");
            report.skipped_objects.push(trigger.name);
            continue;
        }
        exec(conn, table, RebuildPhase::Indexes, &trigger.sql)?;
        report.triggers_recreated.push(trigger.name);
    }
    Ok(())
}

fn exec(conn: &mut SqliteConnection, table: &str, phase: RebuildPhase, statement: &str) -> Result<usize> {
    tracing::debug!(table, %phase, statement, "executing");
    diesel::sql_query(statement)
        .execute(conn)
        .map_err(|e| Error::rebuild(table, phase, e))
}

/// Heal a `{table}_rebuild_tmp` left by an interrupted run
fn recover_leftover(conn: &mut SqliteConnection, table: &str, temp: &str) -> Result<LeftoverRecovery> {
    if !inspector::table_exists(conn, temp)? {
        return Ok(LeftoverRecovery::None);
    }
    if inspector::table_exists(conn, table)? {
        tracing::warn!(table, temp, "dropping stale temp table from an interrupted rebuild");
        exec(conn, table, RebuildPhase::Recover, &format!("DROP TABLE {}", quote_ident(temp)))?;
        Ok(LeftoverRecovery::DroppedStaleTemp)
    } else {
        tracing::warn!(table, temp, "live table missing; restoring it from the temp copy");
        exec(
            conn,
            table,
            RebuildPhase::Recover,
            &format!("ALTER TABLE {} RENAME TO {}", quote_ident(temp), quote_ident(table)),
        )?;
        Ok(LeftoverRecovery::RestoredFromTemp)
    }
}

/// After a rolled-back attempt, make sure `table` exists under its own name
fn restore_after_failure(conn: &mut SqliteConnection, table: &str, temp: &str, err: Error) -> Error {
    let table_missing = matches!(inspector::table_exists(conn, table), Ok(false));
    let temp_present = matches!(inspector::table_exists(conn, temp), Ok(true));
    if !(table_missing && temp_present) {
        return err;
    }

    let restore = format!("ALTER TABLE {} RENAME TO {}", quote_ident(temp), quote_ident(table));
    match conn.batch_execute(&restore) {
        Ok(()) => {
            tracing::warn!(table, "rebuild failed; original table restored");
            err
        }
        Err(restore_err) => Error::rebuild(
            table,
            RebuildPhase::Restore,
            format!(
                "{}; restoring from `{}` also failed ({}), the data is left in `{}`",
                err, temp, restore_err, temp
            ),
        ),
    }
}

/// Run `f` with `foreign_keys = OFF` and `legacy_alter_table = ON`
///
/// `legacy_alter_table` stops SQLite from rewriting other tables'
/// `REFERENCES table` clauses to follow the rename to the temp name.
/// Both pragmas are put back to their previous values whatever `f` returns.
pub fn with_enforcement_suspended<T>(
    conn: &mut SqliteConnection,
    table: &str,
    f: impl FnOnce(&mut SqliteConnection) -> Result<T>,
) -> Result<T> {
    let foreign_keys = read_pragma(conn, "foreign_keys")?;
    let legacy_alter = read_pragma(conn, "legacy_alter_table")?;
    let restore = format!(
        "PRAGMA foreign_keys = {}; PRAGMA legacy_alter_table = {};",
        foreign_keys, legacy_alter
    );

    conn.batch_execute("PRAGMA foreign_keys = OFF; PRAGMA legacy_alter_table = ON;")
        .map_err(|e| Error::rebuild(table, RebuildPhase::Suspend, e))?;
    // The foreign_keys pragma is a silent no-op inside an open transaction
    if foreign_keys_enabled(conn)? {
        let _ = conn.batch_execute(&restore);
        return Err(Error::rebuild(
            table,
            RebuildPhase::Suspend,
            "foreign key enforcement cannot be suspended inside an open transaction",
        ));
    }

    let result = f(conn);
    let resumed = conn.batch_execute(&restore);
    match (result, resumed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(Error::rebuild(table, RebuildPhase::Resume, e)),
        (Err(err), Err(e)) => {
            tracing::error!(table, error = %e, "could not restore foreign key enforcement");
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
    }
}

// ============================================================================
// AUTOINCREMENT high-water mark
// ============================================================================

fn read_sequence(conn: &mut SqliteConnection, table: &str) -> Result<Option<i64>> {
    if !inspector::table_exists(conn, "sqlite_sequence")? {
        return Ok(None);
    }
    let rows: Vec<IntValue> =
        diesel::sql_query("SELECT seq AS value FROM sqlite_sequence WHERE name = ? COLLATE NOCASE")
            .bind::<Text, _>(table)
            .load(conn)?;
    Ok(rows.first().map(|r| r.value))
}

/// Keep AUTOINCREMENT from reissuing ids that were used before the rebuild
fn carry_sequence(conn: &mut SqliteConnection, table: &str, seq: i64) -> Result<()> {
    let phase = |e| Error::rebuild(table, RebuildPhase::Sequence, e);
    diesel::sql_query("UPDATE sqlite_sequence SET seq = ? WHERE name = ? AND seq < ?")
        .bind::<BigInt, _>(seq)
        .bind::<Text, _>(table)
        .bind::<BigInt, _>(seq)
        .execute(conn)
        .map_err(phase)?;
    diesel::sql_query(
        "INSERT INTO sqlite_sequence (name, seq) \
         SELECT ?, ? WHERE NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = ?)",
    )
    .bind::<Text, _>(table)
    .bind::<BigInt, _>(seq)
    .bind::<Text, _>(table)
    .execute(conn)
    .map_err(phase)?;
    Ok(())
}

// ============================================================================
// Leftover sweep
// ============================================================================

/// Heal every `*_rebuild_tmp` table in the database
///
/// Returns `(temp table, action)` for each one found.
pub fn sweep_leftovers(conn: &mut SqliteConnection) -> Result<Vec<(String, LeftoverRecovery)>> {
    let leftovers: Vec<String> = inspector::list_tables(conn)?
        .into_iter()
        .filter(|name| name.ends_with("_rebuild_tmp"))
        .collect();
    if leftovers.is_empty() {
        return Ok(Vec::new());
    }

    let mut actions = Vec::with_capacity(leftovers.len());
    for temp in leftovers {
        let Some(base) = sql::strip_stale_suffix(&temp).map(str::to_string) else {
            continue;
        };
        let action = with_enforcement_suspended(conn, &base, |conn| {
            conn.transaction::<_, Error, _>(|conn| recover_leftover(conn, &base, &temp))
        })?;
        actions.push((temp, action));
    }
    Ok(actions)
}

/// A `*_old` / `*_backup` copy whose base table exists and that no foreign
/// key references any more
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleCopy {
    pub table: String,
    pub base_table: String,
    pub rows: i64,
}

/// Copies left behind by hand-run rebuilds that are safe to drop
pub fn find_stale_copies(conn: &mut SqliteConnection) -> Result<Vec<StaleCopy>> {
    let tables = inspector::list_tables(conn)?;
    let referenced: Vec<String> = inspector::stale_references(conn)?
        .into_iter()
        .map(|r| r.references_table)
        .collect();

    let mut copies = Vec::new();
    for table in &tables {
        if table.ends_with("_rebuild_tmp") {
            continue;
        }
        let Some(base) = sql::strip_stale_suffix(table) else {
            continue;
        };
        if !tables.iter().any(|t| t.eq_ignore_ascii_case(base)) {
            continue;
        }
        if referenced.iter().any(|r| r.eq_ignore_ascii_case(table)) {
            continue;
        }
        copies.push(StaleCopy {
            table: table.clone(),
            base_table: base.to_string(),
            rows: inspector::count_rows(conn, table)?,
        });
    }
    Ok(copies)
}

/// Drop a copy reported by [`find_stale_copies`]
pub fn drop_stale_copy(conn: &mut SqliteConnection, copy: &StaleCopy) -> Result<()> {
    tracing::info!(table = %copy.table, base = %copy.base_table, rows = copy.rows, "dropping stale copy");
    with_enforcement_suspended(conn, &copy.table, |conn| {
        exec(
            conn,
            &copy.table,
            RebuildPhase::DropTemp,
            &format!("DROP TABLE {}", quote_ident(&copy.table)),
        )
        .map(|_| ())
    })
}
