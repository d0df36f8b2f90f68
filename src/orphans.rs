//! Orphan reference cleaner
//!
//! A reference is orphaned when its column is non-null and no parent row
//! matches. Each rule of an [`OrphanPolicy`] either nulls such references out
//! or deletes the rows carrying them. Rules run in the caller's order, one
//! transaction each.
//!
//! NULL_OUT runs with foreign-key enforcement suspended: clearing a reference
//! cannot create a violation, but with enforcement on SQLite rejects the
//! update when the same row carries another dangling key, or when the table
//! still references a dropped table. DELETE_ROW keeps enforcement on so the
//! deleted rows' own children cascade, unless the table references a missing
//! table. Every rule then re-counts its orphans and rolls back if any remain.

use crate::db::CountRow;
use crate::error::{Error, Result};
use crate::inspector;
use crate::rebuild::with_enforcement_suspended;
use crate::sql::{orphan_predicate, quote_ident};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Serialize, Serializer};

/// What to do with an orphaned reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrphanAction {
    NullOut,
    DeleteRow,
}

impl std::fmt::Display for OrphanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrphanAction::NullOut => write!(f, "NULL_OUT"),
            OrphanAction::DeleteRow => write!(f, "DELETE_ROW"),
        }
    }
}

/// Explicit parent for a rule whose column carries no FK declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub table: String,
    /// Defaults to the parent's primary key
    pub column: Option<String>,
}

/// One (table, column) -> action entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanRule {
    pub table: String,
    /// Candidate spellings of the column; the first one the table has wins
    pub columns: Vec<String>,
    pub parent: Option<ParentRef>,
    pub action: OrphanAction,
}

impl OrphanRule {
    fn new(table: &str, columns: &[&str], action: OrphanAction) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            parent: None,
            action,
        }
    }

    pub fn null_out(table: &str, columns: &[&str]) -> Self {
        Self::new(table, columns, OrphanAction::NullOut)
    }

    pub fn delete_row(table: &str, columns: &[&str]) -> Self {
        Self::new(table, columns, OrphanAction::DeleteRow)
    }

    /// Name the parent instead of reading it off the live FK
    pub fn references(mut self, table: &str, column: Option<&str>) -> Self {
        self.parent = Some(ParentRef {
            table: table.to_string(),
            column: column.map(str::to_string),
        });
        self
    }

    fn label(&self) -> String {
        self.columns.join("/")
    }
}

/// Ordered list of orphan rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanPolicy {
    rules: Vec<OrphanRule>,
}

impl OrphanPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: OrphanRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[OrphanRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Stable textual form, used for migration checksums
    pub fn describe(&self) -> String {
        self.rules
            .iter()
            .map(|r| format!("{}.{}:{}", r.table, r.label(), r.action))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl FromIterator<OrphanRule> for OrphanPolicy {
    fn from_iter<I: IntoIterator<Item = OrphanRule>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

// ============================================================================
// Report
// ============================================================================

/// How one rule went
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RuleOutcome {
    Remediated { rows_affected: usize },
    /// Dry run: orphans found, nothing changed
    Found { orphans: usize },
    /// The dependent table is not part of this database
    Skipped { reason: String },
    Failed {
        #[serde(serialize_with = "as_display")]
        error: Error,
    },
}

fn as_display<S: Serializer>(error: &Error, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

#[derive(Debug, Serialize)]
pub struct RemediationEntry {
    pub table: String,
    /// Resolved column, or the candidate list when resolution failed
    pub column: String,
    /// `parent_table.parent_column`, when resolved
    pub parent: Option<String>,
    pub action: OrphanAction,
    #[serde(flatten)]
    pub outcome: RuleOutcome,
}

/// Per-rule results of [`clean`] or [`scan`]
#[derive(Debug, Default, Serialize)]
pub struct RemediationReport {
    pub dry_run: bool,
    pub entries: Vec<RemediationEntry>,
}

impl RemediationReport {
    /// Rows changed (or, for a dry run, orphans found) for `table.column`
    pub fn affected(&self, table: &str, column: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.table.eq_ignore_ascii_case(table) && e.column.eq_ignore_ascii_case(column))
            .and_then(|e| match e.outcome {
                RuleOutcome::Remediated { rows_affected } => Some(rows_affected),
                RuleOutcome::Found { orphans } => Some(orphans),
                _ => None,
            })
    }

    pub fn total_affected(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match e.outcome {
                RuleOutcome::Remediated { rows_affected } => rows_affected,
                RuleOutcome::Found { orphans } => orphans,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RemediationEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, RuleOutcome::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

// ============================================================================
// Operations
// ============================================================================

struct ResolvedRule {
    column: String,
    parent_table: String,
    parent_column: String,
}

impl ResolvedRule {
    fn predicate(&self, table: &str) -> String {
        orphan_predicate(table, &self.column, &self.parent_table, &self.parent_column)
    }

    fn parent(&self) -> String {
        format!("{}.{}", self.parent_table, self.parent_column)
    }
}

fn resolve(conn: &mut SqliteConnection, rule: &OrphanRule) -> Result<ResolvedRule> {
    let column = inspector::resolve_column(conn, &rule.table, &rule.columns)?;
    let (parent_table, parent_column) = match &rule.parent {
        Some(parent) => {
            let column = match &parent.column {
                Some(column) => column.clone(),
                None => inspector::primary_key(conn, &parent.table)?,
            };
            (parent.table.clone(), column)
        }
        None => {
            let key = inspector::get_foreign_keys(conn, &rule.table)?
                .into_iter()
                .find(|fk| fk.column.eq_ignore_ascii_case(&column))
                .ok_or_else(|| {
                    Error::schema(
                        &rule.table,
                        format!("`{}` declares no foreign key; name its parent explicitly", column),
                    )
                })?;
            (key.references_table, key.references_column)
        }
    };
    if !inspector::table_exists(conn, &parent_table)? {
        return Err(Error::schema(
            &rule.table,
            format!("parent table `{}` of `{}` does not exist", parent_table, column),
        ));
    }
    Ok(ResolvedRule {
        column,
        parent_table,
        parent_column,
    })
}

/// Remediate every rule of `policy`, in order
///
/// A failing rule is rolled back and recorded; the remaining rules still run.
pub fn clean(conn: &mut SqliteConnection, policy: &OrphanPolicy) -> RemediationReport {
    run_policy(conn, policy, false)
}

/// Count orphans per rule without changing anything
pub fn scan(conn: &mut SqliteConnection, policy: &OrphanPolicy) -> RemediationReport {
    run_policy(conn, policy, true)
}

fn run_policy(conn: &mut SqliteConnection, policy: &OrphanPolicy, dry_run: bool) -> RemediationReport {
    let mut report = RemediationReport {
        dry_run,
        entries: Vec::with_capacity(policy.rules.len()),
    };
    for rule in &policy.rules {
        report.entries.push(run_rule(conn, rule, dry_run));
    }
    report
}

fn run_rule(conn: &mut SqliteConnection, rule: &OrphanRule, dry_run: bool) -> RemediationEntry {
    let mut entry = RemediationEntry {
        table: rule.table.clone(),
        column: rule.label(),
        parent: None,
        action: rule.action,
        outcome: RuleOutcome::Skipped {
            reason: "table does not exist".to_string(),
        },
    };

    match inspector::table_exists(conn, &rule.table) {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(table = %rule.table, "orphan rule skipped, table absent");
            return entry;
        }
        Err(e) => {
            entry.outcome = failed(rule, &entry.column, e);
            return entry;
        }
    }

    let result = if dry_run {
        conn.transaction::<_, Error, _>(|conn| {
            let resolved = resolve(conn, rule)?;
            let count = count_orphans(conn, &rule.table, &resolved)?;
            Ok((resolved, count))
        })
    } else {
        remediate(conn, rule)
    };

    match result {
        Ok((resolved, count)) => {
            entry.column = resolved.column.clone();
            entry.parent = Some(resolved.parent());
            entry.outcome = if dry_run {
                RuleOutcome::Found { orphans: count }
            } else {
                if count > 0 {
                    tracing::info!(
                        table = %rule.table,
                        column = %resolved.column,
                        action = %rule.action,
                        rows = count,
                        "orphaned references remediated"
                    );
                }
                RuleOutcome::Remediated { rows_affected: count }
            };
        }
        Err(e) => {
            let label = entry.column.clone();
            entry.outcome = failed(rule, &label, e);
        }
    }
    entry
}

fn count_orphans(conn: &mut SqliteConnection, table: &str, resolved: &ResolvedRule) -> Result<usize> {
    let rows: Vec<CountRow> = diesel::sql_query(format!(
        "SELECT COUNT(*) AS count FROM {} WHERE {}",
        quote_ident(table),
        resolved.predicate(table)
    ))
    .load(conn)?;
    Ok(rows.first().map(|r| r.count as usize).unwrap_or(0))
}

/// Whether any foreign key of `table` points at a table that no longer exists
fn references_missing_table(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    for key in inspector::get_foreign_keys(conn, table)? {
        if !inspector::table_exists(conn, &key.references_table)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn remediate(conn: &mut SqliteConnection, rule: &OrphanRule) -> Result<(ResolvedRule, usize)> {
    let suspend = match rule.action {
        OrphanAction::NullOut => true,
        OrphanAction::DeleteRow => references_missing_table(conn, &rule.table)?,
    };
    if suspend {
        with_enforcement_suspended(conn, &rule.table, |conn| {
            conn.transaction::<_, Error, _>(|conn| apply_rule(conn, rule))
        })
    } else {
        conn.transaction::<_, Error, _>(|conn| apply_rule(conn, rule))
    }
}

fn apply_rule(conn: &mut SqliteConnection, rule: &OrphanRule) -> Result<(ResolvedRule, usize)> {
    let resolved = resolve(conn, rule)?;
    let predicate = resolved.predicate(&rule.table);
    let table = quote_ident(&rule.table);
    let statement = match rule.action {
        OrphanAction::NullOut => format!(
            "UPDATE {} SET {} = NULL WHERE {}",
            table,
            quote_ident(&resolved.column),
            predicate
        ),
        OrphanAction::DeleteRow => format!("DELETE FROM {} WHERE {}", table, predicate),
    };
    tracing::debug!(statement = %statement, "executing");
    let changed = diesel::sql_query(statement).execute(conn)?;

    let remaining = count_orphans(conn, &rule.table, &resolved)?;
    if remaining > 0 {
        return Err(Error::OrphanCleanup {
            table: rule.table.clone(),
            column: resolved.column.clone(),
            detail: format!("{} orphaned references remain after {}", remaining, rule.action),
        });
    }
    Ok((resolved, changed))
}

fn failed(rule: &OrphanRule, column: &str, error: Error) -> RuleOutcome {
    tracing::warn!(table = %rule.table, column, error = %error, "orphan rule failed");
    let error = match error {
        Error::OrphanCleanup { .. } => error,
        other => Error::OrphanCleanup {
            table: rule.table.clone(),
            column: column.to_string(),
            detail: other.to_string(),
        },
    };
    RuleOutcome::Failed { error }
}
