//! Migration registry
//!
//! An explicit list of named schema-evolution steps, run in dependency order
//! (declaration order among independent steps). Every step that has run is
//! recorded in `schema_migrations`, so a second run only does new work.
//!
//! # Step lifecycle
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `rebuilt` | The table was rebuilt into the step's target definition |
//! | `already_normalized` | The live table already matched; nothing rebuilt |
//! | `already_applied` | Recorded earlier with the same checksum |
//! | `drifted` | Recorded earlier, but the step's definition has since changed |
//! | `table_missing` | The table does not exist in this database; not recorded |

use crate::derive::DerivedDefinition;
use crate::error::{Error, Result};
use crate::inspector;
use crate::model::TableDefinition;
use crate::orphans::{self, OrphanPolicy, RemediationReport};
use crate::rebuild::{self, ColumnMapping, LeftoverRecovery, RebuildOptions, RebuildReport, StaleCopy};
use crate::schema::schema_migrations;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// Name of the applied-migrations marker table
pub const MARKER_TABLE: &str = "schema_migrations";

const CREATE_MARKER_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        checksum TEXT NOT NULL,
        applied_at TEXT NOT NULL,
        rows_migrated INTEGER NOT NULL DEFAULT 0,
        outcome TEXT NOT NULL
    );
"#;

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable marker row
#[derive(Insertable)]
#[diesel(table_name = schema_migrations)]
struct NewAppliedMigration<'a> {
    name: &'a str,
    checksum: &'a str,
    applied_at: &'a str,
    rows_migrated: i64,
    outcome: &'a str,
}

/// Queryable marker row
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = schema_migrations)]
pub struct AppliedMigration {
    pub id: i32,
    pub name: String,
    pub checksum: String,
    pub applied_at: String,
    pub rows_migrated: i64,
    pub outcome: String,
}

// ============================================================================
// Steps
// ============================================================================

/// The state a step drives its table into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDefinition {
    Fixed(TableDefinition),
    Derived(DerivedDefinition),
}

impl TargetDefinition {
    pub fn table(&self) -> &str {
        match self {
            TargetDefinition::Fixed(def) => &def.name,
            TargetDefinition::Derived(derived) => &derived.table,
        }
    }

    pub fn resolve(&self, conn: &mut SqliteConnection) -> Result<TableDefinition> {
        match self {
            TargetDefinition::Fixed(def) => Ok(def.clone()),
            TargetDefinition::Derived(derived) => derived.resolve(conn),
        }
    }

    fn describe(&self) -> String {
        match self {
            TargetDefinition::Fixed(def) => {
                let mut text = def.create_sql();
                for index in def.index_sql() {
                    text.push('\n');
                    text.push_str(&index);
                }
                text
            }
            TargetDefinition::Derived(derived) => derived.describe(),
        }
    }
}

/// One named schema-evolution step
#[derive(Debug, Clone)]
pub struct MigrationStep {
    pub name: String,
    pub description: String,
    pub target: TargetDefinition,
    pub mapping: ColumnMapping,
    pub depends_on: Vec<String>,
    /// Orphan rules to run right after this step rebuilds its table
    pub cleanup: Option<OrphanPolicy>,
}

impl MigrationStep {
    pub fn new(name: &str, description: &str, target: TargetDefinition) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            target,
            mapping: ColumnMapping::carry_over(),
            depends_on: Vec::new(),
            cleanup: None,
        }
    }

    pub fn mapping(mut self, mapping: ColumnMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn cleanup(mut self, policy: OrphanPolicy) -> Self {
        self.cleanup = Some(policy);
        self
    }

    pub fn table(&self) -> &str {
        self.target.table()
    }

    /// SHA-256 over the step's definition and mapping
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.target.describe().as_bytes());
        hasher.update(b"\n--\n");
        hasher.update(self.mapping.describe().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Rebuilt,
    AlreadyNormalized,
    AlreadyApplied,
    Drifted,
    TableMissing,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Rebuilt => "rebuilt",
            StepOutcome::AlreadyNormalized => "already_normalized",
            StepOutcome::AlreadyApplied => "already_applied",
            StepOutcome::Drifted => "drifted",
            StepOutcome::TableMissing => "table_missing",
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct StepResult {
    pub name: String,
    pub table: String,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild: Option<RebuildReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<RemediationReport>,
}

#[derive(Debug, Default, Serialize)]
pub struct MigrationReport {
    /// `*_rebuild_tmp` tables healed before any step ran
    pub leftovers: Vec<(String, LeftoverRecovery)>,
    pub steps: Vec<StepResult>,
    /// `*_old` / `*_backup` copies nothing references once the steps ran
    pub stale_copies: Vec<StaleCopy>,
}

impl MigrationReport {
    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }

    pub fn rows_migrated(&self) -> usize {
        self.steps
            .iter()
            .filter_map(|s| s.rebuild.as_ref())
            .map(|r| r.rows_migrated)
            .sum()
    }
}

/// Where a step stands without running anything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Applied,
    Drifted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepStatus {
    pub name: String,
    pub table: String,
    pub description: String,
    pub state: StepState,
    pub applied: Option<AppliedMigration>,
}

/// Knobs for [`MigrationRegistry::run`]
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run each step's orphan policy after a fresh rebuild
    pub clean: bool,
    pub rebuild: RebuildOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            clean: true,
            rebuild: RebuildOptions::default(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    steps: Vec<MigrationStep>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: MigrationStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Steps in execution order
    ///
    /// Fails on duplicate names, dependencies on unknown steps, and cycles.
    pub fn ordered(&self) -> Result<Vec<&MigrationStep>> {
        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(Error::Registry(format!("duplicate step `{}`", step.name)));
            }
        }
        for step in &self.steps {
            if let Some(missing) = step.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(Error::Registry(format!(
                    "step `{}` depends on unknown step `{}`",
                    step.name, missing
                )));
            }
        }

        let mut done: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&MigrationStep> = self.steps.iter().collect();
        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .position(|s| s.depends_on.iter().all(|d| done.contains(d.as_str())));
            match ready {
                Some(i) => {
                    let step = remaining.remove(i);
                    done.insert(step.name.as_str());
                    order.push(step);
                }
                None => {
                    let stuck: Vec<&str> = remaining.iter().map(|s| s.name.as_str()).collect();
                    return Err(Error::Registry(format!(
                        "dependency cycle among {}",
                        stuck.join(", ")
                    )));
                }
            }
        }
        Ok(order)
    }

    /// Create the marker table if this database has never been migrated
    pub fn ensure_marker_table(conn: &mut SqliteConnection) -> Result<()> {
        conn.batch_execute(CREATE_MARKER_TABLE)?;
        Ok(())
    }

    /// Recorded steps, oldest first; empty when the marker table is absent
    pub fn applied(conn: &mut SqliteConnection) -> Result<Vec<AppliedMigration>> {
        if !inspector::table_exists(conn, MARKER_TABLE)? {
            return Ok(Vec::new());
        }
        let rows = schema_migrations::table
            .order(schema_migrations::id.asc())
            .select(AppliedMigration::as_select())
            .load(conn)?;
        Ok(rows)
    }

    /// Pending / applied / drifted, per step, in execution order
    pub fn status(&self, conn: &mut SqliteConnection) -> Result<Vec<StepStatus>> {
        let recorded = applied_by_name(conn)?;
        Ok(self
            .ordered()?
            .into_iter()
            .map(|step| {
                let applied = recorded.get(&step.name).cloned();
                let state = match &applied {
                    None => StepState::Pending,
                    Some(row) if row.checksum == step.checksum() => StepState::Applied,
                    Some(_) => StepState::Drifted,
                };
                StepStatus {
                    name: step.name.clone(),
                    table: step.table().to_string(),
                    description: step.description.clone(),
                    state,
                    applied,
                }
            })
            .collect())
    }

    /// Run every step not yet recorded
    pub fn run(&self, conn: &mut SqliteConnection, options: &RunOptions) -> Result<MigrationReport> {
        let order = self.ordered()?;
        Self::ensure_marker_table(conn)?;
        let recorded = applied_by_name(conn)?;

        let mut report = MigrationReport {
            leftovers: rebuild::sweep_leftovers(conn)?,
            steps: Vec::with_capacity(order.len()),
            stale_copies: Vec::new(),
        };

        for step in order {
            let checksum = step.checksum();
            let mut result = StepResult {
                name: step.name.clone(),
                table: step.table().to_string(),
                outcome: StepOutcome::AlreadyApplied,
                rebuild: None,
                cleanup: None,
            };

            if let Some(row) = recorded.get(&step.name) {
                if row.checksum != checksum {
                    tracing::warn!(
                        step = %step.name,
                        recorded = %row.checksum,
                        current = %checksum,
                        "applied step has changed since it ran"
                    );
                    result.outcome = StepOutcome::Drifted;
                }
                report.steps.push(result);
                continue;
            }

            if !inspector::table_exists(conn, step.table())? {
                tracing::info!(step = %step.name, table = step.table(), "table absent, step left pending");
                result.outcome = StepOutcome::TableMissing;
                report.steps.push(result);
                continue;
            }

            let definition = step.target.resolve(conn)?;
            if inspector::is_already_normalized(conn, step.table(), &definition)? {
                tracing::info!(step = %step.name, "already normalized");
                record(conn, &step.name, &checksum, 0, StepOutcome::AlreadyNormalized)?;
                result.outcome = StepOutcome::AlreadyNormalized;
                report.steps.push(result);
                continue;
            }

            let rebuilt = rebuild::rebuild_with(conn, step.table(), &definition, &step.mapping, &options.rebuild)?;
            record(conn, &step.name, &checksum, rebuilt.rows_migrated as i64, StepOutcome::Rebuilt)?;
            result.outcome = StepOutcome::Rebuilt;
            result.rebuild = Some(rebuilt);

            if options.clean {
                if let Some(policy) = &step.cleanup {
                    result.cleanup = Some(orphans::clean(conn, policy));
                }
            }
            report.steps.push(result);
        }

        report.stale_copies = rebuild::find_stale_copies(conn)?;
        for copy in &report.stale_copies {
            tracing::warn!(table = %copy.table, base = %copy.base_table, "unreferenced stale copy left in the database");
        }
        Ok(report)
    }
}

fn applied_by_name(conn: &mut SqliteConnection) -> Result<HashMap<String, AppliedMigration>> {
    Ok(MigrationRegistry::applied(conn)?
        .into_iter()
        .map(|row| (row.name.clone(), row))
        .collect())
}

fn record(
    conn: &mut SqliteConnection,
    name: &str,
    checksum: &str,
    rows_migrated: i64,
    outcome: StepOutcome,
) -> Result<()> {
    let now = chrono::Local::now().to_rfc3339();
    let row = NewAppliedMigration {
        name,
        checksum,
        applied_at: &now,
        rows_migrated,
        outcome: outcome.as_str(),
    };
    diesel::insert_into(schema_migrations::table)
        .values(&row)
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_conn;
    use crate::model::{ColumnDefinition, OnDelete};
    use crate::orphans::OrphanRule;

    fn farm() -> SqliteConnection {
        let mut conn = memory_conn();
        conn.batch_execute(
            r#"
            CREATE TABLE finca (id INTEGER PRIMARY KEY AUTOINCREMENT, nombre TEXT NOT NULL);
            CREATE TABLE potrero (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                finca_id INTEGER REFERENCES finca (id),
                nombre TEXT NOT NULL
            );
            INSERT INTO finca (id, nombre) VALUES (1, 'Principal');
            PRAGMA foreign_keys = OFF;
            INSERT INTO potrero (id, finca_id, nombre) VALUES (1, 1, 'Bajo'), (2, 99, 'Loma');
            PRAGMA foreign_keys = ON;
            "#,
        )
        .unwrap();
        conn
    }

    fn potrero_set_null() -> MigrationStep {
        MigrationStep::new(
            "001_potrero_finca_set_null",
            "potrero.finca_id -> finca ON DELETE SET NULL",
            TargetDefinition::Derived(DerivedDefinition::new("potrero").foreign_key(
                &["finca_id", "id_finca"],
                "finca",
                OnDelete::SetNull,
            )),
        )
        .cleanup(OrphanPolicy::new().rule(OrphanRule::null_out("potrero", &["finca_id", "id_finca"])))
    }

    fn named(name: &str, deps: &[&str]) -> MigrationStep {
        MigrationStep::new(name, "", TargetDefinition::Derived(DerivedDefinition::new("finca"))).depends_on(deps)
    }

    #[test]
    fn test_order_respects_dependencies_then_declaration() {
        let registry = MigrationRegistry::new()
            .step(named("c", &["b"]))
            .step(named("a", &[]))
            .step(named("b", &["a"]))
            .step(named("d", &[]));
        let order: Vec<&str> = registry.ordered().unwrap().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_registry_errors() {
        let dup = MigrationRegistry::new().step(named("a", &[])).step(named("a", &[]));
        assert!(matches!(dup.ordered(), Err(Error::Registry(msg)) if msg.contains("duplicate")));

        let unknown = MigrationRegistry::new().step(named("a", &["zzz"]));
        assert!(matches!(unknown.ordered(), Err(Error::Registry(msg)) if msg.contains("zzz")));

        let cycle = MigrationRegistry::new().step(named("a", &["b"])).step(named("b", &["a"]));
        assert!(matches!(cycle.ordered(), Err(Error::Registry(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_run_rebuilds_records_and_cleans() {
        let mut conn = farm();
        let registry = MigrationRegistry::new().step(potrero_set_null());

        let report = registry.run(&mut conn, &RunOptions::default()).unwrap();
        assert_eq!(report.count(StepOutcome::Rebuilt), 1);
        assert_eq!(report.rows_migrated(), 2);
        let step = &report.steps[0];
        assert_eq!(step.cleanup.as_ref().unwrap().affected("potrero", "finca_id"), Some(1));

        let keys = inspector::get_foreign_keys(&mut conn, "potrero").unwrap();
        assert_eq!(keys[0].on_delete, OnDelete::SetNull);

        let applied = MigrationRegistry::applied(&mut conn).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].outcome, "rebuilt");
        assert_eq!(applied[0].rows_migrated, 2);
        assert_eq!(applied[0].checksum, potrero_set_null().checksum());
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let mut conn = farm();
        let registry = MigrationRegistry::new().step(potrero_set_null());
        registry.run(&mut conn, &RunOptions::default()).unwrap();

        let again = registry.run(&mut conn, &RunOptions::default()).unwrap();
        assert_eq!(again.count(StepOutcome::AlreadyApplied), 1);
        assert_eq!(MigrationRegistry::applied(&mut conn).unwrap().len(), 1);
        assert_eq!(inspector::count_rows(&mut conn, "potrero").unwrap(), 2);
    }

    #[test]
    fn test_normalized_table_is_recorded_without_rebuild() {
        let mut conn = farm();
        let definition = potrero_set_null().target.resolve(&mut conn).unwrap();
        rebuild::rebuild(&mut conn, "potrero", &definition, &ColumnMapping::carry_over()).unwrap();

        let report = MigrationRegistry::new()
            .step(potrero_set_null())
            .run(&mut conn, &RunOptions::default())
            .unwrap();
        assert_eq!(report.steps[0].outcome, StepOutcome::AlreadyNormalized);
        assert!(report.steps[0].rebuild.is_none());
        assert_eq!(MigrationRegistry::applied(&mut conn).unwrap()[0].outcome, "already_normalized");
    }

    #[test]
    fn test_status_reports_drift() {
        let mut conn = farm();
        let registry = MigrationRegistry::new().step(potrero_set_null());
        assert_eq!(registry.status(&mut conn).unwrap()[0].state, StepState::Pending);

        registry.run(&mut conn, &RunOptions::default()).unwrap();
        assert_eq!(registry.status(&mut conn).unwrap()[0].state, StepState::Applied);

        let changed = MigrationRegistry::new().step(potrero_set_null().mapping(
            ColumnMapping::carry_over().use_default("nombre"),
        ));
        assert_eq!(changed.status(&mut conn).unwrap()[0].state, StepState::Drifted);
        let report = changed.run(&mut conn, &RunOptions::default()).unwrap();
        assert_eq!(report.steps[0].outcome, StepOutcome::Drifted);
    }

    #[test]
    fn test_missing_table_stays_pending() {
        let mut conn = farm();
        let registry = MigrationRegistry::new().step(MigrationStep::new(
            "002_lote_finca_set_null",
            "",
            TargetDefinition::Derived(DerivedDefinition::new("lote").foreign_key(&["finca_id"], "finca", OnDelete::SetNull)),
        ));
        let report = registry.run(&mut conn, &RunOptions::default()).unwrap();
        assert_eq!(report.steps[0].outcome, StepOutcome::TableMissing);
        assert!(MigrationRegistry::applied(&mut conn).unwrap().is_empty());
    }

    #[test]
    fn test_run_reports_unreferenced_stale_copies() {
        let mut conn = farm();
        conn.batch_execute(
            "CREATE TABLE finca_old (id INTEGER PRIMARY KEY, nombre TEXT);
             CREATE TABLE visita (id INTEGER PRIMARY KEY, finca_id INTEGER REFERENCES finca_old (id));",
        )
        .unwrap();
        let registry = MigrationRegistry::new().step(potrero_set_null()).step(MigrationStep::new(
            "002_visita_retarget",
            "",
            TargetDefinition::Derived(DerivedDefinition::new("visita").retarget_stale_refs()),
        ));

        let report = registry.run(&mut conn, &RunOptions::default()).unwrap();
        let stale: Vec<&str> = report.stale_copies.iter().map(|c| c.table.as_str()).collect();
        assert_eq!(stale, vec!["finca_old"]);
        assert_eq!(report.stale_copies[0].base_table, "finca");
        // Reported, never dropped by the run itself
        assert!(inspector::table_exists(&mut conn, "finca_old").unwrap());
    }

    #[test]
    fn test_fixed_definition_and_no_clean() {
        let mut conn = farm();
        let fixed = TableDefinition::new("potrero")
            .with_column(ColumnDefinition::id())
            .with_column(ColumnDefinition::new("finca_id", "INTEGER"))
            .with_column(ColumnDefinition::new("nombre", "TEXT").not_null())
            .with_foreign_key("finca_id", "finca", "id", OnDelete::Cascade)
            .with_index("idx_potrero_finca", &["finca_id"], false);
        let step = MigrationStep::new("001_fixed", "", TargetDefinition::Fixed(fixed))
            .cleanup(OrphanPolicy::new().rule(OrphanRule::delete_row("potrero", &["finca_id"])));

        let report = MigrationRegistry::new()
            .step(step)
            .run(&mut conn, &RunOptions { clean: false, ..RunOptions::default() })
            .unwrap();
        assert!(report.steps[0].cleanup.is_none());
        assert_eq!(report.steps[0].rebuild.as_ref().unwrap().foreign_key_violations, 1);
        assert_eq!(inspector::count_rows(&mut conn, "potrero").unwrap(), 2);
        assert_eq!(inspector::get_indexes(&mut conn, "potrero").unwrap()[0].name, "idx_potrero_finca");
    }
}
