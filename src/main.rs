use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use diesel::sqlite::SqliteConnection;
use fincafacil_migrate::inspector::{self, ForeignKeyViolation, SchemaObject, StaleReference};
use fincafacil_migrate::orphans::{self, RemediationReport, RuleOutcome};
use fincafacil_migrate::rebuild::{self, LeftoverRecovery};
use fincafacil_migrate::registry::{StepOutcome, StepState};
use fincafacil_migrate::seed::{self, SeedOutcome};
use fincafacil_migrate::{
    farm, resolve_db_path, ColumnDefinition, ColumnMapping, Config, Database, DerivedDefinition,
    Error, ForeignKeyDefinition, MigrationRegistry, RebuildOptions, Result, RunOptions,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a tracing filter directive
const LOG_ENV: &str = "FINCAFACIL_LOG";

#[derive(Parser, Debug)]
#[command(name = "finca-migrate")]
#[command(author, version, about = "Schema evolution and foreign-key repair for the FincaFácil database")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// SQLite database to operate on (FINCAFACIL_DB_PATH takes precedence)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log every executed statement
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a table's columns, foreign keys, indexes and triggers
    Inspect {
        table: String,

        #[arg(long)]
        json: bool,
    },
    /// Report foreign-key violations and references to leftover tables
    Check {
        #[arg(long)]
        json: bool,

        /// Only check this table
        #[arg(long)]
        table: Option<String>,
    },
    /// Run the built-in foreign-key normalisation steps
    Migrate {
        /// Don't remediate orphaned references
        #[arg(long)]
        no_clean: bool,

        /// Don't insert default rows
        #[arg(long)]
        no_seed: bool,

        /// Drop `*_old` / `*_backup` copies that nothing references any more
        #[arg(long)]
        drop_stale_copies: bool,
    },
    /// Show which migration steps have been applied
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Remediate orphaned references with the reviewed policy
    Clean {
        /// Count orphans without changing anything
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },
    /// Insert default rows into empty catalog tables
    Seed,
    /// Rebuild one table from its own catalog, retargeting stale references
    Rebuild { table: String },
    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Command::Completion { shell } = args.command {
        clap_complete::generate(shell, &mut Args::command(), "finca-migrate", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(args.verbose, &config);

    match run(args, &config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool, config: &Config) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.log.level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args, config: &Config) -> Result<ExitCode> {
    let path = resolve_db_path(args.db.as_deref(), config);
    if !path.exists() {
        return Err(Error::Connection(format!("database not found: {}", path.display())));
    }
    let db = Database::open_with(&path, config)?;
    let mut conn = db.conn()?;
    let conn: &mut SqliteConnection = &mut conn;

    match args.command {
        Command::Inspect { table, json } => inspect(conn, &table, json),
        Command::Check { json, table } => check(conn, table.as_deref(), json),
        Command::Migrate {
            no_clean,
            no_seed,
            drop_stale_copies,
        } => migrate(conn, config, !no_clean, !no_seed, drop_stale_copies),
        Command::Status { json } => status(conn, json),
        Command::Clean { dry_run, json } => clean(conn, dry_run, json),
        Command::Seed => seed_defaults(conn),
        Command::Rebuild { table } => rebuild_table(conn, config, &table),
        Command::Completion { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// ============================================================================
// inspect
// ============================================================================

#[derive(Serialize)]
struct TableReport {
    table: String,
    rows: i64,
    columns: Vec<ColumnDefinition>,
    foreign_keys: Vec<ForeignKeyDefinition>,
    indexes: Vec<SchemaObject>,
    triggers: Vec<SchemaObject>,
}

fn inspect(conn: &mut SqliteConnection, table: &str, json: bool) -> Result<ExitCode> {
    let report = TableReport {
        table: table.to_string(),
        rows: inspector::count_rows(conn, table)?,
        columns: inspector::get_columns(conn, table)?,
        foreign_keys: inspector::get_foreign_keys(conn, table)?,
        indexes: inspector::get_indexes(conn, table)?,
        triggers: inspector::get_triggers(conn, table)?,
    };
    if json {
        print_json(&report);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{} {} ({} rows)", "Table".bold(), report.table.cyan(), report.rows);
    println!("\n  {}", "Columns".bold());
    for column in &report.columns {
        let mut flags = Vec::new();
        if column.primary_key {
            flags.push("PRIMARY KEY".to_string());
        }
        if column.autoincrement {
            flags.push("AUTOINCREMENT".to_string());
        }
        if column.not_null {
            flags.push("NOT NULL".to_string());
        }
        if let Some(default) = &column.default {
            flags.push(format!("DEFAULT {}", default));
        }
        println!("    {:<24} {:<10} {}", column.name, column.sql_type, flags.join(" ").dimmed());
    }
    if !report.foreign_keys.is_empty() {
        println!("\n  {}", "Foreign keys".bold());
        for key in &report.foreign_keys {
            println!(
                "    {} -> {}({}) ON DELETE {}",
                key.column,
                key.references_table,
                key.references_column,
                key.on_delete.to_string().yellow()
            );
        }
    }
    if !report.indexes.is_empty() {
        println!("\n  {}", "Indexes".bold());
        for index in &report.indexes {
            println!("    {}", index.name);
        }
    }
    if !report.triggers.is_empty() {
        println!("\n  {}", "Triggers".bold());
        for trigger in &report.triggers {
            println!("    {}", trigger.name);
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// check
// ============================================================================

#[derive(Serialize)]
struct IntegrityReport {
    ok: bool,
    violations: Vec<ForeignKeyViolation>,
    stale_references: Vec<StaleReference>,
}

fn check(conn: &mut SqliteConnection, table: Option<&str>, json: bool) -> Result<ExitCode> {
    let violations = inspector::foreign_key_check(conn, table)?;
    let stale_references: Vec<StaleReference> = inspector::stale_references(conn)?
        .into_iter()
        .filter(|s| table.map_or(true, |t| s.table.eq_ignore_ascii_case(t)))
        .collect();
    let report = IntegrityReport {
        ok: violations.is_empty() && stale_references.is_empty(),
        violations,
        stale_references,
    };

    if json {
        print_json(&report);
    } else if report.ok {
        println!("{}", "No referential integrity problems found".green());
    } else {
        for v in &report.violations {
            let row = v.rowid.map(|r| r.to_string()).unwrap_or_else(|| "?".to_string());
            println!("  {} {} row {} -> missing {} row", "violation".red(), v.table, row, v.parent);
        }
        for s in &report.stale_references {
            println!(
                "  {} {}.{} -> {} (should be {})",
                "stale".yellow(),
                s.table,
                s.column,
                s.references_table,
                s.base_table
            );
        }
        println!(
            "\n{} violations, {} stale references",
            report.violations.len(),
            report.stale_references.len()
        );
    }

    Ok(if report.ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

// ============================================================================
// migrate / status
// ============================================================================

fn migrate(
    conn: &mut SqliteConnection,
    config: &Config,
    clean_orphans: bool,
    seed: bool,
    drop_stale_copies: bool,
) -> Result<ExitCode> {
    let options = RunOptions {
        clean: clean_orphans,
        rebuild: RebuildOptions {
            verify_foreign_keys: config.rebuild.verify_foreign_keys,
        },
    };
    let report = farm::registry().run(conn, &options)?;

    for (temp, action) in &report.leftovers {
        let what = match action {
            LeftoverRecovery::RestoredFromTemp => "restored table from",
            LeftoverRecovery::DroppedStaleTemp => "dropped stale",
            LeftoverRecovery::None => continue,
        };
        println!("  {} {} {}", "Healed".yellow(), what, temp);
    }
    for step in &report.steps {
        let label = match step.outcome {
            StepOutcome::Rebuilt => "Rebuilt".green(),
            StepOutcome::AlreadyNormalized => "Normal".green(),
            StepOutcome::AlreadyApplied => "Applied".dimmed(),
            StepOutcome::Drifted => "Drifted".yellow(),
            StepOutcome::TableMissing => "Missing".dimmed(),
        };
        match &step.rebuild {
            Some(rebuilt) => println!("  {:>8} {} ({} rows)", label, step.name, rebuilt.rows_migrated),
            None => println!("  {:>8} {}", label, step.name),
        }
        if let Some(cleanup) = &step.cleanup {
            print_remediation(cleanup, true);
        }
    }

    for copy in &report.stale_copies {
        if drop_stale_copies {
            rebuild::drop_stale_copy(conn, copy)?;
            println!("  {} {} ({} rows)", "Dropped".yellow(), copy.table, copy.rows);
        } else {
            println!(
                "  {} {} is an unreferenced copy of {} ({} rows); drop it with --drop-stale-copies",
                "Stale".yellow(),
                copy.table,
                copy.base_table,
                copy.rows
            );
        }
    }

    let mut failed = false;
    if clean_orphans {
        let sweep = orphans::clean(conn, &farm::orphan_policy());
        print_remediation(&sweep, true);
        failed |= sweep.has_failures();
    }
    if seed {
        seed_defaults(conn)?;
    }

    println!(
        "\n{} {} rebuilt, {} rows copied",
        "Migration finished:".green().bold(),
        report.count(StepOutcome::Rebuilt),
        report.rows_migrated()
    );
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn status(conn: &mut SqliteConnection, json: bool) -> Result<ExitCode> {
    let steps = farm::registry().status(conn)?;
    if json {
        print_json(&steps);
        return Ok(ExitCode::SUCCESS);
    }

    let applied = MigrationRegistry::applied(conn)?;
    println!("{} ({} recorded)", "Migration steps".bold(), applied.len());
    for step in &steps {
        let state = match step.state {
            StepState::Pending => "pending".yellow(),
            StepState::Applied => "applied".green(),
            StepState::Drifted => "drifted".red(),
        };
        let when = step
            .applied
            .as_ref()
            .map(|a| format!("{} {}", a.applied_at, a.outcome))
            .unwrap_or_default();
        println!("  {:<8} {:<40} {}", state, step.name, when.dimmed());
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// clean / seed / rebuild
// ============================================================================

fn print_remediation(report: &RemediationReport, only_changes: bool) {
    for entry in &report.entries {
        match &entry.outcome {
            RuleOutcome::Remediated { rows_affected } if *rows_affected > 0 || !only_changes => println!(
                "  {} {}.{} {} ({} rows)",
                "Cleaned".green(),
                entry.table,
                entry.column,
                entry.action,
                rows_affected
            ),
            RuleOutcome::Found { orphans } => println!(
                "  {:>7} {}.{} would {} {} rows",
                "Found".cyan(),
                entry.table,
                entry.column,
                entry.action,
                orphans
            ),
            RuleOutcome::Skipped { reason } if !only_changes => {
                println!("  {:>7} {} ({})", "Skipped".dimmed(), entry.table, reason)
            }
            RuleOutcome::Failed { error } => println!("  {:>7} {}", "Failed".red(), error),
            _ => {}
        }
    }
}

fn clean(conn: &mut SqliteConnection, dry_run: bool, json: bool) -> Result<ExitCode> {
    let policy = farm::orphan_policy();
    let report = if dry_run {
        orphans::scan(conn, &policy)
    } else {
        orphans::clean(conn, &policy)
    };

    if json {
        print_json(&report);
    } else {
        print_remediation(&report, false);
        let verb = if dry_run { "found" } else { "remediated" };
        println!("\n{} orphaned references {}", report.total_affected(), verb);
    }
    Ok(if report.has_failures() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn seed_defaults(conn: &mut SqliteConnection) -> Result<ExitCode> {
    let mut seeds = Vec::new();
    for s in farm::default_seeds() {
        if inspector::table_exists(conn, &s.table)? {
            seeds.push(s);
        } else {
            println!("  {:>7} {} (table absent)", "Skipped".dimmed(), s.table);
        }
    }

    let report = seed::ensure_defaults(conn, &seeds)?;
    for result in &report.results {
        match result.outcome {
            SeedOutcome::Inserted => println!("  {:>7} default row in {}", "Seeded".green(), result.table),
            SeedOutcome::AlreadyPresent => println!("  {:>7} {}", "Present".dimmed(), result.table),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn rebuild_table(conn: &mut SqliteConnection, config: &Config, table: &str) -> Result<ExitCode> {
    let definition = DerivedDefinition::new(table).retarget_stale_refs().resolve(conn)?;
    let options = RebuildOptions {
        verify_foreign_keys: config.rebuild.verify_foreign_keys,
    };
    let report = rebuild::rebuild_with(conn, table, &definition, &ColumnMapping::carry_over(), &options)?;

    println!(
        "{} {} ({} rows, {} indexes, {} triggers)",
        "Rebuilt".green().bold(),
        report.table,
        report.rows_migrated,
        report.indexes_recreated.len(),
        report.triggers_recreated.len()
    );
    for skipped in &report.skipped_objects {
        println!("  {} {}", "Skipped".yellow(), skipped);
    }
    if report.foreign_key_violations > 0 {
        println!(
            "  {} {} rows reference missing parents; run `finca-migrate clean`",
            "Warning:".yellow(),
            report.foreign_key_violations
        );
    }
    Ok(ExitCode::SUCCESS)
}
