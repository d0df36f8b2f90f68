//! Default-data seeder
//!
//! Each seed is an existence check plus an insert. The insert runs only when the check
//! finds nothing, and losing a race to a concurrent insert (a UNIQUE
//! violation) counts as the row already being there.

use crate::db::CountRow;
use crate::error::{Error, Result};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use serde::Serialize;

/// A default row that must exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub table: String,
    /// Query returning at least one row when the default is already present
    pub check: String,
    pub insert: String,
}

impl Seed {
    pub fn new(table: &str, check: &str, insert: &str) -> Self {
        Self {
            table: table.to_string(),
            check: check.to_string(),
            insert: insert.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedResult {
    pub table: String,
    pub outcome: SeedOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedReport {
    pub results: Vec<SeedResult>,
}

impl SeedReport {
    pub fn inserted(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == SeedOutcome::Inserted)
            .count()
    }
}

/// Make sure every seed's row exists
///
/// Seeds are applied independently; there is no transaction spanning them.
pub fn ensure_defaults(conn: &mut SqliteConnection, seeds: &[Seed]) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for seed in seeds {
        let outcome = ensure_one(conn, seed)?;
        if outcome == SeedOutcome::Inserted {
            tracing::info!(table = %seed.table, "default row inserted");
        }
        report.results.push(SeedResult {
            table: seed.table.clone(),
            outcome,
        });
    }
    Ok(report)
}

fn ensure_one(conn: &mut SqliteConnection, seed: &Seed) -> Result<SeedOutcome> {
    let seed_error = |source| Error::Seed {
        table: seed.table.clone(),
        source,
    };

    let check = seed.check.trim().trim_end_matches(';');
    let rows: Vec<CountRow> = diesel::sql_query(format!("SELECT COUNT(*) AS count FROM ({})", check))
        .load(conn)
        .map_err(seed_error)?;
    if rows.first().map(|r| r.count).unwrap_or(0) > 0 {
        return Ok(SeedOutcome::AlreadyPresent);
    }

    match diesel::sql_query(seed.insert.as_str()).execute(conn) {
        Ok(_) => Ok(SeedOutcome::Inserted),
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)) => {
            tracing::debug!(table = %seed.table, detail = info.message(), "seed already present");
            Ok(SeedOutcome::AlreadyPresent)
        }
        Err(e) => Err(seed_error(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_conn;
    use crate::inspector::count_rows;
    use diesel::connection::SimpleConnection;
    use proptest::prelude::*;

    fn catalog() -> SqliteConnection {
        let mut conn = memory_conn();
        conn.batch_execute(
            "CREATE TABLE finca (id INTEGER PRIMARY KEY, codigo TEXT UNIQUE NOT NULL, nombre TEXT NOT NULL);
             CREATE TABLE raza (id INTEGER PRIMARY KEY, codigo TEXT UNIQUE, nombre TEXT);",
        )
        .unwrap();
        conn
    }

    fn seeds() -> Vec<Seed> {
        vec![
            Seed::new(
                "finca",
                "SELECT 1 FROM finca WHERE codigo = 'F001'",
                "INSERT INTO finca (codigo, nombre) VALUES ('F001', 'Finca Principal')",
            ),
            Seed::new(
                "raza",
                "SELECT 1 FROM raza WHERE codigo = 'SIN-RAZA';",
                "INSERT INTO raza (codigo, nombre) VALUES ('SIN-RAZA', 'Sin Raza Definida')",
            ),
        ]
    }

    #[test]
    fn test_inserts_then_reports_present() {
        let mut conn = catalog();
        let first = ensure_defaults(&mut conn, &seeds()).unwrap();
        assert_eq!(first.inserted(), 2);

        let second = ensure_defaults(&mut conn, &seeds()).unwrap();
        assert_eq!(second.inserted(), 0);
        assert!(second.results.iter().all(|r| r.outcome == SeedOutcome::AlreadyPresent));
    }

    #[test]
    fn test_unique_violation_counts_as_present() {
        let mut conn = catalog();
        conn.batch_execute("INSERT INTO finca (codigo, nombre) VALUES ('F001', 'Otra');").unwrap();
        // Check that never sees the row, so only the UNIQUE constraint catches it
        let racing = Seed::new(
            "finca",
            "SELECT 1 FROM finca WHERE 0",
            "INSERT INTO finca (codigo, nombre) VALUES ('F001', 'Finca Principal')",
        );
        let report = ensure_defaults(&mut conn, &[racing]).unwrap();
        assert_eq!(report.results[0].outcome, SeedOutcome::AlreadyPresent);
        assert_eq!(count_rows(&mut conn, "finca").unwrap(), 1);
    }

    #[test]
    fn test_other_failures_name_the_table() {
        let mut conn = catalog();
        let broken = Seed::new(
            "lote",
            "SELECT 1 FROM finca WHERE 0",
            "INSERT INTO lote (codigo) VALUES ('L001')",
        );
        let err = ensure_defaults(&mut conn, &[broken]).unwrap_err();
        assert!(matches!(err, Error::Seed { ref table, .. } if table == "lote"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn seeding_never_duplicates(runs in 1usize..6) {
            let mut conn = catalog();
            for _ in 0..runs {
                ensure_defaults(&mut conn, &seeds()).unwrap();
            }
            prop_assert_eq!(count_rows(&mut conn, "finca").unwrap(), 1);
            prop_assert_eq!(count_rows(&mut conn, "raza").unwrap(), 1);
        }
    }
}
