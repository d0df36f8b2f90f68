//! fincafacil-migrate - Schema evolution and referential repair for FincaFácil
//!
//! Rebuild SQLite tables whose foreign keys need a different ON DELETE
//! policy, repair references that point at rows which no longer exist, and
//! make sure the default rows the application relies on are present.
//!
//! # Components
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`inspector`] | Read columns, foreign keys, indexes and triggers from the live catalog |
//! | [`rebuild`] | Rename / create / copy / drop a table into a new definition |
//! | [`orphans`] | NULL out or delete references with no parent row |
//! | [`seed`] | Insert default rows when missing |
//! | [`registry`] | Ordered, recorded migration steps |
//! | [`farm`] | The FincaFácil catalog: policies, seeds and built-in steps |
//!
//! # Quick Start
//!
//! ```no_run
//! use fincafacil_migrate::{farm, Database, RunOptions};
//!
//! let db = Database::open_at("database/fincafacil.db").unwrap();
//! let mut conn = db.conn().unwrap();
//!
//! // Normalise foreign keys, then repair and seed
//! let report = farm::registry().run(&mut conn, &RunOptions::default()).unwrap();
//! println!("steps: {}, rows copied: {}", report.steps.len(), report.rows_migrated());
//!
//! fincafacil_migrate::seed::ensure_defaults(&mut conn, &farm::default_seeds()).unwrap();
//! ```

pub mod config;
pub mod db;
pub mod derive;
pub mod error;
pub mod farm;
pub mod inspector;
pub mod model;
pub mod orphans;
pub mod rebuild;
pub mod registry;
pub mod schema;
pub mod seed;
pub mod sql;

pub use config::Config;
pub use db::{resolve_db_path, Database, DbConn, DB_PATH_ENV, DEFAULT_DB_PATH};
pub use derive::DerivedDefinition;
pub use error::{Error, Result};
pub use model::{ColumnDefinition, ForeignKeyDefinition, IndexDefinition, OnDelete, TableDefinition};
pub use orphans::{OrphanAction, OrphanPolicy, OrphanRule, RemediationReport};
pub use rebuild::{ColumnMapping, RebuildOptions, RebuildPhase, RebuildReport};
pub use registry::{MigrationRegistry, MigrationReport, MigrationStep, RunOptions, TargetDefinition};
pub use seed::{Seed, SeedReport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify core types are re-exported from crate root
        let _ = DB_PATH_ENV;
        let _ = ColumnMapping::carry_over();
        let _ = OrphanPolicy::new();
        assert_eq!(OnDelete::SetNull.as_sql(), "SET NULL");
    }
}
