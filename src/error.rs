//! Error taxonomy for schema evolution
//!
//! Schema and rebuild errors stop a migration run. Orphan cleanup errors are
//! collected per policy rule and reported alongside the successes.

use crate::rebuild::RebuildPhase;

/// Error type for every inspector, rebuilder, cleaner and seeder operation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A table or column does not exist, or a structural assumption is violated
    #[error("schema error on `{table}`: {message}")]
    Schema { table: String, message: String },

    /// The rename/create/copy/drop sequence failed
    #[error("rebuild of `{table}` failed during {phase}: {detail}")]
    Rebuild {
        table: String,
        phase: RebuildPhase,
        detail: String,
    },

    /// A single orphan remediation statement failed
    #[error("orphan cleanup of `{table}.{column}` failed: {detail}")]
    OrphanCleanup {
        table: String,
        column: String,
        detail: String,
    },

    /// A default-data insert failed for a reason other than "already there"
    #[error("seeding `{table}` failed: {source}")]
    Seed {
        table: String,
        #[source]
        source: diesel::result::Error,
    },

    /// The migration registry is inconsistent (duplicate name, unknown dependency, cycle)
    #[error("migration registry: {0}")]
    Registry(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn schema(table: &str, message: impl Into<String>) -> Self {
        Error::Schema {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn rebuild(table: &str, phase: RebuildPhase, detail: impl ToString) -> Self {
        Error::Rebuild {
            table: table.to_string(),
            phase,
            detail: detail.to_string(),
        }
    }

    /// Name of the table the error is about, when there is one
    pub fn table(&self) -> Option<&str> {
        match self {
            Error::Schema { table, .. }
            | Error::Rebuild { table, .. }
            | Error::OrphanCleanup { table, .. }
            | Error::Seed { table, .. } => Some(table),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_table() {
        let err = Error::schema("animal", "column `raza` does not exist");
        assert_eq!(err.table(), Some("animal"));
        assert!(err.to_string().contains("`animal`"));

        let err = Error::rebuild("peso", RebuildPhase::Copy, "UNIQUE constraint failed");
        assert!(err.to_string().contains("peso"));
        assert!(err.to_string().contains("copy"));
        assert!(err.to_string().contains("UNIQUE constraint failed"));
    }

    #[test]
    fn test_registry_errors_have_no_table() {
        let err = Error::Registry("cycle between a and b".to_string());
        assert_eq!(err.table(), None);
    }
}
