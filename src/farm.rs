//! The FincaFácil catalog: which references get which ON DELETE policy,
//! how dangling references are repaired, and which default rows must exist.
//!
//! | Reference | ON DELETE | Orphan action |
//! |-----------|-----------|---------------|
//! | `potrero.id_finca` | SET NULL | NULL_OUT |
//! | `lote.finca_id` | SET NULL | NULL_OUT |
//! | `sector.finca_id`, `insumo.id_finca`, `herramienta.id_finca` | SET NULL | NULL_OUT |
//! | `animal.{id_finca, raza_id, id_potrero, lote_id}` | SET NULL | NULL_OUT |
//! | `animal.{id_padre, id_madre}` | SET NULL | NULL_OUT |
//! | `peso.animal_id` | CASCADE | DELETE_ROW |
//!
//! Deleting a parent animal keeps its offspring and clears the lineage link.

use crate::derive::DerivedDefinition;
use crate::model::OnDelete;
use crate::orphans::{OrphanPolicy, OrphanRule};
use crate::registry::{MigrationRegistry, MigrationStep, TargetDefinition};
use crate::seed::Seed;

const FINCA: &[&str] = &["id_finca", "finca_id"];

/// Tables that only hang off `finca`, with the spellings their column has had
const FINCA_DEPENDENTS: &[&str] = &["potrero", "lote", "sector", "insumo", "herramienta"];

/// Tables whose references once pointed at `*_old` copies left by hand-run rebuilds
const STALE_REFERENCE_TABLES: &[&str] = &[
    "movimiento",
    "evento",
    "comentario",
    "mantenimiento_herramienta",
    "servicio",
];

/// Optional references of `animal`: (column spellings, parent)
const ANIMAL_REFERENCES: &[(&[&str], &str)] = &[
    (FINCA, "finca"),
    (&["raza_id", "id_raza"], "raza"),
    (&["id_potrero", "potrero_id"], "potrero"),
    (&["lote_id", "id_lote"], "lote"),
    (&["id_padre", "padre_id"], "animal"),
    (&["id_madre", "madre_id"], "animal"),
];

const PESO_ANIMAL: &[&str] = &["animal_id", "id_animal"];

fn finca_rule(table: &str) -> OrphanRule {
    OrphanRule::null_out(table, FINCA).references("finca", None)
}

fn animal_rules() -> Vec<OrphanRule> {
    ANIMAL_REFERENCES
        .iter()
        .map(|(columns, parent)| OrphanRule::null_out("animal", columns).references(parent, None))
        .collect()
}

fn peso_rule() -> OrphanRule {
    OrphanRule::delete_row("peso", PESO_ANIMAL).references("animal", None)
}

/// The reviewed orphan policy, parents before children
pub fn orphan_policy() -> OrphanPolicy {
    FINCA_DEPENDENTS
        .iter()
        .map(|table| finca_rule(table))
        .chain(animal_rules())
        .chain(std::iter::once(peso_rule()))
        .collect()
}

/// Rows the application expects to find in an otherwise empty catalog
pub fn default_seeds() -> Vec<Seed> {
    vec![
        Seed::new(
            "finca",
            "SELECT 1 FROM finca",
            "INSERT INTO finca (codigo, nombre, estado) VALUES ('F001', 'Finca Principal', 'Activo')",
        ),
        Seed::new(
            "raza",
            "SELECT 1 FROM raza",
            "INSERT INTO raza (codigo, nombre) VALUES ('SIN-RAZA', 'Sin Raza Definida')",
        ),
        Seed::new(
            "lote",
            "SELECT 1 FROM lote",
            "INSERT INTO lote (codigo, nombre, descripcion, estado) \
             VALUES ('L001', 'Lote General', 'Lote general para animales sin clasificar', 'Activo')",
        ),
    ]
}

/// The built-in foreign-key normalisation steps
pub fn registry() -> MigrationRegistry {
    let mut registry = MigrationRegistry::new();

    for (n, table) in FINCA_DEPENDENTS.iter().enumerate() {
        registry = registry.step(
            MigrationStep::new(
                &format!("{:03}_{}_finca_set_null", n + 1, table),
                &format!("{table} -> finca ON DELETE SET NULL"),
                TargetDefinition::Derived(
                    DerivedDefinition::new(table)
                        .foreign_key(FINCA, "finca", OnDelete::SetNull)
                        .retarget_stale_refs(),
                ),
            )
            .cleanup(OrphanPolicy::new().rule(finca_rule(table))),
        );
    }

    let animal = ANIMAL_REFERENCES
        .iter()
        .fold(DerivedDefinition::new("animal"), |def, (columns, parent)| {
            def.foreign_key(columns, parent, OnDelete::SetNull)
        })
        .retarget_stale_refs();
    registry = registry.step(
        MigrationStep::new(
            "006_animal_optional_refs_set_null",
            "animal's finca/raza/potrero/lote and parent links -> ON DELETE SET NULL",
            TargetDefinition::Derived(animal),
        )
        .depends_on(&["001_potrero_finca_set_null", "002_lote_finca_set_null"])
        .cleanup(animal_rules().into_iter().collect()),
    );

    registry = registry.step(
        MigrationStep::new(
            "007_peso_animal_cascade",
            "peso -> animal ON DELETE CASCADE",
            TargetDefinition::Derived(
                DerivedDefinition::new("peso").foreign_key(PESO_ANIMAL, "animal", OnDelete::Cascade),
            ),
        )
        .depends_on(&["006_animal_optional_refs_set_null"])
        .cleanup(OrphanPolicy::new().rule(peso_rule())),
    );

    for (n, table) in STALE_REFERENCE_TABLES.iter().enumerate() {
        registry = registry.step(
            MigrationStep::new(
                &format!("{:03}_{}_retarget_stale_refs", n + 8, table),
                &format!("{table}: references to *_old / *_backup tables -> base tables"),
                TargetDefinition::Derived(DerivedDefinition::new(table).retarget_stale_refs()),
            )
            .depends_on(&["006_animal_optional_refs_set_null"]),
        );
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_conn;
    use crate::inspector;
    use crate::orphans;
    use crate::registry::{RunOptions, StepOutcome};
    use crate::seed::{ensure_defaults, SeedOutcome};
    use diesel::connection::SimpleConnection;
    use diesel::prelude::*;
    use diesel::sql_types::{Integer, Nullable};
    use diesel::sqlite::SqliteConnection;

    /// A database as an older FincaFácil release left it
    const LEGACY_FARM: &str = r#"
        CREATE TABLE finca (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            codigo TEXT UNIQUE,
            nombre TEXT UNIQUE NOT NULL,
            estado TEXT DEFAULT 'Activo'
        );
        CREATE TABLE raza (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            codigo TEXT UNIQUE NOT NULL,
            nombre TEXT UNIQUE NOT NULL,
            estado TEXT DEFAULT 'Activa'
        );
        CREATE TABLE potrero (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            id_finca INTEGER NOT NULL,
            nombre TEXT NOT NULL,
            FOREIGN KEY (id_finca) REFERENCES finca (id)
        );
        CREATE TABLE lote (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            codigo TEXT UNIQUE NOT NULL,
            finca_id INTEGER,
            nombre TEXT NOT NULL,
            descripcion TEXT,
            estado TEXT DEFAULT 'Activo',
            FOREIGN KEY (finca_id) REFERENCES finca_old (id)
        );
        CREATE TABLE animal (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            id_finca INTEGER,
            codigo TEXT UNIQUE NOT NULL,
            raza_id INTEGER,
            id_potrero INTEGER,
            lote_id INTEGER,
            id_padre INTEGER,
            id_madre INTEGER,
            FOREIGN KEY (raza_id) REFERENCES raza (id),
            FOREIGN KEY (id_finca) REFERENCES finca (id),
            FOREIGN KEY (id_potrero) REFERENCES potrero (id),
            FOREIGN KEY (lote_id) REFERENCES lote (id),
            FOREIGN KEY (id_padre) REFERENCES animal (id),
            FOREIGN KEY (id_madre) REFERENCES animal (id)
        );
        CREATE INDEX idx_animal_finca ON animal (id_finca);
        CREATE TABLE peso (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            animal_id INTEGER NOT NULL,
            fecha DATE NOT NULL,
            peso REAL NOT NULL,
            UNIQUE (animal_id, fecha),
            FOREIGN KEY (animal_id) REFERENCES animal (id)
        );

        INSERT INTO finca (id, codigo, nombre) VALUES (1, 'F001', 'La Esperanza');
        INSERT INTO raza (id, codigo, nombre) VALUES (1, 'BRA', 'Brahman');
        PRAGMA foreign_keys = OFF;
        INSERT INTO potrero (id, id_finca, nombre) VALUES (1, 1, 'Norte'), (2, 99, 'Sur');
        INSERT INTO lote (id, codigo, finca_id, nombre) VALUES (1, 'L001', 1, 'Hembras');
        INSERT INTO animal (id, id_finca, codigo, raza_id, id_potrero, lote_id, id_padre, id_madre) VALUES
            (1, 1, 'A-001', 1, 1, 1, NULL, NULL),
            (2, 1, 'A-002', 1, 1, 1, NULL, 1),
            (3, 1, 'A-003', 7, 2, 1, 40, 1);
        INSERT INTO peso (id, animal_id, fecha, peso) VALUES
            (1, 1, '2024-01-01', 320.0),
            (2, 42, '2024-01-01', 280.0);
        PRAGMA foreign_keys = ON;
    "#;

    fn legacy_farm() -> SqliteConnection {
        let mut conn = memory_conn();
        conn.batch_execute(LEGACY_FARM).unwrap();
        conn
    }

    #[derive(QueryableByName)]
    struct Value {
        #[diesel(sql_type = Nullable<Integer>)]
        value: Option<i32>,
    }

    fn value(conn: &mut SqliteConnection, query: &str) -> Option<i32> {
        let rows: Vec<Value> = diesel::sql_query(query).load(conn).unwrap();
        rows.first().and_then(|r| r.value)
    }

    #[test]
    fn test_registry_is_well_formed() {
        let registry = registry();
        let order = registry.ordered().unwrap();
        let position = |name: &str| order.iter().position(|s| s.name == name).unwrap();
        assert!(position("001_potrero_finca_set_null") < position("006_animal_optional_refs_set_null"));
        assert!(position("006_animal_optional_refs_set_null") < position("007_peso_animal_cascade"));
        assert_eq!(order.len(), 12);
    }

    #[test]
    fn test_full_migration_of_a_legacy_farm() {
        let mut conn = legacy_farm();
        let report = registry().run(&mut conn, &RunOptions::default()).unwrap();

        assert_eq!(report.count(StepOutcome::Rebuilt), 4);
        // sector, insumo, herramienta and the stale-reference tables are absent
        assert_eq!(report.count(StepOutcome::TableMissing), 8);

        for (table, column, policy) in [
            ("potrero", "id_finca", OnDelete::SetNull),
            ("lote", "finca_id", OnDelete::SetNull),
            ("animal", "id_madre", OnDelete::SetNull),
            ("peso", "animal_id", OnDelete::Cascade),
        ] {
            let keys = inspector::get_foreign_keys(&mut conn, table).unwrap();
            let key = keys.iter().find(|k| k.column == column).unwrap();
            assert_eq!(key.on_delete, policy, "{table}.{column}");
        }
        let lote_keys = inspector::get_foreign_keys(&mut conn, "lote").unwrap();
        assert_eq!(lote_keys[0].references_table, "finca");

        assert!(inspector::foreign_key_check(&mut conn, None).unwrap().is_empty());
        assert_eq!(value(&mut conn, "SELECT id_finca AS value FROM potrero WHERE id = 2"), None);
        assert_eq!(value(&mut conn, "SELECT raza_id AS value FROM animal WHERE id = 3"), None);
        assert_eq!(value(&mut conn, "SELECT id_madre AS value FROM animal WHERE id = 3"), Some(1));
        assert_eq!(inspector::count_rows(&mut conn, "peso").unwrap(), 1);
        assert_eq!(inspector::get_indexes(&mut conn, "animal").unwrap()[0].name, "idx_animal_finca");

        let again = registry().run(&mut conn, &RunOptions::default()).unwrap();
        assert_eq!(again.count(StepOutcome::Rebuilt), 0);
        assert_eq!(again.count(StepOutcome::AlreadyApplied), 4);
    }

    #[test]
    fn test_policies_hold_after_migration() {
        let mut conn = legacy_farm();
        registry().run(&mut conn, &RunOptions::default()).unwrap();

        // Deleting a mother keeps the offspring and clears the link
        conn.batch_execute("DELETE FROM peso WHERE animal_id = 1; DELETE FROM animal WHERE id = 1;")
            .unwrap();
        assert_eq!(value(&mut conn, "SELECT id_madre AS value FROM animal WHERE id = 2"), None);
        assert_eq!(inspector::count_rows(&mut conn, "animal").unwrap(), 2);

        // Deleting an animal takes its weighings with it
        conn.batch_execute("INSERT INTO peso (animal_id, fecha, peso) VALUES (2, '2024-02-01', 300.0);")
            .unwrap();
        conn.batch_execute("DELETE FROM animal WHERE id = 2;").unwrap();
        assert_eq!(inspector::count_rows(&mut conn, "peso").unwrap(), 0);

        // Deleting the finca orphans nothing
        conn.batch_execute("DELETE FROM finca WHERE id = 1;").unwrap();
        assert_eq!(value(&mut conn, "SELECT id_finca AS value FROM potrero WHERE id = 1"), None);
        assert!(inspector::foreign_key_check(&mut conn, None).unwrap().is_empty());
    }

    #[test]
    fn test_set_null_on_not_null_column_gets_rebuilt() {
        // The state hand-run scripts left: SET NULL declared, NOT NULL kept
        let mut conn = memory_conn();
        conn.batch_execute(
            r#"
            CREATE TABLE finca (id INTEGER PRIMARY KEY AUTOINCREMENT, nombre TEXT NOT NULL);
            CREATE TABLE potrero (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                id_finca INTEGER NOT NULL,
                nombre TEXT NOT NULL,
                FOREIGN KEY (id_finca) REFERENCES finca (id) ON DELETE SET NULL
            );
            INSERT INTO finca (id, nombre) VALUES (1, 'La Esperanza');
            PRAGMA foreign_keys = OFF;
            INSERT INTO potrero (id, id_finca, nombre) VALUES (1, 1, 'Norte'), (2, 99, 'Sur');
            PRAGMA foreign_keys = ON;
            "#,
        )
        .unwrap();

        let report = registry().run(&mut conn, &RunOptions::default()).unwrap();
        let potrero = report
            .steps
            .iter()
            .find(|s| s.name == "001_potrero_finca_set_null")
            .unwrap();
        assert_eq!(potrero.outcome, StepOutcome::Rebuilt);
        assert!(!potrero.cleanup.as_ref().unwrap().has_failures());

        let columns = inspector::get_columns(&mut conn, "potrero").unwrap();
        assert!(!columns.iter().find(|c| c.name == "id_finca").unwrap().not_null);
        assert_eq!(value(&mut conn, "SELECT id_finca AS value FROM potrero WHERE id = 2"), None);

        conn.batch_execute("DELETE FROM finca WHERE id = 1;").unwrap();
        assert_eq!(value(&mut conn, "SELECT id_finca AS value FROM potrero WHERE id = 1"), None);
        assert_eq!(inspector::count_rows(&mut conn, "potrero").unwrap(), 2);
    }

    #[test]
    fn test_orphan_policy_on_unmigrated_database() {
        let mut conn = legacy_farm();
        let report = orphans::scan(&mut conn, &orphan_policy());
        assert_eq!(report.affected("potrero", "id_finca"), Some(1));
        assert_eq!(report.affected("animal", "raza_id"), Some(1));
        assert_eq!(report.affected("animal", "id_padre"), Some(1));
        assert_eq!(report.affected("peso", "animal_id"), Some(1));

        // potrero.id_finca is still NOT NULL here, so only that rule fails
        let cleaned = orphans::clean(&mut conn, &orphan_policy());
        let failed: Vec<&str> = cleaned.failures().map(|e| e.table.as_str()).collect();
        assert_eq!(failed, vec!["potrero"]);
        assert_eq!(inspector::count_rows(&mut conn, "peso").unwrap(), 1);
    }

    #[test]
    fn test_default_seeds_only_fill_empty_tables() {
        let mut conn = legacy_farm();
        // lote must stop referencing finca_old before any row can be written to it
        registry().run(&mut conn, &RunOptions::default()).unwrap();
        conn.batch_execute("DELETE FROM animal; DELETE FROM lote;").unwrap();

        let report = ensure_defaults(&mut conn, &default_seeds()).unwrap();
        let outcomes: Vec<(&str, SeedOutcome)> =
            report.results.iter().map(|r| (r.table.as_str(), r.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                ("finca", SeedOutcome::AlreadyPresent),
                ("raza", SeedOutcome::AlreadyPresent),
                ("lote", SeedOutcome::Inserted),
            ]
        );
        assert_eq!(ensure_defaults(&mut conn, &default_seeds()).unwrap().inserted(), 0);
    }
}
