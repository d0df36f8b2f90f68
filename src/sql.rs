//! Small SQL builder for statements whose identifiers are only known at runtime
//!
//! SQLite cannot bind identifiers, so table and column names go through
//! [`quote_ident`]. Values are always bound by the caller.

/// Quote an identifier for SQLite (`"name"`, with embedded quotes doubled)
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comma-separated list of quoted identifiers
pub fn ident_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Name of the scratch table used while `table` is being rebuilt
pub fn rebuild_temp_name(table: &str) -> String {
    format!("{}_rebuild_tmp", table)
}

/// Suffixes left behind by earlier hand-written rebuild scripts
pub const STALE_TABLE_SUFFIXES: &[&str] = &["_rebuild_tmp", "_backup", "_old"];

/// If `name` carries a stale rebuild suffix, the base table it was copied from
pub fn strip_stale_suffix(name: &str) -> Option<&str> {
    STALE_TABLE_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .filter(|base| !base.is_empty())
}

/// `SELECT COUNT(*) AS count FROM "table"`
pub fn count_rows(table: &str) -> String {
    format!("SELECT COUNT(*) AS count FROM {}", quote_ident(table))
}

/// Correlated predicate matching rows of `table` whose `column` points nowhere
///
/// The parent is aliased so self-references (`animal.id_padre -> animal.id`)
/// stay unambiguous.
pub fn orphan_predicate(table: &str, column: &str, parent_table: &str, parent_column: &str) -> String {
    format!(
        "{col} IS NOT NULL AND NOT EXISTS (SELECT 1 FROM {parent} AS parent_ref WHERE parent_ref.{pcol} = {tbl}.{col})",
        col = quote_ident(column),
        parent = quote_ident(parent_table),
        pcol = quote_ident(parent_column),
        tbl = quote_ident(table),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("animal"), "\"animal\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_ident_list() {
        assert_eq!(ident_list(&["id", "nombre"]), "\"id\", \"nombre\"");
        assert_eq!(ident_list::<&str>(&[]), "");
    }

    #[test]
    fn test_strip_stale_suffix() {
        assert_eq!(strip_stale_suffix("lote_old"), Some("lote"));
        assert_eq!(strip_stale_suffix("animal_backup"), Some("animal"));
        assert_eq!(strip_stale_suffix("peso_rebuild_tmp"), Some("peso"));
        assert_eq!(strip_stale_suffix("finca"), None);
        assert_eq!(strip_stale_suffix("_old"), None);
    }

    #[test]
    fn test_orphan_predicate_aliases_parent() {
        let sql = orphan_predicate("animal", "id_padre", "animal", "id");
        assert!(sql.starts_with("\"id_padre\" IS NOT NULL"));
        assert!(sql.contains("FROM \"animal\" AS parent_ref"));
        assert!(sql.contains("parent_ref.\"id\" = \"animal\".\"id_padre\""));
    }
}
