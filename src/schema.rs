//! Embedded schema descriptors for the supported backends.

/// Entity tables in the relational schemas, also the expected top-level
/// collection names on the document backend.
pub const ENTITY_TABLES: [&str; 6] = [
    "categories",
    "users",
    "books",
    "videos",
    "orders",
    "order_items",
];

pub const SQLITE_DDL: &str = include_str!("../schema/sqlite.sql");
pub const MYSQL_DDL: &str = include_str!("../schema/mysql.sql");

/// Split a DDL script into executable statements, dropping comment lines and
/// transaction wrappers.
pub fn split_statements(sql: &str) -> Vec<String> {
    let cleaned = sql
        .lines()
        .filter(|l| !l.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    cleaned
        .split(';')
        .map(str::trim)
        .filter(|s| {
            !s.is_empty()
                && !s.eq_ignore_ascii_case("BEGIN TRANSACTION")
                && !s.eq_ignore_ascii_case("COMMIT")
        })
        .map(|s| s.to_string())
        .collect()
}

pub fn statement_preview(s: &str) -> String {
    let s = s.replace('\n', " ");
    if s.len() > 120 {
        format!("{}...", &s[..120])
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_ddl_creates_every_entity_table() {
        let statements = split_statements(SQLITE_DDL);
        for table in ENTITY_TABLES {
            assert!(
                statements
                    .iter()
                    .any(|s| s.contains(&format!("CREATE TABLE IF NOT EXISTS {table}"))),
                "missing CREATE TABLE for {table}"
            );
        }
    }

    #[test]
    fn mysql_ddl_creates_every_entity_table() {
        let statements = split_statements(MYSQL_DDL);
        for table in ENTITY_TABLES {
            assert!(
                statements
                    .iter()
                    .any(|s| s.contains(&format!("CREATE TABLE IF NOT EXISTS {table}"))),
                "missing CREATE TABLE for {table}"
            );
        }
    }

    #[test]
    fn split_statements_drops_comments_and_wrappers() {
        let stmts = split_statements("-- a comment\nBEGIN TRANSACTION;\nCREATE TABLE t(id INT);\nCOMMIT;");
        assert_eq!(stmts, vec!["CREATE TABLE t(id INT)".to_string()]);
    }

    #[test]
    fn statement_preview_truncates_long_statements() {
        let long = "x".repeat(400);
        let preview = statement_preview(&long);
        assert!(preview.len() < 130);
    }
}
