//! Schema Manager
//!
//! Base schema installed in every node file, plus table introspection and
//! `CREATE TABLE` generation for user tables.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::changelog::CHANGE_LOG_SCHEMA;
use crate::error::{Error, Result};
use crate::state::SYNC_STATE_SCHEMA;

/// Domain tables every partition starts with
const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT
);

CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    price REAL NOT NULL DEFAULT 0,
    stock INTEGER NOT NULL DEFAULT 0
);
"#;

/// Install the base schema, change log and sync markers
pub fn initialize_node(conn: &Connection) -> Result<()> {
    conn.execute_batch(BASE_SCHEMA)?;
    conn.execute_batch(CHANGE_LOG_SCHEMA)?;
    conn.execute_batch(SYNC_STATE_SCHEMA)?;
    Ok(())
}

/// Table listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub row_count: u64,
}

/// Column schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Table schema information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Empty when the table does not exist
    pub columns: Vec<ColumnSchema>,
}

/// Column definition for `create_table`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Type and constraints, e.g. `BIGINT PRIMARY KEY`
    #[serde(rename = "type")]
    pub data_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Internal tables are hidden from listings and reserved for the engine
fn is_internal(name: &str) -> bool {
    name.starts_with('_') || name.starts_with("sqlite_")
}

/// Accept plain `[A-Za-z_][A-Za-z0-9_]*` identifiers only
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') || name.len() > 128 {
        return Err(Error::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

/// Build a `CREATE TABLE IF NOT EXISTS` statement
pub fn create_table_sql(table: &str, columns: &[ColumnDef]) -> Result<String> {
    validate_identifier(table)?;
    if is_internal(table) {
        return Err(Error::InvalidIdentifier(format!("{} (reserved name)", table)));
    }
    if columns.is_empty() {
        return Err(Error::Execution(format!("table '{}' needs at least one column", table)));
    }

    let mut defs = Vec::with_capacity(columns.len());
    for column in columns {
        validate_identifier(&column.name)?;
        let ty = column.data_type.trim();
        if ty.is_empty() || ty.contains(';') || ty.contains("--") || ty.contains("/*") {
            return Err(Error::Execution(format!(
                "invalid type '{}' for column '{}'",
                column.data_type, column.name
            )));
        }
        defs.push(format!("\"{}\" {}", column.name, ty));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        table,
        defs.join(", ")
    ))
}

/// List user tables with their row counts
pub fn list_tables(conn: &Connection) -> Result<Vec<TableInfo>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut tables = Vec::new();
    for name in names.into_iter().filter(|n| !is_internal(n)) {
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", name.replace('"', "\"\"")), [], |row| {
            row.get(0)
        })?;
        tables.push(TableInfo {
            name,
            row_count: count as u64,
        });
    }
    Ok(tables)
}

/// Describe a table; unknown tables yield an empty column list
pub fn describe_table(conn: &Connection, table: &str) -> Result<TableSchema> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map(params![table], |row| {
            Ok(ColumnSchema {
                name: row.get(0)?,
                data_type: row.get(1)?,
                nullable: row.get::<_, i64>(2)? == 0,
                default_value: row.get(3)?,
                primary_key: row.get::<_, i64>(4)? > 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(TableSchema {
        name: table.to_string(),
        columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize_node(&conn).unwrap();
        conn
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = conn();
        initialize_node(&conn).unwrap();
        let tables = list_tables(&conn).unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["products", "users"]);
    }

    #[test]
    fn test_describe_users() {
        let conn = conn();
        let schema = describe_table(&conn, "users").unwrap();
        assert_eq!(schema.columns.len(), 3);
        assert!(schema.columns[0].primary_key);
        assert_eq!(schema.columns[1].name, "name");
        assert!(!schema.columns[1].nullable);
        assert!(schema.columns[2].nullable);
    }

    #[test]
    fn test_describe_missing_table_is_empty() {
        let conn = conn();
        let schema = describe_table(&conn, "non_existent_table").unwrap();
        assert!(schema.columns.is_empty());
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql(
            "employees",
            &[
                ColumnDef::new("id", "BIGINT PRIMARY KEY"),
                ColumnDef::new("salary", "DECIMAL(10,2)"),
                ColumnDef::new("hire_date", "TIMESTAMP DEFAULT CURRENT_TIMESTAMP"),
            ],
        )
        .unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"employees\" (\"id\" BIGINT PRIMARY KEY, \"salary\" DECIMAL(10,2), \"hire_date\" TIMESTAMP DEFAULT CURRENT_TIMESTAMP)"
        );

        let conn = conn();
        conn.execute_batch(&sql).unwrap();
        assert_eq!(describe_table(&conn, "employees").unwrap().columns.len(), 3);
    }

    #[test]
    fn test_create_table_rejects_bad_input() {
        assert!(create_table_sql("bad name", &[ColumnDef::new("id", "INTEGER")]).is_err());
        assert!(create_table_sql("_change_log", &[ColumnDef::new("id", "INTEGER")]).is_err());
        assert!(create_table_sql("t", &[]).is_err());
        assert!(create_table_sql("t", &[ColumnDef::new("id", "INTEGER); DROP TABLE users")]).is_err());
        assert!(create_table_sql("t", &[ColumnDef::new("1id", "INTEGER")]).is_err());
    }
}
