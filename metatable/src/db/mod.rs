use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, ToSql};
use serde_json::Value;
use std::path::Path;

/// Connection wrapper: parameter binding for JSON scalars, row-to-JSON
/// conversion, and explicit transaction control for the engine's
/// all-or-nothing write paths.
pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Db { conn })
    }

    /// Open an in-memory database (for testing and embedding).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Db { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Transaction Support ──────────────────────────────────────────

    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    // ── Statement execution with JSON parameters ─────────────────────

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let bound = bind_params(params);
        let refs: Vec<&dyn ToSql> = bound.iter().map(|v| v as &dyn ToSql).collect();
        let affected = self.conn.execute(sql, refs.as_slice())?;
        Ok(affected)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Run a query and convert every row to a JSON object keyed by column
    /// name.
    pub fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
        let bound = bind_params(params);
        let refs: Vec<&dyn ToSql> = bound.iter().map(|v| v as &dyn ToSql).collect();

        let mut stmt = self.conn.prepare(sql)?;
        let column_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let rows = stmt.query_map(refs.as_slice(), |row| {
            let mut obj = serde_json::Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let val: rusqlite::types::Value = row.get(i)?;
                obj.insert(name.clone(), sql_to_json(val));
            }
            Ok(Value::Object(obj))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Run a query expected to yield at most one row.
    pub fn query_row(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        let mut rows = self.query_rows(sql, params)?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// Run a scalar COUNT-style query.
    pub fn query_count(&self, sql: &str, params: &[Value]) -> Result<i64> {
        let bound = bind_params(params);
        let refs: Vec<&dyn ToSql> = bound.iter().map(|v| v as &dyn ToSql).collect();
        let count = self
            .conn
            .query_row(sql, refs.as_slice(), |row| row.get(0))
            .optional()?
            .unwrap_or(0);
        Ok(count)
    }
}

/// Quote an identifier for use in generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn bind_params(params: &[Value]) -> Vec<rusqlite::types::Value> {
    params.iter().map(json_to_sql).collect()
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        // Structured values (json columns) are stored serialized
        other => Sql::Text(other.to_string()),
    }
}

fn sql_to_json(value: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as Sql;
    match value {
        Sql::Null => Value::Null,
        Sql::Integer(i) => Value::Number(i.into()),
        Sql::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Sql::Text(s) => Value::String(s),
        Sql::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}
