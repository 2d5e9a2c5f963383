use super::{
    normalize_type, split_declared_type, RawColumn, RawForeignKey, RawTableSchema, SchemaReader,
    SqlType,
};
use crate::error::{MetatableError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sqlparser::ast::{ColumnOption, Expr, Statement, TableConstraint, Value};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;

/// SQLite catalog reader. Columns and keys come from `PRAGMA table_info` /
/// `PRAGMA foreign_key_list`; enum value sets come from CHECK constraints in
/// the stored `CREATE TABLE` text. SQLite has no native comments, so table
/// and column comments live in a `_comments` side table that this reader
/// also maintains.
pub struct SqliteCatalog<'a> {
    conn: &'a Connection,
}

const COMMENTS_TABLE_DDL: &str = "
    CREATE TABLE IF NOT EXISTS _comments (
        tbl TEXT NOT NULL,
        col TEXT NOT NULL DEFAULT '',
        comment TEXT NOT NULL,
        PRIMARY KEY (tbl, col)
    );
";

impl<'a> SqliteCatalog<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SqliteCatalog { conn }
    }

    /// Attach a comment to a table (the SQLite stand-in for `COMMENT ON TABLE`).
    pub fn set_table_comment(&self, table: &str, comment: &str) -> Result<()> {
        self.conn.execute_batch(COMMENTS_TABLE_DDL)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO _comments (tbl, col, comment) VALUES (?1, '', ?2)",
            params![table, comment],
        )?;
        Ok(())
    }

    /// Attach a comment to a column.
    pub fn set_column_comment(&self, table: &str, column: &str, comment: &str) -> Result<()> {
        self.conn.execute_batch(COMMENTS_TABLE_DDL)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO _comments (tbl, col, comment) VALUES (?1, ?2, ?3)",
            params![table, column, comment],
        )?;
        Ok(())
    }

    fn comment_for(&self, table: &str, column: &str) -> Result<Option<String>> {
        if !self.has_comments_table()? {
            return Ok(None);
        }
        let result = self
            .conn
            .query_row(
                "SELECT comment FROM _comments WHERE tbl = ?1 AND col = ?2",
                params![table, column],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    fn has_comments_table(&self) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '_comments'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn create_sql(&self, table: &str) -> Result<Option<String>> {
        let sql = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(sql)
    }
}

impl SchemaReader for SqliteCatalog<'_> {
    fn table_exists(&self, table: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn read_table(&self, table: &str) -> Result<RawTableSchema> {
        let create_sql = self
            .create_sql(table)?
            .ok_or_else(|| MetatableError::SchemaNotFound(table.to_string()))?;

        let check_enums = parse_check_enums(&create_sql);

        // PRAGMA table_info yields rows in physical column order.
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>("name")?,
                row.get::<_, String>("type")?,
                row.get::<_, i64>("notnull")?,
                row.get::<_, Option<String>>("dflt_value")?,
                row.get::<_, i64>("pk")?,
            ))
        })?;

        let mut columns = Vec::new();
        for row in rows {
            let (name, declared, notnull, dflt_value, pk) = row?;
            let (type_name, max_length) = split_declared_type(&declared);
            let mut sql_type = normalize_type(&type_name);
            let mut enum_values = Vec::new();
            if let Some(values) = check_enums.get(&name) {
                sql_type = SqlType::Enum;
                enum_values = values.clone();
            }
            let comment = self.comment_for(table, &name)?;
            columns.push(RawColumn {
                name,
                sql_type,
                nullable: notnull == 0 && pk == 0,
                is_primary_key: pk > 0,
                default_value: dflt_value.map(|v| strip_quotes(&v)),
                max_length,
                enum_values,
                comment,
            });
        }

        if columns.is_empty() {
            return Err(MetatableError::SchemaNotFound(table.to_string()));
        }

        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
        let fk_rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>("table")?,
                row.get::<_, String>("from")?,
                row.get::<_, Option<String>>("to")?,
            ))
        })?;

        let mut foreign_keys = Vec::new();
        for row in fk_rows {
            let (referenced_table, column, to) = row?;
            foreign_keys.push(RawForeignKey {
                column,
                referenced_table,
                // An omitted target column means the referenced table's rowid pk.
                referenced_column: to.unwrap_or_else(|| "id".to_string()),
            });
        }

        Ok(RawTableSchema {
            table: table.to_string(),
            comment: self.comment_for(table, "")?,
            columns,
            foreign_keys,
        })
    }
}

/// Extract `column IN ('a', 'b', ...)` value sets from the CHECK constraints
/// of a CREATE TABLE statement. Unparseable SQL degrades to an empty map.
pub fn parse_check_enums(create_sql: &str) -> HashMap<String, Vec<String>> {
    let dialect = SQLiteDialect {};
    let statements = match Parser::parse_sql(&dialect, create_sql) {
        Ok(statements) => statements,
        Err(e) => {
            log::warn!("Could not parse CREATE TABLE for CHECK extraction: {e}");
            return HashMap::new();
        }
    };

    let mut out = HashMap::new();
    for statement in statements {
        if let Statement::CreateTable {
            columns,
            constraints,
            ..
        } = statement
        {
            for column in &columns {
                for option in &column.options {
                    if let ColumnOption::Check(expr) = &option.option {
                        if let Some((name, values)) = in_list_values(expr) {
                            out.insert(name, values);
                        }
                    }
                }
            }
            for constraint in &constraints {
                if let TableConstraint::Check { expr, .. } = constraint {
                    if let Some((name, values)) = in_list_values(expr) {
                        out.insert(name, values);
                    }
                }
            }
        }
    }
    out
}

/// Match `<ident> IN ('a', 'b', ...)`, unwrapping nested parentheses.
fn in_list_values(expr: &Expr) -> Option<(String, Vec<String>)> {
    let mut expr = expr;
    while let Expr::Nested(inner) = expr {
        expr = inner;
    }
    let Expr::InList {
        expr: target,
        list,
        negated: false,
    } = expr
    else {
        return None;
    };

    let name = match target.as_ref() {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts.last()?.value.clone(),
        _ => return None,
    };

    let mut values = Vec::new();
    for item in list {
        match item {
            Expr::Value(Value::SingleQuotedString(s)) => values.push(s.clone()),
            Expr::Value(Value::DoubleQuotedString(s)) => values.push(s.clone()),
            _ => return None,
        }
    }
    Some((name, values))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn strip_quotes(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        trimmed[1..trimmed.len() - 1].replace("''", "'")
    } else {
        trimmed.to_string()
    }
}
