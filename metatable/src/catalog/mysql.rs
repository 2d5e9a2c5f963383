use super::{
    normalize_type, split_declared_type, RawColumn, RawForeignKey, RawTableSchema, SchemaReader,
    SqlType,
};
use crate::error::{MetatableError, Result};
use std::collections::HashMap;

/// One row of `information_schema.columns` for the MySQL dialect. The
/// embedding application fetches these through its own MySQL connection and
/// feeds them in; this crate ships no MySQL driver.
#[derive(Debug, Clone)]
pub struct MysqlColumnRow {
    pub column_name: String,
    /// Full declared type, e.g. `varchar(255)` or `enum('a','b')`.
    pub column_type: String,
    /// `YES` / `NO`.
    pub is_nullable: String,
    /// `PRI` for primary-key members, empty otherwise.
    pub column_key: String,
    pub column_default: Option<String>,
    pub column_comment: String,
    pub ordinal_position: u32,
}

/// One row of `information_schema.key_column_usage` restricted to rows with
/// a non-null referenced table.
#[derive(Debug, Clone)]
pub struct MysqlForeignKeyRow {
    pub column_name: String,
    pub referenced_table_name: String,
    pub referenced_column_name: String,
}

#[derive(Debug, Clone, Default)]
struct MysqlTableRows {
    comment: Option<String>,
    columns: Vec<MysqlColumnRow>,
    foreign_keys: Vec<MysqlForeignKeyRow>,
}

/// MySQL catalog reader over pre-fetched `information_schema` rows.
#[derive(Debug, Default)]
pub struct MysqlCatalog {
    tables: HashMap<String, MysqlTableRows>,
}

impl MysqlCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the catalog rows for one table.
    pub fn insert_table(
        &mut self,
        table: &str,
        comment: Option<String>,
        mut columns: Vec<MysqlColumnRow>,
        foreign_keys: Vec<MysqlForeignKeyRow>,
    ) {
        columns.sort_by_key(|c| c.ordinal_position);
        self.tables.insert(
            table.to_string(),
            MysqlTableRows {
                comment,
                columns,
                foreign_keys,
            },
        );
    }
}

impl SchemaReader for MysqlCatalog {
    fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.contains_key(table))
    }

    fn read_table(&self, table: &str) -> Result<RawTableSchema> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| MetatableError::SchemaNotFound(table.to_string()))?;

        let mut columns = Vec::new();
        for row in &rows.columns {
            let (type_name, max_length) = split_declared_type(&row.column_type);
            let (sql_type, enum_values) = if type_name == "enum" {
                (SqlType::Enum, parse_enum_literals(&row.column_type))
            } else if row.column_type.eq_ignore_ascii_case("tinyint(1)") {
                // MySQL convention for booleans
                (SqlType::Boolean, Vec::new())
            } else {
                (normalize_type(&type_name), Vec::new())
            };

            columns.push(RawColumn {
                name: row.column_name.clone(),
                sql_type,
                nullable: row.is_nullable.eq_ignore_ascii_case("YES"),
                is_primary_key: row.column_key.eq_ignore_ascii_case("PRI"),
                default_value: row.column_default.clone(),
                max_length,
                enum_values,
                comment: if row.column_comment.is_empty() {
                    None
                } else {
                    Some(row.column_comment.clone())
                },
            });
        }

        if columns.is_empty() {
            return Err(MetatableError::SchemaNotFound(table.to_string()));
        }

        let foreign_keys = rows
            .foreign_keys
            .iter()
            .map(|fk| RawForeignKey {
                column: fk.column_name.clone(),
                referenced_table: fk.referenced_table_name.clone(),
                referenced_column: fk.referenced_column_name.clone(),
            })
            .collect();

        Ok(RawTableSchema {
            table: table.to_string(),
            comment: rows.comment.clone(),
            columns,
            foreign_keys,
        })
    }
}

/// Parse the quoted literals out of a MySQL `enum('a','b')` column type,
/// preserving declaration order. Doubled quotes inside a literal unescape to
/// a single quote.
pub fn parse_enum_literals(column_type: &str) -> Vec<String> {
    let trimmed = column_type.trim();
    let lower = trimmed.to_lowercase();
    if !lower.starts_with("enum(") && !lower.starts_with("set(") {
        return Vec::new();
    }

    let open = match trimmed.find('(') {
        Some(i) => i,
        None => return Vec::new(),
    };
    let inner = trimmed[open + 1..].trim_end_matches(')');

    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = inner.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_quote => in_quote = true,
            '\'' if in_quote => {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    current.push('\'');
                } else {
                    in_quote = false;
                    values.push(std::mem::take(&mut current));
                }
            }
            _ if in_quote => current.push(ch),
            _ => {}
        }
    }
    values
}
