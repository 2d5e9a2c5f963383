// Catalog introspection - vendor-specific schema readers producing a
// dialect-neutral RawTableSchema for the field model builder.

pub mod mysql;
pub mod sqlite;

pub use mysql::{MysqlCatalog, MysqlColumnRow, MysqlForeignKeyRow};
pub use sqlite::SqliteCatalog;

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Column type normalized across dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Varchar,
    Text,
    Int,
    BigInt,
    Float,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Timestamp,
    Time,
    Enum,
    Json,
    Blob,
}

impl SqlType {
    pub fn is_textual(self) -> bool {
        matches!(self, SqlType::Varchar | SqlType::Text | SqlType::Enum)
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            SqlType::Int | SqlType::BigInt | SqlType::Float | SqlType::Decimal
        )
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, SqlType::Date | SqlType::DateTime | SqlType::Timestamp)
    }
}

/// One column as read from the catalog, before metadata is merged in.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub default_value: Option<String>,
    pub max_length: Option<u32>,
    /// Ordered permitted values, only for Enum columns.
    pub enum_values: Vec<String>,
    /// Raw column comment text (may carry embedded JSON metadata).
    pub comment: Option<String>,
}

/// A foreign-key constraint as read from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Everything the catalog knows about one table, in physical column order.
#[derive(Debug, Clone)]
pub struct RawTableSchema {
    pub table: String,
    /// Raw table comment text (may carry embedded JSON metadata).
    pub comment: Option<String>,
    pub columns: Vec<RawColumn>,
    pub foreign_keys: Vec<RawForeignKey>,
}

impl RawTableSchema {
    pub fn column(&self, name: &str) -> Option<&RawColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&RawColumn> {
        self.columns.iter().find(|c| c.is_primary_key)
    }
}

/// Reads physical schema from a database catalog. Pure read - results are
/// safe to memoize per table name until the caller knows of a DDL change.
pub trait SchemaReader {
    /// Introspect one table. Fails with `SchemaNotFound` if the table is
    /// absent from the catalog.
    fn read_table(&self, table: &str) -> Result<RawTableSchema>;

    fn table_exists(&self, table: &str) -> Result<bool>;
}

/// Map a dialect's declared type name to the normalized SqlType.
/// `type_name` is the bare type keyword, lowercased, without length suffix.
pub(crate) fn normalize_type(type_name: &str) -> SqlType {
    match type_name {
        "varchar" | "char" | "character" | "nvarchar" => SqlType::Varchar,
        "text" | "tinytext" | "mediumtext" | "longtext" | "clob" => SqlType::Text,
        "int" | "integer" | "smallint" | "tinyint" | "mediumint" => SqlType::Int,
        "bigint" => SqlType::BigInt,
        "float" | "double" | "real" => SqlType::Float,
        "decimal" | "numeric" => SqlType::Decimal,
        "bool" | "boolean" => SqlType::Boolean,
        "date" => SqlType::Date,
        "datetime" => SqlType::DateTime,
        "timestamp" => SqlType::Timestamp,
        "time" => SqlType::Time,
        "enum" => SqlType::Enum,
        "json" => SqlType::Json,
        "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => SqlType::Blob,
        _ => SqlType::Text,
    }
}

/// Split a declared type like `varchar(255)` into the bare keyword and the
/// first length argument, if any.
pub(crate) fn split_declared_type(declared: &str) -> (String, Option<u32>) {
    let declared = declared.trim();
    match declared.find('(') {
        Some(open) => {
            let name = declared[..open].trim().to_lowercase();
            let rest = &declared[open + 1..];
            let close = rest.find(')').unwrap_or(rest.len());
            let first_arg = rest[..close].split(',').next().unwrap_or("").trim();
            (name, first_arg.parse().ok())
        }
        None => (declared.to_lowercase(), None),
    }
}
