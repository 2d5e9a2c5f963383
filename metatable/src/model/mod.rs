// Field model resolution - combines catalog introspection with decoded
// comment metadata into the ordered Field descriptors the engine runs on.

use crate::catalog::{RawForeignKey, SchemaReader, SqlType};
use crate::error::Result;
use crate::metadata::{self, ColumnMetadata, TableMetadata};
use serde::Serialize;

/// Candidate columns probed, in order, to label foreign-key dropdowns when
/// no explicit `display_column` is declared. A heuristic, not a guarantee.
pub const DISPLAY_PROBE: &[&str] = &["name", "title", "author_name", "slug"];

/// Resolved foreign-key reference for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
    /// Column of the referenced table shown in dropdowns.
    pub display_column: String,
    /// True when `display_column` came from the name probe rather than
    /// explicit metadata or the referenced primary key.
    pub display_column_probed: bool,
}

/// One column's fully resolved descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct Field {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub default_value: Option<String>,
    pub max_length: Option<u32>,
    pub enum_values: Vec<String>,
    pub foreign_key: Option<ForeignKeyRef>,
    pub metadata: ColumnMetadata,
}

impl Field {
    /// Whether create() must see a value for this field. Hidden fields and
    /// fields with a database default are exempt from the not-null check.
    pub fn is_required(&self) -> bool {
        if let Some(required) = self.metadata.required {
            return required;
        }
        !self.nullable
            && !self.is_primary_key
            && self.default_value.is_none()
            && !self.metadata.hidden
    }

    /// Effective length cap: metadata may tighten the physical limit but
    /// never loosen it.
    pub fn effective_max_length(&self) -> Option<usize> {
        let physical = self.max_length.map(|l| l as usize);
        match (self.metadata.max_length, physical) {
            (Some(meta), Some(phys)) => Some(meta.min(phys)),
            (Some(meta), None) => Some(meta),
            (None, phys) => phys,
        }
    }
}

/// Resolved, typed description of all columns of one table. Built once per
/// table; safe to cache keyed by table name until the caller knows of a
/// schema change.
#[derive(Debug, Clone, Serialize)]
pub struct FieldModel {
    pub table: String,
    /// Fields in physical column order.
    pub fields: Vec<Field>,
    pub metadata: TableMetadata,
}

impl FieldModel {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn primary_key(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.is_primary_key)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Whether the given input key is acceptable: either a real column or a
    /// declared many-to-many field.
    pub fn accepts_key(&self, key: &str) -> bool {
        self.has_field(key) || self.metadata.many_to_many_for(key).is_some()
    }
}

/// Builds FieldModels from any catalog reader. Pure read; no side effects.
pub struct FieldModelBuilder<'r, R: SchemaReader> {
    reader: &'r R,
}

impl<'r, R: SchemaReader> FieldModelBuilder<'r, R> {
    pub fn new(reader: &'r R) -> Self {
        FieldModelBuilder { reader }
    }

    pub fn resolve(&self, table: &str) -> Result<FieldModel> {
        let raw = self.reader.read_table(table)?;
        let table_meta = metadata::decode_table(raw.comment.as_deref());

        let mut fields = Vec::with_capacity(raw.columns.len());
        for column in &raw.columns {
            let column_meta = metadata::decode_column(column.comment.as_deref());
            let merged = match table_meta.fields.get(&column.name) {
                Some(table_level) => ColumnMetadata::merge(&column_meta, table_level),
                None => column_meta,
            };

            let foreign_key = raw
                .foreign_keys
                .iter()
                .find(|fk| fk.column == column.name)
                .map(|fk| self.resolve_foreign_key(fk, &merged));

            fields.push(Field {
                name: column.name.clone(),
                sql_type: column.sql_type,
                nullable: column.nullable,
                is_primary_key: column.is_primary_key,
                default_value: column.default_value.clone(),
                max_length: column.max_length,
                enum_values: column.enum_values.clone(),
                foreign_key,
                metadata: merged,
            });
        }

        log::debug!("Resolved field model for '{table}' ({} fields)", fields.len());

        Ok(FieldModel {
            table: raw.table,
            fields,
            metadata: table_meta,
        })
    }

    fn resolve_foreign_key(&self, fk: &RawForeignKey, meta: &ColumnMetadata) -> ForeignKeyRef {
        if let Some(explicit) = &meta.display_column {
            return ForeignKeyRef {
                table: fk.referenced_table.clone(),
                column: fk.referenced_column.clone(),
                display_column: explicit.clone(),
                display_column_probed: false,
            };
        }

        if let Some(probed) = self.probe_display_column(&fk.referenced_table) {
            return ForeignKeyRef {
                table: fk.referenced_table.clone(),
                column: fk.referenced_column.clone(),
                display_column: probed,
                display_column_probed: true,
            };
        }

        // No candidate matched; fall back to the referenced key itself.
        ForeignKeyRef {
            table: fk.referenced_table.clone(),
            column: fk.referenced_column.clone(),
            display_column: fk.referenced_column.clone(),
            display_column_probed: false,
        }
    }

    fn probe_display_column(&self, referenced_table: &str) -> Option<String> {
        let referenced = self.reader.read_table(referenced_table).ok()?;
        DISPLAY_PROBE
            .iter()
            .find(|candidate| referenced.column(candidate).is_some())
            .map(|candidate| candidate.to_string())
    }
}
