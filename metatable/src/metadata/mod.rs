// Metadata decoding - JSON documents embedded in table/column comments.
// Decoding never fails: malformed JSON degrades to the empty metadata
// object and logs, so a schema always resolves even under corruption.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Decoded column-comment metadata: UI hints plus validation constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMetadata {
    pub label: Option<String>,
    pub placeholder: Option<String>,
    /// Input type override for the presentation layer (e.g. "textarea").
    pub input_type: Option<String>,
    pub hidden: bool,
    pub readonly: bool,
    /// Overrides nullability-derived requiredness when set.
    pub required: Option<bool>,
    /// Explicit display column for a foreign-key dropdown; suppresses the
    /// name-probing heuristic.
    pub display_column: Option<String>,
    pub unique: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    /// Regex the raw string value must match.
    pub pattern: Option<String>,
    pub rules: Vec<ConditionalRule>,
}

impl ColumnMetadata {
    /// Merge column-comment metadata with a table-level per-field override.
    /// Column-level declarations win; table-level fills the gaps.
    pub fn merge(column_level: &ColumnMetadata, table_level: &ColumnMetadata) -> ColumnMetadata {
        ColumnMetadata {
            label: column_level.label.clone().or_else(|| table_level.label.clone()),
            placeholder: column_level
                .placeholder
                .clone()
                .or_else(|| table_level.placeholder.clone()),
            input_type: column_level
                .input_type
                .clone()
                .or_else(|| table_level.input_type.clone()),
            hidden: column_level.hidden || table_level.hidden,
            readonly: column_level.readonly || table_level.readonly,
            required: column_level.required.or(table_level.required),
            display_column: column_level
                .display_column
                .clone()
                .or_else(|| table_level.display_column.clone()),
            unique: column_level.unique || table_level.unique,
            min: column_level.min.or(table_level.min),
            max: column_level.max.or(table_level.max),
            min_length: column_level.min_length.or(table_level.min_length),
            max_length: column_level.max_length.or(table_level.max_length),
            pattern: column_level
                .pattern
                .clone()
                .or_else(|| table_level.pattern.clone()),
            rules: if column_level.rules.is_empty() {
                table_level.rules.clone()
            } else {
                column_level.rules.clone()
            },
        }
    }
}

/// A conditional validation rule attached to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionalRule {
    /// The field is required when another field holds a given value.
    RequiredIf {
        field: String,
        equals: serde_json::Value,
    },
    /// This field must compare against another field's value.
    Compare { op: CompareOp, other: String },
    /// When a guard condition on another field holds, this field's value
    /// must satisfy `op value` (e.g. price > 100 implies discount <= 50).
    CompareWhen {
        when: FieldCondition,
        op: CompareOp,
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub op: CompareOp,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn holds_f64(self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Gt => left > right,
            CompareOp::Gte => left >= right,
            CompareOp::Lt => left < right,
            CompareOp::Lte => left <= right,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            CompareOp::Eq => "equal to",
            CompareOp::Ne => "different from",
            CompareOp::Gt => "greater than",
            CompareOp::Gte => "at least",
            CompareOp::Lt => "less than",
            CompareOp::Lte => "at most",
        }
    }
}

/// Server-side timestamp stamping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampsBehavior {
    pub created_at_column: String,
    pub updated_at_column: String,
}

impl Default for TimestampsBehavior {
    fn default() -> Self {
        TimestampsBehavior {
            created_at_column: "created_at".to_string(),
            updated_at_column: "updated_at".to_string(),
        }
    }
}

/// Slug derivation from a source column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SluggableBehavior {
    pub source_column: String,
    pub target_column: String,
    pub unique: bool,
    pub separator: String,
    pub lowercase: bool,
}

impl Default for SluggableBehavior {
    fn default() -> Self {
        SluggableBehavior {
            source_column: "title".to_string(),
            target_column: "slug".to_string(),
            unique: true,
            separator: "-".to_string(),
            lowercase: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftDeletesBehavior {
    pub column: String,
}

impl Default for SoftDeletesBehavior {
    fn default() -> Self {
        SoftDeletesBehavior {
            column: "deleted_at".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListViewConfig {
    pub searchable: Vec<String>,
    pub sort_column: Option<String>,
    pub sort_desc: bool,
    pub page_size: Option<u32>,
    pub visible_columns: Vec<String>,
    pub filters: Vec<String>,
}

/// Row-level ownership checks, layered beneath table-level grants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowLevelSecurity {
    pub enabled: bool,
    pub owner_field: String,
    pub owner_can_edit: bool,
    pub owner_can_delete: bool,
}

/// A declared many-to-many relation backed by a pivot table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManyToMany {
    /// Input field name carrying the array of related ids.
    pub field: String,
    pub pivot_table: String,
    /// Pivot column holding this table's id.
    pub local_key: String,
    /// Pivot column holding the related table's id.
    pub foreign_key: String,
    pub related_table: String,
}

/// Declarative state machine over a status column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub field: String,
    pub states: Vec<String>,
    pub transitions: BTreeMap<String, TransitionConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    pub from: FromStates,
    pub to: String,
    /// Roles allowed to run this transition. Absent means unrestricted.
    pub permissions: Option<Vec<String>>,
    pub label: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FromStates {
    One(String),
    Many(Vec<String>),
}

impl Default for FromStates {
    fn default() -> Self {
        FromStates::Many(Vec::new())
    }
}

impl FromStates {
    pub fn contains(&self, state: &str) -> bool {
        match self {
            FromStates::One(s) => s == state,
            FromStates::Many(states) => states.iter().any(|s| s == state),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match self {
            FromStates::One(s) => Box::new(std::iter::once(s.as_str())),
            FromStates::Many(states) => Box::new(states.iter().map(|s| s.as_str())),
        }
    }
}

/// Decoded table-comment metadata: display info, behaviors, permissions,
/// relations, and the optional workflow declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableMetadata {
    pub display_name: Option<String>,
    pub icon: Option<String>,
    pub timestamps: Option<TimestampsBehavior>,
    pub sluggable: Option<SluggableBehavior>,
    pub soft_deletes: Option<SoftDeletesBehavior>,
    pub list_view: Option<ListViewConfig>,
    /// Action -> roles allowed. `"*"` grants any role.
    pub permissions: BTreeMap<String, Vec<String>>,
    pub row_level_security: Option<RowLevelSecurity>,
    pub many_to_many: Vec<ManyToMany>,
    /// Multi-column uniqueness groups.
    pub unique_together: Vec<Vec<String>>,
    pub workflow: Option<WorkflowConfig>,
    /// Table-level per-field overrides, merged beneath column comments.
    pub fields: BTreeMap<String, ColumnMetadata>,
}

impl TableMetadata {
    pub fn many_to_many_for(&self, field: &str) -> Option<&ManyToMany> {
        self.many_to_many.iter().find(|m| m.field == field)
    }

    pub fn has_any_permissions(&self) -> bool {
        !self.permissions.is_empty() || self.row_level_security.is_some()
    }
}

/// Decode a column comment into metadata. `None`, empty, or malformed
/// comments all resolve to the default metadata.
pub fn decode_column(comment: Option<&str>) -> ColumnMetadata {
    decode(comment, "column")
}

/// Decode a table comment into metadata.
pub fn decode_table(comment: Option<&str>) -> TableMetadata {
    decode(comment, "table")
}

fn decode<T: Default + serde::de::DeserializeOwned>(comment: Option<&str>, kind: &str) -> T {
    let raw = match comment {
        Some(c) if !c.trim().is_empty() => c,
        _ => return T::default(),
    };
    let decoded = html_entity_decode(raw);
    match serde_json::from_str(decoded.trim()) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("Ignoring malformed {kind} metadata JSON: {e}");
            T::default()
        }
    }
}

/// Decode the HTML entities some storage paths apply to comment text.
pub fn html_entity_decode(input: &str) -> String {
    input
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
