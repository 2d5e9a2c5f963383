use std::collections::BTreeMap;
use thiserror::Error;

/// Field-level validation failures, collected across all fields so a form
/// can show every problem at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ValidationErrors {
    pub field_errors: BTreeMap<String, String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.field_errors
            .entry(field.to_string())
            .or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.field_errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, message) in other.field_errors {
            self.field_errors.entry(field).or_insert(message);
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, message) in &self.field_errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{field}: {message}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum MetatableError {
    #[error("Table not found in catalog: {0}")]
    SchemaNotFound(String),

    #[error("Record not found: {table}/{id}")]
    RecordNotFound { table: String, id: i64 },

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Unknown field '{field}' for table '{table}'")]
    UnknownField { table: String, field: String },

    #[error("Permission denied: {action} on {table}")]
    PermissionDenied { action: String, table: String },

    #[error("Transition not allowed: {0}")]
    TransitionNotAllowed(String),

    #[error("Workflow configuration error: {0}")]
    WorkflowConfig(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl MetatableError {
    /// Message safe to show an untrusted caller. Driver-level failures are
    /// reduced to a generic line; the full text stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            MetatableError::Sqlite(_) | MetatableError::Persistence(_) => {
                "The operation could not be completed".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MetatableError>;
