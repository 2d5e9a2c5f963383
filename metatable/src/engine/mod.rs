use crate::access::{Action, ActorContext, PermissionManager};
use crate::catalog::SqliteCatalog;
use crate::db::{quote_ident, Db};
use crate::error::{MetatableError, Result, ValidationErrors};
use crate::metadata::{ManyToMany, SluggableBehavior};
use crate::model::{FieldModel, FieldModelBuilder};
use crate::validation::{self, WriteMode};
use chrono::Utc;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

/// The main entry point. Owns the database connection, resolves and caches
/// field models, and runs validated create/update/delete operations inside
/// single transactions.
pub struct Engine {
    db: Db,
    models: RefCell<HashMap<String, Rc<FieldModel>>>,
}

/// Listing controls for `Engine::list`. Page size comes from the table's
/// `list_view` metadata; `page` is zero-based.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub page: u32,
    pub include_deleted: bool,
}

impl Engine {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Engine::from_db(Db::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Engine::from_db(Db::open_in_memory()?))
    }

    pub fn from_db(db: Db) -> Engine {
        Engine {
            db,
            models: RefCell::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Catalog handle over the engine's connection, mainly for attaching
    /// table/column comments.
    pub fn catalog(&self) -> SqliteCatalog<'_> {
        SqliteCatalog::new(self.db.conn())
    }

    /// Resolve (and cache) the field model for a table. The cache is keyed
    /// by table name; after a DDL change the caller must bust it with
    /// `invalidate_model`.
    pub fn resolve(&self, table: &str) -> Result<Rc<FieldModel>> {
        if let Some(model) = self.models.borrow().get(table) {
            return Ok(Rc::clone(model));
        }
        let catalog = SqliteCatalog::new(self.db.conn());
        let model = Rc::new(FieldModelBuilder::new(&catalog).resolve(table)?);
        self.models
            .borrow_mut()
            .insert(table.to_string(), Rc::clone(&model));
        Ok(model)
    }

    pub fn invalidate_model(&self, table: &str) {
        self.models.borrow_mut().remove(table);
    }

    // ── Write operations ─────────────────────────────────────────────

    /// Validate and insert a new record. Returns the new primary key.
    pub fn create(&self, table: &str, input: &Map<String, Value>, actor: &ActorContext) -> Result<i64> {
        let model = self.resolve(table)?;
        self.authorize(&model, Action::Create, actor, None)?;
        self.reject_unknown_keys(&model, input)?;

        let (column_input, pivots) = split_pivot_input(&model, input)?;
        let mut values = validation::validate_input(&model, &column_input, WriteMode::Create)
            .map_err(MetatableError::Validation)?;

        self.in_transaction(|| {
            self.check_uniqueness(&model, &values, None, None)?;
            if let Some(sluggable) = &model.metadata.sluggable {
                self.apply_slug(&model, sluggable, &mut values, None, true)?;
            }
            self.stamp_timestamps(&model, &mut values, true);

            let id = self.insert_row(&model, &values)?;
            for (m2m, related_ids) in &pivots {
                self.replace_pivot_rows(m2m, id, related_ids)?;
            }
            Ok(id)
        })
    }

    /// Validate and apply a partial update to an existing record.
    pub fn update(
        &self,
        table: &str,
        id: i64,
        input: &Map<String, Value>,
        actor: &ActorContext,
    ) -> Result<()> {
        let model = self.resolve(table)?;
        let record = self
            .fetch_record(&model, id, false)?
            .ok_or(MetatableError::RecordNotFound {
                table: table.to_string(),
                id,
            })?;
        self.authorize(&model, Action::Update, actor, Some(&record))?;
        self.reject_unknown_keys(&model, input)?;

        let (column_input, pivots) = split_pivot_input(&model, input)?;
        let mut values = validation::validate_input(&model, &column_input, WriteMode::Update)
            .map_err(MetatableError::Validation)?;

        self.in_transaction(|| {
            self.check_uniqueness(&model, &values, Some(&record), Some(id))?;
            if let Some(sluggable) = &model.metadata.sluggable {
                // Re-derive only when the source text actually changed
                if values.contains_key(&sluggable.source_column) {
                    self.apply_slug(&model, sluggable, &mut values, Some(id), false)?;
                }
            }
            if !values.is_empty() {
                self.stamp_timestamps(&model, &mut values, false);
                self.update_row(&model, id, &values)?;
            }
            for (m2m, related_ids) in &pivots {
                self.replace_pivot_rows(m2m, id, related_ids)?;
            }
            Ok(())
        })
    }

    /// Delete a record. With a `soft_deletes` behavior the row is retained
    /// and its deleted-at column stamped; otherwise the row (and its pivot
    /// rows) are removed. Returns false when no such record exists.
    pub fn delete(&self, table: &str, id: i64, actor: &ActorContext) -> Result<bool> {
        let model = self.resolve(table)?;
        let record = match self.fetch_record(&model, id, false)? {
            Some(record) => record,
            None => return Ok(false),
        };
        self.authorize(&model, Action::Delete, actor, Some(&record))?;

        let pk = pk_column(&model)?.to_string();
        self.in_transaction(|| {
            match soft_delete_column(&model) {
                Some(column) => {
                    self.db.execute(
                        &format!(
                            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                            quote_ident(&model.table),
                            quote_ident(&column),
                            quote_ident(&pk)
                        ),
                        &[Value::String(now_string()), Value::Number(id.into())],
                    )?;
                }
                None => {
                    for m2m in &model.metadata.many_to_many {
                        self.db.execute(
                            &format!(
                                "DELETE FROM {} WHERE {} = ?1",
                                quote_ident(&m2m.pivot_table),
                                quote_ident(&m2m.local_key)
                            ),
                            &[Value::Number(id.into())],
                        )?;
                    }
                    self.db.execute(
                        &format!(
                            "DELETE FROM {} WHERE {} = ?1",
                            quote_ident(&model.table),
                            quote_ident(&pk)
                        ),
                        &[Value::Number(id.into())],
                    )?;
                }
            }
            Ok(true)
        })
    }

    // ── Read operations ──────────────────────────────────────────────

    /// Read one record by id, with declared many-to-many id arrays
    /// attached. Soft-deleted rows are invisible here.
    pub fn get(&self, table: &str, id: i64, actor: &ActorContext) -> Result<Value> {
        self.get_record(table, id, actor, false)
    }

    /// Read one record by id, including soft-deleted rows.
    pub fn get_including_deleted(&self, table: &str, id: i64, actor: &ActorContext) -> Result<Value> {
        self.get_record(table, id, actor, true)
    }

    fn get_record(
        &self,
        table: &str,
        id: i64,
        actor: &ActorContext,
        include_deleted: bool,
    ) -> Result<Value> {
        let model = self.resolve(table)?;
        let mut record = self
            .fetch_record(&model, id, include_deleted)?
            .ok_or(MetatableError::RecordNotFound {
                table: table.to_string(),
                id,
            })?;
        self.authorize(&model, Action::Read, actor, Some(&record))?;
        self.attach_related_ids(&model, id, &mut record)?;
        Ok(record)
    }

    /// List records, honoring list_view sort/page metadata, filtering
    /// soft-deleted rows, and applying the per-row read check.
    pub fn list(&self, table: &str, actor: &ActorContext, options: &ListOptions) -> Result<Vec<Value>> {
        let model = self.resolve(table)?;

        let mut sql = format!("SELECT * FROM {}", quote_ident(&model.table));
        if !options.include_deleted {
            if let Some(column) = soft_delete_column(&model) {
                sql.push_str(&format!(" WHERE {} IS NULL", quote_ident(&column)));
            }
        }

        let list_view = model.metadata.list_view.clone().unwrap_or_default();
        let sort_column = list_view
            .sort_column
            .as_deref()
            .filter(|c| model.has_field(c))
            .map(str::to_string)
            .or_else(|| pk_column(&model).ok().map(str::to_string));
        if let Some(column) = sort_column {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                quote_ident(&column),
                if list_view.sort_desc { "DESC" } else { "ASC" }
            ));
        }
        if let Some(page_size) = list_view.page_size {
            sql.push_str(&format!(
                " LIMIT {page_size} OFFSET {}",
                u64::from(options.page) * u64::from(page_size)
            ));
        }

        let records = self.db.query_rows(&sql, &[])?;
        let manager = PermissionManager::new(&model.metadata);
        let mut records = manager.filter_records(records, actor);

        if !model.metadata.many_to_many.is_empty() {
            let pk = pk_column(&model)?.to_string();
            for record in &mut records {
                let Some(id) = record.get(&pk).and_then(Value::as_i64) else {
                    continue;
                };
                self.attach_related_ids(&model, id, record)?;
            }
        }
        Ok(records)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn authorize(
        &self,
        model: &FieldModel,
        action: Action,
        actor: &ActorContext,
        record: Option<&Value>,
    ) -> Result<()> {
        let manager = PermissionManager::new(&model.metadata);
        if manager.authorize(action, actor, record) {
            Ok(())
        } else {
            Err(MetatableError::PermissionDenied {
                action: action.as_str().to_string(),
                table: model.table.clone(),
            })
        }
    }

    fn reject_unknown_keys(&self, model: &FieldModel, input: &Map<String, Value>) -> Result<()> {
        for key in input.keys() {
            if !model.accepts_key(key) {
                return Err(MetatableError::UnknownField {
                    table: model.table.clone(),
                    field: key.clone(),
                });
            }
        }
        Ok(())
    }

    /// All writes for one logical operation run through here: begin, run,
    /// commit; any failure rolls the whole operation back. Driver errors
    /// are logged and surfaced as a generic persistence failure.
    pub(crate) fn in_transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.db.begin_transaction()?;
        match f() {
            Ok(value) => {
                self.db.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.db.rollback_transaction() {
                    log::error!("Rollback failed: {rollback_err}");
                }
                Err(surface(e))
            }
        }
    }

    pub(crate) fn fetch_record(
        &self,
        model: &FieldModel,
        id: i64,
        include_deleted: bool,
    ) -> Result<Option<Value>> {
        let pk = pk_column(model)?;
        let mut sql = format!(
            "SELECT * FROM {} WHERE {} = ?1",
            quote_ident(&model.table),
            quote_ident(pk)
        );
        if !include_deleted {
            if let Some(column) = soft_delete_column(model) {
                sql.push_str(&format!(" AND {} IS NULL", quote_ident(&column)));
            }
        }
        self.db.query_row(&sql, &[Value::Number(id.into())])
    }

    /// Single-column `unique` and table-level `unique_together` checks.
    /// On update, missing group members are filled from the existing row.
    fn check_uniqueness(
        &self,
        model: &FieldModel,
        values: &BTreeMap<String, Value>,
        existing: Option<&Value>,
        exclude_id: Option<i64>,
    ) -> Result<()> {
        let mut errors = ValidationErrors::new();
        let pk = pk_column(model)?;

        for field in &model.fields {
            if !field.metadata.unique {
                continue;
            }
            let value = match values.get(&field.name) {
                Some(v) if !v.is_null() => v,
                _ => continue,
            };
            if self.value_exists(model, &[(field.name.as_str(), value)], pk, exclude_id)? {
                errors.add(&field.name, "already exists");
            }
        }

        for group in &model.metadata.unique_together {
            let mut pairs = Vec::new();
            for column in group {
                let value = values
                    .get(column)
                    .or_else(|| existing.and_then(|record| record.get(column)));
                match value {
                    Some(v) if !v.is_null() => pairs.push((column.as_str(), v)),
                    _ => {
                        pairs.clear();
                        break;
                    }
                }
            }
            if pairs.len() == group.len()
                && group.iter().any(|c| values.contains_key(c))
                && self.value_exists(model, &pairs, pk, exclude_id)?
            {
                for column in group {
                    errors.add(column, format!("must be unique together with {}", group.join(", ")));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MetatableError::Validation(errors))
        }
    }

    fn value_exists(
        &self,
        model: &FieldModel,
        pairs: &[(&str, &Value)],
        pk: &str,
        exclude_id: Option<i64>,
    ) -> Result<bool> {
        let mut sql = format!("SELECT COUNT(*) FROM {} WHERE ", quote_ident(&model.table));
        let mut params = Vec::new();
        for (i, (column, value)) in pairs.iter().enumerate() {
            if i > 0 {
                sql.push_str(" AND ");
            }
            sql.push_str(&format!("{} = ?{}", quote_ident(column), i + 1));
            params.push((*value).clone());
        }
        if let Some(id) = exclude_id {
            sql.push_str(&format!(" AND {} != ?{}", quote_ident(pk), params.len() + 1));
            params.push(Value::Number(id.into()));
        }
        Ok(self.db.query_count(&sql, &params)? > 0)
    }

    /// Derive the slug from the source column and resolve collisions with
    /// an incrementing numeric suffix. Runs inside the operation's
    /// transaction; concurrent inserts of the same source text remain a
    /// documented race.
    fn apply_slug(
        &self,
        model: &FieldModel,
        cfg: &SluggableBehavior,
        values: &mut BTreeMap<String, Value>,
        exclude_id: Option<i64>,
        creating: bool,
    ) -> Result<()> {
        if !model.has_field(&cfg.target_column) {
            return Ok(());
        }
        // An explicitly provided slug wins on update
        if !creating && values.get(&cfg.target_column).is_some_and(|v| !v.is_null()) {
            return Ok(());
        }
        let source = match values.get(&cfg.source_column).and_then(Value::as_str) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return Ok(()),
        };

        let base = derive_slug(&source, cfg);
        let mut candidate = base.clone();
        if cfg.unique {
            let pk = pk_column(model)?;
            let mut suffix = 1;
            while self.value_exists(
                model,
                &[(cfg.target_column.as_str(), &Value::String(candidate.clone()))],
                pk,
                exclude_id,
            )? {
                candidate = format!("{base}{}{suffix}", cfg.separator);
                suffix += 1;
            }
        }
        values.insert(cfg.target_column.clone(), Value::String(candidate));
        Ok(())
    }

    /// Server-side created/updated stamping; client-supplied values are
    /// overridden.
    fn stamp_timestamps(&self, model: &FieldModel, values: &mut BTreeMap<String, Value>, creating: bool) {
        if let Some(ts) = &model.metadata.timestamps {
            let now = now_string();
            if creating && model.has_field(&ts.created_at_column) {
                values.insert(ts.created_at_column.clone(), Value::String(now.clone()));
            }
            if model.has_field(&ts.updated_at_column) {
                values.insert(ts.updated_at_column.clone(), Value::String(now));
            }
        }
    }

    fn insert_row(&self, model: &FieldModel, values: &BTreeMap<String, Value>) -> Result<i64> {
        // Columns in physical field order, restricted to the validated set
        let columns: Vec<&str> = model
            .fields
            .iter()
            .filter(|f| values.contains_key(&f.name))
            .map(|f| f.name.as_str())
            .collect();

        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let params: Vec<Value> = columns.iter().map(|c| values[*c].clone()).collect();

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&model.table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&model.table),
                column_list.join(", "),
                placeholders.join(", ")
            )
        };
        self.db.execute(&sql, &params)?;
        Ok(self.db.last_insert_rowid())
    }

    fn update_row(&self, model: &FieldModel, id: i64, values: &BTreeMap<String, Value>) -> Result<()> {
        let pk = pk_column(model)?;
        let columns: Vec<&str> = model
            .fields
            .iter()
            .filter(|f| values.contains_key(&f.name))
            .map(|f| f.name.as_str())
            .collect();

        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
            .collect();
        let mut params: Vec<Value> = columns.iter().map(|c| values[*c].clone()).collect();
        params.push(Value::Number(id.into()));

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(&model.table),
            assignments.join(", "),
            quote_ident(pk),
            params.len()
        );
        self.db.execute(&sql, &params)?;
        Ok(())
    }

    /// Full-replace pivot synchronization: delete every pivot row for this
    /// record, then insert the new set. An empty set clears all
    /// associations. This is the defined semantics, not a missing diff.
    fn replace_pivot_rows(&self, m2m: &ManyToMany, local_id: i64, related_ids: &[i64]) -> Result<()> {
        self.db.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(&m2m.pivot_table),
                quote_ident(&m2m.local_key)
            ),
            &[Value::Number(local_id.into())],
        )?;
        for related in related_ids {
            self.db.execute(
                &format!(
                    "INSERT INTO {} ({}, {}) VALUES (?1, ?2)",
                    quote_ident(&m2m.pivot_table),
                    quote_ident(&m2m.local_key),
                    quote_ident(&m2m.foreign_key)
                ),
                &[Value::Number(local_id.into()), Value::Number((*related).into())],
            )?;
        }
        Ok(())
    }

    /// Load each declared many-to-many id array onto the record, under the
    /// relation's field name.
    fn attach_related_ids(&self, model: &FieldModel, id: i64, record: &mut Value) -> Result<()> {
        if let Value::Object(obj) = record {
            for m2m in &model.metadata.many_to_many {
                let related = self.load_related_ids(m2m, id)?;
                obj.insert(
                    m2m.field.clone(),
                    Value::Array(related.into_iter().map(|i| Value::Number(i.into())).collect()),
                );
            }
        }
        Ok(())
    }

    fn load_related_ids(&self, m2m: &ManyToMany, local_id: i64) -> Result<Vec<i64>> {
        let rows = self.db.query_rows(
            &format!(
                "SELECT {} AS related FROM {} WHERE {} = ?1",
                quote_ident(&m2m.foreign_key),
                quote_ident(&m2m.pivot_table),
                quote_ident(&m2m.local_key)
            ),
            &[Value::Number(local_id.into())],
        )?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("related").and_then(Value::as_i64))
            .collect())
    }
}

/// Split declared many-to-many fields out of the input map. Each must be an
/// array of ids (numbers, or strings as forms submit them); null clears the
/// relation.
fn split_pivot_input(
    model: &FieldModel,
    input: &Map<String, Value>,
) -> Result<(Map<String, Value>, Vec<(ManyToMany, Vec<i64>)>)> {
    let mut column_input = input.clone();
    let mut pivots = Vec::new();
    let mut errors = ValidationErrors::new();

    for m2m in &model.metadata.many_to_many {
        let Some(raw) = column_input.remove(&m2m.field) else {
            continue;
        };
        match raw {
            Value::Null => pivots.push((m2m.clone(), Vec::new())),
            Value::Array(items) => {
                let mut ids = Vec::with_capacity(items.len());
                let mut bad = false;
                for item in &items {
                    match related_id(item) {
                        Some(id) => ids.push(id),
                        None => {
                            bad = true;
                            break;
                        }
                    }
                }
                if bad {
                    errors.add(&m2m.field, "must be an array of ids");
                } else {
                    pivots.push((m2m.clone(), ids));
                }
            }
            _ => errors.add(&m2m.field, "must be an array of ids"),
        }
    }

    if errors.is_empty() {
        Ok((column_input, pivots))
    } else {
        Err(MetatableError::Validation(errors))
    }
}

fn related_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn pk_column(model: &FieldModel) -> Result<&str> {
    model
        .primary_key()
        .map(|f| f.name.as_str())
        .ok_or_else(|| MetatableError::Other(format!("Table '{}' has no primary key", model.table)))
}

fn soft_delete_column(model: &FieldModel) -> Option<String> {
    model
        .metadata
        .soft_deletes
        .as_ref()
        .filter(|sd| model.has_field(&sd.column))
        .map(|sd| sd.column.clone())
}

pub(crate) fn now_string() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn derive_slug(source: &str, cfg: &SluggableBehavior) -> String {
    if cfg.lowercase {
        let base = slug::slugify(source);
        if cfg.separator == "-" {
            base
        } else {
            base.replace('-', &cfg.separator)
        }
    } else {
        // Case-preserving variant: alphanumeric runs joined by the separator
        let mut out = String::with_capacity(source.len());
        let mut pending_sep = false;
        for ch in source.chars() {
            if ch.is_ascii_alphanumeric() {
                if pending_sep && !out.is_empty() {
                    out.push_str(&cfg.separator);
                }
                pending_sep = false;
                out.push(ch);
            } else {
                pending_sep = true;
            }
        }
        out
    }
}

fn surface(e: MetatableError) -> MetatableError {
    match e {
        MetatableError::Sqlite(err) => {
            log::error!("Database failure during operation: {err}");
            MetatableError::Persistence(err.to_string())
        }
        other => other,
    }
}

/// Boundary shape for embedding callers: a discriminated success/failure
/// result that never leaks raw driver error text.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<BTreeMap<String, String>>,
}

impl OperationReport {
    pub fn success(id: Option<i64>) -> Self {
        OperationReport {
            success: true,
            id,
            error: None,
            field_errors: None,
        }
    }

    pub fn failure(error: &MetatableError) -> Self {
        let field_errors = match error {
            MetatableError::Validation(errors) => Some(errors.field_errors.clone()),
            _ => None,
        };
        OperationReport {
            success: false,
            id: None,
            error: Some(error.public_message()),
            field_errors,
        }
    }

    pub fn from_result(result: &Result<i64>) -> Self {
        match result {
            Ok(id) => OperationReport::success(Some(*id)),
            Err(e) => OperationReport::failure(e),
        }
    }
}
