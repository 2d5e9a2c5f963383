// Per-field validation and strict coercion. Errors are collected into a
// field -> message map, never fail-fast, so a form can show every problem
// at once. Pure: uniqueness checks that need the database live in the
// engine.

use crate::catalog::SqlType;
use crate::error::ValidationErrors;
use crate::metadata::{CompareOp, ConditionalRule};
use crate::model::{Field, FieldModel};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update,
}

/// Validate and coerce a flat input map against the field model. On create,
/// required fields must be present; on update only the provided fields are
/// checked. Returns the coerced column values or the collected errors.
pub fn validate_input(
    model: &FieldModel,
    input: &Map<String, Value>,
    mode: WriteMode,
) -> Result<BTreeMap<String, Value>, ValidationErrors> {
    let mut errors = ValidationErrors::new();
    let mut values = BTreeMap::new();

    for field in &model.fields {
        if field.is_primary_key {
            continue;
        }
        let provided = input.get(&field.name);
        let is_null = matches!(provided, None | Some(Value::Null));

        if is_null {
            if field.is_required() {
                match mode {
                    WriteMode::Create => errors.add(&field.name, "is required"),
                    // A present-but-null value on update clears a required field
                    WriteMode::Update if provided.is_some() => {
                        errors.add(&field.name, "is required")
                    }
                    WriteMode::Update => {}
                }
            } else if provided.is_some() {
                values.insert(field.name.clone(), Value::Null);
            }
            continue;
        }

        let Some(raw) = provided else { continue };
        match coerce_value(field, raw) {
            Ok(coerced) => {
                if let Some(message) = check_constraints(field, &coerced) {
                    errors.add(&field.name, message);
                } else {
                    values.insert(field.name.clone(), coerced);
                }
            }
            Err(message) => errors.add(&field.name, message),
        }
    }

    for field in &model.fields {
        for rule in &field.metadata.rules {
            if let Some(message) = check_rule(field, rule, input, &values) {
                errors.add(&field.name, message);
            }
        }
    }

    if errors.is_empty() {
        Ok(values)
    } else {
        Err(errors)
    }
}

/// Strictly coerce one raw value to the field's SQL type. Forms submit
/// strings, so string representations parse; anything lossy fails rather
/// than truncating.
pub fn coerce_value(field: &Field, raw: &Value) -> Result<Value, String> {
    match field.sql_type {
        SqlType::Int | SqlType::BigInt => match raw {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(raw.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| Value::Number(i.into()))
                .map_err(|_| format!("'{s}' is not an integer")),
            _ => Err(format!("expected an integer, got {}", json_type_name(raw))),
        },
        SqlType::Float | SqlType::Decimal => match raw {
            Value::Number(_) => Ok(raw.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{s}' is not a number")),
            _ => Err(format!("expected a number, got {}", json_type_name(raw))),
        },
        SqlType::Boolean => match raw {
            Value::Bool(_) => Ok(raw.clone()),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                other => Err(format!("'{other}' is not a boolean")),
            },
            _ => Err(format!("expected a boolean, got {}", json_type_name(raw))),
        },
        SqlType::Date => require_parsed_string(raw, "date", |s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        }),
        SqlType::DateTime | SqlType::Timestamp => require_parsed_string(raw, "datetime", |s| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
                || chrono::DateTime::parse_from_rfc3339(s).is_ok()
        }),
        SqlType::Time => require_parsed_string(raw, "time", |s| {
            NaiveTime::parse_from_str(s, "%H:%M:%S").is_ok()
        }),
        SqlType::Enum => match raw {
            Value::String(s) if field.enum_values.iter().any(|v| v == s) => Ok(raw.clone()),
            Value::String(s) => Err(format!(
                "'{s}' is not one of: {}",
                field.enum_values.join(", ")
            )),
            _ => Err(format!("expected a string, got {}", json_type_name(raw))),
        },
        SqlType::Json => Ok(raw.clone()),
        SqlType::Varchar | SqlType::Text | SqlType::Blob => match raw {
            Value::String(_) => Ok(raw.clone()),
            _ => Err(format!("expected a string, got {}", json_type_name(raw))),
        },
    }
}

fn require_parsed_string(
    raw: &Value,
    kind: &str,
    parses: impl Fn(&str) -> bool,
) -> Result<Value, String> {
    match raw {
        Value::String(s) if parses(s.trim()) => Ok(Value::String(s.trim().to_string())),
        Value::String(s) => Err(format!("'{s}' is not a valid {kind}")),
        _ => Err(format!("expected a {kind} string, got {}", json_type_name(raw))),
    }
}

/// Length, range, and pattern checks from metadata, applied to the coerced
/// value. Returns the first violation for this field.
fn check_constraints(field: &Field, value: &Value) -> Option<String> {
    if let Value::String(s) = value {
        let length = s.chars().count();
        if let Some(max) = field.effective_max_length() {
            if length > max {
                return Some(format!("must be at most {max} characters"));
            }
        }
        if let Some(min) = field.metadata.min_length {
            if length < min {
                return Some(format!("must be at least {min} characters"));
            }
        }
        if let Some(pattern) = &field.metadata.pattern {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        return Some("does not match the expected format".to_string());
                    }
                }
                Err(e) => {
                    log::warn!("Invalid pattern for field '{}': {e}", field.name);
                }
            }
        }
    }

    if let Some(n) = numeric(value) {
        if let Some(min) = field.metadata.min {
            if n < min {
                return Some(format!("must be at least {min}"));
            }
        }
        if let Some(max) = field.metadata.max {
            if n > max {
                return Some(format!("must be at most {max}"));
            }
        }
    }

    None
}

/// Evaluate one conditional rule for a field against the full input
/// context. Rules reference other fields by name; a missing referenced
/// value makes the rule vacuously pass.
fn check_rule(
    field: &Field,
    rule: &ConditionalRule,
    input: &Map<String, Value>,
    coerced: &BTreeMap<String, Value>,
) -> Option<String> {
    let lookup = |name: &str| coerced.get(name).or_else(|| input.get(name));

    match rule {
        ConditionalRule::RequiredIf { field: other, equals } => {
            let other_value = lookup(other)?;
            if loosely_equal(other_value, equals)
                && matches!(lookup(&field.name), None | Some(Value::Null))
            {
                return Some(format!("is required when {other} is {equals}"));
            }
            None
        }
        ConditionalRule::Compare { op, other } => {
            let left = numeric(lookup(&field.name)?)?;
            let right = numeric(lookup(other)?)?;
            if !op.holds_f64(left, right) {
                return Some(format!("must be {} {other}", op.describe()));
            }
            None
        }
        ConditionalRule::CompareWhen { when, op, value } => {
            let guard = numeric(lookup(&when.field)?)?;
            if !when.op.holds_f64(guard, when.value) {
                return None;
            }
            let own = numeric(lookup(&field.name)?)?;
            if !op.holds_f64(own, *value) {
                return Some(format!(
                    "must be {} {value} when {} is {} {}",
                    op.describe(),
                    when.field,
                    when.op.describe(),
                    when.value
                ));
            }
            None
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    // Form input arrives as strings; "5" should match a declared 5
    match (numeric(left), numeric(right)) {
        (Some(l), Some(r)) => l == r,
        _ => false,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::model::FieldModelBuilder;
    use rusqlite::Connection;
    use serde_json::json;

    fn model_with(table_comment: Option<&str>, title_comment: Option<&str>) -> FieldModel {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title VARCHAR(50) NOT NULL,
                kind TEXT CHECK (kind IN ('physical', 'digital', 'other')),
                kind_note TEXT,
                price DECIMAL(10,2),
                discount DECIMAL(10,2),
                in_stock BOOLEAN,
                released_on DATE
            );
            ",
        )
        .unwrap();
        let catalog = SqliteCatalog::new(&conn);
        if let Some(comment) = table_comment {
            catalog.set_table_comment("products", comment).unwrap();
        }
        if let Some(comment) = title_comment {
            catalog.set_column_comment("products", "title", comment).unwrap();
        }
        FieldModelBuilder::new(&catalog).resolve("products").unwrap()
    }

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_valid_create_coerces_form_strings() {
        let model = model_with(None, None);
        let values = validate_input(
            &model,
            &input(json!({
                "title": "Widget",
                "kind": "physical",
                "price": "19.99",
                "in_stock": "true",
                "released_on": "2026-03-01"
            })),
            WriteMode::Create,
        )
        .unwrap();

        assert_eq!(values["title"], json!("Widget"));
        assert_eq!(values["price"], json!(19.99));
        assert_eq!(values["in_stock"], json!(true));
        assert_eq!(values["released_on"], json!("2026-03-01"));
    }

    #[test]
    fn test_errors_are_collected_not_fail_fast() {
        let model = model_with(None, None);
        let errors = validate_input(
            &model,
            &input(json!({
                "kind": "imaginary",
                "price": "not-a-number",
                "released_on": "tomorrow"
            })),
            WriteMode::Create,
        )
        .unwrap_err();

        // required title + three bad values, all reported at once
        assert!(errors.field_errors.contains_key("title"));
        assert!(errors.field_errors["kind"].contains("not one of"));
        assert!(errors.field_errors.contains_key("price"));
        assert!(errors.field_errors.contains_key("released_on"));
        assert_eq!(errors.field_errors.len(), 4);
    }

    #[test]
    fn test_strict_int_parse_rejects_truncation() {
        let model = model_with(None, None);
        let field = model.field("id").unwrap();
        assert!(coerce_value(field, &json!("12")).is_ok());
        assert!(coerce_value(field, &json!("12.7")).is_err());
        assert!(coerce_value(field, &json!("12abc")).is_err());
        assert!(coerce_value(field, &json!(true)).is_err());
    }

    #[test]
    fn test_update_only_checks_provided_fields() {
        let model = model_with(None, None);
        // title (required) absent - fine on update
        let values = validate_input(
            &model,
            &input(json!({"price": "5"})),
            WriteMode::Update,
        )
        .unwrap();
        assert_eq!(values["price"], json!(5.0));

        // explicitly nulling a required field is not fine
        let errors = validate_input(
            &model,
            &input(json!({"title": null})),
            WriteMode::Update,
        )
        .unwrap_err();
        assert_eq!(errors.field_errors["title"], "is required");
    }

    #[test]
    fn test_length_and_pattern_constraints() {
        let model = model_with(
            None,
            Some(r#"{"min_length": 3, "pattern": "^[A-Za-z ]+$"}"#),
        );

        let errors = validate_input(
            &model,
            &input(json!({"title": "ab"})),
            WriteMode::Create,
        )
        .unwrap_err();
        assert!(errors.field_errors["title"].contains("at least 3"));

        let errors = validate_input(
            &model,
            &input(json!({"title": "Widget 9000"})),
            WriteMode::Create,
        )
        .unwrap_err();
        assert!(errors.field_errors["title"].contains("format"));

        // physical varchar(50) cap still applies
        let errors = validate_input(
            &model,
            &input(json!({"title": "x".repeat(60)})),
            WriteMode::Create,
        )
        .unwrap_err();
        assert!(errors.field_errors["title"].contains("at most 50"));
    }

    #[test]
    fn test_required_if_rule() {
        let model = model_with(
            Some(
                r#"{"fields": {"kind_note": {"rules": [
                    {"type": "required_if", "field": "kind", "equals": "other"}
                ]}}}"#,
            ),
            None,
        );

        let errors = validate_input(
            &model,
            &input(json!({"title": "Widget", "kind": "other"})),
            WriteMode::Create,
        )
        .unwrap_err();
        assert!(errors.field_errors["kind_note"].contains("required when kind"));

        // guard not triggered
        assert!(validate_input(
            &model,
            &input(json!({"title": "Widget", "kind": "physical"})),
            WriteMode::Create,
        )
        .is_ok());
    }

    #[test]
    fn test_cross_field_compare_when_rule() {
        let model = model_with(
            Some(
                r#"{"fields": {"discount": {"rules": [
                    {"type": "compare_when",
                     "when": {"field": "price", "op": "gt", "value": 100},
                     "op": "lte", "value": 50}
                ]}}}"#,
            ),
            None,
        );

        // price > 100 implies discount <= 50
        let errors = validate_input(
            &model,
            &input(json!({"title": "Widget", "price": "150", "discount": "60"})),
            WriteMode::Create,
        )
        .unwrap_err();
        assert!(errors.field_errors.contains_key("discount"));

        assert!(validate_input(
            &model,
            &input(json!({"title": "Widget", "price": "150", "discount": "40"})),
            WriteMode::Create,
        )
        .is_ok());

        assert!(validate_input(
            &model,
            &input(json!({"title": "Widget", "price": "80", "discount": "60"})),
            WriteMode::Create,
        )
        .is_ok());
    }

    #[test]
    fn test_min_max_from_metadata() {
        let model = model_with(
            Some(r#"{"fields": {"price": {"min": 0, "max": 1000}}}"#),
            None,
        );
        let errors = validate_input(
            &model,
            &input(json!({"title": "Widget", "price": "-1"})),
            WriteMode::Create,
        )
        .unwrap_err();
        assert!(errors.field_errors["price"].contains("at least 0"));
    }

    #[test]
    fn test_nullable_field_accepts_explicit_null() {
        let model = model_with(None, None);
        let values = validate_input(
            &model,
            &input(json!({"title": "Widget", "released_on": null})),
            WriteMode::Create,
        )
        .unwrap();
        assert_eq!(values["released_on"], Value::Null);
    }
}
