//! Custom-field validation
//!
//! Categories declare the shape of their documents' `customFields` as data
//! ([`CustomFieldsConfig`]). [`validate`] interprets that schema against a
//! field map and reports every violation at once, in a stable order:
//! required fields in declaration order, then declared fields by name.

use crate::database::models::{CustomFieldsConfig, FieldConstraints, FieldKind, FieldSpec};
use crate::error::{AppError, FieldError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::{Map, Value};

const FIELD_PREFIX: &str = "customFields";

fn field_path(name: &str) -> String {
    format!("{}.{}", FIELD_PREFIX, name)
}

/// Check `fields` against `config`. An empty list means the map is valid.
pub fn validate(config: &CustomFieldsConfig, fields: &Map<String, Value>) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for name in &config.required {
        if fields.get(name).map_or(true, is_empty) {
            errors.push(FieldError::new(field_path(name), format!("{} is required", name)));
        }
    }

    for (name, spec) in &config.field_types {
        match fields.get(name) {
            None | Some(Value::Null) => {}
            Some(value) => check_field(name, spec, value, &mut errors),
        }
    }

    errors
}

/// [`validate`], turned into `ValidationFailed` when anything is wrong
pub fn ensure_valid(config: &CustomFieldsConfig, fields: &Map<String, Value>) -> Result<()> {
    let errors = validate(config, fields);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::ValidationFailed(errors))
    }
}

/// Missing-equivalent values for required fields. `0` and `false` are present.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn check_field(name: &str, spec: &FieldSpec, value: &Value, errors: &mut Vec<FieldError>) {
    let mut push = |message: String| errors.push(FieldError::new(field_path(name), message));

    match spec.kind {
        FieldKind::String if !value.is_string() => push(format!("{} must be a string", name)),
        FieldKind::Number if !value.is_number() => push(format!("{} must be a number", name)),
        FieldKind::Boolean if !value.is_boolean() => push(format!("{} must be a boolean", name)),
        FieldKind::Date if !is_date(value) => push(format!("{} must be a valid date", name)),
        FieldKind::Array if !value.is_array() => push(format!("{} must be an array", name)),
        FieldKind::Object if !value.is_object() => push(format!("{} must be an object", name)),
        FieldKind::Select if !spec.options.contains(value) => push(format!(
            "{} must be one of the options: {}",
            name,
            join_values(&spec.options)
        )),
        _ => {}
    }

    if let Some(constraints) = &spec.validation {
        check_constraints(name, constraints, value, &mut push);
    }
}

fn check_constraints(
    name: &str,
    constraints: &FieldConstraints,
    value: &Value,
    push: &mut impl FnMut(String),
) {
    if constraints.min.is_some() || constraints.max.is_some() {
        match as_number(value) {
            Some(number) => {
                if let Some(min) = constraints.min.filter(|min| number < *min) {
                    push(format!("{} must be greater than or equal to {}", name, min));
                }
                if let Some(max) = constraints.max.filter(|max| number > *max) {
                    push(format!("{} must be less than or equal to {}", name, max));
                }
            }
            None => push(format!("{} must be numeric to check its range", name)),
        }
    }

    if let Some(pattern) = &constraints.pattern {
        match Regex::new(pattern) {
            Ok(regex) => {
                let matched = as_text(value).map_or(false, |text| regex.is_match(&text));
                if !matched {
                    push(format!("{} has an invalid format", name));
                }
            }
            Err(_) => push(format!("{} has an unusable format rule", name)),
        }
    }

    if let Some(allowed) = &constraints.allowed {
        if !allowed.contains(value) {
            push(format!(
                "{} must be one of the values: {}",
                name,
                join_values(allowed)
            ));
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_date(value: &Value) -> bool {
    let Some(text) = value.as_str() else {
        return false;
    };
    let text = text.trim();

    DateTime::parse_from_rfc3339(text).is_ok()
        || NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").is_ok()
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
