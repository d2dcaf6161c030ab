//! Field mapper
//!
//! Projects a raw record onto its configured fields. Without an explicit
//! type a value is passed through as the exact text it was read as; numbers
//! are never sniffed. A field with a `key` reads JSON object records by
//! name and everything else by position.

use serde_json::{Number, Value};
use thiserror::Error;

use crate::config::{FieldSpec, FieldType};
use crate::reader::RawRecord;

/// Node properties in configured field order
pub type PropertyMap = serde_json::Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("record has {available} field(s), '{property}' needs position {position}")]
    MissingField {
        property: String,
        position: usize,
        available: usize,
    },

    #[error("'{property}' value {raw:?} is not a valid {expected}")]
    Coercion {
        property: String,
        raw: String,
        expected: &'static str,
    },
}

/// Build the property map of one record
pub fn map_record(record: &RawRecord, fields: &[FieldSpec]) -> Result<PropertyMap, MapError> {
    let mut properties = PropertyMap::with_capacity(fields.len());
    for field in fields {
        let raw = match (&field.key, &record.keys) {
            // an object that leaves the key out has no value for it
            (Some(key), Some(_)) => record.get_key(key),
            _ => Some(
                record
                    .fields
                    .get(field.position)
                    .ok_or_else(|| MapError::MissingField {
                        property: field.property_name.clone(),
                        position: field.position,
                        available: record.fields.len(),
                    })?
                    .as_str(),
            ),
        };

        let value = match raw {
            None => Value::Null,
            Some(raw) => coerce(raw, field.explicit_type).ok_or_else(|| MapError::Coercion {
                property: field.property_name.clone(),
                raw: raw.to_string(),
                expected: type_name(field.explicit_type),
            })?,
        };
        properties.insert(field.property_name.clone(), value);
    }
    Ok(properties)
}

/// Convert raw text per `explicit_type`; `None` when the text does not fit
pub fn coerce(raw: &str, explicit_type: Option<FieldType>) -> Option<Value> {
    let Some(kind) = explicit_type else {
        return Some(Value::String(raw.to_string()));
    };

    let trimmed = raw.trim();
    if kind != FieldType::String && trimmed.is_empty() {
        return Some(Value::Null);
    }

    match kind {
        FieldType::String => Some(Value::String(raw.to_string())),
        FieldType::Integer => trimmed.parse::<i64>().ok().map(Value::from),
        FieldType::Float => {
            let parsed = trimmed.parse::<f64>().ok().filter(|f| f.is_finite())?;
            // keep the source digits whenever they are already JSON float
            // syntax; integer spellings gain a fraction so the store sees a float
            let number = serde_json::from_str::<Number>(trimmed).ok().and_then(|n| {
                if n.is_f64() {
                    Some(n)
                } else {
                    serde_json::from_str::<Number>(&format!("{}.0", trimmed)).ok()
                }
            });
            number.or_else(|| Number::from_f64(parsed)).map(Value::Number)
        },
        FieldType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
    }
}

fn type_name(explicit_type: Option<FieldType>) -> &'static str {
    match explicit_type {
        None | Some(FieldType::String) => "string",
        Some(FieldType::Integer) => "integer",
        Some(FieldType::Float) => "float",
        Some(FieldType::Boolean) => "boolean",
    }
}
