//! Atomic field operations and their application to document fields.

use crate::error::{Result, StoreError};
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single atomic operation on one document field.
///
/// Collection-valued and counter fields are only ever mutated through these
/// primitives, so concurrent writers commute instead of overwriting each other.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldOperation {
    /// Replace the field value.
    Set(Value),
    /// Set the field to the commit timestamp assigned by the store.
    ServerTimestamp,
    /// Add each element not already present (set-add).
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of each element (set-remove).
    ArrayRemove(Vec<Value>),
    /// Append one element to the end of a sequence.
    ///
    /// With `stamp`, the element must be an object and receives the commit
    /// timestamp under that key.
    ArrayAppend { item: Value, stamp: Option<String> },
    /// Add a signed delta to an integer field (missing counts as 0).
    Increment(i64),
}

/// An operation targeted at a named field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field: String,
    pub operation: FieldOperation,
}

impl FieldUpdate {
    pub fn new(field: impl Into<String>, operation: FieldOperation) -> Self {
        Self {
            field: field.into(),
            operation,
        }
    }

    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FieldOperation::Set(value.into()))
    }

    pub fn server_timestamp(field: impl Into<String>) -> Self {
        Self::new(field, FieldOperation::ServerTimestamp)
    }

    pub fn array_union(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FieldOperation::ArrayUnion(values))
    }

    pub fn array_remove(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FieldOperation::ArrayRemove(values))
    }

    pub fn array_append(field: impl Into<String>, item: Value, stamp: Option<&str>) -> Self {
        Self::new(
            field,
            FieldOperation::ArrayAppend {
                item,
                stamp: stamp.map(str::to_string),
            },
        )
    }

    pub fn increment(field: impl Into<String>, delta: i64) -> Self {
        Self::new(field, FieldOperation::Increment(delta))
    }
}

/// Apply a batch of updates to a document's fields.
///
/// Updates are applied to a scratch copy; the fields are only replaced when
/// every update succeeded, so a failing batch leaves the document untouched.
pub fn apply_updates(
    fields: &mut Map<String, Value>,
    updates: &[FieldUpdate],
    now: Timestamp,
) -> Result<()> {
    let mut scratch = fields.clone();
    for update in updates {
        apply_update(&mut scratch, update, now)?;
    }
    *fields = scratch;
    Ok(())
}

/// Apply one update to a document's fields.
pub fn apply_update(
    fields: &mut Map<String, Value>,
    update: &FieldUpdate,
    now: Timestamp,
) -> Result<()> {
    let name = update.field.as_str();

    match &update.operation {
        FieldOperation::Set(value) => {
            fields.insert(name.to_string(), value.clone());
        }

        FieldOperation::ServerTimestamp => {
            fields.insert(name.to_string(), Value::from(now.0));
        }

        FieldOperation::ArrayUnion(values) => {
            let arr = array_field(fields, name)?;
            for value in values {
                if !arr.contains(value) {
                    arr.push(value.clone());
                }
            }
        }

        FieldOperation::ArrayRemove(values) => {
            let arr = array_field(fields, name)?;
            arr.retain(|existing| !values.contains(existing));
        }

        FieldOperation::ArrayAppend { item, stamp } => {
            let mut item = item.clone();
            if let Some(key) = stamp {
                match item.as_object_mut() {
                    Some(obj) => {
                        obj.insert(key.clone(), Value::from(now.0));
                    }
                    None => {
                        return Err(StoreError::InvalidOperation(format!(
                            "Cannot stamp non-object element appended to '{}'",
                            name
                        )));
                    }
                }
            }
            array_field(fields, name)?.push(item);
        }

        FieldOperation::Increment(delta) => {
            let current = match fields.get(name) {
                None | Some(Value::Null) => 0,
                Some(value) => value.as_i64().ok_or_else(|| {
                    StoreError::InvalidOperation(format!(
                        "Cannot increment non-integer field '{}'",
                        name
                    ))
                })?,
            };

            let next = current.checked_add(*delta).ok_or_else(|| {
                StoreError::InvalidOperation(format!("Increment of '{}' overflows", name))
            })?;

            fields.insert(name.to_string(), Value::from(next));
        }
    }

    Ok(())
}

/// Get a field as a mutable array, creating it when missing.
fn array_field<'a>(fields: &'a mut Map<String, Value>, name: &str) -> Result<&'a mut Vec<Value>> {
    let slot = fields
        .entry(name.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));

    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }

    slot.as_array_mut().ok_or_else(|| {
        StoreError::InvalidOperation(format!("Field '{}' is not an array", name))
    })
}
