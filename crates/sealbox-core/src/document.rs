//! Document model and field patches
//!
//! A document is a flat JSON object plus a store-assigned [`Revision`].
//! Writers either replace the whole object or send a list of [`Patch`]es,
//! optionally guarded by a [`Precondition`] on the revision they read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::ids::Revision;

/// The field map of a document
pub type Fields = Map<String, Value>;

/// A stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Revision assigned by the store on the last write
    pub revision: Revision,
    /// Time of the last write
    pub updated_at: DateTime<Utc>,
    /// Document fields
    pub fields: Fields,
}

impl Document {
    /// Borrow a field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Decode the whole document into a typed record
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(StoreError::from)
    }

    /// Apply a patch in place.
    ///
    /// `now_millis` is the server timestamp substituted for
    /// [`Patch::ServerTimestamp`].
    pub fn apply(&mut self, patch: &Patch, now_millis: i64) -> Result<(), StoreError> {
        apply_patch(&mut self.fields, patch, now_millis)
    }
}

/// A single field mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Patch {
    /// Replace a field
    Set { field: String, value: Value },
    /// Remove a field
    Delete { field: String },
    /// Append values not already present in an array field
    ArrayUnion { field: String, values: Vec<Value> },
    /// Remove every occurrence of the given values from an array field
    ArrayRemove { field: String, values: Vec<Value> },
    /// Insert or replace one entry of a map field
    SetMapEntry { field: String, key: String, value: Value },
    /// Remove one entry of a map field
    RemoveMapEntry { field: String, key: String },
    /// Atomically add to an integer field (missing counts as zero)
    Increment { field: String, by: i64 },
    /// Set a field to the store's monotonic clock, in Unix millis
    ServerTimestamp { field: String },
}

impl Patch {
    /// Shorthand for [`Patch::Set`]
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Patch::Set {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Shorthand for [`Patch::SetMapEntry`]
    pub fn map_entry(field: impl Into<String>, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Patch::SetMapEntry {
            field: field.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Shorthand for [`Patch::RemoveMapEntry`]
    pub fn remove_map_entry(field: impl Into<String>, key: impl Into<String>) -> Self {
        Patch::RemoveMapEntry {
            field: field.into(),
            key: key.into(),
        }
    }

    /// The top-level field this patch touches
    pub fn field(&self) -> &str {
        match self {
            Patch::Set { field, .. }
            | Patch::Delete { field }
            | Patch::ArrayUnion { field, .. }
            | Patch::ArrayRemove { field, .. }
            | Patch::SetMapEntry { field, .. }
            | Patch::RemoveMapEntry { field, .. }
            | Patch::Increment { field, .. }
            | Patch::ServerTimestamp { field } => field,
        }
    }
}

/// Condition a write must satisfy to be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precondition {
    /// Unconditional write (last writer wins)
    #[default]
    None,
    /// Only apply if the document is still at this revision
    Revision(Revision),
}

impl Precondition {
    /// Check the precondition against the current revision
    pub fn check(&self, current: Revision) -> Result<(), StoreError> {
        match self {
            Precondition::None => Ok(()),
            Precondition::Revision(expected) if *expected == current => Ok(()),
            Precondition::Revision(expected) => Err(StoreError::RevisionConflict {
                expected: *expected,
                actual: current,
            }),
        }
    }
}

/// Apply one patch to a field map
pub fn apply_patch(fields: &mut Fields, patch: &Patch, now_millis: i64) -> Result<(), StoreError> {
    match patch {
        Patch::Set { field, value } => {
            fields.insert(field.clone(), value.clone());
        }
        Patch::Delete { field } => {
            fields.remove(field);
        }
        Patch::ArrayUnion { field, values } => {
            let array = array_field(fields, field)?;
            for value in values {
                if !array.contains(value) {
                    array.push(value.clone());
                }
            }
        }
        Patch::ArrayRemove { field, values } => {
            let array = array_field(fields, field)?;
            array.retain(|existing| !values.contains(existing));
        }
        Patch::SetMapEntry { field, key, value } => {
            map_field(fields, field)?.insert(key.clone(), value.clone());
        }
        Patch::RemoveMapEntry { field, key } => {
            map_field(fields, field)?.remove(key);
        }
        Patch::Increment { field, by } => {
            let current = match fields.get(field) {
                None | Some(Value::Null) => 0,
                Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                    StoreError::invalid_patch(format!("Field '{}' is not an integer", field))
                })?,
                Some(_) => {
                    return Err(StoreError::invalid_patch(format!(
                        "Cannot increment non-numeric field '{}'",
                        field
                    )));
                }
            };
            let next = current.checked_add(*by).ok_or_else(|| {
                StoreError::invalid_patch(format!("Counter '{}' overflowed", field))
            })?;
            fields.insert(field.clone(), Value::from(next));
        }
        Patch::ServerTimestamp { field } => {
            fields.insert(field.clone(), Value::from(now_millis));
        }
    }
    Ok(())
}

fn array_field<'a>(fields: &'a mut Fields, field: &str) -> Result<&'a mut Vec<Value>, StoreError> {
    let slot = fields
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
        .ok_or_else(|| StoreError::invalid_patch(format!("Field '{}' is not an array", field)))
}

fn map_field<'a>(fields: &'a mut Fields, field: &str) -> Result<&'a mut Map<String, Value>, StoreError> {
    let slot = fields
        .entry(field.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if slot.is_null() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
        .ok_or_else(|| StoreError::invalid_patch(format!("Field '{}' is not a map", field)))
}
