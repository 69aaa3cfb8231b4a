use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::trace;

use super::TableModel;
use crate::hooks::{ValidationError, ValidationErrors, Values};
use crate::types::ExtractedValue;
use crate::{ConfluxError, Result};

/// A record after the model ran over it: keys resolved to logical names,
/// defaults applied, hooks run, values coerced to their column types.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInstance {
    values: HashMap<String, ExtractedValue>,
    virtuals: Values,
    supplied: HashSet<String>,
}

impl ModelInstance {
    /// Value of a stored column, by logical name.
    pub fn get(&self, name: &str) -> Option<&ExtractedValue> {
        self.values.get(name)
    }

    /// Value of a virtual column, by logical name.
    pub fn get_virtual(&self, name: &str) -> Option<&JsonValue> {
        self.virtuals.get(name)
    }

    /// True when the raw record carried the column, under either name.
    pub fn was_supplied(&self, name: &str) -> bool {
        self.supplied.contains(name)
    }

    pub(crate) fn set(&mut self, name: &str, value: ExtractedValue) {
        self.values.insert(name.to_string(), value);
    }

    pub(crate) fn remove(&mut self, name: &str) {
        self.values.remove(name);
    }

    /// Stored values, logical names as keys.
    pub fn values(&self) -> &HashMap<String, ExtractedValue> {
        &self.values
    }

    /// Everything the instance holds, virtual columns included.
    pub fn to_json(&self) -> JsonValue {
        let mut out = self.virtuals.clone();
        for (name, value) in &self.values {
            out.insert(name.clone(), value.to_json());
        }
        JsonValue::Object(out)
    }
}

impl TableModel {
    /// Builds an instance from a raw record.
    ///
    /// Keys may be logical or physical names; unknown keys are dropped.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::Validation`] when the record is not a JSON object, a
    /// hook rejects it, or a value cannot be coerced to its column type.
    pub fn build_instance(&self, raw: &JsonValue) -> Result<ModelInstance> {
        self.build_instance_at(raw, Utc::now())
    }

    pub(crate) fn build_instance_at(
        &self,
        raw: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<ModelInstance> {
        let JsonValue::Object(record) = raw else {
            return Err(ConfluxError::Validation(format!(
                "record for '{}' must be a JSON object, got {}",
                self.table_name(),
                json_kind(raw)
            )));
        };

        let mut values = Values::new();
        let mut supplied = HashSet::new();
        for (key, value) in record {
            match self.resolve(key) {
                Some(column) => {
                    supplied.insert(column.name.clone());
                    values.insert(column.name.clone(), value.clone());
                }
                None => trace!(key = key.as_str(), "Dropping key with no column"),
            }
        }

        for column in self.columns() {
            if values.contains_key(&column.name) {
                continue;
            }
            if let Some(default) = &column.default {
                values.insert(column.name.clone(), default.resolve(now));
            }
        }

        self.hooks().run(&mut values)?;
        self.hooks().compute(&mut values);

        let mut errors = ValidationErrors::new();
        let mut stored = HashMap::with_capacity(values.len());
        let mut virtuals = Values::new();
        for (key, value) in values {
            let Some(column) = self.column(&key) else {
                continue;
            };
            if column.virtual_column {
                virtuals.insert(key, value);
                continue;
            }
            match column.column_type.coerce(&value) {
                Ok(coerced) => {
                    stored.insert(key, coerced);
                }
                Err(msg) => errors.add(
                    ValidationError::field(key, msg)
                        .with_type(format!("type_error.{}", column.column_type.sql_name().to_lowercase()))
                        .with_input(value.to_string()),
                ),
            }
        }

        errors.into_result(ModelInstance {
            values: stored,
            virtuals,
            supplied,
        })
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
