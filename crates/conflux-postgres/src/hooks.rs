//! Model hooks: per-record validation, value rewriting and computed fields.
//!
//! Hooks run while a [`TableModel`](crate::TableModel) builds an instance
//! from a raw record, after defaults are applied and before values are
//! coerced to their column types. They see and edit the record keyed by
//! logical column name.

use crate::{ConfluxError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Record values keyed by logical column name.
pub type Values = Map<String, JsonValue>;

/// Validation error with location information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Error location (field path)
    pub loc: Vec<String>,
    /// Error message
    pub msg: String,
    /// Error type
    pub error_type: String,
    /// Input value that caused the error (as string)
    pub input: Option<String>,
}

impl ValidationError {
    /// Create a field validation error.
    pub fn field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            loc: vec![field.into()],
            msg: msg.into(),
            error_type: "value_error".to_string(),
            input: None,
        }
    }

    /// Create with a specific error type.
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    /// Set the input value.
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Prefix the location, e.g. with the record's position in a batch.
    pub fn nested(mut self, parent: impl Into<String>) -> Self {
        self.loc.insert(0, parent.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.loc.join("."), self.msg)
    }
}

/// Collection of validation errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrors {
    /// List of errors
    pub errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn add(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(value)` when empty, otherwise a [`ConfluxError::Validation`].
    pub fn into_result<T>(self, value: T) -> Result<T> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self.into())
        }
    }
}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msgs: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "Validation failed: {}", msgs.join("; "))
    }
}

impl From<ValidationErrors> for ConfluxError {
    fn from(errors: ValidationErrors) -> Self {
        ConfluxError::Validation(errors.to_string())
    }
}

/// A hook run on every instance built by a model.
///
/// Hooks may rewrite `values` in place (normalise casing, fill derived
/// columns) or reject the record.
pub trait ModelHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn before_save(&self, values: &mut Values) -> std::result::Result<(), ValidationErrors>;
}

/// Value of a virtual column, derived from the stored ones.
///
/// Computed values are visible to callers of
/// [`ModelInstance::get`](crate::ModelInstance::get) but never written.
pub trait ComputedField: Send + Sync {
    /// Logical name of the virtual column this computes.
    fn field_name(&self) -> &str;

    fn compute(&self, values: &Values) -> JsonValue;
}

/// [`ModelHook`] backed by a closure.
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&mut Values) -> std::result::Result<(), ValidationErrors> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> ModelHook for FnHook<F>
where
    F: Fn(&mut Values) -> std::result::Result<(), ValidationErrors> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn before_save(&self, values: &mut Values) -> std::result::Result<(), ValidationErrors> {
        (self.f)(values)
    }
}

/// [`ComputedField`] backed by a closure.
pub struct FnComputed<F> {
    field_name: String,
    f: F,
}

impl<F> FnComputed<F>
where
    F: Fn(&Values) -> JsonValue + Send + Sync,
{
    pub fn new(field_name: impl Into<String>, f: F) -> Self {
        Self {
            field_name: field_name.into(),
            f,
        }
    }
}

impl<F> ComputedField for FnComputed<F>
where
    F: Fn(&Values) -> JsonValue + Send + Sync,
{
    fn field_name(&self) -> &str {
        &self.field_name
    }

    fn compute(&self, values: &Values) -> JsonValue {
        (self.f)(values)
    }
}

/// Rejects string values outside a length range. Absent and null values pass.
pub struct LengthValidator {
    field: String,
    min_length: Option<usize>,
    max_length: Option<usize>,
}

impl LengthValidator {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            min_length: None,
            max_length: None,
        }
    }

    pub fn min(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn max(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }
}

impl ModelHook for LengthValidator {
    fn name(&self) -> &str {
        "length"
    }

    fn before_save(&self, values: &mut Values) -> std::result::Result<(), ValidationErrors> {
        let Some(value) = values.get(&self.field).and_then(JsonValue::as_str) else {
            return Ok(());
        };
        let len = value.chars().count();

        if let Some(min) = self.min_length {
            if len < min {
                return Err(ValidationError::field(
                    &self.field,
                    format!("String must be at least {} characters", min),
                )
                .with_type("value_error.string.min_length")
                .with_input(value)
                .into());
            }
        }

        if let Some(max) = self.max_length {
            if len > max {
                return Err(ValidationError::field(
                    &self.field,
                    format!("String must be at most {} characters", max),
                )
                .with_type("value_error.string.max_length")
                .with_input(value)
                .into());
            }
        }

        Ok(())
    }
}

/// Rejects numeric values outside an inclusive range. Absent and null values pass.
pub struct RangeValidator {
    field: String,
    min: Option<f64>,
    max: Option<f64>,
}

impl RangeValidator {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            min: None,
            max: None,
        }
    }

    pub fn ge(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn le(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }
}

impl ModelHook for RangeValidator {
    fn name(&self) -> &str {
        "range"
    }

    fn before_save(&self, values: &mut Values) -> std::result::Result<(), ValidationErrors> {
        let Some(value) = values.get(&self.field).and_then(JsonValue::as_f64) else {
            return Ok(());
        };

        if let Some(min) = self.min.filter(|min| value < *min) {
            return Err(ValidationError::field(&self.field, format!("Value must be >= {}", min))
                .with_type("value_error.number.not_ge")
                .with_input(value.to_string())
                .into());
        }

        if let Some(max) = self.max.filter(|max| value > *max) {
            return Err(ValidationError::field(&self.field, format!("Value must be <= {}", max))
                .with_type("value_error.number.not_le")
                .with_input(value.to_string())
                .into());
        }

        Ok(())
    }
}

/// Hooks and computed fields registered on one model.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn ModelHook>>,
    computed: Vec<Arc<dyn ComputedField>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field(
                "hooks",
                &self.hooks.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .field(
                "computed",
                &self.computed.iter().map(|c| c.field_name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&mut self, hook: Arc<dyn ModelHook>) {
        self.hooks.push(hook);
    }

    pub fn add_computed(&mut self, field: Arc<dyn ComputedField>) {
        self.computed.push(field);
    }

    pub fn computed_fields(&self) -> impl Iterator<Item = &str> {
        self.computed.iter().map(|c| c.field_name())
    }

    /// Runs every hook in registration order.
    ///
    /// All hooks run even after one fails so the caller sees every problem
    /// with the record at once.
    pub fn run(&self, values: &mut Values) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        for hook in &self.hooks {
            if let Err(e) = hook.before_save(values) {
                tracing::trace!(hook = hook.name(), errors = e.len(), "Hook rejected record");
                errors.extend(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Evaluates the computed fields into `values`.
    pub fn compute(&self, values: &mut Values) {
        for field in &self.computed {
            let value = field.compute(values);
            values.insert(field.field_name().to_string(), value);
        }
    }
}
