//! Table models.
//!
//! A [`TableModel`] is the static description of one target table: its
//! [`ColumnDescriptor`]s, timestamp columns, unique keys and hooks. It is
//! built once per table and shared by every upsert against it.

mod instance;
mod introspect;

pub use instance::ModelInstance;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::hooks::{ComputedField, HookRegistry, ModelHook};
use crate::ident::{quote_identifier, quote_name, validate_identifier, validate_identifier_part};
use crate::types::ColumnType;
use crate::{ConfluxError, Result};

/// What an upsert does with an existing value when the row already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictAction {
    /// Replace the stored value.
    #[default]
    Overwrite,
    /// Merge the incoming JSONB object into the stored one, top-level keys
    /// of the incoming value winning.
    MergeJsonb,
}

/// Value a column takes when a record leaves it out.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    Value(JsonValue),
    /// The timestamp of the upsert call.
    Now,
    /// A fresh random UUID.
    Uuid,
}

impl ColumnDefault {
    pub(crate) fn resolve(&self, now: DateTime<Utc>) -> JsonValue {
        match self {
            ColumnDefault::Value(v) => v.clone(),
            ColumnDefault::Now => JsonValue::String(now.to_rfc3339()),
            ColumnDefault::Uuid => JsonValue::String(uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// One column of a table model.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    /// Logical attribute name, the key records use.
    pub name: String,
    /// Physical column name in the database.
    pub field: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    /// Explicitly part of the default identity set.
    pub identity: bool,
    /// Computed, never persisted.
    pub virtual_column: bool,
    pub not_null: bool,
    /// Model-side default, applied while building an instance.
    pub default: Option<ColumnDefault>,
    /// The database supplies a default (serial, identity, DEFAULT clause).
    pub db_default: bool,
    pub on_conflict: ConflictAction,
}

impl ColumnDescriptor {
    /// Creates a stored column whose physical name equals `name`.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        Self {
            field: name.clone(),
            name,
            column_type,
            primary_key: false,
            identity: false,
            virtual_column: false,
            not_null: false,
            default: None,
            db_default: false,
            on_conflict: ConflictAction::Overwrite,
        }
    }

    /// Stores the attribute under a different physical column name.
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }

    pub fn virtual_column(mut self) -> Self {
        self.virtual_column = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default_value(mut self, value: JsonValue) -> Self {
        self.default = Some(ColumnDefault::Value(value));
        self
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(ColumnDefault::Now);
        self
    }

    pub fn default_uuid(mut self) -> Self {
        self.default = Some(ColumnDefault::Uuid);
        self
    }

    pub fn db_default(mut self) -> Self {
        self.db_default = true;
        self
    }

    pub fn on_conflict(mut self, action: ConflictAction) -> Self {
        self.on_conflict = action;
        self
    }

    /// True for columns that exist in the table.
    pub fn is_stored(&self) -> bool {
        !self.virtual_column
    }

    pub fn quoted_field(&self) -> String {
        quote_name(&self.field)
    }
}

/// Logical names of the creation and update timestamp columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Static description of a target table.
#[derive(Debug, Clone)]
pub struct TableModel {
    table: String,
    columns: Vec<ColumnDescriptor>,
    timestamps: Timestamps,
    unique_keys: Vec<Vec<String>>,
    hooks: HookRegistry,
}

impl TableModel {
    /// Starts a model for `table` (optionally `schema.table`).
    pub fn builder(table: impl Into<String>) -> TableModelBuilder {
        TableModelBuilder {
            table: table.into(),
            columns: Vec::new(),
            timestamps: Timestamps::default(),
            unique_keys: Vec::new(),
            hooks: HookRegistry::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Table name without its schema.
    pub fn bare_table_name(&self) -> &str {
        self.table.rsplit('.').next().unwrap_or(&self.table)
    }

    pub fn quoted_table(&self) -> String {
        quote_identifier(&self.table)
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Looks a column up by logical name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Looks a column up by logical name first, physical name second.
    pub fn resolve(&self, key: &str) -> Option<&ColumnDescriptor> {
        self.column(key)
            .or_else(|| self.columns.iter().find(|c| c.field == key))
    }

    /// Columns that exist in the table, in declaration order.
    pub fn stored_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_stored())
    }

    pub fn primary_key(&self) -> Vec<&ColumnDescriptor> {
        self.stored_columns().filter(|c| c.primary_key).collect()
    }

    /// Default identity set: columns flagged `identity`, else the primary key.
    pub fn identity_columns(&self) -> Vec<&ColumnDescriptor> {
        let explicit: Vec<_> = self.stored_columns().filter(|c| c.identity).collect();
        if explicit.is_empty() {
            self.primary_key()
        } else {
            explicit
        }
    }

    pub fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    pub fn created_at_column(&self) -> Option<&ColumnDescriptor> {
        self.timestamps
            .created_at
            .as_deref()
            .and_then(|name| self.column(name))
    }

    pub fn updated_at_column(&self) -> Option<&ColumnDescriptor> {
        self.timestamps
            .updated_at
            .as_deref()
            .and_then(|name| self.column(name))
    }

    /// Unique keys, as logical column names.
    pub fn unique_keys(&self) -> &[Vec<String>] {
        &self.unique_keys
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }
}

/// Builder for [`TableModel`].
pub struct TableModelBuilder {
    table: String,
    columns: Vec<ColumnDescriptor>,
    timestamps: Timestamps,
    unique_keys: Vec<Vec<String>>,
    hooks: HookRegistry,
}

impl TableModelBuilder {
    pub fn column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    /// Declares both timestamp columns. Undeclared ones are added as
    /// `TIMESTAMPTZ NOT NULL`.
    pub fn timestamps(self, created_at: impl Into<String>, updated_at: impl Into<String>) -> Self {
        self.created_at(created_at).updated_at(updated_at)
    }

    pub fn created_at(mut self, name: impl Into<String>) -> Self {
        self.timestamps.created_at = Some(name.into());
        self
    }

    pub fn updated_at(mut self, name: impl Into<String>) -> Self {
        self.timestamps.updated_at = Some(name.into());
        self
    }

    /// Declares a unique key over logical column names.
    pub fn unique_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_keys
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn hook(mut self, hook: impl ModelHook + 'static) -> Self {
        self.hooks.add_hook(Arc::new(hook));
        self
    }

    pub fn computed(mut self, field: impl ComputedField + 'static) -> Self {
        self.hooks.add_computed(Arc::new(field));
        self
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Fails on an unsafe table or column identifier, a duplicate logical or
    /// physical name, or a unique key, timestamp or computed field naming an
    /// unknown column.
    pub fn build(mut self) -> Result<TableModel> {
        validate_identifier(&self.table)?;

        let timestamp_names: Vec<String> = [&self.timestamps.created_at, &self.timestamps.updated_at]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        for name in timestamp_names {
            if !self.columns.iter().any(|c| c.name == name) {
                self.columns
                    .push(ColumnDescriptor::new(name, ColumnType::TimestampTz).not_null());
            }
        }

        let mut names = HashSet::new();
        let mut fields = HashSet::new();
        for column in &self.columns {
            if !names.insert(column.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate column '{}' on '{}'",
                    column.name, self.table
                )));
            }
            if column.virtual_column {
                continue;
            }
            validate_identifier_part(&column.field)?;
            if !fields.insert(column.field.as_str()) {
                return Err(invalid(format!(
                    "physical column '{}' is mapped twice on '{}'",
                    column.field, self.table
                )));
            }
        }

        let stored = |name: &str| {
            self.columns
                .iter()
                .any(|c| c.name == name && c.is_stored())
        };
        for key in &self.unique_keys {
            if key.is_empty() {
                return Err(invalid(format!("empty unique key on '{}'", self.table)));
            }
            if let Some(missing) = key.iter().find(|name| !stored(name)) {
                return Err(invalid(format!(
                    "unique key column '{}' is not a stored column of '{}'",
                    missing, self.table
                )));
            }
        }
        for name in self.hooks.computed_fields() {
            if !self
                .columns
                .iter()
                .any(|c| c.name == name && c.virtual_column)
            {
                return Err(invalid(format!(
                    "computed field '{}' must name a virtual column of '{}'",
                    name, self.table
                )));
            }
        }

        Ok(TableModel {
            table: self.table,
            columns: self.columns,
            timestamps: self.timestamps,
            unique_keys: self.unique_keys,
            hooks: self.hooks,
        })
    }
}

fn invalid(msg: String) -> ConfluxError {
    ConfluxError::InvalidOptions(msg)
}
