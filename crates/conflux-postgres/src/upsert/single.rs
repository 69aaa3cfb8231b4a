//! Single-record upsert with `RETURNING *`.

use std::collections::HashMap;

use chrono::Utc;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgArguments;
use tracing::{debug, instrument};

use super::merge::set_clause;
use super::normalize::timestamp_value;
use crate::ident::quote_list;
use crate::model::{ColumnDescriptor, TableModel};
use crate::transaction::{requires_transaction, Session, TransactionOptions};
use crate::types::{row_to_extracted, ExtractedValue};
use crate::{ConfluxError, Result};

/// Options of [`TableModel::upsert`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpsertOneOptions {
    /// Columns of the unique index to conflict on. Defaults to the first
    /// declared unique key, then the primary key.
    pub conflict_target: Option<Vec<String>>,
    pub transaction: TransactionOptions,
}

impl UpsertOneOptions {
    pub fn conflict_target<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_target = Some(columns.into_iter().map(Into::into).collect());
        self
    }
}

struct Statement {
    sql: String,
    args: PgArguments,
}

impl TableModel {
    /// Inserts `record`, or updates the existing row it conflicts with, and
    /// returns the row as stored, keyed by logical name.
    ///
    /// Only columns the record supplied are updated, plus the update
    /// timestamp. Columns declared with
    /// [`ConflictAction::MergeJsonb`](crate::ConflictAction::MergeJsonb) are
    /// merged into the stored object instead of replacing it.
    #[instrument(skip_all, fields(table = %self.table_name()))]
    pub async fn upsert(
        &self,
        session: Session<'_>,
        record: &JsonValue,
        options: &UpsertOneOptions,
    ) -> Result<HashMap<String, ExtractedValue>> {
        let Statement { sql, args } = self.upsert_statement(record, options)?;
        debug!(sql = %sql, "Executing");

        let row = requires_transaction(session, &options.transaction, move |conn| {
            async move {
                sqlx::query_with(&sql, args)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(ConfluxError::from)
            }
            .boxed()
        })
        .await?;

        let mut by_field = row_to_extracted(&row)?;
        let mut out = HashMap::with_capacity(by_field.len());
        for column in self.stored_columns() {
            if let Some(value) = by_field.remove(&column.field) {
                out.insert(column.name.clone(), value);
            }
        }
        out.extend(by_field);
        Ok(out)
    }

    fn conflict_target(&self, options: &UpsertOneOptions) -> Result<Vec<&ColumnDescriptor>> {
        let names: Vec<&str> = match &options.conflict_target {
            Some(names) => names.iter().map(String::as_str).collect(),
            None => match self.unique_keys().first() {
                Some(key) => key.iter().map(String::as_str).collect(),
                None => self.primary_key().into_iter().map(|c| c.name.as_str()).collect(),
            },
        };
        if names.is_empty() {
            return Err(ConfluxError::InvalidOptions(format!(
                "'{}' has no unique key or primary key to conflict on",
                self.table_name()
            )));
        }
        names
            .into_iter()
            .map(|name| {
                self.resolve(name).filter(|c| c.is_stored()).ok_or_else(|| {
                    ConfluxError::InvalidOptions(format!(
                        "conflict target '{}' is not a column of '{}'",
                        name,
                        self.table_name()
                    ))
                })
            })
            .collect()
    }

    fn upsert_statement(&self, record: &JsonValue, options: &UpsertOneOptions) -> Result<Statement> {
        let now = Utc::now();
        let target = self.conflict_target(options)?;
        let mut instance = self.build_instance_at(record, now)?;

        for column in [self.created_at_column(), self.updated_at_column()]
            .into_iter()
            .flatten()
        {
            if instance.get(&column.name).map_or(true, ExtractedValue::is_null) {
                instance.set(&column.name, timestamp_value(column, now)?);
            }
        }
        // A null key the database can generate is left to the database.
        for column in self.primary_key() {
            if column.db_default && instance.get(&column.name).map_or(false, ExtractedValue::is_null) {
                instance.remove(&column.name);
            }
        }

        let insert: Vec<&ColumnDescriptor> = self
            .stored_columns()
            .filter(|c| instance.get(&c.name).is_some())
            .collect();
        if insert.is_empty() {
            return Err(ConfluxError::Validation(format!(
                "record for '{}' has no values to upsert",
                self.table_name()
            )));
        }

        let created_at = self.created_at_column().map(|c| c.name.as_str());
        let updated_at = self.updated_at_column().map(|c| c.name.as_str());
        let update: Vec<&ColumnDescriptor> = insert
            .iter()
            .copied()
            .filter(|c| !target.iter().any(|t| t.name == c.name))
            .filter(|c| Some(c.name.as_str()) != created_at)
            .filter(|c| instance.was_supplied(&c.name) || Some(c.name.as_str()) == updated_at)
            .collect();

        let mut args = PgArguments::default();
        for column in &insert {
            let value = instance.get(&column.name).unwrap_or(&ExtractedValue::Null);
            value.bind_to_arguments(column.column_type, &mut args)?;
        }

        let placeholders = (1..=insert.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(",");
        let set = if update.is_empty() {
            let first = target[0].quoted_field();
            format!("SET {} = EXCLUDED.{}", first, first)
        } else {
            set_clause(&update, "t", "EXCLUDED")
        };
        let sql = format!(
            "INSERT INTO {} AS t ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE {} RETURNING *",
            self.quoted_table(),
            quote_list(insert.iter().map(|c| c.field.as_str())),
            placeholders,
            quote_list(target.iter().map(|c| c.field.as_str())),
            set
        );
        Ok(Statement { sql, args })
    }
}
