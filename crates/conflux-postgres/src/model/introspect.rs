use sqlx::Row;
use tracing::{debug, instrument, warn};

use super::{ColumnDescriptor, TableModel};
use crate::ident::validate_identifier_part;
use crate::types::ColumnType;
use crate::{Connection, ConfluxError, Result};

const COLUMNS_SQL: &str = "SELECT column_name::text AS column_name, udt_name::text AS udt_name, \
     is_nullable::text AS is_nullable, column_default::text AS column_default, \
     is_identity::text AS is_identity \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 \
     ORDER BY ordinal_position";

// Unique indexes rather than constraints: ON CONFLICT accepts either, and
// information_schema hides constraints on tables the role does not own.
const KEYS_SQL: &str = "SELECT i.indisprimary AS is_primary, \
     array_agg(a.attname::text ORDER BY k.ord) AS columns \
     FROM pg_catalog.pg_index i \
     CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
     JOIN pg_catalog.pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum \
     WHERE i.indrelid = to_regclass(format('%I.%I', $1::text, $2::text)) \
     AND i.indisunique AND i.indpred IS NULL AND k.ord <= i.indnkeyatts \
     AND NOT (0 = ANY (i.indkey::int2[])) \
     GROUP BY i.indexrelid, i.indisprimary \
     ORDER BY i.indisprimary DESC, i.indexrelid";

const CREATED_AT_NAMES: &[&str] = &["createdAt", "created_at"];
const UPDATED_AT_NAMES: &[&str] = &["updatedAt", "updated_at"];

impl TableModel {
    /// Derives a model from the live table definition.
    ///
    /// Logical and physical names are the same. Types the model layer does
    /// not know are treated as text, which the COPY path hands to PostgreSQL's
    /// own input functions. Timestamp columns named `createdAt`/`created_at`
    /// and `updatedAt`/`updated_at` are picked up as the model's timestamps.
    #[instrument(skip(conn))]
    pub async fn introspect(conn: &Connection, table: &str, schema: Option<&str>) -> Result<Self> {
        let schema = schema.unwrap_or("public");
        validate_identifier_part(schema)?;
        validate_identifier_part(table)?;
        if schema.contains('.') || table.contains('.') {
            return Err(ConfluxError::Query(format!(
                "cannot introspect '{}.{}': names containing '.' are not supported",
                schema, table
            )));
        }

        let rows = sqlx::query(COLUMNS_SQL)
            .bind(schema)
            .bind(table)
            .fetch_all(conn.pool())
            .await?;

        if rows.is_empty() {
            return Err(ConfluxError::Query(format!(
                "Table '{}.{}' not found or has no columns",
                schema, table
            )));
        }

        let keys = sqlx::query(KEYS_SQL)
            .bind(schema)
            .bind(table)
            .fetch_all(conn.pool())
            .await?;

        let mut primary_key: Vec<String> = Vec::new();
        let mut unique_keys: Vec<Vec<String>> = Vec::new();
        for row in keys {
            let is_primary: bool = row.try_get("is_primary")?;
            let columns: Vec<String> = row.try_get("columns")?;
            if is_primary {
                primary_key = columns;
            } else {
                unique_keys.push(columns);
            }
        }

        let qualified = if schema == "public" {
            table.to_string()
        } else {
            format!("{}.{}", schema, table)
        };
        let mut builder = TableModel::builder(qualified);
        let mut names = Vec::with_capacity(rows.len());

        for row in rows {
            let name: String = row.try_get("column_name")?;
            let udt_name: String = row.try_get("udt_name")?;
            let is_nullable: String = row.try_get("is_nullable")?;
            let column_default: Option<String> = row.try_get("column_default")?;
            let is_identity: Option<String> = row.try_get("is_identity")?;

            let column_type = ColumnType::from_pg_name(&udt_name).unwrap_or_else(|| {
                warn!(column = %name, udt_name = %udt_name, "Unknown column type, treating as text");
                ColumnType::Text
            });

            let mut column = ColumnDescriptor::new(name.clone(), column_type);
            if primary_key.contains(&name) {
                column = column.primary_key();
            }
            if is_nullable == "NO" {
                column = column.not_null();
            }
            if column_default.is_some() || is_identity.as_deref() == Some("YES") {
                column = column.db_default();
            }

            names.push((name, column_type));
            builder = builder.column(column);
        }

        let timestamp = |candidates: &[&str]| {
            names
                .iter()
                .find(|(name, ty)| {
                    candidates.contains(&name.as_str())
                        && matches!(ty, ColumnType::Timestamp | ColumnType::TimestampTz)
                })
                .map(|(name, _)| name.clone())
        };
        if let Some(created_at) = timestamp(CREATED_AT_NAMES) {
            builder = builder.created_at(created_at);
        }
        if let Some(updated_at) = timestamp(UPDATED_AT_NAMES) {
            builder = builder.updated_at(updated_at);
        }
        for key in unique_keys {
            builder = builder.unique_key(key);
        }

        let model = builder.build()?;
        debug!(
            columns = model.columns().len(),
            primary_key = ?primary_key,
            unique_keys = model.unique_keys().len(),
            "Introspected table"
        );
        Ok(model)
    }
}
