use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::debug;

use crate::ident::{quote_identifier, truncate_to, MAX_IDENTIFIER_LEN};
use crate::model::TableModel;

const STAGING_PREFIX: &str = "temp_";

/// Per-process sequence appended after the timestamp, so two calls in the
/// same millisecond still get distinct names.
static STAGING_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `temp_<table>_<epoch millis>_<sequence>`, with the table part cut so the
/// whole name fits in one PostgreSQL identifier.
pub(crate) fn staging_table_name(table: &str, now: DateTime<Utc>) -> String {
    let sequence = STAGING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let suffix = format!("_{}_{}", now.timestamp_millis(), sequence);
    let budget = MAX_IDENTIFIER_LEN.saturating_sub(STAGING_PREFIX.len() + suffix.len());
    format!("{}{}{}", STAGING_PREFIX, truncate_to(table, budget), suffix)
}

pub(crate) fn create_sql(staging: &str, target: &TableModel) -> String {
    format!(
        "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
        quote_identifier(staging),
        target.quoted_table()
    )
}

/// Creates the staging table for `target` and returns its name.
///
/// The table is dropped when the enclosing transaction commits or rolls
/// back; inside a savepoint, rolling back to it drops the table too.
pub(crate) async fn create(
    conn: &mut PgConnection,
    target: &TableModel,
    now: DateTime<Utc>,
) -> Result<String, sqlx::Error> {
    let staging = staging_table_name(target.bare_table_name(), now);
    let sql = create_sql(&staging, target);
    debug!(sql = %sql, "Executing");
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(staging)
}

/// Drops a staging table that would otherwise live until the caller's
/// transaction ends.
pub(crate) async fn drop_table(conn: &mut PgConnection, staging: &str) -> Result<(), sqlx::Error> {
    let sql = format!("DROP TABLE IF EXISTS {}", quote_identifier(staging));
    debug!(sql = %sql, "Executing");
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}
