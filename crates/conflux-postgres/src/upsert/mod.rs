//! Bulk upsert through a staging table.
//!
//! One call runs these phases in order, on one connection, inside one
//! transaction (or one savepoint of the caller's transaction):
//!
//! 1. build a plan: identity, insert and update columns, and the call's `now`
//! 2. `CREATE TEMP TABLE ... (LIKE target INCLUDING DEFAULTS) ON COMMIT DROP`
//! 3. load the normalized records into it, by `INSERT` batches or by `COPY`
//! 4. merge it into the target with one set-based statement
//!
//! Any failure rolls the transaction back, which also drops the staging
//! table, so the target is left exactly as it was. Failures that come from
//! the records themselves (a source error, a malformed element, a rejected
//! record) are returned as they are; failures from PostgreSQL go through the
//! SQLSTATE classification of [`ConfluxError`].
//!
//! ```rust,ignore
//! use conflux_postgres::{BulkUpsertable, ConfluxError, RecordSource, Session, UpsertOptions};
//!
//! let lines = futures::stream::iter(ndjson.lines().map(str::to_owned))
//!     .map(|line| serde_json::from_str(&line).map_err(ConfluxError::source));
//! let summary = model
//!     .bulk_upsert_stream(Session::Pool(&conn), RecordSource::from_stream(lines), &UpsertOptions::default())
//!     .await?;
//! ```

mod loader;
mod merge;
mod normalize;
mod options;
mod plan;
mod single;
mod source;
mod staging;

pub use loader::CopySink;
pub use options::{MergeStrategy, UpsertOptions};
pub use single::UpsertOneOptions;
pub use source::{RecordSource, RecordStream};

use std::time::Instant;

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use tracing::{debug, info, instrument, warn};

use crate::model::TableModel;
use crate::transaction::{ScopedTransaction, Session};
use crate::{ConfluxError, Result};
use normalize::NormalizedRow;
use plan::UpsertPlan;

/// Why a phase failed, decided where the failure happened.
#[derive(Debug)]
pub(crate) enum Fault {
    /// Came from the records: returned to the caller unchanged.
    Upstream(ConfluxError),
    /// Came from PostgreSQL: classified by SQLSTATE on the way out.
    Sql(sqlx::Error),
}

impl From<sqlx::Error> for Fault {
    fn from(err: sqlx::Error) -> Self {
        Fault::Sql(err)
    }
}

impl Fault {
    pub(crate) fn into_error(self) -> ConfluxError {
        match self {
            Fault::Upstream(err) => err,
            Fault::Sql(err) => ConfluxError::from(err),
        }
    }
}

/// Outcome of a bulk upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    /// Rows written to the staging table.
    pub rows_staged: u64,
    /// Rows the merge statement reported; see [`MergeStrategy`].
    pub rows_affected: u64,
    pub strategy: MergeStrategy,
    /// `None` when there was nothing to upsert and no table was created.
    pub staging_table: Option<String>,
}

impl UpsertSummary {
    fn nothing_to_do(strategy: MergeStrategy) -> Self {
        Self {
            rows_staged: 0,
            rows_affected: 0,
            strategy,
            staging_table: None,
        }
    }
}

/// Tables that accept bulk upserts.
#[async_trait]
pub trait BulkUpsertable: Send + Sync {
    /// Upserts an in-memory batch.
    ///
    /// Every record is validated before a connection is acquired. An empty
    /// batch returns at once without touching the database.
    ///
    /// # Errors
    ///
    /// - [`ConfluxError::InvalidOptions`] / [`ConfluxError::InputRejected`] /
    ///   [`ConfluxError::Validation`] before any resource is acquired
    /// - a database error from the staging, load or merge statements, after
    ///   which the target is unchanged
    async fn bulk_upsert(
        &self,
        session: Session<'_>,
        records: Vec<JsonValue>,
        options: &UpsertOptions,
    ) -> Result<UpsertSummary>;

    /// Upserts records pulled from `source`, loading them with `COPY`.
    ///
    /// The source is consumed one record at a time and never buffered as a
    /// whole. An error it yields, at any position, fails the call with that
    /// error and rolls everything back.
    async fn bulk_upsert_stream(
        &self,
        session: Session<'_>,
        source: RecordSource,
        options: &UpsertOptions,
    ) -> Result<UpsertSummary>;
}

#[async_trait]
impl BulkUpsertable for TableModel {
    #[instrument(skip_all, fields(table = %self.table_name(), records = records.len()))]
    async fn bulk_upsert(
        &self,
        session: Session<'_>,
        records: Vec<JsonValue>,
        options: &UpsertOptions,
    ) -> Result<UpsertSummary> {
        let plan = UpsertPlan::new(self, options)?;
        source::check_records(&records)?;
        if records.is_empty() {
            debug!("No records, skipping upsert");
            return Ok(UpsertSummary::nothing_to_do(options.strategy));
        }

        let rows = records
            .iter()
            .map(|record| plan.normalize(record))
            .collect::<Result<Vec<_>>>()?;

        run(session, &plan, options, Load::Rows(&rows)).await
    }

    #[instrument(skip_all, fields(table = %self.table_name(), source = ?source))]
    async fn bulk_upsert_stream(
        &self,
        session: Session<'_>,
        source: RecordSource,
        options: &UpsertOptions,
    ) -> Result<UpsertSummary> {
        let plan = UpsertPlan::new(self, options)?;
        if let RecordSource::Records(records) = &source {
            source::check_records(records)?;
        }

        let Some(records) = first_then_rest(source.into_stream()).await? else {
            debug!("Record source is empty, skipping upsert");
            return Ok(UpsertSummary::nothing_to_do(options.strategy));
        };

        run(session, &plan, options, Load::Copy(records)).await
    }
}

/// Renders `records` as the CSV body the streaming path sends to `COPY`,
/// with the column list it would use. Nothing is sent to the database.
///
/// # Errors
///
/// The same option, input and validation errors as a real upsert.
pub fn encode_copy_rows(
    model: &TableModel,
    records: &[JsonValue],
    options: &UpsertOptions,
) -> Result<(Vec<String>, Vec<u8>)> {
    let plan = UpsertPlan::new(model, options)?;
    source::check_records(records)?;
    let mut out = Vec::new();
    for record in records {
        let row = plan.normalize(record)?;
        normalize::encode_csv_row(&plan.insert, &row, &mut out);
    }
    Ok((plan.insert_fields().map(str::to_string).collect(), out))
}

enum Load<'a> {
    Rows(&'a [NormalizedRow]),
    Copy(RecordStream),
}

/// Pulls the first record before any resource is acquired. `None` when the
/// source is empty; an error it yields first is returned as is.
async fn first_then_rest(mut records: RecordStream) -> Result<Option<RecordStream>> {
    match records.next().await {
        None => Ok(None),
        Some(Err(err)) => Err(err),
        Some(Ok(first)) => Ok(Some(
            stream::once(future::ready(Ok(first)))
                .chain(records)
                .boxed(),
        )),
    }
}

async fn run(
    session: Session<'_>,
    plan: &UpsertPlan<'_>,
    options: &UpsertOptions,
    load: Load<'_>,
) -> Result<UpsertSummary> {
    let started = Instant::now();
    let mut scoped = ScopedTransaction::open(session, &options.transaction).await?;
    // Inside a caller's transaction ON COMMIT DROP fires only at its end.
    let drop_staging = !scoped.owns_connection();

    let outcome = stage_load_merge(scoped.conn(), plan, options, load, drop_staging).await;
    match outcome {
        Ok(summary) => {
            scoped.commit_raw().await?;
            info!(
                rows_staged = summary.rows_staged,
                rows_affected = summary.rows_affected,
                strategy = %summary.strategy,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Bulk upsert finished"
            );
            Ok(summary)
        }
        Err(fault) => {
            scoped.rollback().await;
            let err = fault.into_error();
            warn!(
                error = %err,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Bulk upsert rolled back"
            );
            Err(err)
        }
    }
}

async fn stage_load_merge(
    conn: &mut PgConnection,
    plan: &UpsertPlan<'_>,
    options: &UpsertOptions,
    load: Load<'_>,
    drop_staging: bool,
) -> std::result::Result<UpsertSummary, Fault> {
    let staging = staging::create(conn, plan.model, plan.now).await?;

    let rows_staged = match load {
        Load::Rows(rows) => {
            let per_statement = options.rows_per_statement(plan.insert.len());
            loader::insert_rows(conn, &staging, plan, rows, per_statement).await?
        }
        Load::Copy(records) => {
            let sql = loader::copy_sql(&staging, plan);
            debug!(sql = %sql, "Executing");
            let sink = conn.copy_in_raw(&sql).await?;
            loader::copy_rows(sink, plan, records, options.copy_flush_bytes).await?
        }
    };

    let rows_affected = merge::merge(conn, plan, &staging, options.strategy).await?;
    if drop_staging {
        staging::drop_table(conn, &staging).await?;
    }

    Ok(UpsertSummary {
        rows_staged,
        rows_affected,
        strategy: options.strategy,
        staging_table: Some(staging),
    })
}
