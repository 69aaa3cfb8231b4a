//! Moves normalized rows into the staging table.
//!
//! In-memory batches are written with multi-row `INSERT` statements. Streams
//! go through `COPY ... FROM STDIN` one record at a time: a record is pulled
//! from the source only after the previous one has been encoded, and encoded
//! data is handed to the server whenever the buffer passes the flush
//! threshold. The copy is closed exactly once, by `finish` on success or
//! `abort` on any failure.

use std::ops::DerefMut;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgArguments, PgCopyIn};
use sqlx::PgConnection;
use tracing::{debug, trace, warn};

use super::normalize::{encode_csv_row, NormalizedRow};
use super::plan::UpsertPlan;
use super::source::{check_streamed, RecordStream};
use super::Fault;
use crate::ident::{quote_identifier, quote_list};

/// Server side of a `COPY ... FROM STDIN`.
///
/// `finish` and `abort` take the sink by value, so a copy cannot be closed
/// twice.
#[async_trait]
pub trait CopySink: Send {
    /// Sends one chunk of encoded rows.
    async fn send(&mut self, chunk: &[u8]) -> Result<(), sqlx::Error>;

    /// Ends the copy and returns the number of rows the server stored.
    async fn finish(self) -> Result<u64, sqlx::Error>;

    /// Cancels the copy; nothing sent so far is kept.
    async fn abort(self, reason: String) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl<C> CopySink for PgCopyIn<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn send(&mut self, chunk: &[u8]) -> Result<(), sqlx::Error> {
        PgCopyIn::send(self, chunk).await?;
        Ok(())
    }

    async fn finish(self) -> Result<u64, sqlx::Error> {
        PgCopyIn::finish(self).await
    }

    async fn abort(self, reason: String) -> Result<(), sqlx::Error> {
        PgCopyIn::abort(self, reason).await
    }
}

pub(crate) fn copy_sql(staging: &str, plan: &UpsertPlan<'_>) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
        quote_identifier(staging),
        quote_list(plan.insert_fields())
    )
}

pub(crate) fn insert_sql(staging: &str, plan: &UpsertPlan<'_>, nrows: usize) -> String {
    let ncols = plan.insert.len();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ",
        quote_identifier(staging),
        quote_list(plan.insert_fields())
    );
    for row in 0..nrows {
        if row > 0 {
            sql.push(',');
        }
        sql.push('(');
        for col in 0..ncols {
            if col > 0 {
                sql.push(',');
            }
            sql.push('$');
            sql.push_str(&(row * ncols + col + 1).to_string());
        }
        sql.push(')');
    }
    sql
}

/// Writes `rows` with one `INSERT` per `rows_per_statement` rows.
///
/// A statement binds `rows * columns` parameters and the protocol caps that
/// at 65535 (`MAX_BIND_PARAMS`), so callers size chunks with
/// `UpsertOptions::rows_per_statement`.
/// Chunks are not individually atomic: the caller's transaction makes the
/// whole load all-or-nothing.
pub(crate) async fn insert_rows(
    conn: &mut PgConnection,
    staging: &str,
    plan: &UpsertPlan<'_>,
    rows: &[NormalizedRow],
    rows_per_statement: usize,
) -> Result<u64, sqlx::Error> {
    let mut written = 0;
    for chunk in rows.chunks(rows_per_statement.max(1)) {
        let sql = insert_sql(staging, plan, chunk.len());
        let mut args = PgArguments::default();
        for row in chunk {
            for (column, value) in plan.insert.iter().zip(row.values()) {
                value
                    .push_argument(column.column_type, &mut args)
                    .map_err(sqlx::Error::Encode)?;
            }
        }

        debug!(staging = %staging, rows = chunk.len(), "Executing batch insert into staging table");
        let result = sqlx::query_with(&sql, args).execute(&mut *conn).await?;
        written += result.rows_affected();
    }
    Ok(written)
}

/// Pumps `source` through the model into `sink`.
///
/// Returns the row count reported by the server.
pub(crate) async fn copy_rows<S>(
    mut sink: S,
    plan: &UpsertPlan<'_>,
    mut source: RecordStream,
    flush_bytes: usize,
) -> Result<u64, Fault>
where
    S: CopySink,
{
    let flush_bytes = flush_bytes.max(1);
    let mut buf = Vec::with_capacity(flush_bytes.min(1 << 20));
    let mut produced = 0u64;

    let pumped: Result<(), Fault> = async {
        while let Some(item) = source.next().await {
            let raw = item.map_err(Fault::Upstream)?;
            check_streamed(&raw, produced).map_err(Fault::Upstream)?;
            let row = plan.normalize(&raw).map_err(Fault::Upstream)?;
            encode_csv_row(&plan.insert, &row, &mut buf);
            produced += 1;

            if buf.len() >= flush_bytes {
                trace!(bytes = buf.len(), rows = produced, "Flushing copy buffer");
                sink.send(&buf).await?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            sink.send(&buf).await?;
        }
        Ok(())
    }
    .await;

    match pumped {
        Ok(()) => {
            let stored = sink.finish().await?;
            debug!(rows = stored, "Copy finished");
            Ok(stored)
        }
        Err(fault) => {
            let reason = match &fault {
                Fault::Upstream(e) => format!("record source failed: {}", e),
                Fault::Sql(e) => format!("copy failed: {}", e),
            };
            if let Err(e) = sink.abort(reason).await {
                warn!(error = %e, produced, "Abort of copy failed");
            }
            Err(fault)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDescriptor, TableModel};
    use crate::types::ColumnType;
    use crate::upsert::UpsertOptions;
    use crate::ConfluxError;
    use futures::stream;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Recorded {
        chunks: Vec<Vec<u8>>,
        finished: usize,
        aborted: Vec<String>,
    }

    /// In-memory sink; `fail_on_send` makes the n-th send (0-based) fail.
    struct MemorySink {
        log: Arc<Mutex<Recorded>>,
        fail_on_send: Option<usize>,
    }

    impl MemorySink {
        fn new() -> (Self, Arc<Mutex<Recorded>>) {
            let log = Arc::new(Mutex::new(Recorded::default()));
            (
                Self {
                    log: log.clone(),
                    fail_on_send: None,
                },
                log,
            )
        }
    }

    #[async_trait]
    impl CopySink for MemorySink {
        async fn send(&mut self, chunk: &[u8]) -> Result<(), sqlx::Error> {
            let mut log = self.log.lock().unwrap();
            if self.fail_on_send == Some(log.chunks.len()) {
                return Err(sqlx::Error::Protocol("connection reset".into()));
            }
            log.chunks.push(chunk.to_vec());
            Ok(())
        }

        async fn finish(self) -> Result<u64, sqlx::Error> {
            let mut log = self.log.lock().unwrap();
            log.finished += 1;
            let data: Vec<u8> = log.chunks.concat();
            Ok(data.iter().filter(|b| **b == b'\n').count() as u64)
        }

        async fn abort(self, reason: String) -> Result<(), sqlx::Error> {
            self.log.lock().unwrap().aborted.push(reason);
            Ok(())
        }
    }

    fn model() -> TableModel {
        TableModel::builder("foos")
            .column(ColumnDescriptor::new("id", ColumnType::Text).primary_key())
            .column(ColumnDescriptor::new("name", ColumnType::Text))
            .build()
            .unwrap()
    }

    fn records(n: usize) -> Vec<Result<serde_json::Value, ConfluxError>> {
        (0..n)
            .map(|i| Ok(json!({"id": format!("id{}", i), "name": format!("name {}", i)})))
            .collect()
    }

    #[test]
    fn test_copy_sql() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        assert_eq!(
            copy_sql("temp_foos_1_0", &plan),
            "COPY \"temp_foos_1_0\" (\"id\",\"name\") FROM STDIN WITH (FORMAT csv)"
        );
    }

    #[test]
    fn test_insert_sql_numbers_placeholders_row_major() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        assert_eq!(
            insert_sql("s", &plan, 3),
            "INSERT INTO \"s\" (\"id\",\"name\") VALUES ($1,$2),($3,$4),($5,$6)"
        );
    }

    #[tokio::test]
    async fn test_copy_rows_finishes_once() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        let (sink, log) = MemorySink::new();

        let stored = copy_rows(sink, &plan, stream::iter(records(3)).boxed(), 1 << 16)
            .await
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(stored, 3);
        assert_eq!(log.finished, 1);
        assert!(log.aborted.is_empty());
        assert_eq!(log.chunks.len(), 1);
        assert_eq!(
            String::from_utf8(log.chunks[0].clone()).unwrap(),
            "id0,name 0\nid1,name 1\nid2,name 2\n"
        );
    }

    #[tokio::test]
    async fn test_copy_rows_flushes_at_threshold() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        let (sink, log) = MemorySink::new();

        copy_rows(sink, &plan, stream::iter(records(4)).boxed(), 1)
            .await
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.chunks.len(), 4);
        assert_eq!(log.finished, 1);
    }

    #[tokio::test]
    async fn test_copy_rows_empty_source() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        let (sink, log) = MemorySink::new();

        let stored = copy_rows(sink, &plan, stream::empty().boxed(), 1024).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(stored, 0);
        assert!(log.chunks.is_empty());
        assert_eq!(log.finished, 1);
    }

    #[tokio::test]
    async fn test_source_error_aborts_and_is_forwarded_verbatim() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        let (sink, log) = MemorySink::new();
        let mut items = records(2);
        items.push(Err(ConfluxError::source("producer exploded")));
        items.extend(records(2));

        let fault = copy_rows(sink, &plan, stream::iter(items).boxed(), 1).await.unwrap_err();

        match fault {
            Fault::Upstream(ConfluxError::Source(msg)) => assert_eq!(msg, "producer exploded"),
            other => panic!("expected upstream source error, got {:?}", other),
        }
        let log = log.lock().unwrap();
        assert_eq!(log.finished, 0);
        assert_eq!(log.aborted.len(), 1);
        assert_eq!(log.chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_error_before_first_row_aborts() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        let (sink, log) = MemorySink::new();
        let items = vec![Err(ConfluxError::source("no such file"))];

        let fault = copy_rows(sink, &plan, stream::iter(items).boxed(), 1024).await.unwrap_err();

        assert!(matches!(fault, Fault::Upstream(ConfluxError::Source(_))));
        let log = log.lock().unwrap();
        assert!(log.chunks.is_empty());
        assert_eq!(log.aborted.len(), 1);
        assert_eq!(log.finished, 0);
    }

    #[tokio::test]
    async fn test_malformed_element_is_source_error() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        let (sink, log) = MemorySink::new();
        let items = vec![Ok(json!({"id": "a"})), Ok(json!("not a record"))];

        let fault = copy_rows(sink, &plan, stream::iter(items).boxed(), 1024).await.unwrap_err();

        match fault {
            Fault::Upstream(ConfluxError::Source(msg)) => assert!(msg.contains("element 1")),
            other => panic!("expected upstream source error, got {:?}", other),
        }
        assert_eq!(log.lock().unwrap().aborted.len(), 1);
    }

    #[tokio::test]
    async fn test_sink_error_aborts_and_stays_sql() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        let (mut sink, log) = MemorySink::new();
        sink.fail_on_send = Some(1);

        let fault = copy_rows(sink, &plan, stream::iter(records(5)).boxed(), 1).await.unwrap_err();

        assert!(matches!(fault, Fault::Sql(_)));
        let log = log.lock().unwrap();
        assert_eq!(log.chunks.len(), 1);
        assert_eq!(log.aborted.len(), 1);
        assert_eq!(log.finished, 0);
    }

    #[tokio::test]
    async fn test_source_is_pulled_lazily() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        let (mut sink, _log) = MemorySink::new();
        sink.fail_on_send = Some(0);
        let pulled = Arc::new(Mutex::new(0usize));
        let counter = pulled.clone();
        let source = stream::iter(records(100))
            .inspect(move |_| *counter.lock().unwrap() += 1)
            .boxed();

        let fault = copy_rows(sink, &plan, source, 1).await.unwrap_err();

        assert!(matches!(fault, Fault::Sql(_)));
        assert_eq!(*pulled.lock().unwrap(), 1);
    }
}
