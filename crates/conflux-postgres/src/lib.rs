//! Bulk upsert and model extensions for PostgreSQL on top of sqlx.
//!
//! A [`TableModel`] describes a target table once: its columns, which of them
//! identify a row, which are computed, and how records are validated before
//! they are written. On top of that the crate provides:
//!
//! - **Bulk upsert**: merge an unbounded sequence of JSON records into a
//!   table through a transaction-scoped staging table, either from an
//!   in-memory batch or from a live stream fed through `COPY ... FROM STDIN`
//! - **Single-record upsert** with a `RETURNING *` of the resulting row
//! - **Sessions**: every operation either checks out its own pooled
//!   connection or joins a transaction the caller already holds
//! - **Introspection** of existing tables into models
//!
//! # Architecture
//!
//! ```text
//!        records (Vec or Stream)
//!                |
//!     TableModel::build_instance      hooks, defaults, coercion
//!                |
//!          upsert::normalize          ordered rows, CSV encoding
//!                |
//!     staging table <- loader         INSERT batches or COPY
//!                |
//!           upsert::merge             one set-based statement
//!                |
//!           target table
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use conflux_postgres::{
//!     BulkUpsertable, ColumnDescriptor, ColumnType, Connection, PoolConfig, Session,
//!     TableModel, UpsertOptions,
//! };
//! use serde_json::json;
//!
//! let conn = Connection::new("postgresql://localhost/app", PoolConfig::default()).await?;
//! let foos = TableModel::builder("foos")
//!     .column(ColumnDescriptor::new("id", ColumnType::Text).primary_key())
//!     .column(ColumnDescriptor::new("name", ColumnType::Text))
//!     .timestamps("createdAt", "updatedAt")
//!     .build()?;
//!
//! let summary = foos
//!     .bulk_upsert(
//!         Session::Pool(&conn),
//!         vec![json!({"id": "foo", "name": "Foo"}), json!({"id": "bar", "name": "Bar"})],
//!         &UpsertOptions::default(),
//!     )
//!     .await?;
//! assert_eq!(summary.rows_staged, 2);
//! ```

/// Connection pooling with retry on connect.
pub mod connection;

/// Transactions, savepoints and the [`Session`] an operation runs in.
pub mod transaction;

/// Identifier quoting and validation.
///
/// Every table and column name that reaches generated SQL goes through this
/// module.
pub mod ident;

/// Coercion between JSON values and PostgreSQL column types.
pub mod types;

/// Record hooks, computed fields and validation errors.
pub mod hooks;

/// Table models: column descriptors, instances and introspection.
pub mod model;

/// Bulk and single-record upsert.
pub mod upsert;

pub use conflux_common::{ConfluxError, Result};

pub use connection::{Connection, PoolConfig, RetryConfig};
pub use hooks::{
    ComputedField, FnComputed, FnHook, HookRegistry, LengthValidator, ModelHook,
    RangeValidator, ValidationError, ValidationErrors, Values,
};
pub use ident::{quote_identifier, validate_identifier};
pub use model::{
    ColumnDefault, ColumnDescriptor, ConflictAction, ModelInstance, TableModel,
    TableModelBuilder, Timestamps,
};
pub use transaction::{
    requires_transaction, AccessMode, IsolationLevel, ScopedTransaction, Session, Transaction,
    TransactionOptions,
};
pub use types::{row_to_extracted, ColumnType, ExtractedValue};
pub use upsert::{
    encode_copy_rows, BulkUpsertable, CopySink, MergeStrategy, RecordSource, RecordStream,
    UpsertOneOptions, UpsertOptions, UpsertSummary,
};
