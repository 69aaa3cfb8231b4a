use serde::{Deserialize, Serialize};

use crate::model::{ColumnDescriptor, TableModel};
use crate::transaction::TransactionOptions;
use crate::{ConfluxError, Result};

/// PostgreSQL's ceiling on bind parameters in one statement.
pub(crate) const MAX_BIND_PARAMS: usize = 65_535;

/// How staged rows are merged into the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// `INSERT ... SELECT ... ON CONFLICT (identity) DO UPDATE`.
    ///
    /// Needs a unique index covering exactly the identity columns.
    #[default]
    OnConflict,
    /// `UPDATE ... FROM staging` followed by an anti-join `INSERT`, in one
    /// statement. Works without a unique index on the identity columns.
    UpdateThenInsert,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::OnConflict => "on_conflict",
            MergeStrategy::UpdateThenInsert => "update_then_insert",
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options of a bulk upsert.
///
/// Unknown fields are rejected when deserializing; every field has a
/// literal default.
///
/// # Examples
///
/// ```rust,ignore
/// let options = UpsertOptions::default()
///     .id_fields(["tenant", "slug"])
///     .omit(["notes"])
///     .strategy(MergeStrategy::UpdateThenInsert);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpsertOptions {
    /// Columns left out of the operation entirely, by logical or physical name.
    pub omit: Vec<String>,
    /// Columns that identify an existing row. `None` means the model's
    /// identity columns, falling back to a column named `id`.
    pub id_fields: Option<Vec<String>>,
    pub strategy: MergeStrategy,
    /// Rows per `INSERT` statement on the batch path.
    pub batch_size: usize,
    /// Bytes buffered before a `COPY` chunk is sent on the streaming path.
    pub copy_flush_bytes: usize,
    /// Used only when the call opens its own transaction.
    pub transaction: TransactionOptions,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            omit: Vec::new(),
            id_fields: None,
            strategy: MergeStrategy::OnConflict,
            batch_size: 1000,
            copy_flush_bytes: 64 * 1024,
            transaction: TransactionOptions::default(),
        }
    }
}

impl UpsertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn omit<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.omit = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn id_fields<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.id_fields = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn copy_flush_bytes(mut self, bytes: usize) -> Self {
        self.copy_flush_bytes = bytes.max(1);
        self
    }

    pub fn transaction(mut self, options: TransactionOptions) -> Self {
        self.transaction = options;
        self
    }

    /// True when `column` is excluded under either of its names.
    pub fn is_omitted(&self, column: &ColumnDescriptor) -> bool {
        self.omit
            .iter()
            .any(|name| *name == column.name || *name == column.field)
    }

    /// Rows per batch `INSERT` for `ncols` columns, within the bind
    /// parameter ceiling.
    pub(crate) fn rows_per_statement(&self, ncols: usize) -> usize {
        let ceiling = MAX_BIND_PARAMS / ncols.max(1);
        self.batch_size.clamp(1, ceiling.max(1))
    }

    /// Checks the options against `model` before any resource is touched.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::InvalidOptions`] when the identity set is empty or
    /// names a column that is unknown, virtual or omitted.
    pub fn validate(&self, model: &TableModel) -> Result<()> {
        self.identity_columns(model).map(|_| ())
    }

    /// Resolves the identity columns for `model`, in the order given.
    pub(crate) fn identity_columns<'m>(
        &self,
        model: &'m TableModel,
    ) -> Result<Vec<&'m ColumnDescriptor>> {
        let columns = match &self.id_fields {
            Some(names) => {
                if names.is_empty() {
                    return Err(ConfluxError::InvalidOptions(
                        "id_fields must name at least one column".to_string(),
                    ));
                }
                let mut columns: Vec<&ColumnDescriptor> = Vec::with_capacity(names.len());
                for name in names {
                    let column = model.resolve(name).ok_or_else(|| {
                        ConfluxError::InvalidOptions(format!(
                            "id field '{}' is not a column of '{}'",
                            name,
                            model.table_name()
                        ))
                    })?;
                    if !columns.iter().any(|c| c.name == column.name) {
                        columns.push(column);
                    }
                }
                columns
            }
            None => {
                let inferred = model.identity_columns();
                if !inferred.is_empty() {
                    inferred
                } else if let Some(id) = model.resolve("id") {
                    vec![id]
                } else {
                    return Err(ConfluxError::InvalidOptions(format!(
                        "'{}' has no primary key and no 'id' column; set id_fields",
                        model.table_name()
                    )));
                }
            }
        };

        for column in &columns {
            if column.virtual_column {
                return Err(ConfluxError::InvalidOptions(format!(
                    "id field '{}' is a virtual column",
                    column.name
                )));
            }
            if self.is_omitted(column) {
                return Err(ConfluxError::InvalidOptions(format!(
                    "id field '{}' is also omitted",
                    column.name
                )));
            }
        }
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::IsolationLevel;
    use crate::types::ColumnType;

    fn model() -> TableModel {
        TableModel::builder("foos")
            .column(ColumnDescriptor::new("id", ColumnType::Text).primary_key())
            .column(ColumnDescriptor::new("name", ColumnType::Text))
            .column(ColumnDescriptor::new("data", ColumnType::Jsonb).field("my_data_field"))
            .column(ColumnDescriptor::new("label", ColumnType::Text).virtual_column())
            .build()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = UpsertOptions::default();
        assert!(options.omit.is_empty());
        assert_eq!(options.id_fields, None);
        assert_eq!(options.strategy, MergeStrategy::OnConflict);
        assert_eq!(options.batch_size, 1000);
        assert_eq!(options.copy_flush_bytes, 65536);
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let options: UpsertOptions =
            serde_json::from_str(r#"{"omit": ["name"], "strategy": "update_then_insert"}"#).unwrap();
        assert_eq!(options.omit, vec!["name".to_string()]);
        assert_eq!(options.strategy, MergeStrategy::UpdateThenInsert);
        assert_eq!(options.batch_size, 1000);

        let options: UpsertOptions = toml::from_str(
            "id_fields = [\"id\"]\n[transaction]\nisolation_level = \"serializable\"\n",
        )
        .unwrap();
        assert_eq!(options.id_fields, Some(vec!["id".to_string()]));
        assert_eq!(options.transaction.isolation_level, IsolationLevel::Serializable);
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let err = serde_json::from_str::<UpsertOptions>(r#"{"idFields": ["id"]}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_identity_defaults_to_primary_key() {
        let model = model();
        let columns = UpsertOptions::default().identity_columns(&model).unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].name, "id");
    }

    #[test]
    fn test_identity_falls_back_to_id_column() {
        let model = TableModel::builder("events")
            .column(ColumnDescriptor::new("id", ColumnType::BigInt))
            .column(ColumnDescriptor::new("kind", ColumnType::Text))
            .build()
            .unwrap();
        let columns = UpsertOptions::default().identity_columns(&model).unwrap();
        assert_eq!(columns[0].name, "id");

        let model = TableModel::builder("events")
            .column(ColumnDescriptor::new("kind", ColumnType::Text))
            .build()
            .unwrap();
        let err = UpsertOptions::default().validate(&model).unwrap_err();
        assert!(matches!(err, ConfluxError::InvalidOptions(_)));
    }

    #[test]
    fn test_identity_accepts_physical_names() {
        let model = model();
        let options = UpsertOptions::default().id_fields(["my_data_field", "data"]);
        let columns = options.identity_columns(&model).unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].name, "data");
    }

    #[test]
    fn test_validate_rejects_bad_identity() {
        let model = model();
        for options in [
            UpsertOptions::default().id_fields(Vec::<String>::new()),
            UpsertOptions::default().id_fields(["nope"]),
            UpsertOptions::default().id_fields(["label"]),
            UpsertOptions::default().omit(["id"]),
        ] {
            let err = options.validate(&model).unwrap_err();
            assert!(matches!(err, ConfluxError::InvalidOptions(_)), "{:?}", options);
        }
    }

    #[test]
    fn test_is_omitted_matches_either_name() {
        let model = model();
        let data = model.column("data").unwrap();
        assert!(UpsertOptions::default().omit(["data"]).is_omitted(data));
        assert!(UpsertOptions::default().omit(["my_data_field"]).is_omitted(data));
        assert!(!UpsertOptions::default().omit(["name"]).is_omitted(data));
    }

    #[test]
    fn test_rows_per_statement_respects_bind_ceiling() {
        let options = UpsertOptions::default();
        assert_eq!(options.rows_per_statement(3), 1000);
        assert_eq!(options.rows_per_statement(100), 655);
        assert_eq!(options.batch_size(0).rows_per_statement(2), 1);
        let huge = UpsertOptions {
            batch_size: 1_000_000,
            ..UpsertOptions::default()
        };
        assert_eq!(huge.rows_per_statement(1), MAX_BIND_PARAMS);
        assert_eq!(huge.rows_per_statement(70_000), 1);
    }
}
