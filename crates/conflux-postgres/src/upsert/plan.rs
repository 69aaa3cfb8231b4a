use chrono::{DateTime, Utc};

use super::options::UpsertOptions;
use crate::model::{ColumnDescriptor, TableModel};
use crate::Result;

/// Column lists of one upsert call, fixed before any record is read.
///
/// `insert` is every stored, non-omitted column in declaration order and is
/// the column order of every normalized row. `update` is `insert` minus the
/// identity columns and the creation timestamp.
#[derive(Debug)]
pub(crate) struct UpsertPlan<'m> {
    pub model: &'m TableModel,
    pub insert: Vec<&'m ColumnDescriptor>,
    pub update: Vec<&'m ColumnDescriptor>,
    pub identity: Vec<&'m ColumnDescriptor>,
    pub created_at: Option<&'m ColumnDescriptor>,
    pub updated_at: Option<&'m ColumnDescriptor>,
    /// Shared by every row of the call.
    pub now: DateTime<Utc>,
}

impl<'m> UpsertPlan<'m> {
    pub fn new(model: &'m TableModel, options: &UpsertOptions) -> Result<Self> {
        Self::at(model, options, Utc::now())
    }

    pub fn at(model: &'m TableModel, options: &UpsertOptions, now: DateTime<Utc>) -> Result<Self> {
        let identity = options.identity_columns(model)?;

        let insert: Vec<&ColumnDescriptor> = model
            .stored_columns()
            .filter(|c| !options.is_omitted(c))
            .collect();

        let kept = |column: Option<&'m ColumnDescriptor>| {
            column.filter(|c| insert.iter().any(|i| i.name == c.name))
        };
        let created_at = kept(model.created_at_column());
        let updated_at = kept(model.updated_at_column());

        let update = insert
            .iter()
            .copied()
            .filter(|c| !identity.iter().any(|i| i.name == c.name))
            .filter(|c| created_at.map_or(true, |created| created.name != c.name))
            .collect();

        Ok(Self {
            model,
            insert,
            update,
            identity,
            created_at,
            updated_at,
            now,
        })
    }

    pub fn insert_fields(&self) -> impl Iterator<Item = &str> + Clone + '_ {
        self.insert.iter().map(|c| c.field.as_str())
    }

    pub fn identity_fields(&self) -> impl Iterator<Item = &str> + Clone + '_ {
        self.identity.iter().map(|c| c.field.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;
    use crate::ConfluxError;

    fn model() -> TableModel {
        TableModel::builder("foos")
            .column(ColumnDescriptor::new("id", ColumnType::Text).primary_key())
            .column(ColumnDescriptor::new("name", ColumnType::Text))
            .column(ColumnDescriptor::new("data", ColumnType::Jsonb).field("my_data_field"))
            .column(ColumnDescriptor::new("shout", ColumnType::Text).virtual_column())
            .column(ColumnDescriptor::new("notes", ColumnType::Text))
            .timestamps("createdAt", "updatedAt")
            .build()
            .unwrap()
    }

    fn names<'a>(columns: &[&'a ColumnDescriptor]) -> Vec<&'a str> {
        columns.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_plan_column_lists() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default().omit(["notes"])).unwrap();

        assert_eq!(names(&plan.insert), vec!["id", "name", "data", "createdAt", "updatedAt"]);
        assert_eq!(names(&plan.update), vec!["name", "data", "updatedAt"]);
        assert_eq!(names(&plan.identity), vec!["id"]);
        assert_eq!(
            plan.insert_fields().collect::<Vec<_>>(),
            vec!["id", "name", "my_data_field", "createdAt", "updatedAt"]
        );
        assert_eq!(plan.created_at.map(|c| c.name.as_str()), Some("createdAt"));
    }

    #[test]
    fn test_plan_with_composite_identity() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default().id_fields(["id", "name"])).unwrap();
        assert_eq!(plan.identity_fields().collect::<Vec<_>>(), vec!["id", "name"]);
        assert_eq!(names(&plan.update), vec!["data", "notes", "updatedAt"]);
    }

    #[test]
    fn test_omitted_timestamps_are_not_injected() {
        let model = model();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default().omit(["createdAt"])).unwrap();
        assert!(plan.created_at.is_none());
        assert!(plan.updated_at.is_some());
        assert!(!names(&plan.insert).contains(&"createdAt"));
    }

    #[test]
    fn test_plan_rejects_invalid_identity() {
        let model = model();
        let err = UpsertPlan::new(&model, &UpsertOptions::default().id_fields(["shout"])).unwrap_err();
        assert!(matches!(err, ConfluxError::InvalidOptions(_)));
    }
}
