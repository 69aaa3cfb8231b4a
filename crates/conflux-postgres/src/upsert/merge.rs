//! Set-based merge of the staging table into the target.

use sqlx::PgConnection;
use tracing::debug;

use super::options::MergeStrategy;
use super::plan::UpsertPlan;
use crate::ident::{qualified_list, quote_identifier, quote_list};
use crate::model::{ColumnDescriptor, ConflictAction};

/// Value a column takes on update. `target` and `incoming` qualify the
/// existing row and the staged row.
fn update_value(column: &ColumnDescriptor, target: &str, incoming: &str) -> String {
    let field = column.quoted_field();
    match column.on_conflict {
        ConflictAction::Overwrite => format!("{}.{}", incoming, field),
        ConflictAction::MergeJsonb => format!(
            "COALESCE({}.{}, '{{}}'::jsonb) || {}.{}",
            target, field, incoming, field
        ),
    }
}

/// `SET "a" = x` for one column, `SET ("a","b") = (x, y)` for several.
pub(crate) fn set_clause(columns: &[&ColumnDescriptor], target: &str, incoming: &str) -> String {
    let values: Vec<String> = columns
        .iter()
        .map(|c| update_value(c, target, incoming))
        .collect();
    match columns {
        [single] => format!("SET {} = {}", single.quoted_field(), values[0]),
        _ => format!(
            "SET ({}) = ({})",
            quote_list(columns.iter().map(|c| c.field.as_str())),
            values.join(",")
        ),
    }
}

/// `INSERT ... SELECT ... ON CONFLICT (identity) DO UPDATE`.
pub(crate) fn on_conflict_sql(plan: &UpsertPlan<'_>, staging: &str) -> String {
    let target = plan.model.quoted_table();
    let columns = quote_list(plan.insert_fields());
    let action = if plan.update.is_empty() {
        "DO NOTHING".to_string()
    } else {
        // Inside DO UPDATE the target is addressed by its bare name.
        let target_ref = quote_identifier(plan.model.bare_table_name());
        format!("DO UPDATE {}", set_clause(&plan.update, &target_ref, "EXCLUDED"))
    };
    format!(
        "INSERT INTO {}({}) SELECT {} FROM {} ON CONFLICT ({}) {}",
        target,
        columns,
        columns,
        quote_identifier(staging),
        quote_list(plan.identity_fields()),
        action
    )
}

/// `UPDATE ... FROM staging` and an anti-join `INSERT`, as one statement.
///
/// Every identity column is returned by the update and joined on; the
/// first one decides whether a staged row was matched.
pub(crate) fn update_then_insert_sql(plan: &UpsertPlan<'_>, staging: &str) -> String {
    let target = plan.model.quoted_table();
    let staging = quote_identifier(staging);
    let columns = quote_list(plan.insert_fields());
    let matches = plan
        .identity
        .iter()
        .map(|c| format!("t.{} = s.{}", c.quoted_field(), c.quoted_field()))
        .collect::<Vec<_>>()
        .join(" AND ");

    if plan.update.is_empty() {
        return format!(
            "INSERT INTO {}({}) SELECT {} FROM {} s WHERE NOT EXISTS (SELECT 1 FROM {} t WHERE {})",
            target, columns, columns, staging, target, matches
        );
    }

    let first = plan.identity[0].quoted_field();
    format!(
        "WITH upd AS (UPDATE {} t {} FROM {} s WHERE {} RETURNING {}) \
         INSERT INTO {}({}) SELECT {} FROM {} s LEFT JOIN upd t USING ({}) WHERE t.{} IS NULL",
        target,
        set_clause(&plan.update, "t", "s"),
        staging,
        matches,
        qualified_list("s", plan.identity_fields()),
        target,
        columns,
        columns,
        staging,
        quote_list(plan.identity_fields()),
        first
    )
}

/// Runs the merge and returns the rows the statement reports as affected.
///
/// For [`MergeStrategy::OnConflict`] that is inserted plus updated rows;
/// for [`MergeStrategy::UpdateThenInsert`] it is inserted rows only.
pub(crate) async fn merge(
    conn: &mut PgConnection,
    plan: &UpsertPlan<'_>,
    staging: &str,
    strategy: MergeStrategy,
) -> Result<u64, sqlx::Error> {
    let sql = match strategy {
        MergeStrategy::OnConflict => on_conflict_sql(plan, staging),
        MergeStrategy::UpdateThenInsert => update_then_insert_sql(plan, staging),
    };
    debug!(sql = %sql, strategy = %strategy, "Executing");
    let result = sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}
