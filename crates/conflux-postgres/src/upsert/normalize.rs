//! Record normalization and the CSV row encoding used by `COPY`.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::plan::UpsertPlan;
use crate::model::ColumnDescriptor;
use crate::types::{ColumnType, ExtractedValue};
use crate::{ConfluxError, Result};

/// One record reduced to the plan's insert columns, in their order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NormalizedRow(Vec<ExtractedValue>);

impl NormalizedRow {
    pub fn values(&self) -> &[ExtractedValue] {
        &self.0
    }
}

impl UpsertPlan<'_> {
    /// Runs `raw` through the model and lays it out in insert-column order.
    ///
    /// Creation and update timestamps the record leaves absent, null or
    /// blank are set to the call's `now`.
    pub fn normalize(&self, raw: &JsonValue) -> Result<NormalizedRow> {
        let raw = self.strip_blank_timestamps(raw);
        let mut instance = self.model.build_instance_at(&raw, self.now)?;

        for column in [self.created_at, self.updated_at].into_iter().flatten() {
            let missing = instance.get(&column.name).map_or(true, ExtractedValue::is_null);
            if missing {
                instance.set(&column.name, timestamp_value(column, self.now)?);
            }
        }

        Ok(NormalizedRow(
            self.insert
                .iter()
                .map(|c| instance.get(&c.name).cloned().unwrap_or(ExtractedValue::Null))
                .collect(),
        ))
    }

    fn strip_blank_timestamps<'r>(&self, raw: &'r JsonValue) -> Cow<'r, JsonValue> {
        let Some(record) = raw.as_object() else {
            return Cow::Borrowed(raw);
        };
        let is_blank = |key: &String, value: &JsonValue| {
            matches!(value, JsonValue::String(s) if s.is_empty())
                && [self.created_at, self.updated_at]
                    .into_iter()
                    .flatten()
                    .any(|c| *key == c.name || *key == c.field)
        };
        if !record.iter().any(|(k, v)| is_blank(k, v)) {
            return Cow::Borrowed(raw);
        }
        let mut record = record.clone();
        record.retain(|k, v| !is_blank(k, v));
        Cow::Owned(JsonValue::Object(record))
    }
}

pub(crate) fn timestamp_value(column: &ColumnDescriptor, now: DateTime<Utc>) -> Result<ExtractedValue> {
    match column.column_type {
        ColumnType::TimestampTz => Ok(ExtractedValue::TimestampTz(now)),
        ColumnType::Timestamp => Ok(ExtractedValue::Timestamp(now.naive_utc())),
        ColumnType::Date => Ok(ExtractedValue::Date(now.date_naive())),
        ColumnType::BigInt => Ok(ExtractedValue::BigInt(now.timestamp_millis())),
        other => other
            .coerce(&JsonValue::String(now.to_rfc3339()))
            .map_err(|msg| {
                ConfluxError::Validation(format!(
                    "cannot default timestamp column '{}': {}",
                    column.name, msg
                ))
            }),
    }
}

/// Appends `row` to `out` as one CSV line.
///
/// NULL is an unquoted empty field; an empty string is `""`.
pub(crate) fn encode_csv_row(columns: &[&ColumnDescriptor], row: &NormalizedRow, out: &mut Vec<u8>) {
    for (idx, (column, value)) in columns.iter().zip(row.values()).enumerate() {
        if idx > 0 {
            out.push(b',');
        }
        if let Some(text) = column.column_type.format_csv(value) {
            write_csv_field(&text, out);
        }
    }
    out.push(b'\n');
}

fn write_csv_field(text: &str, out: &mut Vec<u8>) {
    // `\.` alone on a line ends COPY data unless quoted.
    let needs_quotes = text.is_empty()
        || text == "\\."
        || text
            .bytes()
            .any(|b| matches!(b, b',' | b'"' | b'\n' | b'\r'));
    if !needs_quotes {
        out.extend_from_slice(text.as_bytes());
        return;
    }
    out.push(b'"');
    for b in text.bytes() {
        if b == b'"' {
            out.push(b'"');
        }
        out.push(b);
    }
    out.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{FnHook, Values};
    use crate::model::TableModel;
    use crate::upsert::UpsertOptions;
    use chrono::TimeZone;
    use serde_json::json;

    fn model() -> TableModel {
        TableModel::builder("foos")
            .column(ColumnDescriptor::new("id", ColumnType::Text).primary_key())
            .column(ColumnDescriptor::new("name", ColumnType::Text))
            .column(ColumnDescriptor::new("data", ColumnType::Jsonb).field("my_data_field"))
            .column(ColumnDescriptor::new("shout", ColumnType::Text).virtual_column())
            .timestamps("createdAt", "updatedAt")
            .hook(FnHook::new("upper-id", |v: &mut Values| {
                if let Some(JsonValue::String(s)) = v.get_mut("id") {
                    *s = s.to_uppercase();
                }
                Ok(())
            }))
            .build()
            .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    fn csv(plan: &UpsertPlan<'_>, row: &NormalizedRow) -> String {
        let mut out = Vec::new();
        encode_csv_row(&plan.insert, row, &mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_normalize_orders_values_and_defaults_timestamps() {
        let model = model();
        let plan = UpsertPlan::at(&model, &UpsertOptions::default(), now()).unwrap();
        let row = plan
            .normalize(&json!({"name": "Foo", "id": "foo", "shout": "ignored", "extra": 1}))
            .unwrap();

        assert_eq!(
            row.values(),
            &[
                ExtractedValue::String("FOO".into()),
                ExtractedValue::String("Foo".into()),
                ExtractedValue::Null,
                ExtractedValue::TimestampTz(now()),
                ExtractedValue::TimestampTz(now()),
            ]
        );
    }

    #[test]
    fn test_normalize_keeps_supplied_timestamps() {
        let model = model();
        let plan = UpsertPlan::at(&model, &UpsertOptions::default(), now()).unwrap();
        let row = plan
            .normalize(&json!({"id": "a", "createdAt": "2020-01-01T00:00:00Z", "updatedAt": ""}))
            .unwrap();
        let created = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(row.values()[3], ExtractedValue::TimestampTz(created));
        assert_eq!(row.values()[4], ExtractedValue::TimestampTz(now()));
    }

    #[test]
    fn test_normalize_reads_physical_names() {
        let model = model();
        let plan = UpsertPlan::at(&model, &UpsertOptions::default().omit(["createdAt", "updatedAt"]), now())
            .unwrap();
        let row = plan
            .normalize(&json!({"id": "a", "my_data_field": {"k": [1, 2]}}))
            .unwrap();
        assert_eq!(row.values().len(), 3);
        assert_eq!(row.values()[2], ExtractedValue::Json(json!({"k": [1, 2]})));
    }

    #[test]
    fn test_normalize_propagates_validation_errors() {
        let model = TableModel::builder("counters")
            .column(ColumnDescriptor::new("id", ColumnType::Integer).primary_key())
            .build()
            .unwrap();
        let plan = UpsertPlan::new(&model, &UpsertOptions::default()).unwrap();
        let err = plan.normalize(&json!({"id": "one"})).unwrap_err();
        assert!(matches!(err, ConfluxError::Validation(_)));
    }

    #[test]
    fn test_csv_distinguishes_null_from_empty_string() {
        let model = model();
        let plan = UpsertPlan::at(&model, &UpsertOptions::default().omit(["createdAt", "updatedAt"]), now())
            .unwrap();
        let row = plan.normalize(&json!({"id": "a", "name": ""})).unwrap();
        assert_eq!(csv(&plan, &row), "A,\"\",\n");
    }

    #[test]
    fn test_csv_quotes_special_characters() {
        let model = model();
        let plan = UpsertPlan::at(&model, &UpsertOptions::default().omit(["createdAt", "updatedAt"]), now())
            .unwrap();
        let row = plan
            .normalize(&json!({"id": "\\.", "name": "say \"hi\",\nbye", "data": {"a": "b"}}))
            .unwrap();
        assert_eq!(
            csv(&plan, &row),
            "\"\\.\",\"say \"\"hi\"\",\nbye\",\"{\"\"a\"\":\"\"b\"\"}\"\n"
        );
    }

    #[test]
    fn test_csv_timestamps() {
        let model = model();
        let plan = UpsertPlan::at(&model, &UpsertOptions::default(), now()).unwrap();
        let row = plan.normalize(&json!({"id": "a"})).unwrap();
        assert_eq!(
            csv(&plan, &row),
            "A,,,2024-05-01 12:30:00+00,2024-05-01 12:30:00+00\n"
        );
    }
}
