//! Type mapping between JSON records and PostgreSQL columns.
//!
//! Raw records arrive as `serde_json` values. Each column's [`ColumnType`]
//! coerces them into an [`ExtractedValue`], which can then be bound as a
//! query parameter (batch path) or rendered in PostgreSQL's text input
//! format (COPY path).

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Column, Row as SqlxRow, TypeInfo};
use std::collections::HashMap;
use std::fmt::Write as _;
use uuid::Uuid;

use crate::{ConfluxError, Result};

/// Represents a value ready to be written to, or read back from, PostgreSQL.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedValue {
    /// NULL value
    Null,
    /// Boolean (BOOLEAN)
    Bool(bool),
    /// Small integer (SMALLINT)
    SmallInt(i16),
    /// Integer (INTEGER)
    Int(i32),
    /// Big integer (BIGINT)
    BigInt(i64),
    /// Single-precision float (REAL)
    Float(f32),
    /// Double-precision float (DOUBLE PRECISION)
    Double(f64),
    /// Variable-length string (VARCHAR, TEXT)
    String(String),
    /// Binary data (BYTEA)
    Bytes(Vec<u8>),
    /// UUID (UUID)
    Uuid(Uuid),
    /// Date (DATE)
    Date(NaiveDate),
    /// Time (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    Timestamp(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    TimestampTz(DateTime<Utc>),
    /// JSON/JSONB (JSON, JSONB)
    Json(JsonValue),
    /// Decimal/Numeric (NUMERIC, DECIMAL)
    Decimal(Decimal),
}

impl ExtractedValue {
    /// Returns the PostgreSQL type name for this value.
    pub fn pg_type_name(&self) -> &'static str {
        match self {
            ExtractedValue::Null => "NULL",
            ExtractedValue::Bool(_) => "BOOLEAN",
            ExtractedValue::SmallInt(_) => "SMALLINT",
            ExtractedValue::Int(_) => "INTEGER",
            ExtractedValue::BigInt(_) => "BIGINT",
            ExtractedValue::Float(_) => "REAL",
            ExtractedValue::Double(_) => "DOUBLE PRECISION",
            ExtractedValue::String(_) => "TEXT",
            ExtractedValue::Bytes(_) => "BYTEA",
            ExtractedValue::Uuid(_) => "UUID",
            ExtractedValue::Date(_) => "DATE",
            ExtractedValue::Time(_) => "TIME",
            ExtractedValue::Timestamp(_) => "TIMESTAMP",
            ExtractedValue::TimestampTz(_) => "TIMESTAMPTZ",
            ExtractedValue::Json(_) => "JSONB",
            ExtractedValue::Decimal(_) => "NUMERIC",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ExtractedValue::Null)
    }

    /// Bind this value as a parameter of a column of type `column_type`.
    ///
    /// NULL is bound with the column's own type so PostgreSQL never has to
    /// guess it from context.
    pub fn bind_to_arguments(
        &self,
        column_type: ColumnType,
        arguments: &mut PgArguments,
    ) -> Result<()> {
        self.push_argument(column_type, arguments).map_err(|e| {
            ConfluxError::Query(format!("Failed to bind {}: {}", self.pg_type_name(), e))
        })
    }

    pub(crate) fn push_argument(
        &self,
        column_type: ColumnType,
        arguments: &mut PgArguments,
    ) -> std::result::Result<(), BoxDynError> {
        match self {
            ExtractedValue::Null => column_type.push_null(arguments),
            ExtractedValue::Bool(v) => arguments.add(*v),
            ExtractedValue::SmallInt(v) => arguments.add(*v),
            ExtractedValue::Int(v) => arguments.add(*v),
            ExtractedValue::BigInt(v) => arguments.add(*v),
            ExtractedValue::Float(v) => arguments.add(*v),
            ExtractedValue::Double(v) => arguments.add(*v),
            ExtractedValue::String(v) => arguments.add(v.as_str()),
            ExtractedValue::Bytes(v) => arguments.add(v.as_slice()),
            ExtractedValue::Uuid(v) => arguments.add(*v),
            ExtractedValue::Date(v) => arguments.add(*v),
            ExtractedValue::Time(v) => arguments.add(*v),
            ExtractedValue::Timestamp(v) => arguments.add(*v),
            ExtractedValue::TimestampTz(v) => arguments.add(*v),
            ExtractedValue::Json(v) => arguments.add(v.clone()),
            ExtractedValue::Decimal(v) => arguments.add(*v),
        }
    }

    /// Renders the value in PostgreSQL's text input format, `None` for NULL.
    pub fn to_pg_text(&self) -> Option<String> {
        Some(match self {
            ExtractedValue::Null => return None,
            ExtractedValue::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
            ExtractedValue::SmallInt(v) => v.to_string(),
            ExtractedValue::Int(v) => v.to_string(),
            ExtractedValue::BigInt(v) => v.to_string(),
            ExtractedValue::Float(v) => float_text(*v as f64, v.to_string()),
            ExtractedValue::Double(v) => float_text(*v, v.to_string()),
            ExtractedValue::String(v) => v.clone(),
            ExtractedValue::Bytes(v) => {
                let mut out = String::with_capacity(2 + v.len() * 2);
                out.push_str("\\x");
                for b in v {
                    let _ = write!(out, "{:02x}", b);
                }
                out
            }
            ExtractedValue::Uuid(v) => v.to_string(),
            ExtractedValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            ExtractedValue::Time(v) => v.format("%H:%M:%S%.f").to_string(),
            ExtractedValue::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            ExtractedValue::TimestampTz(v) => v.format("%Y-%m-%d %H:%M:%S%.f+00").to_string(),
            ExtractedValue::Json(v) => v.to_string(),
            ExtractedValue::Decimal(v) => v.to_string(),
        })
    }

    /// Converts the value to JSON for display.
    pub fn to_json(&self) -> JsonValue {
        match self {
            ExtractedValue::Null => JsonValue::Null,
            ExtractedValue::Bool(v) => JsonValue::Bool(*v),
            ExtractedValue::SmallInt(v) => JsonValue::Number((*v).into()),
            ExtractedValue::Int(v) => JsonValue::Number((*v).into()),
            ExtractedValue::BigInt(v) => JsonValue::Number((*v).into()),
            ExtractedValue::Float(v) => serde_json::Number::from_f64(*v as f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ExtractedValue::Double(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ExtractedValue::String(v) => JsonValue::String(v.clone()),
            ExtractedValue::Uuid(v) => JsonValue::String(v.to_string()),
            ExtractedValue::TimestampTz(v) => JsonValue::String(v.to_rfc3339()),
            ExtractedValue::Json(v) => v.clone(),
            ExtractedValue::Decimal(v) => JsonValue::String(v.to_string()),
            other => other
                .to_pg_text()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        }
    }
}

fn float_text(v: f64, display: String) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        (if v > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else {
        display
    }
}

/// PostgreSQL column types the model layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    SmallInt,
    Integer,
    BigInt,
    Boolean,
    Real,
    Double,
    Numeric,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
    Jsonb,
    Bytea,
}

impl ColumnType {
    /// SQL spelling of the type.
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::SmallInt => "SMALLINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Real => "REAL",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Uuid => "UUID",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::TimestampTz => "TIMESTAMPTZ",
            ColumnType::Json => "JSON",
            ColumnType::Jsonb => "JSONB",
            ColumnType::Bytea => "BYTEA",
        }
    }

    /// Maps a `pg_type.typname` / `information_schema.columns.udt_name`.
    pub fn from_pg_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "text" | "varchar" | "bpchar" | "char" | "name" | "citext" | "character varying" => {
                ColumnType::Text
            }
            "int2" | "smallint" => ColumnType::SmallInt,
            "int4" | "integer" | "int" | "serial" => ColumnType::Integer,
            "int8" | "bigint" | "bigserial" => ColumnType::BigInt,
            "bool" | "boolean" => ColumnType::Boolean,
            "float4" | "real" => ColumnType::Real,
            "float8" | "double precision" => ColumnType::Double,
            "numeric" | "decimal" => ColumnType::Numeric,
            "uuid" => ColumnType::Uuid,
            "date" => ColumnType::Date,
            "time" => ColumnType::Time,
            "timestamp" => ColumnType::Timestamp,
            "timestamptz" => ColumnType::TimestampTz,
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            "bytea" => ColumnType::Bytea,
            _ => return None,
        })
    }

    pub fn is_json(&self) -> bool {
        matches!(self, ColumnType::Json | ColumnType::Jsonb)
    }

    fn push_null(&self, arguments: &mut PgArguments) -> std::result::Result<(), BoxDynError> {
        match self {
            ColumnType::Text => arguments.add(Option::<String>::None),
            ColumnType::SmallInt => arguments.add(Option::<i16>::None),
            ColumnType::Integer => arguments.add(Option::<i32>::None),
            ColumnType::BigInt => arguments.add(Option::<i64>::None),
            ColumnType::Boolean => arguments.add(Option::<bool>::None),
            ColumnType::Real => arguments.add(Option::<f32>::None),
            ColumnType::Double => arguments.add(Option::<f64>::None),
            ColumnType::Numeric => arguments.add(Option::<Decimal>::None),
            ColumnType::Uuid => arguments.add(Option::<Uuid>::None),
            ColumnType::Date => arguments.add(Option::<NaiveDate>::None),
            ColumnType::Time => arguments.add(Option::<NaiveTime>::None),
            ColumnType::Timestamp => arguments.add(Option::<NaiveDateTime>::None),
            ColumnType::TimestampTz => arguments.add(Option::<DateTime<Utc>>::None),
            ColumnType::Json | ColumnType::Jsonb => arguments.add(Option::<JsonValue>::None),
            ColumnType::Bytea => arguments.add(Option::<Vec<u8>>::None),
        }
    }

    /// Coerces a JSON value into this column's representation.
    ///
    /// Lenient in the usual ways: numeric strings for numbers, RFC 3339 or
    /// epoch milliseconds for timestamps, `"t"`/`"false"`/`1` for booleans.
    /// JSON `null` is SQL NULL for every type, JSON columns included.
    pub fn coerce(&self, value: &JsonValue) -> std::result::Result<ExtractedValue, String> {
        if value.is_null() {
            return Ok(ExtractedValue::Null);
        }
        match self {
            ColumnType::Text => Ok(ExtractedValue::String(match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })),
            ColumnType::SmallInt => {
                let v = coerce_i64(value)?;
                i16::try_from(v)
                    .map(ExtractedValue::SmallInt)
                    .map_err(|_| format!("{} is out of range for SMALLINT", v))
            }
            ColumnType::Integer => {
                let v = coerce_i64(value)?;
                i32::try_from(v)
                    .map(ExtractedValue::Int)
                    .map_err(|_| format!("{} is out of range for INTEGER", v))
            }
            ColumnType::BigInt => coerce_i64(value).map(ExtractedValue::BigInt),
            ColumnType::Boolean => coerce_bool(value).map(ExtractedValue::Bool),
            ColumnType::Real => coerce_f64(value).map(|v| ExtractedValue::Float(v as f32)),
            ColumnType::Double => coerce_f64(value).map(ExtractedValue::Double),
            ColumnType::Numeric => {
                let text = match value {
                    JsonValue::Number(n) => n.to_string(),
                    JsonValue::String(s) => s.trim().to_string(),
                    other => return Err(format!("expected a number, got {}", other)),
                };
                text.parse::<Decimal>()
                    .or_else(|_| Decimal::from_scientific(&text))
                    .map(ExtractedValue::Decimal)
                    .map_err(|e| format!("invalid numeric '{}': {}", text, e))
            }
            ColumnType::Uuid => {
                let s = expect_str(value)?;
                Uuid::parse_str(s.trim())
                    .map(ExtractedValue::Uuid)
                    .map_err(|e| format!("invalid uuid '{}': {}", s, e))
            }
            ColumnType::Date => coerce_date(value).map(ExtractedValue::Date),
            ColumnType::Time => {
                let s = expect_str(value)?;
                NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                    .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                    .map(ExtractedValue::Time)
                    .map_err(|e| format!("invalid time '{}': {}", s, e))
            }
            ColumnType::Timestamp => {
                coerce_timestamptz(value).map(|v| ExtractedValue::Timestamp(v.naive_utc()))
            }
            ColumnType::TimestampTz => coerce_timestamptz(value).map(ExtractedValue::TimestampTz),
            ColumnType::Json | ColumnType::Jsonb => Ok(ExtractedValue::Json(value.clone())),
            ColumnType::Bytea => match value {
                JsonValue::String(s) => match s.strip_prefix("\\x") {
                    Some(hex) => decode_hex(hex).map(ExtractedValue::Bytes),
                    None => Ok(ExtractedValue::Bytes(s.as_bytes().to_vec())),
                },
                JsonValue::Array(items) => items
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|b| u8::try_from(b).ok())
                            .ok_or_else(|| format!("invalid byte {}", item))
                    })
                    .collect::<std::result::Result<Vec<u8>, String>>()
                    .map(ExtractedValue::Bytes),
                other => Err(format!("expected bytes, got {}", other)),
            },
        }
    }

    /// Formats a coerced value for the CSV COPY stream, `None` for NULL.
    pub fn format_csv(&self, value: &ExtractedValue) -> Option<String> {
        match (self, value) {
            // A JSON column fed a plain string stores it as a JSON string.
            (ColumnType::Json | ColumnType::Jsonb, ExtractedValue::String(s)) => {
                Some(JsonValue::String(s.clone()).to_string())
            }
            _ => value.to_pg_text(),
        }
    }
}

fn expect_str(value: &JsonValue) -> std::result::Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected a string, got {}", value))
}

fn coerce_i64(value: &JsonValue) -> std::result::Result<i64, String> {
    match value {
        JsonValue::Number(n) => {
            if let Some(v) = n.as_i64() {
                return Ok(v);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                    Ok(f as i64)
                }
                _ => Err(format!("{} is not an integer", n)),
            }
        }
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("invalid integer '{}': {}", s, e)),
        other => Err(format!("expected an integer, got {}", other)),
    }
}

fn coerce_f64(value: &JsonValue) -> std::result::Result<f64, String> {
    match value {
        JsonValue::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{} is not a float", n)),
        JsonValue::String(s) => match s.trim() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            t => t
                .parse::<f64>()
                .map_err(|e| format!("invalid float '{}': {}", s, e)),
        },
        other => Err(format!("expected a number, got {}", other)),
    }
}

fn coerce_bool(value: &JsonValue) -> std::result::Result<bool, String> {
    match value {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{} is not a boolean", n)),
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => Ok(true),
            "f" | "false" | "n" | "no" | "off" | "0" => Ok(false),
            _ => Err(format!("'{}' is not a boolean", s)),
        },
        other => Err(format!("expected a boolean, got {}", other)),
    }
}

fn coerce_date(value: &JsonValue) -> std::result::Result<NaiveDate, String> {
    let s = expect_str(value)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| coerce_timestamptz(value).map(|v| v.date_naive()))
        .map_err(|_| format!("invalid date '{}'", s))
}

fn coerce_timestamptz(value: &JsonValue) -> std::result::Result<DateTime<Utc>, String> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| format!("{} is not a valid epoch timestamp", n)),
        JsonValue::String(s) => {
            let s = s.trim();
            if let Ok(v) = DateTime::parse_from_rfc3339(s) {
                return Ok(v.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(v) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Ok(v.and_utc());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|v| v.and_utc())
                .ok_or_else(|| format!("invalid timestamp '{}'", s))
        }
        other => Err(format!("expected a timestamp, got {}", other)),
    }
}

fn decode_hex(hex: &str) -> std::result::Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err(format!("odd-length hex string '{}'", hex));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex string '{}'", hex))
        })
        .collect()
}

fn get<'r, T>(row: &'r PgRow, idx: usize, column_name: &str, kind: &str) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get::<Option<T>, _>(idx).map_err(|e| {
        ConfluxError::Query(format!(
            "Failed to extract {} from column '{}': {}",
            kind, column_name, e
        ))
    })
}

/// Convert a PgRow to a HashMap of column name -> ExtractedValue.
///
/// # Errors
///
/// Returns error if column extraction or type conversion fails.
pub fn row_to_extracted(row: &PgRow) -> Result<HashMap<String, ExtractedValue>> {
    let mut columns = HashMap::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let type_name = column.type_info().name();

        let value = match type_name {
            "BOOL" => get(row, idx, name, "BOOL")?.map(ExtractedValue::Bool),
            "INT2" => get(row, idx, name, "SMALLINT")?.map(ExtractedValue::SmallInt),
            "INT4" => get(row, idx, name, "INT")?.map(ExtractedValue::Int),
            "INT8" => get(row, idx, name, "BIGINT")?.map(ExtractedValue::BigInt),
            "FLOAT4" => get(row, idx, name, "FLOAT")?.map(ExtractedValue::Float),
            "FLOAT8" => get(row, idx, name, "DOUBLE")?.map(ExtractedValue::Double),
            "VARCHAR" | "TEXT" | "CHAR" | "BPCHAR" | "NAME" => {
                get(row, idx, name, "STRING")?.map(ExtractedValue::String)
            }
            "BYTEA" => get(row, idx, name, "BYTES")?.map(ExtractedValue::Bytes),
            "UUID" => get(row, idx, name, "UUID")?.map(ExtractedValue::Uuid),
            "DATE" => get(row, idx, name, "DATE")?.map(ExtractedValue::Date),
            "TIME" => get(row, idx, name, "TIME")?.map(ExtractedValue::Time),
            "TIMESTAMP" => get(row, idx, name, "TIMESTAMP")?.map(ExtractedValue::Timestamp),
            "TIMESTAMPTZ" => get(row, idx, name, "TIMESTAMPTZ")?.map(ExtractedValue::TimestampTz),
            "JSON" | "JSONB" => get(row, idx, name, "JSON")?.map(ExtractedValue::Json),
            "NUMERIC" => get(row, idx, name, "NUMERIC")?.map(ExtractedValue::Decimal),
            unknown => {
                tracing::warn!(
                    "Unknown PostgreSQL type '{}' for column '{}', attempting string extraction",
                    unknown,
                    name
                );
                get(row, idx, name, unknown)?.map(ExtractedValue::String)
            }
        };

        columns.insert(name.to_string(), value.unwrap_or(ExtractedValue::Null));
    }

    Ok(columns)
}
