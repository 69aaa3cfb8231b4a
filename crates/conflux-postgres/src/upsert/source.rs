use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value as JsonValue;

use crate::{ConfluxError, Result};

/// A live sequence of raw records. An `Err` item fails the upsert and is
/// handed back to the caller unchanged.
pub type RecordStream = BoxStream<'static, Result<JsonValue>>;

/// Input of a bulk upsert.
pub enum RecordSource {
    /// Records already in memory.
    Records(Vec<JsonValue>),
    /// Records pulled one at a time, with back-pressure.
    Stream(RecordStream),
}

impl RecordSource {
    /// Accepts a JSON array of records.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::InputRejected`] for anything but an array.
    pub fn from_json(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Array(records) => Ok(RecordSource::Records(records)),
            other => Err(ConfluxError::InputRejected(format!(
                "expected an array of records, got {}",
                kind(&other)
            ))),
        }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<JsonValue>> + Send + 'static,
    {
        RecordSource::Stream(stream.boxed())
    }

    /// Wraps an iterator of fallible records, e.g. lines already parsed.
    pub fn from_results<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Result<JsonValue>>,
        I::IntoIter: Send + 'static,
    {
        RecordSource::Stream(stream::iter(records).boxed())
    }

    pub(crate) fn into_stream(self) -> RecordStream {
        match self {
            RecordSource::Records(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
            RecordSource::Stream(stream) => stream,
        }
    }
}

impl From<Vec<JsonValue>> for RecordSource {
    fn from(records: Vec<JsonValue>) -> Self {
        RecordSource::Records(records)
    }
}

impl std::fmt::Debug for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordSource::Records(records) => {
                f.debug_tuple("Records").field(&records.len()).finish()
            }
            RecordSource::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Rejects in-memory input that contains anything but objects.
pub(crate) fn check_records(records: &[JsonValue]) -> Result<()> {
    match records.iter().position(|r| !r.is_object()) {
        Some(idx) => Err(ConfluxError::InputRejected(format!(
            "record {} is {}, expected an object",
            idx,
            kind(&records[idx])
        ))),
        None => Ok(()),
    }
}

/// Fails the call with a source error for a stream element that is not an
/// object.
pub(crate) fn check_streamed(record: &JsonValue, position: u64) -> Result<()> {
    if record.is_object() {
        Ok(())
    } else {
        Err(ConfluxError::Source(format!(
            "stream element {} is {}, expected an object",
            position,
            kind(record)
        )))
    }
}

pub(crate) fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_accepts_arrays_only() {
        let source = RecordSource::from_json(json!([{"id": 1}])).unwrap();
        assert!(matches!(source, RecordSource::Records(ref r) if r.len() == 1));

        for value in [json!({"id": 1}), json!("records"), json!(null), json!(3)] {
            let err = RecordSource::from_json(value).unwrap_err();
            assert!(matches!(err, ConfluxError::InputRejected(_)));
        }
    }

    #[test]
    fn test_check_records() {
        assert!(check_records(&[]).is_ok());
        assert!(check_records(&[json!({"id": 1}), json!({})]).is_ok());
        let err = check_records(&[json!({"id": 1}), json!([1])]).unwrap_err();
        assert!(err.to_string().contains("record 1 is an array"));
    }

    #[test]
    fn test_check_streamed_is_source_error() {
        assert!(check_streamed(&json!({}), 0).is_ok());
        let err = check_streamed(&json!(42), 3).unwrap_err();
        assert!(matches!(err, ConfluxError::Source(_)));
        assert!(err.is_upstream());
    }

    #[tokio::test]
    async fn test_into_stream_yields_records_in_order() {
        let source = RecordSource::from(vec![json!({"id": 1}), json!({"id": 2})]);
        let items: Vec<_> = source.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_ref().unwrap()["id"], json!(2));
    }

    #[tokio::test]
    async fn test_from_results_keeps_errors() {
        let source = RecordSource::from_results(vec![
            Ok(json!({"id": 1})),
            Err(ConfluxError::source("broken pipe")),
        ]);
        let items: Vec<_> = source.into_stream().collect().await;
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ConfluxError::Source(_))));
    }
}
