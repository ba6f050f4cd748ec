//! Canonical encoding for agent records
//!
//! The normative encoding is UTF-8 JSON with map keys sorted lexicographically
//! at every nesting level and no trailing whitespace. These bytes feed both
//! CID derivation and registry storage, so implementations in other languages
//! must produce identical output.

use crate::error::{Error, Result};
use crate::record::{Record, RecordV1, RecordV2, RecordV3};
use serde_json::Value;

/// Top-level field carrying the schema generation.
pub const SCHEMA_VERSION_FIELD: &str = "schema_version";

/// Read the `schema_version` of a serialized record without fully decoding it.
pub fn detect_version(bytes: &[u8]) -> Result<String> {
    if bytes.is_empty() {
        return Err(Error::invalid("empty record payload"));
    }
    let value: Value = serde_json::from_slice(bytes).map_err(Error::bad_record)?;
    value
        .get(SCHEMA_VERSION_FIELD)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::invalid("record has no schema_version field"))
}

/// Decode a record, dispatching on its detected schema version.
pub fn unmarshal(bytes: &[u8]) -> Result<Record> {
    let version = detect_version(bytes)?;
    match version.as_str() {
        v if v.starts_with("v0.3") => serde_json::from_slice::<RecordV1>(bytes)
            .map(Record::V1)
            .map_err(Error::bad_record),
        v if v.starts_with("v0.4") => serde_json::from_slice::<RecordV2>(bytes)
            .map(Record::V2)
            .map_err(Error::bad_record),
        v if v.starts_with("v0.5") => serde_json::from_slice::<RecordV3>(bytes)
            .map(Record::V3)
            .map_err(Error::bad_record),
        _ => Err(Error::UnsupportedVersion(version)),
    }
}

/// Encode a record to its canonical bytes.
///
/// The variant payload is serialized, then rebuilt so that every object at
/// every depth is emitted key-sorted. Sorting is explicit here rather than
/// inherited from the JSON library's map representation.
pub fn marshal(record: &Record) -> Result<Vec<u8>> {
    let value = match record {
        Record::V1(r) => serde_json::to_value(r),
        Record::V2(r) => serde_json::to_value(r),
        Record::V3(r) => serde_json::to_value(r),
    }
    .map_err(Error::internal)?;
    serde_json::to_vec(&sort_keys(value)).map_err(Error::internal)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sort_keys(v)))
                .collect::<serde_json::Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
