use serde_json::{Map, Value};

/// An opaque, string-keyed record. Every inbound event, combine result, and
/// cached repository payload in this codebase is shaped this way; nothing
/// downstream needs to know the concrete schema, only the field names it
/// asks for by name.
pub type Record = Map<String, Value>;

/// Builds a [`Record`] from an iterator of `(field, value)` pairs, the shape
/// combine strategies and repository backends both produce.
pub fn record_from_pairs<I>(pairs: I) -> Record
where
    I: IntoIterator<Item = (String, Value)>,
{
    pairs.into_iter().collect()
}

/// Reads a field as a plain string, ignoring non-string values.
pub fn get_str<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

/// Returns true if `record` has every field name in `fields`.
pub fn has_fields(record: &Record, fields: &[String]) -> bool {
    fields.iter().all(|f| record.contains_key(f))
}
