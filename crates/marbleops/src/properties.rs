//! Typed access to stage properties.

use marblecore::{Element, GraphError, Value};

pub(crate) fn optional_u64(element: &Element, key: &str) -> Result<Option<u64>, GraphError> {
    match element.property(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                GraphError::invalid_property(&element.id, key, format!("expected a non-negative integer, got {value}"))
            }),
    }
}

pub(crate) fn required_u64(element: &Element, key: &str) -> Result<u64, GraphError> {
    optional_u64(element, key)?
        .ok_or_else(|| GraphError::invalid_property(&element.id, key, "missing"))
}

pub(crate) fn optional_i64(element: &Element, key: &str) -> Result<Option<i64>, GraphError> {
    match element.property(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or_else(|| {
            GraphError::invalid_property(&element.id, key, format!("expected an integer, got {value}"))
        }),
    }
}

pub(crate) fn required_str<'a>(element: &'a Element, key: &str) -> Result<&'a str, GraphError> {
    match element.property(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            Err(GraphError::invalid_property(&element.id, key, "missing"))
        }
        Some(other) => Err(GraphError::invalid_property(
            &element.id,
            key,
            format!("expected a string, got {other}"),
        )),
    }
}

/// An optional list of strings, e.g. the expected reference names of a join.
pub(crate) fn optional_names(element: &Element, key: &str) -> Result<Option<Vec<String>>, GraphError> {
    let Some(value) = element.property(key).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let invalid = || GraphError::invalid_property(&element.id, key, "expected an array of strings");
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
