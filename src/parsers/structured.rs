//! JSON and YAML record files.
//!
//! Both formats are read into a `serde_json::Value` and flattened the same
//! way: records are objects, columns are the union of their keys.

use super::{ParseError, ParseResult};
use crate::dataset::Dataset;
use serde_json::Value;
use std::collections::HashMap;

pub(super) fn parse_json(bytes: &[u8]) -> ParseResult<Dataset> {
    let value: Value = serde_json::from_slice(bytes)?;
    records_to_dataset(&value)
}

pub(super) fn parse_yaml(bytes: &[u8]) -> ParseResult<Dataset> {
    let value: Value = serde_yaml::from_slice(bytes)?;
    records_to_dataset(&value)
}

/// The record list of a document, with the property name that held it.
///
/// Accepts a top-level array, or an object whose first array-valued property
/// holds the records.
pub(super) fn locate_records(value: &Value) -> Option<(Option<&str>, &[Value])> {
    match value {
        Value::Array(records) => Some((None, records.as_slice())),
        Value::Object(map) => map.iter().find_map(|(key, value)| match value {
            Value::Array(records) => Some((Some(key.as_str()), records.as_slice())),
            _ => None,
        }),
        _ => None,
    }
}

pub(super) fn records_to_dataset(value: &Value) -> ParseResult<Dataset> {
    let (_, records) = locate_records(value).ok_or_else(|| {
        ParseError::InvalidStructure(
            "expected an array of records or an object holding one".to_string(),
        )
    })?;
    flatten_records(records)
}

/// Turn a list of objects into a dataset, row `n` being record `n`.
pub(super) fn flatten_records(records: &[Value]) -> ParseResult<Dataset> {
    let mut columns: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (index, record) in records.iter().enumerate() {
        let Value::Object(map) = record else {
            return Err(ParseError::MalformedRow {
                row: index + 1,
                column: 1,
                message: "record is not an object".to_string(),
            });
        };
        for key in map.keys() {
            if !positions.contains_key(key) {
                positions.insert(key.clone(), columns.len());
                columns.push(key.clone());
            }
        }
    }

    let mut dataset = Dataset::new(columns.clone());
    for record in records {
        let mut values = vec![String::new(); columns.len()];
        if let Value::Object(map) = record {
            for (key, value) in map {
                if let Some(&position) = positions.get(key) {
                    values[position] = stringify(value);
                }
            }
        }
        dataset.push_row(values);
    }
    Ok(dataset)
}

/// Scalars as text, nested values as compact JSON.
pub(super) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
