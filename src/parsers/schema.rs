//! Column schema inference for semi-structured files.

use super::markup::Document;
use super::structured::locate_records;
use super::{ParseError, ParseResult};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InferredType {
    Identifier,
    Boolean,
    Object,
    Array,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferredColumn {
    pub name: String,
    pub data_type: InferredType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferredSchema {
    pub table_name: String,
    pub columns: Vec<InferredColumn>,
}

/// Infer from the first record of a JSON document.
///
/// The table is named after the property holding the records, or after the
/// file when the document is a bare array.
pub(super) fn infer_json(value: &Value, file_stem: &str) -> ParseResult<InferredSchema> {
    let (property, records) = locate_records(value).ok_or_else(|| {
        ParseError::InvalidStructure("no record array to infer a schema from".to_string())
    })?;
    let first = first_record(records.first())?;

    Ok(InferredSchema {
        table_name: property.unwrap_or(file_stem).to_string(),
        columns: classify_fields(first),
    })
}

/// Infer from the first record element of an XML document, named after the
/// root element.
pub(super) fn infer_xml(document: &Document) -> ParseResult<InferredSchema> {
    let first = first_record(document.records.first())?;

    Ok(InferredSchema {
        table_name: document.root_name.clone(),
        columns: classify_fields(first),
    })
}

fn first_record(record: Option<&Value>) -> ParseResult<&Map<String, Value>> {
    match record {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ParseError::InvalidStructure(
            "first record is not an object".to_string(),
        )),
        None => Err(ParseError::InvalidStructure(
            "no records to infer a schema from".to_string(),
        )),
    }
}

fn classify_fields(record: &Map<String, Value>) -> Vec<InferredColumn> {
    record
        .iter()
        .map(|(name, value)| InferredColumn {
            name: name.clone(),
            data_type: classify(value),
        })
        .collect()
}

fn classify(value: &Value) -> InferredType {
    match value {
        Value::Bool(_) => InferredType::Boolean,
        Value::Object(_) => InferredType::Object,
        Value::Array(_) => InferredType::Array,
        Value::String(text) => {
            let text = text.trim();
            if Uuid::parse_str(text).is_ok() {
                InferredType::Identifier
            } else if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false") {
                InferredType::Boolean
            } else {
                InferredType::Text
            }
        }
        Value::Null | Value::Number(_) => InferredType::Text,
    }
}
