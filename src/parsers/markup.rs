//! XML record files.
//!
//! The document is first folded into a `serde_json::Value` tree: an element
//! with only text becomes a string, an element with children or attributes
//! becomes an object, and repeated child names collect into an array. The
//! children of the root element are the records, kept in document order
//! whatever their element names.

use super::structured::flatten_records;
use super::{ParseError, ParseResult};
use crate::dataset::Dataset;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

const TEXT_KEY: &str = "#text";

/// A parsed document.
#[derive(Debug)]
pub(super) struct Document {
    pub root_name: String,
    /// Child elements of the root, in document order.
    pub records: Vec<Value>,
}

pub(super) fn parse(bytes: &[u8]) -> ParseResult<Dataset> {
    let document = parse_tree(bytes)?;
    flatten_records(&document.records)
}

/// Records are objects; a text-only record is wrapped under `#text`.
fn as_record(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => {
            let mut map = Map::new();
            map.insert(TEXT_KEY.to_string(), other);
            Value::Object(map)
        }
    }
}

pub(super) fn parse_tree(bytes: &[u8]) -> ParseResult<Document> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut records = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(Element::open(&start)?),
            Event::Empty(start) => {
                let element = Element::open(&start)?;
                if let Some(root_name) = close(&mut stack, element, &mut records) {
                    return Ok(Document { root_name, records });
                }
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&text.unescape().map_err(quick_xml::Error::from)?);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| {
                    ParseError::InvalidStructure("unexpected closing tag".to_string())
                })?;
                if let Some(root_name) = close(&mut stack, element, &mut records) {
                    return Ok(Document { root_name, records });
                }
            }
            Event::Eof => {
                return Err(ParseError::InvalidStructure(
                    "document has no complete root element".to_string(),
                ));
            }
            _ => {}
        }
    }
}

struct Element {
    name: String,
    children: Map<String, Value>,
    text: String,
}

impl Element {
    fn open(start: &BytesStart<'_>) -> ParseResult<Self> {
        let mut children = Map::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(quick_xml::Error::from)?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
            let value = attribute
                .unescape_value()
                .map_err(quick_xml::Error::from)?
                .to_string();
            children.insert(key, Value::String(value));
        }

        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).to_string(),
            children,
            text: String::new(),
        })
    }

    fn into_value(self) -> Value {
        if self.children.is_empty() {
            return Value::String(self.text);
        }

        let mut children = self.children;
        if !self.text.trim().is_empty() {
            children.insert(TEXT_KEY.to_string(), Value::String(self.text));
        }
        Value::Object(children)
    }
}

/// Attach a finished element to its parent, collecting direct children of
/// the root into `records`. Returns the root's name once it closes.
fn close(stack: &mut [Element], element: Element, records: &mut Vec<Value>) -> Option<String> {
    let name = element.name.clone();

    if stack.len() == 1 {
        records.push(as_record(element.into_value()));
        return None;
    }

    let value = element.into_value();
    let Some(parent) = stack.last_mut() else {
        return Some(name);
    };

    match parent.children.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.children.insert(name, value);
        }
    }
    None
}
