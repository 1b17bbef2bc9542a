//! Import templates built from mapper column metadata.
//!
//! Every template round-trips through the matching parser: generating with
//! examples and importing the result yields the mapper's example rows.

use crate::error::{ImportError, ImportResult};
use crate::mappers::TableMapper;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Csv,
    Json,
    Xml,
    Yaml,
}

impl TemplateFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TemplateFormat::Csv => "csv",
            TemplateFormat::Json => "json",
            TemplateFormat::Xml => "xml",
            TemplateFormat::Yaml => "yaml",
        }
    }
}

impl fmt::Display for TemplateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TemplateFormat {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(TemplateFormat::Csv),
            "json" => Ok(TemplateFormat::Json),
            "xml" => Ok(TemplateFormat::Xml),
            "yaml" | "yml" => Ok(TemplateFormat::Yaml),
            other => Err(ImportError::Template(format!(
                "unsupported template format '{other}'"
            ))),
        }
    }
}

fn template_error(err: impl fmt::Display) -> ImportError {
    ImportError::Template(err.to_string())
}

/// Render a template for `mapper`.
///
/// Without examples, CSV templates carry only the header and the other
/// formats carry a single record with every column left blank.
pub fn generate(
    mapper: &dyn TableMapper,
    format: TemplateFormat,
    include_examples: bool,
) -> ImportResult<String> {
    let columns: Vec<&str> = mapper.template_columns().iter().map(|c| c.name).collect();
    let rows: Vec<Vec<&str>> = if include_examples {
        mapper.example_rows().to_vec()
    } else if format == TemplateFormat::Csv {
        Vec::new()
    } else {
        vec![vec![""; columns.len()]]
    };
    let table = mapper.table_type();

    match format {
        TemplateFormat::Csv => csv_template(&columns, &rows),
        TemplateFormat::Json => {
            serde_json::to_string_pretty(&document(table.as_str(), &columns, &rows))
                .map_err(template_error)
        }
        TemplateFormat::Yaml => {
            serde_yaml::to_string(&document(table.as_str(), &columns, &rows)).map_err(template_error)
        }
        TemplateFormat::Xml => xml_template(table.as_str(), table.record_name(), &columns, &rows),
    }
}

fn csv_template(columns: &[&str], rows: &[Vec<&str>]) -> ImportResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns).map_err(template_error)?;
    for row in rows {
        writer.write_record(row).map_err(template_error)?;
    }
    let bytes = writer.into_inner().map_err(template_error)?;
    String::from_utf8(bytes).map_err(template_error)
}

/// `{ "<table>": [ {column: value, ...}, ... ] }`
fn document(table: &str, columns: &[&str], rows: &[Vec<&str>]) -> Value {
    let records = rows
        .iter()
        .map(|row| {
            let record: Map<String, Value> = columns
                .iter()
                .zip(row)
                .map(|(column, value)| (column.to_string(), Value::String(value.to_string())))
                .collect();
            Value::Object(record)
        })
        .collect();

    let mut root = Map::new();
    root.insert(table.to_string(), Value::Array(records));
    Value::Object(root)
}

fn xml_template(
    root: &str,
    record: &str,
    columns: &[&str],
    rows: &[Vec<&str>],
) -> ImportResult<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(template_error)?;
    writer
        .write_event(Event::Start(BytesStart::new(root)))
        .map_err(template_error)?;

    for row in rows {
        writer
            .write_event(Event::Start(BytesStart::new(record)))
            .map_err(template_error)?;
        for (column, value) in columns.iter().zip(row) {
            if value.is_empty() {
                writer
                    .write_event(Event::Empty(BytesStart::new(*column)))
                    .map_err(template_error)?;
                continue;
            }
            writer
                .write_event(Event::Start(BytesStart::new(*column)))
                .map_err(template_error)?;
            writer
                .write_event(Event::Text(BytesText::new(value)))
                .map_err(template_error)?;
            writer
                .write_event(Event::End(BytesEnd::new(*column)))
                .map_err(template_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(record)))
            .map_err(template_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new(root)))
        .map_err(template_error)?;
    String::from_utf8(writer.into_inner()).map_err(template_error)
}
