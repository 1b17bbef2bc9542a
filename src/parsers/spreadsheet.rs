//! Spreadsheet decoding (xlsx, xlsm, xls, ods).
//!
//! Only the first worksheet is read. When the target mapper's columns are
//! known, headers are matched against them case-insensitively, unmatched
//! headers are dropped and every cell is coerced to its column's type.

use super::{ParseError, ParseResult};
use crate::dataset::Dataset;
use crate::mappers::checks::parse_bool;
use crate::mappers::{ColumnSpec, ColumnType};
use calamine::{Data, DataType, Reader, open_workbook_auto_from_rs};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use std::io::Cursor;
use uuid::Uuid;

/// Largest serial Excel can represent (9999-12-31).
const MAX_EXCEL_SERIAL: f64 = 2_958_466.0;

pub(super) fn parse(bytes: &[u8], columns: Option<&[ColumnSpec]>) -> ParseResult<Dataset> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(ParseError::NoWorksheet)??;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Dataset::default());
    };

    let plan = plan_columns(header, columns);
    let mut dataset = Dataset::new(plan.iter().map(|(_, name, _)| name.clone()).collect());

    for row in rows {
        if row.iter().all(|cell| matches!(cell, Data::Empty)) {
            continue;
        }
        let values = plan
            .iter()
            .map(|(position, _, data_type)| {
                row.get(*position)
                    .map(|cell| coerce(cell, *data_type))
                    .unwrap_or_default()
            })
            .collect();
        dataset.push_row(values);
    }

    Ok(dataset)
}

/// `(sheet position, column name, type)` for every column kept.
fn plan_columns(
    header: &[Data],
    columns: Option<&[ColumnSpec]>,
) -> Vec<(usize, String, ColumnType)> {
    header
        .iter()
        .enumerate()
        .filter_map(|(position, cell)| {
            let name = cell_text(cell).trim().to_string();
            if name.is_empty() {
                return None;
            }
            match columns {
                None => Some((position, name, ColumnType::Text)),
                Some(known) => known
                    .iter()
                    .find(|column| column.name.eq_ignore_ascii_case(&name))
                    .filter(|column| column.data_type != ColumnType::Collection)
                    .map(|column| (position, column.name.to_string(), column.data_type)),
            }
        })
        .collect()
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Render a cell for its column type. Cells that cannot be coerced keep
/// their raw text so validation can report them.
pub(super) fn coerce(cell: &Data, data_type: ColumnType) -> String {
    let raw = cell_text(cell);
    match data_type {
        ColumnType::Identifier => Uuid::parse_str(raw.trim())
            .map(|id| id.to_string())
            .unwrap_or(raw),
        ColumnType::Timestamp => timestamp(cell)
            .map(|moment| moment.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or(raw),
        ColumnType::Integer => integer(cell).unwrap_or(raw),
        ColumnType::Boolean => boolean(cell)
            .map(|flag| flag.to_string())
            .unwrap_or(raw),
        ColumnType::Enumerated(labels) => labels
            .iter()
            .find(|label| label.eq_ignore_ascii_case(raw.trim()))
            .map(|label| label.to_string())
            .unwrap_or(raw),
        ColumnType::Text | ColumnType::Email | ColumnType::Url | ColumnType::Collection => raw,
    }
}

fn timestamp(cell: &Data) -> Option<DateTime<Utc>> {
    match cell {
        Data::DateTime(_) | Data::DateTimeIso(_) => cell.as_datetime().map(|naive| naive.and_utc()),
        Data::Float(serial) => from_serial(*serial),
        Data::Int(serial) => from_serial(*serial as f64),
        Data::String(text) => {
            let text = text.trim();
            DateTime::parse_from_rfc3339(text)
                .map(|parsed| parsed.with_timezone(&Utc))
                .ok()
                .or_else(|| dateparser::parse(text).ok())
        }
        _ => None,
    }
}

/// Excel serial day number (1900 date system) to UTC.
fn from_serial(serial: f64) -> Option<DateTime<Utc>> {
    if !(0.0..MAX_EXCEL_SERIAL).contains(&serial) {
        return None;
    }
    let epoch: NaiveDateTime = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch
        .checked_add_signed(TimeDelta::try_milliseconds(millis)?)
        .map(|naive| naive.and_utc())
}

fn integer(cell: &Data) -> Option<String> {
    let number = match cell {
        Data::Int(value) => return Some(value.to_string()),
        Data::Float(value) => *value,
        Data::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Some((number as i64).to_string())
    } else {
        None
    }
}

fn boolean(cell: &Data) -> Option<bool> {
    match cell {
        Data::Bool(flag) => Some(*flag),
        Data::Int(1) => Some(true),
        Data::Int(0) => Some(false),
        Data::Float(value) if *value == 1.0 => Some(true),
        Data::Float(value) if *value == 0.0 => Some(false),
        Data::String(text) => parse_bool(text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_LABELS: &[&str] = &["Active", "Inactive"];

    #[test]
    fn test_identifier_and_enum_coercion() {
        let id = Data::String(" 3F2504E0-4F89-41D3-9A0C-0305E82C3301 ".into());
        assert_eq!(
            coerce(&id, ColumnType::Identifier),
            "3f2504e0-4f89-41d3-9a0c-0305e82c3301"
        );
        assert_eq!(
            coerce(&Data::String("nope".into()), ColumnType::Identifier),
            "nope"
        );
        assert_eq!(
            coerce(
                &Data::String("inactive".into()),
                ColumnType::Enumerated(STATUS_LABELS)
            ),
            "Inactive"
        );
        assert_eq!(
            coerce(
                &Data::String("retired".into()),
                ColumnType::Enumerated(STATUS_LABELS)
            ),
            "retired"
        );
    }

    #[test]
    fn test_numeric_and_boolean_coercion() {
        assert_eq!(coerce(&Data::Float(42.0), ColumnType::Integer), "42");
        assert_eq!(coerce(&Data::Float(4.5), ColumnType::Integer), "4.5");
        assert_eq!(coerce(&Data::String("7.0".into()), ColumnType::Integer), "7");
        assert_eq!(coerce(&Data::Bool(true), ColumnType::Boolean), "true");
        assert_eq!(coerce(&Data::Int(0), ColumnType::Boolean), "false");
        assert_eq!(coerce(&Data::String("Yes".into()), ColumnType::Boolean), "true");
        assert_eq!(coerce(&Data::String("maybe".into()), ColumnType::Boolean), "maybe");
        assert_eq!(coerce(&Data::Empty, ColumnType::Text), "");
    }

    #[test]
    fn test_timestamp_coercion() {
        assert_eq!(
            coerce(&Data::Float(45658.5), ColumnType::Timestamp),
            "2025-01-01T12:00:00Z"
        );
        assert_eq!(
            coerce(
                &Data::String("2030-12-31T00:00:00+02:00".into()),
                ColumnType::Timestamp
            ),
            "2030-12-30T22:00:00Z"
        );
        assert_eq!(
            coerce(&Data::String("whenever".into()), ColumnType::Timestamp),
            "whenever"
        );
        assert_eq!(coerce(&Data::Float(-1.0), ColumnType::Timestamp), "-1");
    }

    #[test]
    fn test_header_plan_skips_unmatched_and_collection_columns() {
        let known = [
            ColumnSpec::required("Username", ColumnType::Text, ""),
            ColumnSpec::optional("Groups", ColumnType::Collection, ""),
        ];
        let header = [
            Data::String("USERNAME".into()),
            Data::String("Groups".into()),
            Data::String("Unrelated".into()),
            Data::Empty,
        ];

        let plan = plan_columns(&header, Some(&known[..]));
        assert_eq!(plan, vec![(0, "Username".to_string(), ColumnType::Text)]);

        let untyped = plan_columns(&header, None);
        assert_eq!(untyped.len(), 3);
    }

    #[test]
    fn test_garbage_bytes_are_rejected() {
        assert!(parse(b"definitely not a workbook", None).is_err());
    }
}
