//! CSV decoding.

use super::{ParseError, ParseResult};
use crate::dataset::Dataset;
use csv::{ReaderBuilder, Trim};

const BOM: char = '\u{feff}';

/// Header row names the columns; every later record is one row.
///
/// Empty lines are skipped by the reader. Short records are padded, records
/// wider than the header abort the file.
pub(super) fn parse(bytes: &[u8]) -> ParseResult<Dataset> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|name| name.trim_start_matches(BOM).to_string())
        .collect();
    let width = headers.len();
    let mut dataset = Dataset::new(headers);

    for (index, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() > width {
            return Err(ParseError::MalformedRow {
                row: index + 1,
                column: width + 1,
                message: format!(
                    "expected at most {} fields, found {}",
                    width,
                    record.len()
                ),
            });
        }
        dataset.push_row(record.iter().map(str::to_string).collect());
    }

    Ok(dataset)
}
