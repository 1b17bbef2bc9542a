//! File decoding.
//!
//! Every supported format ends up as a [`Dataset`]. JSON and XML files can
//! also be inspected for an [`InferredSchema`] without being imported.
//!
//! Failures are always scoped to one file: a broken file yields a
//! [`FileParseError`] carrying its name and never affects its siblings.

mod delimited;
mod markup;
mod schema;
mod spreadsheet;
mod structured;

pub use schema::{InferredColumn, InferredSchema, InferredType};

use crate::dataset::Dataset;
use crate::mappers::ColumnSpec;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("row {row}, column {column}: {message}")]
    MalformedRow {
        row: usize,
        column: usize,
        message: String,
    },
    #[error("unsupported file format '{0}'")]
    UnsupportedFormat(String),
    #[error("file is {size} bytes, over the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("spreadsheet has no worksheet")]
    NoWorksheet,
    #[error("{0}")]
    InvalidStructure(String),
}

/// A parse failure tagged with the file it came from.
#[derive(Debug, Error)]
#[error("failed to parse '{file_name}': {source}")]
pub struct FileParseError {
    pub file_name: String,
    #[source]
    pub source: ParseError,
}

impl FileParseError {
    pub fn new(file_name: impl Into<String>, source: ParseError) -> Self {
        Self {
            file_name: file_name.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Excel,
    Json,
    Xml,
    Yaml,
}

impl FileFormat {
    /// Detect from the file extension, then from a declared MIME type.
    pub fn detect(file_name: &str, content_type: Option<&str>) -> ParseResult<Self> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        if let Some(format) = extension.as_deref().and_then(Self::from_extension) {
            return Ok(format);
        }
        if let Some(format) = content_type.and_then(Self::from_content_type) {
            return Ok(format);
        }

        Err(ParseError::UnsupportedFormat(
            extension
                .or_else(|| content_type.map(str::to_string))
                .unwrap_or_else(|| file_name.to_string()),
        ))
    }

    fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "csv" => Some(FileFormat::Csv),
            "xlsx" | "xlsm" | "xls" | "ods" => Some(FileFormat::Excel),
            "json" => Some(FileFormat::Json),
            "xml" => Some(FileFormat::Xml),
            "yaml" | "yml" => Some(FileFormat::Yaml),
            _ => None,
        }
    }

    fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/csv" | "application/csv" => Some(FileFormat::Csv),
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel"
            | "application/vnd.oasis.opendocument.spreadsheet" => Some(FileFormat::Excel),
            "application/json" => Some(FileFormat::Json),
            "application/xml" | "text/xml" => Some(FileFormat::Xml),
            "application/yaml" | "application/x-yaml" | "text/yaml" => Some(FileFormat::Yaml),
            _ => None,
        }
    }
}

/// An uploaded file already held in memory.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Arc<[u8]>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            name: name.into(),
            content_type: None,
            bytes: Arc::from(bytes),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn format(&self) -> ParseResult<FileFormat> {
        FileFormat::detect(&self.name, self.content_type.as_deref())
    }

    /// File name without directories or extension.
    pub fn stem(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(self.name.as_str())
            .to_string()
    }
}

/// Decode one file into a dataset.
///
/// `columns` drives spreadsheet header matching and cell coercion; other
/// formats ignore it.
pub fn parse_file(
    file: &UploadedFile,
    columns: Option<&[ColumnSpec]>,
    max_file_bytes: usize,
) -> Result<Dataset, FileParseError> {
    decode(file, columns, max_file_bytes).map_err(|err| FileParseError::new(&file.name, err))
}

fn decode(
    file: &UploadedFile,
    columns: Option<&[ColumnSpec]>,
    max_file_bytes: usize,
) -> ParseResult<Dataset> {
    check_size(file, max_file_bytes)?;
    match file.format()? {
        FileFormat::Csv => delimited::parse(&file.bytes),
        FileFormat::Excel => spreadsheet::parse(&file.bytes, columns),
        FileFormat::Json => structured::parse_json(&file.bytes),
        FileFormat::Yaml => structured::parse_yaml(&file.bytes),
        FileFormat::Xml => markup::parse(&file.bytes),
    }
}

fn check_size(file: &UploadedFile, max_file_bytes: usize) -> ParseResult<()> {
    if file.bytes.len() > max_file_bytes {
        return Err(ParseError::TooLarge {
            size: file.bytes.len(),
            limit: max_file_bytes,
        });
    }
    Ok(())
}

/// Decode several files on a rayon pool. Results keep the input order.
pub fn parse_files(
    files: &[UploadedFile],
    columns: Option<&[ColumnSpec]>,
    max_file_bytes: usize,
) -> Vec<Result<Dataset, FileParseError>> {
    if files.len() <= 1 {
        return files
            .iter()
            .map(|file| parse_file(file, columns, max_file_bytes))
            .collect();
    }

    let threads = num_cpus::get().min(files.len());
    log::debug!("parsing {} files with {} threads", files.len(), threads);

    let pool = match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool,
        Err(err) => {
            log::warn!("parse pool unavailable, parsing sequentially: {}", err);
            return files
                .iter()
                .map(|file| parse_file(file, columns, max_file_bytes))
                .collect();
        }
    };

    let failures = AtomicUsize::new(0);
    let results: Vec<_> = pool.install(|| {
        files
            .par_iter()
            .map(|file| {
                let result = parse_file(file, columns, max_file_bytes);
                if let Err(err) = &result {
                    failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("{}", err);
                }
                result
            })
            .collect()
    });

    log::debug!(
        "parsing complete: {} ok, {} failed",
        results.len() - failures.load(Ordering::Relaxed),
        failures.load(Ordering::Relaxed)
    );
    results
}

/// Infer column schemas from JSON and XML files.
///
/// Files inferring a table name already seen are skipped.
pub fn infer_schemas(
    files: &[UploadedFile],
    max_file_bytes: usize,
) -> Vec<Result<InferredSchema, FileParseError>> {
    let mut seen = HashSet::new();
    let mut schemas = Vec::new();

    for file in files {
        let inferred = infer_schema(file, max_file_bytes)
            .map_err(|err| FileParseError::new(&file.name, err));
        match inferred {
            Ok(schema) => {
                if seen.insert(schema.table_name.to_lowercase()) {
                    schemas.push(Ok(schema));
                } else {
                    log::debug!(
                        "skipping {}: table '{}' already inferred",
                        file.name,
                        schema.table_name
                    );
                }
            }
            Err(err) => schemas.push(Err(err)),
        }
    }
    schemas
}

fn infer_schema(file: &UploadedFile, max_file_bytes: usize) -> ParseResult<InferredSchema> {
    check_size(file, max_file_bytes)?;
    match file.format()? {
        FileFormat::Json => {
            let value: serde_json::Value = serde_json::from_slice(&file.bytes)?;
            schema::infer_json(&value, &file.stem())
        }
        FileFormat::Xml => {
            let document = markup::parse_tree(&file.bytes)?;
            schema::infer_xml(&document)
        }
        other => Err(ParseError::UnsupportedFormat(format!(
            "{other:?} files carry no schema"
        ))),
    }
}
