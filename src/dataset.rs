//! In-memory tabular data shared by every parser and mapper.
//!
//! A [`Dataset`] is the only thing a mapper ever sees of an uploaded file: an
//! ordered list of column names plus an ordered list of rows. Row numbers are
//! 1-based and exclude the header, and they are the identifiers users see in
//! every error report, so they never change once a dataset is built.

use std::collections::HashMap;

/// Ordered columns and rows decoded from a single uploaded file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<String>,
    /// Lower-cased column name -> position of its first occurrence.
    lookup: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
}

impl Dataset {
    /// Create an empty dataset with the given header.
    pub fn new(columns: Vec<String>) -> Self {
        let columns: Vec<String> = columns
            .into_iter()
            .map(|name| name.trim().to_string())
            .collect();

        let mut lookup = HashMap::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            lookup.entry(name.to_lowercase()).or_insert(index);
        }

        Self {
            columns,
            lookup,
            rows: Vec::new(),
        }
    }

    /// Build a dataset from a header and already-decoded rows.
    pub fn from_rows<C, R, V>(columns: C, rows: R) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator<Item = V>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        let mut dataset = Self::new(columns.into_iter().map(Into::into).collect());
        for row in rows {
            dataset.push_row(row.into_iter().map(Into::into).collect());
        }
        dataset
    }

    /// Append a row. Short rows are padded so every row is as wide as the header.
    pub fn push_row(&mut self, mut values: Vec<String>) {
        if values.len() < self.columns.len() {
            values.resize(self.columns.len(), String::new());
        }
        self.rows.push(values);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Case-insensitive column position.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.lookup.get(&name.trim().to_lowercase()).copied()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Number of data rows (the header is not counted).
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fetch a row by its 1-based row number.
    pub fn row(&self, number: usize) -> Option<Row<'_>> {
        let index = number.checked_sub(1)?;
        self.rows.get(index).map(|values| Row {
            dataset: self,
            number,
            values,
        })
    }

    /// Iterate rows in order, each tagged with its row number.
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        self.rows.iter().enumerate().map(move |(index, values)| Row {
            dataset: self,
            number: index + 1,
            values,
        })
    }

    /// Average encoded size of a row in bytes, used to size commit batches.
    pub fn average_row_bytes(&self) -> usize {
        if self.rows.is_empty() {
            return 0;
        }

        let total: usize = self
            .rows
            .iter()
            .map(|row| row.iter().map(|value| value.len() + 1).sum::<usize>())
            .sum();
        total / self.rows.len()
    }
}

/// Borrowed view of one dataset row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    dataset: &'a Dataset,
    number: usize,
    values: &'a [String],
}

impl<'a> Row<'a> {
    /// 1-based row number, stable for the life of the import.
    pub fn number(&self) -> usize {
        self.number
    }

    /// Trimmed value of a column, or `""` when the column is absent.
    pub fn get(&self, column: &str) -> &'a str {
        self.dataset
            .column_index(column)
            .and_then(|index| self.values.get(index))
            .map(|value| value.trim())
            .unwrap_or("")
    }

    /// Like [`Row::get`] but maps blank values to `None`.
    pub fn optional(&self, column: &str) -> Option<&'a str> {
        let value = self.get(column);
        if value.is_empty() { None } else { Some(value) }
    }

    pub fn values(&self) -> &'a [String] {
        self.values
    }

    pub fn is_blank(&self) -> bool {
        self.values.iter().all(|value| value.trim().is_empty())
    }
}
