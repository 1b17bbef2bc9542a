use crate::mappers::{TableType, ValidationResultMap};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportStatus {
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, ImportStatus::Failed)
    }
}

/// How staged rows were committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommitStrategy {
    /// One `save_batch`, one commit.
    SingleBatch,
    /// Row-only mapper over the row threshold: one commit per chunk.
    ChunkedRows { batch_size: usize },
    PerRow,
}

/// Every message reported for one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row_number: usize,
    pub messages: Vec<String>,
}

/// Invalid rows of a validation map, in row order.
pub fn row_errors(results: &ValidationResultMap) -> Vec<RowError> {
    results
        .values()
        .filter(|result| !result.is_valid())
        .map(|result| RowError {
            row_number: result.row_number(),
            messages: result.errors().to_vec(),
        })
        .collect()
}

/// Summary of one import run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub file_name: String,
    pub table_type: TableType,
    pub total_rows: usize,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    pub processed_rows: usize,
    pub succeeded_rows: usize,
    pub failed_rows: usize,
    pub errors: Vec<RowError>,
    pub status: ImportStatus,
    pub strategy: Option<CommitStrategy>,
    pub message: String,
}

impl ImportOutcome {
    pub(crate) fn new(file_name: impl Into<String>, table_type: TableType) -> Self {
        Self {
            file_name: file_name.into(),
            table_type,
            total_rows: 0,
            valid_rows: 0,
            invalid_rows: 0,
            processed_rows: 0,
            succeeded_rows: 0,
            failed_rows: 0,
            errors: Vec::new(),
            status: ImportStatus::Completed,
            strategy: None,
            message: String::new(),
        }
    }

    /// Outcome of a file that never made it past parsing.
    pub(crate) fn parse_failure(
        file_name: impl Into<String>,
        table_type: TableType,
        message: impl Into<String>,
    ) -> Self {
        let mut outcome = Self::new(file_name, table_type);
        outcome.status = ImportStatus::Failed;
        outcome.message = message.into();
        outcome
    }

    /// Add a message for `row_number`, keeping the list ordered by row.
    pub(crate) fn push_row_error(&mut self, row_number: usize, message: impl Into<String>) {
        let message = message.into();
        match self
            .errors
            .binary_search_by_key(&row_number, |error| error.row_number)
        {
            Ok(position) => self.errors[position].messages.push(message),
            Err(position) => self.errors.insert(
                position,
                RowError {
                    row_number,
                    messages: vec![message],
                },
            ),
        }
    }

    /// Derive the status from the counts.
    ///
    /// `persistence_ran` is false when invalid rows stopped the run before
    /// anything was staged.
    pub(crate) fn settle(&mut self, cancelled: bool, persistence_ran: bool) {
        self.failed_rows = self.processed_rows.saturating_sub(self.succeeded_rows);
        self.status = if cancelled {
            ImportStatus::Cancelled
        } else if !persistence_ran || (self.processed_rows > 0 && self.succeeded_rows == 0) {
            ImportStatus::Failed
        } else if self.failed_rows > 0 || self.invalid_rows > 0 {
            ImportStatus::CompletedWithErrors
        } else {
            ImportStatus::Completed
        };

        if self.message.is_empty() {
            self.message = match self.status {
                ImportStatus::Completed => format!("imported {} rows", self.succeeded_rows),
                ImportStatus::CompletedWithErrors => format!(
                    "imported {} of {} rows, {} failed",
                    self.succeeded_rows, self.total_rows, self.failed_rows
                ),
                ImportStatus::Failed if !persistence_ran => format!(
                    "{} of {} rows are invalid, nothing was imported",
                    self.invalid_rows, self.total_rows
                ),
                ImportStatus::Failed => format!("none of {} rows could be imported", self.processed_rows),
                ImportStatus::Cancelled => format!(
                    "cancelled after {} of {} rows, {} imported",
                    self.processed_rows, self.total_rows, self.succeeded_rows
                ),
            };
        }
    }
}
