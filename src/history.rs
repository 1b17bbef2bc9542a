//! Upload history sink.
//!
//! The pipeline reports the start and end of every run through
//! [`UploadHistory`]. The default sink writes log records; tests use
//! [`RecordingUploadHistory`] to assert on the exact sequence of events.

use crate::import::ImportOutcome;
use crate::mappers::TableType;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait UploadHistory: Send + Sync {
    async fn log_started(&self, file_name: &str, acting_user: Uuid, table_type: TableType);

    async fn log_completed(&self, outcome: &ImportOutcome, file_name: &str, duration: Duration);

    /// A run that ended with a run-level error, or a file that never parsed.
    async fn log_failed(&self, file_name: &str, message: &str, processed_rows: Option<usize>);
}

/// Writes history events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogUploadHistory;

#[async_trait]
impl UploadHistory for LogUploadHistory {
    async fn log_started(&self, file_name: &str, acting_user: Uuid, table_type: TableType) {
        log::info!(
            "upload {}: started by {} into {}",
            file_name,
            acting_user,
            table_type
        );
    }

    async fn log_completed(&self, outcome: &ImportOutcome, file_name: &str, duration: Duration) {
        log::info!(
            "upload {}: {:?} in {:.2}s ({} succeeded, {} failed, {} invalid of {} rows)",
            file_name,
            outcome.status,
            duration.as_secs_f64(),
            outcome.succeeded_rows,
            outcome.failed_rows,
            outcome.invalid_rows,
            outcome.total_rows
        );
    }

    async fn log_failed(&self, file_name: &str, message: &str, processed_rows: Option<usize>) {
        match processed_rows {
            Some(processed) => log::warn!(
                "upload {}: failed after {} rows: {}",
                file_name,
                processed,
                message
            ),
            None => log::warn!("upload {}: failed: {}", file_name, message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Started {
        file_name: String,
        acting_user: Uuid,
        table_type: TableType,
    },
    Completed {
        file_name: String,
        outcome: ImportOutcome,
        duration: Duration,
    },
    Failed {
        file_name: String,
        message: String,
        processed_rows: Option<usize>,
    },
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingUploadHistory {
    events: Mutex<Vec<UploadEvent>>,
}

impl RecordingUploadHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UploadEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl UploadHistory for RecordingUploadHistory {
    async fn log_started(&self, file_name: &str, acting_user: Uuid, table_type: TableType) {
        self.events.lock().push(UploadEvent::Started {
            file_name: file_name.to_string(),
            acting_user,
            table_type,
        });
    }

    async fn log_completed(&self, outcome: &ImportOutcome, file_name: &str, duration: Duration) {
        self.events.lock().push(UploadEvent::Completed {
            file_name: file_name.to_string(),
            outcome: outcome.clone(),
            duration,
        });
    }

    async fn log_failed(&self, file_name: &str, message: &str, processed_rows: Option<usize>) {
        self.events.lock().push(UploadEvent::Failed {
            file_name: file_name.to_string(),
            message: message.to_string(),
            processed_rows,
        });
    }
}
