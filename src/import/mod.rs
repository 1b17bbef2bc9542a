//! Validation, error policy and persistence of decoded datasets.

pub mod batching;
pub mod outcome;
pub mod service;
pub mod validation;

pub use batching::{compute_batch_size, estimate_row_footprint, resolve_batch_size};
pub use outcome::{CommitStrategy, ImportOutcome, ImportStatus, RowError};
pub use service::{BulkImportService, ImportOptions, ImportReport, ImportRequest};
pub use validation::{ValidationMode, ValidationOrchestrator, ValidationReport, ValidationStrategy};
