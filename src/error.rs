use crate::store::StoreError;
use thiserror::Error;

pub type ImportResult<T> = Result<T, ImportError>;

/// Run-level failures.
///
/// Row and file problems never show up here; they are turned into counts and
/// messages on the outcome. `Cancelled` is consumed by the bulk service and
/// reported as a status, so callers only ever see it from the lower layers.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("import cancelled")]
    Cancelled,
    #[error("unknown table type '{0}'")]
    UnknownTableType(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for ImportError {
    fn from(err: tokio::task::JoinError) -> Self {
        ImportError::Task(err.to_string())
    }
}

impl ImportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImportError::Cancelled)
    }
}
