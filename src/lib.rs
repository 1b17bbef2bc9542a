pub mod config;
pub mod dataset;
pub mod error;
pub mod history;
pub mod import;
pub mod mappers;
pub mod models;
pub mod parsers;
pub mod store;
pub mod templates;

pub use config::{DatabaseConfig, ImportConfig};
pub use dataset::{Dataset, Row};
pub use error::{ImportError, ImportResult};
pub use history::{LogUploadHistory, RecordingUploadHistory, UploadEvent, UploadHistory};
pub use import::{
    BulkImportService, CommitStrategy, ImportOptions, ImportOutcome, ImportReport, ImportRequest,
    ImportStatus, RowError, ValidationMode,
};
pub use mappers::{MapperRegistry, TableMapper, TableType};
pub use parsers::{FileFormat, FileParseError, ParseError, UploadedFile};
pub use store::{MemoryStore, PgStore, Store, StoreError};
pub use templates::TemplateFormat;

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install `env_logger` once; `RUST_LOG` overrides the default `info` filter.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .init();
    });
}
