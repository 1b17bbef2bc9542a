//! Per-table validation and persistence logic.
//!
//! Every importable table has a [`TableMapper`] registered under a stable
//! [`TableType`] tag. Mappers that can pre-load their lookups for a whole
//! dataset also implement [`BatchMapper`] and expose it through
//! [`TableMapper::as_batch`].
//!
//! Mappers never commit. Row-level construction stages entities into the
//! run's [`UnitOfWork`] and the bulk service decides when to commit it.

pub(crate) mod checks;
pub mod applications;
pub mod roles;
pub mod user_applications;
pub mod users;

pub use applications::ApplicationMapper;
pub use roles::RoleMapper;
pub use user_applications::UserApplicationMapper;
pub use users::UserMapper;

use crate::dataset::{Dataset, Row};
use crate::error::{ImportError, ImportResult};
use crate::store::{StoreSession, UnitOfWork};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Stable identifiers of the importable tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Users,
    Roles,
    Applications,
    UserApplications,
}

impl TableType {
    pub const ALL: [TableType; 4] = [
        TableType::Users,
        TableType::Roles,
        TableType::Applications,
        TableType::UserApplications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableType::Users => "users",
            TableType::Roles => "roles",
            TableType::Applications => "applications",
            TableType::UserApplications => "user_applications",
        }
    }

    /// Element name of a single record in XML files and templates.
    pub fn record_name(&self) -> &'static str {
        match self {
            TableType::Users => "User",
            TableType::Roles => "Role",
            TableType::Applications => "Application",
            TableType::UserApplications => "UserApplication",
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableType {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        TableType::ALL
            .into_iter()
            .find(|table_type| table_type.as_str() == normalized)
            .ok_or_else(|| ImportError::UnknownTableType(value.trim().to_string()))
    }
}

/// Semantic type of a column, used for coercion and templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Email,
    Url,
    Identifier,
    Integer,
    Boolean,
    Timestamp,
    Enumerated(&'static [&'static str]),
    Collection,
}

impl ColumnType {
    pub fn label(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Email => "email",
            ColumnType::Url => "url",
            ColumnType::Identifier => "identifier",
            ColumnType::Integer => "integer",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Enumerated(_) => "enum",
            ColumnType::Collection => "collection",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub data_type: ColumnType,
    pub required: bool,
    pub max_length: Option<usize>,
    pub default_value: Option<&'static str>,
    pub description: &'static str,
}

impl ColumnSpec {
    pub const fn required(
        name: &'static str,
        data_type: ColumnType,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            data_type,
            required: true,
            max_length: None,
            default_value: None,
            description,
        }
    }

    pub const fn optional(
        name: &'static str,
        data_type: ColumnType,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            data_type,
            required: false,
            max_length: None,
            default_value: None,
            description,
        }
    }

    pub const fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub const fn with_default(mut self, value: &'static str) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Column metadata and sample data of one mapper. Built once per mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub table_type: TableType,
    pub columns: Vec<ColumnSpec>,
    pub example_rows: Vec<Vec<&'static str>>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        let name = name.trim();
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|column| column.name).collect()
    }

    /// The example rows as a dataset, in template column order.
    pub fn example_dataset(&self) -> Dataset {
        Dataset::from_rows(self.column_names(), self.example_rows.iter().cloned())
    }
}

/// Validation verdict for a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowValidationResult {
    row_number: usize,
    is_valid: bool,
    errors: Vec<String>,
    blocking: bool,
}

impl RowValidationResult {
    pub fn valid(row_number: usize) -> Self {
        Self {
            row_number,
            is_valid: true,
            errors: Vec::new(),
            blocking: false,
        }
    }

    pub fn row_number(&self) -> usize {
        self.row_number
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// True when the row cannot be turned into an entity at all.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }
}

/// Collects the problems found on one row.
#[derive(Debug)]
pub struct RowIssues {
    row_number: usize,
    errors: Vec<String>,
    blocking: bool,
}

impl RowIssues {
    pub fn new(row_number: usize) -> Self {
        Self {
            row_number,
            errors: Vec::new(),
            blocking: false,
        }
    }

    /// Record a problem that makes the row unconstructible.
    pub fn blocking(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.blocking = true;
    }

    /// Record a problem construction can repair.
    pub fn soft(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn has_blocking(&self) -> bool {
        self.blocking
    }

    pub fn finish(self) -> RowValidationResult {
        RowValidationResult {
            row_number: self.row_number,
            is_valid: self.errors.is_empty(),
            errors: self.errors,
            blocking: self.blocking,
        }
    }
}

/// Row number -> validation result.
pub type ValidationResultMap = BTreeMap<usize, RowValidationResult>;

/// Result of constructing one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Staged,
    /// Construction failed for data reasons; nothing was staged.
    Rejected(String),
}

/// Result of staging a whole dataset through [`BatchMapper::save_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedBatch {
    pub staged: usize,
    /// Eligible rows whose construction failed, with the reason.
    pub rejected: BTreeMap<usize, String>,
}

/// Whether a row may be offered for construction under the run's policy.
pub fn is_eligible(result: &RowValidationResult, ignore_errors: bool) -> bool {
    result.is_valid() || (ignore_errors && !result.is_blocking())
}

#[async_trait]
pub trait TableMapper: Send + Sync {
    fn table_type(&self) -> TableType;

    fn descriptor(&self) -> &TableDescriptor;

    fn template_columns(&self) -> &[ColumnSpec] {
        &self.descriptor().columns
    }

    fn example_rows(&self) -> &[Vec<&'static str>] {
        &self.descriptor().example_rows
    }

    /// Validate one row against its format rules and the store.
    ///
    /// Returns [`ImportError::Cancelled`] without touching the store when the
    /// token is already cancelled.
    async fn validate_row(
        &self,
        row: Row<'_>,
        session: &mut dyn StoreSession,
        cancel: &CancellationToken,
    ) -> ImportResult<RowValidationResult>;

    /// Build the row's entity and stage it into `unit`. Does not re-validate.
    async fn save_row(
        &self,
        row: Row<'_>,
        acting_user: Uuid,
        session: &mut dyn StoreSession,
        unit: &mut UnitOfWork,
        cancel: &CancellationToken,
    ) -> ImportResult<SaveOutcome>;

    fn as_batch(&self) -> Option<&dyn BatchMapper> {
        None
    }
}

/// Whole-dataset validation and staging.
#[async_trait]
pub trait BatchMapper: TableMapper {
    /// Validate every row with the lookups pre-loaded in a few queries.
    /// This is where duplicates inside the dataset are detected.
    async fn validate_batch(
        &self,
        dataset: &Dataset,
        session: &mut dyn StoreSession,
        cancel: &CancellationToken,
    ) -> ImportResult<ValidationResultMap>;

    /// Stage every eligible row into `unit` without committing.
    async fn save_batch(
        &self,
        dataset: &Dataset,
        acting_user: Uuid,
        results: &ValidationResultMap,
        ignore_errors: bool,
        unit: &mut UnitOfWork,
        cancel: &CancellationToken,
    ) -> ImportResult<StagedBatch>;
}

/// One mapper per [`TableType`], built up front.
#[derive(Clone)]
pub struct MapperRegistry {
    mappers: BTreeMap<TableType, Arc<dyn TableMapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        let mappers = TableType::ALL
            .into_iter()
            .map(|table_type| (table_type, build_mapper(table_type)))
            .collect();
        Self { mappers }
    }

    pub fn get(&self, table_type: TableType) -> Arc<dyn TableMapper> {
        match self.mappers.get(&table_type) {
            Some(mapper) => Arc::clone(mapper),
            None => build_mapper(table_type),
        }
    }

    /// Look a mapper up by its tag.
    pub fn resolve(&self, tag: &str) -> ImportResult<Arc<dyn TableMapper>> {
        let table_type: TableType = tag.parse()?;
        Ok(self.get(table_type))
    }

    pub fn table_types(&self) -> impl Iterator<Item = TableType> + '_ {
        self.mappers.keys().copied()
    }
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_mapper(table_type: TableType) -> Arc<dyn TableMapper> {
    match table_type {
        TableType::Users => Arc::new(UserMapper::new()),
        TableType::Roles => Arc::new(RoleMapper::new()),
        TableType::Applications => Arc::new(ApplicationMapper::new()),
        TableType::UserApplications => Arc::new(UserApplicationMapper::new()),
    }
}

/// Bail out with [`ImportError::Cancelled`] once the token fires.
pub(crate) fn ensure_active(cancel: &CancellationToken) -> ImportResult<()> {
    if cancel.is_cancelled() {
        Err(ImportError::Cancelled)
    } else {
        Ok(())
    }
}
