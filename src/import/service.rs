//! The bulk import service.
//!
//! One call to [`BulkImportService::import_dataset`] is one run: validate
//! every row, apply the error policy, then persist through the commit
//! strategy that fits the mapper and the dataset size.

use super::batching::resolve_batch_size;
use super::outcome::{CommitStrategy, ImportOutcome};
use super::validation::{ValidationMode, ValidationOrchestrator};
use crate::config::ImportConfig;
use crate::dataset::Dataset;
use crate::error::{ImportError, ImportResult};
use crate::history::{LogUploadHistory, UploadHistory};
use crate::mappers::{
    BatchMapper, MapperRegistry, SaveOutcome, TableMapper, TableType, ValidationResultMap,
    is_eligible,
};
use crate::parsers::{UploadedFile, parse_files};
use crate::store::{Store, StoreError, UnitOfWork};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Persist valid and repairable rows even when some rows are invalid.
    pub ignore_errors: bool,
    /// Overrides the computed commit batch size for row-only mappers.
    pub batch_size: Option<usize>,
    pub mode: ValidationMode,
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub files: Vec<UploadedFile>,
    pub table_type: TableType,
    pub acting_user: Uuid,
    pub options: ImportOptions,
}

/// Outcomes of every file of a request, in request order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub outcomes: Vec<ImportOutcome>,
}

impl ImportReport {
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|outcome| outcome.status.is_failure())
    }

    pub fn succeeded_rows(&self) -> usize {
        self.outcomes.iter().map(|outcome| outcome.succeeded_rows).sum()
    }
}

pub struct BulkImportService {
    store: Arc<dyn Store>,
    registry: MapperRegistry,
    config: ImportConfig,
    history: Arc<dyn UploadHistory>,
}

impl BulkImportService {
    pub fn new(store: Arc<dyn Store>, config: ImportConfig) -> Self {
        Self {
            store,
            registry: MapperRegistry::new(),
            config: config.normalized(),
            history: Arc::new(LogUploadHistory),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn UploadHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn registry(&self) -> &MapperRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Parse every file of the request and import each one as its own run.
    ///
    /// A file that fails to parse yields a `Failed` outcome and does not stop
    /// its siblings. A run-level error stops the request.
    pub async fn import_files(
        &self,
        request: &ImportRequest,
        cancel: &CancellationToken,
    ) -> ImportResult<ImportReport> {
        let mapper = self.registry.get(request.table_type);
        let columns = mapper.template_columns().to_vec();
        let files = request.files.clone();
        let max_file_bytes = self.config.max_file_bytes;

        let parsed = tokio::task::spawn_blocking(move || {
            parse_files(&files, Some(columns.as_slice()), max_file_bytes)
        })
        .await?;

        let mut report = ImportReport::default();
        for (file, dataset) in request.files.iter().zip(parsed) {
            let outcome = match dataset {
                Ok(dataset) => {
                    self.import_dataset(
                        &file.name,
                        request.table_type,
                        dataset,
                        request.acting_user,
                        &request.options,
                        cancel,
                    )
                    .await?
                }
                Err(err) => {
                    let message = err.to_string();
                    self.history.log_failed(&file.name, &message, None).await;
                    ImportOutcome::parse_failure(&file.name, request.table_type, message)
                }
            };
            report.outcomes.push(outcome);
        }
        Ok(report)
    }

    /// Run one import over an already decoded dataset.
    pub async fn import_dataset(
        &self,
        file_name: &str,
        table_type: TableType,
        dataset: Dataset,
        acting_user: Uuid,
        options: &ImportOptions,
        cancel: &CancellationToken,
    ) -> ImportResult<ImportOutcome> {
        let started = Instant::now();
        self.history
            .log_started(file_name, acting_user, table_type)
            .await;

        let mut outcome = ImportOutcome::new(file_name, table_type);
        let run = Run {
            mapper: self.registry.get(table_type),
            acting_user,
            options,
            cancel,
        };

        match self.execute(&run, dataset, &mut outcome).await {
            Ok(()) => {
                log::info!(
                    "import {}: {:?}, {} of {} rows imported",
                    file_name,
                    outcome.status,
                    outcome.succeeded_rows,
                    outcome.total_rows
                );
                self.history
                    .log_completed(&outcome, file_name, started.elapsed())
                    .await;
                Ok(outcome)
            }
            Err(err) => {
                log::error!("import {}: {}", file_name, err);
                self.history
                    .log_failed(file_name, &err.to_string(), Some(outcome.processed_rows))
                    .await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        run: &Run<'_>,
        dataset: Dataset,
        outcome: &mut ImportOutcome,
    ) -> ImportResult<()> {
        let dataset = Arc::new(dataset);
        outcome.total_rows = dataset.len();

        let orchestrator = ValidationOrchestrator::new(Arc::clone(&self.store), self.config.clone());
        let report = orchestrator
            .validate(
                Arc::clone(&run.mapper),
                Arc::clone(&dataset),
                run.options.mode,
                run.cancel,
            )
            .await?;

        outcome.valid_rows = report.valid_count();
        outcome.invalid_rows = report.invalid_count();
        outcome.errors = report.errors();
        log::debug!(
            "import {}: {} valid, {} invalid ({:?})",
            outcome.file_name,
            outcome.valid_rows,
            outcome.invalid_rows,
            report.strategy
        );

        if report.cancelled {
            outcome.settle(true, false);
            return Ok(());
        }
        if !run.options.ignore_errors && outcome.invalid_rows > 0 {
            outcome.settle(false, false);
            return Ok(());
        }

        let mut unit = UnitOfWork::new();
        let results = report.results;
        let cancelled = if let Some(batch) = run.mapper.as_batch() {
            outcome.strategy = Some(CommitStrategy::SingleBatch);
            self.persist_batch(run, batch, &dataset, &results, &mut unit, outcome)
                .await?
        } else if dataset.len() > self.config.row_commit_threshold {
            let batch_size = resolve_batch_size(run.options.batch_size, &dataset, &self.config);
            outcome.strategy = Some(CommitStrategy::ChunkedRows { batch_size });
            self.persist_chunked(run, &dataset, &results, batch_size, &mut unit, outcome)
                .await?
        } else {
            outcome.strategy = Some(CommitStrategy::PerRow);
            self.persist_per_row(run, &dataset, &results, &mut unit, outcome)
                .await?
        };

        outcome.settle(cancelled, true);
        Ok(())
    }

    /// Stage the whole dataset through the batch mapper and commit once.
    async fn persist_batch(
        &self,
        run: &Run<'_>,
        batch: &dyn BatchMapper,
        dataset: &Dataset,
        results: &ValidationResultMap,
        unit: &mut UnitOfWork,
        outcome: &mut ImportOutcome,
    ) -> ImportResult<bool> {
        if run.cancel.is_cancelled() {
            return Ok(true);
        }

        let staged = match batch
            .save_batch(
                dataset,
                run.acting_user,
                results,
                run.options.ignore_errors,
                unit,
                run.cancel,
            )
            .await
        {
            Ok(staged) => staged,
            Err(ImportError::Cancelled) => {
                unit.discard();
                return Ok(true);
            }
            Err(err) => return Err(err),
        };

        outcome.processed_rows = dataset.len();
        for (row_number, reason) in staged.rejected {
            outcome.push_row_error(row_number, reason);
        }
        self.commit(unit, outcome).await?;
        Ok(false)
    }

    /// Construct rows in memory and commit every `batch_size` rows.
    ///
    /// Each chunk reads through its own session, released before the commit
    /// so a single-connection pool can still begin the write transaction.
    async fn persist_chunked(
        &self,
        run: &Run<'_>,
        dataset: &Dataset,
        results: &ValidationResultMap,
        batch_size: usize,
        unit: &mut UnitOfWork,
        outcome: &mut ImportOutcome,
    ) -> ImportResult<bool> {
        let numbers: Vec<usize> = (1..=dataset.len()).collect();

        for chunk in numbers.chunks(batch_size.max(1)) {
            if run.cancel.is_cancelled() {
                return Ok(true);
            }

            let reached_before = outcome.processed_rows;
            let mut session = self.store.session().await?;
            for &number in chunk {
                let Some(row) = dataset.row(number) else {
                    continue;
                };
                outcome.processed_rows += 1;
                if !eligible(results, number, run.options.ignore_errors) {
                    continue;
                }

                match run
                    .mapper
                    .save_row(row, run.acting_user, session.as_mut(), unit, run.cancel)
                    .await
                {
                    Ok(SaveOutcome::Staged) => {}
                    Ok(SaveOutcome::Rejected(reason)) => outcome.push_row_error(number, reason),
                    Err(ImportError::Cancelled) => {
                        unit.discard();
                        outcome.processed_rows = reached_before;
                        return Ok(true);
                    }
                    Err(err) => return Err(err),
                }
            }
            drop(session);

            self.commit(unit, outcome).await?;
            log::debug!(
                "import {}: committed through row {}",
                outcome.file_name,
                outcome.processed_rows
            );
        }
        Ok(false)
    }

    /// Construct and commit one row at a time, with a fresh session per row.
    async fn persist_per_row(
        &self,
        run: &Run<'_>,
        dataset: &Dataset,
        results: &ValidationResultMap,
        unit: &mut UnitOfWork,
        outcome: &mut ImportOutcome,
    ) -> ImportResult<bool> {
        for row in dataset.rows() {
            if run.cancel.is_cancelled() {
                return Ok(true);
            }
            let number = row.number();
            outcome.processed_rows += 1;
            if !eligible(results, number, run.options.ignore_errors) {
                continue;
            }

            let mut session = self.store.session().await?;
            let saved = run
                .mapper
                .save_row(row, run.acting_user, session.as_mut(), unit, run.cancel)
                .await;
            drop(session);

            match saved {
                Ok(SaveOutcome::Staged) => self.commit(unit, outcome).await?,
                Ok(SaveOutcome::Rejected(reason)) => outcome.push_row_error(number, reason),
                Err(ImportError::Cancelled) => {
                    unit.discard();
                    outcome.processed_rows -= 1;
                    return Ok(true);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    /// Commit whatever is pending. A constraint conflict fails the rows of
    /// this commit and releases their keys; any other store error ends the run.
    async fn commit(&self, unit: &mut UnitOfWork, outcome: &mut ImportOutcome) -> ImportResult<()> {
        if unit.is_empty() {
            return Ok(());
        }

        let rows = unit.pending_rows();
        let keys = unit.pending_keys();
        match self.store.commit(unit).await {
            Ok(written) => {
                outcome.succeeded_rows += written;
                Ok(())
            }
            Err(err @ StoreError::Conflict(_)) => {
                log::warn!(
                    "import {}: commit of {} rows rejected: {}",
                    outcome.file_name,
                    rows.len(),
                    err
                );
                unit.forget(&keys);
                let message = err.to_string();
                for row_number in rows {
                    outcome.push_row_error(row_number, message.clone());
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Per-run inputs shared by the persistence strategies.
struct Run<'a> {
    mapper: Arc<dyn TableMapper>,
    acting_user: Uuid,
    options: &'a ImportOptions,
    cancel: &'a CancellationToken,
}

fn eligible(results: &ValidationResultMap, row_number: usize, ignore_errors: bool) -> bool {
    results
        .get(&row_number)
        .is_some_and(|result| is_eligible(result, ignore_errors))
}
